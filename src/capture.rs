//! Capture driver seam.
//!
//! Drivers push encoded frames into a [`FrameSink`] from whatever thread
//! they capture on. Sinks never block: when the ingest task falls behind,
//! frames are dropped and counted. Every frame carries the capture session
//! of the sink it went through, so frames still queued from a stopped
//! session can be told apart from those of its successor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::config::{AudioCodec, BitRateMode, H264Level, H264Profile, RecordingParams, RecordingPlan};
use crate::frame::Frame;

/// Opaque handle of a running capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// Video encoder settings for a recording stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoStreamParams {
    pub width: u16,
    pub height: u16,
    pub max_frame_rate: u8,
    /// bit/s
    pub bit_rate: u32,
    pub i_frame_interval_ms: u32,
    pub profile: H264Profile,
    pub level: H264Level,
}

impl VideoStreamParams {
    pub fn new(params: &RecordingParams, plan: &RecordingPlan) -> Self {
        Self {
            width: params.video.width,
            height: params.video.height,
            max_frame_rate: params.video.max_frame_rate,
            bit_rate: params.video.bit_rate_kbps.saturating_mul(1000),
            i_frame_interval_ms: plan.i_frame_interval_ms,
            profile: params.video.profile,
            level: params.video.level,
        }
    }
}

/// Audio encoder settings for a recording stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStreamParams {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_rate_mode: BitRateMode,
    /// bit/s
    pub bit_rate: u32,
}

impl AudioStreamParams {
    pub fn new(params: &RecordingParams) -> Self {
        Self {
            codec: params.audio.codec,
            sample_rate: params.audio.sample_rate.hz(),
            channels: params.audio.channels,
            bit_rate_mode: params.audio.bit_rate_mode,
            bit_rate: params.audio.bit_rate_kbps.saturating_mul(1000),
        }
    }
}

/// Camera and microphone capture.
pub trait CaptureDriver: Send {
    /// Start the H.264 recording stream. SPS and PPS must be delivered as
    /// separate frames before the first IDR.
    fn start_video(&mut self, params: &VideoStreamParams, sink: FrameSink) -> Result<StreamHandle>;

    /// Start the AAC recording stream.
    fn start_audio(&mut self, params: &AudioStreamParams, sink: FrameSink) -> Result<StreamHandle>;

    fn stop(&mut self, handle: StreamHandle);

    /// Ask the encoder for an IDR frame as soon as possible.
    fn request_key_frame(&mut self, handle: StreamHandle);
}

/// Receiving end of a [`FrameSink`]: frames tagged with their capture session.
pub type FrameReceiver = mpsc::Receiver<(u64, Frame)>;

/// Non-blocking frame producer handed to a capture driver.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<(u64, Frame)>,
    session: u64,
    dropped: Arc<AtomicU64>,
}

impl FrameSink {
    /// Create a sink and the receiving end consumed by an ingest task.
    pub fn channel(capacity: usize) -> (FrameSink, FrameReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            FrameSink {
                tx,
                session: 0,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Same channel, frames tagged with `session`.
    pub fn for_session(&self, session: u64) -> FrameSink {
        FrameSink {
            tx: self.tx.clone(),
            session,
            dropped: self.dropped.clone(),
        }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Queue a frame. Returns false when it was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        match self.tx.try_send((self.session, frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full((_, frame))) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(
                        "{:?} frame at {} dropped, ingest behind ({} dropped so far)",
                        frame.kind,
                        frame.sample_time,
                        dropped
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
