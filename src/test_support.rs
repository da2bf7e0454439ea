//! Fakes shared by the unit tests.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;

use crate::capture::{AudioStreamParams, CaptureDriver, FrameSink, StreamHandle, VideoStreamParams};
use crate::delivery::{CloseReason, DataChunk, Transport};
use crate::frame::Frame;

pub const SPS: [u8; 4] = [0x67, 0x4D, 0x00, 0x28];
pub const PPS: [u8; 4] = [0x68, 0xEE, 0x3C, 0x80];

/// Everything the fake driver was asked to do.
#[derive(Debug, Default)]
pub struct DriverLog {
    /// "audio", "video", "stop audio", ... in call order.
    pub calls: Vec<String>,
    pub video: Option<(StreamHandle, VideoStreamParams, FrameSink)>,
    pub audio: Option<(StreamHandle, AudioStreamParams, FrameSink)>,
    pub key_frame_requests: usize,
    pub fail_video: bool,
    next_handle: u64,
}

impl DriverLog {
    pub fn push_video(&self, frame: Frame) -> bool {
        self.video.as_ref().is_some_and(|(_, _, sink)| sink.push(frame))
    }

    pub fn push_audio(&self, frame: Frame) -> bool {
        self.audio.as_ref().is_some_and(|(_, _, sink)| sink.push(frame))
    }
}

/// Capture driver that records calls and hands out the sinks.
#[derive(Debug, Clone, Default)]
pub struct FakeDriver {
    pub log: Arc<Mutex<DriverLog>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureDriver for FakeDriver {
    fn start_video(&mut self, params: &VideoStreamParams, sink: FrameSink) -> Result<StreamHandle> {
        let mut log = self.log.lock();
        if log.fail_video {
            anyhow::bail!("camera busy");
        }
        log.next_handle += 1;
        let handle = StreamHandle(log.next_handle);
        log.calls.push("video".into());
        log.video = Some((handle, params.clone(), sink));
        Ok(handle)
    }

    fn start_audio(&mut self, params: &AudioStreamParams, sink: FrameSink) -> Result<StreamHandle> {
        let mut log = self.log.lock();
        log.next_handle += 1;
        let handle = StreamHandle(log.next_handle);
        log.calls.push("audio".into());
        log.audio = Some((handle, params.clone(), sink));
        Ok(handle)
    }

    fn stop(&mut self, handle: StreamHandle) {
        let mut log = self.log.lock();
        if log.video.as_ref().is_some_and(|(h, _, _)| *h == handle) {
            log.video = None;
            log.calls.push("stop video".into());
        } else if log.audio.as_ref().is_some_and(|(h, _, _)| *h == handle) {
            log.audio = None;
            log.calls.push("stop audio".into());
        }
    }

    fn request_key_frame(&mut self, _handle: StreamHandle) {
        self.log.lock().key_frame_requests += 1;
    }
}

#[derive(Debug, Default)]
pub struct TransportLog {
    pub chunks: Vec<DataChunk>,
    pub cancelled: Vec<CloseReason>,
    /// Fail the next send.
    pub fail_next: bool,
}

/// Transport collecting every chunk in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectingTransport {
    pub log: Arc<Mutex<TransportLog>>,
}

impl Transport for CollectingTransport {
    async fn send(&mut self, chunk: DataChunk) -> Result<()> {
        let mut log = self.log.lock();
        if std::mem::take(&mut log.fail_next) {
            anyhow::bail!("stream reset by peer");
        }
        log.chunks.push(chunk);
        Ok(())
    }

    fn cancel(&mut self, reason: CloseReason) {
        self.log.lock().cancelled.push(reason);
    }
}
