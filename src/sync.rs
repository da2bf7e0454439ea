//! Audio/video synchronization in front of the main queue.
//!
//! Video and audio arrive from independent capture contexts. Samples of the
//! stream that is ahead are parked in a synchronization queue until the other
//! stream catches up, so the main queue receives alternating runs of video
//! and audio in timeline order.

use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{AudioCodec, RecordingParams, RecordingPlan};
use crate::error::Result;
use crate::fmp4::{AudioTrack, MovieConfig};
use crate::frame::{nal_unit_type, Frame, FrameKind, SampleType};
use crate::queue::{CyclicQueue, Strict};
use crate::state::{MainQueue, RecorderState, StateMachine};

/// log2 of the clock correction time constant in frames.
const CORRECTION_TIME_CONST_LOG: u32 = 10;

/// What the consumer should do after a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// A fragment-start frame reached the main queue while a trigger is
    /// active: the previous fragment is complete.
    pub fragment_ready: bool,
    /// Ask the video encoder for an IDR frame.
    pub request_key_frame: bool,
}

/// Producer-side timing state. Locked before any queue.
#[derive(Debug)]
struct SyncClock {
    /// Added to video sample times (ns).
    correction: i64,
    audio_time: u64,
    fragment_end: u64,
    video_run_start: u64,
    run_is_video: bool,
    key_frame_requested: bool,
}

impl SyncClock {
    fn new() -> Self {
        Self {
            correction: 0,
            audio_time: 0,
            fragment_end: 0,
            video_run_start: 0,
            run_is_video: true,
            key_frame_requested: false,
        }
    }

    /// Pull the video clock toward the audio clock (first-order IIR).
    fn correct(&mut self, sample_time: u64) -> u64 {
        let t = sample_time.saturating_add_signed(self.correction);
        let diff = t.wrapping_sub(self.audio_time) as i64;
        let step = diff.saturating_add(1 << (CORRECTION_TIME_CONST_LOG - 1)) >> CORRECTION_TIME_CONST_LOG;
        self.correction = self.correction.saturating_sub(step);
        t
    }
}

#[derive(Debug, Default)]
struct ParameterSets {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

/// Queues and synchronization state of one recording activation.
pub struct Pipeline {
    main: MainQueue,
    video_sync: CyclicQueue<Strict>,
    audio_sync: CyclicQueue<Strict>,
    clock: Mutex<SyncClock>,
    parameter_sets: Mutex<ParameterSets>,
    fragment_duration: u64,
    run_duration: u64,
    extra_key_frame_margin: u64,
    width: u16,
    height: u16,
    video_timescale: u32,
    audio: AudioTrack,
    audio_enabled: bool,
}

impl Pipeline {
    /// Allocate the queues of `plan`. The main queue starts out Disabled.
    pub fn new(params: &RecordingParams, plan: &RecordingPlan, audio_enabled: bool) -> Self {
        tracing::info!(
            "Recording queue sizes: video: {}, audio: {}, main: {}",
            plan.video_queue_size,
            plan.audio_queue_size,
            plan.main_queue_size
        );
        Self {
            main: MainQueue::new("main", plan.main_queue_size, StateMachine::new(plan.prebuffer_margin_ns)),
            video_sync: CyclicQueue::new("video", plan.video_queue_size, Strict),
            audio_sync: CyclicQueue::new("audio", plan.audio_queue_size, Strict),
            clock: Mutex::new(SyncClock::new()),
            parameter_sets: Mutex::new(ParameterSets::default()),
            fragment_duration: plan.fragment_duration_ns,
            run_duration: plan.run_duration_ns,
            extra_key_frame_margin: plan.extra_key_frame_margin_ns,
            width: params.video.width,
            height: params.video.height,
            video_timescale: plan.video_timescale,
            audio: AudioTrack {
                codec: params.audio.codec,
                sample_rate: plan.audio_timescale,
                channels: params.audio.channels,
                bit_rate: params.audio.bit_rate_kbps.saturating_mul(1000),
            },
            audio_enabled,
        }
    }

    pub fn main(&self) -> &MainQueue {
        &self.main
    }

    pub fn state(&self) -> RecorderState {
        self.main.state()
    }

    /// Whether audio samples go into the container.
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn audio_codec(&self) -> AudioCodec {
        self.audio.codec
    }

    pub fn video_timescale(&self) -> u32 {
        self.video_timescale
    }

    pub fn audio_timescale(&self) -> u32 {
        self.audio.sample_rate
    }

    /// Movie header parameters, once SPS and PPS have been seen.
    pub fn movie_config(&self) -> Option<MovieConfig> {
        let sets = self.parameter_sets.lock();
        Some(MovieConfig {
            width: self.width,
            height: self.height,
            timescale: self.video_timescale,
            sps: sets.sps.clone()?,
            pps: sets.pps.clone()?,
            audio: self.audio_enabled.then(|| self.audio.clone()),
        })
    }

    /// Handle one H.264 NAL unit.
    pub fn push_video(&self, frame: &Frame) -> Result<PushOutcome> {
        debug_assert_eq!(frame.kind, FrameKind::Video);
        let nal = match frame.nal_type() {
            Some(nal_unit_type::SPS) => {
                self.parameter_sets.lock().sps = Some(frame.payload.clone());
                return Ok(PushOutcome::default());
            }
            Some(nal_unit_type::PPS) => {
                self.parameter_sets.lock().pps = Some(frame.payload.clone());
                return Ok(PushOutcome::default());
            }
            Some(nal) if nal != 0 => nal,
            _ => {
                tracing::warn!("Dropping video frame at {} without NAL unit type", frame.sample_time);
                return Ok(PushOutcome::default());
            }
        };

        let mut outcome = PushOutcome::default();
        let mut clock = self.clock.lock();
        let t = clock.correct(frame.sample_time);
        let mut sample_type = SampleType::video(nal);

        let mut run_start = false;
        if sample_type.is_key_frame() {
            if t >= clock.fragment_end {
                sample_type = sample_type.with_fragment_start();
                clock.fragment_end = t.saturating_add(self.fragment_duration);
                clock.key_frame_requested = false;
            }
            run_start = true;
            clock.video_run_start = t;
        } else {
            // Keep the fragment from growing past its configured duration.
            if t.saturating_add(self.extra_key_frame_margin) > clock.fragment_end && !clock.key_frame_requested {
                clock.key_frame_requested = true;
                outcome.request_key_frame = true;
            }
            if t >= clock.video_run_start.saturating_add(self.run_duration) {
                run_start = true;
                clock.video_run_start = t;
            }
        }

        let mut fragment_start = false;
        if run_start && t != 0 {
            // Pending audio up to this frame closes the current audio run.
            let copied = self.main.copy_from(&self.audio_sync, t)?;
            if copied.source_empty {
                clock.run_is_video = false;
            }
        }

        if clock.run_is_video {
            fragment_start |= self.main.copy_from(&self.video_sync, u64::MAX)?.fragment_start;
            let admitted = self.main.put(t, sample_type, &frame.payload)?;
            fragment_start |= admitted && sample_type.is_fragment_start();
        } else {
            self.video_sync.put(t, sample_type, &frame.payload)?;
        }

        outcome.fragment_ready = fragment_start && self.main.state().is_active();
        Ok(outcome)
    }

    /// Handle one AAC access unit.
    pub fn push_audio(&self, frame: &Frame) -> Result<PushOutcome> {
        debug_assert_eq!(frame.kind, FrameKind::Audio);
        let t = frame.sample_time;
        let mut clock = self.clock.lock();
        clock.audio_time = t;

        let mut fragment_start = false;
        if !clock.run_is_video {
            let copied = self.main.copy_from(&self.audio_sync, clock.video_run_start)?;
            if !copied.source_empty {
                clock.run_is_video = true;
            }
        }
        if !clock.run_is_video && t >= clock.video_run_start {
            // Audio caught up with the pending video run.
            fragment_start |= self.main.copy_from(&self.video_sync, u64::MAX)?.fragment_start;
            clock.run_is_video = true;
        }

        if clock.run_is_video {
            self.audio_sync.put(t, SampleType::AUDIO, &frame.payload)?;
        } else {
            self.main.put(t, SampleType::AUDIO, &frame.payload)?;
        }

        Ok(PushOutcome {
            fragment_ready: fragment_start && self.main.state().is_active(),
            request_key_frame: false,
        })
    }
}
