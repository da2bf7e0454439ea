//! Recorder lifecycle.
//!
//! A [`Recorder`] owns the capture streams, the current [`Pipeline`] and the
//! open recording stream. It is driven from a single consumer context; the
//! capture side only sees the pipeline through a [`PipelineSlot`].

use std::sync::Arc;

use parking_lot::RwLock;

use crate::capture::{AudioStreamParams, CaptureDriver, FrameReceiver, FrameSink, StreamHandle, VideoStreamParams};
use crate::config::{ConfigStore, RecordingParams, DEFAULT_CHUNK_SIZE, DEFAULT_POOL_SIZE};
use crate::delivery::{CloseReason, DeliveryContext, DeliveryStep, StreamKind};
use crate::error::{RecorderError, Result};
use crate::state::RecorderState;
use crate::sync::{Pipeline, PushOutcome};

/// Shared lookup of the active pipeline and the capture session feeding it.
#[derive(Clone, Default)]
pub struct PipelineSlot(Arc<RwLock<Option<(u64, Arc<Pipeline>)>>>);

impl PipelineSlot {
    pub fn get(&self) -> Option<Arc<Pipeline>> {
        self.0.read().as_ref().map(|(_, pipeline)| pipeline.clone())
    }

    /// The active pipeline, if it belongs to capture session `session`.
    pub fn get_session(&self, session: u64) -> Option<Arc<Pipeline>> {
        match self.0.read().as_ref() {
            Some((active, pipeline)) if *active == session => Some(pipeline.clone()),
            _ => None,
        }
    }

    fn set(&self, session: u64, pipeline: Arc<Pipeline>) {
        *self.0.write() = Some((session, pipeline));
    }

    fn clear(&self) {
        *self.0.write() = None;
    }
}

/// Receiving ends of the capture sinks, one per elementary stream.
pub struct CaptureReceivers {
    pub video: FrameReceiver,
    pub audio: FrameReceiver,
}

/// Builder for [`Recorder`].
#[derive(Debug, Clone)]
pub struct RecorderBuilder {
    pool_size: usize,
    chunk_size: usize,
    frame_channel_depth: usize,
}

impl Default for RecorderBuilder {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            frame_channel_depth: 32,
        }
    }
}

impl RecorderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes shared by the synchronization and main queues.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Maximum bytes per delivered chunk, at least 1. A fragment header is
    /// never split, so its chunk may be larger.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Frames buffered between a capture driver and its ingest task.
    pub fn frame_channel_depth(mut self, depth: usize) -> Self {
        self.frame_channel_depth = depth;
        self
    }

    pub fn build<D: CaptureDriver, S: ConfigStore>(self, driver: D, store: S) -> (Recorder<D, S>, CaptureReceivers) {
        let (video_sink, video) = FrameSink::channel(self.frame_channel_depth);
        let (audio_sink, audio) = FrameSink::channel(self.frame_channel_depth);
        let recorder = Recorder {
            driver,
            store,
            slot: PipelineSlot::default(),
            video_sink,
            audio_sink,
            streams: None,
            session: 0,
            params: None,
            delivery: None,
            delivery_session: 0,
            pending_cancel: None,
            stream_generation: 0,
            configuration_changed: false,
            pool_size: self.pool_size,
            chunk_size: self.chunk_size,
        };
        (recorder, CaptureReceivers { video, audio })
    }
}

#[derive(Debug, Clone, Copy)]
struct Streams {
    video: StreamHandle,
    audio: StreamHandle,
}

pub struct Recorder<D, S> {
    driver: D,
    store: S,
    slot: PipelineSlot,
    video_sink: FrameSink,
    audio_sink: FrameSink,
    streams: Option<Streams>,
    /// Capture session of the current streams; bumped on every start.
    session: u64,
    params: Option<RecordingParams>,
    delivery: Option<DeliveryContext>,
    /// Capture session the open stream was accepted on.
    delivery_session: u64,
    /// Cancel owed to the transport for a stream dropped by `stop`.
    pending_cancel: Option<CloseReason>,
    /// Identifies the open stream so late send completions can be ignored.
    stream_generation: u64,
    /// A new configuration waits for the current stream to end.
    configuration_changed: bool,
    pool_size: usize,
    chunk_size: usize,
}

impl<D: CaptureDriver, S: ConfigStore> Recorder<D, S> {
    pub fn slot(&self) -> PipelineSlot {
        self.slot.clone()
    }

    pub fn pipeline(&self) -> Option<Arc<Pipeline>> {
        self.slot.get()
    }

    pub fn state(&self) -> RecorderState {
        self.slot.get().map_or(RecorderState::Disabled, |p| p.state())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_streaming(&self) -> bool {
        self.delivery.is_some()
    }

    pub fn stream_generation(&self) -> u64 {
        self.stream_generation
    }

    /// Start recording if the store says it is switched on.
    pub fn resume(&mut self) -> Result<()> {
        if self.store.recording_active().map_err(RecorderError::Store)? {
            self.start()
        } else {
            Ok(())
        }
    }

    /// Open the capture streams and begin monitoring.
    ///
    /// Without a selected configuration the recorder stays disabled.
    pub fn start(&mut self) -> Result<()> {
        if self.streams.is_some() {
            return Ok(());
        }
        let Some(params) = self.store.recording_config().map_err(RecorderError::Store)? else {
            tracing::info!("No recording configuration selected");
            return Ok(());
        };
        let audio_enabled = self.store.audio_enabled().map_err(RecorderError::Store)?;
        let plan = params.plan(self.pool_size)?;
        let pipeline = Arc::new(Pipeline::new(&params, &plan, audio_enabled));
        // Even a failed start leaves frames of this session behind.
        self.session += 1;
        let session = self.session;

        let audio = self
            .driver
            .start_audio(&AudioStreamParams::new(&params), self.audio_sink.for_session(session))
            .map_err(|e| {
                tracing::error!("Unable to start {:?} audio recording: {:#}", params.audio.codec, e);
                RecorderError::Capture(e)
            })?;
        let video = match self
            .driver
            .start_video(&VideoStreamParams::new(&params, &plan), self.video_sink.for_session(session))
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Unable to start video recording: {:#}", e);
                self.driver.stop(audio);
                return Err(RecorderError::Capture(e));
            }
        };

        pipeline.main().set_state(RecorderState::Monitoring);
        self.slot.set(session, pipeline);
        self.streams = Some(Streams { video, audio });
        self.params = Some(params);
        self.configuration_changed = false;
        Ok(())
    }

    /// Close the capture streams and release the queues. An open stream is
    /// dropped at once; its cancel goes out on the next delivery poll.
    pub fn stop(&mut self) {
        let Some(streams) = self.streams.take() else {
            return;
        };
        self.driver.stop(streams.audio);
        self.driver.stop(streams.video);
        if let Some(pipeline) = self.slot.get() {
            pipeline.main().set_state(RecorderState::Disabled);
        }
        self.slot.clear();
        self.params = None;
        if self.delivery.take().is_some() {
            tracing::info!("Recording stream {} dropped, recorder stopped", self.stream_generation);
            self.pending_cancel = Some(CloseReason::NotAllowed);
        }
    }

    /// Back to monitoring after a stream ended, applying a deferred
    /// configuration if there is one.
    pub fn restart_recording(&mut self) {
        let Some(pipeline) = self.slot.get() else {
            return;
        };
        if self.configuration_changed {
            self.stop();
            if let Err(e) = self.start() {
                tracing::error!("Restarting camera recording stream failed: {}", e);
            }
        } else {
            pipeline.main().set_state(RecorderState::Monitoring);
        }
    }

    /// Validate, persist and apply a new configuration.
    ///
    /// An invalid configuration is rejected before anything changes.
    pub fn configure(&mut self, params: RecordingParams) -> Result<()> {
        params.plan(self.pool_size)?;
        self.store
            .set_recording_config(&params)
            .map_err(RecorderError::Store)?;
        self.apply_configuration()
    }

    /// Restart with the stored configuration, or defer while a trigger is
    /// active.
    pub fn apply_configuration(&mut self) -> Result<()> {
        if self.state().is_active() {
            tracing::info!("Recording configuration change deferred until the stream ends");
            self.configuration_changed = true;
            return Ok(());
        }
        self.stop();
        self.resume()
    }

    pub fn set_recording_active(&mut self, active: bool) -> Result<()> {
        self.store
            .set_recording_active(active)
            .map_err(RecorderError::Store)?;
        if active {
            self.start()
        } else {
            self.disable();
            Ok(())
        }
    }

    pub fn set_audio_enabled(&mut self, enabled: bool) -> Result<()> {
        let previous = self.store.audio_enabled().map_err(RecorderError::Store)?;
        self.store
            .set_audio_enabled(enabled)
            .map_err(RecorderError::Store)?;
        if previous != enabled && self.streams.is_some() {
            self.apply_configuration()?;
        }
        Ok(())
    }

    /// Stop recording and cancel any open stream with
    /// [`CloseReason::NotAllowed`].
    pub fn disable(&mut self) {
        self.stop();
    }

    /// Motion or doorbell event. Returns whether it started a recording.
    pub fn trigger(&mut self) -> Result<bool> {
        let pipeline = self.slot.get().ok_or(RecorderError::Disabled)?;
        Ok(pipeline
            .main()
            .transition(RecorderState::Monitoring, RecorderState::Recording))
    }

    /// Shorter side of the recorded video, 0 when disabled.
    pub fn recording_resolution(&self) -> u32 {
        match (&self.params, self.streams) {
            (Some(params), Some(_)) => u32::from(params.video.width.min(params.video.height)),
            _ => 0,
        }
    }

    /// A peer asks to open a data stream.
    pub fn accept_stream(&mut self, kind: StreamKind) -> std::result::Result<u64, CloseReason> {
        tracing::info!("Incoming {} stream", kind.description());
        if self.state() == RecorderState::Disabled {
            tracing::warn!("Camera event recording is currently disabled, rejecting stream");
            return Err(CloseReason::NotAllowed);
        }
        if kind != StreamKind::CameraRecording {
            tracing::warn!("Unsupported incoming stream type, rejecting stream");
            return Err(CloseReason::Unsupported);
        }
        if self.delivery.is_some() {
            tracing::warn!("Recording stream already open, rejecting stream");
            return Err(CloseReason::Busy);
        }
        self.stream_generation += 1;
        self.delivery = Some(DeliveryContext::new(self.chunk_size));
        self.delivery_session = self.session;
        tracing::info!("Accepted recording stream {}", self.stream_generation);
        Ok(self.stream_generation)
    }

    /// The peer closed the stream.
    pub fn stream_closed(&mut self, reason: CloseReason) {
        if self.delivery.is_some() {
            tracing::info!("Recording stream {} closed: {}", self.stream_generation, reason);
            self.reset_delivery();
        }
    }

    /// Result of the outstanding send of stream `generation`.
    pub fn send_completed(&mut self, generation: u64, result: anyhow::Result<()>) {
        if generation != self.stream_generation {
            return;
        }
        let Some(delivery) = self.delivery.as_mut() else {
            return;
        };
        match result {
            Ok(()) => delivery.complete(),
            Err(e) => {
                tracing::warn!("Recording stream {} failed: {:#}", generation, e);
                self.reset_delivery();
            }
        }
    }

    /// React to a push reported by an ingest task. A completed fragment only
    /// matters to the delivery loop, see [`poll_delivery`](Self::poll_delivery).
    pub fn handle_push(&mut self, outcome: PushOutcome) {
        if outcome.request_key_frame {
            self.request_key_frame();
        }
        // Nobody drains an overflowed queue without a stream.
        if self.delivery.is_none() && self.state() == RecorderState::Paused {
            tracing::info!("Recording overflowed without a stream, back to monitoring");
            self.restart_recording();
        }
    }

    pub fn request_key_frame(&mut self) {
        if let Some(streams) = self.streams {
            self.driver.request_key_frame(streams.video);
        }
    }

    /// Next action for the open stream. A cancel tears the stream down.
    pub fn poll_delivery(&mut self) -> DeliveryStep {
        if let Some(reason) = self.pending_cancel.take() {
            return DeliveryStep::Cancel(reason);
        }
        let Some(delivery) = self.delivery.as_mut() else {
            return DeliveryStep::Idle;
        };
        // A stream never outlives the pipeline it was opened on.
        let pipeline = self.slot.get_session(self.delivery_session);
        let step = delivery.poll(pipeline.as_deref());
        if let DeliveryStep::Cancel(reason) = step {
            tracing::warn!("Cancelling recording stream {}: {}", self.stream_generation, reason);
            self.delivery = None;
        }
        step
    }

    fn reset_delivery(&mut self) {
        let Some(mut delivery) = self.delivery.take() else {
            return;
        };
        if let Some(pipeline) = self.slot.get_session(self.delivery_session) {
            delivery.discard_partial(&pipeline);
        }
        self.restart_recording();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStore;
    use crate::delivery::{DataChunk, DataType};
    use crate::fmp4::{parse_fragment, parse_movie_header, AUDIO_TRACK_ID, VIDEO_TRACK_ID};
    use crate::frame::Frame;
    use crate::test_support::{FakeDriver, PPS, SPS};

    const MS: u64 = 1_000_000;

    fn recorder_with(store: MemoryStore) -> (Recorder<FakeDriver, MemoryStore>, FakeDriver, CaptureReceivers) {
        let driver = FakeDriver::new();
        let (recorder, receivers) = RecorderBuilder::new().build(driver.clone(), store);
        (recorder, driver, receivers)
    }

    fn started() -> (Recorder<FakeDriver, MemoryStore>, FakeDriver, CaptureReceivers) {
        let (mut recorder, driver, receivers) = recorder_with(MemoryStore::with_config(&RecordingParams::default()));
        recorder.resume().unwrap();
        (recorder, driver, receivers)
    }

    /// Frames at 40 ms (video) and 20 ms (audio) steps with a key frame
    /// every `key_every` ms. Audio at each video instant keeps the clock
    /// correction at zero.
    fn feed(pipeline: &Pipeline, from: u64, to: u64, key_every: u64) -> Vec<PushOutcome> {
        let mut outcomes = Vec::new();
        for t in (from..to).step_by(20) {
            outcomes.push(pipeline.push_audio(&Frame::audio(t * MS, vec![0x21; 8])).unwrap());
            if t % 40 == 0 {
                let nal = if t % key_every == 0 { 0x65 } else { 0x41 };
                outcomes.push(pipeline.push_video(&Frame::video(t * MS, vec![nal; 60])).unwrap());
            }
        }
        outcomes
    }

    /// Three video frames 33 ms apart and six audio frames 16 ms apart, then
    /// the key frame that closes the fragment.
    fn push_scenario(pipeline: &Pipeline) {
        let audio = |t: u64| Frame::audio(t * MS, vec![0x21; 12]);
        pipeline.push_audio(&audio(0)).unwrap();
        pipeline.push_video(&Frame::video(0, vec![0x65; 300])).unwrap();
        pipeline.push_audio(&audio(16)).unwrap();
        pipeline.push_audio(&audio(32)).unwrap();
        pipeline.push_video(&Frame::video(33 * MS, vec![0x41; 200])).unwrap();
        pipeline.push_audio(&audio(48)).unwrap();
        pipeline.push_audio(&audio(64)).unwrap();
        pipeline.push_video(&Frame::video(66 * MS, vec![0x41; 200])).unwrap();
        pipeline.push_audio(&audio(80)).unwrap();
        pipeline.push_video(&Frame::video(4000 * MS, vec![0x65; 300])).unwrap();
        assert!(pipeline.push_audio(&audio(4000)).unwrap().fragment_ready);
    }

    fn drain(recorder: &mut Recorder<FakeDriver, MemoryStore>) -> Vec<DataChunk> {
        let mut sent = Vec::new();
        while let DeliveryStep::Send(chunk) = recorder.poll_delivery() {
            sent.push(chunk);
            let generation = recorder.stream_generation();
            recorder.send_completed(generation, Ok(()));
        }
        sent
    }

    #[test]
    fn test_start_without_configuration_stays_disabled() {
        let (mut recorder, driver, _rx) = recorder_with(MemoryStore::new());
        recorder.start().unwrap();
        assert_eq!(recorder.state(), RecorderState::Disabled);
        assert!(driver.log.lock().calls.is_empty());
        assert_eq!(recorder.recording_resolution(), 0);
        assert!(matches!(recorder.trigger(), Err(RecorderError::Disabled)));
    }

    #[test]
    fn test_start_opens_audio_then_video() {
        let (recorder, driver, _rx) = started();
        assert_eq!(recorder.state(), RecorderState::Monitoring);
        assert_eq!(driver.log.lock().calls, vec!["audio", "video"]);
        assert_eq!(recorder.recording_resolution(), 1080);

        let log = driver.log.lock();
        let (_, video, _) = log.video.as_ref().unwrap();
        assert_eq!(video.bit_rate, 2_000_000);
    }

    #[test]
    fn test_video_failure_stops_audio() {
        let driver = FakeDriver::new();
        driver.log.lock().fail_video = true;
        let (mut recorder, _rx) =
            RecorderBuilder::new().build(driver.clone(), MemoryStore::with_config(&RecordingParams::default()));

        let err = recorder.start().unwrap_err();
        assert!(matches!(err, RecorderError::Capture(_)));
        assert_eq!(driver.log.lock().calls, vec!["audio", "stop audio"]);
        assert_eq!(recorder.state(), RecorderState::Disabled);
    }

    #[test]
    fn test_invalid_configuration_keeps_previous() {
        let (mut recorder, driver, _rx) = started();
        let mut params = RecordingParams::default();
        params.video.max_frame_rate = 0;

        let err = recorder.configure(params).unwrap_err();
        assert!(err.is_config_error());
        assert_eq!(recorder.state(), RecorderState::Monitoring);
        assert_eq!(recorder.store().recording_config().unwrap(), Some(RecordingParams::default()));
        assert_eq!(driver.log.lock().calls, vec!["audio", "video"]);
    }

    #[test]
    fn test_configuration_change_waits_for_stream_end() {
        let (mut recorder, driver, _rx) = started();
        assert!(recorder.trigger().unwrap());
        recorder.accept_stream(StreamKind::CameraRecording).unwrap();

        let mut params = RecordingParams::default();
        params.video.width = 1280;
        params.video.height = 720;
        recorder.configure(params).unwrap();
        assert_eq!(recorder.recording_resolution(), 1080);
        assert_eq!(recorder.state(), RecorderState::Recording);

        recorder.stream_closed(CloseReason::Normal);
        assert_eq!(recorder.recording_resolution(), 720);
        assert_eq!(recorder.state(), RecorderState::Monitoring);
        assert_eq!(
            driver.log.lock().calls,
            vec!["audio", "video", "stop audio", "stop video", "audio", "video"]
        );
    }

    #[test]
    fn test_stream_admission() {
        let (mut recorder, _driver, _rx) = recorder_with(MemoryStore::new());
        assert_eq!(recorder.accept_stream(StreamKind::CameraRecording), Err(CloseReason::NotAllowed));

        let (mut recorder, _driver, _rx) = started();
        assert_eq!(recorder.accept_stream(StreamKind::AudioSiri), Err(CloseReason::Unsupported));
        assert_eq!(recorder.accept_stream(StreamKind::CameraRecording), Ok(1));
        assert_eq!(recorder.accept_stream(StreamKind::CameraRecording), Err(CloseReason::Busy));
    }

    #[test]
    fn test_transport_error_resets_to_monitoring() {
        let (mut recorder, _driver, _rx) = started();
        let pipeline = recorder.pipeline().unwrap();
        pipeline.push_video(&Frame::video(0, SPS.to_vec())).unwrap();
        pipeline.push_video(&Frame::video(0, PPS.to_vec())).unwrap();
        feed(&pipeline, 0, 100, 1000);

        let generation = recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        assert!(matches!(recorder.poll_delivery(), DeliveryStep::Send(_)));
        assert_eq!(recorder.state(), RecorderState::Recording);

        recorder.send_completed(generation, Err(anyhow::anyhow!("broken pipe")));
        assert!(!recorder.is_streaming());
        assert_eq!(recorder.state(), RecorderState::Monitoring);
        assert_eq!(recorder.poll_delivery(), DeliveryStep::Idle);

        // A late completion of the dead stream is ignored.
        let next = recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        recorder.send_completed(generation, Ok(()));
        assert_ne!(next, generation);
        assert!(matches!(recorder.poll_delivery(), DeliveryStep::Send(_)));
    }

    #[test]
    fn test_disable_cancels_open_stream() {
        let (mut recorder, driver, _rx) = started();
        recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        recorder.set_recording_active(false).unwrap();

        assert_eq!(recorder.state(), RecorderState::Disabled);
        assert_eq!(recorder.poll_delivery(), DeliveryStep::Cancel(CloseReason::NotAllowed));
        assert!(!recorder.is_streaming());
        assert!(driver.log.lock().video.is_none());
        assert!(!recorder.store().recording_active().unwrap());
    }

    #[test]
    fn test_paused_without_stream_returns_to_monitoring() {
        let (mut recorder, _driver, _rx) = started();
        let pipeline = recorder.pipeline().unwrap();
        assert!(recorder.trigger().unwrap());
        pipeline.main().set_state(RecorderState::Paused);

        recorder.handle_push(PushOutcome::default());
        assert_eq!(recorder.state(), RecorderState::Monitoring);

        // With a stream open the delivery loop owns the recovery.
        assert!(recorder.trigger().unwrap());
        recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        pipeline.main().set_state(RecorderState::Paused);
        recorder.handle_push(PushOutcome::default());
        assert_eq!(recorder.state(), RecorderState::Paused);
    }

    #[test]
    fn test_key_frame_request_reaches_driver() {
        let (mut recorder, driver, _rx) = started();
        let pipeline = recorder.pipeline().unwrap();
        // No key frame yet: the first slice asks for one.
        let outcome = pipeline.push_video(&Frame::video(40 * MS, vec![0x41; 10])).unwrap();
        assert!(outcome.request_key_frame);
        recorder.handle_push(outcome);
        assert_eq!(driver.log.lock().key_frame_requests, 1);
    }

    #[test]
    fn test_recording_round_trip() {
        let mut params = RecordingParams::default();
        params.fragment_duration_ms = 1000;
        let (mut recorder, _driver, _rx) = recorder_with(MemoryStore::with_config(&params));
        recorder.resume().unwrap();
        let pipeline = recorder.pipeline().unwrap();
        pipeline.push_video(&Frame::video(0, SPS.to_vec())).unwrap();
        pipeline.push_video(&Frame::video(0, PPS.to_vec())).unwrap();

        assert!(recorder.trigger().unwrap());
        recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        for outcome in feed(&pipeline, 0, 3020, 1000) {
            recorder.handle_push(outcome);
        }
        let chunks = drain(&mut recorder);

        assert_eq!(chunks[0].data_type, DataType::MediaInitialization);
        let movie = parse_movie_header(&chunks[0].data).unwrap();
        assert_eq!(movie.trex_track_ids, vec![VIDEO_TRACK_ID, AUDIO_TRACK_ID]);

        let fragments = &chunks[1..];
        assert_eq!(fragments.len(), 3);
        let mut video_frames = 0;
        let mut audio_frames = 0;
        for (i, chunk) in fragments.iter().enumerate() {
            assert_eq!(chunk.data_sequence_number, i as u32 + 2);
            assert!(chunk.is_last_chunk);
            let fragment = parse_fragment(&chunk.data).unwrap();
            assert_eq!(fragment.sequence_number, i as u32 + 1);

            let video = fragment.track(VIDEO_TRACK_ID).unwrap();
            // 1 s of video at 3000 ticks per second.
            assert_eq!(video.base_decode_time, 3000 * i as u64);
            let samples: Vec<_> = video.runs.iter().flat_map(|r| r.samples.iter()).collect();
            assert!(samples.iter().all(|s| s.size == 64));
            assert!(samples[0].is_key_frame());
            let durations: u32 = samples[..samples.len() - 1].iter().map(|s| s.duration).sum();
            assert_eq!(durations, 120 * (samples.len() as u32 - 1));
            video_frames += samples.len();

            let audio = fragment.track(AUDIO_TRACK_ID).unwrap();
            let samples: Vec<_> = audio.runs.iter().flat_map(|r| r.samples.iter()).collect();
            assert!(samples.iter().all(|s| s.size == 8));
            audio_frames += samples.len();
        }
        assert_eq!(video_frames, 75);
        assert_eq!(audio_frames, 150);
    }

    #[test]
    fn test_disable_while_chunk_in_flight() {
        let mut params = RecordingParams::default();
        params.fragment_duration_ms = 1000;
        let (mut recorder, _rx) = RecorderBuilder::new()
            .chunk_size(100)
            .build(FakeDriver::new(), MemoryStore::with_config(&params));
        recorder.resume().unwrap();
        let pipeline = recorder.pipeline().unwrap();
        pipeline.push_video(&Frame::video(0, SPS.to_vec())).unwrap();
        pipeline.push_video(&Frame::video(0, PPS.to_vec())).unwrap();
        assert!(recorder.trigger().unwrap());
        let first = recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        feed(&pipeline, 0, 2020, 1000);

        let DeliveryStep::Send(header) = recorder.poll_delivery() else {
            panic!("movie header not sent");
        };
        assert_eq!(header.data_type, DataType::MediaInitialization);
        recorder.send_completed(first, Ok(()));
        let DeliveryStep::Send(chunk) = recorder.poll_delivery() else {
            panic!("fragment not sent");
        };
        assert!(!chunk.is_last_chunk);

        // Off and on again before the transport reports back.
        recorder.set_recording_active(false).unwrap();
        recorder.set_recording_active(true).unwrap();
        assert_eq!(recorder.poll_delivery(), DeliveryStep::Cancel(CloseReason::NotAllowed));
        assert!(!recorder.is_streaming());

        recorder.send_completed(first, Ok(()));
        assert_eq!(recorder.poll_delivery(), DeliveryStep::Idle);
        assert_eq!(recorder.state(), RecorderState::Monitoring);

        let second = recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        assert_ne!(second, first);
        // The new pipeline has not seen any parameter sets yet.
        assert_eq!(recorder.poll_delivery(), DeliveryStep::Idle);
        assert!(recorder.is_streaming());
    }

    #[test]
    fn test_restart_starts_new_capture_session() {
        let (mut recorder, driver, mut rx) = started();
        let slot = recorder.slot();
        let old = driver.log.lock().video.as_ref().unwrap().2.clone();
        assert!(slot.get_session(old.session()).is_some());

        recorder.set_audio_enabled(false).unwrap();
        let new = driver.log.lock().video.as_ref().unwrap().2.clone();
        assert_ne!(new.session(), old.session());

        // A frame still queued from the old session finds no pipeline.
        assert!(old.push(Frame::video(0, SPS.to_vec())));
        assert!(new.push(Frame::video(0, PPS.to_vec())));
        let (session, _) = rx.video.try_recv().unwrap();
        assert!(slot.get_session(session).is_none());
        let (session, _) = rx.video.try_recv().unwrap();
        let current = slot.get_session(session).unwrap();
        assert!(Arc::ptr_eq(&current, &recorder.pipeline().unwrap()));
        assert!(!current.audio_enabled());
    }

    #[test]
    fn test_triggered_scenario_from_monitoring() {
        let (mut recorder, _driver, _rx) = started();
        let pipeline = recorder.pipeline().unwrap();
        pipeline.push_video(&Frame::video(0, SPS.to_vec())).unwrap();
        pipeline.push_video(&Frame::video(0, PPS.to_vec())).unwrap();
        assert_eq!(recorder.state(), RecorderState::Monitoring);

        assert!(recorder.trigger().unwrap());
        push_scenario(&pipeline);
        recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        let chunks = drain(&mut recorder);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data_type, DataType::MediaInitialization);

        let fragment = parse_fragment(&chunks[1].data).unwrap();
        assert_eq!(fragment.sequence_number, 1);
        let video = fragment.track(VIDEO_TRACK_ID).unwrap();
        assert_eq!(video.base_decode_time, 0);
        assert_eq!(video.runs.len(), 1);
        assert_eq!(video.runs[0].samples.len(), 3);
        assert!(video.runs[0].samples[0].is_key_frame());

        let audio = fragment.track(AUDIO_TRACK_ID).unwrap();
        assert_eq!(audio.base_decode_time, 0);
        assert_eq!(audio.runs.iter().map(|r| r.samples.len()).sum::<usize>(), 6);
    }

    #[test]
    fn test_zero_chunk_size_still_delivers() {
        let (mut recorder, _rx) = RecorderBuilder::new()
            .chunk_size(0)
            .build(FakeDriver::new(), MemoryStore::with_config(&RecordingParams::default()));
        recorder.resume().unwrap();
        let pipeline = recorder.pipeline().unwrap();
        pipeline.push_video(&Frame::video(0, SPS.to_vec())).unwrap();
        pipeline.push_video(&Frame::video(0, PPS.to_vec())).unwrap();
        assert!(recorder.trigger().unwrap());
        push_scenario(&pipeline);

        recorder.accept_stream(StreamKind::CameraRecording).unwrap();
        let chunks = drain(&mut recorder);
        let fragment = &chunks[1..];
        assert!(fragment.last().unwrap().is_last_chunk);
        assert!(fragment[1..].iter().all(|c| c.data.len() == 1));
        let total: usize = fragment.iter().map(|c| c.data.len()).sum();
        assert_eq!(fragment[0].total_size, Some(total as u64));
    }
}
