//! Async service around a [`Recorder`].
//!
//! One consumer task owns the recorder and serializes commands, push
//! events and transport completions. Capture frames are fed into the
//! pipeline by one ingest task per elementary stream, and a transport task
//! performs the (single outstanding) chunk send.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureDriver, FrameReceiver};
use crate::config::{ConfigStore, RecordingParams};
use crate::delivery::{CloseReason, DataChunk, DeliveryStep, StreamKind, Transport};
use crate::error::{RecorderError, Result};
use crate::frame::FrameKind;
use crate::recorder::{CaptureReceivers, PipelineSlot, Recorder};
use crate::state::RecorderState;
use crate::sync::PushOutcome;

const CHANNEL_DEPTH: usize = 32;

enum Command {
    Trigger {
        reply: oneshot::Sender<Result<bool>>,
    },
    Configure {
        params: RecordingParams,
        reply: oneshot::Sender<Result<()>>,
    },
    SetRecordingActive {
        active: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAudioEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenStream {
        kind: StreamKind,
        reply: oneshot::Sender<std::result::Result<(), CloseReason>>,
    },
    CloseStream {
        reason: CloseReason,
    },
    State {
        reply: oneshot::Sender<RecorderState>,
    },
    Resolution {
        reply: oneshot::Sender<u32>,
    },
}

enum TransportRequest {
    Send { generation: u64, chunk: DataChunk },
    Cancel(CloseReason),
}

type Completion = (u64, anyhow::Result<()>);

/// Cloneable control handle of a running recorder service.
#[derive(Clone)]
pub struct RecorderHandle {
    commands: mpsc::Sender<Command>,
}

impl RecorderHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RecorderError::ServiceClosed)?;
        rx.await.map_err(|_| RecorderError::ServiceClosed)
    }

    /// Report a motion or doorbell event.
    pub async fn trigger(&self) -> Result<bool> {
        self.request(|reply| Command::Trigger { reply }).await?
    }

    /// Select a new recording configuration.
    pub async fn configure(&self, params: RecordingParams) -> Result<()> {
        self.request(|reply| Command::Configure { params, reply }).await?
    }

    pub async fn set_recording_active(&self, active: bool) -> Result<()> {
        self.request(|reply| Command::SetRecordingActive { active, reply })
            .await?
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetAudioEnabled { enabled, reply })
            .await?
    }

    /// A peer opens a data stream. Rejections carry the close reason to
    /// report back.
    pub async fn open_stream(&self, kind: StreamKind) -> std::result::Result<(), CloseReason> {
        match self.request(|reply| Command::OpenStream { kind, reply }).await {
            Ok(result) => result,
            Err(_) => Err(CloseReason::UnexpectedFailure),
        }
    }

    /// The peer closed the recording stream.
    pub async fn close_stream(&self, reason: CloseReason) -> Result<()> {
        self.commands
            .send(Command::CloseStream { reason })
            .await
            .map_err(|_| RecorderError::ServiceClosed)
    }

    pub async fn state(&self) -> Result<RecorderState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Shorter side of the recorded video, 0 when disabled.
    pub async fn resolution(&self) -> Result<u32> {
        self.request(|reply| Command::Resolution { reply }).await
    }
}

/// Start the service tasks. Recording resumes if the store has it switched
/// on. Everything stops when `cancel` fires.
pub fn spawn<D, S, T>(
    recorder: Recorder<D, S>,
    receivers: CaptureReceivers,
    transport: T,
    cancel: CancellationToken,
) -> (RecorderHandle, JoinHandle<()>)
where
    D: CaptureDriver + 'static,
    S: ConfigStore + 'static,
    T: Transport,
{
    let (command_tx, command_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (request_tx, request_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (completion_tx, completion_rx) = mpsc::channel(CHANNEL_DEPTH);

    let slot = recorder.slot();
    tokio::spawn(ingest(FrameKind::Video, receivers.video, slot.clone(), event_tx.clone(), cancel.clone()));
    tokio::spawn(ingest(FrameKind::Audio, receivers.audio, slot, event_tx, cancel.clone()));
    tokio::spawn(transport_loop(transport, request_rx, completion_tx, cancel.clone()));

    let consumer = Consumer {
        recorder,
        requests: request_tx,
    };
    let task = tokio::spawn(consumer.run(command_rx, event_rx, completion_rx, cancel));
    (RecorderHandle { commands: command_tx }, task)
}

/// Feed frames of one capture stream into the active pipeline.
async fn ingest(
    kind: FrameKind,
    mut frames: FrameReceiver,
    slot: PipelineSlot,
    events: mpsc::Sender<PushOutcome>,
    cancel: CancellationToken,
) {
    loop {
        let (session, frame) = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        // Frames arriving while disabled, or left over from an earlier
        // capture session, have nowhere to go.
        let Some(pipeline) = slot.get_session(session) else {
            tracing::trace!("Dropping {:?} frame of capture session {}", kind, session);
            continue;
        };
        let pushed = match kind {
            FrameKind::Video => pipeline.push_video(&frame),
            FrameKind::Audio => pipeline.push_audio(&frame),
        };
        match pushed {
            Ok(outcome) => {
                let paused = pipeline.state() == RecorderState::Paused;
                if (outcome != PushOutcome::default() || paused) && events.send(outcome).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::error!("Dropping {:?} frame at {}: {}", kind, frame.sample_time, e),
        }
    }
    tracing::debug!("{:?} ingest stopped", kind);
}

async fn transport_loop<T: Transport>(
    mut transport: T,
    mut requests: mpsc::Receiver<TransportRequest>,
    completions: mpsc::Sender<Completion>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };
        match request {
            TransportRequest::Send { generation, chunk } => {
                tracing::debug!(
                    "Sending {} {} chunk {} ({} bytes)",
                    chunk.data_type.as_str(),
                    chunk.data_sequence_number,
                    chunk.chunk_sequence_number,
                    chunk.data.len()
                );
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = transport.send(chunk) => result,
                };
                if completions.send((generation, result)).await.is_err() {
                    break;
                }
            }
            TransportRequest::Cancel(reason) => transport.cancel(reason),
        }
    }
}

struct Consumer<D, S> {
    recorder: Recorder<D, S>,
    requests: mpsc::Sender<TransportRequest>,
}

impl<D: CaptureDriver, S: ConfigStore> Consumer<D, S> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<PushOutcome>,
        mut completions: mpsc::Receiver<Completion>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.recorder.resume() {
            tracing::error!("Unable to resume camera recording: {}", e);
        }
        tracing::info!("Recorder service started ({})", self.recorder.state());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle(command),
                Some(outcome) = events.recv() => self.recorder.handle_push(outcome),
                Some((generation, result)) = completions.recv() => {
                    self.recorder.send_completed(generation, result);
                }
                else => break,
            }
            self.drive().await;
        }

        self.recorder.stop();
        tracing::info!("Recorder service stopped");
    }

    fn handle(&mut self, command: Command) {
        let recorder = &mut self.recorder;
        // A dropped reply only means the caller stopped waiting.
        match command {
            Command::Trigger { reply } => {
                let _ = reply.send(recorder.trigger());
            }
            Command::Configure { params, reply } => {
                let _ = reply.send(recorder.configure(params));
            }
            Command::SetRecordingActive { active, reply } => {
                let _ = reply.send(recorder.set_recording_active(active));
            }
            Command::SetAudioEnabled { enabled, reply } => {
                let _ = reply.send(recorder.set_audio_enabled(enabled));
            }
            Command::OpenStream { kind, reply } => {
                let _ = reply.send(recorder.accept_stream(kind).map(|_| ()));
            }
            Command::CloseStream { reason } => recorder.stream_closed(reason),
            Command::State { reply } => {
                let _ = reply.send(recorder.state());
            }
            Command::Resolution { reply } => {
                let _ = reply.send(recorder.recording_resolution());
            }
        }
    }

    /// Hand the next chunk (or a cancel) to the transport task.
    async fn drive(&mut self) {
        let request = match self.recorder.poll_delivery() {
            DeliveryStep::Idle => return,
            DeliveryStep::Send(chunk) => TransportRequest::Send {
                generation: self.recorder.stream_generation(),
                chunk,
            },
            DeliveryStep::Cancel(reason) => TransportRequest::Cancel(reason),
        };
        if self.requests.send(request).await.is_err() {
            tracing::warn!("Transport task is gone, dropping recording stream");
            self.recorder.stream_closed(CloseReason::UnexpectedFailure);
        }
    }
}
