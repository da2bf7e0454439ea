//! Camera event recording.
//!
//! H.264 video and AAC audio from a capture driver are synchronized into a
//! shared timeline, buffered in a bounded pre-record queue, packaged as
//! fragmented MP4 and delivered in sequence-numbered chunks over one
//! flow-controlled data stream.
//!
//! # Quick Start
//!
//! ```ignore
//! use camrec::{MemoryStore, RecorderBuilder, RecordingParams, StreamKind};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = MemoryStore::with_config(&RecordingParams::default());
//! let (recorder, receivers) = RecorderBuilder::new().build(driver, store);
//! let (handle, task) = camrec::spawn(recorder, receivers, transport, CancellationToken::new());
//!
//! handle.trigger().await?;
//! handle.open_stream(StreamKind::CameraRecording).await?;
//! ```
//!
//! # Layout
//!
//! - [`capture`]: capture driver seam and non-blocking frame sinks
//! - [`sync`]: audio/video synchronization in front of the main queue
//! - [`queue`] and [`state`]: byte ring queues and the recording state machine
//! - [`muxer`] and [`fmp4`]: fragment assembly and box encoding
//! - [`delivery`]: chunked delivery over a [`Transport`]
//! - [`recorder`] and [`service`]: lifecycle and the async service

pub mod capture;
pub mod config;
pub mod delivery;
pub mod error;
pub mod fmp4;
pub mod frame;
pub mod muxer;
pub mod queue;
pub mod recorder;
pub mod service;
pub mod state;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use capture::{AudioStreamParams, CaptureDriver, FrameReceiver, FrameSink, StreamHandle, VideoStreamParams};
pub use config::{ConfigStore, MemoryStore, RecordingParams, RecordingPlan};
pub use delivery::{CloseReason, DataChunk, DataType, StreamKind, Transport};
pub use error::{RecorderError, Result};
pub use frame::{Frame, FrameKind};
pub use recorder::{CaptureReceivers, PipelineSlot, Recorder, RecorderBuilder};
pub use service::{spawn, RecorderHandle};
pub use state::RecorderState;
pub use sync::{Pipeline, PushOutcome};
