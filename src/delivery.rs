//! Chunked delivery of a recording over a flow-controlled stream.

use std::fmt;
use std::future::Future;

use bytes::Bytes;

use crate::muxer::{ChunkPoll, FragmentMuxer, MuxedChunk};
use crate::state::RecorderState;
use crate::sync::Pipeline;

/// Payload type of a [`DataChunk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Movie header.
    MediaInitialization,
    MediaFragment,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::MediaInitialization => "mediaInitialization",
            DataType::MediaFragment => "mediaFragment",
        }
    }
}

/// One message of the recording stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub data_type: DataType,
    /// 1 for the movie header, then one per fragment.
    pub data_sequence_number: u32,
    /// Starts at 1 within each data sequence.
    pub chunk_sequence_number: u32,
    pub is_last_chunk: bool,
    /// Byte length of the whole fragment, first chunk only.
    pub total_size: Option<u64>,
    pub data: Bytes,
}

impl From<MuxedChunk> for DataChunk {
    fn from(chunk: MuxedChunk) -> Self {
        Self {
            data_type: if chunk.fragment_number == 0 {
                DataType::MediaInitialization
            } else {
                DataType::MediaFragment
            },
            data_sequence_number: chunk.fragment_number + 1,
            chunk_sequence_number: chunk.chunk_number,
            is_last_chunk: chunk.is_last,
            total_size: chunk.total_size.map(|n| n as u64),
            data: chunk.bytes,
        }
    }
}

/// Type of an incoming data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    AudioSiri,
    CameraRecording,
    DiagnosticsSnapshot,
    AccessoryMetrics,
}

impl StreamKind {
    pub fn description(&self) -> &'static str {
        match self {
            StreamKind::AudioSiri => "Siri",
            StreamKind::CameraRecording => "IP Camera recording",
            StreamKind::DiagnosticsSnapshot => "Diagnostics snapshot",
            StreamKind::AccessoryMetrics => "Accessory metrics",
        }
    }
}

/// Why a stream was rejected or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    NotAllowed,
    Busy,
    Canceled,
    Unsupported,
    UnexpectedFailure,
    Timeout,
    BadData,
    ProtocolError,
    InvalidConfiguration,
}

impl CloseReason {
    pub fn to_wire(&self) -> u8 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::NotAllowed => 1,
            CloseReason::Busy => 2,
            CloseReason::Canceled => 3,
            CloseReason::Unsupported => 4,
            CloseReason::UnexpectedFailure => 5,
            CloseReason::Timeout => 6,
            CloseReason::BadData => 7,
            CloseReason::ProtocolError => 8,
            CloseReason::InvalidConfiguration => 9,
        }
    }

    pub fn from_wire(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(CloseReason::Normal),
            1 => Ok(CloseReason::NotAllowed),
            2 => Ok(CloseReason::Busy),
            3 => Ok(CloseReason::Canceled),
            4 => Ok(CloseReason::Unsupported),
            5 => Ok(CloseReason::UnexpectedFailure),
            6 => Ok(CloseReason::Timeout),
            7 => Ok(CloseReason::BadData),
            8 => Ok(CloseReason::ProtocolError),
            9 => Ok(CloseReason::InvalidConfiguration),
            _ => anyhow::bail!("Unknown close reason: {}", v),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CloseReason::Normal => "Normal close.",
            CloseReason::NotAllowed => "Controller will not allow the accessory to send this transfer.",
            CloseReason::Busy => "Controller cannot accept this transfer right now.",
            CloseReason::Canceled => "Accessory will not finish the transfer.",
            CloseReason::Unsupported => "Controller does not support this stream type.",
            CloseReason::UnexpectedFailure => "Protocol error occurred and the stream has failed.",
            CloseReason::Timeout => "Accessory could not start the session.",
            CloseReason::BadData => "Controller failed to parse the MP4 fragment.",
            CloseReason::ProtocolError => {
                "A protocol error occurred: incorrect sequence number for chunks and/or MP4 fragment."
            }
            CloseReason::InvalidConfiguration => "Accessory not configured to perform the request.",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Outgoing side of the recording stream.
pub trait Transport: Send + 'static {
    /// Send one chunk; resolves once the peer accepted it.
    fn send(&mut self, chunk: DataChunk) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Close the stream from the accessory side.
    fn cancel(&mut self, reason: CloseReason);
}

/// What the delivery loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStep {
    /// A send is in flight or nothing is ready.
    Idle,
    Send(DataChunk),
    /// The recorder went away underneath the stream.
    Cancel(CloseReason),
}

/// State of the one open recording stream.
#[derive(Debug)]
pub struct DeliveryContext {
    ready_to_send: bool,
    muxer: FragmentMuxer,
    chunk_size: usize,
}

impl DeliveryContext {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            ready_to_send: true,
            muxer: FragmentMuxer::new(),
            chunk_size,
        }
    }

    pub fn ready_to_send(&self) -> bool {
        self.ready_to_send
    }

    pub fn muxer(&self) -> &FragmentMuxer {
        &self.muxer
    }

    /// Produce the next chunk to send, if any. At most one chunk is
    /// outstanding until [`complete`](Self::complete) is called.
    pub fn poll(&mut self, pipeline: Option<&Pipeline>) -> DeliveryStep {
        if !self.ready_to_send {
            return DeliveryStep::Idle;
        }
        let Some(pipeline) = pipeline.filter(|p| p.state() != RecorderState::Disabled) else {
            return DeliveryStep::Cancel(CloseReason::NotAllowed);
        };
        match self.muxer.next_chunk(pipeline, self.chunk_size) {
            ChunkPoll::Ready(chunk) => {
                self.ready_to_send = false;
                DeliveryStep::Send(chunk.into())
            }
            ChunkPoll::NotReady => DeliveryStep::Idle,
        }
    }

    /// The transport accepted the outstanding chunk.
    pub fn complete(&mut self) {
        self.ready_to_send = true;
    }

    /// Drop the unread rest of a partially sent frame.
    pub fn discard_partial(&mut self, pipeline: &Pipeline) {
        self.muxer.discard_partial(pipeline);
    }
}
