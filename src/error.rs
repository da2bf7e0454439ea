//! Error types for the recording pipeline.

use thiserror::Error;

/// Errors surfaced by the recorder lifecycle and its queues.
///
/// Main-queue backpressure is deliberately absent: it is absorbed by the
/// Paused rollback and only shows up as a gap in fragment sequence numbers.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Recording parameters failed validation. The previous configuration
    /// stays active.
    #[error("invalid recording configuration: {0}")]
    InvalidConfig(String),

    /// Operation requires an enabled recorder.
    #[error("recorder is disabled")]
    Disabled,

    /// A synchronization queue ran out of space.
    #[error("{queue} synchronization queue overflow ({needed} bytes needed, {available} available)")]
    SyncQueueOverflow {
        queue: &'static str,
        needed: usize,
        available: usize,
    },

    /// The capture driver refused to open or control a stream.
    #[error("capture driver error: {0:#}")]
    Capture(anyhow::Error),

    /// The configuration store failed to load or persist a value.
    #[error("configuration store error: {0:#}")]
    Store(anyhow::Error),

    /// The recorder service task is gone.
    #[error("recorder service has shut down")]
    ServiceClosed,
}

impl RecorderError {
    /// Create an invalid configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether the error leaves the previous configuration untouched.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }
}

/// Result type for recorder operations.
pub type Result<T> = std::result::Result<T, RecorderError>;
