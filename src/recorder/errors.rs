use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::rfb::{ConnectionError, NegotiationError, SessionError};

/// Errors from the ffmpeg encoding pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("Encoder executable {path:?} not found: {reason}")]
    EncoderNotFound { path: PathBuf, reason: String },
    #[error("Failed to spawn encoder: {0}")]
    SpawnFailed(String),
    #[error("Failed to write to encoder: {0}")]
    WriteFailed(String),
    #[error("Encoder writer stalled (frame send timeout)")]
    WriterStalled,
    #[error("Encoder writer disconnected unexpectedly")]
    WriterDisconnected,
    #[error("Encoder input is already closed")]
    InputClosed,
    #[error("Encoder process failed with exit code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },
    #[error("Encoder did not finish within {0:?}")]
    Timeout(Duration),
    #[error("Encoder was aborted")]
    Aborted,
}

/// Top-level error type for a recording run.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("Error negotiating connection to VNC host: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error("VNC session failed: {0}")]
    Session(#[from] SessionError),
    #[error("Failed to install signal handlers: {0}")]
    Signals(std::io::Error),
    #[error("Failed to write summary file: {0}")]
    Summary(String),
    #[error("Shutdown task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
