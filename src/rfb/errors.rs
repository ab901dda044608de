use std::time::Duration;

use thiserror::Error;

/// Errors raised while opening the transport.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Error connecting to VNC host {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Timed out after {timeout:?} connecting to VNC host {address}")]
    Timeout { address: String, timeout: Duration },
}

/// Errors raised while negotiating a session (before any frame is decoded).
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Server sent an invalid protocol version: {0:?}")]
    InvalidVersion(String),
    #[error("Unsupported protocol version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },
    #[error("Server refused the connection: {0}")]
    Refused(String),
    #[error("No supported security type offered (server offered {0:?})")]
    NoSupportedSecurity(Vec<u8>),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("I/O error during negotiation: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end an established session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Connection closed by server")]
    ConnectionClosed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown server message type {0}")]
    UnknownMessage(u8),
    #[error("Unsupported rectangle encoding {0}")]
    UnsupportedEncoding(i32),
    #[error("Rectangle {width}x{height}+{x}+{y} exceeds framebuffer {fb_width}x{fb_height}")]
    RectangleOutOfBounds {
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        fb_width: u16,
        fb_height: u16,
    },
    #[error("Malformed {encoding} data: {reason}")]
    Malformed {
        encoding: &'static str,
        reason: String,
    },
    #[error("Session writer is gone")]
    WriterClosed,
}

impl SessionError {
    pub fn malformed(encoding: &'static str, reason: impl Into<String>) -> Self {
        SessionError::Malformed {
            encoding,
            reason: reason.into(),
        }
    }

    /// Maps end-of-stream I/O errors to [`SessionError::ConnectionClosed`].
    pub fn from_io(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SessionError::ConnectionClosed
        } else {
            SessionError::Io(e)
        }
    }
}
