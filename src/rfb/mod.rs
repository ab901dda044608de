//! Minimal RFB (VNC) client: enough of the protocol to keep a canvas in sync
//! with a remote desktop.

pub mod auth;
pub mod decode;
pub mod errors;
pub mod handshake;
pub mod messages;
pub mod session;

pub use errors::{ConnectionError, NegotiationError, SessionError};
pub use messages::{ClientMessage, Encoding, FramebufferUpdateRequest, PixelFormat, ServerMessage};
pub use session::{dial, Session, SessionChannels, SessionHandle, UpdateRequestSink};
