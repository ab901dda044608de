use std::time::Duration;

use super::errors::EncodingError;
use crate::canvas::FrameSample;

/// What the encoder reported once it finished.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOutcome {
    pub frames_written: u64,
}

/// Consumer of paced frames.
///
/// The accepting flag is cleared once by the shutdown coordinator and read by
/// the pacer before every tick. `close` ends the input stream; `abort`
/// discards it.
pub trait FrameSink: Send + Sync {
    fn is_accepting(&self) -> bool;

    fn stop_accepting(&self);

    fn submit(&self, frame: FrameSample) -> Result<(), EncodingError>;

    fn close(&self) -> Result<(), EncodingError>;

    /// Blocks until the encoder has finished, at most `timeout`.
    fn wait_finished(&self, timeout: Duration) -> Result<EncoderOutcome, EncodingError>;

    fn abort(&self);
}
