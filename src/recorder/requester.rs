use std::time::Instant;

use crate::rfb::{FramebufferUpdateRequest, SessionError, UpdateRequestSink};

/// Flow control for framebuffer update requests.
///
/// Keeps exactly one request in flight: the next incremental request is only
/// issued when the previous update has fully arrived.
#[derive(Debug)]
pub struct UpdateRequester {
    width: u16,
    height: u16,
    outstanding: bool,
    requested: u64,
    completed: u64,
    started_at: Instant,
}

impl UpdateRequester {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            outstanding: false,
            requested: 0,
            completed: 0,
            started_at: Instant::now(),
        }
    }

    /// Sends the initial non-incremental request for the whole screen.
    pub fn request_initial<S: UpdateRequestSink + ?Sized>(
        &mut self,
        sink: &S,
    ) -> Result<(), SessionError> {
        self.started_at = Instant::now();
        self.send(sink, false)
    }

    /// Records a completed update and requests the next one.
    pub fn on_update_complete<S: UpdateRequestSink + ?Sized>(
        &mut self,
        sink: &S,
    ) -> Result<(), SessionError> {
        if !self.outstanding {
            tracing::warn!(target: "recorder", "[REQUESTER] Unsolicited framebuffer update");
        }
        self.outstanding = false;
        self.completed += 1;

        tracing::debug!(target: "recorder",
            "[REQUESTER] Update {} complete, {:.1} updates/sec",
            self.completed, self.updates_per_second());

        self.send(sink, true)
    }

    fn send<S: UpdateRequestSink + ?Sized>(
        &mut self,
        sink: &S,
        incremental: bool,
    ) -> Result<(), SessionError> {
        if self.outstanding {
            tracing::debug!(target: "recorder", "[REQUESTER] Request already outstanding, skipping");
            return Ok(());
        }

        sink.request_update(FramebufferUpdateRequest::full_screen(
            self.width,
            self.height,
            incremental,
        ))?;
        self.outstanding = true;
        self.requested += 1;
        Ok(())
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    pub fn requested(&self) -> u64 {
        self.requested
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Advisory rate since the initial request.
    pub fn updates_per_second(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.completed as f64 / elapsed
        } else {
            0.0
        }
    }
}
