use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::errors::EncodingError;
use super::pacer::{PacerHandle, PacerStats};
use super::sink::FrameSink;

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

/// Upper bounds for each drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceIntervals {
    /// How long the pacer has to notice the cleared flag.
    pub frame_drain: Duration,
    /// How long the encoder has to finish the file after end of input.
    pub finalize: Duration,
}

impl Default for GraceIntervals {
    fn default() -> Self {
        Self {
            frame_drain: Duration::from_secs(1),
            finalize: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Closed,
}

/// What a completed drain observed.
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    /// `None` if the pacer did not stop within the frame-drain interval.
    pub pacer: Option<PacerStats>,
    pub frames_written: u64,
    pub drain_ms: u64,
}

/// Runs the drain sequence at most once.
///
/// Order: stop accepting, join the pacer, close the encoder input, wait for
/// the encoder. The first caller of `drain` or `abort` wins; later calls
/// return without touching the sink.
pub struct ShutdownCoordinator {
    sink: Arc<dyn FrameSink>,
    pacer: Mutex<Option<PacerHandle>>,
    phase: AtomicU8,
    grace: GraceIntervals,
}

impl ShutdownCoordinator {
    pub fn new(sink: Arc<dyn FrameSink>, pacer: PacerHandle, grace: GraceIntervals) -> Self {
        Self {
            sink,
            pacer: Mutex::new(Some(pacer)),
            phase: AtomicU8::new(RUNNING),
            grace,
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        match self.phase.load(Ordering::Acquire) {
            RUNNING => ShutdownPhase::Running,
            DRAINING => ShutdownPhase::Draining,
            _ => ShutdownPhase::Closed,
        }
    }

    fn begin(&self, next: u8) -> bool {
        self.phase
            .compare_exchange(RUNNING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn join_pacer(&self) -> Option<PacerStats> {
        let handle = self
            .pacer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        handle.and_then(|mut h| h.wait(self.grace.frame_drain))
    }

    /// Graceful drain. Returns `Ok(None)` if shutdown already started.
    pub fn drain(&self) -> Result<Option<DrainReport>, EncodingError> {
        if !self.begin(DRAINING) {
            tracing::debug!(target: "recorder", "[SHUTDOWN] Already shutting down, ignoring drain");
            return Ok(None);
        }

        let started = Instant::now();
        tracing::info!(target: "recorder", "[SHUTDOWN] Draining");

        self.sink.stop_accepting();

        let pacer = self.join_pacer();
        if let Some(stats) = &pacer {
            tracing::info!(target: "recorder", "[SHUTDOWN] Pacer stopped after {} ticks", stats.ticks);
        }

        let result = self
            .sink
            .close()
            .and_then(|()| self.sink.wait_finished(self.grace.finalize));

        self.phase.store(CLOSED, Ordering::Release);

        let outcome = result.map_err(|e| {
            tracing::error!(target: "recorder", "[SHUTDOWN] Encoder did not finish cleanly: {}", e);
            e
        })?;

        let report = DrainReport {
            pacer,
            frames_written: outcome.frames_written,
            drain_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(target: "recorder",
            "[SHUTDOWN] Drain complete: {} frames written in {}ms",
            report.frames_written, report.drain_ms);

        Ok(Some(report))
    }

    /// Fatal path: skip the drain, discard the encoder output.
    /// Returns false if shutdown already started.
    pub fn abort(&self) -> bool {
        if !self.begin(CLOSED) {
            tracing::debug!(target: "recorder", "[SHUTDOWN] Already shutting down, ignoring abort");
            return false;
        }

        tracing::warn!(target: "recorder", "[SHUTDOWN] Aborting without drain");

        self.sink.abort();
        self.join_pacer();

        // Gives the writer a chance to kill the encoder and remove the file
        match self.sink.wait_finished(self.grace.finalize) {
            Err(EncodingError::Aborted) => {}
            Ok(outcome) => tracing::debug!(target: "recorder",
                "[SHUTDOWN] Encoder finished during abort ({} frames)", outcome.frames_written),
            Err(e) => tracing::warn!(target: "recorder", "[SHUTDOWN] Encoder cleanup: {}", e),
        }

        true
    }
}
