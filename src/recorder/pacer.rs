use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::Serialize;

use super::sink::FrameSink;
use crate::canvas::Canvas;

/// Counters reported when the pacer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PacerStats {
    pub ticks: u64,
    pub failed_submissions: u64,
}

/// Samples the canvas at a fixed rate and feeds the sink.
///
/// Each tick takes a snapshot and submits it, then sleeps for whatever is
/// left of the period. A tick that overruns its period is followed
/// immediately by the next one.
pub struct FramePacer {
    canvas: Arc<Canvas>,
    sink: Arc<dyn FrameSink>,
    period: Duration,
}

impl FramePacer {
    pub fn new(canvas: Arc<Canvas>, sink: Arc<dyn FrameSink>, framerate: u32) -> Self {
        let period = Duration::from_nanos(1_000_000_000 / u64::from(framerate.max(1)));
        Self {
            canvas,
            sink,
            period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Runs until the sink stops accepting frames.
    pub fn run(&self) -> PacerStats {
        let mut stats = PacerStats::default();

        tracing::info!(target: "recorder", "[PACER] Started with period {:?}", self.period);

        while self.sink.is_accepting() {
            let tick_start = Instant::now();

            let frame = self.canvas.snapshot();
            if let Err(e) = self.sink.submit(frame) {
                stats.failed_submissions += 1;
                tracing::warn!(target: "recorder", "[PACER] Frame submission failed: {}", e);
            }
            stats.ticks += 1;

            if stats.ticks % 300 == 0 {
                tracing::debug!(target: "recorder", "[PACER] {} frames submitted", stats.ticks);
            }

            if let Some(remaining) = self.period.checked_sub(tick_start.elapsed()) {
                std::thread::sleep(remaining);
            }
        }

        tracing::info!(target: "recorder",
            "[PACER] Stopped after {} ticks ({} failed)", stats.ticks, stats.failed_submissions);

        stats
    }

    /// Runs the pacer on its own thread.
    pub fn spawn(self) -> std::io::Result<PacerHandle> {
        let (done_tx, done_rx) = bounded(1);

        let join = std::thread::Builder::new()
            .name("frame-pacer".to_string())
            .spawn(move || {
                let stats = self.run();
                let _ = done_tx.send(stats);
            })?;

        Ok(PacerHandle {
            done_rx,
            join: Some(join),
        })
    }
}

/// Join handle for a spawned pacer.
pub struct PacerHandle {
    done_rx: Receiver<PacerStats>,
    join: Option<JoinHandle<()>>,
}

impl PacerHandle {
    /// Waits up to `timeout` for the pacer to observe the cleared flag.
    /// Returns `None` if it did not stop in time.
    pub fn wait(&mut self, timeout: Duration) -> Option<PacerStats> {
        match self.done_rx.recv_timeout(timeout) {
            Ok(stats) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
                Some(stats)
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(target: "recorder", "[PACER] Did not stop within {:?}", timeout);
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!(target: "recorder", "[PACER] Thread exited without reporting");
                self.join.take();
                None
            }
        }
    }
}
