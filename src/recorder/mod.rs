//! Recording pipeline: session events in, paced frames out to the encoder.
//!
//! - The RFB session keeps the canvas current (`crate::rfb`)
//! - `FramePacer` samples the canvas at the configured frame rate
//! - `FfmpegSink` streams the samples into the encoder process
//! - `Dispatcher` drives update requests and waits for a signal or failure
//! - `ShutdownCoordinator` drains or aborts the pipeline exactly once

pub mod dispatcher;
pub mod errors;
pub mod ffmpeg;
pub mod pacer;
pub mod requester;
pub mod shutdown;
pub mod signals;
pub mod sink;
pub mod state;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::rfb::{self, Session};
use dispatcher::{DispatchOutcome, DispatchStats, Dispatched, Dispatcher};
use errors::{EncodingError, RecorderError};
use ffmpeg::{check_ffmpeg, EncoderCommand};
use pacer::{FramePacer, PacerStats};
use shutdown::{DrainReport, GraceIntervals, ShutdownCoordinator, ShutdownPhase};
use signals::ShutdownSignal;
use sink::FrameSink;
use state::{transition, DispatchEvent, DispatchState};
use writer::FfmpegSink;

/// Everything a recording run needs.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub ffmpeg: PathBuf,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub framerate: u32,
    pub outfile: PathBuf,
    pub connect_timeout: Duration,
    pub grace: GraceIntervals,
    /// Route session-fatal errors through the drain instead of aborting.
    pub drain_on_error: bool,
    pub summary_file: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            host: "localhost".to_string(),
            port: 5900,
            password: "secret".to_string(),
            framerate: 30,
            outfile: PathBuf::from("output.mp4"),
            connect_timeout: Duration::from_secs(5),
            grace: GraceIntervals::default(),
            drain_on_error: false,
            summary_file: None,
        }
    }
}

/// Outcome of a run that ended with a signal-driven drain.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub output: PathBuf,
    pub desktop_name: String,
    pub width: u16,
    pub height: u16,
    pub framerate: u32,
    pub stopped_by: ShutdownSignal,
    /// Framebuffer updates applied to the canvas.
    pub frames_published: u64,
    pub frames_submitted: u64,
    pub frames_written: Option<u64>,
    pub pacer: Option<PacerStats>,
    pub dispatch: DispatchStats,
    pub duration_ms: u64,
}

/// Records until INT, TERM, HUP or QUIT.
pub async fn run(config: &RecorderConfig) -> Result<RecordingSummary, RecorderError> {
    let signals = signals::listen().map_err(RecorderError::Signals)?;
    run_with_signals(config, signals).await
}

/// Records until a signal arrives on `signals`.
pub async fn run_with_signals(
    config: &RecorderConfig,
    signals: mpsc::Receiver<ShutdownSignal>,
) -> Result<RecordingSummary, RecorderError> {
    let started = Instant::now();

    check_ffmpeg(&config.ffmpeg)?;

    let stream = rfb::dial(&config.host, config.port, config.connect_timeout).await?;
    let (session, channels) = Session::start(stream, &config.password).await?;

    tracing::info!(target: "recorder",
        "[RECORDER] Recording {:?} ({}x{}) at {}fps to {:?}",
        session.desktop_name(), session.width(), session.height(), config.framerate, config.outfile);

    let sink = Arc::new(FfmpegSink::spawn(EncoderCommand {
        binary: config.ffmpeg.clone(),
        framerate: config.framerate,
        width: session.width(),
        height: session.height(),
        output: config.outfile.clone(),
    })?);

    let pacer = match FramePacer::new(session.canvas(), sink.clone(), config.framerate).spawn() {
        Ok(handle) => handle,
        Err(e) => {
            sink.abort();
            return Err(EncodingError::SpawnFailed(format!("pacer thread: {}", e)).into());
        }
    };

    let coordinator = Arc::new(ShutdownCoordinator::new(sink.clone(), pacer, config.grace));

    let dispatcher = Dispatcher::new(
        session.handle(),
        channels,
        signals,
        session.width(),
        session.height(),
    );
    let Dispatched {
        outcome,
        stats: dispatch,
        state,
    } = dispatcher.run().await;

    match outcome {
        DispatchOutcome::Drain(signal) => {
            let drained = drain(&coordinator).await;
            finish(state, coordinator.phase());
            let report = drained?;

            let summary = RecordingSummary {
                output: config.outfile.clone(),
                desktop_name: session.desktop_name().to_string(),
                width: session.width(),
                height: session.height(),
                framerate: config.framerate,
                stopped_by: signal,
                frames_published: session.canvas().generation(),
                frames_submitted: sink.frames_submitted(),
                frames_written: report.as_ref().map(|r| r.frames_written),
                pacer: report.and_then(|r| r.pacer),
                dispatch,
                duration_ms: started.elapsed().as_millis() as u64,
            };

            tracing::info!(target: "recorder",
                "[RECORDER] Finished: {} frames submitted, {} updates received",
                summary.frames_submitted, summary.dispatch.updates);

            if let Some(path) = &config.summary_file {
                write_summary(path, &summary)?;
            }

            Ok(summary)
        }
        DispatchOutcome::Abort(error) => {
            tracing::error!(target: "recorder", "[RECORDER] Session failed: {}", error);

            if config.drain_on_error {
                if let Err(e) = drain(&coordinator).await {
                    tracing::error!(target: "recorder", "[RECORDER] Drain after failure: {}", e);
                }
            } else {
                let c = Arc::clone(&coordinator);
                tokio::task::spawn_blocking(move || c.abort()).await?;
            }
            finish(state, coordinator.phase());

            Err(RecorderError::Session(error))
        }
    }
}

async fn drain(coordinator: &Arc<ShutdownCoordinator>) -> Result<Option<DrainReport>, RecorderError> {
    let c = Arc::clone(coordinator);
    let report = tokio::task::spawn_blocking(move || c.drain()).await??;
    Ok(report)
}

/// Feeds `Finished` once the drain or abort has returned.
fn finish(state: DispatchState, phase: ShutdownPhase) -> DispatchState {
    let (state, _) = transition(state, DispatchEvent::Finished);
    tracing::info!(target: "recorder", "[RECORDER] Pipeline {:?}, shutdown {:?}", state, phase);
    state
}

pub fn write_summary(path: &Path, summary: &RecordingSummary) -> Result<(), RecorderError> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| RecorderError::Summary(e.to_string()))?;
    std::fs::write(path, json)
        .map_err(|e| RecorderError::Summary(format!("{}: {}", path.display(), e)))?;
    tracing::info!(target: "recorder", "[RECORDER] Summary written to {:?}", path);
    Ok(())
}
