pub mod canvas;
pub mod core;
pub mod recorder;
pub mod rfb;

use std::process::ExitCode;

use clap::Parser;

use crate::core::config::Cli;
use crate::core::logging::init_logging;

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let _guards = match init_logging(&cli.log_config()) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("vnc-recorder: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("vnc-recorder")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(target: "recorder", "Failed to start async runtime: {}", e);
            eprintln!("vnc-recorder: failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = cli.recorder_config();

    match runtime.block_on(recorder::run(&config)) {
        Ok(summary) => {
            tracing::info!(target: "recorder",
                "Recording saved to {:?} ({} frames, stopped by {})",
                summary.output, summary.frames_submitted, summary.stopped_by);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(target: "recorder", "Recording failed: {}", e);
            eprintln!("vnc-recorder: {}", e);
            ExitCode::FAILURE
        }
    }
}
