use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use super::logging::LogConfig;
use crate::recorder::shutdown::GraceIntervals;
use crate::recorder::RecorderConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "vnc-recorder",
    version,
    about = "Connect to a VNC server and record the screen to a video file"
)]
pub struct Cli {
    /// Encoder executable.
    #[arg(long, env = "VR_FFMPEG_BIN", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// VNC host to connect to.
    #[arg(long, env = "VR_VNC_HOST", default_value = "localhost")]
    pub host: String,

    /// VNC port.
    #[arg(long, env = "VR_VNC_PORT", default_value_t = 5900)]
    pub port: u16,

    /// Password for VNC authentication.
    #[arg(
        long,
        env = "VR_VNC_PASSWORD",
        default_value = "secret",
        hide_env_values = true,
        hide_default_value = true
    )]
    pub password: String,

    /// Frames per second sampled and encoded.
    #[arg(
        long,
        env = "VR_FRAMERATE",
        default_value_t = 30,
        value_parser = clap::value_parser!(u32).range(1..=240)
    )]
    pub framerate: u32,

    /// Output video file.
    #[arg(long, env = "VR_OUTFILE", default_value = "output.mp4")]
    pub outfile: PathBuf,

    /// Give up connecting after this many milliseconds.
    #[arg(long, env = "VR_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Time allowed for the last frames to reach the encoder on shutdown.
    #[arg(long, env = "VR_FRAME_DRAIN_MS", default_value_t = 1000)]
    pub frame_drain_ms: u64,

    /// Time allowed for the encoder to finish the file on shutdown.
    #[arg(long, env = "VR_FINALIZE_MS", default_value_t = 5000)]
    pub finalize_ms: u64,

    /// Finish the video even when the VNC session fails.
    #[arg(long, env = "VR_DRAIN_ON_ERROR", default_value_t = false)]
    pub drain_on_error: bool,

    /// Log filter used when RUST_LOG is unset (error, warn, info, debug, trace).
    #[arg(long, env = "VR_LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Also write daily-rolled log files to this directory.
    #[arg(long, env = "VR_LOG_DIR", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Write a JSON summary of the recording to this file.
    #[arg(long, env = "VR_SUMMARY_FILE", value_name = "PATH")]
    pub summary_file: Option<PathBuf>,
}

impl Cli {
    pub fn recorder_config(&self) -> RecorderConfig {
        RecorderConfig {
            ffmpeg: self.ffmpeg.clone(),
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            framerate: self.framerate,
            outfile: self.outfile.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            grace: GraceIntervals {
                frame_drain: Duration::from_millis(self.frame_drain_ms),
                finalize: Duration::from_millis(self.finalize_ms),
            },
            drain_on_error: self.drain_on_error,
            summary_file: self.summary_file.clone(),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            dir: self.log_dir.clone(),
        }
    }
}
