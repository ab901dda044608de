use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::errors::EncodingError;

pub const ENCODING_CRF: &str = "23";
pub const ENCODING_PRESET: &str = "medium";

/// Raw pixel format of every frame written to the encoder. Matches the
/// layout the RFB session negotiates.
pub const INPUT_PIXEL_FORMAT: &str = "bgr0";

/// Verifies the encoder binary can be executed.
pub fn check_ffmpeg(binary: &Path) -> Result<(), EncodingError> {
    let status = Command::new(binary)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| EncodingError::EncoderNotFound {
            path: binary.to_path_buf(),
            reason: match e.kind() {
                ErrorKind::NotFound => "no such executable".to_string(),
                ErrorKind::PermissionDenied => "permission denied".to_string(),
                _ => e.to_string(),
            },
        })?;

    if !status.success() {
        return Err(EncodingError::EncoderNotFound {
            path: binary.to_path_buf(),
            reason: format!("`-version` exited with {}", status),
        });
    }

    Ok(())
}

/// Everything needed to start the encoder for one recording.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub binary: PathBuf,
    pub framerate: u32,
    pub width: u16,
    pub height: u16,
    pub output: PathBuf,
}

impl EncoderCommand {
    /// Size of one input frame in bytes.
    pub fn frame_len(&self) -> usize {
        crate::canvas::frame_len(self.width, self.height)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostats".into(),
            "-loglevel".into(),
            "warning".into(),
        ];

        args.extend([
            "-f".to_string(), "rawvideo".to_string(),
            "-pixel_format".to_string(), INPUT_PIXEL_FORMAT.to_string(),
            "-video_size".to_string(), format!("{}x{}", self.width, self.height),
            "-framerate".to_string(), self.framerate.to_string(),
            "-i".to_string(), "pipe:0".to_string(),
        ]);

        // no audio
        args.push("-an".to_string());

        // yuv420p needs even dimensions
        if self.width % 2 != 0 || self.height % 2 != 0 {
            args.extend([
                "-vf".to_string(),
                "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string(),
            ]);
        }

        args.extend([
            "-c:v".to_string(), "libx264".to_string(),
            "-pix_fmt".to_string(), "yuv420p".to_string(),
            "-crf".to_string(), ENCODING_CRF.to_string(),
            "-preset".to_string(), ENCODING_PRESET.to_string(),
            "-movflags".to_string(), "+faststart".to_string(),
            "-y".to_string(),
            self.output.to_string_lossy().to_string(),
        ]);

        args
    }
}
