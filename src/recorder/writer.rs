use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use super::errors::EncodingError;
use super::ffmpeg::EncoderCommand;
use super::sink::{EncoderOutcome, FrameSink};
use crate::canvas::FrameSample;

/// Frames buffered between the pacer and the writer thread.
const FRAME_CHANNEL_CAPACITY: usize = 30;
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Lines of encoder stderr kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// RAII guard ensuring encoder cleanup and partial file deletion on abnormal exit.
///
/// On drop, if not marked as completed:
/// 1. Kills the encoder process
/// 2. Deletes the partial output file
pub struct WriterGuard {
    child: Option<Child>,
    output_path: PathBuf,
    completed: bool,
}

impl WriterGuard {
    pub fn new(child: Child, output_path: PathBuf) -> Self {
        Self {
            child: Some(child),
            output_path,
            completed: false,
        }
    }

    /// Prevents cleanup on drop. Call after the encoder exits successfully.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    /// Takes ownership of the child for `wait()`. Drop will not kill after this.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        tracing::warn!(target: "encoder", "[WRITER] WriterGuard dropping without completion, cleaning up...");

        if let Some(mut child) = self.child.take() {
            tracing::info!(target: "encoder", "[WRITER] Killing encoder process");
            if let Err(e) = child.kill() {
                tracing::warn!(target: "encoder", "[WRITER] Failed to kill encoder: {}", e);
            }
            let _ = child.wait();
        }

        if self.output_path.exists() {
            tracing::info!(target: "encoder", "[WRITER] Deleting partial file: {:?}", self.output_path);
            if let Err(e) = std::fs::remove_file(&self.output_path) {
                tracing::warn!(target: "encoder", "[WRITER] Failed to delete partial file: {}", e);
            }
        }
    }
}

enum WriterMessage {
    Frame(FrameSample),
    EndOfStream,
}

/// Result from the writer thread.
#[derive(Debug)]
struct WriterResult {
    frame_count: u64,
}

/// Encoder sink backed by an ffmpeg child process.
///
/// Frames travel over a bounded channel to a dedicated writer thread that
/// owns the process and its stdin.
pub struct FfmpegSink {
    accepting: AtomicBool,
    aborted: Arc<AtomicBool>,
    submitted: AtomicU64,
    frame_tx: Mutex<Option<Sender<WriterMessage>>>,
    result_rx: Receiver<Result<WriterResult, EncodingError>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FfmpegSink {
    /// Starts the encoder process and its writer thread.
    pub fn spawn(command: EncoderCommand) -> Result<Self, EncodingError> {
        let args = command.args();
        tracing::info!(target: "encoder",
            "[WRITER] Starting encoder: {}x{} @ {}fps -> {:?}",
            command.width, command.height, command.framerate, command.output);
        tracing::debug!(target: "encoder", "[WRITER] Encoder args: {:?}", args);

        let child = Command::new(&command.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncodingError::SpawnFailed(format!("{:?}: {}", command.binary, e)))?;

        let guard = WriterGuard::new(child, command.output.clone());
        let (frame_tx, frame_rx) = bounded::<WriterMessage>(FRAME_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = bounded(1);
        let aborted = Arc::new(AtomicBool::new(false));
        let aborted_writer = Arc::clone(&aborted);

        let writer_handle = std::thread::Builder::new()
            .name("encoder-writer".to_string())
            .spawn(move || {
                let result = run_writer(guard, &command, frame_rx, &aborted_writer);
                match &result {
                    Ok(r) => tracing::info!(target: "encoder",
                        "[WRITER] Encoder complete, {} frames written", r.frame_count),
                    Err(e) => tracing::error!(target: "encoder", "[WRITER] Encoder failed: {}", e),
                }
                let _ = result_tx.send(result);
            })
            .map_err(|e| EncodingError::SpawnFailed(format!("writer thread: {}", e)))?;

        Ok(Self {
            accepting: AtomicBool::new(true),
            aborted,
            submitted: AtomicU64::new(0),
            frame_tx: Mutex::new(Some(frame_tx)),
            result_rx,
            writer_handle: Mutex::new(Some(writer_handle)),
        })
    }

    /// Frames handed to the writer thread so far.
    pub fn frames_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn sender(&self) -> Option<Sender<WriterMessage>> {
        self.frame_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn join_writer(&self) {
        let handle = self
            .writer_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            tracing::debug!(target: "encoder", "[WRITER] Waiting for writer thread...");
            let _ = handle.join();
        }
    }
}

fn send_message(sender: &Sender<WriterMessage>, msg: WriterMessage) -> Result<(), EncodingError> {
    match sender.send_timeout(msg, SEND_TIMEOUT) {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(_)) => Err(EncodingError::WriterStalled),
        Err(SendTimeoutError::Disconnected(_)) => Err(EncodingError::WriterDisconnected),
    }
}

impl FrameSink for FfmpegSink {
    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn stop_accepting(&self) {
        tracing::info!(target: "encoder", "[WRITER] No longer accepting frames");
        self.accepting.store(false, Ordering::Release);
    }

    fn submit(&self, frame: FrameSample) -> Result<(), EncodingError> {
        let sender = self.sender().ok_or(EncodingError::InputClosed)?;
        send_message(&sender, WriterMessage::Frame(frame))?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> Result<(), EncodingError> {
        let sender = self
            .frame_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EncodingError::InputClosed)?;

        tracing::info!(target: "encoder", "[WRITER] Closing encoder input");
        send_message(&sender, WriterMessage::EndOfStream)
    }

    fn wait_finished(&self, timeout: Duration) -> Result<EncoderOutcome, EncodingError> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => {
                self.join_writer();
                result.map(|r| EncoderOutcome {
                    frames_written: r.frame_count,
                })
            }
            Err(RecvTimeoutError::Timeout) => Err(EncodingError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(EncodingError::WriterDisconnected),
        }
    }

    fn abort(&self) {
        tracing::warn!(target: "encoder", "[WRITER] Aborting encoder");
        self.accepting.store(false, Ordering::Release);
        self.aborted.store(true, Ordering::Release);
        self.frame_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn run_writer(
    mut guard: WriterGuard,
    command: &EncoderCommand,
    frame_rx: Receiver<WriterMessage>,
    aborted: &AtomicBool,
) -> Result<WriterResult, EncodingError> {
    let mut stdin = guard
        .child_mut()
        .and_then(|c| c.stdin.take())
        .ok_or_else(|| EncodingError::WriteFailed("Failed to capture encoder stdin".to_string()))?;

    let stderr_tail = guard
        .child_mut()
        .and_then(|c| c.stderr.take())
        .and_then(spawn_stderr_drain);

    let expected_size = command.frame_len();
    let mut frame_count: u64 = 0;

    loop {
        match frame_rx.recv() {
            Ok(WriterMessage::Frame(frame)) => {
                if frame.pixels().len() != expected_size {
                    tracing::warn!(target: "encoder",
                        "[WRITER] Frame size mismatch: expected {}, got {}",
                        expected_size, frame.pixels().len());
                    continue;
                }

                if let Err(e) = stdin.write_all(frame.pixels()) {
                    return Err(EncodingError::WriteFailed(format!(
                        "Failed to write frame {}: {}",
                        frame_count, e
                    )));
                }

                frame_count += 1;

                if frame_count % 300 == 0 {
                    tracing::debug!(target: "encoder", "[WRITER] Written {} frames", frame_count);
                }
            }
            Ok(WriterMessage::EndOfStream) => {
                tracing::info!(target: "encoder", "[WRITER] EndOfStream received, finalizing...");
                break;
            }
            Err(_) => {
                if aborted.load(Ordering::Acquire) {
                    return Err(EncodingError::Aborted);
                }
                tracing::warn!(target: "encoder", "[WRITER] Channel closed, finalizing...");
                break;
            }
        }
    }

    if let Err(e) = stdin.flush() {
        tracing::warn!(target: "encoder", "[WRITER] Flushing encoder input failed: {}", e);
    }
    drop(stdin);

    tracing::debug!(target: "encoder", "[WRITER] Waiting for encoder to finish...");

    let mut child = guard
        .take_child()
        .ok_or_else(|| EncodingError::WriteFailed("Encoder child already taken".to_string()))?;

    let status = child
        .wait()
        .map_err(|e| EncodingError::WriteFailed(format!("Encoder wait failed: {}", e)))?;

    let stderr = stderr_tail
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    if !status.success() {
        let exit_code = status.code().unwrap_or(-1);
        return Err(EncodingError::ProcessFailed { exit_code, stderr });
    }

    guard.mark_completed();

    Ok(WriterResult { frame_count })
}

/// Forwards encoder stderr to the log and keeps the last lines for errors.
fn spawn_stderr_drain(stderr: ChildStderr) -> Option<JoinHandle<String>> {
    std::thread::Builder::new()
        .name("encoder-stderr".to_string())
        .spawn(move || {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                tracing::debug!(target: "encoder", "[FFMPEG] {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
        .map_err(|e| {
            tracing::warn!(target: "encoder", "[WRITER] Could not start stderr reader: {}", e);
        })
        .ok()
}
