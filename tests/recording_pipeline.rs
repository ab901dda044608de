//! End-to-end tests for the recording pipeline.
//!
//! A stub RFB server on a local TCP port stands in for the VNC host and a
//! shell script stands in for ffmpeg (it copies its stdin to the output
//! file), so the whole pipeline runs without external tools.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use vnc_recorder_lib::recorder::errors::RecorderError;
use vnc_recorder_lib::recorder::signals::ShutdownSignal;
use vnc_recorder_lib::recorder::{run_with_signals, RecorderConfig};
use vnc_recorder_lib::rfb::auth::vnc_auth_response;
use vnc_recorder_lib::rfb::{NegotiationError, PixelFormat, SessionError};

const PASSWORD: &str = "secret";

// =============================================================================
// Fake encoder
// =============================================================================

fn fake_encoder(dir: &Path) -> PathBuf {
    let path = dir.join("fake-ffmpeg");
    let script = "#!/bin/sh\n\
        if [ \"$1\" = \"-version\" ]; then echo 'fake ffmpeg'; exit 0; fi\n\
        for last; do :; done\n\
        cat > \"$last\"\n";
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// =============================================================================
// Stub RFB server
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Answer the first request with a full frame, then stay silent.
    Static,
    /// Answer every request with a small update after `delay`.
    Responsive { delay: Duration },
    /// Answer the first request with a full frame that also carries
    /// zero-width Raw and CopyRect rectangles, then stay silent.
    EmptyRects,
    /// Send an unknown message type `after` the handshake.
    FailAfter { after: Duration },
    /// Reject the password.
    RejectAuth,
}

#[derive(Debug, Default)]
struct ServerStats {
    requests: u64,
    incremental_requests: u64,
    overlapping_requests: u64,
    updates_sent: u64,
}

#[derive(Debug)]
enum ClientMsg {
    SetPixelFormat,
    SetEncodings(Vec<i32>),
    UpdateRequest { incremental: bool },
}

async fn read_client_message(reader: &mut OwnedReadHalf) -> std::io::Result<ClientMsg> {
    match reader.read_u8().await? {
        0 => {
            let mut rest = [0u8; 19];
            reader.read_exact(&mut rest).await?;
            Ok(ClientMsg::SetPixelFormat)
        }
        2 => {
            reader.read_u8().await?;
            let count = reader.read_u16().await?;
            let mut encodings = Vec::new();
            for _ in 0..count {
                encodings.push(reader.read_i32().await?);
            }
            Ok(ClientMsg::SetEncodings(encodings))
        }
        3 => {
            let incremental = reader.read_u8().await? != 0;
            let mut rect = [0u8; 8];
            reader.read_exact(&mut rect).await?;
            Ok(ClientMsg::UpdateRequest { incremental })
        }
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected client message {}", other),
        )),
    }
}

fn raw_update(x: u16, y: u16, width: u16, height: u16, fill: u8) -> Vec<u8> {
    let mut buf = vec![0u8, 0, 0, 1];
    for v in [x, y, width, height] {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf.extend_from_slice(&0i32.to_be_bytes());
    buf.extend(std::iter::repeat(fill).take(width as usize * height as usize * 4));
    buf
}

/// Full-screen Raw update preceded by a zero-width Raw and a zero-width CopyRect.
fn update_with_empty_rects(width: u16, height: u16, fill: u8) -> Vec<u8> {
    let mut buf = vec![0u8, 0, 0, 3];
    for v in [0u16, 0, 0, height] {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf.extend_from_slice(&0i32.to_be_bytes());
    for v in [1u16, 0, 0, 1] {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf.extend_from_slice(&1i32.to_be_bytes());
    buf.extend_from_slice(&[0, 0, 0, 0]);
    buf.extend_from_slice(&raw_update(0, 0, width, height, fill)[4..]);
    buf
}

struct StubServer {
    port: u16,
    stats: Arc<Mutex<ServerStats>>,
    task: tokio::task::JoinHandle<()>,
}

async fn start_server(width: u16, height: u16, behavior: Behavior) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let stats = Arc::new(Mutex::new(ServerStats::default()));
    let server_stats = Arc::clone(&stats);

    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        // Version 3.8, VNC authentication only
        writer.write_all(b"RFB 003.008\n").await.unwrap();
        let mut banner = [0u8; 12];
        reader.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"RFB 003.008\n");
        writer.write_all(&[1, 2]).await.unwrap();
        assert_eq!(reader.read_u8().await.unwrap(), 2);

        let challenge: [u8; 16] = std::array::from_fn(|i| (i as u8).wrapping_mul(37));
        writer.write_all(&challenge).await.unwrap();
        let mut response = [0u8; 16];
        reader.read_exact(&mut response).await.unwrap();

        let accepted = !matches!(behavior, Behavior::RejectAuth)
            && response == vnc_auth_response(PASSWORD, &challenge);
        if !accepted {
            let reason = b"Authentication failed";
            writer.write_all(&1u32.to_be_bytes()).await.unwrap();
            writer
                .write_all(&(reason.len() as u32).to_be_bytes())
                .await
                .unwrap();
            writer.write_all(reason).await.unwrap();
            return;
        }
        writer.write_all(&0u32.to_be_bytes()).await.unwrap();

        // ClientInit / ServerInit
        reader.read_u8().await.unwrap();
        let name = b"stub desktop";
        let mut init = Vec::new();
        init.extend_from_slice(&width.to_be_bytes());
        init.extend_from_slice(&height.to_be_bytes());
        init.extend_from_slice(&PixelFormat::BGR0.to_bytes());
        init.extend_from_slice(&(name.len() as u32).to_be_bytes());
        init.extend_from_slice(name);
        writer.write_all(&init).await.unwrap();

        // Parse client messages on their own task so the server can look
        // for requests that arrive while an update is still pending
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(msg) = read_client_message(&mut reader).await {
                if msg_tx.send(msg).is_err() {
                    break;
                }
            }
        });

        if let Behavior::FailAfter { after } = behavior {
            tokio::time::sleep(after).await;
            let _ = writer.write_all(&[200]).await;
            // Keep the socket open until the client goes away
            while msg_rx.recv().await.is_some() {}
            return;
        }

        while let Some(msg) = msg_rx.recv().await {
            let incremental = match msg {
                ClientMsg::UpdateRequest { incremental } => incremental,
                ClientMsg::SetPixelFormat | ClientMsg::SetEncodings(_) => continue,
            };

            {
                let mut s = server_stats.lock().await;
                s.requests += 1;
                if incremental {
                    s.incremental_requests += 1;
                }
            }

            let update = match behavior {
                Behavior::Static if !incremental => raw_update(0, 0, width, height, 0x40),
                Behavior::Static => continue,
                Behavior::EmptyRects if !incremental => update_with_empty_rects(width, height, 0x20),
                Behavior::EmptyRects => continue,
                Behavior::Responsive { delay } => {
                    tokio::time::sleep(delay).await;
                    raw_update(0, 0, 1, 1, 0x80)
                }
                Behavior::FailAfter { .. } | Behavior::RejectAuth => unreachable!(),
            };

            // Anything queued now was sent before its predecessor was answered
            while let Ok(early) = msg_rx.try_recv() {
                if matches!(early, ClientMsg::UpdateRequest { .. }) {
                    server_stats.lock().await.overlapping_requests += 1;
                }
            }

            if writer.write_all(&update).await.is_err() {
                break;
            }
            server_stats.lock().await.updates_sent += 1;
        }
    });

    StubServer { port, stats, task }
}

fn config(dir: &Path, port: u16) -> RecorderConfig {
    RecorderConfig {
        ffmpeg: fake_encoder(dir),
        host: "127.0.0.1".to_string(),
        port,
        password: PASSWORD.to_string(),
        framerate: 30,
        outfile: dir.join("out.raw"),
        summary_file: Some(dir.join("summary.json")),
        ..RecorderConfig::default()
    }
}

// =============================================================================
// Signal-driven shutdown
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_static_canvas_is_recorded_at_fixed_rate() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(100, 100, Behavior::Static).await;
    let config = config(dir.path(), server.port);
    let (signal_tx, signal_rx) = mpsc::channel(4);

    let run = tokio::spawn(async move { run_with_signals(&config, signal_rx).await });

    tokio::time::sleep(Duration::from_secs(2)).await;
    signal_tx.send(ShutdownSignal::Interrupt).await.unwrap();

    let summary = run.await.unwrap().unwrap();

    assert!(
        (55..=65).contains(&summary.frames_submitted),
        "Expected about 60 frames, got {}",
        summary.frames_submitted
    );
    assert_eq!(summary.frames_written, Some(summary.frames_submitted));
    assert_eq!(summary.stopped_by, ShutdownSignal::Interrupt);
    assert_eq!((summary.width, summary.height), (100, 100));
    assert_eq!(summary.desktop_name, "stub desktop");
    assert_eq!(summary.frames_published, 1);

    let output = std::fs::read(dir.path().join("out.raw")).unwrap();
    assert_eq!(output.len() as u64, summary.frames_submitted * 100 * 100 * 4);

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("summary.json")).unwrap())
            .unwrap();
    assert_eq!(written["framesSubmitted"], summary.frames_submitted);
    assert_eq!(written["framesPublished"], 1);

    let stats = server.stats.lock().await;
    assert_eq!(stats.updates_sent, 1);
    assert_eq!(stats.incremental_requests, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_requests_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(
        64,
        48,
        Behavior::Responsive {
            delay: Duration::from_millis(10),
        },
    )
    .await;
    let config = config(dir.path(), server.port);
    let (signal_tx, signal_rx) = mpsc::channel(4);

    let run = tokio::spawn(async move { run_with_signals(&config, signal_rx).await });

    tokio::time::sleep(Duration::from_secs(1)).await;
    signal_tx.send(ShutdownSignal::Terminate).await.unwrap();

    let summary = run.await.unwrap().unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), server.task).await;
    let stats = server.stats.lock().await;

    assert_eq!(stats.overlapping_requests, 0);
    assert!(
        (50..=101).contains(&stats.incremental_requests),
        "Expected about 100 follow-up requests, got {}",
        stats.incremental_requests
    );
    assert!(summary.dispatch.updates >= stats.updates_sent.saturating_sub(1));
    assert_eq!(summary.dispatch.requests, stats.requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_width_rectangles_keep_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(16, 16, Behavior::EmptyRects).await;
    let config = config(dir.path(), server.port);
    let (signal_tx, signal_rx) = mpsc::channel(4);

    let run = tokio::spawn(async move { run_with_signals(&config, signal_rx).await });

    tokio::time::sleep(Duration::from_millis(500)).await;
    signal_tx.send(ShutdownSignal::Interrupt).await.unwrap();

    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.frames_published, 1);
    assert_eq!(summary.dispatch.updates, 1);
    assert!(summary.frames_submitted > 0);

    // The last sampled frame is the one the update painted
    let output = std::fs::read(dir.path().join("out.raw")).unwrap();
    let frame_len = 16 * 16 * 4;
    assert_eq!(output.len() % frame_len, 0);
    assert!(output[output.len() - frame_len..].iter().all(|&b| b == 0x20));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_signals_drain_once() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(32, 32, Behavior::Static).await;
    let config = config(dir.path(), server.port);
    let (signal_tx, signal_rx) = mpsc::channel(4);

    let run = tokio::spawn(async move { run_with_signals(&config, signal_rx).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    signal_tx.send(ShutdownSignal::Interrupt).await.unwrap();
    signal_tx.send(ShutdownSignal::Terminate).await.unwrap();

    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.stopped_by, ShutdownSignal::Interrupt);
    assert_eq!(summary.frames_written, Some(summary.frames_submitted));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_failure_aborts_without_drain() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(
        50,
        50,
        Behavior::FailAfter {
            after: Duration::from_millis(500),
        },
    )
    .await;
    let config = config(dir.path(), server.port);
    let (_signal_tx, signal_rx) = mpsc::channel(4);

    let started = Instant::now();
    let err = run_with_signals(&config, signal_rx).await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(
        matches!(err, RecorderError::Session(SessionError::UnknownMessage(200))),
        "Unexpected error: {:?}",
        err
    );
    // Aborted: partial output removed, no summary
    assert!(!dir.path().join("out.raw").exists());
    assert!(!dir.path().join("summary.json").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_failure_can_drain() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(
        50,
        50,
        Behavior::FailAfter {
            after: Duration::from_millis(300),
        },
    )
    .await;
    let config = RecorderConfig {
        drain_on_error: true,
        ..config(dir.path(), server.port)
    };
    let (_signal_tx, signal_rx) = mpsc::channel(4);

    let err = run_with_signals(&config, signal_rx).await.unwrap_err();

    assert!(matches!(err, RecorderError::Session(_)));
    let output = std::fs::read(dir.path().join("out.raw")).unwrap();
    assert!(!output.is_empty());
    assert_eq!(output.len() % (50 * 50 * 4), 0);
}

#[tokio::test]
async fn test_connection_refused() {
    let dir = tempfile::tempdir().unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (_signal_tx, signal_rx) = mpsc::channel(1);

    let err = run_with_signals(&config(dir.path(), port), signal_rx)
        .await
        .unwrap_err();

    assert!(matches!(err, RecorderError::Connection(_)), "Unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_wrong_password_fails_negotiation() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(10, 10, Behavior::RejectAuth).await;
    let (_signal_tx, signal_rx) = mpsc::channel(1);

    let err = run_with_signals(&config(dir.path(), server.port), signal_rx)
        .await
        .unwrap_err();

    assert!(
        matches!(
            err,
            RecorderError::Negotiation(NegotiationError::AuthenticationFailed(ref reason))
                if reason == "Authentication failed"
        ),
        "Unexpected error: {:?}",
        err
    );
}
