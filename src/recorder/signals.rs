use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

/// Operating-system request to stop recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// Installs handlers for INT, TERM, HUP and QUIT and forwards every delivery
/// on the returned channel. Must be called from within a tokio runtime.
#[cfg(unix)]
pub fn listen() -> std::io::Result<mpsc::Receiver<ShutdownSignal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = sigint.recv() => ShutdownSignal::Interrupt,
                _ = sigterm.recv() => ShutdownSignal::Terminate,
                _ = sighup.recv() => ShutdownSignal::Hangup,
                _ = sigquit.recv() => ShutdownSignal::Quit,
            };
            tracing::info!(target: "recorder", "[SIGNAL] Received {}", received);
            if tx.send(received).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(not(unix))]
pub fn listen() -> std::io::Result<mpsc::Receiver<ShutdownSignal>> {
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "recorder", "[SIGNAL] Received Ctrl-C");
            if tx.send(ShutdownSignal::Interrupt).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}
