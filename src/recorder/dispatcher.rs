use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::mpsc;

use super::requester::UpdateRequester;
use super::signals::ShutdownSignal;
use super::state::{transition, DispatchEvent, DispatchState, SideEffect};
use crate::rfb::{ServerMessage, SessionChannels, SessionError, UpdateRequestSink};

/// Shutdown path chosen by the state machine's last effect.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// `BeginDrain`: a termination signal arrived.
    Drain(ShutdownSignal),
    /// `Abort`: the session failed.
    Abort(SessionError),
}

/// What the control loop hands back to the pipeline.
///
/// `state` is `ShuttingDown` or `Aborted`; the caller feeds
/// `DispatchEvent::Finished` once the chosen path has completed.
#[derive(Debug)]
pub struct Dispatched {
    pub outcome: DispatchOutcome,
    pub stats: DispatchStats,
    pub state: DispatchState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub updates: u64,
    pub requests: u64,
    pub client_messages: u64,
    pub server_messages: u64,
    pub updates_per_second: f64,
}

/// Top-level control loop over the session channels and OS signals.
pub struct Dispatcher<S> {
    requests: S,
    channels: SessionChannels,
    signals: mpsc::Receiver<ShutdownSignal>,
    requester: UpdateRequester,
    state: DispatchState,
    failure: Option<SessionError>,
    exit: Option<DispatchOutcome>,
    client_messages: u64,
    server_messages: u64,
}

impl<S: UpdateRequestSink> Dispatcher<S> {
    pub fn new(
        requests: S,
        channels: SessionChannels,
        signals: mpsc::Receiver<ShutdownSignal>,
        width: u16,
        height: u16,
    ) -> Self {
        Self {
            requests,
            channels,
            signals,
            requester: UpdateRequester::new(width, height),
            state: DispatchState::Connected,
            failure: None,
            exit: None,
            client_messages: 0,
            server_messages: 0,
        }
    }

    /// Requests the first update, then runs until a signal or a fatal error.
    pub async fn run(mut self) -> Dispatched {
        tracing::info!(target: "recorder", "[DISPATCH] Starting event loop");

        self.apply(DispatchEvent::Started);

        let outcome = loop {
            if let Some(outcome) = self.exit.take() {
                break outcome;
            }

            let event = tokio::select! {
                Some(error) = self.channels.error_rx.recv() => {
                    Some(self.fail(error))
                }
                Some(message) = self.channels.client_rx.recv() => {
                    self.client_messages += 1;
                    tracing::debug!(target: "recorder", "[DISPATCH] Client message: {}", message);
                    None
                }
                message = self.channels.server_rx.recv() => match message {
                    Some(ServerMessage::FramebufferUpdate { rectangles }) => {
                        self.server_messages += 1;
                        tracing::trace!(target: "recorder",
                            "[DISPATCH] Framebuffer update with {} rectangles", rectangles);
                        Some(DispatchEvent::UpdateCompleted)
                    }
                    Some(other) => {
                        self.server_messages += 1;
                        tracing::debug!(target: "recorder", "[DISPATCH] Server message: {}", other);
                        None
                    }
                    None => {
                        // The reader reports its error before closing the channel
                        let error = self
                            .channels
                            .error_rx
                            .try_recv()
                            .unwrap_or(SessionError::ConnectionClosed);
                        Some(self.fail(error))
                    }
                },
                Some(signal) = self.signals.recv() => {
                    tracing::info!(target: "recorder", "[DISPATCH] Received {}, shutting down", signal);
                    Some(DispatchEvent::SignalReceived { signal })
                }
            };

            if let Some(event) = event {
                self.apply(event);
            }
        };

        let stats = DispatchStats {
            updates: self.requester.completed(),
            requests: self.requester.requested(),
            client_messages: self.client_messages,
            server_messages: self.server_messages,
            updates_per_second: self.requester.updates_per_second(),
        };

        tracing::info!(target: "recorder",
            "[DISPATCH] Event loop finished: {:?}, {} updates", outcome, stats.updates);

        Dispatched {
            outcome,
            stats,
            state: self.state,
        }
    }

    fn fail(&mut self, error: SessionError) -> DispatchEvent {
        let event = DispatchEvent::SessionFailed {
            error: error.to_string(),
        };
        self.failure.get_or_insert(error);
        event
    }

    fn apply(&mut self, event: DispatchEvent) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let (state, effects) = transition(std::mem::take(&mut self.state), event);
            self.state = state;

            for effect in effects {
                if let Err(e) = self.execute(effect) {
                    pending.push_back(self.fail(e));
                }
            }
        }
    }

    fn execute(&mut self, effect: SideEffect) -> Result<(), SessionError> {
        match effect {
            SideEffect::RequestInitialUpdate => self.requester.request_initial(&self.requests),
            SideEffect::RequestNextUpdate => self.requester.on_update_complete(&self.requests),
            SideEffect::BeginDrain { signal } => {
                tracing::info!(target: "recorder", "[DISPATCH] Drain requested by {}", signal);
                self.exit = Some(DispatchOutcome::Drain(signal));
                Ok(())
            }
            SideEffect::Abort => {
                if let DispatchState::Aborted { error, .. } = &self.state {
                    tracing::error!(target: "recorder", "[DISPATCH] Session failed: {}", error);
                }
                let error = self.failure.take().unwrap_or(SessionError::ConnectionClosed);
                self.exit = Some(DispatchOutcome::Abort(error));
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rfb::{ClientMessage, FramebufferUpdateRequest};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingRequests {
        sent: Arc<Mutex<Vec<FramebufferUpdateRequest>>>,
    }

    impl UpdateRequestSink for RecordingRequests {
        fn request_update(&self, request: FramebufferUpdateRequest) -> Result<(), SessionError> {
            self.sent.lock().unwrap().push(request);
            Ok(())
        }
    }

    struct Harness {
        server_tx: mpsc::Sender<ServerMessage>,
        client_tx: mpsc::Sender<ClientMessage>,
        error_tx: mpsc::Sender<SessionError>,
        signal_tx: mpsc::Sender<ShutdownSignal>,
        requests: RecordingRequests,
        dispatcher: Dispatcher<RecordingRequests>,
    }

    fn harness() -> Harness {
        let (server_tx, server_rx) = mpsc::channel(16);
        let (client_tx, client_rx) = mpsc::channel(16);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (signal_tx, signal_rx) = mpsc::channel(4);
        let requests = RecordingRequests::default();

        let channels = SessionChannels {
            server_rx,
            client_rx,
            error_rx,
        };
        let dispatcher = Dispatcher::new(requests.clone(), channels, signal_rx, 100, 100);

        Harness {
            server_tx,
            client_tx,
            error_tx,
            signal_tx,
            requests,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_signal_returns_shutdown() {
        let h = harness();
        h.signal_tx.send(ShutdownSignal::Interrupt).await.unwrap();

        let Dispatched { outcome, stats, state } = h.dispatcher.run().await;

        assert!(matches!(outcome, DispatchOutcome::Drain(ShutdownSignal::Interrupt)));
        assert_eq!(stats.requests, 1);
        assert!(!h.requests.sent.lock().unwrap()[0].incremental);
        assert!(matches!(
            state,
            DispatchState::ShuttingDown {
                signal: ShutdownSignal::Interrupt,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_finished_after_drain_exits() {
        let h = harness();
        h.signal_tx.send(ShutdownSignal::Hangup).await.unwrap();

        let dispatched = h.dispatcher.run().await;
        let (state, effects) = transition(dispatched.state, DispatchEvent::Finished);

        assert_eq!(state, DispatchState::Exited);
        assert!(effects.is_empty());
    }

    #[tokio::test]
    async fn test_finished_after_abort_exits() {
        let h = harness();
        drop(h.server_tx);

        let dispatched = h.dispatcher.run().await;
        assert!(matches!(dispatched.state, DispatchState::Aborted { .. }));

        let (state, _) = transition(dispatched.state, DispatchEvent::Finished);
        assert_eq!(state, DispatchState::Exited);
    }

    #[tokio::test]
    async fn test_failed_request_aborts() {
        struct ClosedRequests;

        impl UpdateRequestSink for ClosedRequests {
            fn request_update(&self, _: FramebufferUpdateRequest) -> Result<(), SessionError> {
                Err(SessionError::WriterClosed)
            }
        }

        let (_server_tx, server_rx) = mpsc::channel(1);
        let (_client_tx, client_rx) = mpsc::channel(1);
        let (_error_tx, error_rx) = mpsc::channel(1);
        let (_signal_tx, signal_rx) = mpsc::channel(1);
        let channels = SessionChannels {
            server_rx,
            client_rx,
            error_rx,
        };

        let dispatched = Dispatcher::new(ClosedRequests, channels, signal_rx, 10, 10)
            .run()
            .await;

        assert!(matches!(
            dispatched.outcome,
            DispatchOutcome::Abort(SessionError::WriterClosed)
        ));
        assert!(matches!(dispatched.state, DispatchState::Aborted { updates: 0, .. }));
    }

    #[tokio::test]
    async fn test_updates_drive_follow_up_requests() {
        let h = harness();
        let task = tokio::spawn(h.dispatcher.run());

        for _ in 0..3 {
            h.server_tx
                .send(ServerMessage::FramebufferUpdate { rectangles: 1 })
                .await
                .unwrap();
        }
        h.server_tx.send(ServerMessage::Bell).await.unwrap();
        h.client_tx
            .send(ClientMessage::FramebufferUpdateRequest(
                FramebufferUpdateRequest::full_screen(100, 100, true),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.signal_tx.send(ShutdownSignal::Terminate).await.unwrap();

        let Dispatched { outcome, stats, .. } = task.await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Drain(ShutdownSignal::Terminate)));
        assert_eq!(stats.updates, 3);
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.server_messages, 4);
        assert_eq!(stats.client_messages, 1);
        let sent = h.requests.sent.lock().unwrap();
        assert!(sent[1..].iter().all(|r| r.incremental));
    }

    #[tokio::test]
    async fn test_session_error_returns_failure() {
        let h = harness();
        h.error_tx
            .send(SessionError::UnknownMessage(42))
            .await
            .unwrap();

        let outcome = h.dispatcher.run().await.outcome;

        assert!(matches!(
            outcome,
            DispatchOutcome::Abort(SessionError::UnknownMessage(42))
        ));
    }

    #[tokio::test]
    async fn test_closed_server_channel_is_a_failure() {
        let h = harness();
        drop(h.server_tx);

        let outcome = h.dispatcher.run().await.outcome;

        assert!(matches!(
            outcome,
            DispatchOutcome::Abort(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reader_error_wins_over_channel_close() {
        let h = harness();
        h.error_tx
            .send(SessionError::UnsupportedEncoding(7))
            .await
            .unwrap();
        drop(h.server_tx);

        let outcome = h.dispatcher.run().await.outcome;

        assert!(matches!(
            outcome,
            DispatchOutcome::Abort(SessionError::UnsupportedEncoding(7))
        ));
    }
}
