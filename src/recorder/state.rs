//! Pure state machine for the dispatch lifecycle.
//!
//! `(State, Event) -> (NewState, Vec<SideEffect>)`
//!
//! Invalid transitions return the current state with empty effects, so a
//! second shutdown signal while already shutting down is a no-op.

use std::time::Instant;

use super::signals::ShutdownSignal;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchState {
    /// Session negotiated, no update requested yet.
    Connected,

    /// Control loop running.
    Dispatching { started_at: Instant, updates: u64 },

    /// A signal arrived; the drain sequence runs next.
    ShuttingDown { signal: ShutdownSignal, updates: u64 },

    /// The session failed.
    Aborted { error: String, updates: u64 },

    /// Drain or abort completed; the pipeline is released.
    Exited,
}

impl Default for DispatchState {
    fn default() -> Self {
        Self::Connected
    }
}

impl DispatchState {
    pub fn updates(&self) -> u64 {
        match self {
            DispatchState::Dispatching { updates, .. }
            | DispatchState::ShuttingDown { updates, .. }
            | DispatchState::Aborted { updates, .. } => *updates,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// The control loop started.
    Started,

    /// A FramebufferUpdate was fully applied to the canvas.
    UpdateCompleted,

    /// OS termination request.
    SignalReceived { signal: ShutdownSignal },

    /// The session reported a fatal error.
    SessionFailed { error: String },

    /// Drain or abort has finished.
    Finished,
}

/// Side effects returned by `transition()` and executed by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Ask for the whole screen, non-incremental.
    RequestInitialUpdate,

    /// Ask for the next incremental update.
    RequestNextUpdate,

    /// Leave the loop and drain.
    BeginDrain { signal: ShutdownSignal },

    /// Leave the loop without draining.
    Abort,
}

pub fn transition(state: DispatchState, event: DispatchEvent) -> (DispatchState, Vec<SideEffect>) {
    match (&state, event) {
        (DispatchState::Connected, DispatchEvent::Started) => {
            let new_state = DispatchState::Dispatching {
                started_at: Instant::now(),
                updates: 0,
            };
            (new_state, vec![SideEffect::RequestInitialUpdate])
        }

        (
            DispatchState::Dispatching {
                started_at,
                updates,
            },
            DispatchEvent::UpdateCompleted,
        ) => {
            let new_state = DispatchState::Dispatching {
                started_at: *started_at,
                updates: updates + 1,
            };
            (new_state, vec![SideEffect::RequestNextUpdate])
        }

        (DispatchState::Dispatching { updates, .. }, DispatchEvent::SignalReceived { signal }) => {
            let new_state = DispatchState::ShuttingDown {
                signal,
                updates: *updates,
            };
            (new_state, vec![SideEffect::BeginDrain { signal }])
        }

        // Failure before the loop starts also aborts
        (
            DispatchState::Connected | DispatchState::Dispatching { .. },
            DispatchEvent::SessionFailed { error },
        ) => {
            let new_state = DispatchState::Aborted {
                error,
                updates: state.updates(),
            };
            (new_state, vec![SideEffect::Abort])
        }

        (
            DispatchState::ShuttingDown { .. } | DispatchState::Aborted { .. },
            DispatchEvent::Finished,
        ) => (DispatchState::Exited, vec![]),

        _ => (state, vec![]),
    }
}
