use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;

use crate::error::SessionError;

/// Lifecycle of a [`Session`](super::Session).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Init,
    Connecting,
    Connected { since: Instant },
    Authenticated { since: Instant },
    Reconnecting { attempt: u32 },
    Failed(String),
    Closed,
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionStateError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionState {
    pub fn transition(self, next: SessionState) -> Result<SessionState, SessionStateError> {
        use SessionState::*;
        let allowed = matches!(
            (&self, &next),
            (Init | Failed(_), Connecting)
                | (Connecting, Connected { .. } | Failed(_))
                | (Connected { .. }, Authenticated { .. } | Reconnecting { .. } | Failed(_))
                | (Authenticated { .. }, Reconnecting { .. } | Failed(_))
                | (Reconnecting { .. }, Reconnecting { .. } | Connected { .. } | Failed(_))
        ) || (!matches!(self, Closed) && matches!(next, Closed));

        if allowed {
            Ok(next)
        } else {
            Err(SessionStateError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    Pending,
    Ready,
    Failed(String),
    Closed,
}

/// Readiness gate every dependent accessor waits on.
///
/// Pending until authentication completes and again while a reconnection is
/// in flight. It resolves to ready, to a failure when the session can no
/// longer recover, or to closed; waiters are woken in every case.
#[derive(Debug)]
pub struct AuthGate {
    tx: watch::Sender<GateState>,
}

impl AuthGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(GateState::Pending);
        Self { tx }
    }

    pub(crate) fn set_pending(&self) {
        self.tx.send_if_modified(|state| {
            if matches!(state, GateState::Closed) || *state == GateState::Pending {
                return false;
            }
            *state = GateState::Pending;
            true
        });
    }

    pub(crate) fn open(&self) {
        self.tx.send_if_modified(|state| {
            if matches!(state, GateState::Closed) {
                return false;
            }
            *state = GateState::Ready;
            true
        });
    }

    pub(crate) fn fail(&self, reason: String) {
        self.tx.send_if_modified(|state| {
            if matches!(state, GateState::Closed) {
                return false;
            }
            *state = GateState::Failed(reason);
            true
        });
    }

    pub(crate) fn close(&self) {
        self.tx.send_replace(GateState::Closed);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow() == GateState::Ready
    }

    /// Suspends until the gate leaves the pending state.
    pub async fn wait(&self) -> Result<(), SessionError> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| *state != GateState::Pending)
            .await
            .map_err(|_| SessionError::Closed)?
            .clone();
        match state {
            GateState::Ready => Ok(()),
            GateState::Failed(reason) => Err(SessionError::Unavailable { reason }),
            GateState::Closed | GateState::Pending => Err(SessionError::Closed),
        }
    }
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn lifecycle_transitions() {
        let state = SessionState::Init
            .transition(SessionState::Connecting)
            .unwrap()
            .transition(SessionState::Connected {
                since: Instant::now(),
            })
            .unwrap()
            .transition(SessionState::Authenticated {
                since: Instant::now(),
            })
            .unwrap()
            .transition(SessionState::Reconnecting { attempt: 1 })
            .unwrap()
            .transition(SessionState::Reconnecting { attempt: 2 })
            .unwrap()
            .transition(SessionState::Connected {
                since: Instant::now(),
            })
            .unwrap();
        assert!(state.transition(SessionState::Closed).is_ok());
    }

    #[test]
    fn authenticated_session_can_fail() {
        let state = SessionState::Authenticated {
            since: Instant::now(),
        };
        assert_eq!(
            state.transition(SessionState::Failed("presence".into())),
            Ok(SessionState::Failed("presence".into()))
        );
    }

    #[test]
    fn closed_is_terminal() {
        assert!(SessionState::Closed
            .transition(SessionState::Connecting)
            .is_err());
        assert!(SessionState::Closed.transition(SessionState::Closed).is_err());
        assert!(SessionState::Init
            .transition(SessionState::Authenticated {
                since: Instant::now()
            })
            .is_err());
    }

    #[tokio::test]
    async fn waiters_released_on_open() {
        let gate = Arc::new(AuthGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        gate.open();
        waiter.await.unwrap().unwrap();
        assert!(gate.is_ready());
    }

    #[tokio::test]
    async fn waiters_released_with_error_on_failure() {
        let gate = Arc::new(AuthGate::new());
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        gate.fail("gone".into());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(SessionError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn closed_gate_cannot_reopen() {
        let gate = AuthGate::new();
        gate.close();
        gate.open();
        gate.set_pending();
        assert!(matches!(gate.wait().await, Err(SessionError::Closed)));
    }
}
