use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{Credentials, SessionInner, SessionState};
use crate::error::SessionError;

impl SessionInner {
    /// Replaces a failed connection, re-authenticating with the reusable
    /// credentials from the last welcome. Runs on the receive loop that
    /// observed the failure; at most one reconnection is in flight.
    pub(crate) async fn reconnect(self: &Arc<Self>, generation: u64, cause: SessionError) {
        if self.is_closed() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            debug!(generation, "reconnection already in progress");
            return;
        }
        warn!(generation, error = %cause, "connection lost, reconnecting");

        self.gate.set_pending();
        let receiver = self.receiver.lock().take();
        if let Some(receiver) = receiver {
            receiver.request_stop();
        }
        self.pending_reader.lock().take();
        let lost = self.connection.write().take();
        if let Some(lost) = lost {
            lost.shutdown().await;
        }

        let result = self.reconnect_with_policy().await;
        self.reconnecting.store(false, Ordering::Release);
        if let Err(err) = result {
            if !self.is_closed() {
                self.fail(format!("reconnection failed: {}", err));
            }
        }
    }

    async fn reconnect_with_policy(self: &Arc<Self>) -> Result<(), SessionError> {
        let welcome = self
            .welcome
            .read()
            .clone()
            .ok_or_else(|| SessionError::protocol("no welcome to reconnect with"))?;
        let credentials = Credentials::from_welcome(&welcome)?;
        let device_id = self.device_id.read().clone();
        let policy = self.config.reconnect.clone();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let delay = policy.backoff(attempt);
            if !delay.is_zero() {
                debug!(attempt, ?delay, "backing off before reconnecting");
                tokio::time::sleep(delay).await;
            }
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            self.gate.set_pending();
            self.transition(SessionState::Reconnecting { attempt })?;

            match self.reconnect_once(&credentials, &device_id).await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return Ok(());
                }
                Err(err) if policy.allows(attempt) && !self.is_closed() => {
                    warn!(attempt, error = %err, "reconnection attempt failed");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn reconnect_once(
        self: &Arc<Self>,
        credentials: &Credentials,
        device_id: &str,
    ) -> Result<(), SessionError> {
        self.establish().await?;
        self.transition(SessionState::Connected {
            since: Instant::now(),
        })?;
        self.authenticate_partial(credentials, device_id).await?;
        self.announce_presence().await
    }
}
