use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-request execution context.
///
/// Captures the tenant, a single `now` shared by every window computed during
/// the request, and the cancellation token / deadline that store reads and the
/// signal fan-out observe.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub org_id: Uuid,
    pub now: DateTime<Utc>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new(org_id: Uuid) -> Self {
        Self {
            org_id,
            now: Utc::now(),
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Ties the request to a parent token, typically the server shutdown token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the token is canceled or the deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}
