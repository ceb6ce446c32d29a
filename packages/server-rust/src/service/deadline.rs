//! Deadline-bound child context handed to supervised handlers.
//!
//! A [`Deadline`] fires when either its expiry instant passes or its
//! cancellation token is cancelled by the supervisor. Handlers and the
//! collaborators they call thread it into every awaited I/O operation via
//! [`Deadline::run`], so a timed-out request stops consuming resources
//! promptly instead of running to completion unobserved.

use std::future::Future;
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use gatehouse_core::RequestContext;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::error::{json_message, DeadlineExceeded};

/// Request context bound to a fixed expiry instant and a cancellation signal.
#[derive(Debug, Clone)]
pub struct Deadline {
    context: RequestContext,
    timeout: Duration,
    expires_at: Instant,
    token: CancellationToken,
}

impl Deadline {
    /// Derives a deadline expiring `timeout` from now.
    #[must_use]
    pub fn new(parent: &RequestContext, timeout: Duration) -> Self {
        Self {
            context: parent.clone(),
            timeout,
            expires_at: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    /// The request context this deadline was derived from.
    #[must_use]
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Returns `true` once the expiry passed or the deadline was cancelled.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.token.is_cancelled() || self.remaining().is_zero()
    }

    /// Resolves when the deadline fires, by expiry or by cancellation.
    pub async fn cancelled(&self) {
        tokio::select! {
            () = self.token.cancelled() => {}
            () = sleep_until(self.expires_at) => {}
        }
    }

    /// Awaits `work` unless the deadline fires first, in which case `work`
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineExceeded`] if the deadline fires before `work` completes.
    pub async fn run<F: Future>(&self, work: F) -> Result<F::Output, DeadlineExceeded> {
        if self.is_expired() {
            return Err(DeadlineExceeded);
        }
        tokio::select! {
            biased;
            () = self.cancelled() => Err(DeadlineExceeded),
            output = work => Ok(output),
        }
    }

    /// Fires the deadline immediately.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Deadline {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<Deadline>().cloned().ok_or_else(|| {
            json_message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request is not running under a deadline",
            )
        })
    }
}
