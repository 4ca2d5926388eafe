//! Per-operation deadline and cancellation.
//!
//! Every suspension point of a lifecycle operation (HTTP I/O, waiter sleeps,
//! retry backoff) goes through an [`OpContext`], which races the work against
//! the operation's deadline and a [`CancellationToken`] owned by the provider.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// Deadline plus cancellation for one lifecycle operation.
#[derive(Debug, Clone)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

impl OpContext {
    /// A context with no deadline and a fresh cancellation token.
    pub fn new() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context expiring `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().child_with_timeout(timeout)
    }

    /// A context cancelled together with `token`.
    pub fn with_cancel(token: &CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel: token.child_token(),
        }
    }

    /// A child context whose deadline is the earlier of the parent's and
    /// `timeout` from now. Cancelling the parent cancels the child.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    /// Whether the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel this context and its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<(), ProviderError> {
        if self.is_cancelled() {
            return Err(cancelled());
        }
        if self.is_expired() {
            return Err(deadline_exceeded());
        }
        Ok(())
    }

    /// Sleep for `duration`, failing early on cancellation or when the deadline
    /// falls inside the sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ProviderError> {
        self.check()?;
        let wake = Instant::now() + duration;
        match self.deadline {
            Some(deadline) if deadline < wake => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(cancelled()),
                    _ = tokio::time::sleep_until(deadline) => Err(deadline_exceeded()),
                }
            },
            _ => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(cancelled()),
                    _ = tokio::time::sleep_until(wake) => Ok(()),
                }
            },
        }
    }

    /// Run `fut` to completion unless the context is cancelled or expires first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(cancelled()),
                    _ = tokio::time::sleep_until(deadline) => Err(deadline_exceeded()),
                    result = fut => result,
                }
            },
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(cancelled()),
                    result = fut => result,
                }
            },
        }
    }
}

fn cancelled() -> ProviderError {
    ProviderError::Cancelled("operation cancelled".to_string())
}

fn deadline_exceeded() -> ProviderError {
    ProviderError::Timeout {
        message: "context deadline exceeded".to_string(),
        last_state: None,
    }
}
