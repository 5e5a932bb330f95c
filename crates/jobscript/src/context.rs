//! Execution context: cancellation plus an optional absolute deadline
//!
//! Every blocking wait in the runtime (retry sleeps, engine execution, source
//! provider walks) observes an [`ExecContext`]. Cancellation is cooperative
//! via [`CancellationToken`]; deadlines are absolute instants that child
//! contexts inherit verbatim.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{JobError, JobResult};

/// Cancellation token plus optional deadline, cheaply cloneable.
#[derive(Debug, Clone)]
pub struct ExecContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl ExecContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an externally-owned cancellation token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child context that expires `timeout` from now. The child
    /// shares the parent's cancellation token; an existing earlier deadline
    /// is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => Some(existing),
            _ => Some(candidate),
        };
        Self {
            token: self.token.clone(),
            deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time remaining until the deadline, if one is set. Returns
    /// `Duration::ZERO` once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
            || self
                .deadline
                .is_some_and(|d| Instant::now() >= d)
    }

    /// Returns the cancellation error when the context is done, `Ok(())`
    /// otherwise. Mirrors checking `ctx.Err()` before starting a unit of work.
    pub fn check(&self) -> JobResult<()> {
        if self.is_cancelled() {
            Err(JobError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Resolves when the token is cancelled or the deadline passes.
    pub async fn done(&self) {
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

    /// Sleep for `delay`, returning early with the cancellation error when
    /// the context is done first.
    pub async fn sleep(&self, delay: Duration) -> JobResult<()> {
        if delay.is_zero() {
            return self.check();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.done() => Err(JobError::cancelled()),
        }
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::background()
    }
}
