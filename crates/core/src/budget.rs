//! Cancellation and deadlines for long-running read queries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{LedgerError, LedgerResult};

/// Caller-held handle that cancels every budget cloned from the same source.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Deadline + cancellation token handed to report queries.
///
/// Queries call [`QueryBudget::checkpoint`] while scanning; it fails with
/// [`LedgerError::Cancelled`] or [`LedgerError::Timeout`].
#[derive(Debug, Clone, Default)]
pub struct QueryBudget {
    deadline: Option<Instant>,
    token: CancelToken,
}

impl QueryBudget {
    /// No deadline, never cancelled unless a token is attached.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            token: CancelToken::new(),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            token: CancelToken::new(),
        }
    }

    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn checkpoint(&self) -> LedgerResult<()> {
        if self.token.is_cancelled() {
            return Err(LedgerError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(LedgerError::Timeout),
            _ => Ok(()),
        }
    }
}
