use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::StorageError;

/// Cancellation handle for a single query.
///
/// Clones share the same flag, so the caller keeps one clone and hands the
/// other to the query. The query polls [`Cancellation::check`] between fetches
/// and unwinds with [`StorageError::Query`] once tripped or past its deadline.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Adds a deadline unless an earlier one is already set.
    pub fn or_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(timeout) = timeout {
            let candidate = Instant::now() + timeout;
            self.deadline = Some(match self.deadline {
                Some(existing) if existing < candidate => existing,
                _ => candidate,
            });
        }
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), StorageError> {
        if self.is_cancelled() {
            return Err(StorageError::Query("query cancelled".into()));
        }
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(StorageError::Query("query timed out".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let handle = Cancellation::new();
        let query_side = handle.clone();
        assert!(query_side.check().is_ok());
        handle.cancel();
        assert!(matches!(query_side.check(), Err(StorageError::Query(_))));
    }

    #[test]
    fn test_expired_deadline_fails_check() {
        let handle = Cancellation::with_timeout(Duration::ZERO);
        let err = handle.check().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_or_timeout_keeps_earlier_deadline() {
        let handle = Cancellation::with_timeout(Duration::ZERO)
            .or_timeout(Some(Duration::from_secs(3600)));
        assert!(handle.check().is_err());
    }
}
