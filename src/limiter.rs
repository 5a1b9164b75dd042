//! Connection slot accounting.
//!
//! The [`ConnectionLimiter`] caps the number of open connections a server or
//! a connection pool may hold at once. Slots are taken with
//! [`try_reserve`](ConnectionLimiter::try_reserve) and handed back through a
//! [`LimiterGuard`], which releases its slot when dropped, so a connection
//! that is closed anywhere (idle pruning, error paths, shutdown) frees its
//! slot without explicit bookkeeping.
//!
//! Callers that must wait for a slot do so with [`poll_until`], a bounded
//! cooperative wait.
//!
//! Received content is accounted separately by a [`ReceiveBudget`]: every
//! buffered payload byte holds one permit until the host has stored it, so a
//! server never keeps more than `max_buffered_bytes` of session content in
//! memory, however many connections are open.
//!
//! # Configuration
//!
//! - `max_connections`: Maximum number of open connections (default: 16)
//! - `max_buffered_bytes`: Receive-side content held in memory (default: 1 GiB)

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{FlowError, Result};

/// Default maximum number of open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Interval between slot checks while waiting.
pub const CHECK_INTERVAL: Duration = Duration::from_millis(5);

/// Counter of open connections, shared by every clone.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    /// Current open connection count.
    in_use: Arc<AtomicUsize>,
    /// Maximum allowed open connections.
    max_connections: usize,
}

impl ConnectionLimiter {
    /// Create a new limiter with the specified cap.
    pub fn new(max_connections: usize) -> Self {
        Self {
            in_use: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Get current open connection count.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Get maximum connection limit.
    #[inline]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Try to take a slot without waiting.
    ///
    /// Returns `None` at capacity.
    pub fn try_reserve(&self) -> Option<LimiterGuard> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_connections).then_some(current + 1)
            })
            .ok()
            .map(|_| LimiterGuard {
                limiter: self.clone(),
            })
    }

    #[inline]
    fn release(&self) {
        self.in_use.fetch_sub(1, Ordering::Release);
    }
}

impl Default for ConnectionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS)
    }
}

/// Guard that owns one connection slot and releases it on drop.
#[derive(Debug)]
pub struct LimiterGuard {
    limiter: ConnectionLimiter,
}

impl Drop for LimiterGuard {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Byte budget for received content, shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct ReceiveBudget {
    permits: Arc<Semaphore>,
    max_bytes: usize,
}

impl ReceiveBudget {
    /// Create a budget of `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        let max_bytes = max_bytes.min(Semaphore::MAX_PERMITS);
        Self {
            permits: Arc::new(Semaphore::new(max_bytes)),
            max_bytes,
        }
    }

    /// Get the total budget.
    #[inline]
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Get the bytes currently held.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.max_bytes - self.permits.available_permits()
    }

    /// Reserve `bytes`, waiting until enough content has been released.
    ///
    /// A reservation larger than the whole budget can never be granted;
    /// callers must check [`max_bytes`](Self::max_bytes) first.
    pub async fn reserve(&self, bytes: usize) -> Result<OwnedSemaphorePermit> {
        let count = u32::try_from(bytes)
            .map_err(|_| FlowError::Framing(format!("chunk of {} bytes is too large to buffer", bytes)))?;
        self.permits
            .clone()
            .acquire_many_owned(count)
            .await
            .map_err(|_| FlowError::Shutdown)
    }
}

/// Repeatedly run `attempt` until it yields a value or `timeout` elapses.
///
/// Sleeps `interval` between attempts. The attempt is always run at least
/// once, even with a zero timeout.
pub async fn poll_until<T, F, Fut>(timeout: Duration, interval: Duration, mut attempt: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();

    loop {
        if let Some(value) = attempt().await {
            return Some(value);
        }

        if start.elapsed() >= timeout {
            return None;
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_creation() {
        let limiter = ConnectionLimiter::new(4);
        assert_eq!(limiter.max_connections(), 4);
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_limiter_default() {
        assert_eq!(
            ConnectionLimiter::default().max_connections(),
            DEFAULT_MAX_CONNECTIONS
        );
    }

    #[test]
    fn test_try_reserve_at_capacity() {
        let limiter = ConnectionLimiter::new(2);

        let a = limiter.try_reserve().unwrap();
        let _b = limiter.try_reserve().unwrap();
        assert!(limiter.try_reserve().is_none());
        assert_eq!(limiter.in_use(), 2);

        drop(a);
        assert!(limiter.try_reserve().is_some());
    }

    #[tokio::test]
    async fn test_receive_budget_waits_for_release() {
        let budget = ReceiveBudget::new(10);
        let held = budget.reserve(8).await.unwrap();
        assert_eq!(budget.in_use(), 8);

        let waiting = tokio::spawn({
            let budget = budget.clone();
            async move { budget.reserve(5).await.map(|p| p.num_permits()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(held);
        let granted = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(granted, 5);
        assert_eq!(budget.in_use(), 0);
    }

    #[tokio::test]
    async fn test_receive_budget_merges_reservations() {
        let budget = ReceiveBudget::new(100);
        let mut held = budget.reserve(30).await.unwrap();
        held.merge(budget.reserve(20).await.unwrap());
        assert_eq!(budget.in_use(), 50);

        drop(held);
        assert_eq!(budget.in_use(), 0);
        assert_eq!(budget.max_bytes(), 100);
    }

    #[test]
    fn test_clone_shares_state() {
        let limiter = ConnectionLimiter::new(10);
        let other = limiter.clone();

        let _guard = limiter.try_reserve().unwrap();
        assert_eq!(other.in_use(), 1);
    }

    #[tokio::test]
    async fn test_poll_until_immediate() {
        let value = poll_until(Duration::ZERO, CHECK_INTERVAL, || async { Some(7) }).await;
        assert_eq!(value, Some(7));
    }

    #[tokio::test]
    async fn test_poll_until_timeout() {
        let start = Instant::now();
        let value: Option<()> =
            poll_until(Duration::from_millis(20), CHECK_INTERVAL, || async { None }).await;

        assert!(value.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_poll_until_waits_for_release() {
        let limiter = ConnectionLimiter::new(1);
        let held = limiter.try_reserve().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(held);
        });

        let guard = poll_until(Duration::from_secs(1), CHECK_INTERVAL, || {
            let limiter = limiter.clone();
            async move { limiter.try_reserve() }
        })
        .await;
        assert!(guard.is_some());
    }
}
