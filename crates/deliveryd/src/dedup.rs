//! In-process duplicate suppression for keyed operations.
//!
//! Guards against at-least-once event delivery triggering the same logical
//! work twice inside one daemon. Not a distributed lock.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use tracing::warn;

/// Set of keys whose operation is currently running.
#[derive(Debug, Default)]
pub struct Deduplicator {
    in_flight: Mutex<HashSet<String>>,
}

/// Clears its key on drop, including when the operation panics or its
/// future is dropped mid-flight.
struct InFlightGuard<'a> {
    owner: &'a Deduplicator,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` unless another call with the same key is in flight.
    ///
    /// Returns `None` without invoking `operation` when the key is taken;
    /// the running invocation stays authoritative.
    pub async fn run_exclusive<F, Fut, T>(&self, key: &str, operation: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(_guard) = self.try_acquire(key) else {
            warn!(key = %key, "operation already in flight, ignoring duplicate trigger");
            return None;
        };
        Some(operation().await)
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    fn try_acquire(&self, key: &str) -> Option<InFlightGuard<'_>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
        inserted.then(|| InFlightGuard {
            owner: self,
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn concurrent_calls_run_once() {
        let dedup = Arc::new(Deduplicator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let first = {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                dedup
                    .run_exclusive("sha1", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        "first"
                    })
                    .await
            })
        };

        // Wait until the first call holds the key.
        while !dedup.is_in_flight("sha1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let counter = Arc::clone(&calls);
        let second = dedup
            .run_exclusive("sha1", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                "second"
            })
            .await;
        assert_eq!(second, None);

        release.notify_one();
        assert_eq!(first.await.unwrap(), Some("first"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn key_is_released_after_completion() {
        let dedup = Deduplicator::new();
        assert_eq!(dedup.run_exclusive("sha1", || async { 1 }).await, Some(1));
        assert!(!dedup.is_in_flight("sha1"));
        assert_eq!(dedup.run_exclusive("sha1", || async { 2 }).await, Some(2));
    }

    #[tokio::test]
    async fn failed_operation_releases_key() {
        let dedup = Deduplicator::new();
        let result: Option<Result<(), String>> = dedup
            .run_exclusive("sha1", || async { Err("boom".to_string()) })
            .await;
        assert_eq!(result, Some(Err("boom".to_string())));
        assert!(!dedup.is_in_flight("sha1"));
    }

    #[tokio::test]
    async fn cancelled_operation_releases_key() {
        let dedup = Arc::new(Deduplicator::new());
        let task = {
            let dedup = Arc::clone(&dedup);
            tokio::spawn(async move {
                dedup
                    .run_exclusive("sha1", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    })
                    .await
            })
        };
        while !dedup.is_in_flight("sha1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.abort();
        let _ = task.await;
        assert!(!dedup.is_in_flight("sha1"));
    }

    #[tokio::test]
    async fn different_keys_do_not_block_each_other() {
        let dedup = Deduplicator::new();
        let inner = &dedup;
        let outer = dedup
            .run_exclusive("a", || async move { inner.run_exclusive("b", || async { 7 }).await })
            .await;
        assert_eq!(outer, Some(Some(7)));
    }
}
