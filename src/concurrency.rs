//! The Concurrency Gate: a global parallelism semaphore plus a keyed
//! mutual-exclusion map.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Held by the caller for the lifetime of one dispatch attempt. Dropping it
/// releases whichever primitives it holds.
pub enum Acquisition<'a> {
    /// Both the global permit and (if applicable) the key lock were
    /// obtained; the caller must spawn the child process.
    RanWithPermits {
        _permit: SemaphorePermit<'a>,
        _key_guard: Option<KeyGuard>,
    },
    /// The global permit was obtained but the job's concurrency key was
    /// already held by another in-flight execution. The global permit has
    /// already been released; no process should be spawned.
    SkippedDueToConflict,
}

/// RAII guard releasing a keyed mutual-exclusion slot on drop.
pub struct KeyGuard {
    key: String,
    locks: Arc<DashMap<String, ()>>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.locks.remove(&self.key);
    }
}

/// Global parallelism cap combined with non-blocking keyed mutual exclusion.
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    key_locks: Arc<DashMap<String, ()>>,
}

impl ConcurrencyGate {
    pub fn new(max_parallelism: usize) -> Self {
        ConcurrencyGate {
            semaphore: Semaphore::new(max_parallelism.max(1)),
            key_locks: Arc::new(DashMap::new()),
        }
    }

    /// Attempt to acquire permits for a dispatch. Awaits the global permit
    /// (bounding total parallelism); if `allow_parallel` is false, performs a
    /// non-blocking try-acquire of the job's concurrency key afterward.
    pub async fn acquire(&self, concurrency_key: &str, allow_parallel: bool) -> Acquisition<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        if allow_parallel {
            return Acquisition::RanWithPermits {
                _permit: permit,
                _key_guard: None,
            };
        }

        if self.key_locks.insert(concurrency_key.to_string(), ()).is_some() {
            // Key was already held: release the global permit immediately
            // and report the conflict. `permit` drops here.
            drop(permit);
            return Acquisition::SkippedDueToConflict;
        }

        Acquisition::RanWithPermits {
            _permit: permit,
            _key_guard: Some(KeyGuard {
                key: concurrency_key.to_string(),
                locks: Arc::clone(&self.key_locks),
            }),
        }
    }

    /// Number of permits currently available. Used in tests/diagnostics to
    /// detect permit leakage at quiescence.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_of_busy_key_is_skipped() {
        let gate = ConcurrencyGate::new(4);
        let first = gate.acquire("db", false).await;
        assert!(matches!(first, Acquisition::RanWithPermits { .. }));

        let second = gate.acquire("db", false).await;
        assert!(matches!(second, Acquisition::SkippedDueToConflict));

        // global permit from the skipped attempt was released immediately
        assert_eq!(gate.available_permits(), 3);
        drop(first);
        assert_eq!(gate.available_permits(), 4);
    }

    #[tokio::test]
    async fn allow_parallel_bypasses_key_lock() {
        let gate = ConcurrencyGate::new(4);
        let first = gate.acquire("db", true).await;
        let second = gate.acquire("db", true).await;
        assert!(matches!(first, Acquisition::RanWithPermits { .. }));
        assert!(matches!(second, Acquisition::RanWithPermits { .. }));
    }

    #[tokio::test]
    async fn permits_are_released_after_drop() {
        let gate = ConcurrencyGate::new(1);
        {
            let a = gate.acquire("k1", false).await;
            assert!(matches!(a, Acquisition::RanWithPermits { .. }));
            assert_eq!(gate.available_permits(), 0);
        }
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_conflict() {
        let gate = ConcurrencyGate::new(4);
        let a = gate.acquire("a", false).await;
        let b = gate.acquire("b", false).await;
        assert!(matches!(a, Acquisition::RanWithPermits { .. }));
        assert!(matches!(b, Acquisition::RanWithPermits { .. }));
    }
}
