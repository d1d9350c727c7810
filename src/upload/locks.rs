//! Per-upload locks
//!
//! A single upload may only be driven by one mutating operation at a time.
//! The state machine takes the lock for every append and delete; the expiry
//! reaper only ever uses `try_acquire`, so it never waits on a live upload
//! and never deletes one that is mid-chunk.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the duration of a mutating operation on one upload
pub type UploadGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct UploadLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UploadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to an upload
    pub async fn acquire(&self, id: &str) -> UploadGuard {
        self.entry(id).lock_owned().await
    }

    /// Exclusive access if nobody else holds it right now
    pub fn try_acquire(&self, id: &str) -> Option<UploadGuard> {
        self.entry(id).try_lock_owned().ok()
    }

    /// Drop the lock entry of a deleted upload.
    ///
    /// Only removes the entry when no other task holds a handle to it, so a
    /// waiter queued on the same id keeps a valid mutex.
    pub fn release(&self, id: &str) {
        self.locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of tracked ids
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_acquire_fails_while_held() {
        let locks = UploadLocks::new();
        let guard = locks.acquire("a").await;
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());
        drop(guard);
        assert!(locks.try_acquire("a").is_some());
    }

    #[tokio::test]
    async fn test_release_keeps_held_entries() {
        let locks = UploadLocks::new();
        let guard = locks.acquire("a").await;
        locks.release("a");
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.release("a");
        assert!(locks.is_empty());
    }
}
