use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::tlf::TlfId;

type LockMap = Arc<Mutex<HashMap<TlfId, Arc<AsyncMutex<()>>>>>;

/// One async lock per folder.
///
/// Revisions of a folder are built and appended strictly one after another;
/// different folders proceed in parallel. A folder's entry lives only while
/// its lock is held or awaited.
#[derive(Debug, Clone, Default)]
pub struct FolderLocks {
    locks: LockMap,
}

/// Exclusive access to one folder, released on drop
#[derive(Debug)]
pub struct FolderLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl Drop for FolderLockGuard {
    fn drop(&mut self) {
        // the guard keeps its own reference to the mutex
        drop(self.guard.take());
        // also sweeps entries left behind by cancelled waiters
        self.locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

impl FolderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `tlf`
    pub async fn lock(&self, tlf: TlfId) -> FolderLockGuard {
        let lock = self.locks.lock().entry(tlf).or_default().clone();
        let guard = lock.lock_owned().await;
        self.guard(guard)
    }

    /// Exclusive access to `tlf` if nobody holds it
    pub fn try_lock(&self, tlf: TlfId) -> Option<FolderLockGuard> {
        let lock = self.locks.lock().entry(tlf).or_default().clone();
        let guard = lock.try_lock_owned().ok()?;
        Some(self.guard(guard))
    }

    /// Number of folders currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    fn guard(&self, guard: OwnedMutexGuard<()>) -> FolderLockGuard {
        FolderLockGuard {
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }
}
