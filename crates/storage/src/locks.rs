use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Per-name reader/writer locks. Entries are held weakly and disappear once
/// no guard or waiter references them, so the registry does not grow with
/// every name ever touched.
#[derive(Debug, Clone, Default)]
pub struct NameLocks {
    entries: Arc<Mutex<HashMap<String, Weak<RwLock<()>>>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, name: &str) -> Arc<RwLock<()>> {
        let mut entries = self.entries.lock().await;
        if let Some(lock) = entries.get(name).and_then(Weak::upgrade) {
            return lock;
        }
        entries.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(RwLock::new(()));
        entries.insert(name.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Exclusive section for a load-mutate-save sequence on `name`.
    pub async fn write(&self, name: &str) -> OwnedRwLockWriteGuard<()> {
        self.entry(name).await.write_owned().await
    }

    /// Shared section for read-only use of `name`.
    pub async fn read(&self, name: &str) -> OwnedRwLockReadGuard<()> {
        self.entry(name).await.read_owned().await
    }

    /// Number of names with a live lock.
    pub async fn tracked(&self) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|lock| lock.strong_count() > 0)
            .count()
    }
}
