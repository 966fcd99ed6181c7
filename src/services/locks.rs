use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type LockTable = DashMap<Uuid, Arc<Mutex<()>>>;

/// In-process lock table keyed by id.
///
/// Status transitions for one user hold that user's lock, so the "still owned
/// through another order" computation never races a sibling transition.
/// Entries live only while someone holds or waits for them.
#[derive(Clone, Default)]
pub struct KeyedLocks(Arc<LockTable>);

/// Held lock for one key. Dropping it releases the lock and evicts the entry
/// when nobody else is waiting on it.
pub struct KeyedGuard {
    key: Uuid,
    table: Arc<LockTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // The guard owns a clone of the mutex Arc; release it before counting
        self.guard.take();
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: Uuid) -> KeyedGuard {
        // Clone the Arc out so the shard guard is released before awaiting
        let mutex = self.0.entry(key).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key,
            table: self.0.clone(),
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
