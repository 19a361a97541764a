use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Fixed set of mutexes addressed by key hash.
///
/// Serializes work per key (idempotency key, device EUI) without keeping a
/// lock object alive for every key ever seen. Unrelated keys may share a
/// stripe, which only costs a little parallelism.
pub struct StripedLocks {
    stripes: Vec<Arc<Mutex<()>>>,
}

impl StripedLocks {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            stripes: (0..count).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    fn stripe<K: Hash + ?Sized>(&self, key: &K) -> Arc<Mutex<()>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[idx].clone()
    }

    pub async fn lock<K: Hash + ?Sized>(&self, key: &K) -> OwnedMutexGuard<()> {
        self.stripe(key).lock_owned().await
    }

    /// Like `lock`, but gives up after `wait`.
    pub async fn lock_timeout<K: Hash + ?Sized>(
        &self,
        key: &K,
        wait: Duration,
    ) -> Option<OwnedMutexGuard<()>> {
        tokio::time::timeout(wait, self.stripe(key).lock_owned())
            .await
            .ok()
    }
}
