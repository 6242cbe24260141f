use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use crate::error::{SysgateError, SysgateResult};
use crate::resource::ResourceKey;

/// Per-resource-key serialization.
///
/// Each key gets its own async mutex, created on demand and dropped when the
/// last holder releases it. The in-flight set is an independent check on the
/// mutexes: a key found already in flight means locking itself is broken.
#[derive(Default)]
pub(crate) struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: Mutex<HashSet<String>>,
}

pub(crate) struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    id: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn acquire(&self, key: &ResourceKey) -> SysgateResult<KeyGuard<'_>> {
        let id = key.lock_id();
        let mutex = self.locks().entry(id.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;

        if !self.in_flight().insert(id.clone()) {
            log::error!("Two mutations entered the critical section for {}", id);
            return Err(SysgateError::ConcurrentMutationConflict(key.canonical()));
        }
        Ok(KeyGuard {
            owner: self,
            id,
            _guard: guard,
        })
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks().len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.owner.in_flight().remove(&self.id);
        let mut locks = self.owner.locks();
        // Only the map and this guard hold the mutex: nobody is waiting
        if locks.get(&self.id).is_some_and(|m| Arc::strong_count(m) <= 2) {
            locks.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::default());
        let key = ResourceKey::service("Spooler").unwrap();
        let alias = ResourceKey::service("SPOOLER").unwrap();

        let first = locks.acquire(&key).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(&alias).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyLocks::default();
        let _a = locks.acquire(&ResourceKey::task("A").unwrap()).await.unwrap();
        let _b = locks.acquire(&ResourceKey::task("B").unwrap()).await.unwrap();
        assert_eq!(locks.len(), 2);
    }
}
