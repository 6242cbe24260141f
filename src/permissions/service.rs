use chrono::Utc;

use super::store::PermissionStore;
use super::types::{Operation, PermissionRecord};
use crate::error::SysgateResult;
use crate::resource::ResourceKey;

/// Trait for permission operations with interior mutability.
///
/// All methods take `&self`; implementations use internal locking, so the
/// gate and the CLI can share one `Arc<dyn PermissionService>`.
pub trait PermissionService: Send + Sync {
    // Read operations
    fn find(&self, key: &ResourceKey, operation: Operation) -> Option<PermissionRecord>;
    fn list(&self) -> Vec<PermissionRecord>;

    // Write operations (persist before returning)
    fn grant(&self, record: PermissionRecord) -> SysgateResult<()>;
    fn revoke(&self, pattern: &str, operations: Option<&[Operation]>) -> SysgateResult<bool>;
    fn clear(&self) -> SysgateResult<()>;
    fn persist(&self) -> SysgateResult<()>;

    /// Prompt-free check: does a stored or implicit grant cover `operation`?
    fn has_permission(&self, key: &ResourceKey, operation: Operation) -> bool {
        self.find(key, operation).is_some()
    }
}

// ---------------------------------------------------------------------------
// DefaultPermissionService: wraps PermissionStore with a read-write lock
// ---------------------------------------------------------------------------

pub struct DefaultPermissionService {
    inner: std::sync::RwLock<PermissionStore>,
}

impl DefaultPermissionService {
    pub fn new(store: PermissionStore) -> Self {
        Self {
            inner: std::sync::RwLock::new(store),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PermissionStore> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PermissionStore> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl PermissionService for DefaultPermissionService {
    /// Lookups take the read lock. If any grant has expired, the lookup
    /// upgrades to the write lock once to purge and persist.
    fn find(&self, key: &ResourceKey, operation: Operation) -> Option<PermissionRecord> {
        let now = Utc::now();
        {
            let store = self.read();
            if !store.has_expired_at(now) {
                return store.find_at(key, operation, now);
            }
        }

        let mut store = self.write();
        if let Err(e) = store.persist() {
            log::error!("Failed to persist after purging expired grants: {}", e);
        }
        store.find_at(key, operation, now)
    }

    fn list(&self) -> Vec<PermissionRecord> {
        self.read().list()
    }

    fn grant(&self, record: PermissionRecord) -> SysgateResult<()> {
        let mut store = self.write();
        store.grant(record)?;
        store.persist()
    }

    fn revoke(&self, pattern: &str, operations: Option<&[Operation]>) -> SysgateResult<bool> {
        let mut store = self.write();
        let changed = store.revoke(pattern, operations)?;
        if changed {
            store.persist()?;
        }
        Ok(changed)
    }

    fn clear(&self) -> SysgateResult<()> {
        let mut store = self.write();
        store.clear();
        store.persist()
    }

    fn persist(&self) -> SysgateResult<()> {
        self.write().persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_is_persisted_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        let svc = DefaultPermissionService::new(PermissionStore::load(&path));

        svc.grant(PermissionRecord::new("service:Spooler", [Operation::Write], None))
            .unwrap();

        let reloaded = PermissionStore::load(&path);
        let key = ResourceKey::service("Spooler").unwrap();
        assert!(reloaded.find(&key, Operation::Write).is_some());
    }

    #[test]
    fn find_purges_expired_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("permissions.json");
        let mut store = PermissionStore::load(&path);
        let mut record = PermissionRecord::new("service:Spooler", [Operation::Write], None);
        record.expires_at = Some(Utc::now() - chrono::Duration::seconds(5));
        store.grant(record).unwrap();
        // Write the expired record to disk without going through persist()
        std::fs::write(&path, serde_json::to_string(&store).unwrap()).unwrap();

        let svc = DefaultPermissionService::new(PermissionStore::load(&path));
        let key = ResourceKey::service("Spooler").unwrap();
        assert!(svc.find(&key, Operation::Write).is_none());

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains("Spooler"));
    }

    #[test]
    fn revoke_reports_change() {
        let svc = DefaultPermissionService::new(PermissionStore::in_memory());
        svc.grant(PermissionRecord::new("task:*", [Operation::Write], None))
            .unwrap();
        assert!(svc.revoke("task:*", None).unwrap());
        assert!(!svc.revoke("task:*", None).unwrap());
        assert!(!svc.has_permission(&ResourceKey::task("Backup").unwrap(), Operation::Write));
    }
}
