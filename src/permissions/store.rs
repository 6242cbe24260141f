use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::types::{Operation, PermissionRecord, PermissionScope, StoredGrant};
use crate::error::{SysgateError, SysgateResult};
use crate::resource::{ResourceKey, ResourcePattern, Specificity};

/// Durable ledger of explicit grants, keyed by canonical pattern text.
///
/// The store itself is not synchronized; [`super::DefaultPermissionService`]
/// wraps it in a read-write lock.
#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
pub struct PermissionStore {
    records: BTreeMap<String, Vec<StoredGrant>>,
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(skip)]
    workspace_roots: Vec<ResourcePattern>,
}

impl PermissionStore {
    /// Load from `path`. A missing or unreadable file yields an empty store.
    pub fn load(path: &Path) -> Self {
        let mut store = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<PermissionStore>(&data) {
                Ok(store) => store,
                Err(e) => {
                    log::warn!(
                        "Permission store {} is corrupt ({}), starting empty",
                        path.display(),
                        e
                    );
                    PermissionStore::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PermissionStore::default(),
            Err(e) => {
                log::warn!(
                    "Permission store {} unreadable ({}), starting empty",
                    path.display(),
                    e
                );
                PermissionStore::default()
            }
        };
        store.normalize_keys();
        store.path = Some(path.to_path_buf());
        log::info!("Loaded {} permission patterns", store.records.len());
        store
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Resource prefixes that carry an implicit read/write grant.
    /// Unparseable roots are logged and skipped.
    pub fn with_workspace_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.workspace_roots = roots
            .into_iter()
            .filter_map(|r| match ResourcePattern::parse(r.as_ref()) {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("Ignoring workspace root '{}': {}", r.as_ref(), e);
                    None
                }
            })
            .collect();
        self
    }

    /// Purge expired grants and write atomically.
    pub fn persist(&mut self) -> SysgateResult<()> {
        let purged = self.purge_expired(Utc::now());
        if purged > 0 {
            log::info!("Purged {} expired permission grants", purged);
        }
        if let Some(path) = &self.path {
            crate::util::write_json(path, self)?;
            log::debug!("Saved {} permission patterns", self.records.len());
        }
        Ok(())
    }

    pub fn find(&self, key: &ResourceKey, operation: Operation) -> Option<PermissionRecord> {
        self.find_at(key, operation, Utc::now())
    }

    /// Most specific unexpired grant covering `operation` on `key`.
    /// Exact beats prefix beats glob; ties go to the most recent grant.
    /// Falls back to an implicit workspace grant for read/write.
    pub fn find_at(
        &self,
        key: &ResourceKey,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Option<PermissionRecord> {
        let mut best: Option<(Specificity, DateTime<Utc>, PermissionRecord)> = None;

        for (pattern_text, grants) in &self.records {
            let pattern = match ResourcePattern::parse(pattern_text) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let Some(specificity) = pattern.matches(key) else {
                continue;
            };
            for grant in grants {
                if grant.is_expired_at(now) || !grant.operations.contains(&operation) {
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((s, at, _)) => (specificity, grant.granted_at) > (*s, *at),
                };
                if better {
                    best = Some((specificity, grant.granted_at, grant.to_record(pattern_text)));
                }
            }
        }

        if let Some((_, _, record)) = best {
            return Some(record);
        }

        if operation.is_workspace_implicit() {
            if let Some(root) = self.workspace_roots.iter().find(|r| r.matches(key).is_some()) {
                return Some(PermissionRecord {
                    resource_pattern: root.to_string(),
                    operations: [Operation::Read, Operation::Write].into_iter().collect(),
                    granted_at: now,
                    expires_at: None,
                    scope: PermissionScope::WorkspaceImplicit,
                });
            }
        }
        None
    }

    pub fn has_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.records
            .values()
            .flatten()
            .any(|g| g.is_expired_at(now))
    }

    /// Drop expired grants; returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for grants in self.records.values_mut() {
            let before = grants.len();
            grants.retain(|g| !g.is_expired_at(now));
            purged += before - grants.len();
        }
        self.records.retain(|_, grants| !grants.is_empty());
        purged
    }

    /// Add a grant. The pattern is canonicalized, so `HKEY_CURRENT_USER\X`
    /// and `HKCU\X` land under the same entry.
    pub fn grant(&mut self, record: PermissionRecord) -> SysgateResult<()> {
        if record.scope == PermissionScope::WorkspaceImplicit {
            return Err(SysgateError::InvalidRequest(
                "workspace-implicit grants cannot be stored".into(),
            ));
        }
        if record.operations.is_empty() {
            return Err(SysgateError::InvalidRequest(format!(
                "grant on '{}' names no operations",
                record.resource_pattern
            )));
        }
        let pattern = ResourcePattern::parse(&record.resource_pattern)?.to_string();
        let ops: Vec<&str> = record.operations.iter().map(|o| o.as_str()).collect();
        log::info!("Granted {:?} on {}", ops, pattern);
        self.records.entry(pattern).or_default().push(StoredGrant {
            operations: record.operations,
            granted_at: record.granted_at,
            expires_at: record.expires_at,
        });
        Ok(())
    }

    /// Remove `operations` from every grant stored under `pattern`; `None`
    /// removes the pattern outright. Grants left empty are dropped.
    /// Returns whether anything changed.
    pub fn revoke(&mut self, pattern: &str, operations: Option<&[Operation]>) -> SysgateResult<bool> {
        let pattern = ResourcePattern::parse(pattern)?.to_string();
        let changed = match operations {
            None => self.records.remove(&pattern).is_some(),
            Some(ops) => match self.records.get_mut(&pattern) {
                None => false,
                Some(grants) => {
                    let mut changed = false;
                    for grant in grants.iter_mut() {
                        for op in ops {
                            changed |= grant.operations.remove(op);
                        }
                    }
                    grants.retain(|g| !g.operations.is_empty());
                    if grants.is_empty() {
                        self.records.remove(&pattern);
                    }
                    changed
                }
            },
        };
        if changed {
            log::info!("Revoked {:?} on {}", operations, pattern);
        }
        Ok(changed)
    }

    /// All unexpired explicit grants.
    pub fn list(&self) -> Vec<PermissionRecord> {
        let now = Utc::now();
        self.records
            .iter()
            .flat_map(|(pattern, grants)| {
                grants
                    .iter()
                    .filter(move |g| !g.is_expired_at(now))
                    .map(move |g| g.to_record(pattern))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        log::info!("Cleared all permissions");
    }

    /// Re-key records loaded from disk under their canonical pattern text,
    /// dropping entries whose pattern no longer parses.
    fn normalize_keys(&mut self) {
        let records = std::mem::take(&mut self.records);
        for (pattern, grants) in records {
            match ResourcePattern::parse(&pattern) {
                Ok(p) => self.records.entry(p.to_string()).or_default().extend(grants),
                Err(e) => log::warn!("Dropping permission pattern '{}': {}", pattern, e),
            }
        }
    }
}
