use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{EntryStatus, JournalEntry, ResourceState};
use crate::error::{SysgateError, SysgateResult};
use crate::resource::ResourceKey;

pub const DEFAULT_CAPACITY: usize = 50;

/// On-disk shape of `journal.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalFile {
    next_id: u64,
    entries: VecDeque<JournalEntry>,
    /// Begun but not yet committed or discarded. Anything left here at load
    /// time was interrupted by a crash.
    #[serde(default)]
    pending: BTreeMap<u64, JournalEntry>,
}

/// Bounded, persisted log of applied mutations.
///
/// A mutation begins an entry before touching the system, then commits it on
/// success or discards it on failure. Pending entries are persisted too, so a
/// crash between the OS call and the commit is recovered as an applied entry
/// whose prior state can still be restored.
pub struct RollbackJournal {
    state: Mutex<JournalFile>,
    path: Option<PathBuf>,
    capacity: usize,
}

impl RollbackJournal {
    /// Load from `path`. A missing or corrupt file yields an empty journal.
    pub fn load(path: &Path, capacity: usize) -> Self {
        let mut file = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<JournalFile>(&data) {
                Ok(file) => file,
                Err(e) => {
                    log::warn!("Journal {} is corrupt ({}), starting empty", path.display(), e);
                    JournalFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => JournalFile::default(),
            Err(e) => {
                log::warn!("Journal {} unreadable ({}), starting empty", path.display(), e);
                JournalFile::default()
            }
        };

        let recovered = std::mem::take(&mut file.pending);
        if !recovered.is_empty() {
            for (id, mut entry) in recovered {
                log::warn!(
                    "Recovering interrupted journal entry {} ({} on {}) as applied",
                    id,
                    entry.operation,
                    entry.resource_key
                );
                entry.status = EntryStatus::Applied;
                file.entries.push_back(entry);
            }
            file.entries.make_contiguous().sort_by_key(|e| e.id);
        }
        // Never reuse an ID, even if next_id was lost
        let max_id = file.entries.iter().map(|e| e.id).max().unwrap_or(0);
        file.next_id = file.next_id.max(max_id + 1);

        let journal = Self {
            state: Mutex::new(file),
            path: Some(path.to_path_buf()),
            capacity: capacity.max(1),
        };
        {
            let mut state = journal.lock();
            journal.trim(&mut state);
            if let Err(e) = journal.write(&state) {
                log::error!("Failed to rewrite journal after load: {}", e);
            }
            log::info!("Loaded journal with {} entries", state.entries.len());
        }
        journal
    }

    /// A journal that is never written to disk.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            state: Mutex::new(JournalFile {
                next_id: 1,
                ..Default::default()
            }),
            path: None,
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JournalFile> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, state: &JournalFile) -> SysgateResult<()> {
        match &self.path {
            Some(path) => crate::util::write_json(path, state),
            None => Ok(()),
        }
    }

    fn trim(&self, state: &mut JournalFile) {
        while state.entries.len() > self.capacity {
            if let Some(evicted) = state.entries.pop_front() {
                log::debug!("Journal entry {} evicted", evicted.id);
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record the intent to mutate `target` and persist it before returning.
    /// If the pending entry cannot be persisted the mutation must not run.
    pub fn begin(
        &self,
        target: &ResourceKey,
        operation: &str,
        prior_state: ResourceState,
        new_state: ResourceState,
    ) -> SysgateResult<u64> {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(
            id,
            JournalEntry {
                id,
                resource_kind: target.kind(),
                resource_key: target.canonical(),
                target: target.clone(),
                operation: operation.to_string(),
                prior_state,
                new_state,
                applied_at: Utc::now(),
                status: EntryStatus::Applied,
            },
        );
        if let Err(e) = self.write(&state) {
            state.pending.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Finalize a pending entry with the new state given at `begin`.
    pub fn commit(&self, id: u64) -> SysgateResult<JournalEntry> {
        self.finish(id, None)
    }

    /// Finalize a pending entry, replacing its new state with what was
    /// actually left behind.
    pub fn commit_with(&self, id: u64, new_state: ResourceState) -> SysgateResult<JournalEntry> {
        self.finish(id, Some(new_state))
    }

    fn finish(&self, id: u64, new_state: Option<ResourceState>) -> SysgateResult<JournalEntry> {
        let mut state = self.lock();
        let mut entry = state
            .pending
            .remove(&id)
            .ok_or(SysgateError::JournalEntryNotFound(id))?;
        if let Some(new_state) = new_state {
            entry.new_state = new_state;
        }
        entry.applied_at = Utc::now();
        state.entries.push_back(entry.clone());
        self.trim(&mut state);
        // The mutation already happened; a failed write must not hide that.
        if let Err(e) = self.write(&state) {
            log::error!("Failed to persist journal entry {}: {}", id, e);
        }
        Ok(entry)
    }

    /// Drop a pending entry after the mutation failed without changing anything.
    pub fn discard(&self, id: u64) {
        let mut state = self.lock();
        if state.pending.remove(&id).is_some() {
            if let Err(e) = self.write(&state) {
                log::error!("Failed to persist discard of journal entry {}: {}", id, e);
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<JournalEntry> {
        self.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Committed entries, oldest first.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent still-applied entry for `key`.
    pub fn latest_applied(&self, key: &ResourceKey) -> Option<JournalEntry> {
        let lock_id = key.lock_id();
        self.lock()
            .entries
            .iter()
            .rev()
            .find(|e| e.is_applied() && e.target.lock_id() == lock_id)
            .cloned()
    }

    /// Whether a later applied entry exists on the same key as `entry`.
    pub fn has_newer_applied(&self, entry: &JournalEntry) -> bool {
        let lock_id = entry.target.lock_id();
        self.lock()
            .entries
            .iter()
            .any(|e| e.id > entry.id && e.is_applied() && e.target.lock_id() == lock_id)
    }

    /// The single permitted transition, `Applied -> RolledBack`.
    pub fn mark_rolled_back(&self, id: u64) -> SysgateResult<JournalEntry> {
        let mut state = self.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(SysgateError::JournalEntryNotFound(id))?;
        if entry.status != EntryStatus::Applied {
            return Err(SysgateError::AlreadyRolledBack(id));
        }
        entry.status = EntryStatus::RolledBack;
        let entry = entry.clone();
        self.write(&state)?;
        Ok(entry)
    }

    /// Write the current state to disk.
    pub fn flush(&self) -> SysgateResult<()> {
        let state = self.lock();
        self.write(&state)
    }
}
