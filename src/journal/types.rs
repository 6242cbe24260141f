use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{ResourceKey, ResourceKind};
use crate::runtime::{FirewallRule, RegistryValue, ScheduledTask, ServiceState};

/// A snapshot of one resource: either absent or a kind-specific value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ResourceState {
    Absent,
    Registry(RegistryValue),
    Service(ServiceState),
    FirewallRule(FirewallRule),
    Task(ScheduledTask),
}

impl ResourceState {
    pub fn is_absent(&self) -> bool {
        matches!(self, ResourceState::Absent)
    }

    pub fn registry(value: Option<RegistryValue>) -> Self {
        value.map_or(ResourceState::Absent, ResourceState::Registry)
    }

    pub fn firewall(rule: Option<FirewallRule>) -> Self {
        rule.map_or(ResourceState::Absent, ResourceState::FirewallRule)
    }

    pub fn task(task: Option<ScheduledTask>) -> Self {
        task.map_or(ResourceState::Absent, ResourceState::Task)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::Absent => f.write_str("absent"),
            ResourceState::Registry(v) => write!(f, "{}", v),
            ResourceState::Service(s) => write!(f, "{}", s),
            ResourceState::FirewallRule(r) => write!(
                f,
                "{:?} {:?} {:?} port {}",
                r.action,
                r.direction,
                r.protocol,
                r.port.map_or("any".to_string(), |p| p.to_string())
            ),
            ResourceState::Task(t) => write!(f, "{} ({:?})", t.command, t.schedule),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Applied,
    RolledBack,
}

/// One applied mutation and the state needed to undo it.
///
/// Immutable once committed, except for the single `Applied -> RolledBack`
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: u64,
    pub resource_kind: ResourceKind,
    /// Canonical key, e.g. `registry:HKCU\Software\Test\v1`.
    pub resource_key: String,
    pub target: ResourceKey,
    /// Dotted action that produced the entry, e.g. `registry.set`.
    pub operation: String,
    pub prior_state: ResourceState,
    pub new_state: ResourceState,
    pub applied_at: DateTime<Utc>,
    pub status: EntryStatus,
}

impl JournalEntry {
    pub fn is_applied(&self) -> bool {
        self.status == EntryStatus::Applied
    }
}
