use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kinds of access a permission can authorize.
///
/// `Elevate` is deliberately separate from `Write`: consenting to run with
/// elevated privileges never implies consent to mutate, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Execute,
    Elevate,
}

/// All operation string values, for error messages and CLI parsing.
pub const KNOWN_OPERATIONS: &[&str] = &["read", "write", "execute", "elevate"];

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Execute => "execute",
            Operation::Elevate => "elevate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Operation::Read),
            "write" => Some(Operation::Write),
            "execute" | "exec" => Some(Operation::Execute),
            "elevate" => Some(Operation::Elevate),
            _ => None,
        }
    }

    pub fn risk_level(&self) -> &'static str {
        match self {
            Operation::Read => "low",
            Operation::Write => "high",
            Operation::Execute => "critical",
            Operation::Elevate => "critical",
        }
    }

    /// Operations a workspace root grants without a stored record.
    pub fn is_workspace_implicit(&self) -> bool {
        matches!(self, Operation::Read | Operation::Write)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::parse(s).ok_or_else(|| {
            format!(
                "unknown operation '{}', expected one of: {}",
                s,
                KNOWN_OPERATIONS.join(", ")
            )
        })
    }
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    /// Synthesized for a key under a configured workspace root; never stored.
    WorkspaceImplicit,
    /// Granted by a user decision or programmatic call and persisted.
    #[default]
    Explicit,
}

/// A permission as seen by callers of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    /// Canonical pattern text, e.g. `registry:HKCU\Software\Test` or `service:wua*`.
    pub resource_pattern: String,
    pub operations: BTreeSet<Operation>,
    pub granted_at: DateTime<Utc>,
    /// `None` = permanent.
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: PermissionScope,
}

impl PermissionRecord {
    /// An explicit grant starting now. `duration_secs = None` means permanent.
    pub fn new(
        resource_pattern: impl Into<String>,
        operations: impl IntoIterator<Item = Operation>,
        duration_secs: Option<u64>,
    ) -> Self {
        let granted_at = Utc::now();
        Self {
            resource_pattern: resource_pattern.into(),
            operations: operations.into_iter().collect(),
            granted_at,
            expires_at: duration_secs.map(|s| granted_at + chrono::Duration::seconds(s as i64)),
            scope: PermissionScope::Explicit,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn covers(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }
}

/// On-disk form of one grant. The pattern is the map key it is stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredGrant {
    pub operations: BTreeSet<Operation>,
    pub granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    pub fn to_record(&self, pattern: &str) -> PermissionRecord {
        PermissionRecord {
            resource_pattern: pattern.to_string(),
            operations: self.operations.clone(),
            granted_at: self.granted_at,
            expires_at: self.expires_at,
            scope: PermissionScope::Explicit,
        }
    }
}
