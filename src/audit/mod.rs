//! Mutation audit trail.
//!
//! Every gate decision, applied mutation, rollback, and process launch or kill
//! is recorded here as a "who, what, where, outcome" row. The journal answers
//! "how do I undo this"; the audit trail answers "what happened, and who
//! allowed it", including denials that never reached the journal.
//!
//! Recording never blocks a mutation: [`AuditWriter::record`] queues the entry
//! and a drain task writes batches to SQLite, pruning rows past the retention
//! window once an hour.

pub mod store;
pub mod writer;

pub use store::AuditStore;
pub use writer::AuditWriter;

use serde::{Deserialize, Serialize};

/// Who initiated the audited operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActor {
    /// Internal bookkeeping (expiry purges, crash recovery, monitor tasks).
    System,
    /// A human at the terminal, answering a prompt or running the CLI.
    Operator,
    /// A caller submitting operation requests through the engine API.
    Agent { id: String },
}

impl AuditActor {
    pub fn as_str(&self) -> String {
        match self {
            AuditActor::System => "system".to_string(),
            AuditActor::Operator => "operator".to_string(),
            AuditActor::Agent { id } => format!("agent:{}", id),
        }
    }
}

/// Severity is a property of the operation, not of its outcome: a failed
/// firewall change is still `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Reads and queries.
    Info,
    /// Reversible state changes: registry values, services, tasks.
    Warn,
    /// Permission changes, elevation, firewall rules, process execution.
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warn => "warn",
            AuditSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Failure => "failure",
        }
    }
}

/// What the engine hands to [`AuditWriter`]. SQLite stamps the time on insert.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: AuditActor,
    pub severity: AuditSeverity,
    /// Dotted action name, e.g. `registry.set`, `gate.prompt`, `journal.rollback`.
    pub action: String,
    /// Canonical resource key or process ID the action targeted.
    pub subject: Option<String>,
    pub result: AuditResult,
    pub details: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(
        actor: AuditActor,
        severity: AuditSeverity,
        action: impl Into<String>,
        subject: Option<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            actor,
            severity,
            action: action.into(),
            subject,
            result,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A stored entry, as `sysgate audit` prints it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: String,
    pub actor: String,
    pub severity: String,
    pub action: String,
    pub subject: Option<String>,
    pub result: String,
    pub details: Option<serde_json::Value>,
}

/// Filters for `sysgate audit`. `action`, `actor` and `subject` take a
/// SQLite GLOB when they contain `*`; `since`/`until` are ISO-8601 UTC.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub actor: Option<String>,
    pub severity: Option<String>,
    pub subject: Option<String>,
    pub result: Option<String>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub limit: Option<usize>,
}
