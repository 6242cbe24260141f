use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, Row};

use super::{AuditEntry, AuditQuery, AuditRecord};
use crate::error::SysgateResult;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS audit_log (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp  TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        actor      TEXT    NOT NULL,
        severity   TEXT    NOT NULL,
        action     TEXT    NOT NULL,
        subject    TEXT,
        result     TEXT    NOT NULL,
        details    TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_subject   ON audit_log(subject);
";

/// Rows returned when a query sets no limit, and the most it may ask for.
const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 10_000;

/// Timestamps are stored as UTC ISO-8601 text so they order lexically.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// The audit trail on disk, one SQLite table in `audit.db`.
pub struct AuditStore {
    db: Mutex<Connection>,
}

impl AuditStore {
    pub fn open(data_dir: &Path) -> SysgateResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("audit.db"))?;
        // Concurrent CLI invocations share the file
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Used by `--simulate` and tests; nothing outlives the process.
    pub fn in_memory() -> SysgateResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SysgateResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write `entries` atomically: all of them or none.
    pub fn insert_batch(&self, entries: &[AuditEntry]) -> SysgateResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO audit_log (actor, severity, action, subject, result, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for entry in entries {
                let details = match &entry.details {
                    Some(v) => Some(serde_json::to_string(v)?),
                    None => None,
                };
                insert.execute(params![
                    entry.actor.as_str(),
                    entry.severity.as_str(),
                    entry.action,
                    entry.subject,
                    entry.result.as_str(),
                    details,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Matching rows, newest first.
    pub fn query(&self, q: &AuditQuery) -> SysgateResult<Vec<AuditRecord>> {
        let (clause, values) = where_clause(q);
        let sql = format!(
            "SELECT id, timestamp, actor, severity, action, subject, result, details
             FROM audit_log{} ORDER BY timestamp DESC, id DESC LIMIT {}",
            clause,
            q.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop rows older than `retention`; returns how many went.
    pub fn cleanup_old(&self, retention: Duration) -> SysgateResult<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let deleted = self.conn().execute(
            "DELETE FROM audit_log WHERE timestamp < ?1",
            params![cutoff.format(TIMESTAMP_FORMAT).to_string()],
        )?;
        Ok(deleted)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let details: Option<String> = row.get(7)?;
    Ok(AuditRecord {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        actor: row.get(2)?,
        severity: row.get(3)?,
        action: row.get(4)?,
        subject: row.get(5)?,
        result: row.get(6)?,
        details: details.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Text filters compare for equality; `action`, `actor` and `subject` switch
/// to GLOB when the value has a `*`. `since`/`until` bound the timestamp.
fn where_clause(q: &AuditQuery) -> (String, Vec<String>) {
    let filters: [(&str, Option<&String>, bool); 5] = [
        ("action", q.action.as_ref(), true),
        ("actor", q.actor.as_ref(), true),
        ("severity", q.severity.as_ref(), false),
        ("subject", q.subject.as_ref(), true),
        ("result", q.result.as_ref(), false),
    ];
    let mut terms = Vec::new();
    let mut values = Vec::new();
    for (column, value, globs) in filters {
        let Some(value) = value else { continue };
        let op = if globs && value.contains('*') { "GLOB" } else { "=" };
        values.push(value.clone());
        terms.push(format!("{} {} ?{}", column, op, values.len()));
    }
    for (op, bound) in [(">=", &q.since), ("<=", &q.until)] {
        if let Some(bound) = bound {
            values.push(bound.clone());
            terms.push(format!("timestamp {} ?{}", op, values.len()));
        }
    }

    if terms.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", terms.join(" AND ")), values)
    }
}
