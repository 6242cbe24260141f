use anyhow::{Context, Result};
use serde_json::Value;

use super::AppContext;
use crate::audit::AuditQuery;

pub fn query(ctx: &AppContext, q: AuditQuery) -> Result<Value> {
    let store = ctx
        .audit_store
        .as_ref()
        .context("the audit trail is disabled (audit_enabled = false)")?;
    Ok(serde_json::to_value(store.query(&q)?)?)
}
