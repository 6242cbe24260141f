use anyhow::Result;
use serde_json::{json, Value};

use super::AppContext;

/// Privilege and backend status.
pub fn whoami(ctx: &AppContext) -> Result<Value> {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "elevated": ctx.engine.is_elevated(),
        "auto_elevate": ctx.config.auto_elevate,
        "backend": ctx.engine.backend_id(),
        "data_dir": ctx.config.data_dir,
        "journal_entries": ctx.engine.journal().len(),
        "journal_capacity": ctx.engine.journal().capacity(),
    }))
}
