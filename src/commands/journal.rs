use anyhow::Result;
use serde_json::Value;

use super::AppContext;
use crate::resource::ResourceKey;

/// Journal entries, newest first.
pub fn list(ctx: &AppContext, limit: Option<usize>) -> Result<Value> {
    let mut entries = ctx.engine.journal().entries();
    entries.reverse();
    if let Some(limit) = limit {
        entries.truncate(limit);
    }
    Ok(serde_json::to_value(entries)?)
}

pub async fn rollback(ctx: &AppContext, entry_id: u64) -> Result<Value> {
    let outcome = ctx.engine.rollback(entry_id).await?;
    Ok(serde_json::to_value(outcome)?)
}

pub async fn rollback_last(ctx: &AppContext, key: &str) -> Result<Value> {
    let key = ResourceKey::parse(key)?;
    let outcome = ctx.engine.rollback_last(&key).await?;
    Ok(serde_json::to_value(outcome)?)
}
