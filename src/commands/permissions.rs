use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use super::AppContext;
use crate::permissions::{Operation, PermissionRecord};
use crate::resource::{ResourceKey, ResourcePattern};

fn parse_operations(raw: &[String]) -> Result<Vec<Operation>> {
    raw.iter()
        .map(|s| {
            Operation::parse(s.trim())
                .with_context(|| format!("unknown operation '{}' (read, write, execute, elevate)", s))
        })
        .collect()
}

pub fn list(ctx: &AppContext) -> Result<Value> {
    Ok(serde_json::to_value(ctx.engine.permissions().list())?)
}

pub fn grant(ctx: &AppContext, pattern: &str, operations: &[String], duration: Option<u64>) -> Result<Value> {
    let operations = parse_operations(operations)?;
    if operations.is_empty() {
        bail!("at least one operation is required");
    }
    // Validate before it reaches the store
    let pattern = ResourcePattern::parse(pattern)?;
    let record = PermissionRecord::new(pattern.to_string(), operations, duration);
    ctx.engine.permissions().grant(record.clone())?;
    Ok(serde_json::to_value(record)?)
}

pub fn revoke(ctx: &AppContext, pattern: &str, operations: &[String]) -> Result<Value> {
    let operations = parse_operations(operations)?;
    let pattern = ResourcePattern::parse(pattern)?.to_string();
    let subset = (!operations.is_empty()).then_some(operations.as_slice());
    let removed = ctx.engine.permissions().revoke(&pattern, subset)?;
    Ok(json!({ "pattern": pattern, "revoked": removed }))
}

pub fn clear(ctx: &AppContext) -> Result<Value> {
    ctx.engine.permissions().clear()?;
    Ok(json!({ "cleared": true }))
}

pub fn check(ctx: &AppContext, key: &str, operation: &str) -> Result<Value> {
    let key = ResourceKey::parse(key)?;
    let operation = Operation::parse(operation)
        .with_context(|| format!("unknown operation '{}'", operation))?;
    let record = ctx.engine.permissions().find(&key, operation);
    Ok(json!({
        "resource_key": key.canonical(),
        "operation": operation,
        "allowed": record.is_some(),
        "record": record,
    }))
}
