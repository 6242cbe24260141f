use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::AppContext;
use crate::engine::{FirewallRuleSpec, MutationOutcome, OperationRequest, ServiceOp};
use crate::runtime::{RegistryValue, ScheduledTask, TaskSchedule};

/// Parse a CLI word into a serde enum (`tcp`, `in`, `block`, ...).
fn parse_word<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_value(Value::String(raw.to_lowercase()))
        .with_context(|| format!("invalid {} '{}'", what, raw))
}

/// Registry type names as `reg.exe` spells them, or their short forms.
pub fn parse_registry_value(value_type: &str, data: &str) -> Result<RegistryValue> {
    let reg_type = match value_type.to_lowercase().as_str() {
        "string" | "sz" | "reg_sz" => "REG_SZ",
        "expand_string" | "expand_sz" | "reg_expand_sz" => "REG_EXPAND_SZ",
        "dword" | "reg_dword" => "REG_DWORD",
        "qword" | "reg_qword" => "REG_QWORD",
        "multi_string" | "multi_sz" | "reg_multi_sz" => "REG_MULTI_SZ",
        "binary" | "reg_binary" => "REG_BINARY",
        other => bail!("unsupported registry type '{}'", other),
    };
    // The CLI separates multi-string items with ';'
    let data = if reg_type == "REG_MULTI_SZ" {
        data.replace(';', "\\0")
    } else {
        data.to_string()
    };
    Ok(RegistryValue::from_reg_output(reg_type, &data)?)
}

pub fn parse_schedule(kind: &str, at: Option<String>) -> Result<TaskSchedule> {
    let needs_time = |at: Option<String>| at.context("--at HH:MM is required for this schedule");
    Ok(match kind.to_lowercase().as_str() {
        "once" => TaskSchedule::Once { at: needs_time(at)? },
        "daily" => TaskSchedule::Daily { at: needs_time(at)? },
        "onlogon" | "on_logon" => TaskSchedule::OnLogon,
        "onstart" | "on_start" => TaskSchedule::OnStart,
        other => bail!("unknown schedule '{}' (once, daily, onlogon, onstart)", other),
    })
}

pub fn service_op(raw: &str) -> Result<ServiceOp> {
    parse_word("service operation", raw)
}

/// Submit a request and render its outcome.
pub async fn apply(ctx: &AppContext, request: OperationRequest) -> Result<Value> {
    let outcome = ctx.engine.apply(request).await?;
    render(outcome)
}

/// Submit a request read from a JSON file, or stdin for `-`.
pub async fn apply_file(ctx: &AppContext, path: &str) -> Result<Value> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?
    };
    let request: OperationRequest =
        serde_json::from_str(&raw).context("request is not a valid operation request")?;
    apply(ctx, request).await
}

pub struct FirewallArgs {
    pub name: Option<String>,
    pub port: Option<u16>,
    pub protocol: String,
    pub direction: String,
    pub action: String,
}

pub async fn firewall_add(ctx: &AppContext, args: FirewallArgs) -> Result<Value> {
    let rule = FirewallRuleSpec {
        name: args.name,
        direction: parse_word("direction", &args.direction)?,
        protocol: parse_word("protocol", &args.protocol)?,
        port: args.port,
        action: parse_word("action", &args.action)?,
    };
    apply(ctx, OperationRequest::firewall_create(rule)).await
}

pub async fn task_add(
    ctx: &AppContext,
    name: String,
    command: String,
    schedule: TaskSchedule,
) -> Result<Value> {
    let task = ScheduledTask {
        name,
        command,
        schedule,
    };
    apply(ctx, OperationRequest::task_create(task)).await
}

fn render(outcome: MutationOutcome) -> Result<Value> {
    Ok(serde_json::to_value(outcome)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Direction, Protocol};

    #[test]
    fn parses_registry_values() {
        assert_eq!(parse_registry_value("dword", "42").unwrap(), RegistryValue::DWord(42));
        assert_eq!(parse_registry_value("REG_DWORD", "0x10").unwrap(), RegistryValue::DWord(16));
        assert_eq!(
            parse_registry_value("multi_string", "a;b").unwrap(),
            RegistryValue::MultiString(vec!["a".into(), "b".into()])
        );
        assert!(parse_registry_value("dword", "nope").is_err());
        assert!(parse_registry_value("link", "x").is_err());
    }

    #[test]
    fn parses_words_case_insensitively() {
        assert_eq!(parse_word::<Protocol>("protocol", "UDP").unwrap(), Protocol::Udp);
        assert_eq!(parse_word::<Direction>("direction", "out").unwrap(), Direction::Out);
        assert!(parse_word::<Direction>("direction", "sideways").is_err());
        assert_eq!(service_op("restart").unwrap(), ServiceOp::Restart);
    }

    #[test]
    fn schedules_need_times() {
        assert!(parse_schedule("daily", None).is_err());
        assert_eq!(
            parse_schedule("daily", Some("02:30".into())).unwrap(),
            TaskSchedule::Daily { at: "02:30".into() }
        );
        assert_eq!(parse_schedule("onstart", None).unwrap(), TaskSchedule::OnStart);
    }
}
