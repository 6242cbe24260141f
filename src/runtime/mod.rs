pub mod command;
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::resource::RegistryLocation;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A typed registry value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RegistryValue {
    /// `REG_SZ`
    String(String),
    /// `REG_EXPAND_SZ`
    ExpandString(String),
    /// `REG_DWORD`
    #[serde(rename = "dword")]
    DWord(u32),
    /// `REG_QWORD`
    #[serde(rename = "qword")]
    QWord(u64),
    /// `REG_MULTI_SZ`
    MultiString(Vec<String>),
    /// `REG_BINARY`
    Binary(Vec<u8>),
}

impl RegistryValue {
    pub fn reg_type(&self) -> &'static str {
        match self {
            RegistryValue::String(_) => "REG_SZ",
            RegistryValue::ExpandString(_) => "REG_EXPAND_SZ",
            RegistryValue::DWord(_) => "REG_DWORD",
            RegistryValue::QWord(_) => "REG_QWORD",
            RegistryValue::MultiString(_) => "REG_MULTI_SZ",
            RegistryValue::Binary(_) => "REG_BINARY",
        }
    }

    /// Data in the textual form `reg add /d` accepts.
    pub fn to_reg_data(&self) -> String {
        match self {
            RegistryValue::String(s) | RegistryValue::ExpandString(s) => s.clone(),
            RegistryValue::DWord(n) => n.to_string(),
            RegistryValue::QWord(n) => n.to_string(),
            RegistryValue::MultiString(items) => items.join("\\0"),
            RegistryValue::Binary(bytes) => bytes.iter().map(|b| format!("{:02X}", b)).collect(),
        }
    }

    /// Parse a type name and data as printed by `reg query`.
    /// Numeric types are printed in hex (`0x2a`).
    pub fn from_reg_output(reg_type: &str, data: &str) -> Result<Self, RuntimeError> {
        let bad = || RuntimeError::Other(format!("cannot parse {} data '{}'", reg_type, data));
        match reg_type {
            "REG_SZ" => Ok(RegistryValue::String(data.to_string())),
            "REG_EXPAND_SZ" => Ok(RegistryValue::ExpandString(data.to_string())),
            "REG_DWORD" => parse_hex_or_dec(data)
                .and_then(|n| u32::try_from(n).ok())
                .map(RegistryValue::DWord)
                .ok_or_else(bad),
            "REG_QWORD" => parse_hex_or_dec(data).map(RegistryValue::QWord).ok_or_else(bad),
            "REG_MULTI_SZ" => Ok(RegistryValue::MultiString(if data.is_empty() {
                Vec::new()
            } else {
                data.split("\\0").map(str::to_string).collect()
            })),
            "REG_BINARY" => {
                if data.len() % 2 != 0 || !data.is_ascii() {
                    return Err(bad());
                }
                (0..data.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&data[i..i + 2], 16).ok())
                    .collect::<Option<Vec<u8>>>()
                    .map(RegistryValue::Binary)
                    .ok_or_else(bad)
            }
            other => Err(RuntimeError::Other(format!(
                "unsupported registry type {}",
                other
            ))),
        }
    }
}

fn parse_hex_or_dec(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl fmt::Display for RegistryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.reg_type(), self.to_reg_data())
    }
}

/// Observed state of an OS service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    Stopped,
    Running,
    Paused,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "unknown",
            ServiceState::Stopped => "stopped",
            ServiceState::Running => "running",
            ServiceState::Paused => "paused",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Allow,
    Block,
}

/// A named host firewall rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirewallRule {
    pub name: String,
    pub direction: Direction,
    pub protocol: Protocol,
    /// Local port; `None` = any port.
    pub port: Option<u16>,
    pub action: RuleAction,
}

/// When a scheduled task fires. Times are local `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSchedule {
    Once { at: String },
    Daily { at: String },
    OnLogon,
    OnStart,
}

fn time_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").unwrap())
}

impl TaskSchedule {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TaskSchedule::Once { at } | TaskSchedule::Daily { at } if !time_regex().is_match(at) => {
                Err(format!("schedule time '{}' is not HH:MM", at))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub command: String,
    pub schedule: TaskSchedule,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Platform primitives the mutation engine is built on.
///
/// Implementations perform exactly one OS-level action per call and never
/// consult permissions or the journal. Absence is `Ok(None)` for reads and
/// `Err(NotFound)` for deletes. `create_*` replaces an existing rule or task
/// of the same name.
#[async_trait]
pub trait SystemMutator: Send + Sync {
    /// Short identifier for logs and `whoami` output.
    fn backend_id(&self) -> &'static str;

    // Registry
    async fn read_registry_value(
        &self,
        location: &RegistryLocation,
    ) -> Result<Option<RegistryValue>, RuntimeError>;
    async fn write_registry_value(
        &self,
        location: &RegistryLocation,
        value: &RegistryValue,
    ) -> Result<(), RuntimeError>;
    async fn delete_registry_value(&self, location: &RegistryLocation) -> Result<(), RuntimeError>;

    // Services
    async fn service_state(&self, name: &str) -> Result<ServiceState, RuntimeError>;
    async fn start_service(&self, name: &str) -> Result<(), RuntimeError>;
    async fn stop_service(&self, name: &str) -> Result<(), RuntimeError>;
    async fn pause_service(&self, name: &str) -> Result<(), RuntimeError>;
    async fn resume_service(&self, name: &str) -> Result<(), RuntimeError>;

    // Firewall
    async fn firewall_rule(&self, name: &str) -> Result<Option<FirewallRule>, RuntimeError>;
    async fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<(), RuntimeError>;
    async fn delete_firewall_rule(&self, name: &str) -> Result<(), RuntimeError>;

    // Scheduled tasks
    async fn scheduled_task(&self, name: &str) -> Result<Option<ScheduledTask>, RuntimeError>;
    async fn create_scheduled_task(&self, task: &ScheduledTask) -> Result<(), RuntimeError>;
    async fn delete_scheduled_task(&self, name: &str) -> Result<(), RuntimeError>;
}
