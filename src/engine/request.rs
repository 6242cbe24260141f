use serde::{Deserialize, Serialize};

use crate::audit::AuditSeverity;
use crate::error::{SysgateError, SysgateResult};
use crate::journal::{JournalEntry, ResourceState};
use crate::permissions::Operation;
use crate::resource::ResourceKey;
use crate::runtime::{
    Direction, FirewallRule, Protocol, RegistryValue, RuleAction, ScheduledTask,
};
use crate::supervisor::ProcessSnapshot;

/// Prefix for firewall rule names the engine allocates.
pub const RULE_NAME_PREFIX: &str = "sysgate-";

/// A typed request to read or change one resource.
///
/// ```json
/// {"resource_kind": "registry", "key": "HKCU\\Software\\Test", "value_name": "v1",
///  "operation": {"op": "set", "value": {"type": "string", "data": "v1"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resource_kind", rename_all = "snake_case")]
pub enum OperationRequest {
    Registry {
        key: String,
        /// Empty addresses the key's default value.
        #[serde(default)]
        value_name: String,
        operation: RegistryOp,
    },
    Service {
        name: String,
        operation: ServiceOp,
    },
    Firewall {
        operation: FirewallOp,
    },
    Task {
        operation: TaskOp,
    },
    Process {
        command: String,
        #[serde(default)]
        background: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryOp {
    Get,
    Set { value: RegistryValue },
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOp {
    Query,
    Start,
    Stop,
    Restart,
}

/// A firewall rule to create. Without a name one is allocated.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirewallRuleSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub action: RuleAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FirewallOp {
    Create {
        #[serde(flatten)]
        rule: FirewallRuleSpec,
    },
    Delete {
        name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskOp {
    Create {
        #[serde(flatten)]
        task: ScheduledTask,
    },
    Delete {
        name: String,
    },
}

impl OperationRequest {
    pub fn registry_get(key: &str, value_name: &str) -> Self {
        OperationRequest::Registry {
            key: key.to_string(),
            value_name: value_name.to_string(),
            operation: RegistryOp::Get,
        }
    }

    pub fn registry_set(key: &str, value_name: &str, value: RegistryValue) -> Self {
        OperationRequest::Registry {
            key: key.to_string(),
            value_name: value_name.to_string(),
            operation: RegistryOp::Set { value },
        }
    }

    pub fn registry_delete(key: &str, value_name: &str) -> Self {
        OperationRequest::Registry {
            key: key.to_string(),
            value_name: value_name.to_string(),
            operation: RegistryOp::Delete,
        }
    }

    pub fn service(name: &str, operation: ServiceOp) -> Self {
        OperationRequest::Service {
            name: name.to_string(),
            operation,
        }
    }

    pub fn firewall_create(rule: FirewallRuleSpec) -> Self {
        OperationRequest::Firewall {
            operation: FirewallOp::Create { rule },
        }
    }

    pub fn firewall_delete(name: &str) -> Self {
        OperationRequest::Firewall {
            operation: FirewallOp::Delete {
                name: name.to_string(),
            },
        }
    }

    pub fn task_create(task: ScheduledTask) -> Self {
        OperationRequest::Task {
            operation: TaskOp::Create { task },
        }
    }

    pub fn task_delete(name: &str) -> Self {
        OperationRequest::Task {
            operation: TaskOp::Delete {
                name: name.to_string(),
            },
        }
    }

    pub fn process(command: &str, background: bool) -> Self {
        OperationRequest::Process {
            command: command.to_string(),
            background,
        }
    }

    /// Validate the request and resolve its target key. Allocates a rule
    /// name for unnamed firewall rules.
    pub(crate) fn plan(self) -> SysgateResult<(ResourceKey, Action)> {
        match self {
            OperationRequest::Registry {
                key,
                value_name,
                operation,
            } => {
                let target = ResourceKey::registry(&key, &value_name)?;
                let action = match operation {
                    RegistryOp::Get => Action::RegistryGet,
                    RegistryOp::Set { value } => Action::RegistrySet(value),
                    RegistryOp::Delete => Action::RegistryDelete,
                };
                Ok((target, action))
            }
            OperationRequest::Service { name, operation } => {
                let target = ResourceKey::service(&name)?;
                let action = match operation {
                    ServiceOp::Query => Action::ServiceQuery,
                    ServiceOp::Start => Action::ServiceStart,
                    ServiceOp::Stop => Action::ServiceStop,
                    ServiceOp::Restart => Action::ServiceRestart,
                };
                Ok((target, action))
            }
            OperationRequest::Firewall { operation } => match operation {
                FirewallOp::Create { rule } => {
                    let name = rule
                        .name
                        .unwrap_or_else(|| format!("{}{}", RULE_NAME_PREFIX, uuid::Uuid::new_v4()));
                    let target = ResourceKey::firewall(&name)?;
                    let rule = FirewallRule {
                        name: target.body(),
                        direction: rule.direction,
                        protocol: rule.protocol,
                        port: rule.port,
                        action: rule.action,
                    };
                    Ok((target, Action::FirewallCreate(rule)))
                }
                FirewallOp::Delete { name } => {
                    Ok((ResourceKey::firewall(&name)?, Action::FirewallDelete))
                }
            },
            OperationRequest::Task { operation } => match operation {
                TaskOp::Create { mut task } => {
                    let target = ResourceKey::task(&task.name)?;
                    task.schedule.validate().map_err(SysgateError::InvalidRequest)?;
                    if task.command.trim().is_empty() {
                        return Err(SysgateError::InvalidRequest(format!(
                            "task {} has an empty command",
                            task.name
                        )));
                    }
                    task.name = target.body();
                    Ok((target, Action::TaskCreate(task)))
                }
                TaskOp::Delete { name } => Ok((ResourceKey::task(&name)?, Action::TaskDelete)),
            },
            OperationRequest::Process {
                command,
                background,
            } => {
                let target = ResourceKey::process_for_command(&command)?;
                Ok((target, Action::Launch { command, background }))
            }
        }
    }
}

/// A planned operation, with its target already resolved.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    RegistryGet,
    RegistrySet(RegistryValue),
    RegistryDelete,
    ServiceQuery,
    ServiceStart,
    ServiceStop,
    ServiceRestart,
    FirewallCreate(FirewallRule),
    FirewallDelete,
    TaskCreate(ScheduledTask),
    TaskDelete,
    Launch { command: String, background: bool },
}

impl Action {
    /// Dotted name used in the journal and audit trail.
    pub fn name(&self) -> &'static str {
        match self {
            Action::RegistryGet => "registry.get",
            Action::RegistrySet(_) => "registry.set",
            Action::RegistryDelete => "registry.delete",
            Action::ServiceQuery => "service.query",
            Action::ServiceStart => "service.start",
            Action::ServiceStop => "service.stop",
            Action::ServiceRestart => "service.restart",
            Action::FirewallCreate(_) => "firewall.create",
            Action::FirewallDelete => "firewall.delete",
            Action::TaskCreate(_) => "task.create",
            Action::TaskDelete => "task.delete",
            Action::Launch { .. } => "process.launch",
        }
    }

    /// The permission the action needs.
    pub fn operation(&self) -> Operation {
        match self {
            Action::RegistryGet | Action::ServiceQuery => Operation::Read,
            Action::Launch { .. } => Operation::Execute,
            _ => Operation::Write,
        }
    }

    pub fn severity(&self) -> AuditSeverity {
        match self {
            Action::RegistryGet | Action::ServiceQuery => AuditSeverity::Info,
            Action::FirewallCreate(_) | Action::FirewallDelete | Action::Launch { .. } => {
                AuditSeverity::Critical
            }
            _ => AuditSeverity::Warn,
        }
    }
}

/// What `apply` or `rollback` did.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// State changed; the entry describes how to undo it.
    Applied { entry: JournalEntry },
    /// Already in the requested state; nothing was done or journaled.
    Unchanged {
        resource_key: String,
        state: ResourceState,
    },
    /// A read.
    Current {
        resource_key: String,
        state: ResourceState,
    },
    /// A running service was stopped and started again; its state is unchanged.
    Restarted { resource_key: String },
    Launched { process: ProcessSnapshot },
    RolledBack { entry: JournalEntry },
    /// An elevated copy of this program performed the operation.
    HandedOff {
        resource_key: String,
        exit_code: Option<i32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TaskSchedule;

    #[test]
    fn registry_request_from_json() {
        let req: OperationRequest = serde_json::from_value(serde_json::json!({
            "resource_kind": "registry",
            "key": "HKEY_CURRENT_USER\\Software\\Test",
            "value_name": "v1",
            "operation": {"op": "set", "value": {"type": "string", "data": "v1"}}
        }))
        .unwrap();
        let (key, action) = req.plan().unwrap();
        assert_eq!(key.canonical(), "registry:HKCU\\Software\\Test\\v1");
        assert_eq!(action.name(), "registry.set");
        assert_eq!(action.operation(), Operation::Write);
    }

    #[test]
    fn firewall_create_from_json_allocates_name() {
        let req: OperationRequest = serde_json::from_value(serde_json::json!({
            "resource_kind": "firewall",
            "operation": {"op": "create", "protocol": "tcp", "port": 8080}
        }))
        .unwrap();
        let (key, action) = req.plan().unwrap();
        assert!(key.body().starts_with(RULE_NAME_PREFIX));
        match action {
            Action::FirewallCreate(rule) => {
                assert_eq!(rule.name, key.body());
                assert_eq!(rule.port, Some(8080));
                assert_eq!(rule.direction, Direction::In);
                assert_eq!(rule.action, RuleAction::Allow);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn task_schedule_is_validated() {
        let req = OperationRequest::task_create(ScheduledTask {
            name: "Backup".into(),
            command: "backup.exe".into(),
            schedule: TaskSchedule::Once { at: "25:00".into() },
        });
        assert!(matches!(req.plan(), Err(SysgateError::InvalidRequest(_))));
    }

    #[test]
    fn process_needs_execute() {
        let (key, action) = OperationRequest::process("/bin/echo hi", true).plan().unwrap();
        assert_eq!(key.canonical(), "process:/bin/echo hi");
        assert_eq!(action.operation(), Operation::Execute);
    }

    #[test]
    fn invalid_names_are_rejected_before_dispatch() {
        assert!(OperationRequest::service("a;b", ServiceOp::Start).plan().is_err());
        assert!(OperationRequest::registry_set("HKXX\\A", "v", RegistryValue::DWord(1))
            .plan()
            .is_err());
    }
}
