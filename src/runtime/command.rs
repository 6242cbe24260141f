//! `SystemMutator` backed by the stock Windows command-line tools.
//!
//! Every call runs one of `reg.exe`, `sc.exe`, `netsh advfirewall` or
//! `schtasks.exe` with an argument vector (never a shell string). Output
//! parsing lives in plain functions so it can be tested on any platform.

use std::process::{Output, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use super::{
    Direction, FirewallRule, Protocol, RegistryValue, RuleAction, RuntimeError, ScheduledTask,
    ServiceState, SystemMutator, TaskSchedule,
};
use crate::resource::RegistryLocation;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// `sc` exit code for "The specified service does not exist".
const SC_SERVICE_DOES_NOT_EXIST: i32 = 1060;
/// `sc start` on a running service.
const SC_ALREADY_RUNNING: i32 = 1056;
/// `sc stop` on a stopped service.
const SC_NOT_ACTIVE: i32 = 1062;

pub struct CommandMutator {
    /// How long `start_service`/`stop_service` wait for the target state.
    service_timeout: Duration,
}

impl CommandMutator {
    pub fn new(service_timeout: Duration) -> Self {
        Self { service_timeout }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<Output, RuntimeError> {
        let display = format!("{} {}", program, args.join(" "));
        log::debug!("exec: {}", display);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(RuntimeError::Timeout(display)),
        }
    }

    /// Run and require a zero exit code.
    async fn run_ok(&self, program: &str, args: &[String]) -> Result<Output, RuntimeError> {
        let output = self.run(program, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(command_failed(program, args, &output))
        }
    }

    /// `sc pause` / `sc continue`, then wait for the service to settle.
    async fn control_service(
        &self,
        verb: &str,
        name: &str,
        target: ServiceState,
    ) -> Result<(), RuntimeError> {
        let a = args([verb, name]);
        let output = self.run("sc", &a).await?;
        match output.status.code() {
            Some(0) => {}
            Some(SC_SERVICE_DOES_NOT_EXIST) => {
                return Err(RuntimeError::NotFound(format!("service {}", name)))
            }
            _ => return Err(command_failed("sc", &a, &output)),
        }
        self.wait_for_state(name, target).await
    }

    async fn wait_for_state(&self, name: &str, target: ServiceState) -> Result<(), RuntimeError> {
        let deadline = tokio::time::Instant::now() + self.service_timeout;
        loop {
            if self.service_state(name).await? == target {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RuntimeError::Timeout(format!(
                    "service {} did not reach {} within {:?}",
                    name, target, self.service_timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn command_failed(program: &str, args: &[String], output: &Output) -> RuntimeError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stderr = if stderr.is_empty() {
        // reg/sc/schtasks often report errors on stdout
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr
    };
    RuntimeError::CommandFailed {
        command: format!("{} {}", program, args.join(" ")),
        code: output.status.code(),
        stderr,
    }
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Argument builders
// ---------------------------------------------------------------------------

fn value_selector(location: &RegistryLocation) -> Vec<String> {
    match location.value_name() {
        Some(name) => args(["/v", name]),
        None => args(["/ve"]),
    }
}

pub(crate) fn reg_query_args(location: &RegistryLocation) -> Vec<String> {
    let mut a = args(["query", &location.key_path()]);
    a.extend(value_selector(location));
    a
}

pub(crate) fn reg_add_args(location: &RegistryLocation, value: &RegistryValue) -> Vec<String> {
    let mut a = args(["add", &location.key_path()]);
    a.extend(value_selector(location));
    a.extend(args(["/t", value.reg_type(), "/d", &value.to_reg_data(), "/f"]));
    a
}

pub(crate) fn reg_delete_args(location: &RegistryLocation) -> Vec<String> {
    let mut a = args(["delete", &location.key_path()]);
    a.extend(value_selector(location));
    a.push("/f".to_string());
    a
}

pub(crate) fn netsh_add_args(rule: &FirewallRule) -> Vec<String> {
    let mut a = args([
        "advfirewall",
        "firewall",
        "add",
        "rule",
        &format!("name={}", rule.name),
        match rule.direction {
            Direction::In => "dir=in",
            Direction::Out => "dir=out",
        },
        match rule.action {
            RuleAction::Allow => "action=allow",
            RuleAction::Block => "action=block",
        },
        match rule.protocol {
            Protocol::Tcp => "protocol=TCP",
            Protocol::Udp => "protocol=UDP",
            Protocol::Any => "protocol=any",
        },
    ]);
    // netsh only accepts a port with TCP or UDP
    if let (Some(port), Protocol::Tcp | Protocol::Udp) = (rule.port, rule.protocol) {
        a.push(format!("localport={}", port));
    }
    a
}

pub(crate) fn schtasks_create_args(task: &ScheduledTask) -> Vec<String> {
    let mut a = args(["/Create", "/TN", &task.name, "/TR", &task.command]);
    match &task.schedule {
        TaskSchedule::Once { at } => a.extend(args(["/SC", "ONCE", "/ST", at])),
        TaskSchedule::Daily { at } => a.extend(args(["/SC", "DAILY", "/ST", at])),
        TaskSchedule::OnLogon => a.extend(args(["/SC", "ONLOGON"])),
        TaskSchedule::OnStart => a.extend(args(["/SC", "ONSTART"])),
    }
    a.push("/F".to_string());
    a
}

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

fn reg_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s+(.*?)\s+(REG_[A-Z_]+)(?:\s+(.*))?$").unwrap())
}

/// Extract the value from `reg query` output.
pub(crate) fn parse_reg_query(stdout: &str) -> Result<Option<RegistryValue>, RuntimeError> {
    for line in stdout.lines() {
        if let Some(caps) = reg_line_regex().captures(line) {
            let reg_type = &caps[2];
            let data = caps.get(3).map(|m| m.as_str().trim_end()).unwrap_or("");
            return RegistryValue::from_reg_output(reg_type, data).map(Some);
        }
    }
    Ok(None)
}

fn sc_state_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"STATE\s*:\s*(\d+)").unwrap())
}

/// Map `sc query` output to a service state. Pending states are `Unknown`.
pub(crate) fn parse_sc_state(stdout: &str) -> ServiceState {
    let code = sc_state_regex()
        .captures(stdout)
        .and_then(|c| c[1].parse::<u32>().ok());
    match code {
        Some(1) => ServiceState::Stopped,
        Some(4) => ServiceState::Running,
        Some(7) => ServiceState::Paused,
        _ => ServiceState::Unknown,
    }
}

/// `Field:   value` lines, as printed by `netsh` and `schtasks /FO LIST`.
fn field_lines(stdout: &str) -> impl Iterator<Item = (String, &str)> {
    stdout.lines().filter_map(|line| {
        let (field, value) = line.split_once(':')?;
        let field = field.trim();
        if field.is_empty() || field.contains("  ") {
            return None;
        }
        Some((field.to_ascii_lowercase(), value.trim()))
    })
}

pub(crate) fn parse_netsh_rule(name: &str, stdout: &str) -> Option<FirewallRule> {
    let mut rule = FirewallRule {
        name: name.to_string(),
        direction: Direction::In,
        protocol: Protocol::Any,
        port: None,
        action: RuleAction::Allow,
    };
    let mut seen = false;
    for (field, value) in field_lines(stdout) {
        match field.as_str() {
            "rule name" => seen = true,
            "direction" => {
                rule.direction = if value.eq_ignore_ascii_case("out") {
                    Direction::Out
                } else {
                    Direction::In
                }
            }
            "protocol" => {
                rule.protocol = match value.to_ascii_uppercase().as_str() {
                    "TCP" => Protocol::Tcp,
                    "UDP" => Protocol::Udp,
                    _ => Protocol::Any,
                }
            }
            "localport" => rule.port = value.parse().ok(),
            "action" => {
                rule.action = if value.eq_ignore_ascii_case("block") {
                    RuleAction::Block
                } else {
                    RuleAction::Allow
                }
            }
            _ => {}
        }
    }
    seen.then_some(rule)
}

fn clock_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2}):(\d{2})(?::\d{2})?\s*([AaPp][Mm])?").unwrap())
}

/// Normalize `11:59:00 PM` or `23:59:00` to `23:59`.
fn normalize_clock(value: &str) -> Option<String> {
    let caps = clock_regex().captures(value)?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    if let Some(meridiem) = caps.get(3) {
        let pm = meridiem.as_str().eq_ignore_ascii_case("pm");
        hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, true) => h + 12,
            (h, false) => h,
        };
    }
    (hour < 24 && minute < 60).then(|| format!("{:02}:{:02}", hour, minute))
}

pub(crate) fn parse_schtasks_list(name: &str, stdout: &str) -> Option<ScheduledTask> {
    let mut command = None;
    let mut schedule_type = None;
    let mut start_time = None;
    for (field, value) in field_lines(stdout) {
        match field.as_str() {
            "task to run" => command = Some(value.to_string()),
            "schedule type" => schedule_type = Some(value.to_ascii_lowercase()),
            "start time" => start_time = normalize_clock(value),
            _ => {}
        }
    }

    let schedule_type = schedule_type?;
    let schedule = if schedule_type.contains("one time") {
        TaskSchedule::Once { at: start_time? }
    } else if schedule_type.contains("daily") {
        TaskSchedule::Daily { at: start_time? }
    } else if schedule_type.contains("logon") {
        TaskSchedule::OnLogon
    } else if schedule_type.contains("start") {
        TaskSchedule::OnStart
    } else {
        log::warn!("Unrecognized schedule type for task {}: {}", name, schedule_type);
        return None;
    };

    Some(ScheduledTask {
        name: name.to_string(),
        command: command?,
        schedule,
    })
}

// ---------------------------------------------------------------------------
// SystemMutator
// ---------------------------------------------------------------------------

#[async_trait]
impl SystemMutator for CommandMutator {
    fn backend_id(&self) -> &'static str {
        "windows-cli"
    }

    async fn read_registry_value(
        &self,
        location: &RegistryLocation,
    ) -> Result<Option<RegistryValue>, RuntimeError> {
        let output = self.run("reg", &reg_query_args(location)).await?;
        // reg exits 1 when the key or value does not exist
        match output.status.code() {
            Some(0) => parse_reg_query(&String::from_utf8_lossy(&output.stdout)),
            Some(1) => Ok(None),
            _ => Err(command_failed("reg", &reg_query_args(location), &output)),
        }
    }

    async fn write_registry_value(
        &self,
        location: &RegistryLocation,
        value: &RegistryValue,
    ) -> Result<(), RuntimeError> {
        self.run_ok("reg", &reg_add_args(location, value)).await?;
        Ok(())
    }

    async fn delete_registry_value(&self, location: &RegistryLocation) -> Result<(), RuntimeError> {
        if self.read_registry_value(location).await?.is_none() {
            return Err(RuntimeError::NotFound(format!(
                "{}\\{}",
                location.key_path(),
                location.value
            )));
        }
        self.run_ok("reg", &reg_delete_args(location)).await?;
        Ok(())
    }

    async fn service_state(&self, name: &str) -> Result<ServiceState, RuntimeError> {
        let a = args(["query", name]);
        let output = self.run("sc", &a).await?;
        match output.status.code() {
            Some(0) => Ok(parse_sc_state(&String::from_utf8_lossy(&output.stdout))),
            Some(SC_SERVICE_DOES_NOT_EXIST) => Err(RuntimeError::NotFound(format!("service {}", name))),
            _ => Err(command_failed("sc", &a, &output)),
        }
    }

    async fn start_service(&self, name: &str) -> Result<(), RuntimeError> {
        let a = args(["start", name]);
        let output = self.run("sc", &a).await?;
        match output.status.code() {
            Some(0) | Some(SC_ALREADY_RUNNING) => {}
            Some(SC_SERVICE_DOES_NOT_EXIST) => {
                return Err(RuntimeError::NotFound(format!("service {}", name)))
            }
            _ => return Err(command_failed("sc", &a, &output)),
        }
        self.wait_for_state(name, ServiceState::Running).await
    }

    async fn stop_service(&self, name: &str) -> Result<(), RuntimeError> {
        let a = args(["stop", name]);
        let output = self.run("sc", &a).await?;
        match output.status.code() {
            Some(0) | Some(SC_NOT_ACTIVE) => {}
            Some(SC_SERVICE_DOES_NOT_EXIST) => {
                return Err(RuntimeError::NotFound(format!("service {}", name)))
            }
            _ => return Err(command_failed("sc", &a, &output)),
        }
        self.wait_for_state(name, ServiceState::Stopped).await
    }

    async fn pause_service(&self, name: &str) -> Result<(), RuntimeError> {
        self.control_service("pause", name, ServiceState::Paused).await
    }

    async fn resume_service(&self, name: &str) -> Result<(), RuntimeError> {
        self.control_service("continue", name, ServiceState::Running).await
    }

    async fn firewall_rule(&self, name: &str) -> Result<Option<FirewallRule>, RuntimeError> {
        let a = args([
            "advfirewall",
            "firewall",
            "show",
            "rule",
            &format!("name={}", name),
            "verbose",
        ]);
        let output = self.run("netsh", &a).await?;
        // netsh exits 1 with "No rules match the specified criteria."
        if !output.status.success() {
            return Ok(None);
        }
        Ok(parse_netsh_rule(name, &String::from_utf8_lossy(&output.stdout)))
    }

    async fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<(), RuntimeError> {
        // netsh allows duplicate names; replace instead
        if self.firewall_rule(&rule.name).await?.is_some() {
            self.delete_firewall_rule(&rule.name).await?;
        }
        self.run_ok("netsh", &netsh_add_args(rule)).await?;
        Ok(())
    }

    async fn delete_firewall_rule(&self, name: &str) -> Result<(), RuntimeError> {
        let a = args([
            "advfirewall",
            "firewall",
            "delete",
            "rule",
            &format!("name={}", name),
        ]);
        let output = self.run("netsh", &a).await?;
        if output.status.success() {
            Ok(())
        } else if self.firewall_rule(name).await?.is_none() {
            Err(RuntimeError::NotFound(format!("firewall rule {}", name)))
        } else {
            Err(command_failed("netsh", &a, &output))
        }
    }

    async fn scheduled_task(&self, name: &str) -> Result<Option<ScheduledTask>, RuntimeError> {
        let a = args(["/Query", "/TN", name, "/FO", "LIST", "/V"]);
        let output = self.run("schtasks", &a).await?;
        if !output.status.success() {
            return Ok(None);
        }
        match parse_schtasks_list(name, &String::from_utf8_lossy(&output.stdout)) {
            Some(task) => Ok(Some(task)),
            None => Err(RuntimeError::Other(format!(
                "task {} exists but its definition could not be read",
                name
            ))),
        }
    }

    async fn create_scheduled_task(&self, task: &ScheduledTask) -> Result<(), RuntimeError> {
        self.run_ok("schtasks", &schtasks_create_args(task)).await?;
        Ok(())
    }

    async fn delete_scheduled_task(&self, name: &str) -> Result<(), RuntimeError> {
        if self.scheduled_task(name).await?.is_none() {
            return Err(RuntimeError::NotFound(format!("task {}", name)));
        }
        self.run_ok("schtasks", &args(["/Delete", "/TN", name, "/F"]))
            .await?;
        Ok(())
    }
}
