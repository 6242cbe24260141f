//! In-memory implementation of `SystemMutator`.
//!
//! Records every call and keeps fake registry, service, firewall, and task
//! state so the engine can be exercised without touching the host. Also backs
//! the CLI's `--simulate` mode.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{FirewallRule, RegistryValue, RuntimeError, ScheduledTask, ServiceState, SystemMutator};
use crate::resource::RegistryLocation;

// ---------------------------------------------------------------------------
// Call recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MutatorCall {
    ReadRegistry(String),
    WriteRegistry { location: String, value: RegistryValue },
    DeleteRegistry(String),
    ServiceState(String),
    StartService(String),
    StopService(String),
    PauseService(String),
    ResumeService(String),
    FirewallRule(String),
    CreateFirewallRule(String),
    DeleteFirewallRule(String),
    ScheduledTask(String),
    CreateTask(String),
    DeleteTask(String),
}

impl MutatorCall {
    /// Whether the call changes state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            MutatorCall::ReadRegistry(_)
                | MutatorCall::ServiceState(_)
                | MutatorCall::FirewallRule(_)
                | MutatorCall::ScheduledTask(_)
        )
    }
}

/// Injectable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Registry writes fail.
    Write,
    /// Registry, firewall, and task deletes fail.
    Delete,
    /// Service start fails.
    Start,
    /// Service stop fails.
    Stop,
    /// Firewall rule and task creation fail.
    Create,
    /// Registry writes apply, then report a timeout.
    Timeout,
}

// ---------------------------------------------------------------------------
// Mock state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<MutatorCall>,
    registry: HashMap<String, RegistryValue>,
    services: HashMap<String, ServiceState>,
    firewall: HashMap<String, FirewallRule>,
    tasks: HashMap<String, ScheduledTask>,
    faults: HashSet<Fault>,
    delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockMutator {
    inner: Mutex<Inner>,
}

fn location_id(location: &RegistryLocation) -> String {
    format!("{}\\{}", location.key_path(), location.value).to_lowercase()
}

fn location_label(location: &RegistryLocation) -> String {
    format!("{}\\{}", location.key_path(), location.value)
}

fn fail(what: &str, name: &str) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: format!("mock {}", what),
        code: Some(1),
        stderr: format!("injected failure for {}", name),
    }
}

impl MockMutator {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pre-populate a registry value.
    pub fn with_registry_value(self, key_path: &str, value_name: &str, value: RegistryValue) -> Self {
        if let Ok(location) = RegistryLocation::parse(key_path, value_name) {
            self.inner().registry.insert(location_id(&location), value);
        }
        self
    }

    /// Pre-populate a service in the given state.
    pub fn with_service(self, name: &str, state: ServiceState) -> Self {
        self.inner().services.insert(name.to_lowercase(), state);
        self
    }

    pub fn with_firewall_rule(self, rule: FirewallRule) -> Self {
        self.inner().firewall.insert(rule.name.to_lowercase(), rule);
        self
    }

    pub fn with_task(self, task: ScheduledTask) -> Self {
        self.inner().tasks.insert(task.name.to_lowercase(), task);
        self
    }

    /// Make every mutating call sleep first, widening race windows in tests.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.inner().delay = Some(delay);
        self
    }

    /// Make registry writes fail.
    pub fn fail_write(self) -> Self {
        self.set_fault(Fault::Write, true);
        self
    }

    /// Make deletes fail.
    pub fn fail_delete(self) -> Self {
        self.set_fault(Fault::Delete, true);
        self
    }

    /// Make service start fail.
    pub fn fail_start(self) -> Self {
        self.set_fault(Fault::Start, true);
        self
    }

    /// Make service stop fail.
    pub fn fail_stop(self) -> Self {
        self.set_fault(Fault::Stop, true);
        self
    }

    /// Make firewall rule and task creation fail.
    pub fn fail_create(self) -> Self {
        self.set_fault(Fault::Create, true);
        self
    }

    /// Make registry writes apply and then report a timeout.
    pub fn time_out_writes(self) -> Self {
        self.set_fault(Fault::Timeout, true);
        self
    }

    /// Toggle a fault after construction, e.g. to break rollback only.
    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        let mut inner = self.inner();
        if enabled {
            inner.faults.insert(fault);
        } else {
            inner.faults.remove(&fault);
        }
    }

    /// Return all recorded calls.
    pub fn calls(&self) -> Vec<MutatorCall> {
        self.inner().calls.clone()
    }

    /// Count how many times a specific call was made.
    pub fn call_count(&self, needle: &MutatorCall) -> usize {
        self.inner().calls.iter().filter(|c| *c == needle).count()
    }

    /// Number of recorded state-changing calls.
    pub fn mutation_count(&self) -> usize {
        self.inner().calls.iter().filter(|c| c.is_mutation()).count()
    }

    pub fn registry_value(&self, location: &RegistryLocation) -> Option<RegistryValue> {
        self.inner().registry.get(&location_id(location)).cloned()
    }

    pub fn service(&self, name: &str) -> Option<ServiceState> {
        self.inner().services.get(&name.to_lowercase()).copied()
    }

    pub fn rule(&self, name: &str) -> Option<FirewallRule> {
        self.inner().firewall.get(&name.to_lowercase()).cloned()
    }

    pub fn task(&self, name: &str) -> Option<ScheduledTask> {
        self.inner().tasks.get(&name.to_lowercase()).cloned()
    }

    /// Pause and continue only apply from one state, as with `sc`.
    fn control(
        &self,
        name: &str,
        what: &str,
        from: ServiceState,
        to: ServiceState,
    ) -> Result<(), RuntimeError> {
        match self.inner().services.get_mut(&name.to_lowercase()) {
            Some(state) if *state == from => {
                *state = to;
                Ok(())
            }
            Some(state) => Err(RuntimeError::Other(format!(
                "{} {}: service is {}",
                what, name, state
            ))),
            None => Err(RuntimeError::NotFound(format!("service {}", name))),
        }
    }

    /// Record `call`, then sleep for the configured delay outside the lock.
    async fn enter(&self, call: MutatorCall) {
        let delay = {
            let mut inner = self.inner();
            let delay = if call.is_mutation() { inner.delay } else { None };
            inner.calls.push(call);
            delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }

    fn faulted(&self, fault: Fault) -> bool {
        self.inner().faults.contains(&fault)
    }
}

#[async_trait]
impl SystemMutator for MockMutator {
    fn backend_id(&self) -> &'static str {
        "mock"
    }

    async fn read_registry_value(
        &self,
        location: &RegistryLocation,
    ) -> Result<Option<RegistryValue>, RuntimeError> {
        self.enter(MutatorCall::ReadRegistry(location_label(location)))
            .await;
        Ok(self.registry_value(location))
    }

    async fn write_registry_value(
        &self,
        location: &RegistryLocation,
        value: &RegistryValue,
    ) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::WriteRegistry {
            location: location_label(location),
            value: value.clone(),
        })
        .await;
        if self.faulted(Fault::Write) {
            return Err(fail("reg add", &location_label(location)));
        }
        self.inner()
            .registry
            .insert(location_id(location), value.clone());
        if self.faulted(Fault::Timeout) {
            return Err(RuntimeError::Timeout(format!(
                "reg add {}",
                location_label(location)
            )));
        }
        Ok(())
    }

    async fn delete_registry_value(&self, location: &RegistryLocation) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::DeleteRegistry(location_label(location)))
            .await;
        if self.faulted(Fault::Delete) {
            return Err(fail("reg delete", &location_label(location)));
        }
        match self.inner().registry.remove(&location_id(location)) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(location_label(location))),
        }
    }

    async fn service_state(&self, name: &str) -> Result<ServiceState, RuntimeError> {
        self.enter(MutatorCall::ServiceState(name.to_string())).await;
        self.service(name)
            .ok_or_else(|| RuntimeError::NotFound(format!("service {}", name)))
    }

    async fn start_service(&self, name: &str) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::StartService(name.to_string())).await;
        if self.faulted(Fault::Start) {
            return Err(fail("sc start", name));
        }
        match self.inner().services.get_mut(&name.to_lowercase()) {
            Some(state) => {
                *state = ServiceState::Running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("service {}", name))),
        }
    }

    async fn stop_service(&self, name: &str) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::StopService(name.to_string())).await;
        if self.faulted(Fault::Stop) {
            return Err(fail("sc stop", name));
        }
        match self.inner().services.get_mut(&name.to_lowercase()) {
            Some(state) => {
                *state = ServiceState::Stopped;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(format!("service {}", name))),
        }
    }

    async fn pause_service(&self, name: &str) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::PauseService(name.to_string())).await;
        self.control(name, "sc pause", ServiceState::Running, ServiceState::Paused)
    }

    async fn resume_service(&self, name: &str) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::ResumeService(name.to_string())).await;
        self.control(name, "sc continue", ServiceState::Paused, ServiceState::Running)
    }

    async fn firewall_rule(&self, name: &str) -> Result<Option<FirewallRule>, RuntimeError> {
        self.enter(MutatorCall::FirewallRule(name.to_string())).await;
        Ok(self.rule(name))
    }

    async fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::CreateFirewallRule(rule.name.clone()))
            .await;
        if self.faulted(Fault::Create) {
            return Err(fail("netsh add rule", &rule.name));
        }
        self.inner()
            .firewall
            .insert(rule.name.to_lowercase(), rule.clone());
        Ok(())
    }

    async fn delete_firewall_rule(&self, name: &str) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::DeleteFirewallRule(name.to_string()))
            .await;
        if self.faulted(Fault::Delete) {
            return Err(fail("netsh delete rule", name));
        }
        match self.inner().firewall.remove(&name.to_lowercase()) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(format!("firewall rule {}", name))),
        }
    }

    async fn scheduled_task(&self, name: &str) -> Result<Option<ScheduledTask>, RuntimeError> {
        self.enter(MutatorCall::ScheduledTask(name.to_string())).await;
        Ok(self.task(name))
    }

    async fn create_scheduled_task(&self, task: &ScheduledTask) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::CreateTask(task.name.clone())).await;
        if self.faulted(Fault::Create) {
            return Err(fail("schtasks /Create", &task.name));
        }
        self.inner()
            .tasks
            .insert(task.name.to_lowercase(), task.clone());
        Ok(())
    }

    async fn delete_scheduled_task(&self, name: &str) -> Result<(), RuntimeError> {
        self.enter(MutatorCall::DeleteTask(name.to_string())).await;
        if self.faulted(Fault::Delete) {
            return Err(fail("schtasks /Delete", name));
        }
        match self.inner().tasks.remove(&name.to_lowercase()) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(format!("task {}", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TaskSchedule;

    fn loc() -> RegistryLocation {
        RegistryLocation::parse("HKCU\\Software\\Test", "v1").unwrap()
    }

    #[tokio::test]
    async fn registry_is_case_insensitive() {
        let mock = MockMutator::new().with_registry_value(
            "HKCU\\SOFTWARE\\test",
            "V1",
            RegistryValue::DWord(1),
        );
        assert_eq!(
            mock.read_registry_value(&loc()).await.unwrap(),
            Some(RegistryValue::DWord(1))
        );
    }

    #[tokio::test]
    async fn delete_missing_value_is_not_found() {
        let mock = MockMutator::new();
        assert!(matches!(
            mock.delete_registry_value(&loc()).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_write_failure_leaves_state() {
        let mock = MockMutator::new().fail_write();
        assert!(mock
            .write_registry_value(&loc(), &RegistryValue::String("x".into()))
            .await
            .is_err());
        assert_eq!(mock.registry_value(&loc()), None);
        assert_eq!(mock.mutation_count(), 1);
    }

    #[tokio::test]
    async fn timeout_fault_still_applies() {
        let mock = MockMutator::new().time_out_writes();
        let result = mock
            .write_registry_value(&loc(), &RegistryValue::String("x".into()))
            .await;
        assert!(matches!(result, Err(RuntimeError::Timeout(_))));
        assert!(mock.registry_value(&loc()).is_some());
    }

    #[tokio::test]
    async fn pause_and_resume_need_matching_state() {
        let mock = MockMutator::new().with_service("Spooler", ServiceState::Stopped);
        assert!(mock.pause_service("Spooler").await.is_err());
        mock.start_service("Spooler").await.unwrap();
        mock.pause_service("Spooler").await.unwrap();
        assert_eq!(mock.service("spooler"), Some(ServiceState::Paused));
        mock.resume_service("Spooler").await.unwrap();
        assert_eq!(mock.service("spooler"), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn services_track_state() {
        let mock = MockMutator::new().with_service("Spooler", ServiceState::Stopped);
        mock.start_service("spooler").await.unwrap();
        assert_eq!(mock.service_state("Spooler").await.unwrap(), ServiceState::Running);
        assert!(matches!(
            mock.start_service("nope").await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_task_replaces_existing() {
        let mock = MockMutator::new();
        let mut task = ScheduledTask {
            name: "Backup".into(),
            command: "backup.exe".into(),
            schedule: TaskSchedule::OnLogon,
        };
        mock.create_scheduled_task(&task).await.unwrap();
        task.command = "backup2.exe".into();
        mock.create_scheduled_task(&task).await.unwrap();
        assert_eq!(mock.task("backup").unwrap().command, "backup2.exe");
        assert_eq!(mock.call_count(&MutatorCall::CreateTask("Backup".into())), 2);
    }
}
