//! The mutation engine: every system change goes through `apply`.
//!
//! An operation is planned, checked for privileges, serialized on its
//! resource key, authorized, journaled with the state it is about to
//! replace, and only then handed to the platform mutator. Anything that
//! changed OS state leaves an applied journal entry behind; anything that
//! did not leaves nothing.

mod locks;
pub mod request;

pub use request::{
    FirewallOp, FirewallRuleSpec, MutationOutcome, OperationRequest, RegistryOp, ServiceOp,
    TaskOp, RULE_NAME_PREFIX,
};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditActor, AuditEntry, AuditResult, AuditSeverity, AuditWriter};
use crate::config::EngineConfig;
use crate::elevation::{Elevated, ElevationError, OsElevator, PrivilegeElevator};
use crate::error::{SysgateError, SysgateResult};
use crate::journal::{JournalEntry, ResourceState, RollbackJournal, DEFAULT_CAPACITY};
use crate::permissions::{Operation, PermissionGate, PermissionPrompt, PermissionService};
use crate::resource::{RegistryLocation, ResourceKey};
use crate::runtime::{RuntimeError, ServiceState, SystemMutator};
use crate::supervisor::{ProcessSnapshot, ProcessSupervisor, SupervisorConfig};
use locks::KeyLocks;
use request::Action;

const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_ELEVATION_TIMEOUT: Duration = Duration::from_secs(120);

/// Whether changing `key` needs an elevated context. Per-user registry hives
/// and scheduled tasks do not; services, the firewall and machine-wide hives do.
pub fn requires_elevation(key: &ResourceKey) -> bool {
    match key {
        ResourceKey::Registry(loc) => loc.hive.is_machine_wide(),
        ResourceKey::Service { .. } | ResourceKey::Firewall { .. } => true,
        ResourceKey::Task { .. } | ResourceKey::Process { .. } => false,
    }
}

/// Service changes are only journaled from a state rollback can return to.
fn require_settled(key: &ResourceKey, prior: ServiceState) -> SysgateResult<()> {
    if prior == ServiceState::Unknown {
        return Err(SysgateError::InvalidRequest(format!(
            "{} is in a transitional state; retry once it settles",
            key
        )));
    }
    Ok(())
}

fn map_runtime(err: RuntimeError, key: &ResourceKey) -> SysgateError {
    match err {
        RuntimeError::NotFound(_) => SysgateError::ResourceNotFound(key.canonical()),
        RuntimeError::Timeout(msg) => SysgateError::OperationTimeout(msg),
        other => SysgateError::Runtime(other),
    }
}

fn context(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EngineBuilder {
    permissions: Arc<dyn PermissionService>,
    mutator: Arc<dyn SystemMutator>,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    prompt_timeout: Duration,
    journal: Option<Arc<RollbackJournal>>,
    elevator: Option<Arc<dyn PrivilegeElevator>>,
    supervisor: SupervisorConfig,
    audit: Option<AuditWriter>,
    actor: AuditActor,
    auto_elevate: bool,
}

impl EngineBuilder {
    /// Apply the tunables from `config`. The journal is loaded from the
    /// config's data directory.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.prompt_timeout = config.prompt_timeout();
        self.supervisor = config.supervisor();
        self.auto_elevate = config.auto_elevate;
        self.journal = Some(Arc::new(RollbackJournal::load(
            &config.journal_path(),
            config.journal_capacity,
        )));
        self
    }

    pub fn prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub fn journal(mut self, journal: Arc<RollbackJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn elevator(mut self, elevator: Arc<dyn PrivilegeElevator>) -> Self {
        self.elevator = Some(elevator);
        self
    }

    pub fn supervisor(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = config;
        self
    }

    pub fn audit(mut self, audit: AuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn actor(mut self, actor: AuditActor) -> Self {
        self.actor = actor;
        self
    }

    pub fn auto_elevate(mut self, enabled: bool) -> Self {
        self.auto_elevate = enabled;
        self
    }

    pub fn build(self) -> MutationEngine {
        let mut gate = PermissionGate::new(self.permissions).with_prompt_timeout(self.prompt_timeout);
        if let Some(prompt) = self.prompt {
            gate = gate.with_prompt(prompt);
        }
        if let Some(audit) = &self.audit {
            gate = gate.with_audit(audit.clone());
        }
        MutationEngine {
            gate,
            mutator: self.mutator,
            journal: self
                .journal
                .unwrap_or_else(|| Arc::new(RollbackJournal::in_memory(DEFAULT_CAPACITY))),
            supervisor: ProcessSupervisor::new(self.supervisor),
            elevator: self
                .elevator
                .unwrap_or_else(|| Arc::new(OsElevator::new(DEFAULT_ELEVATION_TIMEOUT))),
            locks: KeyLocks::default(),
            audit: self.audit,
            actor: self.actor,
            auto_elevate: self.auto_elevate,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MutationEngine {
    gate: PermissionGate,
    mutator: Arc<dyn SystemMutator>,
    journal: Arc<RollbackJournal>,
    supervisor: ProcessSupervisor,
    elevator: Arc<dyn PrivilegeElevator>,
    locks: KeyLocks,
    audit: Option<AuditWriter>,
    actor: AuditActor,
    auto_elevate: bool,
}

impl MutationEngine {
    pub fn builder(
        permissions: Arc<dyn PermissionService>,
        mutator: Arc<dyn SystemMutator>,
    ) -> EngineBuilder {
        EngineBuilder {
            permissions,
            mutator,
            prompt: None,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            journal: None,
            elevator: None,
            supervisor: SupervisorConfig::default(),
            audit: None,
            actor: AuditActor::Operator,
            auto_elevate: false,
        }
    }

    pub fn journal(&self) -> &Arc<RollbackJournal> {
        &self.journal
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionService> {
        self.gate.permissions()
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn is_elevated(&self) -> bool {
        self.elevator.is_elevated()
    }

    pub fn backend_id(&self) -> &'static str {
        self.mutator.backend_id()
    }

    /// Persist the journal and the permission store.
    pub fn flush(&self) -> SysgateResult<()> {
        self.journal.flush()?;
        self.permissions().persist()
    }

    /// Execute one request.
    pub async fn apply(&self, request: OperationRequest) -> SysgateResult<MutationOutcome> {
        let (key, action) = request.plan()?;
        let name = action.name();
        let severity = action.severity();
        log::debug!("{} on {}", name, key);
        let result = self.execute(&key, action).await;
        self.audit(name, severity, Some(key.canonical()), &result);
        result
    }

    async fn execute(&self, key: &ResourceKey, action: Action) -> SysgateResult<MutationOutcome> {
        let name = action.name();
        let operation = action.operation();
        match action {
            Action::RegistryGet => {
                self.gate.require(key, operation, HashMap::new()).await?;
                let loc = registry_location(key)?;
                let value = self
                    .mutator
                    .read_registry_value(loc)
                    .await
                    .map_err(|e| map_runtime(e, key))?;
                Ok(MutationOutcome::Current {
                    resource_key: key.canonical(),
                    state: ResourceState::registry(value),
                })
            }
            Action::ServiceQuery => {
                self.gate.require(key, operation, HashMap::new()).await?;
                let state = self.service_state(key).await?;
                Ok(MutationOutcome::Current {
                    resource_key: key.canonical(),
                    state: ResourceState::Service(state),
                })
            }
            Action::Launch {
                command,
                background,
            } => {
                let ctx = context(&[("command", command.clone())]);
                self.gate.require(key, operation, ctx).await?;
                let process = self.supervisor.launch(&command, background).await?;
                Ok(MutationOutcome::Launched { process })
            }
            action => {
                if requires_elevation(key) {
                    if let Some(outcome) = self.ensure_elevated(key, name).await? {
                        return Ok(outcome);
                    }
                }
                let _guard = self.locks.acquire(key).await?;
                self.gate
                    .require(key, operation, context(&[("action", name.to_string())]))
                    .await?;
                self.mutate(key, action).await
            }
        }
    }

    /// Runs with the key lock held and permission granted.
    async fn mutate(&self, key: &ResourceKey, action: Action) -> SysgateResult<MutationOutcome> {
        let name = action.name();
        match action {
            Action::RegistrySet(value) => {
                let loc = registry_location(key)?;
                let prior = self.read_registry(key).await?;
                let new = ResourceState::Registry(value.clone());
                if prior == new {
                    return Ok(self.unchanged(key, prior));
                }
                self.journaled(
                    key,
                    name,
                    prior,
                    new,
                    self.mutator.write_registry_value(loc, &value),
                )
                .await
            }
            Action::RegistryDelete => {
                let loc = registry_location(key)?;
                let prior = self.read_registry(key).await?;
                if prior.is_absent() {
                    return Err(SysgateError::ResourceNotFound(key.canonical()));
                }
                self.journaled(
                    key,
                    name,
                    prior,
                    ResourceState::Absent,
                    self.mutator.delete_registry_value(loc),
                )
                .await
            }
            Action::ServiceStart | Action::ServiceStop => {
                let service = service_name(key)?;
                let target = match action {
                    Action::ServiceStart => ServiceState::Running,
                    _ => ServiceState::Stopped,
                };
                let prior = self.service_state(key).await?;
                if prior == target {
                    return Ok(self.unchanged(key, ResourceState::Service(prior)));
                }
                require_settled(key, prior)?;
                let call = self.transition(service, prior, target);
                self.journaled(
                    key,
                    name,
                    ResourceState::Service(prior),
                    ResourceState::Service(target),
                    call,
                )
                .await
            }
            Action::ServiceRestart => self.restart(key, name).await,
            Action::FirewallCreate(rule) => {
                let prior = ResourceState::firewall(
                    self.mutator
                        .firewall_rule(&rule.name)
                        .await
                        .map_err(|e| map_runtime(e, key))?,
                );
                let new = ResourceState::FirewallRule(rule.clone());
                if prior == new {
                    return Ok(self.unchanged(key, prior));
                }
                self.journaled(key, name, prior, new, self.mutator.create_firewall_rule(&rule))
                    .await
            }
            Action::FirewallDelete => {
                let rule_name = key.body();
                let prior = self
                    .mutator
                    .firewall_rule(&rule_name)
                    .await
                    .map_err(|e| map_runtime(e, key))?
                    .ok_or_else(|| SysgateError::ResourceNotFound(key.canonical()))?;
                self.journaled(
                    key,
                    name,
                    ResourceState::FirewallRule(prior),
                    ResourceState::Absent,
                    self.mutator.delete_firewall_rule(&rule_name),
                )
                .await
            }
            Action::TaskCreate(task) => {
                let prior = ResourceState::task(
                    self.mutator
                        .scheduled_task(&task.name)
                        .await
                        .map_err(|e| map_runtime(e, key))?,
                );
                let new = ResourceState::Task(task.clone());
                if prior == new {
                    return Ok(self.unchanged(key, prior));
                }
                self.journaled(key, name, prior, new, self.mutator.create_scheduled_task(&task))
                    .await
            }
            Action::TaskDelete => {
                let task_name = key.body();
                let prior = self
                    .mutator
                    .scheduled_task(&task_name)
                    .await
                    .map_err(|e| map_runtime(e, key))?
                    .ok_or_else(|| SysgateError::ResourceNotFound(key.canonical()))?;
                self.journaled(
                    key,
                    name,
                    ResourceState::Task(prior),
                    ResourceState::Absent,
                    self.mutator.delete_scheduled_task(&task_name),
                )
                .await
            }
            Action::RegistryGet | Action::ServiceQuery | Action::Launch { .. } => Err(
                SysgateError::Other(format!("{} is not a journaled mutation", name)),
            ),
        }
    }

    /// Journal, run `change`, then commit or discard. A timed-out change may
    /// have taken effect, so its entry is kept.
    async fn journaled<F>(
        &self,
        key: &ResourceKey,
        operation: &str,
        prior: ResourceState,
        new: ResourceState,
        change: F,
    ) -> SysgateResult<MutationOutcome>
    where
        F: Future<Output = Result<(), RuntimeError>>,
    {
        let id = self.journal.begin(key, operation, prior, new)?;
        match change.await {
            Ok(()) => {
                let entry = self.journal.commit(id)?;
                log::info!("{} on {} applied (journal entry {})", operation, key, id);
                Ok(MutationOutcome::Applied { entry })
            }
            Err(RuntimeError::Timeout(msg)) => {
                self.journal.commit(id)?;
                log::warn!("{} on {} timed out; keeping journal entry {}", operation, key, id);
                Err(SysgateError::OperationTimeout(format!(
                    "{} on {} (journal entry {}): {}",
                    operation, key, id, msg
                )))
            }
            Err(e) => {
                self.journal.discard(id);
                log::warn!("{} on {} failed: {}", operation, key, e);
                Err(map_runtime(e, key))
            }
        }
    }

    /// Stop (when not already stopped) then start, journaled as one entry.
    async fn restart(&self, key: &ResourceKey, operation: &str) -> SysgateResult<MutationOutcome> {
        let service = service_name(key)?;
        let prior = self.service_state(key).await?;
        require_settled(key, prior)?;
        let id = self.journal.begin(
            key,
            operation,
            ResourceState::Service(prior),
            ResourceState::Service(ServiceState::Running),
        )?;

        if prior != ServiceState::Stopped {
            if let Err(e) = self.mutator.stop_service(service).await {
                log::warn!("Restart of {}: stop failed: {}", key, e);
                if matches!(e, RuntimeError::Timeout(_)) {
                    self.journal.commit_with(id, ResourceState::Service(ServiceState::Unknown))?;
                } else {
                    self.journal.discard(id);
                }
                return Err(map_runtime(e, key));
            }
        }

        if let Err(e) = self.mutator.start_service(service).await {
            log::warn!("Restart of {}: start failed: {}", key, e);
            if prior == ServiceState::Stopped && !matches!(e, RuntimeError::Timeout(_)) {
                // Nothing changed
                self.journal.discard(id);
                return Err(map_runtime(e, key));
            }
            let entry = self
                .journal
                .commit_with(id, ResourceState::Service(ServiceState::Stopped))?;
            return Err(SysgateError::PartialCompletion {
                operation: operation.to_string(),
                resource: key.canonical(),
                entry_id: entry.id,
                reason: format!("stopped but failed to start: {}", e),
            });
        }

        if prior == ServiceState::Running {
            self.journal.discard(id);
            log::info!("Restarted {}", key);
            return Ok(MutationOutcome::Restarted {
                resource_key: key.canonical(),
            });
        }
        let entry = self.journal.commit(id)?;
        Ok(MutationOutcome::Applied { entry })
    }

    // -- Rollback ------------------------------------------------------------

    /// Restore the state recorded before journal entry `entry_id`.
    ///
    /// On failure the entry stays applied so the rollback can be retried.
    pub async fn rollback(&self, entry_id: u64) -> SysgateResult<MutationOutcome> {
        let result = self.rollback_inner(entry_id).await;
        let subject = self.journal.get(entry_id).map(|e| e.resource_key);
        self.audit("journal.rollback", AuditSeverity::Warn, subject, &result);
        result
    }

    async fn rollback_inner(&self, entry_id: u64) -> SysgateResult<MutationOutcome> {
        let entry = self
            .journal
            .get(entry_id)
            .ok_or(SysgateError::JournalEntryNotFound(entry_id))?;
        if !entry.is_applied() {
            return Err(SysgateError::AlreadyRolledBack(entry_id));
        }
        let key = entry.target.clone();

        if requires_elevation(&key) {
            if let Some(outcome) = self.ensure_elevated(&key, "journal.rollback").await? {
                return Ok(outcome);
            }
        }
        let _guard = self.locks.acquire(&key).await?;
        self.gate
            .require(
                &key,
                Operation::Write,
                context(&[("rollback_of", entry_id.to_string())]),
            )
            .await?;

        // Another rollback may have won the lock first
        let entry = self
            .journal
            .get(entry_id)
            .ok_or(SysgateError::JournalEntryNotFound(entry_id))?;
        if !entry.is_applied() {
            return Err(SysgateError::AlreadyRolledBack(entry_id));
        }
        if self.journal.has_newer_applied(&entry) {
            log::warn!(
                "Rolling back entry {} on {} while newer changes to it are still applied",
                entry_id,
                key
            );
        }

        self.restore(&entry)
            .await
            .map_err(|e| SysgateError::RollbackFailed {
                entry_id,
                reason: e.to_string(),
            })?;
        let entry = self.journal.mark_rolled_back(entry_id)?;
        log::info!("Rolled back entry {} on {} to {}", entry_id, key, entry.prior_state);
        Ok(MutationOutcome::RolledBack { entry })
    }

    /// Roll back the most recent applied entry for `key`.
    pub async fn rollback_last(&self, key: &ResourceKey) -> SysgateResult<MutationOutcome> {
        let entry = self.journal.latest_applied(key).ok_or_else(|| {
            SysgateError::ResourceNotFound(format!("no applied journal entry for {}", key))
        })?;
        self.rollback(entry.id).await
    }

    async fn restore(&self, entry: &JournalEntry) -> Result<(), RuntimeError> {
        let m = &self.mutator;
        match (&entry.target, &entry.prior_state) {
            (ResourceKey::Registry(loc), ResourceState::Absent) => {
                ignore_missing(m.delete_registry_value(loc).await)
            }
            (ResourceKey::Registry(loc), ResourceState::Registry(value)) => {
                m.write_registry_value(loc, value).await
            }
            (ResourceKey::Service { name }, ResourceState::Service(target)) => {
                self.drive_service(name, *target).await
            }
            (ResourceKey::Firewall { name }, ResourceState::Absent) => {
                ignore_missing(m.delete_firewall_rule(name).await)
            }
            (ResourceKey::Firewall { .. }, ResourceState::FirewallRule(rule)) => {
                m.create_firewall_rule(rule).await
            }
            (ResourceKey::Task { name }, ResourceState::Absent) => {
                ignore_missing(m.delete_scheduled_task(name).await)
            }
            (ResourceKey::Task { .. }, ResourceState::Task(task)) => {
                m.create_scheduled_task(task).await
            }
            (target, prior) => Err(RuntimeError::Other(format!(
                "journal entry {} cannot restore {} to {}",
                entry.id, target, prior
            ))),
        }
    }

    async fn drive_service(&self, name: &str, target: ServiceState) -> Result<(), RuntimeError> {
        let current = self.mutator.service_state(name).await?;
        self.transition(name, current, target).await
    }

    /// Issue the controls that move a service from `from` to `to`.
    async fn transition(
        &self,
        name: &str,
        from: ServiceState,
        to: ServiceState,
    ) -> Result<(), RuntimeError> {
        let m = &self.mutator;
        match (from, to) {
            _ if from == to => Ok(()),
            (ServiceState::Paused, ServiceState::Running) => m.resume_service(name).await,
            (_, ServiceState::Running) => m.start_service(name).await,
            (_, ServiceState::Stopped) => m.stop_service(name).await,
            (ServiceState::Running, ServiceState::Paused) => m.pause_service(name).await,
            (_, ServiceState::Paused) => {
                m.start_service(name).await?;
                m.pause_service(name).await
            }
            (_, ServiceState::Unknown) => Err(RuntimeError::Other(format!(
                "service {} cannot be restored to {}",
                name, to
            ))),
        }
    }

    // -- Processes -----------------------------------------------------------

    pub fn process_status(&self, pid: u32) -> SysgateResult<ProcessSnapshot> {
        self.supervisor.status(pid)
    }

    pub fn list_processes(&self) -> Vec<ProcessSnapshot> {
        self.supervisor.list()
    }

    /// Kill a supervised process. Needs execute permission on its command line.
    pub async fn kill_process(&self, pid: u32) -> SysgateResult<ProcessSnapshot> {
        let snapshot = self.supervisor.status(pid)?;
        let key = ResourceKey::process_for_command(&snapshot.handle.command)?;
        let result: SysgateResult<ProcessSnapshot> = async {
            self.gate
                .require(&key, Operation::Execute, context(&[("pid", pid.to_string())]))
                .await?;
            self.supervisor.kill(pid).await
        }
        .await;
        self.record(
            AuditEntry::new(
                self.actor.clone(),
                AuditSeverity::Critical,
                "process.kill",
                Some(pid.to_string()),
                if result.is_ok() {
                    AuditResult::Success
                } else {
                    AuditResult::Failure
                },
            )
            .with_details(match &result {
                Ok(s) => serde_json::json!({ "status": s.handle.status.to_string() }),
                Err(e) => serde_json::json!({ "error": e.to_string(), "code": e.code() }),
            }),
        );
        result
    }

    // -- Helpers -------------------------------------------------------------

    /// `Ok(None)` to continue in this process, `Ok(Some(HandedOff))` when an
    /// elevated copy ran the operation instead.
    async fn ensure_elevated(
        &self,
        key: &ResourceKey,
        action: &str,
    ) -> SysgateResult<Option<MutationOutcome>> {
        if self.elevator.is_elevated() {
            return Ok(None);
        }
        if !self.auto_elevate {
            return Err(SysgateError::ElevationRequired(format!("{} on {}", action, key)));
        }

        let reason = format!("{} on {}", action, key);
        self.gate
            .require(key, Operation::Elevate, context(&[("reason", reason.clone())]))
            .await?;
        log::info!("Requesting elevation for {}", reason);
        match self.elevator.request_elevation(&reason).await {
            Ok(Elevated::InProcess) if self.elevator.is_elevated() => Ok(None),
            Ok(Elevated::InProcess) => Err(SysgateError::ElevationRequired(format!(
                "{}: elevation reported success but privileges are unchanged",
                reason
            ))),
            Ok(Elevated::HandedOff { exit_code }) => Ok(Some(MutationOutcome::HandedOff {
                resource_key: key.canonical(),
                exit_code,
            })),
            Err(ElevationError::Denied(msg)) => Err(SysgateError::PermissionDenied(format!(
                "elevation for {}: {}",
                reason, msg
            ))),
            Err(ElevationError::Timeout) => Err(SysgateError::OperationTimeout(format!(
                "elevation prompt for {}",
                reason
            ))),
            Err(ElevationError::Unsupported(msg)) => {
                Err(SysgateError::ElevationRequired(format!("{}: {}", reason, msg)))
            }
        }
    }

    async fn read_registry(&self, key: &ResourceKey) -> SysgateResult<ResourceState> {
        let loc = registry_location(key)?;
        self.mutator
            .read_registry_value(loc)
            .await
            .map(ResourceState::registry)
            .map_err(|e| map_runtime(e, key))
    }

    async fn service_state(&self, key: &ResourceKey) -> SysgateResult<ServiceState> {
        self.mutator
            .service_state(service_name(key)?)
            .await
            .map_err(|e| map_runtime(e, key))
    }

    fn unchanged(&self, key: &ResourceKey, state: ResourceState) -> MutationOutcome {
        log::debug!("{} already {}", key, state);
        MutationOutcome::Unchanged {
            resource_key: key.canonical(),
            state,
        }
    }

    fn audit(
        &self,
        action: &str,
        severity: AuditSeverity,
        subject: Option<String>,
        result: &SysgateResult<MutationOutcome>,
    ) {
        let (outcome, details) = match result {
            Ok(o) => (
                AuditResult::Success,
                serde_json::to_value(o).unwrap_or(serde_json::Value::Null),
            ),
            Err(e) => (
                AuditResult::Failure,
                serde_json::json!({ "error": e.to_string(), "code": e.code() }),
            ),
        };
        self.record(
            AuditEntry::new(self.actor.clone(), severity, action, subject, outcome)
                .with_details(details),
        );
    }

    fn record(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            audit.record(entry);
        }
    }
}

fn registry_location(key: &ResourceKey) -> SysgateResult<&RegistryLocation> {
    match key {
        ResourceKey::Registry(loc) => Ok(loc),
        other => Err(SysgateError::InvalidRequest(format!(
            "{} is not a registry value",
            other
        ))),
    }
}

fn service_name(key: &ResourceKey) -> SysgateResult<&str> {
    match key {
        ResourceKey::Service { name } => Ok(name),
        other => Err(SysgateError::InvalidRequest(format!("{} is not a service", other))),
    }
}

fn ignore_missing(result: Result<(), RuntimeError>) -> Result<(), RuntimeError> {
    match result {
        Err(RuntimeError::NotFound(what)) => {
            log::debug!("{} already absent", what);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elevation::{StaticElevator, StaticResponse};
    use crate::journal::EntryStatus;
    use crate::permissions::{
        AlwaysAllow, AlwaysDeny, DefaultPermissionService, PermissionRecord, PermissionStore,
    };
    use crate::runtime::mock::{Fault, MockMutator, MutatorCall};
    use crate::runtime::{FirewallRule, RegistryValue, ScheduledTask, TaskSchedule};

    fn permissions() -> Arc<dyn PermissionService> {
        Arc::new(DefaultPermissionService::new(PermissionStore::in_memory()))
    }

    fn engine(mock: Arc<MockMutator>) -> MutationEngine {
        MutationEngine::builder(permissions(), mock)
            .prompt(Arc::new(AlwaysAllow))
            .elevator(Arc::new(StaticElevator::elevated()))
            .build()
    }

    fn applied(outcome: MutationOutcome) -> JournalEntry {
        match outcome {
            MutationOutcome::Applied { entry } => entry,
            other => panic!("expected applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn registry_set_journals_prior_value() {
        let mock = Arc::new(MockMutator::new().with_registry_value(
            "HKCU\\Software\\Test",
            "v1",
            RegistryValue::String("old".into()),
        ));
        let engine = engine(mock.clone());

        let entry = applied(
            engine
                .apply(OperationRequest::registry_set(
                    "HKCU\\Software\\Test",
                    "v1",
                    RegistryValue::String("new".into()),
                ))
                .await
                .unwrap(),
        );
        assert_eq!(entry.prior_state, ResourceState::Registry(RegistryValue::String("old".into())));
        assert_eq!(entry.operation, "registry.set");

        engine.rollback(entry.id).await.unwrap();
        let loc = registry_location(&entry.target).unwrap();
        assert_eq!(mock.registry_value(loc), Some(RegistryValue::String("old".into())));
    }

    #[tokio::test]
    async fn rollback_of_created_value_deletes_it() {
        let mock = Arc::new(MockMutator::new());
        let engine = engine(mock.clone());
        let entry = applied(
            engine
                .apply(OperationRequest::registry_set(
                    "HKCU\\Software\\Test",
                    "fresh",
                    RegistryValue::DWord(1),
                ))
                .await
                .unwrap(),
        );
        assert!(entry.prior_state.is_absent());

        engine.rollback(entry.id).await.unwrap();
        assert_eq!(mock.registry_value(registry_location(&entry.target).unwrap()), None);
        assert!(matches!(
            engine.rollback(entry.id).await,
            Err(SysgateError::AlreadyRolledBack(id)) if id == entry.id
        ));
    }

    #[tokio::test]
    async fn failed_write_leaves_no_entry() {
        let mock = Arc::new(MockMutator::new().fail_write());
        let engine = engine(mock);
        let err = engine
            .apply(OperationRequest::registry_set("HKCU\\A\\B", "v", RegistryValue::DWord(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SysgateError::Runtime(_)));
        assert!(engine.journal().is_empty());
    }

    #[tokio::test]
    async fn timed_out_write_keeps_entry() {
        let mock = Arc::new(MockMutator::new().time_out_writes());
        let engine = engine(mock);
        let err = engine
            .apply(OperationRequest::registry_set("HKCU\\A\\B", "v", RegistryValue::DWord(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SysgateError::OperationTimeout(_)));
        assert_eq!(engine.journal().len(), 1);
        assert!(engine.journal().entries()[0].is_applied());
    }

    #[tokio::test]
    async fn denied_permission_never_reaches_mutator() {
        let mock = Arc::new(MockMutator::new());
        let engine = MutationEngine::builder(permissions(), mock.clone())
            .prompt(Arc::new(AlwaysDeny))
            .elevator(Arc::new(StaticElevator::elevated()))
            .build();
        let err = engine
            .apply(OperationRequest::registry_set("HKCU\\A\\B", "v", RegistryValue::DWord(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SysgateError::PermissionDenied(_)));
        assert_eq!(mock.mutation_count(), 0);
        assert!(engine.journal().is_empty());
    }

    #[tokio::test]
    async fn service_start_is_idempotent() {
        let mock = Arc::new(MockMutator::new().with_service("Spooler", ServiceState::Running));
        let engine = engine(mock.clone());
        let outcome = engine
            .apply(OperationRequest::service("Spooler", ServiceOp::Start))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Unchanged { .. }));
        assert_eq!(mock.call_count(&MutatorCall::StartService("Spooler".into())), 0);
        assert!(engine.journal().is_empty());
    }

    #[tokio::test]
    async fn restart_with_failed_start_is_partial() {
        let mock = Arc::new(
            MockMutator::new()
                .with_service("Spooler", ServiceState::Running)
                .fail_start(),
        );
        let engine = engine(mock.clone());
        let err = engine
            .apply(OperationRequest::service("Spooler", ServiceOp::Restart))
            .await
            .unwrap_err();
        let SysgateError::PartialCompletion { entry_id, .. } = err else {
            panic!("expected partial completion, got {:?}", err);
        };
        let entry = engine.journal().get(entry_id).unwrap();
        assert_eq!(entry.prior_state, ResourceState::Service(ServiceState::Running));
        assert_eq!(entry.new_state, ResourceState::Service(ServiceState::Stopped));
        assert_eq!(mock.service("Spooler"), Some(ServiceState::Stopped));

        mock.set_fault(Fault::Start, false);
        engine.rollback(entry_id).await.unwrap();
        assert_eq!(mock.service("Spooler"), Some(ServiceState::Running));
    }

    #[tokio::test]
    async fn restart_of_running_service_is_not_journaled() {
        let mock = Arc::new(MockMutator::new().with_service("Spooler", ServiceState::Running));
        let engine = engine(mock.clone());
        let outcome = engine
            .apply(OperationRequest::service("Spooler", ServiceOp::Restart))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Restarted { .. }));
        assert_eq!(mock.call_count(&MutatorCall::StopService("Spooler".into())), 1);
        assert_eq!(mock.call_count(&MutatorCall::StartService("Spooler".into())), 1);
        assert!(engine.journal().is_empty());
    }

    #[tokio::test]
    async fn stopping_a_paused_service_rolls_back_to_paused() {
        let mock = Arc::new(MockMutator::new().with_service("Spooler", ServiceState::Paused));
        let engine = engine(mock.clone());
        let MutationOutcome::Applied { entry } = engine
            .apply(OperationRequest::service("Spooler", ServiceOp::Stop))
            .await
            .unwrap()
        else {
            panic!("expected an applied stop");
        };
        assert_eq!(entry.prior_state, ResourceState::Service(ServiceState::Paused));
        assert_eq!(mock.service("Spooler"), Some(ServiceState::Stopped));

        engine.rollback(entry.id).await.unwrap();
        assert_eq!(mock.service("Spooler"), Some(ServiceState::Paused));
        assert_eq!(mock.call_count(&MutatorCall::PauseService("Spooler".into())), 1);
    }

    #[tokio::test]
    async fn starting_a_paused_service_continues_it() {
        let mock = Arc::new(MockMutator::new().with_service("Spooler", ServiceState::Paused));
        let engine = engine(mock.clone());
        let MutationOutcome::Applied { entry } = engine
            .apply(OperationRequest::service("Spooler", ServiceOp::Start))
            .await
            .unwrap()
        else {
            panic!("expected an applied start");
        };
        assert_eq!(mock.call_count(&MutatorCall::ResumeService("Spooler".into())), 1);
        assert_eq!(mock.call_count(&MutatorCall::StartService("Spooler".into())), 0);

        engine.rollback(entry.id).await.unwrap();
        assert_eq!(mock.service("Spooler"), Some(ServiceState::Paused));
    }

    #[tokio::test]
    async fn transitional_service_state_is_refused_before_mutating() {
        let mock = Arc::new(MockMutator::new().with_service("Spooler", ServiceState::Unknown));
        let engine = engine(mock.clone());
        for op in [ServiceOp::Stop, ServiceOp::Start, ServiceOp::Restart] {
            let err = engine
                .apply(OperationRequest::service("Spooler", op))
                .await
                .unwrap_err();
            assert!(matches!(err, SysgateError::InvalidRequest(_)), "got {:?}", err);
        }
        assert_eq!(mock.mutation_count(), 0);
        assert!(engine.journal().is_empty());
    }

    #[tokio::test]
    async fn unelevated_firewall_change_requires_elevation() {
        let mock = Arc::new(MockMutator::new());
        let elevator = Arc::new(StaticElevator::unelevated(StaticResponse::Grant));
        let engine = MutationEngine::builder(permissions(), mock.clone())
            .prompt(Arc::new(AlwaysAllow))
            .elevator(elevator.clone())
            .build();
        let err = engine
            .apply(OperationRequest::firewall_create(FirewallRuleSpec {
                name: Some("Allow 8080".into()),
                port: Some(8080),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, SysgateError::ElevationRequired(_)));
        assert_eq!(elevator.requests(), 0);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn auto_elevation_asks_once_and_proceeds() {
        let mock = Arc::new(MockMutator::new());
        let elevator = Arc::new(StaticElevator::unelevated(StaticResponse::Grant));
        let engine = MutationEngine::builder(permissions(), mock.clone())
            .prompt(Arc::new(AlwaysAllow))
            .elevator(elevator.clone())
            .auto_elevate(true)
            .build();
        let entry = applied(
            engine
                .apply(OperationRequest::firewall_create(FirewallRuleSpec {
                    name: Some("Allow 8080".into()),
                    port: Some(8080),
                    ..Default::default()
                }))
                .await
                .unwrap(),
        );
        assert_eq!(elevator.requests(), 1);
        assert!(entry.prior_state.is_absent());
        assert!(mock.rule("Allow 8080").is_some());
    }

    #[tokio::test]
    async fn handed_off_elevation_skips_local_mutation() {
        let mock = Arc::new(MockMutator::new().with_service("Spooler", ServiceState::Stopped));
        let engine = MutationEngine::builder(permissions(), mock.clone())
            .prompt(Arc::new(AlwaysAllow))
            .elevator(Arc::new(StaticElevator::unelevated(StaticResponse::HandOff)))
            .auto_elevate(true)
            .build();
        let outcome = engine
            .apply(OperationRequest::service("Spooler", ServiceOp::Start))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::HandedOff { exit_code: Some(0), .. }));
        assert_eq!(mock.mutation_count(), 0);
    }

    #[tokio::test]
    async fn task_create_then_delete_round_trip() {
        let mock = Arc::new(MockMutator::new());
        let engine = engine(mock.clone());
        let task = ScheduledTask {
            name: "Backup".into(),
            command: "backup.exe /all".into(),
            schedule: TaskSchedule::Daily { at: "02:30".into() },
        };
        applied(engine.apply(OperationRequest::task_create(task.clone())).await.unwrap());
        let deleted = applied(engine.apply(OperationRequest::task_delete("Backup")).await.unwrap());
        assert_eq!(deleted.prior_state, ResourceState::Task(task.clone()));
        assert!(mock.task("Backup").is_none());

        engine.rollback(deleted.id).await.unwrap();
        assert_eq!(mock.task("Backup"), Some(task));
    }

    #[tokio::test]
    async fn deleting_missing_rule_is_not_found() {
        let engine = engine(Arc::new(MockMutator::new()));
        assert!(matches!(
            engine.apply(OperationRequest::firewall_delete("nope")).await,
            Err(SysgateError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_rollback_keeps_entry_applied() {
        let rule = FirewallRule {
            name: "Block 25".into(),
            port: Some(25),
            ..Default::default()
        };
        let mock = Arc::new(MockMutator::new().with_firewall_rule(rule));
        let engine = engine(mock.clone());
        let entry = applied(engine.apply(OperationRequest::firewall_delete("Block 25")).await.unwrap());

        mock.set_fault(Fault::Create, true);
        assert!(matches!(
            engine.rollback(entry.id).await,
            Err(SysgateError::RollbackFailed { entry_id, .. }) if entry_id == entry.id
        ));
        assert_eq!(engine.journal().get(entry.id).unwrap().status, EntryStatus::Applied);

        mock.set_fault(Fault::Create, false);
        engine.rollback(entry.id).await.unwrap();
        assert!(mock.rule("Block 25").is_some());
    }

    #[tokio::test]
    async fn rollback_needs_write_permission() {
        let service = Arc::new(DefaultPermissionService::new(PermissionStore::in_memory()));
        service
            .grant(PermissionRecord::new("registry:HKCU\\A\\*", [Operation::Write], None))
            .unwrap();
        let mock = Arc::new(MockMutator::new());
        let engine = MutationEngine::builder(service.clone(), mock)
            .elevator(Arc::new(StaticElevator::elevated()))
            .build();
        let entry = applied(
            engine
                .apply(OperationRequest::registry_set("HKCU\\A", "v", RegistryValue::DWord(1)))
                .await
                .unwrap(),
        );

        service.revoke("registry:HKCU\\A\\*", None).unwrap();
        assert!(matches!(
            engine.rollback(entry.id).await,
            Err(SysgateError::PermissionDenied(_))
        ));
        assert!(engine.journal().get(entry.id).unwrap().is_applied());
    }

    #[tokio::test]
    async fn rollback_last_picks_newest_entry() {
        let mock = Arc::new(MockMutator::new());
        let engine = engine(mock.clone());
        for v in 1..=3 {
            engine
                .apply(OperationRequest::registry_set("HKCU\\A", "v", RegistryValue::DWord(v)))
                .await
                .unwrap();
        }
        let key = ResourceKey::registry("HKCU\\A", "v").unwrap();
        let outcome = engine.rollback_last(&key).await.unwrap();
        let MutationOutcome::RolledBack { entry } = outcome else {
            panic!("expected rollback");
        };
        assert_eq!(entry.prior_state, ResourceState::Registry(RegistryValue::DWord(2)));
        assert_eq!(
            mock.registry_value(registry_location(&key).unwrap()),
            Some(RegistryValue::DWord(2))
        );
    }

    #[tokio::test]
    async fn unknown_entry_is_reported() {
        let engine = engine(Arc::new(MockMutator::new()));
        assert!(matches!(
            engine.rollback(99).await,
            Err(SysgateError::JournalEntryNotFound(99))
        ));
    }
}
