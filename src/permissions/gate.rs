use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::prompt::{GrantDecision, PermissionPrompt, PromptRequest};
use super::service::PermissionService;
use super::types::{Operation, PermissionRecord};
use crate::audit::writer::AuditWriter;
use crate::audit::{AuditActor, AuditEntry, AuditResult, AuditSeverity};
use crate::error::{SysgateError, SysgateResult};
use crate::resource::ResourceKey;

const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied,
}

impl Authorization {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Authorization::Allowed)
    }
}

/// How a gate decision was reached, for the audit trail.
#[derive(Debug, Clone, Copy)]
enum Source {
    Record,
    Prompt,
    NoPrompt,
    Timeout,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Source::Record => "record",
            Source::Prompt => "prompt",
            Source::NoPrompt => "no_prompt",
            Source::Timeout => "timeout",
        }
    }
}

/// Decides whether an operation on a resource may proceed.
///
/// Stored grants are consulted first. Without one, the injected prompt is
/// asked; an approval is written back to the store before `Allowed` is
/// returned. No prompt, a denial, or a prompt that outlives its timeout all
/// yield `Denied`.
pub struct PermissionGate {
    permissions: Arc<dyn PermissionService>,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    prompt_timeout: Duration,
    audit: Option<AuditWriter>,
}

impl PermissionGate {
    pub fn new(permissions: Arc<dyn PermissionService>) -> Self {
        Self {
            permissions,
            prompt: None,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            audit: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub fn with_audit(mut self, audit: AuditWriter) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionService> {
        &self.permissions
    }

    pub async fn authorize(&self, key: &ResourceKey, operation: Operation) -> Authorization {
        self.authorize_with(key, operation, HashMap::new()).await
    }

    /// Like [`authorize`](Self::authorize), passing `context` through to the prompt.
    pub async fn authorize_with(
        &self,
        key: &ResourceKey,
        operation: Operation,
        context: HashMap<String, String>,
    ) -> Authorization {
        if let Some(record) = self.permissions.find(key, operation) {
            log::debug!(
                "{} on {} allowed by {}",
                operation,
                key,
                record.resource_pattern
            );
            self.record(key, operation, Authorization::Allowed, Source::Record);
            return Authorization::Allowed;
        }

        let Some(prompt) = self.prompt.clone() else {
            log::info!("{} on {} denied: no grant and no prompt", operation, key);
            self.record(key, operation, Authorization::Denied, Source::NoPrompt);
            return Authorization::Denied;
        };

        let request = PromptRequest {
            id: uuid::Uuid::new_v4().to_string(),
            resource_key: key.canonical(),
            resource_kind: key.kind(),
            operation,
            context,
        };

        let decision = tokio::time::timeout(
            self.prompt_timeout,
            tokio::task::spawn_blocking(move || prompt.decide(&request)),
        )
        .await;

        let decision = match decision {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                log::error!("Permission prompt panicked: {}", e);
                GrantDecision::deny()
            }
            Err(_) => {
                log::warn!("Permission prompt for {} on {} timed out", operation, key);
                self.record(key, operation, Authorization::Denied, Source::Timeout);
                return Authorization::Denied;
            }
        };

        if !decision.allow {
            log::info!("{} on {} denied by prompt", operation, key);
            self.record(key, operation, Authorization::Denied, Source::Prompt);
            return Authorization::Denied;
        }

        let record = PermissionRecord::new(key.canonical(), [operation], decision.duration);
        if let Err(e) = self.permissions.grant(record) {
            log::error!("Failed to persist grant for {} on {}: {}", operation, key, e);
        }
        self.record(key, operation, Authorization::Allowed, Source::Prompt);
        Authorization::Allowed
    }

    /// `authorize`, mapped onto `PermissionDenied`.
    pub async fn require(
        &self,
        key: &ResourceKey,
        operation: Operation,
        context: HashMap<String, String>,
    ) -> SysgateResult<()> {
        match self.authorize_with(key, operation, context).await {
            Authorization::Allowed => Ok(()),
            Authorization::Denied => Err(SysgateError::PermissionDenied(format!(
                "{} on {}",
                operation, key
            ))),
        }
    }

    fn record(&self, key: &ResourceKey, operation: Operation, outcome: Authorization, source: Source) {
        let Some(audit) = &self.audit else {
            return;
        };
        let severity = match operation {
            Operation::Read => AuditSeverity::Info,
            Operation::Write => AuditSeverity::Warn,
            Operation::Execute | Operation::Elevate => AuditSeverity::Critical,
        };
        let (actor, result) = match (source, outcome) {
            (Source::Prompt, Authorization::Allowed) => (AuditActor::Operator, AuditResult::Success),
            (Source::Prompt, Authorization::Denied) => (AuditActor::Operator, AuditResult::Failure),
            (_, Authorization::Allowed) => (AuditActor::System, AuditResult::Success),
            (_, Authorization::Denied) => (AuditActor::System, AuditResult::Failure),
        };
        audit.record(
            AuditEntry::new(actor, severity, "gate.authorize", Some(key.canonical()), result)
                .with_details(serde_json::json!({
                    "operation": operation.as_str(),
                    "source": source.as_str(),
                })),
        );
    }
}
