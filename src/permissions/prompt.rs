use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::types::Operation;
use crate::resource::ResourceKind;

/// The answer to a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantDecision {
    pub allow: bool,
    /// Grant lifetime in seconds; `None` with `allow = true` is permanent.
    pub duration: Option<u64>,
}

impl GrantDecision {
    pub fn deny() -> Self {
        Self {
            allow: false,
            duration: None,
        }
    }

    pub fn allow_permanently() -> Self {
        Self {
            allow: true,
            duration: None,
        }
    }

    pub fn allow_for(secs: u64) -> Self {
        Self {
            allow: true,
            duration: Some(secs),
        }
    }
}

/// What the user is being asked to approve.
///
/// `context` carries kind-specific details (e.g. `value` for a registry
/// write, `port`/`direction` for a firewall rule, `reason` for elevation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    pub id: String,
    pub resource_key: String,
    pub resource_kind: ResourceKind,
    pub operation: Operation,
    pub context: HashMap<String, String>,
}

/// Synchronous permission prompt, injected into the gate at construction.
///
/// The gate calls it on a blocking thread and bounds the wait, so an
/// implementation may block on a dialog or a terminal read.
pub trait PermissionPrompt: Send + Sync {
    fn decide(&self, request: &PromptRequest) -> GrantDecision;
}

impl<F> PermissionPrompt for F
where
    F: Fn(&PromptRequest) -> GrantDecision + Send + Sync,
{
    fn decide(&self, request: &PromptRequest) -> GrantDecision {
        self(request)
    }
}

/// Approves everything permanently. For tests and trusted automation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

impl PermissionPrompt for AlwaysAllow {
    fn decide(&self, _request: &PromptRequest) -> GrantDecision {
        GrantDecision::allow_permanently()
    }
}

/// Denies everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysDeny;

impl PermissionPrompt for AlwaysDeny {
    fn decide(&self, _request: &PromptRequest) -> GrantDecision {
        GrantDecision::deny()
    }
}

/// Bridge between the gate's synchronous prompt and an asynchronous UI.
///
/// `decide` publishes the request on a channel the UI consumes, then blocks
/// until the UI calls [`PromptBridge::respond`] with the same request ID or
/// the timeout passes. Timeouts and dropped responders deny.
pub struct PromptBridge {
    pending: Mutex<HashMap<String, std_mpsc::SyncSender<GrantDecision>>>,
    events: mpsc::UnboundedSender<PromptRequest>,
    timeout: Duration,
}

impl PromptBridge {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<PromptRequest>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: Mutex::new(HashMap::new()),
                events,
                timeout,
            },
            rx,
        )
    }

    /// Called by the UI when the user answers.
    ///
    /// Returns `true` if the request was found and the decision was delivered.
    pub fn respond(&self, request_id: &str, decision: GrantDecision) -> bool {
        let tx = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(request_id)
        };

        match tx {
            Some(sender) => sender.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl PermissionPrompt for PromptBridge {
    fn decide(&self, request: &PromptRequest) -> GrantDecision {
        let (tx, rx) = std_mpsc::sync_channel(1);
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(request.id.clone(), tx);
        }

        if self.events.send(request.clone()).is_err() {
            log::warn!("Prompt UI is gone, denying {}", request.resource_key);
        }

        let decision = rx.recv_timeout(self.timeout);

        // Clean up if still pending (timeout or UI gone)
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&request.id);
        }

        decision.unwrap_or_else(|_| GrantDecision::deny())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(id: &str) -> PromptRequest {
        PromptRequest {
            id: id.to_string(),
            resource_key: "service:Spooler".into(),
            resource_kind: ResourceKind::Service,
            operation: Operation::Write,
            context: HashMap::new(),
        }
    }

    #[test]
    fn closures_are_prompts() {
        let prompt = |req: &PromptRequest| {
            if req.operation == Operation::Read {
                GrantDecision::allow_for(60)
            } else {
                GrantDecision::deny()
            }
        };
        assert!(!prompt.decide(&request("a")).allow);
    }

    #[test]
    fn stubs_are_deterministic() {
        assert_eq!(AlwaysAllow.decide(&request("a")), GrantDecision::allow_permanently());
        assert_eq!(AlwaysDeny.decide(&request("a")), GrantDecision::deny());
    }

    #[test]
    fn bridge_delivers_ui_response() {
        let (bridge, mut rx) = PromptBridge::new(Duration::from_secs(5));
        let bridge = Arc::new(bridge);

        let ui = {
            let bridge = bridge.clone();
            std::thread::spawn(move || {
                let req = rx.blocking_recv().unwrap();
                assert!(bridge.respond(&req.id, GrantDecision::allow_for(30)));
            })
        };

        let decision = bridge.decide(&request("req-1"));
        ui.join().unwrap();
        assert_eq!(decision, GrantDecision::allow_for(30));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[test]
    fn bridge_times_out_to_deny() {
        let (bridge, _rx) = PromptBridge::new(Duration::from_millis(20));
        assert_eq!(bridge.decide(&request("req-2")), GrantDecision::deny());
        assert_eq!(bridge.pending_count(), 0);
        assert!(!bridge.respond("req-2", GrantDecision::allow_permanently()));
    }
}
