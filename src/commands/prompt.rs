use dialoguer::Select;

use crate::permissions::{GrantDecision, PermissionPrompt, PromptRequest};

const ONE_HOUR: u64 = 3600;

const CHOICES: [&str; 3] = ["Allow for one hour", "Allow permanently", "Deny"];

/// Asks on the controlling terminal. Anything but an explicit allow,
/// including Esc or a missing terminal, is a deny.
pub struct TerminalPrompt;

impl PermissionPrompt for TerminalPrompt {
    fn decide(&self, request: &PromptRequest) -> GrantDecision {
        eprintln!();
        eprintln!(
            "Permission requested: {} on {} (risk: {})",
            request.operation,
            request.resource_key,
            request.operation.risk_level()
        );
        let mut details: Vec<_> = request.context.iter().collect();
        details.sort();
        for (k, v) in details {
            eprintln!("  {}: {}", k, v);
        }

        let choice = Select::new()
            .with_prompt("Allow this operation?")
            .items(&CHOICES)
            .default(2)
            .interact_opt();

        match choice {
            Ok(Some(0)) => GrantDecision::allow_for(ONE_HOUR),
            Ok(Some(1)) => GrantDecision::allow_permanently(),
            Ok(_) => GrantDecision::deny(),
            Err(e) => {
                log::warn!("Permission prompt unavailable, denying: {}", e);
                GrantDecision::deny()
            }
        }
    }
}
