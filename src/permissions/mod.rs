pub mod gate;
pub mod prompt;
pub mod service;
pub mod store;
pub mod types;

pub use gate::{Authorization, PermissionGate};
pub use prompt::{AlwaysAllow, AlwaysDeny, GrantDecision, PermissionPrompt, PromptBridge, PromptRequest};
pub use service::{DefaultPermissionService, PermissionService};
pub use store::PermissionStore;
pub use types::{Operation, PermissionRecord, PermissionScope, KNOWN_OPERATIONS};
