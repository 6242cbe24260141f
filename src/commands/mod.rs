//! The `sysgate` command line. Each subcommand is a thin wrapper that builds
//! a request, hands it to the engine, and returns JSON for stdout.

pub mod audit;
pub mod journal;
pub mod mutations;
pub mod permissions;
pub mod prompt;
pub mod system;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::audit::store::AuditStore;
use crate::audit::AuditQuery;
use crate::config::EngineConfig;
use crate::elevation::{OsElevator, PrivilegeElevator, StaticElevator};
use crate::engine::{MutationEngine, OperationRequest};
use crate::error::SysgateError;
use crate::permissions::{DefaultPermissionService, PermissionService, PermissionStore};
use crate::runtime::command::CommandMutator;
use crate::runtime::mock::MockMutator;
use crate::runtime::SystemMutator;

#[derive(Parser)]
#[command(name = "sysgate")]
#[command(about = "Permission-gated changes to the registry, services, firewall and scheduled tasks")]
#[command(version)]
pub struct Cli {
    /// Data directory (default: $SYSGATE_DATA_DIR, else the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Run against an in-memory system; nothing on this machine changes
    #[arg(long, global = true)]
    pub simulate: bool,
    /// Deny instead of prompting when no grant covers an operation
    #[arg(long, global = true)]
    pub no_prompt: bool,
    /// Request elevation when an operation needs it
    #[arg(long, global = true)]
    pub elevate: bool,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage stored grants
    Permissions {
        #[command(subcommand)]
        action: PermissionsCmd,
    },
    /// Read or change registry values
    Registry {
        #[command(subcommand)]
        action: RegistryCmd,
    },
    /// Query or control a service
    Service {
        /// query, start, stop or restart
        #[arg(value_parser = ["query", "start", "stop", "restart"])]
        action: String,
        name: String,
    },
    /// Add or remove firewall rules
    Firewall {
        #[command(subcommand)]
        action: FirewallCmd,
    },
    /// Add or remove scheduled tasks
    Task {
        #[command(subcommand)]
        action: TaskCmd,
    },
    /// Launch a command under supervision
    Run {
        /// Return as soon as the process has started
        #[arg(long)]
        background: bool,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Submit a JSON operation request from a file, or `-` for stdin
    Apply { path: String },
    /// Inspect the rollback journal
    Journal {
        #[command(subcommand)]
        action: JournalCmd,
    },
    /// Undo a journal entry
    Rollback { id: u64 },
    /// Undo the most recent change to a resource key
    RollbackLast {
        /// Canonical key, e.g. `service:Spooler` or `HKCU\Software\App\Value`
        key: String,
    },
    /// Query the audit trail
    Audit {
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        severity: Option<String>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        result: Option<String>,
        /// RFC 3339 lower bound
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show privilege and backend status
    Whoami,
}

#[derive(Subcommand)]
pub enum PermissionsCmd {
    /// List active grants
    List,
    /// Grant operations on a resource pattern
    Grant {
        /// e.g. `service:wua*` or `registry:HKCU\Software\App`
        pattern: String,
        /// Comma-separated: read, write, execute, elevate
        #[arg(long = "ops", value_delimiter = ',', required = true)]
        operations: Vec<String>,
        /// Lifetime in seconds (default: permanent)
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Revoke some or all operations on a pattern
    Revoke {
        pattern: String,
        /// Operations to remove (default: all)
        #[arg(long = "ops", value_delimiter = ',')]
        operations: Vec<String>,
    },
    /// Remove every grant
    Clear,
    /// Check whether a key is covered without prompting
    Check {
        key: String,
        #[arg(default_value = "write")]
        operation: String,
    },
}

#[derive(Subcommand)]
pub enum RegistryCmd {
    /// Read a value (empty name = the key's default value)
    Get {
        key: String,
        #[arg(default_value = "")]
        name: String,
    },
    /// Create or overwrite a value
    Set {
        key: String,
        name: String,
        data: String,
        /// string, expand_string, dword, qword, multi_string (`;`-separated) or binary (hex)
        #[arg(long = "type", default_value = "string")]
        value_type: String,
    },
    /// Delete a value
    Delete { key: String, name: String },
}

#[derive(Subcommand)]
pub enum FirewallCmd {
    /// Create a rule (replaces a rule with the same name)
    Add {
        /// Rule name (default: generated)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "tcp")]
        protocol: String,
        #[arg(long, default_value = "in")]
        direction: String,
        #[arg(long, default_value = "allow")]
        action: String,
    },
    /// Delete a rule by name
    Remove { name: String },
}

#[derive(Subcommand)]
pub enum TaskCmd {
    /// Create a task (replaces a task with the same name)
    Add {
        name: String,
        command: String,
        /// once, daily, onlogon or onstart
        #[arg(long, default_value = "daily")]
        schedule: String,
        /// HH:MM, for once and daily
        #[arg(long)]
        at: Option<String>,
    },
    /// Delete a task by name
    Remove { name: String },
}

#[derive(Subcommand)]
pub enum JournalCmd {
    /// Entries, newest first
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a command handler needs.
pub struct AppContext {
    pub config: EngineConfig,
    pub engine: MutationEngine,
    pub audit_store: Option<Arc<AuditStore>>,
}

impl AppContext {
    /// Wire up the engine for one invocation. Must run inside a Tokio
    /// runtime; the returned handle drains the audit writer once the
    /// context is dropped.
    pub fn build(cli: &Cli) -> Result<(Self, Option<JoinHandle<()>>)> {
        let mut config = match &cli.data_dir {
            Some(dir) => EngineConfig::load(dir)?,
            None => EngineConfig::load_default()?,
        };
        if cli.simulate {
            // Keep simulated journals and grants away from real ones
            config.data_dir = config.data_dir.join("simulate");
        }
        if cli.elevate {
            config.auto_elevate = true;
        }
        std::fs::create_dir_all(&config.data_dir)?;

        let store = PermissionStore::load(&config.permissions_path())
            .with_workspace_roots(&config.workspace_roots);
        let permissions: Arc<dyn PermissionService> =
            Arc::new(DefaultPermissionService::new(store));

        let (mutator, elevator): (Arc<dyn SystemMutator>, Arc<dyn PrivilegeElevator>) =
            if cli.simulate {
                (
                    Arc::new(MockMutator::new()),
                    Arc::new(StaticElevator::elevated()),
                )
            } else {
                (
                    Arc::new(CommandMutator::new(config.service_timeout())),
                    Arc::new(
                        OsElevator::new(config.prompt_timeout())
                            .with_relaunch_args(std::env::args().skip(1).collect()),
                    ),
                )
            };

        let mut builder = MutationEngine::builder(permissions, mutator)
            .config(&config)
            .elevator(elevator);
        if !cli.no_prompt {
            builder = builder.prompt(Arc::new(prompt::TerminalPrompt));
        }

        let mut audit_store = None;
        let mut audit_task = None;
        if config.audit_enabled {
            let store = Arc::new(AuditStore::open(&config.data_dir)?);
            let (writer, drain) =
                crate::audit::writer::create(store.clone(), config.audit_retention());
            builder = builder.audit(writer);
            audit_store = Some(store);
            audit_task = Some(tokio::spawn(drain));
        }

        let engine = builder.build();
        log::debug!(
            "sysgate ready (backend {}, data dir {})",
            engine.backend_id(),
            config.data_dir.display()
        );
        Ok((
            Self {
                config,
                engine,
                audit_store,
            },
            audit_task,
        ))
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub async fn dispatch(ctx: &AppContext, command: Commands) -> Result<Value> {
    match command {
        Commands::Permissions { action } => match action {
            PermissionsCmd::List => permissions::list(ctx),
            PermissionsCmd::Grant {
                pattern,
                operations,
                duration,
            } => permissions::grant(ctx, &pattern, &operations, duration),
            PermissionsCmd::Revoke {
                pattern,
                operations,
            } => permissions::revoke(ctx, &pattern, &operations),
            PermissionsCmd::Clear => permissions::clear(ctx),
            PermissionsCmd::Check { key, operation } => permissions::check(ctx, &key, &operation),
        },
        Commands::Registry { action } => {
            let request = match action {
                RegistryCmd::Get { key, name } => OperationRequest::registry_get(&key, &name),
                RegistryCmd::Set {
                    key,
                    name,
                    data,
                    value_type,
                } => OperationRequest::registry_set(
                    &key,
                    &name,
                    mutations::parse_registry_value(&value_type, &data)?,
                ),
                RegistryCmd::Delete { key, name } => OperationRequest::registry_delete(&key, &name),
            };
            mutations::apply(ctx, request).await
        }
        Commands::Service { action, name } => {
            let op = mutations::service_op(&action)?;
            mutations::apply(ctx, OperationRequest::service(&name, op)).await
        }
        Commands::Firewall { action } => match action {
            FirewallCmd::Add {
                name,
                port,
                protocol,
                direction,
                action,
            } => {
                mutations::firewall_add(
                    ctx,
                    mutations::FirewallArgs {
                        name,
                        port,
                        protocol,
                        direction,
                        action,
                    },
                )
                .await
            }
            FirewallCmd::Remove { name } => {
                mutations::apply(ctx, OperationRequest::firewall_delete(&name)).await
            }
        },
        Commands::Task { action } => match action {
            TaskCmd::Add {
                name,
                command,
                schedule,
                at,
            } => {
                let schedule = mutations::parse_schedule(&schedule, at)?;
                mutations::task_add(ctx, name, command, schedule).await
            }
            TaskCmd::Remove { name } => {
                mutations::apply(ctx, OperationRequest::task_delete(&name)).await
            }
        },
        Commands::Run {
            background,
            command,
        } => {
            let command = command.join(" ");
            mutations::apply(ctx, OperationRequest::process(&command, background)).await
        }
        Commands::Apply { path } => mutations::apply_file(ctx, &path).await,
        Commands::Journal { action } => match action {
            JournalCmd::List { limit } => journal::list(ctx, limit),
        },
        Commands::Rollback { id } => journal::rollback(ctx, id).await,
        Commands::RollbackLast { key } => journal::rollback_last(ctx, &key).await,
        Commands::Audit {
            action,
            actor,
            severity,
            subject,
            result,
            since,
            until,
            limit,
        } => audit::query(
            ctx,
            AuditQuery {
                action,
                actor,
                severity,
                subject,
                result,
                since,
                until,
                limit: Some(limit),
            },
        ),
        Commands::Whoami => system::whoami(ctx),
    }
}

/// Run one invocation and print its JSON result. Operation failures are
/// printed as `{"error", "code"}` and turn into a failing exit code.
pub async fn run(cli: Cli) -> Result<ExitCode> {
    let (ctx, audit_task) = AppContext::build(&cli)?;
    let result = dispatch(&ctx, cli.command).await;

    if let Err(e) = ctx.engine.flush() {
        log::error!("Failed to flush state: {}", e);
    }
    // Dropping the engine drops the last audit writer, letting the drain finish
    drop(ctx);
    if let Some(task) = audit_task {
        if let Err(e) = task.await {
            log::error!("Audit writer task failed: {}", e);
        }
    }

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(if handoff_failed(&value) {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Err(e) => {
            let code = e
                .downcast_ref::<SysgateError>()
                .map_or("invalid_argument", SysgateError::code);
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "error": format!("{:#}", e), "code": code }))?
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

/// A handed-off operation fails when the elevated copy did.
fn handoff_failed(value: &Value) -> bool {
    value.get("outcome") == Some(&json!("handed_off")) && value.get("exit_code") != Some(&json!(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_registry_set() {
        let cli = Cli::try_parse_from([
            "sysgate",
            "--simulate",
            "registry",
            "set",
            "HKCU\\Software\\Test",
            "v1",
            "42",
            "--type",
            "dword",
        ])
        .unwrap();
        assert!(cli.simulate);
        assert!(matches!(
            cli.command,
            Commands::Registry {
                action: RegistryCmd::Set { ref value_type, .. }
            } if value_type == "dword"
        ));
    }

    #[test]
    fn run_keeps_hyphenated_arguments() {
        let cli = Cli::try_parse_from(["sysgate", "run", "--background", "ls", "-la"]).unwrap();
        match cli.command {
            Commands::Run {
                background,
                command,
            } => {
                assert!(background);
                assert_eq!(command, vec!["ls".to_string(), "-la".to_string()]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn handed_off_exit_code_follows_child() {
        let ok = json!({"outcome": "handed_off", "resource_key": "service:x", "exit_code": 0});
        let failed = json!({"outcome": "handed_off", "resource_key": "service:x", "exit_code": 1});
        assert!(!handoff_failed(&ok));
        assert!(handoff_failed(&failed));
        assert!(!handoff_failed(&json!({"outcome": "applied"})));
    }

    #[tokio::test]
    async fn simulated_invocation_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_str().unwrap();
        let parse = |args: &[&str]| {
            let mut argv = vec!["sysgate", "--simulate", "--no-prompt", "--data-dir", data_dir];
            argv.extend_from_slice(args);
            Cli::try_parse_from(argv).unwrap()
        };

        let grant = parse(&["permissions", "grant", "registry:HKCU\\Software\\Test", "--ops", "write"]);
        let (ctx, _) = AppContext::build(&grant).unwrap();
        dispatch(&ctx, grant.command).await.unwrap();

        let set = parse(&["registry", "set", "HKCU\\Software\\Test", "v1", "hello"]);
        let value = dispatch(&ctx, set.command).await.unwrap();
        assert_eq!(value["outcome"], "applied");
        assert_eq!(value["entry"]["resource_key"], "registry:HKCU\\Software\\Test\\v1");

        let denied = parse(&["service", "start", "Spooler"]);
        let err = dispatch(&ctx, denied.command).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<SysgateError>().map(SysgateError::code),
            Some("permission_denied")
        );
    }
}
