pub mod audit;
pub mod commands;
pub mod config;
pub mod elevation;
pub mod engine;
pub mod error;
pub mod journal;
pub mod permissions;
pub mod resource;
pub mod runtime;
pub mod supervisor;
pub(crate) mod util;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

pub use engine::{MutationEngine, MutationOutcome, OperationRequest};
pub use error::{SysgateError, SysgateResult};

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    // Logs go to stderr; stdout carries the JSON result
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

pub fn run() -> anyhow::Result<ExitCode> {
    let cli = commands::Cli::parse();
    init_logging(cli.verbose);
    tracing::debug!("sysgate {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(commands::run(cli))
}
