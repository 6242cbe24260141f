//! Privilege detection and one-shot elevated re-execution.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;

/// Set in the environment of a relaunched process so it never relaunches again.
pub const ELEVATED_ENV: &str = "SYSGATE_ELEVATED";

/// How an elevation request was satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Elevated {
    /// This process now holds elevated privileges.
    InProcess,
    /// An elevated copy of this process was launched and ran the operation
    /// itself; this process did not.
    HandedOff { exit_code: Option<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("elevation denied: {0}")]
    Denied(String),

    #[error("elevation prompt timed out")]
    Timeout,

    #[error("elevation unsupported: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait PrivilegeElevator: Send + Sync {
    /// Cheap, synchronous, side-effect free.
    fn is_elevated(&self) -> bool;

    /// Make exactly one attempt to obtain an elevated context.
    async fn request_elevation(&self, reason: &str) -> Result<Elevated, ElevationError>;
}

// ---------------------------------------------------------------------------
// OsElevator
// ---------------------------------------------------------------------------

/// Detects privileges from the OS and elevates by relaunching the current
/// executable through `sudo` (Unix) or a UAC prompt (Windows).
pub struct OsElevator {
    relaunch_args: Option<Vec<String>>,
    timeout: Duration,
    elevated: OnceLock<bool>,
}

impl OsElevator {
    /// An elevator that can report privileges but not relaunch.
    pub fn new(timeout: Duration) -> Self {
        Self {
            relaunch_args: None,
            timeout,
            elevated: OnceLock::new(),
        }
    }

    /// Arguments to relaunch with, normally the current command line minus argv[0].
    pub fn with_relaunch_args(mut self, args: Vec<String>) -> Self {
        self.relaunch_args = Some(args);
        self
    }

    fn detect() -> bool {
        #[cfg(unix)]
        {
            std::process::Command::new("id")
                .arg("-u")
                .output()
                .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
                .unwrap_or(false)
        }
        #[cfg(windows)]
        {
            // `net session` only succeeds for administrators
            std::process::Command::new("net")
                .arg("session")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }
        #[cfg(not(any(unix, windows)))]
        {
            false
        }
    }

    #[cfg(unix)]
    async fn relaunch(&self, exe: &str, args: &[String]) -> Result<Elevated, ElevationError> {
        // Validate credentials first so a refused password is a denial rather
        // than an exit code from the relaunched command.
        let validate = Command::new("sudo")
            .arg("-v")
            .stdin(Stdio::inherit())
            .status();
        match tokio::time::timeout(self.timeout, validate).await {
            Err(_) => return Err(ElevationError::Timeout),
            Ok(Err(e)) => return Err(ElevationError::Unsupported(format!("sudo: {}", e))),
            Ok(Ok(status)) if !status.success() => {
                return Err(ElevationError::Denied("sudo authentication failed".into()))
            }
            Ok(Ok(_)) => {}
        }

        let status = Command::new("sudo")
            .arg("-n")
            .arg("env")
            .arg(format!("{}=1", ELEVATED_ENV))
            .arg(exe)
            .args(args)
            .status()
            .await
            .map_err(|e| ElevationError::Unsupported(format!("sudo: {}", e)))?;
        Ok(Elevated::HandedOff {
            exit_code: status.code(),
        })
    }

    #[cfg(windows)]
    async fn relaunch(&self, exe: &str, args: &[String]) -> Result<Elevated, ElevationError> {
        let quoted: Vec<String> = args
            .iter()
            .map(|a| format!("'{}'", a.replace('\'', "''")))
            .collect();
        let script = format!(
            "$env:{}='1'; $p = Start-Process -FilePath '{}' -ArgumentList @({}) -Verb RunAs -Wait -PassThru; exit $p.ExitCode",
            ELEVATED_ENV,
            exe.replace('\'', "''"),
            quoted.join(",")
        );
        let run = Command::new("powershell")
            .args(["-NoProfile", "-NonInteractive", "-Command", script.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        let output = match tokio::time::timeout(self.timeout, run).await {
            Err(_) => return Err(ElevationError::Timeout),
            Ok(Err(e)) => return Err(ElevationError::Unsupported(format!("powershell: {}", e))),
            Ok(Ok(output)) => output,
        };
        // A declined UAC prompt makes Start-Process throw before any exit code
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("canceled by the user") || stderr.contains("InvalidOperation") {
            return Err(ElevationError::Denied("UAC prompt declined".into()));
        }
        Ok(Elevated::HandedOff {
            exit_code: output.status.code(),
        })
    }

    #[cfg(not(any(unix, windows)))]
    async fn relaunch(&self, _exe: &str, _args: &[String]) -> Result<Elevated, ElevationError> {
        Err(ElevationError::Unsupported("no elevation mechanism on this platform".into()))
    }
}

#[async_trait]
impl PrivilegeElevator for OsElevator {
    fn is_elevated(&self) -> bool {
        *self.elevated.get_or_init(Self::detect)
    }

    async fn request_elevation(&self, reason: &str) -> Result<Elevated, ElevationError> {
        if std::env::var_os(ELEVATED_ENV).is_some() {
            return Err(ElevationError::Unsupported(
                "already relaunched once and still not elevated".into(),
            ));
        }
        let Some(args) = &self.relaunch_args else {
            return Err(ElevationError::Unsupported(
                "no command line to relaunch with".into(),
            ));
        };
        let exe = std::env::current_exe()
            .map_err(|e| ElevationError::Unsupported(format!("cannot locate executable: {}", e)))?;

        log::info!("Requesting elevation: {}", reason);
        let result = self.relaunch(&exe.to_string_lossy(), args).await;
        match &result {
            Ok(Elevated::HandedOff { exit_code }) => {
                log::info!("Elevated relaunch finished with exit code {:?}", exit_code)
            }
            Ok(Elevated::InProcess) => {}
            Err(e) => log::warn!("Elevation failed: {}", e),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// StaticElevator
// ---------------------------------------------------------------------------

/// What a [`StaticElevator`] does when asked to elevate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaticResponse {
    /// Become elevated in-process.
    Grant,
    Deny,
    HandOff,
}

/// Deterministic elevator for tests and `--simulate`.
pub struct StaticElevator {
    elevated: AtomicBool,
    response: StaticResponse,
    requests: AtomicUsize,
}

impl StaticElevator {
    pub fn elevated() -> Self {
        Self::new(true, StaticResponse::Deny)
    }

    pub fn unelevated(response: StaticResponse) -> Self {
        Self::new(false, response)
    }

    fn new(elevated: bool, response: StaticResponse) -> Self {
        Self {
            elevated: AtomicBool::new(elevated),
            response,
            requests: AtomicUsize::new(0),
        }
    }

    /// How many times elevation was requested.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrivilegeElevator for StaticElevator {
    fn is_elevated(&self) -> bool {
        self.elevated.load(Ordering::SeqCst)
    }

    async fn request_elevation(&self, _reason: &str) -> Result<Elevated, ElevationError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.response {
            StaticResponse::Grant => {
                self.elevated.store(true, Ordering::SeqCst);
                Ok(Elevated::InProcess)
            }
            StaticResponse::Deny => Err(ElevationError::Denied("static elevator".into())),
            StaticResponse::HandOff => Ok(Elevated::HandedOff { exit_code: Some(0) }),
        }
    }
}
