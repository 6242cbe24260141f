use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SysgateResult;
use crate::supervisor::SupervisorConfig;

/// Overrides the data directory, and with it where `config.json` is read from.
pub const DATA_DIR_ENV: &str = "SYSGATE_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Resource prefixes that carry an implicit read/write grant,
    /// e.g. `HKCU\Software\MyApp`.
    pub workspace_roots: Vec<String>,
    pub journal_capacity: usize,
    pub process_retention_secs: u64,
    pub kill_grace_ms: u64,
    pub foreground_timeout_secs: u64,
    pub service_timeout_secs: u64,
    pub prompt_timeout_secs: u64,
    /// Ask for elevation instead of failing with `ElevationRequired`.
    pub auto_elevate: bool,
    pub audit_enabled: bool,
    pub audit_retention_days: u64,
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sysgate")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workspace_roots: Vec::new(),
            journal_capacity: crate::journal::DEFAULT_CAPACITY,
            process_retention_secs: 60,
            kill_grace_ms: 3000,
            foreground_timeout_secs: 300,
            service_timeout_secs: 30,
            prompt_timeout_secs: 60,
            auto_elevate: false,
            audit_enabled: true,
            audit_retention_days: 30,
        }
    }
}

impl EngineConfig {
    /// Resolve the data directory (`SYSGATE_DATA_DIR`, else the platform
    /// default) and load `config.json` from it.
    pub fn load_default() -> SysgateResult<Self> {
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        Self::load(&data_dir)
    }

    /// Load `config.json` from `data_dir`. Missing file → defaults; a corrupt
    /// file is an error rather than a silent reset.
    pub fn load(data_dir: &Path) -> SysgateResult<Self> {
        let path = data_dir.join("config.json");
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str::<EngineConfig>(&data)?
        } else {
            EngineConfig::default()
        };
        // The directory the file was found in wins over a stale field
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    pub fn permissions_path(&self) -> PathBuf {
        self.data_dir.join("permissions.json")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.json")
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn audit_retention(&self) -> Duration {
        Duration::from_secs(self.audit_retention_days * 86400)
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            retention: Duration::from_secs(self.process_retention_secs),
            kill_grace: Duration::from_millis(self.kill_grace_ms),
            foreground_timeout: Duration::from_secs(self.foreground_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.journal_capacity, 50);
        assert!(!config.auto_elevate);
        assert_eq!(config.data_dir, dir.path());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"journal_capacity": 5, "workspace_roots": ["HKCU\\Software\\MyApp"]}"#,
        )
        .unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.journal_capacity, 5);
        assert_eq!(config.workspace_roots, vec!["HKCU\\Software\\MyApp".to_string()]);
        assert_eq!(config.kill_grace_ms, 3000);
        assert_eq!(config.journal_path(), dir.path().join("journal.json"));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{").unwrap();
        assert!(EngineConfig::load(dir.path()).is_err());
    }
}
