//! Settings management
//!
//! Reads `reqpm.toml`. A missing file means defaults; an invalid one is an
//! error. Environment variables override file values:
//!
//! - `REQPM_MAX_CONCURRENT_BUILDS` - gate capacity
//! - `REQPM_BUILD_DIR`, `REQPM_SOURCES_DIR`, `REQPM_STATE_DIR` - paths
//!
//! Paths left unset fall back to [`ReqpmDirs`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::defaults;
use crate::core::gate::{AcquireMode, GateConfig};
use crate::error::SettingsError;
use crate::infra::dirs::ReqpmDirs;

pub const ENV_MAX_CONCURRENT_BUILDS: &str = "REQPM_MAX_CONCURRENT_BUILDS";
pub const ENV_BUILD_DIR: &str = "REQPM_BUILD_DIR";
pub const ENV_SOURCES_DIR: &str = "REQPM_SOURCES_DIR";
pub const ENV_STATE_DIR: &str = "REQPM_STATE_DIR";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gate: GateSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub builder: BuilderSettings,
}

/// How the pipeline asks the gate for a slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Single attempt; a full pool leaves the unit pending
    #[default]
    NonBlocking,
    /// Poll until a slot frees up or `acquire_timeout_secs` passes
    Blocking,
}

/// `[gate]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    pub max_concurrent_builds: usize,
    pub slot_ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub admission: AdmissionMode,
    /// Blocking admission only; `None` waits forever
    pub acquire_timeout_secs: Option<u64>,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_concurrent_builds: defaults::MAX_CONCURRENT_BUILDS,
            slot_ttl_secs: defaults::SLOT_TTL_SECS,
            poll_interval_ms: defaults::ACQUIRE_POLL_INTERVAL_MS,
            admission: AdmissionMode::NonBlocking,
            acquire_timeout_secs: Some(defaults::ACQUIRE_TIMEOUT_SECS),
        }
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub monitor_interval_secs: u64,
    pub pending_grace_secs: u64,
    pub retry_backoff_secs: u64,
    /// Automatic retries of transient failures; `None` is unbounded
    pub max_retries: Option<u32>,
    /// Pipeline runs per worker process; defaults to the CPU count
    pub worker_concurrency: Option<usize>,
    /// Descriptor preparations per monitor pass
    pub prepare_limit: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            monitor_interval_secs: defaults::MONITOR_INTERVAL_SECS,
            pending_grace_secs: defaults::PENDING_GRACE_SECS,
            retry_backoff_secs: defaults::RETRY_BACKOFF_SECS,
            max_retries: None,
            worker_concurrency: None,
            prepare_limit: defaults::MONITOR_PREPARE_LIMIT,
        }
    }
}

/// `[paths]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSettings {
    pub build_dir: Option<PathBuf>,
    pub sources_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    /// Package manifest the worker monitor uses to fill in missing specs
    pub manifest: Option<PathBuf>,
}

/// `[builder]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    pub mock_bin: String,
    pub rpmbuild_bin: String,
    pub mock_config_dir: PathBuf,
    pub architecture: String,
    pub default_target: String,
    /// Prefix mock invocations with `sudo -n` when not running as root
    pub use_sudo: bool,
    pub intermediate_timeout_secs: u64,
    pub final_timeout_secs: u64,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            mock_bin: defaults::MOCK_BIN.to_string(),
            rpmbuild_bin: defaults::RPMBUILD_BIN.to_string(),
            mock_config_dir: PathBuf::from(defaults::MOCK_CONFIG_DIR),
            architecture: defaults::DEFAULT_ARCH.to_string(),
            default_target: defaults::DEFAULT_TARGET.to_string(),
            use_sudo: false,
            intermediate_timeout_secs: defaults::INTERMEDIATE_TIMEOUT_SECS,
            final_timeout_secs: defaults::FINAL_TIMEOUT_SECS,
        }
    }
}

/// Fully resolved directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub build_dir: PathBuf,
    pub sources_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl ResolvedPaths {
    /// Unit and edge snapshot
    pub fn units_file(&self) -> PathBuf {
        self.state_dir.join("units.json")
    }

    /// Shared slot table
    pub fn slots_file(&self) -> PathBuf {
        self.state_dir.join("slots.json")
    }
}

impl Settings {
    /// Load settings from `path`, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let mut settings = Self::load_from_path(path)?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a specific path without environment overrides
    ///
    /// If the file doesn't exist, returns default settings.
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            tracing::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::ReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| SettingsError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    /// Apply overrides from `lookup` (normally the process environment)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_CONCURRENT_BUILDS) {
            self.gate.max_concurrent_builds =
                value.trim().parse().map_err(|_| SettingsError::Invalid {
                    key: ENV_MAX_CONCURRENT_BUILDS.to_string(),
                    message: format!("expected a positive integer, got '{value}'"),
                })?;
        }
        if let Some(value) = lookup(ENV_BUILD_DIR) {
            self.paths.build_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_SOURCES_DIR) {
            self.paths.sources_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_STATE_DIR) {
            self.paths.state_dir = Some(PathBuf::from(value));
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |key: &str, message: &str| SettingsError::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.gate.max_concurrent_builds == 0 {
            return Err(invalid("gate.max_concurrent_builds", "must be at least 1"));
        }
        if self.gate.slot_ttl_secs == 0 {
            return Err(invalid("gate.slot_ttl_secs", "must be greater than zero"));
        }
        if self.gate.poll_interval_ms == 0 {
            return Err(invalid("gate.poll_interval_ms", "must be greater than zero"));
        }
        if self.scheduler.monitor_interval_secs == 0 {
            return Err(invalid("scheduler.monitor_interval_secs", "must be greater than zero"));
        }
        if self.scheduler.worker_concurrency == Some(0) {
            return Err(invalid("scheduler.worker_concurrency", "must be at least 1"));
        }
        Ok(())
    }

    /// Gate configuration
    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            max_concurrent: self.gate.max_concurrent_builds,
            slot_ttl: Duration::from_secs(self.gate.slot_ttl_secs),
            poll_interval: Duration::from_millis(self.gate.poll_interval_ms),
        }
    }

    /// How the pipeline acquires slots
    pub fn acquire_mode(&self) -> AcquireMode {
        match self.gate.admission {
            AdmissionMode::NonBlocking => AcquireMode::NonBlocking,
            AdmissionMode::Blocking => AcquireMode::Blocking {
                timeout: self.gate.acquire_timeout_secs.map(Duration::from_secs),
            },
        }
    }

    /// Worker pool size
    pub fn worker_concurrency(&self) -> usize {
        self.scheduler
            .worker_concurrency
            .unwrap_or_else(num_cpus::get)
            .max(1)
    }

    /// Directories, falling back to `dirs` where unset
    pub fn resolve_paths(&self, dirs: &ReqpmDirs) -> ResolvedPaths {
        ResolvedPaths {
            build_dir: self.paths.build_dir.clone().unwrap_or_else(|| dirs.build_dir()),
            sources_dir: self
                .paths
                .sources_dir
                .clone()
                .unwrap_or_else(|| dirs.sources_dir()),
            state_dir: self.paths.state_dir.clone().unwrap_or_else(|| dirs.state_dir()),
        }
    }
}
