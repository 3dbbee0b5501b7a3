//! Platform-specific directory management
//!
//! Provides default locations for settings, persistent state, package
//! sources and build work directories. Follows the XDG Base Directory
//! Specification on Linux.
//!
//! Environment variables can override the base directories:
//! - `REQPM_CONFIG_DIR` - Override config directory
//! - `REQPM_DATA_DIR` - Override data directory
//! - `REQPM_CACHE_DIR` - Override cache directory

use std::env;
use std::path::PathBuf;

use crate::config::defaults;

/// Environment variable names for directory overrides
pub const ENV_CONFIG_DIR: &str = "REQPM_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "REQPM_DATA_DIR";
pub const ENV_CACHE_DIR: &str = "REQPM_CACHE_DIR";

/// Application name used in directory paths
const APP_NAME: &str = "reqpm";

/// Subdirectory names
const STATE_SUBDIR: &str = "state";
const SOURCES_SUBDIR: &str = "sources";
const BUILD_SUBDIR: &str = "build";

/// Platform-specific directory provider for reqpm
#[derive(Debug, Clone)]
pub struct ReqpmDirs {
    config_dir: PathBuf,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ReqpmDirs {
    /// Create a new `ReqpmDirs` instance
    ///
    /// Checks environment variables first, then falls back to platform defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config_dir: resolve(ENV_CONFIG_DIR, dirs::config_dir, ".config"),
            data_dir: resolve(ENV_DATA_DIR, dirs::data_dir, ".local/share"),
            cache_dir: resolve(ENV_CACHE_DIR, dirs::cache_dir, ".cache"),
        }
    }

    /// Root every directory under `base`, for tests and self-contained setups
    #[must_use]
    pub fn rooted(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            config_dir: base.join("config"),
            data_dir: base.join("data"),
            cache_dir: base.join("cache"),
        }
    }

    /// Config directory (`$XDG_CONFIG_HOME/reqpm`)
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir.clone()
    }

    /// Default settings file path
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.config_dir.join(defaults::SETTINGS_FILE)
    }

    /// Persistent unit and slot state (`$XDG_DATA_HOME/reqpm/state`)
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join(STATE_SUBDIR)
    }

    /// Staged package sources, one subdirectory per package
    #[must_use]
    pub fn sources_dir(&self) -> PathBuf {
        self.data_dir.join(SOURCES_SUBDIR)
    }

    /// Execution-scoped build work directories
    #[must_use]
    pub fn build_dir(&self) -> PathBuf {
        self.cache_dir.join(BUILD_SUBDIR)
    }
}

impl Default for ReqpmDirs {
    fn default() -> Self {
        Self::new()
    }
}

/// Environment override, then the platform directory, then `~/<fallback>`
fn resolve(var: &str, platform: fn() -> Option<PathBuf>, fallback: &str) -> PathBuf {
    if let Ok(path) = env::var(var) {
        return PathBuf::from(path);
    }

    platform()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(fallback)
                .join(APP_NAME)
        })
}
