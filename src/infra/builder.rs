//! External builder contract
//!
//! The pipeline drives an [`ExternalBuilder`] through three isolated stages:
//! staging sources, building the intermediate (source) artifact and building
//! the final artifacts. A tool that ran and failed reports through
//! [`BuildResult`]; only failures to run at all are [`BuilderError`]s.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::BuilderError;
use crate::infra::filesystem;

/// Outcome of one builder stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildResult {
    pub success: bool,
    /// Paths produced by the stage
    pub artifacts: Vec<PathBuf>,
    /// Raw tool output
    pub log: String,
    /// Short reason when `success` is false
    pub error_message: Option<String>,
    pub duration: Duration,
}

impl BuildResult {
    /// Successful stage
    pub fn ok(artifacts: Vec<PathBuf>, log: impl Into<String>) -> Self {
        Self {
            success: true,
            artifacts,
            log: log.into(),
            ..Self::default()
        }
    }

    /// Failed stage
    pub fn failed(error: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            success: false,
            log: log.into(),
            error_message: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach the stage duration
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// Per-execution parameters passed to builder stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Unique per pipeline run; keeps concurrent builds of one target apart
    pub execution_id: String,
    pub architecture: String,
}

/// Native package builder
#[async_trait]
pub trait ExternalBuilder: Send + Sync {
    /// Whether the builder tooling is installed and runnable
    async fn is_available(&self) -> bool;

    /// Whether `target` names a configured build target
    async fn valid_target(&self, target: &str) -> bool;

    /// Copy descriptor and sources into `work_dir`
    async fn stage_sources(
        &self,
        descriptor: &Path,
        sources_dir: &Path,
        work_dir: &Path,
    ) -> Result<BuildResult, BuilderError>;

    /// Build the intermediate artifact from the descriptor
    async fn build_intermediate(
        &self,
        descriptor: &Path,
        sources_dir: &Path,
        out_dir: &Path,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError>;

    /// Build the final artifacts from the intermediate one
    async fn build_final(
        &self,
        intermediate: &Path,
        target: &str,
        out_dir: &Path,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError>;
}

/// Copy every file under `from` into `to`, keeping relative paths.
///
/// Returns the number of files copied.
pub fn copy_tree(from: &Path, to: &Path) -> Result<usize, BuilderError> {
    let io_err = |path: &Path, e: &dyn std::fmt::Display| BuilderError::Io {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    filesystem::create_dir_all(to).map_err(|e| io_err(to, &e))?;

    let mut copied = 0;
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(|e| io_err(from, &e))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io_err(entry.path(), &e))?;
        let dest = to.join(relative);

        if entry.file_type().is_dir() {
            filesystem::create_dir_all(&dest).map_err(|e| io_err(&dest, &e))?;
        } else {
            std::fs::copy(entry.path(), &dest).map_err(|e| io_err(&dest, &e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Files in `dir` (not recursive) whose name ends with `suffix`, sorted
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
        .map(walkdir::DirEntry::into_path)
        .collect();
    found.sort();
    found
}
