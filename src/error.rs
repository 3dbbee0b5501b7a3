//! Error types for reqpm
//!
//! Domain-specific error types using thiserror.
//!
//! Expected scheduling conditions (no free slot, admission timeout, a unit
//! waiting on its dependencies) are *not* errors; they are modelled as
//! outcome enums in [`crate::core`]. Everything here is a genuine fault.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::unit::{BuildStatus, UnitId};

/// Filesystem errors
#[derive(Error, Debug)]
pub enum FilesystemError {
    /// Failed to create directory
    #[error("Failed to create directory '{path}': {error}")]
    CreateDir { path: PathBuf, error: String },

    /// Failed to read file
    #[error("Failed to read file '{path}': {error}")]
    ReadFile { path: PathBuf, error: String },

    /// Failed to write file
    #[error("Failed to write file '{path}': {error}")]
    WriteFile { path: PathBuf, error: String },

    /// Failed to take the cross-process lock guarding a state file
    #[error("Failed to lock '{path}': {error}")]
    Lock { path: PathBuf, error: String },

    /// State file exists but could not be decoded
    #[error("Corrupt state file '{path}': {error}")]
    Decode { path: PathBuf, error: String },

    /// Blocking filesystem task did not complete
    #[error("Filesystem task failed: {0}")]
    Task(String),
}

/// Persistence errors (unit and edge store)
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backing file could not be read, written or locked
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// Unit does not exist
    #[error("Unit '{0}' not found")]
    UnitNotFound(UnitId),
}

/// Concurrency gate errors
///
/// Only infrastructure failures of the slot store. Running out of capacity
/// is reported through [`crate::core::gate::Admission`].
#[derive(Error, Debug)]
pub enum GateError {
    /// Slot store could not be reached
    #[error("Slot store unavailable: {0}")]
    StoreUnavailable(String),

    /// Shared slot table could not be read, written or locked
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),

    /// Configured capacity is unusable
    #[error("Invalid gate configuration: {0}")]
    InvalidConfig(String),
}

/// Illegal build state transition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal transition for unit '{unit}': {from} -> {to}")]
pub struct TransitionError {
    /// Unit that was being transitioned
    pub unit: UnitId,
    /// Current status
    pub from: BuildStatus,
    /// Requested status
    pub to: BuildStatus,
}

/// Dependency resolution errors
#[derive(Error, Debug)]
pub enum ResolverError {
    /// Unit references itself
    #[error("Unit '{0}' cannot depend on itself")]
    SelfDependency(UnitId),

    /// Metadata lookup failed
    #[error("Metadata lookup failed for '{name}': {error}")]
    Metadata { name: String, error: String },

    /// Package manifest could not be loaded
    #[error("Failed to load package manifest {path}: {error}")]
    Manifest { path: PathBuf, error: String },

    /// Store failure while resolving
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// External builder errors
///
/// A builder that *ran* and failed reports through
/// [`crate::infra::builder::BuildResult`]; these cover failures to run at all.
#[derive(Error, Debug)]
pub enum BuilderError {
    /// Tool could not be spawned
    #[error("Failed to run '{command}': {error}")]
    Spawn { command: String, error: String },

    /// Tool exceeded its time budget
    #[error("'{command}' timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// Filesystem error while preparing a build
    #[error("IO error for '{path}': {error}")]
    Io { path: PathBuf, error: String },
}

/// Settings errors
#[derive(Error, Debug)]
pub enum SettingsError {
    /// Failed to read settings file
    #[error("Failed to read settings file '{path}': {error}")]
    ReadError { path: String, error: String },

    /// Failed to parse settings file
    #[error("Failed to parse settings file '{path}': {error}")]
    ParseError { path: String, error: String },

    /// Invalid value
    #[error("Invalid setting '{key}': {message}")]
    Invalid { key: String, message: String },
}

/// Top-level reqpm error type
#[derive(Error, Debug)]
pub enum ReqpmError {
    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Gate error
    #[error("Gate error: {0}")]
    Gate(#[from] GateError),

    /// Transition error
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Resolver error
    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// Builder error
    #[error("Builder error: {0}")]
    Builder(#[from] BuilderError),

    /// Settings error
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Dispatch queue is closed
    #[error("Task runner is shut down")]
    RunnerClosed,
}

impl ReqpmError {
    /// Returns true when the failure comes from infrastructure (store or slot
    /// store) and should go back to the caller's own retry policy.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ReqpmError::Store(_) | ReqpmError::Gate(_) | ReqpmError::RunnerClosed
        )
    }
}

/// Convenience alias used throughout the crate
pub type Result<T, E = ReqpmError> = std::result::Result<T, E>;
