//! Core business logic module
//!
//! Scheduling, gating and classification. Storage, processes and the task
//! runner sit behind traits implemented in [`crate::infra`].
//!
//! # Submodules
//!
//! - [`unit`] - Package units and the build state machine
//! - [`gate`] - Concurrency gate (distributed counting semaphore)
//! - [`resolver`] - Dependency graph, build levels and readiness
//! - [`requirements`] - Requirements file parsing
//! - [`classifier`] - Build log error classification
//! - [`pipeline`] - Build pipeline for a single unit
//! - [`scheduler`] - Build requests, outcomes and startup recovery
//! - [`monitor`] - Periodic reconciliation of lost dispatches
//! - [`retry`] - Retry policy for transient outcomes
//! - [`events`] - Unit status notifications
//! - [`settings`] - Settings file and environment overrides

pub mod classifier;
pub mod events;
pub mod gate;
pub mod monitor;
pub mod pipeline;
pub mod requirements;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod unit;
