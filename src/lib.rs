//! reqpm - build Python requirements as native packages
//!
//! This library orders package builds by their dependencies and runs them
//! through an external builder while a shared concurrency gate caps how
//! many run at once across every worker process.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`cli`] - Command-line interface parsing and output formatting
//! - [`core`] - Scheduling, gating, resolution and classification
//! - [`infra`] - Infrastructure layer (state files, build tools, task runner)
//! - [`config`] - Configuration constants
//! - [`error`] - Error types and handling

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod infra;
