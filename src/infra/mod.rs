//! Infrastructure layer
//!
//! Handles all I/O operations: state files, external build tools and the
//! in-process task runner.

pub mod builder;
pub mod dirs;
pub mod filesystem;
pub mod manifest;
pub mod mock;
pub mod runner;
pub mod slots;
pub mod store;
