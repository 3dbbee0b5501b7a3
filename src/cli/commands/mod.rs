//! CLI command implementations
//!
//! Each command is implemented in its own submodule.

pub mod add;
pub mod analyze;
pub mod build;
pub mod import;
pub mod levels;
pub mod slots;
pub mod targets;
pub mod units;
pub mod worker;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Subcommand;

use crate::cli::context::AppContext;

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a package unit
    #[command(disable_version_flag = true)]
    Add {
        /// Package name
        name: String,

        /// Package version
        #[arg(long)]
        version: Option<String>,

        /// Target platform (defaults to the configured target)
        #[arg(short, long)]
        target: Option<String>,

        /// Build architecture (defaults to the configured architecture)
        #[arg(long)]
        arch: Option<String>,

        /// Package this one depends on (repeatable)
        #[arg(short, long = "depends-on", value_name = "NAME")]
        depends_on: Vec<String>,

        /// Spec file to use as the build descriptor
        #[arg(long, value_name = "FILE")]
        spec: Option<PathBuf>,
    },

    /// Register every package of a requirements file
    Import {
        /// Requirements file
        requirements: PathBuf,

        /// Target platform (defaults to the configured target)
        #[arg(short, long)]
        target: Option<String>,

        /// Package manifest used to resolve specs and dependencies
        #[arg(short, long, value_name = "FILE")]
        manifest: Option<PathBuf>,
    },

    /// Build units (runs the builds in this process unless --detach)
    Build {
        /// Units to build, `name` or `name@target`
        units: Vec<String>,

        /// Build every unit that is not built, failed or cancelled
        #[arg(long, conflicts_with = "units")]
        all: bool,

        /// Build without waiting for dependencies
        #[arg(long)]
        no_deps: bool,

        /// Only queue the builds for a running worker
        #[arg(long)]
        detach: bool,
    },

    /// Retry a failed or cancelled unit
    Retry {
        unit: String,

        /// Only queue the build for a running worker
        #[arg(long)]
        detach: bool,
    },

    /// Cancel a unit that has not started building
    Cancel { unit: String },

    /// Mark a unit as not needing a build
    NotRequired { unit: String },

    /// Show unit counts and slot usage
    Status,

    /// Show one unit, its errors and artifacts
    Show {
        unit: String,

        /// Print the full build log
        #[arg(long)]
        log: bool,
    },

    /// Compute and store build levels
    Levels,

    /// List build slot holders
    Slots,

    /// Force release a stuck build slot
    Release {
        /// Job id, or a unit name whose job should be released
        job: String,
    },

    /// Drop every build slot
    ClearSlots {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Classify the errors in a build log
    Analyze {
        /// Log file
        log: PathBuf,
    },

    /// Check the build tools and list configured build targets
    Targets,

    /// Run the worker pool and monitor until interrupted
    Worker {
        /// Number of concurrent pipeline runs
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Reset in-flight units and clear all slots
    Recover,
}

impl Commands {
    /// Execute the command
    pub async fn run(self, config: Option<&Path>) -> Result<()> {
        // Log analysis needs no state
        if let Self::Analyze { log } = &self {
            return analyze::execute(log);
        }

        let ctx = AppContext::load(config)?;
        match self {
            Self::Add {
                name,
                version,
                target,
                arch,
                depends_on,
                spec,
            } => {
                let options = add::AddOptions {
                    version,
                    target,
                    arch,
                    depends_on,
                    spec,
                };
                add::execute(&ctx, &name, options).await
            }
            Self::Import {
                requirements,
                target,
                manifest,
            } => import::execute(&ctx, &requirements, target, manifest.as_deref()).await,
            Self::Build {
                units,
                all,
                no_deps,
                detach,
            } => {
                let request = if all {
                    build::Request::All
                } else if no_deps {
                    build::Request::Rebuild(units)
                } else {
                    build::Request::Build(units)
                };
                build::execute(&ctx, request, detach).await
            }
            Self::Retry { unit, detach } => {
                build::execute(&ctx, build::Request::Retry(unit), detach).await
            }
            Self::Cancel { unit } => units::execute_cancel(&ctx, &unit).await,
            Self::NotRequired { unit } => units::execute_not_required(&ctx, &unit).await,
            Self::Status => units::execute_status(&ctx).await,
            Self::Show { unit, log } => units::execute_show(&ctx, &unit, log).await,
            Self::Levels => levels::execute(&ctx).await,
            Self::Slots => slots::execute_list(&ctx).await,
            Self::Release { job } => slots::execute_release(&ctx, &job).await,
            Self::ClearSlots { yes } => slots::execute_clear(&ctx, yes).await,
            Self::Targets => targets::execute(&ctx).await,
            Self::Worker { jobs } => worker::execute(&ctx, jobs).await,
            Self::Recover => worker::execute_recover(&ctx).await,
            Self::Analyze { .. } => Ok(()),
        }
    }
}
