//! Wiring of settings, stores and services for one CLI invocation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::core::events::{EventSink, TracingEventSink};
use crate::core::gate::ConcurrencyGate;
use crate::core::monitor::ReconciliationMonitor;
use crate::core::pipeline::{BuildPipeline, PipelineConfig};
use crate::core::retry::RetryPolicy;
use crate::core::scheduler::Scheduler;
use crate::core::settings::{ResolvedPaths, Settings};
use crate::core::unit::UnitId;
use crate::infra::dirs::ReqpmDirs;
use crate::infra::mock::MockBuilder;
use crate::infra::runner::Dispatcher;
use crate::infra::slots::FileSlotStore;
use crate::infra::store::{FileUnitStore, UnitStore};

/// Shared handles for a command
pub struct AppContext {
    pub settings: Settings,
    pub paths: ResolvedPaths,
    pub store: Arc<dyn UnitStore>,
    pub gate: ConcurrencyGate,
    pub events: Arc<dyn EventSink>,
}

impl AppContext {
    /// Load settings from `config` (or the default location) and open the
    /// state files
    pub fn load(config: Option<&Path>) -> Result<Self> {
        let dirs = ReqpmDirs::new();
        let settings_path: PathBuf = config.map_or_else(|| dirs.settings_path(), Path::to_path_buf);
        let settings = Settings::load(&settings_path)
            .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
        let paths = settings.resolve_paths(&dirs);
        tracing::debug!("State directory: {}", paths.state_dir.display());

        let store: Arc<dyn UnitStore> = Arc::new(FileUnitStore::new(paths.units_file()));
        let gate = ConcurrencyGate::new(
            Arc::new(FileSlotStore::new(paths.slots_file())),
            settings.gate_config(),
        )
        .context("Invalid gate settings")?;

        Ok(Self {
            settings,
            paths,
            store,
            gate,
            events: Arc::new(TracingEventSink),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_secs(self.settings.scheduler.retry_backoff_secs),
            self.settings.scheduler.max_retries,
        )
    }

    pub fn scheduler(&self, dispatcher: Arc<dyn Dispatcher>) -> Scheduler {
        Scheduler::new(
            Arc::clone(&self.store),
            self.gate.clone(),
            dispatcher,
            self.retry_policy(),
            Arc::clone(&self.events),
        )
    }

    pub fn pipeline(&self) -> BuildPipeline {
        BuildPipeline::new(
            Arc::clone(&self.store),
            self.gate.clone(),
            Arc::new(MockBuilder::new(self.settings.builder.clone())),
            Arc::clone(&self.events),
            PipelineConfig {
                build_dir: self.paths.build_dir.clone(),
                sources_dir: self.paths.sources_dir.clone(),
                acquire_mode: self.settings.acquire_mode(),
            },
        )
    }

    pub fn monitor(&self, dispatcher: Arc<dyn Dispatcher>) -> ReconciliationMonitor {
        ReconciliationMonitor::new(
            Arc::clone(&self.store),
            dispatcher,
            self.gate.clone(),
            Duration::from_secs(self.settings.scheduler.pending_grace_secs),
        )
        .with_events(Arc::clone(&self.events))
    }

    /// Unit id from `name` or `name@target`, defaulting to the configured target
    pub fn unit_id(&self, name: &str) -> UnitId {
        UnitId::parse(name, &self.settings.builder.default_target)
    }
}
