//! Build pipeline
//!
//! Runs one package unit from `Pending` to `Completed` or `Failed`:
//!
//! 1. Take a slot from the [`ConcurrencyGate`]. Without one the unit stays
//!    `Pending` and the run ends as [`PipelineOutcome::Deferred`].
//! 2. Check preconditions (builder, descriptor, sources, target). A missing
//!    piece is a terminal failure with a specific message.
//! 3. Stage sources, build the intermediate artifact, build the final
//!    artifacts. Each stage runs only if the previous one succeeded.
//! 4. Record the log, classified findings and artifacts on the unit.
//!
//! The slot is released on every path out of an admitted run.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::core::classifier::ErrorClassifier;
use crate::core::events::{EventSink, UnitEvent};
use crate::core::gate::{AcquireMode, Admission, ConcurrencyGate};
use crate::core::unit::{BuildStatus, PackageUnit, UnitId};
use crate::error::Result;
use crate::infra::builder::{BuildContext, BuildResult, ExternalBuilder};
use crate::infra::filesystem;
use crate::infra::slots::now_unix_ms;
use crate::infra::store::UnitStore;

static EXECUTION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing descriptor, sources, builder or target
    Precondition,
    /// The builder ran and reported failure
    Tool,
}

/// Result of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Failed { kind: FailureKind, message: String },
    /// No free slot; the unit stays `Pending` for a later dispatch
    Deferred,
    /// Blocking admission timed out; worth retrying after a backoff
    RetryLater,
    /// The unit was not `Pending` (already handled, cancelled or reset)
    Skipped,
}

impl PipelineOutcome {
    /// Whether the run held a slot and gave it back
    pub fn released_slot(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }
}

/// Pipeline directories and admission mode
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of execution-scoped work directories
    pub build_dir: PathBuf,
    /// Staged sources, `<sources_dir>/<package name>/`
    pub sources_dir: PathBuf,
    pub acquire_mode: AcquireMode,
}

/// Executes builds of single units
pub struct BuildPipeline {
    store: Arc<dyn UnitStore>,
    gate: ConcurrencyGate,
    builder: Arc<dyn ExternalBuilder>,
    classifier: ErrorClassifier,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
}

/// Accumulated log of a run
#[derive(Default)]
struct RunLog(String);

impl RunLog {
    fn section(&mut self, stage: &str, result: &BuildResult) {
        self.0.push_str("=== ");
        self.0.push_str(stage);
        self.0.push_str(" ===\n");
        self.0.push_str(&result.log);
        if !self.0.ends_with('\n') {
            self.0.push('\n');
        }
    }

    fn line(&mut self, text: &str) {
        self.0.push_str(text);
        self.0.push('\n');
    }
}

enum RunFailure {
    Precondition(String),
    Tool(String),
}

impl BuildPipeline {
    pub fn new(
        store: Arc<dyn UnitStore>,
        gate: ConcurrencyGate,
        builder: Arc<dyn ExternalBuilder>,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            gate,
            builder,
            classifier: ErrorClassifier::new(),
            events,
            config,
        }
    }

    /// Build `unit_id` if it is `Pending`
    pub async fn run(&self, unit_id: &UnitId) -> Result<PipelineOutcome> {
        let unit = self.store.require_unit(unit_id).await?;
        if unit.status != BuildStatus::Pending {
            tracing::debug!("Skipping {unit_id}: status is {}", unit.status);
            return Ok(PipelineOutcome::Skipped);
        }

        let job = unit.job_id();
        match self.gate.acquire(&job, self.config.acquire_mode).await? {
            Admission::Admitted(_) => {}
            Admission::NoSlotAvailable { held } => {
                tracing::info!("{unit_id} stays pending: no build slot ({held} in use)");
                return Ok(PipelineOutcome::Deferred);
            }
            Admission::SlotTimeout { waited } => {
                tracing::warn!("{unit_id} gave up waiting {waited:?} for a build slot");
                return Ok(PipelineOutcome::RetryLater);
            }
        }

        let outcome = self.execute(unit_id).await;

        if let Err(e) = self.gate.release(&job).await {
            tracing::error!("Failed to release build slot for {job}: {e}");
        }
        outcome
    }

    /// Admitted part of a run; the caller releases the slot
    async fn execute(&self, unit_id: &UnitId) -> Result<PipelineOutcome> {
        let mut unit = self.store.require_unit(unit_id).await?;
        if unit.status != BuildStatus::Pending {
            tracing::debug!("{unit_id} left pending before it could start ({})", unit.status);
            return Ok(PipelineOutcome::Skipped);
        }

        unit.transition(BuildStatus::Building, Utc::now())?;
        self.store.put_unit(&unit).await?;
        self.events
            .publish(UnitEvent::new(unit_id.clone(), BuildStatus::Building, "Build started"));

        let mut log = RunLog::default();
        match self.stages(&unit, &mut log).await {
            Ok((intermediate, finals)) => {
                self.finish_completed(unit_id, intermediate, finals, log.0)
                    .await
            }
            Err(RunFailure::Precondition(message)) => {
                self.finish_failed(unit_id, FailureKind::Precondition, message, log.0)
                    .await
            }
            Err(RunFailure::Tool(message)) => {
                self.finish_failed(unit_id, FailureKind::Tool, message, log.0)
                    .await
            }
        }
    }

    async fn stages(
        &self,
        unit: &PackageUnit,
        log: &mut RunLog,
    ) -> std::result::Result<(PathBuf, Vec<PathBuf>), RunFailure> {
        let precondition = |message: String, log: &mut RunLog| {
            log.line(&message);
            RunFailure::Precondition(message)
        };

        if !self.builder.is_available().await {
            return Err(precondition("Builder is not available".to_string(), log));
        }
        let Some(descriptor) = unit.descriptor.as_deref() else {
            return Err(precondition("No spec file found".to_string(), log));
        };
        let sources_dir = self.config.sources_dir.join(&unit.name);
        if !sources_dir.is_dir() {
            return Err(precondition(
                format!("Sources directory not found: {}", sources_dir.display()),
                log,
            ));
        }
        let build_target = format!("{}-{}", unit.target, unit.architecture);
        if !self.builder.valid_target(&build_target).await {
            return Err(precondition(
                format!("Invalid build target: {build_target}"),
                log,
            ));
        }

        let ctx = BuildContext {
            execution_id: execution_id(unit),
            architecture: unit.architecture.clone(),
        };
        let work_dir = self.work_dir(&unit.id, &ctx.execution_id);
        let spec_path = work_dir.join("SPECS").join(unit.descriptor_file_name());
        filesystem::write_file(&spec_path, descriptor)
            .map_err(|e| precondition(format!("Failed to write spec file: {e}"), log))?;
        log.line(&format!("Execution {} in {}", ctx.execution_id, work_dir.display()));

        // Stage sources
        let staged = self
            .builder
            .stage_sources(&spec_path, &sources_dir, &work_dir)
            .await
            .map_err(|e| precondition(format!("Failed to stage sources: {e}"), log))?;
        log.section("stage sources", &staged);
        if !staged.success {
            return Err(RunFailure::Precondition(stage_error(&staged, "Source staging failed")));
        }
        let staged_sources = staged
            .artifacts
            .first()
            .cloned()
            .unwrap_or_else(|| work_dir.join("SOURCES"));

        // Intermediate artifact
        let intermediate = self
            .builder
            .build_intermediate(&spec_path, &staged_sources, &work_dir.join("SRPMS"), &ctx)
            .await
            .map_err(|e| tool_error(log, &e))?;
        log.section("build intermediate", &intermediate);
        if !intermediate.success {
            return Err(RunFailure::Tool(stage_error(&intermediate, "Intermediate build failed")));
        }
        let Some(intermediate_path) = intermediate.artifacts.first().cloned() else {
            return Err(RunFailure::Tool("Intermediate build produced no artifact".to_string()));
        };

        // Final artifacts
        let finals = self
            .builder
            .build_final(&intermediate_path, &build_target, &work_dir.join("RPMS"), &ctx)
            .await
            .map_err(|e| tool_error(log, &e))?;
        log.section("build final", &finals);
        if !finals.success {
            return Err(RunFailure::Tool(stage_error(&finals, "Final build failed")));
        }

        Ok((intermediate_path, finals.artifacts))
    }

    /// Work directory unique to one execution of one unit
    fn work_dir(&self, unit: &UnitId, execution_id: &str) -> PathBuf {
        self.config
            .build_dir
            .join(unit.as_str().replace(['@', '/'], "_"))
            .join(execution_id)
    }

    /// Re-read the unit so concurrent flags (cancel requests) are kept
    async fn reload_building(&self, unit_id: &UnitId) -> Result<Option<PackageUnit>> {
        let unit = self.store.require_unit(unit_id).await?;
        if unit.status == BuildStatus::Building {
            Ok(Some(unit))
        } else {
            tracing::warn!(
                "{unit_id} left building during the run ({}); discarding result",
                unit.status
            );
            Ok(None)
        }
    }

    async fn finish_completed(
        &self,
        unit_id: &UnitId,
        intermediate: PathBuf,
        finals: Vec<PathBuf>,
        log: String,
    ) -> Result<PipelineOutcome> {
        let Some(mut unit) = self.reload_building(unit_id).await? else {
            return Ok(PipelineOutcome::Skipped);
        };

        unit.classified_errors = self.classifier.analyze(&log);
        unit.build_log = log;
        unit.intermediate_artifact = Some(intermediate);
        unit.final_artifacts = finals;
        unit.transition(BuildStatus::Completed, Utc::now())?;
        self.store.put_unit(&unit).await?;

        tracing::info!(
            "Built {unit_id}: {} artifact(s)",
            unit.final_artifacts.len()
        );
        self.events.publish(UnitEvent::new(
            unit_id.clone(),
            BuildStatus::Completed,
            format!("{} artifact(s)", unit.final_artifacts.len()),
        ));
        Ok(PipelineOutcome::Completed)
    }

    async fn finish_failed(
        &self,
        unit_id: &UnitId,
        kind: FailureKind,
        message: String,
        log: String,
    ) -> Result<PipelineOutcome> {
        let Some(mut unit) = self.reload_building(unit_id).await? else {
            return Ok(PipelineOutcome::Skipped);
        };

        unit.classified_errors = self.classifier.analyze(&log);
        unit.build_log = log;
        unit.error_message.clone_from(&message);
        unit.transition(BuildStatus::Failed, Utc::now())?;
        self.store.put_unit(&unit).await?;

        tracing::warn!(
            "Build of {unit_id} failed: {message} ({})",
            crate::core::classifier::summary(&unit.classified_errors)
        );
        self.events
            .publish(UnitEvent::new(unit_id.clone(), BuildStatus::Failed, message.clone()));
        Ok(PipelineOutcome::Failed { kind, message })
    }
}

fn stage_error(result: &BuildResult, fallback: &str) -> String {
    result
        .error_message
        .clone()
        .unwrap_or_else(|| fallback.to_string())
}

fn tool_error(log: &mut RunLog, error: &crate::error::BuilderError) -> RunFailure {
    let message = error.to_string();
    log.line(&message);
    RunFailure::Tool(message)
}

fn execution_id(unit: &PackageUnit) -> String {
    let seq = EXECUTION_SEQ.fetch_add(1, Ordering::Relaxed);
    let name: String = unit
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{name}-{}-{seq}", now_unix_ms())
}
