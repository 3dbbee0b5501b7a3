//! Build scheduling
//!
//! The scheduler owns the unit lifecycle outside the pipeline: it turns build
//! requests into `WaitingForDeps` or `Pending` + dispatch, reacts to pipeline
//! outcomes (wake dependents, refill freed slots, retry admission timeouts
//! and interrupted runs) and resets in-flight work after a restart.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::core::events::{EventSink, UnitEvent};
use crate::core::gate::ConcurrencyGate;
use crate::core::pipeline::PipelineOutcome;
use crate::core::resolver::{is_ready, unbuilt_dependencies};
use crate::core::retry::RetryPolicy;
use crate::core::unit::{BuildStatus, JobId, PackageUnit, UnitId};
use crate::error::{ReqpmError, Result};
use crate::infra::runner::Dispatcher;
use crate::infra::store::UnitStore;

/// Result of a build request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildRequestOutcome {
    /// Now `Pending` and handed to the task runner
    Dispatched,
    /// Blocked on these dependencies
    WaitingForDeps { unbuilt: Vec<UnitId> },
    /// Already building; nothing changed
    AlreadyBuilding,
    /// The request does not apply to a unit in this status
    Rejected { status: BuildStatus },
}

impl fmt::Display for BuildRequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatched => write!(f, "queued for build"),
            Self::WaitingForDeps { unbuilt } => {
                let names: Vec<&str> = unbuilt.iter().map(UnitId::as_str).collect();
                write!(f, "waiting for dependencies: {}", names.join(", "))
            }
            Self::AlreadyBuilding => write!(f, "already building"),
            Self::Rejected { status } => write!(f, "not applicable to a unit that is {status}"),
        }
    }
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The unit is building; the build finishes but is never retried
    Deferred,
    NotCancellable(BuildStatus),
}

/// What startup recovery reset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Units moved back to `NotBuilt`
    pub reset: Vec<UnitId>,
    /// Slot holders dropped from the gate
    pub slots_cleared: usize,
}

/// Point-in-time view of the build queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Unit count per status, every status present
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
    pub active_slots: usize,
    pub capacity: usize,
    pub slot_holders: Vec<JobId>,
}

/// Coordinates build requests, readiness and retries
pub struct Scheduler {
    store: Arc<dyn UnitStore>,
    gate: ConcurrencyGate,
    dispatcher: Arc<dyn Dispatcher>,
    retry: RetryPolicy,
    events: Arc<dyn EventSink>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn UnitStore>,
        gate: ConcurrencyGate,
        dispatcher: Arc<dyn Dispatcher>,
        retry: RetryPolicy,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            gate,
            dispatcher,
            retry,
            events,
        }
    }

    /// The gate shared with the pipeline
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Request a build of `id`.
    ///
    /// With unbuilt dependencies the unit waits for them; otherwise it
    /// becomes `Pending` and is dispatched.
    pub async fn request_build(&self, id: &UnitId) -> Result<BuildRequestOutcome> {
        self.request(id, true).await
    }

    /// Build `id` without checking its dependencies
    pub async fn rebuild(&self, id: &UnitId) -> Result<BuildRequestOutcome> {
        self.request(id, false).await
    }

    async fn request(&self, id: &UnitId, check_deps: bool) -> Result<BuildRequestOutcome> {
        let mut unit = self.store.require_unit(id).await?;
        if unit.status == BuildStatus::Building {
            tracing::info!("{id} is already building");
            return Ok(BuildRequestOutcome::AlreadyBuilding);
        }

        if check_deps {
            let unbuilt = unbuilt_dependencies(self.store.as_ref(), id).await?;
            if !unbuilt.is_empty() {
                self.set_status(&mut unit, BuildStatus::WaitingForDeps, "Waiting for dependencies")
                    .await?;
                tracing::info!("{id} waits for {} dependenc(ies)", unbuilt.len());
                return Ok(BuildRequestOutcome::WaitingForDeps { unbuilt });
            }
        }

        self.set_status(&mut unit, BuildStatus::Pending, "Queued for build")
            .await?;
        self.dispatcher.dispatch(id).await?;
        Ok(BuildRequestOutcome::Dispatched)
    }

    /// Request every unit that is not built, failed or cancelled, lowest
    /// build level first
    pub async fn request_all(&self) -> Result<Vec<(UnitId, BuildRequestOutcome)>> {
        let mut units: Vec<PackageUnit> = self
            .store
            .list_units()
            .await?
            .into_iter()
            .filter(|u| {
                matches!(
                    u.status,
                    BuildStatus::NotBuilt | BuildStatus::Failed | BuildStatus::Cancelled
                )
            })
            .collect();
        units.sort_by(|a, b| {
            (a.build_order.unwrap_or(u32::MAX), &a.id).cmp(&(b.build_order.unwrap_or(u32::MAX), &b.id))
        });

        let mut outcomes = Vec::with_capacity(units.len());
        for unit in units {
            let outcome = self.request_build(&unit.id).await?;
            outcomes.push((unit.id, outcome));
        }
        Ok(outcomes)
    }

    /// Cancel a unit that has not started building
    pub async fn cancel(&self, id: &UnitId) -> Result<CancelOutcome> {
        let mut unit = self.store.require_unit(id).await?;
        match unit.status {
            BuildStatus::WaitingForDeps | BuildStatus::Pending => {
                self.set_status(&mut unit, BuildStatus::Cancelled, "Build cancelled")
                    .await?;
                Ok(CancelOutcome::Cancelled)
            }
            BuildStatus::Building => {
                unit.cancel_requested = true;
                unit.updated_at = Utc::now();
                self.store.put_unit(&unit).await?;
                tracing::warn!("{id} is building and cannot be interrupted; it will not be retried");
                Ok(CancelOutcome::Deferred)
            }
            status => Ok(CancelOutcome::NotCancellable(status)),
        }
    }

    /// Explicit retry of a failed or cancelled unit; resets the retry count
    pub async fn retry(&self, id: &UnitId) -> Result<BuildRequestOutcome> {
        let mut unit = self.store.require_unit(id).await?;
        if !matches!(unit.status, BuildStatus::Failed | BuildStatus::Cancelled) {
            return Ok(BuildRequestOutcome::Rejected {
                status: unit.status,
            });
        }
        unit.retry_count = 0;
        self.store.put_unit(&unit).await?;
        self.request_build(id).await
    }

    /// Mark `id` as not needing a build and wake its dependents
    pub async fn mark_not_required(&self, id: &UnitId) -> Result<Vec<UnitId>> {
        let mut unit = self.store.require_unit(id).await?;
        self.set_status(&mut unit, BuildStatus::NotRequired, "Marked as not required")
            .await?;
        self.on_dependency_satisfied(id).await
    }

    /// React to the end of a pipeline run
    pub async fn handle_outcome(&self, id: &UnitId, outcome: PipelineOutcome) -> Result<()> {
        if RetryPolicy::is_retryable(&outcome) {
            return self.schedule_retry(id).await;
        }
        if matches!(outcome, PipelineOutcome::Completed) {
            self.on_dependency_satisfied(id).await?;
        }
        // A deferral frees no slot, so there is nothing to refill
        if outcome.released_slot() {
            self.kick_deferred().await?;
        }
        Ok(())
    }

    /// React to a run aborted by a store or gate fault.
    ///
    /// A unit left `Building` goes back to `Pending` and is dispatched again
    /// after the retry backoff, within the same budget as admission timeouts.
    pub async fn handle_interrupted(&self, id: &UnitId, error: &ReqpmError) -> Result<()> {
        let mut unit = self.store.require_unit(id).await?;
        if unit.status == BuildStatus::Building {
            let message = format!("Build interrupted: {error}");
            let cancelled = unit.cancel_requested;
            unit.transition(BuildStatus::Pending, Utc::now())?;
            if cancelled {
                unit.transition(BuildStatus::Cancelled, Utc::now())?;
                unit.error_message.clone_from(&message);
                self.store.put_unit(&unit).await?;
                tracing::info!("Not retrying {id}: cancel requested");
                self.events
                    .publish(UnitEvent::new(id.clone(), BuildStatus::Cancelled, message));
                return self.kick_deferred().await.map(|_| ());
            }
            unit.error_message.clone_from(&message);
            self.store.put_unit(&unit).await?;
            self.events
                .publish(UnitEvent::new(id.clone(), BuildStatus::Pending, message));
        }
        self.schedule_retry(id).await
    }

    async fn schedule_retry(&self, id: &UnitId) -> Result<()> {
        let mut unit = self.store.require_unit(id).await?;
        if unit.status != BuildStatus::Pending {
            return Ok(());
        }
        if unit.cancel_requested {
            tracing::info!("Not retrying {id}: cancel requested");
            return Ok(());
        }

        match self.retry.next_delay(unit.retry_count) {
            Some(delay) => {
                unit.retry_count += 1;
                unit.updated_at = Utc::now();
                self.store.put_unit(&unit).await?;
                tracing::info!(
                    "Retrying {id} in {}s (attempt {})",
                    delay.as_secs(),
                    unit.retry_count
                );
                self.dispatcher.dispatch_after(id, delay).await?;
            }
            None => {
                let message = if unit.error_message.is_empty() {
                    format!(
                        "Gave up waiting for a build slot after {} attempts",
                        unit.retry_count
                    )
                } else {
                    format!(
                        "Gave up after {} attempts; last error: {}",
                        unit.retry_count, unit.error_message
                    )
                };
                unit.transition(BuildStatus::NotBuilt, Utc::now())?;
                unit.error_message.clone_from(&message);
                self.store.put_unit(&unit).await?;
                tracing::warn!("{id}: {message}");
                self.events
                    .publish(UnitEvent::new(id.clone(), BuildStatus::NotBuilt, message));
            }
        }
        Ok(())
    }

    /// Dispatch every dependent of `id` that waits and is now fully ready
    pub async fn on_dependency_satisfied(&self, id: &UnitId) -> Result<Vec<UnitId>> {
        let mut dispatched = Vec::new();
        for edge in self.store.dependents_of(id).await? {
            let Some(mut dependent) = self.store.get_unit(&edge.unit).await? else {
                continue;
            };
            if dependent.status != BuildStatus::WaitingForDeps
                || !is_ready(self.store.as_ref(), &dependent.id).await?
            {
                continue;
            }

            self.set_status(&mut dependent, BuildStatus::Pending, "Dependencies satisfied")
                .await?;
            self.dispatcher.dispatch(&dependent.id).await?;
            tracing::info!("{} is ready after {id}", dependent.id);
            dispatched.push(dependent.id);
        }
        Ok(dispatched)
    }

    /// Re-dispatch `Pending` units deferred for lack of a slot, up to the
    /// number of free slots.
    ///
    /// Units whose job still holds a slot are skipped: admission would
    /// refuse them again until that slot is released or expires.
    pub async fn kick_deferred(&self) -> Result<usize> {
        let holders: HashSet<JobId> = self.gate.active_ids().await?.into_iter().collect();
        let free = self.gate.capacity().saturating_sub(holders.len());
        if free == 0 {
            return Ok(0);
        }

        let active = self.dispatcher.active_jobs().await?;
        let mut waiting: Vec<PackageUnit> = self
            .store
            .units_with_status(BuildStatus::Pending)
            .await?
            .into_iter()
            .filter(|u| {
                let job = u.job_id();
                !active.contains(&job) && !holders.contains(&job)
            })
            .collect();
        waiting.sort_by_key(|u| (u.build_order.unwrap_or(u32::MAX), u.queued_at));

        let mut kicked = 0;
        for unit in waiting.into_iter().take(free) {
            if self.dispatcher.dispatch(&unit.id).await? {
                kicked += 1;
            }
        }
        if kicked > 0 {
            tracing::debug!("Re-dispatched {kicked} deferred unit(s)");
        }
        Ok(kicked)
    }

    /// Reset in-flight units to `NotBuilt` and clear every slot.
    ///
    /// Run once when a worker pool starts; work owned by a previous pool
    /// is presumed lost.
    pub async fn recover_on_startup(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();
        for mut unit in self.store.list_units().await? {
            if !unit.status.is_in_flight() {
                continue;
            }
            unit.transition(BuildStatus::NotBuilt, now)?;
            self.store.put_unit(&unit).await?;
            report.reset.push(unit.id);
        }
        report.slots_cleared = self.gate.clear_all().await?;

        if !report.reset.is_empty() || report.slots_cleared > 0 {
            tracing::warn!(
                "Startup recovery reset {} unit(s) and cleared {} slot(s)",
                report.reset.len(),
                report.slots_cleared
            );
        }
        Ok(report)
    }

    /// Counts per status and gate occupancy
    pub async fn status(&self) -> Result<StatusSnapshot> {
        let mut counts: BTreeMap<String, usize> = BuildStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let units = self.store.list_units().await?;
        for unit in &units {
            *counts.entry(unit.status.as_str().to_string()).or_default() += 1;
        }
        let slot_holders = self.gate.active_ids().await?;

        Ok(StatusSnapshot {
            counts,
            total: units.len(),
            active_slots: slot_holders.len(),
            capacity: self.gate.capacity(),
            slot_holders,
        })
    }

    async fn set_status(
        &self,
        unit: &mut PackageUnit,
        status: BuildStatus,
        message: &str,
    ) -> Result<()> {
        if unit.transition(status, Utc::now())? {
            self.store.put_unit(unit).await?;
            self.events
                .publish(UnitEvent::new(unit.id.clone(), status, message));
        }
        Ok(())
    }
}
