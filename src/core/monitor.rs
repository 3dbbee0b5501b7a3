//! Periodic reconciliation
//!
//! Dispatch messages can be lost and workers can die before their first
//! write. Each pass finds `Pending` units that never started and are not
//! known to the task runner, and dispatches them again. A unit stuck in
//! `Building` whose job holds no build slot has lost its run; it goes back
//! to `Pending` and is dispatched again too. Passes also retry descriptor
//! preparation for units that still have none.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::core::events::{EventSink, NullEventSink, UnitEvent};
use crate::core::gate::ConcurrencyGate;
use crate::core::resolver::DependencyResolver;
use crate::core::unit::{BuildStatus, JobId, UnitId};
use crate::error::Result;
use crate::infra::runner::Dispatcher;
use crate::infra::store::UnitStore;

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub redispatched: Vec<UnitId>,
    /// Units found `Building` without a live slot, now `Pending` again
    pub recovered: Vec<UnitId>,
    pub descriptors_prepared: usize,
    pub descriptor_failures: usize,
}

pub struct ReconciliationMonitor {
    store: Arc<dyn UnitStore>,
    dispatcher: Arc<dyn Dispatcher>,
    gate: ConcurrencyGate,
    events: Arc<dyn EventSink>,
    resolver: Option<Arc<DependencyResolver>>,
    grace: Duration,
    prepare_limit: usize,
}

impl ReconciliationMonitor {
    pub fn new(
        store: Arc<dyn UnitStore>,
        dispatcher: Arc<dyn Dispatcher>,
        gate: ConcurrencyGate,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gate,
            events: Arc::new(NullEventSink),
            resolver: None,
            grace,
            prepare_limit: defaults::MONITOR_PREPARE_LIMIT,
        }
    }

    /// Publish status changes made by the monitor to `events`
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Also prepare missing descriptors, at most `limit` per pass
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<DependencyResolver>, limit: usize) -> Self {
        self.resolver = Some(resolver);
        self.prepare_limit = limit;
        self
    }

    pub async fn pass(&self) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero());
        // Holders first: a run admitted after this read is at most `grace` old
        let holders: HashSet<JobId> = self.gate.active_ids().await?.into_iter().collect();
        let active = self.dispatcher.active_jobs().await?;
        let untracked = |job: &JobId| !active.contains(job) && !holders.contains(job);

        for unit in self.store.units_with_status(BuildStatus::Building).await? {
            let stale = unit.started_at.map_or(true, |started| now - started > grace);
            if !stale || !untracked(&unit.job_id()) {
                continue;
            }
            // Re-read so a run that just finished is not reset
            let Some(mut current) = self.store.get_unit(&unit.id).await? else {
                continue;
            };
            if current.status != BuildStatus::Building || current.started_at != unit.started_at {
                continue;
            }
            current.transition(BuildStatus::Pending, Utc::now())?;
            current.error_message = "Build lost its slot; requeued".to_string();
            self.store.put_unit(&current).await?;
            tracing::warn!("{} was building without a build slot, requeued", current.id);
            self.events.publish(UnitEvent::new(
                current.id.clone(),
                BuildStatus::Pending,
                current.error_message.clone(),
            ));
            self.dispatcher.dispatch(&current.id).await?;
            report.recovered.push(current.id);
        }

        for unit in self.store.units_with_status(BuildStatus::Pending).await? {
            let stale = unit.queued_at.map_or(true, |queued| now - queued > grace);
            if !stale || unit.started_at.is_some() || report.recovered.contains(&unit.id) {
                continue;
            }
            if !untracked(&unit.job_id()) {
                continue;
            }
            if self.dispatcher.dispatch(&unit.id).await? {
                tracing::info!("Re-dispatched stuck unit {}", unit.id);
                report.redispatched.push(unit.id);
            }
        }

        if let Some(resolver) = &self.resolver {
            let missing: Vec<UnitId> = self
                .store
                .list_units()
                .await?
                .into_iter()
                .filter(|u| {
                    u.descriptor.is_none()
                        && matches!(
                            u.status,
                            BuildStatus::NotBuilt | BuildStatus::WaitingForDeps | BuildStatus::Pending
                        )
                })
                .map(|u| u.id)
                .take(self.prepare_limit)
                .collect();

            for id in missing {
                match resolver.prepare_descriptor(&id).await {
                    Ok(true) => report.descriptors_prepared += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("Failed to prepare descriptor for {id}: {e}");
                        report.descriptor_failures += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Run passes every `interval` until `cancel` fires
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Monitor started (every {}s)", interval.as_secs());

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.pass().await {
                Ok(report)
                    if !report.redispatched.is_empty()
                        || !report.recovered.is_empty()
                        || report.descriptors_prepared > 0 =>
                {
                    tracing::info!(
                        "Monitor pass: {} re-dispatched, {} recovered, {} descriptor(s) prepared",
                        report.redispatched.len(),
                        report.recovered.len(),
                        report.descriptors_prepared
                    );
                }
                Ok(_) => tracing::debug!("Monitor pass: nothing to do"),
                Err(e) => tracing::error!("Monitor pass failed: {e}"),
            }
        }
        tracing::info!("Monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::gate::{AcquireMode, GateConfig};
    use crate::core::unit::PackageUnit;
    use crate::infra::slots::MemorySlotStore;
    use crate::infra::store::MemoryUnitStore;
    use std::sync::Mutex;

    fn gate() -> ConcurrencyGate {
        ConcurrencyGate::new(Arc::new(MemorySlotStore::new()), GateConfig::default()).unwrap()
    }

    #[derive(Default)]
    struct StubDispatcher {
        active: HashSet<JobId>,
        dispatched: Mutex<Vec<UnitId>>,
    }

    #[async_trait::async_trait]
    impl Dispatcher for StubDispatcher {
        async fn dispatch(&self, unit: &UnitId) -> Result<bool> {
            self.dispatched.lock().unwrap().push(unit.clone());
            Ok(true)
        }

        async fn dispatch_after(&self, unit: &UnitId, _delay: Duration) -> Result<()> {
            self.dispatch(unit).await.map(|_| ())
        }

        async fn active_jobs(&self) -> Result<HashSet<JobId>> {
            Ok(self.active.clone())
        }
    }

    async fn pending(store: &MemoryUnitStore, name: &str, queued_secs_ago: i64) -> UnitId {
        let mut unit = PackageUnit::new(name, "rhel-9");
        unit.status = BuildStatus::Pending;
        unit.queued_at = Some(Utc::now() - chrono::Duration::seconds(queued_secs_ago));
        store.put_unit(&unit).await.unwrap();
        unit.id
    }

    #[tokio::test]
    async fn test_redispatches_only_lost_units() {
        let store = Arc::new(MemoryUnitStore::new());
        let lost = pending(&store, "lost", 120).await;
        let fresh = pending(&store, "fresh", 1).await;
        let running = pending(&store, "running", 120).await;

        let dispatcher = Arc::new(StubDispatcher {
            active: HashSet::from([running.job_id()]),
            ..StubDispatcher::default()
        });
        let monitor =
            ReconciliationMonitor::new(store.clone(), dispatcher.clone(), gate(), Duration::from_secs(30));

        let report = monitor.pass().await.unwrap();

        assert_eq!(report.redispatched, vec![lost.clone()]);
        let dispatched = dispatcher.dispatched.lock().unwrap().clone();
        assert!(!dispatched.contains(&fresh));
        assert!(!dispatched.contains(&running));
    }

    #[tokio::test]
    async fn test_started_units_are_left_alone() {
        let store = Arc::new(MemoryUnitStore::new());
        let id = pending(&store, "started", 120).await;
        let mut unit = store.require_unit(&id).await.unwrap();
        unit.started_at = Some(Utc::now());
        store.put_unit(&unit).await.unwrap();

        let dispatcher = Arc::new(StubDispatcher::default());
        let monitor = ReconciliationMonitor::new(store, dispatcher, gate(), Duration::from_secs(30));

        assert!(monitor.pass().await.unwrap().redispatched.is_empty());
    }

    #[tokio::test]
    async fn test_pending_unit_holding_a_slot_is_left_alone() {
        let store = Arc::new(MemoryUnitStore::new());
        let id = pending(&store, "leaked", 120).await;
        let gate = gate();
        gate.acquire(&id.job_id(), AcquireMode::NonBlocking).await.unwrap();

        let dispatcher = Arc::new(StubDispatcher::default());
        let monitor = ReconciliationMonitor::new(store, dispatcher.clone(), gate, Duration::from_secs(30));

        assert!(monitor.pass().await.unwrap().redispatched.is_empty());
        assert!(dispatcher.dispatched.lock().unwrap().is_empty());
    }

    async fn building(store: &MemoryUnitStore, name: &str, started_secs_ago: i64) -> UnitId {
        let mut unit = PackageUnit::new(name, "rhel-9");
        unit.status = BuildStatus::Building;
        unit.queued_at = Some(Utc::now() - chrono::Duration::seconds(started_secs_ago + 1));
        unit.started_at = Some(Utc::now() - chrono::Duration::seconds(started_secs_ago));
        store.put_unit(&unit).await.unwrap();
        unit.id
    }

    #[tokio::test]
    async fn test_building_unit_without_slot_is_requeued() {
        let store = Arc::new(MemoryUnitStore::new());
        let lost = building(&store, "lost", 120).await;
        let slotted = building(&store, "slotted", 120).await;
        let fresh = building(&store, "fresh", 1).await;
        let gate = gate();
        gate.acquire(&slotted.job_id(), AcquireMode::NonBlocking).await.unwrap();

        let dispatcher = Arc::new(StubDispatcher::default());
        let monitor =
            ReconciliationMonitor::new(store.clone(), dispatcher.clone(), gate, Duration::from_secs(30));

        let report = monitor.pass().await.unwrap();

        assert_eq!(report.recovered, vec![lost.clone()]);
        assert!(report.redispatched.is_empty());
        let unit = store.require_unit(&lost).await.unwrap();
        assert_eq!(unit.status, BuildStatus::Pending);
        assert!(unit.started_at.is_none());
        assert_eq!(dispatcher.dispatched.lock().unwrap().clone(), vec![lost]);
        assert_eq!(store.require_unit(&slotted).await.unwrap().status, BuildStatus::Building);
        assert_eq!(store.require_unit(&fresh).await.unwrap().status, BuildStatus::Building);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryUnitStore::new());
        let monitor = ReconciliationMonitor::new(
            store,
            Arc::new(StubDispatcher::default()),
            gate(),
            Duration::from_secs(30),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(2), monitor.run(Duration::from_millis(10), cancel))
            .await
            .unwrap();
    }
}
