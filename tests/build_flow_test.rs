//! End-to-end build flow through scheduler, worker pool, gate and pipeline
//!
//! Every test runs against in-memory stores and a scripted builder, so no
//! packaging tools are needed.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, HarnessOptions, ScriptedBuilder, FAILED_BUILD_LOG, TARGET};
use reqpm::core::gate::AcquireMode;
use reqpm::core::monitor::ReconciliationMonitor;
use reqpm::core::retry::RetryPolicy;
use reqpm::core::scheduler::BuildRequestOutcome;
use reqpm::core::unit::{BuildStatus, JobId, PackageUnit, UnitId};
use reqpm::infra::runner::HandoffDispatcher;
use reqpm::infra::store::UnitStore;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependent_builds_after_its_dependency() {
    let h = Harness::new(ScriptedBuilder::new());
    let b = h.add_unit("six", &[]).await;
    let a = h.add_unit("python-dateutil", &["six"]).await;

    let outcome = h.scheduler.request_build(&a).await.unwrap();
    assert_eq!(
        outcome,
        BuildRequestOutcome::WaitingForDeps {
            unbuilt: vec![b.clone()]
        }
    );
    assert_eq!(h.status(&a).await, BuildStatus::WaitingForDeps);

    let outcome = h.scheduler.request_build(&b).await.unwrap();
    assert_eq!(outcome, BuildRequestOutcome::Dispatched);
    h.drain().await;

    assert_eq!(h.status(&b).await, BuildStatus::Completed);
    assert_eq!(h.status(&a).await, BuildStatus::Completed);

    let calls = h.builder.calls();
    let six = calls.iter().position(|c| c == "final:python3-six").unwrap();
    let dateutil = calls
        .iter()
        .position(|c| c == "final:python3-python-dateutil")
        .unwrap();
    assert!(six < dateutil, "dependency must finish first: {calls:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_slot_runs_one_build_at_a_time() {
    let h = Harness::with_options(
        ScriptedBuilder::with_delay(Duration::from_millis(100)),
        HarnessOptions {
            max_concurrent: 1,
            ..HarnessOptions::default()
        },
    );
    let first = h.add_unit("requests", &[]).await;
    let second = h.add_unit("idna", &[]).await;

    h.scheduler.request_build(&first).await.unwrap();
    h.scheduler.request_build(&second).await.unwrap();
    h.drain().await;

    assert_eq!(h.builder.peak(), 1);
    assert_eq!(h.status(&first).await, BuildStatus::Completed);
    assert_eq!(h.status(&second).await, BuildStatus::Completed);
    assert_eq!(h.gate.active_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_builds_never_exceed_capacity() {
    let h = Harness::with_options(
        ScriptedBuilder::with_delay(Duration::from_millis(50)),
        HarnessOptions {
            max_concurrent: 2,
            workers: 6,
            ..HarnessOptions::default()
        },
    );
    let names = ["attrs", "click", "jinja2", "markupsafe", "pyyaml", "wheel"];
    let mut ids = Vec::new();
    for name in names {
        ids.push(h.add_unit(name, &[]).await);
    }

    let requested = h.scheduler.request_all().await.unwrap();
    assert_eq!(requested.len(), names.len());
    h.drain().await;

    assert!(h.builder.peak() <= 2, "peak was {}", h.builder.peak());
    for id in &ids {
        assert_eq!(h.status(id).await, BuildStatus::Completed, "{id}");
    }

    let executions = h.builder.executions.lock().unwrap().clone();
    let distinct: HashSet<&String> = executions.iter().collect();
    assert_eq!(distinct.len(), executions.len());
}

#[tokio::test]
async fn test_tool_failure_is_classified() {
    let builder = ScriptedBuilder::new();
    builder.fail_intermediate_of("markupsafe", FAILED_BUILD_LOG);
    let h = Harness::new(builder);
    let id = h.add_unit("markupsafe", &[]).await;

    h.scheduler.request_build(&id).await.unwrap();
    h.drain().await;

    let unit = h.unit(&id).await;
    assert_eq!(unit.status, BuildStatus::Failed);
    assert_eq!(unit.error_message, "rpmbuild failed with code 1");
    let categories: Vec<&str> = unit
        .classified_errors
        .iter()
        .map(|e| e.category.as_str())
        .collect();
    assert!(categories.contains(&"Missing Python Modules"));
    assert!(categories.contains(&"Missing Header Files"));
    assert!(!h.builder.calls().iter().any(|c| c.starts_with("final:")));
    assert_eq!(h.gate.active_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_spec_fails_before_building() {
    let h = Harness::new(ScriptedBuilder::new());
    std::fs::create_dir_all(h.dir.path().join("sources").join("cffi")).unwrap();
    let id = h
        .put_with_deps(PackageUnit::new("cffi", TARGET).with_version("1.16.0"), &[])
        .await;

    h.scheduler.request_build(&id).await.unwrap();
    h.drain().await;

    let unit = h.unit(&id).await;
    assert_eq!(unit.status, BuildStatus::Failed);
    assert_eq!(unit.error_message, "No spec file found");
    assert!(h.builder.calls().is_empty());
}

#[tokio::test]
async fn test_failed_dependency_keeps_dependent_waiting() {
    let builder = ScriptedBuilder::new();
    builder.fail_intermediate_of("cffi", FAILED_BUILD_LOG);
    let h = Harness::new(builder);
    let cffi = h.add_unit("cffi", &[]).await;
    let crypto = h.add_unit("cryptography", &["cffi"]).await;

    h.scheduler.request_build(&crypto).await.unwrap();
    h.scheduler.request_build(&cffi).await.unwrap();
    h.drain().await;

    assert_eq!(h.status(&cffi).await, BuildStatus::Failed);
    assert_eq!(h.status(&crypto).await, BuildStatus::WaitingForDeps);
}

#[tokio::test]
async fn test_slot_timeout_retries_until_budget_is_spent() {
    let h = Harness::with_options(
        ScriptedBuilder::new(),
        HarnessOptions {
            max_concurrent: 1,
            acquire_mode: AcquireMode::Blocking {
                timeout: Some(Duration::from_millis(30)),
            },
            retry: RetryPolicy::new(Duration::from_millis(10), Some(2)),
            ..HarnessOptions::default()
        },
    );
    // Held by a build this pool knows nothing about
    let outsider = JobId::new("build_outsider@rhel-9");
    assert!(h
        .gate
        .acquire(&outsider, AcquireMode::NonBlocking)
        .await
        .unwrap()
        .is_admitted());

    let id = h.add_unit("numpy", &[]).await;
    h.scheduler.request_build(&id).await.unwrap();
    h.drain().await;

    let unit = h.unit(&id).await;
    assert_eq!(unit.status, BuildStatus::NotBuilt);
    assert_eq!(unit.retry_count, 2);
    assert_eq!(
        unit.error_message,
        "Gave up waiting for a build slot after 2 attempts"
    );
    assert!(h.builder.calls().is_empty());
}

#[tokio::test]
async fn test_startup_recovery_resets_in_flight_work() {
    let h = Harness::with_options(
        ScriptedBuilder::new(),
        HarnessOptions {
            max_concurrent: 2,
            ..HarnessOptions::default()
        },
    );
    let mut ids = Vec::new();
    for name in ["lxml", "pillow", "psutil"] {
        let mut unit = PackageUnit::new(name, TARGET);
        unit.status = BuildStatus::Building;
        ids.push(h.put_with_deps(unit, &[]).await);
    }
    for id in &ids[..2] {
        h.gate
            .acquire(&id.job_id(), AcquireMode::NonBlocking)
            .await
            .unwrap();
    }
    assert_eq!(h.gate.active_count().await.unwrap(), 2);

    let report = h.scheduler.recover_on_startup().await.unwrap();

    assert_eq!(report.reset.len(), 3);
    assert_eq!(report.slots_cleared, 2);
    assert_eq!(h.gate.active_count().await.unwrap(), 0);
    for id in &ids {
        assert_eq!(h.status(id).await, BuildStatus::NotBuilt);
    }
}

#[tokio::test]
async fn test_monitor_redispatches_lost_pending_unit() {
    let h = Harness::new(ScriptedBuilder::new());
    let id = h.add_unit("certifi", &[]).await;

    // Pending but never handed to this pool, as after a `build --detach`
    let mut unit = h.unit(&id).await;
    unit.status = BuildStatus::Pending;
    unit.queued_at = None;
    h.store.put_unit(&unit).await.unwrap();

    let monitor = ReconciliationMonitor::new(
        h.store.clone(),
        h.runner.clone(),
        h.gate.clone(),
        Duration::ZERO,
    );
    let report = monitor.pass().await.unwrap();
    assert_eq!(report.redispatched, vec![id.clone()]);

    h.drain().await;
    assert_eq!(h.status(&id).await, BuildStatus::Completed);
}

#[tokio::test]
async fn test_not_required_dependency_unblocks_dependent() {
    let h = Harness::new(ScriptedBuilder::new());
    h.add_unit("setuptools", &[]).await;
    let app = h.add_unit("flask", &["setuptools"]).await;

    h.scheduler.request_build(&app).await.unwrap();
    assert_eq!(h.status(&app).await, BuildStatus::WaitingForDeps);

    let woken = h
        .scheduler
        .mark_not_required(&UnitId::new("setuptools", TARGET))
        .await
        .unwrap();
    assert_eq!(woken, vec![app.clone()]);
    h.drain().await;

    assert_eq!(h.status(&app).await, BuildStatus::Completed);
    assert_eq!(h.builder.calls().len(), 3);
}

#[tokio::test]
async fn test_events_follow_the_lifecycle() {
    let h = Harness::new(ScriptedBuilder::new());
    let mut events = h.events.subscribe();
    let id = h.add_unit("packaging", &[]).await;

    h.scheduler.request_build(&id).await.unwrap();
    h.drain().await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.unit == id {
            seen.push(event.status);
        }
    }
    assert_eq!(
        seen,
        vec![
            BuildStatus::Pending,
            BuildStatus::Building,
            BuildStatus::Completed
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unit_with_leaked_slot_does_not_spin_the_pool() {
    let h = Harness::new(ScriptedBuilder::new());
    let id = h.add_unit("attrs", &[]).await;

    // Slot left behind by a worker that died between admission and start
    let leaked = h.gate.acquire(&id.job_id(), AcquireMode::NonBlocking).await.unwrap();
    assert!(leaked.is_admitted());

    h.scheduler.request_build(&id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), h.drain())
        .await
        .expect("pool stops while the unit's slot is held");

    assert_eq!(h.status(&id).await, BuildStatus::Pending);
    assert!(h.builder.calls().is_empty());

    let monitor = ReconciliationMonitor::new(
        h.store.clone(),
        Arc::new(HandoffDispatcher),
        h.gate.clone(),
        Duration::ZERO,
    );
    assert!(monitor.pass().await.unwrap().redispatched.is_empty());

    h.gate.release(&id.job_id()).await.unwrap();
    assert_eq!(monitor.pass().await.unwrap().redispatched, vec![id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_store_fault_mid_build_requeues_the_unit() {
    let h = Harness::with_options(
        ScriptedBuilder::new(),
        HarnessOptions {
            retry: RetryPolicy::new(Duration::from_millis(20), Some(3)),
            ..HarnessOptions::default()
        },
    );
    let id = h.add_unit("cryptography", &[]).await;
    h.faults.fail_building_reads(1);

    h.scheduler.request_build(&id).await.unwrap();
    h.drain().await;

    let unit = h.unit(&id).await;
    assert_eq!(unit.status, BuildStatus::Completed);
    assert_eq!(unit.retry_count, 1);
    let finals = h
        .builder
        .calls()
        .iter()
        .filter(|c| c.starts_with("final:"))
        .count();
    assert_eq!(finals, 2);
    assert_eq!(h.gate.active_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_monitor_recovers_unit_stranded_in_building() {
    let h = Harness::new(ScriptedBuilder::new());
    let id = h.add_unit("pyopenssl", &[]).await;
    // The run and the requeue after it both hit the fault
    h.faults.fail_building_reads(2);

    h.scheduler.request_build(&id).await.unwrap();
    h.drain().await;
    assert_eq!(h.status(&id).await, BuildStatus::Building);
    assert_eq!(h.gate.active_count().await.unwrap(), 0);

    let monitor = ReconciliationMonitor::new(
        h.store.clone(),
        Arc::new(HandoffDispatcher),
        h.gate.clone(),
        Duration::ZERO,
    );
    let report = monitor.pass().await.unwrap();

    assert_eq!(report.recovered, vec![id.clone()]);
    let unit = h.unit(&id).await;
    assert_eq!(unit.status, BuildStatus::Pending);
    assert!(unit.started_at.is_none());
}
