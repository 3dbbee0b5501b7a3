//! Common test utilities and helpers
//!
//! This module provides shared utilities for integration tests: a scripted
//! builder that never shells out, a unit store that fails on demand, and an
//! in-memory harness wiring store, gate, pipeline, scheduler and a local
//! worker pool together.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use reqpm::core::events::{ChannelEventSink, EventSink};
use reqpm::core::gate::{AcquireMode, ConcurrencyGate, GateConfig};
use reqpm::core::pipeline::{BuildPipeline, PipelineConfig};
use reqpm::core::retry::RetryPolicy;
use reqpm::core::scheduler::Scheduler;
use reqpm::core::unit::{
    normalize_package_name, BuildStatus, DependencyEdge, DependencyType, PackageUnit, UnitId,
};
use reqpm::error::{BuilderError, FilesystemError, StoreError};
use reqpm::infra::builder::{BuildContext, BuildResult, ExternalBuilder};
use reqpm::infra::runner::{LocalTaskRunner, WorkQueue, WorkerPool};
use reqpm::infra::slots::MemorySlotStore;
use reqpm::infra::store::{MemoryUnitStore, UnitStore};

pub const TARGET: &str = "rhel-9";

/// Builder with scripted results
#[derive(Default)]
pub struct ScriptedBuilder {
    /// Packages whose intermediate stage fails, by native name
    pub fail_intermediate: Mutex<HashSet<String>>,
    /// Log returned by failing stages
    pub failure_log: Mutex<String>,
    /// Time spent in the final stage
    pub delay: Mutex<Duration>,
    /// Stage calls, `"<stage>:<native name>"`
    pub calls: Mutex<Vec<String>>,
    /// Execution ids seen by the final stage
    pub executions: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let builder = Self::default();
        *builder.delay.lock().unwrap() = delay;
        Arc::new(builder)
    }

    pub fn fail_intermediate_of(&self, name: &str, log: &str) {
        self.fail_intermediate
            .lock()
            .unwrap()
            .insert(normalize_package_name(name));
        *self.failure_log.lock().unwrap() = log.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Most final stages seen running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn record(&self, stage: &str, native: &str) {
        self.calls.lock().unwrap().push(format!("{stage}:{native}"));
    }
}

fn native_name(path: &Path, suffix: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().trim_end_matches(suffix).to_string())
        .unwrap_or_default()
}

#[async_trait]
impl ExternalBuilder for ScriptedBuilder {
    async fn is_available(&self) -> bool {
        true
    }

    async fn valid_target(&self, target: &str) -> bool {
        target.starts_with(TARGET)
    }

    async fn stage_sources(
        &self,
        descriptor: &Path,
        _sources_dir: &Path,
        work_dir: &Path,
    ) -> Result<BuildResult, BuilderError> {
        self.record("stage", &native_name(descriptor, ".spec"));
        Ok(BuildResult::ok(vec![work_dir.join("SOURCES")], "staged 1 file"))
    }

    async fn build_intermediate(
        &self,
        descriptor: &Path,
        _sources_dir: &Path,
        out_dir: &Path,
        _ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError> {
        let native = native_name(descriptor, ".spec");
        self.record("intermediate", &native);
        if self.fail_intermediate.lock().unwrap().contains(&native) {
            let log = self.failure_log.lock().unwrap().clone();
            return Ok(BuildResult::failed("rpmbuild failed with code 1", log));
        }
        Ok(BuildResult::ok(
            vec![out_dir.join(format!("{native}.src.rpm"))],
            "Wrote: source package",
        ))
    }

    async fn build_final(
        &self,
        intermediate: &Path,
        _target: &str,
        out_dir: &Path,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError> {
        let native = native_name(intermediate, ".src.rpm");
        self.record("final", &native);
        self.executions.lock().unwrap().push(ctx.execution_id.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        Ok(BuildResult::ok(
            vec![out_dir.join(format!("{native}-1.0-1.noarch.rpm"))],
            "Finish: build phase",
        ))
    }
}

/// In-memory store whose reads of `Building` units fail while faults are armed
pub struct FaultyStore {
    inner: Arc<MemoryUnitStore>,
    building_read_faults: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<MemoryUnitStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            building_read_faults: AtomicUsize::new(0),
        })
    }

    /// Fail the next `count` reads of a unit that is `Building`
    pub fn fail_building_reads(&self, count: usize) {
        self.building_read_faults.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl UnitStore for FaultyStore {
    async fn get_unit(&self, id: &UnitId) -> Result<Option<PackageUnit>, StoreError> {
        let unit = self.inner.get_unit(id).await?;
        let building = unit.as_ref().is_some_and(|u| u.status == BuildStatus::Building);
        if building
            && self
                .building_read_faults
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Filesystem(FilesystemError::ReadFile {
                path: PathBuf::from("units.json"),
                error: "connection reset".to_string(),
            }));
        }
        Ok(unit)
    }

    async fn put_unit(&self, unit: &PackageUnit) -> Result<(), StoreError> {
        self.inner.put_unit(unit).await
    }

    async fn list_units(&self) -> Result<Vec<PackageUnit>, StoreError> {
        self.inner.list_units().await
    }

    async fn dependencies_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError> {
        self.inner.dependencies_of(unit).await
    }

    async fn dependents_of(&self, unit: &UnitId) -> Result<Vec<DependencyEdge>, StoreError> {
        self.inner.dependents_of(unit).await
    }

    async fn replace_dependencies(
        &self,
        unit: &UnitId,
        edges: Vec<DependencyEdge>,
    ) -> Result<(), StoreError> {
        self.inner.replace_dependencies(unit, edges).await
    }

    async fn all_edges(&self) -> Result<Vec<DependencyEdge>, StoreError> {
        self.inner.all_edges().await
    }
}

/// In-memory engine with a local worker pool
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryUnitStore>,
    /// Store seen by the scheduler and pipeline
    pub faults: Arc<FaultyStore>,
    pub gate: ConcurrencyGate,
    pub builder: Arc<ScriptedBuilder>,
    pub runner: Arc<LocalTaskRunner>,
    pub scheduler: Arc<Scheduler>,
    pub pipeline: Arc<BuildPipeline>,
    pub events: Arc<ChannelEventSink>,
    workers: usize,
    queue: Mutex<Option<WorkQueue>>,
}

/// Harness knobs
pub struct HarnessOptions {
    pub max_concurrent: usize,
    pub acquire_mode: AcquireMode,
    pub retry: RetryPolicy,
    pub workers: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            acquire_mode: AcquireMode::NonBlocking,
            retry: RetryPolicy::default(),
            workers: 4,
        }
    }
}

impl Harness {
    pub fn new(builder: Arc<ScriptedBuilder>) -> Self {
        Self::with_options(builder, HarnessOptions::default())
    }

    pub fn with_options(builder: Arc<ScriptedBuilder>, options: HarnessOptions) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(MemoryUnitStore::new());
        let faults = FaultyStore::new(store.clone());
        let gate = ConcurrencyGate::new(
            Arc::new(MemorySlotStore::new()),
            GateConfig {
                max_concurrent: options.max_concurrent,
                poll_interval: Duration::from_millis(10),
                ..GateConfig::default()
            },
        )
        .expect("valid gate config");
        let events = Arc::new(ChannelEventSink::default());
        let (runner, queue) = LocalTaskRunner::new();
        let runner = Arc::new(runner);

        let scheduler = Arc::new(Scheduler::new(
            faults.clone(),
            gate.clone(),
            runner.clone(),
            options.retry,
            events.clone(),
        ));
        let pipeline = Arc::new(BuildPipeline::new(
            faults.clone(),
            gate.clone(),
            builder.clone(),
            events.clone() as Arc<dyn EventSink>,
            PipelineConfig {
                build_dir: dir.path().join("build"),
                sources_dir: dir.path().join("sources"),
                acquire_mode: options.acquire_mode,
            },
        ));

        Self {
            dir,
            store,
            faults,
            gate,
            builder,
            runner,
            scheduler,
            pipeline,
            events,
            workers: options.workers,
            queue: Mutex::new(Some(queue)),
        }
    }

    /// Register a buildable unit (descriptor and sources present)
    pub async fn add_unit(&self, name: &str, deps: &[&str]) -> UnitId {
        let sources = self.dir.path().join("sources").join(name);
        std::fs::create_dir_all(&sources).expect("Failed to create sources");
        std::fs::write(sources.join(format!("{name}-1.0.tar.gz")), "tarball")
            .expect("Failed to write source");

        let unit = PackageUnit::new(name, TARGET)
            .with_version("1.0")
            .with_descriptor(format!("Name: {}\nVersion: 1.0\n", normalize_package_name(name)));
        self.put_with_deps(unit, deps).await
    }

    /// Register a unit exactly as given
    pub async fn put_with_deps(&self, unit: PackageUnit, deps: &[&str]) -> UnitId {
        let id = unit.id.clone();
        self.store.put_unit(&unit).await.expect("put unit");
        let edges = deps
            .iter()
            .map(|d| DependencyEdge::new(id.clone(), UnitId::new(d, TARGET), DependencyType::Runtime))
            .collect();
        self.store
            .replace_dependencies(&id, edges)
            .await
            .expect("replace edges");
        id
    }

    pub async fn unit(&self, id: &UnitId) -> PackageUnit {
        self.store.require_unit(id).await.expect("unit exists")
    }

    pub async fn status(&self, id: &UnitId) -> BuildStatus {
        self.unit(id).await.status
    }

    /// Worker pool that runs until everything queued, and everything it
    /// leads to, is done
    pub async fn drain(&self) {
        let queue = self
            .queue
            .lock()
            .unwrap()
            .take()
            .expect("queue already drained");
        let pool = WorkerPool::new(
            self.pipeline.clone(),
            self.scheduler.clone(),
            self.workers,
        );
        tokio::time::timeout(
            Duration::from_secs(20),
            pool.drain(queue, CancellationToken::new()),
        )
        .await
        .expect("pool drained in time");
    }
}

/// Temporary directories for CLI runs
pub struct TestProject {
    /// Temporary directory for the test project
    pub dir: TempDir,
}

impl TestProject {
    /// Create a new test project in a temporary directory
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Get the path to the test project directory
    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Create a file in the test project
    pub fn create_file(&self, name: &str, content: &str) {
        let path = self.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directories");
        }
        std::fs::write(path, content).expect("Failed to write file");
    }

    /// Run reqpm with its directories inside the project
    pub fn run(&self, args: &[&str]) -> Output {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_reqpm"));
        cmd.current_dir(self.path())
            .env_remove("REQPM_CONFIG")
            .env_remove("REQPM_MAX_CONCURRENT_BUILDS")
            .env_remove("REQPM_BUILD_DIR")
            .env_remove("REQPM_SOURCES_DIR")
            .env_remove("REQPM_STATE_DIR")
            .env_remove("RUST_LOG")
            .env("REQPM_CONFIG_DIR", self.path().join("config"))
            .env("REQPM_DATA_DIR", self.path().join("data"))
            .env("REQPM_CACHE_DIR", self.path().join("cache"));
        cmd.args(args);
        cmd.output().expect("Failed to execute reqpm")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Build log with one missing module and one missing header
pub const FAILED_BUILD_LOG: &str = "\
running build_ext
ModuleNotFoundError: No module named 'setuptools'
gcc -pthread -fPIC -c src/_speedups.c
src/_speedups.c:1:10: fatal error: Python.h: No such file or directory
error: command 'gcc' failed with exit status 1
";
