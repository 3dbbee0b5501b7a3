//! Concurrency gate
//!
//! Caps how many builds run at once across every worker sharing the same
//! slot store. Admission is keyed by job id: a job either holds one slot or
//! none, and a slot whose holder vanished is reclaimed once its TTL passes.
//!
//! Running out of capacity is an expected outcome, reported as
//! [`Admission`], never as an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::defaults;
use crate::core::unit::JobId;
use crate::error::GateError;
use crate::infra::slots::{Reservation, SlotHolder, SlotStore};

/// How [`ConcurrencyGate::acquire`] waits for a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Try once and return immediately
    NonBlocking,
    /// Poll until a slot frees up or `timeout` elapses (`None` waits forever)
    Blocking { timeout: Option<Duration> },
}

/// A held slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub job_id: JobId,
    /// Live holders right after admission, including this one
    pub held: usize,
    pub capacity: usize,
}

/// Result of an admission request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The job now holds a slot and must release it when done
    Admitted(Slot),
    /// Blocking acquire gave up
    SlotTimeout { waited: Duration },
    /// Non-blocking acquire found no free slot, or the job already holds one
    NoSlotAvailable { held: usize },
}

impl Admission {
    /// Whether a slot was granted
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Gate tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Maximum number of concurrent holders
    pub max_concurrent: usize,
    /// Lifetime of a slot before it is reclaimed
    pub slot_ttl: Duration,
    /// Pause between attempts in blocking mode
    pub poll_interval: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::MAX_CONCURRENT_BUILDS,
            slot_ttl: Duration::from_secs(defaults::SLOT_TTL_SECS),
            poll_interval: Duration::from_millis(defaults::ACQUIRE_POLL_INTERVAL_MS),
        }
    }
}

impl GateConfig {
    /// Reject configurations the gate cannot honour
    pub fn validate(&self) -> Result<(), GateError> {
        if self.max_concurrent == 0 {
            return Err(GateError::InvalidConfig(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.slot_ttl.is_zero() {
            return Err(GateError::InvalidConfig(
                "slot_ttl must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(GateError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.slot_ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Distributed counting semaphore over a [`SlotStore`]
#[derive(Clone)]
pub struct ConcurrencyGate {
    store: Arc<dyn SlotStore>,
    config: GateConfig,
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConcurrencyGate {
    /// Create a gate, validating its configuration
    pub fn new(store: Arc<dyn SlotStore>, config: GateConfig) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.config.max_concurrent
    }

    /// Gate configuration
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Request a slot for `job`
    pub async fn acquire(&self, job: &JobId, mode: AcquireMode) -> Result<Admission, GateError> {
        let started = Instant::now();
        let deadline = match mode {
            AcquireMode::NonBlocking => None,
            AcquireMode::Blocking { timeout } => timeout.map(|t| started + t),
        };

        loop {
            match self
                .store
                .try_reserve(job, self.config.max_concurrent, self.config.ttl_ms())
                .await?
            {
                Reservation::Reserved { held } => {
                    tracing::info!(
                        "Acquired build slot for {job} ({held}/{})",
                        self.config.max_concurrent
                    );
                    return Ok(Admission::Admitted(Slot {
                        job_id: job.clone(),
                        held,
                        capacity: self.config.max_concurrent,
                    }));
                }
                Reservation::AlreadyHeld { held } => {
                    tracing::warn!("Job {job} already holds a build slot, not admitting twice");
                    return Ok(Admission::NoSlotAvailable { held });
                }
                Reservation::Full { held } => {
                    if mode == AcquireMode::NonBlocking {
                        tracing::debug!(
                            "No build slot for {job} ({held}/{} in use)",
                            self.config.max_concurrent
                        );
                        return Ok(Admission::NoSlotAvailable { held });
                    }
                }
            }

            if let Some(d) = deadline {
                if Instant::now() >= d {
                    let waited = started.elapsed();
                    tracing::warn!("Timed out waiting {waited:?} for a build slot for {job}");
                    return Ok(Admission::SlotTimeout { waited });
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Release the slot held by `job`. Releasing a slot that is not held is a no-op.
    pub async fn release(&self, job: &JobId) -> Result<bool, GateError> {
        let removed = self.store.remove(job).await?;
        if removed {
            let held = self.store.holders().await?.len();
            tracing::info!(
                "Released build slot for {job} ({held}/{})",
                self.config.max_concurrent
            );
        } else {
            tracing::debug!("Job {job} held no build slot");
        }
        Ok(removed)
    }

    /// Operator override: drop `job`'s slot regardless of who holds it
    pub async fn force_release(&self, job: &JobId) -> Result<bool, GateError> {
        let removed = self.store.remove(job).await?;
        tracing::warn!("Force released build slot for {job} (held: {removed})");
        Ok(removed)
    }

    /// Number of live slots
    pub async fn active_count(&self) -> Result<usize, GateError> {
        Ok(self.store.holders().await?.len())
    }

    /// Live slot holders with their deadlines
    pub async fn holders(&self) -> Result<Vec<SlotHolder>, GateError> {
        self.store.holders().await
    }

    /// Job ids holding live slots
    pub async fn active_ids(&self) -> Result<Vec<JobId>, GateError> {
        Ok(self.holders().await?.into_iter().map(|h| h.job_id).collect())
    }

    /// Empty the pool. Only safe when no build can be running, i.e. at startup.
    pub async fn clear_all(&self) -> Result<usize, GateError> {
        let dropped = self.store.clear().await?;
        tracing::warn!("Cleared {dropped} build slot(s)");
        Ok(dropped)
    }
}
