//! Shared slot table backing the concurrency gate
//!
//! The table lists the job ids that currently hold a build slot, each with
//! a deadline after which the slot is reclaimed. Every operation purges
//! expired holders inside the same atomic step that reads the table, so a
//! crashed holder frees its slot without a separate sweeper.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::unit::JobId;
use crate::error::GateError;
use crate::infra::filesystem;

/// Current time in milliseconds since the Unix epoch
pub fn now_unix_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// One slot holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotHolder {
    pub job_id: JobId,
    pub acquired_at_ms: u64,
    pub deadline_ms: u64,
}

/// Outcome of a reservation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Slot taken; `held` counts live holders including this one
    Reserved { held: usize },
    /// The job already holds a slot; nothing changed
    AlreadyHeld { held: usize },
    /// Pool is at capacity
    Full { held: usize },
}

/// Slot table state, serialized as-is by the file store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTable {
    #[serde(default)]
    pub holders: Vec<SlotHolder>,
}

impl SlotTable {
    /// Drop holders whose deadline has passed
    pub fn purge_expired(&mut self, now_ms: u64) -> usize {
        let before = self.holders.len();
        self.holders.retain(|h| h.deadline_ms > now_ms);
        before - self.holders.len()
    }

    /// Try to add `job` as a holder
    pub fn reserve(&mut self, job: &JobId, capacity: usize, ttl_ms: u64, now_ms: u64) -> Reservation {
        self.purge_expired(now_ms);

        let held = self.holders.len();
        if self.holders.iter().any(|h| &h.job_id == job) {
            return Reservation::AlreadyHeld { held };
        }
        if held >= capacity {
            return Reservation::Full { held };
        }

        self.holders.push(SlotHolder {
            job_id: job.clone(),
            acquired_at_ms: now_ms,
            deadline_ms: now_ms.saturating_add(ttl_ms),
        });
        Reservation::Reserved { held: held + 1 }
    }

    /// Remove `job`; returns whether it was present
    pub fn remove(&mut self, job: &JobId) -> bool {
        let before = self.holders.len();
        self.holders.retain(|h| &h.job_id != job);
        before != self.holders.len()
    }
}

/// Shared storage for the slot table
///
/// Implementations must apply each call atomically with respect to every
/// other caller sharing the same table.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Purge expired holders, then reserve a slot for `job` if capacity allows
    async fn try_reserve(&self, job: &JobId, capacity: usize, ttl_ms: u64)
        -> Result<Reservation, GateError>;

    /// Remove `job` from the table; returns whether it held a slot
    async fn remove(&self, job: &JobId) -> Result<bool, GateError>;

    /// Live (unexpired) holders
    async fn holders(&self) -> Result<Vec<SlotHolder>, GateError>;

    /// Drop every holder; returns how many were dropped
    async fn clear(&self) -> Result<usize, GateError>;
}

/// In-process slot store
#[derive(Debug, Default)]
pub struct MemorySlotStore {
    table: Mutex<SlotTable>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut SlotTable) -> R) -> Result<R, GateError> {
        let mut table = self
            .table
            .lock()
            .map_err(|e| GateError::StoreUnavailable(e.to_string()))?;
        Ok(f(&mut table))
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn try_reserve(
        &self,
        job: &JobId,
        capacity: usize,
        ttl_ms: u64,
    ) -> Result<Reservation, GateError> {
        let now = now_unix_ms();
        self.with_table(|t| t.reserve(job, capacity, ttl_ms, now))
    }

    async fn remove(&self, job: &JobId) -> Result<bool, GateError> {
        self.with_table(|t| t.remove(job))
    }

    async fn holders(&self) -> Result<Vec<SlotHolder>, GateError> {
        let now = now_unix_ms();
        self.with_table(|t| {
            t.purge_expired(now);
            t.holders.clone()
        })
    }

    async fn clear(&self) -> Result<usize, GateError> {
        self.with_table(|t| std::mem::take(&mut t.holders).len())
    }
}

/// Slot store shared between processes through a locked JSON file
#[derive(Debug, Clone)]
pub struct FileSlotStore {
    path: PathBuf,
}

impl FileSlotStore {
    /// Use the slot table at `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the slot table
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn update<R, F>(&self, f: F) -> Result<R, GateError>
    where
        R: Send + 'static,
        F: FnOnce(&mut SlotTable) -> R + Send + 'static,
    {
        let path = self.path.clone();
        let result = filesystem::blocking(move || filesystem::update_json_locked(&path, f)).await?;
        Ok(result)
    }
}

#[async_trait]
impl SlotStore for FileSlotStore {
    async fn try_reserve(
        &self,
        job: &JobId,
        capacity: usize,
        ttl_ms: u64,
    ) -> Result<Reservation, GateError> {
        let job = job.clone();
        self.update(move |t| t.reserve(&job, capacity, ttl_ms, now_unix_ms()))
            .await
    }

    async fn remove(&self, job: &JobId) -> Result<bool, GateError> {
        let job = job.clone();
        self.update(move |t| t.remove(&job)).await
    }

    async fn holders(&self) -> Result<Vec<SlotHolder>, GateError> {
        self.update(|t| {
            t.purge_expired(now_unix_ms());
            t.holders.clone()
        })
        .await
    }

    async fn clear(&self) -> Result<usize, GateError> {
        self.update(|t| std::mem::take(&mut t.holders).len()).await
    }
}
