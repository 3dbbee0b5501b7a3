//! Task dispatch and the local worker pool
//!
//! The scheduler hands units to a [`Dispatcher`]; the monitor asks it which
//! jobs are queued or running. [`LocalTaskRunner`] is the in-process
//! implementation: an unbounded queue drained by a [`WorkerPool`] that runs
//! at most `concurrency` pipelines at once. [`HandoffDispatcher`] queues
//! nothing and leaves the work to another process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::pipeline::BuildPipeline;
use crate::core::scheduler::Scheduler;
use crate::core::unit::{JobId, UnitId};
use crate::error::{ReqpmError, Result};

/// Queue of build jobs with introspection
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Queue a build of `unit`. Returns `false` when its job is already
    /// queued or running, in which case nothing is queued.
    async fn dispatch(&self, unit: &UnitId) -> Result<bool>;

    /// Queue a build of `unit` after `delay`
    async fn dispatch_after(&self, unit: &UnitId, delay: Duration) -> Result<()>;

    /// Job ids currently queued or running
    async fn active_jobs(&self) -> Result<HashSet<JobId>>;
}

type Registry = Arc<Mutex<HashSet<JobId>>>;

fn lock(registry: &Registry) -> Result<std::sync::MutexGuard<'_, HashSet<JobId>>> {
    registry.lock().map_err(|_| ReqpmError::RunnerClosed)
}

/// In-process dispatcher
#[derive(Debug, Clone)]
pub struct LocalTaskRunner {
    sender: mpsc::UnboundedSender<UnitId>,
    registry: Registry,
    delayed: Arc<AtomicUsize>,
}

/// Receiving end of a [`LocalTaskRunner`], consumed by a [`WorkerPool`]
#[derive(Debug)]
pub struct WorkQueue {
    receiver: mpsc::UnboundedReceiver<UnitId>,
    registry: Registry,
    delayed: Arc<AtomicUsize>,
}

impl WorkQueue {
    /// Nothing queued and no delayed dispatch outstanding
    fn is_idle(&self) -> bool {
        self.receiver.is_empty() && self.delayed.load(Ordering::SeqCst) == 0
    }
}

impl LocalTaskRunner {
    /// Create a runner and the queue its workers drain
    pub fn new() -> (Self, WorkQueue) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let registry = Registry::default();
        let delayed = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sender,
                registry: Arc::clone(&registry),
                delayed: Arc::clone(&delayed),
            },
            WorkQueue {
                receiver,
                registry,
                delayed,
            },
        )
    }
}

#[async_trait]
impl Dispatcher for LocalTaskRunner {
    async fn dispatch(&self, unit: &UnitId) -> Result<bool> {
        let job = unit.job_id();
        {
            let mut registry = lock(&self.registry)?;
            if !registry.insert(job.clone()) {
                tracing::debug!("Job {job} already queued or running");
                return Ok(false);
            }
        }

        if self.sender.send(unit.clone()).is_err() {
            lock(&self.registry)?.remove(&job);
            return Err(ReqpmError::RunnerClosed);
        }
        tracing::debug!("Queued {job}");
        Ok(true)
    }

    async fn dispatch_after(&self, unit: &UnitId, delay: Duration) -> Result<()> {
        let runner = self.clone();
        let unit = unit.clone();
        self.delayed.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = runner.dispatch(&unit).await {
                tracing::warn!("Delayed dispatch of {unit} dropped: {e}");
            }
            runner.delayed.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn active_jobs(&self) -> Result<HashSet<JobId>> {
        Ok(lock(&self.registry)?.clone())
    }
}

/// Dispatcher for a process that runs no workers.
///
/// Units are left `Pending`; the reconciliation monitor of a running worker
/// process finds them and dispatches them to its own pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct HandoffDispatcher;

#[async_trait]
impl Dispatcher for HandoffDispatcher {
    async fn dispatch(&self, unit: &UnitId) -> Result<bool> {
        tracing::debug!("Handing {unit} off to the worker pool");
        Ok(true)
    }

    async fn dispatch_after(&self, unit: &UnitId, delay: Duration) -> Result<()> {
        tracing::debug!("Handing {unit} off to the worker pool (retry after {delay:?})");
        Ok(())
    }

    async fn active_jobs(&self) -> Result<HashSet<JobId>> {
        Ok(HashSet::new())
    }
}

/// Drains a [`WorkQueue`] through the pipeline
pub struct WorkerPool {
    pipeline: Arc<BuildPipeline>,
    scheduler: Arc<Scheduler>,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<BuildPipeline>, scheduler: Arc<Scheduler>, concurrency: usize) -> Self {
        Self {
            pipeline,
            scheduler,
            concurrency: concurrency.max(1),
        }
    }

    /// Run queued jobs until `cancel` fires or every sender is gone, then
    /// wait for the running ones to finish
    pub async fn run(&self, queue: WorkQueue, cancel: CancellationToken) {
        self.work(queue, cancel, false).await;
    }

    /// Run queued jobs, and the jobs they lead to, until nothing is left
    pub async fn drain(&self, queue: WorkQueue, cancel: CancellationToken) {
        self.work(queue, cancel, true).await;
    }

    async fn work(&self, mut queue: WorkQueue, cancel: CancellationToken, until_idle: bool) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();
        tracing::info!("Worker pool started ({} worker(s))", self.concurrency);

        loop {
            if until_idle && running.is_empty() && queue.is_idle() {
                break;
            }

            let unit = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(done) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = done {
                        tracing::error!("Worker task panicked: {e}");
                    }
                    continue;
                }
                next = queue.receiver.recv() => match next {
                    Some(unit) => unit,
                    None => break,
                },
            };

            let permits = Arc::clone(&permits);
            let pipeline = Arc::clone(&self.pipeline);
            let scheduler = Arc::clone(&self.scheduler);
            let registry = Arc::clone(&queue.registry);
            running.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let result = pipeline.run(&unit).await;

                if let Ok(mut registry) = registry.lock() {
                    registry.remove(&unit.job_id());
                }

                match result {
                    Ok(outcome) => {
                        if let Err(e) = scheduler.handle_outcome(&unit, outcome).await {
                            tracing::error!("Failed to process outcome of {unit}: {e}");
                        }
                    }
                    Err(e) if e.is_infrastructure() => {
                        tracing::warn!("Build of {unit} interrupted: {e}");
                        if let Err(e) = scheduler.handle_interrupted(&unit, &e).await {
                            tracing::warn!(
                                "Could not requeue {unit}, leaving it to the monitor: {e}"
                            );
                        }
                    }
                    Err(e) => tracing::error!("Build of {unit} aborted: {e}"),
                }
            });
        }

        tracing::info!("Worker pool stopping, waiting for {} running build(s)", running.len());
        while let Some(done) = running.join_next().await {
            if let Err(e) = done {
                tracing::error!("Worker task panicked: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_dispatch_is_noop() {
        let (runner, mut queue) = LocalTaskRunner::new();
        let unit = UnitId::from("six@rhel-9");

        assert!(runner.dispatch(&unit).await.unwrap());
        assert!(!runner.dispatch(&unit).await.unwrap());

        assert_eq!(queue.receiver.recv().await, Some(unit.clone()));
        assert!(queue.receiver.try_recv().is_err());
        assert!(runner.active_jobs().await.unwrap().contains(&unit.job_id()));
    }

    #[tokio::test]
    async fn test_dispatch_after_closed_queue_fails() {
        let (runner, queue) = LocalTaskRunner::new();
        drop(queue);

        let result = runner.dispatch(&UnitId::from("six@rhel-9")).await;
        assert!(matches!(result, Err(ReqpmError::RunnerClosed)));
        assert!(runner.active_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delayed_dispatch() {
        let (runner, mut queue) = LocalTaskRunner::new();
        let unit = UnitId::from("six@rhel-9");

        runner
            .dispatch_after(&unit, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(queue.receiver.try_recv().is_err());

        let received = tokio::time::timeout(Duration::from_secs(2), queue.receiver.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(unit));
    }
}
