//! CLI implementation for `reqpm worker` and `reqpm recover`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::cli::context::AppContext;
use crate::cli::output::{print_detail, print_info, print_success};
use crate::core::resolver::DependencyResolver;
use crate::infra::manifest::ManifestProvider;
use crate::infra::runner::{HandoffDispatcher, LocalTaskRunner, WorkerPool};

/// Execute the worker command
pub async fn execute(ctx: &AppContext, jobs: Option<usize>) -> Result<()> {
    let (runner, queue) = LocalTaskRunner::new();
    let runner = Arc::new(runner);
    let scheduler = Arc::new(ctx.scheduler(runner.clone()));
    let pipeline = Arc::new(ctx.pipeline());

    let recovery = scheduler
        .recover_on_startup()
        .await
        .context("Startup recovery failed")?;
    if !recovery.reset.is_empty() {
        print_info(&format!(
            "Reset {} unit(s) left in flight by a previous worker",
            recovery.reset.len()
        ));
    }

    let mut monitor = ctx.monitor(runner);
    if let Some(path) = &ctx.settings.paths.manifest {
        let provider = ManifestProvider::load(path)?;
        let resolver = DependencyResolver::new(Arc::clone(&ctx.store), Arc::new(provider));
        monitor = monitor.with_resolver(Arc::new(resolver), ctx.settings.scheduler.prepare_limit);
    }

    let concurrency = jobs.unwrap_or_else(|| ctx.settings.worker_concurrency());
    let pool = WorkerPool::new(pipeline, scheduler, concurrency);
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            shutdown.cancel();
        }
    });

    print_success(&format!(
        "Worker running ({concurrency} job(s), {} build slot(s)); press Ctrl-C to stop",
        ctx.gate.capacity()
    ));
    let interval = Duration::from_secs(ctx.settings.scheduler.monitor_interval_secs);
    tokio::join!(
        pool.run(queue, cancel.clone()),
        monitor.run(interval, cancel.clone())
    );
    print_info("Worker stopped");
    Ok(())
}

/// Execute the recover command
pub async fn execute_recover(ctx: &AppContext) -> Result<()> {
    let scheduler = ctx.scheduler(Arc::new(HandoffDispatcher));
    let report = scheduler.recover_on_startup().await?;

    print_success(&format!(
        "Reset {} unit(s), cleared {} build slot(s)",
        report.reset.len(),
        report.slots_cleared
    ));
    for id in &report.reset {
        print_detail(&id.to_string());
    }
    Ok(())
}
