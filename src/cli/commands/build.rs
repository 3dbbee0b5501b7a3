//! CLI implementation for `reqpm build` and `reqpm retry`
//!
//! Without `--detach` the requested builds, and every dependent they make
//! ready, run in this process until nothing is left to do. With `--detach`
//! the units are only marked `Pending` for a running `reqpm worker`.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::cli::context::AppContext;
use crate::cli::output::{create_spinner, print_detail, print_info, print_success, print_warning};
use crate::core::classifier::summary;
use crate::core::scheduler::{BuildRequestOutcome, Scheduler};
use crate::core::unit::{BuildStatus, UnitId};
use crate::infra::runner::{HandoffDispatcher, LocalTaskRunner, WorkerPool};

/// What to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Build once dependencies are built
    Build(Vec<String>),
    /// Build without checking dependencies
    Rebuild(Vec<String>),
    /// Retry a failed or cancelled unit
    Retry(String),
    /// Every unit not built, failed or cancelled
    All,
}

/// Execute the build command
pub async fn execute(ctx: &AppContext, request: Request, detach: bool) -> Result<()> {
    if let Request::Build(units) | Request::Rebuild(units) = &request {
        if units.is_empty() {
            anyhow::bail!("No units given; name some units or pass --all");
        }
    }

    if detach {
        let scheduler = ctx.scheduler(Arc::new(HandoffDispatcher));
        let requested = submit(ctx, &scheduler, &request).await?;
        if requested.iter().any(|(_, o)| *o == BuildRequestOutcome::Dispatched) {
            print_info("Queued; a running `reqpm worker` will pick the builds up");
        }
        return Ok(());
    }

    let (runner, queue) = LocalTaskRunner::new();
    let scheduler = Arc::new(ctx.scheduler(Arc::new(runner)));
    let pipeline = Arc::new(ctx.pipeline());
    let requested = submit(ctx, &scheduler, &request).await?;
    if requested.is_empty() {
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let pool = WorkerPool::new(pipeline, Arc::clone(&scheduler), ctx.settings.worker_concurrency());
    let spinner = create_spinner("Building...");
    pool.drain(queue, cancel.clone()).await;
    spinner.finish_and_clear();

    if cancel.is_cancelled() {
        print_warning("Interrupted; unfinished units stay pending until a worker picks them up");
    }
    report(ctx, &requested).await
}

/// Turn the request into scheduler calls, printing each outcome
async fn submit(
    ctx: &AppContext,
    scheduler: &Scheduler,
    request: &Request,
) -> Result<Vec<(UnitId, BuildRequestOutcome)>> {
    let outcomes = match request {
        Request::All => scheduler.request_all().await?,
        Request::Build(units) => {
            let mut outcomes = Vec::with_capacity(units.len());
            for unit in units {
                let id = ctx.unit_id(unit);
                let outcome = scheduler.request_build(&id).await?;
                outcomes.push((id, outcome));
            }
            outcomes
        }
        Request::Rebuild(units) => {
            let mut outcomes = Vec::with_capacity(units.len());
            for unit in units {
                let id = ctx.unit_id(unit);
                let outcome = scheduler.rebuild(&id).await?;
                outcomes.push((id, outcome));
            }
            outcomes
        }
        Request::Retry(unit) => {
            let id = ctx.unit_id(unit);
            let outcome = scheduler.retry(&id).await?;
            vec![(id, outcome)]
        }
    };

    if outcomes.is_empty() {
        print_info("Nothing to build");
    }
    for (id, outcome) in &outcomes {
        match outcome {
            BuildRequestOutcome::Rejected { .. } => print_warning(&format!("{id}: {outcome}")),
            _ => print_detail(&format!("{id}: {outcome}")),
        }
    }
    Ok(outcomes)
}

/// Final status of every requested unit; fails when any of them failed
async fn report(ctx: &AppContext, requested: &[(UnitId, BuildRequestOutcome)]) -> Result<()> {
    let mut failed = 0;
    for (id, _) in requested {
        let unit = ctx.store.require_unit(id).await?;
        match unit.status {
            BuildStatus::Completed => print_success(&format!(
                "{id}: {} package(s)",
                unit.final_artifacts.len()
            )),
            BuildStatus::Failed => {
                failed += 1;
                print_warning(&format!("{id}: {}", unit.error_message));
                print_detail(&summary(&unit.classified_errors));
            }
            status => print_detail(&format!("{id}: {status}")),
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} build(s) failed; run `reqpm show <unit>` for details");
    }
    Ok(())
}
