//! CLI implementation of the unit commands: `cancel`, `not-required`,
//! `status` and `show`

use std::sync::Arc;

use anyhow::Result;

use crate::cli::context::AppContext;
use crate::cli::output::{json_enabled, print_detail, print_info, print_success, print_warning};
use crate::core::classifier::format_text;
use crate::core::scheduler::{CancelOutcome, Scheduler};
use crate::core::unit::{BuildStatus, PackageUnit};
use crate::infra::runner::HandoffDispatcher;

fn scheduler(ctx: &AppContext) -> Scheduler {
    ctx.scheduler(Arc::new(HandoffDispatcher))
}

/// Execute the cancel command
pub async fn execute_cancel(ctx: &AppContext, unit: &str) -> Result<()> {
    let id = ctx.unit_id(unit);
    match scheduler(ctx).cancel(&id).await? {
        CancelOutcome::Cancelled => print_success(&format!("Cancelled {id}")),
        CancelOutcome::Deferred => print_warning(&format!(
            "{id} is already building; it will finish but will not be retried"
        )),
        CancelOutcome::NotCancellable(status) => {
            anyhow::bail!("Cannot cancel {id}: it is {status}")
        }
    }
    Ok(())
}

/// Execute the not-required command
pub async fn execute_not_required(ctx: &AppContext, unit: &str) -> Result<()> {
    let id = ctx.unit_id(unit);
    let woken = scheduler(ctx).mark_not_required(&id).await?;
    print_success(&format!("Marked {id} as not required"));
    for dependent in woken {
        print_detail(&format!("{dependent} is now ready to build"));
    }
    Ok(())
}

/// Execute the status command
pub async fn execute_status(ctx: &AppContext) -> Result<()> {
    let snapshot = scheduler(ctx).status().await?;
    let mut units = ctx.store.list_units().await?;
    units.sort_by(|a, b| {
        (a.build_order.unwrap_or(u32::MAX), &a.id).cmp(&(b.build_order.unwrap_or(u32::MAX), &b.id))
    });

    if json_enabled() {
        let doc = serde_json::json!({
            "summary": snapshot,
            "units": units.iter().map(unit_row).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!(
        "Build slots: {}/{} in use",
        snapshot.active_slots, snapshot.capacity
    );
    for job in &snapshot.slot_holders {
        println!("  {job}");
    }
    println!();

    if units.is_empty() {
        println!("No units registered");
        return Ok(());
    }
    println!("{:<40} {:<18} {:>5}", "UNIT", "STATUS", "LEVEL");
    for unit in &units {
        println!(
            "{:<40} {:<18} {:>5}",
            unit.id.as_str(),
            unit.status.as_str(),
            unit.build_order
                .map_or_else(|| "-".to_string(), |l| l.to_string())
        );
    }
    println!();

    let counts: Vec<String> = snapshot
        .counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(status, count)| format!("{status}: {count}"))
        .collect();
    println!("{} unit(s) ({})", snapshot.total, counts.join(", "));
    Ok(())
}

fn unit_row(unit: &PackageUnit) -> serde_json::Value {
    serde_json::json!({
        "id": unit.id,
        "status": unit.status,
        "build_order": unit.build_order,
        "error_message": unit.error_message,
        "retry_count": unit.retry_count,
    })
}

/// Execute the show command
pub async fn execute_show(ctx: &AppContext, unit: &str, with_log: bool) -> Result<()> {
    let id = ctx.unit_id(unit);
    let unit = ctx.store.require_unit(&id).await?;

    if json_enabled() {
        println!("{}", serde_json::to_string_pretty(&unit)?);
        return Ok(());
    }

    println!("{}", unit.id);
    println!("  Status:       {}", unit.status);
    if let Some(version) = &unit.version {
        println!("  Version:      {version}");
    }
    println!("  Target:       {} ({})", unit.target, unit.architecture);
    if let Some(order) = unit.build_order {
        println!("  Build level:  {order}");
    }
    if let Some(requirement) = &unit.requirement {
        println!("  Requirement:  {requirement}");
    }
    println!(
        "  Spec file:    {}",
        if unit.descriptor.is_some() { "present" } else { "missing" }
    );
    let deps = ctx.store.dependencies_of(&id).await?;
    if !deps.is_empty() {
        let names: Vec<&str> = deps.iter().map(|e| e.depends_on.as_str()).collect();
        println!("  Depends on:   {}", names.join(", "));
    }
    if let Some(started) = unit.started_at {
        println!("  Started:      {started}");
    }
    if let Some(completed) = unit.completed_at {
        println!("  Finished:     {completed}");
    }
    if unit.retry_count > 0 {
        println!("  Retries:      {}", unit.retry_count);
    }
    if unit.cancel_requested {
        println!("  Cancel requested");
    }

    if !unit.error_message.is_empty() {
        println!();
        print_warning(&unit.error_message);
    }
    if !unit.classified_errors.is_empty() {
        println!();
        println!("{}", format_text(&unit.classified_errors));
    }
    if unit.status == BuildStatus::Completed {
        println!();
        if let Some(srpm) = &unit.intermediate_artifact {
            print_info(&format!("Source package: {}", srpm.display()));
        }
        for rpm in &unit.final_artifacts {
            print_detail(&rpm.display().to_string());
        }
    }
    if with_log && !unit.build_log.is_empty() {
        println!();
        println!("{}", unit.build_log);
    }
    Ok(())
}
