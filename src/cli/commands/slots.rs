//! CLI implementation of the slot commands: `slots`, `release` and
//! `clear-slots`

use std::io::{self, BufRead, Write};

use anyhow::Result;
use chrono::{TimeZone, Utc};

use crate::cli::context::AppContext;
use crate::cli::output::{json_enabled, print_info, print_success, print_warning};
use crate::config::defaults;
use crate::core::unit::JobId;

/// Execute the slots command
pub async fn execute_list(ctx: &AppContext) -> Result<()> {
    let holders = ctx.gate.holders().await?;

    if json_enabled() {
        let doc = serde_json::json!({
            "capacity": ctx.gate.capacity(),
            "holders": holders,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{}/{} build slot(s) in use", holders.len(), ctx.gate.capacity());
    for holder in &holders {
        let expires = i64::try_from(holder.deadline_ms)
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map_or_else(|| "?".to_string(), |t| t.to_rfc3339());
        println!("  {}  (expires {expires})", holder.job_id);
    }
    Ok(())
}

/// Job id from a raw job id or a unit name
fn job_id(ctx: &AppContext, job: &str) -> JobId {
    if job.starts_with(defaults::JOB_PREFIX) {
        JobId::new(job)
    } else {
        ctx.unit_id(job).job_id()
    }
}

/// Execute the release command
pub async fn execute_release(ctx: &AppContext, job: &str) -> Result<()> {
    let job = job_id(ctx, job);
    if ctx.gate.force_release(&job).await? {
        print_success(&format!("Released build slot of {job}"));
    } else {
        print_info(&format!("{job} held no build slot"));
    }
    Ok(())
}

/// Execute the clear-slots command
pub async fn execute_clear(ctx: &AppContext, yes: bool) -> Result<()> {
    if !yes && !confirm("Drop every build slot? Running builds lose their reservation")? {
        print_info("Aborted");
        return Ok(());
    }
    let dropped = ctx.gate.clear_all().await?;
    if dropped > 0 {
        print_warning(&format!("Dropped {dropped} build slot(s)"));
    }
    print_success("Build slot pool cleared");
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
