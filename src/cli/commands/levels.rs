//! CLI implementation for `reqpm levels`

use anyhow::Result;
use serde_json::json;

use crate::cli::context::AppContext;
use crate::cli::output::{json_enabled, print_warning};
use crate::core::resolver::recompute_levels;
use crate::core::unit::UnitId;

/// Execute the levels command
pub async fn execute(ctx: &AppContext) -> Result<()> {
    let levels = recompute_levels(ctx.store.as_ref()).await?;

    if json_enabled() {
        let doc = json!({
            "levels": levels.levels,
            "cyclic": levels.cyclic,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if levels.levels.is_empty() {
        println!("No units registered");
        return Ok(());
    }
    for (index, level) in levels.levels.iter().enumerate() {
        let names: Vec<&str> = level.iter().map(UnitId::as_str).collect();
        println!("Level {index}: {}", names.join(" "));
    }
    if levels.has_cycle() {
        let names: Vec<&str> = levels.cyclic.iter().map(UnitId::as_str).collect();
        print_warning(&format!(
            "Dependency cycle among: {} (placed in the last level)",
            names.join(", ")
        ));
    }
    Ok(())
}
