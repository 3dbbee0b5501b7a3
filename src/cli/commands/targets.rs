//! CLI implementation for `reqpm targets`
//!
//! Reports whether the build tools are usable and which targets have a
//! chroot configuration.

use anyhow::Result;

use crate::cli::context::AppContext;
use crate::cli::output::{json_enabled, print_detail, print_info, print_success, print_warning};
use crate::infra::builder::ExternalBuilder;
use crate::infra::mock::MockBuilder;

/// Execute the targets command
pub async fn execute(ctx: &AppContext) -> Result<()> {
    let builder = MockBuilder::new(ctx.settings.builder.clone());
    let available = builder.is_available().await;
    let targets = builder.available_targets();

    if json_enabled() {
        let doc = serde_json::json!({
            "available": available,
            "config_dir": ctx.settings.builder.mock_config_dir,
            "targets": targets,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if available {
        print_success(&format!(
            "{} and {} are installed",
            ctx.settings.builder.mock_bin, ctx.settings.builder.rpmbuild_bin
        ));
    } else {
        print_warning(&format!(
            "{} or {} is missing; builds will fail until both are installed",
            ctx.settings.builder.mock_bin, ctx.settings.builder.rpmbuild_bin
        ));
    }

    if targets.is_empty() {
        print_warning(&format!(
            "No chroot configurations in {}",
            ctx.settings.builder.mock_config_dir.display()
        ));
        return Ok(());
    }
    print_info(&format!("{} build target(s):", targets.len()));
    for target in &targets {
        print_detail(target);
    }
    Ok(())
}
