//! CLI implementation for `reqpm import`

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::context::AppContext;
use crate::cli::output::{create_spinner, print_detail, print_info, print_success, print_warning};
use crate::core::requirements::RequirementParser;
use crate::core::resolver::{recompute_levels, BuildLevels, DependencyResolver};
use crate::core::unit::{PackageUnit, UnitId};
use crate::infra::filesystem;
use crate::infra::manifest::ManifestProvider;

/// Execute the import command
pub async fn execute(
    ctx: &AppContext,
    requirements: &Path,
    target: Option<String>,
    manifest: Option<&Path>,
) -> Result<()> {
    let target = target.unwrap_or_else(|| ctx.settings.builder.default_target.clone());
    let text = filesystem::read_file(requirements)
        .with_context(|| format!("Failed to read {}", requirements.display()))?;
    let parsed = RequirementParser::new().parse(&text);
    if parsed.is_empty() {
        print_warning(&format!("No requirements found in {}", requirements.display()));
        return Ok(());
    }

    let mut roots = Vec::with_capacity(parsed.len());
    for requirement in &parsed {
        let id = UnitId::new(&requirement.name, &target);
        let mut unit = match ctx.store.get_unit(&id).await? {
            Some(existing) => existing,
            None => PackageUnit::new(&requirement.name, &target)
                .with_architecture(ctx.settings.builder.architecture.clone()),
        };
        unit.is_direct = true;
        unit.requirement = Some(requirement.line.clone());
        if let Some(version) = requirement.pinned_version() {
            unit.version = Some(version.to_string());
        }
        unit.updated_at = chrono::Utc::now();
        ctx.store.put_unit(&unit).await?;
        roots.push(id);
    }
    print_success(&format!(
        "Imported {} requirement(s) for {target}",
        roots.len()
    ));

    let levels = match manifest {
        Some(path) => {
            let provider = ManifestProvider::load(path)?;
            let resolver = DependencyResolver::new(Arc::clone(&ctx.store), Arc::new(provider));
            let spinner = create_spinner("Resolving dependencies...");
            let report = resolver.resolve(&roots).await;
            spinner.finish_and_clear();
            let report = report?;

            for id in &report.new_units {
                print_detail(&format!("+ {id} (dependency)"));
            }
            for (id, error) in &report.failures {
                print_warning(&format!("{id}: {error}"));
            }
            report.levels
        }
        None => recompute_levels(ctx.store.as_ref()).await?,
    };

    print_levels_summary(&levels);
    Ok(())
}

fn print_levels_summary(levels: &BuildLevels) {
    print_info(&format!(
        "{} unit(s) in {} build level(s)",
        levels.unit_count(),
        levels.levels.len()
    ));
    if levels.has_cycle() {
        let names: Vec<&str> = levels.cyclic.iter().map(UnitId::as_str).collect();
        print_warning(&format!(
            "Dependency cycle; built together in the last level: {}",
            names.join(", ")
        ));
    }
}
