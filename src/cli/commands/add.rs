//! CLI implementation for `reqpm add`
//!
//! Registers (or updates) one unit and its direct dependencies.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::cli::context::AppContext;
use crate::cli::output::{print_detail, print_success, print_warning};
use crate::core::resolver::recompute_levels;
use crate::core::unit::{DependencyEdge, DependencyType, PackageUnit, UnitId};
use crate::infra::filesystem;

/// Options for `reqpm add`
#[derive(Debug, Default)]
pub struct AddOptions {
    pub version: Option<String>,
    pub target: Option<String>,
    pub arch: Option<String>,
    pub depends_on: Vec<String>,
    pub spec: Option<PathBuf>,
}

/// Execute the add command
pub async fn execute(ctx: &AppContext, name: &str, options: AddOptions) -> Result<()> {
    let target = options
        .target
        .unwrap_or_else(|| ctx.settings.builder.default_target.clone());
    let arch = options
        .arch
        .unwrap_or_else(|| ctx.settings.builder.architecture.clone());
    let id = UnitId::new(name, &target);

    let mut unit = match ctx.store.get_unit(&id).await? {
        Some(existing) => existing,
        None => PackageUnit::new(name, &target).direct(name),
    };
    unit.architecture = arch.clone();
    if let Some(version) = options.version {
        unit.version = Some(version);
    }
    if let Some(spec) = &options.spec {
        let descriptor = filesystem::read_file(spec)
            .with_context(|| format!("Failed to read spec file {}", spec.display()))?;
        unit.descriptor = Some(descriptor);
    }
    unit.updated_at = chrono::Utc::now();
    ctx.store.put_unit(&unit).await?;

    let mut edges = Vec::with_capacity(options.depends_on.len());
    for dep_name in &options.depends_on {
        let dep_id = UnitId::new(dep_name, &target);
        if dep_id == id {
            print_warning(&format!("Ignoring self-dependency of {id}"));
            continue;
        }
        if ctx.store.get_unit(&dep_id).await?.is_none() {
            let dep = PackageUnit::new(dep_name, &target).with_architecture(arch.clone());
            ctx.store.put_unit(&dep).await?;
            print_detail(&format!("+ {dep_id}"));
        }
        edges.push(DependencyEdge::new(id.clone(), dep_id, DependencyType::Runtime));
    }
    if !options.depends_on.is_empty() {
        ctx.store.replace_dependencies(&id, edges).await?;
    }

    let levels = recompute_levels(ctx.store.as_ref()).await?;
    print_success(&format!(
        "Registered {id} (level {})",
        levels
            .level_of(&id)
            .map_or_else(|| "-".to_string(), |l| l.to_string())
    ));
    if unit.descriptor.is_none() {
        print_detail("No spec file yet; the build will fail until one is provided");
    }
    Ok(())
}
