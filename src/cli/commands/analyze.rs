//! CLI implementation for `reqpm analyze`

use std::path::Path;

use anyhow::{Context, Result};

use crate::cli::output::json_enabled;
use crate::core::classifier::{format_json, format_text, ErrorClassifier};
use crate::infra::filesystem;

/// Execute the analyze command
pub fn execute(log: &Path) -> Result<()> {
    let text = filesystem::read_file(log)
        .with_context(|| format!("Failed to read log file {}", log.display()))?;
    let findings = ErrorClassifier::new().analyze(&text);

    if json_enabled() {
        println!("{}", format_json(&findings)?);
    } else {
        println!("{}", format_text(&findings));
    }
    Ok(())
}
