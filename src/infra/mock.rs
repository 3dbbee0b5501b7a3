//! `rpmbuild` + `mock` implementation of [`ExternalBuilder`]
//!
//! The source package is built directly with `rpmbuild -bs`; binary packages
//! come from `mock --rebuild`. Every mock run passes `--uniqueext` with the
//! execution id, so concurrent builds of one target get their own build
//! chroot while reusing the shared bootstrap chroot (`--no-clean`).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::core::settings::BuilderSettings;
use crate::error::BuilderError;
use crate::infra::builder::{copy_tree, files_with_suffix, BuildContext, BuildResult, ExternalBuilder};
use crate::infra::filesystem;

/// Captured output of a finished command
struct CommandOutput {
    success: bool,
    code: Option<i32>,
    log: String,
}

/// Builder driving `rpmbuild` and `mock`
#[derive(Debug, Clone)]
pub struct MockBuilder {
    settings: BuilderSettings,
}

impl MockBuilder {
    pub fn new(settings: BuilderSettings) -> Self {
        Self { settings }
    }

    /// Targets with a chroot configuration, sorted
    pub fn available_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = files_with_suffix(&self.settings.mock_config_dir, ".cfg")
            .iter()
            .filter_map(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        targets.sort();
        targets
    }

    /// Arguments of the final `mock --rebuild` invocation
    fn rebuild_args(
        &self,
        intermediate: &Path,
        target: &str,
        out_dir: &Path,
        ctx: &BuildContext,
    ) -> Vec<String> {
        vec![
            "-r".to_string(),
            target.to_string(),
            "--arch".to_string(),
            ctx.architecture.clone(),
            "--uniqueext".to_string(),
            ctx.execution_id.clone(),
            "--enable-network".to_string(),
            "--resultdir".to_string(),
            out_dir.display().to_string(),
            "--no-clean".to_string(),
            "--no-cleanup-after".to_string(),
            "--rpmbuild-opts=--nocheck".to_string(),
            "--rebuild".to_string(),
            intermediate.display().to_string(),
        ]
    }

    /// Program and leading arguments for mock, with `sudo -n` when configured
    fn mock_command(&self) -> (String, Vec<String>) {
        if self.settings.use_sudo {
            ("sudo".to_string(), vec!["-n".to_string(), self.settings.mock_bin.clone()])
        } else {
            (self.settings.mock_bin.clone(), Vec::new())
        }
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, BuilderError> {
        let command_line = format!("{program} {}", args.join(" "));
        tracing::debug!("Running: {command_line}");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuilderError::Spawn {
                command: command_line.clone(),
                error: e.to_string(),
            })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| BuilderError::Timeout {
                command: command_line.clone(),
                secs: timeout.as_secs(),
            })?
            .map_err(|e| BuilderError::Spawn {
                command: command_line,
                error: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            log: format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
        })
    }
}

/// Append mock's own logs from the result directory, if present
fn with_result_logs(mut log: String, out_dir: &Path) -> String {
    for name in ["build.log", "root.log"] {
        let path = out_dir.join(name);
        if let Ok(content) = filesystem::read_file(&path) {
            log.push_str(&format!("\n=== {name} ({} bytes) ===\n{content}\n", content.len()));
        }
    }
    log
}

fn exit_code(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

#[async_trait]
impl ExternalBuilder for MockBuilder {
    async fn is_available(&self) -> bool {
        if which::which(&self.settings.mock_bin).is_err()
            || which::which(&self.settings.rpmbuild_bin).is_err()
        {
            return false;
        }
        let version = self
            .run(
                &self.settings.mock_bin,
                &["--version".to_string()],
                Duration::from_secs(10),
            )
            .await;
        matches!(version, Ok(out) if out.success)
    }

    async fn valid_target(&self, target: &str) -> bool {
        !target.is_empty()
            && !target.contains('/')
            && self
                .settings
                .mock_config_dir
                .join(format!("{target}.cfg"))
                .is_file()
    }

    async fn stage_sources(
        &self,
        descriptor: &Path,
        sources_dir: &Path,
        work_dir: &Path,
    ) -> Result<BuildResult, BuilderError> {
        let started = Instant::now();
        let staged_sources = work_dir.join("SOURCES");
        let copied = copy_tree(sources_dir, &staged_sources)?;

        let log = format!(
            "Staged {copied} source file(s) from {} for {}",
            sources_dir.display(),
            descriptor.display()
        );
        if copied == 0 {
            return Ok(BuildResult::failed(
                format!("No source files in {}", sources_dir.display()),
                log,
            )
            .with_duration(started.elapsed()));
        }
        Ok(BuildResult::ok(vec![staged_sources], log).with_duration(started.elapsed()))
    }

    async fn build_intermediate(
        &self,
        descriptor: &Path,
        sources_dir: &Path,
        out_dir: &Path,
        _ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError> {
        let started = Instant::now();
        filesystem::create_dir_all(out_dir).map_err(|e| BuilderError::Io {
            path: out_dir.to_path_buf(),
            error: e.to_string(),
        })?;

        let args = vec![
            "-bs".to_string(),
            "--define".to_string(),
            format!("_topdir {}", out_dir.display()),
            "--define".to_string(),
            format!("_sourcedir {}", sources_dir.display()),
            "--define".to_string(),
            format!("_srcrpmdir {}", out_dir.display()),
            descriptor.display().to_string(),
        ];
        tracing::info!("Building source package from {}", descriptor.display());

        let output = self
            .run(
                &self.settings.rpmbuild_bin,
                &args,
                Duration::from_secs(self.settings.intermediate_timeout_secs),
            )
            .await?;

        let result = if !output.success {
            BuildResult::failed(
                format!("rpmbuild failed with code {}", exit_code(output.code)),
                output.log,
            )
        } else {
            match files_with_suffix(out_dir, ".src.rpm").into_iter().next() {
                Some(srpm) => BuildResult::ok(vec![srpm], output.log),
                None => BuildResult::failed("SRPM file not found after build", output.log),
            }
        };
        Ok(result.with_duration(started.elapsed()))
    }

    async fn build_final(
        &self,
        intermediate: &Path,
        target: &str,
        out_dir: &Path,
        ctx: &BuildContext,
    ) -> Result<BuildResult, BuilderError> {
        let started = Instant::now();
        filesystem::create_dir_all(out_dir).map_err(|e| BuilderError::Io {
            path: out_dir.to_path_buf(),
            error: e.to_string(),
        })?;

        let (program, mut args) = self.mock_command();
        args.extend(self.rebuild_args(intermediate, target, out_dir, ctx));
        tracing::info!(
            "Building binary packages with mock: {target} {} (uniqueext={})",
            ctx.architecture,
            ctx.execution_id
        );

        let output = self
            .run(
                &program,
                &args,
                Duration::from_secs(self.settings.final_timeout_secs),
            )
            .await?;
        let log = with_result_logs(output.log, out_dir);

        let result = if output.success {
            let rpms: Vec<PathBuf> = files_with_suffix(out_dir, ".rpm")
                .into_iter()
                .filter(|p| !p.to_string_lossy().ends_with(".src.rpm"))
                .collect();
            if rpms.is_empty() {
                BuildResult::failed("No binary packages found after build", log)
            } else {
                BuildResult::ok(rpms, log)
            }
        } else {
            BuildResult::failed(
                format!("Mock build failed with code {}", exit_code(output.code)),
                log,
            )
        };
        Ok(result.with_duration(started.elapsed()))
    }
}
