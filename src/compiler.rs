use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::error::{ToolManagerError, ToolManagerErrorCode, ToolManagerResult};

/// Runs the configured dependency-sync and compile commands inside a tool directory.
#[derive(Debug, Clone)]
pub struct ToolCompiler {
    cfg: BuildConfig,
}

impl ToolCompiler {
    pub fn new(cfg: BuildConfig) -> Self {
        Self { cfg }
    }

    pub fn ensure_buildable(&self, tool_dir: &Path) -> ToolManagerResult<()> {
        if tool_dir.join(&self.cfg.entry_point).is_file() {
            return Ok(());
        }
        Err(ToolManagerError::new(
            ToolManagerErrorCode::NotBuildable,
            format!("no {} found in tool directory", self.cfg.entry_point),
        ))
    }

    /// Builds `tool_dir` in place so that `binary_name` appears next to the sources.
    /// `env` is the full environment handed to both steps, before the build-specific
    /// variables from config are layered on top.
    pub async fn build(
        &self,
        tool_id: &str,
        tool_dir: &Path,
        binary_name: &str,
        env: &[(OsString, OsString)],
    ) -> ToolManagerResult<()> {
        self.ensure_buildable(tool_dir)?;

        let manifest_present = self
            .cfg
            .dependency_manifest
            .as_deref()
            .is_some_and(|name| tool_dir.join(name).is_file());
        if manifest_present && !self.cfg.dependency_command.is_empty() {
            debug!("syncing dependencies for tool {tool_id}");
            self.run_step(&self.cfg.dependency_command, tool_dir, env)
                .await
                .map_err(|detail| build_failed(format!("dependency sync failed: {detail}")))?;
        }

        info!("compiling tool {tool_id}");
        self.run_step(&self.cfg.command, tool_dir, env)
            .await
            .map_err(|detail| build_failed(format!("compile failed: {detail}")))?;

        let binary = tool_dir.join(binary_name);
        if !binary.is_file() {
            return Err(build_failed(format!(
                "compile failed: build finished without producing {}",
                binary.display()
            )));
        }
        Ok(())
    }

    /// Returns the command's stderr (or stdout when stderr is empty) on failure.
    async fn run_step(
        &self,
        argv: &[String],
        dir: &Path,
        env: &[(OsString, OsString)],
    ) -> Result<(), String> {
        let Some((program, args)) = argv.split_first() else {
            return Err("empty command".to_owned());
        };
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(dir)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k, v)))
            .envs(&self.cfg.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let timeout = self.cfg.timeout();
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(format!("failed to run `{program}`: {err}")),
            Err(_) => {
                return Err(format!(
                    "`{program}` timed out after {}s",
                    timeout.as_secs()
                ))
            }
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.trim().is_empty() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.trim().is_empty() {
                return Err(format!("`{program}` exited with {}", output.status));
            }
            return Err(stdout.into_owned());
        }
        Err(stderr.into_owned())
    }
}

fn build_failed(message: String) -> ToolManagerError {
    ToolManagerError::new(ToolManagerErrorCode::BuildFailed, message)
}
