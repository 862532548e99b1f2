use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to shut down on its own.
    Interrupt,
    /// Terminate unconditionally.
    Kill,
}

/// How an OS process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub detail: String,
}

impl ExitOutcome {
    pub fn new(code: Option<i32>, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

pub struct LaunchSpec<'a> {
    pub tool_id: &'a str,
    pub program: PathBuf,
    pub working_dir: PathBuf,
    /// Complete environment of the child; nothing is inherited beyond this list.
    pub env: Vec<(OsString, OsString)>,
    /// Receives both stdout and stderr when present.
    pub log: Option<&'a File>,
}

pub struct SpawnedProcess {
    pub pid: u32,
    /// Resolves once the process has exited for any reason.
    pub exit: BoxFuture<'static, ExitOutcome>,
}

/// Spawn/signal/wait primitives the supervisor drives processes through.
pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, spec: LaunchSpec<'_>) -> io::Result<SpawnedProcess>;
    fn signal(&self, pid: u32, signal: ProcessSignal) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessLauncher;

impl ProcessLauncher for OsProcessLauncher {
    fn spawn(&self, spec: LaunchSpec<'_>) -> io::Result<SpawnedProcess> {
        let mut command = Command::new(&spec.program);
        command
            .current_dir(&spec.working_dir)
            .env_clear()
            .envs(spec.env)
            .stdin(Stdio::null());
        match spec.log {
            Some(log) => {
                command
                    .stdout(Stdio::from(log.try_clone()?))
                    .stderr(Stdio::from(log.try_clone()?));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = command.spawn()?;
        let Some(pid) = child.id() else {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited before its pid could be read", spec.tool_id),
            ));
        };
        let exit = async move {
            match child.wait().await {
                Ok(status) => ExitOutcome::new(status.code(), status.to_string()),
                Err(err) => ExitOutcome::new(None, format!("wait failed: {err}")),
            }
        }
        .boxed();
        Ok(SpawnedProcess { pid, exit })
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: ProcessSignal) -> io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        let signo = match signal {
            ProcessSignal::Interrupt => libc::SIGINT,
            ProcessSignal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(pid, signo) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, pid: u32, signal: ProcessSignal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot deliver {signal:?} to pid {pid} on this platform"),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::temp_dir;

    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("tool");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = std::fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    #[tokio::test]
    async fn spawn_passes_only_given_env_and_writes_log() {
        let dir = temp_dir("env");
        let program = script(&dir, "echo \"port=$PORT secret=${GITHUB_TOKEN:-none}\"");
        let log_path = dir.join("tool.log");
        let log = File::create(&log_path).expect("log");

        let spawned = OsProcessLauncher
            .spawn(LaunchSpec {
                tool_id: "echo",
                program,
                working_dir: dir.clone(),
                env: vec![("PORT".into(), "9555".into())],
                log: Some(&log),
            })
            .expect("spawn");
        assert!(spawned.pid > 0);
        let outcome = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .expect("exit in time");
        assert_eq!(outcome.code, Some(0));
        let written = std::fs::read_to_string(&log_path).expect("read log");
        assert_eq!(written.trim(), "port=9555 secret=none");
    }

    #[tokio::test]
    async fn kill_signal_ends_a_sleeping_process() {
        let dir = temp_dir("kill");
        let program = script(&dir, "exec sleep 30");
        let spawned = OsProcessLauncher
            .spawn(LaunchSpec {
                tool_id: "sleeper",
                program,
                working_dir: dir,
                env: vec![("PATH".into(), std::env::var_os("PATH").unwrap_or_default())],
                log: None,
            })
            .expect("spawn");
        OsProcessLauncher
            .signal(spawned.pid, ProcessSignal::Kill)
            .expect("signal");
        let outcome = tokio::time::timeout(Duration::from_secs(5), spawned.exit)
            .await
            .expect("exit in time");
        assert_eq!(outcome.code, None);
    }
}
