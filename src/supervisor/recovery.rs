use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{LaunchMode, Launched, RunningTool, ToolManager};
use crate::config::OrchestratorConfig;
use crate::error::{ToolManagerError, ToolManagerErrorCode};
use crate::events::ToolStatusPayload;
use crate::process::ExitOutcome;
use crate::types::ToolStatus;

/// Bounded automatic restarts with a delay schedule indexed by attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub backoff: Vec<Duration>,
}

impl RestartPolicy {
    pub fn from_config(cfg: &OrchestratorConfig) -> Self {
        Self {
            max_restarts: cfg.max_restarts,
            backoff: cfg.restart_backoff(),
        }
    }

    /// Delay before restart number `restarts + 1`, or `None` once the budget is
    /// spent. Attempts past the end of the schedule reuse its last entry.
    pub fn backoff_for(&self, restarts: u32) -> Option<Duration> {
        if restarts >= self.max_restarts {
            return None;
        }
        let last = self.backoff.len().checked_sub(1)?;
        let index = usize::try_from(restarts).unwrap_or(usize::MAX).min(last);
        self.backoff.get(index).copied()
    }
}

impl ToolManager {
    /// Drives the process's exit future to completion, then hands the exit to crash
    /// recovery. Runs for every spawned process, stopped or not.
    pub(super) fn spawn_exit_watcher(
        &self,
        tool_id: &str,
        instance: u64,
        exit: BoxFuture<'static, ExitOutcome>,
        exited: watch::Sender<Option<ExitOutcome>>,
    ) {
        let manager = self.clone();
        let tool_id = tool_id.to_owned();
        tokio::spawn(async move {
            let outcome = exit.await;
            exited.send_replace(Some(outcome.clone()));
            manager.handle_exit(&tool_id, instance, outcome).await;
        });
    }

    async fn handle_exit(&self, tool_id: &str, instance: u64, outcome: ExitOutcome) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            debug!("tool {tool_id} exited during shutdown");
            return;
        }

        let crashed = {
            let mut registry = self.inner.registry.lock().await;
            let current = registry
                .get(tool_id)
                .is_some_and(|entry| entry.instance == instance && entry.process.is_some());
            if current {
                registry.remove(tool_id)
            } else {
                None
            }
        };
        let Some(crashed) = crashed else {
            debug!("exit of tool {tool_id} instance {instance} needs no recovery");
            return;
        };
        crashed.cancel.cancel();
        let RunningTool {
            restarts, dir, log, ..
        } = crashed;
        drop(log);

        warn!("tool {tool_id} exited unexpectedly: {}", outcome.detail);
        self.persist_runtime(tool_id, ToolStatus::Crashed, 0, 0).await;
        ToolStatusPayload::new(tool_id, ToolStatus::Crashed)
            .with_error(outcome.detail.clone())
            .publish(self.events());

        let policy = &self.inner.policy;
        let Some(delay) = policy.backoff_for(restarts) else {
            let err = ToolManagerError::new(
                ToolManagerErrorCode::MaxRestartsExceeded,
                format!("exceeded max restarts ({})", policy.max_restarts),
            );
            self.mark_error(tool_id, &err, restarts, None).await;
            return;
        };

        // Park a crashed entry so status reports the backoff and an explicit start or
        // stop can cancel it.
        let waiting = self.inner.next_instance.fetch_add(1, Ordering::SeqCst);
        let cancel = self.inner.shutdown.child_token();
        {
            let mut registry = self.inner.registry.lock().await;
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                debug!("tool {tool_id} crashed during shutdown; not restarting");
                return;
            }
            if registry.contains_key(tool_id) {
                debug!("tool {tool_id} was started again before recovery began");
                return;
            }
            registry.insert(
                tool_id.to_owned(),
                RunningTool::tombstone(
                    waiting,
                    ToolStatus::Crashed,
                    dir,
                    restarts,
                    outcome.detail,
                    cancel.clone(),
                ),
            );
        }

        info!(
            "restarting tool {tool_id} in {}ms (attempt {}/{})",
            delay.as_millis(),
            restarts + 1,
            policy.max_restarts
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("pending restart of tool {tool_id} cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let mode = LaunchMode::Recovery {
            replaces: waiting,
            restarts: restarts + 1,
        };
        match self.launch(tool_id, mode).await {
            Ok(Launched::Started) => info!("tool {tool_id} restarted after crash"),
            Ok(Launched::Superseded) => debug!("restart of tool {tool_id} superseded"),
            Err(err) => {
                let err = ToolManagerError::new(err.code, format!("restart failed: {}", err.message));
                self.mark_error(tool_id, &err, restarts + 1, Some(waiting))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::from_config(&OrchestratorConfig::default())
    }

    #[test]
    fn default_schedule_matches_documented_delays() {
        let policy = policy();
        let delays = (0..5)
            .map(|attempt| policy.backoff_for(attempt).expect("within budget"))
            .collect::<Vec<_>>();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ]
        );
        assert_eq!(policy.backoff_for(5), None);
        assert_eq!(policy.backoff_for(u32::MAX), None);
    }

    #[test]
    fn short_schedule_repeats_its_last_delay() {
        let policy = RestartPolicy {
            max_restarts: 4,
            backoff: vec![Duration::from_millis(10), Duration::from_millis(20)],
        };
        assert_eq!(policy.backoff_for(0), Some(Duration::from_millis(10)));
        assert_eq!(policy.backoff_for(3), Some(Duration::from_millis(20)));
        assert_eq!(policy.backoff_for(4), None);
    }

    #[test]
    fn empty_schedule_or_zero_budget_never_restarts() {
        let empty = RestartPolicy {
            max_restarts: 3,
            backoff: Vec::new(),
        };
        assert_eq!(empty.backoff_for(0), None);
        let zero = RestartPolicy {
            max_restarts: 0,
            backoff: vec![Duration::from_secs(1)],
        };
        assert_eq!(zero.backoff_for(0), None);
    }
}
