use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{BroadcastEventSink, ToolEvent};
use crate::process::OsProcessLauncher;
use crate::store::ToolStateStore;
use crate::supervisor::{ToolManager, ToolManagerDeps};

pub struct OrchestratorRuntime {
    config: Config,
    manager: ToolManager,
    events: Arc<BroadcastEventSink>,
}

impl OrchestratorRuntime {
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(ToolStateStore::open(config.store.path.clone()).await?);
        let events = Arc::new(BroadcastEventSink::new(
            config.orchestrator.event_queue_capacity,
        ));
        let manager = ToolManager::new(
            &config,
            ToolManagerDeps {
                launcher: Arc::new(OsProcessLauncher),
                store: store.clone(),
                secrets: Some(store),
                events: events.clone(),
            },
        )?;
        Ok(Self {
            config,
            manager,
            events,
        })
    }

    pub async fn run(self) -> Result<()> {
        let orch = &self.config.orchestrator;
        info!(
            "starting tool orchestrator (tools_dir={}, store={}, port_base={}, max_restarts={}, backoff_ms={:?})",
            orch.tools_dir.display(),
            self.config.store.path.display(),
            orch.port_base,
            orch.max_restarts,
            orch.restart_backoff_ms
        );

        let mut event_log = tokio::spawn(log_events(self.events.subscribe()));
        let report = self.manager.start_all().await;
        for (tool_id, message) in &report.failed {
            warn!("tool {tool_id} not started: {message}");
        }

        tokio::select! {
            res = signal::ctrl_c() => {
                if let Err(err) = res {
                    warn!("failed to listen for ctrl-c: {err}");
                }
                info!("received ctrl-c, shutting down");
            }
            _ = &mut event_log => {
                warn!("event log task ended unexpectedly, shutting down");
            }
        }

        self.manager.shutdown().await;
        event_log.abort();
        let _ = event_log.await;
        Ok(())
    }
}

async fn log_events(mut rx: broadcast::Receiver<ToolEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => info!("{}", describe_event(&event)),
            Err(RecvError::Lagged(skipped)) => warn!("event log lagged; skipped {skipped} events"),
            Err(RecvError::Closed) => return,
        }
    }
}

fn describe_event(event: &ToolEvent) -> String {
    let field = |name: &str| event.payload.get(name).filter(|value| !value.is_null());
    let mut line = format!(
        "{} tool={} status={}",
        event.event_type,
        field("tool_id").and_then(Value::as_str).unwrap_or("?"),
        field("status").and_then(Value::as_str).unwrap_or("?")
    );
    if let Some(port) = field("port").and_then(Value::as_u64) {
        line.push_str(&format!(" port={port}"));
    }
    if let Some(pid) = field("pid").and_then(Value::as_u64) {
        line.push_str(&format!(" pid={pid}"));
    }
    if let Some(error) = field("error").and_then(Value::as_str) {
        line.push_str(&format!(" error={error:?}"));
    }
    line
}
