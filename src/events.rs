use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::ToolStatus;

pub const TOOL_STATUS_EVENT: &str = "tool_status";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolEvent {
    pub event_type: String,
    pub payload: Value,
}

/// Receives lifecycle events for UI consumption. Publishing never blocks and never
/// fails from the publisher's point of view.
pub trait EventSink: Send + Sync {
    fn publish(&self, event_type: &str, payload: Value);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolStatusPayload {
    pub tool_id: String,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolStatusPayload {
    pub fn new(tool_id: &str, status: ToolStatus) -> Self {
        Self {
            tool_id: tool_id.to_owned(),
            status,
            port: None,
            pid: None,
            error: None,
        }
    }

    pub fn with_process(mut self, port: u16, pid: u32) -> Self {
        self.port = Some(port);
        self.pid = Some(pid);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn publish(self, sink: &dyn EventSink) {
        match serde_json::to_value(&self) {
            Ok(payload) => sink.publish(TOOL_STATUS_EVENT, payload),
            Err(err) => debug!("failed to encode tool_status payload: {err}"),
        }
    }
}

/// Fan-out sink backed by a tokio broadcast channel. Slow subscribers lag and lose
/// the oldest events rather than holding up the orchestrator.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<ToolEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(8));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ToolEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event_type: &str, payload: Value) {
        // No subscribers is not an error.
        let _ = self.tx.send(ToolEvent {
            event_type: event_type.to_owned(),
            payload,
        });
    }
}
