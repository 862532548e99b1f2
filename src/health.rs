use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::OrchestratorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    TimedOut,
    Cancelled,
}

/// Polls a tool's loopback health endpoint until it answers with a success status.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client,
    path: String,
    interval: Duration,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(cfg: &OrchestratorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(cfg.health_request_timeout())
            .build()
            .context("failed building health probe client")?;
        Ok(Self {
            client,
            path: cfg.health_path.clone(),
            interval: cfg.health_interval(),
            timeout: cfg.health_timeout(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns `Healthy` on the first 2xx, `TimedOut` once the deadline passes, or
    /// `Cancelled` as soon as `cancel` fires.
    pub async fn wait_for_health(&self, port: u16, cancel: &CancellationToken) -> HealthOutcome {
        let url = format!("http://127.0.0.1:{port}{}", self.path);
        let deadline = Instant::now() + self.timeout;
        loop {
            let healthy = tokio::select! {
                _ = cancel.cancelled() => return HealthOutcome::Cancelled,
                healthy = tokio::time::timeout_at(deadline, self.probe(&url)) => healthy,
            };
            match healthy {
                Ok(true) => return HealthOutcome::Healthy,
                Ok(false) => {}
                Err(_) => return HealthOutcome::TimedOut,
            }
            if Instant::now() + self.interval >= deadline {
                // Sleep out the remainder and report; no further probe fits in.
                tokio::select! {
                    _ = cancel.cancelled() => return HealthOutcome::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => return HealthOutcome::TimedOut,
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return HealthOutcome::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("health probe {url} failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::testing::{bind_stub, StubState};

    fn fast_probe(timeout_ms: u64) -> HealthProbe {
        let cfg = OrchestratorConfig {
            health_interval_ms: 20,
            health_timeout_ms: timeout_ms,
            health_request_timeout_ms: 200,
            ..OrchestratorConfig::default()
        };
        HealthProbe::new(&cfg).expect("probe")
    }

    #[tokio::test]
    async fn reports_healthy_once_endpoint_succeeds() {
        let state = Arc::new(StubState::default());
        state.unhealthy.store(true, Ordering::SeqCst);
        let (port, server) = bind_stub(state.clone()).await;

        let flip = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            flip.unhealthy.store(false, Ordering::SeqCst);
        });

        let outcome = fast_probe(3_000)
            .wait_for_health(port, &CancellationToken::new())
            .await;
        assert_eq!(outcome, HealthOutcome::Healthy);
        assert!(state.health_hits.load(Ordering::SeqCst) >= 2);
        server.abort();
    }

    #[tokio::test]
    async fn times_out_when_endpoint_never_succeeds() {
        let state = Arc::new(StubState::default());
        state.unhealthy.store(true, Ordering::SeqCst);
        let (port, server) = bind_stub(state).await;

        let started = std::time::Instant::now();
        let outcome = fast_probe(200)
            .wait_for_health(port, &CancellationToken::new())
            .await;
        assert_eq!(outcome, HealthOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn cancellation_interrupts_polling() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        // Nothing listens on port 1, so every probe fails fast.
        let outcome = fast_probe(10_000).wait_for_health(1, &cancel).await;
        assert_eq!(outcome, HealthOutcome::Cancelled);
    }
}
