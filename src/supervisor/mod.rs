//! Tool process supervision: the registry of running tools and every operation that
//! mutates it. Crash handling and restart backoff live in [`recovery`].

mod recovery;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use recovery::RestartPolicy;

use crate::compiler::ToolCompiler;
use crate::config::{Config, OrchestratorConfig};
use crate::error::{ToolManagerError, ToolManagerErrorCode, ToolManagerResult};
use crate::events::{EventSink, ToolStatusPayload};
use crate::health::{HealthOutcome, HealthProbe};
use crate::integrity::{compute_integrity, SourceSelector};
use crate::ports::PortAllocator;
use crate::process::{ExitOutcome, LaunchSpec, ProcessLauncher, ProcessSignal};
use crate::proxy::{ProxyResponse, ToolCallClient};
use crate::security::env_filter::filtered_process_env;
use crate::security::secrets::{read_manifest_env, resolve_secrets};
use crate::store::{SecretSource, ToolStore};
use crate::types::{now_ms, StartAllReport, ToolRuntimeStatus, ToolStatus};

/// Collaborators the manager drives; everything else comes from config.
pub struct ToolManagerDeps {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub store: Arc<dyn ToolStore>,
    pub secrets: Option<Arc<dyn SecretSource>>,
    pub events: Arc<dyn EventSink>,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct ToolManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    cfg: OrchestratorConfig,
    tools_dir: PathBuf,
    compiler: ToolCompiler,
    sources: SourceSelector,
    registry: Mutex<HashMap<String, RunningTool>>,
    ports: PortAllocator,
    launcher: Arc<dyn ProcessLauncher>,
    store: Arc<dyn ToolStore>,
    secrets: Option<Arc<dyn SecretSource>>,
    events: Arc<dyn EventSink>,
    health: HealthProbe,
    calls: ToolCallClient,
    policy: RestartPolicy,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    next_instance: AtomicU64,
}

struct RunningTool {
    /// Distinguishes successive launches of the same tool id.
    instance: u64,
    port: u16,
    pid: u32,
    status: ToolStatus,
    dir: PathBuf,
    restarts: u32,
    started_at_ms: u64,
    last_error: Option<String>,
    /// `None` for entries that do not own an OS process (yet, or any more).
    process: Option<ProcessHandle>,
    log: Option<File>,
    cancel: CancellationToken,
}

struct ProcessHandle {
    pid: u32,
    exited: watch::Receiver<Option<ExitOutcome>>,
}

impl RunningTool {
    fn placeholder(instance: u64, dir: PathBuf, restarts: u32, cancel: CancellationToken) -> Self {
        Self {
            instance,
            port: 0,
            pid: 0,
            status: ToolStatus::Starting,
            dir,
            restarts,
            started_at_ms: 0,
            last_error: None,
            process: None,
            log: None,
            cancel,
        }
    }

    fn tombstone(
        instance: u64,
        status: ToolStatus,
        dir: PathBuf,
        restarts: u32,
        error: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            status,
            last_error: Some(error),
            ..Self::placeholder(instance, dir, restarts, cancel)
        }
    }

    fn snapshot(&self, tool_id: &str) -> ToolRuntimeStatus {
        ToolRuntimeStatus {
            tool_id: tool_id.to_owned(),
            status: self.status,
            port: (self.port != 0).then_some(self.port),
            pid: (self.pid != 0).then_some(self.pid),
            started_at_ms: (self.started_at_ms != 0).then_some(self.started_at_ms),
            restarts: self.restarts,
            error: self.last_error.clone(),
        }
    }
}

enum LaunchMode {
    Explicit,
    /// Automatic restart replacing the crashed entry `replaces`.
    Recovery { replaces: u64, restarts: u32 },
}

enum Launched {
    Started,
    /// Another operation took over the registry slot while launching.
    Superseded,
}

impl ToolManager {
    pub fn new(cfg: &Config, deps: ToolManagerDeps) -> Result<Self> {
        let orch = cfg.orchestrator.clone();
        let tools_dir =
            std::path::absolute(&orch.tools_dir).unwrap_or_else(|_| orch.tools_dir.clone());
        let inner = ManagerInner {
            tools_dir,
            compiler: ToolCompiler::new(cfg.build.clone()),
            sources: cfg.build.source_selector(),
            registry: Mutex::new(HashMap::new()),
            ports: PortAllocator::new(orch.port_base),
            launcher: deps.launcher,
            store: deps.store,
            secrets: deps.secrets,
            events: deps.events,
            health: HealthProbe::new(&orch)?,
            calls: ToolCallClient::new(orch.call_timeout())?,
            policy: RestartPolicy::from_config(&orch),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            next_instance: AtomicU64::new(1),
            cfg: orch,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn tool_dir(&self, tool_id: &str) -> PathBuf {
        self.inner.tools_dir.join(tool_id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Builds the tool in place. Build failures are recorded on the tool's persisted
    /// record as well as returned.
    pub async fn compile(&self, tool_id: &str) -> ToolManagerResult<()> {
        validate_tool_id(tool_id)?;
        let dir = self.tool_dir(tool_id);
        self.inner.compiler.ensure_buildable(&dir)?;
        self.ensure_tool_data_dir(tool_id).await;

        self.persist_build_status(tool_id, ToolStatus::Compiling).await;
        ToolStatusPayload::new(tool_id, ToolStatus::Compiling).publish(self.events());

        let env = filtered_process_env();
        if let Err(err) = self
            .inner
            .compiler
            .build(tool_id, &dir, &self.inner.cfg.binary_name, &env)
            .await
        {
            error!("build of tool {tool_id} failed: {}", err.message);
            self.record_failure(tool_id, &err).await;
            return Err(err);
        }

        self.persist_build_status(tool_id, ToolStatus::Active).await;
        ToolStatusPayload::new(tool_id, ToolStatus::Active).publish(self.events());

        match compute_integrity(&dir, &self.inner.cfg.binary_name, &self.inner.sources).await {
            Ok(record) => {
                if let Err(err) = self.inner.store.record_integrity(tool_id, &record).await {
                    warn!("failed to record integrity for tool {tool_id}: {err:#}");
                }
            }
            Err(err) => warn!("failed to hash tool {tool_id}: {err:#}"),
        }
        info!("compiled tool {tool_id}");
        Ok(())
    }

    /// Spawns the tool and returns without waiting for its health check.
    pub async fn start(&self, tool_id: &str) -> ToolManagerResult<()> {
        validate_tool_id(tool_id)?;
        match self.launch(tool_id, LaunchMode::Explicit).await {
            Ok(Launched::Started) => Ok(()),
            Ok(Launched::Superseded) if self.is_shutting_down() => {
                Err(start_failed("tool manager is shutting down"))
            }
            Ok(Launched::Superseded) => Err(ToolManagerError::new(
                ToolManagerErrorCode::NotRunning,
                format!("tool {tool_id} was stopped while starting"),
            )),
            Err(err) => {
                if err.is(ToolManagerErrorCode::StartFailed) && !self.is_shutting_down() {
                    error!("start of tool {tool_id} failed: {}", err.message);
                    self.record_failure(tool_id, &err).await;
                }
                Err(err)
            }
        }
    }

    pub async fn stop(&self, tool_id: &str) -> ToolManagerResult<()> {
        validate_tool_id(tool_id)?;
        // Removing first makes the exit watcher treat the exit as intentional.
        let entry = self.inner.registry.lock().await.remove(tool_id);
        let Some(entry) = entry else {
            return Err(ToolManagerError::new(
                ToolManagerErrorCode::NotRunning,
                format!("tool {tool_id} is not running"),
            ));
        };
        entry.cancel.cancel();

        let RunningTool { process, log, .. } = entry;
        if let Some(mut handle) = process {
            self.terminate(tool_id, &mut handle).await;
        }
        drop(log);

        self.persist_runtime(tool_id, ToolStatus::Stopped, 0, 0).await;
        ToolStatusPayload::new(tool_id, ToolStatus::Stopped).publish(self.events());
        info!("stopped tool {tool_id}");
        Ok(())
    }

    pub async fn restart(&self, tool_id: &str) -> ToolManagerResult<()> {
        match self.stop(tool_id).await {
            Ok(()) => {}
            Err(err) if err.is(ToolManagerErrorCode::NotRunning) => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(self.inner.cfg.restart_delay()).await;
        self.start(tool_id).await
    }

    /// Forwards a request to a running tool: GET without payload, POST with one.
    pub async fn call(
        &self,
        tool_id: &str,
        endpoint: &str,
        payload: Option<Vec<u8>>,
    ) -> ToolManagerResult<Vec<u8>> {
        let port = self.running_port(tool_id).await?;
        self.inner.calls.call(port, endpoint, payload).await
    }

    pub async fn proxy(&self, tool_id: &str, path: &str) -> ToolManagerResult<ProxyResponse> {
        let port = self.running_port(tool_id).await?;
        self.inner.calls.proxy_get(port, path).await
    }

    pub async fn status(&self, tool_id: &str) -> ToolRuntimeStatus {
        let registry = self.inner.registry.lock().await;
        registry
            .get(tool_id)
            .map(|entry| entry.snapshot(tool_id))
            .unwrap_or_else(|| ToolRuntimeStatus::stopped(tool_id))
    }

    pub async fn list(&self) -> Vec<ToolRuntimeStatus> {
        let registry = self.inner.registry.lock().await;
        let mut out = registry
            .iter()
            .map(|(tool_id, entry)| entry.snapshot(tool_id))
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.tool_id.cmp(&b.tool_id));
        out
    }

    /// Builds (when needed) and starts every enabled tool. One tool's failure never
    /// stops the rest.
    pub async fn start_all(&self) -> StartAllReport {
        let mut report = StartAllReport::default();
        let tool_ids = match self.inner.store.list_enabled_tool_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!("failed to list enabled tools: {err:#}");
                return report;
            }
        };

        for tool_id in tool_ids {
            if validate_tool_id(&tool_id).is_ok() && !self.binary_path(&tool_id).is_file() {
                info!("tool {tool_id} has no binary; compiling before start");
                match self.compile(&tool_id).await {
                    Ok(()) => report.compiled.push(tool_id.clone()),
                    Err(err) => {
                        warn!("skipping tool {tool_id}: {}", err.message);
                        report.failed.push((tool_id, err.message));
                        continue;
                    }
                }
            }
            match self.start(&tool_id).await {
                Ok(()) => report.started.push(tool_id),
                Err(err) if err.is(ToolManagerErrorCode::AlreadyRunning) => {
                    debug!("tool {tool_id} already running");
                }
                Err(err) => {
                    warn!("failed to start tool {tool_id}: {}", err.message);
                    report.failed.push((tool_id, err.message));
                }
            }
        }
        info!(
            "start-all finished: started={} compiled={} failed={}",
            report.started.len(),
            report.compiled.len(),
            report.failed.len()
        );
        report
    }

    /// Terminates every tool concurrently, persists `stopped` for every registry
    /// entry (including ones waiting out a restart backoff) and clears the registry.
    /// Later calls are no-ops, as are starts and crash restarts once this has begun.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("tool manager already shut down");
            return;
        }
        self.inner.shutdown.cancel();

        let entries = self
            .inner
            .registry
            .lock()
            .await
            .drain()
            .collect::<Vec<_>>();
        info!("shutting down {} tool(s)", entries.len());

        let stops = entries.into_iter().map(|(tool_id, entry)| async move {
            let RunningTool { process, log, .. } = entry;
            if let Some(mut handle) = process {
                self.terminate(&tool_id, &mut handle).await;
            }
            drop(log);
            self.persist_runtime(&tool_id, ToolStatus::Stopped, 0, 0).await;
            ToolStatusPayload::new(&tool_id, ToolStatus::Stopped).publish(self.events());
        });
        join_all(stops).await;
    }

    /// Blocks until the tool's health endpoint answers or the health deadline passes.
    pub async fn wait_until_healthy(&self, tool_id: &str) -> ToolManagerResult<()> {
        let port = {
            let registry = self.inner.registry.lock().await;
            match registry.get(tool_id) {
                Some(entry) if entry.status.is_live() && entry.port != 0 => entry.port,
                _ => {
                    return Err(ToolManagerError::new(
                        ToolManagerErrorCode::NotRunning,
                        format!("tool {tool_id} is not running"),
                    ))
                }
            }
        };
        match self
            .inner
            .health
            .wait_for_health(port, &self.inner.shutdown)
            .await
        {
            HealthOutcome::Healthy => Ok(()),
            HealthOutcome::TimedOut => Err(ToolManagerError::new(
                ToolManagerErrorCode::StartFailed,
                format!(
                    "tool {tool_id} did not become healthy within {}ms",
                    self.inner.health.timeout().as_millis()
                ),
            )),
            HealthOutcome::Cancelled => Err(ToolManagerError::new(
                ToolManagerErrorCode::NotRunning,
                "tool manager is shutting down",
            )),
        }
    }

    /// Registered tools whose manifest declares the secret `name`.
    pub async fn tools_using_secret(&self, name: &str) -> Vec<String> {
        let candidates = {
            let registry = self.inner.registry.lock().await;
            registry
                .iter()
                .map(|(tool_id, entry)| (tool_id.clone(), entry.dir.clone()))
                .collect::<Vec<_>>()
        };
        let mut out = Vec::new();
        for (tool_id, dir) in candidates {
            let declared = read_manifest_env(&dir.join(&self.inner.cfg.manifest_file_name)).await;
            if declared.iter().any(|var| var.name == name) {
                out.push(tool_id);
            }
        }
        out.sort();
        out
    }

    /// Restarts every tool using `name` so it picks up the new value. Returns the ids
    /// that restarted successfully.
    pub async fn restart_tools_using_secret(&self, name: &str) -> Vec<String> {
        let mut restarted = Vec::new();
        for tool_id in self.tools_using_secret(name).await {
            match self.restart(&tool_id).await {
                Ok(()) => {
                    info!("restarted tool {tool_id} after secret {name} changed");
                    restarted.push(tool_id);
                }
                Err(err) => warn!(
                    "failed to restart tool {tool_id} after secret {name} changed: {}",
                    err.message
                ),
            }
        }
        restarted
    }

    async fn launch(&self, tool_id: &str, mode: LaunchMode) -> ToolManagerResult<Launched> {
        if self.is_shutting_down() {
            return Err(start_failed("tool manager is shutting down"));
        }
        let dir = self.tool_dir(tool_id);
        let instance = self.inner.next_instance.fetch_add(1, Ordering::SeqCst);
        let cancel = self.inner.shutdown.child_token();
        let restarts = match mode {
            LaunchMode::Explicit => 0,
            LaunchMode::Recovery { restarts, .. } => restarts,
        };

        {
            let mut registry = self.inner.registry.lock().await;
            // Shutdown sets the flag before draining under this lock.
            if self.is_shutting_down() {
                return Err(start_failed("tool manager is shutting down"));
            }
            match (registry.get(tool_id), &mode) {
                (Some(existing), LaunchMode::Explicit) if existing.status.is_live() => {
                    return Err(ToolManagerError::new(
                        ToolManagerErrorCode::AlreadyRunning,
                        format!("tool {tool_id} already running on port {}", existing.port),
                    ));
                }
                (Some(existing), LaunchMode::Recovery { replaces, .. })
                    if existing.instance != *replaces =>
                {
                    return Ok(Launched::Superseded);
                }
                (None, LaunchMode::Recovery { .. }) => return Ok(Launched::Superseded),
                _ => {}
            }
            let placeholder = RunningTool::placeholder(instance, dir.clone(), restarts, cancel.clone());
            if let Some(previous) = registry.insert(tool_id.to_owned(), placeholder) {
                previous.cancel.cancel();
            }
        }

        let result = self
            .spawn_instance(tool_id, &dir, instance, restarts, &cancel)
            .await;
        if result.is_err() {
            let mut registry = self.inner.registry.lock().await;
            if registry
                .get(tool_id)
                .is_some_and(|entry| entry.instance == instance)
            {
                registry.remove(tool_id);
            }
        }
        result
    }

    async fn spawn_instance(
        &self,
        tool_id: &str,
        dir: &Path,
        instance: u64,
        restarts: u32,
        cancel: &CancellationToken,
    ) -> ToolManagerResult<Launched> {
        let cfg = &self.inner.cfg;
        let binary = dir.join(&cfg.binary_name);
        if !binary.is_file() {
            return Err(ToolManagerError::new(
                ToolManagerErrorCode::BinaryMissing,
                format!("tool binary not found at {}, compile first", binary.display()),
            ));
        }
        let data_root = self.ensure_tool_data_dir(tool_id).await;

        let mut env = filtered_process_env();
        if let Some(secrets) = &self.inner.secrets {
            let declared = read_manifest_env(&dir.join(&cfg.manifest_file_name)).await;
            let injection = resolve_secrets(tool_id, &declared, secrets.as_ref()).await;
            if !injection.missing.is_empty() {
                return Err(start_failed(format!(
                    "missing secrets: {}",
                    injection.missing.join(", ")
                )));
            }
            for (name, value) in injection.env_pairs {
                set_env(&mut env, &name, value.into());
            }
        }

        let port = self
            .inner
            .ports
            .allocate()
            .ok_or_else(|| start_failed("port space exhausted"))?;
        set_env(&mut env, &cfg.port_env, port.to_string().into());
        if let Some(root) = data_root {
            set_env(&mut env, &cfg.data_dir_env, root.into_os_string());
        }

        let log_path = dir.join(&cfg.log_file_name);
        let log = open_log(&log_path).await.map_err(|err| {
            start_failed(format!("failed to open log {}: {err}", log_path.display()))
        })?;
        let spawned = self
            .inner
            .launcher
            .spawn(LaunchSpec {
                tool_id,
                program: binary,
                working_dir: dir.to_path_buf(),
                env,
                log: Some(&log),
            })
            .map_err(|err| start_failed(format!("failed to start process: {err}")))?;
        let pid = spawned.pid;

        let (exit_tx, exit_rx) = watch::channel(None);
        let registered = {
            let mut registry = self.inner.registry.lock().await;
            match registry.get_mut(tool_id) {
                Some(entry) if entry.instance == instance && !self.is_shutting_down() => {
                    entry.port = port;
                    entry.pid = pid;
                    entry.started_at_ms = now_ms();
                    entry.process = Some(ProcessHandle {
                        pid,
                        exited: exit_rx.clone(),
                    });
                    entry.log = Some(log);
                    true
                }
                _ => false,
            }
        };
        // The watcher also reaps processes that lost the race below.
        self.spawn_exit_watcher(tool_id, instance, spawned.exit, exit_tx);

        if !registered {
            warn!("tool {tool_id} was stopped while starting; terminating pid {pid}");
            let mut handle = ProcessHandle {
                pid,
                exited: exit_rx,
            };
            self.terminate(tool_id, &mut handle).await;
            return Ok(Launched::Superseded);
        }

        self.persist_runtime(tool_id, ToolStatus::Running, port, pid)
            .await;
        ToolStatusPayload::new(tool_id, ToolStatus::Starting)
            .with_process(port, pid)
            .publish(self.events());
        info!("started tool {tool_id} (pid={pid}, port={port}, restarts={restarts})");

        self.spawn_health_monitor(tool_id, instance, port, pid, cancel.clone());
        Ok(Launched::Started)
    }

    fn spawn_health_monitor(
        &self,
        tool_id: &str,
        instance: u64,
        port: u16,
        pid: u32,
        cancel: CancellationToken,
    ) {
        let manager = self.clone();
        let tool_id = tool_id.to_owned();
        tokio::spawn(async move {
            let outcome = manager.inner.health.wait_for_health(port, &cancel).await;
            if outcome == HealthOutcome::Cancelled {
                return;
            }
            let promoted = {
                let mut registry = manager.inner.registry.lock().await;
                match registry.get_mut(&tool_id) {
                    Some(entry)
                        if entry.instance == instance && entry.status == ToolStatus::Starting =>
                    {
                        entry.status = ToolStatus::Running;
                        true
                    }
                    _ => false,
                }
            };
            if !promoted {
                return;
            }
            if outcome == HealthOutcome::TimedOut {
                warn!(
                    "tool {tool_id} did not pass its health check within {}ms; marking running anyway",
                    manager.inner.health.timeout().as_millis()
                );
            } else {
                info!("tool {tool_id} is healthy on port {port}");
            }
            ToolStatusPayload::new(&tool_id, ToolStatus::Running)
                .with_process(port, pid)
                .publish(manager.events());
        });
    }

    /// Interrupt, wait out the grace period, then kill.
    async fn terminate(&self, tool_id: &str, handle: &mut ProcessHandle) {
        if handle.exited.borrow().is_some() {
            return;
        }
        if let Err(err) = self
            .inner
            .launcher
            .signal(handle.pid, ProcessSignal::Interrupt)
        {
            debug!("interrupt of tool {tool_id} (pid {}) failed: {err}", handle.pid);
        }
        let grace = self.inner.cfg.stop_grace();
        if tokio::time::timeout(grace, wait_for_exit(&mut handle.exited))
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            "tool {tool_id} (pid {}) still alive {}ms after interrupt; killing",
            handle.pid,
            grace.as_millis()
        );
        if let Err(err) = self.inner.launcher.signal(handle.pid, ProcessSignal::Kill) {
            warn!("kill of tool {tool_id} (pid {}) failed: {err}", handle.pid);
        }
        if tokio::time::timeout(self.inner.cfg.kill_wait(), wait_for_exit(&mut handle.exited))
            .await
            .is_err()
        {
            error!("tool {tool_id} (pid {}) did not exit after kill", handle.pid);
        }
    }

    /// Parks the tool in permanent `error` until a caller starts it again. With a
    /// `guard`, an entry is only overwritten if it is still that instance.
    async fn mark_error(
        &self,
        tool_id: &str,
        err: &ToolManagerError,
        restarts: u32,
        guard: Option<u64>,
    ) {
        {
            let mut registry = self.inner.registry.lock().await;
            let writable = match registry.get(tool_id) {
                None => true,
                Some(existing) => guard == Some(existing.instance),
            };
            if !writable {
                debug!("tool {tool_id} was taken over before it could be marked as failed");
                return;
            }
            let instance = self.inner.next_instance.fetch_add(1, Ordering::SeqCst);
            registry.insert(
                tool_id.to_owned(),
                RunningTool::tombstone(
                    instance,
                    ToolStatus::Error,
                    self.tool_dir(tool_id),
                    restarts,
                    err.message.clone(),
                    self.inner.shutdown.child_token(),
                ),
            );
        }
        error!(
            "tool {tool_id} is in error ({}): {}",
            err.code.as_str(),
            err.message
        );
        self.record_failure(tool_id, err).await;
    }

    async fn running_port(&self, tool_id: &str) -> ToolManagerResult<u16> {
        let registry = self.inner.registry.lock().await;
        match registry.get(tool_id) {
            Some(entry) if entry.status == ToolStatus::Running => Ok(entry.port),
            _ => Err(ToolManagerError::new(
                ToolManagerErrorCode::NotRunning,
                format!("tool {tool_id} is not running"),
            )),
        }
    }

    fn binary_path(&self, tool_id: &str) -> PathBuf {
        self.tool_dir(tool_id).join(&self.inner.cfg.binary_name)
    }

    fn data_root(&self) -> PathBuf {
        let root = self.inner.cfg.tool_data_dir.clone().unwrap_or_else(|| {
            self.inner
                .tools_dir
                .parent()
                .map(|parent| parent.join("tool-data"))
                .unwrap_or_else(|| PathBuf::from("tool-data"))
        });
        std::path::absolute(&root).unwrap_or(root)
    }

    /// Creates the shared data root and the tool's library subdirectory. Failures
    /// only cost the tool its data directory.
    async fn ensure_tool_data_dir(&self, tool_id: &str) -> Option<PathBuf> {
        let root = self.data_root();
        if let Err(err) = tokio::fs::create_dir_all(&root).await {
            warn!("failed to create tool data dir {}: {err}", root.display());
            return None;
        }
        match self.inner.store.library_slug(tool_id).await {
            Ok(Some(slug)) if validate_tool_id(&slug).is_ok() => {
                let slug_dir = root.join(slug);
                if let Err(err) = tokio::fs::create_dir_all(&slug_dir).await {
                    warn!("failed to create {}: {err}", slug_dir.display());
                }
            }
            Ok(Some(slug)) => warn!("ignoring unsafe library slug {slug:?} for tool {tool_id}"),
            Ok(None) => {}
            Err(err) => warn!("failed to look up library slug for tool {tool_id}: {err:#}"),
        }
        Some(root)
    }

    async fn record_failure(&self, tool_id: &str, err: &ToolManagerError) {
        if let Err(store_err) = self.inner.store.record_tool_error(tool_id, &err.message).await {
            warn!("failed to persist error for tool {tool_id}: {store_err:#}");
        }
        ToolStatusPayload::new(tool_id, ToolStatus::Error)
            .with_error(err.message.clone())
            .publish(self.events());
    }

    async fn persist_runtime(&self, tool_id: &str, status: ToolStatus, port: u16, pid: u32) {
        if let Err(err) = self
            .inner
            .store
            .update_tool_runtime(tool_id, status, port, pid)
            .await
        {
            warn!("failed to persist {status} for tool {tool_id}: {err:#}");
        }
    }

    async fn persist_build_status(&self, tool_id: &str, status: ToolStatus) {
        if let Err(err) = self
            .inner
            .store
            .update_tool_build_status(tool_id, status)
            .await
        {
            warn!("failed to persist build status {status} for tool {tool_id}: {err:#}");
        }
    }

    fn events(&self) -> &dyn EventSink {
        self.inner.events.as_ref()
    }
}

/// Tool ids become directory names, so anything that could walk out of the tools
/// directory is refused.
pub fn validate_tool_id(tool_id: &str) -> ToolManagerResult<()> {
    let invalid = tool_id.is_empty()
        || tool_id.trim() != tool_id
        || tool_id.starts_with('.')
        || tool_id.contains("..")
        || tool_id.contains(|c: char| c == '/' || c == '\\' || c == '\0');
    if invalid {
        return Err(ToolManagerError::new(
            ToolManagerErrorCode::InvalidToolId,
            format!("invalid tool id {tool_id:?}"),
        ));
    }
    Ok(())
}

fn start_failed(message: impl Into<String>) -> ToolManagerError {
    ToolManagerError::new(ToolManagerErrorCode::StartFailed, message)
}

fn set_env(env: &mut Vec<(OsString, OsString)>, name: &str, value: OsString) {
    env.retain(|(existing, _)| existing.as_os_str() != OsStr::new(name));
    env.push((OsString::from(name), value));
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    Ok(file.into_std().await)
}

async fn wait_for_exit(exited: &mut watch::Receiver<Option<ExitOutcome>>) {
    // A closed channel means the watcher is gone, which only happens after exit.
    let _ = exited.wait_for(Option::is_some).await;
}
