use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::integrity::SourceSelector;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_tools_dir")]
    pub tools_dir: PathBuf,
    #[serde(default)]
    pub tool_data_dir: Option<PathBuf>,
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
    #[serde(default = "default_log_file_name")]
    pub log_file_name: String,
    #[serde(default = "default_manifest_file_name")]
    pub manifest_file_name: String,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_port_env")]
    pub port_env: String,
    #[serde(default = "default_data_dir_env")]
    pub data_dir_env: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_health_request_timeout_ms")]
    pub health_request_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: Vec<u64>,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tools_dir: default_tools_dir(),
            tool_data_dir: None,
            binary_name: default_binary_name(),
            log_file_name: default_log_file_name(),
            manifest_file_name: default_manifest_file_name(),
            port_base: default_port_base(),
            port_env: default_port_env(),
            data_dir_env: default_data_dir_env(),
            health_path: default_health_path(),
            health_interval_ms: default_health_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            health_request_timeout_ms: default_health_request_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl OrchestratorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn health_request_timeout(&self) -> Duration {
        Duration::from_millis(self.health_request_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn restart_backoff(&self) -> Vec<Duration> {
        self.restart_backoff_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default = "default_dependency_manifest")]
    pub dependency_manifest: Option<String>,
    #[serde(default = "default_dependency_command")]
    pub dependency_command: Vec<String>,
    #[serde(default = "default_build_command")]
    pub command: Vec<String>,
    #[serde(default = "default_build_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_build_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,
    #[serde(default = "default_source_files")]
    pub source_files: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            entry_point: default_entry_point(),
            dependency_manifest: default_dependency_manifest(),
            dependency_command: default_dependency_command(),
            command: default_build_command(),
            env: default_build_env(),
            timeout_secs: default_build_timeout_secs(),
            source_extensions: default_source_extensions(),
            source_files: default_source_files(),
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn source_selector(&self) -> SourceSelector {
        SourceSelector {
            extensions: self.source_extensions.clone(),
            file_names: self.source_files.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, tools_dir: Option<&Path>) {
        if let Some(dir) = tools_dir {
            self.orchestrator.tools_dir = dir.to_path_buf();
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("TOOL_ORCH_TOOLS_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.orchestrator.tools_dir = PathBuf::from(trimmed);
            }
        }
        if let Ok(v) = env::var("TOOL_ORCH_TOOL_DATA_DIR") {
            let trimmed = v.trim();
            self.orchestrator.tool_data_dir = if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            };
        }
        if let Ok(v) = env::var("TOOL_ORCH_PORT_BASE") {
            if let Ok(n) = v.trim().parse::<u16>() {
                self.orchestrator.port_base = n;
            }
        }
        if let Ok(v) = env::var("TOOL_ORCH_HEALTH_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.orchestrator.health_timeout_ms = n.max(100);
            }
        }
        if let Ok(v) = env::var("TOOL_ORCH_STOP_GRACE_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.orchestrator.stop_grace_ms = n;
            }
        }
        if let Ok(v) = env::var("TOOL_ORCH_MAX_RESTARTS") {
            if let Ok(n) = v.trim().parse::<u32>() {
                self.orchestrator.max_restarts = n;
            }
        }
        if let Ok(v) = env::var("TOOL_ORCH_RESTART_BACKOFF_MS") {
            let parsed = split_csv(&v)
                .iter()
                .filter_map(|item| item.parse::<u64>().ok())
                .collect::<Vec<_>>();
            if !parsed.is_empty() {
                self.orchestrator.restart_backoff_ms = parsed;
            }
        }
        if let Ok(v) = env::var("TOOL_ORCH_BUILD_TIMEOUT_SECS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.build.timeout_secs = n.max(1);
            }
        }
        if let Ok(v) = env::var("TOOL_ORCH_STORE_PATH") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.store.path = PathBuf::from(trimmed);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let orch = &self.orchestrator;
        if orch.port_base == 0 {
            bail!("orchestrator.port_base must be greater than zero");
        }
        if !orch.health_path.starts_with('/') {
            bail!(
                "orchestrator.health_path must start with `/` (got `{}`)",
                orch.health_path
            );
        }
        if orch.restart_backoff_ms.is_empty() {
            bail!("orchestrator.restart_backoff_ms must list at least one delay");
        }
        if orch.binary_name.trim().is_empty() || orch.binary_name.contains(|c| c == '/' || c == '\\') {
            bail!("orchestrator.binary_name must be a plain file name");
        }
        if orch.port_env.trim().is_empty() {
            bail!("orchestrator.port_env must not be empty");
        }
        if self.build.command.is_empty() || self.build.command[0].trim().is_empty() {
            bail!("build.command must name a compiler program");
        }
        if self.build.entry_point.trim().is_empty() {
            bail!("build.entry_point must not be empty");
        }
        Ok(())
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn default_tools_dir() -> PathBuf {
    PathBuf::from(".tool-orchestrator/tools")
}

fn default_binary_name() -> String {
    "tool".to_owned()
}

fn default_log_file_name() -> String {
    "tool.log".to_owned()
}

fn default_manifest_file_name() -> String {
    "manifest.json".to_owned()
}

fn default_port_base() -> u16 {
    9100
}

fn default_port_env() -> String {
    "PORT".to_owned()
}

fn default_data_dir_env() -> String {
    "TOOL_DATA_DIR".to_owned()
}

fn default_health_path() -> String {
    "/health".to_owned()
}

fn default_health_interval_ms() -> u64 {
    500
}

fn default_health_timeout_ms() -> u64 {
    10_000
}

fn default_health_request_timeout_ms() -> u64 {
    2_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    5_000
}

fn default_kill_wait_ms() -> u64 {
    2_000
}

fn default_restart_delay_ms() -> u64 {
    500
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_backoff_ms() -> Vec<u64> {
    vec![5_000, 15_000, 45_000, 120_000, 300_000]
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_entry_point() -> String {
    "main.go".to_owned()
}

fn default_dependency_manifest() -> Option<String> {
    Some("go.mod".to_owned())
}

fn default_dependency_command() -> Vec<String> {
    vec!["go".to_owned(), "mod".to_owned(), "tidy".to_owned()]
}

fn default_build_command() -> Vec<String> {
    vec![
        "go".to_owned(),
        "build".to_owned(),
        "-o".to_owned(),
        "tool".to_owned(),
        ".".to_owned(),
    ]
}

fn default_build_env() -> BTreeMap<String, String> {
    BTreeMap::from([("CGO_ENABLED".to_owned(), "0".to_owned())])
}

fn default_build_timeout_secs() -> u64 {
    300
}

fn default_source_extensions() -> Vec<String> {
    vec!["go".to_owned()]
}

fn default_source_files() -> Vec<String> {
    vec![
        "go.mod".to_owned(),
        "go.sum".to_owned(),
        "manifest.json".to_owned(),
    ]
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".tool-orchestrator/tools.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_runtime_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.orchestrator.port_base, 9100);
        assert_eq!(cfg.orchestrator.health_path, "/health");
        assert_eq!(cfg.orchestrator.health_interval(), Duration::from_millis(500));
        assert_eq!(cfg.orchestrator.health_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.orchestrator.stop_grace(), Duration::from_secs(5));
        assert_eq!(cfg.orchestrator.max_restarts, 5);
        assert_eq!(
            cfg.orchestrator.restart_backoff(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
                Duration::from_secs(120),
                Duration::from_secs(300),
            ]
        );
        assert_eq!(cfg.build.command[0], "go");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_missing_fields_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[orchestrator]
tools_dir = "/srv/tools"
port_base = 12000

[build]
entry_point = "main.rs"
command = ["cargo", "build", "--release"]
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.orchestrator.tools_dir, PathBuf::from("/srv/tools"));
        assert_eq!(cfg.orchestrator.port_base, 12000);
        assert_eq!(cfg.orchestrator.binary_name, "tool");
        assert_eq!(cfg.build.entry_point, "main.rs");
        assert_eq!(cfg.build.env.get("CGO_ENABLED").map(String::as_str), Some("0"));
        assert_eq!(cfg.store.path, PathBuf::from(".tool-orchestrator/tools.json"));
    }

    #[test]
    fn validate_rejects_broken_settings() {
        let mut cfg = Config::default();
        cfg.orchestrator.health_path = "health".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.orchestrator.restart_backoff_ms.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.build.command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.orchestrator.binary_name = "bin/tool".to_owned();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_config_file_loads_defaults() {
        let path = std::env::temp_dir().join("tool-orchestrator-missing-config.toml");
        let cfg = Config::load(&path).expect("defaults");
        assert_eq!(cfg.orchestrator.binary_name, "tool");
    }

    #[test]
    fn cli_override_replaces_tools_dir() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(Some(Path::new("/opt/tools")));
        assert_eq!(cfg.orchestrator.tools_dir, PathBuf::from("/opt/tools"));
    }

    #[test]
    fn split_csv_drops_blank_items() {
        assert_eq!(split_csv(" 10, ,20,"), vec!["10".to_owned(), "20".to_owned()]);
    }
}
