use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tool_orchestrator::config::Config;
use tool_orchestrator::events::BroadcastEventSink;
use tool_orchestrator::integrity::{is_tampered, verify_integrity, IntegrityRecord};
use tool_orchestrator::process::OsProcessLauncher;
use tool_orchestrator::runtime::OrchestratorRuntime;
use tool_orchestrator::store::ToolStateStore;
use tool_orchestrator::supervisor::{self, ToolManager, ToolManagerDeps};

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Builds, supervises, and proxies local tool processes")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "TOOL_ORCH_CONFIG",
        default_value = "tool-orchestrator.toml"
    )]
    config: PathBuf,

    /// Override the directory holding one subdirectory per tool.
    #[arg(long, global = true)]
    tools_dir: Option<PathBuf>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "TOOL_ORCH_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Start every enabled tool and supervise until ctrl-c.
    Run,
    /// Compile one tool in place.
    Build(ToolArgs),
    /// Show the persisted record of one tool.
    Status(ToolArgs),
    /// Re-hash a built tool and compare it with its recorded fingerprint.
    Verify(ToolArgs),
    /// Start one tool, send it a single request, then stop it.
    Call(CallArgs),
    /// Mark a tool as enabled so `run` starts it.
    Enable(ToggleArgs),
    /// Mark a tool as disabled.
    Disable(ToggleArgs),
    /// Check config, directories, and compiler availability.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct ToolArgs {
    /// Tool id (directory name under the tools dir).
    #[arg(long)]
    tool: String,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct CallArgs {
    /// Tool id (directory name under the tools dir).
    #[arg(long)]
    tool: String,
    /// Path on the tool, e.g. /forecast.
    #[arg(long, default_value = "/")]
    endpoint: String,
    /// JSON request body; sends a POST instead of a GET.
    #[arg(long)]
    payload: Option<String>,
    /// GET the endpoint and print status and content type, even for error statuses.
    #[arg(long, conflicts_with = "payload")]
    raw: bool,
}

#[derive(Debug, Clone, Args)]
struct ToggleArgs {
    /// Tool id (directory name under the tools dir).
    #[arg(long)]
    tool: String,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct IntegrityCheck {
    intact: bool,
    source_tampered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_orchestrator(&cli).await,
        CliCommand::Build(args) => run_build(&cli, args).await,
        CliCommand::Status(args) => run_status(&cli, args).await,
        CliCommand::Verify(args) => run_verify(&cli, args).await,
        CliCommand::Call(args) => run_call(&cli, args).await,
        CliCommand::Enable(args) => run_toggle(&cli, args, true).await,
        CliCommand::Disable(args) => run_toggle(&cli, args, false).await,
        CliCommand::Doctor(args) => run_doctor(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.tools_dir.as_deref());
    Ok(cfg)
}

async fn run_orchestrator(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let runtime = OrchestratorRuntime::new(cfg).await?;
    runtime.run().await
}

async fn open_manager(cfg: &Config) -> Result<ToolManager> {
    let store = Arc::new(ToolStateStore::open(cfg.store.path.clone()).await?);
    ToolManager::new(
        cfg,
        ToolManagerDeps {
            launcher: Arc::new(OsProcessLauncher),
            store: store.clone(),
            secrets: Some(store),
            events: Arc::new(BroadcastEventSink::new(
                cfg.orchestrator.event_queue_capacity,
            )),
        },
    )
}

async fn run_build(cli: &Cli, args: ToolArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let manager = open_manager(&cfg).await?;

    let result = manager.compile(&args.tool).await;
    if args.json {
        let payload = match &result {
            Ok(()) => json!({"tool_id": args.tool, "ok": true}),
            Err(err) => json!({
                "tool_id": args.tool,
                "ok": false,
                "code": err.code.as_str(),
                "error": err.message,
            }),
        };
        print_json_value(&payload);
    } else {
        match &result {
            Ok(()) => println!("build {}: ok", args.tool),
            Err(err) => println!("build {}: {} ({})", args.tool, err.code.as_str(), err.message),
        }
    }
    result.map_err(|err| anyhow!("build of {} failed: {}", args.tool, err.message))
}

async fn run_status(cli: &Cli, args: ToolArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let store = ToolStateStore::open(cfg.store.path.clone()).await?;
    let Some(record) = store.tool(&args.tool).await? else {
        return Err(anyhow!("tool {} is not registered", args.tool));
    };
    let tampered = record.integrity.as_ref().map(|integrity| {
        is_tampered(
            &cfg.orchestrator.tools_dir.join(&record.id),
            &cfg.build.source_selector(),
            &integrity.source_hash,
        )
    });
    if args.json {
        let mut value = serde_json::to_value(&record)?;
        if let (Some(object), Some(tampered)) = (value.as_object_mut(), tampered) {
            object.insert("tampered".to_owned(), Value::Bool(tampered));
        }
        print_json_value(&value);
        return Ok(());
    }
    let error = record
        .last_error
        .as_deref()
        .map(|value| format!(" error={value:?}"))
        .unwrap_or_default();
    let tampered = tampered
        .map(|value| format!(" tampered={value}"))
        .unwrap_or_default();
    println!(
        "tool {}: status={} enabled={} port={} pid={}{}{}",
        record.id, record.status, record.enabled, record.port, record.pid, tampered, error
    );
    Ok(())
}

async fn run_verify(cli: &Cli, args: ToolArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let store = ToolStateStore::open(cfg.store.path.clone()).await?;
    let Some(record) = store.tool(&args.tool).await? else {
        return Err(anyhow!("tool {} is not registered", args.tool));
    };
    let Some(expected) = record.integrity else {
        return Err(anyhow!("tool {} has no recorded build fingerprint", args.tool));
    };
    let check = check_integrity(&cfg, &record.id, &expected);
    if args.json {
        let mut value = serde_json::to_value(&check)?;
        if let Some(object) = value.as_object_mut() {
            object.insert("tool_id".to_owned(), Value::String(record.id.clone()));
        }
        print_json_value(&value);
    } else {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        let verdict = if check.intact { "intact" } else { "modified" };
        println!("verify {}: {verdict}{detail}", record.id);
    }
    if check.intact {
        return Ok(());
    }
    Err(anyhow!("tool {} does not match its recorded fingerprint", record.id))
}

fn check_integrity(cfg: &Config, tool_id: &str, expected: &IntegrityRecord) -> IntegrityCheck {
    let dir = cfg.orchestrator.tools_dir.join(tool_id);
    let selector = cfg.build.source_selector();
    let source_tampered = is_tampered(&dir, &selector, &expected.source_hash);
    match verify_integrity(&dir, &cfg.orchestrator.binary_name, &selector, expected) {
        Ok(intact) => IntegrityCheck {
            intact,
            source_tampered,
            detail: (!intact && !source_tampered).then(|| "binary changed".to_owned()),
        },
        Err(err) => IntegrityCheck {
            intact: false,
            source_tampered,
            detail: Some(format!("{err:#}")),
        },
    }
}

async fn run_call(cli: &Cli, args: CallArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let manager = open_manager(&cfg).await?;
    manager.start(&args.tool).await?;
    let result = call_started_tool(&manager, &args).await;
    manager.shutdown().await;
    result
}

async fn call_started_tool(manager: &ToolManager, args: &CallArgs) -> Result<()> {
    manager.wait_until_healthy(&args.tool).await?;
    for status in manager.list().await {
        debug!(
            "tool {} status={} port={:?} pid={:?}",
            status.tool_id, status.status, status.port, status.pid
        );
    }
    if args.raw {
        let response = manager.proxy(&args.tool, &args.endpoint).await?;
        println!("status: {}", response.status);
        println!("content-type: {}", response.content_type);
        println!("{}", String::from_utf8_lossy(&response.body));
        return Ok(());
    }
    let payload = args.payload.clone().map(String::into_bytes);
    let body = manager.call(&args.tool, &args.endpoint, payload).await?;
    println!("{}", String::from_utf8_lossy(&body));
    Ok(())
}

async fn run_toggle(cli: &Cli, args: ToggleArgs, enabled: bool) -> Result<()> {
    supervisor::validate_tool_id(&args.tool).map_err(|err| anyhow!(err.message))?;
    let cfg = load_config(cli)?;
    let store = ToolStateStore::open(cfg.store.path.clone()).await?;
    let record = store.set_enabled(&args.tool, enabled).await?;
    println!("tool {}: enabled={}", record.id, record.enabled);
    Ok(())
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, &cli.config, &command_available);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    command_available: &dyn Fn(&str) -> bool,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        let tools_dir = &cfg.orchestrator.tools_dir;
        checks.push(DoctorCheck {
            id: "orchestrator.tools_dir".to_owned(),
            status: if tools_dir.is_dir() { "pass" } else { "warn" }.to_owned(),
            message: tools_dir.display().to_string(),
            detail: (!tools_dir.is_dir()).then(|| "directory does not exist yet".to_owned()),
        });

        checks.push(DoctorCheck {
            id: "orchestrator.restart_policy".to_owned(),
            status: "pass".to_owned(),
            message: format!("max_restarts={}", cfg.orchestrator.max_restarts),
            detail: Some(format!("backoff_ms={:?}", cfg.orchestrator.restart_backoff_ms)),
        });

        let store_path = cfg.store.path.to_string_lossy().to_ascii_lowercase();
        let sqlite_selected = store_path.ends_with(".db")
            || store_path.ends_with(".sqlite")
            || store_path.ends_with(".sqlite3");
        let sqlite_enabled = cfg!(feature = "sqlite-store");
        checks.push(DoctorCheck {
            id: "store.backend".to_owned(),
            status: if sqlite_selected && !sqlite_enabled {
                "fail"
            } else {
                "pass"
            }
            .to_owned(),
            message: if sqlite_selected {
                "sqlite-backed tool store requested".to_owned()
            } else {
                "json-backed tool store requested".to_owned()
            },
            detail: Some(format!("feature sqlite-store enabled={sqlite_enabled}")),
        });

        let compiler = cfg.build.command.first().map(String::as_str).unwrap_or_default();
        let compiler_found = command_available(compiler);
        checks.push(DoctorCheck {
            id: "build.compiler".to_owned(),
            status: if compiler_found { "pass" } else { "warn" }.to_owned(),
            message: format!("compiler `{compiler}`"),
            detail: (!compiler_found)
                .then(|| "not found on PATH; tools without a binary cannot be built".to_owned()),
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn command_available(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return direct.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_run_with_global_flags() {
        let cli = Cli::parse_from([
            "tool-orchestrator",
            "--config",
            "custom.toml",
            "--tools-dir",
            "/srv/tools",
        ]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert_eq!(cli.tools_dir, Some(PathBuf::from("/srv/tools")));
    }

    #[test]
    fn cli_parses_build_command_with_json_flag() {
        let cli = Cli::parse_from(["tool-orchestrator", "build", "--tool", "weather", "--json"]);
        match cli.command {
            Some(CliCommand::Build(args)) => {
                assert_eq!(args.tool, "weather");
                assert!(args.json);
            }
            _ => panic!("expected build command"),
        }
    }

    #[test]
    fn cli_parses_enable_and_doctor_commands() {
        let cli = Cli::parse_from(["tool-orchestrator", "enable", "--tool", "notes"]);
        assert!(matches!(cli.command, Some(CliCommand::Enable(ToggleArgs { ref tool })) if tool == "notes"));

        let cli = Cli::parse_from(["tool-orchestrator", "doctor", "--json"]);
        assert!(matches!(cli.command, Some(CliCommand::Doctor(DoctorArgs { json: true }))));
    }

    #[test]
    fn cli_parses_verify_command() {
        let cli = Cli::parse_from(["tool-orchestrator", "verify", "--tool", "weather"]);
        assert!(matches!(
            cli.command,
            Some(CliCommand::Verify(ToolArgs { ref tool, json: false })) if tool == "weather"
        ));
    }

    #[test]
    fn cli_parses_call_command() {
        let cli = Cli::parse_from([
            "tool-orchestrator",
            "call",
            "--tool",
            "weather",
            "--endpoint",
            "/forecast",
            "--payload",
            "{\"city\":\"Oslo\"}",
        ]);
        match cli.command {
            Some(CliCommand::Call(args)) => {
                assert_eq!(args.endpoint, "/forecast");
                assert_eq!(args.payload.as_deref(), Some("{\"city\":\"Oslo\"}"));
                assert!(!args.raw);
            }
            _ => panic!("expected call command"),
        }
        assert!(Cli::try_parse_from([
            "tool-orchestrator",
            "call",
            "--tool",
            "weather",
            "--raw",
            "--payload",
            "{}",
        ])
        .is_err());
    }

    #[tokio::test]
    async fn integrity_check_tells_source_edits_from_binary_swaps() {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("tool-orch-verify-cli-{stamp}"));
        let mut cfg = Config::default();
        cfg.orchestrator.tools_dir = root.clone();
        let dir = root.join("weather");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("main.go"), "package main").expect("write");
        std::fs::write(dir.join(&cfg.orchestrator.binary_name), b"bin-v1").expect("write");
        let expected = tool_orchestrator::integrity::compute_integrity(
            &dir,
            &cfg.orchestrator.binary_name,
            &cfg.build.source_selector(),
        )
        .await
        .expect("integrity");

        let check = check_integrity(&cfg, "weather", &expected);
        assert!(check.intact && !check.source_tampered);

        std::fs::write(dir.join(&cfg.orchestrator.binary_name), b"bin-v2").expect("write");
        let check = check_integrity(&cfg, "weather", &expected);
        assert!(!check.intact && !check.source_tampered);
        assert_eq!(check.detail.as_deref(), Some("binary changed"));

        std::fs::write(dir.join("main.go"), "package main // edited").expect("write");
        let check = check_integrity(&cfg, "weather", &expected);
        assert!(!check.intact && check.source_tampered);
    }

    #[test]
    fn doctor_report_marks_config_load_failure_as_blocking() {
        let report = build_doctor_report(
            Err("invalid config".to_owned()),
            Path::new("tool-orchestrator.toml"),
            &|_| true,
        );
        assert!(!report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "config.load" && check.status == "fail"));
    }

    #[test]
    fn doctor_report_warns_when_compiler_is_unavailable() {
        let report = build_doctor_report(
            Ok(Config::default()),
            Path::new("tool-orchestrator.toml"),
            &|_| false,
        );
        assert!(report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "build.compiler" && check.status == "warn"));
    }

    #[test]
    fn command_lookup_rejects_empty_and_missing_programs() {
        assert!(!command_available(""));
        assert!(!command_available("definitely-not-a-real-compiler-7f3a"));
        #[cfg(unix)]
        assert!(command_available("sh"));
    }
}
