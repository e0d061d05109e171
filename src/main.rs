mod artifacts;
mod collectors;
mod config;
mod engine;
mod guests;
mod housekeeping;
mod http;
mod metrics;
mod session;

use artifacts::ArtifactKind;
use axum::serve;
use clap::{Args, Parser, Subcommand, ValueEnum};
use collectors::inventory::GuestKind;
use config::Config;
use engine::Engine;
use guests::GuestAction;
use housekeeping::PowerAction;
use metrics::Metrics;
use serde::Serialize;
use serde_json::{json, Value};
use session::ssh::SshConnector;
use session::HostCredential;
use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pvewatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
struct HostArg {
    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot of host metrics.
    Status(HostArg),
    Vms(HostArg),
    Containers(HostArg),
    /// ISO images and container templates.
    Templates {
        #[command(subcommand)]
        action: TemplateCommand,
    },
    /// Remove leftover *.tmp files from the dump directory.
    CleanTmp(HostArg),
    /// Vacuum the journal and prune the configured log directories.
    CleanLogs {
        #[command(flatten)]
        target: HostArg,
        #[arg(long, conflicts_with = "full_journal")]
        journal_days: Option<u32>,
        #[arg(long)]
        full_journal: bool,
    },
    Power {
        #[command(flatten)]
        target: HostArg,
        #[arg(value_enum)]
        action: PowerArg,
    },
    /// Start, stop or reboot a VM or container.
    Guest {
        #[command(flatten)]
        target: HostArg,
        #[arg(long)]
        kind: GuestKind,
        vmid: String,
        #[arg(value_enum)]
        action: GuestActionArg,
    },
    /// Take a snapshot of a VM or container; named auto-<unix time> by default.
    Snapshot {
        #[command(flatten)]
        target: HostArg,
        #[arg(long)]
        kind: GuestKind,
        vmid: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Serve /healthz, /metrics and the read-only /api/hosts endpoints.
    Serve,
}

#[derive(Subcommand, Debug)]
enum TemplateCommand {
    List(HostArg),
    Upload {
        #[command(flatten)]
        target: HostArg,
        #[arg(long)]
        kind: ArtifactKind,
        local: PathBuf,
        /// Remote file name; the local file name by default.
        #[arg(long)]
        filename: Option<String>,
    },
    Download {
        #[command(flatten)]
        target: HostArg,
        #[arg(long)]
        kind: ArtifactKind,
        filename: String,
        local: PathBuf,
    },
    Delete {
        #[command(flatten)]
        target: HostArg,
        #[arg(long)]
        kind: ArtifactKind,
        filename: String,
    },
    Fetch {
        #[command(flatten)]
        target: HostArg,
        #[arg(long)]
        kind: ArtifactKind,
        url: String,
        filename: String,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PowerArg {
    Reboot,
    Shutdown,
}

impl From<PowerArg> for PowerAction {
    fn from(value: PowerArg) -> Self {
        match value {
            PowerArg::Reboot => PowerAction::Reboot,
            PowerArg::Shutdown => PowerAction::Shutdown,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum GuestActionArg {
    Start,
    Stop,
    Reboot,
}

impl From<GuestActionArg> for GuestAction {
    fn from(value: GuestActionArg) -> Self {
        match value {
            GuestActionArg::Start => GuestAction::Start,
            GuestActionArg::Stop => GuestAction::Stop,
            GuestActionArg::Reboot => GuestAction::Reboot,
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }
    let Some(command) = cli.command else {
        error!("не указана команда, см. --help");
        std::process::exit(2);
    };

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };
    let engine = match build_engine(&cfg) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, "некорректные таймауты");
            std::process::exit(1);
        }
    };

    if let Command::Serve = command {
        if let Err(err) = run_server(&cfg, engine).await {
            error!(error = %err, "ошибка HTTP-сервера");
            std::process::exit(1);
        }
        return;
    }

    let (output, ok) = match run_command(&cfg, &engine, command).await {
        Ok(result) => result,
        Err(message) => (json!({ "ok": false, "error": message }), false),
    };
    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{text}"),
        Err(err) => error!(error = %err, "не удалось сериализовать результат"),
    }
    if !ok {
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_engine(cfg: &Config) -> Result<Engine, config::ConfigError> {
    Ok(Engine::new(
        Arc::new(SshConnector),
        cfg.connect_timeout()?,
        cfg.status_timeout()?,
    ))
}

fn resolve_host(cfg: &Config, target: &HostArg) -> Result<HostCredential, String> {
    let host = cfg.find_host(target.host.as_deref()).ok_or_else(|| {
        format!(
            "хост '{}' не найден в конфигурации",
            target.host.as_deref().unwrap_or_default()
        )
    })?;
    host.credential().map_err(|err| err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn done<E: Display>(result: Result<(), E>) -> (Value, bool) {
    match result {
        Ok(()) => (json!({ "ok": true }), true),
        Err(err) => (json!({ "ok": false, "error": err.to_string() }), false),
    }
}

fn listed<T: Serialize, E: Display>(result: Result<T, E>) -> (Value, bool) {
    match result {
        Ok(value) => (to_json(&value), true),
        Err(err) => (json!({ "ok": false, "error": err.to_string() }), false),
    }
}

async fn run_command(
    cfg: &Config,
    engine: &Engine,
    command: Command,
) -> Result<(Value, bool), String> {
    let result = match command {
        Command::Status(target) => {
            let snapshot = engine.status(resolve_host(cfg, &target)?).await;
            let online = snapshot.online;
            (to_json(&snapshot), online)
        }
        Command::Vms(target) => listed(
            engine
                .inventory(resolve_host(cfg, &target)?, GuestKind::Vm)
                .await,
        ),
        Command::Containers(target) => listed(
            engine
                .inventory(resolve_host(cfg, &target)?, GuestKind::Container)
                .await,
        ),
        Command::Templates { action } => run_templates(cfg, engine, action).await?,
        Command::CleanTmp(target) => {
            let outcome = engine.clean_temp(resolve_host(cfg, &target)?).await;
            let ok = outcome.error.is_none();
            (to_json(&outcome), ok)
        }
        Command::CleanLogs {
            target,
            journal_days,
            full_journal,
        } => {
            let days = if full_journal {
                None
            } else {
                journal_days.or(cfg.housekeeping.journal_days)
            };
            listed(
                engine
                    .clean_logs(
                        resolve_host(cfg, &target)?,
                        days,
                        cfg.housekeeping.log_dirs.clone(),
                    )
                    .await,
            )
        }
        Command::Power { target, action } => done(
            engine
                .power(resolve_host(cfg, &target)?, action.into())
                .await,
        ),
        Command::Guest {
            target,
            kind,
            vmid,
            action,
        } => done(
            engine
                .guest_action(resolve_host(cfg, &target)?, kind, vmid, action.into())
                .await,
        ),
        Command::Snapshot {
            target,
            kind,
            vmid,
            name,
        } => match engine
            .snapshot(resolve_host(cfg, &target)?, kind, vmid, name)
            .await
        {
            Ok(snapshot) => (json!({ "ok": true, "snapshot": snapshot }), true),
            Err(err) => (json!({ "ok": false, "error": err.to_string() }), false),
        },
        Command::Serve => return Err("serve обрабатывается отдельно".to_string()),
    };
    Ok(result)
}

async fn run_templates(
    cfg: &Config,
    engine: &Engine,
    action: TemplateCommand,
) -> Result<(Value, bool), String> {
    let result = match action {
        TemplateCommand::List(target) => {
            let templates = engine.templates(resolve_host(cfg, &target)?).await;
            (to_json(&templates), true)
        }
        TemplateCommand::Upload {
            target,
            kind,
            local,
            filename,
        } => {
            let filename = match filename {
                Some(name) => name,
                None => local
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| format!("не удалось определить имя файла {}", local.display()))?,
            };
            done(
                engine
                    .upload(resolve_host(cfg, &target)?, local, filename, kind)
                    .await,
            )
        }
        TemplateCommand::Download {
            target,
            kind,
            filename,
            local,
        } => done(
            engine
                .download(resolve_host(cfg, &target)?, filename, kind, local)
                .await,
        ),
        TemplateCommand::Delete {
            target,
            kind,
            filename,
        } => done(
            engine
                .delete(resolve_host(cfg, &target)?, filename, kind)
                .await,
        ),
        TemplateCommand::Fetch {
            target,
            kind,
            url,
            filename,
        } => done(
            engine
                .fetch_from_url(resolve_host(cfg, &target)?, url, filename, kind)
                .await,
        ),
    };
    Ok(result)
}

async fn run_server(cfg: &Config, engine: Engine) -> Result<(), String> {
    let mut hosts = HashMap::new();
    for host in &cfg.hosts {
        let credential = host.credential().map_err(|err| err.to_string())?;
        hosts.insert(host.name.clone(), credential);
    }
    let metrics = Metrics::new().map_err(|err| format!("инициализация метрик: {err}"))?;
    let app = http::build_router(metrics, engine, Arc::new(hosts));

    let addr: SocketAddr = cfg
        .listen
        .parse()
        .map_err(|err| format!("некорректный адрес listen {}: {err}", cfg.listen))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| format!("не удалось запустить HTTP-сервер: {err}"))?;
    info!(listen = %addr, hosts = cfg.hosts.len(), "HTTP-сервер запущен");

    serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "не удалось дождаться Ctrl+C");
            }
            info!("получен Ctrl+C, выполняется остановка");
        })
        .await
        .map_err(|err| err.to_string())
}
