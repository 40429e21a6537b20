//! nestmail command-line entry point
//!
//! `start`/`stop` manage the worker tree; `import`, `config`, `encrypt`,
//! `websocket` and `notifications` talk to a running app worker or the
//! local configuration. The hidden `worker` subcommand is how the
//! supervisor launches peer processes from this same binary.
//!
//! # Environment Variables
//!
//! - `NESTMAIL_HOME`: work directory override
//! - `NESTMAIL_PROFILE`: profile name (default `default`)
//! - `NESTMAIL_SHARED`: shared data directory override

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tracing::error;
use tracing_subscriber::EnvFilter;

use nestmail::config::store::{Config, ConfigValue};
use nestmail::errors::{ApiError, AppResult};
use nestmail::rpc::client::{RpcClient, WsBridge};
use nestmail::workers;

#[derive(Parser)]
#[command(name = "nestmail", version, about = "Privacy-focused personal mail indexer")]
struct Cli {
    /// Work directory (defaults to NESTMAIL_HOME or the platform data dir)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker backend
    Start {
        /// Run in the foreground instead of detaching
        #[arg(long)]
        wait: bool,
    },
    /// Stop a running backend
    Stop,
    /// Connect the terminal UI (external frontend)
    Tui,
    /// Index a local mailbox (maildir, mbox, wervd, mailzip)
    Import {
        path: PathBuf,
        /// Initial tags for imported messages
        #[arg(long, short)]
        tag: Vec<String>,
    },
    /// Read or write configuration values
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Turn on encryption for this profile
    Encrypt,
    /// Stream raw RPC frames over the app worker's WebSocket
    Websocket { url: Option<String> },
    /// Print server-pushed notifications as they arrive
    Notifications { url: Option<String> },
    /// Run one worker process (used by the supervisor)
    #[command(hide = true)]
    Worker {
        kind: String,
        #[arg(long, default_value = "0")]
        port: u16,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { section: String, option: String },
    Set {
        section: String,
        option: String,
        value: String,
    },
}

/// Resolve the profile work directory
fn work_dir(cli_override: Option<PathBuf>) -> AppResult<PathBuf> {
    if let Some(dir) = cli_override {
        return Ok(dir);
    }
    if let Ok(home) = std::env::var("NESTMAIL_HOME") {
        return Ok(PathBuf::from(home));
    }
    let profile = std::env::var("NESTMAIL_PROFILE").unwrap_or_else(|_| "default".to_owned());
    let base = std::env::var("NESTMAIL_SHARED")
        .map(PathBuf::from)
        .or_else(|_| {
            std::env::var("HOME").map(|home| PathBuf::from(home).join(".local/share/nestmail"))
        })
        .map_err(|_| ApiError::invalid("cannot locate a home directory"))?;
    Ok(base.join(profile))
}

/// Worker processes log to rotated files; CLI commands log to stderr
fn init_logging(worker: Option<&str>, profile_dir: &PathBuf) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    match worker {
        Some(name) => {
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(name)
                .max_log_files(7)
                .build(profile_dir.join("logs"))
                .ok()?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

/// Client for the running app worker; error if none is published
async fn app_client(profile_dir: &PathBuf) -> AppResult<RpcClient> {
    let client = workers::worker_client(profile_dir, "app").await?;
    if !client.ping().await {
        return Err(ApiError::Network(
            "the app worker is not responding".to_owned(),
        ));
    }
    Ok(client)
}

/// Read a passphrase from the environment or standard input
async fn read_passphrase() -> AppResult<String> {
    if let Ok(passphrase) = std::env::var("NESTMAIL_PASSPHRASE") {
        return Ok(passphrase);
    }
    eprint!("Passphrase: ");
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

async fn cmd_start(profile_dir: &PathBuf, wait: bool) -> AppResult<()> {
    if app_client(profile_dir).await.is_ok() {
        println!("Already running.");
        return Ok(());
    }
    if wait {
        return workers::app::run(profile_dir, 0, true).await;
    }

    let exe = std::env::current_exe()?;
    std::process::Command::new(exe)
        .arg("worker")
        .arg("app")
        .arg("--work-dir")
        .arg(profile_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| ApiError::internal(format!("cannot spawn backend: {e}")))?;

    // Give the backend a moment to publish itself
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if app_client(profile_dir).await.is_ok() {
            println!("Started.");
            return Ok(());
        }
    }
    Err(ApiError::Timeout("backend did not come up".to_owned()))
}

async fn cmd_import(profile_dir: &PathBuf, path: &PathBuf, tags: &[String]) -> AppResult<()> {
    let client = app_client(profile_dir).await?;
    let path = std::fs::canonicalize(path)?;
    let request = json!({
        "search": path.display().to_string(),
        "tags": tags,
    });
    let reply = match client.call("add_to_index", &request).await {
        Err(ApiError::Denied { kind, .. }) if kind == "need-passphrase" => {
            let passphrase = read_passphrase().await?;
            client
                .call("unlock", &json!({ "passphrase": passphrase }))
                .await?;
            client.call("add_to_index", &request).await?
        }
        other => other?,
    };
    println!(
        "Indexed {} messages.",
        reply.get("indexed").and_then(serde_json::Value::as_u64).unwrap_or(0)
    );
    Ok(())
}

async fn cmd_config(profile_dir: &PathBuf, action: &ConfigAction) -> AppResult<()> {
    let config = Config::open(profile_dir)?;
    match action {
        ConfigAction::Get { section, option } => {
            let value = config.read(|store| {
                store
                    .get(section, option)
                    .map(|v| v.map(|v| match v {
                        ConfigValue::Text(t) => t,
                        ConfigValue::Bytes(b) => format!("<{} bytes>", b.len()),
                        ConfigValue::Json(j) => j.to_string(),
                    }))
            })?;
            if let Some(value) = value {
                println!("{value}");
            }
            Ok(())
        }
        ConfigAction::Set {
            section,
            option,
            value,
        } => config.with(|store| {
            store.set(section, option, ConfigValue::Text(value.clone()))
        }),
    }
}

async fn cmd_encrypt(profile_dir: &PathBuf) -> AppResult<()> {
    let passphrase = read_passphrase().await?;
    let config = Config::open(profile_dir)?;
    config.with(|store| {
        store.provide_passphrase(&passphrase)?;
        if !store.has_crypto_enabled() {
            store.generate_master_key("")?;
        }
        Ok(())
    })?;
    println!("Encryption enabled.");
    Ok(())
}

async fn stream_websocket(
    profile_dir: &PathBuf,
    url: Option<String>,
    notifications_only: bool,
) -> AppResult<()> {
    let url = match url {
        Some(url) => url,
        None => app_client(profile_dir).await?.websocket_url(),
    };
    let mut bridge = WsBridge::spawn(url);

    let sender = bridge.sender.clone();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if sender.send(line).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = bridge.receiver.recv().await {
        if notifications_only {
            let is_notification = serde_json::from_str::<serde_json::Value>(&frame)
                .ok()
                .and_then(|v| {
                    v.get("prototype")
                        .and_then(serde_json::Value::as_str)
                        .map(|p| p == "notification")
                })
                .unwrap_or(false);
            if !is_notification {
                continue;
            }
        }
        println!("{frame}");
    }
    Ok(())
}

async fn run_worker(profile_dir: &PathBuf, kind: &str, port: u16) -> AppResult<()> {
    match kind {
        "app" => workers::app::run(profile_dir, port, true).await,
        "openpgp" => workers::openpgp::run(profile_dir, port).await,
        "recovery" => workers::recovery::run(profile_dir, port).await,
        "smtp_bridge" => workers::smtp_bridge::run(profile_dir, port).await,
        other => Err(ApiError::invalid(format!("unknown worker kind '{other}'"))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let profile_dir = match work_dir(cli.work_dir.clone()) {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let worker_name = match &cli.command {
        Command::Worker { kind, .. } => Some(kind.clone()),
        _ => None,
    };
    let _log_guard = init_logging(worker_name.as_deref(), &profile_dir);

    let result = match &cli.command {
        Command::Start { wait } => cmd_start(&profile_dir, *wait).await,
        Command::Stop => match workers::stop_worker(&profile_dir, "app").await {
            Ok(true) => {
                println!("Stopped.");
                Ok(())
            }
            Ok(false) => {
                println!("Not running.");
                Ok(())
            }
            Err(err) => Err(err),
        },
        Command::Tui => match app_client(&profile_dir).await {
            Ok(client) => {
                // The terminal UI is an external frontend; hand it the
                // connection point
                println!("{}", client.websocket_url());
                Ok(())
            }
            Err(err) => Err(err),
        },
        Command::Import { path, tag } => cmd_import(&profile_dir, path, tag).await,
        Command::Config { action } => cmd_config(&profile_dir, action).await,
        Command::Encrypt => cmd_encrypt(&profile_dir).await,
        Command::Websocket { url } => {
            stream_websocket(&profile_dir, url.clone(), false).await
        }
        Command::Notifications { url } => {
            stream_websocket(&profile_dir, url.clone(), true).await
        }
        Command::Worker { kind, port } => run_worker(&profile_dir, kind, *port).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
