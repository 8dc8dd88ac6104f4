#![deny(unsafe_code)]

//! llmlink CLI — runs the bridge and talks to it over local IPC.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use llmlink_config::AppConfig;
use llmlink_core::codec::{IpcKind, IpcMessage, encode_ipc};
use llmlink_core::inference::InferenceAdapter;
use llmlink_core::ipc::{ClientOptions, IpcClient, IpcServer, ServerOptions, discover_port};
use llmlink_core::{Coordinator, HttpInferenceAdapter, StopReason, TunnelClient, TunnelSettings};

/// How long `send` and `status` wait for the bridge to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// llmlink — bridge a local LLM server to the cloud relay.
#[derive(Parser)]
#[command(name = "llmlink", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "llmlink.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge: IPC server, tunnel client and coordinator.
    Run {
        /// Start without connecting the tunnel.
        #[arg(long)]
        no_connect: bool,
    },

    /// Send one IPC message to a running bridge.
    Send {
        /// Message type, e.g. `show_window` or `connect_tunnel`.
        kind: String,

        /// JSON object sent as the message payload.
        #[arg(long)]
        payload: Option<String>,

        /// IPC port; defaults to the port file, then the configured port.
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the tunnel state reported by a running bridge.
    Status {
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print every IPC message broadcast by the bridge.
    Watch {
        #[arg(long)]
        port: Option<u16>,

        /// Role announced to the bridge.
        #[arg(long, default_value = "cli")]
        role: String,
    },

    /// Check the local inference server and list its models.
    Probe,

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Print version and build information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await;

    let fallback = match cli.verbose {
        0 => config
            .as_ref()
            .map(|c| c.logging.level.clone())
            .unwrap_or_else(|_| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();

    if let Commands::Version = cli.command {
        println!("llmlink {}", llmlink_core::build_info::version_string());
        return Ok(());
    }

    let config = config?;
    match cli.command {
        Commands::Run { no_connect } => cmd_run(config, !no_connect).await?,
        Commands::Send {
            kind,
            payload,
            port,
        } => cmd_send(&config, &kind, payload.as_deref(), port).await?,
        Commands::Status { port } => cmd_status(&config, port).await?,
        Commands::Watch { port, role } => cmd_watch(&config, port, &role).await?,
        Commands::Probe => cmd_probe(&config).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
        Commands::Version => {}
    }

    Ok(())
}

async fn cmd_run(config: AppConfig, connect: bool) -> Result<()> {
    info!(
        version = %llmlink_core::build_info::version_string(),
        "Starting llmlink bridge"
    );

    let ipc = IpcServer::start(
        &config.ipc.host,
        config.ipc.port,
        ServerOptions::from_config(&config.ipc),
    )
    .await
    .context("failed to start IPC server")?;
    let ipc = Arc::new(ipc);

    let tokens = llmlink_core::token::from_config(&config.auth);
    let adapter: Arc<dyn InferenceAdapter> =
        Arc::new(HttpInferenceAdapter::from_config(&config.inference)?);
    let tunnel = Arc::new(TunnelClient::spawn(
        TunnelSettings::from_config(&config.tunnel),
        tokens.clone(),
        adapter,
    ));

    let coordinator = Coordinator::new(ipc.clone(), tunnel.clone(), tokens);
    if connect {
        tunnel.connect()?;
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let result = coordinator.run(shutdown).await;

    tunnel.shutdown().await;
    ipc.stop().await;

    match result? {
        StopReason::Quit => info!("Bridge stopped by quit request"),
        StopReason::Shutdown => info!("Bridge stopped"),
    }
    Ok(())
}

async fn cmd_send(
    config: &AppConfig,
    kind: &str,
    payload: Option<&str>,
    port: Option<u16>,
) -> Result<()> {
    let message = build_message(kind, payload)?;
    let client = connect_once(config, port).await?;
    if !client.send(&message).await {
        bail!("failed to send {kind}");
    }

    // Window signals and tunnel commands are acknowledged; quit is not.
    if message.kind != IpcKind::Quit {
        match tokio::time::timeout(REPLY_TIMEOUT, client.next_message()).await {
            Ok(Some(reply)) => println!("{}", render(&reply)?),
            Ok(None) => warn!("Bridge closed the connection"),
            Err(_) => warn!("No reply from bridge"),
        }
    }
    client.disconnect();
    Ok(())
}

async fn cmd_status(config: &AppConfig, port: Option<u16>) -> Result<()> {
    let client = connect_once(config, port).await?;
    if !client.send(&IpcMessage::new(IpcKind::StatusRequest)).await {
        bail!("failed to send status request");
    }
    let reply = tokio::time::timeout(REPLY_TIMEOUT, async {
        while let Some(message) = client.next_message().await {
            if message.kind == IpcKind::ConnectionStatus {
                return Some(message);
            }
        }
        None
    })
    .await
    .map_err(|_| anyhow!("bridge did not answer within {REPLY_TIMEOUT:?}"))?
    .ok_or_else(|| anyhow!("bridge closed the connection"))?;

    let state = reply.payload_str("state").unwrap_or("unknown");
    match reply.payload_str("detail") {
        Some(detail) => println!("tunnel: {state} ({detail})"),
        None => println!("tunnel: {state}"),
    }
    client.disconnect();
    Ok(())
}

async fn cmd_watch(config: &AppConfig, port: Option<u16>, role: &str) -> Result<()> {
    let port = resolve_port(config, port).await;
    let client = IpcClient::new(ClientOptions::from_config(&config.ipc));
    if !client.connect(&config.ipc.host, port).await {
        warn!(port, "Bridge not reachable yet, retrying in the background");
    }

    let watch = async {
        loop {
            if client.wait_connected(Duration::from_secs(3600)).await {
                client.send(&IpcMessage::register(role)).await;
            }
            while let Some(message) = client.next_message().await {
                println!("{}", render(&message)?);
            }
            info!("Connection to bridge lost");
        }
        #[allow(unreachable_code)]
        Ok::<(), anyhow::Error>(())
    };
    tokio::select! {
        r = watch => r?,
        _ = tokio::signal::ctrl_c() => {}
    }
    client.disconnect();
    Ok(())
}

async fn cmd_probe(config: &AppConfig) -> Result<()> {
    let adapter = HttpInferenceAdapter::from_config(&config.inference)?;
    let status = adapter
        .probe()
        .await
        .with_context(|| format!("probing {}", adapter.base_url()))?;
    println!("{} (version {})", adapter.base_url(), status.version);
    if status.models.is_empty() {
        println!("  no models installed");
    }
    for model in &status.models {
        println!("  {model}");
    }
    Ok(())
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).map_err(|e| anyhow!("TOML error: {e}"))?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

async fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        AppConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(AppConfig::default())
    }
}

/// Explicit port, then the port file, then the configured port.
async fn resolve_port(config: &AppConfig, explicit: Option<u16>) -> u16 {
    if let Some(port) = explicit {
        return port;
    }
    if let Some(path) = &config.ipc.port_file {
        match discover_port(path).await {
            Ok(port) => return port,
            Err(e) => warn!(error = %e, "Falling back to configured IPC port"),
        }
    }
    config.ipc.port
}

async fn connect_once(config: &AppConfig, port: Option<u16>) -> Result<IpcClient> {
    let port = resolve_port(config, port).await;
    let client = IpcClient::new(ClientOptions::one_shot());
    if !client.connect(&config.ipc.host, port).await {
        bail!(
            "cannot reach llmlink bridge at {}:{port}; is `llmlink run` active?",
            config.ipc.host
        );
    }
    Ok(client)
}

fn build_message(kind: &str, payload: Option<&str>) -> Result<IpcMessage> {
    let kind: IpcKind = kind.parse()?;
    let message = match payload {
        None => IpcMessage::new(kind),
        Some(payload) => match serde_json::from_str(payload).context("payload is not JSON")? {
            serde_json::Value::Object(map) => IpcMessage::with_payload(kind, map),
            other => bail!("payload must be a JSON object, got {other}"),
        },
    };
    encode_ipc(&message).with_context(|| format!("invalid {kind} message"))?;
    Ok(message)
}

/// The message exactly as it travels on the wire, without the newline.
fn render(message: &IpcMessage) -> Result<String> {
    Ok(encode_ipc(message)?.trim_end().to_string())
}
