//! relayd - producer/consumer relay daemon
//!
//! Usage:
//!   relayd inbound                     # producer-facing relay (default port 7000)
//!   relayd outbound --peer-port 7000   # consumer-facing relay (default port 6000)

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use relayd_core::outbound::wait_disconnected;
use relayd_core::{
    default_relay_home, InboundServer, MirroredState, OutboundServer, RelayBridge, RelayConfig,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relayd")]
#[command(about = "Relay producer messages to subscribed consumers")]
#[command(version)]
struct Cli {
    /// Config file (default: $RELAYD_HOME/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, fatal, silent)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept producers and serve snapshots to the outbound relay
    Inbound {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Poll the inbound relay and fan batches out to consumers
    Outbound {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Inbound relay host
        #[arg(long)]
        peer_host: Option<String>,
        /// Inbound relay port
        #[arg(long)]
        peer_port: Option<u16>,
    },
}

impl Command {
    /// Process role, used to label log files and panics
    fn role(&self) -> &'static str {
        match self {
            Command::Inbound { .. } => "inbound",
            Command::Outbound { .. } => "outbound",
        }
    }
}

/// Map relayd level names onto `EnvFilter` directives
fn level_directive(level: &str) -> &str {
    match level {
        "silent" => "off",
        "fatal" => "error",
        other => other,
    }
}

/// `--log-level` wins, then `RUST_LOG`, then `RELAYD_LOG_LEVEL`; `info` otherwise
fn log_filter(cli_level: Option<&str>) -> tracing_subscriber::EnvFilter {
    let level = match cli_level {
        Some(level) => level_directive(level).to_string(),
        None => std::env::var("RUST_LOG")
            .or_else(|_| std::env::var("RELAYD_LOG_LEVEL").map(|v| level_directive(&v).to_string()))
            .unwrap_or_else(|_| "info".to_string()),
    };

    tracing_subscriber::EnvFilter::try_new(&level).unwrap_or_else(|e| {
        eprintln!("Invalid log level {:?} ({}), falling back to warn", level, e);
        tracing_subscriber::EnvFilter::new("warn")
    })
}

async fn run_inbound(mut config: RelayConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.inbound.host = host;
    }
    if let Some(port) = port {
        config.inbound.port = port;
    }

    let mut server = InboundServer::new(config.inbound.server_options());
    let addr = server.start().await.context("Failed to start inbound relay")?;
    info!(
        addr = %addr,
        producers = %config.inbound.producer_channel,
        peer = %config.inbound.peer_channel,
        "Inbound relay ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down inbound relay");
    server.stop().await;
    Ok(())
}

async fn run_outbound(
    mut config: RelayConfig,
    host: Option<String>,
    port: Option<u16>,
    peer_host: Option<String>,
    peer_port: Option<u16>,
) -> Result<()> {
    let outbound = &mut config.outbound;
    if let Some(host) = host {
        outbound.host = host;
    }
    if let Some(port) = port {
        outbound.port = port;
    }
    if let Some(peer_host) = peer_host {
        outbound.peer_host = peer_host;
    }
    if let Some(peer_port) = peer_port {
        outbound.peer_port = peer_port;
    }

    // The peer must be reachable before consumers are accepted
    let mirror = MirroredState::shared();
    let mut bridge = RelayBridge::new(outbound.bridge_options(), mirror.clone());
    bridge
        .start()
        .await
        .with_context(|| format!("Failed to connect to inbound relay at {}", outbound.peer_url()))?;
    let mut bridge_state = bridge.subscribe();

    let mut server = OutboundServer::new(outbound.server_options(), mirror);
    let addr = server.start().await.context("Failed to start outbound relay")?;
    info!(
        addr = %addr,
        consumers = %outbound.consumer_channel,
        peer = %outbound.peer_url(),
        "Outbound relay ready"
    );

    let lost_peer = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutting down outbound relay");
            false
        }
        _ = wait_disconnected(&mut bridge_state) => {
            warn!("Inbound relay connection lost");
            true
        }
    };

    server.stop().await;
    bridge.stop().await;

    if lost_peer {
        return Err(anyhow!("Inbound relay connection lost"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let role = cli.command.role();

    let home = default_relay_home();
    std::fs::create_dir_all(&home).ok();

    // stderr plus one daily-rotated file per role, so both relays can share RELAYD_HOME
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender =
        tracing_appender::rolling::daily(&log_dir, format!("relayd-{}.log", role));
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter(cli.log_level.as_deref()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(move |info| {
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        let thread = std::thread::current().name().unwrap_or("unnamed").to_string();
        eprintln!("relayd {} panicked at {}: {}", role, location, payload);
        tracing::error!(role, %location, %thread, "Relay panicked: {}", payload);
    }));

    let config_path = cli.config.unwrap_or_else(RelayConfig::default_path);
    let config = RelayConfig::load(&config_path)
        .with_context(|| format!("Failed to load config: {}", config_path.display()))?;

    match cli.command {
        Command::Inbound { host, port } => run_inbound(config, host, port).await,
        Command::Outbound {
            host,
            port,
            peer_host,
            peer_port,
        } => run_outbound(config, host, port, peer_host, peer_port).await,
    }
}
