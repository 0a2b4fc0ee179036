//! Backhaul CLI - client-side dispatcher for reverse tunnels
//!
//! Validates configuration, shows how descriptors resolve, and runs a
//! loopback mode where local listeners stand in for the relay server.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use backhaul_client::{
    ControlMessage, Dispatcher, Protocol, RelayConfig, TargetResolver, TcpTargets,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul - route tunneled streams to local backends
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Backhaul - route tunneled streams to local backends")]
#[command(version)]
#[command(long_version = concat!(env!("CARGO_PKG_VERSION"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "BACKHAUL_CONFIG", default_value = "backhaul.yaml", global = true)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log filter (overrides --verbose), e.g. "backhaul_client=trace"
    #[arg(long, env = "BACKHAUL_LOG", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bind a listener for every tunnel with an `addr` and dispatch accepted
    /// connections as tunneled streams (default)
    Run,

    /// Validate the configuration and print the target tables
    Check,

    /// Show where each relay would send a forwarding descriptor
    #[command(long_about = r#"
Show where each relay would send a forwarding descriptor.

EXAMPLES:
  backhaul --config backhaul.yaml resolve app.example.com:80
  backhaul --config backhaul.yaml resolve 0.0.0.0:2222
    "#)]
    Resolve {
        /// Forwarding descriptor: host:port, port or host
        descriptor: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool, log_level: Option<&str>) {
    let log_level = log_level.unwrap_or(if verbose { "debug" } else { "info" });

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    RelayConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn describe_resolver(label: &str, resolver: &TargetResolver) {
    match resolver.default_target() {
        Some(default) => println!("{}: default {}", label, default),
        None => println!("{}: no default", label),
    }
    for (selector, target) in resolver.routes() {
        println!("  {:<28} -> {}", selector, target);
    }
}

fn check(config: &RelayConfig) -> Result<()> {
    let dispatcher = config.build_dispatcher(None)?;

    if let Some(resolver) = dispatcher.http_resolver() {
        describe_resolver("http", resolver);
    }
    if let Some(resolver) = dispatcher.ws_resolver() {
        describe_resolver("ws", resolver);
    }
    if let Some(targets) = dispatcher.tcp_targets() {
        println!("tcp:");
        for (selector, address) in targets.routes() {
            println!("  {:<28} -> {}", selector, address);
        }
    }

    if !config.tunnels.is_empty() {
        println!("tunnels:");
        for (name, tunnel) in &config.tunnels {
            println!(
                "  {:<12} proto={} host={} addr={}",
                name,
                tunnel.protocol,
                tunnel.host.as_deref().unwrap_or("-"),
                tunnel.addr.as_deref().unwrap_or("-"),
            );
        }
    }

    println!("Configuration OK");
    Ok(())
}

fn resolve(config: &RelayConfig, descriptor: &str) -> Result<()> {
    let dispatcher = config.build_dispatcher(None)?;

    for (label, resolver) in [
        ("http", dispatcher.http_resolver()),
        ("ws", dispatcher.ws_resolver()),
    ] {
        match resolver.map(|r| r.resolve(descriptor)) {
            None => println!("{:<5} not configured", label),
            Some(None) => println!("{:<5} no target", label),
            Some(Some(resolution)) => println!(
                "{:<5} {} (matched by {:?})",
                label, resolution.target, resolution.matched_by
            ),
        }
    }

    let selector = TcpTargets::selector_for(descriptor);
    match dispatcher.tcp_targets() {
        None => println!("{:<5} not configured", "tcp"),
        Some(targets) => match targets.lookup(selector) {
            Some(address) => println!("{:<5} {} (selector {:?})", "tcp", address, selector),
            None => println!("{:<5} no target for selector {:?}", "tcp", selector),
        },
    }
    Ok(())
}

/// Accept connections and dispatch each one as a tunneled stream
async fn accept_loop(
    listener: TcpListener,
    dispatcher: Dispatcher,
    protocol: Option<Protocol>,
    descriptor: String,
    stream_ids: Arc<AtomicU32>,
) -> Result<()> {
    loop {
        let (socket, peer) = listener.accept().await.context("Failed to accept connection")?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let stream_id = stream_ids.fetch_add(1, Ordering::Relaxed);
        debug!(stream_id, %peer, "Accepted connection");

        dispatcher.dispatch(
            socket,
            ControlMessage {
                stream_id,
                protocol,
                forwarded_by: descriptor.clone(),
            },
        );
    }
}

async fn run(config: RelayConfig) -> Result<()> {
    let dispatcher = config
        .build_dispatcher(None)
        .context("Failed to build dispatcher")?;
    let stream_ids = Arc::new(AtomicU32::new(1));
    let mut tasks = JoinSet::new();

    for (name, tunnel) in &config.tunnels {
        let Some(addr) = tunnel.addr.as_deref() else {
            warn!("Tunnel {} has no addr, skipping", name);
            continue;
        };

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {} for tunnel {}", addr, name))?;
        let local = listener.local_addr()?;

        // TCP streams are declared; HTTP streams are classified from the request head
        let (protocol, descriptor) = match tunnel.protocol {
            Protocol::Tcp => (Some(Protocol::Tcp), local.to_string()),
            Protocol::Http | Protocol::Ws => {
                let host = tunnel.host.as_deref().unwrap_or("localhost");
                (None, format!("{}:{}", host, local.port()))
            }
        };

        info!(
            "Tunnel {} ({}) listening on {} as {}",
            name, tunnel.protocol, local, descriptor
        );
        tasks.spawn(accept_loop(
            listener,
            dispatcher.clone(),
            protocol,
            descriptor,
            stream_ids.clone(),
        ));
    }

    if tasks.is_empty() {
        bail!("No tunnel declares an addr to listen on");
    }

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(Ok(())) => info!("Listener stopped"),
                Ok(Err(e)) => {
                    error!("Listener error: {:#}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Listener task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    tasks.shutdown().await;
    info!("Backhaul stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose, cli.log_level.as_deref());

    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Backhaul starting with {}", cli.config.display());
            run(config).await
        }
        Commands::Check => check(&config),
        Commands::Resolve { descriptor } => resolve(&config, &descriptor),
    }
}
