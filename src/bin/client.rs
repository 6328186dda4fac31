//! httptun client
//!
//! Listens locally and carries every accepted connection through its own
//! tunnel to the server.

use anyhow::{Context, Result};
use clap::Parser;
use httptun::{
    config::{generate_example_config, ClientConfig, Config, LoggingConfig},
    tunnel::relay,
    Client,
};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// httptun client - duplex tunnels disguised as ordinary web traffic
#[derive(Parser, Debug)]
#[command(name = "httptun-client")]
#[command(about = "httptun client - duplex tunnels disguised as ordinary web traffic")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG and config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

fn init_logging(cli_level: Option<&str>, logging: &LoggingConfig) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level)),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example configuration")?;
        println!("{}", example);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(args.log_level.as_deref(), &config.logging);

    let mut client_config: ClientConfig = config.client.clone().unwrap_or_default();
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(listen) = args.listen {
        client_config.listen = listen;
    }
    client_config.validate()?;

    let client = Client::from_config(&client_config, &config.camouflage)
        .context("Failed to set up client")?;

    info!("httptun client v{}", httptun::VERSION);
    info!(
        "Tunnelling {} to {}{}",
        client_config.listen,
        client_config.server,
        if client_config.tls { " over TLS" } else { "" }
    );

    let listener = TcpListener::bind(&client_config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", client_config.listen))?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let client = client.clone();
                    tokio::spawn(async move { handle_local(client, stream, peer).await });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_local(client: Client, mut local: TcpStream, peer: SocketAddr) {
    local.set_nodelay(true).ok();

    let mut tunnel = match client.dial().await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!("Dial for {} failed: {}", peer, e);
            return;
        }
    };

    debug!("Tunnel open for {}", peer);
    match relay(&mut local, &mut tunnel).await {
        Ok((up, down)) => info!("Connection from {} closed ({} up, {} down)", peer, up, down),
        Err(e) => debug!("Connection from {} ended: {}", peer, e),
    }
    tunnel.close().await.ok();
}
