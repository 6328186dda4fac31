//! httptun server
//!
//! Answers ordinary web requests with decoy content and relays every paired
//! tunnel to a fixed target TCP address.

use anyhow::{Context, Result};
use clap::Parser;
use httptun::{
    config::{generate_example_config, Config, LoggingConfig, ServerConfig},
    server::{FixedPage, StaticSite},
    transport::{Acceptor, TcpDialer, TransportConfig},
    tunnel::relay,
    DuplexConn, Server, ServerOptions,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// httptun server - duplex tunnels disguised as ordinary web traffic
#[derive(Parser, Debug)]
#[command(name = "httptun-server")]
#[command(about = "httptun server - duplex tunnels disguised as ordinary web traffic")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Relay target address (overrides config)
    #[arg(short, long)]
    target: Option<String>,

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

    let mut server_config = config.server.clone().unwrap_or_default();
    if let Some(listen) = args.listen {
        server_config.listen = listen;
    }
    if let Some(target) = args.target {
        server_config.target = target;
    }
    server_config.validate()?;

    info!("httptun server v{}", httptun::VERSION);
    info!("Relaying tunnels to {}", server_config.target);

    let mut options = ServerOptions::new(config.camouflage.clone(), server_config.token_ttl())
        .with_sweep_interval(server_config.sweep_interval())
        .with_acceptor(build_acceptor(&server_config)?);
    options = match &server_config.decoy_dir {
        Some(dir) => {
            info!("Serving decoy content from {}", dir);
            options.with_decoy(StaticSite::new(dir))
        }
        None => options.with_decoy(FixedPage::welcome()),
    };

    let server = Server::bind(&server_config.listen, options)
        .await
        .with_context(|| format!("Failed to listen on {}", server_config.listen))?;

    let limit = Arc::new(Semaphore::new(server_config.max_connections));
    let dialer = TcpDialer::new(TransportConfig::default());
    let target = Arc::new(server_config.target);

    loop {
        tokio::select! {
            accepted = server.accept() => {
                let mut tunnel = match accepted {
                    Ok(tunnel) => tunnel,
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        break;
                    }
                };
                let permit = match Arc::clone(&limit).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Connection limit reached, dropping tunnel from {}", tunnel.peer());
                        tunnel.close().await.ok();
                        continue;
                    }
                };

                let dialer = dialer.clone();
                let target = Arc::clone(&target);
                tokio::spawn(async move {
                    let _permit = permit;
                    handle_tunnel(tunnel, &dialer, &target).await;
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                server.close().ok();
                break;
            }
        }
    }

    Ok(())
}

#[cfg(feature = "tls")]
fn build_acceptor(config: &ServerConfig) -> Result<Acceptor> {
    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let acceptor = httptun::transport::build_acceptor(cert, key)
                .context("Failed to load TLS certificate")?;
            info!("TLS enabled");
            Ok(Acceptor::Tls(acceptor))
        }
        _ => Ok(Acceptor::Plain),
    }
}

#[cfg(not(feature = "tls"))]
fn build_acceptor(config: &ServerConfig) -> Result<Acceptor> {
    if config.tls_cert.is_some() {
        anyhow::bail!("tls_cert is set but this build has no TLS support");
    }
    Ok(Acceptor::Plain)
}

async fn handle_tunnel(mut tunnel: DuplexConn, dialer: &TcpDialer, target: &str) {
    let peer = tunnel.peer();
    let mut upstream = match dialer.connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Tunnel from {}: cannot reach {}: {}", peer, target, e);
            tunnel.close().await.ok();
            return;
        }
    };

    info!("Tunnel from {} relaying to {}", peer, target);
    match relay(&mut tunnel, &mut upstream).await {
        Ok((up, down)) => info!("Tunnel from {} closed ({} up, {} down)", peer, up, down),
        Err(e) => debug!("Tunnel from {} ended: {}", peer, e),
    }
    tunnel.close().await.ok();
}
