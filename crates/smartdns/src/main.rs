//! SmartDNS
//!
//! A small, fast, file-driven authoritative DNS server: JSON zone files,
//! hot reload gated on zone serials, dual positive/negative caching, and
//! optional iterative resolution via the root servers for names outside
//! every local authority.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use smartdns_cache::ResponseCache;
use smartdns_metrics::tracing_setup::{init_tracing, parse_log_level, LogFormat};
use smartdns_resolver::IterativeResolver;
use smartdns_server::{QueryEngine, ReloadCoordinator, TcpServer, UdpServer};
use smartdns_zone::{load_dir, ZoneStore};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long in-flight handlers get to finish after shutdown is signaled.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// SmartDNS - file-driven authoritative DNS server
#[derive(Parser, Debug)]
#[command(name = "smartdns", version, about, long_about = None)]
struct Cli {
    /// UDP listen address
    #[arg(long, env = "SMARTDNS_LISTEN_UDP", default_value = ":53", value_name = "ADDR")]
    listen_udp: String,

    /// TCP listen address
    #[arg(long, env = "SMARTDNS_LISTEN_TCP", default_value = ":53", value_name = "ADDR")]
    listen_tcp: String,

    /// Directory holding .dns zone files
    #[arg(long, env = "SMARTDNS_ZONES_DIR", default_value = "./dns", value_name = "DIR")]
    zones_dir: PathBuf,

    /// Response cache capacity (positive entries)
    #[arg(long, env = "SMARTDNS_CACHE_SIZE", default_value_t = 100_000, value_name = "N")]
    cache_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SMARTDNS_LOG_LEVEL", default_value = "info", value_name = "LEVEL")]
    log_level: String,

    /// Metrics listen address
    #[arg(long, env = "SMARTDNS_METRICS", default_value = ":9090", value_name = "ADDR")]
    metrics: String,

    /// Health listen address
    #[arg(long, env = "SMARTDNS_HEALTH", default_value = ":8080", value_name = "ADDR")]
    health: String,

    /// Enable iterative resolution via the root servers for names outside
    /// every local zone
    #[arg(long, env = "SMARTDNS_RESOLVER")]
    resolver: bool,
}

/// Accepts the bare `:PORT` form alongside full socket addresses.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr}"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(parse_log_level(&cli.log_level), LogFormat::Text);

    if let Err(e) = run(cli).await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Startup fails hard when no zone loads at all; individual bad files
    // are skipped by the loader.
    let zones = load_dir(&cli.zones_dir)
        .with_context(|| format!("loading zones from {}", cli.zones_dir.display()))?;
    let store = Arc::new(ZoneStore::new());
    let mut zone_names: Vec<String> = zones.keys().cloned().collect();
    zone_names.sort();
    for index in zones.into_values() {
        store.swap_zone(index);
    }

    let cache = Arc::new(ResponseCache::new(cli.cache_size));
    let resolver = cli
        .resolver
        .then(|| Arc::new(IterativeResolver::with_roots()));
    if resolver.is_some() {
        info!("iterative resolver enabled");
    }
    let engine = Arc::new(QueryEngine::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        resolver,
    ));

    let udp_addr = parse_listen_addr(&cli.listen_udp)?;
    let tcp_addr = parse_listen_addr(&cli.listen_tcp)?;
    let udp = UdpServer::bind(udp_addr, engine.clone()).await?;
    let tcp = TcpServer::bind(tcp_addr, engine.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut listeners: Vec<JoinHandle<()>> = Vec::new();
    {
        let rx = shutdown_rx.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = udp.run(rx).await {
                error!(error = %e, "UDP server failed");
            }
        }));
    }
    {
        let rx = shutdown_rx.clone();
        listeners.push(tokio::spawn(async move {
            if let Err(e) = tcp.run(rx).await {
                error!(error = %e, "TCP server failed");
            }
        }));
    }

    // Health and metrics share one router; serve it on both addresses
    // when they differ.
    let health_addr = parse_listen_addr(&cli.health)?;
    let metrics_addr = parse_listen_addr(&cli.metrics)?;
    tokio::spawn(async move {
        if let Err(e) = smartdns_metrics::http::serve(health_addr).await {
            warn!(error = %e, "health endpoint failed");
        }
    });
    if metrics_addr != health_addr {
        tokio::spawn(async move {
            if let Err(e) = smartdns_metrics::http::serve(metrics_addr).await {
                warn!(error = %e, "metrics endpoint failed");
            }
        });
    }

    let coordinator = Arc::new(ReloadCoordinator::new(Arc::clone(&store), Arc::clone(&cache)));
    {
        let rx = shutdown_rx.clone();
        let dir = cli.zones_dir.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.watch(dir, rx).await {
                warn!(error = %e, "zone watcher failed");
            }
        });
    }

    info!(
        udp = %udp_addr,
        tcp = %tcp_addr,
        zones = zone_names.join(","),
        "smartdns started"
    );

    wait_for_shutdown().await?;
    info!("shutting down");
    shutdown_tx.send(true).ok();

    let drain = async {
        for listener in listeners {
            let _ = listener.await;
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("drain timeout expired, exiting with handlers in flight");
    }
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_accepts_bare_port() {
        assert_eq!(
            parse_listen_addr(":53").unwrap(),
            "0.0.0.0:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:5353").unwrap(),
            "127.0.0.1:5353".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_listen_addr("nonsense").is_err());
    }
}
