use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogConfig, LogFormat, StoreBackend, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::monitor::{MonitorHandle, StatusMonitor};
use tollgate::ratelimit::{RateLimitPolicy, RateLimiter, RateLimiterBackend};
use tollgate::store::{CounterStore, MemoryCounterStore, RedisCounterStore, RedisStoreSettings};

/// Tiered, cost-based rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Validate configuration and policy, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = TollgateConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }

    init_tracing(&config.log);

    info!("Starting Tollgate rate limiting service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policy = config.policy()?;
    info!(
        categories = policy.categories().len(),
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    if cli.check_config {
        println!("{}", serde_yaml::to_string(&policy)?);
        info!("Configuration is valid");
        return Ok(());
    }

    let policy = Arc::new(policy);
    let interval = Duration::from_secs(config.monitor.interval_secs);

    let (limiter, monitor) = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using in-memory counter store; limits are not shared between instances");
            build(policy, Arc::new(MemoryCounterStore::new()), interval)
        }
        StoreBackend::Redis => {
            let settings = RedisStoreSettings::from(&config.store);
            let store = RedisCounterStore::connect(settings).await?;
            info!(
                host = %config.store.host,
                port = config.store.port,
                db = config.store.db,
                "Connected to Redis"
            );
            build(policy, Arc::new(store), interval)
        }
    };

    HttpServer::new(config.server.http_addr, limiter)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    if let Some(monitor) = monitor {
        monitor.stop().await;
    }

    info!("Tollgate rate limiting service stopped");
    Ok(())
}

/// Build the limiter over `store` and start its health monitor.
fn build<S>(
    policy: Arc<RateLimitPolicy>,
    store: Arc<S>,
    interval: Duration,
) -> (Arc<dyn RateLimiterBackend>, Option<MonitorHandle>)
where
    S: CounterStore + 'static,
{
    let monitor = (!interval.is_zero()).then(|| {
        StatusMonitor::spawn(store.clone(), interval, |status| match status {
            Ok(status) => debug!(latency_ms = status.latency.as_millis() as u64, "Counter store healthy"),
            Err(err) => warn!(error = %err, "Counter store unhealthy; requests fail open"),
        })
    });

    let limiter: Arc<dyn RateLimiterBackend> = Arc::new(RateLimiter::new(policy, store));
    info!("Rate limiter initialized");
    (limiter, monitor)
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
