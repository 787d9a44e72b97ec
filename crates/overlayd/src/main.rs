//! overlayd entry point.

use anyhow::{Context, Result};
use clap::Parser;
use overlay_common::iface::lookup_ext_iface;
use overlay_common::{IpTables, LeaseStore, LinkLayer, MemoryLeaseStore, ShellIpTables, ShellLinkLayer};
use overlayd::config::{load_network_config, Args};
use overlayd::{daemon, register_builtin, BackendContext, BackendManager, BackendRegistry, DaemonOptions};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "overlayd: Starting");

    match run_daemon(args).await {
        Ok(()) => {
            info!("overlayd: Exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "overlayd: Exiting with error");
            Err(e)
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log level")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

async fn run_daemon(args: Args) -> Result<()> {
    let cancel = setup_signal_handlers()?;

    let config = load_network_config(&args.net_config)
        .await
        .with_context(|| format!("loading {}", args.net_config.display()))?;
    info!(network = %config.network, subnet_len = config.subnet_len, backend = %config.backend_type(), "Loaded network config");

    let link: Arc<dyn LinkLayer> = Arc::new(ShellLinkLayer::new());
    let ext_iface = lookup_ext_iface(link.as_ref(), args.iface.as_deref(), args.public_ip)
        .await
        .context("failed to find the external interface")?;

    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new(config.clone()));
    let ipt: Arc<dyn IpTables> = Arc::new(ShellIpTables::new());

    let mut registry = BackendRegistry::new();
    register_builtin(&mut registry);
    let ctx = BackendContext::new(store, link, ext_iface);
    let manager = BackendManager::new(registry, ctx, cancel.clone());

    let opts = DaemonOptions {
        ip_masq: args.ip_masq,
        iptables_resync: args.iptables_resync(),
    };
    let result = daemon::run(&manager, &config, ipt, &opts, cancel.clone()).await;

    // Evictions only run once shutdown has begun.
    cancel.cancel();
    manager.wait().await;

    result.context("overlay network failed")
}

/// Cancel the returned token on SIGINT or SIGTERM.
fn setup_signal_handlers() -> Result<CancellationToken> {
    let cancel = CancellationToken::new();
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("overlayd: Received SIGINT"),
            _ = sigterm.recv() => info!("overlayd: Received SIGTERM"),
        }
        token.cancel();
    });

    Ok(cancel)
}
