//! Daemon run loop: one network plus its firewall reconcilers.

use overlay_common::{IpTables, NetworkConfig, OverlayResult};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, instrument};

use crate::backend::BackendManager;
use crate::firewall::{forward_rules, masq_rules, FirewallReconciler, DEFAULT_RESYNC};

/// What the daemon sets up around the network.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub ip_masq: bool,
    pub iptables_resync: Duration,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            ip_masq: false,
            iptables_resync: DEFAULT_RESYNC,
        }
    }
}

/// Register the configured network and run it until `cancel` fires.
///
/// Shutdown during lease acquisition is not an error.
#[instrument(skip_all, fields(backend = %config.backend_type()))]
pub async fn run(
    manager: &BackendManager,
    config: &NetworkConfig,
    ipt: Arc<dyn IpTables>,
    opts: &DaemonOptions,
    cancel: CancellationToken,
) -> OverlayResult<()> {
    let backend = manager.get_backend(&config.backend_type()).await?;

    let network = match backend.register_network(&cancel, config).await {
        Ok(network) => network,
        Err(e) if e.is_shutdown() => {
            info!(error = %e, "Shutdown before the network was registered");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let subnet = network.lease().subnet;
    info!(subnet = %subnet, mtu = network.mtu(), "Network registered");

    let tracker = TaskTracker::new();
    if opts.ip_masq {
        let rules = masq_rules(ipt.as_ref(), config.network, subnet).await;
        let reconciler = FirewallReconciler::new(ipt.clone(), rules).with_resync(opts.iptables_resync);
        tracker.spawn(reconciler.run(cancel.clone()));
    }
    let reconciler =
        FirewallReconciler::new(ipt, forward_rules(config.network)).with_resync(opts.iptables_resync);
    tracker.spawn(reconciler.run(cancel.clone()));
    tracker.close();

    network.run(cancel).await;
    tracker.wait().await;
    info!("Daemon stopped");
    Ok(())
}
