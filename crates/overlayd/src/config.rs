//! Daemon command-line configuration.

use clap::Parser;
use overlay_common::{NetworkConfig, OverlayError, OverlayResult};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NET_CONFIG: &str = "/etc/overlay/net-conf.json";

/// Overlay network data-plane daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "overlayd")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the network configuration JSON
    #[arg(long, default_value = DEFAULT_NET_CONFIG)]
    pub net_config: PathBuf,

    /// Interface (name or IPv4 address) used for inter-host traffic;
    /// defaults to the interface of the default route
    #[arg(long)]
    pub iface: Option<String>,

    /// Address advertised to other hosts; defaults to the interface address
    #[arg(long)]
    pub public_ip: Option<Ipv4Addr>,

    /// Install masquerade rules for traffic leaving the overlay
    #[arg(long)]
    pub ip_masq: bool,

    /// Seconds between iptables rule checks
    #[arg(long, default_value = "5")]
    pub iptables_resync: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn iptables_resync(&self) -> Duration {
        Duration::from_secs(self.iptables_resync.max(1))
    }
}

/// Read and validate the network configuration file.
pub async fn load_network_config(path: &Path) -> OverlayResult<NetworkConfig> {
    let json = tokio::fs::read_to_string(path).await.map_err(|e| {
        OverlayError::invalid_config("net-config", format!("{}: {}", path.display(), e))
    })?;
    NetworkConfig::parse(&json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["overlayd"]);
        assert_eq!(args.net_config, PathBuf::from(DEFAULT_NET_CONFIG));
        assert_eq!(args.iface, None);
        assert!(!args.ip_masq);
        assert_eq!(args.iptables_resync(), Duration::from_secs(5));
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from([
            "overlayd",
            "--iface",
            "eth1",
            "--public-ip",
            "10.0.0.7",
            "--ip-masq",
            "--iptables-resync",
            "0",
        ]);
        assert_eq!(args.iface.as_deref(), Some("eth1"));
        assert_eq!(args.public_ip, Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(args.ip_masq);
        assert_eq!(args.iptables_resync(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_load_missing_config() {
        let err = load_network_config(Path::new("/nonexistent/net-conf.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, OverlayError::InvalidConfig { .. }));
    }
}
