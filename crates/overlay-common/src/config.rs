//! Overlay network configuration.
//!
//! Loaded once at startup from a JSON document such as
//!
//! ```text
//! {"Network": "10.1.0.0/16", "SubnetLen": 24,
//!  "Backend": {"Type": "vxlan", "VNI": 1, "DirectRouting": true}}
//! ```
//!
//! The `Backend` object is kept as raw JSON; each backend decodes the keys
//! it understands.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::error::{OverlayError, OverlayResult};

/// Backend type used when the configuration does not name one.
pub const DEFAULT_BACKEND_TYPE: &str = "vxlan";

/// Default per-node subnet prefix length.
pub const DEFAULT_SUBNET_LEN: u8 = 24;

/// Longest per-node subnet prefix that still leaves room for workloads.
const MAX_SUBNET_LEN: u8 = 30;

/// Overlay-wide network configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "Network")]
    pub network: Ipv4Net,
    #[serde(rename = "SubnetLen", default)]
    pub subnet_len: u8,
    #[serde(rename = "SubnetMin", default, skip_serializing_if = "Option::is_none")]
    pub subnet_min: Option<Ipv4Addr>,
    #[serde(rename = "SubnetMax", default, skip_serializing_if = "Option::is_none")]
    pub subnet_max: Option<Ipv4Addr>,
    #[serde(rename = "Backend", default)]
    pub backend: serde_json::Value,
}

impl NetworkConfig {
    /// Build a config for `network` with defaults and the given backend JSON.
    pub fn new(network: Ipv4Net, backend: serde_json::Value) -> OverlayResult<Self> {
        let mut cfg = Self {
            network: network.trunc(),
            subnet_len: 0,
            subnet_min: None,
            subnet_max: None,
            backend,
        };
        cfg.apply_defaults()?;
        Ok(cfg)
    }

    /// Parse and validate a JSON network configuration.
    pub fn parse(json: &str) -> OverlayResult<Self> {
        let mut cfg: NetworkConfig = serde_json::from_str(json)
            .map_err(|e| OverlayError::invalid_config("network config", e.to_string()))?;
        cfg.network = cfg.network.trunc();
        cfg.apply_defaults()?;
        Ok(cfg)
    }

    fn apply_defaults(&mut self) -> OverlayResult<()> {
        let net_len = self.network.prefix_len();

        if self.subnet_len == 0 {
            self.subnet_len = if net_len < DEFAULT_SUBNET_LEN {
                DEFAULT_SUBNET_LEN
            } else {
                net_len + 1
            };
        }

        if self.subnet_len <= net_len {
            return Err(OverlayError::invalid_config(
                "SubnetLen",
                format!(
                    "subnet length /{} must be longer than network /{}",
                    self.subnet_len, net_len
                ),
            ));
        }
        if self.subnet_len > MAX_SUBNET_LEN {
            return Err(OverlayError::invalid_config(
                "SubnetLen",
                format!("subnet length /{} is too long", self.subnet_len),
            ));
        }

        let step = self.subnet_size();
        let first = u32::from(self.network.network());
        let last = u32::from(self.network.broadcast()) - (step - 1);

        let min = match self.subnet_min {
            Some(ip) => ip,
            // Skip the network's first subnet; it ends in .0 of the overlay.
            None => Ipv4Addr::from(first + step),
        };
        let max = self.subnet_max.unwrap_or(Ipv4Addr::from(last));

        for (field, ip) in [("SubnetMin", min), ("SubnetMax", max)] {
            if !self.network.contains(&ip) {
                return Err(OverlayError::invalid_config(
                    field,
                    format!("{} is not within {}", ip, self.network),
                ));
            }
            if (u32::from(ip) - first) % step != 0 {
                return Err(OverlayError::invalid_config(
                    field,
                    format!("{} is not on a /{} boundary", ip, self.subnet_len),
                ));
            }
        }
        if u32::from(min) > u32::from(max) {
            return Err(OverlayError::invalid_config(
                "SubnetMin",
                format!("{} is above SubnetMax {}", min, max),
            ));
        }

        self.subnet_min = Some(min);
        self.subnet_max = Some(max);
        Ok(())
    }

    /// Number of addresses in one per-node subnet.
    pub fn subnet_size(&self) -> u32 {
        1u32 << (32 - u32::from(self.subnet_len))
    }

    /// Lowercased backend type from `Backend.Type`.
    pub fn backend_type(&self) -> String {
        self.backend
            .get("Type")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_BACKEND_TYPE)
            .to_lowercase()
    }

    /// Raw backend JSON, or `None` when the config has no backend object.
    pub fn backend_json(&self) -> Option<&serde_json::Value> {
        match &self.backend {
            serde_json::Value::Null => None,
            other => Some(other),
        }
    }

    /// Iterate the allocatable subnets between SubnetMin and SubnetMax.
    pub fn subnets(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        let step = self.subnet_size();
        let min = self.subnet_min.map(u32::from).unwrap_or(0);
        let max = self.subnet_max.map(u32::from).unwrap_or(0);
        let len = self.subnet_len;
        (min..=max).step_by(step as usize).filter_map(move |addr| {
            Ipv4Net::new(Ipv4Addr::from(addr), len).ok()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_defaults() {
        let cfg = NetworkConfig::parse(r#"{"Network": "10.1.0.0/16"}"#).unwrap();
        assert_eq!(cfg.subnet_len, 24);
        assert_eq!(cfg.subnet_min, Some(Ipv4Addr::new(10, 1, 1, 0)));
        assert_eq!(cfg.subnet_max, Some(Ipv4Addr::new(10, 1, 255, 0)));
        assert_eq!(cfg.backend_type(), "vxlan");
        assert!(cfg.backend_json().is_none());
    }

    #[test]
    fn test_parse_backend_type() {
        let cfg = NetworkConfig::parse(
            r#"{"Network": "10.1.0.0/16", "Backend": {"Type": "UDP", "Port": 9000}}"#,
        )
        .unwrap();
        assert_eq!(cfg.backend_type(), "udp");
        assert_eq!(cfg.backend_json().unwrap()["Port"], json!(9000));
    }

    #[test]
    fn test_small_network_default_subnet_len() {
        let cfg = NetworkConfig::parse(r#"{"Network": "10.1.0.0/25"}"#).unwrap();
        assert_eq!(cfg.subnet_len, 26);
        assert_eq!(cfg.subnets().count(), 1);
    }

    #[test]
    fn test_invalid_subnet_len() {
        assert!(NetworkConfig::parse(r#"{"Network": "10.1.0.0/16", "SubnetLen": 16}"#).is_err());
        assert!(NetworkConfig::parse(r#"{"Network": "10.1.0.0/16", "SubnetLen": 31}"#).is_err());
    }

    #[test]
    fn test_invalid_subnet_bounds() {
        let outside = r#"{"Network": "10.1.0.0/16", "SubnetMin": "10.2.0.0"}"#;
        assert!(NetworkConfig::parse(outside).is_err());

        let unaligned = r#"{"Network": "10.1.0.0/16", "SubnetMax": "10.1.3.7"}"#;
        assert!(NetworkConfig::parse(unaligned).is_err());

        let inverted = r#"{"Network": "10.1.0.0/16", "SubnetMin": "10.1.9.0", "SubnetMax": "10.1.3.0"}"#;
        assert!(NetworkConfig::parse(inverted).is_err());
    }

    #[test]
    fn test_subnets_iteration() {
        let cfg = NetworkConfig::parse(
            r#"{"Network": "10.1.0.0/16", "SubnetMin": "10.1.15.0", "SubnetMax": "10.1.17.0"}"#,
        )
        .unwrap();
        let subnets: Vec<String> = cfg.subnets().map(|s| s.to_string()).collect();
        assert_eq!(subnets, vec!["10.1.15.0/24", "10.1.16.0/24", "10.1.17.0/24"]);
    }

    #[test]
    fn test_malformed_json() {
        let err = NetworkConfig::parse("{").unwrap_err();
        assert!(matches!(err, OverlayError::InvalidConfig { .. }));
    }
}
