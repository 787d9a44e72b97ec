//! Kubernetes node annotations carrying lease attributes.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::error::{OverlayError, OverlayResult};
use crate::lease::LeaseAttrs;

/// Default annotation prefix.
pub const DEFAULT_PREFIX: &str = "overlay.alpha.coreos.com";

// Kubernetes annotation key format: FQDN, one slash, optional name part
// ending in a dash.
static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[a-z0-9_-]+\.)+[a-z0-9_-]+/(?:[a-z0-9_-]+-)?$").expect("Invalid regex pattern")
});

/// Annotation keys derived from a validated prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseAnnotations {
    pub subnet_kube_managed: String,
    pub backend_data: String,
    pub backend_type: String,
    pub backend_public_ip: String,
    pub backend_public_ip_overwrite: String,
}

impl LeaseAnnotations {
    pub fn new(prefix: &str) -> OverlayResult<Self> {
        let mut prefix = prefix.to_string();
        match prefix.matches('/').count() {
            0 => prefix.push('/'),
            1 => {}
            _ => {
                return Err(OverlayError::invalid_config(
                    "annotation prefix",
                    "prefix can contain at most single slash",
                ))
            }
        }
        if !prefix.ends_with('/') && !prefix.ends_with('-') {
            prefix.push('-');
        }

        if !PREFIX_RE.is_match(&prefix) {
            return Err(OverlayError::invalid_config(
                "annotation prefix",
                "prefix must be in a format: fqdn/[0-9a-z-_]*",
            ));
        }

        Ok(Self {
            subnet_kube_managed: format!("{}kube-subnet-manager", prefix),
            backend_data: format!("{}backend-data", prefix),
            backend_type: format!("{}backend-type", prefix),
            backend_public_ip: format!("{}public-ip", prefix),
            backend_public_ip_overwrite: format!("{}public-ip-overwrite", prefix),
        })
    }

    /// Annotations publishing `attrs` for this node.
    pub fn encode(&self, attrs: &LeaseAttrs) -> OverlayResult<BTreeMap<String, String>> {
        let data = serde_json::to_string(&attrs.backend_data)
            .map_err(|e| OverlayError::internal(format!("encode backend data: {}", e)))?;

        let mut map = BTreeMap::new();
        map.insert(self.subnet_kube_managed.clone(), "true".to_string());
        map.insert(self.backend_type.clone(), attrs.backend_type.clone());
        map.insert(self.backend_data.clone(), data);
        map.insert(self.backend_public_ip.clone(), attrs.public_ip.to_string());
        Ok(map)
    }

    /// Lease attributes from node annotations.
    ///
    /// `public-ip-overwrite`, when present, replaces the published public IP.
    pub fn decode(&self, annotations: &BTreeMap<String, String>) -> OverlayResult<LeaseAttrs> {
        let get = |key: &str| {
            annotations
                .get(key)
                .ok_or_else(|| OverlayError::parse("node annotations", format!("missing {}", key)))
        };

        let public_ip_key = if annotations.contains_key(&self.backend_public_ip_overwrite) {
            &self.backend_public_ip_overwrite
        } else {
            &self.backend_public_ip
        };
        let public_ip: Ipv4Addr = get(public_ip_key.as_str())?
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                OverlayError::parse(public_ip_key.as_str(), e.to_string())
            })?;

        let backend_type = get(self.backend_type.as_str())?.clone();
        let backend_data = match annotations.get(&self.backend_data) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| OverlayError::parse(self.backend_data.as_str(), e.to_string()))?,
            None => serde_json::Value::Null,
        };

        Ok(LeaseAttrs::new(public_ip, backend_type).with_backend_data(backend_data))
    }

    /// Returns true if the node is managed through annotations.
    pub fn is_kube_managed(&self, annotations: &BTreeMap<String, String>) -> bool {
        annotations
            .get(&self.subnet_kube_managed)
            .is_some_and(|v| v == "true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_prefix_normalization() {
        let a = LeaseAnnotations::new("overlay.alpha.coreos.com").unwrap();
        assert_eq!(a.backend_data, "overlay.alpha.coreos.com/backend-data");

        let a = LeaseAnnotations::new("example.com/foo").unwrap();
        assert_eq!(a.backend_type, "example.com/foo-backend-type");

        let a = LeaseAnnotations::new("example.com/foo-").unwrap();
        assert_eq!(a.backend_public_ip, "example.com/foo-public-ip");
    }

    #[test]
    fn test_prefix_rejected() {
        assert!(LeaseAnnotations::new("a/b/c").is_err());
        assert!(LeaseAnnotations::new("nodomain").is_err());
        assert!(LeaseAnnotations::new("example.com/Foo").is_err());
    }

    #[test]
    fn test_encode_decode() {
        let keys = LeaseAnnotations::new(DEFAULT_PREFIX).unwrap();
        let attrs = LeaseAttrs::new(Ipv4Addr::new(192, 168, 1, 5), "vxlan")
            .with_backend_data(json!({"VtepMAC": "aa:bb:cc:dd:ee:ff"}));

        let map = keys.encode(&attrs).unwrap();
        assert!(keys.is_kube_managed(&map));
        assert_eq!(
            map[&keys.backend_data],
            r#"{"VtepMAC":"aa:bb:cc:dd:ee:ff"}"#
        );
        assert_eq!(keys.decode(&map).unwrap(), attrs);
    }

    #[test]
    fn test_public_ip_overwrite() {
        let keys = LeaseAnnotations::new(DEFAULT_PREFIX).unwrap();
        let attrs = LeaseAttrs::new(Ipv4Addr::new(192, 168, 1, 5), "udp");
        let mut map = keys.encode(&attrs).unwrap();
        map.insert(
            keys.backend_public_ip_overwrite.clone(),
            "203.0.113.7".to_string(),
        );

        let decoded = keys.decode(&map).unwrap();
        assert_eq!(decoded.public_ip, Ipv4Addr::new(203, 0, 113, 7));
    }
}
