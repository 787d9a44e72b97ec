//! Core types shared by the link layer, the lease store and the backends.

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// MAC address representation.
///
/// Serializes as the colon-separated lowercase hex string, which is the
/// form carried inside lease backend data (`{"VtepMAC": "aa:bb:..."}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Zero MAC address
    pub const ZERO: Self = Self([0, 0, 0, 0, 0, 0]);

    /// Check if this is a zero MAC
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    /// Parse MAC from colon-separated string (e.g., "00:11:22:33:44:55")
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 2 {
                return None;
            }
            bytes[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid MAC address: {}", s))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One ARP or forwarding-database record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Neighbor {
    pub ip: Ipv4Addr,
    pub mac: MacAddress,
}

impl Neighbor {
    pub fn new(ip: Ipv4Addr, mac: MacAddress) -> Self {
        Self { ip, mac }
    }
}

impl fmt::Display for Neighbor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.ip, self.mac)
    }
}

/// Kernel IPv4 route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Route {
    /// Destination prefix; `None` is the default route.
    pub dst: Option<Ipv4Net>,
    /// Next hop, if any.
    pub gw: Option<Ipv4Addr>,
    /// Output link index, if pinned to a device.
    pub link_index: Option<u32>,
    /// RTNH_F_ONLINK: do not verify the next hop is reachable via the link.
    pub onlink: bool,
}

impl Route {
    /// Route to `dst` via `gw`, letting the kernel pick the device.
    pub fn via(dst: Ipv4Net, gw: Ipv4Addr) -> Self {
        Self {
            dst: Some(dst),
            gw: Some(gw),
            link_index: None,
            onlink: false,
        }
    }

    /// Pin the route to an output link.
    pub fn with_link(mut self, link_index: u32) -> Self {
        self.link_index = Some(link_index);
        self
    }

    /// Set the on-link flag.
    pub fn with_onlink(mut self) -> Self {
        self.onlink = true;
        self
    }

    /// Returns true for a default route (no destination or 0.0.0.0/0).
    pub fn is_default(&self) -> bool {
        match self.dst {
            None => true,
            Some(dst) => dst.prefix_len() == 0 && dst.addr().is_unspecified(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "{}", dst)?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = self.gw {
            write!(f, " via {}", gw)?;
        }
        if let Some(idx) = self.link_index {
            write!(f, " dev #{}", idx)?;
        }
        if self.onlink {
            write!(f, " onlink")?;
        }
        Ok(())
    }
}

/// VXLAN-specific link data as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanLinkInfo {
    pub vni: u32,
    pub vtep_index: Option<u32>,
    pub vtep_addr: Option<Ipv4Addr>,
    pub port: u16,
    pub gbp: bool,
    pub learning: bool,
}

/// A network link known to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub mac: MacAddress,
    /// Link kind from `IFLA_INFO_KIND` (e.g. "vxlan"), if any.
    pub kind: Option<String>,
    /// Populated when `kind` is "vxlan".
    pub vxlan: Option<VxlanLinkInfo>,
}

/// Parameters for creating a VXLAN link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanLinkAttrs {
    pub vni: u32,
    pub name: String,
    pub vtep_index: u32,
    pub vtep_addr: Ipv4Addr,
    /// Destination UDP port; 0 keeps the kernel default.
    pub port: u16,
    pub gbp: bool,
    pub learning: bool,
}

impl VxlanLinkAttrs {
    /// Returns a description of the first mismatch between an existing
    /// link and these attributes, or `None` if the link can be reused.
    pub fn incompatibility(&self, link: &LinkInfo) -> Option<String> {
        if link.kind.as_deref() != Some("vxlan") {
            return Some(format!(
                "link type: {} vs vxlan",
                link.kind.as_deref().unwrap_or("none")
            ));
        }
        let Some(existing) = link.vxlan.as_ref() else {
            return Some("missing vxlan attributes".to_string());
        };
        if existing.vni != self.vni {
            return Some(format!("vni: {} vs {}", existing.vni, self.vni));
        }
        if existing.vtep_index.is_some_and(|i| i != self.vtep_index) {
            return Some(format!(
                "vtep (external) interface: {:?} vs {}",
                existing.vtep_index, self.vtep_index
            ));
        }
        if existing.vtep_addr.is_some_and(|a| a != self.vtep_addr) {
            return Some(format!(
                "vtep (external) IP: {:?} vs {}",
                existing.vtep_addr, self.vtep_addr
            ));
        }
        if self.port > 0 && existing.port > 0 && existing.port != self.port {
            return Some(format!("port: {} vs {}", existing.port, self.port));
        }
        if existing.gbp != self.gbp {
            return Some(format!("gbp: {} vs {}", existing.gbp, self.gbp));
        }
        if existing.learning != self.learning {
            return Some(format!(
                "learning: {} vs {}",
                existing.learning, self.learning
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac = MacAddress::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(mac.0, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(MacAddress::parse("AA:BB:CC:DD:EE:FF"), Some(mac));

        assert!(MacAddress::parse("aa:bb:cc").is_none());
        assert!(MacAddress::parse("aa:bb:cc:dd:ee:gg").is_none());
        assert!(MacAddress::parse("aa:bb:cc:dd:ee:fff").is_none());
        assert!(MacAddress::ZERO.is_zero());
    }

    #[test]
    fn test_mac_json_is_string() {
        let mac: MacAddress = "02:42:ac:11:00:02".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"02:42:ac:11:00:02\"");

        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }

    #[test]
    fn test_route_display() {
        let route = Route::via("10.1.15.0/24".parse().unwrap(), Ipv4Addr::new(10, 1, 15, 0))
            .with_link(7)
            .with_onlink();
        assert_eq!(route.to_string(), "10.1.15.0/24 via 10.1.15.0 dev #7 onlink");
        assert!(!route.is_default());

        let default = Route {
            dst: Some("0.0.0.0/0".parse().unwrap()),
            gw: Some(Ipv4Addr::new(192, 168, 1, 1)),
            link_index: Some(2),
            onlink: false,
        };
        assert!(default.is_default());
    }

    fn vxlan_link(vni: u32, learning: bool) -> LinkInfo {
        LinkInfo {
            index: 10,
            name: "overlay.1".to_string(),
            mtu: 1450,
            mac: MacAddress::parse("aa:bb:cc:dd:ee:01").unwrap(),
            kind: Some("vxlan".to_string()),
            vxlan: Some(VxlanLinkInfo {
                vni,
                vtep_index: Some(2),
                vtep_addr: Some(Ipv4Addr::new(192, 168, 1, 2)),
                port: 8472,
                gbp: false,
                learning,
            }),
        }
    }

    fn attrs() -> VxlanLinkAttrs {
        VxlanLinkAttrs {
            vni: 1,
            name: "overlay.1".to_string(),
            vtep_index: 2,
            vtep_addr: Ipv4Addr::new(192, 168, 1, 2),
            port: 0,
            gbp: false,
            learning: false,
        }
    }

    #[test]
    fn test_vxlan_compatible_link() {
        assert_eq!(attrs().incompatibility(&vxlan_link(1, false)), None);
    }

    #[test]
    fn test_vxlan_incompatible_link() {
        assert!(attrs()
            .incompatibility(&vxlan_link(2, false))
            .unwrap()
            .starts_with("vni"));
        assert!(attrs()
            .incompatibility(&vxlan_link(1, true))
            .unwrap()
            .starts_with("learning"));

        let mut dummy = vxlan_link(1, false);
        dummy.kind = Some("dummy".to_string());
        assert!(attrs().incompatibility(&dummy).is_some());
    }
}
