//! Test fixtures for common overlay scenarios
//!
//! Addresses and names are parsed eagerly; a malformed fixture argument is
//! a bug in the test and panics.

use overlay_common::{
    Event, ExternalInterface, Lease, LeaseAttrs, LinkLayer, MacAddress, NetworkConfig,
};
use serde_json::json;
use std::net::Ipv4Addr;

use crate::kernel::FakeKernel;

/// Name of the host's external link.
pub const HOST_IFACE: &str = "eth0";

/// Address of the host on its external link.
pub const HOST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

/// Default gateway of the host network.
pub const HOST_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

/// MTU of the host's external link.
pub const HOST_MTU: u32 = 1500;

/// Overlay network used throughout the tests.
pub const OVERLAY_NETWORK: &str = "10.1.0.0/16";

/// Kernel with `eth0` at 192.168.1.2/24 and a default route via .1.
pub fn host_kernel() -> FakeKernel {
    let kernel = FakeKernel::new();
    let eth0 = kernel.add_link(
        HOST_IFACE,
        HOST_MTU,
        Some("192.168.1.2/24".parse().expect("host address")),
    );
    kernel.set_default_gateway(HOST_GATEWAY, eth0);
    kernel
}

/// External interface for `host_kernel()`.
pub async fn host_ext_iface(kernel: &FakeKernel) -> ExternalInterface {
    let iface = kernel
        .link_by_name(HOST_IFACE)
        .await
        .expect("link lookup")
        .expect("host link");
    ExternalInterface {
        iface,
        iface_addr: HOST_IP,
        ext_addr: HOST_IP,
    }
}

/// Network config for `OVERLAY_NETWORK` with the given backend object.
pub fn network_config(backend: serde_json::Value) -> NetworkConfig {
    NetworkConfig::new(OVERLAY_NETWORK.parse().expect("overlay network"), backend)
        .expect("network config")
}

/// Lease with arbitrary backend type and data.
pub fn lease(subnet: &str, public_ip: &str, backend_type: &str, data: serde_json::Value) -> Lease {
    Lease::new(
        subnet.parse().expect("subnet"),
        LeaseAttrs::new(public_ip.parse().expect("public ip"), backend_type).with_backend_data(data),
    )
}

/// VXLAN peer lease carrying its VTEP MAC.
pub fn vxlan_lease(subnet: &str, public_ip: &str, vtep_mac: &str) -> Lease {
    lease(subnet, public_ip, "vxlan", json!({ "VtepMAC": vtep_mac }))
}

/// UDP peer lease.
pub fn udp_lease(subnet: &str, public_ip: &str) -> Lease {
    lease(subnet, public_ip, "udp", serde_json::Value::Null)
}

pub fn added(lease: &Lease) -> Event {
    Event::added(lease.clone())
}

pub fn removed(lease: &Lease) -> Event {
    Event::removed(lease.clone())
}

pub fn mac(s: &str) -> MacAddress {
    MacAddress::parse(s).expect("mac address")
}

/// Distinct peer leases `10.1.<base+i>.0/24` at `192.168.2.<i+10>`.
pub fn vxlan_peers(base: u8, count: u8) -> Vec<Lease> {
    (0..count)
        .map(|i| {
            vxlan_lease(
                &format!("10.1.{}.0/24", base + i),
                &format!("192.168.2.{}", i + 10),
                &format!("aa:bb:cc:dd:{:02x}:{:02x}", base, i),
            )
        })
        .collect()
}
