//! Verification helpers for modeled kernel state
//!
//! Each helper checks the entries one peer lease should (or should not)
//! have produced.

use ipnet::Ipv4Net;
use overlay_common::{MacAddress, Route};
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::kernel::KernelState;

/// Verification error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum VerificationError {
    #[error("Expected neighbor {ip} -> {expected}, found {actual:?}")]
    Neighbor {
        ip: Ipv4Addr,
        expected: MacAddress,
        actual: Option<MacAddress>,
    },

    #[error("Expected FDB entry {mac} -> {dst}, found {actual:?}")]
    Fdb {
        dst: Ipv4Addr,
        mac: MacAddress,
        actual: Option<MacAddress>,
    },

    #[error("Unexpected route for {subnet}: {actual:?}")]
    Route { subnet: Ipv4Net, actual: Option<Route> },

    #[error("Stale {what} entry for {subnet}")]
    Stale { subnet: Ipv4Net, what: &'static str },

    #[error("Both direct and encapsulated entries present for {subnet}")]
    BothPaths { subnet: Ipv4Net },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

fn parse(subnet: &str, public_ip: &str) -> (Ipv4Net, Ipv4Addr) {
    (
        subnet.parse().expect("subnet"),
        public_ip.parse().expect("public ip"),
    )
}

/// Neighbor + FDB + on-link overlay route for the peer.
pub fn assert_encapsulated(
    state: &KernelState,
    subnet: &str,
    public_ip: &str,
    vtep_mac: MacAddress,
) -> VerifyResult<()> {
    let (subnet, public_ip) = parse(subnet, public_ip);

    let neigh = state.neighbor(subnet.addr());
    if neigh != Some(vtep_mac) {
        return Err(VerificationError::Neighbor {
            ip: subnet.addr(),
            expected: vtep_mac,
            actual: neigh,
        });
    }

    let fdb = state.fdb_to(public_ip);
    if fdb != Some(vtep_mac) {
        return Err(VerificationError::Fdb {
            dst: public_ip,
            mac: vtep_mac,
            actual: fdb,
        });
    }

    let route = state.route_to(subnet);
    let ok = route.is_some_and(|r| {
        r.gw == Some(subnet.addr()) && r.onlink && r.link_index.is_some()
    });
    if !ok {
        return Err(VerificationError::Route {
            subnet,
            actual: route.cloned(),
        });
    }
    Ok(())
}

/// Route via the peer's public IP and no neighbor or FDB entry.
pub fn assert_direct(state: &KernelState, subnet: &str, public_ip: &str) -> VerifyResult<()> {
    let (subnet, public_ip) = parse(subnet, public_ip);

    let route = state.route_to(subnet);
    if !route.is_some_and(|r| r.gw == Some(public_ip) && !r.onlink) {
        return Err(VerificationError::Route {
            subnet,
            actual: route.cloned(),
        });
    }
    if state.neighbor(subnet.addr()).is_some() || state.fdb_to(public_ip).is_some() {
        return Err(VerificationError::BothPaths { subnet });
    }
    Ok(())
}

/// No route, neighbor or FDB entry left for the peer.
pub fn assert_absent(state: &KernelState, subnet: &str, public_ip: &str) -> VerifyResult<()> {
    let (subnet, public_ip) = parse(subnet, public_ip);

    if state.route_to(subnet).is_some() {
        return Err(VerificationError::Stale {
            subnet,
            what: "route",
        });
    }
    if state.neighbor(subnet.addr()).is_some() {
        return Err(VerificationError::Stale {
            subnet,
            what: "neighbor",
        });
    }
    if state.fdb_to(public_ip).is_some() {
        return Err(VerificationError::Stale { subnet, what: "fdb" });
    }
    Ok(())
}

/// At most one of the two paths is present for the peer.
pub fn assert_exclusive(state: &KernelState, subnet: &str, public_ip: &str) -> VerifyResult<()> {
    let (subnet, public_ip) = parse(subnet, public_ip);

    let direct = state
        .route_to(subnet)
        .is_some_and(|r| r.gw == Some(public_ip));
    let encap = state.neighbor(subnet.addr()).is_some()
        || state.fdb_to(public_ip).is_some()
        || state.route_to(subnet).is_some_and(|r| r.onlink);
    if direct && encap {
        return Err(VerificationError::BothPaths { subnet });
    }
    Ok(())
}
