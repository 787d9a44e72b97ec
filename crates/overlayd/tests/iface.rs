//! Interface helpers against the in-memory kernel

use overlay_common::iface::{
    direct_routing, ensure_v4_address_on_link, get_default_gateway_iface, get_iface_ip4_addr,
    get_iface_ip4_addr_match, get_interface_by_ip, lookup_ext_iface,
};
use overlay_common::{LinkLayer, OverlayError};
use overlay_test::{host_kernel, FailPoint, FakeKernel, HOST_IFACE, HOST_IP};
use pretty_assertions::assert_eq;
use std::net::Ipv4Addr;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_iface_addr_prefers_global_unicast() {
    let kernel = FakeKernel::new();
    let idx = kernel.add_link("eth1", 1500, Some("169.254.3.4/16".parse().unwrap()));
    kernel.inject_addr(idx, "10.20.0.5/24".parse().unwrap());

    assert_eq!(
        get_iface_ip4_addr(&kernel, idx).await.unwrap(),
        Ipv4Addr::new(10, 20, 0, 5)
    );
}

#[tokio::test]
async fn test_iface_addr_falls_back_to_link_local() {
    let kernel = FakeKernel::new();
    let idx = kernel.add_link("eth1", 1500, Some("169.254.3.4/16".parse().unwrap()));
    assert_eq!(
        get_iface_ip4_addr(&kernel, idx).await.unwrap(),
        Ipv4Addr::new(169, 254, 3, 4)
    );

    let bare = kernel.add_link("eth2", 1500, None);
    assert_err!(get_iface_ip4_addr(&kernel, bare).await);
}

#[tokio::test]
async fn test_addr_match_and_lookup_by_ip() {
    let kernel = host_kernel();
    let eth0 = kernel.link_by_name(HOST_IFACE).await.unwrap().unwrap();

    assert!(get_iface_ip4_addr_match(&kernel, eth0.index, HOST_IP).await.unwrap());
    assert!(!get_iface_ip4_addr_match(&kernel, eth0.index, Ipv4Addr::new(192, 168, 1, 3))
        .await
        .unwrap());

    assert_eq!(get_interface_by_ip(&kernel, HOST_IP).await.unwrap().name, HOST_IFACE);
    assert_err!(get_interface_by_ip(&kernel, Ipv4Addr::new(10, 9, 9, 9)).await);
}

#[tokio::test]
async fn test_default_gateway_iface() {
    let kernel = host_kernel();
    assert_eq!(get_default_gateway_iface(&kernel).await.unwrap().name, HOST_IFACE);

    let no_default = FakeKernel::new();
    no_default.add_link("eth0", 1500, Some("192.168.1.2/24".parse().unwrap()));
    assert_err!(get_default_gateway_iface(&no_default).await);
}

#[tokio::test]
async fn test_direct_routing_decision() {
    let kernel = host_kernel();
    let peer = Ipv4Addr::new(192, 168, 1, 5);

    assert!(!direct_routing(&kernel, peer).await.unwrap());
    kernel.add_direct_peer(peer);
    assert!(direct_routing(&kernel, peer).await.unwrap());

    kernel.fail_once(FailPoint::RouteGet);
    assert!(matches!(
        direct_routing(&kernel, peer).await,
        Err(OverlayError::KernelMutation { .. })
    ));
}

#[tokio::test]
async fn test_ensure_address_adds_when_empty() {
    let kernel = host_kernel();
    let idx = kernel.add_link("overlay.1", 1450, None);
    let dev = kernel.link_by_index(idx).await.unwrap();
    let addr = "10.1.15.0/32".parse().unwrap();

    assert_ok!(ensure_v4_address_on_link(&kernel, &dev, addr).await);
    assert_eq!(kernel.addr_list(idx).await.unwrap(), vec![addr]);

    // Already present: nothing to do.
    kernel.clear_journal();
    assert_ok!(ensure_v4_address_on_link(&kernel, &dev, addr).await);
    assert!(kernel.journal().is_empty());
}

#[tokio::test]
async fn test_ensure_address_replaces_single_mismatch() {
    let kernel = host_kernel();
    let idx = kernel.add_link("overlay.1", 1450, Some("10.1.9.0/32".parse().unwrap()));
    let dev = kernel.link_by_index(idx).await.unwrap();
    let addr = "10.1.15.0/32".parse().unwrap();

    assert_ok!(ensure_v4_address_on_link(&kernel, &dev, addr).await);
    assert_eq!(kernel.addr_list(idx).await.unwrap(), vec![addr]);
}

#[tokio::test]
async fn test_ensure_address_rejects_multiple() {
    let kernel = host_kernel();
    let idx = kernel.add_link("overlay.1", 1450, Some("10.1.9.0/32".parse().unwrap()));
    kernel.inject_addr(idx, "10.1.10.0/32".parse().unwrap());
    let dev = kernel.link_by_index(idx).await.unwrap();

    let err = ensure_v4_address_on_link(&kernel, &dev, "10.1.15.0/32".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, OverlayError::InvalidConfig { .. }));
    assert_eq!(kernel.addr_list(idx).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_ensure_address_delete_failure() {
    let kernel = host_kernel();
    let idx = kernel.add_link("overlay.1", 1450, Some("10.1.9.0/32".parse().unwrap()));
    let dev = kernel.link_by_index(idx).await.unwrap();
    kernel.fail_on(FailPoint::AddrDel);

    assert_err!(ensure_v4_address_on_link(&kernel, &dev, "10.1.15.0/32".parse().unwrap()).await);
}

#[tokio::test]
async fn test_lookup_ext_iface_default_route() {
    let kernel = host_kernel();
    let ext = lookup_ext_iface(&kernel, None, None).await.unwrap();
    assert_eq!(ext.iface.name, HOST_IFACE);
    assert_eq!(ext.iface_addr, HOST_IP);
    assert_eq!(ext.ext_addr, HOST_IP);
}

#[tokio::test]
async fn test_lookup_ext_iface_by_name_ip_and_public_ip() {
    let kernel = host_kernel();
    kernel.add_link("eth1", 9000, Some("10.20.0.5/24".parse().unwrap()));

    let by_name = lookup_ext_iface(&kernel, Some("eth1"), None).await.unwrap();
    assert_eq!(by_name.iface.mtu, 9000);
    assert_eq!(by_name.iface_addr, Ipv4Addr::new(10, 20, 0, 5));

    let public = Ipv4Addr::new(203, 0, 113, 7);
    let by_ip = lookup_ext_iface(&kernel, Some("10.20.0.5"), Some(public))
        .await
        .unwrap();
    assert_eq!(by_ip.iface.name, "eth1");
    assert_eq!(by_ip.ext_addr, public);

    assert!(matches!(
        lookup_ext_iface(&kernel, Some("eth9"), None).await,
        Err(OverlayError::LinkNotFound { .. })
    ));
}

#[tokio::test]
async fn test_lookup_ext_iface_rejects_zero_mtu() {
    let kernel = host_kernel();
    kernel.add_link("dummy0", 0, Some("10.30.0.1/24".parse().unwrap()));

    assert!(matches!(
        lookup_ext_iface(&kernel, Some("dummy0"), None).await,
        Err(OverlayError::InvalidConfig { .. })
    ));
}
