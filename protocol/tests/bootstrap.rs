//! End-to-end bootstrap tests.
//!
//! Every test gets its own temp state dir and its own freshly generated
//! identity. Nodes listen on loopback with an OS-assigned port, so tests can
//! run in parallel without stepping on each other.

use std::path::Path;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::time::{sleep, timeout};

use gatenet_protocol::config;
use gatenet_protocol::network::FilterAction;
use gatenet_protocol::{
    bootstrap, BootstrapError, NodeConfig, NodeHandle, NodeIdentity, PeerAddrInfo,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn node_config(state_dir: &Path, network_id: &str) -> NodeConfig {
    NodeConfig {
        key_material: NodeIdentity::generate()
            .to_protobuf_encoding()
            .expect("encode key"),
        listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().unwrap()],
        external_addr: "/ip4/1.2.3.4/tcp/9000".parse().unwrap(),
        state_dir: state_dir.to_path_buf(),
        network_id: network_id.to_string(),
        nat_port_map: false,
        ..NodeConfig::default()
    }
}

/// Waits until the swarm reports a real loopback listen address.
async fn loopback_addr(node: &NodeHandle) -> Multiaddr {
    timeout(Duration::from_secs(10), async {
        loop {
            if let Some(addr) = node
                .host()
                .listen_addrs()
                .into_iter()
                .find(|a| a.to_string().starts_with("/ip4/127.0.0.1/tcp/"))
            {
                return addr;
            }
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("node never started listening")
}

// ---------------------------------------------------------------------------
// Failure Paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_key_fails_before_any_store_is_touched() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), "testnet");
    config.key_material = vec![1, 2, 3];

    let err = bootstrap(config).await.unwrap_err();
    assert!(matches!(err, BootstrapError::InvalidKey(_)), "got {err:?}");
    assert!(!dir.path().join(config::PEERSTORE_DIR).exists());
    assert!(!dir.path().join(config::DHT_STORE_DIR).exists());
}

#[tokio::test]
async fn empty_key_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), "testnet");
    config.key_material.clear();

    assert!(matches!(
        bootstrap(config).await,
        Err(BootstrapError::InvalidKey(_))
    ));
}

#[tokio::test]
async fn unwritable_state_dir_is_storage_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"in the way").unwrap();

    let config = node_config(&blocker.join("state"), "testnet");
    let err = bootstrap(config).await.unwrap_err();
    assert!(
        matches!(err, BootstrapError::StorageUnavailable(_)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn missing_listen_addrs_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), "testnet");
    config.listen_addrs.clear();

    let err = bootstrap(config).await.unwrap_err();
    assert!(
        matches!(err, BootstrapError::TransportConstruction(_)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn failed_bootstrap_releases_the_stores() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), "testnet");
    config.listen_addrs = vec!["/ip4/127.0.0.1/udp/0".parse().unwrap()];

    assert!(bootstrap(config).await.is_err());

    // The stores were opened and must be free for the next attempt.
    let node = bootstrap(node_config(dir.path(), "testnet"))
        .await
        .expect("second bootstrap over the same state dir");
    node.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Happy Paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn testnet_node_comes_up_with_external_address() {
    let dir = tempfile::tempdir().unwrap();
    let config = node_config(dir.path(), "testnet");
    let expected = NodeIdentity::from_key_material(&config.key_material)
        .unwrap()
        .peer_id();

    let node = bootstrap(config).await.expect("bootstrap");

    assert_eq!(node.peer_id(), expected);
    assert_eq!(node.host().peer_id(), expected);
    assert_eq!(node.rendezvous(), "/gatenet/0.0.1/testnet");

    let external: Multiaddr = "/ip4/1.2.3.4/tcp/9000".parse().unwrap();
    assert!(node.addrs().contains(&external));

    let size = node.routing().routing_table_size().await.unwrap();
    assert_eq!(size.total(), 0);

    assert!(!node.is_advertising());
    assert!(node.discovery().is_none());
    assert!(node.pubsub().is_none());

    assert!(dir.path().join(config::PEERSTORE_DIR).exists());
    assert!(dir.path().join(config::DHT_STORE_DIR).exists());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn wildcard_listener_reports_external_address() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), "testnet");
    config.listen_addrs = vec!["/ip4/0.0.0.0/tcp/0".parse().unwrap()];

    let node = bootstrap(config).await.expect("bootstrap on 0.0.0.0");

    let external: Multiaddr = "/ip4/1.2.3.4/tcp/9000".parse().unwrap();
    assert!(node.addrs().contains(&external));
    loopback_addr(&node).await;

    let size = node.routing().routing_table_size().await.unwrap();
    assert_eq!(size.total(), 0);
    assert!(!node.routing().is_stopped());

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn seeded_node_starts_with_its_seed_in_the_wan_table() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = bootstrap(node_config(dir_a.path(), "testnet")).await.unwrap();
    let seed = PeerAddrInfo::new(a.peer_id(), vec![loopback_addr(&a).await]);

    let mut config = node_config(dir_b.path(), "testnet");
    config.bootstrap_peers = vec![seed];
    let b = bootstrap(config).await.expect("seeded bootstrap");

    let size = b.routing().routing_table_size().await.unwrap();
    assert_eq!(size.wan, 1);

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn own_entry_in_the_seed_list_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = node_config(dir.path(), "testnet");
    let own_id = NodeIdentity::from_key_material(&config.key_material)
        .unwrap()
        .peer_id();
    config.bootstrap_peers = vec![
        PeerAddrInfo::new(own_id, vec!["/ip4/5.6.7.8/tcp/4001".parse().unwrap()]),
        PeerAddrInfo::new(PeerId::random(), Vec::new()),
    ];

    let node = bootstrap(config)
        .await
        .expect("shared seed list must not stop a seed node");
    let size = node.routing().routing_table_size().await.unwrap();
    assert_eq!(size.wan, 0);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn nodes_on_the_same_network_connect_and_route() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = bootstrap(node_config(dir_a.path(), "testnet")).await.unwrap();
    let b = bootstrap(node_config(dir_b.path(), "testnet")).await.unwrap();

    let addr = loopback_addr(&a).await;
    let connected = timeout(Duration::from_secs(30), b.host().connect(addr))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    assert_eq!(connected, a.peer_id());

    // Identify runs, then the loopback address lands in the LAN tier and
    // the advertised 1.2.3.4 address in the WAN tier.
    timeout(Duration::from_secs(15), async {
        loop {
            let size = b.routing().routing_table_size().await.unwrap();
            if size.lan > 0 && size.wan > 0 {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("peer never reached both routing tables");

    assert!(!b.peerstore().addrs(&a.peer_id()).unwrap().is_empty());

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn nodes_on_different_networks_cannot_connect() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = bootstrap(node_config(dir_a.path(), "testnet")).await.unwrap();
    let b = bootstrap(node_config(dir_b.path(), "othernet")).await.unwrap();

    let addr = loopback_addr(&a).await;
    let attempt = timeout(Duration::from_secs(30), b.host().connect(addr)).await;
    assert!(
        !matches!(attempt, Ok(Ok(_))),
        "a node on another network got in"
    );

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn denied_range_blocks_dials() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = bootstrap(node_config(dir_a.path(), "testnet")).await.unwrap();
    let b = bootstrap(node_config(dir_b.path(), "testnet")).await.unwrap();

    b.filter()
        .add_filter("127.0.0.0/8".parse().unwrap(), FilterAction::Deny);

    let addr = loopback_addr(&a).await;
    let attempt = timeout(Duration::from_secs(30), b.host().connect(addr))
        .await
        .expect("dial timed out");
    assert!(attempt.is_err());

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn restart_keeps_the_peerstore() {
    let dir = tempfile::tempdir().unwrap();
    let config = node_config(dir.path(), "testnet");
    let remembered = PeerId::random();
    let addr: Multiaddr = "/ip4/10.1.2.3/tcp/4001".parse().unwrap();

    let node = bootstrap(config.clone()).await.unwrap();
    node.peerstore()
        .add_addrs(&remembered, std::slice::from_ref(&addr))
        .unwrap();
    node.shutdown().await.unwrap();

    let node = bootstrap(config).await.expect("reopen same state dir");
    assert_eq!(node.peerstore().addrs(&remembered).unwrap(), vec![addr]);
    node.shutdown().await.unwrap();
}
