#[path = "common/mod.rs"]
mod common;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use common::{make_id, make_node, NetworkRegistry};
use kadnode::JoinError;

#[tokio::test]
async fn join_inserts_the_bootstrap_contact() {
    let registry = Arc::new(NetworkRegistry::default());
    let bootstrap = make_node(&registry, make_id(0x11), 8080, 3).await;
    let joiner = make_node(&registry, make_id(0x22), 8081, 3).await;

    joiner.join("127.0.0.1:8080").await.expect("join succeeds");

    let closest = joiner.find_closest(&bootstrap.id()).await;
    assert_eq!(closest.len(), 1);
    assert_eq!(closest[0].id, bootstrap.id());
    assert_eq!(closest[0].ip, Ipv4Addr::LOCALHOST);
    assert_eq!(closest[0].port, 8080);

    // Join pings without self-identification, so the bootstrap node
    // learns nothing about the joiner.
    assert_eq!(bootstrap.snapshot().await.contacts, 0);
}

#[tokio::test]
async fn joining_twice_keeps_the_contact_once() {
    let registry = Arc::new(NetworkRegistry::default());
    let _bootstrap = make_node(&registry, make_id(0x11), 8080, 3).await;
    let joiner = make_node(&registry, make_id(0x22), 8081, 3).await;

    joiner.join("127.0.0.1:8080").await.expect("first join");
    joiner.join("127.0.0.1:8080").await.expect("second join");

    assert_eq!(joiner.snapshot().await.contacts, 1);
}

#[tokio::test]
async fn join_rejects_unparseable_addresses() {
    let registry = Arc::new(NetworkRegistry::default());
    let joiner = make_node(&registry, make_id(0x22), 8081, 3).await;

    for bad in [
        "127.0.0.1",
        "127.0.0.1:",
        "127.0.0.1:port",
        "127.0.0.1:0",
        "somewhere:8080",
    ] {
        let err = joiner.join(bad).await.expect_err("join must fail");
        assert!(
            matches!(err, JoinError::InvalidAddress(_)),
            "expected InvalidAddress for {bad:?}, got {err:?}"
        );
        assert_eq!(joiner.snapshot().await.contacts, 0);
    }
}

#[tokio::test]
async fn join_surfaces_an_unreachable_bootstrap() {
    let registry = Arc::new(NetworkRegistry::default());
    let joiner = make_node(&registry, make_id(0x22), 8081, 3).await;

    let err = joiner
        .join("127.0.0.1:9999")
        .await
        .expect_err("nobody is listening");
    assert!(matches!(err, JoinError::UnreachableBootstrap { .. }));
    assert!(
        err.to_string().contains("127.0.0.1:9999"),
        "diagnostic names the bootstrap address: {err}"
    );
    assert_eq!(joiner.snapshot().await.contacts, 0);
}

#[tokio::test]
async fn join_surfaces_an_injected_transport_failure() {
    let registry = Arc::new(NetworkRegistry::default());
    let _bootstrap = make_node(&registry, make_id(0x11), 8080, 3).await;
    let joiner = make_node(&registry, make_id(0x22), 8081, 3).await;

    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080);
    registry.set_failure(addr, true).await;

    let err = joiner
        .join("127.0.0.1:8080")
        .await
        .expect_err("failure is injected");
    assert!(matches!(err, JoinError::UnreachableBootstrap { .. }));

    registry.set_failure(addr, false).await;
    joiner.join("127.0.0.1:8080").await.expect("join recovers");
}

#[tokio::test]
async fn join_rejects_a_malformed_pong() {
    let registry = Arc::new(NetworkRegistry::default());
    let joiner = make_node(&registry, make_id(0x22), 8081, 3).await;
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080);

    for bad in ["", "not-a-node-id", "abc123"] {
        registry.set_pong_override(addr, bad).await;
        let err = joiner
            .join("127.0.0.1:8080")
            .await
            .expect_err("pong id is invalid");
        assert!(
            matches!(err, JoinError::MalformedResponse { .. }),
            "expected MalformedResponse for {bad:?}, got {err:?}"
        );
        assert_eq!(joiner.snapshot().await.contacts, 0);
    }
}
