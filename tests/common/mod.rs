#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use kadnode::{
    Contact, DhtNetwork, DhtNode, FindValueOutcome, Key, NodeId, Pong, StoreOutcome, ID_LENGTH,
};

/// In-memory transport: peers are looked up by socket address, with
/// injectable failures and pong overrides for join error paths.
#[derive(Clone, Default)]
pub struct TestNetwork {
    registry: Arc<NetworkRegistry>,
}

impl TestNetwork {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self { registry }
    }
}

#[derive(Default)]
pub struct NetworkRegistry {
    peers: Mutex<HashMap<SocketAddrV4, DhtNode<TestNetwork>>>,
    pong_overrides: Mutex<HashMap<SocketAddrV4, String>>,
    failures: Mutex<HashSet<SocketAddrV4>>,
}

impl NetworkRegistry {
    pub async fn register(&self, node: &DhtNode<TestNetwork>) {
        let mut peers = self.peers.lock().await;
        peers.insert(node.contact().addr(), node.clone());
    }

    pub async fn get(&self, addr: SocketAddrV4) -> Option<DhtNode<TestNetwork>> {
        let peers = self.peers.lock().await;
        peers.get(&addr).cloned()
    }

    /// Make a ping to `addr` answer with a verbatim `node_id`, registered
    /// peer or not.
    pub async fn set_pong_override(&self, addr: SocketAddrV4, node_id: impl Into<String>) {
        let mut overrides = self.pong_overrides.lock().await;
        overrides.insert(addr, node_id.into());
    }

    pub async fn set_failure(&self, addr: SocketAddrV4, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(addr);
        } else {
            failures.remove(&addr);
        }
    }

    async fn failing(&self, addr: SocketAddrV4) -> bool {
        let failures = self.failures.lock().await;
        failures.contains(&addr)
    }

    async fn pong_override(&self, addr: SocketAddrV4) -> Option<String> {
        let overrides = self.pong_overrides.lock().await;
        overrides.get(&addr).cloned()
    }
}

#[async_trait]
impl DhtNetwork for TestNetwork {
    async fn ping(&self, to: SocketAddrV4) -> Result<Pong> {
        if self.registry.failing(to).await {
            return Err(anyhow!("injected network failure"));
        }
        if let Some(node_id) = self.registry.pong_override(to).await {
            return Ok(Pong { node_id });
        }
        let peer = self
            .registry
            .get(to)
            .await
            .ok_or_else(|| anyhow!("no peer listening on {to}"))?;
        let local_id = peer.handle_ping(None, None, None).await?;
        Ok(Pong {
            node_id: local_id.to_hex(),
        })
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let peer = self
            .registry
            .get(to.addr())
            .await
            .ok_or_else(|| anyhow!("no peer listening on {}", to.addr()))?;
        Ok(peer.handle_find_node(Some(&target.to_hex())).await?)
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueOutcome> {
        let peer = self
            .registry
            .get(to.addr())
            .await
            .ok_or_else(|| anyhow!("no peer listening on {}", to.addr()))?;
        Ok(peer.handle_find_value(Some(&key.to_hex())).await?)
    }

    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<StoreOutcome> {
        let peer = self
            .registry
            .get(to.addr())
            .await
            .ok_or_else(|| anyhow!("no peer listening on {}", to.addr()))?;
        Ok(peer
            .handle_store(Some(&key.to_hex()), Some(&value))
            .await?)
    }
}

/// An id whose leading byte is `byte` and whose remaining bytes are zero.
pub fn make_id(byte: u8) -> NodeId {
    let mut bytes = [0u8; ID_LENGTH];
    bytes[0] = byte;
    NodeId::from_bytes(bytes)
}

pub fn make_contact(byte: u8, port: u16) -> Contact {
    Contact::new(make_id(byte), Ipv4Addr::LOCALHOST, port)
}

/// Build and register a node reachable at `127.0.0.1:<port>`.
pub async fn make_node(
    registry: &Arc<NetworkRegistry>,
    id: NodeId,
    port: u16,
    k: usize,
) -> DhtNode<TestNetwork> {
    let contact = Contact::new(id, Ipv4Addr::LOCALHOST, port);
    let node = DhtNode::new(contact, TestNetwork::new(registry.clone()), k);
    registry.register(&node).await;
    node
}
