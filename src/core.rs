//! Core DHT logic: transport-agnostic Kademlia implementation.
//!
//! This module contains the fundamental building blocks of the node:
//!
//! - **Identity**: [`NodeId`], [`Key`], SHA-1 based id generation and hex
//!   validation
//! - **Distance metric**: [`distance`] and [`Distance::bucket_index`] for
//!   XOR-based routing
//! - **Routing**: [`RoutingTable`], [`Contact`] with fixed 160-bucket
//!   layout and FIFO eviction
//! - **Storage**: [`KeyValueStore`], a process-lifetime key/value map
//! - **Node state machine**: [`DhtNode`] with one handler per RPC verb and
//!   the bootstrap [`join`](DhtNode::join) flow

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration Constants
// ─────────────────────────────────────────────────────────────────────────────

/// The number of bytes in a node identifier or key.
pub const ID_LENGTH: usize = 20;

/// The number of hex characters in the wire form of an identifier.
pub const ID_HEX_LENGTH: usize = ID_LENGTH * 2;

/// The number of buckets in the routing table, one per bit of the id space.
pub const ROUTING_TABLE_SIZE: usize = ID_LENGTH * 8;

/// Default per-bucket capacity; the replication width of the network.
/// Tests construct tables with a much smaller value.
pub const DEFAULT_K: usize = 20;

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Reasons an identifier fails validation.
///
/// The two cases are distinguished internally; at the RPC boundary both
/// surface as an invalid-request outcome.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid length")]
    InvalidLength,
    #[error("invalid format")]
    InvalidFormat,
}

/// A 160-bit node identifier, exchanged on the wire as 40 lowercase hex
/// characters.
///
/// Node ids and storage keys share the same address space, so the distance
/// between a node and a key is defined.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LENGTH]);

/// A content key. Same representation and invariants as [`NodeId`].
pub type Key = NodeId;

impl NodeId {
    /// Construct an id from raw bytes.
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh id by hashing process entropy mixed with the wall
    /// clock through SHA-1. Collisions are treated as impossible.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let mut hasher = Sha1::new();
        hasher.update(rng.gen::<u64>().to_be_bytes());
        hasher.update(rng.gen::<u64>().to_be_bytes());
        hasher.update(now.to_be_bytes());
        Self(hasher.finalize().into())
    }

    /// Parse the 40-character hex wire form. Accepts mixed case.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        if s.len() != ID_HEX_LENGTH {
            return Err(IdError::InvalidLength);
        }
        let mut bytes = [0u8; ID_LENGTH];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| IdError::InvalidFormat)?;
        Ok(Self(bytes))
    }

    /// The lowercase hex wire form.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Distance Metric
// ─────────────────────────────────────────────────────────────────────────────

/// An XOR distance between two 160-bit identifiers, ordered as a big-endian
/// unsigned integer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_LENGTH]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Zero-based position of the most significant set bit, i.e.
    /// `bit_length - 1`. `None` for the zero distance, which callers must
    /// treat as "do not insert" (it only arises for the local node itself).
    pub fn bucket_index(&self) -> Option<usize> {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let msb = 7 - byte.leading_zeros() as usize;
                return Some((ID_LENGTH - 1 - byte_idx) * 8 + msb);
            }
        }
        None
    }
}

/// Compute the XOR distance between two identifiers.
///
/// # Properties
/// - `distance(a, a)` is zero
/// - `distance(a, b) == distance(b, a)`
pub fn distance(a: &NodeId, b: &NodeId) -> Distance {
    let mut out = [0u8; ID_LENGTH];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    Distance(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Contacts
// ─────────────────────────────────────────────────────────────────────────────

/// Another DHT node as seen by this one: identifier plus IPv4 endpoint.
///
/// On the wire only `id`, `ip` and `port` appear; `last_seen` is stamped
/// when the contact is first observed and is not refreshed afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(skip)]
    pub last_seen: Option<u64>,
}

impl Contact {
    pub fn new(id: NodeId, ip: Ipv4Addr, port: u16) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .ok();
        Self {
            id,
            ip,
            port,
            last_seen: now,
        }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Local Key-Value Storage
// ─────────────────────────────────────────────────────────────────────────────

/// A process-lifetime map from key to value.
///
/// `set` is an unconditional overwrite; there is no delete and no expiry.
/// Key validation happens at the RPC boundary, not here. Concurrency is the
/// node's concern: it shares the store behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    entries: HashMap<Key, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: Key, value: String) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &Key) -> Option<&String> {
        self.entries.get(key)
    }

    /// A deep copy of the whole store, for diagnostics and tests. Callers
    /// never observe internal aliasing.
    pub fn snapshot(&self) -> HashMap<Key, String> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// A single k-bucket: contacts in insertion order, oldest at the head.
#[derive(Clone, Debug, Default)]
struct Bucket {
    contacts: Vec<Contact>,
}

impl Bucket {
    /// Insert a contact under the FIFO policy.
    ///
    /// A contact already present is left untouched: no refresh, no reorder.
    /// A full bucket drops its oldest entry to make room.
    fn insert(&mut self, contact: Contact, k: usize) {
        if self.contacts.iter().any(|c| c.id == contact.id) {
            return;
        }
        if self.contacts.len() >= k {
            self.contacts.remove(0);
        }
        self.contacts.push(contact);
    }

    fn len(&self) -> usize {
        self.contacts.len()
    }
}

/// Kademlia routing table: 160 buckets, one per bit of the id space.
///
/// Bucket `i` holds contacts whose distance from the local node has its most
/// significant set bit at position `i`. The capacity `k` is captured at
/// construction and fixed for the table's lifetime. The local node's own id
/// is never inserted.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            k,
            buckets: vec![Bucket::default(); ROUTING_TABLE_SIZE],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Insert a contact into the bucket its distance selects.
    ///
    /// Inserting the local node is a no-op (the zero distance has no
    /// bucket), as is re-inserting a known contact.
    pub fn insert(&mut self, contact: Contact) {
        let Some(index) = distance(&self.local_id, &contact.id).bucket_index() else {
            return;
        };
        self.buckets[index].insert(contact, self.k);
    }

    /// The up-to-`k` known contacts closest to `target`, ascending by XOR
    /// distance with ties broken by id order. Never contains the local node;
    /// empty when the table is empty.
    pub fn find_closest(&self, target: &NodeId) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|bucket| bucket.contacts.iter().cloned())
            .collect();

        all.sort_by(|a, b| {
            distance(&a.id, target)
                .cmp(&distance(&b.id, target))
                .then_with(|| a.id.cmp(&b.id))
        });
        all.truncate(self.k);
        all
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.buckets
            .iter()
            .any(|bucket| bucket.contacts.iter().any(|c| &c.id == id))
    }

    /// Number of contacts in one bucket.
    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets[index].len()
    }

    /// Total number of contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Why a request was refused. Refusals produce a response and leave the
/// routing table and store untouched.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RpcError {
    /// The request violates the documented shape: malformed id or key, bad
    /// port, empty value, or one-sided self-identification.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A required parameter is absent.
    #[error("missing '{0}' parameter")]
    MissingParameter(&'static str),
}

impl RpcError {
    fn invalid_id(err: IdError) -> Self {
        Self::InvalidRequest(format!("invalid id format: {err}"))
    }

    fn invalid_key(err: IdError) -> Self {
        Self::InvalidRequest(format!("invalid key format: {err}"))
    }
}

/// Why a join attempt failed. Join errors propagate to the process entry
/// point and terminate the node.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("invalid bootstrap address '{0}': expected <ip>:<port>")]
    InvalidAddress(String),

    #[error("bootstrap node {addr} unreachable: {source}")]
    UnreachableBootstrap {
        addr: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed response from bootstrap node {addr}: {reason}")]
    MalformedResponse { addr: String, reason: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Network Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A peer's answer to PING: its self-reported identifier, not yet validated.
#[derive(Clone, Debug)]
pub struct Pong {
    pub node_id: String,
}

/// Outcome of a STORE request: persisted locally, or redirected to the
/// peers the node believes are closer to the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Redirect(Vec<Contact>),
}

/// Outcome of a FIND_VALUE request: the value when held locally, otherwise
/// the closest known contacts. Exactly one of the two, never both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FindValueOutcome {
    Value(String),
    Nodes(Vec<Contact>),
}

/// Client face of the transport, one method per RPC verb.
///
/// The core is generic over this trait so tests can drive it with an
/// in-memory mock while production uses [`crate::net::TcpNetwork`].
/// `ping` is addressed by socket address rather than contact because join
/// must ping a bootstrap peer before its id is known.
#[async_trait]
pub trait DhtNetwork: Send + Sync + 'static {
    /// PING a peer, returning its pong self-identification.
    async fn ping(&self, to: SocketAddrV4) -> Result<Pong>;

    /// Ask a peer for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Ask a peer for the value under `key`, or failing that the contacts
    /// it knows closer to it.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueOutcome>;

    /// Ask a peer to store a key-value pair.
    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<StoreOutcome>;
}

// ─────────────────────────────────────────────────────────────────────────────
// DHT Node
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time diagnostic view of a node. Logged, never sent on the wire.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeSnapshot {
    pub stored_keys: usize,
    pub contacts: usize,
    pub k: usize,
}

/// A single Kademlia node: identity, routing table, local store, and one
/// handler per RPC verb.
///
/// Handlers are pure functions of the node state and the request; there is
/// no session and no retry state. The routing table and store each sit
/// behind a reader-writer lock and a handler never holds both at once, nor
/// does it hold either across outbound I/O. The only outbound call a node
/// makes on its own behalf is the PING round trip inside
/// [`join`](Self::join).
pub struct DhtNode<N: DhtNetwork> {
    id: NodeId,
    self_contact: Contact,
    routing: Arc<RwLock<RoutingTable>>,
    store: Arc<RwLock<KeyValueStore>>,
    network: Arc<N>,
}

impl<N: DhtNetwork> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            self_contact: self.self_contact.clone(),
            routing: Arc::clone(&self.routing),
            store: Arc::clone(&self.store),
            network: Arc::clone(&self.network),
        }
    }
}

impl<N: DhtNetwork> DhtNode<N> {
    pub fn new(self_contact: Contact, network: N, k: usize) -> Self {
        let id = self_contact.id;
        Self {
            id,
            self_contact,
            routing: Arc::new(RwLock::new(RoutingTable::new(id, k))),
            store: Arc::new(RwLock::new(KeyValueStore::new())),
            network: Arc::new(network),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn contact(&self) -> Contact {
        self.self_contact.clone()
    }

    /// Handle an incoming PING.
    ///
    /// `sender_id` and `sender_port` carry the optional self-identification;
    /// the sender's IP comes from the transport peer address. Identification
    /// is both-or-neither: a lone id or port is refused. PING is the only
    /// verb that learns the sender.
    ///
    /// Returns the local id for the pong.
    pub async fn handle_ping(
        &self,
        peer_ip: Option<Ipv4Addr>,
        sender_id: Option<&str>,
        sender_port: Option<u16>,
    ) -> Result<NodeId, RpcError> {
        match (sender_id, sender_port) {
            (None, None) => {}
            (Some(id), Some(port)) => {
                let id = NodeId::from_hex(id).map_err(RpcError::invalid_id)?;
                if port == 0 {
                    return Err(RpcError::InvalidRequest("invalid port provided".into()));
                }
                let Some(ip) = peer_ip else {
                    return Err(RpcError::InvalidRequest(
                        "cannot determine peer IPv4 address".into(),
                    ));
                };
                let contact = Contact::new(id, ip, port);
                {
                    let mut routing = self.routing.write().await;
                    routing.insert(contact);
                }
                debug!(peer = %id, %ip, port, "learned sender from ping");
            }
            _ => {
                return Err(RpcError::InvalidRequest(
                    "self-identification requires both id and port".into(),
                ));
            }
        }

        let snapshot = self.snapshot().await;
        debug!(
            stored_keys = snapshot.stored_keys,
            contacts = snapshot.contacts,
            "answering ping"
        );
        Ok(self.id)
    }

    /// Handle an incoming FIND_NODE: the closest known contacts to the
    /// target. Does not learn the sender.
    pub async fn handle_find_node(&self, target: Option<&str>) -> Result<Vec<Contact>, RpcError> {
        let target = target.ok_or(RpcError::MissingParameter("id"))?;
        let target = NodeId::from_hex(target).map_err(RpcError::invalid_id)?;

        let routing = self.routing.read().await;
        Ok(routing.find_closest(&target))
    }

    /// Handle an incoming STORE.
    ///
    /// The proximity gate: the pair is accepted only when the local node is
    /// among the k closest it knows about for the key, counting itself as a
    /// candidate. Otherwise the closest contacts are returned so the client
    /// can retry against them, and nothing is persisted.
    pub async fn handle_store(
        &self,
        key: Option<&str>,
        value: Option<&str>,
    ) -> Result<StoreOutcome, RpcError> {
        let key = key.ok_or(RpcError::MissingParameter("key"))?;
        let value = value.ok_or(RpcError::MissingParameter("value"))?;
        if value.is_empty() {
            return Err(RpcError::InvalidRequest("empty value".into()));
        }
        let key = Key::from_hex(key).map_err(RpcError::invalid_key)?;

        // The routing lock is released before the store lock is taken.
        let (accepted, closest) = {
            let routing = self.routing.read().await;
            let closest = routing.find_closest(&key);
            let accepted = self.is_among_closest(&key, &closest, routing.k());
            (accepted, closest)
        };

        if !accepted {
            debug!(key = %key, "not among the closest nodes, redirecting");
            return Ok(StoreOutcome::Redirect(closest));
        }

        {
            let mut store = self.store.write().await;
            store.set(key, value.to_string());
        }
        info!(key = %key, "stored key-value pair");
        Ok(StoreOutcome::Stored)
    }

    /// Would the local node rank within the closest `k` for `key` if it
    /// were a table entry alongside `closest`?
    fn is_among_closest(&self, key: &Key, closest: &[Contact], k: usize) -> bool {
        let mut candidates: Vec<NodeId> = closest.iter().map(|c| c.id).collect();
        candidates.push(self.id);
        candidates.sort_by(|a, b| {
            distance(a, key)
                .cmp(&distance(b, key))
                .then_with(|| a.cmp(b))
        });
        candidates.truncate(k);
        candidates.contains(&self.id)
    }

    /// Handle an incoming FIND_VALUE: the value when held locally, else the
    /// closest known contacts to the key.
    pub async fn handle_find_value(&self, key: Option<&str>) -> Result<FindValueOutcome, RpcError> {
        let key = key.ok_or(RpcError::MissingParameter("key"))?;
        let key = Key::from_hex(key).map_err(RpcError::invalid_key)?;

        {
            let store = self.store.read().await;
            if let Some(value) = store.get(&key) {
                return Ok(FindValueOutcome::Value(value.clone()));
            }
        }

        let routing = self.routing.read().await;
        Ok(FindValueOutcome::Nodes(routing.find_closest(&key)))
    }

    /// Join an existing network through one bootstrap peer: PING it,
    /// validate the pong's node id, and insert the peer as a contact.
    ///
    /// No further lookups are issued; the joiner starts with exactly one
    /// contact and fills its table from subsequent traffic.
    pub async fn join(&self, bootstrap_addr: &str) -> Result<(), JoinError> {
        let addr = parse_bootstrap_addr(bootstrap_addr)?;

        let pong =
            self.network
                .ping(addr)
                .await
                .map_err(|source| JoinError::UnreachableBootstrap {
                    addr: bootstrap_addr.to_string(),
                    source,
                })?;

        let peer_id =
            NodeId::from_hex(&pong.node_id).map_err(|err| JoinError::MalformedResponse {
                addr: bootstrap_addr.to_string(),
                reason: format!("bad node id: {err}"),
            })?;

        let contact = Contact::new(peer_id, *addr.ip(), addr.port());
        {
            let mut routing = self.routing.write().await;
            routing.insert(contact);
        }
        info!(peer = %peer_id, %addr, "joined network via bootstrap node");
        Ok(())
    }

    /// The closest known contacts to `target`, as [`RoutingTable::find_closest`].
    pub async fn find_closest(&self, target: &NodeId) -> Vec<Contact> {
        let routing = self.routing.read().await;
        routing.find_closest(target)
    }

    /// A deep copy of the local store.
    pub async fn store_snapshot(&self) -> HashMap<Key, String> {
        let store = self.store.read().await;
        store.snapshot()
    }

    /// Diagnostic counters. The two locks are taken one after the other,
    /// never together.
    pub async fn snapshot(&self) -> NodeSnapshot {
        let stored_keys = {
            let store = self.store.read().await;
            store.len()
        };
        let (contacts, k) = {
            let routing = self.routing.read().await;
            (routing.len(), routing.k())
        };
        NodeSnapshot {
            stored_keys,
            contacts,
            k,
        }
    }
}

/// Parse `<ip>:<port>` for join. The port must be present, numeric and
/// non-zero.
fn parse_bootstrap_addr(s: &str) -> Result<SocketAddrV4, JoinError> {
    let invalid = || JoinError::InvalidAddress(s.to_string());

    let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
    let ip: Ipv4Addr = host.parse().map_err(|_| invalid())?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if port == 0 {
        return Err(invalid());
    }
    Ok(SocketAddrV4::new(ip, port))
}
