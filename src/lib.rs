//! # kadnode
//!
//! A lightweight Kademlia distributed hash table node. Each node maintains
//! a partial view of the network in a 160-bucket routing table, hosts a
//! fragment of the key/value space, and answers four RPC verbs from peers:
//! PING, FIND_NODE, STORE and FIND_VALUE. STORE is proximity-gated: a node
//! only persists a pair when it ranks among the closest peers it knows for
//! the key, and otherwise redirects the caller to closer contacts.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: the transport-agnostic Kademlia logic, including the routing
//!   table, local storage, and [`DhtNode`] state machine.
//! - [`protocol`]: the JSON serialisable wire messages exchanged between
//!   peers.
//! - [`framing`]: helpers for length-prefixed frames so RPCs can be carried
//!   over a byte stream.
//! - [`net`]: a TCP-based [`DhtNetwork`] implementation for outbound RPCs.
//! - [`server`]: utilities for hosting the RPC verbs on a TCP listener.
//!
//! ## Getting started
//!
//! Construct a node with its own contact details, join through any running
//! peer, and serve:
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//!
//! use anyhow::Result;
//! use kadnode::{Contact, DhtNode, NodeId, TcpNetwork, DEFAULT_K};
//! use tokio::net::TcpListener;
//!
//! # async fn launch() -> Result<()> {
//! let contact = Contact::new(NodeId::generate(), Ipv4Addr::LOCALHOST, 8080);
//! let node = DhtNode::new(contact, TcpNetwork, DEFAULT_K);
//!
//! node.join("127.0.0.1:9000").await?;
//!
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! kadnode::serve(listener, node).await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod framing;
pub mod net;
pub mod protocol;
pub mod server;

pub use crate::core::{
    distance, Contact, DhtNetwork, DhtNode, Distance, FindValueOutcome, IdError, JoinError, Key,
    KeyValueStore, NodeId, NodeSnapshot, Pong, RoutingTable, RpcError, StoreOutcome, DEFAULT_K,
    ID_LENGTH, ROUTING_TABLE_SIZE,
};
pub use crate::net::TcpNetwork;
pub use crate::server::{handle_connection, serve};
