//! TCP implementation of the client half of the transport.
//!
//! Each RPC opens a fresh connection to the peer, writes one request frame,
//! and reads one response frame. The response union is mapped back onto the
//! per-verb outcomes of the core; an `error` response becomes an `Err` so
//! callers see refused requests as failures, not as data.

use std::net::SocketAddrV4;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::trace;

use crate::core::{Contact, DhtNetwork, FindValueOutcome, Key, NodeId, Pong, StoreOutcome};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{
    FindNodeRequest, FindValueRequest, PingRequest, Request, Response, StoreRequest,
};

/// Outbound RPCs over plain TCP.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpNetwork;

impl TcpNetwork {
    async fn call(&self, to: SocketAddrV4, request: &Request) -> Result<Response> {
        let mut stream = TcpStream::connect(to)
            .await
            .with_context(|| format!("connecting to {to}"))?;
        trace!(peer = %to, "sending request");

        let payload = serde_json::to_vec(request)?;
        write_frame(&mut stream, &payload).await?;

        let frame = read_frame(&mut stream)
            .await?
            .ok_or_else(|| anyhow!("{to} closed the connection before responding"))?;
        Ok(serde_json::from_slice(&frame)?)
    }
}

#[async_trait]
impl DhtNetwork for TcpNetwork {
    async fn ping(&self, to: SocketAddrV4) -> Result<Pong> {
        match self.call(to, &Request::Ping(PingRequest::default())).await? {
            Response::Pong(pong) => Ok(Pong {
                node_id: pong.node_id,
            }),
            Response::Error(err) => bail!("peer refused ping: {}", err.message),
            other => bail!("unexpected response to ping: {other:?}"),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let request = Request::FindNode(FindNodeRequest {
            id: Some(target.to_hex()),
        });
        match self.call(to.addr(), &request).await? {
            Response::Nodes(nodes) => Ok(nodes.nodes),
            Response::Error(err) => bail!("peer refused find_node: {}", err.message),
            other => bail!("unexpected response to find_node: {other:?}"),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueOutcome> {
        let request = Request::FindValue(FindValueRequest {
            key: Some(key.to_hex()),
        });
        match self.call(to.addr(), &request).await? {
            Response::Value(value) => Ok(FindValueOutcome::Value(value.value)),
            Response::Nodes(nodes) => Ok(FindValueOutcome::Nodes(nodes.nodes)),
            Response::Error(err) => bail!("peer refused find_value: {}", err.message),
            other => bail!("unexpected response to find_value: {other:?}"),
        }
    }

    async fn store(&self, to: &Contact, key: Key, value: String) -> Result<StoreOutcome> {
        let request = Request::Store(StoreRequest {
            key: Some(key.to_hex()),
            value: Some(value),
        });
        match self.call(to.addr(), &request).await? {
            Response::Stored(_) => Ok(StoreOutcome::Stored),
            Response::Nodes(nodes) => Ok(StoreOutcome::Redirect(nodes.nodes)),
            Response::Error(err) => bail!("peer refused store: {}", err.message),
            other => bail!("unexpected response to store: {other:?}"),
        }
    }
}
