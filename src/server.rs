//! Hosting the four RPC verbs on a TCP listener.
//!
//! [`serve`] accepts connections forever and spawns one task per connection.
//! [`handle_connection`] reads request frames in a loop, dispatches each to
//! the matching [`DhtNode`] handler, and writes back one response frame.
//! A frame that does not parse as a request is answered with an
//! `invalid_request` error; an I/O failure ends the connection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use crate::core::{DhtNetwork, DhtNode, FindValueOutcome, RpcError, StoreOutcome};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{
    ErrorKind, ErrorResponse, FindNodeRequest, FindValueRequest, NodesResponse, PingRequest,
    PongResponse, Request, Response, StoreRequest, StoredResponse, ValueResponse,
};

/// Accept connections on `listener` until it fails, serving each on its own
/// task.
pub async fn serve<N: DhtNetwork>(listener: TcpListener, node: DhtNode<N>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, node).await {
                debug!(%peer, "connection ended: {err:#}");
            }
        });
    }
}

/// Serve request frames on one connection until the peer hangs up.
pub async fn handle_connection<N: DhtNetwork>(
    mut stream: TcpStream,
    peer: SocketAddr,
    node: DhtNode<N>,
) -> Result<()> {
    while let Some(frame) = read_frame(&mut stream).await? {
        let response = match serde_json::from_slice::<Request>(&frame) {
            Ok(request) => dispatch(&node, peer, request).await,
            Err(err) => {
                trace!(%peer, "unparseable request frame: {err}");
                Response::Error(ErrorResponse {
                    kind: ErrorKind::InvalidRequest,
                    message: "invalid request payload".to_string(),
                })
            }
        };
        let payload = serde_json::to_vec(&response)?;
        write_frame(&mut stream, &payload).await?;
    }
    Ok(())
}

async fn dispatch<N: DhtNetwork>(node: &DhtNode<N>, peer: SocketAddr, request: Request) -> Response {
    match request {
        Request::Ping(request) => handle_ping(node, peer, request).await,
        Request::FindNode(request) => handle_find_node(node, peer, request).await,
        Request::Store(request) => handle_store(node, peer, request).await,
        Request::FindValue(request) => handle_find_value(node, peer, request).await,
    }
}

/// The sender's IPv4 address, unwrapping IPv4-mapped IPv6 peers.
fn peer_ipv4(peer: SocketAddr) -> Option<Ipv4Addr> {
    match peer.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

async fn handle_ping<N: DhtNetwork>(
    node: &DhtNode<N>,
    peer: SocketAddr,
    request: PingRequest,
) -> Response {
    trace!(%peer, "handling PING request");
    let result = node
        .handle_ping(peer_ipv4(peer), request.id.as_deref(), request.port)
        .await;
    match result {
        Ok(local_id) => Response::Pong(PongResponse::new(local_id.to_hex())),
        Err(err) => refuse(peer, "PING", err),
    }
}

async fn handle_find_node<N: DhtNetwork>(
    node: &DhtNode<N>,
    peer: SocketAddr,
    request: FindNodeRequest,
) -> Response {
    trace!(%peer, target = ?request.id, "handling FIND_NODE request");
    match node.handle_find_node(request.id.as_deref()).await {
        Ok(nodes) => {
            debug!(%peer, returned = nodes.len(), "FIND_NODE response");
            Response::Nodes(NodesResponse { nodes })
        }
        Err(err) => refuse(peer, "FIND_NODE", err),
    }
}

async fn handle_store<N: DhtNetwork>(
    node: &DhtNode<N>,
    peer: SocketAddr,
    request: StoreRequest,
) -> Response {
    trace!(%peer, key = ?request.key, "handling STORE request");
    match node
        .handle_store(request.key.as_deref(), request.value.as_deref())
        .await
    {
        Ok(StoreOutcome::Stored) => {
            // Validation succeeded, so both fields are present here.
            let key = request.key.unwrap_or_default();
            let value = request.value.unwrap_or_default();
            Response::Stored(StoredResponse { key, value })
        }
        Ok(StoreOutcome::Redirect(nodes)) => {
            debug!(%peer, closer = nodes.len(), "STORE redirected");
            Response::Nodes(NodesResponse { nodes })
        }
        Err(err) => refuse(peer, "STORE", err),
    }
}

async fn handle_find_value<N: DhtNetwork>(
    node: &DhtNode<N>,
    peer: SocketAddr,
    request: FindValueRequest,
) -> Response {
    trace!(%peer, key = ?request.key, "handling FIND_VALUE request");
    match node.handle_find_value(request.key.as_deref()).await {
        Ok(FindValueOutcome::Value(value)) => Response::Value(ValueResponse { value }),
        Ok(FindValueOutcome::Nodes(nodes)) => {
            debug!(%peer, closer = nodes.len(), "FIND_VALUE answered with contacts");
            Response::Nodes(NodesResponse { nodes })
        }
        Err(err) => refuse(peer, "FIND_VALUE", err),
    }
}

fn refuse(peer: SocketAddr, verb: &str, err: RpcError) -> Response {
    debug!(%peer, verb, "refusing request: {err}");
    err.into()
}
