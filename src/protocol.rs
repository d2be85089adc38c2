//! JSON-serialisable wire messages exchanged between peers.
//!
//! Requests and responses are externally tagged unions over the four verbs.
//! Request parameters are `Option`-typed so handlers can tell a missing
//! parameter apart from a malformed one.

use serde::{Deserialize, Serialize};

use crate::core::{Contact, RpcError};

/// A single RPC request frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    Store(StoreRequest),
    FindValue(FindValueRequest),
}

/// PING with optional self-identification. A sender that supplies `id` and
/// `port` is offering itself as a contact; its IP comes from the transport.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindNodeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindValueRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A single RPC response frame.
///
/// STORE answers with `Stored` or `Nodes` (the redirect list) and
/// FIND_VALUE with `Value` or `Nodes`; clients tell the cases apart by the
/// tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong(PongResponse),
    Nodes(NodesResponse),
    Value(ValueResponse),
    Stored(StoredResponse),
    Error(ErrorResponse),
}

/// `{"message":"pong","node_id":"<hex40>"}`. The id stays a raw string
/// here; join validates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PongResponse {
    pub message: String,
    pub node_id: String,
}

impl PongResponse {
    pub fn new(node_id: String) -> Self {
        Self {
            message: "pong".to_string(),
            node_id,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodesResponse {
    pub nodes: Vec<Contact>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValueResponse {
    pub value: String,
}

/// Acknowledgement of an accepted STORE, echoing the pair.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredResponse {
    pub key: String,
    pub value: String,
}

/// The refusal outcomes a handler can produce, as a tagged payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    MissingParameter,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<RpcError> for Response {
    fn from(err: RpcError) -> Self {
        let kind = match err {
            RpcError::MissingParameter(_) => ErrorKind::MissingParameter,
            RpcError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        };
        Response::Error(ErrorResponse {
            kind,
            message: err.to_string(),
        })
    }
}
