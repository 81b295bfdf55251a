//! Client RPC envelope
//!
//! Requests are `{method, arguments, tag}` objects and responses echo the tag
//! back as `{result, arguments, tag}`. A call succeeds only when the tag
//! matches and `result` is [`RPC_SUCCESS`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Value of `result` on a successful call
pub const RPC_SUCCESS: &str = "success";

/// Fields requested by [`RpcRequest::torrent_get`]
pub const TORRENT_FIELDS: &[&str] = &[
    "id",
    "name",
    "error",
    "errorString",
    "isFinished",
    "percentDone",
    "uploadRatio",
];

/// An RPC request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcRequest {
    /// Method name (e.g. `session-set`)
    pub method: String,
    /// Method arguments
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub arguments: Map<String, Value>,
    /// Correlation tag echoed by the response
    pub tag: u32,
}

impl RpcRequest {
    /// Create a request with no arguments
    pub fn new(method: impl Into<String>, tag: u32) -> Self {
        Self {
            method: method.into(),
            arguments: Map::new(),
            tag,
        }
    }

    /// Add an argument
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Change the listening port of a running client
    pub fn session_set_peer_port(tag: u32, port: u16) -> Self {
        Self::new("session-set", tag)
            .arg("peer-port", port)
            .arg("port-forwarding-enabled", true)
            .arg("peer-port-random-on-start", false)
    }

    /// Ask the client whether its peer port is reachable from outside
    pub fn port_test(tag: u32) -> Self {
        Self::new("port-test", tag)
    }

    /// List torrents with the fields the cleaner needs
    pub fn torrent_get(tag: u32) -> Self {
        Self::new("torrent-get", tag).arg(
            "fields",
            TORRENT_FIELDS
                .iter()
                .map(|f| Value::from(*f))
                .collect::<Vec<_>>(),
        )
    }

    /// Remove torrents by id
    pub fn torrent_remove(tag: u32, ids: &[i64], delete_local_data: bool) -> Self {
        Self::new("torrent-remove", tag)
            .arg("ids", ids.to_vec())
            .arg("delete-local-data", delete_local_data)
    }

    /// Encode to a JSON body
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// An RPC response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcResponse {
    /// `"success"` or an error string
    pub result: String,
    /// Tag of the request being answered
    #[serde(default)]
    pub tag: Option<u32>,
    /// Method-specific results
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl RpcResponse {
    /// Decode a JSON body
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Check this response against the request it answers
    pub fn verify(&self, request: &RpcRequest) -> Result<(), ProtocolError> {
        if self.tag != Some(request.tag) {
            return Err(ProtocolError::TagMismatch {
                expected: request.tag,
                actual: self.tag,
            });
        }
        if self.result != RPC_SUCCESS {
            return Err(ProtocolError::Failed {
                method: request.method.clone(),
                result: self.result.clone(),
            });
        }
        Ok(())
    }

    /// Deserialize the `arguments` object into a typed result
    pub fn arguments_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(Value::Object(self.arguments.clone()))?)
    }
}

/// Result of `port-test`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortTest {
    #[serde(rename = "port-is-open")]
    pub port_is_open: bool,
}

/// A torrent as reported by `torrent-get`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Torrent {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub error: i64,
    #[serde(default)]
    pub error_string: String,
    #[serde(default)]
    pub is_finished: bool,
    #[serde(default)]
    pub percent_done: f64,
    #[serde(default)]
    pub upload_ratio: f64,
}

/// Result of `torrent-get`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TorrentList {
    #[serde(default)]
    pub torrents: Vec<Torrent>,
}
