//! Download-client RPC
//!
//! Every call is a JSON envelope POSTed to the client's RPC endpoint. The
//! client guards the endpoint with a session id: a first request is answered
//! with `409 Conflict` and an [`SESSION_ID_HEADER`] that must accompany the
//! retried request and all later ones.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use pw_core::config::RpcConfig;
use pw_core::{PwError, RemoteError};
use pw_protocol::{PortTest, RpcRequest, RpcResponse, Torrent, TorrentList};

pub const SESSION_ID_HEADER: &str = "X-Transmission-Session-Id";

/// Per-request timeout for client RPC calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Calls against the running download client
#[async_trait]
pub trait ClientRpc: Send + Sync {
    /// Change the listening port of the running client
    async fn set_peer_port(&self, port: u16) -> Result<(), PwError>;

    /// Whether the client's peer port is reachable from outside
    async fn test_port(&self) -> Result<bool, PwError>;

    async fn list_torrents(&self) -> Result<Vec<Torrent>, PwError>;

    async fn remove_torrents(&self, ids: &[i64], delete_local_data: bool) -> Result<(), PwError>;
}

/// HTTP implementation of [`ClientRpc`]
pub struct TransmissionRpc {
    http: reqwest::Client,
    config: RpcConfig,
    session_id: Mutex<Option<String>>,
    next_tag: AtomicU32,
}

impl TransmissionRpc {
    pub fn new(config: RpcConfig) -> Result<Self, PwError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RemoteError::from)?;
        Ok(Self {
            http,
            config,
            session_id: Mutex::new(None),
            next_tag: AtomicU32::new(1),
        })
    }

    fn next_tag(&self) -> u32 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|id| id.clone())
    }

    fn remember_session_id(&self, id: String) {
        if let Ok(mut current) = self.session_id.lock() {
            *current = Some(id);
        }
    }

    async fn post(&self, body: &[u8]) -> Result<reqwest::Response, PwError> {
        let mut request = self
            .http
            .post(&self.config.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());

        if !self.config.username.is_empty() {
            request = request.basic_auth(&self.config.username, Some(&self.config.password));
        }
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, id);
        }

        Ok(request.send().await.map_err(RemoteError::from)?)
    }

    /// Send one request and verify the response against it
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, PwError> {
        let body = request.encode()?;
        tracing::debug!("RPC {} (tag {})", request.method, request.tag);

        let mut response = self.post(&body).await?;
        if response.status() == StatusCode::CONFLICT {
            let id = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .ok_or(RemoteError::MissingSessionId(SESSION_ID_HEADER))?
                .to_string();
            tracing::debug!("RPC session id refreshed");
            self.remember_session_id(id);
            response = self.post(&body).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url: self.config.url.clone(),
            }
            .into());
        }

        let bytes = response.bytes().await.map_err(RemoteError::from)?;
        let decoded = RpcResponse::decode(&bytes)?;
        decoded.verify(request)?;
        Ok(decoded)
    }
}

#[async_trait]
impl ClientRpc for TransmissionRpc {
    async fn set_peer_port(&self, port: u16) -> Result<(), PwError> {
        self.call(&RpcRequest::session_set_peer_port(self.next_tag(), port))
            .await?;
        tracing::info!("Client peer port set to {}", port);
        Ok(())
    }

    async fn test_port(&self) -> Result<bool, PwError> {
        let response = self.call(&RpcRequest::port_test(self.next_tag())).await?;
        Ok(response.arguments_as::<PortTest>()?.port_is_open)
    }

    async fn list_torrents(&self) -> Result<Vec<Torrent>, PwError> {
        let response = self.call(&RpcRequest::torrent_get(self.next_tag())).await?;
        Ok(response.arguments_as::<TorrentList>()?.torrents)
    }

    async fn remove_torrents(&self, ids: &[i64], delete_local_data: bool) -> Result<(), PwError> {
        self.call(&RpcRequest::torrent_remove(
            self.next_tag(),
            ids,
            delete_local_data,
        ))
        .await?;
        Ok(())
    }
}
