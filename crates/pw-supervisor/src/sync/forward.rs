//! Forwarded-port acquisition

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use pw_core::config::PortForwardConfig;
use pw_core::{PwError, RemoteError};
use pw_protocol::decode_port_assignment;

/// Per-request timeout for the port-forwarding service
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Obtains an externally reachable port mapped through the tunnel
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Request the forwarded port for the tunnel's local address
    async fn request_port(&self, local_address: IpAddr) -> Result<u16, PwError>;
}

/// Form-POST client for the port-forwarding service
pub struct HttpPortForwarder {
    http: reqwest::Client,
    config: PortForwardConfig,
}

impl HttpPortForwarder {
    pub fn new(config: PortForwardConfig) -> Result<Self, PwError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(RemoteError::from)?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl PortForwarder for HttpPortForwarder {
    async fn request_port(&self, local_address: IpAddr) -> Result<u16, PwError> {
        let local_ip = local_address.to_string();
        let form = [
            ("user", self.config.username.as_str()),
            ("pass", self.config.password.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("local_ip", local_ip.as_str()),
        ];

        tracing::debug!("Requesting forwarded port for {}", local_ip);
        let response = self
            .http
            .post(&self.config.url)
            .form(&form)
            .send()
            .await
            .map_err(RemoteError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                url: self.config.url.clone(),
            }
            .into());
        }

        let body = response.bytes().await.map_err(RemoteError::from)?;
        let assignment = decode_port_assignment(&body)?;
        tracing::info!("Forwarded port {} assigned", assignment.port);
        Ok(assignment.port)
    }
}
