//! Port synchronization
//!
//! One sync resolves the tunnel's local address, asks the port-forwarding
//! service for the forwarded port, and publishes that port to the download
//! client. All three stages share a single deadline and cancellation token;
//! a failing stage aborts the ones after it.

pub mod client;
pub mod forward;
pub mod settings;

#[cfg(test)]
pub(crate) mod fake;

pub use client::{ClientRpc, TransmissionRpc, SESSION_ID_HEADER};
pub use forward::{HttpPortForwarder, PortForwarder};
pub use settings::publish_to_file;

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pw_core::{AddressResolver, PwError};

use crate::retry::{deadline_after, RetryExecutor, RetryOutcome};

/// Where the forwarded port is published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Rewrite the client's settings file; the client is not running
    File,
    /// Tell the running client over RPC
    Live,
}

/// A published (address, port) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub address: IpAddr,
    pub port: u16,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ResolveAddress,
    AcquirePort,
    PublishPort,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ResolveAddress => "address lookup",
            Self::AcquirePort => "port acquisition",
            Self::PublishPort => "port publish",
        })
    }
}

/// How a port sync failed
#[derive(Debug, Error)]
pub enum SyncError {
    /// Cancellation stopped the sync; not a failure
    #[error("Port sync cancelled during {stage}")]
    Cancelled { stage: Stage },

    /// The shared deadline ran out; carries the last error
    #[error("{stage} timed out after {attempts} attempts: {source}")]
    TimedOut {
        stage: Stage,
        attempts: u32,
        #[source]
        source: PwError,
    },

    /// A stage failed without being retried
    #[error("{stage} failed: {source}")]
    Failed {
        stage: Stage,
        #[source]
        source: PwError,
    },
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Cancelled { stage } | Self::TimedOut { stage, .. } | Self::Failed { stage, .. } => {
                *stage
            }
        }
    }
}

/// Resolve → acquire → publish, under one deadline
pub struct PortSyncPipeline {
    interface: String,
    resolver: Arc<dyn AddressResolver>,
    forwarder: Arc<dyn PortForwarder>,
    client: Arc<dyn ClientRpc>,
    settings_path: PathBuf,
    retry: RetryExecutor,
    timeout: Duration,
}

impl PortSyncPipeline {
    pub fn new(
        interface: impl Into<String>,
        resolver: Arc<dyn AddressResolver>,
        forwarder: Arc<dyn PortForwarder>,
        client: Arc<dyn ClientRpc>,
        settings_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interface: interface.into(),
            resolver,
            forwarder,
            client,
            settings_path: settings_path.into(),
            retry: RetryExecutor::new(Default::default()),
            timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// Deadline shared by all stages of one run
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn client(&self) -> &Arc<dyn ClientRpc> {
        &self.client
    }

    /// Run all stages
    pub async fn run(
        &self,
        mode: PublishMode,
        cancel: &CancellationToken,
    ) -> Result<PortBinding, SyncError> {
        let deadline = deadline_after(self.timeout);
        debug!("Port sync ({:?}) starting on {}", mode, self.interface);

        let address = self.resolve_address(deadline, cancel).await?;
        let port = self.acquire_port(address, deadline, cancel).await?;
        let binding = PortBinding { address, port };
        self.publish_port(mode, binding, deadline, cancel).await?;

        info!("Port sync complete: {}", binding);
        Ok(binding)
    }

    async fn resolve_address(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<IpAddr, SyncError> {
        let resolver = &self.resolver;
        let interface = self.interface.as_str();

        let outcome = self
            .retry
            .run_until(
                deadline,
                cancel,
                move || async move { resolver.resolve(interface).map_err(PwError::from) },
                |e, delay| log_retry(Stage::ResolveAddress, e, delay),
            )
            .await;
        settle(Stage::ResolveAddress, outcome)
    }

    async fn acquire_port(
        &self,
        address: IpAddr,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<u16, SyncError> {
        let forwarder = &self.forwarder;

        let outcome = self
            .retry
            .run_until(
                deadline,
                cancel,
                move || forwarder.request_port(address),
                |e, delay| log_retry(Stage::AcquirePort, e, delay),
            )
            .await;
        settle(Stage::AcquirePort, outcome)
    }

    async fn publish_port(
        &self,
        mode: PublishMode,
        binding: PortBinding,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let stage = Stage::PublishPort;
        match mode {
            PublishMode::File => {
                if cancel.is_cancelled() {
                    return Err(SyncError::Cancelled { stage });
                }
                publish_to_file(&self.settings_path, binding.address, binding.port)
                    .await
                    .map_err(|e| SyncError::Failed {
                        stage,
                        source: e.into(),
                    })
            }
            PublishMode::Live => {
                let client = &self.client;
                let outcome = self
                    .retry
                    .run_until(
                        deadline,
                        cancel,
                        move || client.set_peer_port(binding.port),
                        |e, delay| log_retry(stage, e, delay),
                    )
                    .await;
                settle(stage, outcome)
            }
        }
    }
}

fn log_retry(stage: Stage, error: &PwError, delay: Duration) {
    warn!("{} failed: {}; retrying in {:?}", stage, error, delay);
}

fn settle<T>(stage: Stage, outcome: RetryOutcome<T, PwError>) -> Result<T, SyncError> {
    match outcome {
        RetryOutcome::Succeeded(value) => Ok(value),
        RetryOutcome::Cancelled => Err(SyncError::Cancelled { stage }),
        RetryOutcome::Exhausted { error, attempts } => Err(SyncError::TimedOut {
            stage,
            attempts,
            source: error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeClient, FakeForwarder, FakeResolver};
    use super::*;
    use crate::retry::BackoffPolicy;
    use tempfile::TempDir;

    struct Harness {
        resolver: Arc<FakeResolver>,
        forwarder: Arc<FakeForwarder>,
        client: Arc<FakeClient>,
        pipeline: PortSyncPipeline,
        _dir: TempDir,
        settings: PathBuf,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let settings = dir.path().join("settings.json");
        std::fs::write(&settings, r#"{"download-dir":"/data"}"#).unwrap();

        let resolver = Arc::new(FakeResolver::new("tun0", "10.8.0.4/24"));
        let forwarder = Arc::new(FakeForwarder::new(40000));
        let client = Arc::new(FakeClient::new());
        let policy = BackoffPolicy::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(4),
            Duration::from_secs(600),
        );
        let pipeline = PortSyncPipeline::new(
            "tun0",
            resolver.clone(),
            forwarder.clone(),
            client.clone(),
            &settings,
        )
        .with_retry(RetryExecutor::new(policy))
        .with_timeout(Duration::from_secs(30));

        Harness {
            resolver,
            forwarder,
            client,
            pipeline,
            _dir: dir,
            settings,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_mode_writes_settings() {
        let h = harness();

        let binding = h
            .pipeline
            .run(PublishMode::File, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(binding.to_string(), "10.8.0.4:40000");
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&h.settings).unwrap()).unwrap();
        assert_eq!(value["bind-address-ipv4"], "10.8.0.4");
        assert_eq!(value["peer-port"], 40000);
        assert_eq!(value["download-dir"], "/data");
        assert!(h.client.ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_mode_uses_rpc() {
        let h = harness();

        h.pipeline
            .run(PublishMode::Live, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.client.ports(), vec![40000]);
        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&h.settings).unwrap()).unwrap();
        assert!(value.get("peer-port").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let h = harness();
        h.resolver.fail_next(2);
        h.forwarder.fail_next(1);

        let binding = h
            .pipeline
            .run(PublishMode::Live, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(binding.port, 40000);
        assert_eq!(h.resolver.calls(), 3);
        assert_eq!(h.forwarder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_failure_aborts_later_stages() {
        let h = harness();
        h.resolver.fail_next(u32::MAX);

        let started = Instant::now();
        let err = h
            .pipeline
            .run(PublishMode::Live, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::TimedOut {
                stage: Stage::ResolveAddress,
                source: PwError::Interface(_),
                ..
            }
        ));
        assert!(started.elapsed() <= Duration::from_secs(30 + 4));
        assert_eq!(h.forwarder.calls(), 0);
        assert!(h.client.ports().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stages_share_one_deadline() {
        let h = harness();
        h.resolver.fail_next(3);
        h.client.fail_set_port(true);

        let started = Instant::now();
        let err = h
            .pipeline
            .run(PublishMode::Live, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::PublishPort);
        assert!(started.elapsed() <= Duration::from_secs(30 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.pipeline.run(PublishMode::File, &cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.stage(), Stage::ResolveAddress);
        assert_eq!(h.resolver.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_file_mode_failure_is_not_retried() {
        let h = harness();
        std::fs::remove_file(&h.settings).unwrap();

        let err = h
            .pipeline
            .run(PublishMode::File, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SyncError::Failed {
                stage: Stage::PublishPort,
                source: PwError::Settings(_),
            }
        ));
    }
}
