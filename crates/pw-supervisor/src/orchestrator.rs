//! Supervisor event loop
//!
//! The [`Orchestrator`] owns the tunnel and client processes and the port
//! sync pipeline. A cold start brings up the tunnel, writes the forwarded
//! port into the client's settings and then starts the client. After that a
//! single loop services one event at a time: shutdown, the hourly port sync,
//! the daily maintenance restart and the optional reachability check. Any
//! sync failure escalates to a full restart; a full restart that keeps
//! failing past its retry budget is fatal.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pw_core::config::{OutputMode, SupervisorConfig};
use pw_core::{PwError, SystemResolver};

use crate::process::{
    LaunchSpec, ManagedProcess, OutputSink, ProcessError, ProcessLauncher, StdoutSink,
    SupervisionOptions, TokioLauncher, TracingSink,
};
use crate::retry::{deadline_after, BackoffPolicy, RetryExecutor, RetryOutcome};
use crate::sync::{
    HttpPortForwarder, PortBinding, PortSyncPipeline, PublishMode, SyncError, TransmissionRpc,
};

/// Fatal orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A process launch command is unusable
    #[error("Invalid {role} command: {source}")]
    InvalidCommand {
        role: &'static str,
        #[source]
        source: ProcessError,
    },

    /// Collaborators could not be built
    #[error("Setup failed: {0}")]
    Setup(#[from] PwError),

    /// Cold start kept failing until the restart budget ran out
    #[error("{reason}: gave up after {attempts} attempts: {source}")]
    RestartFailed {
        reason: &'static str,
        attempts: u32,
        #[source]
        source: StartError,
    },
}

/// One failed cold start attempt
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Failed to start {role}: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: ProcessError,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl StartError {
    /// Whether the attempt was abandoned because of shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Sync(e) if e.is_cancelled())
    }
}

/// State owned and mutated only by the orchestrator
#[derive(Default)]
pub struct OrchestratorState {
    pub tunnel: Option<ManagedProcess>,
    pub client: Option<ManagedProcess>,
    pub last_published: Option<PortBinding>,
    /// Full restarts performed after the initial cold start
    pub restarts: u32,
}

/// Processes brought up by one successful cold start
struct Started {
    tunnel: ManagedProcess,
    client: ManagedProcess,
    binding: PortBinding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Shutdown,
    Sync,
    Maintenance,
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

pub struct Orchestrator {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    pipeline: PortSyncPipeline,
    sinks: Vec<Arc<dyn OutputSink>>,
    tunnel_spec: LaunchSpec,
    client_spec: LaunchSpec,
    restart_retry: RetryExecutor,
    state: OrchestratorState,
}

impl Orchestrator {
    pub fn new(
        config: SupervisorConfig,
        launcher: Arc<dyn ProcessLauncher>,
        pipeline: PortSyncPipeline,
        sinks: Vec<Arc<dyn OutputSink>>,
    ) -> Result<Self, OrchestratorError> {
        config.validate().map_err(PwError::from)?;

        let tunnel_spec = LaunchSpec::parse(&config.tunnel.command)
            .map_err(|source| OrchestratorError::InvalidCommand {
                role: "tunnel",
                source,
            })?;
        let mut client_spec = LaunchSpec::parse(&config.client.command)
            .map_err(|source| OrchestratorError::InvalidCommand {
                role: "client",
                source,
            })?;
        client_spec.credentials = config.client.credentials();

        let restart_retry = RetryExecutor::new(BackoffPolicy::from_config(
            &config.restart_backoff.backoff,
            config.restart_backoff.max_elapsed,
        ));

        Ok(Self {
            config,
            launcher,
            pipeline,
            sinks,
            tunnel_spec,
            client_spec,
            restart_retry,
            state: OrchestratorState::default(),
        })
    }

    /// Build an orchestrator wired to the real OS and network collaborators
    pub fn from_config(config: SupervisorConfig) -> Result<Self, OrchestratorError> {
        let forwarder = Arc::new(HttpPortForwarder::new(config.port_forward.clone())?);
        let client = Arc::new(TransmissionRpc::new(config.client.rpc.clone())?);
        let retry = RetryExecutor::new(BackoffPolicy::from_config(&config.backoff, config.timeout));

        let pipeline = PortSyncPipeline::new(
            config.tunnel.device.clone(),
            Arc::new(SystemResolver),
            forwarder,
            client,
            config.client.settings_path.clone(),
        )
        .with_retry(retry)
        .with_timeout(config.timeout);

        let sink: Arc<dyn OutputSink> = match config.process.output {
            OutputMode::Stdout => Arc::new(StdoutSink),
            OutputMode::Log => Arc::new(TracingSink),
        };

        Self::new(config, Arc::new(TokioLauncher), pipeline, vec![sink])
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Run until `cancel` fires or a full restart fails for good
    ///
    /// Both processes are stopped before this returns.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        info!(
            "Supervising {} on {} (sync every {:?}, restart every {:?})",
            self.config.client.name,
            self.config.tunnel.device,
            self.config.schedule.sync_interval,
            self.config.schedule.restart_interval
        );

        let result = self.serve(&cancel).await;
        if let Err(e) = &result {
            error!("Supervisor failed: {}", e);
        }

        self.stop_all().await;
        info!("Supervisor stopped");
        result
    }

    async fn serve(&mut self, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        if self.bring_up("cold start", cancel).await? == Flow::Shutdown {
            return Ok(());
        }

        let schedule = self.config.schedule.clone();
        let mut sync = ticker(schedule.sync_interval);
        let mut maintenance = ticker(schedule.restart_interval);
        let mut check = schedule.check_interval.map(ticker);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Shutdown,
                _ = sync.tick() => Event::Sync,
                _ = maintenance.tick() => Event::Maintenance,
                _ = next_tick(&mut check) => Event::Check,
            };
            debug!("Orchestrator event: {:?}", event);

            let reason = match event {
                Event::Shutdown => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                Event::Sync => self.sync_port(cancel).await,
                Event::Maintenance => Some("scheduled maintenance restart"),
                Event::Check => self.check_reachability().await,
            };

            let Some(reason) = reason else {
                continue;
            };
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.bring_up(reason, cancel).await? == Flow::Shutdown {
                return Ok(());
            }
            self.state.restarts += 1;

            // Ticks that fired during the restart are subsumed by it
            sync.reset();
            maintenance.reset();
            if let Some(check) = check.as_mut() {
                check.reset();
            }
        }
    }

    /// Live port sync; returns a restart reason on failure
    async fn sync_port(&mut self, cancel: &CancellationToken) -> Option<&'static str> {
        if let Some(reason) = self.supervision_lost() {
            return Some(reason);
        }

        match self.pipeline.run(PublishMode::Live, cancel).await {
            Ok(binding) => {
                let previous = self.state.last_published.replace(binding);
                match previous {
                    // The client stays bound to the address it was started with
                    Some(last) if last.address != binding.address => {
                        warn!("Tunnel address moved from {} to {}", last.address, binding.address);
                        Some("tunnel address changed")
                    }
                    Some(last) if last.port != binding.port => {
                        info!("Forwarded port moved to {}", binding);
                        None
                    }
                    _ => None,
                }
            }
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                warn!("Port sync failed: {}", e);
                Some("port sync failed")
            }
        }
    }

    async fn check_reachability(&self) -> Option<&'static str> {
        match self.pipeline.client().test_port().await {
            Ok(true) => {
                debug!("Forwarded port is reachable");
                None
            }
            Ok(false) => {
                warn!("Forwarded port is not reachable");
                Some("forwarded port unreachable")
            }
            Err(e) => {
                warn!("Reachability check failed: {}", e);
                Some("reachability check failed")
            }
        }
    }

    /// A process whose supervision ended on its own (failed relaunch)
    fn supervision_lost(&self) -> Option<&'static str> {
        let lost = |process: &Option<ManagedProcess>| {
            process
                .as_ref()
                .map_or(true, |p| p.status().state.is_terminal())
        };
        if lost(&self.state.tunnel) {
            warn!("Tunnel is no longer supervised");
            return Some("tunnel supervision ended");
        }
        if lost(&self.state.client) {
            warn!("Client is no longer supervised");
            return Some("client supervision ended");
        }
        None
    }

    /// Stop everything, then cold start under the restart retry budget
    async fn bring_up(
        &mut self,
        reason: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Flow, OrchestratorError> {
        info!("{}: starting processes", reason);
        self.stop_all().await;

        let outcome = self
            .restart_retry
            .run(
                cancel,
                || self.cold_start(cancel),
                |e, delay| {
                    if !e.is_cancelled() {
                        warn!("{} failed: {}; retrying in {:?}", reason, e, delay);
                    }
                },
            )
            .await;

        match outcome {
            RetryOutcome::Succeeded(started) => {
                info!("{} complete; client bound to {}", reason, started.binding);
                self.state.tunnel = Some(started.tunnel);
                self.state.client = Some(started.client);
                self.state.last_published = Some(started.binding);
                Ok(Flow::Continue)
            }
            RetryOutcome::Cancelled => Ok(Flow::Shutdown),
            RetryOutcome::Exhausted { error, attempts } => Err(OrchestratorError::RestartFailed {
                reason,
                attempts,
                source: error,
            }),
        }
    }

    /// Tunnel, file-mode port sync, then client
    ///
    /// Leaves nothing running when it fails.
    async fn cold_start(&self, cancel: &CancellationToken) -> Result<Started, StartError> {
        let mut tunnel = self.process(&self.config.tunnel.name, &self.tunnel_spec);
        tunnel.start(cancel).map_err(|source| StartError::Spawn {
            role: "tunnel",
            source,
        })?;

        let binding = match self.pipeline.run(PublishMode::File, cancel).await {
            Ok(binding) => binding,
            Err(e) => {
                tunnel.stop().await;
                return Err(e.into());
            }
        };

        let mut client = self.process(&self.config.client.name, &self.client_spec);
        if let Err(source) = client.start(cancel) {
            tunnel.stop().await;
            return Err(StartError::Spawn {
                role: "client",
                source,
            });
        }

        Ok(Started {
            tunnel,
            client,
            binding,
        })
    }

    fn process(&self, name: &str, spec: &LaunchSpec) -> ManagedProcess {
        let mut spec = spec.clone();
        let credentials = spec.credentials.take();

        let mut process = self
            .sinks
            .iter()
            .fold(
                ManagedProcess::new(name, spec, self.launcher.clone()),
                |p, sink| p.with_sink(sink.clone()),
            )
            .with_options(SupervisionOptions::from(&self.config.process));
        if let Some((uid, gid)) = credentials {
            process.set_credentials(uid, gid);
        }
        process
    }

    async fn stop_all(&mut self) {
        if let Some(mut client) = self.state.client.take() {
            client.stop().await;
        }
        if let Some(mut tunnel) = self.state.tunnel.take() {
            tunnel.stop().await;
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(deadline_after(period), period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Run the supervisor with the real collaborators until `cancel` fires
pub async fn run(config: SupervisorConfig, cancel: CancellationToken) -> Result<(), OrchestratorError> {
    Orchestrator::from_config(config)?.run(cancel).await
}
