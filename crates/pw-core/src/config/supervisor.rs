//! Supervisor configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs, option_duration_secs};
use crate::error::ConfigError;

/// Default port-forward assignment endpoint
pub const DEFAULT_PORT_FORWARD_ENDPOINT: &str =
    "https://www.privateinternetaccess.com/vpninfo/port_forward_assignment";

/// Configuration for the supervisor daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Deadline shared by all stages of one port sync
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Tunnel process
    pub tunnel: TunnelConfig,

    /// Download client process
    pub client: ClientConfig,

    /// Remote port-forwarding service
    pub port_forward: PortForwardConfig,

    /// Timer intervals
    pub schedule: ScheduleConfig,

    /// Process supervision tuning
    pub process: ProcessConfig,

    /// Backoff for retried operations
    pub backoff: BackoffConfig,

    /// Backoff for retrying a full restart
    pub restart_backoff: RestartBackoffConfig,

    /// Torrent cleaner
    pub cleaner: CleanerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            tunnel: TunnelConfig::default(),
            client: ClientConfig::default(),
            port_forward: PortForwardConfig::default(),
            schedule: ScheduleConfig::default(),
            process: ProcessConfig::default(),
            backoff: BackoffConfig::default(),
            restart_backoff: RestartBackoffConfig::default(),
            cleaner: CleanerConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Reject values that parse but cannot drive the supervisor
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("schedule.sync_interval", self.schedule.sync_interval)?;
        non_zero("schedule.restart_interval", self.schedule.restart_interval)?;
        if let Some(check) = self.schedule.check_interval {
            non_zero("schedule.check_interval", check)?;
        }
        if self.cleaner.enabled {
            non_zero("cleaner.interval", self.cleaner.interval)?;
        }
        self.backoff.validate("backoff")?;
        self.restart_backoff.backoff.validate("restart_backoff")
    }
}

fn non_zero(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!("{} must be greater than zero", key)));
    }
    Ok(())
}

/// Tunnel process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Name used to prefix output lines
    pub name: String,
    /// Launch command (whitespace separated)
    pub command: String,
    /// Interface the tunnel brings up
    pub device: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: "openvpn".to_string(),
            command: String::new(),
            device: "tun0".to_string(),
        }
    }
}

/// Download client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name used to prefix output lines
    pub name: String,
    /// Launch command (whitespace separated)
    pub command: String,
    /// OS user to run the client as
    pub uid: Option<u32>,
    /// OS group to run the client as
    pub gid: Option<u32>,
    /// Client settings file rewritten before each start
    pub settings_path: PathBuf,
    /// RPC endpoint of the running client
    pub rpc: RpcConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "transmission".to_string(),
            command: String::new(),
            uid: None,
            gid: None,
            settings_path: PathBuf::from("/var/lib/transmission-daemon/info/settings.json"),
            rpc: RpcConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Credentials to launch the client with, when both ids are set
    pub fn credentials(&self) -> Option<(u32, u32)> {
        match (self.uid, self.gid) {
            (Some(uid), Some(gid)) => Some((uid, gid)),
            _ => None,
        }
    }
}

/// Client RPC endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:9091/transmission/rpc".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

/// Port-forwarding service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortForwardConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Stable client identifier sent with each request
    pub client_id: String,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_PORT_FORWARD_ENDPOINT.to_string(),
            username: String::new(),
            password: String::new(),
            client_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Timer intervals driving the orchestrator loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Live port sync
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,

    /// Scheduled maintenance restart
    #[serde(with = "duration_secs")]
    pub restart_interval: Duration,

    /// Reachability check of the forwarded port (disabled when absent)
    #[serde(with = "option_duration_secs")]
    pub check_interval: Option<Duration>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60 * 60),
            restart_interval: Duration::from_secs(24 * 60 * 60),
            check_interval: None,
        }
    }
}

/// Where supervised process output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// `[name] line` on standard output
    #[default]
    Stdout,
    /// One `tracing` event per line
    Log,
}

/// Process supervision tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Time between the graceful termination signal and a forced kill
    #[serde(rename = "grace_period_ms", with = "duration_millis")]
    pub grace_period: Duration,

    /// Pause before relaunching a process that exited on its own
    #[serde(rename = "restart_delay_ms", with = "duration_millis")]
    pub restart_delay: Duration,

    /// Output sink
    pub output: OutputMode,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
            output: OutputMode::Stdout,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "{}.multiplier must be a finite number of at least 1, got {}",
                section, self.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "{}.jitter must be between 0 and 1, got {}",
                section, self.jitter
            )));
        }
        Ok(())
    }
}

/// Backoff for retrying a full restart
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartBackoffConfig {
    #[serde(flatten)]
    pub backoff: BackoffConfig,

    /// Give up (fatally) after this long
    #[serde(with = "duration_secs")]
    pub max_elapsed: Duration,
}

impl Default for RestartBackoffConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig {
                max: Duration::from_secs(10),
                ..BackoffConfig::default()
            },
            max_elapsed: Duration::from_secs(30 * 60),
        }
    }
}

/// Torrent cleaner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30 * 60),
        }
    }
}
