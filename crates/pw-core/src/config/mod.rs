//! Configuration management for portwarden

mod supervisor;
pub mod serde_utils;

pub use supervisor::{
    BackoffConfig, CleanerConfig, ClientConfig, OutputMode, PortForwardConfig, ProcessConfig,
    RestartBackoffConfig, RpcConfig, ScheduleConfig, SupervisorConfig, TunnelConfig,
    DEFAULT_PORT_FORWARD_ENDPOINT,
};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portwarden")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
timeout = 600

[tunnel]
device = "tun3"
command = "openvpn --config /etc/openvpn/pia.conf"

[client]
command = "transmission-daemon -f"
uid = 1000
gid = 1000
settings_path = "/var/lib/transmission/settings.json"

[client.rpc]
url = "http://127.0.0.1:9091/transmission/rpc"
username = "username"
password = "secret"

[port_forward]
username = "p1234567"
password = "hunter2"

[schedule]
check_interval = 300

[cleaner]
enabled = true
interval = 10800
"#;

    #[test]
    fn test_load_sample_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config: SupervisorConfig = load_config(&path).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.tunnel.device, "tun3");
        assert_eq!(config.client.rpc.username, "username");
        assert_eq!(config.client.credentials(), Some((1000, 1000)));
        assert_eq!(config.schedule.sync_interval, Duration::from_secs(3600));
        assert_eq!(config.schedule.check_interval, Some(Duration::from_secs(300)));
        assert!(config.cleaner.enabled);
        assert_eq!(config.cleaner.interval, Duration::from_secs(3 * 3600));
        assert_eq!(config.port_forward.url, DEFAULT_PORT_FORWARD_ENDPOINT);
        assert!(!config.port_forward.client_id.is_empty());
    }

    #[test]
    fn test_load_missing_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");
        let err = load_config::<SupervisorConfig>(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(p) if p == path));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "timeout = \"soon\"").unwrap();
        assert!(matches!(
            load_config::<SupervisorConfig>(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config: SupervisorConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        SupervisorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for (section, key) in [
            ("schedule", "sync_interval"),
            ("schedule", "restart_interval"),
        ] {
            let text = format!("[{}]\n{} = 0\n", section, key);
            let config: SupervisorConfig = toml::from_str(&text).unwrap();
            let err = config.validate().unwrap_err();
            assert!(
                matches!(&err, ConfigError::Invalid(msg) if msg.contains(key)),
                "{}: {}",
                key,
                err
            );
        }

        let config: SupervisorConfig =
            toml::from_str("[cleaner]\nenabled = true\ninterval = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // A disabled cleaner's interval is never used
        let config: SupervisorConfig = toml::from_str("[cleaner]\ninterval = 0\n").unwrap();
        config.validate().unwrap();

        // Zero disables the reachability check
        let config: SupervisorConfig = toml::from_str("[schedule]\ncheck_interval = 0\n").unwrap();
        assert_eq!(config.schedule.check_interval, None);
        config.validate().unwrap();
    }

    #[test]
    fn test_unusable_backoff_rejected() {
        let config: SupervisorConfig = toml::from_str("[backoff]\nmultiplier = inf\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("backoff.multiplier")
        ));

        let config: SupervisorConfig =
            toml::from_str("[restart_backoff]\nmultiplier = nan\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(msg)) if msg.contains("restart_backoff.multiplier")
        ));

        let config: SupervisorConfig = toml::from_str("[backoff]\njitter = 2.5\n").unwrap();
        assert!(config.validate().is_err());
    }
}
