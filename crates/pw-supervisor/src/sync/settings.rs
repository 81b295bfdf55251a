//! Client settings file rewriting
//!
//! Before the client starts, the forwarded port and the tunnel address are
//! written into its JSON settings so it binds correctly from the first
//! moment. Unknown keys and the file's permissions are preserved.

use std::net::IpAddr;
use std::path::Path;

use serde_json::{Map, Value};

use pw_core::SettingsError;

pub const BIND_ADDRESS_IPV4: &str = "bind-address-ipv4";
pub const BIND_ADDRESS_IPV6: &str = "bind-address-ipv6";
pub const PEER_PORT: &str = "peer-port";
pub const PORT_FORWARDING_ENABLED: &str = "port-forwarding-enabled";
pub const PEER_PORT_RANDOM_ON_START: &str = "peer-port-random-on-start";

/// Set the bind address and peer port in a settings object
pub fn apply_binding(settings: &mut Map<String, Value>, address: IpAddr, port: u16) {
    let bind_key = match address {
        IpAddr::V4(_) => BIND_ADDRESS_IPV4,
        IpAddr::V6(_) => BIND_ADDRESS_IPV6,
    };
    settings.insert(bind_key.to_string(), Value::from(address.to_string()));
    settings.insert(PEER_PORT.to_string(), Value::from(port));
    settings.insert(PORT_FORWARDING_ENABLED.to_string(), Value::Bool(true));
    settings.insert(PEER_PORT_RANDOM_ON_START.to_string(), Value::Bool(false));
}

/// Rewrite the settings file at `path` in place
pub async fn publish_to_file(path: &Path, address: IpAddr, port: u16) -> Result<(), SettingsError> {
    let read_error = |source| SettingsError::Read {
        path: path.to_path_buf(),
        source,
    };
    let write_error = |source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    };

    let permissions = tokio::fs::metadata(path)
        .await
        .map_err(read_error)?
        .permissions();
    let raw = tokio::fs::read(path).await.map_err(read_error)?;

    let mut settings: Value = serde_json::from_slice(&raw).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let object = settings
        .as_object_mut()
        .ok_or_else(|| SettingsError::NotAnObject(path.to_path_buf()))?;
    apply_binding(object, address, port);

    let mut body = serde_json::to_vec_pretty(&settings).map_err(|source| SettingsError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    body.push(b'\n');

    tracing::debug!("Writing client settings to {:?}", path);
    tokio::fs::write(path, body).await.map_err(write_error)?;
    tokio::fs::set_permissions(path, permissions)
        .await
        .map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_settings(dir: &TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, body).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_publish_preserves_unrelated_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(
            &dir,
            r#"{"other":"x","bind-address-ipv4":"0.0.0.0","peer-port":1,"port-forwarding-enabled":false}"#,
        )
        .await;

        publish_to_file(&path, "10.0.0.5".parse().unwrap(), 51413)
            .await
            .unwrap();

        let value: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["bind-address-ipv4"], "10.0.0.5");
        assert_eq!(value["peer-port"], 51413);
        assert_eq!(value["port-forwarding-enabled"], true);
        assert_eq!(value["peer-port-random-on-start"], false);
        assert_eq!(value["other"], "x");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_publish_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, "{}").await;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        publish_to_file(&path, "10.8.0.4".parse().unwrap(), 40000)
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[tokio::test]
    async fn test_publish_ipv6_address() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, r#"{"bind-address-ipv4":"0.0.0.0"}"#).await;

        publish_to_file(&path, "fd00::4".parse().unwrap(), 40000)
            .await
            .unwrap();

        let value: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["bind-address-ipv6"], "fd00::4");
        assert_eq!(value["bind-address-ipv4"], "0.0.0.0");
    }

    #[tokio::test]
    async fn test_publish_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = publish_to_file(&dir.path().join("nope.json"), "10.0.0.5".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }

    #[tokio::test]
    async fn test_publish_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, "[1, 2]").await;

        let err = publish_to_file(&path, "10.0.0.5".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::NotAnObject(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[1, 2]");
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = write_settings(&dir, "{not json").await;

        let err = publish_to_file(&path, "10.0.0.5".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, SettingsError::Parse { .. }));
    }
}
