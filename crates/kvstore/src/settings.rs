//! Store settings
//!
//! Selects a backend and its connection parameters from an optional settings
//! file (any format the `config` crate recognises by extension) overlaid with
//! `KVSTORE_*` environment variables:
//!
//! | Variable                        | Field                   |
//! |---------------------------------|-------------------------|
//! | `KVSTORE_BACKEND`               | `backend`               |
//! | `KVSTORE_ENDPOINTS`             | `endpoints` (comma list) |
//! | `KVSTORE_CONNECTION_TIMEOUT_MS` | `connection_timeout_ms` |
//! | `KVSTORE_USERNAME`              | `username`              |
//! | `KVSTORE_PASSWORD`              | `password`              |
//! | `KVSTORE_TLS__CA_FILE`          | `tls.ca_file`           |

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, Map};
use serde::{Deserialize, Serialize};
use tracing::debug;

use kvstore_common::{Config, Result, StoreError, TlsConfig};

use crate::backend::Backend;

/// Prefix of the environment overrides
pub const ENV_PREFIX: &str = "KVSTORE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Registered backend name
    pub backend: String,
    pub endpoints: Vec<String>,
    /// Zero leaves the backend default
    pub connection_timeout_ms: u64,
    pub username: String,
    pub password: String,
    pub tls: Option<TlsConfig>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Etcd.as_str().to_string(),
            endpoints: Vec::new(),
            connection_timeout_ms: 0,
            username: String::new(),
            password: String::new(),
            tls: None,
        }
    }
}

fn invalid(err: config::ConfigError) -> StoreError {
    StoreError::InvalidArgument(format!("invalid store settings: {}", err))
}

impl StoreSettings {
    /// Load from `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load from `path` (if any) and `env` in place of the process
    /// environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            debug!("Loading store settings from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("endpoints")
                .source(env),
        );

        let settings: StoreSettings = builder
            .build()
            .map_err(invalid)?
            .try_deserialize()
            .map_err(invalid)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.is_empty() {
            return Err(StoreError::InvalidArgument("backend must be set".to_string()));
        }
        if self.endpoints.is_empty() {
            return Err(StoreError::InvalidArgument(format!(
                "no endpoints configured for backend '{}'",
                self.backend
            )));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }

    /// Client configuration handed to the backend constructor.
    pub fn to_config(&self) -> Config {
        Config {
            tls: self.tls.clone(),
            connection_timeout: self.connection_timeout(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn settings_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = settings_file(
            r#"
backend = "zk"
endpoints = ["zk1:2181", "zk2:2181"]
connection_timeout_ms = 3000
username = "user"
password = "pw"

[tls]
ca_file = "/etc/ssl/ca.pem"
"#,
        );

        let settings = StoreSettings::load_with_env(Some(file.path()), env(&[])).unwrap();
        assert_eq!(settings.backend, "zk");
        assert_eq!(settings.endpoints, vec!["zk1:2181", "zk2:2181"]);

        let config = settings.to_config();
        assert_eq!(config.connection_timeout, Some(Duration::from_secs(3)));
        assert!(config.has_auth());
        let tls = config.tls.unwrap();
        assert_eq!(tls.ca_file.as_deref(), Some(Path::new("/etc/ssl/ca.pem")));
        assert!(!tls.insecure_skip_verify);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = settings_file("backend = \"zk\"\nendpoints = [\"zk1:2181\"]\n");

        let settings = StoreSettings::load_with_env(
            Some(file.path()),
            env(&[
                ("KVSTORE_BACKEND", "etcdv3"),
                ("KVSTORE_ENDPOINTS", "e1:2379,e2:2379"),
                ("KVSTORE_CONNECTION_TIMEOUT_MS", "1500"),
                ("KVSTORE_TLS__INSECURE_SKIP_VERIFY", "true"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.backend, "etcdv3");
        assert_eq!(settings.endpoints, vec!["e1:2379", "e2:2379"]);
        assert_eq!(settings.connection_timeout(), Some(Duration::from_millis(1500)));
        assert!(settings.tls.unwrap().insecure_skip_verify);
    }

    #[test]
    fn test_environment_only() {
        let settings =
            StoreSettings::load_with_env(None, env(&[("KVSTORE_ENDPOINTS", "127.0.0.1:2379")]))
                .unwrap();
        assert_eq!(settings.backend, "etcdv3");
        assert_eq!(settings.endpoints, vec!["127.0.0.1:2379"]);
        assert_eq!(settings.to_config(), Config::default());
    }

    #[test]
    fn test_missing_endpoints_rejected() {
        let err = StoreSettings::load_with_env(None, env(&[])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let err = StoreSettings::load_with_env(Some(&path), env(&[("KVSTORE_ENDPOINTS", "a:1")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }
}
