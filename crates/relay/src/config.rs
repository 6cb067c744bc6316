// Relay server configuration.
//
// Read once at startup and handed to the router by value; nothing on the
// relay path consults the environment after this.

use std::{fmt, net::SocketAddr, path::PathBuf};

use crate::error::{ErrorCode, RelayError};

pub const DEFAULT_MODEL: &str = "speech-realtime-250923";
pub const API_KEY_VAR: &str = "YANDEX_CLOUD_API_KEY";
pub const FOLDER_ID_VAR: &str = "YANDEX_CLOUD_FOLDER_ID";

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults for everything except
/// the upstream credentials.
#[derive(Clone)]
pub struct RelayConfig {
    /// Upstream API key. Empty when unset.
    pub api_key: String,
    /// Cloud folder the model is billed against. Empty when unset.
    pub folder_id: String,
    /// Realtime model name.
    pub model: String,
    /// Listen host.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Root of the static site (`index.html`, `static/`).
    pub web_dir: PathBuf,
    /// Log filter directive (e.g. `info`, `realtime_relay=debug`).
    pub log_filter: String,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `YANDEX_CLOUD_API_KEY` | *(none, required)* |
    /// | `YANDEX_CLOUD_FOLDER_ID` | *(none, required)* |
    /// | `YANDEX_REALTIME_MODEL` | `speech-realtime-250923` |
    /// | `HOST` | `0.0.0.0` |
    /// | `PORT` | `8080` |
    /// | `RELAY_WEB_DIR` | `web` |
    /// | `RELAY_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let read = |key: &str| env(key).ok().map(|value| value.trim().to_string());
        let non_empty = |key: &str| read(key).filter(|value| !value.is_empty());

        let api_key = read(API_KEY_VAR).unwrap_or_default();
        let folder_id = read(FOLDER_ID_VAR).unwrap_or_default();
        let model = non_empty("YANDEX_REALTIME_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into());
        let host = non_empty("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = read("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080);
        let web_dir = non_empty("RELAY_WEB_DIR").unwrap_or_else(|| "web".into()).into();
        let log_filter = non_empty("RELAY_LOG_FILTER").unwrap_or_else(|| "info".into());

        Self { api_key, folder_id, model, host, port, web_dir, log_filter }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }

    /// Fails when either upstream credential is absent.
    pub fn ensure_credentials(&self) -> Result<(), RelayError> {
        if self.api_key.is_empty() || self.folder_id.is_empty() {
            return Err(RelayError::new(
                ErrorCode::ConfigurationMissing,
                format!(
                    "Missing env vars: {API_KEY_VAR} and/or {FOLDER_ID_VAR}. \
                     Set them and restart server."
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("api_key", &if self.api_key.is_empty() { "<unset>" } else { "<redacted>" })
            .field("folder_id", &self.folder_id)
            .field("model", &self.model)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("web_dir", &self.web_dir)
            .field("log_filter", &self.log_filter)
            .finish()
    }
}

#[cfg(test)]
impl RelayConfig {
    pub(crate) fn for_tests() -> Self {
        let mut cfg = Self::from_env_fn(|_| Err(std::env::VarError::NotPresent));
        cfg.api_key = "test-api-key".into();
        cfg.folder_id = "b1gtestfolder".into();
        cfg
    }
}
