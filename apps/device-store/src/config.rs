//! Store configuration from the environment.

use std::path::PathBuf;

use thiserror::Error;

/// Server used when neither the environment nor the user overrides it.
pub const DEFAULT_SERVER_URL: &str = "https://flow.example.org";

const DB_FILE_NAME: &str = "surveydata.db";
const APP_DIR_NAME: &str = "flow-device-store";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("cannot determine a data directory, set FLOW_DB_PATH")]
    NoDataDir,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub server_url: String,
    /// Required for sync only.
    pub api_key: Option<String>,
}

impl StoreConfig {
    /// Load `.env` (if present) and read `FLOW_DB_PATH`, `FLOW_SERVER_URL`, `FLOW_API_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = match non_empty("FLOW_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let server_url = non_empty("FLOW_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.into());
        validate_server_url(&server_url)?;

        Ok(Self {
            db_path,
            server_url: server_url.trim_end_matches('/').to_string(),
            api_key: non_empty("FLOW_API_KEY"),
        })
    }
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(DB_FILE_NAME))
        .ok_or(ConfigError::NoDataDir)
}

fn validate_server_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidServerUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::InvalidServerUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {scheme}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn explicit_values_are_used() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("FLOW_DB_PATH", "/tmp/flow.db"),
            ("FLOW_SERVER_URL", "https://server.example.org/"),
            ("FLOW_API_KEY", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/flow.db"));
        assert_eq!(config.server_url, "https://server.example.org");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn blank_api_key_is_absent() {
        let config = StoreConfig::from_lookup(lookup(&[
            ("FLOW_DB_PATH", "/tmp/flow.db"),
            ("FLOW_API_KEY", "  "),
        ]))
        .unwrap();
        assert_eq!(config.api_key, None);
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }

    #[test]
    fn non_http_server_is_rejected() {
        let err = StoreConfig::from_lookup(lookup(&[
            ("FLOW_DB_PATH", "/tmp/flow.db"),
            ("FLOW_SERVER_URL", "ftp://server.example.org"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidServerUrl { .. }));
    }
}
