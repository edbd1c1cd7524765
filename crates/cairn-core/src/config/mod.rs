//! Replica configuration.
//!
//! Everything a replica process needs to reach its primary and to share the
//! lock table with other processes on the same data directory.

use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::Id;
use crate::util::{is_http_url, normalize_text_option};

const ENV_SERVER_URL: &str = "CAIRN_SERVER_URL";
const ENV_DATA_DIR: &str = "CAIRN_DATA_DIR";
const ENV_SYNC_INTERVAL_SECS: &str = "CAIRN_SYNC_INTERVAL_SECS";
const ENV_SYNC_MAX_ATTEMPTS: &str = "CAIRN_SYNC_MAX_ATTEMPTS";
const ENV_LOCK_LEASE_SECS: &str = "CAIRN_LOCK_LEASE_SECS";
const ENV_INSTANCE_ID: &str = "CAIRN_INSTANCE_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Primary base URL without a trailing slash
    pub server_url: String,
    pub data_dir: PathBuf,
    pub sync_interval: Duration,
    pub sync_max_attempts: u32,
    pub lock_lease: Duration,
    /// Owner name of this process in the shared lock table
    pub instance_id: String,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server_url = required_trimmed(&lookup, ENV_SERVER_URL)?;
        if !is_http_url(&server_url) {
            return Err(ConfigError::Invalid(format!(
                "{ENV_SERVER_URL} must start with http:// or https://"
            )));
        }
        let server_url = server_url.trim_end_matches('/').to_string();

        let data_dir = PathBuf::from(required_trimmed(&lookup, ENV_DATA_DIR)?);

        let sync_interval_secs = bounded(&lookup, ENV_SYNC_INTERVAL_SECS, 60, 5..=3_600)?;
        let sync_max_attempts = bounded(&lookup, ENV_SYNC_MAX_ATTEMPTS, 3, 1..=10)?;
        let lock_lease_secs = bounded(&lookup, ENV_LOCK_LEASE_SECS, 30, 5..=600)?;

        let instance_id = match optional_trimmed(&lookup, ENV_INSTANCE_ID) {
            Some(value) => Id::parse(value)
                .map_err(|_| {
                    ConfigError::Invalid(format!(
                        "{ENV_INSTANCE_ID} may only contain letters, digits, '-' and '_'"
                    ))
                })?
                .to_string(),
            None => Id::generate().to_string(),
        };

        Ok(Self {
            server_url,
            data_dir,
            sync_interval: Duration::from_secs(sync_interval_secs),
            sync_max_attempts: u32::try_from(sync_max_attempts)
                .map_err(|_| ConfigError::Invalid(format!("{ENV_SYNC_MAX_ATTEMPTS} is too large")))?,
            lock_lease: Duration::from_secs(lock_lease_secs),
            instance_id,
        })
    }

    pub fn replica_db_path(&self) -> PathBuf {
        self.data_dir.join("replica.db")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn lock_table_path(&self) -> PathBuf {
        self.data_dir.join("locks.json")
    }
}

fn bounded(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = raw.parse::<u64>().map_err(|_| invalid())?;
    if !range.contains(&value) {
        return Err(invalid());
    }
    Ok(value)
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(map: &HashMap<&str, &str>) -> Result<ClientConfig, ConfigError> {
        ClientConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    fn minimal() -> HashMap<&'static str, &'static str> {
        let mut map = HashMap::new();
        map.insert(ENV_SERVER_URL, "https://cairn.example.com/");
        map.insert(ENV_DATA_DIR, "/var/lib/cairn");
        map
    }

    #[test]
    fn requires_server_url_and_data_dir() {
        let err = parse(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains(ENV_SERVER_URL));

        let mut map = HashMap::new();
        map.insert(ENV_SERVER_URL, "http://localhost:8080");
        let err = parse(&map).unwrap_err();
        assert!(err.to_string().contains(ENV_DATA_DIR));
    }

    #[test]
    fn applies_defaults_and_trims_url() {
        let config = parse(&minimal()).unwrap();
        assert_eq!(config.server_url, "https://cairn.example.com");
        assert_eq!(config.sync_interval, Duration::from_secs(60));
        assert_eq!(config.sync_max_attempts, 3);
        assert_eq!(config.lock_lease, Duration::from_secs(30));
        assert!(!config.instance_id.is_empty());
        assert_eq!(
            config.lock_table_path(),
            PathBuf::from("/var/lib/cairn/locks.json")
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut map = minimal();
        map.insert(ENV_SYNC_INTERVAL_SECS, "1");
        let err = parse(&map).unwrap_err();
        assert!(err.to_string().contains(ENV_SYNC_INTERVAL_SECS));

        let mut map = minimal();
        map.insert(ENV_SYNC_MAX_ATTEMPTS, "many");
        assert!(matches!(parse(&map), Err(ConfigError::Invalid(_))));

        let mut map = minimal();
        map.insert(ENV_SERVER_URL, "cairn.example.com");
        assert!(matches!(parse(&map), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validates_instance_id() {
        let mut map = minimal();
        map.insert(ENV_INSTANCE_ID, "laptop-1");
        assert_eq!(parse(&map).unwrap().instance_id, "laptop-1");

        map.insert(ENV_INSTANCE_ID, "bad id");
        assert!(matches!(parse(&map), Err(ConfigError::Invalid(_))));
    }
}
