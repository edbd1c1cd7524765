use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

const MIN_FIELD_BYTES: usize = 1024;
const MAX_FIELD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Largest accepted multipart part, files included
    pub max_field_bytes: usize,
    pub compact_on_start: bool,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("data_dir", &self.data_dir)
            .field("password", &"[REDACTED]")
            .field("max_field_bytes", &self.max_field_bytes)
            .field("compact_on_start", &self.compact_on_start)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "CAIRN_API_BIND_ADDR", "127.0.0.1:8080");
        let data_dir = PathBuf::from(required_trimmed(&lookup, "CAIRN_DATA_DIR")?);
        let password = required_trimmed(&lookup, "CAIRN_PASSWORD")?;

        let max_field_bytes = value_or_default(
            &lookup,
            "CAIRN_MAX_FIELD_BYTES",
            &cairn_core::multipart::DEFAULT_MAX_FIELD_BYTES.to_string(),
        )
        .parse::<usize>()
        .map_err(|_| {
            ConfigError::Invalid("CAIRN_MAX_FIELD_BYTES must be an integer".to_string())
        })?;
        if !(MIN_FIELD_BYTES..=MAX_FIELD_BYTES).contains(&max_field_bytes) {
            return Err(ConfigError::Invalid(format!(
                "CAIRN_MAX_FIELD_BYTES must be in [{MIN_FIELD_BYTES}, {MAX_FIELD_BYTES}]"
            )));
        }

        let compact_on_start = match value_or_default(&lookup, "CAIRN_COMPACT_ON_START", "false")
            .to_ascii_lowercase()
            .as_str()
        {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "CAIRN_COMPACT_ON_START must be true or false".to_string(),
                ))
            }
        };

        Ok(Self {
            bind_addr,
            data_dir,
            password,
            max_field_bytes,
            compact_on_start,
        })
    }

    /// Temporary home of multipart uploads until they are applied
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    cairn_core::util::normalize_text_option(lookup(name))
}
