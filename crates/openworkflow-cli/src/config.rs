//! Worker boot configuration: environment variables over an optional
//! `openworkflow.toml` in the working directory. Deliberately not a full
//! project-config loader (that layer is an explicit out-of-scope
//! collaborator) — just enough key=value plumbing for the single `worker
//! start` boot surface.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub backend_url: String,
    pub namespace: String,
    pub concurrency: usize,
    pub lease_duration_ms: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("OPENWORKFLOW_DATABASE_URL is not set and no backend_url was found in openworkflow.toml")]
    MissingBackendUrl,

    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

impl WorkerConfig {
    /// Reads `openworkflow.toml` (if present) for defaults, then lets
    /// environment variables override every field.
    pub fn load(concurrency_override: Option<usize>) -> Result<Self, ConfigError> {
        let file_values = read_config_file(Path::new("openworkflow.toml"));

        let backend_url = std::env::var("OPENWORKFLOW_DATABASE_URL")
            .ok()
            .or_else(|| file_values.get("backend_url").cloned())
            .ok_or(ConfigError::MissingBackendUrl)?;

        let namespace = std::env::var("OPENWORKFLOW_NAMESPACE")
            .ok()
            .or_else(|| file_values.get("namespace").cloned())
            .unwrap_or_else(|| "default".to_string());

        let concurrency = concurrency_override
            .or_else(|| {
                std::env::var("OPENWORKFLOW_CONCURRENCY")
                    .ok()
                    .or_else(|| file_values.get("concurrency").cloned())
                    .map(|raw| parse_field("concurrency", &raw))
                    .transpose()
                    .ok()
                    .flatten()
            })
            .unwrap_or(10);

        let lease_duration_ms = std::env::var("OPENWORKFLOW_LEASE_DURATION_MS")
            .ok()
            .or_else(|| file_values.get("lease_duration_ms").cloned())
            .map(|raw| parse_field("lease_duration_ms", &raw))
            .transpose()?
            .unwrap_or(30_000);

        Ok(Self {
            backend_url,
            namespace,
            concurrency,
            lease_duration_ms,
        })
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            field,
            value: raw.to_string(),
        })
}

/// Minimal `key = value` reader, one assignment per line, `#` comments,
/// quotes around the value optional. Not a TOML parser.
fn read_config_file(path: &Path) -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };

    contents
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            let value = value.trim().trim_matches('"');
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_override_wins_over_everything() {
        std::env::remove_var("OPENWORKFLOW_CONCURRENCY");
        std::env::set_var("OPENWORKFLOW_DATABASE_URL", "sqlite::memory:");
        let config = WorkerConfig::load(Some(5)).unwrap();
        assert_eq!(config.concurrency, 5);
        std::env::remove_var("OPENWORKFLOW_DATABASE_URL");
    }

    #[test]
    fn missing_backend_url_is_an_error() {
        std::env::remove_var("OPENWORKFLOW_DATABASE_URL");
        let err = WorkerConfig::load(None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBackendUrl));
    }
}
