//! Configuration management for the upload server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::upload::{HashAlgorithm, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE, SESSION_EXPIRY_HOURS};

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Chunked upload settings, passed explicitly to the upload service
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root of the per-session chunk directories
    pub chunk_dir: PathBuf,

    /// Directory receiving merged artifacts
    pub artifact_dir: PathBuf,

    /// Largest chunk size the server hands out
    pub max_chunk_size: u64,

    /// Largest file accepted at init
    pub max_file_size: u64,

    /// Lifetime of a session before the sweeper may reclaim it
    pub session_ttl_hours: i64,

    /// Background sweep period
    pub sweep_interval_secs: u64,

    /// Digest used for chunk and whole-file hashes
    pub hash_algorithm: HashAlgorithm,

    /// Keep completed sessions when they pass their expiry
    pub retain_completed: bool,
}

impl UploadConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Request body limit for chunk uploads, leaving room for multipart framing
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.max_chunk_size)
            .unwrap_or(usize::MAX)
            .saturating_add(1024 * 1024)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            chunk_dir: PathBuf::from("/tmp/chunks"),
            artifact_dir: PathBuf::from("/tmp/uploads"),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            session_ttl_hours: SESSION_EXPIRY_HOURS,
            sweep_interval_secs: 300,
            hash_algorithm: HashAlgorithm::Md5,
            retain_completed: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./uploads.db".to_string(),
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = UploadConfig::default();

        let upload = UploadConfig {
            chunk_dir: env::var("UPLOAD_CHUNK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.chunk_dir),
            artifact_dir: env::var("UPLOAD_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            max_chunk_size: parse_var("UPLOAD_MAX_CHUNK_SIZE", defaults.max_chunk_size)?,
            max_file_size: parse_var("UPLOAD_MAX_FILE_SIZE", defaults.max_file_size)?,
            session_ttl_hours: parse_var("UPLOAD_SESSION_TTL_HOURS", defaults.session_ttl_hours)?,
            sweep_interval_secs: parse_var("UPLOAD_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            hash_algorithm: parse_var("UPLOAD_HASH_ALGORITHM", defaults.hash_algorithm)?,
            retain_completed: parse_var("UPLOAD_RETAIN_COMPLETED", defaults.retain_completed)?,
        };

        if upload.max_chunk_size == 0 {
            return Err(invalid("UPLOAD_MAX_CHUNK_SIZE", "0", "must be positive"));
        }
        if upload.session_ttl_hours <= 0 {
            return Err(invalid(
                "UPLOAD_SESSION_TTL_HOURS",
                &upload.session_ttl_hours.to_string(),
                "must be positive",
            ));
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 3000)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./uploads.db".to_string()),
            },
            upload,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse an optional variable, falling back to `default` when unset
fn parse_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &value, &e.to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.upload.max_chunk_size, 2 * 1024 * 1024);
        assert_eq!(config.upload.session_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.upload.hash_algorithm, HashAlgorithm::Md5);
        assert!(config.upload.retain_completed);
        assert!(config.upload.body_limit() > config.upload.max_chunk_size as usize);
    }

    #[test]
    fn test_parse_var_reports_key() {
        env::set_var("UPLOAD_TEST_BAD_NUMBER", "twelve");
        let err = parse_var::<u64>("UPLOAD_TEST_BAD_NUMBER", 1).unwrap_err();
        assert!(err.to_string().contains("UPLOAD_TEST_BAD_NUMBER"));
        env::remove_var("UPLOAD_TEST_BAD_NUMBER");

        assert_eq!(parse_var::<u64>("UPLOAD_TEST_UNSET", 7).unwrap(), 7);
    }
}
