//! Configuration management for the attachment server

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::upload::{DEFAULT_MAX_CHUNK_SIZE, MAX_FILE_SIZE};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
    pub reaper: ReaperConfig,
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

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Destination root for committed artifacts
    pub artifact_dir: PathBuf,
    /// Root for in-flight chunk directories
    pub staging_dir: PathBuf,
    /// Largest declared file size accepted by `initiate`
    pub max_file_size: u64,
    /// Request body limit for a single chunk upload
    pub max_chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Idle time after which an IN_PROGRESS session counts as abandoned
    pub in_progress_ttl: Duration,
    /// Age after which FAILED_* sessions are removed
    pub failed_ttl: Duration,
    /// Age after which COMPLETED/CANCELLED records are removed (never if unset)
    pub terminal_ttl: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Artifact and staging directories must differ: {0}")]
    SharedRoot(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

const HOUR: u64 = 60 * 60;

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./attachments.db".to_string(),
            },
            upload: UploadConfig {
                artifact_dir: PathBuf::from("./uploads/files"),
                staging_dir: PathBuf::from("./uploads/staging"),
                max_file_size: MAX_FILE_SIZE,
                max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            },
            reaper: ReaperConfig::default(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            interval: Duration::from_secs(24 * HOUR),
            in_progress_ttl: Duration::from_secs(24 * HOUR),
            failed_ttl: Duration::from_secs(6 * HOUR),
            terminal_ttl: None,
        }
    }
}

impl Config {
    /// Read configuration from the environment
    ///
    /// Unset variables take their defaults; a variable that is set but
    /// invalid is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT")?.unwrap_or(defaults.server.port),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                artifact_dir: env::var("UPLOAD_ARTIFACT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.artifact_dir),
                staging_dir: env::var("UPLOAD_STAGING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.staging_dir),
                max_file_size: parse_var("UPLOAD_MAX_FILE_SIZE")?
                    .unwrap_or(defaults.upload.max_file_size),
                max_chunk_size: parse_var("UPLOAD_MAX_CHUNK_SIZE")?
                    .unwrap_or(defaults.upload.max_chunk_size),
            },
            reaper: ReaperConfig {
                interval: parse_var::<u64>("REAPER_INTERVAL_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.reaper.interval),
                in_progress_ttl: parse_hours("REAPER_IN_PROGRESS_TTL_HOURS")?
                    .unwrap_or(defaults.reaper.in_progress_ttl),
                failed_ttl: parse_hours("REAPER_FAILED_TTL_HOURS")?
                    .unwrap_or(defaults.reaper.failed_ttl),
                terminal_ttl: parse_hours("REAPER_TERMINAL_TTL_HOURS")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the upload pipeline cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.artifact_dir == self.upload.staging_dir {
            return Err(ConfigError::SharedRoot(
                self.upload.artifact_dir.display().to_string(),
            ));
        }

        let zero_checks = [
            ("REAPER_INTERVAL_SECS", self.reaper.interval),
            ("REAPER_IN_PROGRESS_TTL_HOURS", self.reaper.in_progress_ttl),
            ("REAPER_FAILED_TTL_HOURS", self.reaper.failed_ttl),
        ];
        for (name, value) in zero_checks {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: "0".to_string(),
                });
            }
        }

        if self.upload.max_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "UPLOAD_MAX_CHUNK_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}

fn parse_hours(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(name)?.map(|hours| Duration::from_secs(hours * HOUR)))
}
