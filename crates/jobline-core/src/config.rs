// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;

/// Jobline configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Maximum connections in the database pool
    pub max_connections: u32,
    /// Delay between status checks while waiting on a process
    pub wait_poll_interval: Duration,
    /// Directory payload archives are written to
    pub archive_dir: Option<PathBuf>,
    /// Release a claimed process when its archive can't be built
    pub release_on_archive_failure: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `JOBLINE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `JOBLINE_MAX_CONNECTIONS`: Pool size (default: 10)
    /// - `JOBLINE_WAIT_POLL_INTERVAL_MS`: Sync wait poll interval (default: 1000)
    /// - `JOBLINE_ARCHIVE_DIR`: Payload archive directory (default: system temp dir)
    /// - `JOBLINE_RELEASE_ON_ARCHIVE_FAILURE`: `true` or `false` (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("JOBLINE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("JOBLINE_DATABASE_URL"))?;

        let max_connections: u32 = std::env::var("JOBLINE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "JOBLINE_MAX_CONNECTIONS",
                "must be a positive integer",
            ))?;

        let wait_poll_interval_ms: u64 = std::env::var("JOBLINE_WAIT_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "JOBLINE_WAIT_POLL_INTERVAL_MS",
                "must be a positive number of milliseconds",
            ))?;

        let archive_dir = std::env::var("JOBLINE_ARCHIVE_DIR")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);

        let release_on_archive_failure: bool =
            std::env::var("JOBLINE_RELEASE_ON_ARCHIVE_FAILURE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "JOBLINE_RELEASE_ON_ARCHIVE_FAILURE",
                        "must be true or false",
                    )
                })?;

        Ok(Self {
            database_url,
            max_connections,
            wait_poll_interval: Duration::from_millis(wait_poll_interval_ms),
            archive_dir,
            release_on_archive_failure,
        })
    }

    /// Engine options derived from this configuration.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            poll_interval: self.wait_poll_interval,
            archive_dir: self.archive_dir.clone(),
            release_on_archive_failure: self.release_on_archive_failure,
        }
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
