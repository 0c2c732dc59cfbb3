// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Logfleet core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL.
    pub database_url: String,
    /// Fleet-wide orchestration settings.
    pub settings: FleetSettings,
}

/// Tunable settings shared by the orchestrator, command builder, and
/// background workers.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// Base directory for generated deploy paths. A relative value is
    /// resolved under the remote user's home directory.
    pub deploy_base_dir: String,
    /// Local path to the agent package tarball uploaded during initialize.
    /// When unset, initialize assumes the agent binaries are pre-installed.
    pub agent_package: Option<String>,
    /// How long a graceful stop waits for the process to exit.
    pub graceful_stop_timeout: Duration,
    /// How long a force-stop waits before giving up on confirming exit.
    pub force_stop_timeout: Duration,
    /// Interval between remote liveness polls.
    pub poll_interval: Duration,
    /// Liveness verification attempts after a launch.
    pub verify_attempts: u32,
    /// Bound on waiting for async directory deletion during cleanup.
    pub directory_delete_timeout: Duration,
    /// Bound on waiting for instances to finish initializing before the
    /// default-config backfill gives up.
    pub backfill_timeout: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            deploy_base_dir: "logfleet".to_string(),
            agent_package: None,
            graceful_stop_timeout: Duration::from_secs(360),
            force_stop_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(3),
            verify_attempts: 5,
            directory_delete_timeout: Duration::from_secs(60),
            backfill_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `LOGFLEET_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `LOGFLEET_DEPLOY_BASE_DIR`: base dir for generated deploy paths (default: `logfleet`)
    /// - `LOGFLEET_AGENT_PACKAGE`: local agent tarball uploaded during initialize
    /// - `LOGFLEET_STOP_TIMEOUT_SECS`: graceful stop wait (default: 360)
    /// - `LOGFLEET_FORCE_STOP_TIMEOUT_SECS`: force-stop wait (default: 180)
    /// - `LOGFLEET_POLL_INTERVAL_SECS`: liveness poll interval (default: 3)
    /// - `LOGFLEET_VERIFY_ATTEMPTS`: post-launch verification attempts (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("LOGFLEET_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("LOGFLEET_DATABASE_URL"))?;

        let mut settings = FleetSettings::default();

        if let Ok(dir) = std::env::var("LOGFLEET_DEPLOY_BASE_DIR")
            && !dir.trim().is_empty()
        {
            settings.deploy_base_dir = dir;
        }
        if let Ok(pkg) = std::env::var("LOGFLEET_AGENT_PACKAGE")
            && !pkg.trim().is_empty()
        {
            settings.agent_package = Some(pkg);
        }
        settings.graceful_stop_timeout =
            duration_var("LOGFLEET_STOP_TIMEOUT_SECS", settings.graceful_stop_timeout)?;
        settings.force_stop_timeout = duration_var(
            "LOGFLEET_FORCE_STOP_TIMEOUT_SECS",
            settings.force_stop_timeout,
        )?;
        settings.poll_interval = duration_var("LOGFLEET_POLL_INTERVAL_SECS", settings.poll_interval)?;
        if let Ok(raw) = std::env::var("LOGFLEET_VERIFY_ATTEMPTS") {
            settings.verify_attempts = raw.parse().map_err(|_| {
                ConfigError::Invalid("LOGFLEET_VERIFY_ATTEMPTS", "must be a positive integer")
            })?;
        }

        Ok(Self {
            database_url,
            settings,
        })
    }
}

fn duration_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid(name, "must be a number of seconds"))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
