// Copyright (C) 2025 Stagecast
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for the fleet service.
//!
//! All settings come from environment variables (loaded from `.env` in
//! development via dotenvy). Only `STAGECAST_DATABASE_URL` is required;
//! everything else has a production default.

use std::time::Duration;

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),

    /// An environment variable holds a value that does not parse.
    #[error("Invalid value for {name}: {value}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Service configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL (`STAGECAST_DATABASE_URL`).
    pub database_url: String,
    /// Image instances run (`STAGECAST_IMAGE`).
    pub image: String,
    /// First port considered for allocation (`STAGECAST_BASE_PORT`).
    pub base_port: u16,
    /// Number of ports scanned above the base (`STAGECAST_PORT_RANGE`).
    pub port_range: u16,
    /// How often the health reconciler polls (`STAGECAST_RECONCILE_INTERVAL_SECS`).
    pub reconcile_interval: Duration,
    /// How often the workload sweeper runs (`STAGECAST_SWEEP_INTERVAL_SECS`).
    pub sweep_interval: Duration,
    /// Grace period given to a workload on stop (`STAGECAST_STOP_GRACE_SECS`).
    pub stop_grace: Duration,
}

/// Default image launched for new instances.
pub const DEFAULT_IMAGE: &str = "stagecast/studio:latest";

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STAGECAST_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("STAGECAST_DATABASE_URL"))?;

        let image =
            std::env::var("STAGECAST_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string());

        let base_port = parse_var("STAGECAST_BASE_PORT", crate::ports::BASE_PORT)?;
        let port_range = parse_var("STAGECAST_PORT_RANGE", crate::ports::DEFAULT_PORT_RANGE)?;
        let reconcile_secs: u64 = parse_var("STAGECAST_RECONCILE_INTERVAL_SECS", 30)?;
        let sweep_secs: u64 = parse_var("STAGECAST_SWEEP_INTERVAL_SECS", 3600)?;
        let stop_grace_secs: u64 = parse_var("STAGECAST_STOP_GRACE_SECS", 30)?;

        Ok(Self {
            database_url,
            image,
            base_port,
            port_range,
            reconcile_interval: Duration::from_secs(reconcile_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            stop_grace: Duration::from_secs(stop_grace_secs),
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("STAGECAST_DATABASE_URL");
        assert_eq!(
            err.to_string(),
            "Missing required environment variable: STAGECAST_DATABASE_URL"
        );

        let err = ConfigError::InvalidValue {
            name: "STAGECAST_BASE_PORT",
            value: "not-a-port".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid value for STAGECAST_BASE_PORT: not-a-port"
        );
    }

    #[test]
    fn test_parse_var_defaults_when_unset() {
        // Variable name chosen to never exist in the test environment.
        let port: u16 = parse_var("STAGECAST_TEST_UNSET_VAR", 5656).unwrap();
        assert_eq!(port, 5656);
    }
}
