//! Configuration management for Outpost.
//!
//! Handles loading and accessing configuration values from environment
//! variables with fallback to default values.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration values used when not specified in environment.
pub mod defaults {
    /// Per-interval record limit applied to at-least-once consumers.
    pub const KAFKA_THROTTLING_LIMIT: u64 = 100;
    /// Interval over which the consumer record limit applies.
    pub const KAFKA_THROTTLING_INTERVAL_MS: u64 = 1_000;
    /// Bounded parallelism of the at-least-once consumer stream.
    pub const KAFKA_MAX_IN_FLIGHT: usize = 100;
    /// Tolerance subtracted from the rescaled throttling limit.
    pub const KAFKA_THROTTLING_TOLERANCE: f64 = 0.05;

    /// Bounded parallelism of the HTTP push dispatch stage.
    pub const HTTP_PUSH_PARALLELISM: usize = 10;

    pub const ACK_TIMEOUT_MS: u64 = 10_000;
    pub const REQUEST_TIMEOUT_MS: u64 = 60_000;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

    pub const COMMIT_ON_TRANSFORM_FAILURE: bool = true;
}

/// Application configuration loaded from environment variables.
///
/// All fields are optional and fall back to values in the `defaults` module.
/// Environment variables are prefixed with `OUTPOST_` when loading.
///
/// # Environment Variables
/// * `OUTPOST_KAFKA_THROTTLING_LIMIT`        - Consumer records per interval
/// * `OUTPOST_KAFKA_THROTTLING_INTERVAL_MS`  - Consumer throttling interval
/// * `OUTPOST_KAFKA_MAX_IN_FLIGHT`           - Consumer bounded parallelism
/// * `OUTPOST_KAFKA_THROTTLING_TOLERANCE`    - Throttling detection tolerance
/// * `OUTPOST_COMMIT_ON_TRANSFORM_FAILURE`   - Commit offsets of non-retryable transform failures
/// * `OUTPOST_HTTP_PUSH_PARALLELISM`         - Publisher bounded parallelism
/// * `OUTPOST_ACK_TIMEOUT_MS`                - Per-label acknowledgement deadline
/// * `OUTPOST_REQUEST_TIMEOUT_MS`            - Transport dispatch deadline
/// * `OUTPOST_SHUTDOWN_TIMEOUT_MS`           - Drain budget when closing a connection
/// * `OUTPOST_DEFINITIONS_PATH`              - Connection definitions file for the daemon
#[derive(Clone, Default, Deserialize)]
pub struct Config {
    pub kafka_throttling_limit: Option<u64>,
    pub kafka_throttling_interval_ms: Option<u64>,
    pub kafka_max_in_flight: Option<usize>,
    pub kafka_throttling_tolerance: Option<f64>,

    pub commit_on_transform_failure: Option<bool>,

    pub http_push_parallelism: Option<usize>,

    pub ack_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub shutdown_timeout_ms: Option<u64>,

    pub definitions_path: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Reads variables prefixed with `OUTPOST_` and constructs a Config instance.
    /// Falls back to default values for any unspecified settings.
    pub fn load() -> eyre::Result<Self> {
        let config = envy::prefixed("OUTPOST_").from_env::<Self>()?;

        if let Some(tolerance) = config.kafka_throttling_tolerance {
            if !(0.0..1.0).contains(&tolerance) {
                eyre::bail!("throttling tolerance must be within [0, 1), got {tolerance}");
            }
        }

        Ok(config)
    }

    pub fn kafka_throttling_limit(&self) -> u64 {
        self.kafka_throttling_limit
            .unwrap_or(defaults::KAFKA_THROTTLING_LIMIT)
    }

    pub fn kafka_throttling_interval(&self) -> Duration {
        Duration::from_millis(
            self.kafka_throttling_interval_ms
                .unwrap_or(defaults::KAFKA_THROTTLING_INTERVAL_MS),
        )
    }

    pub fn kafka_max_in_flight(&self) -> usize {
        self.kafka_max_in_flight
            .unwrap_or(defaults::KAFKA_MAX_IN_FLIGHT)
    }

    pub fn kafka_throttling_tolerance(&self) -> f64 {
        self.kafka_throttling_tolerance
            .unwrap_or(defaults::KAFKA_THROTTLING_TOLERANCE)
    }

    pub fn commit_on_transform_failure(&self) -> bool {
        self.commit_on_transform_failure
            .unwrap_or(defaults::COMMIT_ON_TRANSFORM_FAILURE)
    }

    pub fn http_push_parallelism(&self) -> usize {
        self.http_push_parallelism
            .unwrap_or(defaults::HTTP_PUSH_PARALLELISM)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms.unwrap_or(defaults::ACK_TIMEOUT_MS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(
            self.request_timeout_ms
                .unwrap_or(defaults::REQUEST_TIMEOUT_MS),
        )
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(
            self.shutdown_timeout_ms
                .unwrap_or(defaults::SHUTDOWN_TIMEOUT_MS),
        )
    }

    pub fn definitions_path(&self) -> Option<&str> {
        self.definitions_path.as_deref()
    }

    /// Builds a config for tests with a small consumer in-flight bound.
    #[cfg(test)]
    pub(crate) fn for_tests(max_in_flight: usize) -> Self {
        Self {
            kafka_max_in_flight: Some(max_in_flight),
            ack_timeout_ms: Some(250),
            request_timeout_ms: Some(250),
            shutdown_timeout_ms: Some(250),
            ..Self::default()
        }
    }
}
