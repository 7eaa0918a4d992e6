// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{DEFAULT_MESSAGE_DRAIN_BUFFER_SIZE, DEFAULT_RECEIVE_BUFFER_BYTES};
use crate::errors::ConfigError;
use crate::event_listener::EventListenerConfig;
use crate::retry_strategy::{RetryStrategy, DEFAULT_MAX_EXPONENT};
use crate::syslog_sink::SyslogSinkConfig;
use crate::util::parse_drain_url;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_INCOMING_PORT: u16 = 3457;
const DEFAULT_SINK_INACTIVITY_TIMEOUT_SECONDS: u64 = 3600;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1000;
const DEFAULT_ORIGIN: &str = "doppler";
const DEFAULT_LOG_LEVEL: &str = "info";

/// A syslog drain registered for one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainDefinition {
    pub app_id: String,
    pub drain_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub incoming_port: u16,
    /// Requested SO_RCVBUF for the ingestion socket, in bytes
    pub receive_buffer_bytes: usize,
    /// Capacity of each sink's overflow buffer
    pub message_drain_buffer_size: usize,
    /// How long a sender may stay silent before its heartbeat session ends
    pub sink_inactivity_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub retry_max_exponent: u32,
    /// Origin tag on envelopes synthesized by this process
    pub origin: String,
    pub drains: Vec<DrainDefinition>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: DEFAULT_HOST.to_string(),
            incoming_port: DEFAULT_INCOMING_PORT,
            receive_buffer_bytes: DEFAULT_RECEIVE_BUFFER_BYTES,
            message_drain_buffer_size: DEFAULT_MESSAGE_DRAIN_BUFFER_SIZE,
            sink_inactivity_timeout: Duration::from_secs(DEFAULT_SINK_INACTIVITY_TIMEOUT_SECONDS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            retry_max_exponent: DEFAULT_MAX_EXPONENT,
            origin: DEFAULT_ORIGIN.to_string(),
            drains: Vec::new(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    /// Reads `DOPPLER_*` environment variables. Unset or empty variables keep their defaults.
    pub fn from_env() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let heartbeat_interval_ms: u64 =
            env_or("DOPPLER_HEARTBEAT_INTERVAL_MS", DEFAULT_HEARTBEAT_INTERVAL_MS)?;
        if heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "DOPPLER_HEARTBEAT_INTERVAL_MS",
                value: "0".to_string(),
            });
        }

        let drains = match env_value("DOPPLER_DRAINS") {
            Some(value) => parse_drains(&value)?,
            None => Vec::new(),
        };

        Ok(Config {
            host: env_value("DOPPLER_HOST").unwrap_or(defaults.host),
            incoming_port: env_or("DOPPLER_INCOMING_PORT", defaults.incoming_port)?,
            receive_buffer_bytes: env_or(
                "DOPPLER_RECEIVE_BUFFER_BYTES",
                defaults.receive_buffer_bytes,
            )?,
            message_drain_buffer_size: env_or(
                "DOPPLER_MESSAGE_DRAIN_BUFFER_SIZE",
                defaults.message_drain_buffer_size,
            )?,
            sink_inactivity_timeout: Duration::from_secs(env_or(
                "DOPPLER_SINK_INACTIVITY_TIMEOUT_SECONDS",
                DEFAULT_SINK_INACTIVITY_TIMEOUT_SECONDS,
            )?),
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            retry_max_exponent: env_or("DOPPLER_RETRY_MAX_EXPONENT", defaults.retry_max_exponent)?,
            origin: env_value("DOPPLER_ORIGIN").unwrap_or(defaults.origin),
            drains,
            log_level: env_value("DOPPLER_LOG_LEVEL")
                .map(|value| value.to_lowercase())
                .unwrap_or(defaults.log_level),
        })
    }

    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::ExponentialBackoff {
            base: Duration::from_millis(1),
            max_exponent: self.retry_max_exponent,
        }
    }

    #[must_use]
    pub fn listener_config(&self) -> EventListenerConfig {
        EventListenerConfig {
            host: self.host.clone(),
            port: self.incoming_port,
            receive_buffer_bytes: self.receive_buffer_bytes,
            ..EventListenerConfig::default()
        }
    }

    #[must_use]
    pub fn sink_config(&self, drain: &DrainDefinition) -> SyslogSinkConfig {
        SyslogSinkConfig {
            app_id: drain.app_id.clone(),
            drain_url: drain.drain_url.clone(),
            buffer_size: self.message_drain_buffer_size,
            retry_strategy: self.retry_strategy(),
            dropsonde_origin: self.origin.clone(),
        }
    }
}

/// Parses `app_id=syslog://host:port` pairs. Like tag lists, pairs may be separated by commas or
/// whitespace.
pub fn parse_drains(value: &str) -> Result<Vec<DrainDefinition>, ConfigError> {
    let normalized = value.replace(',', " ");
    normalized
        .split_whitespace()
        .map(|pair| {
            let Some((app_id, drain_url)) = pair.split_once('=') else {
                return Err(ConfigError::InvalidDrainDefinition(pair.to_string()));
            };
            if app_id.is_empty() {
                return Err(ConfigError::InvalidDrainDefinition(pair.to_string()));
            }
            parse_drain_url(drain_url)?;
            Ok(DrainDefinition {
                app_id: app_id.to_string(),
                drain_url: drain_url.to_string(),
            })
        })
        .collect()
}

fn env_value(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env_value(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}
