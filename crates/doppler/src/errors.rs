// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised while starting the ingestion listener. A bind failure is fatal to the daemon.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Listener was already started")]
    AlreadyStarted,
}

/// Errors from a destination writer. All of them are retriable from the sink's point of view.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Writer is not connected")]
    NotConnected,
    #[error("Timed out dialing {0}")]
    DialTimeout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DrainUrlError {
    #[error("Unsupported drain scheme in {0}, expected syslog://")]
    UnsupportedScheme(String),
    #[error("Drain {0} is missing a host:port")]
    MissingAddress(String),
    #[error("Drain {0} has an invalid port")]
    InvalidPort(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },
    #[error("Invalid drain definition {0:?}, expected app_id=url")]
    InvalidDrainDefinition(String),
    #[error(transparent)]
    DrainUrl(#[from] DrainUrlError),
}

#[derive(Debug, Error)]
pub enum UnmarshalError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}
