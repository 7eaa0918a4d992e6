// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination writers.
//!
//! [`Writer`] is the capability a sink drives: connect, write one record, close. Protocol framing
//! lives entirely behind it. [`SyslogWriter`] speaks RFC 5424 over TCP, one record per line.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::constants::{SYSLOG_DIAL_TIMEOUT, SYSLOG_HOSTNAME};
use crate::errors::{DrainUrlError, WriterError};
use crate::util::parse_drain_url;

#[async_trait]
pub trait Writer: Send {
    async fn connect(&mut self) -> Result<(), WriterError>;

    /// Writes one record and returns the number of bytes put on the wire.
    async fn write(
        &mut self,
        priority: i32,
        message: &[u8],
        source_type: &str,
        source_instance: &str,
        timestamp: i64,
    ) -> Result<usize, WriterError>;

    async fn close(&mut self);
}

pub struct SyslogWriter {
    address: String,
    app_id: String,
    dial_timeout: Duration,
    connection: Option<TcpStream>,
}

impl SyslogWriter {
    pub fn new(drain_url: &str, app_id: impl Into<String>) -> Result<Self, DrainUrlError> {
        Ok(SyslogWriter {
            address: parse_drain_url(drain_url)?,
            app_id: app_id.into(),
            dial_timeout: SYSLOG_DIAL_TIMEOUT,
            connection: None,
        })
    }

    #[must_use]
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

#[async_trait]
impl Writer for SyslogWriter {
    async fn connect(&mut self) -> Result<(), WriterError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let stream = timeout(self.dial_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| WriterError::DialTimeout(self.address.clone()))??;
        stream.set_nodelay(true)?;
        debug!("Syslog writer connected to {}", self.address);
        self.connection = Some(stream);
        Ok(())
    }

    async fn write(
        &mut self,
        priority: i32,
        message: &[u8],
        source_type: &str,
        source_instance: &str,
        timestamp: i64,
    ) -> Result<usize, WriterError> {
        if priority < 0 {
            return Ok(0);
        }
        let connection = self.connection.as_mut().ok_or(WriterError::NotConnected)?;
        let record = format_message(
            priority,
            &self.app_id,
            message,
            source_type,
            source_instance,
            timestamp,
        );
        if let Err(e) = connection.write_all(&record).await {
            // A half-written stream can't be reused; the sink will reconnect.
            self.connection = None;
            return Err(e.into());
        }
        Ok(record.len())
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.shutdown().await {
                debug!("Error closing syslog connection to {}: {}", self.address, e);
            }
        }
    }
}

/// Formats one RFC 5424 record, newline terminated.
#[must_use]
pub fn format_message(
    priority: i32,
    app_id: &str,
    message: &[u8],
    source_type: &str,
    source_instance: &str,
    timestamp: i64,
) -> Vec<u8> {
    let timestamp =
        DateTime::from_timestamp_nanos(timestamp).to_rfc3339_opts(SecondsFormat::Micros, true);
    let mut end = message.len();
    while end > 0 && matches!(message[end - 1], b'\n' | b'\r') {
        end -= 1;
    }

    let mut record = format!(
        "<{priority}>1 {timestamp} {SYSLOG_HOSTNAME} {app_id} [{source_type}/{source_instance}] - - "
    )
    .into_bytes();
    record.extend_from_slice(&message[..end]);
    record.push(b'\n');
    record
}
