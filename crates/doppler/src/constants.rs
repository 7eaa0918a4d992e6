// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Max theoretical UDP payload size; the listener's scratch buffer is this large.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Pending raw payloads the listener will queue before a read blocks on publish.
pub const LISTENER_QUEUE_CAPACITY: usize = 1_024;

/// Requested SO_RCVBUF for the ingestion socket, large enough to absorb bursts.
pub const DEFAULT_RECEIVE_BUFFER_BYTES: usize = 50 * 1_024 * 1_024;

/// Capacity of the channel between the unmarshaller and the sink manager.
pub const ENVELOPE_QUEUE_CAPACITY: usize = 1_024;

/// Capacity of each sink's input channel, ahead of its truncating buffer.
pub const SINK_INPUT_CAPACITY: usize = 64;

pub const DEFAULT_MESSAGE_DRAIN_BUFFER_SIZE: usize = 100;

/// Name of the counter event a truncating buffer emits when it evicts messages.
pub const DROPPED_MESSAGES_COUNTER: &str = "TruncatingBuffer.DroppedMessages";

/// Hostname field written into every syslog record.
pub const SYSLOG_HOSTNAME: &str = "loggregator";

pub const SYSLOG_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload sent to a sender to ask for a heartbeat.
pub const HEARTBEAT_REQUEST: &[u8] = b"heartbeat-request";
