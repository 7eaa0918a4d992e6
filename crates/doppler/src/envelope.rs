// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Envelope model shared by every pipeline stage.
//!
//! An [`Envelope`] wraps exactly one event. Sinks that forward logs only look at
//! [`Envelope::event_type`] and skip everything that is not a [`EventType::LogMessage`].

use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum EventType {
    LogMessage,
    CounterEvent,
    ValueMetric,
    Heartbeat,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum MessageType {
    #[display("OUT")]
    Out,
    #[display("ERR")]
    Err,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub message: Vec<u8>,
    pub message_type: MessageType,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub source_instance: String,
}

impl LogMessage {
    /// Syslog PRI value for the message: user.info for stdout, user.err for stderr.
    #[must_use]
    pub fn priority(&self) -> i32 {
        match self.message_type {
            MessageType::Out => 14,
            MessageType::Err => 11,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEvent {
    pub name: String,
    pub delta: u64,
    #[serde(default)]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sent_count: u64,
    pub received_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub source: String,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LogMessage(LogMessage),
    CounterEvent(CounterEvent),
    ValueMetric(ValueMetric),
    Heartbeat(Heartbeat),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: String,
    /// Nanoseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    pub event: Event,
}

impl Envelope {
    #[must_use]
    pub fn new(origin: impl Into<String>, event: Event) -> Self {
        Envelope {
            origin: origin.into(),
            timestamp: now_nanos(),
            event,
        }
    }

    /// Builds a log envelope, the kind drains forward.
    #[must_use]
    pub fn log(
        origin: impl Into<String>,
        app_id: impl Into<String>,
        message: impl Into<Vec<u8>>,
        message_type: MessageType,
    ) -> Self {
        let timestamp = now_nanos();
        Envelope {
            origin: origin.into(),
            timestamp,
            event: Event::LogMessage(LogMessage {
                message: message.into(),
                message_type,
                timestamp,
                app_id: Some(app_id.into()),
                source_type: String::new(),
                source_instance: String::new(),
            }),
        }
    }

    #[must_use]
    pub fn counter(origin: impl Into<String>, name: impl Into<String>, delta: u64) -> Self {
        Self::new(
            origin,
            Event::CounterEvent(CounterEvent {
                name: name.into(),
                delta,
                total: None,
            }),
        )
    }

    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self.event {
            Event::LogMessage(_) => EventType::LogMessage,
            Event::CounterEvent(_) => EventType::CounterEvent,
            Event::ValueMetric(_) => EventType::ValueMetric,
            Event::Heartbeat(_) => EventType::Heartbeat,
            Event::Error(_) => EventType::Error,
        }
    }

    #[must_use]
    pub fn log_message(&self) -> Option<&LogMessage> {
        match &self.event {
            Event::LogMessage(log) => Some(log),
            _ => None,
        }
    }

    /// App id used to route the envelope to drains. Only log messages carry one.
    #[must_use]
    pub fn app_id(&self) -> Option<&str> {
        self.log_message().and_then(|log| log.app_id.as_deref())
    }
}

fn now_nanos() -> i64 {
    std::time::UNIX_EPOCH
        .elapsed()
        .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_of_log() {
        let envelope = Envelope::log("origin", "app", "hello", MessageType::Out);
        assert_eq!(envelope.event_type(), EventType::LogMessage);
        assert_eq!(envelope.app_id(), Some("app"));
    }

    #[test]
    fn test_counter_has_no_app_id() {
        let envelope = Envelope::counter("origin", "some.counter", 3);
        assert_eq!(envelope.event_type(), EventType::CounterEvent);
        assert!(envelope.log_message().is_none());
        assert_eq!(envelope.app_id(), None);
    }

    #[test]
    fn test_priority() {
        let out = Envelope::log("o", "a", "m", MessageType::Out);
        let err = Envelope::log("o", "a", "m", MessageType::Err);
        assert_eq!(out.log_message().unwrap().priority(), 14);
        assert_eq!(err.log_message().unwrap().priority(), 11);
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "origin": "router",
            "timestamp": 42,
            "event": {
                "LogMessage": {
                    "message": [104, 105],
                    "message_type": "Err",
                    "timestamp": 42,
                    "app_id": "app-1",
                    "source_type": "APP",
                    "source_instance": "0"
                }
            }
        }"#;
        let envelope: Envelope = serde_json::from_str(json).unwrap();
        let log = envelope.log_message().unwrap();
        assert_eq!(log.message, b"hi");
        assert_eq!(log.message_type, MessageType::Err);
        assert_eq!(envelope.app_id(), Some("app-1"));
    }
}
