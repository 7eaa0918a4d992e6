// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Doppler: ingestion-to-delivery core of a log and metric aggregation daemon.
//!
//! Envelopes arrive as UDP datagrams on the [`event_listener`], are decoded by the
//! [`unmarshaller`], routed per app by the [`sink_manager`] and delivered to external drains by
//! [`syslog_sink`] instances. Each sink absorbs bursts with a [`truncating_buffer`] and retries
//! unreachable drains according to a [`retry_strategy`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod constants;
pub mod envelope;
pub mod errors;
pub mod event_listener;
pub mod heartbeat;
pub mod instrumentation;
pub mod retry_strategy;
pub mod sink_manager;
pub mod syslog_sink;
pub mod syslog_writer;
pub mod truncating_buffer;
pub mod unmarshaller;
pub mod util;
