// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-drain delivery.
//!
//! A [`SyslogSink`] owns one [`Writer`] and one [`TruncatingBuffer`]. Its run loop alternates
//! between connecting (with backoff) and forwarding buffered log messages, so a slow or dead
//! drain only ever costs its own buffer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use derive_more::Display;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::constants::SINK_INPUT_CAPACITY;
use crate::envelope::{Envelope, EventType};
use crate::instrumentation::{Context, Instrumentable, Metric};
use crate::retry_strategy::RetryStrategy;
use crate::syslog_writer::Writer;
use crate::truncating_buffer::{BufferMonitor, TruncatingBuffer};

/// Receives `(message, app_id, drain_url)` whenever a drain can't be reached.
pub type ErrorHandler = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// A running delivery target, as seen by the sink manager.
#[async_trait]
pub trait Sink: Instrumentable + Send + Sync {
    /// Delivers envelopes from `input` until it closes or the sink is disconnected.
    async fn run(&self, input: mpsc::Receiver<Envelope>);

    /// Stops the sink. Returns `true` only for the call that actually triggered the shutdown.
    fn disconnect(&self) -> bool;

    fn identifier(&self) -> &str;

    fn stream_id(&self) -> &str;

    fn should_receive_errors(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct SyslogSinkConfig {
    pub app_id: String,
    pub drain_url: String,
    pub buffer_size: usize,
    pub retry_strategy: RetryStrategy,
    pub dropsonde_origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum ConnectState {
    #[display("disconnected")]
    Disconnected,
    #[display("connected")]
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkMetrics {
    pub sent_message_count: u64,
    pub sent_byte_count: u64,
    pub current_retry_attempt: u64,
    pub connected: bool,
    pub dropped_message_count: u64,
}

#[derive(Debug, Default)]
struct SinkCounters {
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    retry_attempt: AtomicU64,
    connected: AtomicBool,
}

pub struct SyslogSink<W> {
    config: SyslogSinkConfig,
    writer: Mutex<W>,
    error_handler: ErrorHandler,
    cancel_token: CancellationToken,
    disconnected: AtomicBool,
    counters: SinkCounters,
    buffer: StdMutex<Option<BufferMonitor>>,
}

impl<W: Writer> SyslogSink<W> {
    #[must_use]
    pub fn new(config: SyslogSinkConfig, writer: W, error_handler: ErrorHandler) -> Self {
        SyslogSink {
            config,
            writer: Mutex::new(writer),
            error_handler,
            cancel_token: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
            counters: SinkCounters::default(),
            buffer: StdMutex::new(None),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> SinkMetrics {
        let dropped_message_count = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |buffer| buffer.metrics().dropped_message_count);
        SinkMetrics {
            sent_message_count: self.counters.sent_messages.load(Ordering::Relaxed),
            sent_byte_count: self.counters.sent_bytes.load(Ordering::Relaxed),
            current_retry_attempt: self.counters.retry_attempt.load(Ordering::Relaxed),
            connected: self.counters.connected.load(Ordering::Relaxed),
            dropped_message_count,
        }
    }

    fn set_state(&self, state: ConnectState, attempts: u32) {
        self.counters
            .connected
            .store(state == ConnectState::Connected, Ordering::Relaxed);
        self.counters
            .retry_attempt
            .store(u64::from(attempts), Ordering::Relaxed);
    }

    async fn deliver(&self, input: mpsc::Receiver<Envelope>) {
        let drain_url = self.config.drain_url.as_str();
        info!("Syslog Sink {}: Running.", drain_url);

        let filter_stop = self.cancel_token.child_token();
        let (filtered_tx, filtered_rx) = mpsc::channel(SINK_INPUT_CAPACITY);
        let filter = tokio::spawn(forward_logs(input, filtered_tx, filter_stop.clone()));
        let mut buffer = TruncatingBuffer::run(
            filtered_rx,
            self.config.buffer_size,
            self.config.dropsonde_origin.clone(),
            drain_url,
        );
        *self.buffer.lock().unwrap_or_else(PoisonError::into_inner) = Some(buffer.monitor());

        let mut writer = self.writer.lock().await;
        let mut state = ConnectState::Disconnected;
        let mut attempts: u32 = 0;

        loop {
            match state {
                ConnectState::Disconnected => {
                    let connected = tokio::select! {
                        biased;
                        () = self.cancel_token.cancelled() => break,
                        result = writer.connect() => result,
                    };
                    match connected {
                        Ok(()) => {
                            state = ConnectState::Connected;
                            self.set_state(state, attempts);
                            info!("Syslog Sink {}: successfully connected.", drain_url);
                        }
                        Err(e) => {
                            let backoff = self.config.retry_strategy.duration(attempts);
                            let message = format!(
                                "Syslog Sink {drain_url}: Error when dialing out. Backing off for {backoff:?}. Err: {e}"
                            );
                            (self.error_handler)(&message, &self.config.app_id, drain_url);

                            tokio::select! {
                                () = sleep(backoff) => {}
                                () = self.cancel_token.cancelled() => break,
                            }
                            attempts = attempts.saturating_add(1);
                            self.set_state(state, attempts);
                        }
                    }
                }
                ConnectState::Connected => {
                    let next = tokio::select! {
                        biased;
                        () = self.cancel_token.cancelled() => break,
                        next = buffer.recv() => next,
                    };
                    let Some(envelope) = next else {
                        debug!("Syslog Sink {}: buffer closed", drain_url);
                        break;
                    };
                    // Drop notifications are accounted in metrics, not forwarded to the drain.
                    let Some(log) = envelope.log_message() else {
                        continue;
                    };

                    match writer
                        .write(
                            log.priority(),
                            &log.message,
                            &log.source_type,
                            &log.source_instance,
                            log.timestamp,
                        )
                        .await
                    {
                        // Nothing reached the drain, so the connection is still unproven.
                        Ok(0) => trace!("Syslog Sink {}: skipped empty record", drain_url),
                        Ok(written) => {
                            attempts = 0;
                            self.counters.sent_messages.fetch_add(1, Ordering::Relaxed);
                            self.counters
                                .sent_bytes
                                .fetch_add(written as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            debug!("Syslog Sink {}: Error when trying to send data to sink. Backing off. Err: {}", drain_url, e);
                            state = ConnectState::Disconnected;
                            attempts = attempts.saturating_add(1);
                        }
                    }
                    self.set_state(state, attempts);
                }
            }
        }

        writer.close().await;
        self.counters.connected.store(false, Ordering::Relaxed);
        filter_stop.cancel();
        if let Err(e) = filter.await {
            debug!("Syslog Sink {}: filter task failed: {}", drain_url, e);
        }
        debug!("Syslog Sink {}: exiting while {}", drain_url, state);
        info!("Syslog Sink {}: Stopped.", drain_url);
    }
}

/// Forwards log messages from `input` to `output` until either side closes or `stop` fires.
async fn forward_logs(
    mut input: mpsc::Receiver<Envelope>,
    output: mpsc::Sender<Envelope>,
    stop: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            biased;
            () = stop.cancelled() => return,
            next = input.recv() => match next {
                Some(envelope) => envelope,
                None => return,
            },
        };
        if envelope.event_type() != EventType::LogMessage {
            continue;
        }
        tokio::select! {
            () = stop.cancelled() => return,
            sent = output.send(envelope) => if sent.is_err() {
                return;
            },
        }
    }
}

#[async_trait]
impl<W: Writer + 'static> Sink for SyslogSink<W> {
    async fn run(&self, input: mpsc::Receiver<Envelope>) {
        self.deliver(input).await;
    }

    fn disconnect(&self) -> bool {
        if self
            .disconnected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("Syslog Sink {}: Disconnecting.", self.config.drain_url);
        self.cancel_token.cancel();
        true
    }

    fn identifier(&self) -> &str {
        &self.config.drain_url
    }

    fn stream_id(&self) -> &str {
        &self.config.app_id
    }

    fn should_receive_errors(&self) -> bool {
        false
    }
}

impl<W: Writer> Instrumentable for SyslogSink<W> {
    fn emit(&self) -> Context {
        let metrics = self.metrics();
        Context {
            name: format!("syslogSink[{}]", self.config.drain_url),
            metrics: vec![
                Metric {
                    name: "sentMessageCount",
                    value: metrics.sent_message_count,
                },
                Metric {
                    name: "sentByteCount",
                    value: metrics.sent_byte_count,
                },
                Metric {
                    name: "currentRetryAttempt",
                    value: metrics.current_retry_attempt,
                },
                Metric {
                    name: "connected",
                    value: u64::from(metrics.connected),
                },
                Metric {
                    name: "droppedMessageCount",
                    value: metrics.dropped_message_count,
                },
            ],
        }
    }
}
