// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Registry of running sinks and the router feeding them.
//!
//! Each registered sink gets its own bounded input channel and run task. Routing never waits on
//! a sink: when a sink's input is full the envelope is dropped for that sink only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::SINK_INPUT_CAPACITY;
use crate::envelope::{Envelope, EventType};
use crate::instrumentation::{Context, Instrumentable, Metric};
use crate::syslog_sink::Sink;

struct RunningSink {
    sink: Arc<dyn Sink>,
    input: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

pub struct SinkManager {
    sinks: Mutex<HashMap<String, Vec<RunningSink>>>,
    input_capacity: usize,
    cancel_token: CancellationToken,
    routed_envelope_count: AtomicU64,
    dropped_envelope_count: AtomicU64,
}

impl SinkManager {
    #[must_use]
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self::with_input_capacity(SINK_INPUT_CAPACITY, cancel_token)
    }

    #[must_use]
    pub fn with_input_capacity(input_capacity: usize, cancel_token: CancellationToken) -> Self {
        SinkManager {
            sinks: Mutex::new(HashMap::new()),
            input_capacity: input_capacity.max(1),
            cancel_token,
            routed_envelope_count: AtomicU64::new(0),
            dropped_envelope_count: AtomicU64::new(0),
        }
    }

    /// Starts `sink` unless a sink with the same identifier already serves its app.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, sink: Arc<dyn Sink>) -> bool {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let app_sinks = sinks.entry(sink.stream_id().to_string()).or_default();
        if app_sinks
            .iter()
            .any(|running| running.sink.identifier() == sink.identifier())
        {
            debug!(
                "Sink {} already registered for app {}",
                sink.identifier(),
                sink.stream_id()
            );
            return false;
        }

        info!(
            "Registering sink {} for app {}",
            sink.identifier(),
            sink.stream_id()
        );
        let (input, rx) = mpsc::channel(self.input_capacity);
        let task = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.run(rx).await })
        };
        app_sinks.push(RunningSink { sink, input, task });
        true
    }

    /// Disconnects and forgets the sink `identifier` of `app_id`.
    pub fn unregister(&self, app_id: &str, identifier: &str) -> bool {
        let removed = {
            let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(app_sinks) = sinks.get_mut(app_id) else {
                return false;
            };
            let position = app_sinks
                .iter()
                .position(|running| running.sink.identifier() == identifier);
            let removed = position.map(|index| app_sinks.swap_remove(index));
            if app_sinks.is_empty() {
                sinks.remove(app_id);
            }
            removed
        };

        match removed {
            Some(running) => {
                info!("Unregistering sink {} for app {}", identifier, app_id);
                running.sink.disconnect();
                true
            }
            None => false,
        }
    }

    /// Hands `envelope` to every sink that wants it without waiting on any of them.
    pub fn route(&self, envelope: &Envelope) {
        let sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        match envelope.event_type() {
            EventType::LogMessage => {
                let Some(app_id) = envelope.app_id() else {
                    debug!("Log message from {} has no app id", envelope.origin);
                    return;
                };
                if let Some(app_sinks) = sinks.get(app_id) {
                    for running in app_sinks {
                        self.deliver(running, envelope);
                    }
                }
            }
            EventType::Error => {
                for running in sinks
                    .values()
                    .flatten()
                    .filter(|running| running.sink.should_receive_errors())
                {
                    self.deliver(running, envelope);
                }
            }
            _ => {}
        }
    }

    fn deliver(&self, running: &RunningSink, envelope: &Envelope) {
        match running.input.try_send(envelope.clone()) {
            Ok(()) => {
                self.routed_envelope_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                self.dropped_envelope_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Sink {} input full, dropping envelope",
                    running.sink.identifier()
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped_envelope_count.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Sink {} is no longer running, dropping envelope",
                    running.sink.identifier()
                );
            }
        }
    }

    /// Routes envelopes from `input` until it closes or the manager is cancelled.
    pub async fn run(&self, mut input: mpsc::Receiver<Envelope>) {
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!("Sink manager cancelled");
                    return;
                }
                next = input.recv() => match next {
                    Some(envelope) => self.route(&envelope),
                    None => {
                        debug!("Sink manager input closed");
                        return;
                    }
                },
            }
        }
    }

    /// Disconnects every sink and waits for their run loops to finish.
    pub async fn stop_all(&self) {
        let stopped: Vec<RunningSink> = {
            let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
            sinks.drain().flat_map(|(_, app_sinks)| app_sinks).collect()
        };
        for running in &stopped {
            running.sink.disconnect();
        }
        for running in stopped {
            if let Err(e) = running.task.await {
                warn!("Sink {} ended abnormally: {}", running.sink.identifier(), e);
            }
        }
    }

    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Contexts of every registered sink.
    #[must_use]
    pub fn sink_contexts(&self) -> Vec<Context> {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .map(|running| running.sink.emit())
            .collect()
    }
}

impl Instrumentable for SinkManager {
    fn emit(&self) -> Context {
        Context {
            name: "sinkManager".to_string(),
            metrics: vec![
                Metric {
                    name: "sinkCount",
                    value: self.sink_count() as u64,
                },
                Metric {
                    name: "routedEnvelopeCount",
                    value: self.routed_envelope_count.load(Ordering::Relaxed),
                },
                Metric {
                    name: "droppedEnvelopeCount",
                    value: self.dropped_envelope_count.load(Ordering::Relaxed),
                },
            ],
        }
    }
}
