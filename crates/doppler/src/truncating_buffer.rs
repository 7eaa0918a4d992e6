// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded relay between a fast producer and a slow consumer.
//!
//! A relay task owns the pending queue. The producer side is a plain channel that the relay
//! always drains promptly; the consumer asks for items one at a time through [`BufferOutput`].
//! When the queue is full the oldest item is evicted. Evictions are reported to the consumer as
//! a single `CounterEvent` the next time it asks for an item, so a burst of drops costs one
//! notification rather than one per dropped message.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::constants::DROPPED_MESSAGES_COUNTER;
use crate::envelope::{CounterEvent, Envelope, Event};

type Request = oneshot::Sender<Envelope>;

#[derive(Debug, Default)]
struct BufferCounters {
    depth: AtomicU64,
    dropped: AtomicU64,
    notifications: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMetrics {
    pub current_buffer_count: u64,
    pub dropped_message_count: u64,
    pub notification_count: u64,
}

/// Consumer side of a [`TruncatingBuffer`].
pub struct BufferOutput {
    requests: mpsc::Sender<Request>,
    counters: Arc<BufferCounters>,
}

impl BufferOutput {
    /// Next buffered item, or `None` once the input has closed and everything was handed out.
    ///
    /// Dropping the returned future before the relay answers leaves the item queued.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests.send(reply_tx).await.ok()?;
        reply_rx.await.ok()
    }

    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        self.monitor().metrics()
    }

    #[must_use]
    pub fn monitor(&self) -> BufferMonitor {
        BufferMonitor {
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Read-only view of a buffer's counters, usable while the [`BufferOutput`] is being polled.
#[derive(Debug, Clone)]
pub struct BufferMonitor {
    counters: Arc<BufferCounters>,
}

impl BufferMonitor {
    #[must_use]
    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            current_buffer_count: self.counters.depth.load(Ordering::Relaxed),
            dropped_message_count: self.counters.dropped.load(Ordering::Relaxed),
            notification_count: self.counters.notifications.load(Ordering::Relaxed),
        }
    }
}

enum Step {
    Input(Option<Envelope>),
    Request(Option<Request>),
    RequestAbandoned,
}

pub struct TruncatingBuffer {
    input: mpsc::Receiver<Envelope>,
    requests: mpsc::Receiver<Request>,
    queue: VecDeque<Envelope>,
    capacity: usize,
    unreported_drops: u64,
    origin: String,
    sink_identifier: String,
    counters: Arc<BufferCounters>,
}

impl TruncatingBuffer {
    /// Spawns the relay task and returns the consumer handle.
    ///
    /// `origin` tags the dropped-message notifications; `sink_identifier` only appears in logs.
    /// A capacity of 0 is treated as 1.
    #[must_use]
    pub fn run(
        input: mpsc::Receiver<Envelope>,
        capacity: usize,
        origin: impl Into<String>,
        sink_identifier: impl Into<String>,
    ) -> BufferOutput {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let counters = Arc::new(BufferCounters::default());
        let capacity = capacity.max(1);
        let buffer = TruncatingBuffer {
            input,
            requests: requests_rx,
            queue: VecDeque::with_capacity(capacity),
            capacity,
            unreported_drops: 0,
            origin: origin.into(),
            sink_identifier: sink_identifier.into(),
            counters: Arc::clone(&counters),
        };
        tokio::spawn(buffer.relay());
        BufferOutput {
            requests: requests_tx,
            counters,
        }
    }

    async fn relay(mut self) {
        debug!("TB: Buffer for {} started", self.sink_identifier);
        let mut input_open = true;
        let mut pending: Option<Request> = None;

        loop {
            if let Some(reply) = pending.take() {
                match self.next_item() {
                    Some((item, notified)) => {
                        if let Err(item) = reply.send(item) {
                            self.unread(item, notified);
                        }
                    }
                    // Input closed and drained: dropping the reply ends the consumer's stream.
                    None if !input_open => break,
                    None => pending = Some(reply),
                }
            }
            if !input_open && pending.is_none() && self.is_drained() {
                break;
            }

            let step = tokio::select! {
                biased;
                item = self.input.recv(), if input_open => Step::Input(item),
                request = self.requests.recv(), if pending.is_none() => Step::Request(request),
                () = abandoned(&mut pending), if pending.is_some() => Step::RequestAbandoned,
            };

            match step {
                Step::Input(Some(envelope)) => self.push(envelope),
                Step::Input(None) => {
                    debug!("TB: Input for {} closed, draining", self.sink_identifier);
                    input_open = false;
                }
                Step::Request(Some(reply)) => pending = Some(reply),
                Step::Request(None) => {
                    debug!("TB: Consumer for {} went away", self.sink_identifier);
                    break;
                }
                Step::RequestAbandoned => pending = None,
            }
        }

        self.counters.depth.store(0, Ordering::Relaxed);
        debug!("TB: Buffer for {} stopped", self.sink_identifier);
    }

    fn push(&mut self, envelope: Envelope) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.unreported_drops += 1;
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.queue.push_back(envelope);
        self.update_depth();
    }

    /// Pending drop notification first, then the oldest queued item.
    fn next_item(&mut self) -> Option<(Envelope, Option<u64>)> {
        if self.unreported_drops > 0 {
            let dropped = std::mem::take(&mut self.unreported_drops);
            warn!(
                "TB: Output channel too full. Dropped {} messages for {}.",
                dropped, self.sink_identifier
            );
            self.counters.notifications.fetch_add(1, Ordering::Relaxed);
            let notification = Envelope::new(
                self.origin.clone(),
                Event::CounterEvent(CounterEvent {
                    name: DROPPED_MESSAGES_COUNTER.to_string(),
                    delta: dropped,
                    total: Some(self.counters.dropped.load(Ordering::Relaxed)),
                }),
            );
            return Some((notification, Some(dropped)));
        }

        let item = self.queue.pop_front()?;
        self.update_depth();
        Some((item, None))
    }

    /// Puts back an item the consumer never received.
    fn unread(&mut self, item: Envelope, notified: Option<u64>) {
        match notified {
            Some(dropped) => {
                self.unreported_drops += dropped;
                self.counters.notifications.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                self.queue.push_front(item);
                self.update_depth();
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.unreported_drops == 0
    }

    fn update_depth(&self) {
        self.counters
            .depth
            .store(self.queue.len() as u64, Ordering::Relaxed);
    }
}

async fn abandoned(pending: &mut Option<Request>) {
    match pending {
        Some(reply) => reply.closed().await,
        None => std::future::pending().await,
    }
}
