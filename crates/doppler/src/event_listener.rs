// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP ingestion listener.
//!
//! The listener binds one UDP endpoint, republishes every datagram payload on a bounded channel
//! and kicks off liveness tracking for senders it does not know yet. Payload decoding happens
//! downstream; the listener treats datagrams as opaque bytes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::constants::{DEFAULT_RECEIVE_BUFFER_BYTES, LISTENER_QUEUE_CAPACITY, MAX_DATAGRAM_SIZE};
use crate::errors::ListenerError;
use crate::heartbeat::HeartbeatRequester;
use crate::instrumentation::{Context, Instrumentable, Metric};

/// Configuration for the ingestion listener
pub struct EventListenerConfig {
    /// Host to bind the UDP socket to (e.g., "0.0.0.0")
    pub host: String,
    /// Port to bind the UDP socket to; 0 picks an ephemeral port
    pub port: u16,
    /// Requested SO_RCVBUF; the kernel may clamp it
    pub receive_buffer_bytes: usize,
    /// Name of the instrumentation context the listener reports under
    pub context_name: String,
}

impl Default for EventListenerConfig {
    fn default() -> Self {
        EventListenerConfig {
            host: "0.0.0.0".to_string(),
            port: 3457,
            receive_buffer_bytes: DEFAULT_RECEIVE_BUFFER_BYTES,
            context_name: "agentListener".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerMetrics {
    pub received_message_count: u64,
    pub received_byte_count: u64,
    pub current_buffer_count: u64,
}

pub struct EventListener {
    host: String,
    port: u16,
    receive_buffer_bytes: usize,
    context_name: String,
    requester: Arc<dyn HeartbeatRequester>,
    // Taken by `start`; dropping it closes the payload channel.
    data_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    queue: mpsc::WeakSender<Vec<u8>>,
    connection: RwLock<Option<Arc<UdpSocket>>>,
    cancel_token: CancellationToken,
    received_message_count: AtomicU64,
    received_byte_count: AtomicU64,
}

impl EventListener {
    /// Creates a listener and the receiving end of its payload channel.
    ///
    /// Nothing is bound until [`EventListener::start`] runs.
    #[must_use]
    pub fn new(
        config: EventListenerConfig,
        requester: Arc<dyn HeartbeatRequester>,
    ) -> (EventListener, mpsc::Receiver<Vec<u8>>) {
        let (data_tx, data_rx) = mpsc::channel(LISTENER_QUEUE_CAPACITY);
        let listener = EventListener {
            host: config.host,
            port: config.port,
            receive_buffer_bytes: config.receive_buffer_bytes,
            context_name: config.context_name,
            requester,
            queue: data_tx.downgrade(),
            data_tx: Mutex::new(Some(data_tx)),
            connection: RwLock::new(None),
            cancel_token: CancellationToken::new(),
            received_message_count: AtomicU64::new(0),
            received_byte_count: AtomicU64::new(0),
        };
        (listener, data_rx)
    }

    /// Binds the socket and reads datagrams until [`EventListener::stop`] is called or a read
    /// fails. The payload channel is closed on return, and heartbeat sessions started by this
    /// listener are aborted so the socket is released with it.
    ///
    /// A bind failure is returned as [`ListenerError::Bind`] and is not retried.
    pub async fn start(&self) -> Result<(), ListenerError> {
        let data_tx = self
            .data_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ListenerError::AlreadyStarted)?;

        let addr = format!("{}:{}", self.host, self.port);
        let socket = bind_socket(&addr, self.receive_buffer_bytes)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.clone(),
                source,
            })
            .map(Arc::new)?;
        match socket.local_addr() {
            Ok(local) => info!("Listening on port {}", local),
            Err(_) => info!("Listening on port {}", addr),
        }

        {
            let mut connection = self.connection.write().await;
            if self.cancel_token.is_cancelled() {
                debug!("Listener stopped before it started reading");
                return Ok(());
            }
            *connection = Some(Arc::clone(&socket));
        }

        // Each session holds a handle to the socket; they must not outlive the read loop.
        let mut sessions = JoinSet::new();
        let mut read_buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (read_count, sender) = tokio::select! {
                result = socket.recv_from(&mut read_buffer) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("Error while reading. {}", e);
                        break;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => continue,
                () = self.cancel_token.cancelled() => {
                    debug!("Listener on {} stopped", addr);
                    break;
                }
            };
            trace!("EventListener: Read {} bytes from address {}", read_count, sender);

            // Right-sized copy so the scratch buffer can be reused for the next read
            let read_data = read_buffer[..read_count].to_vec();
            self.received_message_count.fetch_add(1, Ordering::Relaxed);
            self.received_byte_count
                .fetch_add(read_count as u64, Ordering::Relaxed);

            tokio::select! {
                result = data_tx.send(read_data) => {
                    if result.is_err() {
                        debug!("Payload receiver dropped, stopping listener");
                        break;
                    }
                }
                () = self.cancel_token.cancelled() => {
                    debug!("Listener on {} stopped while publishing", addr);
                    break;
                }
            }

            if !self.requester.known_and_reset(sender) {
                let requester = Arc::clone(&self.requester);
                let socket = Arc::clone(&socket);
                sessions.spawn(async move {
                    requester.start(sender, socket).await;
                });
            }
        }

        if !sessions.is_empty() {
            debug!("Ending {} heartbeat session(s)", sessions.len());
        }
        sessions.shutdown().await;
        self.connection.write().await.take();
        Ok(())
    }

    /// Closes the socket and unblocks the read loop. Safe to call before or after `start`.
    pub async fn stop(&self) {
        let mut connection = self.connection.write().await;
        self.cancel_token.cancel();
        if connection.take().is_some() {
            info!("Closed listener socket");
        }
    }

    /// Address the socket is bound to, once `start` has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.connection
            .read()
            .await
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    /// Counters since construction.
    ///
    /// `current_buffer_count` is the number of payloads waiting in the channel while the
    /// listener runs. Once `start` returns the channel is closed and the depth reads 0, even if
    /// the receiver has not drained it yet.
    #[must_use]
    pub fn metrics(&self) -> ListenerMetrics {
        let current_buffer_count = self
            .queue
            .upgrade()
            .map_or(0, |tx| (tx.max_capacity() - tx.capacity()) as u64);
        ListenerMetrics {
            received_message_count: self.received_message_count.load(Ordering::Relaxed),
            received_byte_count: self.received_byte_count.load(Ordering::Relaxed),
            current_buffer_count,
        }
    }
}

impl Instrumentable for EventListener {
    fn emit(&self) -> Context {
        let metrics = self.metrics();
        Context {
            name: self.context_name.clone(),
            metrics: vec![
                Metric {
                    name: "currentBufferCount",
                    value: metrics.current_buffer_count,
                },
                Metric {
                    name: "receivedMessageCount",
                    value: metrics.received_message_count,
                },
                Metric {
                    name: "receivedByteCount",
                    value: metrics.received_byte_count,
                },
            ],
        }
    }
}

/// Resolves `addr` and binds the first address that accepts the socket.
async fn bind_socket(addr: &str, receive_buffer_bytes: usize) -> std::io::Result<UdpSocket> {
    let mut last_error = None;
    for resolved in tokio::net::lookup_host(addr).await? {
        match bind_resolved(resolved, receive_buffer_bytes) {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                debug!("Unable to bind {}: {}", resolved, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "address did not resolve")
    }))
}

fn bind_resolved(addr: SocketAddr, receive_buffer_bytes: usize) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_recv_buffer_size(receive_buffer_bytes) {
        warn!(
            "Failed to set receive buffer to {} bytes: {}",
            receive_buffer_bytes, e
        );
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatTracker;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingRequester {
        starts: Mutex<Vec<SocketAddr>>,
        known: Mutex<HashSet<SocketAddr>>,
    }

    impl RecordingRequester {
        fn start_count(&self) -> usize {
            self.starts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HeartbeatRequester for RecordingRequester {
        async fn start(&self, sender: SocketAddr, _socket: Arc<UdpSocket>) {
            self.known.lock().unwrap().insert(sender);
            self.starts.lock().unwrap().push(sender);
        }

        fn known_and_reset(&self, sender: SocketAddr) -> bool {
            self.known.lock().unwrap().contains(&sender)
        }
    }

    fn test_config() -> EventListenerConfig {
        EventListenerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            receive_buffer_bytes: 1024 * 1024,
            context_name: "agentListener".to_string(),
        }
    }

    async fn start_listener(
        requester: Arc<dyn HeartbeatRequester>,
    ) -> (
        Arc<EventListener>,
        mpsc::Receiver<Vec<u8>>,
        tokio::task::JoinHandle<Result<(), ListenerError>>,
        SocketAddr,
    ) {
        start_listener_with(test_config(), requester).await
    }

    async fn start_listener_with(
        config: EventListenerConfig,
        requester: Arc<dyn HeartbeatRequester>,
    ) -> (
        Arc<EventListener>,
        mpsc::Receiver<Vec<u8>>,
        tokio::task::JoinHandle<Result<(), ListenerError>>,
        SocketAddr,
    ) {
        let (listener, rx) = EventListener::new(config, requester);
        let listener = Arc::new(listener);
        let handle = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.start().await })
        };
        let addr = timeout(Duration::from_secs(1), async {
            loop {
                if let Some(addr) = listener.local_addr().await {
                    return addr;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener never bound");
        (listener, rx, handle, addr)
    }

    async fn recv(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for payload")
            .expect("payload channel closed")
    }

    #[tokio::test]
    async fn test_republishes_datagrams_and_counts() {
        let requester = Arc::new(RecordingRequester::default());
        let (listener, mut rx, handle, addr) = start_listener(requester).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payloads = [vec![1u8; 10], vec![2u8; 20], vec![3u8; 30]];
        for payload in &payloads {
            client.send_to(payload, addr).await.unwrap();
        }
        for payload in &payloads {
            assert_eq!(&recv(&mut rx).await, payload);
        }

        let metrics = listener.metrics();
        assert_eq!(metrics.received_message_count, 3);
        assert_eq!(metrics.received_byte_count, 60);
        assert_eq!(metrics.current_buffer_count, 0);

        let context = listener.emit();
        assert_eq!(context.name, "agentListener");
        assert_eq!(context.get("receivedMessageCount"), Some(3));
        assert_eq!(context.get("receivedByteCount"), Some(60));

        listener.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_started_once_per_unknown_sender() {
        let requester = Arc::new(RecordingRequester::default());
        let (listener, mut rx, handle, addr) = start_listener(requester.clone()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        client.send_to(b"first", addr).await.unwrap();
        assert_eq!(recv(&mut rx).await, b"first");
        timeout(Duration::from_secs(1), async {
            while requester.start_count() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat session never started");

        client.send_to(b"second", addr).await.unwrap();
        assert_eq!(recv(&mut rx).await, b"second");
        sleep(Duration::from_millis(20)).await;

        assert_eq!(requester.start_count(), 1);
        assert_eq!(requester.starts.lock().unwrap()[0], client_addr);

        listener.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_payload_channel() {
        let requester = Arc::new(RecordingRequester::default());
        let (listener, mut rx, handle, _addr) = start_listener(requester).await;

        listener.stop().await;
        handle.await.unwrap().unwrap();

        let closed = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("channel should close once the listener stops");
        assert!(closed.is_none());
        assert!(listener.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_stop_ends_heartbeat_sessions_and_frees_port() {
        let tracker = Arc::new(HeartbeatTracker::new(
            Duration::from_millis(20),
            Duration::from_secs(30),
            CancellationToken::new(),
        ));
        let (listener, mut rx, handle, addr) = start_listener(tracker.clone()).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();
        assert_eq!(recv(&mut rx).await, b"hello");
        let mut buf = [0u8; 64];
        timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("no heartbeat request")
            .unwrap();
        assert_eq!(tracker.known_count(), 1);

        // The tracker's own token stays live; stopping the listener alone must end the session.
        listener.stop().await;
        handle.await.unwrap().unwrap();

        drop(std::net::UdpSocket::bind(addr).expect("port still held after stop"));
        assert_eq!(tracker.known_count(), 0);

        while client.try_recv_from(&mut buf).is_ok() {}
        sleep(Duration::from_millis(100)).await;
        assert!(client.try_recv_from(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_buffer_count_reads_zero_after_start_returns() {
        let requester = Arc::new(RecordingRequester::default());
        let (listener, mut rx, handle, addr) = start_listener(requester).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"queued", addr).await.unwrap();
        timeout(Duration::from_secs(1), async {
            while listener.metrics().current_buffer_count == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("payload never queued");
        assert_eq!(listener.metrics().current_buffer_count, 1);

        listener.stop().await;
        handle.await.unwrap().unwrap();

        let metrics = listener.metrics();
        assert_eq!(metrics.current_buffer_count, 0);
        assert_eq!(metrics.received_message_count, 1);
        assert_eq!(recv(&mut rx).await, b"queued");
    }

    #[tokio::test]
    async fn test_binds_hostname() {
        let requester = Arc::new(RecordingRequester::default());
        let (listener, _rx, handle, addr) = start_listener_with(
            EventListenerConfig {
                host: "localhost".to_string(),
                ..test_config()
            },
            requester,
        )
        .await;

        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        listener.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let requester = Arc::new(RecordingRequester::default());
        let (listener, _rx, handle, _addr) = start_listener(requester).await;

        let second = listener.start().await;
        assert!(matches!(second, Err(ListenerError::AlreadyStarted)));

        listener.stop().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    #[traced_test]
    async fn test_bind_failure_is_reported() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let requester = Arc::new(RecordingRequester::default());
        let (listener, _rx) = EventListener::new(
            EventListenerConfig {
                port,
                ..test_config()
            },
            requester,
        );

        let result = listener.start().await;
        match result {
            Err(ListenerError::Bind { addr, .. }) => {
                assert_eq!(addr, format!("127.0.0.1:{port}"));
            }
            other => panic!("expected bind error, got {other:?}"),
        }
        assert!(!logs_contain("Listening on port"));
    }
}
