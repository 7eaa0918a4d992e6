// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Liveness tracking of ingestion senders.
//!
//! The listener calls [`HeartbeatRequester::known_and_reset`] for every datagram and spawns
//! [`HeartbeatRequester::start`] for senders it has not seen recently. [`HeartbeatTracker`] is the
//! in-process implementation: it asks each known sender for heartbeats over the listener's own
//! socket until the sender goes quiet for longer than the inactivity timeout.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::constants::HEARTBEAT_REQUEST;

#[async_trait]
pub trait HeartbeatRequester: Send + Sync {
    /// Runs a liveness session for `sender`, replying over the shared `socket`.
    async fn start(&self, sender: SocketAddr, socket: Arc<UdpSocket>);

    /// Whether `sender` is currently tracked. Resets its inactivity timer when it is.
    fn known_and_reset(&self, sender: SocketAddr) -> bool;
}

pub struct HeartbeatTracker {
    known: Mutex<HashMap<SocketAddr, Instant>>,
    interval: Duration,
    inactivity_timeout: Duration,
    cancel_token: CancellationToken,
}

impl HeartbeatTracker {
    #[must_use]
    pub fn new(
        interval: Duration,
        inactivity_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        HeartbeatTracker {
            known: Mutex::new(HashMap::new()),
            interval,
            inactivity_timeout,
            cancel_token,
        }
    }

    /// Tracked senders, without touching their timers.
    #[must_use]
    pub fn known_count(&self) -> usize {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Tracks `sender` for as long as the returned guard lives, or `None` if it is already tracked.
    fn register(&self, sender: SocketAddr) -> Option<Registration<'_>> {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        if known.contains_key(&sender) {
            return None;
        }
        known.insert(sender, Instant::now());
        Some(Registration {
            tracker: self,
            sender,
        })
    }

    fn forget(&self, sender: SocketAddr) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sender);
    }

    /// Forgets `sender` if it has been silent past the inactivity timeout.
    fn evict_if_inactive(&self, sender: SocketAddr) -> bool {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        match known.get(&sender) {
            Some(last_seen) if last_seen.elapsed() < self.inactivity_timeout => false,
            _ => {
                known.remove(&sender);
                true
            }
        }
    }
}

/// Forgets the sender when its session ends, however it ends (return, cancel or abort).
struct Registration<'a> {
    tracker: &'a HeartbeatTracker,
    sender: SocketAddr,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.tracker.forget(self.sender);
    }
}

#[async_trait]
impl HeartbeatRequester for HeartbeatTracker {
    async fn start(&self, sender: SocketAddr, socket: Arc<UdpSocket>) {
        let Some(_registration) = self.register(sender) else {
            debug!("Heartbeat session for {} already running", sender);
            return;
        };
        info!("Starting heartbeat session for {}", sender);

        loop {
            if let Err(e) = socket.send_to(HEARTBEAT_REQUEST, sender).await {
                debug!("Failed to request heartbeat from {}: {}", sender, e);
            }

            tokio::select! {
                () = sleep(self.interval) => {}
                () = self.cancel_token.cancelled() => {
                    debug!("Heartbeat session for {} cancelled", sender);
                    return;
                }
            }

            if self.evict_if_inactive(sender) {
                info!("Sender {} inactive, ending heartbeat session", sender);
                return;
            }
        }
    }

    fn known_and_reset(&self, sender: SocketAddr) -> bool {
        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        match known.get_mut(&sender) {
            Some(last_seen) => {
                *last_seen = Instant::now();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn socket_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (Arc::new(server), client)
    }

    #[tokio::test]
    async fn test_unknown_sender_is_not_known() {
        let tracker = HeartbeatTracker::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
            CancellationToken::new(),
        );
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert!(!tracker.known_and_reset(addr));
        assert_eq!(tracker.known_count(), 0);
    }

    #[tokio::test]
    async fn test_start_requests_heartbeats_and_marks_known() {
        let (server, client) = socket_pair().await;
        let client_addr = client.local_addr().unwrap();
        let cancel_token = CancellationToken::new();
        let tracker = Arc::new(HeartbeatTracker::new(
            Duration::from_millis(10),
            Duration::from_secs(5),
            cancel_token.clone(),
        ));

        let session = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.start(client_addr, server).await })
        };

        let mut buf = [0u8; 64];
        let (read, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for heartbeat request")
            .unwrap();
        assert_eq!(&buf[..read], HEARTBEAT_REQUEST);
        assert!(tracker.known_and_reset(client_addr));

        cancel_token.cancel();
        timeout(Duration::from_secs(1), session)
            .await
            .expect("session did not stop")
            .unwrap();
        assert_eq!(tracker.known_count(), 0);
        assert!(!tracker.known_and_reset(client_addr));
    }

    #[tokio::test]
    async fn test_aborted_session_forgets_sender() {
        let (server, client) = socket_pair().await;
        let client_addr = client.local_addr().unwrap();
        let tracker = Arc::new(HeartbeatTracker::new(
            Duration::from_millis(10),
            Duration::from_secs(5),
            CancellationToken::new(),
        ));

        let session = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.start(client_addr, server).await })
        };
        while tracker.known_count() == 0 {
            tokio::task::yield_now().await;
        }

        session.abort();
        assert!(session.await.unwrap_err().is_cancelled());
        assert_eq!(tracker.known_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_keeps_active_sender_tracked() {
        let (server, client) = socket_pair().await;
        let client_addr = client.local_addr().unwrap();
        let inactivity_timeout = Duration::from_millis(80);
        let tracker = Arc::new(HeartbeatTracker::new(
            Duration::from_millis(10),
            inactivity_timeout,
            CancellationToken::new(),
        ));

        let session = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.start(client_addr, server).await })
        };
        while tracker.known_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Several inactivity timeouts pass, but the sender keeps showing up.
        let active_until = Instant::now() + inactivity_timeout * 5;
        while Instant::now() < active_until {
            assert!(tracker.known_and_reset(client_addr));
            sleep(Duration::from_millis(20)).await;
        }
        assert!(!session.is_finished());
        assert_eq!(tracker.known_count(), 1);

        // Once it goes quiet the session ends on its own.
        timeout(Duration::from_secs(2), session)
            .await
            .expect("session should end once the sender is inactive")
            .unwrap();
        assert!(!tracker.known_and_reset(client_addr));
    }

    #[tokio::test]
    async fn test_second_start_is_noop() {
        let (server, client) = socket_pair().await;
        let client_addr = client.local_addr().unwrap();
        let cancel_token = CancellationToken::new();
        let tracker = Arc::new(HeartbeatTracker::new(
            Duration::from_millis(10),
            Duration::from_secs(5),
            cancel_token.clone(),
        ));

        let first = {
            let tracker = Arc::clone(&tracker);
            let server = Arc::clone(&server);
            tokio::spawn(async move { tracker.start(client_addr, server).await })
        };
        while !tracker.known_and_reset(client_addr) {
            tokio::task::yield_now().await;
        }

        // Returns immediately because the first session owns the sender.
        timeout(Duration::from_millis(500), tracker.start(client_addr, server))
            .await
            .expect("duplicate start should return immediately");
        assert_eq!(tracker.known_count(), 1);

        cancel_token.cancel();
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_inactive_sender_is_forgotten() {
        let (server, client) = socket_pair().await;
        let client_addr = client.local_addr().unwrap();
        let tracker = Arc::new(HeartbeatTracker::new(
            Duration::from_millis(10),
            Duration::from_millis(50),
            CancellationToken::new(),
        ));

        timeout(Duration::from_secs(2), tracker.start(client_addr, server))
            .await
            .expect("session should end once the sender is inactive");

        assert!(!tracker.known_and_reset(client_addr));
        assert_eq!(tracker.known_count(), 0);
    }
}
