//! Registry of connected broadcast subscribers.
//!
//! Membership changes (connect, disconnect, write failure) take a short write
//! lock on the map; a broadcast tick clones a snapshot first and then pushes
//! to each subscriber's own queue without holding the lock.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identifier assigned to each subscriber on connect.
pub type SubscriberId = u64;

/// Why a line could not be queued for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The subscriber's queue is full; it is too slow to keep up.
    Full,
    /// The subscriber has been closed.
    Closed,
}

/// A connected network peer.
pub struct Subscriber {
    id: SubscriberId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

impl Subscriber {
    /// Get the subscriber's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Get the peer address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a line for the connection task without waiting.
    pub fn push(&self, line: Bytes) -> Result<(), PushError> {
        if self.closed.is_cancelled() {
            return Err(PushError::Closed);
        }
        self.outbound.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Signal the connection task to release the transport.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the subscriber is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers the line was queued for.
    pub delivered: usize,
    /// Subscribers skipped because their queue was full.
    pub lagging: usize,
    /// Subscribers removed because they were closed.
    pub removed: usize,
}

#[derive(Default)]
struct RegistryInner {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

/// Shared set of live subscribers.
///
/// Cloning the registry shares the same set.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber for `peer` with an outbound queue of `capacity` lines.
    ///
    /// Returns the subscriber and the receiving end of its queue, which the
    /// connection task drains into the transport.
    pub fn register(
        &self,
        peer: SocketAddr,
        capacity: usize,
    ) -> (Arc<Subscriber>, mpsc::Receiver<Bytes>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (outbound, rx) = mpsc::channel(capacity.max(1));

        let subscriber = Arc::new(Subscriber {
            id,
            peer,
            outbound,
            closed: CancellationToken::new(),
        });

        self.inner
            .subscribers
            .write()
            .insert(id, subscriber.clone());

        (subscriber, rx)
    }

    /// Remove a subscriber and close it.
    ///
    /// Only the first call for a given id returns the subscriber, so the
    /// caller that gets `Some` is the one that released it.
    pub fn remove(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        let removed = self.inner.subscribers.write().remove(&id);
        if let Some(subscriber) = &removed {
            subscriber.close();
        }
        removed
    }

    /// Clone the current membership.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.inner.subscribers.read().values().cloned().collect()
    }

    /// Check whether a subscriber is still registered.
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.inner.subscribers.read().contains_key(&id)
    }

    /// Get the number of subscribers.
    pub fn len(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Check if there are no subscribers.
    pub fn is_empty(&self) -> bool {
        self.inner.subscribers.read().is_empty()
    }

    /// Queue `line` for every subscriber in a snapshot of the registry.
    ///
    /// Closed subscribers are removed; lagging ones are skipped for this pass.
    pub fn broadcast(&self, line: Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        for subscriber in self.snapshot() {
            match subscriber.push(line.clone()) {
                Ok(()) => report.delivered += 1,
                Err(PushError::Full) => {
                    debug!("Subscriber {} is lagging, skipping tick", subscriber.peer());
                    report.lagging += 1;
                }
                Err(PushError::Closed) => {
                    if self.remove(subscriber.id()).is_some() {
                        info!("Subscriber {} disconnected", subscriber.peer());
                        report.removed += 1;
                    }
                }
            }
        }

        report
    }

    /// Remove and close every subscriber. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = self
            .inner
            .subscribers
            .write()
            .drain()
            .map(|(_, s)| s)
            .collect();

        for subscriber in &drained {
            subscriber.close();
        }

        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn test_register_and_remove() {
        let registry = SubscriberRegistry::new();
        let (a, _rx_a) = registry.register(peer(5000), 4);
        let (b, _rx_b) = registry.register(peer(5001), 4);

        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(a.id()).is_some());
        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_releases_exactly_once() {
        let registry = SubscriberRegistry::new();
        let (a, _rx) = registry.register(peer(5000), 4);

        assert!(registry.remove(a.id()).is_some());
        assert!(registry.remove(a.id()).is_none());
    }

    #[test]
    fn test_broadcast_reaches_every_subscriber() {
        let registry = SubscriberRegistry::new();
        let (_a, mut rx_a) = registry.register(peer(5000), 4);
        let (_b, mut rx_b) = registry.register(peer(5001), 4);

        let report = registry.broadcast(Bytes::from_static(b"75\n"));

        assert_eq!(report.delivered, 2);
        assert_eq!(rx_a.try_recv().unwrap(), Bytes::from_static(b"75\n"));
        assert_eq!(rx_b.try_recv().unwrap(), Bytes::from_static(b"75\n"));
    }

    #[test]
    fn test_dead_subscriber_removed_others_still_served() {
        let registry = SubscriberRegistry::new();
        let (dead, rx_dead) = registry.register(peer(5000), 4);
        let (_live, mut rx_live) = registry.register(peer(5001), 4);
        drop(rx_dead);

        let report = registry.broadcast(Bytes::from_static(b"80\n"));

        assert_eq!(report.removed, 1);
        assert_eq!(report.delivered, 1);
        assert!(!registry.contains(dead.id()));
        assert!(dead.is_closed());
        assert_eq!(rx_live.try_recv().unwrap(), Bytes::from_static(b"80\n"));
    }

    #[test]
    fn test_lagging_subscriber_skipped_not_removed() {
        let registry = SubscriberRegistry::new();
        let (slow, _rx_slow) = registry.register(peer(5000), 1);

        assert_eq!(registry.broadcast(Bytes::from_static(b"1\n")).delivered, 1);
        let report = registry.broadcast(Bytes::from_static(b"2\n"));

        assert_eq!(report.lagging, 1);
        assert!(registry.contains(slow.id()));
    }

    #[test]
    fn test_removed_subscriber_receives_nothing() {
        let registry = SubscriberRegistry::new();
        let (gone, mut rx_gone) = registry.register(peer(5000), 4);

        registry.remove(gone.id());
        registry.broadcast(Bytes::from_static(b"90\n"));

        assert!(rx_gone.try_recv().is_err());
        assert_eq!(gone.push(Bytes::from_static(b"91\n")), Err(PushError::Closed));
    }

    #[test]
    fn test_close_all() {
        let registry = SubscriberRegistry::new();
        let (a, _rx_a) = registry.register(peer(5000), 4);
        let (b, _rx_b) = registry.register(peer(5001), 4);

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(registry.close_all(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_churn_during_broadcast() {
        let registry = SubscriberRegistry::new();

        let churn = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for port in 0..500u16 {
                    let (subscriber, rx) = registry.register(peer(6000 + port), 2);
                    if port % 3 == 0 {
                        drop(rx);
                    }
                    if port % 2 == 0 {
                        registry.remove(subscriber.id());
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let ticks = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    registry.broadcast(Bytes::from_static(b"72\n"));
                    tokio::task::yield_now().await;
                }
            })
        };

        churn.await.unwrap();
        ticks.await.unwrap();

        for subscriber in registry.snapshot() {
            assert!(!subscriber.is_closed());
        }
    }
}
