//! Gossip transport contract.
//!
//! Peer discovery, routing and wire encoding live outside this SDK. Components
//! only need to publish opaque bytes to a topic and receive whatever the network
//! delivers on the topics they subscribed to, with no ordering or uniqueness
//! guarantee.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agora_core::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::P2pError;

/// A message delivered by the gossip network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Opaque payload.
    pub data: Vec<u8>,
    /// Peer that published it.
    pub from: String,
}

/// Publish/subscribe access to the gossip network.
pub trait GossipTransport: Send + Sync {
    /// The local peer id.
    fn peer_id(&self) -> &str;

    /// Publishes `data` on `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    fn publish<'a>(&'a self, topic: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<(), P2pError>>;

    /// Subscribes to `topic`; messages published afterwards are delivered to the
    /// returned receiver.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<GossipMessage>;
}

#[derive(Debug)]
struct BusInner {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<GossipMessage>>>,
    duplicate_delivery: AtomicBool,
}

/// In-process gossip network shared by any number of [`LocalPeer`]s.
#[derive(Debug, Clone)]
pub struct LocalGossipBus {
    inner: Arc<BusInner>,
}

impl LocalGossipBus {
    /// Creates a bus buffering up to `capacity` undelivered messages per topic.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
                duplicate_delivery: AtomicBool::new(false),
            }),
        }
    }

    /// Attaches a peer to the bus.
    #[must_use]
    pub fn peer(&self, peer_id: impl Into<String>) -> LocalPeer {
        LocalPeer {
            peer_id: peer_id.into(),
            bus: self.clone(),
        }
    }

    /// When enabled, every publish is delivered twice.
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<GossipMessage> {
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    fn deliver(&self, message: GossipMessage) -> usize {
        let sender = self.sender(&message.topic);
        let copies = if self.inner.duplicate_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        let mut receivers = 0;
        for _ in 0..copies {
            receivers = sender.send(message.clone()).unwrap_or(0);
        }
        receivers
    }
}

impl Default for LocalGossipBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A peer attached to a [`LocalGossipBus`].
#[derive(Debug, Clone)]
pub struct LocalPeer {
    peer_id: String,
    bus: LocalGossipBus,
}

impl GossipTransport for LocalPeer {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn publish<'a>(&'a self, topic: &'a str, data: Vec<u8>) -> BoxFuture<'a, Result<(), P2pError>> {
        Box::pin(async move {
            let receivers = self.bus.deliver(GossipMessage {
                topic: topic.to_string(),
                data,
                from: self.peer_id.clone(),
            });
            trace!(peer = %self.peer_id, topic, receivers, "published gossip message");
            Ok(())
        })
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<GossipMessage> {
        self.bus.sender(topic).subscribe()
    }
}
