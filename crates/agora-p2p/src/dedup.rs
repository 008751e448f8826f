//! Versioned de-duplication of gossip messages.
//!
//! Gossip delivers at least once and in no particular order, so the same message
//! id routinely arrives several times. The cache keeps one record per message id
//! and only lets a strictly higher version from the same origin peer replace it.
//! Records whose expiry has passed are removed by [`MessageDedupCache::prune`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agora_core::{GossipConfig, ScopedStorage, SharedClock, SharedStorage, StorageExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::P2pError;

/// A message retained by the dedup cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMessage {
    /// Globally unique gossip message id.
    pub id: String,
    /// Peer that originated the message.
    pub origin: String,
    /// Unix timestamp (seconds) after which the record is dropped.
    pub expire: i64,
    /// Opaque message body.
    pub payload: Vec<u8>,
    /// Update counter, starting at 1.
    pub version: u64,
}

impl CachedMessage {
    /// Creates a first-version message.
    pub fn new(
        id: impl Into<String>,
        origin: impl Into<String>,
        payload: Vec<u8>,
        expire: i64,
    ) -> Self {
        Self {
            id: id.into(),
            origin: origin.into(),
            expire,
            payload,
            version: 1,
        }
    }

    /// Sets the version counter.
    #[must_use]
    pub const fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Returns true if the record is past its expiry at `now_secs`.
    #[must_use]
    pub const fn is_expired(&self, now_secs: i64) -> bool {
        self.expire < now_secs
    }
}

/// What [`MessageDedupCache::set`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// First sighting; the message was stored.
    Stored,
    /// A higher version replaced the stored record.
    Replaced,
    /// Version was not newer than the stored one; nothing changed.
    Ignored,
}

impl SetOutcome {
    /// Returns true if the caller should process the message.
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Stored | Self::Replaced)
    }
}

/// Storage-backed gossip de-duplication cache.
pub struct MessageDedupCache {
    storage: SharedStorage,
    clock: SharedClock,
    message_expiration: Duration,
    /// Serializes read-modify-write cycles of `set` and `prune`.
    write_lock: Mutex<()>,
}

impl MessageDedupCache {
    /// Creates a cache over `storage`.
    #[must_use]
    pub fn new(storage: SharedStorage, clock: SharedClock) -> Self {
        Self {
            storage,
            clock,
            message_expiration: GossipConfig::default().message_expiration(),
            write_lock: Mutex::new(()),
        }
    }

    /// Takes the default message lifetime from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &GossipConfig) -> Self {
        self.message_expiration = config.message_expiration();
        self
    }

    /// Builds a first-version message that expires one message lifetime from now.
    pub fn message(
        &self,
        id: impl Into<String>,
        origin: impl Into<String>,
        payload: Vec<u8>,
    ) -> CachedMessage {
        let ttl = i64::try_from(self.message_expiration.as_secs()).unwrap_or(i64::MAX);
        let expire = self.clock.now_secs().saturating_add(ttl);
        CachedMessage::new(id, origin, payload, expire)
    }

    /// Creates a cache whose records live under a per-topic namespace of `storage`.
    #[must_use]
    pub fn for_topic(storage: SharedStorage, topic: &str, clock: SharedClock) -> Self {
        Self::new(ScopedStorage::shared(storage, topic), clock)
    }

    /// Records an inbound message.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::ConflictingOrigin`] if the id is already held by another
    /// origin peer, [`P2pError::InvalidMessage`] for a zero version, and
    /// [`P2pError::Storage`] if the store fails. Every error is logged here and the
    /// stored record is left as it was; callers should drop the message.
    pub async fn set(&self, message: CachedMessage) -> Result<SetOutcome, P2pError> {
        if message.version == 0 {
            warn!(message_id = %message.id, "rejecting message with version 0");
            return Err(P2pError::InvalidMessage(format!(
                "message {} has version 0",
                message.id
            )));
        }

        let _guard = self.write_lock.lock().await;

        let stored: Option<CachedMessage> = match self.storage.get_json(&message.id).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "failed to read cached message");
                return Err(e.into());
            }
        };

        let outcome = match stored {
            Some(current) if current.origin != message.origin => {
                error!(
                    message_id = %message.id,
                    stored = %current.origin,
                    received = %message.origin,
                    "conflicting origin for cached message"
                );
                return Err(P2pError::ConflictingOrigin {
                    message_id: message.id,
                    stored: current.origin,
                    received: message.origin,
                });
            }
            Some(current) if message.version <= current.version => {
                trace!(
                    message_id = %message.id,
                    version = message.version,
                    stored_version = current.version,
                    "ignoring stale message"
                );
                return Ok(SetOutcome::Ignored);
            }
            Some(_) => SetOutcome::Replaced,
            None => SetOutcome::Stored,
        };

        if let Err(e) = self.storage.set_json(&message.id, &message).await {
            warn!(message_id = %message.id, error = %e, "failed to store message");
            return Err(e.into());
        }
        trace!(message_id = %message.id, version = message.version, ?outcome, "cached message");
        Ok(outcome)
    }

    /// Returns `(message id, payload)` for every retained message.
    ///
    /// Used to replay the current state to late subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn get(&self) -> Result<Vec<(String, Vec<u8>)>, P2pError> {
        Ok(self
            .messages()
            .await?
            .into_iter()
            .map(|m| (m.id, m.payload))
            .collect())
    }

    /// Returns every retained message record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn messages(&self) -> Result<Vec<CachedMessage>, P2pError> {
        let entries = self.storage.entries().await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed cache record");
                    None
                }
            })
            .collect())
    }

    /// Number of retained messages.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn len(&self) -> Result<usize, P2pError> {
        Ok(self.messages().await?.len())
    }

    /// Deletes every record whose expiry is before now, returning how many went.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed. Individual failed deletes
    /// are logged and retried on the next sweep.
    pub async fn prune(&self) -> Result<usize, P2pError> {
        let _guard = self.write_lock.lock().await;
        let now = self.clock.now_secs();

        let mut removed = 0;
        for message in self.messages().await? {
            if !message.is_expired(now) {
                continue;
            }
            match self.storage.delete(&message.id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "failed to prune message");
                }
            }
        }

        if removed > 0 {
            debug!(removed, "pruned expired messages");
        }
        Ok(removed)
    }

    /// Runs [`prune`](Self::prune) every `interval` until the handle is stopped.
    #[must_use]
    pub fn start_pruning(self: &Arc<Self>, interval: Duration) -> PruneHandle {
        let running = Arc::new(AtomicBool::new(true));
        let cache = Arc::clone(self);
        let flag = Arc::clone(&running);

        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while flag.load(Ordering::SeqCst) {
                timer.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = cache.prune().await {
                    warn!(error = %e, "prune sweep failed");
                }
            }
        });

        PruneHandle { running, task }
    }
}

impl std::fmt::Debug for MessageDedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageDedupCache")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Handle for the periodic prune task. Dropping it stops the task.
#[derive(Debug)]
pub struct PruneHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl PruneHandle {
    /// Returns true while the prune task is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    /// Stops the prune task.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for PruneHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
