//! Client-side registry of published requests and the offers they received.
//!
//! The registry is the single writer of its storage key. Every mutation writes
//! the full snapshot before returning and then broadcasts a [`RegistryChange`],
//! so a listener that reacts to a change and reads the registry always sees the
//! persisted state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use agora_core::{RegistryConfig, SharedClock, SharedStorage, StorageExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::MarketError;
use crate::offer::OfferRecord;
use crate::request::RequestRecord;

/// A published request and everything received against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequestEntry {
    /// The request as last published.
    pub data: RequestRecord,
    /// Whether the client is still listening for offers on this request.
    pub subscribed: bool,
    /// Offers received, in arrival order.
    pub offers: Vec<OfferRecord>,
}

impl ClientRequestEntry {
    fn new(data: RequestRecord) -> Self {
        Self {
            data,
            subscribed: true,
            offers: Vec::new(),
        }
    }
}

/// Notification that the registry contents changed.
#[derive(Debug, Clone)]
pub struct RegistryChange {
    /// Monotonic change counter, starting at 1 for the first change.
    pub revision: u64,
    /// Snapshot of all entries after the change.
    pub requests: Vec<ClientRequestEntry>,
}

struct RegistryInner {
    storage: SharedStorage,
    key: String,
    clock: SharedClock,
    entries: Mutex<Vec<ClientRequestEntry>>,
    expiry_timers: parking_lot::Mutex<HashMap<String, JoinHandle<()>>>,
    revision: AtomicU64,
    events: broadcast::Sender<RegistryChange>,
}

impl RegistryInner {
    /// Persists `entries` and notifies listeners. Called with the entries lock held.
    async fn commit(&self, entries: &[ClientRequestEntry]) {
        if let Err(e) = self.storage.set_json(&self.key, entries).await {
            warn!(key = %self.key, error = %e, "failed to persist request registry");
        }
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let change = RegistryChange {
            revision,
            requests: entries.to_vec(),
        };
        if self.events.send(change).is_err() {
            trace!(revision, "no registry listeners");
        }
    }

    fn cancel_expiry(&self, id: &str) {
        if let Some(timer) = self.expiry_timers.lock().remove(id) {
            timer.abort();
        }
    }

    fn cancel_all_expiries(&self) {
        for (_, timer) in self.expiry_timers.lock().drain() {
            timer.abort();
        }
    }

    async fn expire(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        let now = self.clock.now_secs();
        let Some(entry) = entries.iter_mut().find(|e| e.data.id == id) else {
            return;
        };
        if !entry.data.is_expired(now) || !entry.subscribed {
            return;
        }
        entry.subscribed = false;
        debug!(request_id = %id, "request expired, no longer accepting offers");
        self.commit(&entries).await;
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        self.cancel_all_expiries();
    }
}

/// Durable, observable registry of the local client's requests.
pub struct RequestRegistry {
    inner: Arc<RegistryInner>,
}

impl RequestRegistry {
    /// Creates an empty registry without touching storage.
    ///
    /// Call [`restore`](Self::restore) to load persisted state; subscribing
    /// first guarantees the restore notification is observed.
    #[must_use]
    pub fn new(storage: SharedStorage, config: &RegistryConfig, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RegistryInner {
                storage,
                key: config.storage_key.clone(),
                clock,
                entries: Mutex::new(Vec::new()),
                expiry_timers: parking_lot::Mutex::new(HashMap::new()),
                revision: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Creates a registry and restores its persisted state.
    pub async fn open(storage: SharedStorage, config: &RegistryConfig, clock: SharedClock) -> Self {
        let registry = Self::new(storage, config, clock);
        registry.restore().await;
        registry
    }

    /// Subscribes to change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.inner.events.subscribe()
    }

    /// Reloads the persisted snapshot, re-arms expiry timers and emits a change.
    ///
    /// A snapshot that cannot be read leaves the registry empty; the failure is
    /// logged rather than returned.
    pub async fn restore(&self) {
        let loaded = match self
            .inner
            .storage
            .get_json::<Vec<ClientRequestEntry>>(&self.inner.key)
            .await
        {
            Ok(loaded) => loaded.unwrap_or_default(),
            Err(e) => {
                warn!(key = %self.inner.key, error = %e, "failed to restore request registry");
                Vec::new()
            }
        };

        let mut entries = self.inner.entries.lock().await;
        self.inner.cancel_all_expiries();
        for entry in &loaded {
            self.arm_expiry(&entry.data);
        }
        *entries = loaded;
        debug!(count = entries.len(), "restored request registry");
        self.inner.commit(&entries).await;
    }

    /// Registers a newly published request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is invalid or its id is already registered.
    pub async fn add(&self, request: RequestRecord) -> Result<(), MarketError> {
        request.validate()?;

        let mut entries = self.inner.entries.lock().await;
        if entries.iter().any(|e| e.data.id == request.id) {
            return Err(MarketError::DuplicateRequest(request.id));
        }
        self.arm_expiry(&request);
        debug!(request_id = %request.id, topic = %request.topic, "registered request");
        entries.push(ClientRequestEntry::new(request));
        self.inner.commit(&entries).await;
        Ok(())
    }

    /// Records an offer against its request.
    ///
    /// Returns `false` when the offer is dropped: invalid, unknown or expired
    /// request, unsubscribed request, or an offer id already recorded.
    pub async fn add_offer(&self, offer: OfferRecord) -> bool {
        if let Err(e) = offer.validate() {
            debug!(offer_id = %offer.id, error = %e, "dropping invalid offer");
            return false;
        }

        let mut entries = self.inner.entries.lock().await;
        let now = self.inner.clock.now_secs();
        let Some(entry) = entries.iter_mut().find(|e| e.data.id == offer.request_id) else {
            debug!(offer_id = %offer.id, request_id = %offer.request_id, "offer for unknown request");
            return false;
        };
        if entry.data.is_expired(now) || !entry.subscribed {
            debug!(offer_id = %offer.id, request_id = %offer.request_id, "offer for inactive request");
            return false;
        }
        if entry.offers.iter().any(|o| o.id == offer.id) {
            trace!(offer_id = %offer.id, "duplicate offer");
            return false;
        }

        debug!(offer_id = %offer.id, request_id = %offer.request_id, "offer received");
        entry.offers.push(offer);
        self.inner.commit(&entries).await;
        true
    }

    /// Applies `mutate` to a registered request and re-publishes it locally.
    ///
    /// The nonce is bumped past its previous value regardless of what `mutate`
    /// does with it; the id cannot be changed. Returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is unknown or the mutation renames it.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<RequestRecord, MarketError>
    where
        F: FnOnce(&mut RequestRecord),
    {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.data.id == id)
            .ok_or_else(|| MarketError::RequestNotFound(id.to_string()))?;

        let mut updated = entry.data.clone();
        mutate(&mut updated);
        if updated.id != entry.data.id {
            return Err(MarketError::InvalidRequest(format!(
                "request {id} cannot be renamed to {}",
                updated.id
            )));
        }
        let next_nonce = entry.data.nonce.checked_add(1).ok_or_else(|| {
            MarketError::InvalidRequest(format!("request {id} has exhausted its nonce"))
        })?;
        updated.nonce = updated.nonce.max(next_nonce);

        if updated.expire != entry.data.expire {
            self.arm_expiry(&updated);
        }
        entry.data = updated.clone();
        debug!(request_id = %id, nonce = updated.nonce, "updated request");
        self.inner.commit(&entries).await;
        Ok(updated)
    }

    /// Starts or stops listening for offers on a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is unknown.
    pub async fn set_subscribed(&self, id: &str, subscribed: bool) -> Result<(), MarketError> {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.data.id == id)
            .ok_or_else(|| MarketError::RequestNotFound(id.to_string()))?;
        if entry.subscribed == subscribed {
            return Ok(());
        }
        entry.subscribed = subscribed;
        self.inner.commit(&entries).await;
        Ok(())
    }

    /// Returns a copy of one entry.
    pub async fn get(&self, id: &str) -> Option<ClientRequestEntry> {
        self.inner
            .entries
            .lock()
            .await
            .iter()
            .find(|e| e.data.id == id)
            .cloned()
    }

    /// Returns a copy of every entry, in registration order.
    pub async fn get_all(&self) -> Vec<ClientRequestEntry> {
        self.inner.entries.lock().await.clone()
    }

    /// Removes one entry, returning whether it existed.
    pub async fn delete(&self, id: &str) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.data.id != id);
        if entries.len() == before {
            return false;
        }
        self.inner.cancel_expiry(id);
        self.inner.commit(&entries).await;
        true
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        let mut entries = self.inner.entries.lock().await;
        entries.clear();
        self.inner.cancel_all_expiries();
        self.inner.commit(&entries).await;
    }

    /// Removes entries whose request has expired, returning how many went.
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.inner.entries.lock().await;
        let now = self.inner.clock.now_secs();
        let (expired, live): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.data.is_expired(now));
        *entries = live;
        if expired.is_empty() {
            return 0;
        }
        for entry in &expired {
            self.inner.cancel_expiry(&entry.data.id);
        }
        debug!(removed = expired.len(), "pruned expired requests");
        self.inner.commit(&entries).await;
        expired.len()
    }

    fn arm_expiry(&self, request: &RequestRecord) {
        let remaining_ms = request
            .expire
            .saturating_mul(1000)
            .saturating_sub(self.inner.clock.now_millis());
        let delay = Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(0));
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let id = request.id.clone();

        let timer = tokio::spawn({
            let id = id.clone();
            async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.expiry_timers.lock().remove(&id);
                    inner.expire(&id).await;
                }
            }
        });

        if let Some(previous) = self.inner.expiry_timers.lock().insert(id, timer) {
            previous.abort();
        }
    }
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("key", &self.inner.key)
            .field("revision", &self.inner.revision.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offer::tests::offer;
    use agora_core::{JsonFileStorage, MemoryStorage, MonotonicClock};
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    const NOW: i64 = 1_700_000_000;

    fn clock() -> SharedClock {
        MonotonicClock::anchored_at(NOW * 1000).shared()
    }

    fn request(id: &str, expire: i64) -> RequestRecord {
        RequestRecord::new("hotels", json!({"city": "lisbon"}), expire).with_id(id)
    }

    async fn registry(storage: Arc<MemoryStorage>) -> RequestRegistry {
        RequestRegistry::open(storage, &RegistryConfig::default(), clock()).await
    }

    #[tokio::test(start_paused = true)]
    async fn add_then_get_all() {
        let registry = registry(MemoryStorage::shared()).await;
        registry.add(request("r1", NOW + 100)).await.expect("add");

        let all = registry.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].data.id, "r1");
        assert!(all[0].subscribed);
        assert!(all[0].offers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn add_rejects_empty_and_duplicate_ids() {
        let registry = registry(MemoryStorage::shared()).await;
        assert!(matches!(
            registry.add(request("", NOW + 100)).await,
            Err(MarketError::InvalidRequest(_))
        ));

        registry.add(request("r1", NOW + 100)).await.expect("add");
        assert!(matches!(
            registry.add(request("r1", NOW + 100)).await,
            Err(MarketError::DuplicateRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn every_mutation_is_persisted_before_returning() {
        let storage = MemoryStorage::shared();
        let registry = registry(Arc::clone(&storage)).await;
        registry.add(request("r1", NOW + 100)).await.expect("add");
        assert!(registry.add_offer(offer("o1", "r1", NOW + 50)).await);

        let persisted: Vec<ClientRequestEntry> = storage
            .get_json("requests")
            .await
            .expect("read")
            .expect("snapshot");
        assert_eq!(persisted, registry.get_all().await);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_round_trips_entries() {
        let storage = MemoryStorage::shared();
        {
            let registry = registry(Arc::clone(&storage)).await;
            registry.add(request("r1", NOW + 100)).await.expect("add");
            assert!(registry.add_offer(offer("o1", "r1", NOW + 50)).await);
        }

        let restored = RequestRegistry::new(storage, &RegistryConfig::default(), clock());
        let mut changes = restored.subscribe();
        restored.restore().await;

        let change = changes.try_recv().expect("initial change");
        assert_eq!(change.requests.len(), 1);
        let entry = restored.get("r1").await.expect("entry");
        assert_eq!(entry.offers.len(), 1);
        assert_eq!(entry.offers[0].id, "o1");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_over_file_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("client.json");
        {
            let storage = Arc::new(JsonFileStorage::open(&path).await.expect("open"));
            let registry = RequestRegistry::open(storage, &RegistryConfig::default(), clock()).await;
            registry.add(request("r1", NOW + 100)).await.expect("add");
        }

        let storage = Arc::new(JsonFileStorage::open(&path).await.expect("reopen"));
        let registry = RequestRegistry::open(storage, &RegistryConfig::default(), clock()).await;
        assert_eq!(registry.get_all().await[0].data.id, "r1");
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_storage_starts_empty() {
        let storage = MemoryStorage::shared();
        storage.fail_reads(true);
        let registry = registry(Arc::clone(&storage)).await;
        assert!(registry.get_all().await.is_empty());

        registry.add(request("r1", NOW + 100)).await.expect("still usable");
        assert_eq!(registry.get_all().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_keeps_in_memory_state() {
        let storage = MemoryStorage::shared();
        let registry = registry(Arc::clone(&storage)).await;
        storage.fail_writes(true);

        registry.add(request("r1", NOW + 100)).await.expect("add");
        assert!(registry.get("r1").await.is_some());

        storage.fail_writes(false);
        let persisted: Vec<ClientRequestEntry> = storage
            .get_json("requests")
            .await
            .expect("read")
            .expect("snapshot from restore");
        assert!(persisted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offers_for_unknown_requests_are_dropped() {
        let registry = registry(MemoryStorage::shared()).await;
        registry.add(request("r1", NOW + 100)).await.expect("add");

        assert!(!registry.add_offer(offer("o1", "nope", NOW + 50)).await);
        assert!(registry.add_offer(offer("o2", "r1", NOW + 50)).await);
        assert!(!registry.add_offer(offer("o2", "r1", NOW + 50)).await);

        assert_eq!(registry.get("r1").await.expect("entry").offers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_requests_drop_offers() {
        let registry = registry(MemoryStorage::shared()).await;
        registry.add(request("r1", NOW + 100)).await.expect("add");
        registry.set_subscribed("r1", false).await.expect("unsubscribe");

        assert!(!registry.add_offer(offer("o1", "r1", NOW + 50)).await);
        assert!(matches!(
            registry.set_subscribed("missing", true).await,
            Err(MarketError::RequestNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn update_bumps_nonce_and_notifies() {
        let registry = registry(MemoryStorage::shared()).await;
        registry.add(request("r1", NOW + 100)).await.expect("add");
        let mut changes = registry.subscribe();

        let updated = registry
            .update("r1", |r| r.query = json!({"city": "porto"}))
            .await
            .expect("update");
        assert_eq!(updated.nonce, 2);
        assert_eq!(registry.get("r1").await.expect("entry").data.query, json!({"city": "porto"}));

        let change = changes.try_recv().expect("change");
        assert_eq!(change.requests[0].data.nonce, 2);

        let renamed = registry.update("r1", |r| r.id = "other".to_string()).await;
        assert!(matches!(renamed, Err(MarketError::InvalidRequest(_))));
        assert!(matches!(
            registry.update("missing", |_| {}).await,
            Err(MarketError::RequestNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_and_clear() {
        let registry = registry(MemoryStorage::shared()).await;
        registry.add(request("r1", NOW + 100)).await.expect("add");
        registry.add(request("r2", NOW + 100)).await.expect("add");

        assert!(registry.delete("r1").await);
        assert!(!registry.delete("r1").await);
        assert!(registry.get("r1").await.is_none());

        registry.clear().await;
        assert!(registry.get_all().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn update_refuses_to_wrap_the_nonce() {
        let registry = registry(MemoryStorage::shared()).await;
        registry
            .add(request("r1", NOW + 100).with_nonce(u64::MAX))
            .await
            .expect("add");
        let mut changes = registry.subscribe();

        let result = registry.update("r1", |r| r.query = json!({"city": "porto"})).await;
        assert!(matches!(result, Err(MarketError::InvalidRequest(_))));

        let entry = registry.get("r1").await.expect("entry");
        assert_eq!(entry.data.nonce, u64::MAX);
        assert_eq!(entry.data.query, json!({"city": "lisbon"}));
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_unknown_id_changes_nothing() {
        let registry = registry(MemoryStorage::shared()).await;
        registry.add(request("r1", NOW + 100)).await.expect("add");
        let mut changes = registry.subscribe();

        assert!(!registry.delete("missing").await);
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
        assert!(registry.get("r1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn change_events_count_up_per_mutation() {
        let registry = RequestRegistry::new(MemoryStorage::shared(), &RegistryConfig::default(), clock());
        let mut changes = registry.subscribe();
        registry.restore().await;
        registry.add(request("r1", NOW + 100)).await.expect("add");
        registry.delete("r1").await;

        let revisions: Vec<u64> = (0..3).map(|_| changes.try_recv().expect("change").revision).collect();
        assert_eq!(revisions, vec![1, 2, 3]);
        assert!(matches!(changes.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_timer_unsubscribes_request() {
        let registry = registry(MemoryStorage::shared()).await;
        registry.add(request("r1", NOW + 10)).await.expect("add");

        tokio::time::sleep(Duration::from_secs(11)).await;

        let entry = registry.get("r1").await.expect("entry");
        assert!(!entry.subscribed);
        assert!(!registry.add_offer(offer("late", "r1", NOW + 50)).await);

        assert_eq!(registry.prune_expired().await, 1);
        assert!(registry.get_all().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restore_rearms_expiry() {
        let storage = MemoryStorage::shared();
        {
            let registry = registry(Arc::clone(&storage)).await;
            registry.add(request("r1", NOW + 5)).await.expect("add");
        }

        let registry = registry(storage).await;
        assert!(registry.get("r1").await.expect("entry").subscribed);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!registry.get("r1").await.expect("entry").subscribed);
    }
}
