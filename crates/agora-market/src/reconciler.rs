//! Debouncing of request announcements.
//!
//! A request is usually seen several times: re-broadcast by different peers,
//! re-published with a higher nonce, delivered out of order. The reconciler
//! holds the first sighting of a request id for one nonce period, folds any
//! newer versions seen in that window into it, and then emits a single
//! [`ReconciledRequest`] carrying the latest version.
//!
//! Once emitted, a request id is forgotten. Suppressing later re-deliveries is
//! the job of the dedup cache in front of the reconciler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agora_core::{GossipConfig, SharedClock};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::request::RequestRecord;

/// A request that survived its debounce window.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciledRequest {
    /// Topic of the latest announcement.
    pub topic: String,
    /// Latest version seen during the window.
    pub request: RequestRecord,
}

/// What [`RequestReconciler::handle`] did with an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// First sighting; a debounce timer was armed.
    Scheduled,
    /// Newer version of a pending request; the pending data was replaced.
    Superseded,
    /// Same or older version of a pending request; ignored.
    Stale,
    /// Already expired on arrival; dropped.
    Expired,
    /// Would expire before the debounce window ends; dropped.
    TooLate,
    /// Could not be parsed; dropped.
    Malformed,
}

#[derive(Debug)]
struct PendingRequest {
    topic: String,
    request: RequestRecord,
    timer: JoinHandle<()>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

/// Node-side request reconciler.
#[derive(Debug)]
pub struct RequestReconciler {
    nonce_period: Duration,
    clock: SharedClock,
    pending: PendingMap,
    events: broadcast::Sender<ReconciledRequest>,
}

impl RequestReconciler {
    /// Creates a reconciler using the configured nonce period.
    #[must_use]
    pub fn new(config: &GossipConfig, clock: SharedClock) -> Self {
        Self::with_nonce_period(config.nonce_period(), clock)
    }

    /// Creates a reconciler with an explicit debounce window.
    #[must_use]
    pub fn with_nonce_period(nonce_period: Duration, clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            nonce_period,
            clock,
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribes to reconciled requests.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReconciledRequest> {
        self.events.subscribe()
    }

    /// Number of requests waiting out their debounce window.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Feeds one raw request announcement received on `topic`.
    ///
    /// Must be called from within a tokio runtime; debounce timers are tasks.
    pub fn handle(&self, topic: &str, data: &[u8]) -> ReconcileOutcome {
        let request = match RequestRecord::decode(data) {
            Ok(request) => request,
            Err(e) => {
                warn!(topic, error = %e, "dropping malformed request");
                return ReconcileOutcome::Malformed;
            }
        };

        let now_ms = self.clock.now_millis();
        let expire_ms = request.expire.saturating_mul(1000);
        if expire_ms <= now_ms {
            trace!(request_id = %request.id, "dropping expired request");
            return ReconcileOutcome::Expired;
        }
        let window_ms = i64::try_from(self.nonce_period.as_millis()).unwrap_or(i64::MAX);
        if now_ms.saturating_add(window_ms) > expire_ms {
            trace!(request_id = %request.id, "dropping request that expires within the nonce period");
            return ReconcileOutcome::TooLate;
        }

        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(&request.id) {
            if request.nonce > entry.request.nonce {
                trace!(
                    request_id = %request.id,
                    nonce = request.nonce,
                    previous = entry.request.nonce,
                    "superseding pending request"
                );
                entry.topic = topic.to_string();
                entry.request = request;
                return ReconcileOutcome::Superseded;
            }
            trace!(request_id = %request.id, nonce = request.nonce, "ignoring stale request");
            return ReconcileOutcome::Stale;
        }

        let timer = self.arm_timer(request.id.clone());
        debug!(request_id = %request.id, topic, "request pending");
        pending.insert(
            request.id.clone(),
            PendingRequest {
                topic: topic.to_string(),
                request,
                timer,
            },
        );
        ReconcileOutcome::Scheduled
    }

    fn arm_timer(&self, request_id: String) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        let period = self.nonce_period;

        tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let Some(entry) = pending.lock().remove(&request_id) else {
                return;
            };
            debug!(request_id = %request_id, nonce = entry.request.nonce, "request reconciled");
            let event = ReconciledRequest {
                topic: entry.topic,
                request: entry.request,
            };
            if events.send(event).is_err() {
                trace!(request_id = %request_id, "no listeners for reconciled request");
            }
        })
    }

    /// Cancels every pending debounce timer without emitting.
    pub fn stop(&self) {
        for (_, entry) in self.pending.lock().drain() {
            entry.timer.abort();
        }
    }
}

impl Drop for RequestReconciler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::MonotonicClock;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    const NOW: i64 = 1_700_000_000;

    fn reconciler(period_secs: u64) -> RequestReconciler {
        let clock = MonotonicClock::anchored_at(NOW * 1000).shared();
        RequestReconciler::with_nonce_period(Duration::from_secs(period_secs), clock)
    }

    fn announce(nonce: u64, expire: i64, note: &str) -> Vec<u8> {
        RequestRecord::new("hotels", json!({ "note": note }), expire)
            .with_id("req-1")
            .with_nonce(nonce)
            .encode()
            .expect("encode")
    }

    #[tokio::test(start_paused = true)]
    async fn single_announcement_fires_after_window() {
        let reconciler = reconciler(1);
        let mut events = reconciler.subscribe();

        let outcome = reconciler.handle("hotels", &announce(1, NOW + 100, "a"));
        assert_eq!(outcome, ReconcileOutcome::Scheduled);
        assert_eq!(reconciler.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let event = events.try_recv().expect("event");
        assert_eq!(event.topic, "hotels");
        assert_eq!(event.request.id, "req-1");
        assert_eq!(reconciler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_updates_yields_one_event_with_highest_nonce() {
        let reconciler = reconciler(1);
        let mut events = reconciler.subscribe();

        assert_eq!(reconciler.handle("hotels", &announce(1, NOW + 100, "v1")), ReconcileOutcome::Scheduled);
        assert_eq!(reconciler.handle("hotels", &announce(3, NOW + 100, "v3")), ReconcileOutcome::Superseded);
        assert_eq!(reconciler.handle("hotels", &announce(2, NOW + 100, "v2")), ReconcileOutcome::Stale);
        assert_eq!(reconciler.handle("hotels", &announce(3, NOW + 100, "dup")), ReconcileOutcome::Stale);
        assert_eq!(reconciler.handle("hotels", &announce(4, NOW + 100, "v4")), ReconcileOutcome::Superseded);

        tokio::time::sleep(Duration::from_secs(2)).await;

        let event = events.try_recv().expect("event");
        assert_eq!(event.request.nonce, 4);
        assert_eq!(event.request.query, json!({"note": "v4"}));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn supersede_does_not_reset_the_timer() {
        let reconciler = reconciler(2);
        let mut events = reconciler.subscribe();

        reconciler.handle("hotels", &announce(1, NOW + 100, "v1"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        reconciler.handle("hotels", &announce(2, NOW + 100, "v2"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let event = events.try_recv().expect("event within original window");
        assert_eq!(event.request.nonce, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_and_too_late_requests_never_fire() {
        let reconciler = reconciler(5);
        let mut events = reconciler.subscribe();

        assert_eq!(reconciler.handle("hotels", &announce(1, NOW, "expired")), ReconcileOutcome::Expired);
        assert_eq!(reconciler.handle("hotels", &announce(1, NOW + 4, "late")), ReconcileOutcome::TooLate);
        assert_eq!(reconciler.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn window_ending_exactly_at_expiry_is_accepted() {
        let reconciler = reconciler(5);
        assert_eq!(
            reconciler.handle("hotels", &announce(1, NOW + 5, "edge")),
            ReconcileOutcome::Scheduled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_dropped() {
        let reconciler = reconciler(1);
        assert_eq!(reconciler.handle("hotels", b"{broken"), ReconcileOutcome::Malformed);
        assert_eq!(reconciler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_requests_fire_independently() {
        let reconciler = reconciler(1);
        let mut events = reconciler.subscribe();

        for id in ["a", "b", "c"] {
            let bytes = RequestRecord::new("hotels", json!(null), NOW + 60)
                .with_id(id)
                .encode()
                .expect("encode");
            assert_eq!(reconciler.handle("hotels", &bytes), ReconcileOutcome::Scheduled);
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut ids: Vec<String> = (0..3)
            .map(|_| events.try_recv().expect("event").request.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn every_listener_receives_the_event() {
        let reconciler = reconciler(1);
        let mut first = reconciler.subscribe();
        let mut second = reconciler.subscribe();

        reconciler.handle("hotels", &announce(1, NOW + 60, "x"));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(first.try_recv().expect("first").request.id, "req-1");
        assert_eq!(second.try_recv().expect("second").request.id, "req-1");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timers() {
        let reconciler = reconciler(1);
        let mut events = reconciler.subscribe();

        reconciler.handle("hotels", &announce(1, NOW + 60, "x"));
        reconciler.stop();
        assert_eq!(reconciler.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn request_id_can_pend_again_after_emission() {
        let reconciler = reconciler(1);
        let mut events = reconciler.subscribe();

        reconciler.handle("hotels", &announce(1, NOW + 60, "first"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(events.try_recv().expect("first").request.nonce, 1);

        assert_eq!(
            reconciler.handle("hotels", &announce(2, NOW + 60, "second")),
            ReconcileOutcome::Scheduled
        );
    }
}
