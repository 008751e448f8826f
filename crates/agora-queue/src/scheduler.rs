//! Persistent job scheduler.
//!
//! Jobs live in memory and are written through to storage on every state
//! transition: each job under `job/{id}` and the list of known ids under
//! `jobs`. A heartbeat wakes the scheduling loop at a fixed interval; adding a
//! job, registering a handler or finishing an attempt wakes it early.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agora_core::{QueueConfig, SharedClock, SharedStorage, StorageExt};
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::handler::JobHandler;
use crate::job::{Job, JobState, NewJob};

const INDEX_KEY: &str = "jobs";
const INTERRUPTED: &str = "attempt interrupted by restart";

fn job_key(id: &str) -> String {
    format!("job/{id}")
}

/// A job state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    /// The job that changed.
    pub job_id: String,
    /// Its handler name.
    pub handler: String,
    /// The state it entered.
    pub state: JobState,
    /// Attempts started so far.
    pub attempts: u32,
}

impl JobEvent {
    fn of(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            handler: job.handler.clone(),
            state: job.state,
            attempts: job.attempts,
        }
    }
}

struct SchedulerInner {
    storage: SharedStorage,
    clock: SharedClock,
    config: QueueConfig,
    jobs: Mutex<BTreeMap<String, Job>>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    wake: Notify,
    stopped: AtomicBool,
    events: broadcast::Sender<JobEvent>,
}

impl SchedulerInner {
    fn emit(&self, job: &Job) {
        if self.events.send(JobEvent::of(job)).is_err() {
            trace!(job_id = %job.id, "no job listeners");
        }
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.storage.set_json(&job_key(&job.id), job).await {
            warn!(job_id = %job.id, state = %job.state, error = %e, "failed to persist job");
        }
    }

    async fn persist_index(&self, jobs: &BTreeMap<String, Job>) -> Result<(), QueueError> {
        let ids: Vec<&str> = jobs.keys().map(String::as_str).collect();
        self.storage.set_json(INDEX_KEY, &ids).await?;
        Ok(())
    }

    async fn transition(&self, job: &mut Job, state: JobState) {
        job.state = state;
        debug!(job_id = %job.id, handler = %job.handler, attempts = job.attempts, state = %state, "job transition");
        self.persist(job).await;
        self.emit(job);
    }

    /// Expires overdue jobs and starts due ones up to the concurrency limit.
    async fn tick(self: &Arc<Self>) {
        let now = self.clock.now_millis();
        let mut jobs = self.jobs.lock().await;

        for job in jobs.values_mut() {
            if !job.state.is_terminal() && job.state != JobState::Running && job.is_expired(now) {
                self.transition(job, JobState::Expired).await;
            }
        }

        let mut running = jobs
            .values()
            .filter(|j| j.state == JobState::Running)
            .count();
        let mut due: Vec<(i64, i64, String)> = jobs
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| (j.scheduled_at_ms, j.created_at_ms, j.id.clone()))
            .collect();
        due.sort();

        for (_, _, id) in due {
            if running >= self.config.concurrency_limit || self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let Some(job) = jobs.get_mut(&id) else {
                continue;
            };
            let handler = self.handlers.read().get(&job.handler).cloned();
            let Some(handler) = handler else {
                trace!(job_id = %id, handler = %job.handler, "no handler registered yet");
                continue;
            };

            job.attempts += 1;
            self.transition(job, JobState::Running).await;
            running += 1;
            self.spawn_attempt(handler, job.clone());
        }
    }

    fn spawn_attempt(self: &Arc<Self>, handler: Arc<dyn JobHandler>, job: Job) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let id = job.id.clone();
            // Nested task so a panicking handler surfaces as a JoinError.
            let result = match tokio::spawn(handler.handle(job)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(e) if e.is_panic() => Err("handler panicked".to_string()),
                Err(_) => Err("handler cancelled".to_string()),
            };
            inner.finish(&id, result).await;
        });
    }

    async fn finish(&self, id: &str, result: Result<(), String>) {
        let now = self.clock.now_millis();
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(id) else {
            return;
        };
        if job.state != JobState::Running {
            return;
        }

        let next = match result {
            _ if job.is_expired(now) => JobState::Expired,
            Ok(()) => JobState::Completed,
            Err(error) => {
                warn!(job_id = %id, handler = %job.handler, attempts = job.attempts, %error, "job attempt failed");
                self.record_failure(job, error, now)
            }
        };
        self.transition(job, next).await;
        drop(jobs);
        self.wake.notify_one();
    }

    /// Stores a failed attempt's error and picks the state that follows it.
    fn record_failure(&self, job: &mut Job, error: String, now_ms: i64) -> JobState {
        job.last_error = Some(error);
        if job.attempts <= job.max_retries {
            let delay = i64::try_from(self.config.retry_delay_ms).unwrap_or(i64::MAX);
            job.scheduled_at_ms = now_ms.saturating_add(delay);
            JobState::RetryScheduled
        } else {
            JobState::Dead
        }
    }
}

/// Durable, retrying, concurrency-bounded job runner.
///
/// Dropping the scheduler stops it; attempts already in flight still finish
/// and record their outcome.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    /// Recovers persisted jobs and starts the scheduling loop.
    ///
    /// Jobs found `Running` were interrupted by a crash. The interrupted attempt
    /// counts as a failed one: the job is retried after the retry delay, marked
    /// `Dead` if it has no retries left, or `Expired` if its expiry has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted jobs cannot be read.
    pub async fn start(
        storage: SharedStorage,
        clock: SharedClock,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let (events, _) = broadcast::channel(1024);
        let inner = Arc::new(SchedulerInner {
            storage,
            clock,
            config,
            jobs: Mutex::new(BTreeMap::new()),
            handlers: RwLock::new(HashMap::new()),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            events,
        });

        Self::recover(&inner).await?;
        tokio::spawn(Self::run(Arc::clone(&inner)));

        Ok(Self { inner })
    }

    async fn recover(inner: &SchedulerInner) -> Result<(), QueueError> {
        let ids: Vec<String> = inner.storage.get_json(INDEX_KEY).await?.unwrap_or_default();
        let now = inner.clock.now_millis();
        let mut jobs = inner.jobs.lock().await;
        let mut missing = false;

        for id in ids {
            let Some(mut job) = inner.storage.get_json::<Job>(&job_key(&id)).await? else {
                warn!(job_id = %id, "indexed job has no record, dropping it");
                missing = true;
                continue;
            };
            if job.state == JobState::Running {
                warn!(job_id = %id, handler = %job.handler, attempts = job.attempts, "recovering interrupted job");
                job.state = if job.is_expired(now) {
                    job.last_error = Some(INTERRUPTED.to_string());
                    JobState::Expired
                } else {
                    inner.record_failure(&mut job, INTERRUPTED.to_string(), now)
                };
                debug!(job_id = %id, state = %job.state, "interrupted job reclassified");
                inner.persist(&job).await;
            }
            jobs.insert(id, job);
        }

        if missing {
            if let Err(e) = inner.persist_index(&jobs).await {
                warn!(error = %e, "failed to persist job index");
            }
        }
        debug!(count = jobs.len(), "job scheduler recovered");
        Ok(())
    }

    async fn run(inner: Arc<SchedulerInner>) {
        let period = inner.config.heartbeat_interval().max(Duration::from_millis(10));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {}
                () = inner.wake.notified() => {}
            }
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            inner.tick().await;
        }
        debug!("job scheduler loop stopped");
    }

    /// Registers the handler for jobs named `name`, replacing any previous one.
    ///
    /// Jobs waiting for this handler become eligible immediately.
    pub fn register_handler(&self, name: impl Into<String>, handler: impl JobHandler) {
        let name = name.into();
        debug!(handler = %name, "registered job handler");
        self.inner.handlers.write().insert(name, Arc::new(handler));
        self.inner.wake.notify_one();
    }

    /// Validates, persists and enqueues a job, returning its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler is stopped, the job is scheduled at or
    /// after its expiry, or it cannot be persisted.
    pub async fn add(&self, new_job: NewJob) -> Result<String, QueueError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }
        if new_job.handler.trim().is_empty() {
            return Err(QueueError::InvalidJob("handler name is empty".to_string()));
        }

        let now = self.inner.clock.now_millis();
        let default_ttl = Duration::from_secs(self.inner.config.default_expiration_secs);
        let (scheduled_at_ms, expire_at_ms) = new_job.resolve(now, default_ttl);
        if scheduled_at_ms >= expire_at_ms {
            return Err(QueueError::InvalidJob(format!(
                "job for {} is scheduled at {scheduled_at_ms}, not before its expiry {expire_at_ms}",
                new_job.handler
            )));
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            handler: new_job.handler,
            data: new_job.data,
            max_retries: new_job.max_retries,
            attempts: 0,
            created_at_ms: now,
            scheduled_at_ms,
            expire_at_ms,
            state: JobState::Scheduled,
            last_error: None,
        };

        let mut jobs = self.inner.jobs.lock().await;
        self.inner.storage.set_json(&job_key(&job.id), &job).await?;
        jobs.insert(job.id.clone(), job.clone());
        if let Err(e) = self.inner.persist_index(&jobs).await {
            jobs.remove(&job.id);
            if let Err(cleanup) = self.inner.storage.delete(&job_key(&job.id)).await {
                warn!(job_id = %job.id, error = %cleanup, "failed to remove unindexed job");
            }
            return Err(e);
        }
        debug!(job_id = %job.id, handler = %job.handler, scheduled_at_ms, expire_at_ms, "job added");
        self.inner.emit(&job);
        drop(jobs);

        self.inner.wake.notify_one();
        Ok(job.id)
    }

    /// Returns a copy of a job in any state, until it is pruned.
    pub async fn get(&self, id: &str) -> Option<Job> {
        self.inner.jobs.lock().await.get(id).cloned()
    }

    /// Returns a copy of every known job.
    pub async fn jobs(&self) -> Vec<Job> {
        self.inner.jobs.lock().await.values().cloned().collect()
    }

    /// Subscribes to job state transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Forgets jobs in a terminal state, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the job index cannot be rewritten.
    pub async fn prune_finished(&self) -> Result<usize, QueueError> {
        let mut jobs = self.inner.jobs.lock().await;
        let finished: Vec<String> = jobs
            .values()
            .filter(|j| j.state.is_terminal())
            .map(|j| j.id.clone())
            .collect();
        if finished.is_empty() {
            return Ok(0);
        }

        let remaining: Vec<&str> = jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.id.as_str())
            .collect();
        self.inner.storage.set_json(INDEX_KEY, &remaining).await?;
        for id in &finished {
            jobs.remove(id);
        }
        for id in &finished {
            if let Err(e) = self.inner.storage.delete(&job_key(id)).await {
                warn!(job_id = %id, error = %e, "failed to delete pruned job");
            }
        }
        debug!(removed = finished.len(), "pruned finished jobs");
        Ok(finished.len())
    }

    /// Stops the scheduling loop. Persisted jobs are kept for a later instance.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.wake.notify_one();
        }
    }

    /// Whether the scheduling loop is still accepting work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
