//! Job records and their lifecycle.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a job.
///
/// ```text
/// Scheduled -> Running -> Completed
///                      -> RetryScheduled -> Running -> ...
///                      -> Dead
/// (any non-terminal state) -> Expired
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its scheduled time.
    Scheduled,
    /// A handler attempt is in flight.
    Running,
    /// The handler succeeded.
    Completed,
    /// The last attempt failed; waiting for the retry delay to pass.
    RetryScheduled,
    /// The expiry passed before the job could complete.
    Expired,
    /// Every allowed attempt failed.
    Dead,
}

impl JobState {
    /// Terminal states never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Dead)
    }

    /// States the scheduler may start once the scheduled time has passed.
    #[must_use]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::Scheduled | Self::RetryScheduled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::RetryScheduled => "retry_scheduled",
            Self::Expired => "expired",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: String,
    /// Name of the handler that processes this job.
    pub handler: String,
    /// Opaque payload passed to the handler.
    pub data: Value,
    /// Retries allowed after the first attempt fails.
    pub max_retries: u32,
    /// Attempts started so far.
    pub attempts: u32,
    /// Epoch millis when the job was added.
    pub created_at_ms: i64,
    /// Epoch millis before which the job is not run.
    pub scheduled_at_ms: i64,
    /// Epoch millis at which the job is abandoned.
    pub expire_at_ms: i64,
    /// Current lifecycle state.
    pub state: JobState,
    /// Error message of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    /// Whether the expiry has been reached at `now_ms`.
    #[must_use]
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        self.expire_at_ms <= now_ms
    }

    /// Whether the job may be started at `now_ms`.
    #[must_use]
    pub const fn is_due(&self, now_ms: i64) -> bool {
        self.state.is_runnable() && self.scheduled_at_ms <= now_ms && !self.is_expired(now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timing {
    At(i64),
    After(Duration),
}

impl Timing {
    fn resolve(self, now_ms: i64) -> i64 {
        match self {
            Self::At(ms) => ms,
            Self::After(delay) => {
                now_ms.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
            }
        }
    }
}

/// Description of a job to add to a [`JobScheduler`](crate::JobScheduler).
///
/// Without further settings the job runs as soon as possible, is never retried
/// and expires after the queue's default expiration.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub(crate) handler: String,
    pub(crate) data: Value,
    pub(crate) max_retries: u32,
    scheduled: Option<Timing>,
    expire: Option<Timing>,
}

impl NewJob {
    /// A job for `handler` carrying `data`.
    pub fn new(handler: impl Into<String>, data: Value) -> Self {
        Self {
            handler: handler.into(),
            data,
            max_retries: 0,
            scheduled: None,
            expire: None,
        }
    }

    /// Allows `retries` further attempts after a failure.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Runs no earlier than `epoch_ms`.
    #[must_use]
    pub const fn scheduled_at_ms(mut self, epoch_ms: i64) -> Self {
        self.scheduled = Some(Timing::At(epoch_ms));
        self
    }

    /// Runs no earlier than `delay` after being added.
    #[must_use]
    pub const fn scheduled_in(mut self, delay: Duration) -> Self {
        self.scheduled = Some(Timing::After(delay));
        self
    }

    /// Expires at `epoch_ms`.
    #[must_use]
    pub const fn expire_at_ms(mut self, epoch_ms: i64) -> Self {
        self.expire = Some(Timing::At(epoch_ms));
        self
    }

    /// Expires `ttl` after being added.
    #[must_use]
    pub const fn expire_in(mut self, ttl: Duration) -> Self {
        self.expire = Some(Timing::After(ttl));
        self
    }

    /// Resolves the schedule and expiry against `now_ms`.
    pub(crate) fn resolve(&self, now_ms: i64, default_ttl: Duration) -> (i64, i64) {
        let scheduled = self.scheduled.map_or(now_ms, |t| t.resolve(now_ms));
        let expire = self
            .expire
            .unwrap_or(Timing::After(default_ttl))
            .resolve(now_ms);
        (scheduled, expire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn job(state: JobState) -> Job {
        Job {
            id: "j1".to_string(),
            handler: "h".to_string(),
            data: json!(null),
            max_retries: 1,
            attempts: 0,
            created_at_ms: 0,
            scheduled_at_ms: 1_000,
            expire_at_ms: 5_000,
            state,
            last_error: None,
        }
    }

    #[test_case(JobState::Scheduled, false, true)]
    #[test_case(JobState::Running, false, false)]
    #[test_case(JobState::RetryScheduled, false, true)]
    #[test_case(JobState::Completed, true, false)]
    #[test_case(JobState::Expired, true, false)]
    #[test_case(JobState::Dead, true, false)]
    fn state_classification(state: JobState, terminal: bool, runnable: bool) {
        assert_eq!(state.is_terminal(), terminal);
        assert_eq!(state.is_runnable(), runnable);
    }

    #[test_case(999, false ; "before schedule")]
    #[test_case(1_000, true ; "at schedule")]
    #[test_case(4_999, true ; "before expiry")]
    #[test_case(5_000, false ; "at expiry")]
    fn due_window(now: i64, due: bool) {
        assert_eq!(job(JobState::Scheduled).is_due(now), due);
    }

    #[test]
    fn running_jobs_are_never_due() {
        assert!(!job(JobState::Running).is_due(2_000));
    }

    #[test]
    fn state_serializes_snake_case() {
        let encoded = serde_json::to_string(&JobState::RetryScheduled).expect("encode");
        assert_eq!(encoded, "\"retry_scheduled\"");
        assert_eq!(JobState::RetryScheduled.to_string(), "retry_scheduled");
    }

    #[test]
    fn new_job_defaults_to_now_and_queue_ttl() {
        let (scheduled, expire) =
            NewJob::new("h", json!(1)).resolve(10_000, Duration::from_secs(60));
        assert_eq!(scheduled, 10_000);
        assert_eq!(expire, 70_000);
    }

    #[test]
    fn relative_and_absolute_timing() {
        let new_job = NewJob::new("h", json!(1))
            .scheduled_in(Duration::from_secs(3))
            .expire_at_ms(99_000);
        assert_eq!(new_job.resolve(10_000, Duration::from_secs(60)), (13_000, 99_000));

        let new_job = NewJob::new("h", json!(1))
            .scheduled_at_ms(20_000)
            .expire_in(Duration::from_secs(5));
        assert_eq!(new_job.resolve(10_000, Duration::from_secs(60)), (20_000, 15_000));
    }
}
