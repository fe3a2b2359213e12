//! Activity tasks: transient dispatch records for scheduled activity attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::events::{Event, EventKind};
use super::run::RunKey;

/// An activity attempt waiting in (or claimed from) a task queue.
///
/// Tasks are never persisted; they can always be rebuilt from the
/// `ActivityScheduled` event they reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Unique identifier of this dispatch
    pub task_id: Uuid,

    /// Run the attempt belongs to
    pub run: RunKey,

    /// Logical call-site index within the workflow program
    pub call_site: u32,

    /// Attempt number (1-based)
    pub attempt: u32,

    /// User-facing activity id (e.g. "task_03")
    pub activity_id: String,

    /// Registered activity type name
    pub activity_type: String,

    /// Activity input
    pub input: Value,

    /// Queue the task is dispatched to
    pub task_queue: String,

    /// Bound on a single attempt's execution
    #[serde(with = "duration_ms")]
    pub start_to_close_timeout: Duration,

    /// When the attempt was scheduled
    pub scheduled_at: DateTime<Utc>,

    /// Retry backoff before the task becomes claimable
    #[serde(with = "duration_ms")]
    pub backoff: Duration,
}

impl ActivityTask {
    /// Build a task from an `ActivityScheduled` event
    pub fn from_scheduled(workflow_id: &str, event: &Event) -> Option<Self> {
        let EventKind::ActivityScheduled {
            call_site,
            activity_id,
            activity_type,
            input,
            attempt,
            task_queue,
            start_to_close_timeout_ms,
            backoff_ms,
        } = &event.kind
        else {
            return None;
        };

        Some(Self {
            task_id: Uuid::new_v4(),
            run: RunKey::new(workflow_id, event.run_id),
            call_site: *call_site,
            attempt: *attempt,
            activity_id: activity_id.clone(),
            activity_type: activity_type.clone(),
            input: input.clone(),
            task_queue: task_queue.clone(),
            start_to_close_timeout: Duration::from_millis(*start_to_close_timeout_ms),
            scheduled_at: event.timestamp,
            backoff: Duration::from_millis(*backoff_ms),
        })
    }

    /// Earliest time a worker may claim the task
    pub fn visible_at(&self) -> DateTime<Utc> {
        self.scheduled_at + to_chrono(self.backoff)
    }

    /// `(run, call_site, attempt)` identifies the attempt across re-dispatches
    pub fn attempt_key(&self) -> (Uuid, u32, u32) {
        (self.run.run_id, self.call_site, self.attempt)
    }
}

/// Convert a std duration to a chrono duration, capped at a century
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Whole milliseconds of a duration, saturating at `u64::MAX`
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `at + ms`, or `None` if the result is not representable
pub fn add_millis(at: DateTime<Utc>, ms: u64) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::try_milliseconds(i64::try_from(ms).ok()?)?;
    at.checked_add_signed(delta)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(super::millis(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
