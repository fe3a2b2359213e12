//! Named activity task queues with lease-based claims.
//!
//! A claimed task is invisible to other workers until its lease expires.
//! Expired leases are reaped on every claim and the task goes back to the
//! head of the queue, which gives at-least-once delivery when a worker dies
//! mid-execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::task::to_chrono;
use crate::domain::ActivityTask;

use super::error::QueueError;

/// A time-bounded exclusive claim on a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Proof of ownership, required to acknowledge the task
    pub token: Uuid,

    /// Worker holding the claim
    pub worker_id: String,

    /// When the claim lapses
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left on the lease (zero once expired)
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A task handed to a worker together with its lease
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task: ActivityTask,
    pub lease: Lease,
}

#[derive(Debug)]
struct Pending {
    task: ActivityTask,
    visible_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Claimed {
    task: ActivityTask,
    lease: Lease,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    claimed: HashMap<Uuid, Claimed>,
    /// `(run, call_site, attempt)` of every task pending or claimed
    attempts: HashSet<(Uuid, u32, u32)>,
    redeliveries: u64,
}

impl QueueState {
    /// Return expired claims to the head of the queue
    fn reap_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .claimed
            .iter()
            .filter(|(_, c)| c.lease.is_expired_at(now))
            .map(|(id, _)| *id)
            .collect();

        for task_id in expired {
            if let Some(claimed) = self.claimed.remove(&task_id) {
                info!(
                    task_id = %task_id,
                    worker_id = %claimed.lease.worker_id,
                    call_site = claimed.task.call_site,
                    attempt = claimed.task.attempt,
                    "Lease expired, task returned to queue"
                );
                self.redeliveries += 1;
                self.pending.push_front(Pending {
                    task: claimed.task,
                    visible_at: now,
                });
            }
        }
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub claimed: usize,
    pub redeliveries: u64,
}

/// A single named task queue shared by all workers subscribed to it
#[derive(Debug)]
pub struct TaskQueue {
    name: String,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a task, claimable from its `visible_at()` on.
    ///
    /// Returns `false` if the same attempt is already pending or claimed.
    pub async fn enqueue(&self, task: ActivityTask) -> bool {
        let mut state = self.state.lock().await;
        if !state.attempts.insert(task.attempt_key()) {
            debug!(queue = %self.name, task_id = %task.task_id, "Attempt already queued");
            return false;
        }

        let visible_at = task.visible_at();
        state.pending.push_back(Pending { task, visible_at });
        true
    }

    /// Claim the first visible task, or `None` if nothing is claimable.
    /// Never blocks waiting for work.
    ///
    /// The lease lasts `lease_duration` or the task's start-to-close timeout,
    /// whichever is longer.
    pub async fn claim(&self, worker_id: &str, lease_duration: Duration) -> Option<ClaimedTask> {
        self.claim_at(worker_id, lease_duration, Utc::now()).await
    }

    async fn claim_at(
        &self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<ClaimedTask> {
        let mut state = self.state.lock().await;
        state.reap_expired(now);

        let position = state.pending.iter().position(|p| p.visible_at <= now)?;
        let pending = state.pending.remove(position)?;

        // An attempt may run for its whole start-to-close timeout
        let lease_duration = lease_duration.max(pending.task.start_to_close_timeout);
        let lease = Lease {
            token: Uuid::new_v4(),
            worker_id: worker_id.to_string(),
            expires_at: now + to_chrono(lease_duration),
        };
        state.claimed.insert(
            pending.task.task_id,
            Claimed {
                task: pending.task.clone(),
                lease: lease.clone(),
            },
        );

        Some(ClaimedTask {
            task: pending.task,
            lease,
        })
    }

    /// Acknowledge a claimed task, removing it for good
    pub async fn complete(&self, task_id: Uuid, lease_token: Uuid) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let claimed = state
            .claimed
            .get(&task_id)
            .ok_or(QueueError::UnknownTask(task_id))?;

        if claimed.lease.token != lease_token {
            return Err(QueueError::LeaseMismatch(task_id));
        }
        if claimed.lease.is_expired() {
            return Err(QueueError::LeaseExpired(task_id));
        }

        if let Some(claimed) = state.claimed.remove(&task_id) {
            state.attempts.remove(&claimed.task.attempt_key());
        }
        Ok(())
    }

    /// Drop every task (pending or claimed) of a run. Returns how many were removed.
    pub async fn remove_run(&self, run_id: Uuid) -> usize {
        let mut state = self.state.lock().await;
        let before = state.pending.len() + state.claimed.len();

        state.pending.retain(|p| p.task.run.run_id != run_id);
        state.claimed.retain(|_, c| c.task.run.run_id != run_id);
        state.attempts.retain(|(r, _, _)| *r != run_id);

        before - state.pending.len() - state.claimed.len()
    }

    /// Drop a single attempt, e.g. once its outcome was recorded by someone else
    pub async fn remove_attempt(&self, run_id: Uuid, call_site: u32, attempt: u32) -> bool {
        let mut state = self.state.lock().await;
        let key = (run_id, call_site, attempt);
        if !state.attempts.remove(&key) {
            return false;
        }
        state.pending.retain(|p| p.task.attempt_key() != key);
        state.claimed.retain(|_, c| c.task.attempt_key() != key);
        true
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.pending.len(),
            claimed: state.claimed.len(),
            redeliveries: state.redeliveries,
        }
    }

    /// Number of tasks pending or claimed
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.claimed.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Lookup table of task queues by name
#[derive(Debug, Default)]
pub struct TaskQueueRegistry {
    queues: RwLock<HashMap<String, Arc<TaskQueue>>>,
}

impl TaskQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the queue with this name, creating it on first use
    pub async fn get_or_create(&self, name: &str) -> Arc<TaskQueue> {
        if let Some(queue) = self.queues.read().await.get(name) {
            return queue.clone();
        }

        let mut queues = self.queues.write().await;
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(TaskQueue::new(name)))
            .clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<TaskQueue>> {
        self.queues.read().await.get(name).cloned()
    }

    /// Remove a run's tasks from every queue
    pub async fn remove_run(&self, run_id: Uuid) -> usize {
        let queues: Vec<Arc<TaskQueue>> = self.queues.read().await.values().cloned().collect();
        let mut removed = 0;
        for queue in queues {
            removed += queue.remove_run(run_id).await;
        }
        removed
    }
}
