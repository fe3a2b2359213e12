//! Activity timing analysis over a run's history.
//!
//! Offsets are seconds since `WorkflowStarted`. Only attempts that completed
//! are reported, ordered by call-site.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Event, EventKind};

/// Lifecycle timings of one completed activity call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityTiming {
    pub call_site: u32,
    pub activity_id: String,
    pub attempt: u32,
    pub worker_id: Option<String>,

    /// Scheduling of the completing attempt
    pub created_at: f64,
    pub started_at: f64,
    pub completed_at: f64,

    /// Start to completion
    pub duration: f64,

    /// Idle time before the start: since scheduling for the first call,
    /// since the previous completion for the others
    pub waiting_time: f64,
}

/// Whole-run summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingReport {
    pub activities: Vec<ActivityTiming>,

    /// Start to close of the run (None while running)
    pub total: Option<f64>,

    /// Sum of activity execution time
    pub executing: f64,

    /// Sum of waiting time (queueing plus orchestration overhead)
    pub waiting: f64,
}

impl TimingReport {
    /// Mean orchestration overhead between consecutive activities
    pub fn mean_transition(&self) -> Option<f64> {
        let transitions: Vec<f64> = self
            .activities
            .iter()
            .skip(1)
            .map(|a| a.waiting_time)
            .collect();
        if transitions.is_empty() {
            return None;
        }
        Some(transitions.iter().sum::<f64>() / transitions.len() as f64)
    }

    /// Benchmark export: parallel arrays per activity plus the worker that ran
    /// each one, as zero-based indices in order of first appearance
    pub fn benchmark_json(&self, workers: usize) -> serde_json::Value {
        let mut data = serde_json::json!({
            "workers": workers,
            "created_at": self.activities.iter().map(|a| round3(a.created_at)).collect::<Vec<_>>(),
            "started_at": self.activities.iter().map(|a| round3(a.started_at)).collect::<Vec<_>>(),
            "completed_at": self.activities.iter().map(|a| round3(a.completed_at)).collect::<Vec<_>>(),
        });

        if workers > 1 {
            let mut seen: Vec<&str> = Vec::new();
            let mapping: Vec<usize> = self
                .activities
                .iter()
                .map(|a| {
                    let worker = a.worker_id.as_deref().unwrap_or("");
                    match seen.iter().position(|w| *w == worker) {
                        Some(idx) => idx,
                        None => {
                            seen.push(worker);
                            seen.len() - 1
                        }
                    }
                })
                .collect();
            data["worker_execution"] = serde_json::json!(mapping);
        }

        data
    }
}

#[derive(Default)]
struct AttemptTimes {
    activity_id: String,
    scheduled: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    completed: Option<DateTime<Utc>>,
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Build the timing report for a history. Returns `None` without a start event.
pub fn analyze(history: &[Event]) -> Option<TimingReport> {
    let start = history
        .iter()
        .find(|e| matches!(e.kind, EventKind::WorkflowStarted { .. }))?
        .timestamp;
    let closed = history.iter().find(|e| e.is_terminal()).map(|e| e.timestamp);

    let mut attempts: BTreeMap<(u32, u32), AttemptTimes> = BTreeMap::new();
    for event in history {
        match &event.kind {
            EventKind::ActivityScheduled {
                call_site,
                attempt,
                activity_id,
                ..
            } => {
                let times = attempts.entry((*call_site, *attempt)).or_default();
                times.activity_id = activity_id.clone();
                times.scheduled = Some(event.timestamp);
            }
            EventKind::ActivityStarted {
                call_site,
                attempt,
                worker_id,
            } => {
                let times = attempts.entry((*call_site, *attempt)).or_default();
                times.started = Some(event.timestamp);
                times.worker_id = Some(worker_id.clone());
            }
            EventKind::ActivityCompleted {
                call_site, attempt, ..
            } => {
                attempts.entry((*call_site, *attempt)).or_default().completed =
                    Some(event.timestamp);
            }
            _ => {}
        }
    }

    let mut activities: Vec<ActivityTiming> = Vec::new();
    for ((call_site, attempt), times) in attempts {
        let (Some(scheduled), Some(started), Some(completed)) =
            (times.scheduled, times.started, times.completed)
        else {
            continue;
        };

        let waiting_from = activities
            .last()
            .map(|prev: &ActivityTiming| prev.completed_at)
            .unwrap_or_else(|| seconds_between(start, scheduled));

        let started_at = seconds_between(start, started);
        activities.push(ActivityTiming {
            call_site,
            activity_id: times.activity_id,
            attempt,
            worker_id: times.worker_id,
            created_at: seconds_between(start, scheduled),
            started_at,
            completed_at: seconds_between(start, completed),
            duration: seconds_between(started, completed),
            waiting_time: started_at - waiting_from,
        });
    }

    Some(TimingReport {
        total: closed.map(|c| seconds_between(start, c)),
        executing: activities.iter().map(|a| a.duration).sum(),
        waiting: activities.iter().map(|a| a.waiting_time).sum(),
        activities,
    })
}
