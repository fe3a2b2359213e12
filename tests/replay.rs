//! Replay Determinism Tests
//!
//! Drives the bench workflow through a simulated lifetime, then checks that
//! replaying any recorded prefix of the final history yields exactly the
//! events that followed it.

use ledgerflow::core::executor::outstanding_attempts;
use ledgerflow::core::{replay, Command, RetryPolicy, Workflow};
use ledgerflow::domain::{keys, ErrorKind, Event, EventKind};
use ledgerflow::workflows::{BenchInput, BenchWorkflow};
use serde_json::json;
use uuid::Uuid;

struct Simulation {
    run_id: Uuid,
    events: Vec<Event>,
    /// (prefix length, commands emitted for that prefix)
    decisions: Vec<(usize, Vec<Command>)>,
}

impl Simulation {
    fn start(input: &BenchInput) -> Self {
        let run_id = Uuid::new_v4();
        let mut sim = Self {
            run_id,
            events: Vec::new(),
            decisions: Vec::new(),
        };
        sim.push(
            keys::start(run_id),
            EventKind::WorkflowStarted {
                workflow_id: input.workflow_id(),
                workflow_type: BenchWorkflow::TYPE.to_string(),
                input: serde_json::to_value(input).unwrap(),
                task_queue: input.task_queue(),
                execution_timeout_ms: None,
            },
        );
        sim
    }

    fn push(&mut self, key: String, kind: EventKind) {
        let mut event = Event::new(self.run_id, key, kind);
        event.seq = self.events.len() as u64 + 1;
        self.events.push(event);
    }

    /// Replay, record the decision, persist its commands. Returns true once closed.
    fn decide(&mut self, workflow: &dyn Workflow) -> bool {
        let commands = replay(&self.events, workflow).unwrap().commands;
        self.decisions.push((self.events.len(), commands.clone()));

        let mut closed = false;
        for command in commands {
            closed |= command.is_terminal();
            let key = command.idempotency_key(self.run_id);
            self.push(key, command.event_kind());
        }
        closed
    }

    /// Report an outcome for one outstanding attempt, the highest call-site first
    fn report(&mut self, fail_first_attempt_of: Option<u32>) {
        let outstanding = outstanding_attempts(&self.events).unwrap();
        let next = outstanding
            .iter()
            .max_by_key(|a| (a.call_site(), a.attempt()))
            .expect("an attempt should be outstanding");
        let (call_site, attempt) = (next.call_site(), next.attempt());

        self.push(
            keys::started(self.run_id, call_site, attempt),
            EventKind::ActivityStarted {
                call_site,
                attempt,
                worker_id: "sim".to_string(),
            },
        );

        let kind = if fail_first_attempt_of == Some(call_site) && attempt == 1 {
            EventKind::ActivityFailed {
                call_site,
                attempt,
                error_kind: ErrorKind::ApplicationError,
                message: "transient".to_string(),
                retryable: true,
            }
        } else {
            EventKind::ActivityCompleted {
                call_site,
                attempt,
                result: json!(call_site * 10),
            }
        };
        self.push(keys::outcome(self.run_id, call_site, attempt), kind);
    }

    fn run_to_close(&mut self, workflow: &dyn Workflow, fail_first_attempt_of: Option<u32>) {
        for _ in 0..100 {
            if self.decide(workflow) {
                return;
            }
            self.report(fail_first_attempt_of);
        }
        panic!("workflow did not close");
    }

    fn assert_determinism_law(&self, workflow: &dyn Workflow) {
        for (prefix, recorded) in &self.decisions {
            let replayed = replay(&self.events[..*prefix], workflow).unwrap().commands;
            assert_eq!(&replayed, recorded, "prefix of {} events diverged", prefix);

            let following: Vec<EventKind> = self.events[*prefix..*prefix + replayed.len()]
                .iter()
                .map(|e| e.kind.clone())
                .collect();
            let expected: Vec<EventKind> = replayed.iter().map(Command::event_kind).collect();
            assert_eq!(following, expected);
        }

        // A closed history produces no further commands
        assert!(replay(&self.events, workflow).unwrap().commands.is_empty());
    }
}

#[test]
fn test_sequential_bench_replays_deterministically() {
    let input = BenchInput {
        iter: 5,
        fibo_n: 10,
        parallel: false,
    };
    let workflow = BenchWorkflow::default().with_retry_policy(RetryPolicy::immediate(3));
    let mut sim = Simulation::start(&input);
    sim.run_to_close(&workflow, Some(2));

    sim.assert_determinism_law(&workflow);

    let last = sim.events.last().unwrap();
    assert_eq!(
        last.kind,
        EventKind::WorkflowCompleted {
            result: json!({"iterations": 5, "results": [0, 10, 20, 30, 40]})
        }
    );
}

#[test]
fn test_parallel_bench_replays_deterministically() {
    let input = BenchInput {
        iter: 4,
        fibo_n: 10,
        parallel: true,
    };
    let workflow = BenchWorkflow::default();
    let mut sim = Simulation::start(&input);
    sim.run_to_close(&workflow, Some(0));

    sim.assert_determinism_law(&workflow);

    // All four calls were scheduled by the very first decision
    assert_eq!(sim.decisions[0].1.len(), 4);

    // The retry of call-site 0 carries the policy's backoff
    let retry_backoff = sim.events.iter().find_map(|e| match &e.kind {
        EventKind::ActivityScheduled {
            call_site: 0,
            attempt: 2,
            backoff_ms,
            ..
        } => Some(*backoff_ms),
        _ => None,
    });
    assert_eq!(
        retry_backoff,
        Some(RetryPolicy::default().delay_for_attempt(1).as_millis() as u64)
    );
}

#[test]
fn test_replay_is_repeatable() {
    let input = BenchInput {
        iter: 3,
        fibo_n: 10,
        parallel: false,
    };
    let workflow = BenchWorkflow::default();
    let mut sim = Simulation::start(&input);
    sim.decide(&workflow);
    sim.report(None);

    let first = replay(&sim.events, &workflow).unwrap();
    let second = replay(&sim.events, &workflow).unwrap();
    assert_eq!(first.commands, second.commands);
    assert_eq!(first.state, second.state);
    assert_eq!(first.state.completed_calls, 1);
    assert_eq!(first.state.cursor, 2);
}
