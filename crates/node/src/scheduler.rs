//! Cooperative duty-cycle scheduler.
//!
//! A fixed table of timed tasks, scanned from the top-level loop: each
//! `due` pass fires every armed task whose deadline has elapsed and
//! returns their ids for the caller to dispatch. Single-threaded and
//! non-preemptive — a task "runs" in the caller's match arm, and may
//! re-arm any task (including itself) for the next pass. `rearm` is the
//! one place deadlines are written, so re-arming an already pending task
//! replaces its deadline instead of stacking a second firing.

use std::time::{Duration, Instant};

use tracing::trace;

// ---------------------------------------------------------------------------
// Task identity and repeat policy
// ---------------------------------------------------------------------------

/// The tasks of one duty cycle. The table is fixed at startup; nothing is
/// created dynamically afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskId {
    /// Periodic liveness log.
    Heartbeat,
    /// Drains the broker session and routes inbound commands.
    TransportPump,
    /// Opens a sampling window: probe power-up plus settle delay.
    SampleStart,
    /// Reads the settled probe and acts on the value.
    Measure,
    /// Hard auto-off for the relay; armed on every relay-on.
    RelayCutoff,
    /// Ends the awake window and enters deep sleep.
    DeepSleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Reschedules itself at `fired_at + period` after every firing.
    Forever,
    /// Fires once, then the whole task is disabled until explicitly
    /// re-armed.
    Once,
    /// Fires at most once per arm: stays enabled but waits for another
    /// task to `rearm` it. Used by tasks that only make sense as the
    /// second half of some other task's action.
    UntilRearmed,
}

#[derive(Debug)]
struct Task {
    id: TaskId,
    period: Duration,
    repeat: Repeat,
    next_fire: Instant,
    /// Has a pending deadline. Cleared when a non-`Forever` task fires.
    armed: bool,
    enabled: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct DutyCycleScheduler {
    tasks: Vec<Task>,
}

impl DutyCycleScheduler {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Add a task to the table. `first_fire` of `None` registers the task
    /// unarmed; it will not fire until `rearm` gives it a deadline.
    pub fn register(
        &mut self,
        id: TaskId,
        period: Duration,
        repeat: Repeat,
        first_fire: Option<Instant>,
    ) {
        debug_assert!(
            !self.tasks.iter().any(|t| t.id == id),
            "task registered twice: {id:?}"
        );
        self.tasks.push(Task {
            id,
            period,
            repeat,
            next_fire: first_fire.unwrap_or_else(Instant::now),
            armed: first_fire.is_some(),
            enabled: true,
        });
    }

    /// One scheduler pass: fire every enabled, armed task whose deadline
    /// has elapsed and return their ids. Firing order across tasks is
    /// unspecified; callbacks must not rely on it.
    pub fn due(&mut self, now: Instant) -> Vec<TaskId> {
        let mut fired = Vec::new();
        for task in &mut self.tasks {
            if !task.enabled || !task.armed || task.next_fire > now {
                continue;
            }
            fired.push(task.id);
            match task.repeat {
                Repeat::Forever => task.next_fire = now + task.period,
                Repeat::Once => {
                    task.armed = false;
                    task.enabled = false;
                }
                Repeat::UntilRearmed => task.armed = false,
            }
        }
        fired
    }

    /// The single authoritative re-arm: enables the task and overwrites
    /// any pending deadline. Last write wins — deadlines never stack.
    pub fn rearm(&mut self, id: TaskId, at: Instant) {
        match self.task_mut(id) {
            Some(task) => {
                task.enabled = true;
                task.armed = true;
                task.next_fire = at;
                trace!(?id, "task re-armed");
            }
            None => trace!(?id, "rearm ignored: task not registered"),
        }
    }

    pub fn disable(&mut self, id: TaskId) {
        if let Some(task) = self.task_mut(id) {
            task.enabled = false;
            task.armed = false;
        }
    }

    pub fn is_enabled(&self, id: TaskId) -> bool {
        self.task(id).is_some_and(|t| t.enabled)
    }

    /// Pending deadline of the task, if it is armed to fire.
    pub fn next_fire(&self, id: TaskId) -> Option<Instant> {
        self.task(id)
            .filter(|t| t.enabled && t.armed)
            .map(|t| t.next_fire)
    }

    fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

impl Default for DutyCycleScheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
