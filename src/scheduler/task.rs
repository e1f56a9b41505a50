/*
 * Task Driver
 *
 * Owns every coroutine of one scheduler: the task storage, the implicit
 * main context (id 0, no stack of its own), the currently running task
 * and the timer tree ordering pending resumptions by wall-clock target.
 *
 * A task is in exactly one of three situations:
 *   - running: it is `current` (at most one per scheduler);
 *   - scheduled: its `timer_key` is set and the tree holds that key;
 *   - parked: off the tree, held by a socket waiting for readiness.
 *
 * Tasks and the main context live in boxes so their context addresses
 * stay stable across Vec growth; the switch assembly keeps raw pointers
 * into them while a task is suspended.
 */

use std::collections::BTreeMap;
use std::fmt;

use crate::clock::Timeval;
use crate::scheduler::context::{self, Context};

/// Stack size of every task. The main context runs on the caller's own
/// stack and allocates nothing.
pub const TASK_STACK_SIZE: usize = 64 * 1024;

/// Timeout returned by a driver pass when no task is scheduled.
pub const DEFAULT_TIMEOUT_MS: u32 = 1000;

/// Task identifier. Id 0 is reserved for the main context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub const MAIN: TaskId = TaskId(0);
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task({})", self.0)
    }
}

/// Timer tree key: target instant plus an insertion counter.
///
/// The counter breaks ties, so two tasks scheduled for the same instant
/// resume in insertion order (the original comparator treated equal times
/// as greater, giving the same FIFO behavior).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
    pub when: Timeval,
    pub seq: u64,
}

pub(crate) struct Task {
    pub id: TaskId,
    pub context: Context,
    /// Owns the coroutine stack; the context frames live inside it.
    _stack: Box<[u8]>,
    /// Entry closure, taken by the wrapper on first resumption.
    pub entry: Option<Box<dyn FnOnce()>>,
    /// Present exactly while the task sits in the timer tree.
    pub timer_key: Option<TimerKey>,
}

/// Outcome of one driver pass step.
pub(crate) enum DriverStep {
    /// A task reached its target time: run it.
    Run(TaskId),
    /// Nothing is due; this many milliseconds until the next target (or
    /// the default timeout when the tree is empty).
    Idle(u32),
}

pub(crate) struct TaskDriver {
    tasks: Vec<Box<Task>>,
    tree: BTreeMap<TimerKey, TaskId>,
    main_context: Box<Context>,
    /// The running task; MAIN outside of any coroutine.
    pub current: TaskId,
    /// Set by the task wrapper right before terminating, so the resumer
    /// frees the task that actually finished.
    pub finished: Option<TaskId>,
    next_id: u64,
    next_seq: u64,
}

impl TaskDriver {
    pub fn new() -> TaskDriver {
        TaskDriver {
            tasks: Vec::new(),
            tree: BTreeMap::new(),
            main_context: Box::new(Context::new()),
            current: TaskId::MAIN,
            finished: None,
            next_id: 1,
            next_seq: 0,
        }
    }

    pub fn task(&self, tid: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == tid).map(|t| &**t)
    }

    pub fn task_mut(&mut self, tid: TaskId) -> Option<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == tid)
            .map(|t| &mut **t)
    }

    pub fn main_context_ptr(&mut self) -> *mut Context {
        &mut *self.main_context
    }

    /// Raw pointer to a context, valid while the owning box lives.
    pub fn context_ptr(&mut self, tid: TaskId) -> Option<*mut Context> {
        if tid == TaskId::MAIN {
            return Some(self.main_context_ptr());
        }
        self.task_mut(tid).map(|t| &mut t.context as *mut Context)
    }

    /// Allocate a task with its own stack, linked to `parent`: when the
    /// entry returns, control terminates into the parent's context. The
    /// new task is neither scheduled nor running.
    pub fn create(&mut self, parent: TaskId, entry: Box<dyn FnOnce()>) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        let link = self
            .context_ptr(parent)
            .unwrap_or(self.main_context_ptr()) as *const Context;

        let stack = vec![0u8; TASK_STACK_SIZE].into_boxed_slice();
        let mut task = Box::new(Task {
            id,
            context: Context::new(),
            _stack: stack,
            entry: Some(entry),
            timer_key: None,
        });
        context::bootstrap(&mut task.context, &mut task._stack, super::task_wrapper);
        task.context.link = link;
        self.tasks.push(task);

        log::debug!("{} created (parent {})", id, parent);
        id
    }

    /// Put a task in the timer tree for the given instant; `None` means
    /// the zero instant, which runs on the next driver pass. An already
    /// scheduled task is moved, not duplicated.
    pub fn schedule(&mut self, tid: TaskId, when: Option<Timeval>) {
        let old = self.task_mut(tid).map(|t| t.timer_key.take());
        let Some(old) = old else {
            log::warn!("schedule on unknown {}", tid);
            return;
        };
        if let Some(key) = old {
            self.tree.remove(&key);
        }
        self.next_seq += 1;
        let key = TimerKey {
            when: when.unwrap_or(Timeval::ZERO),
            seq: self.next_seq,
        };
        self.tree.insert(key, tid);
        if let Some(task) = self.task_mut(tid) {
            task.timer_key = Some(key);
        }
    }

    /// Remove a task from the timer tree. Idempotent.
    pub fn unschedule(&mut self, tid: TaskId) {
        let key = self.task_mut(tid).and_then(|t| t.timer_key.take());
        if let Some(key) = key {
            self.tree.remove(&key);
        }
    }

    /// Number of tasks sitting in the timer tree.
    pub fn pending(&self) -> usize {
        self.tree.len()
    }

    /// Number of live tasks, scheduled or not.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// One scheduling decision against the given clock snapshot: either
    /// the next due task (popped and unscheduled) or the idle timeout.
    pub fn step(&mut self, clock: Timeval) -> DriverStep {
        match self.tree.first_key_value() {
            None => DriverStep::Idle(DEFAULT_TIMEOUT_MS),
            Some((&key, &tid)) => {
                if key.when <= clock {
                    self.unschedule(tid);
                    DriverStep::Run(tid)
                } else {
                    DriverStep::Idle(key.when.delta_ms(clock))
                }
            }
        }
    }

    /// Free a finished task: drop its stack and any timer node. The
    /// caller must ensure the task is not currently running.
    pub fn destroy(&mut self, tid: TaskId) {
        self.unschedule(tid);
        if let Some(index) = self.tasks.iter().position(|t| t.id == tid) {
            self.tasks.swap_remove(index);
            log::debug!("{} destroyed", tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_with_two_tasks() -> (TaskDriver, TaskId, TaskId) {
        let mut driver = TaskDriver::new();
        let a = driver.create(TaskId::MAIN, Box::new(|| {}));
        let b = driver.create(TaskId::MAIN, Box::new(|| {}));
        (driver, a, b)
    }

    #[test]
    fn test_equal_times_pop_in_insertion_order() {
        let (mut driver, a, b) = driver_with_two_tasks();
        let when = Timeval { sec: 100, usec: 0 };
        driver.schedule(a, Some(when));
        driver.schedule(b, Some(when));

        let clock = Timeval { sec: 100, usec: 1 };
        match driver.step(clock) {
            DriverStep::Run(tid) => assert_eq!(tid, a),
            DriverStep::Idle(_) => panic!("expected a due task"),
        }
        match driver.step(clock) {
            DriverStep::Run(tid) => assert_eq!(tid, b),
            DriverStep::Idle(_) => panic!("expected a due task"),
        }
        match driver.step(clock) {
            DriverStep::Idle(ms) => assert_eq!(ms, DEFAULT_TIMEOUT_MS),
            DriverStep::Run(_) => panic!("tree should be empty"),
        }
    }

    #[test]
    fn test_earlier_target_runs_first() {
        let (mut driver, a, b) = driver_with_two_tasks();
        driver.schedule(a, Some(Timeval { sec: 100, usec: 30_000 }));
        driver.schedule(b, Some(Timeval { sec: 100, usec: 10_000 }));

        let clock = Timeval { sec: 101, usec: 0 };
        match driver.step(clock) {
            DriverStep::Run(tid) => assert_eq!(tid, b),
            DriverStep::Idle(_) => panic!("expected a due task"),
        }
    }

    #[test]
    fn test_future_target_reports_delta() {
        let (mut driver, a, _) = driver_with_two_tasks();
        let clock = Timeval { sec: 100, usec: 0 };
        driver.schedule(a, Some(clock.add_ms(250)));
        match driver.step(clock) {
            DriverStep::Idle(ms) => assert_eq!(ms, 250),
            DriverStep::Run(_) => panic!("nothing is due yet"),
        }
    }

    #[test]
    fn test_reschedule_moves_the_node() {
        let (mut driver, a, _) = driver_with_two_tasks();
        driver.schedule(a, Some(Timeval { sec: 50, usec: 0 }));
        driver.schedule(a, Some(Timeval { sec: 60, usec: 0 }));
        assert_eq!(driver.pending(), 1);

        driver.unschedule(a);
        assert_eq!(driver.pending(), 0);
        assert!(driver.task(a).unwrap().timer_key.is_none());
        // Unschedule is idempotent.
        driver.unschedule(a);
    }

    #[test]
    fn test_zero_instant_is_always_due() {
        let (mut driver, a, _) = driver_with_two_tasks();
        driver.schedule(a, None);
        match driver.step(Timeval::now()) {
            DriverStep::Run(tid) => assert_eq!(tid, a),
            DriverStep::Idle(_) => panic!("zero-instant task must be due"),
        }
    }

    #[test]
    fn test_destroy_clears_timer_node() {
        let (mut driver, a, b) = driver_with_two_tasks();
        driver.schedule(a, None);
        driver.schedule(b, None);
        driver.destroy(a);
        assert_eq!(driver.pending(), 1);
        assert_eq!(driver.task_count(), 1);
        assert!(driver.task(a).is_none());
        assert!(driver.task(b).is_some());
    }
}
