/*
 * Cooperative Scheduler
 *
 * One scheduler per thread, installed in a thread-local slot and reached
 * through accessor helpers. Tasks are stackful coroutines; at most one
 * runs at a time and nothing preempts it. A task gives up the CPU in
 * exactly three ways: sleeping on the timer tree (`sleep_ms` /
 * `yield_now`), parking on a socket until readiness (net::Socket), or
 * returning from its entry function.
 *
 * Each loop pass refreshes the wall-clock snapshot once, runs every task
 * whose target time has arrived, then waits on the poller for at most the
 * time until the next target. Readiness reports resume the parked task of
 * the affected descriptor.
 *
 * LOCKING RULE:
 * The thread-local borrow is held only for bookkeeping and is always
 * released before the actual context switch. Every switch site gathers
 * raw context pointers under a short borrow, drops it, then switches;
 * the boxes holding the contexts are owned by the driver, so the
 * pointers stay valid while a task is suspended.
 */

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};

use crate::clock::Timeval;
use crate::poller::{EpollPoller, PollMode, Poller, ReadyEvent};

pub(crate) mod context;
pub(crate) mod fd_table;
pub(crate) mod task;

pub use task::{DEFAULT_TIMEOUT_MS, TASK_STACK_SIZE, TaskId};

use fd_table::FdTable;
use task::{DriverStep, TaskDriver};

thread_local! {
    static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

pub(crate) struct Scheduler {
    /// Wall-clock snapshot, refreshed once per loop pass.
    pub clock: Timeval,
    pub stop: bool,
    pub driver: TaskDriver,
    pub poller: Box<dyn Poller>,
    pub fd_table: FdTable,
}

/// Run a closure against this thread's scheduler.
///
/// Panics when no scheduler is initialized; every public operation
/// requires a prior `init()`. The closure must not switch contexts (see
/// the locking rule above).
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHEDULER.with(|cell| {
        let mut slot = cell.borrow_mut();
        let sched = slot
            .as_mut()
            .expect("scheduler not initialized on this thread");
        f(sched)
    })
}

/// Like `with_scheduler`, but a missing scheduler (or a destroyed
/// thread-local during teardown) yields None instead of panicking.
/// Used by socket drops that may outlive the scheduler.
pub(crate) fn try_with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    SCHEDULER
        .try_with(|cell| {
            cell.try_borrow_mut()
                .ok()
                .and_then(|mut slot| slot.as_mut().map(f))
        })
        .ok()
        .flatten()
}

/// Create this thread's scheduler: empty task driver, epoll poller and
/// descriptor table. Fails if one already exists or the poller cannot be
/// created.
pub fn init() -> io::Result<()> {
    SCHEDULER.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "scheduler already initialized on this thread",
            ));
        }
        let poller = EpollPoller::new()?;
        *slot = Some(Scheduler {
            clock: Timeval::now(),
            stop: false,
            driver: TaskDriver::new(),
            poller: Box::new(poller),
            fd_table: FdTable::new(),
        });
        log::info!("scheduler initialized");
        Ok(())
    })
}

/// Tear down this thread's scheduler. Tasks still alive are freed
/// without being resumed; the poller and its descriptor registrations go
/// with it. Must be called from outside any task, after the loop exited.
pub fn shutdown() {
    // Take the scheduler out first and drop it with the thread-local
    // borrow released: freeing leftover tasks drops their entry closures,
    // which may own sockets whose Drop re-enters the scheduler slot.
    let sched = SCHEDULER.with(|cell| {
        let mut slot = cell.borrow_mut();
        let inside_task = slot
            .as_ref()
            .is_some_and(|sched| sched.driver.current != TaskId::MAIN);
        if inside_task {
            log::warn!("shutdown called from inside a task; ignoring");
            return None;
        }
        slot.take()
    });
    if let Some(sched) = sched {
        let tasks = sched.driver.task_count();
        let descriptors = sched.fd_table.count();
        if tasks > 0 || descriptors > 0 {
            log::debug!(
                "shutting down with {} task(s) and {} descriptor(s) still alive",
                tasks,
                descriptors
            );
        }
        drop(sched);
        log::info!("scheduler shut down");
    }
}

/// Id of the running task; MAIN outside of any coroutine.
pub fn current_task() -> TaskId {
    with_scheduler(|sched| sched.driver.current)
}

/// Wall-clock snapshot of the current loop pass.
pub fn clock() -> Timeval {
    with_scheduler(|sched| sched.clock)
}

/// Number of tasks waiting in the timer tree.
pub fn pending_tasks() -> usize {
    with_scheduler(|sched| sched.driver.pending())
}

/// Queue a task for execution on the next driver pass and return its id.
/// The task is parented to the main context.
pub fn spawn(entry: impl FnOnce() + 'static) -> TaskId {
    with_scheduler(|sched| {
        let tid = sched.driver.create(TaskId::MAIN, Box::new(entry));
        sched.driver.schedule(tid, None);
        tid
    })
}

/// Run a task synchronously within the current task. Returns true when
/// the child ran to completion before its first suspension; false when it
/// suspended and will be resumed by a timer or readiness event later.
pub fn run(entry: impl FnOnce() + 'static) -> bool {
    let tid = with_scheduler(|sched| {
        let parent = sched.driver.current;
        sched.driver.create(parent, Box::new(entry))
    });
    resume_task(tid)
}

/// Put the current task to sleep. `ms == 0` reschedules it for the next
/// driver pass, behind everything already due (a plain yield). The task
/// is never resumed before the clock reaches the target.
pub fn sleep_ms(ms: u32) {
    let scheduled = with_scheduler(|sched| {
        let current = sched.driver.current;
        if current == TaskId::MAIN {
            log::warn!("sleep_ms called outside of a task; ignoring");
            return false;
        }
        let when = if ms == 0 {
            None
        } else {
            Some(sched.clock.add_ms(ms))
        };
        sched.driver.schedule(current, when);
        true
    });
    if scheduled {
        release();
    }
}

/// Give other due tasks a chance to run.
pub fn yield_now() {
    sleep_ms(0);
}

/// Request loop exit. The loop finishes its current pass; the calling
/// task keeps running until it suspends or returns.
pub fn stop() {
    with_scheduler(|sched| sched.stop = true);
    log::debug!("scheduler stop requested");
}

/// Drive the scheduler until `stop()` is called: refresh the clock, run
/// due tasks, wait for readiness up to the time of the next target, and
/// dispatch events to parked tasks.
pub fn run_loop() {
    let in_task = with_scheduler(|sched| sched.driver.current != TaskId::MAIN);
    if in_task {
        log::warn!("run_loop called from inside a task; ignoring");
        return;
    }
    log::debug!("entering scheduler loop");
    loop {
        let stopped = with_scheduler(|sched| {
            sched.clock = Timeval::now();
            sched.stop
        });
        if stopped {
            break;
        }
        let timeout_ms = advance();
        if with_scheduler(|sched| sched.stop) {
            break;
        }
        poll_once(timeout_ms);
    }
    log::debug!("scheduler loop exited");
}

/// Run every task whose target time has arrived, in timer order, then
/// return the time until the next target in milliseconds (or the default
/// timeout when none is scheduled).
pub(crate) fn advance() -> u32 {
    loop {
        let step = with_scheduler(|sched| sched.driver.step(sched.clock));
        match step {
            DriverStep::Run(tid) => {
                resume_task(tid);
            }
            DriverStep::Idle(ms) => return ms,
        }
    }
}

/// Switch to a task and account for the way control came back. Returns
/// true when the switch reported a termination (the finished task is
/// destroyed here). Returns false for a suspension, or when the task id
/// is stale.
pub(crate) fn resume_task(tid: TaskId) -> bool {
    let Some((from, to, prev)) = with_scheduler(|sched| {
        let prev = sched.driver.current;
        let to = sched.driver.context_ptr(tid)?;
        let from = sched.driver.context_ptr(prev)?;
        sched.driver.current = tid;
        Some((from, to, prev))
    }) else {
        log::warn!("resume of unknown {}", tid);
        return false;
    };

    // Safety: both contexts live in driver-owned boxes and the
    // thread-local borrow has been released (locking rule in the module
    // header).
    let ret = unsafe { context::switch(from, to) };

    with_scheduler(|sched| {
        sched.driver.current = prev;
        if ret == 0 {
            // A task finished and terminated into our context; it
            // recorded itself before switching.
            if let Some(done) = sched.driver.finished.take() {
                sched.driver.destroy(done);
                return true;
            }
        }
        false
    })
}

/// Switch from the current task back to the main context without
/// scheduling it anywhere. The task is parked; a timer node or a socket
/// readiness event must bring it back.
pub(crate) fn release() {
    let ctxs = with_scheduler(|sched| {
        let current = sched.driver.current;
        if current == TaskId::MAIN {
            return None;
        }
        let from = sched.driver.context_ptr(current)?;
        Some((from, sched.driver.main_context_ptr() as *const context::Context))
    });
    let Some((from, to)) = ctxs else {
        log::warn!("release called outside of a task; ignoring");
        return;
    };
    // Safety: as in resume_task; the main context box outlives the task.
    unsafe {
        context::switch(from, to);
    }
}

/// One poller pass plus event dispatch.
fn poll_once(timeout_ms: u32) {
    let events: Vec<ReadyEvent> =
        with_scheduler(|sched| sched.poller.wait(timeout_ms).to_vec());
    for event in events {
        dispatch_event(event);
    }
}

/// Deliver one readiness report. Each resumption may close the socket or
/// park a new task, so the descriptor is looked up again before every
/// step; a descriptor that vanished mid-event is simply skipped.
fn dispatch_event(event: ReadyEvent) {
    if event.flags.contains(PollMode::IN) {
        resume_ready(event.fd, None);
    }
    if event.flags.contains(PollMode::OUT) {
        resume_ready(event.fd, None);
    }
    if event.flags.intersects(PollMode::ERR | PollMode::HUP) {
        resume_ready(event.fd, Some(libc::ECONNRESET));
    }
}

/// Resume the task parked on `fd`, if any, handing it `error` (None
/// clears the pending error slot). Cancels the task's I/O timeout so a
/// racing timer cannot produce a second wake-up.
fn resume_ready(fd: RawFd, error: Option<i32>) {
    let parked = with_scheduler(|sched| {
        let state = sched.fd_table.get_mut(fd)?;
        let tid = state.parked.take()?;
        state.pending_error = error;
        sched.driver.unschedule(tid);
        Some(tid)
    });
    if let Some(tid) = parked {
        resume_task(tid);
    }
}

/// First frame of every task. Runs the entry closure, records the task
/// as finished and terminates into the link context. A panicking entry
/// is caught here: errors never unwind across the coroutine boundary.
extern "C" fn task_wrapper() -> ! {
    let entry = with_scheduler(|sched| {
        let tid = sched.driver.current;
        sched.driver.task_mut(tid).and_then(|t| t.entry.take())
    });
    if let Some(entry) = entry {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            log::error!("task panicked: {}", message);
        }
    }
    let link = with_scheduler(|sched| {
        let tid = sched.driver.current;
        sched.driver.finished = Some(tid);
        sched
            .driver
            .task(tid)
            .map(|t| t.context.link)
            .unwrap_or(std::ptr::null())
    });
    debug_assert!(!link.is_null());
    // Safety: the link context belongs to the parent (or main) and is
    // suspended in `switch` right now; it outlives this task.
    unsafe { context::terminate(link) }
}
