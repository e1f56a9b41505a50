/*
 * Task driver scenarios: nested synchronous runs, timer ordering, yield
 * fairness and stack isolation, each driven through a full scheduler
 * loop.
 *
 * Panics inside a task are caught at the coroutine boundary and do not
 * fail the test process, so every scenario records its observations in
 * shared cells and the asserts run after the loop has exited.
 */

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use eddy::TaskId;
use eddy::scheduler;

fn setup() {
    eddy::logger::init(log::LevelFilter::Warn);
    scheduler::init().unwrap();
}

#[test]
fn test_nested_run_chain() {
    setup();
    let checker = Rc::new(Cell::new(0));
    let ordered = Rc::new(Cell::new(true));

    let c1 = checker.clone();
    let ok1 = ordered.clone();
    scheduler::spawn(move || {
        if c1.get() != 0 {
            ok1.set(false);
        }
        c1.set(1);
        let c2 = c1.clone();
        let ok2 = ok1.clone();
        scheduler::run(move || {
            if c2.get() != 1 {
                ok2.set(false);
            }
            c2.set(2);
            let c3 = c2.clone();
            scheduler::run(move || {
                c3.set(3);
                scheduler::stop();
            });
            if c2.get() != 3 {
                ok2.set(false);
            }
        });
        if c1.get() != 3 {
            ok1.set(false);
        }
    });

    scheduler::run_loop();
    assert_eq!(checker.get(), 3);
    assert!(ordered.get(), "nested tasks ran out of order");
    assert_eq!(scheduler::pending_tasks(), 0);
    scheduler::shutdown();
}

#[test]
fn test_timer_pair_order_and_spacing() {
    setup();
    let order = Rc::new(RefCell::new(Vec::new()));
    let stamps = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    let s = stamps.clone();
    scheduler::spawn(move || {
        scheduler::sleep_ms(30);
        o.borrow_mut().push('a');
        s.borrow_mut().push(Instant::now());
        scheduler::stop();
    });
    let o = order.clone();
    let s = stamps.clone();
    scheduler::spawn(move || {
        scheduler::sleep_ms(10);
        o.borrow_mut().push('b');
        s.borrow_mut().push(Instant::now());
    });

    scheduler::run_loop();
    assert_eq!(*order.borrow(), vec!['b', 'a']);
    let stamps = stamps.borrow();
    let gap = stamps[1].duration_since(stamps[0]);
    // 30ms - 10ms of target spacing, minus a little timer slack.
    assert!(gap >= Duration::from_millis(15), "resumptions only {:?} apart", gap);
    scheduler::shutdown();
}

#[test]
fn test_yield_fairness() {
    setup();
    const TASKS: usize = 4;
    const ROUNDS: u32 = 25;

    let counts = Rc::new(RefCell::new(vec![0u32; TASKS]));
    let balanced = Rc::new(Cell::new(true));
    let finished = Rc::new(Cell::new(0usize));

    for index in 0..TASKS {
        let counts = counts.clone();
        let balanced = balanced.clone();
        let finished = finished.clone();
        scheduler::spawn(move || {
            for _ in 0..ROUNDS {
                {
                    let mut counts = counts.borrow_mut();
                    counts[index] += 1;
                    let max = *counts.iter().max().unwrap();
                    let min = *counts.iter().min().unwrap();
                    if max - min > 1 {
                        balanced.set(false);
                    }
                }
                scheduler::yield_now();
            }
            finished.set(finished.get() + 1);
            if finished.get() == TASKS {
                scheduler::stop();
            }
        });
    }

    scheduler::run_loop();
    let total: u32 = counts.borrow().iter().sum();
    assert_eq!(total, TASKS as u32 * ROUNDS);
    assert!(balanced.get(), "per-task progress drifted by more than one round");
    scheduler::shutdown();
}

// Each frame holds a seed-filled buffer and yields before summing it, so
// a sibling trampling this task's stack would corrupt the result.
fn deep_sum(depth: u32, seed: u8) -> u64 {
    let frame = [seed; 64];
    scheduler::yield_now();
    let below = if depth == 0 { 0 } else { deep_sum(depth - 1, seed) };
    below + frame.iter().map(|&b| u64::from(b)).sum::<u64>()
}

#[test]
fn test_stack_isolation() {
    setup();
    const DEPTH: u32 = 40;
    let ok = Rc::new(Cell::new(true));
    let finished = Rc::new(Cell::new(0usize));

    for seed in [0xAAu8, 0x55u8] {
        let ok = ok.clone();
        let finished = finished.clone();
        scheduler::spawn(move || {
            let mut local = [seed; 4096];
            for _ in 0..5 {
                scheduler::yield_now();
                if local.iter().any(|&b| b != seed) {
                    ok.set(false);
                }
                local = [seed; 4096];
            }
            let expected = u64::from(seed) * 64 * u64::from(DEPTH + 1);
            if deep_sum(DEPTH, seed) != expected {
                ok.set(false);
            }
            finished.set(finished.get() + 1);
            if finished.get() == 2 {
                scheduler::stop();
            }
        });
    }

    scheduler::run_loop();
    assert!(ok.get(), "a task observed another task's stack data");
    scheduler::shutdown();
}

#[test]
fn test_task_panic_is_contained() {
    setup();
    let after = Rc::new(Cell::new(false));

    scheduler::spawn(|| {
        panic!("task panic, on purpose");
    });
    let after2 = after.clone();
    scheduler::spawn(move || {
        after2.set(true);
        scheduler::stop();
    });

    scheduler::run_loop();
    assert!(after.get(), "the scheduler must outlive a panicking task");
    assert_eq!(scheduler::pending_tasks(), 0);
    scheduler::shutdown();
}

#[test]
fn test_main_context_guards() {
    setup();
    assert_eq!(scheduler::current_task(), TaskId::MAIN);
    assert!(scheduler::init().is_err(), "double init must fail");

    // Outside of a task these are ignored, not fatal.
    scheduler::sleep_ms(0);
    scheduler::yield_now();
    assert_eq!(scheduler::pending_tasks(), 0);

    scheduler::shutdown();
    // A fresh scheduler can be installed after shutdown.
    scheduler::init().unwrap();
    scheduler::shutdown();
}

#[test]
fn test_shutdown_frees_sleeping_tasks() {
    setup();
    let started = Rc::new(Cell::new(false));

    let s = started.clone();
    scheduler::spawn(move || {
        s.set(true);
        scheduler::sleep_ms(10_000);
    });
    let stopper = scheduler::spawn(scheduler::stop);
    assert_ne!(stopper, TaskId::MAIN);

    scheduler::run_loop();
    // The sleeper is still parked in the timer tree; shutdown frees it.
    assert_eq!(scheduler::pending_tasks(), 1);
    scheduler::shutdown();
    assert!(started.get());
}
