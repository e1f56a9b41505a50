/*
 * eddy - cooperative I/O scheduler
 *
 * Stackful coroutine tasks multiplexed over a one-shot epoll readiness
 * loop, one scheduler per thread. Tasks yield explicitly: they sleep on
 * the timer tree, park on a socket until the kernel reports readiness,
 * or return. Nothing preempts a running task.
 *
 *   eddy::scheduler::init()?;
 *   eddy::scheduler::spawn(|| {
 *       // open sockets, read, write; the calls look blocking but the
 *       // loop runs other tasks while this one waits
 *       eddy::scheduler::stop();
 *   });
 *   eddy::scheduler::run_loop();
 *   eddy::scheduler::shutdown();
 */

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("eddy supports x86_64 Linux only (epoll + System V x86_64 context switching)");

pub mod clock;
pub mod logger;
pub mod net;
pub mod poller;
pub mod scheduler;

pub use net::Socket;
pub use poller::PollMode;
pub use scheduler::TaskId;
