/*
 * Readiness Poll Abstraction
 *
 * The scheduler talks to the kernel readiness mechanism through the
 * Poller trait; the only backend in tree is epoll (epoll.rs). All
 * registrations are one-shot: a descriptor delivers at most one event
 * per arming and must be re-armed via insert/modify to fire again.
 */

use std::io;
use std::os::fd::RawFd;

use bitflags::bitflags;

pub mod epoll;

pub use epoll::EpollPoller;

bitflags! {
    /// Readiness interest and report set.
    ///
    /// `insert`/`modify` accept IN and OUT; reported events may also
    /// carry ERR and HUP, which the dispatch path turns into a pending
    /// connection-reset error on the socket.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollMode: u32 {
        const IN = 0b0001;
        const OUT = 0b0010;
        const ERR = 0b0100;
        const HUP = 0b1000;
    }
}

/// One readiness report from a poll pass.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub fd: RawFd,
    pub flags: PollMode,
}

/// Backend interface over the kernel readiness notifier.
pub trait Poller {
    /// Register a descriptor with the given interest set, armed one-shot.
    fn insert(&mut self, fd: RawFd, mode: PollMode) -> io::Result<()>;

    /// Replace the interest set of an already-registered descriptor and
    /// re-arm it one-shot.
    fn modify(&mut self, fd: RawFd, mode: PollMode) -> io::Result<()>;

    /// Deregister a descriptor.
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block for up to `timeout_ms` or until at least one descriptor is
    /// ready. A failing kernel wait is not surfaced as an error: the
    /// notifier legitimately returns on interruption, so the backend
    /// records the cause and reports an empty pass.
    fn wait(&mut self, timeout_ms: u32) -> &[ReadyEvent];
}
