/*
 * Epoll Backend
 *
 * One epoll instance per scheduler. Descriptors are registered with
 * EPOLLONESHOT so a readiness report disarms the entry; the socket layer
 * re-arms through insert/modify before parking again.
 *
 * SIGPIPE handling is set up here because it is part of the readiness
 * contract: the signal is ignored process-wide (installed once, no matter
 * how many schedulers exist) and additionally blocked in the mask passed
 * to epoll_pwait, so a write to a closed peer surfaces as EPIPE instead
 * of killing the process.
 */

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::Once;

use libc::c_int;

use super::{PollMode, Poller, ReadyEvent};

/// Upper bound on readiness reports consumed per wait.
pub const MAX_EVENTS: usize = 128;

static SIGPIPE_IGNORE: Once = Once::new();

/// Process-wide, idempotent SIG_IGN install for SIGPIPE.
fn ignore_sigpipe() {
    SIGPIPE_IGNORE.call_once(|| unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGPIPE, &sa, ptr::null_mut()) != 0 {
            log::warn!(
                "failed to ignore SIGPIPE: {}",
                io::Error::last_os_error()
            );
        }
    });
}

fn interest_bits(mode: PollMode) -> u32 {
    let mut events = 0u32;
    if mode.contains(PollMode::IN) {
        events |= libc::EPOLLIN as u32;
    }
    if mode.contains(PollMode::OUT) {
        events |= libc::EPOLLOUT as u32;
    }
    events | libc::EPOLLONESHOT as u32
}

fn report_flags(events: u32) -> PollMode {
    let mut flags = PollMode::empty();
    if events & libc::EPOLLIN as u32 != 0 {
        flags |= PollMode::IN;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        flags |= PollMode::OUT;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        flags |= PollMode::ERR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        flags |= PollMode::HUP;
    }
    flags
}

/// Epoll-backed readiness notifier.
pub struct EpollPoller {
    epfd: RawFd,
    /// Signal mask applied for the duration of each wait.
    sigmask: libc::sigset_t,
    /// Raw kernel event buffer, reused across passes.
    raw: Vec<libc::epoll_event>,
    /// Decoded events handed to the dispatch loop.
    ready: Vec<ReadyEvent>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut sigmask: libc::sigset_t = unsafe { mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut sigmask);
            libc::sigaddset(&mut sigmask, libc::SIGPIPE);
        }
        ignore_sigpipe();
        log::debug!("epoll instance created (fd {})", epfd);
        Ok(EpollPoller {
            epfd,
            sigmask,
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            ready: Vec::with_capacity(MAX_EVENTS),
        })
    }

    fn ctl(&self, op: c_int, fd: RawFd, mode: Option<PollMode>) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mode.map(interest_bits).unwrap_or(0),
            u64: fd as u64,
        };
        let evp = if mode.is_some() {
            &mut ev as *mut libc::epoll_event
        } else {
            ptr::null_mut()
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, evp) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn insert(&mut self, fd: RawFd, mode: PollMode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(mode))
    }

    fn modify(&mut self, fd: RawFd, mode: PollMode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(mode))
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn wait(&mut self, timeout_ms: u32) -> &[ReadyEvent] {
        self.ready.clear();
        let timeout = timeout_ms.min(c_int::MAX as u32) as c_int;
        let n = unsafe {
            libc::epoll_pwait(
                self.epfd,
                self.raw.as_mut_ptr(),
                MAX_EVENTS as c_int,
                timeout,
                &self.sigmask,
            )
        };
        if n < 0 {
            // An interrupted wait is normal operation; anything else is
            // still swallowed, but recorded so diagnostics can see it.
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                log::debug!("epoll wait interrupted by a signal");
            } else {
                log::warn!("epoll wait failed, treating as an empty pass: {}", err);
            }
            return &self.ready;
        }
        for ev in &self.raw[..n as usize] {
            let events = ev.events;
            let fd = ev.u64 as RawFd;
            self.ready.push(ReadyEvent {
                fd,
                flags: report_flags(events),
            });
        }
        &self.ready
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
        log::debug!("epoll instance closed (fd {})", self.epfd);
    }
}
