/*
 * Socket Object
 *
 * Couples one non-blocking descriptor to the scheduler: the read/write/
 * accept/connect primitives look blocking to the calling task but park it
 * on the descriptor and hand control back to the loop until readiness (or
 * a timeout) resumes it.
 *
 * A Socket is a unique handle; it cannot be cloned and its waiting
 * primitives take &mut self, so at most one task can ever be parked on a
 * descriptor. The scheduler-side state (parked task, pending error,
 * armed interest) lives in the descriptor table, keyed by fd.
 */

use std::io;
use std::marker::PhantomData;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::ptr;

use libc::{c_int, c_void};

use crate::poller::PollMode;
use crate::scheduler::fd_table::SocketState;
use crate::scheduler::{self, TaskId};

/// A descriptor owned by the scheduler of the creating thread.
///
/// Dropping the socket deregisters it from the poller, removes it from
/// the descriptor table and closes the descriptor. The handle is bound
/// to the creating thread's scheduler and is neither Send nor Sync.
pub struct Socket {
    fd: RawFd,
    _not_send: PhantomData<*const ()>,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {}", family),
        )),
    }
}

impl Socket {
    /// Create a new kernel socket, make it non-blocking and enter it into
    /// this thread's descriptor table.
    pub fn open(domain: c_int, kind: c_int, protocol: c_int) -> io::Result<Socket> {
        let fd = unsafe { libc::socket(domain, kind, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        match Socket::adopt(fd) {
            Ok(socket) => Ok(socket),
            Err(err) => {
                unsafe {
                    libc::close(fd);
                }
                Err(err)
            }
        }
    }

    /// Adopt an existing descriptor (a pipe end, an inherited fd). The
    /// descriptor is made non-blocking and owned by the returned socket.
    /// On error the caller keeps ownership of the descriptor.
    pub fn attach(fd: RawFd) -> io::Result<Socket> {
        Socket::adopt(fd)
    }

    /// A connected socket pair with both ends adopted.
    pub fn pair(domain: c_int, kind: c_int, protocol: c_int) -> io::Result<(Socket, Socket)> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::socketpair(domain, kind, protocol, fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let first = match Socket::adopt(fds[0]) {
            Ok(socket) => socket,
            Err(err) => {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        };
        let second = match Socket::adopt(fds[1]) {
            Ok(socket) => socket,
            Err(err) => {
                // `first` closes fds[0] on drop.
                unsafe {
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        };
        Ok((first, second))
    }

    fn adopt(fd: RawFd) -> io::Result<Socket> {
        set_nonblocking(fd)?;
        scheduler::with_scheduler(|sched| {
            debug_assert!(!sched.fd_table.contains(fd));
            sched.fd_table.insert(SocketState::new(fd));
        });
        log::debug!("descriptor {} attached", fd);
        Ok(Socket {
            fd,
            _not_send: PhantomData,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Set the I/O timeout in milliseconds used by read/write/accept/
    /// connect; 0 (the default) waits forever.
    pub fn set_timeout(&mut self, ms: u32) {
        scheduler::with_scheduler(|sched| {
            if let Some(state) = sched.fd_table.get_mut(self.fd) {
                state.timeout_ms = ms;
            }
        });
    }

    pub fn timeout(&self) -> u32 {
        scheduler::with_scheduler(|sched| {
            sched
                .fd_table
                .get(self.fd)
                .map(|state| state.timeout_ms)
                .unwrap_or(0)
        })
    }

    /// Close the socket now instead of at end of scope.
    pub fn close(self) {}

    /// Park the current task until the descriptor reports one of the
    /// requested readiness modes.
    ///
    /// Arms (or re-arms) the one-shot poller entry, parks the task, puts
    /// it in the timer tree when `timeout_ms` is nonzero, and releases to
    /// the loop. On resumption, exactly one of three things happened:
    /// the timer fired first (`TimedOut`), the poller reported a
    /// transport failure (that error), or the descriptor is ready
    /// (`Ok`). A timer and a readiness event racing on the same task
    /// produce a single resumption: whichever path runs first clears both
    /// the park and the timer node.
    pub fn wait_io(&mut self, mode: PollMode, timeout_ms: u32) -> io::Result<()> {
        scheduler::with_scheduler(|sched| {
            let current = sched.driver.current;
            if current == TaskId::MAIN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket wait outside of a task",
                ));
            }
            let Some(state) = sched.fd_table.get_mut(self.fd) else {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            };
            debug_assert!(state.parked.is_none(), "one waiter per socket");
            match state.registered {
                None => sched.poller.insert(self.fd, mode)?,
                Some(_) => sched.poller.modify(self.fd, mode)?,
            }
            state.registered = Some(mode);
            state.parked = Some(current);
            if timeout_ms > 0 {
                let when = sched.clock.add_ms(timeout_ms);
                sched.driver.schedule(current, Some(when));
            }
            Ok(())
        })?;

        scheduler::release();

        scheduler::with_scheduler(|sched| {
            let current = sched.driver.current;
            let Some(state) = sched.fd_table.get_mut(self.fd) else {
                // Closed while we were parked.
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            };
            if state.parked == Some(current) {
                // The timer fired; no readiness was ever delivered.
                state.parked = None;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "i/o wait timed out"));
            }
            if let Some(errno) = state.pending_error.take() {
                return Err(io::Error::from_raw_os_error(errno));
            }
            Ok(())
        })
    }

    /// Read into `buf`. If the descriptor would block, waits for IN
    /// readiness (subject to the socket timeout) and retries once.
    /// Returns the short count the kernel handed back; 0 means the peer
    /// is done writing.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match sys_read(self.fd, buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            result => return result,
        }
        let timeout_ms = self.timeout();
        self.wait_io(PollMode::IN, timeout_ms)?;
        sys_read(self.fd, buf)
    }

    /// Write from `buf`, waiting for OUT readiness and retrying once if
    /// the descriptor would block. Returns the short count; callers loop.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match sys_write(self.fd, buf) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            result => return result,
        }
        let timeout_ms = self.timeout();
        self.wait_io(PollMode::OUT, timeout_ms)?;
        sys_write(self.fd, buf)
    }

    pub fn bind(&mut self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        if unsafe { libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&mut self, backlog: c_int) -> io::Result<()> {
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection, waiting on IN readiness of the listener if
    /// none is queued. The new socket is non-blocking and owned by this
    /// thread's scheduler like any other.
    pub fn accept(&mut self) -> io::Result<Socket> {
        match sys_accept(self.fd) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            result => return result,
        }
        let timeout_ms = self.timeout();
        self.wait_io(PollMode::IN, timeout_ms)?;
        sys_accept(self.fd)
    }

    /// Connect to `addr`. A non-blocking connect that reports
    /// "in progress" parks the task on OUT readiness, then the socket
    /// error slot decides the outcome.
    pub fn connect(&mut self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr_from(addr);
        let rc =
            unsafe { libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
        let timeout_ms = self.timeout();
        self.wait_io(PollMode::OUT, timeout_ms)?;

        let mut so_error: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;
        if unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut c_void,
                &mut len,
            )
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        if so_error != 0 {
            return Err(io::Error::from_raw_os_error(so_error));
        }
        Ok(())
    }

    /// Locally bound address, from getsockname.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        } != 0
        {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        scheduler::try_with_scheduler(|sched| {
            if let Some(state) = sched.fd_table.remove(self.fd) {
                if state.registered.is_some() {
                    if let Err(err) = sched.poller.remove(self.fd) {
                        log::warn!("deregistering descriptor {} failed: {}", self.fd, err);
                    }
                }
                if let Some(tid) = state.parked {
                    // Unreachable through the unique handle, but keep the
                    // close contract: the task is detached and will
                    // observe a closed descriptor when resumed.
                    log::warn!("descriptor {} closed with {} parked", self.fd, tid);
                }
            }
        });
        unsafe {
            libc::close(self.fd);
        }
        log::debug!("descriptor {} closed", self.fd);
    }
}

fn sys_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn sys_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn sys_accept(fd: RawFd) -> io::Result<Socket> {
    let accepted = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
    if accepted < 0 {
        return Err(io::Error::last_os_error());
    }
    match Socket::adopt(accepted) {
        Ok(socket) => Ok(socket),
        Err(err) => {
            unsafe {
                libc::close(accepted);
            }
            Err(err)
        }
    }
}
