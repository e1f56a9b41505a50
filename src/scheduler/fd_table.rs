/*
 * Descriptor Table
 *
 * Maps descriptor numbers to per-socket scheduler state. Descriptor
 * numbers are small non-negative integers, so the table is a sparse
 * indexed array with doubling growth rather than a map. A descriptor is
 * present exactly while its socket is open.
 */

use std::os::fd::RawFd;

use crate::poller::PollMode;
use crate::scheduler::task::TaskId;

/// Scheduler-side state of one open socket.
///
/// The user-facing Socket handle is just the descriptor; everything the
/// event loop needs to reach lives here.
pub struct SocketState {
    pub fd: RawFd,
    /// Task suspended on this socket, if any. At most one.
    pub parked: Option<TaskId>,
    /// Raw errno of the last poller-reported failure, consumed by the
    /// next wait return. A single value; no history.
    pub pending_error: Option<i32>,
    /// Interest set currently armed in the poller, None when the
    /// descriptor has never been registered (or was deregistered).
    pub registered: Option<PollMode>,
    /// I/O timeout in milliseconds applied by the blocking primitives;
    /// 0 waits forever.
    pub timeout_ms: u32,
}

impl SocketState {
    pub fn new(fd: RawFd) -> SocketState {
        SocketState {
            fd,
            parked: None,
            pending_error: None,
            registered: None,
            timeout_ms: 0,
        }
    }
}

pub struct FdTable {
    slots: Vec<Option<SocketState>>,
    count: usize,
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable {
            slots: Vec::new(),
            count: 0,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<&SocketState> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut SocketState> {
        if fd < 0 {
            return None;
        }
        self.slots
            .get_mut(fd as usize)
            .and_then(|slot| slot.as_mut())
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.get(fd).is_some()
    }

    /// Number of open descriptors in the table.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Insert state for a descriptor, growing the index by doubling.
    /// Overwrites a stale entry if one is somehow present.
    pub fn insert(&mut self, state: SocketState) {
        let fd = state.fd;
        debug_assert!(fd >= 0);
        let index = fd as usize;
        if index >= self.slots.len() {
            let mut len = self.slots.len().max(8);
            while len <= index {
                len *= 2;
            }
            self.slots.resize_with(len, || None);
        }
        if self.slots[index].replace(state).is_none() {
            self.count += 1;
        } else {
            log::warn!("descriptor {} inserted over a live table entry", fd);
        }
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<SocketState> {
        if fd < 0 {
            return None;
        }
        let state = self.slots.get_mut(fd as usize).and_then(|slot| slot.take());
        if state.is_some() {
            self.count -= 1;
        }
        state
    }
}
