//! Idle-eviction timers: a min-heap of expiry nodes with lazy deletion.
//!
//! The heap holds the only strong references to connections that exist
//! between events (besides the poller registry). Popping an expired node
//! drops that reference, and the node's destructor closes the connection.
//! Cancellation never reorganizes the heap: the node is flagged deleted and
//! swept out by a later reap pass. A connection can therefore linger up to
//! one timeout past its nominal expiry, which buys O(1) cancellation.

use crate::conn::HttpConn;
use crate::util;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

pub struct TimerNode {
    expires_at: i64, // absolute, monotonic millis
    deleted: Cell<bool>,
    conn: RefCell<Option<Rc<HttpConn>>>,
}

impl TimerNode {
    fn new(conn: Rc<HttpConn>, timeout_ms: i64) -> Self {
        Self {
            expires_at: util::now_millis() + timeout_ms,
            deleted: Cell::new(false),
            conn: RefCell::new(Some(conn)),
        }
    }

    #[cfg(test)]
    fn with_expiry(expires_at: i64) -> Self {
        Self {
            expires_at,
            deleted: Cell::new(false),
            conn: RefCell::new(None),
        }
    }

    /// Detach the guarded connection and tombstone the node. The next reap
    /// that reaches it pops it without side effects.
    pub fn cancel(&self) {
        self.conn.borrow_mut().take();
        self.deleted.set(true);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.get()
    }

    fn is_expired(&self) -> bool {
        util::now_millis() >= self.expires_at
    }
}

impl Drop for TimerNode {
    fn drop(&mut self) {
        // A live node going away means the guarded connection timed out.
        if let Some(conn) = self.conn.get_mut().take() {
            conn.handle_close();
        }
    }
}

struct TimerEntry(Rc<TimerNode>);

// BinaryHeap is a max-heap; order entries by descending expiry to pop the
// soonest deadline first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.expires_at.cmp(&self.0.expires_at)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.expires_at == other.0.expires_at
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
pub struct TimerManager {
    queue: BinaryHeap<TimerEntry>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Arm a timer guarding `conn` and link the node back into the
    /// connection so it can cancel without touching the heap.
    pub fn add_timer(&mut self, conn: &Rc<HttpConn>, timeout_ms: i64) {
        let node = Rc::new(TimerNode::new(Rc::clone(conn), timeout_ms));
        conn.link_timer(Rc::downgrade(&node));
        self.queue.push(TimerEntry(node));
    }

    /// Sweep the heap top: pop tombstoned and expired nodes, stop at the
    /// first live unexpired one. Dropping an expired node closes its
    /// connection.
    pub fn handle_expired(&mut self) {
        while let Some(top) = self.queue.peek() {
            if top.0.is_deleted() || top.0.is_expired() {
                self.queue.pop();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::event_loop::EventLoop;
    use std::os::unix::io::RawFd;

    #[test]
    pub fn test_entries_pop_in_expiry_order() {
        let mut heap = BinaryHeap::new();
        for at in [50i64, 10, 40, 20, 30] {
            heap.push(TimerEntry(Rc::new(TimerNode::with_expiry(at))));
        }
        let mut order = Vec::new();
        while let Some(e) = heap.pop() {
            order.push(e.0.expires_at);
        }
        assert_eq!(order, vec![10, 20, 30, 40, 50]);
    }

    fn test_socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    pub fn test_expired_node_closes_connection() {
        let event_loop = EventLoop::new();
        let (a, b) = test_socketpair();
        let conn = HttpConn::new(&event_loop, a);
        let mut mgr = TimerManager::new();
        mgr.add_timer(&conn, -1); // already expired
        assert_eq!(mgr.len(), 1);
        mgr.handle_expired();
        assert_eq!(mgr.len(), 0);
        assert!(conn.is_closed());
        unsafe { libc::close(b) };
    }

    #[test]
    pub fn test_cancelled_node_is_swept_without_closing() {
        let event_loop = EventLoop::new();
        let (a, b) = test_socketpair();
        let conn = HttpConn::new(&event_loop, a);
        let mut mgr = TimerManager::new();
        mgr.add_timer(&conn, -1);
        conn.detach_timer();
        mgr.handle_expired();
        assert_eq!(mgr.len(), 0);
        assert!(!conn.is_closed());
        unsafe { libc::close(b) };
    }

    #[test]
    pub fn test_live_timer_survives_reap() {
        let event_loop = EventLoop::new();
        let (a, b) = test_socketpair();
        let conn = HttpConn::new(&event_loop, a);
        let mut mgr = TimerManager::new();
        mgr.add_timer(&conn, 60_000);
        mgr.handle_expired();
        assert_eq!(mgr.len(), 1);
        assert!(!conn.is_closed());
        unsafe { libc::close(b) };
    }

    #[test]
    pub fn test_rearm_tombstones_the_old_node() {
        let event_loop = EventLoop::new();
        let (a, b) = test_socketpair();
        let conn = HttpConn::new(&event_loop, a);
        let mut mgr = TimerManager::new();
        mgr.add_timer(&conn, -1);
        conn.detach_timer();
        mgr.add_timer(&conn, 60_000);
        assert_eq!(mgr.len(), 2);
        // the old, already-expired node is deleted and must not close the
        // connection guarded by the fresh one
        mgr.handle_expired();
        assert_eq!(mgr.len(), 1);
        assert!(!conn.is_closed());
        unsafe { libc::close(b) };
    }
}
