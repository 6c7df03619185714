//! Per-descriptor event dispatch record.

use crate::conn::HttpConn;
use crate::poller::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};
use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

pub type Callback = Box<dyn Fn()>;

/// A `Channel` binds one descriptor to an interest mask and a set of event
/// handlers. It never owns the descriptor: the connection (or the reactor,
/// for the wakeup and accept descriptors) closes it.
///
/// The `last_events` mask remembers what was last pushed to the kernel so
/// redundant `epoll_ctl` calls can be skipped, since the state machine tends
/// to re-request the same interest after every handled event.
pub struct Channel {
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    last_events: Cell<u32>,
    // back-reference to the owning connection; the poller promotes this to
    // keep the connection alive while it is registered with a timer.
    holder: RefCell<Weak<HttpConn>>,
    read_handler: RefCell<Option<Callback>>,
    write_handler: RefCell<Option<Callback>>,
    error_handler: RefCell<Option<Callback>>,
    conn_handler: RefCell<Option<Callback>>,
}

impl Channel {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            events: Cell::new(0),
            revents: Cell::new(0),
            last_events: Cell::new(0),
            holder: RefCell::new(Weak::new()),
            read_handler: RefCell::new(None),
            write_handler: RefCell::new(None),
            error_handler: RefCell::new(None),
            conn_handler: RefCell::new(None),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> u32 {
        self.events.get()
    }

    pub fn set_events(&self, events: u32) {
        self.events.set(events);
    }

    /// Add bits to the interest mask.
    pub fn or_events(&self, events: u32) {
        self.events.set(self.events.get() | events);
    }

    pub fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub fn set_holder(&self, holder: Weak<HttpConn>) {
        *self.holder.borrow_mut() = holder;
    }

    pub fn holder(&self) -> Option<Rc<HttpConn>> {
        self.holder.borrow().upgrade()
    }

    pub fn set_read_handler(&self, cb: Callback) {
        *self.read_handler.borrow_mut() = Some(cb);
    }

    pub fn set_write_handler(&self, cb: Callback) {
        *self.write_handler.borrow_mut() = Some(cb);
    }

    pub fn set_error_handler(&self, cb: Callback) {
        *self.error_handler.borrow_mut() = Some(cb);
    }

    pub fn set_conn_handler(&self, cb: Callback) {
        *self.conn_handler.borrow_mut() = Some(cb);
    }

    /// True when the interest mask equals what was last registered with the
    /// kernel; stamps the current mask either way.
    pub fn equal_and_update_last_events(&self) -> bool {
        let equal = self.last_events.get() == self.events.get();
        self.last_events.set(self.events.get());
        equal
    }

    pub fn last_events(&self) -> u32 {
        self.last_events.get()
    }

    /// Dispatch one readiness notification.
    ///
    /// The interest mask is cleared up front, so handlers must re-request
    /// interest; the post-event handler re-registers whatever remains. A
    /// hang-up without pending input short-circuits everything, an error
    /// event fires only the error handler.
    pub fn handle_events(&self) {
        self.events.set(0);
        let revents = self.revents.get();
        if (revents & EPOLLHUP) != 0 && (revents & EPOLLIN) == 0 {
            return;
        }
        if (revents & EPOLLERR) != 0 {
            self.invoke(&self.error_handler);
            return;
        }
        if (revents & (EPOLLIN | EPOLLPRI | EPOLLRDHUP)) != 0 {
            self.invoke(&self.read_handler);
        }
        if (revents & EPOLLOUT) != 0 {
            self.invoke(&self.write_handler);
        }
        self.invoke(&self.conn_handler);
    }

    fn invoke(&self, slot: &RefCell<Option<Callback>>) {
        if let Some(cb) = slot.borrow().as_ref() {
            cb();
        }
    }
}
