//! Edge-triggered readiness multiplexer over epoll(7).
//!
//! The kernel hands back only descriptor + mask, so the poller keeps a
//! descriptor-to-channel registry to resolve readiness events to handlers.
//! The registry holds strong references: a channel whose connection drops
//! its last reference mid-iteration still outlives the dispatch that is
//! about to run its handlers. The poller also owns the timer heap, because
//! registering a descriptor with a timeout is what arms its eviction timer.

use crate::channel::Channel;
use crate::conn::HttpConn;
use crate::timer::TimerManager;
use log::{error, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLPRI: u32 = libc::EPOLLPRI as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Upper bound on events returned by a single wait.
const EVENTS_NUM: usize = 4096;
/// Bound on a single epoll_wait call, in milliseconds.
const EPOLL_WAIT_MS: libc::c_int = 10_000;

pub struct Epoll {
    epoll_fd: RawFd,
    events: RefCell<Vec<libc::epoll_event>>,
    registry: RefCell<HashMap<RawFd, Rc<Channel>>>,
    // Strong connection references for descriptors registered with a
    // timeout. Keeps the connection reachable between the tombstoning of
    // its old timer and the arming of the next one.
    connections: RefCell<HashMap<RawFd, Rc<HttpConn>>>,
    timers: RefCell<TimerManager>,
}

impl Default for Epoll {
    fn default() -> Self {
        Self::new()
    }
}

impl Epoll {
    pub fn new() -> Self {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(
            epoll_fd >= 0,
            "failed to create epoll instance: {}",
            io::Error::last_os_error()
        );
        Self {
            epoll_fd,
            events: RefCell::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                EVENTS_NUM
            ]),
            registry: RefCell::new(HashMap::new()),
            connections: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerManager::new()),
        }
    }

    /// Register a channel. A non-zero timeout arms an eviction timer on the
    /// channel's owning connection.
    pub fn epoll_add(&self, channel: &Rc<Channel>, timeout_ms: i64) {
        let fd = channel.fd();
        if timeout_ms > 0 {
            self.add_timer(channel, timeout_ms);
            if let Some(conn) = channel.holder() {
                self.connections.borrow_mut().insert(fd, conn);
            }
        }
        channel.equal_and_update_last_events();
        self.registry.borrow_mut().insert(fd, Rc::clone(channel));
        if let Err(err) = self.ctl(libc::EPOLL_CTL_ADD, fd, channel.events()) {
            error!("epoll add failed for fd {fd}: {err}");
            self.registry.borrow_mut().remove(&fd);
        }
    }

    /// Update a channel's kernel registration. The kernel update is skipped
    /// when the interest mask matches what was last registered; the timer is
    /// re-armed either way.
    pub fn epoll_mod(&self, channel: &Rc<Channel>, timeout_ms: i64) {
        if timeout_ms > 0 {
            self.add_timer(channel, timeout_ms);
        }
        let fd = channel.fd();
        if !channel.equal_and_update_last_events() {
            if let Err(err) = self.ctl(libc::EPOLL_CTL_MOD, fd, channel.events()) {
                error!("epoll mod failed for fd {fd}: {err}");
                self.registry.borrow_mut().remove(&fd);
            }
        }
    }

    /// Drop a channel from the kernel and from both registries. The
    /// descriptor itself is closed by whoever owns it.
    pub fn epoll_del(&self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        if let Err(err) = self.ctl(libc::EPOLL_CTL_DEL, fd, channel.last_events()) {
            warn!("epoll del failed for fd {fd}: {err}");
        }
        self.registry.borrow_mut().remove(&fd);
        self.connections.borrow_mut().remove(&fd);
    }

    /// Block for readiness, up to `EPOLL_WAIT_MS` per wait, repolling until
    /// at least one registered channel is ready. Returned channels carry
    /// their readiness mask in `revents`.
    pub fn poll(&self) -> Vec<Rc<Channel>> {
        let mut events = self.events.borrow_mut();
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    EPOLL_WAIT_MS,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    error!("epoll wait failed: {err}");
                }
                continue;
            }
            let mut ready = Vec::with_capacity(n as usize);
            let registry = self.registry.borrow();
            for i in 0..n as usize {
                let ev = events[i];
                let fd = ev.u64 as RawFd;
                if let Some(channel) = registry.get(&fd) {
                    channel.set_revents(ev.events);
                    ready.push(Rc::clone(channel));
                } else {
                    warn!("readiness for unregistered fd {fd}");
                }
            }
            if !ready.is_empty() {
                return ready;
            }
        }
    }

    /// Reap tombstoned and expired eviction timers.
    pub fn handle_expired(&self) {
        self.timers.borrow_mut().handle_expired();
    }

    pub fn registered_count(&self) -> usize {
        self.registry.borrow().len()
    }

    fn add_timer(&self, channel: &Rc<Channel>, timeout_ms: i64) {
        match channel.holder() {
            Some(conn) => self.timers.borrow_mut().add_timer(&conn, timeout_ms),
            None => warn!(
                "timer add failed: channel for fd {} has no holder",
                channel.fd()
            ),
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}
