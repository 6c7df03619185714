//! Acceptor: listens from the main event loop and hands accepted
//! connections to worker loops in round-robin order.

use crate::channel::Channel;
use crate::conn::HttpConn;
use crate::event_loop::EventLoop;
use crate::loop_threads::EventLoopThreadPool;
use crate::poller::{EPOLLET, EPOLLIN};
use crate::util;
use log::{error, info, warn};
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// Global descriptor ceiling; connections at or above it are refused
/// outright so the registries stay bounded.
pub const MAX_FDS: RawFd = 100_000;

pub struct Server {
    event_loop: Rc<EventLoop>,
    pool: RefCell<EventLoopThreadPool>,
    started: Cell<bool>,
    accept_channel: Rc<Channel>,
    listen_fd: RawFd,
    port: u16,
    self_weak: Weak<Server>,
}

impl Server {
    /// Bind the listening socket and prepare the worker pool. The broken-
    /// pipe signal is ignored process-wide here so writes to half-closed
    /// peers fail with an error return instead of killing the process.
    pub fn new(event_loop: &Rc<EventLoop>, threads: usize, port: u16) -> io::Result<Rc<Server>> {
        let listen_fd = util::socket_bind_listen(port)?;
        util::ignore_sigpipe();
        if let Err(err) = util::set_nonblocking(listen_fd) {
            unsafe { libc::close(listen_fd) };
            return Err(err);
        }
        Ok(Rc::new_cyclic(|weak: &Weak<Server>| Server {
            event_loop: Rc::clone(event_loop),
            pool: RefCell::new(EventLoopThreadPool::new(event_loop.handle(), threads)),
            started: Cell::new(false),
            accept_channel: Rc::new(Channel::new(listen_fd)),
            listen_fd,
            port,
            self_weak: weak.clone(),
        }))
    }

    /// Start the workers and register the accept channel, edge-triggered,
    /// on the main loop.
    pub fn start(&self) {
        self.pool.borrow_mut().start();
        self.accept_channel.set_events(EPOLLIN | EPOLLET);
        let w = self.self_weak.clone();
        self.accept_channel.set_read_handler(Box::new(move || {
            if let Some(server) = w.upgrade() {
                server.handle_new_conn();
            }
        }));
        let w = self.self_weak.clone();
        self.accept_channel.set_conn_handler(Box::new(move || {
            if let Some(server) = w.upgrade() {
                server
                    .event_loop
                    .update_poller(&server.accept_channel, 0);
            }
        }));
        self.event_loop.add_to_poller(&self.accept_channel, 0);
        self.started.set(true);
        info!("listening on port {}", self.port);
    }

    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    /// Drain the accept queue. Each accepted descriptor is made
    /// non-blocking with the write-delay heuristic off, then a registration
    /// task is queued on the next worker loop; the connection object is
    /// built over there so it never leaves its owning thread.
    fn handle_new_conn(&self) {
        loop {
            match util::accept_conn(self.listen_fd) {
                Ok(Some((fd, peer))) => {
                    if fd >= MAX_FDS {
                        warn!("refusing connection from {peer}: descriptor ceiling reached");
                        unsafe { libc::close(fd) };
                        continue;
                    }
                    if let Err(err) = util::set_nonblocking(fd) {
                        error!("failed to set fd {fd} non-blocking: {err}");
                        unsafe { libc::close(fd) };
                        return;
                    }
                    util::set_nodelay(fd);
                    info!("new connection from {peer}");
                    let worker = self.pool.borrow().get_next_loop();
                    worker.queue_in_loop(Box::new(move || {
                        let event_loop = EventLoop::current()
                            .expect("connection registration outside a loop thread");
                        let conn = HttpConn::new(&event_loop, fd);
                        conn.new_event();
                    }));
                }
                Ok(None) => break, // accept queue drained
                Err(err) => {
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }
        self.accept_channel.set_events(EPOLLIN | EPOLLET);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        unsafe { libc::close(self.listen_fd) };
    }
}
