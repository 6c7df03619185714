//! Single-threaded event dispatch loop with a cross-thread task queue.
//!
//! One `EventLoop` per thread. The loop body is: poll readiness, fire the
//! handlers of every ready channel, drain queued tasks, reap expired timers.
//! Other threads talk to a loop only through its [`LoopHandle`], which
//! appends to the mutex-guarded task queue and signals an eventfd wakeup
//! descriptor registered with the poller like any other channel.

use crate::channel::Channel;
use crate::poller::{Epoll, EPOLLET, EPOLLIN};
use crate::util;
use log::warn;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    // One-loop-per-thread: the loop constructed on this thread, used to
    // short-circuit run_in_loop and to resolve the current loop inside
    // queued tasks.
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

// State shared with other threads: the task queue and the wakeup plumbing.
struct LoopShared {
    wakeup_fd: RawFd,
    owner: ThreadId,
    quit: AtomicBool,
    pending: Mutex<Vec<Task>>,
    // true while the loop executes its drained task batch; a task queued
    // during the drain must signal the wakeup because the queue is not
    // revisited in the same iteration
    handling_pending: AtomicBool,
}

impl LoopShared {
    fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(self.wakeup_fd, &one as *const u64 as *const libc::c_void, 8)
        };
        if n != 8 {
            warn!(
                "wakeup write returned {n} instead of 8: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn queue(&self, task: Task) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.push(task);
        }
        if !self.is_in_loop_thread() || self.handling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }
}

/// Cloneable, `Send` reference to a loop's task queue. This is the only way
/// another thread may touch a loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Append a task; it runs on the loop thread after the current event
    /// batch, in FIFO order.
    pub fn queue_in_loop(&self, task: Task) {
        self.shared.queue(task);
    }

    /// Ask the loop to stop after its current iteration.
    pub fn quit(&self) {
        self.shared.quit();
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }
}

pub struct EventLoop {
    poller: Epoll,
    shared: Arc<LoopShared>,
    looping: Cell<bool>,
    wakeup_channel: Rc<Channel>,
    self_weak: Weak<EventLoop>,
}

impl EventLoop {
    /// Construct the loop owned by the calling thread and register its
    /// wakeup descriptor. The first loop constructed on a thread becomes
    /// that thread's current loop.
    pub fn new() -> Rc<EventLoop> {
        let wakeup_fd = util::create_eventfd();
        let shared = Arc::new(LoopShared {
            wakeup_fd,
            owner: thread::current().id(),
            quit: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            handling_pending: AtomicBool::new(false),
        });
        let event_loop = Rc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Rc::new(Channel::new(wakeup_fd));
            wakeup_channel.set_events(EPOLLIN | EPOLLET);
            let w = weak.clone();
            wakeup_channel.set_read_handler(Box::new(move || {
                if let Some(lp) = w.upgrade() {
                    lp.handle_wakeup_read();
                }
            }));
            let w = weak.clone();
            wakeup_channel.set_conn_handler(Box::new(move || {
                if let Some(lp) = w.upgrade() {
                    lp.update_poller(&lp.wakeup_channel, 0);
                }
            }));
            EventLoop {
                poller: Epoll::new(),
                shared,
                looping: Cell::new(false),
                wakeup_channel,
                self_weak: weak.clone(),
            }
        });
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.upgrade().is_none() {
                *current = Rc::downgrade(&event_loop);
            }
        });
        event_loop.poller.epoll_add(&event_loop.wakeup_channel, 0);
        event_loop
    }

    /// The loop constructed on the calling thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().upgrade())
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop touched from a foreign thread"
        );
    }

    /// Run the dispatch loop until quit is requested. Blocks the calling
    /// thread, which must be the owner.
    pub fn run(&self) {
        assert!(!self.looping.get());
        self.assert_in_loop_thread();
        self.looping.set(true);
        self.shared.quit.store(false, Ordering::Release);
        while !self.shared.quit.load(Ordering::Acquire) {
            let ready = self.poller.poll();
            for channel in &ready {
                channel.handle_events();
            }
            self.do_pending_tasks();
            self.poller.handle_expired();
        }
        self.looping.set(false);
    }

    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Run `task` immediately when called from the loop thread, otherwise
    /// queue it.
    pub fn run_in_loop(&self, task: Task) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    pub fn queue_in_loop(&self, task: Task) {
        self.shared.queue(task);
    }

    pub fn add_to_poller(&self, channel: &Rc<Channel>, timeout_ms: i64) {
        self.poller.epoll_add(channel, timeout_ms);
    }

    pub fn update_poller(&self, channel: &Rc<Channel>, timeout_ms: i64) {
        self.poller.epoll_mod(channel, timeout_ms);
    }

    pub fn remove_from_poller(&self, channel: &Rc<Channel>) {
        self.poller.epoll_del(channel);
    }

    /// Swap the queue out under its lock, then run the batch lock-free.
    /// Tasks queued while the batch runs are deferred to the next
    /// iteration, which bounds the drain and avoids lock recursion.
    fn do_pending_tasks(&self) {
        self.shared.handling_pending.store(true, Ordering::Release);
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
        self.shared.handling_pending.store(false, Ordering::Release);
    }

    fn handle_wakeup_read(&self) {
        let mut counter: u64 = 0;
        let n = unsafe {
            libc::read(
                self.shared.wakeup_fd,
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            warn!(
                "wakeup read returned {n} instead of 8: {}",
                io::Error::last_os_error()
            );
        }
        self.wakeup_channel.set_events(EPOLLIN | EPOLLET);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        unsafe { libc::close(self.shared.wakeup_fd) };
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current.ptr_eq(&self.self_weak) {
                *current = Weak::new();
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_current_loop_is_thread_local() {
        let event_loop = EventLoop::new();
        assert!(event_loop.is_in_loop_thread());
        let current = EventLoop::current().expect("current loop not set");
        assert!(Rc::ptr_eq(&event_loop, &current));

        let handle = event_loop.handle();
        thread::spawn(move || {
            assert!(!handle.is_in_loop_thread());
            assert!(EventLoop::current().is_none());
        })
        .join()
        .unwrap();
    }

    #[test]
    pub fn test_run_in_loop_executes_inline_on_owner() {
        let event_loop = EventLoop::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        event_loop.run_in_loop(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    pub fn test_cross_thread_tasks_run_in_fifo_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std::sync::mpsc::channel();
        let seen2 = Arc::clone(&seen);
        let runner = thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
            seen2.lock().unwrap().push(usize::MAX); // mark loop exit
        });
        let handle = rx.recv().unwrap();
        for i in 0..8 {
            let seen = Arc::clone(&seen);
            handle.queue_in_loop(Box::new(move || {
                seen.lock().unwrap().push(i);
            }));
        }
        // queue the quit behind the tasks so all eight run first
        let quitter = handle.clone();
        handle.queue_in_loop(Box::new(move || quitter.quit()));
        runner.join().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(&seen[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(seen[8], usize::MAX);
    }

    #[test]
    pub fn test_quit_interrupts_idle_poll() {
        let (tx, rx) = std::sync::mpsc::channel();
        let runner = thread::spawn(move || {
            let event_loop = EventLoop::new();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run();
        });
        let handle = rx.recv().unwrap();
        thread::sleep(std::time::Duration::from_millis(50));
        handle.quit();
        runner.join().unwrap();
    }
}
