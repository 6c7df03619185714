//! Worker reactor threads and the round-robin pool handing them out.

use crate::event_loop::{EventLoop, LoopHandle};
use log::{debug, info};
use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Owns one event loop running on a dedicated thread.
///
/// The loop is constructed on the worker's own stack so the one-loop-per-
/// thread invariant holds; its handle is published back under a mutex and a
/// condition variable, and `start` only returns once the loop exists and is
/// about to run.
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(name: String) -> Self {
        let slot: Arc<(Mutex<Option<LoopHandle>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let published = Arc::clone(&slot);
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                {
                    let (lock, cond) = &*published;
                    *lock.lock().unwrap() = Some(event_loop.handle());
                    cond.notify_one();
                }
                debug!("worker loop running on {name}");
                event_loop.run();
                debug!("worker loop exiting on {name}");
            })
            .expect("failed to spawn event loop thread");

        let (lock, cond) = &*slot;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cond.wait(guard).unwrap();
        }
        let handle = guard.take().unwrap();
        Self {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Fixed set of worker loops handed out round-robin. When the pool is empty
/// the base (acceptor) loop serves connections itself.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    threads: Vec<EventLoopThread>,
    num_threads: usize,
    next: Cell<usize>,
    started: Cell<bool>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, num_threads: usize) -> Self {
        assert!(num_threads > 0, "worker thread count must be positive");
        Self {
            base,
            threads: Vec::new(),
            num_threads,
            next: Cell::new(0),
            started: Cell::new(false),
        }
    }

    pub fn start(&mut self) {
        assert!(self.base.is_in_loop_thread());
        for i in 0..self.num_threads {
            self.threads
                .push(EventLoopThread::start(format!("evhttpd-worker-{i}")));
        }
        self.started.set(true);
        info!("started {} worker loops", self.num_threads);
    }

    /// Next worker in round-robin order; single-writer, read from the
    /// acceptor loop only.
    pub fn get_next_loop(&self) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started.get());
        if self.threads.is_empty() {
            return self.base.clone();
        }
        let i = self.next.get();
        self.next.set((i + 1) % self.threads.len());
        self.threads[i].handle()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_pool_hands_out_workers_round_robin() {
        let base_loop = EventLoop::new();
        let mut pool = EventLoopThreadPool::new(base_loop.handle(), 3);
        pool.start();

        // observe which worker each task lands on via a per-task message
        let seen = Arc::new(Mutex::new(Vec::new()));
        for turn in 0..6 {
            let handle = pool.get_next_loop();
            let seen = Arc::clone(&seen);
            handle.queue_in_loop(Box::new(move || {
                seen.lock()
                    .unwrap()
                    .push((turn, std::thread::current().name().map(String::from)));
            }));
        }
        // pool drop quits and joins the workers, flushing their queues first
        drop(pool);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        let name_of = |turn: usize| {
            seen.iter()
                .find(|(t, _)| *t == turn)
                .and_then(|(_, name)| name.clone())
                .unwrap()
        };
        for turn in 0..3 {
            assert_eq!(name_of(turn), format!("evhttpd-worker-{turn}"));
            assert_eq!(name_of(turn), name_of(turn + 3)); // wraps around
        }
    }

    #[test]
    #[should_panic(expected = "worker thread count must be positive")]
    pub fn test_zero_workers_is_refused() {
        let base_loop = EventLoop::new();
        let _ = EventLoopThreadPool::new(base_loop.handle(), 0);
    }
}
