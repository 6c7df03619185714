//! # evhttpd — event-driven HTTP/1.x static file server.
//!
//! A multi-reactor server: one acceptor event loop plus a pool of worker
//! loops, each pinned to its own thread. Every connection lives on exactly
//! one loop; the only cross-thread paths are each loop's mutex-guarded task
//! queue and its eventfd wakeup descriptor.
//!
//! The pieces, bottom up:
//! - [`poller`]: edge-triggered epoll multiplexer with the descriptor→channel
//!   registry and the eviction timer heap.
//! - [`channel`]: per-descriptor interest mask plus read/write/error and
//!   post-event handlers.
//! - [`timer`]: min-heap of expiry nodes with lazy (tombstone) deletion.
//! - [`event_loop`]: poll → dispatch → drain tasks → reap timers, forever.
//! - [`loop_threads`]: worker loop threads and the round-robin pool.
//! - [`conn`]: the per-connection HTTP parse/respond state machine.
//! - [`server`]: the acceptor that drains the listen queue and hands
//!   connections to workers.
//!
//! Data flow for one request: accept → round-robin pick of a worker →
//! "register connection" task on that worker's queue → edge-triggered read →
//! state machine advances → response composed → write drain → reset for the
//! next pipelined request, or eviction on timeout.

pub mod channel;
pub mod config;
pub mod conn;
pub mod event_loop;
pub mod loop_threads;
pub mod mime;
pub mod poller;
pub mod server;
pub mod timer;
pub mod util;

pub use channel::Channel;
pub use config::Config;
pub use conn::HttpConn;
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use loop_threads::{EventLoopThread, EventLoopThreadPool};
pub use poller::Epoll;
pub use server::Server;
pub use timer::{TimerManager, TimerNode};
