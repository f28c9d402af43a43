//! A lock-free concurrent queue for Rust.
//!
//! This crate provides an unbounded multi-producer multi-consumer FIFO queue, the lock-free
//! memory management it needs to free nodes safely, and a linearizability tester used to
//! check it. No operation on the queue ever takes a lock: a thread stalled in the middle of an
//! operation can slow others down, but never stop them.
//!
//! ```
//! use lockfree_queue::structures::Queue;
//!
//! let queue: Queue<u32> = Queue::new();
//! queue.enqueue(1);
//! queue.enqueue(2);
//! assert_eq!(queue.dequeue(), Some(1));
//! assert_eq!(queue.dequeue(), Some(2));
//! assert_eq!(queue.dequeue(), None);
//! ```

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod memory;
pub mod structures;
pub mod testing;

pub use config::Config;
pub use error::AllocError;
pub use structures::Queue;
