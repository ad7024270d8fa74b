//! Bounded single-producer single-consumer (SPSC) queues.
//!
//! `ringpipe` provides three interchangeable ring-buffer back-ends behind one
//! operation surface:
//!
//! - [`ring`] - lock-free circular buffer with the head and tail indices on
//!   separate cache lines
//! - [`mapped`] - the same lock-free engine over storage that is mapped twice
//!   into virtual memory, so bulk transfers never split at the wrap point
//! - [`mutex`] - a mutex/condition-variable buffer; the portable reference,
//!   and the one to reach for on hosts that cannot double-map
//!
//! Every back-end is constructed through a factory that returns a producer
//! handle (`Sink`) and a consumer handle (`Source`). The handles jointly own
//! the queue; it is torn down when the second one drops. Exactly one thread
//! may hold each handle - the `&mut self` operations enforce the discipline
//! statically.
//!
//! # Quick Start
//!
//! ```
//! use ringpipe::ring;
//!
//! let (mut tx, mut rx) = ring::queue::<u64>(1024);
//!
//! tx.try_enqueue(42).unwrap();
//! assert_eq!(rx.try_dequeue(), Some(42));
//! ```
//!
//! # Choosing a Back-End
//!
//! Use [`ring`] when:
//! - Latency matters and both sides can afford to poll
//!
//! Use [`mapped`] when:
//! - Bulk transfers dominate and the ring's byte size is a whole number of
//!   pages, so every batch is one linear copy
//!
//! Use [`mutex`] when:
//! - Blocked threads should sleep instead of spinning
//! - The capacity is not a power of two
//!
//! # Capacity
//!
//! All back-ends reserve one slot to keep "full" and "empty" distinguishable:
//! a queue with capacity `n` holds at most `n - 1` elements. The lock-free
//! back-ends round the requested capacity up to the next power of two.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use core::fmt;

mod index;
mod wait;

pub mod mapped;
pub mod mutex;
pub mod ring;
pub mod storage;

/// Error returned by a try-enqueue against a full queue.
///
/// Contains the value that could not be enqueued, returning ownership to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(pub T);

impl<T> Full<T> {
    /// Returns the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is full")
    }
}

impl<T: fmt::Debug> std::error::Error for Full<T> {}

/// Error returned by a timed enqueue whose deadline expired.
///
/// Contains the value that was never stored. The payload is moved into the
/// queue at most once, and only after a slot is known to be free; until then
/// it travels back to the caller inside this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout<T>(pub T);

impl<T> Timeout<T> {
    /// Returns the value that was never enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Timeout<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enqueue timed out")
    }
}

impl<T: fmt::Debug> std::error::Error for Timeout<T> {}
