//! Lock-free SPSC ring queue.
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Shared:                                                     │
//! │   tail: CachePadded<AtomicUsize>   ← Sink publishes         │
//! │   head: CachePadded<AtomicUsize>   ← Source publishes       │
//! │   storage: S                                                │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────┐     ┌─────────────────────┐
//! │ Sink:               │     │ Source:             │
//! │   local_tail        │     │   local_head        │
//! │   cached_head       │     │   cached_tail       │
//! └─────────────────────┘     └─────────────────────┘
//! ```
//!
//! Indices are wrapped values in `[0, capacity)` with one slot sacrificed:
//! empty is `head == tail`, full is `next(tail) == head`. Each side keeps an
//! authoritative local copy of its own index and a cached copy of the
//! other's, refreshed with an acquire load only when the cache says the ring
//! is full (producer) or empty (consumer). A stale cache can only
//! under-report availability, never over-report it, so the refresh is purely
//! an optimization.
//!
//! The hand-off itself is the acquire/release pair: the producer writes the
//! slot and release-stores the new tail; the consumer's acquire load of the
//! tail makes the slot write visible before the element is moved out, and
//! its release store of the new head returns the slot to the producer the
//! same way. Bulk operations fill or drain a whole span of slots and publish
//! it with a single release store, so the other side observes a batch fully
//! or not at all.
//!
//! # Example
//!
//! ```
//! use ringpipe::ring;
//!
//! let (mut tx, mut rx) = ring::queue::<u64>(1024);
//!
//! tx.try_enqueue(1).unwrap();
//! tx.try_enqueue(2).unwrap();
//!
//! assert_eq!(rx.try_dequeue(), Some(1));
//! assert_eq!(rx.try_dequeue(), Some(2));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;

use crate::index;
use crate::storage::{HeapStorage, Storage};
use crate::wait;
use crate::{Full, Timeout};

/// Creates a lock-free SPSC queue with the given capacity.
///
/// Capacity is rounded up to the next power of two; one slot is reserved to
/// distinguish full from empty, so the queue holds at most `capacity - 1`
/// elements. Returns the `(Sink, Source)` pair - the only handles that will
/// ever exist for this queue.
///
/// # Panics
///
/// Panics if `capacity < 2`.
///
/// # Example
///
/// ```
/// use ringpipe::ring;
///
/// let (mut tx, mut rx) = ring::queue::<u64>(8);
/// tx.try_enqueue(42).unwrap();
/// assert_eq!(rx.try_dequeue(), Some(42));
/// ```
pub fn queue<T>(capacity: usize) -> (Sink<T>, Source<T>) {
    assert!(capacity >= 2, "capacity must be at least 2");
    from_storage(HeapStorage::new(capacity.next_power_of_two()))
}

/// Builds the handle pair over an already-constructed storage.
///
/// The storage capacity must be a power of two.
pub(crate) fn from_storage<T, S: Storage<T>>(storage: S) -> (Sink<T, S>, Source<T, S>) {
    let capacity = storage.capacity();
    debug_assert!(capacity.is_power_of_two() && capacity >= 2);

    let shared = Arc::new(Shared {
        tail: CachePadded::new(AtomicUsize::new(0)),
        head: CachePadded::new(AtomicUsize::new(0)),
        mask: capacity - 1,
        storage,
        _marker: PhantomData,
    });

    (
        Sink {
            local_tail: 0,
            cached_head: 0,
            shared: Arc::clone(&shared),
        },
        Source {
            local_head: 0,
            cached_tail: 0,
            shared,
        },
    )
}

struct Shared<T, S: Storage<T>> {
    /// Next slot the producer will write. Published with release.
    tail: CachePadded<AtomicUsize>,
    /// Next slot the consumer will read. Published with release.
    head: CachePadded<AtomicUsize>,
    /// Capacity - 1, for masked index arithmetic.
    mask: usize,
    storage: S,
    _marker: PhantomData<T>,
}

// Safety: slot hand-off is mediated by the acquire/release index pair, and
// each index is mutated by exactly one handle.
unsafe impl<T: Send, S: Storage<T>> Send for Shared<T, S> {}
unsafe impl<T: Send, S: Storage<T>> Sync for Shared<T, S> {}

impl<T, S: Storage<T>> Drop for Shared<T, S> {
    fn drop(&mut self) {
        // Both handles are gone; whatever is still live in [head, tail)
        // gets dropped before the storage releases the region.
        let tail = self.tail.load(Ordering::Relaxed);
        let mut head = self.head.load(Ordering::Relaxed);

        while head != tail {
            unsafe { self.storage.drop_at(head) };
            head = index::next_pow2(head, self.mask);
        }
    }
}

/// The producer handle of a lock-free SPSC queue.
///
/// Move-only and not cloneable: exactly one exists per queue, and the
/// `&mut self` operations keep the single-producer discipline a compile-time
/// fact. Dropping the sink leaves the source free to drain what was already
/// published.
pub struct Sink<T, S: Storage<T> = HeapStorage<T>> {
    /// Authoritative write position.
    local_tail: usize,
    /// Last observed consumer position; refreshed when the ring looks full.
    cached_head: usize,
    shared: Arc<Shared<T, S>>,
}

impl<T, S: Storage<T>> Sink<T, S> {
    /// Attempts to enqueue a value without blocking.
    ///
    /// Returns `Err(Full(value))` if the queue is full, handing the value
    /// back untouched.
    ///
    /// # Example
    ///
    /// ```
    /// use ringpipe::ring;
    ///
    /// let (mut tx, _rx) = ring::queue::<u32>(4);
    ///
    /// tx.try_enqueue(1).unwrap();
    /// tx.try_enqueue(2).unwrap();
    /// tx.try_enqueue(3).unwrap();
    ///
    /// // One slot is reserved: a capacity-4 ring holds three elements.
    /// let err = tx.try_enqueue(4).unwrap_err();
    /// assert_eq!(err.into_inner(), 4);
    /// ```
    #[inline]
    pub fn try_enqueue(&mut self, value: T) -> Result<(), Full<T>> {
        let tail = self.local_tail;
        let next_tail = index::next_pow2(tail, self.shared.mask);

        if next_tail == self.cached_head {
            self.cached_head = self.shared.head.load(Ordering::Acquire);
            if next_tail == self.cached_head {
                return Err(Full(value));
            }
        }

        unsafe { self.shared.storage.write(tail, value) };
        self.shared.tail.store(next_tail, Ordering::Release);
        self.local_tail = next_tail;

        Ok(())
    }

    /// Enqueues a value, waiting up to `timeout` for space.
    ///
    /// Returns `Err(Timeout(value))` if the deadline passes first; the value
    /// is moved into the queue at most once, and only after the full-check
    /// has passed, so a timed-out call always hands it back.
    pub fn enqueue(&mut self, value: T, timeout: Duration) -> Result<(), Timeout<T>> {
        let deadline = wait::deadline_after(timeout);
        let mut value = value;

        loop {
            match self.try_enqueue(value) {
                Ok(()) => return Ok(()),
                Err(Full(returned)) => {
                    if wait::expired(deadline) {
                        return Err(Timeout(returned));
                    }
                    value = returned;
                    thread::yield_now();
                }
            }
        }
    }

    /// Returns the capacity of the queue.
    ///
    /// At most `capacity() - 1` elements fit at once.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }

    /// Returns the number of elements currently in the queue.
    ///
    /// A snapshot: it may be stale by the time the caller inspects it.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Acquire);
        index::occupancy(head, tail, self.shared.mask + 1)
    }

    /// Returns `true` if the queue is empty. A snapshot, like [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Acquire);
        head == tail
    }

    /// Returns `true` if the consumer has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T: Copy, S: Storage<T>> Sink<T, S> {
    /// Enqueues as many elements of `src` as fit, without blocking.
    ///
    /// Returns the number of elements stored, `0..=src.len()`. Storing fewer
    /// than requested is a successful partial transfer, never an error. The
    /// whole batch becomes visible to the consumer at once.
    ///
    /// # Example
    ///
    /// ```
    /// use ringpipe::ring;
    ///
    /// let (mut tx, _rx) = ring::queue::<u32>(8);
    ///
    /// // Seven slots are free; the eighth element doesn't fit.
    /// assert_eq!(tx.try_enqueue_slice(&[1, 2, 3, 4, 5, 6, 7, 8]), 7);
    /// ```
    pub fn try_enqueue_slice(&mut self, src: &[T]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let capacity = self.shared.mask + 1;
        let tail = self.local_tail;

        let mut free = index::free_slots(self.cached_head, tail, capacity);
        if free < src.len() {
            self.cached_head = self.shared.head.load(Ordering::Acquire);
            free = index::free_slots(self.cached_head, tail, capacity);
        }

        let n = src.len().min(free);
        if n == 0 {
            return 0;
        }

        unsafe { self.shared.storage.write_wrapping(tail, &src[..n]) };

        // One release store publishes the whole batch.
        let new_tail = (tail + n) & self.shared.mask;
        self.shared.tail.store(new_tail, Ordering::Release);
        self.local_tail = new_tail;

        n
    }

    /// Enqueues all of `src`, waiting up to `timeout` for space.
    ///
    /// Progress accumulates across retries; returns `true` only once every
    /// element has been stored. On `false` the elements stored so far remain
    /// in the queue and each source element was copied at most once.
    pub fn enqueue_slice(&mut self, src: &[T], timeout: Duration) -> bool {
        let deadline = wait::deadline_after(timeout);
        let mut written = 0;

        loop {
            written += self.try_enqueue_slice(&src[written..]);
            if written == src.len() {
                return true;
            }
            if wait::expired(deadline) {
                return false;
            }
            thread::yield_now();
        }
    }
}

impl<T, S: Storage<T>> fmt::Debug for Sink<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// The consumer handle of a lock-free SPSC queue.
///
/// Move-only and not cloneable, like [`Sink`]. Dropping the source while
/// elements remain destroys them together with the queue once the sink is
/// gone too.
pub struct Source<T, S: Storage<T> = HeapStorage<T>> {
    /// Authoritative read position.
    local_head: usize,
    /// Last observed producer position; refreshed when the ring looks empty.
    cached_tail: usize,
    shared: Arc<Shared<T, S>>,
}

impl<T, S: Storage<T>> Source<T, S> {
    /// Attempts to dequeue a value without blocking.
    ///
    /// Returns `None` if the queue is empty.
    ///
    /// # Example
    ///
    /// ```
    /// use ringpipe::ring;
    ///
    /// let (mut tx, mut rx) = ring::queue::<u32>(8);
    ///
    /// assert_eq!(rx.try_dequeue(), None);
    /// tx.try_enqueue(42).unwrap();
    /// assert_eq!(rx.try_dequeue(), Some(42));
    /// ```
    #[inline]
    pub fn try_dequeue(&mut self) -> Option<T> {
        let head = self.local_head;

        if head == self.cached_tail {
            self.cached_tail = self.shared.tail.load(Ordering::Acquire);
            if head == self.cached_tail {
                return None;
            }
        }

        let value = unsafe { self.shared.storage.read(head) };
        let next_head = index::next_pow2(head, self.shared.mask);
        self.shared.head.store(next_head, Ordering::Release);
        self.local_head = next_head;

        Some(value)
    }

    /// Dequeues a value, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` if the deadline passes first.
    pub fn dequeue(&mut self, timeout: Duration) -> Option<T> {
        let deadline = wait::deadline_after(timeout);

        loop {
            if let Some(value) = self.try_dequeue() {
                return Some(value);
            }
            if wait::expired(deadline) {
                return None;
            }
            thread::yield_now();
        }
    }

    /// Returns the capacity of the queue.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }

    /// Returns the number of elements currently in the queue.
    ///
    /// A snapshot: it may be stale by the time the caller inspects it.
    #[inline]
    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Acquire);
        index::occupancy(head, tail, self.shared.mask + 1)
    }

    /// Returns `true` if the queue is empty. A snapshot, like [`len`](Self::len).
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = self.shared.head.load(Ordering::Acquire);
        let tail = self.shared.tail.load(Ordering::Acquire);
        head == tail
    }

    /// Returns `true` if the producer has been dropped.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T: Copy, S: Storage<T>> Source<T, S> {
    /// Dequeues up to `dst.len()` elements without blocking.
    ///
    /// Returns the number of elements transferred, `0..=dst.len()`; the rest
    /// of `dst` is untouched. Draining fewer than requested is a successful
    /// partial transfer, never an error.
    pub fn try_dequeue_slice(&mut self, dst: &mut [T]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let capacity = self.shared.mask + 1;
        let head = self.local_head;

        let mut occupied = index::occupancy(head, self.cached_tail, capacity);
        if occupied < dst.len() {
            self.cached_tail = self.shared.tail.load(Ordering::Acquire);
            occupied = index::occupancy(head, self.cached_tail, capacity);
        }

        let n = dst.len().min(occupied);
        if n == 0 {
            return 0;
        }

        unsafe { self.shared.storage.read_wrapping(head, &mut dst[..n]) };

        // One release store returns the whole span of slots.
        let new_head = (head + n) & self.shared.mask;
        self.shared.head.store(new_head, Ordering::Release);
        self.local_head = new_head;

        n
    }

    /// Dequeues up to `dst.len()` elements, waiting up to `timeout`.
    ///
    /// Progress accumulates across retries. Returns the number transferred;
    /// a count below `dst.len()` means the deadline passed.
    pub fn dequeue_slice(&mut self, dst: &mut [T], timeout: Duration) -> usize {
        let deadline = wait::deadline_after(timeout);
        let mut read = 0;

        loop {
            read += self.try_dequeue_slice(&mut dst[read..]);
            if read == dst.len() {
                return read;
            }
            if wait::expired(deadline) {
                return read;
            }
            thread::yield_now();
        }
    }
}

impl<T, S: Storage<T>> fmt::Debug for Source<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
