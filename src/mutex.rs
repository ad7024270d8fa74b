//! Mutex/condition-variable SPSC queue.
//!
//! The portable reference back-end. One mutex guards both indices; two
//! condition variables - `not_empty` for a waiting consumer, `not_full` for
//! a waiting producer - are separate only so a wakeup never lands on the
//! wrong side. Every successful enqueue signals `not_empty` and every
//! successful dequeue signals `not_full`.
//!
//! Unlike the lock-free back-ends this one accepts any capacity of at least
//! two (no power-of-two rounding), and its blocked threads sleep on the
//! condition variables instead of spinning. Bulk blocking operations fill or
//! drain in segments, releasing the lock between segments so the opposite
//! side gets a chance to run.
//!
//! Slots are raw storage constructed in place under the lock, so `T` needs
//! no `Default`; only the slice operations require `T: Copy`.
//!
//! # Example
//!
//! ```
//! use ringpipe::mutex;
//! use std::time::Duration;
//!
//! let (mut tx, mut rx) = mutex::queue::<String>(5);
//!
//! tx.try_enqueue("hello".to_string()).unwrap();
//! assert_eq!(rx.dequeue(Duration::from_secs(1)), Some("hello".to_string()));
//! ```

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::index;
use crate::storage::{HeapStorage, Storage};
use crate::wait;
use crate::{Full, Timeout};

/// Creates a mutex-based SPSC queue with the given capacity.
///
/// The capacity is used as-is (no rounding); one slot is reserved, so the
/// queue holds at most `capacity - 1` elements. Returns the
/// `(Sink, Source)` pair - the only handles that will ever exist for this
/// queue.
///
/// # Panics
///
/// Panics if `capacity < 2`.
///
/// # Example
///
/// ```
/// use ringpipe::mutex;
///
/// let (mut tx, mut rx) = mutex::queue::<u64>(5);
/// tx.try_enqueue(42).unwrap();
/// assert_eq!(rx.try_dequeue(), Some(42));
/// ```
pub fn queue<T>(capacity: usize) -> (Sink<T>, Source<T>) {
    assert!(capacity >= 2, "capacity must be at least 2");

    let shared = Arc::new(Shared {
        state: Mutex::new(State { head: 0, tail: 0 }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        storage: HeapStorage::new(capacity),
    });

    (
        Sink {
            shared: Arc::clone(&shared),
        },
        Source { shared },
    )
}

/// Both indices, guarded by the one mutex.
struct State {
    head: usize,
    tail: usize,
}

struct Shared<T> {
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    /// Mutated only while `state` is held.
    storage: HeapStorage<T>,
}

// Safety: every slot access happens under the mutex.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One condvar wait bounded by the deadline. Spurious wakeups are fine;
    /// callers re-check their predicate in a loop.
    fn wait_on<'a>(
        &self,
        cv: &Condvar,
        guard: MutexGuard<'a, State>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, State> {
        match wait::remaining(deadline) {
            Some(timeout) => {
                cv.wait_timeout(guard, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => cv.wait(guard).unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let tail = state.tail;
        let mut head = state.head;

        while head != tail {
            unsafe { self.storage.drop_at(head) };
            head = index::next(head, self.storage.capacity());
        }
    }
}

/// The producer handle of a mutex-based SPSC queue.
///
/// Move-only and not cloneable; the `&mut self` operations keep the
/// single-producer discipline a compile-time fact.
pub struct Sink<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sink<T> {
    /// Attempts to enqueue a value without waiting on the queue becoming
    /// non-full (the call may still briefly block on the mutex itself).
    ///
    /// Returns `Err(Full(value))` if the queue is full.
    pub fn try_enqueue(&mut self, value: T) -> Result<(), Full<T>> {
        {
            let mut state = self.shared.lock();
            let capacity = self.shared.capacity();

            if index::next(state.tail, capacity) == state.head {
                return Err(Full(value));
            }

            unsafe { self.shared.storage.write(state.tail, value) };
            state.tail = index::next(state.tail, capacity);
        }
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueues a value, sleeping on `not_full` for up to `timeout`.
    ///
    /// Returns `Err(Timeout(value))` if the deadline passes first; the value
    /// is moved into the slot only once space is confirmed, so a timed-out
    /// call always hands it back.
    pub fn enqueue(&mut self, value: T, timeout: Duration) -> Result<(), Timeout<T>> {
        let deadline = wait::deadline_after(timeout);
        {
            let mut state = self.shared.lock();
            let capacity = self.shared.capacity();

            while index::next(state.tail, capacity) == state.head {
                if wait::expired(deadline) {
                    return Err(Timeout(value));
                }
                state = self.shared.wait_on(&self.shared.not_full, state, deadline);
            }

            unsafe { self.shared.storage.write(state.tail, value) };
            state.tail = index::next(state.tail, capacity);
        }
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Returns the capacity of the queue.
    ///
    /// At most `capacity() - 1` elements fit at once.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Returns the number of elements currently in the queue.
    pub fn len(&self) -> usize {
        let state = self.shared.lock();
        index::occupancy(state.head, state.tail, self.shared.capacity())
    }

    /// Returns `true` if the queue is empty.
    pub fn is_empty(&self) -> bool {
        let state = self.shared.lock();
        state.head == state.tail
    }

    /// Returns `true` if the consumer has been dropped.
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T: Copy> Sink<T> {
    /// Enqueues as many elements of `src` as fit, without waiting.
    ///
    /// Returns the number of elements stored, `0..=src.len()`.
    pub fn try_enqueue_slice(&mut self, src: &[T]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let n;
        {
            let mut state = self.shared.lock();
            let capacity = self.shared.capacity();

            let free = index::free_slots(state.head, state.tail, capacity);
            n = src.len().min(free);
            if n == 0 {
                return 0;
            }

            unsafe { self.shared.storage.write_wrapping(state.tail, &src[..n]) };
            state.tail = (state.tail + n) % capacity;
        }
        self.shared.not_empty.notify_one();
        n
    }

    /// Enqueues all of `src`, sleeping on `not_full` as needed.
    ///
    /// Fills in segments, releasing the lock (and signalling `not_empty`)
    /// between them so the consumer can drain mid-batch. Returns `true` only
    /// once every element has been stored; on timeout the elements stored so
    /// far remain in the queue.
    pub fn enqueue_slice(&mut self, src: &[T], timeout: Duration) -> bool {
        let deadline = wait::deadline_after(timeout);
        let capacity = self.shared.capacity();
        let mut written = 0;

        while written < src.len() {
            {
                let mut state = self.shared.lock();

                while index::free_slots(state.head, state.tail, capacity) == 0 {
                    if wait::expired(deadline) {
                        return false;
                    }
                    state = self.shared.wait_on(&self.shared.not_full, state, deadline);
                }

                let free = index::free_slots(state.head, state.tail, capacity);
                let n = free.min(src.len() - written);
                unsafe {
                    self.shared
                        .storage
                        .write_wrapping(state.tail, &src[written..written + n]);
                }
                state.tail = (state.tail + n) % capacity;
                written += n;
            }
            self.shared.not_empty.notify_one();
        }
        true
    }
}

impl<T> fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// The consumer handle of a mutex-based SPSC queue.
///
/// Move-only and not cloneable, like [`Sink`].
pub struct Source<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Source<T> {
    /// Attempts to dequeue a value without waiting on the queue becoming
    /// non-empty (the call may still briefly block on the mutex itself).
    ///
    /// Returns `None` if the queue is empty.
    pub fn try_dequeue(&mut self) -> Option<T> {
        let value;
        {
            let mut state = self.shared.lock();

            if state.head == state.tail {
                return None;
            }

            value = unsafe { self.shared.storage.read(state.head) };
            state.head = index::next(state.head, self.shared.capacity());
        }
        self.shared.not_full.notify_one();
        Some(value)
    }

    /// Dequeues a value, sleeping on `not_empty` for up to `timeout`.
    ///
    /// Returns `None` if the deadline passes first.
    pub fn dequeue(&mut self, timeout: Duration) -> Option<T> {
        let deadline = wait::deadline_after(timeout);
        let value;
        {
            let mut state = self.shared.lock();

            while state.head == state.tail {
                if wait::expired(deadline) {
                    return None;
                }
                state = self
                    .shared
                    .wait_on(&self.shared.not_empty, state, deadline);
            }

            value = unsafe { self.shared.storage.read(state.head) };
            state.head = index::next(state.head, self.shared.capacity());
        }
        self.shared.not_full.notify_one();
        Some(value)
    }

    /// Returns the capacity of the queue.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    /// Returns the number of elements currently in the queue.
    pub fn len(&self) -> usize {
        let state = self.shared.lock();
        index::occupancy(state.head, state.tail, self.shared.capacity())
    }

    /// Returns `true` if the queue is empty.
    pub fn is_empty(&self) -> bool {
        let state = self.shared.lock();
        state.head == state.tail
    }

    /// Returns `true` if the producer has been dropped.
    pub fn is_disconnected(&self) -> bool {
        Arc::strong_count(&self.shared) == 1
    }
}

impl<T: Copy> Source<T> {
    /// Dequeues up to `dst.len()` elements without waiting.
    ///
    /// Returns the number of elements transferred; the rest of `dst` is
    /// untouched.
    pub fn try_dequeue_slice(&mut self, dst: &mut [T]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let n;
        {
            let mut state = self.shared.lock();
            let capacity = self.shared.capacity();

            let occupied = index::occupancy(state.head, state.tail, capacity);
            n = dst.len().min(occupied);
            if n == 0 {
                return 0;
            }

            unsafe { self.shared.storage.read_wrapping(state.head, &mut dst[..n]) };
            state.head = (state.head + n) % capacity;
        }
        self.shared.not_full.notify_one();
        n
    }

    /// Dequeues up to `dst.len()` elements, sleeping on `not_empty` as
    /// needed.
    ///
    /// Drains in segments, releasing the lock between them. Returns the
    /// number transferred; a count below `dst.len()` means the deadline
    /// passed.
    pub fn dequeue_slice(&mut self, dst: &mut [T], timeout: Duration) -> usize {
        let deadline = wait::deadline_after(timeout);
        let capacity = self.shared.capacity();
        let mut read = 0;

        while read < dst.len() {
            {
                let mut state = self.shared.lock();

                while state.head == state.tail {
                    if wait::expired(deadline) {
                        return read;
                    }
                    state = self
                        .shared
                        .wait_on(&self.shared.not_empty, state, deadline);
                }

                let occupied = index::occupancy(state.head, state.tail, capacity);
                let n = occupied.min(dst.len() - read);
                unsafe {
                    self.shared
                        .storage
                        .read_wrapping(state.head, &mut dst[read..read + n]);
                }
                state.head = (state.head + n) % capacity;
                read += n;
            }
            self.shared.not_full.notify_one();
        }
        read
    }
}

impl<T> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // ============================================================================
    // Basic Operations
    // ============================================================================

    #[test]
    fn basic_fifo() {
        let (mut tx, mut rx) = queue::<u64>(8);

        for v in [10, 20, 30] {
            tx.try_enqueue(v).unwrap();
        }

        assert_eq!(rx.try_dequeue(), Some(10));
        assert_eq!(rx.try_dequeue(), Some(20));
        assert_eq!(rx.try_dequeue(), Some(30));
        assert_eq!(rx.try_dequeue(), None);
    }

    #[test]
    fn one_slot_is_sacrificed() {
        let (mut tx, mut rx) = queue::<i32>(8);

        for i in 0..7 {
            tx.try_enqueue(i).unwrap();
        }
        assert_eq!(tx.try_enqueue(999), Err(Full(999)));

        assert_eq!(rx.try_dequeue(), Some(0));
        tx.try_enqueue(999).unwrap();

        for expected in [1, 2, 3, 4, 5, 6, 999] {
            assert_eq!(rx.try_dequeue(), Some(expected));
        }
    }

    #[test]
    fn arbitrary_capacity_is_kept_exact() {
        let (tx, _rx) = queue::<u64>(5);
        assert_eq!(tx.capacity(), 5);

        let (tx, _rx) = queue::<u64>(100);
        assert_eq!(tx.capacity(), 100);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 2")]
    fn tiny_capacity_panics() {
        let _ = queue::<u64>(1);
    }

    #[test]
    fn wraparound_with_non_power_of_two_capacity() {
        let (mut tx, mut rx) = queue::<u64>(5);

        for lap in 0..50 {
            for i in 0..4 {
                tx.try_enqueue(lap * 4 + i).unwrap();
            }
            assert_eq!(tx.try_enqueue(999), Err(Full(999)));
            for i in 0..4 {
                assert_eq!(rx.try_dequeue(), Some(lap * 4 + i));
            }
        }
    }

    #[test]
    fn non_copy_payloads_move_through() {
        let (mut tx, mut rx) = queue::<String>(4);

        tx.try_enqueue("first".to_string()).unwrap();
        tx.try_enqueue("second".to_string()).unwrap();

        assert_eq!(rx.try_dequeue(), Some("first".to_string()));
        assert_eq!(rx.try_dequeue(), Some("second".to_string()));
    }

    #[test]
    fn len_and_is_empty_take_the_lock() {
        let (mut tx, mut rx) = queue::<u64>(10);

        assert!(tx.is_empty());
        for i in 0..6 {
            tx.try_enqueue(i).unwrap();
        }
        assert_eq!(tx.len(), 6);
        assert_eq!(rx.len(), 6);

        for _ in 0..6 {
            rx.try_dequeue().unwrap();
        }
        assert!(rx.is_empty());
    }

    // ============================================================================
    // Bulk Operations
    // ============================================================================

    #[test]
    fn bulk_wraparound_sequence() {
        let (mut tx, mut rx) = queue::<i32>(8);

        assert_eq!(tx.try_enqueue_slice(&[1, 2, 3, 4]), 4);

        let mut out = [0i32; 2];
        assert_eq!(rx.try_dequeue_slice(&mut out), 2);
        assert_eq!(out, [1, 2]);

        assert_eq!(tx.try_enqueue_slice(&[5, 6]), 2);
        assert_eq!(tx.try_enqueue_slice(&[7, 8, 9, 10]), 3);

        let mut out = [0i32; 7];
        assert_eq!(rx.try_dequeue_slice(&mut out), 7);
        assert_eq!(out, [3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn bulk_dequeue_on_empty_leaves_buffer_untouched() {
        let (_tx, mut rx) = queue::<i32>(16);

        let mut out = [7i32; 10];
        assert_eq!(rx.try_dequeue_slice(&mut out), 0);
        assert_eq!(out, [7; 10]);
    }

    #[test]
    fn bulk_partial_on_nearly_full_queue() {
        let (mut tx, mut rx) = queue::<u32>(6);

        assert_eq!(tx.try_enqueue_slice(&[1, 2, 3]), 3);
        // Two slots left (one sacrificed).
        assert_eq!(tx.try_enqueue_slice(&[4, 5, 6, 7]), 2);

        let mut out = [0u32; 6];
        assert_eq!(rx.try_dequeue_slice(&mut out), 5);
        assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
    }

    // ============================================================================
    // Blocking Operations
    // ============================================================================

    #[test]
    fn enqueue_timeout_on_full_queue() {
        let (mut tx, _rx) = queue::<u32>(4);

        for i in 0..3 {
            tx.try_enqueue(i).unwrap();
        }

        let start = Instant::now();
        assert_eq!(tx.enqueue(99, Duration::from_millis(50)), Err(Timeout(99)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dequeue_timeout_on_empty_queue() {
        let (_tx, mut rx) = queue::<u32>(4);

        let start = Instant::now();
        assert_eq!(rx.dequeue(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blocked_enqueue_wakes_on_dequeue() {
        let (mut tx, mut rx) = queue::<u32>(8);

        for i in 0..7 {
            tx.try_enqueue(i).unwrap();
        }

        let producer = thread::spawn(move || {
            let result = tx.enqueue(99, Duration::from_secs(5));
            (tx, result)
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(rx.try_dequeue(), Some(0));

        let (_tx, result) = producer.join().unwrap();
        assert_eq!(result, Ok(()));

        for expected in [1, 2, 3, 4, 5, 6, 99] {
            assert_eq!(rx.try_dequeue(), Some(expected));
        }
    }

    #[test]
    fn blocked_dequeue_wakes_on_enqueue() {
        let (mut tx, mut rx) = queue::<u32>(4);

        let consumer = thread::spawn(move || rx.dequeue(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(50));
        tx.try_enqueue(7).unwrap();

        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn timed_out_enqueue_hands_the_payload_back() {
        let (mut tx, _rx) = queue::<Box<i32>>(4);

        for i in 0..3 {
            tx.try_enqueue(Box::new(i)).unwrap();
        }

        match tx.enqueue(Box::new(999), Duration::from_millis(50)) {
            Err(Timeout(payload)) => assert_eq!(*payload, 999),
            Ok(()) => panic!("queue was full; enqueue cannot have succeeded"),
        }
    }

    #[test]
    fn blocking_bulk_enqueue_drains_through_a_slow_consumer() {
        let (mut tx, mut rx) = queue::<u32>(4);

        let data: Vec<u32> = (0..20).collect();

        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            while seen.len() < 20 {
                if let Some(v) = rx.dequeue(Duration::from_secs(5)) {
                    seen.push(v);
                }
            }
            seen
        });

        // The whole batch is five times the capacity; it only completes
        // because the lock is released between segments.
        assert!(tx.enqueue_slice(&data, Duration::from_secs(5)));

        let seen = consumer.join().unwrap();
        assert_eq!(seen, data);
    }

    #[test]
    fn blocking_bulk_dequeue_returns_partial_count_on_timeout() {
        let (mut tx, mut rx) = queue::<u32>(8);

        tx.try_enqueue_slice(&[1, 2, 3]);

        let mut out = [0u32; 5];
        let n = rx.dequeue_slice(&mut out, Duration::from_millis(50));
        assert_eq!(n, 3);
        assert_eq!(&out[..3], &[1, 2, 3]);
    }

    // ============================================================================
    // Drop Behavior
    // ============================================================================

    #[test]
    fn drop_cleans_up_remaining() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let drops = Arc::new(AtomicUsize::new(0));

        #[derive(Debug)]
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (mut tx, mut rx) = queue::<DropCounter>(8);

        for _ in 0..5 {
            tx.try_enqueue(DropCounter(Arc::clone(&drops))).unwrap();
        }
        let _ = rx.try_dequeue();
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        drop(tx);
        drop(rx);

        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    // ============================================================================
    // Cross-Thread
    // ============================================================================

    #[test]
    fn concurrent_order_preserved() {
        const COUNT: u64 = 100_000;

        let (mut tx, mut rx) = queue::<u64>(64);

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                while tx.try_enqueue(i).is_err() {
                    thread::yield_now();
                }
            }
        });

        let consumer = thread::spawn(move || {
            let mut expected = 0u64;
            while expected < COUNT {
                if let Some(v) = rx.try_dequeue() {
                    assert_eq!(v, expected);
                    expected += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }

    #[test]
    fn blocking_pair_exchanges_everything() {
        const COUNT: u64 = 10_000;

        let (mut tx, mut rx) = queue::<u64>(16);

        let producer = thread::spawn(move || {
            for i in 0..COUNT {
                assert!(tx.enqueue(i, Duration::from_secs(10)).is_ok());
            }
        });

        let consumer = thread::spawn(move || {
            let mut sum = 0u64;
            for _ in 0..COUNT {
                sum += rx.dequeue(Duration::from_secs(10)).unwrap();
            }
            sum
        });

        producer.join().unwrap();
        let sum = consumer.join().unwrap();
        assert_eq!(sum, COUNT * (COUNT - 1) / 2);
    }
}
