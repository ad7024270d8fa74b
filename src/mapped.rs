//! Double-mapped storage for the lock-free ring.
//!
//! The backing pages are mapped twice, back to back, into one reserved
//! virtual span, so slot `i` and slot `i + capacity` are the same memory:
//!
//! ```text
//!  virtual:   [ mapping A              ][ mapping B              ]
//!               └─────────── same physical pages ───────────┘
//! ```
//!
//! A bulk transfer that starts near the end of mapping A runs straight into
//! mapping B and lands at the front of the ring, so any span of up to
//! `capacity` slots is one linear copy - the wrap never splits a batch.
//!
//! The memory object is anonymous and process-private (`memfd_create` on
//! Linux); nothing touches the filesystem. Two `MAP_FIXED` mappings can only
//! alias at a page-multiple offset, so the double map is used when
//! `capacity * size_of::<T>()` is a whole number of pages. Otherwise - and
//! on non-Linux hosts - the back-end falls back to a plain allocation with
//! two-segment copies behind the same types and the same contract.
//!
//! # Example
//!
//! ```
//! use ringpipe::mapped;
//!
//! // 512 * 8 bytes = a whole number of pages: double-mapped on Linux.
//! let (mut tx, mut rx) = mapped::queue::<u64>(512)?;
//!
//! tx.try_enqueue(42).unwrap();
//! assert_eq!(rx.try_dequeue(), Some(42));
//! # Ok::<(), mapped::MapError>(())
//! ```

use std::fmt;
use std::io;
#[cfg(target_os = "linux")]
use std::mem;

use crate::storage::{HeapStorage, Storage};

/// The producer handle of a double-mapped queue.
pub type Sink<T> = crate::ring::Sink<T, MappedStorage<T>>;

/// The consumer handle of a double-mapped queue.
pub type Source<T> = crate::ring::Source<T, MappedStorage<T>>;

/// Creates a double-mapped SPSC queue with the given capacity.
///
/// Capacity is rounded up to the next power of two; one slot is reserved, so
/// the queue holds at most `capacity - 1` elements. Returns a
/// `(Sink, Source)` pair, or [`MapError`] if the operating system refuses to
/// create, size, reserve, or map the backing memory. After a successful
/// return no operation can fail for that reason.
///
/// # Panics
///
/// Panics if `capacity < 2`.
///
/// # Example
///
/// ```
/// use ringpipe::mapped;
///
/// let (mut tx, mut rx) = mapped::queue::<u64>(512)?;
/// tx.try_enqueue(1).unwrap();
/// assert_eq!(rx.try_dequeue(), Some(1));
/// # Ok::<(), mapped::MapError>(())
/// ```
pub fn queue<T>(capacity: usize) -> Result<(Sink<T>, Source<T>), MapError> {
    assert!(capacity >= 2, "capacity must be at least 2");
    let capacity = capacity.next_power_of_two();
    let storage = MappedStorage::new(capacity)?;
    Ok(crate::ring::from_storage(storage))
}

/// Ring storage whose pages are mapped twice, back to back.
///
/// Constructed only through [`queue`]; rings that cannot be double-mapped
/// carry a [`HeapStorage`] internally instead.
pub struct MappedStorage<T> {
    repr: Repr<T>,
    capacity: usize,
}

enum Repr<T> {
    #[cfg(target_os = "linux")]
    Mapped(DoubleMap<T>),
    Heap(HeapStorage<T>),
}

impl<T> MappedStorage<T> {
    pub(crate) fn new(capacity: usize) -> Result<Self, MapError> {
        #[cfg(target_os = "linux")]
        {
            let Some(bytes) = capacity.checked_mul(mem::size_of::<T>()) else {
                return Err(MapError::oversized());
            };
            let page = page_size();
            if bytes != 0 && bytes % page == 0 && mem::align_of::<T>() <= page {
                let map = DoubleMap::new(bytes)?;
                return Ok(Self {
                    repr: Repr::Mapped(map),
                    capacity,
                });
            }
        }

        Ok(Self {
            repr: Repr::Heap(HeapStorage::new(capacity)),
            capacity,
        })
    }

    /// Whether the ring actually got the aliased double mapping.
    #[cfg(test)]
    pub(crate) fn is_double_mapped(&self) -> bool {
        match &self.repr {
            #[cfg(target_os = "linux")]
            Repr::Mapped(_) => true,
            Repr::Heap(_) => false,
        }
    }
}

unsafe impl<T> Storage<T> for MappedStorage<T> {
    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    unsafe fn write(&self, index: usize, value: T) {
        match &self.repr {
            #[cfg(target_os = "linux")]
            Repr::Mapped(map) => unsafe { map.base.add(index).write(value) },
            Repr::Heap(heap) => unsafe { heap.write(index, value) },
        }
    }

    #[inline]
    unsafe fn read(&self, index: usize) -> T {
        match &self.repr {
            #[cfg(target_os = "linux")]
            Repr::Mapped(map) => unsafe { map.base.add(index).read() },
            Repr::Heap(heap) => unsafe { heap.read(index) },
        }
    }

    #[inline]
    unsafe fn drop_at(&self, index: usize) {
        match &self.repr {
            #[cfg(target_os = "linux")]
            Repr::Mapped(map) => unsafe { map.base.add(index).drop_in_place() },
            Repr::Heap(heap) => unsafe { heap.drop_at(index) },
        }
    }

    unsafe fn write_wrapping(&self, index: usize, src: &[T])
    where
        T: Copy,
    {
        match &self.repr {
            // The second mapping aliases the first, so writing past
            // `capacity` lands at the front of the ring.
            #[cfg(target_os = "linux")]
            Repr::Mapped(map) => unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), map.base.add(index), src.len());
            },
            Repr::Heap(heap) => unsafe { heap.write_wrapping(index, src) },
        }
    }

    unsafe fn read_wrapping(&self, index: usize, dst: &mut [T])
    where
        T: Copy,
    {
        match &self.repr {
            #[cfg(target_os = "linux")]
            Repr::Mapped(map) => unsafe {
                std::ptr::copy_nonoverlapping(map.base.add(index), dst.as_mut_ptr(), dst.len());
            },
            Repr::Heap(heap) => unsafe { heap.read_wrapping(index, dst) },
        }
    }
}

impl<T> fmt::Debug for MappedStorage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let double_mapped = match &self.repr {
            #[cfg(target_os = "linux")]
            Repr::Mapped(_) => true,
            Repr::Heap(_) => false,
        };
        f.debug_struct("MappedStorage")
            .field("capacity", &self.capacity)
            .field("double_mapped", &double_mapped)
            .finish_non_exhaustive()
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// One anonymous memory object mapped at offsets `0` and `span` of a
/// `2 * span` virtual reservation.
#[cfg(target_os = "linux")]
struct DoubleMap<T> {
    base: *mut T,
    /// Bytes covered by one of the two mappings.
    span: usize,
}

#[cfg(target_os = "linux")]
impl<T> DoubleMap<T> {
    fn new(span: usize) -> Result<Self, MapError> {
        let Some(double) = span.checked_mul(2) else {
            return Err(MapError::oversized());
        };

        // SAFETY: raw mmap plumbing; every failure path releases what was
        // acquired before it. The fd can be closed once both mappings exist,
        // since mappings keep the memory object alive.
        unsafe {
            let fd = libc::memfd_create(b"ringpipe\0".as_ptr().cast(), libc::MFD_CLOEXEC);
            if fd < 0 {
                return Err(MapError::last(Stage::Create));
            }

            if libc::ftruncate(fd, span as libc::off_t) != 0 {
                let err = MapError::last(Stage::Size);
                libc::close(fd);
                return Err(err);
            }

            let base = libc::mmap(
                std::ptr::null_mut(),
                double,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                let err = MapError::last(Stage::Reserve);
                libc::close(fd);
                return Err(err);
            }

            for half in 0..2 {
                let at = base.cast::<u8>().add(half * span).cast();
                let mapping = libc::mmap(
                    at,
                    span,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    fd,
                    0,
                );
                if mapping == libc::MAP_FAILED {
                    let err = MapError::last(Stage::Map);
                    libc::munmap(base, double);
                    libc::close(fd);
                    return Err(err);
                }
            }

            libc::close(fd);

            Ok(Self {
                base: base.cast(),
                span,
            })
        }
    }
}

#[cfg(target_os = "linux")]
impl<T> Drop for DoubleMap<T> {
    fn drop(&mut self) {
        // SAFETY: this span was returned by mmap and is unmapped exactly once.
        unsafe {
            libc::munmap(self.base.cast(), 2 * self.span);
        }
    }
}

/// Error returned by [`queue`] when the backing memory cannot be set up.
///
/// Carries the construction stage that failed and the operating-system
/// error. No handles are produced when this is returned.
#[derive(Debug)]
pub struct MapError {
    stage: Stage,
    source: io::Error,
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
enum Stage {
    Create,
    Size,
    Reserve,
    Map,
}

impl MapError {
    #[cfg(target_os = "linux")]
    fn last(stage: Stage) -> Self {
        Self {
            stage,
            source: io::Error::last_os_error(),
        }
    }

    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn oversized() -> Self {
        Self {
            stage: Stage::Reserve,
            source: io::ErrorKind::OutOfMemory.into(),
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self.stage {
            Stage::Create => "creating the memory object",
            Stage::Size => "sizing the memory object",
            Stage::Reserve => "reserving the double-mapped region",
            Stage::Map => "mapping the ring storage",
        };
        write!(f, "{stage} failed: {}", self.source)
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Storage Selection
    // ============================================================================

    #[cfg(target_os = "linux")]
    #[test]
    fn page_multiple_rings_get_the_double_map() {
        // 512 * 8 = 4096 bytes, a whole page on every mainstream kernel.
        let storage = MappedStorage::<u64>::new(512).unwrap();
        assert!(storage.is_double_mapped());
    }

    #[test]
    fn small_rings_fall_back_to_heap() {
        // 8 bytes is never a page multiple.
        let storage = MappedStorage::<u8>::new(8).unwrap();
        assert!(!storage.is_double_mapped());
    }

    #[test]
    fn zero_sized_elements_fall_back_to_heap() {
        let storage = MappedStorage::<()>::new(8).unwrap();
        assert!(!storage.is_double_mapped());
    }

    // ============================================================================
    // Aliasing
    // ============================================================================

    #[cfg(target_os = "linux")]
    #[test]
    fn second_mapping_aliases_the_first() {
        let storage = MappedStorage::<u64>::new(512).unwrap();
        assert!(storage.is_double_mapped());

        unsafe {
            // A linear write across the seam must land at the ring's front.
            storage.write_wrapping(510, &[1, 2, 3, 4]);

            assert_eq!(storage.read(510), 1);
            assert_eq!(storage.read(511), 2);
            assert_eq!(storage.read(0), 3);
            assert_eq!(storage.read(1), 4);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linear_read_crosses_the_seam() {
        let storage = MappedStorage::<u64>::new(512).unwrap();

        unsafe {
            storage.write_wrapping(509, &[7, 8, 9, 10, 11]);

            let mut out = [0u64; 5];
            storage.read_wrapping(509, &mut out);
            assert_eq!(out, [7, 8, 9, 10, 11]);
        }
    }

    // ============================================================================
    // Queue Surface
    // ============================================================================

    #[test]
    fn factory_round_trips() {
        let (mut tx, mut rx) = queue::<u64>(512).unwrap();

        tx.try_enqueue(42).unwrap();
        assert_eq!(rx.try_dequeue(), Some(42));
        assert_eq!(rx.try_dequeue(), None);
    }

    #[test]
    fn bulk_wraps_without_splitting_order() {
        let (mut tx, mut rx) = queue::<u64>(512).unwrap();

        // Walk the indices through several laps so every slice crosses the
        // seam eventually.
        let chunk: Vec<u64> = (0..100).collect();
        let mut out = vec![0u64; 100];
        for lap in 0..50u64 {
            let sent: Vec<u64> = chunk.iter().map(|v| v + lap * 1000).collect();
            assert_eq!(tx.try_enqueue_slice(&sent), 100);
            assert_eq!(rx.try_dequeue_slice(&mut out), 100);
            assert_eq!(out, sent);
        }
    }

    #[test]
    fn error_type_is_displayable() {
        let err = MapError::oversized();
        let text = err.to_string();
        assert!(text.contains("failed"));
    }
}
