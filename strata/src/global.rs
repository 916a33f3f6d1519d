//! Lock-protected heap usable as the global allocator
//!
//! Nothing is installed implicitly. A binary opts in with:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static HEAP: strata::LockedTieredHeap = strata::LockedTieredHeap::empty();
//! ```
//!
//! and hands an arena over with [`LockedTieredHeap::init`] before the first
//! allocation. Until then every allocation fails with a null pointer.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Mutex;

use crate::config::TierConfig;
use crate::error::{HeapError, Result};
use crate::tiered::{TeardownReport, TieredHeap};

/// A [`TieredHeap`] behind a spinlock
pub struct LockedTieredHeap {
    heap: Mutex<Option<TieredHeap>>,
}

impl LockedTieredHeap {
    #[must_use]
    #[inline]
    pub const fn empty() -> Self {
        Self {
            heap: Mutex::new(None),
        }
    }

    /// Hand `arena` over to the heap
    ///
    /// The tiers are laid out before the lock is taken.
    ///
    /// # Safety
    ///
    /// - `arena` must be valid for reads and writes for `size` bytes
    /// - The memory region must not be used by other code while the heap is active
    ///
    /// # Errors
    ///
    /// - `HeapError::AlreadyInitialized` if the heap already owns an arena
    /// - Any error of [`TieredHeap::new`]
    pub unsafe fn init(&self, arena: *mut u8, size: usize, tiers: &[TierConfig]) -> Result<()> {
        if self.is_initialized() {
            return Err(HeapError::AlreadyInitialized);
        }

        // SAFETY: Forwarded from the caller
        let heap = unsafe { TieredHeap::new(arena, size, tiers) }?;

        let mut slot = self.heap.lock();
        if slot.is_some() {
            return Err(HeapError::AlreadyInitialized);
        }
        *slot = Some(heap);
        drop(slot);

        log::debug!("global heap initialized over {:p}, {} bytes", arena, size);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_some()
    }

    /// Run `f` on the heap while holding the lock
    ///
    /// Returns `None` if the heap has not been initialized.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut TieredHeap) -> R) -> Option<R> {
        self.heap.lock().as_mut().map(f)
    }

    /// Allocate memory with the given layout
    ///
    /// # Errors
    ///
    /// - `HeapError::OutOfMemory` if the heap is not initialized or exhausted
    /// - Any error of [`TieredHeap::allocate_layout`]
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        self.with_heap(|heap| heap.allocate_layout(layout))
            .unwrap_or(Err(HeapError::OutOfMemory))
    }

    /// Return `ptr` to the heap
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidPointer` if the heap is not initialized or does not own `ptr`
    /// - `HeapError::DoubleFree` if `ptr` is a pool block that is already free
    pub fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        self.with_heap(|heap| heap.free(ptr))
            .unwrap_or(Err(HeapError::InvalidPointer))
    }

    /// Merge adjacent free blocks of the general allocator
    pub fn collect(&self) -> usize {
        self.with_heap(TieredHeap::collect).unwrap_or(0)
    }

    /// Take the heap out and tear it down
    ///
    /// Returns `None` if the heap was not initialized. The heap can be
    /// initialized again afterwards.
    pub fn teardown(&self) -> Option<TeardownReport> {
        let heap = self.heap.lock().take()?;
        Some(heap.teardown())
    }
}

impl Default for LockedTieredHeap {
    fn default() -> Self {
        Self::empty()
    }
}

unsafe impl GlobalAlloc for LockedTieredHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout)
            .map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        // The lock is released by the time the result is inspected
        if let Err(err) = self.free(ptr) {
            log::warn!("dealloc of {:p} rejected: {}", ptr, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TIERS;
    use crate::testing::AlignedBuffer;

    #[test]
    fn test_uninitialized() {
        let heap = LockedTieredHeap::empty();
        let layout = Layout::from_size_align(16, 8).unwrap();

        assert!(!heap.is_initialized());
        assert_eq!(heap.allocate(layout), Err(HeapError::OutOfMemory));
        assert!(unsafe { heap.alloc(layout) }.is_null());
        assert_eq!(heap.collect(), 0);
        assert!(heap.teardown().is_none());
    }

    #[test]
    fn test_init_twice() {
        let buffer = AlignedBuffer::new(65_536);
        let other = AlignedBuffer::new(65_536);
        let heap = LockedTieredHeap::empty();

        unsafe { heap.init(buffer.as_mut_ptr(), buffer.len(), &DEFAULT_TIERS) }.unwrap();
        assert!(heap.is_initialized());

        let again = unsafe { heap.init(other.as_mut_ptr(), other.len(), &DEFAULT_TIERS) };
        assert_eq!(again, Err(HeapError::AlreadyInitialized));

        heap.teardown().unwrap();
    }

    #[test]
    fn test_global_alloc_dealloc() {
        let buffer = AlignedBuffer::new(65_536);
        let heap = LockedTieredHeap::empty();
        unsafe { heap.init(buffer.as_mut_ptr(), buffer.len(), &DEFAULT_TIERS) }.unwrap();

        let small = Layout::from_size_align(12, 4).unwrap();
        let large = Layout::from_size_align(1024, 128).unwrap();

        unsafe {
            let a = heap.alloc(small);
            let b = heap.alloc(large);
            assert!(!a.is_null());
            assert!(!b.is_null());
            assert_eq!(b.addr() % 128, 0);

            a.write_bytes(0xAA, small.size());
            b.write_bytes(0x55, large.size());
            assert_eq!(*a, 0xAA);
            assert_eq!(*b.add(1023), 0x55);

            heap.dealloc(a, small);
            heap.dealloc(b, large);
            // Rejected frees are logged, never fatal
            heap.dealloc(a, small);
            heap.dealloc(core::ptr::null_mut(), small);
        }

        let report = heap.teardown().unwrap();
        assert!(report.is_clean());
        assert!(!heap.is_initialized());
    }

    #[test]
    fn test_with_heap() {
        let buffer = AlignedBuffer::new(65_536);
        let heap = LockedTieredHeap::default();
        assert!(heap.with_heap(|heap| heap.tier_count()).is_none());

        unsafe { heap.init(buffer.as_mut_ptr(), buffer.len(), &DEFAULT_TIERS) }.unwrap();
        let ptr = heap.allocate(Layout::new::<u64>()).unwrap();

        assert_eq!(heap.with_heap(|heap| heap.is_allocated(ptr.as_ptr())), Some(true));
        heap.free(ptr).unwrap();
        assert_eq!(heap.free(ptr), Err(HeapError::DoubleFree));

        let report = heap.teardown().unwrap();
        assert!(report.is_clean());
    }
}
