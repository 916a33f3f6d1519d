//! Pool allocator implementation
//!
//! A pool hands out blocks of a single, fixed size. Its region of the arena is
//! laid out as:
//!
//! ```text
//! | bitmap words | padding | block 0 | block 1 | ... | block n-1 |
//! ```
//!
//! Block state lives in a [`Bitmap`] (set = free), which gives O(1) amortized
//! allocation through a word-skipping bit scan and O(1) deallocation through
//! address arithmetic.

use core::ptr::NonNull;

use crate::{
    bitmap::Bitmap,
    error::{HeapError, Result},
    utils::{align_down, align_up, largest_pow2_divisor},
};

/// Alignment of the first block of every pool
pub const POOL_BLOCK_ALIGN: usize = 16;

/// Fixed-block-size allocator over a sub-region of the arena
pub struct PoolAllocator {
    /// Size of each block
    block_size: usize,
    /// Total number of blocks
    block_count: usize,
    /// Number of free blocks
    free_count: usize,
    /// Start of the region handed to `new`
    region_start: NonNull<u8>,
    /// First block
    blocks: NonNull<u8>,
    /// Occupancy of each block
    bitmap: Bitmap,
}

impl PoolAllocator {
    /// Create a new pool over `region`
    ///
    /// # Safety
    ///
    /// - `region` must be valid for reads and writes for `capacity` bytes
    /// - The memory region must not be used by other code while the pool is active
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidPointer` if `region` is null
    /// - `HeapError::InvalidSize` if `block_size` or `block_count` is zero
    /// - `HeapError::OutOfMemory` if the bitmap and blocks do not fit in `capacity` bytes
    pub unsafe fn new(
        region: *mut u8,
        capacity: usize,
        block_size: usize,
        block_count: usize,
    ) -> Result<Self> {
        let region_start = NonNull::new(region).ok_or(HeapError::InvalidPointer)?;
        if block_size == 0 || block_count == 0 {
            return Err(HeapError::InvalidSize);
        }

        let addr = region.addr();
        let bitmap_addr = align_up(addr, align_of::<usize>());
        let blocks_addr = bitmap_addr
            .checked_add(Bitmap::footprint(block_count) + POOL_BLOCK_ALIGN - 1)
            .map(|unaligned| align_down(unaligned, POOL_BLOCK_ALIGN))
            .ok_or(HeapError::OutOfMemory)?;
        let end_addr = block_size
            .checked_mul(block_count)
            .and_then(|storage| blocks_addr.checked_add(storage))
            .ok_or(HeapError::OutOfMemory)?;

        if end_addr - addr > capacity {
            return Err(HeapError::OutOfMemory);
        }

        // SAFETY: Both addresses are at or after the non-null region start
        let (bitmap_ptr, blocks) = unsafe {
            #[allow(clippy::cast_ptr_alignment)]
            let bitmap_ptr = region.with_addr(bitmap_addr).cast::<usize>();
            (
                NonNull::new_unchecked(bitmap_ptr),
                NonNull::new_unchecked(region.with_addr(blocks_addr)),
            )
        };
        // SAFETY: The bitmap words lie within the caller's region and are aligned for `usize`
        let bitmap = unsafe { Bitmap::new(bitmap_ptr, block_count, true) };

        Ok(Self {
            block_size,
            block_count,
            free_count: block_count,
            region_start,
            blocks,
            bitmap,
        })
    }

    /// Allocate one block
    ///
    /// # Errors
    ///
    /// - `HeapError::OutOfMemory` if every block is allocated
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        if self.free_count == 0 {
            return Err(HeapError::OutOfMemory);
        }

        let idx = self.bitmap.find_first_set().ok_or(HeapError::OutOfMemory)?;
        self.bitmap.clear(idx);
        self.free_count -= 1;

        Ok(self.block_at(idx))
    }

    /// Return a block to the pool
    ///
    /// Nothing is changed on failure.
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidPointer` if `ptr` is not the start of one of this pool's blocks
    /// - `HeapError::DoubleFree` if the block is already free
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let idx = self
            .index_of(ptr.as_ptr())
            .ok_or(HeapError::InvalidPointer)?;

        if self.free_count == self.block_count || self.bitmap.is_set(idx) {
            return Err(HeapError::DoubleFree);
        }

        self.bitmap.set(idx);
        self.free_count += 1;

        Ok(())
    }

    /// Check if `ptr` is the start of one of this pool's blocks
    #[must_use]
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.index_of(ptr).is_some()
    }

    /// Check if `ptr` is the start of one of this pool's blocks and is allocated
    #[must_use]
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        self.index_of(ptr)
            .is_some_and(|idx| self.bitmap.is_clear(idx))
    }

    fn index_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = ptr.addr().checked_sub(self.blocks.addr().get())?;
        if !offset.is_multiple_of(self.block_size) {
            return None;
        }
        let idx = offset / self.block_size;
        (idx < self.block_count).then_some(idx)
    }

    #[inline]
    fn block_at(&self, idx: usize) -> NonNull<u8> {
        debug_assert!(idx < self.block_count);
        // SAFETY: `idx` is in bounds, so the block lies within the pool's region
        unsafe { self.blocks.add(idx * self.block_size) }
    }

    #[must_use]
    #[inline]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    #[inline]
    pub const fn block_count(&self) -> usize {
        self.block_count
    }

    #[must_use]
    #[inline]
    pub const fn free_block_count(&self) -> usize {
        self.free_count
    }

    /// Largest alignment every block of the pool satisfies
    #[must_use]
    #[inline]
    pub fn block_align(&self) -> usize {
        largest_pow2_divisor(self.blocks.addr().get() | self.block_size)
    }

    /// Bytes used from the start of the region, including alignment padding
    #[must_use]
    #[inline]
    pub fn footprint(&self) -> usize {
        self.end().addr() - self.region_start.addr().get()
    }

    /// First byte after the last block
    #[must_use]
    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.blocks
            .as_ptr()
            .wrapping_add(self.block_size * self.block_count)
    }

    /// Iterate over the blocks that are still allocated
    pub fn outstanding(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.bitmap.iter_clear().map(|idx| self.block_at(idx))
    }

    /// Tear the pool down, logging every block that was never freed
    ///
    /// Leaked blocks are not reclaimed. Returns the number of leaks.
    pub fn destroy(self) -> usize {
        if self.bitmap.all_set() {
            return 0;
        }

        let mut leaks = 0;
        for block in self.outstanding() {
            log::warn!(
                "{}-byte pool: leaked block at {:p}",
                self.block_size,
                block
            );
            leaks += 1;
        }
        leaks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::AlignedBuffer;

    extern crate alloc;
    use alloc::vec::Vec;

    fn pool_over(buffer: &AlignedBuffer, block_size: usize, block_count: usize) -> PoolAllocator {
        unsafe { PoolAllocator::new(buffer.as_mut_ptr(), buffer.len(), block_size, block_count) }
            .unwrap()
    }

    #[test]
    fn test_pool_layout() {
        let buffer = AlignedBuffer::new(4096);
        let pool = pool_over(&buffer, 16, 128);

        // Two bitmap words, then the blocks
        assert_eq!(pool.blocks.addr().get(), buffer.addr() + Bitmap::footprint(128));
        assert_eq!(pool.footprint(), Bitmap::footprint(128) + 16 * 128);
        assert_eq!(pool.free_block_count(), 128);
        assert_eq!(pool.block_align(), 16);
    }

    #[test]
    fn test_pool_too_small() {
        let buffer = AlignedBuffer::new(1024);
        let result =
            unsafe { PoolAllocator::new(buffer.as_mut_ptr(), buffer.len(), 16, 128) };
        assert!(matches!(result, Err(HeapError::OutOfMemory)));
    }

    #[test]
    fn test_pool_invalid_config() {
        let buffer = AlignedBuffer::new(1024);
        let zero_size = unsafe { PoolAllocator::new(buffer.as_mut_ptr(), buffer.len(), 0, 8) };
        let zero_count = unsafe { PoolAllocator::new(buffer.as_mut_ptr(), buffer.len(), 8, 0) };
        assert!(matches!(zero_size, Err(HeapError::InvalidSize)));
        assert!(matches!(zero_count, Err(HeapError::InvalidSize)));
    }

    #[test]
    fn test_pool_allocate_in_order() {
        let buffer = AlignedBuffer::new(4096);
        let mut pool = pool_over(&buffer, 16, 128);

        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();

        assert_eq!(first, pool.blocks);
        assert_eq!(second.as_ptr().addr() - first.as_ptr().addr(), 16);
        assert_eq!(pool.free_block_count(), 126);
    }

    #[test]
    fn test_pool_free_reuses_lowest_block() {
        let buffer = AlignedBuffer::new(4096);
        let mut pool = pool_over(&buffer, 16, 128);

        let ptrs: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();

        pool.free(ptrs[2]).unwrap();
        pool.free(ptrs[1]).unwrap();
        assert!(pool.is_allocated(ptrs[0].as_ptr()));
        assert!(!pool.is_allocated(ptrs[1].as_ptr()));
        assert!(!pool.is_allocated(ptrs[2].as_ptr()));
        assert!(pool.is_allocated(ptrs[3].as_ptr()));

        assert_eq!(pool.allocate().unwrap(), ptrs[1]);

        pool.free(ptrs[0]).unwrap();
        pool.free(ptrs[1]).unwrap();
        pool.free(ptrs[3]).unwrap();
        assert_eq!(pool.free_block_count(), 128);
        assert!(pool.bitmap.all_set());
    }

    #[test]
    fn test_pool_exhaustion() {
        let buffer = AlignedBuffer::new(1024);
        let mut pool = pool_over(&buffer, 32, 4);

        for _ in 0..4 {
            pool.allocate().unwrap();
        }
        assert!(matches!(pool.allocate(), Err(HeapError::OutOfMemory)));
        assert_eq!(pool.free_block_count(), 0);
    }

    #[test]
    fn test_pool_double_free() {
        let buffer = AlignedBuffer::new(4096);
        let mut pool = pool_over(&buffer, 16, 64);

        let keep = pool.allocate().unwrap();
        let ptr = pool.allocate().unwrap();
        pool.free(ptr).unwrap();

        assert_eq!(pool.free(ptr), Err(HeapError::DoubleFree));
        assert_eq!(pool.free_block_count(), 63);

        pool.free(keep).unwrap();
        // Fully free pool rejects everything it owns
        assert_eq!(pool.free(keep), Err(HeapError::DoubleFree));
        assert_eq!(pool.free_block_count(), 64);
    }

    #[test]
    fn test_pool_contains() {
        let buffer = AlignedBuffer::new(4096);
        let pool = pool_over(&buffer, 16, 10);

        let base = pool.blocks.as_ptr();
        assert!(pool.contains(base));
        assert!(pool.contains(base.wrapping_add(16 * 9)));
        assert!(!pool.contains(base.wrapping_add(16 * 10)));
        assert!(!pool.contains(base.wrapping_add(8)));
        assert!(!pool.contains(base.wrapping_sub(16)));
    }

    #[test]
    fn test_pool_foreign_free() {
        let buffer = AlignedBuffer::new(4096);
        let mut pool = pool_over(&buffer, 16, 10);
        pool.allocate().unwrap();

        let misaligned = unsafe { pool.blocks.add(3) };
        assert_eq!(pool.free(misaligned), Err(HeapError::InvalidPointer));
        assert_eq!(pool.free_block_count(), 9);
    }

    #[test]
    fn test_pool_destroy_reports_leaks() {
        let buffer = AlignedBuffer::new(4096);
        let mut pool = pool_over(&buffer, 16, 32);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.allocate().unwrap();
        pool.free(b).unwrap();

        let outstanding: Vec<_> = pool.outstanding().collect();
        assert_eq!(outstanding.len(), 2);
        assert_eq!(outstanding[0], a);

        assert_eq!(pool.destroy(), 2);
    }
}
