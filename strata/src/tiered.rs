//! Tiered heap front-end
//!
//! Splits one arena into a row of fixed-size pools followed by a general
//! allocator:
//!
//! ```text
//! | pool 0 | pool 1 | ... | pool n-1 | general allocator ............ |
//! ```
//!
//! Requests go to the first pool whose block size is large enough and that
//! still has a free block. Anything the pools cannot serve falls through to
//! the general allocator.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::config::{self, MAX_TIERS, TierConfig};
use crate::error::{HeapError, Result};
use crate::general::GeneralAllocator;
use crate::pool::PoolAllocator;

/// Summary of what was still allocated when a heap was torn down
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Pool blocks that were never freed, across every tier
    pub leaked_pool_blocks: usize,
    /// General allocator blocks that were never freed
    pub outstanding_general_blocks: usize,
}

impl TeardownReport {
    #[must_use]
    #[inline]
    pub const fn is_clean(&self) -> bool {
        self.leaked_pool_blocks == 0 && self.outstanding_general_blocks == 0
    }
}

/// Pools in front of a general allocator, all carved out of one arena
pub struct TieredHeap {
    /// Pool of each configured tier, `None` if it did not fit
    pools: [Option<PoolAllocator>; MAX_TIERS],
    /// Length of the tier table the heap was built from
    tier_count: usize,
    /// Whatever remains of the arena after the pools
    general: Option<GeneralAllocator>,
}

// SAFETY: The heap exclusively owns its arena, and every pointer it holds
// points into that arena.
unsafe impl Send for TieredHeap {}

impl TieredHeap {
    /// Lay out the tiers and the general allocator over `arena`
    ///
    /// Pools are placed back-to-back from the start of the arena, in table
    /// order. A tier that does not fit in what is left is skipped and the
    /// next one starts at the same position. The general allocator takes the
    /// remaining tail.
    ///
    /// # Safety
    ///
    /// - `arena` must be valid for reads and writes for `size` bytes
    /// - The memory region must not be used by other code while the heap is active
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidPointer` if `arena` is null
    /// - `HeapError::InvalidLayout` if `tiers` is rejected by [`config::validate`]
    /// - `HeapError::InvalidSize` if neither a pool nor the general allocator fits
    pub unsafe fn new(arena: *mut u8, size: usize, tiers: &[TierConfig]) -> Result<Self> {
        const NO_POOL: Option<PoolAllocator> = None;

        if arena.is_null() {
            return Err(HeapError::InvalidPointer);
        }
        config::validate(tiers)?;

        let mut pools = [NO_POOL; MAX_TIERS];
        let mut offset = 0;

        for (i, tier) in tiers.iter().enumerate() {
            // SAFETY: `offset <= size`, so the sub-region lies within the arena
            let region = unsafe { arena.add(offset) };
            let remaining = size - offset;

            // SAFETY: The sub-region is valid for `remaining` bytes and unused
            match unsafe { PoolAllocator::new(region, remaining, tier.block_size, tier.block_count) }
            {
                Ok(pool) => {
                    log::debug!(
                        "tier {}: {} x {} bytes at {:p}, {} bytes used",
                        i,
                        tier.block_count,
                        tier.block_size,
                        region,
                        pool.footprint()
                    );
                    offset += pool.footprint();
                    pools[i] = Some(pool);
                }
                Err(err) => {
                    log::warn!(
                        "tier {} ({} x {} bytes) skipped, {} bytes left: {}",
                        i,
                        tier.block_count,
                        tier.block_size,
                        remaining,
                        err
                    );
                }
            }
        }

        // SAFETY: Same as above for the tail of the arena
        let tail = unsafe { arena.add(offset) };
        let general = match unsafe { GeneralAllocator::new(tail, size - offset) } {
            Ok(general) => {
                log::debug!(
                    "general allocator at {:p}, {} bytes",
                    tail,
                    general.capacity()
                );
                Some(general)
            }
            Err(err) => {
                log::warn!(
                    "no general allocator, {} bytes left: {}",
                    size - offset,
                    err
                );
                None
            }
        };

        if general.is_none() && pools.iter().all(Option::is_none) {
            return Err(HeapError::InvalidSize);
        }

        Ok(Self {
            pools,
            tier_count: tiers.len(),
            general,
        })
    }

    /// Allocate at least `size` bytes
    ///
    /// The returned block is only guaranteed to be aligned to `GRANULE`,
    /// use [`allocate_layout`](Self::allocate_layout) for stricter needs.
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidSize` if `size` is zero
    /// - `HeapError::OutOfMemory` if no tier can serve the request
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, 0)
    }

    /// Allocate memory with the given layout
    ///
    /// Pools are only used when their blocks satisfy `layout.align()`.
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidSize` if the requested size is zero
    /// - `HeapError::OutOfMemory` if no tier can serve the request
    pub fn allocate_layout(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        self.allocate_aligned(layout.size(), layout.align())
    }

    /// Allocate room for `count` elements of `elem_size` bytes each
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidSize` if the total size is zero or overflows
    /// - `HeapError::OutOfMemory` if no tier can serve the request
    pub fn allocate_array(&mut self, count: usize, elem_size: usize) -> Result<NonNull<u8>> {
        let size = count
            .checked_mul(elem_size)
            .ok_or(HeapError::InvalidSize)?;
        self.allocate(size)
    }

    fn allocate_aligned(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(HeapError::InvalidSize);
        }

        let eligible = self
            .pools
            .iter_mut()
            .flatten()
            .filter(|pool| pool.block_size() >= size && pool.block_align() >= alignment);
        for pool in eligible {
            if let Ok(ptr) = pool.allocate() {
                return Ok(ptr);
            }
        }

        self.general
            .as_mut()
            .ok_or(HeapError::OutOfMemory)?
            .allocate(size, alignment)
    }

    /// Return `ptr` to whichever tier owns it
    ///
    /// Nothing is changed on failure.
    ///
    /// # Errors
    ///
    /// - `HeapError::DoubleFree` if `ptr` is a pool block that is already free
    /// - `HeapError::InvalidPointer` if no tier owns `ptr`
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        for pool in self.pools.iter_mut().flatten() {
            match pool.free(ptr) {
                Err(HeapError::InvalidPointer) => {}
                result => return result,
            }
        }

        self.general
            .as_mut()
            .ok_or(HeapError::InvalidPointer)?
            .free(ptr)
    }

    /// Merge adjacent free blocks of the general allocator
    ///
    /// Returns the number of merges. Pools never fragment.
    pub fn collect(&mut self) -> usize {
        self.general.as_mut().map_or(0, GeneralAllocator::collect)
    }

    /// Pool of tier `index`, if it was laid out
    #[must_use]
    pub fn pool(&self, index: usize) -> Option<&PoolAllocator> {
        self.pools.get(index)?.as_ref()
    }

    #[must_use]
    #[inline]
    pub const fn general(&self) -> Option<&GeneralAllocator> {
        self.general.as_ref()
    }

    /// Number of tiers the heap was configured with, skipped ones included
    #[must_use]
    #[inline]
    pub const fn tier_count(&self) -> usize {
        self.tier_count
    }

    /// Free bytes across every pool and the general allocator
    #[must_use]
    pub fn total_free_memory(&self) -> usize {
        let pooled: usize = self
            .pools
            .iter()
            .flatten()
            .map(|pool| pool.free_block_count() * pool.block_size())
            .sum();
        pooled + self.general.as_ref().map_or(0, GeneralAllocator::total_free_memory)
    }

    /// Largest request `allocate` is currently guaranteed to serve
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        let pooled = self
            .pools
            .iter()
            .flatten()
            .filter(|pool| pool.free_block_count() > 0)
            .map(PoolAllocator::block_size)
            .max()
            .unwrap_or(0);
        let general = self
            .general
            .as_ref()
            .map_or(0, GeneralAllocator::largest_free_block);
        pooled.max(general)
    }

    /// Check if `ptr` is an outstanding allocation of any tier
    #[must_use]
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        self.pools
            .iter()
            .flatten()
            .any(|pool| pool.is_allocated(ptr))
            || self
                .general
                .as_ref()
                .is_some_and(|general| general.is_allocated(ptr))
    }

    /// Tear every tier down
    ///
    /// Outstanding blocks are logged and counted, but the arena itself is left
    /// to the caller.
    pub fn teardown(self) -> TeardownReport {
        let leaked_pool_blocks = self
            .pools
            .into_iter()
            .flatten()
            .map(PoolAllocator::destroy)
            .sum();
        let outstanding_general_blocks = self.general.map_or(0, GeneralAllocator::destroy);

        let report = TeardownReport {
            leaked_pool_blocks,
            outstanding_general_blocks,
        };
        log::info!(
            "heap torn down: {} pool blocks leaked, {} general blocks outstanding",
            report.leaked_pool_blocks,
            report.outstanding_general_blocks
        );
        report
    }
}
