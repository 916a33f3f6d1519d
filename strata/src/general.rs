//! General-purpose variable-size allocator
//!
//! Every region of the allocator starts with a [`BlockHeader`] immediately
//! followed by its payload:
//!
//! ```text
//! | header | payload ........ | header | payload .. | header | payload ...... |
//! ```
//!
//! Headers are threaded on two intrusive doubly-linked lists stored in the
//! managed memory itself:
//!
//! - the free list, strictly ascending by address,
//! - the allocated list, in no particular order.
//!
//! Allocation is first-fit over the free list and carves the request off the
//! front of the chosen block. Freed blocks are put back in address order but
//! are not merged until [`GeneralAllocator::collect`] runs.

use core::ptr::NonNull;

use crate::{
    error::{HeapError, Result},
    utils::{align_down, align_up, round_up},
};

/// Metadata placed in front of every payload
#[repr(C)]
struct BlockHeader {
    /// Start of the payload, always `header + HEADER_SIZE`
    payload: *mut u8,
    /// Payload size in bytes, header excluded
    size: usize,
    next: Link,
    prev: Link,
}

type Link = Option<NonNull<BlockHeader>>;

/// Size of the header in front of every payload
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Every payload size is a multiple of this, so that headers stay aligned
pub const GRANULE: usize = align_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE.is_multiple_of(GRANULE));

/// Public view of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block header
    pub header: NonNull<u8>,
    /// Address handed to the caller
    pub payload: NonNull<u8>,
    /// Payload size in bytes
    pub size: usize,
}

/// Write a fresh, unlinked header at `at`.
///
/// # Safety
///
/// - `at` must be aligned to `GRANULE` and valid for `HEADER_SIZE + size` bytes
/// - No live header may overlap `[at, at + HEADER_SIZE)` unless it has been unlinked
unsafe fn write_header(at: NonNull<u8>, size: usize) -> NonNull<BlockHeader> {
    #[allow(clippy::cast_ptr_alignment)]
    let header = at.cast::<BlockHeader>();
    // SAFETY: Caller guarantees the memory is valid and aligned
    unsafe {
        header.write(BlockHeader {
            payload: at.as_ptr().add(HEADER_SIZE),
            size,
            next: None,
            prev: None,
        });
    }
    header
}

/// Variable-size allocator with explicit coalescing
pub struct GeneralAllocator {
    /// First header, aligned to `GRANULE`
    start: NonNull<u8>,
    /// Managed bytes from `start`, headers included
    capacity: usize,
    /// Lowest-addressed free block
    free_list: Link,
    /// Most recently allocated block
    alloc_list: Link,
}

impl GeneralAllocator {
    /// Create a new general allocator over `region`
    ///
    /// The whole region becomes a single free block.
    ///
    /// # Safety
    ///
    /// - `region` must be valid for reads and writes for `size` bytes
    /// - The memory region must not be used by other code while the allocator is active
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidPointer` if `region` is null
    /// - `HeapError::InvalidSize` if the region cannot hold a header and a minimal payload
    pub unsafe fn new(region: *mut u8, size: usize) -> Result<Self> {
        if region.is_null() {
            return Err(HeapError::InvalidPointer);
        }

        let addr = region.addr();
        let aligned_addr = align_up(addr, GRANULE);
        let capacity = size
            .checked_sub(aligned_addr - addr)
            .map(|usable| align_down(usable, GRANULE))
            .ok_or(HeapError::InvalidSize)?;

        if capacity < HEADER_SIZE + GRANULE {
            return Err(HeapError::InvalidSize);
        }

        // SAFETY: `aligned_addr` is at or after the non-null region start
        let start = unsafe { NonNull::new_unchecked(region.with_addr(aligned_addr)) };
        // SAFETY: The region is valid for `capacity` bytes from `start`
        let first = unsafe { write_header(start, capacity - HEADER_SIZE) };

        Ok(Self {
            start,
            capacity,
            free_list: Some(first),
            alloc_list: None,
        })
    }

    /// Allocate `size` bytes whose address is a multiple of `alignment`
    ///
    /// An `alignment` of zero means no requirement beyond `GRANULE`.
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidSize` if `size` is zero
    /// - `HeapError::InvalidAlignment` if `alignment` is neither zero nor a power of two
    /// - `HeapError::OutOfMemory` if no free block can hold the request
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(HeapError::InvalidSize);
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(HeapError::InvalidAlignment);
        }

        let size = if alignment == 0 {
            Some(size)
        } else {
            round_up(size, alignment)
        }
        .and_then(|size| round_up(size, GRANULE))
        .ok_or(HeapError::OutOfMemory)?;
        let needed = size.checked_add(HEADER_SIZE).ok_or(HeapError::OutOfMemory)?;

        let mut current = self.free_list;
        let block = loop {
            let Some(block) = current else {
                return Err(HeapError::OutOfMemory);
            };
            // SAFETY: Block is in our free list
            let (payload, block_size, next) = unsafe {
                let header = block.as_ptr();
                ((*header).payload, (*header).size, (*header).next)
            };

            if block_size >= needed {
                if alignment == 0 || payload.addr().is_multiple_of(alignment) {
                    break block;
                }
                // SAFETY: Block is in our free list and holds at least `needed` bytes
                if let Some(aligned) = unsafe { self.carve_padding(block, size, alignment) } {
                    break aligned;
                }
            }

            current = next;
        };

        // SAFETY: `block` is a free block of at least `size + HEADER_SIZE` bytes.
        // The remainder takes its place in the free list and the front is reused
        // for the allocated header.
        unsafe {
            self.shrink_block(block, needed);
            let allocated = write_header(block.cast(), size);
            self.push_allocated(allocated);
            Ok(NonNull::new_unchecked((*allocated.as_ptr()).payload))
        }
    }

    /// Split a filler block off the front of `block` so that the next header's
    /// payload is aligned to `alignment`.
    ///
    /// Returns the aligned remainder, or `None` (leaving `block` untouched) if
    /// it cannot hold the filler plus `size` bytes.
    ///
    /// # Safety
    ///
    /// - `block` must be in the free list
    unsafe fn carve_padding(
        &mut self,
        block: NonNull<BlockHeader>,
        size: usize,
        alignment: usize,
    ) -> Option<NonNull<BlockHeader>> {
        // SAFETY: Caller guarantees block is in our free list
        let (payload, block_size) =
            unsafe { ((*block.as_ptr()).payload.addr(), (*block.as_ptr()).size) };

        // The filler keeps the existing header, the aligned block starts right after it
        let padding = match (payload + HEADER_SIZE) % alignment {
            0 => alignment,
            rem => alignment - rem,
        };
        // A padding that is not a whole number of granules would misalign the next header
        if !padding.is_multiple_of(GRANULE) {
            return None;
        }

        let required = size
            .checked_add(2 * HEADER_SIZE)
            .and_then(|required| required.checked_add(padding))?;
        if block_size < required {
            return None;
        }

        // SAFETY: `block` holds `HEADER_SIZE + padding` bytes plus the remainder
        unsafe {
            let aligned = self.shrink_block(block, HEADER_SIZE + padding);
            let filler = write_header(block.cast(), padding);
            self.insert_free(filler);
            Some(aligned)
        }
    }

    /// Move the header of `block` forward by `shrink_by` bytes, keeping its list position
    ///
    /// The new header covers the tail of the original block. The first
    /// `shrink_by` bytes are left unlinked for the caller to reuse.
    ///
    /// # Safety
    ///
    /// - `block` must be in the free list or the allocated list
    /// - `shrink_by` must be a multiple of `GRANULE` no larger than the block's size
    unsafe fn shrink_block(
        &mut self,
        block: NonNull<BlockHeader>,
        shrink_by: usize,
    ) -> NonNull<BlockHeader> {
        debug_assert!(shrink_by.is_multiple_of(GRANULE));

        // SAFETY: Caller guarantees block is a valid, linked header
        let (payload, size, next, prev) = unsafe {
            let header = block.as_ptr();
            ((*header).payload, (*header).size, (*header).next, (*header).prev)
        };
        debug_assert!(shrink_by <= size);

        // SAFETY: The new header lies within the original block. The old fields
        // have been read out, so overwriting them is fine.
        unsafe {
            #[allow(clippy::cast_ptr_alignment)]
            let shrunk = block.cast::<u8>().add(shrink_by).cast::<BlockHeader>();
            shrunk.write(BlockHeader {
                payload: payload.add(shrink_by),
                size: size - shrink_by,
                next,
                prev,
            });

            match prev {
                Some(prev) => (*prev.as_ptr()).next = Some(shrunk),
                None if self.free_list == Some(block) => self.free_list = Some(shrunk),
                None => self.alloc_list = Some(shrunk),
            }
            if let Some(next) = next {
                (*next.as_ptr()).prev = Some(shrunk);
            }

            shrunk
        }
    }

    /// Release the block whose payload starts at `ptr`
    ///
    /// The block goes back to the free list in address order. Adjacent free
    /// blocks are only merged by [`collect`](Self::collect).
    ///
    /// # Errors
    ///
    /// - `HeapError::InvalidPointer` if `ptr` is not an outstanding allocation
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let block = Self::find(self.alloc_list, ptr.as_ptr()).ok_or(HeapError::InvalidPointer)?;

        // SAFETY: `block` was just found in the allocated list
        unsafe {
            Self::unlink(&mut self.alloc_list, block);
            self.insert_free(block);
        }

        Ok(())
    }

    /// Merge every pair of address-adjacent free blocks
    ///
    /// Returns the number of merges performed. Running it twice in a row is a no-op
    /// the second time.
    pub fn collect(&mut self) -> usize {
        let mut merges = 0;
        let mut current = self.free_list;

        while let Some(block) = current {
            // SAFETY: Both headers are in our free list, which is sorted by address
            unsafe {
                let header = block.as_ptr();
                let Some(next) = (*header).next else {
                    break;
                };

                let end = (*header).payload.addr() + (*header).size;
                if end == next.as_ptr().addr() {
                    (*header).size += HEADER_SIZE + (*next.as_ptr()).size;
                    let after = (*next.as_ptr()).next;
                    (*header).next = after;
                    if let Some(after) = after {
                        (*after.as_ptr()).prev = Some(block);
                    }
                    merges += 1;
                } else {
                    current = Some(next);
                }
            }
        }

        merges
    }

    /// Check if `ptr` is the payload of any block, free or allocated
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        Self::find(self.alloc_list, ptr).is_some() || Self::find(self.free_list, ptr).is_some()
    }

    /// Check if `ptr` is the payload of an outstanding allocation
    #[must_use]
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        Self::find(self.alloc_list, ptr).is_some()
    }

    /// Size of the largest free payload
    #[must_use]
    pub fn largest_free_block(&self) -> usize {
        self.free_blocks().map(|block| block.size).max().unwrap_or(0)
    }

    /// Sum of all free payloads, headers excluded
    #[must_use]
    pub fn total_free_memory(&self) -> usize {
        self.free_blocks().map(|block| block.size).sum()
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.free_blocks().count()
    }

    #[must_use]
    pub fn allocated_block_count(&self) -> usize {
        self.allocations().count()
    }

    /// Sum of all outstanding payloads, after rounding
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.allocations().map(|block| block.size).sum()
    }

    /// Bytes managed by the allocator, headers included
    #[must_use]
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free blocks in ascending address order
    pub fn free_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        Self::iter(self.free_list)
    }

    /// Outstanding allocations, most recent first
    pub fn allocations(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        Self::iter(self.alloc_list)
    }

    pub fn log_free_blocks(&self) {
        log::debug!("free blocks of general allocator at {:p}:", self.start);
        for block in self.free_blocks() {
            log::debug!(
                "  header {:p}, payload {:p}, {} bytes",
                block.header,
                block.payload,
                block.size
            );
        }
    }

    pub fn log_outstanding_allocations(&self) {
        log::debug!("outstanding allocations of general allocator at {:p}:", self.start);
        for block in self.allocations() {
            log::debug!(
                "  header {:p}, payload {:p}, {} bytes",
                block.header,
                block.payload,
                block.size
            );
        }
    }

    /// Tear the allocator down, unlinking every header
    ///
    /// Nothing is released since the region is owned by the caller.
    /// Returns the number of allocations that were never freed.
    pub fn destroy(mut self) -> usize {
        let outstanding = self.allocated_block_count();
        if outstanding > 0 {
            log::warn!(
                "general allocator at {:p}: {} allocations ({} bytes) never freed",
                self.start,
                outstanding,
                self.allocated_bytes()
            );
            self.log_outstanding_allocations();
        }

        for head in [self.free_list.take(), self.alloc_list.take()] {
            let mut current = head;
            while let Some(block) = current {
                // SAFETY: Headers stay valid until the region is handed back
                unsafe {
                    current = (*block.as_ptr()).next;
                    (*block.as_ptr()).next = None;
                    (*block.as_ptr()).prev = None;
                }
            }
        }

        outstanding
    }

    fn iter(head: Link) -> impl Iterator<Item = BlockInfo> {
        core::iter::successors(head, |block| {
            // SAFETY: Every linked header is valid while the allocator is borrowed
            unsafe { (*block.as_ptr()).next }
        })
        .map(|block| {
            // SAFETY: Same as above, and payloads are never null
            unsafe {
                let header = block.as_ptr();
                BlockInfo {
                    header: block.cast(),
                    payload: NonNull::new_unchecked((*header).payload),
                    size: (*header).size,
                }
            }
        })
    }

    fn find(head: Link, ptr: *const u8) -> Link {
        Self::iter(head)
            .find(|block| block.payload.as_ptr().cast_const() == ptr)
            .map(|block| block.header.cast())
    }

    /// Remove `block` from the list starting at `head`
    ///
    /// # Safety
    ///
    /// - `block` must be in the list starting at `head`
    unsafe fn unlink(head: &mut Link, block: NonNull<BlockHeader>) {
        // SAFETY: Caller guarantees block and its neighbours are in the list
        unsafe {
            let prev = (*block.as_ptr()).prev;
            let next = (*block.as_ptr()).next;

            match prev {
                Some(prev) => (*prev.as_ptr()).next = next,
                None => *head = next,
            }
            if let Some(next) = next {
                (*next.as_ptr()).prev = prev;
            }

            (*block.as_ptr()).next = None;
            (*block.as_ptr()).prev = None;
        }
    }

    /// Insert `block` in the free list, keeping it sorted by address
    ///
    /// # Safety
    ///
    /// - `block` must be a valid header that is not in any list
    unsafe fn insert_free(&mut self, block: NonNull<BlockHeader>) {
        let mut prev: Link = None;
        let mut current = self.free_list;

        // SAFETY: Caller guarantees block is valid, the others are in our free list
        unsafe {
            let addr = (*block.as_ptr()).payload.addr();
            while let Some(node) = current {
                if addr < (*node.as_ptr()).payload.addr() {
                    break;
                }
                prev = current;
                current = (*node.as_ptr()).next;
            }

            (*block.as_ptr()).prev = prev;
            (*block.as_ptr()).next = current;

            match prev {
                Some(prev) => (*prev.as_ptr()).next = Some(block),
                None => self.free_list = Some(block),
            }
            if let Some(next) = current {
                (*next.as_ptr()).prev = Some(block);
            }
        }
    }

    /// Push `block` at the front of the allocated list
    ///
    /// # Safety
    ///
    /// - `block` must be a valid header that is not in any list
    unsafe fn push_allocated(&mut self, block: NonNull<BlockHeader>) {
        // SAFETY: Caller guarantees block is valid, the head is in our allocated list
        unsafe {
            (*block.as_ptr()).prev = None;
            (*block.as_ptr()).next = self.alloc_list;
            if let Some(head) = self.alloc_list {
                (*head.as_ptr()).prev = Some(block);
            }
        }
        self.alloc_list = Some(block);
    }
}
