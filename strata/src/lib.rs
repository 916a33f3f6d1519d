//! # Strata: Tiered `no_std` Heap Allocator
//!
//! Strata manages a single caller-provided arena and splits it into layers:
//!
//! - **Pool tiers**: fixed block sizes, ascending (16, 32 and 96 bytes by default)
//!   - Bitmap-tracked blocks, lowest free block first
//!   - O(1) deallocation from the block address
//!   - Double frees are detected
//!
//! - **General allocator**: everything the pools cannot serve
//!   - First-fit over an address-ordered free list
//!   - Headers live in the arena in front of each payload
//!   - Fragmentation is undone on demand with `collect`
//!
//! Nothing in the crate allocates on its own, and no global allocator is
//! installed unless a binary opts in with [`LockedTieredHeap`].
//!
//! ## Usage
//!
//! ```rust
//! use strata::{DEFAULT_TIERS, TieredHeap};
//!
//! let mut buffer = [0u8; 65536];
//!
//! let mut heap =
//!     unsafe { TieredHeap::new(buffer.as_mut_ptr(), buffer.len(), &DEFAULT_TIERS) }.unwrap();
//!
//! // Served by the 16-byte tier
//! let small = heap.allocate(10).unwrap();
//! // Too large for any tier, served by the general allocator
//! let large = heap.allocate(4000).unwrap();
//!
//! heap.free(small).unwrap();
//! heap.free(large).unwrap();
//! heap.collect();
//!
//! assert!(heap.teardown().is_clean());
//! ```
#![warn(clippy::pedantic, clippy::nursery)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![no_std]

mod bitmap;
mod config;
mod error;
mod general;
mod global;
mod pool;
mod tiered;
mod utils;

#[cfg(test)]
mod testing;

// Public exports
pub use bitmap::Bitmap;
pub use config::{DEFAULT_TIERS, MAX_TIERS, TierConfig, validate as validate_tiers};
pub use error::{HeapError, Result};
pub use general::{BlockInfo, GRANULE, GeneralAllocator, HEADER_SIZE};
pub use global::LockedTieredHeap;
pub use pool::{POOL_BLOCK_ALIGN, PoolAllocator};
pub use tiered::{TeardownReport, TieredHeap};

/// The main heap type
///
/// This is an alias to `TieredHeap` for convenience.
pub type Heap = TieredHeap;
