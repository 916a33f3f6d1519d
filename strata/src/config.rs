//! Tier configuration

use crate::error::{HeapError, Result};

/// Maximum number of pool tiers in front of the general allocator
pub const MAX_TIERS: usize = 8;

/// Size class of one pool tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierConfig {
    /// Size of every block of the tier
    pub block_size: usize,
    /// Number of blocks reserved for the tier
    pub block_count: usize,
}

impl TierConfig {
    #[must_use]
    #[inline]
    pub const fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            block_count,
        }
    }

    /// Bytes taken by the blocks alone, `None` on overflow
    #[must_use]
    #[inline]
    pub const fn storage_size(&self) -> Option<usize> {
        self.block_size.checked_mul(self.block_count)
    }
}

/// Tiers used when no explicit table is given
pub const DEFAULT_TIERS: [TierConfig; 3] = [
    TierConfig::new(16, 100),
    TierConfig::new(32, 200),
    TierConfig::new(96, 400),
];

/// Check that a tier table can be handed to the front-end
///
/// # Errors
///
/// - `HeapError::InvalidLayout` if there are more than `MAX_TIERS` tiers, if a
///   tier has a zero block size or count, or if block sizes are not strictly ascending
pub fn validate(tiers: &[TierConfig]) -> Result<()> {
    if tiers.len() > MAX_TIERS {
        return Err(HeapError::InvalidLayout);
    }
    if tiers
        .iter()
        .any(|tier| tier.block_size == 0 || tier.block_count == 0)
    {
        return Err(HeapError::InvalidLayout);
    }
    if !tiers
        .windows(2)
        .all(|pair| pair[0].block_size < pair[1].block_size)
    {
        return Err(HeapError::InvalidLayout);
    }
    Ok(())
}
