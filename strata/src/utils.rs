/// Align `addr` upwards to `align`.
///
/// Requires that `align` is a power of two.
#[inline]
pub const fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

/// Align `addr` downwards to `align`.
///
/// Requires that `align` is a power of two.
#[inline]
pub const fn align_down(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

/// Round `size` up to the next multiple of `multiple`.
///
/// Unlike [`align_up`], `multiple` does not need to be a power of two.
/// Returns `None` on overflow.
#[inline]
pub const fn round_up(size: usize, multiple: usize) -> Option<usize> {
    let rem = size % multiple;
    if rem == 0 {
        Some(size)
    } else {
        size.checked_add(multiple - rem)
    }
}

/// Largest power of two dividing `value` (`value` must be non-zero).
#[inline]
pub const fn largest_pow2_divisor(value: usize) -> usize {
    1 << value.trailing_zeros()
}
