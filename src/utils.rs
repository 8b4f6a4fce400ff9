pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SIZE_64K: u64 = 64 * 1024;
pub const MEGABYTE: u64 = 1024 * 1024;

/// Rounds `value` up to the next multiple of `alignment`.
///
/// `alignment` does not need to be a power of two; zero leaves the value untouched.
#[must_use]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Like [`align_up`], but `None` when the rounded value does not fit in a `u64`.
#[must_use]
pub const fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return Some(value);
    }
    value.div_ceil(alignment).checked_mul(alignment)
}

#[must_use]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value - value % alignment
}

#[must_use]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    alignment == 0 || value % alignment == 0
}
