//! Byte units and alignment arithmetic
//!
//! Partition offsets and lengths are carried in bytes throughout the crate.
//! These helpers keep the 1 MiB boundary checks readable.

pub const fn kibibytes(n: u64) -> u64 {
    n * 1024
}

pub const fn mebibytes(n: u64) -> u64 {
    kibibytes(n) * 1024
}

pub const fn gibibytes(n: u64) -> u64 {
    mebibytes(n) * 1024
}

pub const fn tebibytes(n: u64) -> u64 {
    gibibytes(n) * 1024
}

/// Round `value` up to the next multiple of `alignment`
///
/// Values that are already aligned are returned unchanged. `None` for a
/// zero alignment or when the rounded value does not fit in a `u64`.
pub const fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 {
        return None;
    }
    match value % alignment {
        0 => Some(value),
        rem => value.checked_add(alignment - rem),
    }
}

/// A byte offset viewed against an alignment boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedOffset {
    value: u64,
    alignment: u64,
}

impl AlignedOffset {
    /// `alignment` must be non-zero.
    pub const fn new(value: u64, alignment: u64) -> Self {
        Self { value, alignment }
    }

    /// The boundary at or below the value
    pub const fn offset(&self) -> u64 {
        self.value - self.value % self.alignment
    }

    /// The boundary before [`offset`](Self::offset)
    ///
    /// Saturates at zero.
    pub const fn previous(&self) -> u64 {
        self.offset().saturating_sub(self.alignment)
    }

    /// The boundary after [`offset`](Self::offset)
    ///
    /// Saturates at `u64::MAX`.
    pub const fn next(&self) -> u64 {
        self.offset().saturating_add(self.alignment)
    }

    pub const fn is_aligned(&self) -> bool {
        self.value % self.alignment == 0
    }
}
