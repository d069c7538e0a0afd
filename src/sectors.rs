//! Sector / byte conversions
//!
//! Partition tables address the disk in 512-byte sectors. The layout model
//! works in bytes, so every value crossing into a table must be a whole
//! number of sectors; anything else is refused rather than rounded.

use crate::error::{DiskError, DiskResult};

/// Logical sector size assumed for every label written by this crate
pub const SECTOR_SIZE: u64 = 512;

/// Convert a byte count into sectors
///
/// # Errors
///
/// Returns `DiskError::UnalignedSectorValue` if `bytes` is not a multiple
/// of [`SECTOR_SIZE`].
pub fn to_sectors(bytes: u64) -> DiskResult<u64> {
    if !is_sector_aligned(bytes) {
        return Err(DiskError::UnalignedSectorValue { bytes });
    }
    Ok(bytes / SECTOR_SIZE)
}

pub const fn sector_bytes(sectors: u64) -> u64 {
    sectors * SECTOR_SIZE
}

/// [`sector_bytes`] for sector numbers read from untrusted labels
pub const fn checked_sector_bytes(sectors: u64) -> Option<u64> {
    sectors.checked_mul(SECTOR_SIZE)
}

pub const fn is_sector_aligned(offset: u64) -> bool {
    offset % SECTOR_SIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_sectors() {
        assert_eq!(to_sectors(0).unwrap(), 0);
        assert_eq!(to_sectors(1024 * 1024).unwrap(), 2048);
        assert!(matches!(
            to_sectors(513),
            Err(DiskError::UnalignedSectorValue { bytes: 513 })
        ));
    }

    #[test]
    fn test_sector_bytes() {
        assert_eq!(sector_bytes(33), 16896);
        assert!(is_sector_aligned(sector_bytes(7)));
        assert_eq!(checked_sector_bytes(2048), Some(1 << 20));
        assert_eq!(checked_sector_bytes(u64::MAX / 4), None);
        assert!(!is_sector_aligned(100));
    }
}
