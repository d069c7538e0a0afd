//! The partitioning primitive
//!
//! A [`Label`] is a partition table being assembled in memory for one image:
//! start from a fresh (empty) table, add entries in sector geometry, then
//! commit the whole table to the image in one go. Nothing touches the image
//! before [`Label::commit`].

use crate::error::DiskResult;
use crate::partition::{Partition, PartitionStyle};
use crate::sectors::to_sectors;

use super::raw::RawImage;

/// How an entry is linked into the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Primary MBR entry or GPT entry
    Normal,
    /// MBR extended container
    Extended,
    /// MBR logical partition, reached through the EBR chain
    Logical,
}

/// Start and length of an entry, in sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub start: u64,
    pub length: u64,
}

impl Geometry {
    /// Sector geometry of a byte range
    ///
    /// # Errors
    ///
    /// `UnalignedSectorValue` if either bound is not a whole sector.
    pub fn from_bytes(offset: u64, length: u64) -> DiskResult<Self> {
        Ok(Self {
            start: to_sectors(offset)?,
            length: to_sectors(length)?,
        })
    }

    /// First sector past the entry
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Last sector of the entry
    pub fn last(&self) -> u64 {
        self.end().saturating_sub(1)
    }
}

/// One entry to add to a label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpec {
    pub kind: EntryKind,
    pub geometry: Geometry,
    /// Holds the system volume
    pub bootable: bool,
    /// Holds any volume at all (as opposed to a bare container or gap)
    pub has_volume: bool,
    /// GPT unique partition GUID, on-disk byte order
    pub unique_guid: Option<[u8; 16]>,
}

impl EntrySpec {
    /// Entry for a layout partition, with its style mapped onto a table kind
    pub fn from_partition(partition: &Partition) -> DiskResult<Self> {
        let kind = match partition.style() {
            PartitionStyle::Primary | PartitionStyle::Gpt => EntryKind::Normal,
            PartitionStyle::Extended => EntryKind::Extended,
            PartitionStyle::Logical => EntryKind::Logical,
        };
        Ok(Self {
            kind,
            geometry: Geometry::from_bytes(partition.offset(), partition.length())?,
            bootable: partition.is_boot_partition(),
            has_volume: partition.volume().is_some(),
            unique_guid: None,
        })
    }
}

/// A partition table under construction
pub trait Label: Sized {
    /// Start an empty table for `image`
    fn fresh(image: RawImage) -> DiskResult<Self>;

    /// Append an entry; entries are numbered in the order they are added
    fn add_partition(&mut self, entry: EntrySpec) -> DiskResult<()>;

    /// Write the table and hand the image back for any follow-up writes
    fn commit(self) -> DiskResult<RawImage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DiskError;
    use crate::units::mebibytes;
    use crate::volume::{Volume, VolumeRole};

    #[test]
    fn test_geometry_from_bytes() {
        let g = Geometry::from_bytes(mebibytes(1), mebibytes(2)).unwrap();
        assert_eq!(g, Geometry { start: 2048, length: 4096 });
        assert_eq!(g.end(), 6144);
        assert_eq!(g.last(), 6143);

        assert!(matches!(
            Geometry::from_bytes(100, 512),
            Err(DiskError::UnalignedSectorValue { bytes: 100 })
        ));
    }

    #[test]
    fn test_entry_from_partition() {
        let system = Volume::new("sys").with_role(VolumeRole::new(true, true));
        let p = Partition::new(PartitionStyle::Logical, mebibytes(2), mebibytes(1))
            .unwrap()
            .with_volume(Some(system));
        let entry = EntrySpec::from_partition(&p).unwrap();
        assert_eq!(entry.kind, EntryKind::Logical);
        assert!(entry.bootable);
        assert!(entry.has_volume);
        assert_eq!(entry.unique_guid, None);

        let ext = Partition::new(PartitionStyle::Extended, mebibytes(1), mebibytes(4)).unwrap();
        let entry = EntrySpec::from_partition(&ext).unwrap();
        assert_eq!(entry.kind, EntryKind::Extended);
        assert!(!entry.has_volume);
    }
}
