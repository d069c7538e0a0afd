//! Partition table codec
//!
//! Writes a [`Disk`] layout onto an image file or block device as an MBR or
//! GPT partition table, and reads identities back from fixed byte offsets.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  format / format_mbr / format_gpt                     │
//! │  (guards: identity sizes, sector alignment, length)   │
//! ├──────────────────────────────────────────────────────┤
//! │  Label: fresh → add_partition → commit                │
//! │  ├── MbrLabel (boot sector + EBR chain)               │
//! │  └── GptLabel (gpt_disk_io headers, arrays, CRCs)     │
//! ├──────────────────────────────────────────────────────┤
//! │  RawImage (positioned I/O on the target path)         │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Write Ordering
//!
//! Every check that can fail on the input (identity length, sector
//! alignment, image size, geometry) runs before the first byte is written,
//! so a malformed layout never leaves a half-written table behind.
//!
//! # Identity Fields
//!
//! | Field                      | Offset                              | Size |
//! |----------------------------|-------------------------------------|------|
//! | MBR disk signature         | `0x1B8`                             | 4    |
//! | GPT unique partition GUID  | `0x400 + (n - 1) * 0x80 + 0x10`     | 16   |
//!
//! The identity readers go straight to these bytes without parsing the
//! table, so they also work on tables built by other tools.
//!
//! # Concurrency
//!
//! Nothing here locks the target. Callers must hold exclusive access to a
//! path for the duration of a format or identity write.

mod gpt;
mod label;
mod mbr;
mod probe;
pub mod raw;

pub use gpt::{GptLabel, DEFAULT_DISK_GUID, GPT_ENTRY_COUNT};
pub use label::{EntryKind, EntrySpec, Geometry, Label};
pub use mbr::MbrLabel;
pub use probe::{probe, ProbedLabel, ProbedPartition};
pub use raw::RawImage;

use std::path::Path;

use crate::disk::{Disk, LabelKind};
use crate::error::{DiskError, DiskResult};
use crate::identity::{Flavor, Identity};
use crate::partition::PartitionStyle;
use crate::sectors::SECTOR_SIZE;

/// Offset of the 4-byte MBR disk signature
pub const MBR_DISK_ID_OFFSET: u64 = 0x1B8;
pub const MBR_DISK_ID_LENGTH: usize = 4;

/// Offset of the first 16-byte MBR partition entry
pub const MBR_PARTITION_TABLE_OFFSET: u64 = 0x1BE;
pub const MBR_PARTITION_ENTRY_LENGTH: usize = 16;

pub const BOOT_SIGNATURE_OFFSET: usize = 510;
pub const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Start of the primary GPT entry array (sector 2)
pub const GPT_PARTITION_TABLE_OFFSET: u64 = 2 * SECTOR_SIZE;
pub const GPT_PARTITION_ENTRY_LENGTH: u64 = 0x80;
/// Offset of the unique partition GUID within a GPT entry
pub const GPT_PARTITION_ID_OFFSET: u64 = 0x10;
pub const GPT_PARTITION_ID_LENGTH: usize = 16;

/// Write `disk` with the table type its identities call for
///
/// Disks without any identity are written as MBR when they have extended or
/// logical partitions, as GPT when their partitions are GPT-style, and as
/// MBR otherwise.
pub fn format(path: impl AsRef<Path>, disk: &Disk) -> DiskResult<()> {
    match disk.label_kind() {
        LabelKind::Mbr => format_mbr(path, disk),
        LabelKind::Gpt => format_gpt(path, disk),
        LabelKind::Unspecified => {
            let has_mbr_only = !disk.logical_partitions().is_empty()
                || disk
                    .partitions()
                    .iter()
                    .any(|p| p.style() == PartitionStyle::Extended);
            let all_gpt = !disk.partitions().is_empty()
                && disk
                    .partitions()
                    .iter()
                    .all(|p| p.style() == PartitionStyle::Gpt);
            if !has_mbr_only && all_gpt {
                format_gpt(path, disk)
            } else {
                format_mbr(path, disk)
            }
        }
    }
}

/// Write `disk` as an MBR table, then stamp its disk signature
///
/// Table-level partitions take the primary slots in order; logical
/// partitions are chained behind the extended one. The system volume's
/// partition gets the boot flag.
pub fn format_mbr(path: impl AsRef<Path>, disk: &Disk) -> DiskResult<()> {
    let path = path.as_ref();
    let signature = disk
        .identity()
        .map(mbr_signature_field)
        .transpose()?;
    let entries = disk
        .all_partitions()
        .map(EntrySpec::from_partition)
        .collect::<DiskResult<Vec<_>>>()?;

    let image = open_target(path, disk)?;
    let mut label = MbrLabel::fresh(image)?;
    for entry in entries {
        label.add_partition(entry)?;
    }
    let mut image = label.commit()?;

    if let Some(signature) = signature {
        image.write_at(&signature, MBR_DISK_ID_OFFSET)?;
        image.sync()?;
    }

    log::info!(
        "wrote MBR with {} partitions to {:?}",
        disk.all_partitions().count(),
        path
    );
    Ok(())
}

/// Write `disk` as a GPT
///
/// Every partition becomes a plain GPT entry, numbered in
/// [`Disk::all_partitions`] order. Partitions carrying a `gpt` identity get
/// it as their unique partition GUID; a `gpt` disk identity becomes the disk
/// GUID.
pub fn format_gpt(path: impl AsRef<Path>, disk: &Disk) -> DiskResult<()> {
    let path = path.as_ref();
    let disk_guid = disk
        .identity()
        .map(|id| gpt_guid_field(id, "GPT disk GUID"))
        .transpose()?;

    let mut entries = Vec::new();
    for partition in disk.all_partitions() {
        let mut entry = EntrySpec::from_partition(partition)?;
        entry.kind = EntryKind::Normal;
        entry.unique_guid = partition
            .identity()
            .map(|id| gpt_guid_field(id, "GPT partition GUID"))
            .transpose()?;
        entries.push(entry);
    }

    let image = open_target(path, disk)?;
    let mut label = GptLabel::fresh(image)?;
    if let Some(guid) = disk_guid {
        label.set_disk_guid(guid);
    }
    for entry in entries {
        label.add_partition(entry)?;
    }
    label.commit()?;

    log::info!("wrote GPT with {} partitions to {:?}", disk.all_partitions().count(), path);
    Ok(())
}

/// Read the MBR disk signature at `0x1B8`
pub fn get_mbr_disk_id(path: impl AsRef<Path>) -> DiskResult<Identity> {
    let image = RawImage::open(path)?;
    let mut signature = [0u8; MBR_DISK_ID_LENGTH];
    image.read_exact_at(&mut signature, MBR_DISK_ID_OFFSET)?;
    Ok(Identity::MbrDisk(signature))
}

/// Overwrite the MBR disk signature at `0x1B8`
///
/// Accepts only a 4-byte (`mbr.disk`) identity.
pub fn set_mbr_disk_id(path: impl AsRef<Path>, identity: &Identity) -> DiskResult<()> {
    let signature = mbr_signature_field(identity)?;
    let mut image = RawImage::open_rw(path)?;
    image.write_at(&signature, MBR_DISK_ID_OFFSET)?;
    image.sync()
}

/// Read the unique GUID of GPT partition `number` (1-based) from the
/// primary entry array
pub fn get_gpt_partition_id(path: impl AsRef<Path>, number: u32) -> DiskResult<Identity> {
    let path = path.as_ref();
    let offset = gpt_partition_id_offset(path, number)?;
    let image = RawImage::open(path)?;
    let mut guid = [0u8; GPT_PARTITION_ID_LENGTH];
    image.read_exact_at(&mut guid, offset)?;
    Ok(Identity::Gpt(guid))
}

/// Replace the unique GUID of GPT partition `number` (1-based)
///
/// Both entry arrays and every CRC are rewritten, so the table stays valid.
pub fn set_gpt_partition_id(
    path: impl AsRef<Path>,
    number: u32,
    identity: &Identity,
) -> DiskResult<()> {
    let path = path.as_ref();
    let guid = gpt_guid_field(identity, "GPT partition GUID")?;
    if probe(path)?.kind != LabelKind::Gpt {
        return Err(DiskError::UnparseableDiskLabel {
            path: path.to_path_buf(),
            reason: "no GPT header".to_string(),
        });
    }
    let mut image = RawImage::open_rw(path)?;
    gpt::rewrite_partition_guid(&mut image, number, guid)
}

/// Byte offset of partition `number`'s unique GUID in the primary array
pub fn gpt_partition_id_offset(path: &Path, number: u32) -> DiskResult<u64> {
    let index = number
        .checked_sub(1)
        .ok_or_else(|| DiskError::table(path, "partition numbers start at 1"))?;
    Ok(GPT_PARTITION_TABLE_OFFSET
        + u64::from(index) * GPT_PARTITION_ENTRY_LENGTH
        + GPT_PARTITION_ID_OFFSET)
}

/// Open the target for writing, refusing images shorter than the layout
fn open_target(path: &Path, disk: &Disk) -> DiskResult<RawImage> {
    let image = RawImage::open_rw(path)?;
    if image.size() < disk.length() {
        return Err(DiskError::ImageTooSmall {
            path: path.to_path_buf(),
            required: disk.length(),
            actual: image.size(),
        });
    }
    Ok(image)
}

fn mbr_signature_field(identity: &Identity) -> DiskResult<[u8; MBR_DISK_ID_LENGTH]> {
    match identity {
        Identity::MbrDisk(signature) => Ok(*signature),
        other => Err(invalid_length("MBR disk signature", Flavor::MbrDisk, other)),
    }
}

fn gpt_guid_field(identity: &Identity, field: &'static str) -> DiskResult<[u8; 16]> {
    match identity {
        Identity::Gpt(guid) => Ok(*guid),
        other => Err(invalid_length(field, Flavor::Gpt, other)),
    }
}

fn invalid_length(field: &'static str, expected: Flavor, found: &Identity) -> DiskError {
    DiskError::InvalidIdentityLength {
        field,
        expected: expected.length(),
        actual: found.as_bytes().len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::Partition;
    use crate::units::mebibytes;
    use tempfile::tempdir;

    const MIB: u64 = mebibytes(1);

    #[test]
    fn test_identity_field_guards() {
        assert_eq!(
            mbr_signature_field(&Identity::MbrDisk([1, 2, 3, 4])).unwrap(),
            [1, 2, 3, 4]
        );
        assert!(matches!(
            mbr_signature_field(&Identity::mbr_partition([1, 2, 3, 4], 0)),
            Err(DiskError::InvalidIdentityLength {
                expected: 4,
                actual: 12,
                ..
            })
        ));
        assert!(matches!(
            gpt_guid_field(&Identity::MbrDisk([0; 4]), "GPT partition GUID"),
            Err(DiskError::InvalidIdentityLength {
                expected: 16,
                actual: 4,
                ..
            })
        ));
    }

    #[test]
    fn test_gpt_partition_id_offset() {
        let path = Path::new("disk.img");
        assert_eq!(gpt_partition_id_offset(path, 1).unwrap(), 0x410);
        assert_eq!(gpt_partition_id_offset(path, 3).unwrap(), 0x400 + 2 * 0x80 + 0x10);
        assert!(gpt_partition_id_offset(path, 0).is_err());
    }

    #[test]
    fn test_bad_identity_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("guard.img");
        RawImage::create(&path, 4 * MIB).unwrap();

        // A 12-byte identity cannot fill the 4-byte signature field
        let disk = Disk::builder(3 * MIB)
            .identity(Identity::mbr_partition([9; 4], MIB))
            .partition(Partition::new(PartitionStyle::Primary, MIB, MIB).unwrap())
            .build()
            .unwrap();
        assert!(matches!(
            format_mbr(&path, &disk),
            Err(DiskError::InvalidIdentityLength { .. })
        ));
        assert_eq!(std::fs::read(&path).unwrap(), vec![0u8; 4 * MIB as usize]);
    }

    #[test]
    fn test_image_too_small() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("small.img");
        RawImage::create(&path, MIB).unwrap();

        let disk = Disk::builder(3 * MIB)
            .partition(Partition::new(PartitionStyle::Primary, MIB, 2 * MIB).unwrap())
            .build()
            .unwrap();
        assert!(matches!(
            format(&path, &disk),
            Err(DiskError::ImageTooSmall { required, .. }) if required == 3 * MIB
        ));
    }

    #[test]
    fn test_set_gpt_id_needs_gpt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mbr.img");
        RawImage::create(&path, 4 * MIB).unwrap();
        let disk = Disk::builder(3 * MIB)
            .partition(Partition::new(PartitionStyle::Primary, MIB, MIB).unwrap())
            .build()
            .unwrap();
        format_mbr(&path, &disk).unwrap();

        assert!(matches!(
            set_gpt_partition_id(&path, 1, &Identity::Gpt([1; 16])),
            Err(DiskError::UnparseableDiskLabel { .. })
        ));
    }
}
