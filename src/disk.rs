//! Disk layouts
//!
//! A [`Disk`] is the complete layout that will be written onto one target
//! image: its length, an optional disk identity, the table-level partitions
//! and, for MBR disks, the logical partitions nested in the extended one.
//!
//! # Invariants
//!
//! Checked once, at construction (including deserialization):
//!
//! 1. Both partition lists are ordered, congruent, and consistently styled
//!    (see [`Partition::check_sanity`]).
//! 2. Logical partitions require exactly one extended partition and must lie
//!    within `[extended.offset + 1 MiB, extended.end)`.
//! 3. A disk identity must be congruent with the first partition's identity.
//! 4. The last partition must end within the disk length.
//!
//! A `Disk` is never modified afterwards. To change a layout, build a new one.
//!
//! # Partition Numbers
//!
//! Partition numbers are 1-based positions in [`Disk::all_partitions`]:
//! table-level partitions first, then logical ones. This matches the order
//! the table codec emits entries in.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DiskError, DiskResult};
use crate::identity::Identity;
use crate::partition::{Partition, PartitionRecord, PartitionStyle};
use crate::units::mebibytes;
use crate::volume::Volume;

/// Space at the start of an extended partition before its first logical one
///
/// Mirrors the 1 MiB boot header at the start of a boot disk.
pub const BOOT_HEADER_LENGTH: u64 = mebibytes(1);

/// Length of a master boot record
pub const MASTER_BOOT_RECORD_LENGTH: u64 = 512;

/// Partition table scheme a disk is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Mbr,
    Gpt,
    /// Neither the disk nor its first partition carries an identity
    Unspecified,
}

/// A validated disk layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DiskRecord", into = "DiskRecord")]
pub struct Disk {
    length: u64,
    identity: Option<Identity>,
    partitions: Vec<Partition>,
    logical_partitions: Vec<Partition>,
}

impl Disk {
    /// Validate and assemble a disk layout
    ///
    /// # Errors
    ///
    /// `SanityCheckFailed`, `MissingExtendedPartition`,
    /// `LogicalBoundsExceeded`, `IdentityMismatch` or `LengthExceeded`,
    /// per the invariants in the module docs.
    pub fn new(
        length: u64,
        identity: Option<Identity>,
        partitions: Vec<Partition>,
        logical_partitions: Vec<Partition>,
    ) -> DiskResult<Self> {
        Partition::check_sanity(&partitions).map_err(|violation| {
            DiskError::SanityCheckFailed {
                list: "partitions",
                violation,
            }
        })?;

        if !logical_partitions.is_empty() {
            let mut extended = partitions
                .iter()
                .filter(|p| p.style() == PartitionStyle::Extended);
            let (Some(extended), None) = (extended.next(), extended.next()) else {
                return Err(DiskError::MissingExtendedPartition);
            };

            Partition::check_sanity(&logical_partitions).map_err(|violation| {
                DiskError::SanityCheckFailed {
                    list: "logical partitions",
                    violation,
                }
            })?;

            let lower = extended.offset().saturating_add(BOOT_HEADER_LENGTH);
            let upper = extended.end();
            if !Partition::check_bounds(lower, upper, &logical_partitions) {
                return Err(DiskError::LogicalBoundsExceeded {
                    start: logical_partitions[0].offset(),
                    end: logical_partitions[logical_partitions.len() - 1].end(),
                    lower,
                    upper,
                });
            }
        }

        if let (Some(first), Some(last)) = (partitions.first(), partitions.last()) {
            if let (Some(disk_id), Some(part_id)) = (&identity, first.identity()) {
                if !part_id.congruent(Some(disk_id)) {
                    return Err(DiskError::IdentityMismatch {
                        disk: *disk_id,
                        partition: *part_id,
                    });
                }
            }
            if last.end() > length {
                log::error!(
                    "partition bounds exceed disk length: partitions: {:?}, disk length: {}",
                    partitions,
                    length
                );
                return Err(DiskError::LengthExceeded {
                    end: last.end(),
                    length,
                });
            }
        }

        Ok(Self {
            length,
            identity,
            partitions,
            logical_partitions,
        })
    }

    pub fn builder(length: u64) -> DiskBuilder {
        DiskBuilder::new(length)
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Table-level partitions (primary, extended, or GPT)
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn logical_partitions(&self) -> &[Partition] {
        &self.logical_partitions
    }

    /// Every partition in partition-number order
    pub fn all_partitions(&self) -> impl Iterator<Item = &Partition> + '_ {
        self.partitions.iter().chain(self.logical_partitions.iter())
    }

    /// Partition by 1-based number
    pub fn partition(&self, number: usize) -> Option<&Partition> {
        number
            .checked_sub(1)
            .and_then(|index| self.all_partitions().nth(index))
    }

    /// The table-level partition holding the system volume
    pub fn boot_partition(&self) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.is_boot_partition())
    }

    pub fn is_boot_disk(&self) -> bool {
        self.boot_partition().is_some()
    }

    /// 1-based number of the first partition whose volume has drive `drive`
    pub fn partition_number_of_drive(&self, drive: &str) -> Option<usize> {
        self.all_partitions()
            .position(|p| {
                p.volume()
                    .and_then(|v| v.drive.as_deref())
                    .is_some_and(|d| d == drive)
            })
            .map(|index| index + 1)
    }

    /// Label scheme, from the disk identity or else the first partition's
    pub fn label_kind(&self) -> LabelKind {
        let identity = self
            .identity
            .as_ref()
            .or_else(|| self.all_partitions().next().and_then(Partition::identity));
        match identity {
            Some(id) if id.is_gpt() => LabelKind::Gpt,
            Some(_) => LabelKind::Mbr,
            None => LabelKind::Unspecified,
        }
    }

    pub fn is_mbr(&self) -> bool {
        self.label_kind() == LabelKind::Mbr
    }

    pub fn is_gpt(&self) -> bool {
        self.label_kind() == LabelKind::Gpt
    }

    pub fn is_unspecified(&self) -> bool {
        self.label_kind() == LabelKind::Unspecified
    }

    /// Bound volumes, in partition-number order
    pub fn volumes(&self) -> Vec<&Volume> {
        self.all_partitions().filter_map(Partition::volume).collect()
    }

    /// Persisted (JSON) form
    pub fn encode(&self) -> DiskResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild from the persisted form, re-running every validation
    ///
    /// # Errors
    ///
    /// `Codec` when the value does not have the shape of a disk record;
    /// otherwise the validation error [`Disk::new`] or
    /// [`Partition::with_alignment`] raised.
    pub fn decode(encoded: &serde_json::Value) -> DiskResult<Self> {
        DiskRecord::deserialize(encoded)?.try_into()
    }

    pub fn to_json(&self) -> DiskResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> DiskResult<Self> {
        serde_json::from_str::<DiskRecord>(json)?.try_into()
    }
}

/// Collects partitions for a [`Disk`]; validation happens in [`build`](Self::build)
#[derive(Debug, Clone)]
pub struct DiskBuilder {
    length: u64,
    identity: Option<Identity>,
    partitions: Vec<Partition>,
    logical_partitions: Vec<Partition>,
}

impl DiskBuilder {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            identity: None,
            partitions: Vec::new(),
            logical_partitions: Vec::new(),
        }
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn partition(mut self, partition: Partition) -> Self {
        self.partitions.push(partition);
        self
    }

    pub fn partitions(mut self, partitions: impl IntoIterator<Item = Partition>) -> Self {
        self.partitions.extend(partitions);
        self
    }

    pub fn logical_partition(mut self, partition: Partition) -> Self {
        self.logical_partitions.push(partition);
        self
    }

    pub fn logical_partitions(mut self, partitions: impl IntoIterator<Item = Partition>) -> Self {
        self.logical_partitions.extend(partitions);
        self
    }

    pub fn build(self) -> DiskResult<Disk> {
        Disk::new(
            self.length,
            self.identity,
            self.partitions,
            self.logical_partitions,
        )
    }
}

/// Persisted form of a disk
///
/// Partitions stay records until [`Disk::try_from`] validates them, so a
/// bad layout surfaces as its own error variant rather than a codec error.
#[derive(Serialize, Deserialize)]
struct DiskRecord {
    length: u64,
    identity: Option<Identity>,
    partitions: Vec<PartitionRecord>,
    #[serde(default)]
    logical_partitions: Vec<PartitionRecord>,
}

fn validate_records(records: Vec<PartitionRecord>) -> DiskResult<Vec<Partition>> {
    records.into_iter().map(Partition::try_from).collect()
}

impl TryFrom<DiskRecord> for Disk {
    type Error = DiskError;

    fn try_from(record: DiskRecord) -> Result<Self, Self::Error> {
        Disk::new(
            record.length,
            record.identity,
            validate_records(record.partitions)?,
            validate_records(record.logical_partitions)?,
        )
    }
}

impl From<Disk> for DiskRecord {
    fn from(disk: Disk) -> Self {
        Self {
            length: disk.length,
            identity: disk.identity,
            partitions: disk.partitions.into_iter().map(Into::into).collect(),
            logical_partitions: disk
                .logical_partitions
                .into_iter()
                .map(Into::into)
                .collect(),
        }
    }
}

/// Write a disk array to `path` as pretty JSON
pub fn save_disks(path: impl AsRef<Path>, disks: &[Disk]) -> DiskResult<()> {
    let file = File::create(path.as_ref())?;
    serde_json::to_writer_pretty(BufWriter::new(file), disks)?;
    Ok(())
}

/// Read a disk array written by [`save_disks`]
pub fn load_disks(path: impl AsRef<Path>) -> DiskResult<Vec<Disk>> {
    let file = File::open(path.as_ref())?;
    let records: Vec<DiskRecord> = serde_json::from_reader(BufReader::new(file))?;
    records.into_iter().map(Disk::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, SanityViolation};
    use crate::volume::VolumeRole;

    const MIB: u64 = mebibytes(1);

    fn part(style: PartitionStyle, offset_mib: u64, length_mib: u64) -> Partition {
        Partition::new(style, offset_mib * MIB, length_mib * MIB).unwrap()
    }

    fn mbr_disk() -> Disk {
        let system = Volume::new("sys")
            .with_drive("C:")
            .with_role(VolumeRole::new(true, true));
        Disk::builder(40 * MIB)
            .identity(Identity::MbrDisk([1, 2, 3, 4]))
            .partition(part(PartitionStyle::Primary, 1, 9).with_volume(Some(system)))
            .partition(part(PartitionStyle::Extended, 10, 30))
            .logical_partition(
                part(PartitionStyle::Logical, 12, 8)
                    .with_volume(Some(Volume::new("data").with_drive("D:"))),
            )
            .logical_partition(part(PartitionStyle::Logical, 21, 4))
            .build()
            .unwrap()
    }

    #[test]
    fn test_partition_numbering() {
        let disk = mbr_disk();
        let numbered: Vec<_> = disk.all_partitions().map(Partition::offset).collect();
        assert_eq!(numbered, vec![MIB, 10 * MIB, 12 * MIB, 21 * MIB]);
        assert_eq!(disk.partition(3).map(Partition::offset), Some(12 * MIB));
        assert!(disk.partition(0).is_none());
        assert_eq!(disk.partition_number_of_drive("C:"), Some(1));
        assert_eq!(disk.partition_number_of_drive("D:"), Some(3));
        assert_eq!(disk.partition_number_of_drive("Z:"), None);
    }

    #[test]
    fn test_boot_and_volumes() {
        let disk = mbr_disk();
        assert!(disk.is_boot_disk());
        assert_eq!(disk.boot_partition().map(Partition::offset), Some(MIB));
        let names: Vec<_> = disk.volumes().iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["sys", "data"]);
    }

    #[test]
    fn test_label_kind() {
        assert!(mbr_disk().is_mbr());

        let gpt = Disk::builder(10 * MIB)
            .partition(part(PartitionStyle::Gpt, 1, 8).with_identity(Some(Identity::Gpt([3; 16]))))
            .build()
            .unwrap();
        assert!(gpt.is_gpt());

        let bare = Disk::builder(10 * MIB)
            .partition(part(PartitionStyle::Gpt, 1, 8))
            .build()
            .unwrap();
        assert!(bare.is_unspecified());
        assert!(Disk::builder(0).build().unwrap().is_unspecified());
    }

    #[test]
    fn test_length_exceeded() {
        let err = Disk::builder(5 * MIB)
            .partition(part(PartitionStyle::Primary, 1, 8))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            DiskError::LengthExceeded { end, length } if end == 9 * MIB && length == 5 * MIB
        ));
    }

    #[test]
    fn test_missing_extended() {
        let err = Disk::builder(40 * MIB)
            .partition(part(PartitionStyle::Primary, 1, 9))
            .logical_partition(part(PartitionStyle::Logical, 12, 8))
            .build()
            .unwrap_err();
        assert!(matches!(err, DiskError::MissingExtendedPartition));
    }

    #[test]
    fn test_logical_bounds() {
        // First logical partition inside the extended partition's boot header
        let err = Disk::builder(40 * MIB)
            .partition(part(PartitionStyle::Extended, 10, 30))
            .logical_partition(part(PartitionStyle::Logical, 10, 8))
            .build()
            .unwrap_err();
        assert!(matches!(err, DiskError::LogicalBoundsExceeded { .. }));

        let err = Disk::builder(40 * MIB)
            .partition(part(PartitionStyle::Extended, 10, 10))
            .logical_partition(part(PartitionStyle::Logical, 12, 9))
            .build()
            .unwrap_err();
        assert!(matches!(err, DiskError::LogicalBoundsExceeded { .. }));
    }

    #[test]
    fn test_sanity_failure_names_list() {
        let err = Disk::builder(40 * MIB)
            .partition(part(PartitionStyle::Primary, 10, 9))
            .partition(part(PartitionStyle::Primary, 1, 5))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            DiskError::SanityCheckFailed {
                list: "partitions",
                violation: SanityViolation::Overlapping { index: 1 }
            }
        ));
    }

    #[test]
    fn test_identity_mismatch() {
        let err = Disk::builder(40 * MIB)
            .identity(Identity::MbrDisk([1, 1, 1, 1]))
            .partition(
                part(PartitionStyle::Primary, 1, 9)
                    .with_identity(Some(Identity::mbr_partition([2, 2, 2, 2], MIB))),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, DiskError::IdentityMismatch { .. }));
    }

    #[test]
    fn test_json_round_trip() {
        let disk = mbr_disk();
        let encoded = disk.encode().unwrap();
        assert_eq!(encoded["identity"], "mbr.disk/01020304");
        assert_eq!(encoded["logical_partitions"].as_array().unwrap().len(), 2);
        assert_eq!(Disk::decode(&encoded).unwrap(), disk);
        assert_eq!(Disk::from_json(&disk.to_json().unwrap()).unwrap(), disk);
    }

    #[test]
    fn test_decode_revalidates() {
        let mut encoded = mbr_disk().encode().unwrap();
        encoded["length"] = serde_json::json!(MIB);
        let err = Disk::decode(&encoded).unwrap_err();
        assert!(matches!(
            err,
            DiskError::LengthExceeded { length, .. } if length == MIB
        ));
        assert_eq!(err.category(), ErrorCategory::Validation);

        let mut encoded = mbr_disk().encode().unwrap();
        encoded["partitions"][0]["offset"] = serde_json::json!(1000);
        let err = Disk::from_json(&encoded.to_string()).unwrap_err();
        assert!(matches!(
            err,
            DiskError::MisalignedOffset { offset: 1000, .. }
        ));
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        let err = Disk::decode(&serde_json::json!({ "length": "big" })).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Codec);
    }

    #[test]
    fn test_partitions_from_different_disks() {
        let err = Disk::builder(40 * MIB)
            .partition(
                part(PartitionStyle::Primary, 1, 9)
                    .with_identity(Some(Identity::mbr_partition([1, 1, 1, 1], MIB))),
            )
            .partition(
                part(PartitionStyle::Primary, 10, 9)
                    .with_identity(Some(Identity::mbr_partition([2, 2, 2, 2], 10 * MIB))),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            DiskError::SanityCheckFailed {
                list: "partitions",
                violation: SanityViolation::NotCongruent { index: 1 }
            }
        ));
    }
}
