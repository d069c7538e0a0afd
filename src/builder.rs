//! Disk builders
//!
//! Turn the volumes reported by a P2V source into [`Disk`] layouts.
//!
//! - [`make_mbr_disk`] recreates an MBR disk at the offsets the volumes had
//!   on their original disk. The first three volumes become primary
//!   partitions; any further volumes become logical partitions inside a
//!   synthesized extended partition.
//! - [`make_gpt_disk`] packs volumes back to back from a fixed aligned start,
//!   rounding every partition up to the alignment.
//! - [`make_disk_array`] splits a mixed volume set into one MBR disk per
//!   disk signature plus at most one GPT disk.
//!
//! Every volume handed to a builder must have a bound [`Device`] so its
//! length is known.
//!
//! [`Device`]: crate::volume::Device

use crate::disk::Disk;
use crate::error::{DiskError, DiskResult};
use crate::identity::{Flavor, Identity};
use crate::partition::{Partition, PartitionStyle, DEFAULT_ALIGNMENT};
use crate::sectors::sector_bytes;
use crate::units::{align_up, mebibytes};
use crate::volume::Volume;

/// Layout constants used by the builders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutOptions {
    /// Alignment of every partition offset and length
    pub alignment: u64,
    /// Offset of the first GPT partition
    pub gpt_partition_start: u64,
    /// Bytes kept free at the end of a GPT disk for the secondary table
    pub gpt_secondary_table_length: u64,
    /// Number of volumes placed in MBR primary slots before going logical
    pub mbr_physical_slots: usize,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            gpt_partition_start: mebibytes(1),
            // Secondary header plus a 32-sector entry array
            gpt_secondary_table_length: sector_bytes(33),
            mbr_physical_slots: 3,
        }
    }
}

/// Build an MBR disk with [`LayoutOptions::default`]
pub fn make_mbr_disk(volumes: &[Volume]) -> DiskResult<Disk> {
    make_mbr_disk_with(&LayoutOptions::default(), volumes)
}

/// Build an MBR disk from volumes carrying `mbr.partition` identities
///
/// Volumes must be ordered by their identity offset. The disk identity is
/// the signature of the first volume.
///
/// # Errors
///
/// `NoVolumes`, `MissingIdentity`, `UnexpectedFlavor` or `MissingDevice` for
/// unusable input, otherwise whatever [`Disk::new`] rejects.
pub fn make_mbr_disk_with(options: &LayoutOptions, volumes: &[Volume]) -> DiskResult<Disk> {
    check_alignment(options)?;
    let first = volumes.first().ok_or(DiskError::NoVolumes)?;
    let (signature, _) = mbr_placement(first)?;
    let disk_id = Identity::MbrDisk(signature);

    let slots = options.mbr_physical_slots.min(volumes.len());
    let (physical_volumes, logical_volumes) = volumes.split_at(slots);

    let mut physical = physical_volumes
        .iter()
        .map(|volume| placed_partition(options, PartitionStyle::Primary, volume))
        .collect::<DiskResult<Vec<_>>>()?;

    let physical_end = physical.last().map(Partition::end).unwrap_or(0);

    let Some(last_logical) = logical_volumes.last() else {
        return Disk::builder(physical_end)
            .identity(disk_id)
            .partitions(physical)
            .build();
    };

    let (_, last_offset) = mbr_placement(last_logical)?;
    let logical_end = checked_end(last_offset, last_logical.device_length()?)?;
    let extended = Partition::with_alignment(
        PartitionStyle::Extended,
        physical_end,
        logical_end.saturating_sub(physical_end),
        options.alignment,
    )?;
    physical.push(extended);

    let logical = logical_volumes
        .iter()
        .map(|volume| placed_partition(options, PartitionStyle::Logical, volume))
        .collect::<DiskResult<Vec<_>>>()?;
    let length = logical.last().map(Partition::end).unwrap_or(logical_end);

    Disk::builder(length)
        .identity(disk_id)
        .partitions(physical)
        .logical_partitions(logical)
        .build()
}

/// Build a GPT disk with [`LayoutOptions::default`]
pub fn make_gpt_disk(volumes: &[Volume]) -> DiskResult<Disk> {
    make_gpt_disk_with(&LayoutOptions::default(), volumes)
}

/// Pack volumes into a GPT disk in the order given
///
/// Each partition carries its volume's GUID identity, if any. The disk has
/// no identity of its own.
pub fn make_gpt_disk_with(options: &LayoutOptions, volumes: &[Volume]) -> DiskResult<Disk> {
    check_alignment(options)?;
    if volumes.is_empty() {
        return Err(DiskError::NoVolumes);
    }

    let mut partitions = Vec::with_capacity(volumes.len());
    let mut offset = aligned(options.gpt_partition_start, 0, options)?;
    for volume in volumes {
        if let Some(identity) = &volume.identity {
            if !identity.is_gpt() {
                return Err(unexpected_flavor(volume, Flavor::Gpt, identity));
            }
        }
        let length = aligned(volume.device_length()?, offset, options)?;
        log::debug!(
            "placing GPT volume {} at offset {} ({} bytes)",
            volume.name(),
            offset,
            length
        );
        partitions.push(
            Partition::with_alignment(PartitionStyle::Gpt, offset, length, options.alignment)?
                .with_identity(volume.identity)
                .with_volume(Some(volume.clone())),
        );
        offset = checked_end(offset, length)?;
    }

    let length = checked_end(offset, options.gpt_secondary_table_length)?;
    Disk::builder(length)
        .partitions(partitions)
        .build()
}

/// Split volumes into disks with [`LayoutOptions::default`]
pub fn make_disk_array(volumes: &[Volume]) -> DiskResult<Vec<Disk>> {
    make_disk_array_with(&LayoutOptions::default(), volumes)
}

/// Split a mixed volume set into the disks it came from
///
/// Volumes with an `mbr.partition` identity are grouped by disk signature
/// (groups in order of first appearance), sorted by offset and built with
/// [`make_mbr_disk_with`]. Volumes with a GPT identity go, in the order
/// given, into a single [`make_gpt_disk_with`] disk placed last. Volumes with
/// no identity or an `mbr.disk` identity cannot be placed and are skipped.
pub fn make_disk_array_with(options: &LayoutOptions, volumes: &[Volume]) -> DiskResult<Vec<Disk>> {
    check_alignment(options)?;
    let mut mbr_groups: Vec<([u8; 4], Vec<Volume>)> = Vec::new();
    let mut gpt_volumes = Vec::new();

    for volume in volumes {
        match &volume.identity {
            Some(Identity::MbrPartition(_)) => {
                let (signature, _) = mbr_placement(volume)?;
                match mbr_groups.iter_mut().find(|(sig, _)| *sig == signature) {
                    Some((_, group)) => group.push(volume.clone()),
                    None => mbr_groups.push((signature, vec![volume.clone()])),
                }
            }
            Some(Identity::Gpt(_)) => gpt_volumes.push(volume.clone()),
            Some(identity @ Identity::MbrDisk(_)) => {
                log::warn!(
                    "skipping volume {}: {} identity does not locate a partition",
                    volume.name(),
                    identity.flavor()
                );
            }
            None => log::warn!("skipping volume {}: no identity", volume.name()),
        }
    }

    let mut disks = Vec::with_capacity(mbr_groups.len() + 1);
    for (_, mut group) in mbr_groups {
        group.sort_by_key(|v| v.identity.as_ref().and_then(Identity::offset));
        disks.push(make_mbr_disk_with(options, &group)?);
    }
    if !gpt_volumes.is_empty() {
        disks.push(make_gpt_disk_with(options, &gpt_volumes)?);
    }

    Ok(disks)
}

/// Signature and byte offset from a volume's `mbr.partition` identity
fn mbr_placement(volume: &Volume) -> DiskResult<([u8; 4], u64)> {
    let identity = volume
        .identity
        .as_ref()
        .ok_or_else(|| DiskError::MissingIdentity {
            guid: volume.guid.clone(),
        })?;
    match (identity.signature(), identity.offset()) {
        (Some(signature), Some(offset)) => Ok((signature, offset)),
        _ => Err(unexpected_flavor(volume, Flavor::MbrPartition, identity)),
    }
}

/// A partition at the volume's original offset, as long as its device
fn placed_partition(
    options: &LayoutOptions,
    style: PartitionStyle,
    volume: &Volume,
) -> DiskResult<Partition> {
    let (_, offset) = mbr_placement(volume)?;
    let length = volume.device_length()?;
    Ok(Partition::with_alignment(style, offset, length, options.alignment)?
        .with_volume(Some(volume.clone())))
}

fn check_alignment(options: &LayoutOptions) -> DiskResult<()> {
    match options.alignment {
        0 => Err(DiskError::InvalidAlignment { alignment: 0 }),
        _ => Ok(()),
    }
}

fn checked_end(offset: u64, length: u64) -> DiskResult<u64> {
    offset
        .checked_add(length)
        .ok_or(DiskError::AddressOverflow { offset, length })
}

/// `value` rounded up to the layout alignment; `offset` is reported on overflow
fn aligned(value: u64, offset: u64, options: &LayoutOptions) -> DiskResult<u64> {
    align_up(value, options.alignment).ok_or(DiskError::AddressOverflow {
        offset,
        length: value,
    })
}

fn unexpected_flavor(volume: &Volume, expected: Flavor, found: &Identity) -> DiskError {
    DiskError::UnexpectedFlavor {
        guid: volume.guid.clone(),
        expected,
        found: found.flavor(),
    }
}
