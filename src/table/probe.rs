//! Reading a label back
//!
//! [`probe`] reports what partition table an image actually carries, in the
//! same terms the layout model uses: numbered partitions with byte offsets,
//! lengths, styles and recovered identities.
//!
//! # Detection Order
//!
//! 1. GPT header signature at LBA 1
//! 2. MBR boot signature at LBA 0, unless it is a GPT protective MBR
//! 3. Otherwise the label is unparseable
//!
//! GPT comes first because every GPT disk also carries a protective MBR that
//! would otherwise read as one partition covering the whole disk.
//!
//! # Numbering
//!
//! GPT partitions are numbered by entry slot. MBR partitions are numbered in
//! table order with logical partitions following all primary entries, the
//! order [`Disk::all_partitions`](crate::disk::Disk::all_partitions) uses.

use std::path::Path;

use crate::disk::LabelKind;
use crate::error::{DiskError, DiskResult};
use crate::identity::Identity;
use crate::partition::PartitionStyle;
use crate::sectors::{checked_sector_bytes, sector_bytes, SECTOR_SIZE};

use super::mbr::{TYPE_EXTENDED, TYPE_EXTENDED_LBA, TYPE_GPT_PROTECTIVE};
use super::raw::RawImage;
use super::{
    BOOT_SIGNATURE, BOOT_SIGNATURE_OFFSET, GPT_PARTITION_ENTRY_LENGTH, GPT_PARTITION_ID_OFFSET,
    MBR_DISK_ID_LENGTH, MBR_DISK_ID_OFFSET, MBR_PARTITION_ENTRY_LENGTH, MBR_PARTITION_TABLE_OFFSET,
};

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_HEADER_LENGTH: usize = 92;

/// Bounds the EBR walk on corrupt chains
const MAX_LOGICAL_PARTITIONS: usize = 128;

/// Largest entry array accepted from an on-disk GPT header
const MAX_GPT_ENTRIES: u32 = 1024;

/// A partition found on an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedPartition {
    /// 1-based partition number
    pub number: u32,
    pub offset: u64,
    pub length: u64,
    pub style: PartitionStyle,
    /// `mbr.partition` (signature + offset) or `gpt` unique GUID
    pub identity: Option<Identity>,
    /// MBR boot flag, or GPT EFI system partition type
    pub bootable: bool,
}

impl ProbedPartition {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// The label found on an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbedLabel {
    pub kind: LabelKind,
    /// `mbr.disk` signature or GPT disk GUID
    pub identity: Option<Identity>,
    pub size: u64,
    partitions: Vec<ProbedPartition>,
}

impl ProbedLabel {
    pub fn partitions(&self) -> &[ProbedPartition] {
        &self.partitions
    }

    pub fn partition(&self, number: u32) -> Option<&ProbedPartition> {
        self.partitions.iter().find(|p| p.number == number)
    }
}

/// Detect and parse the partition table on `path`
///
/// # Errors
///
/// `UnparseableDiskLabel` when neither a GPT nor an MBR is present, or when
/// only a GPT protective MBR is found.
pub fn probe(path: impl AsRef<Path>) -> DiskResult<ProbedLabel> {
    let path = path.as_ref();
    let image = RawImage::open(path)?;

    if let Some(label) = parse_gpt(&image)? {
        return Ok(label);
    }
    parse_mbr(&image)
}

fn unparseable(image: &RawImage, reason: impl Into<String>) -> DiskError {
    DiskError::UnparseableDiskLabel {
        path: image.path().to_path_buf(),
        reason: reason.into(),
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

fn guid_at(bytes: &[u8]) -> [u8; 16] {
    let mut guid = [0u8; 16];
    guid.copy_from_slice(&bytes[..16]);
    guid
}

/// GPT label, or `None` if there is no GPT header
fn parse_gpt(image: &RawImage) -> DiskResult<Option<ProbedLabel>> {
    if image.size() < sector_bytes(2) {
        return Ok(None);
    }

    let mut header = [0u8; GPT_HEADER_LENGTH];
    image.read_exact_at(&mut header, SECTOR_SIZE)?;
    if &header[0..8] != GPT_SIGNATURE {
        return Ok(None);
    }

    let disk_guid = guid_at(&header[56..72]);
    let entry_lba = le_u64(&header[72..80]);
    let entry_count = le_u32(&header[80..84]);
    let entry_size = u64::from(le_u32(&header[84..88]));
    if entry_size < GPT_PARTITION_ENTRY_LENGTH {
        return Err(unparseable(
            image,
            format!("GPT entry size {} is too small", entry_size),
        ));
    }
    if entry_count > MAX_GPT_ENTRIES {
        return Err(unparseable(
            image,
            format!("GPT entry count {} exceeds {}", entry_count, MAX_GPT_ENTRIES),
        ));
    }

    let array_start = checked_sector_bytes(entry_lba);
    let array_end = array_start
        .and_then(|start| start.checked_add(u64::from(entry_count) * entry_size));
    let array_start = match (array_start, array_end) {
        (Some(start), Some(end)) if end <= image.size() => start,
        _ => {
            return Err(unparseable(
                image,
                format!("GPT entry array at sector {} lies outside the image", entry_lba),
            ))
        }
    };

    let mut partitions = Vec::new();
    let mut entry = vec![0u8; GPT_PARTITION_ENTRY_LENGTH as usize];
    for index in 0..entry_count {
        let offset = array_start + u64::from(index) * entry_size;
        image.read_exact_at(&mut entry, offset)?;

        let type_guid = guid_at(&entry[0..16]);
        if type_guid == [0u8; 16] {
            continue;
        }

        let unique = guid_at(&entry[GPT_PARTITION_ID_OFFSET as usize..]);
        let start_lba = le_u64(&entry[32..40]);
        let end_lba = le_u64(&entry[40..48]);

        let span = checked_sector_bytes(start_lba).zip(
            end_lba
                .checked_add(1)
                .and_then(checked_sector_bytes),
        );
        let (offset, end) = match span {
            Some((offset, end)) if start_lba <= end_lba => (offset, end),
            _ => {
                return Err(unparseable(
                    image,
                    format!(
                        "GPT entry {} spans invalid sectors [{}, {}]",
                        index + 1,
                        start_lba,
                        end_lba
                    ),
                ))
            }
        };

        partitions.push(ProbedPartition {
            number: index + 1,
            offset,
            length: end - offset,
            style: PartitionStyle::Gpt,
            identity: Some(Identity::Gpt(unique)),
            bootable: type_guid == EFI_SYSTEM_TYPE,
        });
    }

    log::debug!(
        "GPT on {:?}: {} partitions",
        image.path(),
        partitions.len()
    );
    Ok(Some(ProbedLabel {
        kind: LabelKind::Gpt,
        identity: Some(Identity::Gpt(disk_guid)),
        size: image.size(),
        partitions,
    }))
}

/// C12A7328-F81F-11D2-BA4B-00A0C93EC93B, on-disk byte order
const EFI_SYSTEM_TYPE: [u8; 16] = [
    0x28, 0x73, 0x2A, 0xC1, 0x1F, 0xF8, 0xD2, 0x11, 0xBA, 0x4B, 0x00, 0xA0, 0xC9, 0x3E, 0xC9, 0x3B,
];

fn is_extended_type(type_byte: u8) -> bool {
    matches!(type_byte, TYPE_EXTENDED | TYPE_EXTENDED_LBA | 0x85)
}

fn table_entry(sector: &[u8], slot: usize) -> &[u8] {
    let offset = MBR_PARTITION_TABLE_OFFSET as usize + slot * MBR_PARTITION_ENTRY_LENGTH;
    &sector[offset..offset + MBR_PARTITION_ENTRY_LENGTH]
}

fn parse_mbr(image: &RawImage) -> DiskResult<ProbedLabel> {
    if image.size() < SECTOR_SIZE {
        return Err(unparseable(image, "image is smaller than one sector"));
    }

    let mut boot_sector = [0u8; SECTOR_SIZE as usize];
    image.read_exact_at(&mut boot_sector, 0)?;
    if boot_sector[BOOT_SIGNATURE_OFFSET..] != BOOT_SIGNATURE {
        return Err(unparseable(image, "no GPT header or MBR boot signature"));
    }
    if table_entry(&boot_sector, 0)[4] == TYPE_GPT_PROTECTIVE {
        return Err(unparseable(image, "protective MBR without a GPT header"));
    }

    let disk_id_start = MBR_DISK_ID_OFFSET as usize;
    let mut signature = [0u8; MBR_DISK_ID_LENGTH];
    signature.copy_from_slice(&boot_sector[disk_id_start..disk_id_start + MBR_DISK_ID_LENGTH]);

    let mut partitions = Vec::new();
    let mut extended_start = None;

    for slot in 0..4 {
        let entry = table_entry(&boot_sector, slot);
        let type_byte = entry[4];
        if type_byte == 0 {
            continue;
        }

        let start_lba = u64::from(le_u32(&entry[8..12]));
        let sectors = u64::from(le_u32(&entry[12..16]));
        let style = if is_extended_type(type_byte) {
            extended_start = Some(start_lba);
            PartitionStyle::Extended
        } else {
            PartitionStyle::Primary
        };

        partitions.push(ProbedPartition {
            number: partitions.len() as u32 + 1,
            offset: sector_bytes(start_lba),
            length: sector_bytes(sectors),
            style,
            identity: Some(Identity::mbr_partition(signature, sector_bytes(start_lba))),
            bootable: entry[0] & 0x80 != 0,
        });
    }

    if let Some(extended_start) = extended_start {
        let first_number = partitions.len() as u32 + 1;
        let logicals = parse_ebr_chain(image, extended_start, signature, first_number)?;
        partitions.extend(logicals);
    }

    log::debug!(
        "MBR on {:?}: {} partitions",
        image.path(),
        partitions.len()
    );
    Ok(ProbedLabel {
        kind: LabelKind::Mbr,
        identity: Some(Identity::MbrDisk(signature)),
        size: image.size(),
        partitions,
    })
}

/// Walk the EBR chain of an extended partition
///
/// Entry 0 of each EBR is relative to that EBR; entry 1 (the link) is
/// relative to the start of the extended partition.
fn parse_ebr_chain(
    image: &RawImage,
    extended_start: u64,
    signature: [u8; 4],
    first_number: u32,
) -> DiskResult<Vec<ProbedPartition>> {
    let mut partitions = Vec::new();
    let mut ebr_lba = extended_start;

    while partitions.len() < MAX_LOGICAL_PARTITIONS {
        let mut ebr = [0u8; SECTOR_SIZE as usize];
        if image.read_exact_at(&mut ebr, sector_bytes(ebr_lba)).is_err() {
            break;
        }
        if ebr[BOOT_SIGNATURE_OFFSET..] != BOOT_SIGNATURE {
            break;
        }

        let logical = table_entry(&ebr, 0);
        if logical[4] != 0 {
            let start_lba = ebr_lba + u64::from(le_u32(&logical[8..12]));
            let sectors = u64::from(le_u32(&logical[12..16]));
            partitions.push(ProbedPartition {
                number: first_number + partitions.len() as u32,
                offset: sector_bytes(start_lba),
                length: sector_bytes(sectors),
                style: PartitionStyle::Logical,
                identity: Some(Identity::mbr_partition(signature, sector_bytes(start_lba))),
                bootable: logical[0] & 0x80 != 0,
            });
        }

        let link = table_entry(&ebr, 1);
        if !is_extended_type(link[4]) {
            break;
        }
        let next = extended_start + u64::from(le_u32(&link[8..12]));
        if next <= ebr_lba {
            log::warn!("EBR chain on {:?} loops back at sector {}", image.path(), next);
            break;
        }
        ebr_lba = next;
    }

    Ok(partitions)
}
