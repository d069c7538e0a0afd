//! GPT table writer
//!
//! Headers, entry arrays and their CRCs are encoded by `gpt_disk_io` /
//! `gpt_disk_types`; this module decides the geometry and keeps the primary
//! and secondary copies in sync.
//!
//! # Layout
//!
//! | LBA                 | Contents                          |
//! |---------------------|-----------------------------------|
//! | 0                   | protective MBR                    |
//! | 1                   | primary header                    |
//! | 2..34               | primary entry array (128 entries) |
//! | 34..n-33            | usable                            |
//! | n-33..n-1           | secondary entry array             |
//! | n-1                 | secondary header                  |
//!
//! Unique partition GUIDs are placed in the entries before the array CRC is
//! computed, so the committed table is valid as written.

use std::fmt;
use std::path::Path;

use gpt_disk_io::{BlockIo, Disk as GptDevice};
use gpt_disk_types::{
    guid, BlockSize, GptHeader, GptPartitionEntryArray, GptPartitionType, Guid, LbaLe, U32Le,
};

use crate::error::{DiskError, DiskResult};
use crate::sectors::{sector_bytes, SECTOR_SIZE};

use super::label::{EntryKind, EntrySpec, Label};
use super::raw::{ImageBlocks, RawImage};

/// Entries in each partition entry array
pub const GPT_ENTRY_COUNT: u32 = 128;

const ENTRY_ARRAY_SECTORS: u64 = 32;
const FIRST_USABLE_LBA: u64 = 2 + ENTRY_ARRAY_SECTORS;
/// Trailing sectors taken by the secondary array and header
const SECONDARY_SECTORS: u64 = ENTRY_ARRAY_SECTORS + 1;

/// Disk GUID used when the layout supplies none
pub const DEFAULT_DISK_GUID: Guid = guid!("5032565f-6469-736b-8000-000000000001");

/// A GPT being assembled for one image
#[derive(Debug)]
pub struct GptLabel {
    image: RawImage,
    disk_guid: Guid,
    entries: Vec<EntrySpec>,
}

impl GptLabel {
    pub fn set_disk_guid(&mut self, guid: [u8; 16]) {
        self.disk_guid = Guid::from_bytes(guid);
    }

    fn last_usable(&self) -> u64 {
        self.image.sectors() - SECONDARY_SECTORS - 1
    }
}

impl Label for GptLabel {
    fn fresh(image: RawImage) -> DiskResult<Self> {
        let minimum = FIRST_USABLE_LBA + SECONDARY_SECTORS + 1;
        if image.sectors() < minimum {
            return Err(DiskError::ImageTooSmall {
                path: image.path().to_path_buf(),
                required: sector_bytes(minimum),
                actual: image.size(),
            });
        }
        Ok(Self {
            image,
            disk_guid: DEFAULT_DISK_GUID,
            entries: Vec::new(),
        })
    }

    fn add_partition(&mut self, entry: EntrySpec) -> DiskResult<()> {
        if entry.kind != EntryKind::Normal {
            return Err(DiskError::table(
                self.image.path(),
                "GPT has no extended or logical partitions",
            ));
        }
        if self.entries.len() == GPT_ENTRY_COUNT as usize {
            return Err(DiskError::table(
                self.image.path(),
                format!("GPT holds at most {} partitions", GPT_ENTRY_COUNT),
            ));
        }

        let geometry = entry.geometry;
        let limit = self.last_usable() + 1;
        if geometry.start < FIRST_USABLE_LBA || geometry.end() > limit {
            return Err(DiskError::GeometryOutOfRange {
                path: self.image.path().to_path_buf(),
                start_sector: geometry.start,
                end_sector: geometry.end(),
                limit,
            });
        }

        self.entries.push(entry);
        Ok(())
    }

    fn commit(self) -> DiskResult<RawImage> {
        let last_usable = self.last_usable();
        let GptLabel {
            mut image,
            disk_guid,
            entries,
        } = self;
        let path = image.path().to_path_buf();
        let num_blocks = image.sectors();

        let mut header = GptHeader {
            my_lba: LbaLe::from_u64(1),
            alternate_lba: LbaLe::from_u64(num_blocks - 1),
            first_usable_lba: LbaLe::from_u64(FIRST_USABLE_LBA),
            last_usable_lba: LbaLe::from_u64(last_usable),
            disk_guid,
            partition_entry_lba: LbaLe::from_u64(2),
            number_of_partition_entries: U32Le::from_u32(GPT_ENTRY_COUNT),
            ..Default::default()
        };

        let layout = header
            .get_partition_entry_array_layout()
            .map_err(|e| gpt_error(&path, "entry array layout", e))?;
        let mut storage = vec![0u8; sector_bytes(ENTRY_ARRAY_SECTORS) as usize];
        let mut array = GptPartitionEntryArray::new(layout, BlockSize::BS_512, &mut storage)
            .map_err(|e| gpt_error(&path, "entry array", e))?;

        for (index, entry) in entries.iter().enumerate() {
            let slot = array
                .get_partition_entry_mut(index as u32)
                .ok_or_else(|| DiskError::table(&path, format!("no GPT entry slot {}", index)))?;
            slot.partition_type_guid = if entry.bootable {
                GptPartitionType::EFI_SYSTEM
            } else {
                GptPartitionType::BASIC_DATA
            };
            let unique_guid = entry
                .unique_guid
                .map(Guid::from_bytes)
                .unwrap_or_else(|| derived_guid(disk_guid, index));
            slot.unique_partition_guid = unique_guid;
            slot.starting_lba = LbaLe::from_u64(entry.geometry.start);
            slot.ending_lba = LbaLe::from_u64(entry.geometry.last());
            log::debug!(
                "GPT entry {}: sectors {}..{}, guid {}{}",
                index + 1,
                entry.geometry.start,
                entry.geometry.end(),
                unique_guid,
                if entry.bootable { " (EFI system)" } else { "" }
            );
        }

        header.partition_entry_array_crc32 = array.calculate_crc32();
        header.update_header_crc32();

        {
            let mut device = GptDevice::new(ImageBlocks::new(&mut image))
                .map_err(|e| gpt_error(&path, "open", e))?;
            device
                .write_protective_mbr(&mut [0u8; SECTOR_SIZE as usize])
                .map_err(|e| gpt_error(&path, "protective MBR", e))?;
            write_tables(&mut device, &header, &array, &path)?;
        }

        Ok(image)
    }
}

/// Replace the unique GUID of partition `number` (1-based) in both arrays
///
/// The image must already carry a GPT.
pub(crate) fn rewrite_partition_guid(
    image: &mut RawImage,
    number: u32,
    guid: [u8; 16],
) -> DiskResult<()> {
    let path = image.path().to_path_buf();
    let index = number
        .checked_sub(1)
        .ok_or_else(|| DiskError::table(&path, "partition numbers start at 1"))?;

    let mut device =
        GptDevice::new(ImageBlocks::new(image)).map_err(|e| gpt_error(&path, "open", e))?;
    let mut header = device
        .read_primary_gpt_header(&mut [0u8; SECTOR_SIZE as usize])
        .map_err(|e| gpt_error(&path, "primary header", e))?;
    let layout = header
        .get_partition_entry_array_layout()
        .map_err(|e| gpt_error(&path, "entry array layout", e))?;

    let array_bytes = u64::from(header.number_of_partition_entries.to_u32())
        * u64::from(header.size_of_partition_entry.to_u32());
    let mut storage = vec![0u8; array_bytes.div_ceil(SECTOR_SIZE) as usize * SECTOR_SIZE as usize];
    let mut array = device
        .read_gpt_partition_entry_array(layout, &mut storage)
        .map_err(|e| gpt_error(&path, "entry array", e))?;

    let entry = array
        .get_partition_entry_mut(index)
        .filter(|e| e.is_used())
        .ok_or_else(|| DiskError::table(&path, format!("no GPT partition {}", number)))?;
    let guid = Guid::from_bytes(guid);
    entry.unique_partition_guid = guid;
    log::debug!("GPT partition {} guid set to {}", number, guid);

    header.partition_entry_array_crc32 = array.calculate_crc32();
    header.update_header_crc32();
    write_tables(&mut device, &header, &array, &path)
}

/// Write primary and secondary headers and entry arrays, then flush
fn write_tables<B: BlockIo>(
    device: &mut GptDevice<B>,
    header: &GptHeader,
    array: &GptPartitionEntryArray,
    path: &Path,
) -> DiskResult<()> {
    device
        .write_primary_gpt_header(header, &mut [0u8; SECTOR_SIZE as usize])
        .map_err(|e| gpt_error(path, "primary header", e))?;
    device
        .write_gpt_partition_entry_array(array)
        .map_err(|e| gpt_error(path, "primary entry array", e))?;

    // Secondary array sits directly in front of the secondary header
    let mut secondary = header.clone();
    secondary.my_lba = header.alternate_lba;
    secondary.alternate_lba = header.my_lba;
    secondary.partition_entry_lba =
        LbaLe::from_u64(header.alternate_lba.to_u64() - ENTRY_ARRAY_SECTORS);
    secondary.update_header_crc32();

    device
        .write_secondary_gpt_header(&secondary, &mut [0u8; SECTOR_SIZE as usize])
        .map_err(|e| gpt_error(path, "secondary header", e))?;

    let layout = secondary
        .get_partition_entry_array_layout()
        .map_err(|e| gpt_error(path, "secondary entry array layout", e))?;
    let mut storage = array.storage().to_vec();
    let secondary_array = GptPartitionEntryArray::new(layout, BlockSize::BS_512, &mut storage)
        .map_err(|e| gpt_error(path, "secondary entry array", e))?;
    device
        .write_gpt_partition_entry_array(&secondary_array)
        .map_err(|e| gpt_error(path, "secondary entry array", e))?;

    device.flush().map_err(|e| gpt_error(path, "flush", e))
}

/// Stable per-entry GUID for partitions without an identity
fn derived_guid(disk_guid: Guid, index: usize) -> Guid {
    let mut bytes = disk_guid.to_bytes();
    let tag = (index as u32 + 1).to_le_bytes();
    for (byte, t) in bytes[12..].iter_mut().zip(tag) {
        *byte ^= t;
    }
    Guid::from_bytes(bytes)
}

fn gpt_error(path: &Path, stage: &str, err: impl fmt::Debug) -> DiskError {
    DiskError::table(path, format!("GPT {}: {:?}", stage, err))
}
