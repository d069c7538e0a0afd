//! MBR table writer
//!
//! Writes the four-entry table in the boot sector and, when an extended
//! partition is present, the chain of extended boot records (EBRs) that
//! links its logical partitions.
//!
//! # EBR Chain Layout
//!
//! - The first EBR sits in the first sector of the extended partition.
//! - Every later EBR sits in the sector immediately before its logical
//!   partition (the overhead [`PartitionStyle::Logical`] reserves).
//! - Entry 0 of an EBR locates its logical partition relative to the EBR.
//! - Entry 1 locates the next EBR relative to the start of the extended
//!   partition, with a length running to the end of the next logical one.
//!
//! The bootstrap code area and disk signature of an existing boot sector are
//! preserved; only the table and the boot signature are replaced.
//!
//! [`PartitionStyle::Logical`]: crate::partition::PartitionStyle::Logical

use crate::error::{DiskError, DiskResult};
use crate::sectors::SECTOR_SIZE;

use super::label::{EntryKind, EntrySpec, Geometry, Label};
use super::raw::RawImage;
use super::{
    BOOT_SIGNATURE, BOOT_SIGNATURE_OFFSET, MBR_PARTITION_ENTRY_LENGTH, MBR_PARTITION_TABLE_OFFSET,
};

/// Primary slots in a boot sector
pub const MAX_PRIMARY_PARTITIONS: usize = 4;

/// NTFS / exFAT / IFS
pub const TYPE_NTFS: u8 = 0x07;
/// Linux native
pub const TYPE_LINUX: u8 = 0x83;
/// Extended partition, LBA addressed
pub const TYPE_EXTENDED_LBA: u8 = 0x0F;
/// Link to the next EBR
pub const TYPE_EXTENDED: u8 = 0x05;
/// GPT protective entry
pub const TYPE_GPT_PROTECTIVE: u8 = 0xEE;

const BOOT_INDICATOR: u8 = 0x80;

/// An MBR partition table being assembled for one image
#[derive(Debug)]
pub struct MbrLabel {
    image: RawImage,
    primaries: Vec<EntrySpec>,
    logicals: Vec<EntrySpec>,
}

impl MbrLabel {
    fn extended(&self) -> Option<&EntrySpec> {
        self.primaries.iter().find(|e| e.kind == EntryKind::Extended)
    }

    fn out_of_range(&self, geometry: Geometry, limit: u64) -> DiskError {
        DiskError::GeometryOutOfRange {
            path: self.image.path().to_path_buf(),
            start_sector: geometry.start,
            end_sector: geometry.end(),
            limit,
        }
    }

    /// 32-bit LBA fields and the image end bound every entry
    fn check_fits(&self, geometry: Geometry) -> DiskResult<()> {
        let lba_limit = u64::from(u32::MAX) + 1;
        if geometry.end() > lba_limit {
            return Err(self.out_of_range(geometry, lba_limit));
        }
        if geometry.end() > self.image.sectors() {
            return Err(self.out_of_range(geometry, self.image.sectors()));
        }
        if geometry.start == 0 {
            return Err(DiskError::table(
                self.image.path(),
                "partition overlaps the boot sector",
            ));
        }
        Ok(())
    }

    fn add_logical(&mut self, entry: EntrySpec) -> DiskResult<()> {
        let extended = self
            .extended()
            .map(|e| e.geometry)
            .ok_or_else(|| {
                DiskError::table(
                    self.image.path(),
                    "logical partition added before an extended partition",
                )
            })?;

        let geometry = entry.geometry;
        if geometry.start <= extended.start || geometry.end() > extended.end() {
            return Err(self.out_of_range(geometry, extended.end()));
        }
        if let Some(previous) = self.logicals.last() {
            // Room for this partition's EBR after the previous one
            if geometry.start - 1 < previous.geometry.end() {
                return Err(DiskError::table(
                    self.image.path(),
                    format!(
                        "logical partition at sector {} leaves no room for its EBR",
                        geometry.start
                    ),
                ));
            }
        }

        self.logicals.push(entry);
        Ok(())
    }
}

impl Label for MbrLabel {
    fn fresh(image: RawImage) -> DiskResult<Self> {
        if image.size() < SECTOR_SIZE {
            return Err(DiskError::ImageTooSmall {
                path: image.path().to_path_buf(),
                required: SECTOR_SIZE,
                actual: image.size(),
            });
        }
        Ok(Self {
            image,
            primaries: Vec::new(),
            logicals: Vec::new(),
        })
    }

    fn add_partition(&mut self, entry: EntrySpec) -> DiskResult<()> {
        self.check_fits(entry.geometry)?;

        match entry.kind {
            EntryKind::Logical => self.add_logical(entry),
            EntryKind::Normal | EntryKind::Extended => {
                if self.primaries.len() == MAX_PRIMARY_PARTITIONS {
                    return Err(DiskError::table(
                        self.image.path(),
                        "MBR holds at most four primary partitions",
                    ));
                }
                if entry.kind == EntryKind::Extended && self.extended().is_some() {
                    return Err(DiskError::table(
                        self.image.path(),
                        "MBR holds at most one extended partition",
                    ));
                }
                self.primaries.push(entry);
                Ok(())
            }
        }
    }

    fn commit(self) -> DiskResult<RawImage> {
        let MbrLabel {
            mut image,
            primaries,
            logicals,
        } = self;

        let mut boot_sector = [0u8; SECTOR_SIZE as usize];
        image.read_exact_at(&mut boot_sector, 0)?;
        boot_sector[MBR_PARTITION_TABLE_OFFSET as usize..].fill(0);

        for (slot, entry) in primaries.iter().enumerate() {
            let kind = match entry.kind {
                EntryKind::Extended => TYPE_EXTENDED_LBA,
                _ => data_type(entry),
            };
            let raw = RawEntry::absolute(entry.bootable, kind, entry.geometry);
            log::debug!(
                "MBR slot {}: type {:#04x}, sectors {}..{}{}",
                slot + 1,
                kind,
                entry.geometry.start,
                entry.geometry.end(),
                if entry.bootable { " (boot)" } else { "" }
            );
            raw.write_to(&mut boot_sector, slot);
        }
        boot_sector[BOOT_SIGNATURE_OFFSET..].copy_from_slice(&BOOT_SIGNATURE);
        image.write_at(&boot_sector, 0)?;

        // A leftover GPT header would win over this table when read back
        if image.size() >= 2 * SECTOR_SIZE {
            let mut gpt_signature = [0u8; 8];
            image.read_exact_at(&mut gpt_signature, SECTOR_SIZE)?;
            if &gpt_signature == b"EFI PART" {
                log::debug!("clearing stale GPT header on {:?}", image.path());
                image.write_at(&[0u8; SECTOR_SIZE as usize], SECTOR_SIZE)?;
            }
        }

        if let Some(extended) = primaries.iter().find(|e| e.kind == EntryKind::Extended) {
            write_ebr_chain(&mut image, extended.geometry, &logicals)?;
        }

        image.sync()?;
        Ok(image)
    }
}

fn data_type(entry: &EntrySpec) -> u8 {
    if entry.has_volume {
        TYPE_NTFS
    } else {
        TYPE_LINUX
    }
}

fn ebr_sector(index: usize, extended: Geometry, logical: &EntrySpec) -> u64 {
    if index == 0 {
        extended.start
    } else {
        logical.geometry.start - 1
    }
}

fn write_ebr_chain(image: &mut RawImage, extended: Geometry, logicals: &[EntrySpec]) -> DiskResult<()> {
    if logicals.is_empty() {
        // An empty chain still needs a terminating EBR
        let mut ebr = [0u8; SECTOR_SIZE as usize];
        ebr[BOOT_SIGNATURE_OFFSET..].copy_from_slice(&BOOT_SIGNATURE);
        return image.write_at(&ebr, extended.start * SECTOR_SIZE);
    }

    for (index, logical) in logicals.iter().enumerate() {
        let ebr_lba = ebr_sector(index, extended, logical);
        let mut ebr = [0u8; SECTOR_SIZE as usize];

        RawEntry::relative(
            logical.bootable,
            data_type(logical),
            logical.geometry.start,
            logical.geometry.length,
            ebr_lba,
        )
        .write_to(&mut ebr, 0);

        if let Some(next) = logicals.get(index + 1) {
            let next_ebr = ebr_sector(index + 1, extended, next);
            RawEntry::relative(
                false,
                TYPE_EXTENDED,
                next_ebr,
                next.geometry.end() - next_ebr,
                extended.start,
            )
            .write_to(&mut ebr, 1);
        }

        ebr[BOOT_SIGNATURE_OFFSET..].copy_from_slice(&BOOT_SIGNATURE);
        log::debug!(
            "EBR at sector {}: logical sectors {}..{}",
            ebr_lba,
            logical.geometry.start,
            logical.geometry.end()
        );
        image.write_at(&ebr, ebr_lba * SECTOR_SIZE)?;
    }

    Ok(())
}

/// A 16-byte MBR / EBR table entry
struct RawEntry {
    bootable: bool,
    kind: u8,
    first: u64,
    last: u64,
    relative_start: u64,
    sectors: u64,
}

impl RawEntry {
    fn absolute(bootable: bool, kind: u8, geometry: Geometry) -> Self {
        Self::relative(bootable, kind, geometry.start, geometry.length, 0)
    }

    /// Entry whose LBA field counts from `base` instead of sector zero
    fn relative(bootable: bool, kind: u8, start: u64, length: u64, base: u64) -> Self {
        Self {
            bootable,
            kind,
            first: start,
            last: (start + length).saturating_sub(1),
            relative_start: start - base,
            sectors: length,
        }
    }

    fn write_to(&self, sector: &mut [u8], slot: usize) {
        let offset = MBR_PARTITION_TABLE_OFFSET as usize + slot * MBR_PARTITION_ENTRY_LENGTH;
        let entry = &mut sector[offset..offset + MBR_PARTITION_ENTRY_LENGTH];

        entry[0] = if self.bootable { BOOT_INDICATOR } else { 0 };
        entry[1..4].copy_from_slice(&chs(self.first));
        entry[4] = self.kind;
        entry[5..8].copy_from_slice(&chs(self.last));
        // Range checked when the entry was added
        entry[8..12].copy_from_slice(&(self.relative_start as u32).to_le_bytes());
        entry[12..16].copy_from_slice(&(self.sectors as u32).to_le_bytes());
    }
}

/// Cylinder/head/sector address of an LBA, 255 heads × 63 sectors geometry
///
/// Addresses beyond cylinder 1023 get the conventional `FE FF FF` marker.
fn chs(lba: u64) -> [u8; 3] {
    const HEADS: u64 = 255;
    const SECTORS_PER_TRACK: u64 = 63;

    let cylinder = lba / (HEADS * SECTORS_PER_TRACK);
    if cylinder > 1023 {
        return [0xFE, 0xFF, 0xFF];
    }
    let head = (lba / SECTORS_PER_TRACK) % HEADS;
    let sector = lba % SECTORS_PER_TRACK + 1;
    [
        head as u8,
        (sector as u8) | (((cylinder >> 2) & 0xC0) as u8),
        (cylinder & 0xFF) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(kind: EntryKind, start: u64, length: u64) -> EntrySpec {
        EntrySpec {
            kind,
            geometry: Geometry { start, length },
            bootable: false,
            has_volume: kind != EntryKind::Extended,
            unique_guid: None,
        }
    }

    fn entry(sector: &[u8], slot: usize) -> &[u8] {
        let offset = MBR_PARTITION_TABLE_OFFSET as usize + slot * 16;
        &sector[offset..offset + 16]
    }

    fn le32(bytes: &[u8]) -> u32 {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_chs() {
        assert_eq!(chs(0), [0, 1, 0]);
        assert_eq!(chs(2048), [32, 33, 0]);
        assert_eq!(chs(u64::from(u32::MAX)), [0xFE, 0xFF, 0xFF]);
    }

    #[test]
    fn test_primary_table_and_bootstrap_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mbr.img");
        let mut image = RawImage::create(&path, 8 << 20).unwrap();
        image.write_at(&[0x33; 440], 0).unwrap();

        let mut label = MbrLabel::fresh(image).unwrap();
        let mut boot = spec(EntryKind::Normal, 2048, 4096);
        boot.bootable = true;
        label.add_partition(boot).unwrap();
        label
            .add_partition(EntrySpec {
                has_volume: false,
                ..spec(EntryKind::Normal, 6144, 2048)
            })
            .unwrap();
        let image = label.commit().unwrap();

        let mut sector = [0u8; 512];
        image.read_exact_at(&mut sector, 0).unwrap();
        assert_eq!(&sector[..440], &[0x33; 440][..]);
        assert_eq!(&sector[510..], &[0x55, 0xAA]);

        let first = entry(&sector, 0);
        assert_eq!(first[0], 0x80);
        assert_eq!(first[4], TYPE_NTFS);
        assert_eq!(le32(&first[8..]), 2048);
        assert_eq!(le32(&first[12..]), 4096);

        let second = entry(&sector, 1);
        assert_eq!(second[0], 0);
        assert_eq!(second[4], TYPE_LINUX);
        assert_eq!(entry(&sector, 2), &[0u8; 16][..]);
    }

    #[test]
    fn test_ebr_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ebr.img");
        let image = RawImage::create(&path, 16 << 20).unwrap();

        let mut label = MbrLabel::fresh(image).unwrap();
        label.add_partition(spec(EntryKind::Normal, 2048, 2048)).unwrap();
        label.add_partition(spec(EntryKind::Extended, 4096, 20480)).unwrap();
        label.add_partition(spec(EntryKind::Logical, 6144, 4096)).unwrap();
        label.add_partition(spec(EntryKind::Logical, 12288, 4096)).unwrap();
        let image = label.commit().unwrap();

        let mut sector = [0u8; 512];
        image.read_exact_at(&mut sector, 0).unwrap();
        assert_eq!(entry(&sector, 1)[4], TYPE_EXTENDED_LBA);

        // First EBR at the start of the extended partition
        let mut ebr = [0u8; 512];
        image.read_exact_at(&mut ebr, 4096 * 512).unwrap();
        assert_eq!(&ebr[510..], &[0x55, 0xAA]);
        assert_eq!(le32(&entry(&ebr, 0)[8..]), 6144 - 4096);
        assert_eq!(le32(&entry(&ebr, 0)[12..]), 4096);
        assert_eq!(entry(&ebr, 1)[4], TYPE_EXTENDED);
        assert_eq!(le32(&entry(&ebr, 1)[8..]), 12287 - 4096);
        assert_eq!(le32(&entry(&ebr, 1)[12..]), 12288 + 4096 - 12287);

        // Second EBR right before its logical partition, end of chain
        image.read_exact_at(&mut ebr, 12287 * 512).unwrap();
        assert_eq!(le32(&entry(&ebr, 0)[8..]), 1);
        assert_eq!(entry(&ebr, 1), &[0u8; 16][..]);
    }

    #[test]
    fn test_rejections() {
        let dir = tempdir().unwrap();
        let image = RawImage::create(dir.path().join("r.img"), 8 << 20).unwrap();
        let mut label = MbrLabel::fresh(image).unwrap();

        assert!(matches!(
            label.add_partition(spec(EntryKind::Logical, 4096, 1024)),
            Err(DiskError::TableCodec { .. })
        ));
        assert!(matches!(
            label.add_partition(spec(EntryKind::Normal, 2048, 1 << 20)),
            Err(DiskError::GeometryOutOfRange { .. })
        ));

        label.add_partition(spec(EntryKind::Extended, 2048, 8192)).unwrap();
        assert!(matches!(
            label.add_partition(spec(EntryKind::Extended, 10240, 1024)),
            Err(DiskError::TableCodec { .. })
        ));
        // Logical partition in the extended partition's first sector
        assert!(matches!(
            label.add_partition(spec(EntryKind::Logical, 2048, 1024)),
            Err(DiskError::GeometryOutOfRange { .. })
        ));
        label.add_partition(spec(EntryKind::Logical, 3072, 1024)).unwrap();
        assert!(matches!(
            label.add_partition(spec(EntryKind::Logical, 4096, 1024)),
            Err(DiskError::TableCodec { .. })
        ));

        for start in [10240, 11264, 12288] {
            label.add_partition(spec(EntryKind::Normal, start, 1024)).unwrap();
        }
        assert!(matches!(
            label.add_partition(spec(EntryKind::Normal, 13312, 1024)),
            Err(DiskError::TableCodec { .. })
        ));
    }

    #[test]
    fn test_tiny_image() {
        let dir = tempdir().unwrap();
        let image = RawImage::create(dir.path().join("t.img"), 100).unwrap();
        assert!(matches!(
            MbrLabel::fresh(image),
            Err(DiskError::ImageTooSmall { required: 512, .. })
        ));
    }
}
