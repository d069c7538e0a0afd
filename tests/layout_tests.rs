//! Layout integration tests
//!
//! Volumes in, disks out, through the public API only:
//! - MBR, GPT and mixed disk arrays
//! - JSON persistence of whole disk arrays
//! - validation failures surfacing with their category

mod common;

use common::{gpt_volume, mbr_volume, system, MIB};
use p2v_disk::{
    load_disks, make_disk_array, make_gpt_disk, make_mbr_disk, save_disks, Disk, DiskError,
    ErrorCategory, Identity, PartitionStyle,
};
use tempfile::TempDir;

const SIG_A: [u8; 4] = [0x78, 0x56, 0x34, 0x12];
const SIG_B: [u8; 4] = [0xEF, 0xBE, 0xAD, 0xDE];

#[test]
fn test_mbr_disk_from_two_volumes() {
    let disk = make_mbr_disk(&[
        system(mbr_volume("c", SIG_A, 1, 100)),
        mbr_volume("d", SIG_A, 101, 50),
    ])
    .unwrap();

    assert_eq!(disk.length(), MIB + 100 * MIB + 50 * MIB);
    assert_eq!(disk.partitions().len(), 2);
    assert!(disk.logical_partitions().is_empty());
    assert_eq!(disk.identity(), Some(&Identity::MbrDisk(SIG_A)));
    assert_eq!(disk.partition_number_of_drive("C:"), Some(1));
    assert!(disk.is_boot_disk());
}

#[test]
fn test_mbr_disk_with_logical_volumes() {
    let disk = make_mbr_disk(&[
        mbr_volume("a", SIG_A, 1, 10),
        mbr_volume("b", SIG_A, 11, 10),
        mbr_volume("c", SIG_A, 21, 10),
        mbr_volume("d", SIG_A, 32, 10),
        mbr_volume("e", SIG_A, 43, 5),
    ])
    .unwrap();

    assert_eq!(disk.partitions().len(), 4);
    let extended = &disk.partitions()[3];
    assert_eq!(extended.style(), PartitionStyle::Extended);
    assert_eq!(extended.offset(), 31 * MIB);

    let logical: Vec<_> = disk
        .logical_partitions()
        .iter()
        .map(|p| (p.offset(), p.volume_name().unwrap()))
        .collect();
    assert_eq!(logical, vec![(32 * MIB, "d"), (43 * MIB, "e")]);
    assert_eq!(disk.length(), 48 * MIB);
    assert_eq!(disk.all_partitions().count(), 6);
}

#[test]
fn test_logical_volume_inside_boot_header_rejected() {
    // Extended would start at 31 MiB; a logical volume there has no room
    // for the 1 MiB header in front of it
    let err = make_mbr_disk(&[
        mbr_volume("a", SIG_A, 1, 10),
        mbr_volume("b", SIG_A, 11, 10),
        mbr_volume("c", SIG_A, 21, 10),
        mbr_volume("d", SIG_A, 31, 10),
    ])
    .unwrap_err();
    assert!(matches!(err, DiskError::LogicalBoundsExceeded { .. }));
    assert_eq!(err.category(), ErrorCategory::Validation);
}

#[test]
fn test_gpt_disk_rounds_partitions() {
    let disk = make_gpt_disk(&[
        gpt_volume("efi", "c12a7328-f81f-11d2-ba4b-00a0c93ec93b", 100 * MIB - 4096),
        gpt_volume("data", "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7", 3 * MIB + 1),
    ])
    .unwrap();

    let spans: Vec<_> = disk
        .partitions()
        .iter()
        .map(|p| (p.offset() / MIB, p.length() / MIB))
        .collect();
    assert_eq!(spans, vec![(1, 100), (101, 4)]);
    assert_eq!(disk.length(), 105 * MIB + 33 * 512);
    assert_eq!(
        disk.partitions()[1]
            .identity()
            .and_then(Identity::guid_string)
            .as_deref(),
        Some("ebd0a0a2-b9e5-4433-87c0-68b6b72699c7")
    );
}

#[test]
fn test_disk_array_splits_by_signature() {
    let volumes = [
        mbr_volume("b2", SIG_B, 30, 10),
        mbr_volume("a1", SIG_A, 1, 20),
        gpt_volume("g1", "01234567-89ab-cdef-0123-456789abcdef", 8 * MIB),
        mbr_volume("b1", SIG_B, 1, 10),
    ];

    let disks = make_disk_array(&volumes).unwrap();
    assert_eq!(disks.len(), 3);

    // Groups appear in first-seen order, sorted by offset within a group
    assert_eq!(disks[0].identity(), Some(&Identity::MbrDisk(SIG_B)));
    let offsets: Vec<_> = disks[0].partitions().iter().map(|p| p.offset()).collect();
    assert_eq!(offsets, vec![MIB, 30 * MIB]);

    assert_eq!(disks[1].identity(), Some(&Identity::MbrDisk(SIG_A)));
    assert!(disks[2].is_gpt());
}

#[test]
fn test_save_and_load_disk_array() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("disks.json");

    let disks = make_disk_array(&[
        system(mbr_volume("a", SIG_A, 1, 10)),
        mbr_volume("b", SIG_A, 11, 10),
        mbr_volume("c", SIG_A, 21, 10),
        mbr_volume("d", SIG_A, 32, 10),
        gpt_volume("g", "01234567-89ab-cdef-0123-456789abcdef", 2 * MIB),
    ])
    .unwrap();

    save_disks(&path, &disks).unwrap();
    let loaded = load_disks(&path).unwrap();
    assert_eq!(loaded, disks);

    // Devices are runtime state and do not survive persistence
    assert!(loaded[0].partitions()[0].device().is_none());

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"mbr.disk/78563412\""));
    assert!(text.contains("\"logical_partitions\""));
}

#[test]
fn test_load_rejects_invalid_layout() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bad.json");
    std::fs::write(
        &path,
        r#"[{
            "length": 1048576,
            "identity": null,
            "partitions": [{
                "offset": 1048576, "length": 1048576, "style": "primary",
                "identity": null, "volume": null, "alignment": 1048576
            }],
            "logical_partitions": []
        }]"#,
    )
    .unwrap();

    let err = load_disks(&path).unwrap_err();
    assert!(matches!(
        err,
        DiskError::LengthExceeded {
            end: 2097152,
            length: 1048576
        }
    ));
    assert_eq!(err.category(), ErrorCategory::Validation);

    std::fs::write(&path, r#"[{ "length": 1048576 }]"#).unwrap();
    assert_eq!(
        load_disks(&path).unwrap_err().category(),
        ErrorCategory::Codec
    );
}

#[test]
fn test_encode_decode_disk() {
    let disk = make_mbr_disk(&[system(mbr_volume("a", SIG_A, 1, 10))]).unwrap();
    let encoded = disk.encode().unwrap();
    assert_eq!(encoded["partitions"][0]["volume"]["drive"], "C:");
    assert_eq!(Disk::decode(&encoded).unwrap(), disk);
}

#[test]
fn test_volume_past_address_space_rejected() {
    let last = u64::MAX & !(MIB - 1);
    let volumes = [
        mbr_volume("a", SIG_A, 1, 10),
        mbr_volume("b", SIG_A, 11, 10),
        mbr_volume("c", SIG_A, 21, 10),
        mbr_volume("d", SIG_A, last / MIB, 2),
    ];

    for err in [
        make_mbr_disk(&volumes).unwrap_err(),
        make_disk_array(&volumes).unwrap_err(),
    ] {
        assert!(matches!(err, DiskError::AddressOverflow { .. }));
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
}
