//! Shared fixtures for the integration tests

#![allow(dead_code)] // Not every test file uses every fixture

use p2v_disk::units::mebibytes;
use p2v_disk::{Device, Identity, Volume, VolumeRole};

pub const MIB: u64 = mebibytes(1);

/// Volume from an MBR disk with signature `signature`, at `offset_mib`
pub fn mbr_volume(name: &str, signature: [u8; 4], offset_mib: u64, length_mib: u64) -> Volume {
    Volume::new(name)
        .with_identity(Identity::mbr_partition(signature, offset_mib * MIB))
        .with_device(Device::new(format!("/dev/{}", name), length_mib * MIB))
}

/// Volume from a GPT disk, `length` bytes long
pub fn gpt_volume(name: &str, guid: &str, length: u64) -> Volume {
    Volume::new(name)
        .with_identity(Identity::from_guid_str(guid).expect("valid test GUID"))
        .with_device(Device::new(format!("/dev/{}", name), length))
}

pub fn system(volume: Volume) -> Volume {
    volume.with_drive("C:").with_role(VolumeRole::new(true, true))
}
