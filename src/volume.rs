//! Source volumes
//!
//! A [`Volume`] is what the P2V source reported: a volume GUID, an optional
//! drive letter, whether it is the system and/or boot volume, and the
//! identity it had on its original disk. Once the volume's data has been
//! staged somewhere (an image file, an nbd device) a [`Device`] is bound to
//! it so the disk builders know how long the partition must be.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DiskError, DiskResult};
use crate::identity::{decode_hex, Identity};

/// Role flags as reported by Windows
///
/// The *system* volume holds the boot loader; the *boot* volume holds the
/// Windows directory. They are often, but not always, the same volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRole {
    pub system: bool,
    pub boot: bool,
}

impl VolumeRole {
    pub const fn new(system: bool, boot: bool) -> Self {
        Self { system, boot }
    }
}

/// Device bound to a volume
///
/// Opaque to the layout model apart from its length. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub path: PathBuf,
    pub length: u64,
}

impl Device {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A logical volume from the source machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub guid: String,
    pub drive: Option<String>,
    pub role: VolumeRole,
    pub identity: Option<Identity>,
    #[serde(skip)]
    device: Option<Device>,
}

impl Volume {
    pub fn new(guid: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            drive: None,
            role: VolumeRole::default(),
            identity: None,
            device: None,
        }
    }

    pub fn with_drive(mut self, drive: impl Into<String>) -> Self {
        self.drive = Some(drive.into());
        self
    }

    pub fn with_role(mut self, role: VolumeRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Bind the device holding this volume's data
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.guid
    }

    pub fn is_system_drive(&self) -> bool {
        self.role.system
    }

    /// The volume GUID as raw bytes
    ///
    /// Braces and dashes are stripped and the remaining hex digits decoded
    /// in textual order.
    pub fn guid_bytes(&self) -> DiskResult<Vec<u8>> {
        let digits: String = self
            .guid
            .chars()
            .filter(|c| !matches!(c, '{' | '}' | '-'))
            .collect();
        decode_hex(&digits)
    }

    /// Length of the bound device, or `MissingDevice`
    pub(crate) fn device_length(&self) -> DiskResult<u64> {
        self.device
            .as_ref()
            .map(|d| d.length)
            .ok_or_else(|| DiskError::MissingDevice {
                guid: self.guid.clone(),
            })
    }

    /// First volume in `volumes` with the given GUID
    pub fn find_by_guid<'a>(guid: &str, volumes: &'a [Volume]) -> Option<&'a Volume> {
        volumes.iter().find(|v| v.guid == guid)
    }
}

// The bound device is runtime state, not part of the volume's identity.
impl PartialEq for Volume {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
            && self.drive == other.drive
            && self.role == other.role
            && self.identity == other.identity
    }
}

impl Eq for Volume {}
