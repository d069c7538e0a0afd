//! # p2v-disk
//!
//! Partition layout model and MBR/GPT table codec for physical-to-virtual
//! disk conversion.
//!
//! A P2V source reports its volumes, each with the identity it had on its
//! original disk (MBR signature + offset, or GPT GUID). This crate turns
//! those volumes into validated disk layouts and writes the layouts onto
//! target images so that the volumes land where Windows expects them.
//!
//! # Pipeline
//!
//! ```text
//! Volume (+ Device) ──▶ make_disk_array ──▶ Disk ──▶ table::format ──▶ image
//!                                            │
//!                                            └──▶ save_disks / load_disks (JSON)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use p2v_disk::{make_disk_array, table, Device, Identity, Volume};
//!
//! let volume = Volume::new("{0f1e2d3c-...}")
//!     .with_drive("C:")
//!     .with_identity(Identity::mbr_partition([0x78, 0x56, 0x34, 0x12], 1 << 20))
//!     .with_device(Device::new("/dev/nbd0", 40 << 30));
//!
//! for (i, disk) in make_disk_array(&[volume])?.iter().enumerate() {
//!     let path = format!("disk{}.img", i);
//!     table::RawImage::create(&path, disk.length())?;
//!     table::format(&path, disk)?;
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `table` (default): the partition table codec and its `gpt_disk_io`
//!   dependency. Without it the crate is the pure layout model.

pub mod builder;
pub mod disk;
pub mod error;
pub mod identity;
pub mod partition;
pub mod sectors;
pub mod units;
pub mod volume;

#[cfg(feature = "table")]
pub mod table;

pub use builder::{
    make_disk_array, make_disk_array_with, make_gpt_disk, make_gpt_disk_with, make_mbr_disk,
    make_mbr_disk_with, LayoutOptions,
};
pub use disk::{load_disks, save_disks, Disk, DiskBuilder, LabelKind};
pub use error::{DiskError, DiskResult, ErrorCategory, SanityViolation};
pub use identity::{Flavor, Identity};
pub use partition::{Partition, PartitionStyle, DEFAULT_ALIGNMENT};
pub use volume::{Device, Volume, VolumeRole};
