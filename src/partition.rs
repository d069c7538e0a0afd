//! Partition records
//!
//! A [`Partition`] is one entry of a disk layout: a style, a byte range, the
//! alignment that range must honour, and optionally the identity and volume
//! it carries.
//!
//! # Partition Styles
//!
//! - **Primary**: an ordinary MBR table entry
//! - **Extended**: the MBR container entry that logical partitions live in
//! - **Logical**: a partition inside the extended container, addressed
//!   through a chain of extended boot records (EBRs)
//! - **Gpt**: an entry in a GUID partition table
//!
//! Logical partitions are the only style with per-partition overhead: the
//! sector immediately before each one is reserved for the EBR that points at
//! it. That overhead is what [`Partition::precedes`] leaves room for.
//!
//! # Validation
//!
//! Every constructor, including deserialization, runs the same checks:
//! offset and length are multiples of the alignment, the length is non-zero,
//! and the offset leaves room for the style's overhead. A `Partition` value
//! that exists is therefore always well formed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DiskError, DiskResult, SanityViolation};
use crate::identity::Identity;
use crate::sectors::sector_bytes;
use crate::units::{mebibytes, AlignedOffset};
use crate::volume::{Device, Volume};

/// Default partition alignment
pub const DEFAULT_ALIGNMENT: u64 = mebibytes(1);

/// Partition style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStyle {
    Primary,
    Extended,
    Logical,
    Gpt,
}

impl PartitionStyle {
    /// Bytes reserved immediately in front of a partition of this style
    pub const fn overhead(&self) -> u64 {
        match self {
            PartitionStyle::Logical => sector_bytes(1),
            PartitionStyle::Primary | PartitionStyle::Extended | PartitionStyle::Gpt => 0,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            PartitionStyle::Primary => "primary",
            PartitionStyle::Extended => "extended",
            PartitionStyle::Logical => "logical",
            PartitionStyle::Gpt => "gpt",
        }
    }
}

impl fmt::Display for PartitionStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PartitionRecord", into = "PartitionRecord")]
pub struct Partition {
    style: PartitionStyle,
    offset: u64,
    length: u64,
    alignment: u64,
    identity: Option<Identity>,
    volume: Option<Volume>,
}

impl Partition {
    /// Create a partition aligned to [`DEFAULT_ALIGNMENT`]
    pub fn new(style: PartitionStyle, offset: u64, length: u64) -> DiskResult<Self> {
        Self::with_alignment(style, offset, length, DEFAULT_ALIGNMENT)
    }

    /// Create a partition with an explicit alignment
    ///
    /// # Errors
    ///
    /// - `InvalidAlignment` if `alignment` is zero
    /// - `MisalignedOffset` / `MisalignedLength` if either value is off the
    ///   alignment grid
    /// - `InsufficientOffset` if `offset` is below the style's overhead
    /// - `NonPositiveLength` if `length` is zero
    /// - `AddressOverflow` if the partition would end past `u64::MAX`
    pub fn with_alignment(
        style: PartitionStyle,
        offset: u64,
        length: u64,
        alignment: u64,
    ) -> DiskResult<Self> {
        if alignment == 0 {
            return Err(DiskError::InvalidAlignment { alignment });
        }
        if !AlignedOffset::new(offset, alignment).is_aligned() {
            return Err(DiskError::MisalignedOffset { offset, alignment });
        }
        if !AlignedOffset::new(length, alignment).is_aligned() {
            return Err(DiskError::MisalignedLength { length, alignment });
        }
        if offset < style.overhead() {
            return Err(DiskError::InsufficientOffset {
                style,
                offset,
                minimum: style.overhead(),
            });
        }
        if length == 0 {
            return Err(DiskError::NonPositiveLength { offset });
        }
        if offset.checked_add(length).is_none() {
            return Err(DiskError::AddressOverflow { offset, length });
        }

        Ok(Self {
            style,
            offset,
            length,
            alignment,
            identity: None,
            volume: None,
        })
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_volume(mut self, volume: Option<Volume>) -> Self {
        self.volume = volume;
        self
    }

    pub fn style(&self) -> PartitionStyle {
        self.style
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// First byte past the partition
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn volume(&self) -> Option<&Volume> {
        self.volume.as_ref()
    }

    pub fn device(&self) -> Option<&Device> {
        self.volume.as_ref().and_then(Volume::device)
    }

    pub fn volume_name(&self) -> DiskResult<&str> {
        self.volume
            .as_ref()
            .map(Volume::name)
            .ok_or(DiskError::MissingVolume {
                offset: self.offset,
            })
    }

    /// Whether this partition could sit on the same disk as `other`
    ///
    /// A partition without an identity is congruent with anything.
    pub fn congruent(&self, other: &Partition) -> bool {
        match &self.identity {
            Some(identity) => identity.congruent(other.identity.as_ref()),
            None => true,
        }
    }

    /// Whether this partition ends before `other` begins, leaving room for
    /// `other`'s overhead
    pub fn precedes(&self, other: &Partition) -> bool {
        self.end().saturating_add(other.style.overhead()) <= other.offset
    }

    pub fn succeeds(&self, other: &Partition) -> bool {
        self.offset >= other.end()
    }

    /// Whether the bound volume is the system volume
    pub fn is_boot_partition(&self) -> bool {
        self.volume.as_ref().is_some_and(Volume::is_system_drive)
    }

    /// Check ordering and style rules across a partition list
    ///
    /// Adjacent pairs must be congruent and strictly ordered by
    /// [`precedes`](Self::precedes). At most one extended partition may
    /// appear, and a list is either entirely logical or entirely
    /// non-logical.
    pub fn check_sanity(partitions: &[Partition]) -> Result<(), SanityViolation> {
        let Some(first) = partitions.first() else {
            return Ok(());
        };

        let mut extended = first.style == PartitionStyle::Extended;
        let logical = first.style == PartitionStyle::Logical;

        for (i, pair) in partitions.windows(2).enumerate() {
            let (current, next) = (&pair[0], &pair[1]);
            let index = i + 1;

            if !current.congruent(next) {
                log::debug!("partitions are not congruent at {}", index);
                return Err(SanityViolation::NotCongruent { index });
            }
            if !current.precedes(next) {
                log::debug!("partition offset / length mismatch at {}", index);
                return Err(SanityViolation::Overlapping { index });
            }
            if next.style == PartitionStyle::Extended {
                if extended {
                    return Err(SanityViolation::MultipleExtended { index });
                }
                extended = true;
            }
            if (next.style == PartitionStyle::Logical) != logical {
                return Err(SanityViolation::MixedLogical { index });
            }
        }

        Ok(())
    }

    /// Whether an ordered list lies within `[start, end)`
    ///
    /// Only the first offset and the last end are inspected, so the list
    /// should already have passed [`check_sanity`](Self::check_sanity).
    /// An empty list is never in bounds.
    pub fn check_bounds(start: u64, end: u64, partitions: &[Partition]) -> bool {
        match (partitions.first(), partitions.last()) {
            (Some(first), Some(last)) => first.offset >= start && last.end() <= end,
            _ => false,
        }
    }
}

/// Persisted form of a partition
///
/// Decoding goes through [`Partition::with_alignment`], never around it.
#[derive(Serialize, Deserialize)]
pub(crate) struct PartitionRecord {
    offset: u64,
    length: u64,
    style: PartitionStyle,
    identity: Option<Identity>,
    volume: Option<Volume>,
    #[serde(default = "default_alignment")]
    alignment: u64,
}

fn default_alignment() -> u64 {
    DEFAULT_ALIGNMENT
}

impl TryFrom<PartitionRecord> for Partition {
    type Error = DiskError;

    fn try_from(record: PartitionRecord) -> Result<Self, Self::Error> {
        Ok(
            Partition::with_alignment(record.style, record.offset, record.length, record.alignment)?
                .with_identity(record.identity)
                .with_volume(record.volume),
        )
    }
}

impl From<Partition> for PartitionRecord {
    fn from(p: Partition) -> Self {
        Self {
            offset: p.offset,
            length: p.length,
            style: p.style,
            identity: p.identity,
            volume: p.volume,
            alignment: p.alignment,
        }
    }
}
