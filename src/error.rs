//! Error types for layout modelling and table codec operations
//!
//! # Why One Error Type?
//!
//! A P2V conversion moves a layout through several stages: identities are
//! decoded, partitions and disks are validated, the model is persisted, and
//! finally it is written onto an image. A single enum with specific variants
//! lets callers match on exactly what went wrong at any stage, while
//! [`DiskError::category`] recovers the coarse grouping (validation, codec,
//! table codec, pre-write guard) when that is all a caller cares about.
//!
//! None of these errors are retried internally. Every one of them means the
//! input model or the target image is wrong, and the variant carries the
//! offsets, lengths, styles and paths needed to say how.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::identity::{Flavor, Identity};
use crate::partition::PartitionStyle;

/// Result type for layout and table operations
pub type DiskResult<T> = Result<T, DiskError>;

/// Coarse grouping of [`DiskError`] variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Identity, partition or disk invariant violated by the input model
    Validation,
    /// Persisted form could not be decoded into a model
    Codec,
    /// The image, device or label on it could not be used
    TableCodec,
    /// A write was refused before touching the target
    Guard,
}

/// Which ordering rule a partition list broke
///
/// `index` is the position (0-based) of the second partition of the
/// offending pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanityViolation {
    /// The pair belongs to different disks according to their identities
    NotCongruent { index: usize },
    /// The pair overlaps, is out of order, or leaves no room for overhead
    Overlapping { index: usize },
    /// A second extended partition was found
    MultipleExtended { index: usize },
    /// Logical and non-logical partitions were mixed in one list
    MixedLogical { index: usize },
}

impl fmt::Display for SanityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanityViolation::NotCongruent { index } => {
                write!(f, "partition {} is not congruent with its predecessor", index)
            }
            SanityViolation::Overlapping { index } => {
                write!(f, "partition {} does not follow its predecessor", index)
            }
            SanityViolation::MultipleExtended { index } => {
                write!(f, "partition {} is a second extended partition", index)
            }
            SanityViolation::MixedLogical { index } => {
                write!(f, "partition {} mixes logical and non-logical styles", index)
            }
        }
    }
}

/// Errors that can occur while building, persisting or writing a disk layout
#[derive(Debug)]
pub enum DiskError {
    /// Identity flavor tag is not one of `mbr.disk`, `mbr.partition`, `gpt`
    UnknownFlavor { flavor: String },

    /// Identity bytes do not match the fixed size of their flavor
    InvalidLength {
        flavor: Flavor,
        expected: usize,
        actual: usize,
    },

    /// Encoded identity is not of the form `<flavor>/<hex>`
    MalformedIdentity { encoded: String },

    /// Hex payload contains non-hex characters or an odd digit count
    MalformedHex { text: String },

    /// GUID string is not in canonical dashed form
    MalformedGuid { guid: String },

    /// Partition alignment of zero
    InvalidAlignment { alignment: u64 },

    /// Partition offset is not a multiple of its alignment
    MisalignedOffset { offset: u64, alignment: u64 },

    /// Partition length is not a multiple of its alignment
    MisalignedLength { length: u64, alignment: u64 },

    /// Partition offset leaves no room for its per-style overhead
    ///
    /// # Why This Happens
    /// Logical partitions need one sector in front of them for the extended
    /// boot record that points at them.
    InsufficientOffset {
        style: PartitionStyle,
        offset: u64,
        minimum: u64,
    },

    /// Partition of zero length
    NonPositiveLength { offset: u64 },

    /// A partition list is not ordered, congruent, or consistently styled
    SanityCheckFailed {
        list: &'static str,
        violation: SanityViolation,
    },

    /// Logical partitions given without exactly one extended partition
    MissingExtendedPartition,

    /// Logical partitions do not fit inside the extended partition
    LogicalBoundsExceeded {
        start: u64,
        end: u64,
        lower: u64,
        upper: u64,
    },

    /// Disk identity and first partition identity disagree
    IdentityMismatch { disk: Identity, partition: Identity },

    /// A partition or disk end does not fit in a 64-bit byte address
    AddressOverflow { offset: u64, length: u64 },

    /// Last partition ends beyond the declared disk length
    LengthExceeded { end: u64, length: u64 },

    /// A disk builder was handed no volumes
    NoVolumes,

    /// A volume passed to a disk builder carries no identity
    MissingIdentity { guid: String },

    /// A volume passed to a disk builder has no bound device
    MissingDevice { guid: String },

    /// A volume's identity flavor is not the one the builder needs
    UnexpectedFlavor {
        guid: String,
        expected: Flavor,
        found: Flavor,
    },

    /// A partition has no bound volume where one is required
    MissingVolume { offset: u64 },

    /// Persisted disk model is structurally invalid
    Codec { reason: String },

    /// I/O error reading or writing the target
    Io(io::Error),

    /// The target could not be opened, read or written as a disk image
    ///
    /// `source` is the underlying I/O error, or one synthesized for causes
    /// that are not I/O failures.
    ///
    /// # Common Causes
    /// - Path does not exist
    /// - Permission denied on a block device
    /// - The GPT encoder rejected the geometry
    TableCodec { path: PathBuf, source: io::Error },

    /// Neither a GPT nor an MBR label could be parsed from the target
    UnparseableDiskLabel { path: PathBuf, reason: String },

    /// The target is shorter than the layout being written to it
    ImageTooSmall {
        path: PathBuf,
        required: u64,
        actual: u64,
    },

    /// A partition does not fit the addressable range of the label
    GeometryOutOfRange {
        path: PathBuf,
        start_sector: u64,
        end_sector: u64,
        limit: u64,
    },

    /// Requested read lies outside the target
    OutOfBounds { requested: u64, size: u64 },

    /// A byte count is not a whole number of sectors
    UnalignedSectorValue { bytes: u64 },

    /// An identity does not fit the fixed-size field it is written to
    InvalidIdentityLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl DiskError {
    /// Group this error into the validation / codec / table / guard taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            DiskError::Codec { .. } => ErrorCategory::Codec,
            DiskError::Io(_)
            | DiskError::TableCodec { .. }
            | DiskError::UnparseableDiskLabel { .. }
            | DiskError::ImageTooSmall { .. }
            | DiskError::GeometryOutOfRange { .. }
            | DiskError::OutOfBounds { .. } => ErrorCategory::TableCodec,
            DiskError::UnalignedSectorValue { .. } | DiskError::InvalidIdentityLength { .. } => {
                ErrorCategory::Guard
            }
            _ => ErrorCategory::Validation,
        }
    }

    pub(crate) fn table(path: impl Into<PathBuf>, cause: impl fmt::Display) -> Self {
        Self::table_io(path, io::Error::other(cause.to_string()))
    }

    pub(crate) fn table_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DiskError::TableCodec {
            path: path.into(),
            source,
        }
    }
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::UnknownFlavor { flavor } => {
                write!(f, "Unrecognised identity flavor: {:?}", flavor)
            }
            DiskError::InvalidLength {
                flavor,
                expected,
                actual,
            } => write!(
                f,
                "{} identity has incorrect length: expected {} bytes, got {}",
                flavor, expected, actual
            ),
            DiskError::MalformedIdentity { encoded } => {
                write!(f, "Malformed identity encoding: {:?}", encoded)
            }
            DiskError::MalformedHex { text } => write!(f, "Malformed hex string: {:?}", text),
            DiskError::MalformedGuid { guid } => write!(f, "Incorrect GUID format: {:?}", guid),
            DiskError::InvalidAlignment { alignment } => {
                write!(f, "Invalid partition alignment: {}", alignment)
            }
            DiskError::MisalignedOffset { offset, alignment } => write!(
                f,
                "Partition start not aligned: offset {} is not a multiple of {}",
                offset, alignment
            ),
            DiskError::MisalignedLength { length, alignment } => write!(
                f,
                "Partition end not aligned: length {} is not a multiple of {}",
                length, alignment
            ),
            DiskError::InsufficientOffset {
                style,
                offset,
                minimum,
            } => write!(
                f,
                "Partition ({}) offset ({}) less than allowed minimum ({})",
                style, offset, minimum
            ),
            DiskError::NonPositiveLength { offset } => {
                write!(f, "Partition at offset {} has zero length", offset)
            }
            DiskError::SanityCheckFailed { list, violation } => {
                write!(f, "{} failed sanity check: {}", list, violation)
            }
            DiskError::MissingExtendedPartition => {
                write!(f, "No extended partition in disk with logical partitions")
            }
            DiskError::LogicalBoundsExceeded {
                start,
                end,
                lower,
                upper,
            } => write!(
                f,
                "Logical partitions [{}, {}) fall outside extended partition bounds [{}, {})",
                start, end, lower, upper
            ),
            DiskError::IdentityMismatch { disk, partition } => write!(
                f,
                "Partitions are not congruent with disk: disk {} vs partition {}",
                disk, partition
            ),
            DiskError::AddressOverflow { offset, length } => write!(
                f,
                "Range at offset {} with length {} overflows the byte address space",
                offset, length
            ),
            DiskError::LengthExceeded { end, length } => write!(
                f,
                "Partition bounds exceed disk length: end {} > length {}",
                end, length
            ),
            DiskError::NoVolumes => write!(f, "No volumes given"),
            DiskError::MissingIdentity { guid } => {
                write!(f, "Volume {} has no identity", guid)
            }
            DiskError::MissingDevice { guid } => {
                write!(f, "Volume {} has no device", guid)
            }
            DiskError::UnexpectedFlavor {
                guid,
                expected,
                found,
            } => write!(
                f,
                "Volume {} has a {} identity where {} was expected",
                guid, found, expected
            ),
            DiskError::MissingVolume { offset } => {
                write!(f, "Partition at offset {} has no volume", offset)
            }
            DiskError::Codec { reason } => write!(f, "Disk model codec error: {}", reason),
            DiskError::Io(e) => write!(f, "I/O error: {}", e),
            DiskError::TableCodec { path, source } => {
                write!(f, "Partition table error for {:?}: {}", path, source)
            }
            DiskError::UnparseableDiskLabel { path, reason } => {
                write!(f, "Failed to parse disk label for {:?}: {}", path, reason)
            }
            DiskError::ImageTooSmall {
                path,
                required,
                actual,
            } => write!(
                f,
                "Image {:?} is too small: layout needs {} bytes, image has {}",
                path, required, actual
            ),
            DiskError::GeometryOutOfRange {
                path,
                start_sector,
                end_sector,
                limit,
            } => write!(
                f,
                "Partition sectors [{}, {}) on {:?} exceed the label limit {}",
                start_sector, end_sector, path, limit
            ),
            DiskError::OutOfBounds { requested, size } => write!(
                f,
                "Offset {} is out of bounds (image size: {})",
                requested, size
            ),
            DiskError::UnalignedSectorValue { bytes } => {
                write!(f, "Bytes not a multiple of sector size: {}", bytes)
            }
            DiskError::InvalidIdentityLength {
                field,
                expected,
                actual,
            } => write!(
                f,
                "{} is not {} bytes long (got {})",
                field, expected, actual
            ),
        }
    }
}

impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiskError::Io(e) | DiskError::TableCodec { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DiskError {
    fn from(err: io::Error) -> Self {
        DiskError::Io(err)
    }
}

impl From<serde_json::Error> for DiskError {
    fn from(err: serde_json::Error) -> Self {
        DiskError::Codec {
            reason: err.to_string(),
        }
    }
}
