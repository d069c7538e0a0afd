//! Disk and partition identities
//!
//! A P2V source volume remembers where it came from through an on-disk
//! identity. Windows records one of three shapes:
//!
//! | Flavor          | Bytes | Layout                                           |
//! |-----------------|-------|--------------------------------------------------|
//! | `mbr.disk`      | 4     | MBR disk signature                               |
//! | `mbr.partition` | 12    | disk signature + little-endian u64 byte offset   |
//! | `gpt`           | 16    | GUID in on-disk (mixed-endian) byte order        |
//!
//! GPT disk GUIDs and partition GUIDs share one representation, so there is a
//! single `Gpt` variant for both.
//!
//! # Why a Closed Enum?
//!
//! Each flavor has its own length, congruence rule and accessors. Keeping
//! them as payloads of one enum means every `match` over flavors is checked
//! for exhaustiveness, and an identity can never carry the wrong number of
//! bytes: the length is part of the type.
//!
//! # Persisted Form
//!
//! Identities persist as `"<flavor>/<hex>"`, e.g. `mbr.disk/78563412`.
//! [`Identity::encode`] and [`Identity::decode_str`] round-trip losslessly.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uguid::Guid;

use crate::error::{DiskError, DiskResult};

/// Identity flavor tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    MbrDisk,
    MbrPartition,
    Gpt,
}

impl Flavor {
    pub const fn tag(&self) -> &'static str {
        match self {
            Flavor::MbrDisk => "mbr.disk",
            Flavor::MbrPartition => "mbr.partition",
            Flavor::Gpt => "gpt",
        }
    }

    /// Fixed byte length of identities of this flavor
    pub const fn length(&self) -> usize {
        match self {
            Flavor::MbrDisk => 4,
            Flavor::MbrPartition => 12,
            Flavor::Gpt => 16,
        }
    }

    pub fn from_tag(tag: &str) -> DiskResult<Self> {
        match tag {
            "mbr.disk" => Ok(Flavor::MbrDisk),
            "mbr.partition" => Ok(Flavor::MbrPartition),
            "gpt" => Ok(Flavor::Gpt),
            other => Err(DiskError::UnknownFlavor {
                flavor: other.to_string(),
            }),
        }
    }

    pub const fn is_mbr(&self) -> bool {
        matches!(self, Flavor::MbrDisk | Flavor::MbrPartition)
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// An on-disk identity of a disk or partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    /// MBR disk signature
    MbrDisk([u8; 4]),
    /// MBR disk signature followed by the partition's byte offset (LE u64)
    MbrPartition([u8; 12]),
    /// GPT disk or partition GUID, on-disk byte order
    Gpt([u8; 16]),
}

impl Identity {
    /// Build an identity of `flavor` from raw bytes
    ///
    /// # Errors
    ///
    /// `DiskError::InvalidLength` when `bytes` is not exactly
    /// `flavor.length()` long.
    pub fn from_bytes(flavor: Flavor, bytes: &[u8]) -> DiskResult<Self> {
        let invalid = || DiskError::InvalidLength {
            flavor,
            expected: flavor.length(),
            actual: bytes.len(),
        };
        Ok(match flavor {
            Flavor::MbrDisk => Identity::MbrDisk(bytes.try_into().map_err(|_| invalid())?),
            Flavor::MbrPartition => {
                Identity::MbrPartition(bytes.try_into().map_err(|_| invalid())?)
            }
            Flavor::Gpt => Identity::Gpt(bytes.try_into().map_err(|_| invalid())?),
        })
    }

    /// Decode a flavor tag and hex payload
    pub fn decode(flavor_tag: &str, hex: &str) -> DiskResult<Self> {
        let flavor = Flavor::from_tag(flavor_tag)?;
        let bytes = decode_hex(hex)?;
        Self::from_bytes(flavor, &bytes)
    }

    /// Decode the persisted `"<flavor>/<hex>"` form
    pub fn decode_str(encoded: &str) -> DiskResult<Self> {
        let (flavor, hex) = encoded
            .split_once('/')
            .ok_or_else(|| DiskError::MalformedIdentity {
                encoded: encoded.to_string(),
            })?;
        Self::decode(flavor, hex)
    }

    /// Persisted `"<flavor>/<hex>"` form
    pub fn encode(&self) -> String {
        format!("{}/{}", self.flavor().tag(), encode_hex(self.as_bytes()))
    }

    /// MBR disk identity from a numeric signature
    ///
    /// The signature is packed little-endian, the order it occupies at
    /// offset `0x1B8` of the boot sector.
    pub fn mbr_disk_from_signature(signature: u32) -> Self {
        Identity::MbrDisk(signature.to_le_bytes())
    }

    /// MBR partition identity from a disk signature and byte offset
    pub fn mbr_partition(signature: [u8; 4], offset: u64) -> Self {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&signature);
        bytes[4..].copy_from_slice(&offset.to_le_bytes());
        Identity::MbrPartition(bytes)
    }

    /// GPT identity from a canonical `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` string
    ///
    /// The first three fields are stored little-endian on disk, the last two
    /// big-endian.
    pub fn from_guid_str(guid: &str) -> DiskResult<Self> {
        let parsed = Guid::try_parse(guid).map_err(|_| DiskError::MalformedGuid {
            guid: guid.to_string(),
        })?;
        Ok(Identity::Gpt(parsed.to_bytes()))
    }

    pub const fn flavor(&self) -> Flavor {
        match self {
            Identity::MbrDisk(_) => Flavor::MbrDisk,
            Identity::MbrPartition(_) => Flavor::MbrPartition,
            Identity::Gpt(_) => Flavor::Gpt,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Identity::MbrDisk(b) => b,
            Identity::MbrPartition(b) => b,
            Identity::Gpt(b) => b,
        }
    }

    pub const fn is_mbr(&self) -> bool {
        self.flavor().is_mbr()
    }

    pub const fn is_gpt(&self) -> bool {
        matches!(self, Identity::Gpt(_))
    }

    /// The 4-byte MBR disk signature, for either MBR flavor
    ///
    /// Only meaningful for comparison, so it is returned as raw bytes.
    pub fn signature(&self) -> Option<[u8; 4]> {
        match self {
            Identity::MbrDisk(b) => Some(*b),
            Identity::MbrPartition(b) => Some([b[0], b[1], b[2], b[3]]),
            Identity::Gpt(_) => None,
        }
    }

    /// Byte offset of the partition within its disk (`mbr.partition` only)
    pub fn offset(&self) -> Option<u64> {
        match self {
            Identity::MbrPartition(b) => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&b[4..]);
                Some(u64::from_le_bytes(raw))
            }
            _ => None,
        }
    }

    /// Canonical GUID string (`gpt` only)
    pub fn guid_string(&self) -> Option<String> {
        match self {
            Identity::Gpt(b) => Some(Guid::from_bytes(*b).to_string()),
            _ => None,
        }
    }

    /// Whether `other` plausibly belongs to the same disk as `self`
    ///
    /// `None` places no constraint. GPT identities only require the other
    /// side to be a GUID as well. MBR identities accept either MBR flavor
    /// (disk against partition is allowed) as long as the 4-byte signatures
    /// agree.
    pub fn congruent(&self, other: Option<&Identity>) -> bool {
        let Some(other) = other else {
            return true;
        };
        match self {
            Identity::Gpt(_) => other.as_bytes().len() == Flavor::Gpt.length(),
            Identity::MbrDisk(_) | Identity::MbrPartition(_) => {
                other.is_mbr() && self.signature() == other.signature()
            }
        }
    }
}

/// Congruence over optional identities; absence on either side always matches
pub fn congruent(a: Option<&Identity>, b: Option<&Identity>) -> bool {
    match a {
        Some(a) => a.congruent(b),
        None => true,
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Identity {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode_str(s)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Identity::decode_str(&encoded).map_err(de::Error::custom)
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn decode_hex(text: &str) -> DiskResult<Vec<u8>> {
    let malformed = || DiskError::MalformedHex {
        text: text.to_string(),
    };
    if text.len() % 2 != 0 || !text.is_ascii() {
        return Err(malformed());
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|_| malformed()))
        .collect()
}
