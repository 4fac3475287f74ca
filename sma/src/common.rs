//! Volume identifiers.

use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Identity of a volume, the UUID of its bdev in the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(Uuid);

impl VolumeId {
    /// Decode a volume id sent over the wire, either as 16 raw bytes or as
    /// the UTF-8 encoded string form of the UUID.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if let Ok(uuid) = Uuid::from_slice(bytes) {
            return Some(Self(uuid));
        }
        std::str::from_utf8(bytes).ok()?.parse().ok()
    }

    pub fn uuid(&self) -> &Uuid {
        &self.0
    }

    /// NVMe namespace globally unique identifier, the UUID without hyphens.
    pub fn nguid(&self) -> String {
        self.0.simple().to_string()
    }
}

impl From<Uuid> for VolumeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for VolumeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lowercase hyphenated form, which is also the name of the volume's bdev.
impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Canonical string form of a volume id, `None` if it is malformed.
pub fn format_volume_id(bytes: &[u8]) -> Option<String> {
    VolumeId::from_bytes(bytes).map(|id| id.to_string())
}
