//! ReplicaId: the persisted identity of one vault installation.
//!
//! Every remote write is scoped by this identity, and the change feed is
//! filtered with it so a replica never observes its own writes. Wraps a u64
//! internally but displays as a 16-character hex string, which is also the
//! `vault_id` value stored in document records.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaIdError {
    #[error("Invalid replica ID format: expected 16 hex chars")]
    InvalidFormat,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

/// Identity of one vault replica.
///
/// Generated once on first run, persisted immediately, and never
/// regenerated for the lifetime of the installation.
///
/// # Examples
/// ```
/// use vaultsync_core::ReplicaId;
///
/// let replica = ReplicaId::generate();
/// let parsed: ReplicaId = replica.to_string().parse().unwrap();
/// assert_eq!(replica, parsed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Generate a new random replica ID. Never returns zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = ReplicaIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 16 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            let id = u64::from_str_radix(&s.to_ascii_lowercase(), 16)
                .map_err(ReplicaIdError::InvalidHex)?;
            return Ok(Self(id));
        }
        Err(ReplicaIdError::InvalidFormat)
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ReplicaId> for u64 {
    fn from(replica: ReplicaId) -> u64 {
        replica.0
    }
}

// Serialize as the hex string so persisted state, records, and logs agree
impl serde::Serialize for ReplicaId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ReplicaId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hex() {
        let replica = ReplicaId(0xa1b2c3d4e5f67890);
        assert_eq!(replica.to_string(), "a1b2c3d4e5f67890");
    }

    #[test]
    fn test_display_zero_padded() {
        let replica = ReplicaId(0xff);
        assert_eq!(replica.to_string(), "00000000000000ff");
    }

    #[test]
    fn test_parse_hex() {
        let replica: ReplicaId = "a1b2c3d4e5f67890".parse().unwrap();
        assert_eq!(replica.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let replica: ReplicaId = "A1B2C3D4E5F67890".parse().unwrap();
        assert_eq!(replica.as_u64(), 0xa1b2c3d4e5f67890);
    }

    #[test]
    fn test_roundtrip() {
        let original = ReplicaId::generate();
        let parsed: ReplicaId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_invalid_format() {
        assert!("too_short".parse::<ReplicaId>().is_err());
        assert!("ghijklmnopqrstuv".parse::<ReplicaId>().is_err()); // non-hex
        assert!("a1b2c3d4e5f6789".parse::<ReplicaId>().is_err()); // 15 chars
        assert!("a1b2c3d4e5f678901".parse::<ReplicaId>().is_err()); // 17 chars
        assert!("".parse::<ReplicaId>().is_err());
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(ReplicaId::generate().as_u64(), 0);
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = ReplicaId::generate();
        let json = serde_json::to_string(&original).unwrap();
        let parsed: ReplicaId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
