use crate::error::{Result, TypesError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const CID_PREFIX: char = 'b';

/// Content identifier: a blake3 digest of the canonical encoding of a value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid([u8; 32]);

impl Cid {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash raw bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Hash the bincode encoding of a value.
    pub fn of_serialized<T: Serialize>(value: &T) -> Result<Self> {
        let bytes = bincode::serialize(value).map_err(|e| TypesError::Encoding(e.to_string()))?;
        Ok(Self::of(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", CID_PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({}…)", &self.to_string()[..13])
    }
}

impl FromStr for Cid {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix(CID_PREFIX)
            .ok_or_else(|| TypesError::InvalidCid(s.to_string()))?;
        let bytes = hex::decode(hex_part).map_err(|e| TypesError::InvalidCid(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TypesError::InvalidCid(format!("{}: expected 32 bytes", s)))?;
        Ok(Self(arr))
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_is_deterministic() {
        assert_eq!(Cid::of(b"piece"), Cid::of(b"piece"));
        assert_ne!(Cid::of(b"piece"), Cid::of(b"other"));
    }

    #[test]
    fn test_cid_string_form() {
        let cid = Cid::of(b"payload");
        let s = cid.to_string();
        assert!(s.starts_with('b'));
        assert_eq!(s.len(), 65);
        assert_eq!(s.parse::<Cid>().unwrap(), cid);
        assert!("zdeadbeef".parse::<Cid>().is_err());
    }
}
