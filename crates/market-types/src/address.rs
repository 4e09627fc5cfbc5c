use crate::error::{Result, TypesError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Network prefix used when rendering addresses.
pub const NETWORK_PREFIX: char = 'f';

/// An on-chain address.
///
/// `Id` addresses are the compact form assigned by the chain, `Key` addresses
/// carry an ed25519 public key and `Actor` addresses identify actors created by
/// other actors (payment channels, miners) by a hash of their creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    Id(u64),
    Key([u8; 32]),
    Actor([u8; 32]),
}

impl Address {
    pub fn new_id(id: u64) -> Self {
        Address::Id(id)
    }

    pub fn from_public_key(key: [u8; 32]) -> Self {
        Address::Key(key)
    }

    /// Derive an actor address from arbitrary creation data.
    pub fn new_actor(seed: &[u8]) -> Self {
        Address::Actor(*blake3::hash(seed).as_bytes())
    }

    pub fn public_key(&self) -> Option<&[u8; 32]> {
        match self {
            Address::Key(k) => Some(k),
            _ => None,
        }
    }

    pub fn protocol(&self) -> u8 {
        match self {
            Address::Id(_) => 0,
            Address::Key(_) => 1,
            Address::Actor(_) => 2,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Id(id) => write!(f, "{}0{}", NETWORK_PREFIX, id),
            Address::Key(k) => write!(f, "{}1{}", NETWORK_PREFIX, hex::encode(k)),
            Address::Actor(h) => write!(f, "{}2{}", NETWORK_PREFIX, hex::encode(h)),
        }
    }
}

impl FromStr for Address {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        if chars.next() != Some(NETWORK_PREFIX) {
            return Err(TypesError::InvalidAddress(format!("bad network prefix: {}", s)));
        }
        let protocol = chars
            .next()
            .ok_or_else(|| TypesError::InvalidAddress(s.to_string()))?;
        let payload = chars.as_str();
        match protocol {
            '0' => payload
                .parse::<u64>()
                .map(Address::Id)
                .map_err(|e| TypesError::InvalidAddress(format!("{}: {}", s, e))),
            '1' => Ok(Address::Key(decode_32(s, payload)?)),
            '2' => Ok(Address::Actor(decode_32(s, payload)?)),
            other => Err(TypesError::InvalidAddress(format!(
                "unknown protocol {} in {}",
                other, s
            ))),
        }
    }
}

fn decode_32(full: &str, payload: &str) -> Result<[u8; 32]> {
    let bytes =
        hex::decode(payload).map_err(|e| TypesError::InvalidAddress(format!("{}: {}", full, e)))?;
    bytes
        .try_into()
        .map_err(|_| TypesError::InvalidAddress(format!("{}: expected 32 bytes", full)))
}

// Addresses travel as strings so records stay readable in every encoding.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse() {
        let id = Address::new_id(1234);
        assert_eq!(id.to_string(), "f01234");
        assert_eq!("f01234".parse::<Address>().unwrap(), id);

        let key = Address::from_public_key([7u8; 32]);
        let parsed: Address = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.public_key(), Some(&[7u8; 32]));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("t01234".parse::<Address>().is_err());
        assert!("f9abc".parse::<Address>().is_err());
        assert!("f1abcd".parse::<Address>().is_err());
        assert!("f".parse::<Address>().is_err());
    }

    #[test]
    fn test_json_is_string() {
        let addr = Address::new_id(5);
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"f05\"");
    }
}
