use crate::cid::Cid;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ChainEpoch = i64;

/// Identifies a tipset by the cids of its blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TipSetKey(Vec<Cid>);

impl TipSetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        Self(cids)
    }

    pub fn cids(&self) -> &[Cid] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TipSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, "}}")
    }
}

/// A chain head: height, identity and parent link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipSet {
    pub height: ChainEpoch,
    pub key: TipSetKey,
    pub parents: TipSetKey,
}

impl TipSet {
    pub fn new(height: ChainEpoch, key: TipSetKey, parents: TipSetKey) -> Self {
        Self {
            height,
            key,
            parents,
        }
    }

    pub fn key(&self) -> &TipSetKey {
        &self.key
    }
}

/// One entry of a head-change notification batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadChange {
    /// A tipset left the canonical chain.
    Revert(TipSet),
    /// A tipset joined the canonical chain.
    Apply(TipSet),
    /// Initial notification carrying the current head.
    Current(TipSet),
}
