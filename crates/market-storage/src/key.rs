use std::fmt;

/// Logical namespace of one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    StorageDeals,
    RetrievalDeals,
    FundedAddresses,
    ChannelInfos,
    MsgInfos,
    StorageAsks,
    RetrievalAsks,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::StorageDeals,
        Table::RetrievalDeals,
        Table::FundedAddresses,
        Table::ChannelInfos,
        Table::MsgInfos,
        Table::StorageAsks,
        Table::RetrievalAsks,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::StorageDeals => "storage_deals",
            Table::RetrievalDeals => "retrieval_deals",
            Table::FundedAddresses => "funded_addresses",
            Table::ChannelInfos => "channel_infos",
            Table::MsgInfos => "msg_infos",
            Table::StorageAsks => "storage_asks",
            Table::RetrievalAsks => "retrieval_asks",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of a record inside its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Num(u64),
    Str(String),
}

impl StoreKey {
    /// Key any identity that renders itself as a string.
    pub fn stringer(value: &impl fmt::Display) -> Self {
        StoreKey::Str(value.to_string())
    }

    /// Byte form used by ordered stores. Numbers are zero-padded so they sort
    /// numerically.
    pub fn encode(&self) -> String {
        match self {
            StoreKey::Num(n) => format!("{:020}", n),
            StoreKey::Str(s) => s.clone(),
        }
    }
}

impl From<u64> for StoreKey {
    fn from(n: u64) -> Self {
        StoreKey::Num(n)
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        StoreKey::Str(s.to_string())
    }
}

impl From<String> for StoreKey {
    fn from(s: String) -> Self {
        StoreKey::Str(s)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Num(n) => write!(f, "{}", n),
            StoreKey::Str(s) => f.write_str(s),
        }
    }
}
