use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{table}: key not found: {key}")]
    NotFound { table: &'static str, key: String },

    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error for {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Unknown backend protocol: {0}")]
    UnknownBackend(String),

    #[error("Invalid backend location: {0}")]
    InvalidLocation(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(table: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            table,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(format!("SQLite error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A record that could not be decoded during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub key: String,
    pub reason: String,
}

/// Outcome of a multi-record read: every decodable record plus the keys that
/// failed to decode. One corrupt record never hides the others.
#[derive(Debug, Clone)]
pub struct ScanResult<T> {
    pub items: Vec<T>,
    pub failures: Vec<DecodeFailure>,
}

impl<T> ScanResult<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Keep the records matching `pred`; failures are carried over untouched.
    pub fn filter(self, mut pred: impl FnMut(&T) -> bool) -> Self {
        Self {
            items: self.items.into_iter().filter(|item| pred(item)).collect(),
            failures: self.failures,
        }
    }

    /// Turn any decode failure into an error.
    pub fn into_strict(self) -> Result<Vec<T>> {
        match self.failures.into_iter().next() {
            Some(f) => Err(StoreError::Decode {
                key: f.key,
                reason: f.reason,
            }),
            None => Ok(self.items),
        }
    }
}

impl<T> Default for ScanResult<T> {
    fn default() -> Self {
        Self::new()
    }
}
