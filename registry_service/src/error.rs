use registry_database::StoreError;
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IndexerError {
    /// RPC I/O failed or the node returned an unusable response.
    ChainUnavailable(String),
    /// The node knows no block for the requested reference.
    UnknownBlock(String),
    /// Error propagated from the store.
    StoreError(String),
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexerError::ChainUnavailable(e) => write!(f, "chain unavailable: {}", e),
            IndexerError::UnknownBlock(r) => write!(f, "unknown block: {}", r),
            IndexerError::StoreError(e) => write!(f, "store error: {}", e),
        }
    }
}

impl From<StoreError> for IndexerError {
    fn from(e: StoreError) -> Self {
        IndexerError::StoreError(e.to_string())
    }
}
