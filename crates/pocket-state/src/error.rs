use pocket_core::{ChainError, CodecError, OutPoint};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(String),

    #[error("column family not found: {0}")]
    ColumnFamilyNotFound(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("corrupt record in {column}: {reason}")]
    Corrupt { column: &'static str, reason: String },

    #[error("coin {0} is not in the view")]
    MissingCoin(OutPoint),

    #[error("coin {0} already exists")]
    CoinExists(OutPoint),

    #[error("the base layer cannot be discarded")]
    BaseLayer,

    #[error("snapshot digest mismatch")]
    DigestMismatch,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for StateError {
    fn from(err: rocksdb::Error) -> Self {
        StateError::Database(err.to_string())
    }
}

impl From<StateError> for ChainError {
    fn from(err: StateError) -> Self {
        match err {
            // a view miss during block connection is a consensus failure
            StateError::MissingCoin(op) => ChainError::MissingInputs(vec![op]),
            StateError::CoinExists(op) => {
                ChainError::ConsensusViolation(format!("bad-txns-BIP30 {}", op))
            }
            other => ChainError::StorageFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;
