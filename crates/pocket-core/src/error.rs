use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;
use crate::transaction::OutPoint;

/// Closed set of reasons a transaction or block is refused.
///
/// SAFETY: Every variant except `StorageFailure` is scoped to the single
/// request that produced it. Shared state is never left modified when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ChainError {
    /// Wire-format or structural violation
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Referenced coins not found (retry once the parent arrives)
    #[error("missing inputs: {0:?}")]
    MissingInputs(Vec<OutPoint>),

    #[error("insufficient fee: {0}")]
    InsufficientFee(String),

    #[error("conflicting spend: {0}")]
    ConflictingSpend(String),

    /// Ancestor/descendant, size or fee-ceiling policy
    #[error("policy limit exceeded: {0}")]
    PolicyLimitExceeded(String),

    /// Bad proof, bad timestamp, bad merkle root, immature spend...
    #[error("consensus violation: {0}")]
    ConsensusViolation(String),

    /// Durable layer I/O failure, fatal to the process
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl ChainError {
    /// Short machine-readable tag for logs and RPC replies.
    pub fn kind(&self) -> &'static str {
        match self {
            ChainError::MalformedInput(_) => "malformed-input",
            ChainError::MissingInputs(_) => "missing-inputs",
            ChainError::InsufficientFee(_) => "insufficient-fee",
            ChainError::ConflictingSpend(_) => "conflicting-spend",
            ChainError::PolicyLimitExceeded(_) => "policy-limit-exceeded",
            ChainError::ConsensusViolation(_) => "consensus-violation",
            ChainError::StorageFailure(_) => "storage-failure",
        }
    }

    /// The same request may succeed later without changing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::MissingInputs(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::StorageFailure(_))
    }
}

impl From<CodecError> for ChainError {
    fn from(err: CodecError) -> Self {
        ChainError::MalformedInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(ChainError::MissingInputs(vec![]).kind(), "missing-inputs");
        assert!(ChainError::MissingInputs(vec![]).is_retryable());
        assert!(!ChainError::ConsensusViolation("bad-pow".into()).is_retryable());
        assert!(ChainError::StorageFailure("io".into()).is_fatal());
    }

    #[test]
    fn test_codec_maps_to_malformed() {
        let err: ChainError = CodecError::Decode("eof".into()).into();
        assert_eq!(err.kind(), "malformed-input");
    }
}
