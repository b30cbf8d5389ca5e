// CONSENSUS ENGINE TRAIT
// One interface for the proof rules of both block modes.
//
// SAFETY: Every engine follows the same contract:
// 1. Verification is deterministic (same block, same context, same result)
// 2. Engines never mutate chain state; the gate owns every write
// 3. Context is passed explicitly and reflects the parent of the block

use pocket_core::{Block, ChainError, ConsensusMode, ConsensusParams, Hash256, OutPoint};
use pocket_state::CoinView;
use std::fmt;

use crate::block_index::{BlockIndex, BlockIndexEntry};

/// Consensus rule failures with detailed context.
///
/// SAFETY: All variants surface to callers as
/// `ChainError::ConsensusViolation`; the text is for logs and peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Header bits differ from the retarget rule
    BadDifficultyBits { expected: u32, got: u32 },

    /// Compact target is negative, zero, overflowing or above the limit
    TargetOutOfRange { bits: u32 },

    /// Timestamp not after the median time past of the parent
    TimeTooOld { time: u32, median_time_past: u32 },

    /// Proof-of-Work does not meet difficulty target
    InsufficientProofOfWork { hash: Hash256, bits: u32 },

    /// The coin a coinstake claims is spent or unknown
    StakeCoinMissing { outpoint: OutPoint },

    StakeTooShallow { depth: u32, required: u32 },

    StakeTooYoung { age: i64, required: u32 },

    /// Kernel hash above the weighted target
    KernelTargetNotMet { kernel: Hash256 },

    /// Coinstake does not return the stake to the staked script
    StakeScriptMismatch,

    /// Block signature verification failed
    InvalidSignature { reason: String },

    /// A spend of a coinbase/coinstake output before maturity
    PrematureSpend { outpoint: OutPoint, depth: u32 },

    /// Input not available as of the earlier transactions of the block
    MissingOrSpentInput { outpoint: OutPoint },

    /// Outputs exceed inputs, or sums overflow
    ValueConservation { reason: String },

    RewardTooHigh { claimed: u64, allowed: u64 },

    /// Generic consensus error
    Other(String),
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusError::BadDifficultyBits { expected, got } => {
                write!(f, "bad-diffbits: expected {:#010x}, got {:#010x}", expected, got)
            }
            ConsensusError::TargetOutOfRange { bits } => {
                write!(f, "bad-diffbits: target {:#010x} out of range", bits)
            }
            ConsensusError::TimeTooOld { time, median_time_past } => {
                write!(f, "time-too-old: {} <= median time past {}", time, median_time_past)
            }
            ConsensusError::InsufficientProofOfWork { hash, bits } => {
                write!(f, "high-hash: {} above target {:#010x}", hash, bits)
            }
            ConsensusError::StakeCoinMissing { outpoint } => {
                write!(f, "bad-stake: coin {} spent or unknown", outpoint)
            }
            ConsensusError::StakeTooShallow { depth, required } => {
                write!(f, "bad-stake-depth: {} < {} confirmations", depth, required)
            }
            ConsensusError::StakeTooYoung { age, required } => {
                write!(f, "bad-stake-age: held {}s < {}s", age, required)
            }
            ConsensusError::KernelTargetNotMet { kernel } => {
                write!(f, "bad-stake-kernel: {} above weighted target", kernel)
            }
            ConsensusError::StakeScriptMismatch => {
                write!(f, "bad-coinstake: stake not returned to the staked script")
            }
            ConsensusError::InvalidSignature { reason } => {
                write!(f, "bad-blk-signature: {}", reason)
            }
            ConsensusError::PrematureSpend { outpoint, depth } => {
                write!(f, "bad-txns-premature-spend-of-reward: {} at depth {}", outpoint, depth)
            }
            ConsensusError::MissingOrSpentInput { outpoint } => {
                write!(f, "bad-txns-inputs-missingorspent: {}", outpoint)
            }
            ConsensusError::ValueConservation { reason } => {
                write!(f, "bad-txns-in-belowout: {}", reason)
            }
            ConsensusError::RewardTooHigh { claimed, allowed } => {
                write!(f, "bad-reward-amount: claimed {} > allowed {}", claimed, allowed)
            }
            ConsensusError::Other(msg) => write!(f, "consensus error: {}", msg),
        }
    }
}

impl std::error::Error for ConsensusError {}

impl From<ConsensusError> for ChainError {
    fn from(err: ConsensusError) -> Self {
        ChainError::ConsensusViolation(err.to_string())
    }
}

/// Chain context a block is verified against: its parent entry, the index
/// holding the parent's ancestry and the coin view as of the parent.
pub struct BlockContext<'a> {
    pub parent: &'a BlockIndexEntry,
    pub index: &'a BlockIndex,
    pub view: &'a CoinView,
    pub params: &'a ConsensusParams,
}

/// Consensus engine trait: the proof rule of one block mode.
///
/// SAFETY INVARIANTS:
/// 1. verify_proof is idempotent
/// 2. verify_proof reads the context only
/// 3. Errors are deterministic (same context, same error)
pub trait ConsensusEngine: Send + Sync {
    fn mode(&self) -> ConsensusMode;

    /// Check that `block` carries a valid proof for this mode.
    ///
    /// SAFETY: Called with the coin view positioned at the parent, before
    /// any input of the block is spent. The header's bits have already been
    /// matched against the retarget rule.
    ///
    /// # Returns
    /// - `Ok(())` if the proof holds
    /// - `Err(ConsensusError)` naming the violated rule
    fn verify_proof(&self, block: &Block, ctx: &BlockContext<'_>) -> Result<(), ConsensusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_map_to_consensus_violation() {
        let err: ChainError = ConsensusError::StakeTooYoung { age: 5, required: 10 }.into();
        assert_eq!(err.kind(), "consensus-violation");
        assert!(err.to_string().contains("bad-stake-age"));
    }
}
