use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::hash::{double_sha256, Hash256};
use crate::merkle_tree::block_merkle_root;
use crate::transaction::Transaction;

/// How a block proves its right to extend the chain.
///
/// Inferred from the block body: a leading coinbase means proof-of-work,
/// a leading coinstake means proof-of-stake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusMode {
    ProofOfWork,
    ProofOfStake,
}

impl ConsensusMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusMode::ProofOfWork => "PoW",
            ConsensusMode::ProofOfStake => "PoS",
        }
    }
}

/// Block header. The proof field is the nonce for PoW blocks; PoS blocks
/// leave it at zero and carry a stake signature in the block body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    /// Seconds since the unix epoch
    pub time: u32,
    /// Compact difficulty target
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Double SHA-256 of the encoded header.
    pub fn hash(&self) -> Hash256 {
        // Fixed-size header encoding cannot fail.
        let bytes = codec::encode(self).unwrap_or_default();
        double_sha256(&bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Stake signature over the block hash; empty for PoW blocks
    pub signature: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Mode inferred from the first transaction, `None` for a block that
    /// starts with neither a coinbase nor a coinstake.
    pub fn mode(&self) -> Option<ConsensusMode> {
        let first = self.transactions.first()?;
        if first.is_coinbase() {
            Some(ConsensusMode::ProofOfWork)
        } else if first.is_coinstake() {
            Some(ConsensusMode::ProofOfStake)
        } else {
            None
        }
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.mode() == Some(ConsensusMode::ProofOfStake)
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        block_merkle_root(&self.transactions)
    }

    pub fn weight(&self) -> u64 {
        codec::encoded_len(self)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}
