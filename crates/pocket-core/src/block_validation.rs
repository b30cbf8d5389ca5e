use std::collections::HashSet;

use crate::block::{Block, ConsensusMode};
use crate::error::ChainError;
use crate::params::ConsensusParams;

pub struct BlockValidator;

impl BlockValidator {
    /// **Context-free block checks**
    ///
    /// SAFETY: Runs before any coin lookup. A block failing here never
    /// reaches the coin view. Returns the mode inferred from the body.
    pub fn check_structure(
        block: &Block,
        params: &ConsensusParams,
    ) -> Result<ConsensusMode, ChainError> {
        let hash = block.hash();

        let weight = block.weight();
        if weight > params.max_block_weight {
            log::warn!("Block {} weight {} exceeds limit", hash, weight);
            return Err(ChainError::MalformedInput(format!(
                "bad-blk-weight {} > {}",
                weight, params.max_block_weight
            )));
        }

        let mode = block
            .mode()
            .ok_or_else(|| ChainError::MalformedInput("bad-cb-missing".into()))?;

        if block.header.merkle_root != block.compute_merkle_root() {
            log::warn!("Block {} merkle root mismatch", hash);
            return Err(ChainError::MalformedInput("bad-txnmrklroot".into()));
        }

        // Only the first transaction may be a coinbase or coinstake.
        if block.transactions[1..].iter().any(|tx| tx.is_reward()) {
            return Err(ChainError::MalformedInput("bad-cb-multiple".into()));
        }

        let mut txids = HashSet::with_capacity(block.transactions.len());
        for tx in &block.transactions {
            if !txids.insert(tx.txid()) {
                return Err(ChainError::MalformedInput("bad-txns-duplicate".into()));
            }
            if tx.inputs.is_empty() || tx.outputs.is_empty() {
                return Err(ChainError::MalformedInput(format!(
                    "bad-txns-empty in {}",
                    tx.txid()
                )));
            }
            match tx.value_out() {
                Some(total) if params.money_range(total) => {}
                _ => {
                    return Err(ChainError::MalformedInput(format!(
                        "bad-txns-txouttotal-toolarge in {}",
                        tx.txid()
                    )))
                }
            }
            if !tx.is_coinbase() && tx.inputs.iter().any(|i| i.prevout.is_null()) {
                return Err(ChainError::MalformedInput("bad-txns-prevout-null".into()));
            }
        }

        let sigops: u64 = block.transactions.iter().map(|tx| tx.sigop_count() as u64).sum();
        if sigops > params.max_block_sigops as u64 {
            return Err(ChainError::MalformedInput(format!("bad-blk-sigops {}", sigops)));
        }

        match mode {
            ConsensusMode::ProofOfWork if !block.signature.is_empty() => {
                return Err(ChainError::MalformedInput("signature on PoW block".into()));
            }
            ConsensusMode::ProofOfStake if block.signature.is_empty() => {
                return Err(ChainError::MalformedInput("bad-blk-sig missing".into()));
            }
            _ => {}
        }

        Ok(mode)
    }

    /// **Timestamp may not run ahead of the node's adjusted clock**
    pub fn check_future_drift(
        block: &Block,
        params: &ConsensusParams,
        adjusted_time: i64,
    ) -> Result<(), ChainError> {
        let limit = adjusted_time + params.max_future_drift_secs as i64;
        if block.header.time as i64 > limit {
            log::warn!(
                "Block {} time {} is too far in the future (limit {})",
                block.hash(),
                block.header.time,
                limit
            );
            return Err(ChainError::ConsensusViolation("time-too-new".into()));
        }
        Ok(())
    }

    /// **Full context-free pipeline**
    ///
    /// 1. Structure
    /// 2. Future drift
    pub fn validate(
        block: &Block,
        params: &ConsensusParams,
        adjusted_time: i64,
    ) -> Result<ConsensusMode, ChainError> {
        let mode = Self::check_structure(block, params)?;
        Self::check_future_drift(block, params, adjusted_time)?;
        log::debug!("Block {} ({}) structurally valid", block.hash(), mode.as_str());
        Ok(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockHeader;
    use crate::hash::Hash256;
    use crate::merkle_tree::block_merkle_root;
    use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};

    fn block_with(transactions: Vec<Transaction>) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: Hash256::ZERO,
                merkle_root: block_merkle_root(&transactions),
                time: 1_600_000_000,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        }
    }

    fn coinbase() -> Transaction {
        Transaction::coinbase(1, vec![TxOut::new(50, vec![0x51])])
    }

    fn payment(n: u8) -> Transaction {
        Transaction::new(
            vec![TxIn::new(OutPoint::new(Hash256([n; 32]), 0), vec![])],
            vec![TxOut::new(1, vec![0x51])],
        )
    }

    #[test]
    fn test_valid_pow_block() {
        let block = block_with(vec![coinbase(), payment(1)]);
        let params = ConsensusParams::regtest();
        assert_eq!(
            BlockValidator::validate(&block, &params, 1_600_000_000),
            Ok(ConsensusMode::ProofOfWork)
        );
    }

    #[test]
    fn test_bad_merkle_root() {
        let mut block = block_with(vec![coinbase(), payment(1)]);
        block.header.merkle_root = Hash256([9; 32]);
        let err = BlockValidator::check_structure(&block, &ConsensusParams::regtest()).unwrap_err();
        assert_eq!(err, ChainError::MalformedInput("bad-txnmrklroot".into()));
    }

    #[test]
    fn test_second_coinbase_rejected() {
        let mut second = coinbase();
        second.lock_time = 1;
        let block = block_with(vec![coinbase(), second]);
        assert!(BlockValidator::check_structure(&block, &ConsensusParams::regtest()).is_err());
    }

    #[test]
    fn test_duplicate_txids_rejected() {
        let block = block_with(vec![coinbase(), payment(1), payment(1)]);
        let err = BlockValidator::check_structure(&block, &ConsensusParams::regtest()).unwrap_err();
        assert_eq!(err, ChainError::MalformedInput("bad-txns-duplicate".into()));
    }

    #[test]
    fn test_missing_reward_rejected() {
        let block = block_with(vec![payment(1)]);
        assert!(BlockValidator::check_structure(&block, &ConsensusParams::regtest()).is_err());
    }

    #[test]
    fn test_future_drift() {
        let block = block_with(vec![coinbase()]);
        let params = ConsensusParams::regtest();
        let now = 1_600_000_000 - params.max_future_drift_secs as i64;
        assert!(BlockValidator::check_future_drift(&block, &params, now).is_ok());
        assert!(BlockValidator::check_future_drift(&block, &params, now - 1).is_err());
    }
}
