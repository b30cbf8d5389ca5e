// CHAIN PARAMETERS
// Consensus constants, mempool policy and assembler budgets.
//
// SAFETY INVARIANTS:
// 1. ConsensusParams are identical on every node of one network; changing
//    any field is a hard fork
// 2. MempoolPolicy and AssemblerPolicy are local policy and may differ
//    between nodes without splitting the chain
// 3. Assembler budgets never exceed the consensus block limits

use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockHeader};
use crate::hash::Hash256;
use crate::merkle_tree::block_merkle_root;
use crate::script;
use crate::transaction::{Transaction, TxOut};

pub const COIN: u64 = 100_000_000;

/// Consensus rules shared by all nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusParams {
    pub max_money: u64,
    pub max_block_weight: u64,
    pub max_block_sigops: u32,
    /// Confirmations before a coinbase/coinstake output can be spent
    pub coinbase_maturity: u32,
    /// Number of blocks in the median-time-past window
    pub median_time_span: usize,
    pub max_future_drift_secs: u32,
    pub target_spacing_secs: u32,
    /// Same-mode blocks averaged by the retarget rule
    pub retarget_window: u32,
    pub pow_limit_bits: u32,
    pub pos_limit_bits: u32,
    pub pow_no_retargeting: bool,
    /// Confirmations a staked coin needs
    pub stake_min_depth: u32,
    pub stake_min_age_secs: u32,
    /// Time held beyond this adds no stake weight
    pub stake_max_age_secs: u32,
    pub block_subsidy: u64,
    pub subsidy_halving_interval: u32,
    pub stake_reward: u64,
    pub genesis_time: u32,
    pub genesis_reward: u64,
    pub genesis_script: Vec<u8>,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            max_money: 24_000_000 * COIN,
            max_block_weight: 4_000_000,
            max_block_sigops: 80_000,
            coinbase_maturity: 100,
            median_time_span: 11,
            max_future_drift_secs: 2 * 60 * 60,
            target_spacing_secs: 60,
            retarget_window: 24,
            pow_limit_bits: 0x1e0f_ffff,
            pos_limit_bits: 0x1e0f_ffff,
            pow_no_retargeting: false,
            stake_min_depth: 100,
            stake_min_age_secs: 8 * 60 * 60,
            stake_max_age_secs: 90 * 24 * 60 * 60,
            block_subsidy: 50 * COIN,
            subsidy_halving_interval: 210_000,
            stake_reward: 5 * COIN,
            genesis_time: 1_538_000_000,
            genesis_reward: 50 * COIN,
            genesis_script: vec![script::OP_RETURN],
        }
    }
}

impl ConsensusParams {
    /// Local test network: trivial targets, no retargeting, short maturity.
    pub fn regtest() -> Self {
        ConsensusParams {
            coinbase_maturity: 2,
            pow_limit_bits: 0x207f_ffff,
            pos_limit_bits: 0x207f_ffff,
            pow_no_retargeting: true,
            stake_min_depth: 3,
            stake_min_age_secs: 0,
            genesis_time: 1_600_000_000,
            genesis_script: vec![script::OP_TRUE],
            ..ConsensusParams::default()
        }
    }

    /// PoW subsidy for a block at `height`.
    pub fn subsidy_at(&self, height: u32) -> u64 {
        if self.subsidy_halving_interval == 0 {
            return self.block_subsidy;
        }
        let halvings = height / self.subsidy_halving_interval;
        if halvings >= 64 {
            return 0;
        }
        self.block_subsidy >> halvings
    }

    pub fn money_range(&self, value: u64) -> bool {
        value <= self.max_money
    }

    pub fn genesis_block(&self) -> Block {
        let coinbase = Transaction::coinbase(
            0,
            vec![TxOut::new(self.genesis_reward, self.genesis_script.clone())],
        );
        let transactions = vec![coinbase];
        Block {
            header: BlockHeader {
                version: 1,
                prev_block: Hash256::ZERO,
                merkle_root: block_merkle_root(&transactions),
                time: self.genesis_time,
                bits: self.pow_limit_bits,
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        }
    }
}

/// Local admission policy for the mempool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolPolicy {
    /// Minimum fee per 1000 weight units
    pub min_relay_fee_per_kw: u64,
    /// Fees above this are refused unless the caller overrides
    pub absurd_fee: u64,
    pub max_tx_weight: u64,
    /// Including the transaction itself
    pub ancestor_count_limit: usize,
    pub ancestor_weight_limit: u64,
    pub descendant_count_limit: usize,
    pub max_replacement_evictions: usize,
    pub expiry_secs: i64,
    pub max_pool_weight: u64,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        MempoolPolicy {
            min_relay_fee_per_kw: 1_000,
            absurd_fee: 100 * COIN,
            max_tx_weight: 400_000,
            ancestor_count_limit: 25,
            ancestor_weight_limit: 404_000,
            descendant_count_limit: 25,
            max_replacement_evictions: 100,
            expiry_secs: 14 * 24 * 60 * 60,
            max_pool_weight: 300_000_000,
        }
    }
}

impl MempoolPolicy {
    /// Minimum fee a transaction of `weight` must pay.
    pub fn min_fee_for(&self, weight: u64) -> u64 {
        let fee = (weight as u128 * self.min_relay_fee_per_kw as u128).div_ceil(1_000);
        fee.min(u64::MAX as u128) as u64
    }
}

/// Budgets used when filling a block template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerPolicy {
    pub block_version: u32,
    pub max_block_weight: u64,
    /// Weight kept free for the coinbase/coinstake
    pub reserved_weight: u64,
    pub max_block_sigops: u32,
    pub reserved_sigops: u32,
}

impl Default for AssemblerPolicy {
    fn default() -> Self {
        AssemblerPolicy {
            block_version: 1,
            max_block_weight: 4_000_000,
            reserved_weight: 4_000,
            max_block_sigops: 80_000,
            reserved_sigops: 400,
        }
    }
}

impl AssemblerPolicy {
    pub fn tx_weight_budget(&self) -> u64 {
        self.max_block_weight.saturating_sub(self.reserved_weight)
    }

    pub fn tx_sigop_budget(&self) -> u32 {
        self.max_block_sigops.saturating_sub(self.reserved_sigops)
    }

    /// Clamp local budgets to the consensus limits.
    pub fn clamped(&self, consensus: &ConsensusParams) -> Self {
        AssemblerPolicy {
            max_block_weight: self.max_block_weight.min(consensus.max_block_weight),
            max_block_sigops: self.max_block_sigops.min(consensus.max_block_sigops),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsidy_halving() {
        let params = ConsensusParams::default();
        assert_eq!(params.subsidy_at(0), 50 * COIN);
        assert_eq!(params.subsidy_at(210_000), 25 * COIN);
        assert_eq!(params.subsidy_at(210_000 * 64), 0);
    }

    #[test]
    fn test_min_fee_rounds_up() {
        let policy = MempoolPolicy::default();
        assert_eq!(policy.min_fee_for(1_000), 1_000);
        assert_eq!(policy.min_fee_for(1), 1);
        assert_eq!(policy.min_fee_for(0), 0);
    }

    #[test]
    fn test_genesis_is_pow_and_consistent() {
        let params = ConsensusParams::regtest();
        let genesis = params.genesis_block();
        assert!(genesis.transactions[0].is_coinbase());
        assert_eq!(genesis.header.merkle_root, genesis.compute_merkle_root());
        assert_eq!(genesis.hash(), params.genesis_block().hash());
    }

    #[test]
    fn test_assembler_clamped() {
        let consensus = ConsensusParams {
            max_block_weight: 1_000,
            ..ConsensusParams::regtest()
        };
        let policy = AssemblerPolicy::default().clamped(&consensus);
        assert_eq!(policy.max_block_weight, 1_000);
    }
}
