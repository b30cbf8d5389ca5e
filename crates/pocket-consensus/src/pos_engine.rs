// PROOF-OF-STAKE ENGINE
// Stake kernel, coin age weighting and block signatures.
//
// SAFETY CONSTRAINTS:
// 1. The staked coin (first coinstake input) must be unspent as of the
//    parent, at least `stake_min_depth` deep and `stake_min_age_secs` old
// 2. kernel = double-SHA-256(coin block time, staked outpoint, block time)
//    must not exceed target * value * min(age, max age) / 1 day
// 3. The block hash is signed with the ed25519 key of the staked coin's
//    P2PK script, and the coinstake returns the stake to that script

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::debug;
use num_bigint::BigUint;
use serde::Serialize;

use pocket_core::codec;
use pocket_core::script::extract_p2pk;
use pocket_core::{double_sha256, Block, Coin, ConsensusMode, ConsensusParams, Hash256, OutPoint};

use crate::difficulty::{hash_to_uint, target_from_compact};
use crate::engine::{BlockContext, ConsensusEngine, ConsensusError};

const COIN_DAY_SECS: u64 = 24 * 60 * 60;

/// A spendable coin the staker may put up, with the time of its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeCandidate {
    pub outpoint: OutPoint,
    pub coin: Coin,
    pub coin_time: u32,
}

#[derive(Serialize)]
struct Kernel<'a> {
    coin_time: u32,
    prevout: &'a OutPoint,
    time: u32,
}

pub fn kernel_hash(coin_time: u32, prevout: &OutPoint, time: u32) -> Hash256 {
    let kernel = Kernel {
        coin_time,
        prevout,
        time,
    };
    // Fixed-size kernel encoding cannot fail.
    double_sha256(&codec::encode(&kernel).unwrap_or_default())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PosEngine;

impl PosEngine {
    pub fn new() -> Self {
        PosEngine
    }

    /// **Depth and age eligibility of a staked coin**
    pub fn check_eligibility(
        coin: &Coin,
        coin_time: u32,
        height: u32,
        time: u32,
        params: &ConsensusParams,
    ) -> Result<(), ConsensusError> {
        let depth = coin.depth_at(height);
        if depth < params.stake_min_depth {
            return Err(ConsensusError::StakeTooShallow {
                depth,
                required: params.stake_min_depth,
            });
        }
        let age = time as i64 - coin_time as i64;
        if age < 0 || age < params.stake_min_age_secs as i64 {
            return Err(ConsensusError::StakeTooYoung {
                age,
                required: params.stake_min_age_secs,
            });
        }
        Ok(())
    }

    /// **Kernel hash against the coin-age weighted target**
    pub fn check_kernel(
        bits: u32,
        coin: &Coin,
        coin_time: u32,
        prevout: &OutPoint,
        time: u32,
        params: &ConsensusParams,
    ) -> Result<(), ConsensusError> {
        let target = target_from_compact(bits).ok_or(ConsensusError::TargetOutOfRange { bits })?;
        let limit = target_from_compact(params.pos_limit_bits)
            .ok_or(ConsensusError::TargetOutOfRange { bits: params.pos_limit_bits })?;
        if target > limit {
            return Err(ConsensusError::TargetOutOfRange { bits });
        }
        let held = (time.saturating_sub(coin_time)).min(params.stake_max_age_secs) as u64;
        let weighted: BigUint = target * coin.value * held / COIN_DAY_SECS;
        let kernel = kernel_hash(coin_time, prevout, time);
        if hash_to_uint(&kernel) > weighted {
            return Err(ConsensusError::KernelTargetNotMet { kernel });
        }
        Ok(())
    }

    /// Verify the ed25519 signature over the block hash against the P2PK
    /// key of `script_pubkey`.
    pub fn verify_signature(block: &Block, script_pubkey: &[u8]) -> Result<(), ConsensusError> {
        let key = extract_p2pk(script_pubkey).ok_or_else(|| ConsensusError::InvalidSignature {
            reason: "staked coin is not pay-to-pubkey".into(),
        })?;
        let verifying = VerifyingKey::from_bytes(&key).map_err(|e| ConsensusError::InvalidSignature {
            reason: format!("bad staker key: {}", e),
        })?;
        let signature =
            Signature::from_slice(&block.signature).map_err(|e| ConsensusError::InvalidSignature {
                reason: format!("malformed signature: {}", e),
            })?;
        verifying
            .verify(block.hash().as_bytes(), &signature)
            .map_err(|_| ConsensusError::InvalidSignature {
                reason: format!("signature does not match block {}", block.hash()),
            })
    }

    pub fn sign_block(block: &mut Block, key: &SigningKey) {
        block.signature = key.sign(block.hash().as_bytes()).to_bytes().to_vec();
    }

    /// First candidate that is eligible at `height` and meets the kernel at
    /// `time`. Candidates are tried in the order given.
    pub fn find_stake<'a>(
        candidates: &'a [StakeCandidate],
        bits: u32,
        height: u32,
        time: u32,
        params: &ConsensusParams,
    ) -> Option<&'a StakeCandidate> {
        candidates.iter().find(|c| {
            Self::check_eligibility(&c.coin, c.coin_time, height, time, params).is_ok()
                && Self::check_kernel(bits, &c.coin, c.coin_time, &c.outpoint, time, params).is_ok()
        })
    }
}

impl ConsensusEngine for PosEngine {
    fn mode(&self) -> ConsensusMode {
        ConsensusMode::ProofOfStake
    }

    fn verify_proof(&self, block: &Block, ctx: &BlockContext<'_>) -> Result<(), ConsensusError> {
        let coinstake = block
            .transactions
            .first()
            .ok_or_else(|| ConsensusError::Other("empty block".into()))?;
        let prevout = coinstake
            .inputs
            .first()
            .map(|input| input.prevout)
            .ok_or_else(|| ConsensusError::Other("coinstake without inputs".into()))?;
        let coin = ctx
            .view
            .get(&prevout)
            .map_err(|e| ConsensusError::Other(e.to_string()))?
            .ok_or(ConsensusError::StakeCoinMissing { outpoint: prevout })?;

        let height = ctx.parent.height + 1;
        let coin_time = ctx
            .index
            .ancestor(&ctx.parent.hash, coin.height)
            .map(|e| e.time)
            .ok_or_else(|| ConsensusError::Other(format!("no block at stake height {}", coin.height)))?;
        let time = block.header.time;

        Self::check_eligibility(&coin, coin_time, height, time, ctx.params)?;
        Self::check_kernel(block.header.bits, &coin, coin_time, &prevout, time, ctx.params)?;

        if coinstake.outputs.get(1).map(|o| &o.script_pubkey) != Some(&coin.script_pubkey) {
            return Err(ConsensusError::StakeScriptMismatch);
        }
        Self::verify_signature(block, &coin.script_pubkey)?;
        debug!("Stake {} valid for block {} at height {}", prevout, block.hash(), height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_core::script::p2pk;
    use pocket_core::{BlockHeader, Transaction, TxIn, TxOut, COIN};

    fn staker() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn staked_coin(height: u32) -> Coin {
        let script = p2pk(&staker().verifying_key().to_bytes());
        Coin::new(&TxOut::new(10 * COIN, script), height, false)
    }

    #[test]
    fn test_shallow_and_young_coins() {
        let params = ConsensusParams {
            stake_min_age_secs: 100,
            ..ConsensusParams::regtest()
        };
        let coin = staked_coin(10);
        assert!(matches!(
            PosEngine::check_eligibility(&coin, 1_000, 12, 2_000, &params),
            Err(ConsensusError::StakeTooShallow { depth: 2, required: 3 })
        ));
        assert!(matches!(
            PosEngine::check_eligibility(&coin, 1_000, 13, 1_050, &params),
            Err(ConsensusError::StakeTooYoung { age: 50, .. })
        ));
        assert!(PosEngine::check_eligibility(&coin, 1_000, 13, 1_100, &params).is_ok());
    }

    #[test]
    fn test_zero_hold_time_never_meets_kernel() {
        let params = ConsensusParams::regtest();
        let coin = staked_coin(1);
        let prevout = OutPoint::new(Hash256([1; 32]), 0);
        assert!(matches!(
            PosEngine::check_kernel(params.pos_limit_bits, &coin, 500, &prevout, 500, &params),
            Err(ConsensusError::KernelTargetNotMet { .. })
        ));
        // an easy target and an hour held always pass
        assert!(PosEngine::check_kernel(params.pos_limit_bits, &coin, 500, &prevout, 4_100, &params).is_ok());
    }

    #[test]
    fn test_signature_roundtrip_and_tamper() {
        let coin = staked_coin(1);
        let coinstake = Transaction::new(
            vec![TxIn::new(OutPoint::new(Hash256([1; 32]), 0), vec![])],
            vec![TxOut::empty(), coin.to_output()],
        );
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: Hash256([2; 32]),
                merkle_root: pocket_core::merkle_tree::block_merkle_root(&[coinstake.clone()]),
                time: 1_600_000_100,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions: vec![coinstake],
            signature: Vec::new(),
        };
        PosEngine::sign_block(&mut block, &staker());
        assert!(PosEngine::verify_signature(&block, &coin.script_pubkey).is_ok());

        block.header.time += 1;
        assert!(matches!(
            PosEngine::verify_signature(&block, &coin.script_pubkey),
            Err(ConsensusError::InvalidSignature { .. })
        ));
        assert!(PosEngine::verify_signature(&block, &[0x51]).is_err());
    }

    #[test]
    fn test_find_stake_skips_ineligible() {
        let params = ConsensusParams::regtest();
        let young = StakeCandidate {
            outpoint: OutPoint::new(Hash256([1; 32]), 0),
            coin: staked_coin(9),
            coin_time: 1_000,
        };
        let old = StakeCandidate {
            outpoint: OutPoint::new(Hash256([2; 32]), 0),
            coin: staked_coin(2),
            coin_time: 1_000,
        };
        let candidates = [young, old.clone()];
        let found = PosEngine::find_stake(&candidates, params.pos_limit_bits, 10, 5_000, &params);
        assert_eq!(found, Some(&old));
    }
}
