// PROOF-OF-WORK ENGINE
// Header hash against the compact target, plus a parallel nonce search.
//
// SAFETY CONSTRAINTS:
// 1. A target must be positive and no easier than the PoW limit
// 2. The header hash, read as a little-endian integer, must not exceed it
// 3. Mining never touches chain state; it only searches nonces for a header
//    the caller owns

use log::{debug, info};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

use pocket_core::{Block, BlockHeader, ConsensusMode, Hash256};

use crate::difficulty::{hash_to_uint, target_from_compact};
use crate::engine::{BlockContext, ConsensusEngine, ConsensusError};

#[derive(Debug, Default, Clone, Copy)]
pub struct PowEngine;

impl PowEngine {
    pub fn new() -> Self {
        PowEngine
    }

    /// **Hash meets the target encoded by `bits`**
    ///
    /// SAFETY: `limit_bits` bounds how easy a target may be; a header
    /// declaring an easier target is rejected before the hash is compared.
    pub fn check_proof(hash: &Hash256, bits: u32, limit_bits: u32) -> Result<(), ConsensusError> {
        let target = target_from_compact(bits).ok_or(ConsensusError::TargetOutOfRange { bits })?;
        let limit =
            target_from_compact(limit_bits).ok_or(ConsensusError::TargetOutOfRange { bits: limit_bits })?;
        if target > limit {
            return Err(ConsensusError::TargetOutOfRange { bits });
        }
        if hash_to_uint(hash) > target {
            return Err(ConsensusError::InsufficientProofOfWork { hash: *hash, bits });
        }
        Ok(())
    }

    /// Search the nonce space in parallel for a header meeting its bits.
    ///
    /// Returns `None` when the space is exhausted or `cancel` is raised.
    pub fn mine(header: &BlockHeader, cancel: &AtomicBool) -> Option<u32> {
        let target = target_from_compact(header.bits)?;
        debug!("Mining on {} with bits {:#010x}", header.prev_block, header.bits);
        (0..=u32::MAX)
            .into_par_iter()
            .find_map_any(|nonce| {
                if cancel.load(Ordering::Relaxed) {
                    // stops the search
                    return Some(None);
                }
                let mut candidate = header.clone();
                candidate.nonce = nonce;
                (hash_to_uint(&candidate.hash()) <= target).then_some(Some(nonce))
            })
            .flatten()
    }

    /// Fill in the nonce of `block`. Returns false if no nonce was found.
    pub fn solve(block: &mut Block, cancel: &AtomicBool) -> bool {
        match Self::mine(&block.header, cancel) {
            Some(nonce) => {
                block.header.nonce = nonce;
                info!("Solved block {} with nonce {}", block.hash(), nonce);
                true
            }
            None => false,
        }
    }
}

impl ConsensusEngine for PowEngine {
    fn mode(&self) -> ConsensusMode {
        ConsensusMode::ProofOfWork
    }

    fn verify_proof(&self, block: &Block, ctx: &BlockContext<'_>) -> Result<(), ConsensusError> {
        Self::check_proof(&block.hash(), block.header.bits, ctx.params.pow_limit_bits)
    }
}
