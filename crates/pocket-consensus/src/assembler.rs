// BLOCK ASSEMBLER
// Pure function from a chain snapshot to a candidate block.
//
// SAFETY INVARIANTS:
// 1. Assembly reads only the snapshot; no lock is held and no state moves
// 2. A transaction is never placed before one of its unconfirmed ancestors
// 3. Selected transactions fit max_block_weight - reserved_weight and the
//    matching sigop budget; the reserve covers the reward transaction
// 4. The merkle root is computed once over the final ordering and the
//    template is never patched afterwards

use ed25519_dalek::SigningKey;
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use thiserror::Error;

use pocket_core::merkle_tree::block_merkle_root;
use pocket_core::script::p2pk;
use pocket_core::{
    AssemblerPolicy, Block, BlockHeader, ConsensusMode, ConsensusParams, FeeRate, Hash256,
    MempoolEntry, Transaction, TxIn, TxOut,
};

use crate::block_index::ChainTip;
use crate::pos_engine::{PosEngine, StakeCandidate};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    /// No coin of the staking key is deep and old enough
    #[error("no eligible stake")]
    NoEligibleStake,
    #[error("no eligible stake meets the kernel target at time {0}")]
    StakeKernelNotMet(u32),
    #[error("cannot sign a {0} template")]
    NotStakeTemplate(&'static str),
    #[error("signing key does not own the staked coin")]
    StakeKeyMismatch,
    #[error("reward overflow")]
    RewardOverflow,
}

/// Everything assembly needs, captured under a brief chain lock.
#[derive(Debug, Clone)]
pub struct AssemblySnapshot {
    pub tip: ChainTip,
    /// Expected bits for a PoW child of the tip
    pub pow_bits: u32,
    /// Expected bits for a PoS child of the tip
    pub pos_bits: u32,
    pub entries: Vec<MempoolEntry>,
    /// Unspent coins of the staking key, best first
    pub stake_candidates: Vec<StakeCandidate>,
    pub params: ConsensusParams,
    pub policy: AssemblerPolicy,
}

impl AssemblySnapshot {
    pub fn next_height(&self) -> u32 {
        self.tip.height + 1
    }
}

/// Immutable candidate block; stale once the tip moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub mode: ConsensusMode,
    pub height: u32,
    pub total_fees: u64,
    pub total_weight: u64,
    pub total_sigops: u32,
    pub stake: Option<StakeCandidate>,
}

impl BlockTemplate {
    /// Unsigned block; PoW templates still need a nonce.
    pub fn into_block(self) -> Block {
        Block {
            header: self.header,
            transactions: self.transactions,
            signature: Vec::new(),
        }
    }

    /// Sign a PoS template with the key owning the staked coin.
    pub fn sign(self, key: &SigningKey) -> Result<Block, AssembleError> {
        let stake = match (&self.mode, &self.stake) {
            (ConsensusMode::ProofOfStake, Some(stake)) => stake.clone(),
            (mode, _) => return Err(AssembleError::NotStakeTemplate(mode.as_str())),
        };
        if p2pk(&key.verifying_key().to_bytes()) != stake.coin.script_pubkey {
            return Err(AssembleError::StakeKeyMismatch);
        }
        let mut block = self.into_block();
        PosEngine::sign_block(&mut block, key);
        Ok(block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Open,
    Selected,
    /// Did not fit when it was the best candidate; never retried
    Skipped,
    /// An ancestor is missing from the snapshot
    Incomplete,
}

/// Running totals of an entry plus its not yet selected ancestors.
#[derive(Debug, Clone, Copy)]
struct Package {
    fee: u64,
    weight: u64,
    sigops: u32,
    version: u32,
    state: SlotState,
}

impl Package {
    fn of(entry: &MempoolEntry) -> Self {
        Package {
            fee: entry.fee,
            weight: entry.weight,
            sigops: entry.sigops,
            version: 0,
            state: SlotState::Open,
        }
    }

    fn add(&mut self, entry: &MempoolEntry) {
        self.fee = self.fee.saturating_add(entry.fee);
        self.weight = self.weight.saturating_add(entry.weight);
        self.sigops = self.sigops.saturating_add(entry.sigops);
    }

    fn remove(&mut self, entry: &MempoolEntry) {
        self.fee = self.fee.saturating_sub(entry.fee);
        self.weight = self.weight.saturating_sub(entry.weight);
        self.sigops = self.sigops.saturating_sub(entry.sigops);
        self.version += 1;
    }

    fn rate(&self) -> FeeRate {
        FeeRate::new(self.fee, self.weight)
    }
}

/// Heap key. Higher package rate first, then the smaller txid. Keys whose
/// `version` lags the package are stale and skipped when popped.
struct Candidate {
    rate: FeeRate,
    txid: Hash256,
    slot: usize,
    version: u32,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rate
            .cmp(&other.rate)
            .then_with(|| other.txid.cmp(&self.txid))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// **Fee-ranked package selection**
///
/// Repeatedly takes the entry whose package (itself plus its not yet
/// selected ancestors) has the highest fee rate. A package that does not fit
/// the remaining budgets is skipped and the next one is tried; selection
/// ends when no candidate is left. Returns entries in block order.
///
/// Package totals live in a max-heap. Selecting a package subtracts its
/// members from the totals of their in-pool descendants, which are pushed
/// again with the new rate.
pub fn select_packages(
    entries: &[MempoolEntry],
    weight_budget: u64,
    sigop_budget: u32,
) -> Vec<&MempoolEntry> {
    let slot_of: HashMap<Hash256, usize> =
        entries.iter().enumerate().map(|(slot, e)| (e.txid, slot)).collect();
    let mut descendants: Vec<Vec<usize>> = vec![Vec::new(); entries.len()];
    let mut packages: Vec<Package> = Vec::with_capacity(entries.len());
    for (slot, entry) in entries.iter().enumerate() {
        let mut package = Package::of(entry);
        for ancestor in &entry.ancestors {
            match slot_of.get(ancestor) {
                Some(&parent) => {
                    package.add(&entries[parent]);
                    descendants[parent].push(slot);
                }
                None => package.state = SlotState::Incomplete,
            }
        }
        packages.push(package);
    }

    let candidate = |slot: usize, package: &Package| Candidate {
        rate: package.rate(),
        txid: entries[slot].txid,
        slot,
        version: package.version,
    };
    let mut heap: BinaryHeap<Candidate> = packages
        .iter()
        .enumerate()
        .filter(|(_, p)| p.state == SlotState::Open)
        .map(|(slot, p)| candidate(slot, p))
        .collect();

    let mut order: Vec<&MempoolEntry> = Vec::new();
    let mut weight_left = weight_budget;
    let mut sigops_left = sigop_budget;

    while let Some(best) = heap.pop() {
        let package = packages[best.slot];
        if package.state != SlotState::Open || package.version != best.version {
            continue;
        }
        if package.weight > weight_left || package.sigops > sigops_left {
            debug!("Package {} ({} weight) does not fit, skipping", best.txid, package.weight);
            packages[best.slot].state = SlotState::Skipped;
            continue;
        }

        let entry = &entries[best.slot];
        let mut members: Vec<usize> = entry
            .ancestors
            .iter()
            .filter_map(|a| slot_of.get(a).copied())
            .filter(|&a| packages[a].state != SlotState::Selected)
            .collect();
        members.push(best.slot);
        // an ancestor always has fewer ancestors than its descendants
        members.sort_by(|&a, &b| {
            entries[a]
                .ancestors
                .len()
                .cmp(&entries[b].ancestors.len())
                .then_with(|| entries[a].txid.cmp(&entries[b].txid))
        });
        debug!(
            "Selected package {} of {} txs at {}/kw",
            best.txid,
            members.len(),
            package.rate().per_kw()
        );
        weight_left -= package.weight;
        sigops_left -= package.sigops;
        for &member in &members {
            packages[member].state = SlotState::Selected;
            order.push(&entries[member]);
        }

        let mut touched = BTreeSet::new();
        for &member in &members {
            for &descendant in &descendants[member] {
                if packages[descendant].state != SlotState::Selected {
                    packages[descendant].remove(&entries[member]);
                    touched.insert(descendant);
                }
            }
        }
        for slot in touched {
            if packages[slot].state == SlotState::Open {
                heap.push(candidate(slot, &packages[slot]));
            }
        }
    }
    order
}

/// **Build a block template on top of the snapshot's tip**
///
/// PoW templates start with a coinbase paying subsidy plus fees to
/// `payout_script`. PoS templates start with a coinstake that spends the
/// first qualifying stake candidate, returns its value to the staked
/// script and pays the stake reward plus fees to `payout_script`.
pub fn assemble(
    snapshot: &AssemblySnapshot,
    payout_script: &[u8],
    mode: ConsensusMode,
) -> Result<BlockTemplate, AssembleError> {
    let policy = snapshot.policy.clamped(&snapshot.params);
    let params = &snapshot.params;
    let height = snapshot.next_height();
    let time = snapshot.tip.median_time_past + 1;

    let bits = match mode {
        ConsensusMode::ProofOfWork => snapshot.pow_bits,
        ConsensusMode::ProofOfStake => snapshot.pos_bits,
    };
    let stake = match mode {
        ConsensusMode::ProofOfWork => None,
        ConsensusMode::ProofOfStake => {
            let eligible = snapshot.stake_candidates.iter().any(|c| {
                PosEngine::check_eligibility(&c.coin, c.coin_time, height, time, params).is_ok()
            });
            if !eligible {
                return Err(AssembleError::NoEligibleStake);
            }
            let found = PosEngine::find_stake(&snapshot.stake_candidates, bits, height, time, params)
                .ok_or(AssembleError::StakeKernelNotMet(time))?;
            Some(found.clone())
        }
    };

    let selected = select_packages(
        &snapshot.entries,
        policy.tx_weight_budget(),
        policy.tx_sigop_budget(),
    );
    let total_fees = selected
        .iter()
        .try_fold(0u64, |acc, e| acc.checked_add(e.fee))
        .ok_or(AssembleError::RewardOverflow)?;

    let reward_tx = match &stake {
        None => {
            let value = params
                .subsidy_at(height)
                .checked_add(total_fees)
                .ok_or(AssembleError::RewardOverflow)?;
            Transaction::coinbase(height, vec![TxOut::new(value, payout_script.to_vec())])
        }
        Some(stake) => {
            let reward = params
                .stake_reward
                .checked_add(total_fees)
                .ok_or(AssembleError::RewardOverflow)?;
            Transaction::new(
                vec![TxIn::new(stake.outpoint, Vec::new())],
                vec![
                    TxOut::empty(),
                    stake.coin.to_output(),
                    TxOut::new(reward, payout_script.to_vec()),
                ],
            )
        }
    };

    let total_weight = reward_tx.weight() + selected.iter().map(|e| e.weight).sum::<u64>();
    let total_sigops = reward_tx.sigop_count() + selected.iter().map(|e| e.sigops).sum::<u32>();
    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(reward_tx);
    transactions.extend(selected.iter().map(|e| e.tx.clone()));

    let header = BlockHeader {
        version: policy.block_version,
        prev_block: snapshot.tip.hash,
        merkle_root: block_merkle_root(&transactions),
        time,
        bits,
        nonce: 0,
    };
    info!(
        "Assembled {} template at height {}: {} txs, fees {}, weight {}",
        mode.as_str(),
        height,
        transactions.len(),
        total_fees,
        total_weight
    );
    Ok(BlockTemplate {
        header,
        transactions,
        mode,
        height,
        total_fees,
        total_weight,
        total_sigops,
        stake,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use pocket_core::{Coin, OutPoint, COIN};

    fn entry(n: u8, fee: u64, weight: u64, parents: &[&MempoolEntry]) -> MempoolEntry {
        let inputs = if parents.is_empty() {
            vec![TxIn::new(OutPoint::new(Hash256([n; 32]), 0), vec![])]
        } else {
            parents
                .iter()
                .map(|p| TxIn::new(OutPoint::new(p.txid, 0), vec![]))
                .collect()
        };
        let tx = Transaction::new(inputs, vec![TxOut::new(n as u64, vec![0x51])]);
        let mut ancestors = BTreeSet::new();
        for p in parents {
            ancestors.insert(p.txid);
            ancestors.extend(p.ancestors.iter().copied());
        }
        MempoolEntry {
            txid: tx.txid(),
            tx,
            fee,
            weight,
            sigops: 0,
            ancestors,
            entry_time: 0,
            entry_height: 1,
        }
    }

    fn snapshot(entries: Vec<MempoolEntry>) -> AssemblySnapshot {
        let params = ConsensusParams::regtest();
        AssemblySnapshot {
            tip: ChainTip {
                hash: Hash256([3; 32]),
                height: 10,
                chain_work: BigUint::from(22u32),
                median_time_past: 1_600_000_005,
                time: 1_600_000_009,
                bits: params.pow_limit_bits,
            },
            pow_bits: params.pow_limit_bits,
            pos_bits: params.pos_limit_bits,
            entries,
            stake_candidates: Vec::new(),
            policy: AssemblerPolicy::default(),
            params,
        }
    }

    #[test]
    fn test_child_pays_for_parent() {
        let parent = entry(1, 100, 100, &[]);
        let child = entry(2, 5_000, 100, &[&parent]);
        let loner = entry(3, 1_000, 100, &[]);
        let entries = vec![loner.clone(), parent.clone(), child.clone()];
        let picked: Vec<Hash256> = select_packages(&entries, 200, 100).iter().map(|e| e.txid).collect();
        assert_eq!(picked, vec![parent.txid, child.txid]);
    }

    #[test]
    fn test_small_entry_fills_gap_after_skip() {
        let big = entry(1, 10_000, 300, &[]);
        let small = entry(2, 10, 50, &[]);
        let entries = vec![big, small.clone()];
        let picked: Vec<Hash256> = select_packages(&entries, 100, 100).iter().map(|e| e.txid).collect();
        assert_eq!(picked, vec![small.txid]);
    }

    #[test]
    fn test_sibling_rescored_after_parent_selected() {
        let parent = entry(1, 100, 100, &[]);
        let rich = entry(2, 5_000, 100, &[&parent]);
        let sibling = entry(3, 3_000, 100, &[&parent]);
        let loner = entry(4, 2_000, 100, &[]);
        let entries = vec![loner.clone(), sibling.clone(), parent.clone(), rich.clone()];
        // sibling's package rate drops from 3100/200 to 3000/100 once the
        // parent is in, which puts it ahead of the loner
        let picked: Vec<Hash256> = select_packages(&entries, 300, 100).iter().map(|e| e.txid).collect();
        assert_eq!(picked, vec![parent.txid, rich.txid, sibling.txid]);
    }

    #[test]
    fn test_large_pool_selected_by_rate() {
        let entries: Vec<MempoolEntry> = (0..20_000u32)
            .map(|i| {
                let tx = Transaction::new(
                    vec![TxIn::new(OutPoint::new(Hash256::ZERO, i), vec![])],
                    vec![TxOut::new(1, vec![0x51])],
                );
                MempoolEntry {
                    txid: tx.txid(),
                    tx,
                    fee: 1_000 + (i as u64 * 7_919) % 10_000,
                    weight: 100,
                    sigops: 0,
                    ancestors: BTreeSet::new(),
                    entry_time: 0,
                    entry_height: 1,
                }
            })
            .collect();
        let picked = select_packages(&entries, 100 * 10_000, 1_000);
        assert_eq!(picked.len(), 10_000);
        assert!(picked.windows(2).all(|w| w[0].fee >= w[1].fee));
        let cutoff = picked.last().unwrap().fee;
        let chosen: BTreeSet<Hash256> = picked.iter().map(|e| e.txid).collect();
        assert!(entries
            .iter()
            .filter(|e| e.fee > cutoff)
            .all(|e| chosen.contains(&e.txid)));
    }

    #[test]
    fn test_pow_template_layout() {
        let snap = snapshot(vec![entry(1, 700, 100, &[])]);
        let template = assemble(&snap, &[0x51], ConsensusMode::ProofOfWork).unwrap();
        assert_eq!(template.height, 11);
        assert_eq!(template.header.time, 1_600_000_006);
        assert_eq!(template.header.prev_block, Hash256([3; 32]));
        assert!(template.transactions[0].is_coinbase());
        assert_eq!(
            template.transactions[0].outputs[0].value,
            snap.params.subsidy_at(11) + 700
        );
        assert_eq!(template.header.merkle_root, block_merkle_root(&template.transactions));
        assert!(template.sign(&SigningKey::from_bytes(&[1; 32])).is_err());
    }

    #[test]
    fn test_pos_template_without_stake() {
        let snap = snapshot(Vec::new());
        assert_eq!(
            assemble(&snap, &[0x51], ConsensusMode::ProofOfStake),
            Err(AssembleError::NoEligibleStake)
        );
    }

    #[test]
    fn test_pos_template_signs() {
        let key = SigningKey::from_bytes(&[4; 32]);
        let script = p2pk(&key.verifying_key().to_bytes());
        let mut snap = snapshot(vec![entry(1, 300, 100, &[])]);
        snap.stake_candidates.push(StakeCandidate {
            outpoint: OutPoint::new(Hash256([9; 32]), 1),
            coin: Coin::new(&TxOut::new(20 * COIN, script.clone()), 2, false),
            coin_time: 1_600_000_001,
        });
        let template = assemble(&snap, &script, ConsensusMode::ProofOfStake).unwrap();
        let coinstake = &template.transactions[0];
        assert!(coinstake.is_coinstake());
        assert_eq!(coinstake.outputs[1].value, 20 * COIN);
        assert_eq!(coinstake.outputs[2].value, snap.params.stake_reward + 300);
        assert_eq!(
            template.clone().sign(&SigningKey::from_bytes(&[5; 32])),
            Err(AssembleError::StakeKeyMismatch)
        );
        let block = template.sign(&key).unwrap();
        assert!(PosEngine::verify_signature(&block, &script).is_ok());
    }
}
