// BLOCK INDEX
// In-memory tree of known headers and the active chain.
//
// SAFETY INVARIANTS:
// 1. Every entry except genesis has its parent in the index
// 2. chain_work(entry) = chain_work(parent) + proof(bits)
// 3. `active[h]` is the hash of the active-chain block at height h and
//    the last element is the tip; only the gate moves it
// 4. A Rejected entry and its descendants are never selected as best

use log::debug;
use num_bigint::BigUint;
use serde::Serialize;
use std::collections::HashMap;

use pocket_core::{BlockHeader, ConsensusMode, Hash256};

use crate::difficulty::block_proof;

/// Lifecycle of a block presented to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockStatus {
    Received,
    StructurallyValid,
    ConsensusValid,
    Connected,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: Hash256,
    pub prev: Hash256,
    pub height: u32,
    pub time: u32,
    pub bits: u32,
    pub mode: ConsensusMode,
    pub chain_work: BigUint,
    pub status: BlockStatus,
    /// Arrival order, earlier wins work ties
    pub sequence: u64,
}

/// Summary of the active tip handed to assembly and RPC surfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: u32,
    pub chain_work: BigUint,
    pub median_time_past: u32,
    pub time: u32,
    pub bits: u32,
}

#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: HashMap<Hash256, BlockIndexEntry>,
    active: Vec<Hash256>,
    median_time_span: usize,
    next_sequence: u64,
}

impl BlockIndex {
    pub fn new(median_time_span: usize) -> Self {
        BlockIndex {
            entries: HashMap::new(),
            active: Vec::new(),
            median_time_span: median_time_span.max(1),
            next_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        self.entries.get(hash)
    }

    pub fn set_status(&mut self, hash: &Hash256, status: BlockStatus) {
        if let Some(entry) = self.entries.get_mut(hash) {
            debug!("Block {} {:?} -> {:?}", hash, entry.status, status);
            entry.status = status;
        }
    }

    /// Insert the genesis header and make it the active tip.
    pub fn insert_genesis(&mut self, header: &BlockHeader) -> &BlockIndexEntry {
        let hash = header.hash();
        let entry = BlockIndexEntry {
            hash,
            prev: Hash256::ZERO,
            height: 0,
            time: header.time,
            bits: header.bits,
            mode: ConsensusMode::ProofOfWork,
            chain_work: block_proof(header.bits),
            status: BlockStatus::Connected,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;
        self.entries.insert(hash, entry);
        self.active = vec![hash];
        &self.entries[&hash]
    }

    /// Index a header whose parent is known. Returns `None` for an orphan.
    pub fn insert(
        &mut self,
        header: &BlockHeader,
        mode: ConsensusMode,
        status: BlockStatus,
    ) -> Option<&BlockIndexEntry> {
        let hash = header.hash();
        let sequence = self.next_sequence;
        let parent = self.entries.get(&header.prev_block)?;
        let entry = BlockIndexEntry {
            hash,
            prev: parent.hash,
            height: parent.height + 1,
            time: header.time,
            bits: header.bits,
            mode,
            chain_work: &parent.chain_work + block_proof(header.bits),
            status,
            sequence,
        };
        self.next_sequence += 1;
        self.entries.insert(hash, entry);
        self.entries.get(&hash)
    }

    pub fn tip(&self) -> Option<&BlockIndexEntry> {
        self.active.last().and_then(|h| self.entries.get(h))
    }

    pub fn height(&self) -> u32 {
        self.active.len().saturating_sub(1) as u32
    }

    pub fn active_at(&self, height: u32) -> Option<&BlockIndexEntry> {
        self.active
            .get(height as usize)
            .and_then(|h| self.entries.get(h))
    }

    pub fn is_active(&self, hash: &Hash256) -> bool {
        self.entries
            .get(hash)
            .map(|e| self.active.get(e.height as usize) == Some(hash))
            .unwrap_or(false)
    }

    /// Ancestor of `hash` at `height`, following parent links.
    pub fn ancestor(&self, hash: &Hash256, height: u32) -> Option<&BlockIndexEntry> {
        let mut entry = self.entries.get(hash)?;
        if height > entry.height {
            return None;
        }
        if self.is_active(hash) {
            return self.active_at(height);
        }
        while entry.height > height {
            entry = self.entries.get(&entry.prev)?;
        }
        Some(entry)
    }

    /// Median of the last `median_time_span` block times ending at `hash`.
    pub fn median_time_past(&self, hash: &Hash256) -> u32 {
        let mut times = Vec::with_capacity(self.median_time_span);
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            if times.len() == self.median_time_span {
                break;
            }
            times.push(entry.time);
            cursor = self.entries.get(&entry.prev);
        }
        if times.is_empty() {
            return 0;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// `(time, bits)` of up to `limit` ancestors of `hash` (inclusive) that
    /// were produced in `mode`, newest first. Genesis is never included.
    pub fn recent_of_mode(&self, hash: &Hash256, mode: ConsensusMode, limit: usize) -> Vec<(u32, u32)> {
        let mut found = Vec::with_capacity(limit);
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            if found.len() == limit || entry.height == 0 {
                break;
            }
            if entry.mode == mode {
                found.push((entry.time, entry.bits));
            }
            cursor = self.entries.get(&entry.prev);
        }
        found
    }

    /// Last common block of the active chain and the branch ending at `hash`.
    pub fn fork_point(&self, hash: &Hash256) -> Option<&BlockIndexEntry> {
        let mut entry = self.entries.get(hash)?;
        while !self.is_active(&entry.hash) {
            entry = self.entries.get(&entry.prev)?;
        }
        Some(entry)
    }

    /// Hashes from just above the fork point up to `hash`, oldest first.
    pub fn branch_to(&self, hash: &Hash256) -> Vec<Hash256> {
        let mut branch = Vec::new();
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            if self.is_active(&entry.hash) {
                break;
            }
            branch.push(entry.hash);
            cursor = self.entries.get(&entry.prev);
        }
        branch.reverse();
        branch
    }

    /// A block descends from a rejected block if any ancestor off the active
    /// chain was rejected.
    pub fn has_rejected_ancestor(&self, hash: &Hash256) -> bool {
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            if entry.status == BlockStatus::Rejected {
                return true;
            }
            if self.is_active(&entry.hash) {
                return false;
            }
            cursor = self.entries.get(&entry.prev);
        }
        false
    }

    /// Every indexed block built on `hash`, excluding itself.
    pub fn descendants(&self, hash: &Hash256) -> Vec<Hash256> {
        let Some(root) = self.entries.get(hash) else {
            return Vec::new();
        };
        self.entries
            .values()
            .filter(|e| e.height > root.height)
            .filter(|e| self.ancestor(&e.hash, root.height).map(|a| a.hash) == Some(*hash))
            .map(|e| e.hash)
            .collect()
    }

    /// Candidate with the most work not descending from a rejected block.
    /// Ties go to the active chain, then to the block seen first.
    pub fn best_candidate(&self) -> Option<&BlockIndexEntry> {
        self.entries
            .values()
            .filter(|e| !self.has_rejected_ancestor(&e.hash))
            .max_by(|a, b| {
                a.chain_work
                    .cmp(&b.chain_work)
                    .then_with(|| self.is_active(&a.hash).cmp(&self.is_active(&b.hash)))
                    .then_with(|| b.sequence.cmp(&a.sequence))
            })
    }

    /// Make `hash` the active tip, rewriting the height table from the fork.
    pub fn set_active_tip(&mut self, hash: &Hash256) {
        let mut chain = Vec::new();
        let mut cursor = self.entries.get(hash);
        while let Some(entry) = cursor {
            if self.is_active(&entry.hash) {
                break;
            }
            chain.push(entry.hash);
            cursor = self.entries.get(&entry.prev);
        }
        let keep = cursor.map(|e| e.height as usize + 1).unwrap_or(0);
        self.active.truncate(keep);
        self.active.extend(chain.into_iter().rev());
    }

    pub fn tip_summary(&self) -> Option<ChainTip> {
        let tip = self.tip()?;
        Some(ChainTip {
            hash: tip.hash,
            height: tip.height,
            chain_work: tip.chain_work.clone(),
            median_time_past: self.median_time_past(&tip.hash),
            time: tip.time,
            bits: tip.bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_core::ConsensusParams;

    fn child(prev: Hash256, time: u32, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: Hash256::ZERO,
            time,
            bits: 0x207f_ffff,
            nonce,
        }
    }

    fn chain(index: &mut BlockIndex, from: Hash256, len: u32, start_time: u32, nonce: u32) -> Vec<Hash256> {
        let mut prev = from;
        let mut hashes = Vec::new();
        for i in 0..len {
            let header = child(prev, start_time + i, nonce);
            let entry = index
                .insert(&header, ConsensusMode::ProofOfWork, BlockStatus::ConsensusValid)
                .unwrap();
            prev = entry.hash;
            hashes.push(prev);
        }
        hashes
    }

    fn genesis_index() -> (BlockIndex, Hash256) {
        let mut index = BlockIndex::new(11);
        let genesis = ConsensusParams::regtest().genesis_block();
        let hash = index.insert_genesis(&genesis.header).hash;
        (index, hash)
    }

    #[test]
    fn test_median_time_past_of_eleven() {
        let (mut index, genesis) = genesis_index();
        let hashes = chain(&mut index, genesis, 20, 1_600_000_100, 0);
        index.set_active_tip(hashes.last().unwrap());
        // times 109..=119 past 1_600_000_000
        assert_eq!(index.median_time_past(hashes.last().unwrap()), 1_600_000_114);
        assert_eq!(index.height(), 20);
    }

    #[test]
    fn test_orphan_not_indexed() {
        let (mut index, _) = genesis_index();
        let orphan = child(Hash256([9; 32]), 1, 0);
        assert!(index
            .insert(&orphan, ConsensusMode::ProofOfWork, BlockStatus::Received)
            .is_none());
    }

    #[test]
    fn test_fork_point_and_branch() {
        let (mut index, genesis) = genesis_index();
        let main = chain(&mut index, genesis, 3, 1_600_000_100, 0);
        index.set_active_tip(&main[2]);
        let side = chain(&mut index, main[0], 4, 1_600_000_200, 1);

        assert_eq!(index.fork_point(&side[3]).unwrap().hash, main[0]);
        assert_eq!(index.branch_to(&side[3]), side);
        assert_eq!(index.best_candidate().unwrap().hash, side[3]);

        index.set_active_tip(&side[3]);
        assert_eq!(index.tip().unwrap().hash, side[3]);
        assert!(index.is_active(&main[0]));
        assert!(!index.is_active(&main[1]));
        assert_eq!(index.ancestor(&side[3], 1).unwrap().hash, main[0]);
    }

    #[test]
    fn test_rejected_branch_not_best() {
        let (mut index, genesis) = genesis_index();
        let main = chain(&mut index, genesis, 2, 1_600_000_100, 0);
        index.set_active_tip(&main[1]);
        let side = chain(&mut index, genesis, 3, 1_600_000_200, 1);
        index.set_status(&side[0], BlockStatus::Rejected);
        assert_eq!(index.best_candidate().unwrap().hash, main[1]);
    }

    #[test]
    fn test_descendants_follow_one_branch() {
        let (mut index, genesis) = genesis_index();
        let main = chain(&mut index, genesis, 2, 1_600_000_100, 0);
        index.set_active_tip(&main[1]);
        let side = chain(&mut index, genesis, 3, 1_600_000_200, 1);

        let mut found = index.descendants(&side[0]);
        found.sort();
        let mut expected = vec![side[1], side[2]];
        expected.sort();
        assert_eq!(found, expected);
        assert_eq!(index.descendants(&main[0]), vec![main[1]]);
        assert!(index.descendants(&side[2]).is_empty());
    }
}
