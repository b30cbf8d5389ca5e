// MEMPOOL
// Unconfirmed, policy-valid transactions keyed by txid.
//
// SAFETY INVARIANTS:
// 1. Every input of every entry resolves to a confirmed coin or to an output
//    of another entry
// 2. No two entries spend the same outpoint (`spent_by` is a bijection onto
//    the inputs of all entries)
// 3. `ancestors` of an entry is the transitive closure of its in-pool
//    parents; `children` is the inverse of the parent relation
// 4. The pool never writes to the coin view
// 5. A rejected submission leaves the pool exactly as it was, including
//    when the size limit would evict the newcomer right after its
//    replacements were applied

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::codec::{self, CodecError};
use crate::coin::CoinLookup;
use crate::error::ChainError;
use crate::hash::Hash256;
use crate::params::{ConsensusParams, MempoolPolicy};
use crate::transaction::{OutPoint, Transaction, TxOut};

/// Fee paid per unit of weight, compared by cross multiplication so no
/// precision is lost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeRate {
    pub fee: u64,
    pub weight: u64,
}

impl FeeRate {
    pub fn new(fee: u64, weight: u64) -> Self {
        FeeRate { fee, weight }
    }

    /// Satoshis per 1000 weight, rounded down. Display only.
    pub fn per_kw(&self) -> u64 {
        let weight = self.weight.max(1) as u128;
        (self.fee as u128 * 1_000 / weight) as u64
    }
}

impl PartialEq for FeeRate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FeeRate {}

impl PartialOrd for FeeRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FeeRate {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.fee as u128 * other.weight.max(1) as u128;
        let rhs = other.fee as u128 * self.weight.max(1) as u128;
        lhs.cmp(&rhs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: u64,
    pub weight: u64,
    pub sigops: u32,
    /// Unconfirmed ancestors currently in the pool
    pub ancestors: BTreeSet<Hash256>,
    /// Unix seconds at first admission
    pub entry_time: i64,
    /// Tip height at first admission
    pub entry_height: u32,
}

impl MempoolEntry {
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::new(self.fee, self.weight)
    }

    pub fn spends(&self) -> impl Iterator<Item = &OutPoint> + '_ {
        self.tx.inputs.iter().map(|i| &i.prevout)
    }
}

/// Successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub txid: Hash256,
    pub fee: u64,
    pub weight: u64,
    /// Entries evicted by this replacement, conflicts and descendants
    pub replaced: Vec<Hash256>,
}

/// Chain context an admission is checked against.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    pub params: &'a ConsensusParams,
    /// Height of the block that would include the transaction
    pub next_height: u32,
    pub now: i64,
    /// Skip the absurd-fee ceiling
    pub allow_absurd_fee: bool,
}

pub struct Mempool {
    policy: MempoolPolicy,
    entries: BTreeMap<Hash256, MempoolEntry>,
    /// outpoint -> txid of the entry spending it
    spent_by: BTreeMap<OutPoint, Hash256>,
    /// txid -> in-pool children
    children: BTreeMap<Hash256, BTreeSet<Hash256>>,
    total_weight: u64,
}

impl Mempool {
    pub fn new(policy: MempoolPolicy) -> Self {
        Mempool {
            policy,
            entries: BTreeMap::new(),
            spent_by: BTreeMap::new(),
            children: BTreeMap::new(),
            total_weight: 0,
        }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Entries in txid order.
    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> + '_ {
        self.entries.values()
    }

    /// True if any entry consumes `outpoint`.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent_by.contains_key(outpoint)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent_by.get(outpoint).copied()
    }

    /// Output created by a pool transaction.
    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.entries
            .get(&outpoint.txid)
            .and_then(|e| e.tx.outputs.get(outpoint.vout as usize))
    }

    /// Total value of outputs created by pool transactions.
    pub fn pending_output_value(&self) -> u128 {
        self.entries
            .values()
            .flat_map(|e| e.tx.outputs.iter())
            .map(|o| o.value as u128)
            .sum()
    }

    /// All in-pool descendants of `txid`, excluding itself.
    pub fn descendants(&self, txid: &Hash256) -> BTreeSet<Hash256> {
        let mut found = BTreeSet::new();
        let mut stack = vec![*txid];
        while let Some(next) = stack.pop() {
            if let Some(kids) = self.children.get(&next) {
                for kid in kids {
                    if found.insert(*kid) {
                        stack.push(*kid);
                    }
                }
            }
        }
        found
    }

    // PHASE 1: ADMISSION

    /// Validate `tx` against policy and the confirmed coins, then insert it,
    /// evicting conflicting entries when the replacement pays a strictly
    /// higher fee rate.
    pub fn submit<L: CoinLookup>(
        &mut self,
        tx: Transaction,
        coins: &L,
        ctx: &AdmissionContext<'_>,
    ) -> Result<Accepted, ChainError> {
        let txid = tx.txid();
        match self.admit(tx, txid, coins, ctx, None) {
            Ok(accepted) => {
                if accepted.replaced.is_empty() {
                    debug!("Accepted tx {} fee={} weight={}", txid, accepted.fee, accepted.weight);
                } else {
                    info!(
                        "Accepted tx {} replacing {} entries",
                        txid,
                        accepted.replaced.len()
                    );
                }
                Ok(accepted)
            }
            Err(e) => {
                debug!("Rejected tx {}: {}", txid, e);
                Err(e)
            }
        }
    }

    fn admit<L: CoinLookup>(
        &mut self,
        tx: Transaction,
        txid: Hash256,
        coins: &L,
        ctx: &AdmissionContext<'_>,
        preserved: Option<(i64, u32)>,
    ) -> Result<Accepted, ChainError> {
        // 0. structure
        if self.entries.contains_key(&txid) {
            return Err(ChainError::ConflictingSpend("txn-already-in-mempool".into()));
        }
        check_structure(&tx, ctx.params, &self.policy)?;
        let weight = tx.weight();

        // 1. inputs
        let mut missing = Vec::new();
        let mut conflicts = BTreeSet::new();
        let mut value_in: u64 = 0;
        for input in &tx.inputs {
            let prevout = &input.prevout;
            if let Some(spender) = self.spent_by.get(prevout) {
                conflicts.insert(*spender);
            }
            let value = if let Some(parent) = self.entries.get(&prevout.txid) {
                match parent.tx.outputs.get(prevout.vout as usize) {
                    Some(out) => out.value,
                    None => {
                        missing.push(*prevout);
                        continue;
                    }
                }
            } else {
                let coin = coins
                    .coin(prevout)
                    .map_err(|e| ChainError::StorageFailure(e.to_string()))?;
                match coin {
                    Some(coin) => {
                        if !coin.is_mature_at(ctx.next_height, ctx.params.coinbase_maturity) {
                            return Err(ChainError::ConsensusViolation(format!(
                                "bad-txns-premature-spend-of-reward {}",
                                prevout
                            )));
                        }
                        coin.value
                    }
                    None => {
                        missing.push(*prevout);
                        continue;
                    }
                }
            };
            value_in = value_in
                .checked_add(value)
                .ok_or_else(|| ChainError::MalformedInput("input value overflow".into()))?;
        }
        if !missing.is_empty() {
            return Err(ChainError::MissingInputs(missing));
        }

        // 2. fee
        let value_out = tx
            .value_out()
            .ok_or_else(|| ChainError::MalformedInput("output value overflow".into()))?;
        if value_in < value_out {
            return Err(ChainError::InsufficientFee(format!(
                "inputs {} below outputs {}",
                value_in, value_out
            )));
        }
        let fee = value_in - value_out;
        let min_fee = self.policy.min_fee_for(weight);
        if fee < min_fee {
            return Err(ChainError::InsufficientFee(format!(
                "fee {} below relay minimum {}",
                fee, min_fee
            )));
        }
        if fee > self.policy.absurd_fee && !ctx.allow_absurd_fee {
            return Err(ChainError::PolicyLimitExceeded(format!(
                "absurdly-high-fee {} > {}",
                fee, self.policy.absurd_fee
            )));
        }

        // 3. replacement
        let evicted = if conflicts.is_empty() {
            BTreeSet::new()
        } else {
            self.check_replacement(&tx, FeeRate::new(fee, weight), &conflicts)?
        };

        // 4. ancestry
        let ancestors = self.ancestors_of(&tx);
        self.check_package_limits(&ancestors, weight)?;

        // 5. commit
        let replaced: Vec<Hash256> = evicted.iter().copied().collect();
        let mut displaced: Vec<MempoolEntry> =
            replaced.iter().filter_map(|victim| self.remove_entry(victim)).collect();
        let (entry_time, entry_height) = preserved.unwrap_or((ctx.now, ctx.next_height.saturating_sub(1)));
        let entry = MempoolEntry {
            sigops: tx.sigop_count(),
            tx,
            txid,
            fee,
            weight,
            ancestors,
            entry_time,
            entry_height,
        };
        self.insert_entry(entry);

        // 6. size limit
        let trimmed = self.trim_entries();
        if trimmed.iter().any(|e| e.txid == txid) {
            displaced.extend(trimmed.into_iter().filter(|e| e.txid != txid));
            for entry in displaced {
                self.insert_entry(entry);
            }
            self.rebuild_links();
            return Err(ChainError::InsufficientFee(format!(
                "mempool full: rate {} does not beat the cheapest package",
                FeeRate::new(fee, weight).per_kw()
            )));
        }

        Ok(Accepted {
            txid,
            fee,
            weight,
            replaced,
        })
    }

    /// Returns the eviction set when `tx` may replace `conflicts`.
    fn check_replacement(
        &self,
        tx: &Transaction,
        rate: FeeRate,
        conflicts: &BTreeSet<Hash256>,
    ) -> Result<BTreeSet<Hash256>, ChainError> {
        let mut evicted = conflicts.clone();
        for conflict in conflicts {
            evicted.extend(self.descendants(conflict));
        }
        if evicted.len() > self.policy.max_replacement_evictions {
            return Err(ChainError::PolicyLimitExceeded(format!(
                "replacement evicts {} entries, limit {}",
                evicted.len(),
                self.policy.max_replacement_evictions
            )));
        }
        if tx.inputs.iter().any(|i| evicted.contains(&i.prevout.txid)) {
            return Err(ChainError::ConflictingSpend(
                "replacement spends an output of a transaction it evicts".into(),
            ));
        }

        let (fee, weight) = evicted
            .iter()
            .filter_map(|id| self.entries.get(id))
            .fold((0u64, 0u64), |(f, w), e| {
                (f.saturating_add(e.fee), w.saturating_add(e.weight))
            });
        let evicted_rate = FeeRate::new(fee, weight);
        if rate <= evicted_rate {
            return Err(ChainError::ConflictingSpend(format!(
                "replacement fee rate {} does not exceed {}",
                rate.per_kw(),
                evicted_rate.per_kw()
            )));
        }
        Ok(evicted)
    }

    fn ancestors_of(&self, tx: &Transaction) -> BTreeSet<Hash256> {
        let mut ancestors = BTreeSet::new();
        for input in &tx.inputs {
            if let Some(parent) = self.entries.get(&input.prevout.txid) {
                ancestors.insert(parent.txid);
                ancestors.extend(parent.ancestors.iter().copied());
            }
        }
        ancestors
    }

    fn check_package_limits(
        &self,
        ancestors: &BTreeSet<Hash256>,
        weight: u64,
    ) -> Result<(), ChainError> {
        if ancestors.len() + 1 > self.policy.ancestor_count_limit {
            return Err(ChainError::PolicyLimitExceeded(format!(
                "too-long-mempool-chain: {} ancestors",
                ancestors.len()
            )));
        }
        let package_weight = ancestors
            .iter()
            .filter_map(|id| self.entries.get(id))
            .fold(weight, |acc, e| acc.saturating_add(e.weight));
        if package_weight > self.policy.ancestor_weight_limit {
            return Err(ChainError::PolicyLimitExceeded(format!(
                "ancestor package weight {} exceeds {}",
                package_weight, self.policy.ancestor_weight_limit
            )));
        }
        for ancestor in ancestors {
            // the ancestor itself, its current descendants and the newcomer
            let count = self.descendants(ancestor).len() + 2;
            if count > self.policy.descendant_count_limit {
                return Err(ChainError::PolicyLimitExceeded(format!(
                    "too-long-mempool-chain: {} would have {} descendants",
                    ancestor, count
                )));
            }
        }
        Ok(())
    }

    fn insert_entry(&mut self, entry: MempoolEntry) {
        let txid = entry.txid;
        for prevout in entry.spends() {
            self.spent_by.insert(*prevout, txid);
            if self.entries.contains_key(&prevout.txid) {
                self.children.entry(prevout.txid).or_default().insert(txid);
            }
        }
        self.total_weight += entry.weight;
        self.entries.insert(txid, entry);
    }

    /// Remove one entry and unlink it. Descendants keep their place.
    fn remove_entry(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for prevout in entry.spends() {
            if self.spent_by.get(prevout) == Some(txid) {
                self.spent_by.remove(prevout);
            }
            if let Some(siblings) = self.children.get_mut(&prevout.txid) {
                siblings.remove(txid);
                if siblings.is_empty() {
                    self.children.remove(&prevout.txid);
                }
            }
        }
        self.children.remove(txid);
        self.total_weight -= entry.weight;
        Some(entry)
    }

    /// Remove an entry together with all its descendants.
    pub fn remove_with_descendants(&mut self, txid: &Hash256) -> Vec<MempoolEntry> {
        if !self.entries.contains_key(txid) {
            return Vec::new();
        }
        let mut doomed = self.descendants(txid);
        doomed.insert(*txid);
        doomed
            .iter()
            .filter_map(|id| self.remove_entry(id))
            .collect()
    }

    // PHASE 2: BLOCK FEEDBACK

    /// Drop transactions confirmed by a block and every entry conflicting
    /// with them. Returns the removed entries so a disconnect can restore
    /// them.
    pub fn remove_for_block(&mut self, transactions: &[Transaction]) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        let mut confirmed = BTreeSet::new();
        for tx in transactions {
            let txid = tx.txid();
            if let Some(entry) = self.remove_entry(&txid) {
                confirmed.insert(txid);
                removed.push(entry);
            }
            for input in &tx.inputs {
                if let Some(spender) = self.spent_by.get(&input.prevout).copied() {
                    if spender != txid {
                        let conflicted = self.remove_with_descendants(&spender);
                        debug!(
                            "Removed {} mempool entries conflicting with block tx {}",
                            conflicted.len(),
                            txid
                        );
                        removed.extend(conflicted);
                    }
                }
            }
        }
        if !confirmed.is_empty() {
            for entry in self.entries.values_mut() {
                entry.ancestors.retain(|a| !confirmed.contains(a));
            }
        }
        removed
    }

    /// Put back entries removed by `remove_for_block`, keeping their
    /// original metadata. Entries that now conflict are dropped.
    pub fn restore_entries(&mut self, entries: Vec<MempoolEntry>) -> usize {
        let mut restored = 0;
        for entry in entries {
            if self.entries.contains_key(&entry.txid) {
                continue;
            }
            if let Some(prevout) = entry.spends().find(|p| self.spent_by.contains_key(p)) {
                debug!("Not restoring {}: {} already spent in pool", entry.txid, prevout);
                continue;
            }
            self.insert_entry(entry);
            restored += 1;
        }
        self.rebuild_links();
        restored
    }

    /// Re-admit a transaction from a disconnected block through the normal
    /// policy checks, stamping it with the given metadata.
    pub fn readmit<L: CoinLookup>(
        &mut self,
        tx: Transaction,
        coins: &L,
        ctx: &AdmissionContext<'_>,
        entry_time: i64,
        entry_height: u32,
    ) -> Result<Accepted, ChainError> {
        let txid = tx.txid();
        self.admit(tx, txid, coins, ctx, Some((entry_time, entry_height)))
    }

    /// Drop entries whose inputs no longer resolve, for instance after the
    /// block that created their parent coins was disconnected.
    pub fn remove_unresolvable<L: CoinLookup>(&mut self, coins: &L) -> Result<usize, ChainError> {
        let mut removed = 0;
        loop {
            let mut orphan = None;
            'scan: for entry in self.entries.values() {
                for prevout in entry.spends() {
                    if self.entries.contains_key(&prevout.txid) {
                        continue;
                    }
                    let present = coins
                        .coin(prevout)
                        .map_err(|e| ChainError::StorageFailure(e.to_string()))?
                        .is_some();
                    if !present {
                        orphan = Some(entry.txid);
                        break 'scan;
                    }
                }
            }
            match orphan {
                Some(txid) => removed += self.remove_with_descendants(&txid).len(),
                None => break,
            }
        }
        if removed > 0 {
            info!("Removed {} mempool entries with unresolvable inputs", removed);
        }
        Ok(removed)
    }

    /// Recompute parent/child links and ancestor closures from scratch.
    fn rebuild_links(&mut self) {
        self.children.clear();
        let links: Vec<(Hash256, Hash256)> = self
            .entries
            .values()
            .flat_map(|e| e.spends().map(move |p| (p.txid, e.txid)))
            .filter(|(parent, _)| self.entries.contains_key(parent))
            .collect();
        for (parent, child) in links {
            self.children.entry(parent).or_default().insert(child);
        }

        let ids: Vec<Hash256> = self.entries.keys().copied().collect();
        for id in ids {
            let mut ancestors = BTreeSet::new();
            let mut stack: Vec<Hash256> = self.parents(&id);
            while let Some(parent) = stack.pop() {
                if ancestors.insert(parent) {
                    stack.extend(self.parents(&parent));
                }
            }
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.ancestors = ancestors;
            }
        }
    }

    fn parents(&self, txid: &Hash256) -> Vec<Hash256> {
        self.entries
            .get(txid)
            .map(|e| {
                e.spends()
                    .map(|p| p.txid)
                    .filter(|p| self.entries.contains_key(p))
                    .collect()
            })
            .unwrap_or_default()
    }

    // PHASE 3: MAINTENANCE

    /// Evict entries (and their descendants) admitted more than
    /// `expiry_secs` before `now`.
    pub fn expire(&mut self, now: i64) -> usize {
        let cutoff = now - self.policy.expiry_secs;
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|e| e.entry_time < cutoff)
            .map(|e| e.txid)
            .collect();
        let removed: usize = stale
            .iter()
            .map(|id| self.remove_with_descendants(id).len())
            .sum();
        if removed > 0 {
            info!("Expired {} mempool entries", removed);
        }
        removed
    }

    /// Evict the lowest fee-rate packages until the pool fits
    /// `max_pool_weight`.
    pub fn trim_to_size(&mut self) -> Vec<Hash256> {
        self.trim_entries().into_iter().map(|e| e.txid).collect()
    }

    fn trim_entries(&mut self) -> Vec<MempoolEntry> {
        let mut evicted = Vec::new();
        while self.total_weight > self.policy.max_pool_weight {
            let worst = self
                .entries
                .keys()
                .map(|id| (self.package_rate(id), *id))
                .min();
            let Some((rate, txid)) = worst else { break };
            let removed = self.remove_with_descendants(&txid);
            warn!(
                "Mempool over {} weight: evicted package {} ({} txs, rate {})",
                self.policy.max_pool_weight,
                txid,
                removed.len(),
                rate.per_kw()
            );
            evicted.extend(removed);
        }
        evicted
    }

    /// Fee rate of an entry together with its descendants.
    fn package_rate(&self, txid: &Hash256) -> FeeRate {
        let mut ids = self.descendants(txid);
        ids.insert(*txid);
        let (fee, weight) = ids
            .iter()
            .filter_map(|id| self.entries.get(id))
            .fold((0u64, 0u64), |(f, w), e| {
                (f.saturating_add(e.fee), w.saturating_add(e.weight))
            });
        FeeRate::new(fee, weight)
    }

    /// Entries in txid order, cloned for lock-free use.
    pub fn snapshot(&self) -> Vec<MempoolEntry> {
        self.entries.values().cloned().collect()
    }

    /// Canonical serialization of the pool contents.
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let entries: Vec<&MempoolEntry> = self.entries.values().collect();
        codec::encode(&entries)
    }
}

/// Context-free admission checks.
fn check_structure(
    tx: &Transaction,
    params: &ConsensusParams,
    policy: &MempoolPolicy,
) -> Result<(), ChainError> {
    if tx.inputs.is_empty() {
        return Err(ChainError::MalformedInput("no inputs".into()));
    }
    if tx.outputs.is_empty() {
        return Err(ChainError::MalformedInput("no outputs".into()));
    }
    if tx.is_coinbase() || tx.is_coinstake() {
        return Err(ChainError::MalformedInput("reward transaction outside a block".into()));
    }
    let mut seen = BTreeSet::new();
    for input in &tx.inputs {
        if input.prevout.is_null() {
            return Err(ChainError::MalformedInput("null prevout".into()));
        }
        if !seen.insert(input.prevout) {
            return Err(ChainError::MalformedInput(format!(
                "duplicate input {}",
                input.prevout
            )));
        }
    }
    match tx.value_out() {
        Some(total) if params.money_range(total) => {}
        _ => return Err(ChainError::MalformedInput("output value out of range".into())),
    }
    let weight = tx.weight();
    if weight > policy.max_tx_weight {
        return Err(ChainError::MalformedInput(format!(
            "tx weight {} exceeds {}",
            weight, policy.max_tx_weight
        )));
    }
    Ok(())
}
