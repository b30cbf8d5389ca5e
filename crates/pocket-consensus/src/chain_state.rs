// CONSENSUS GATE
// Validates presented blocks and moves the active chain.
//
// SAFETY INVARIANTS:
// 1. Coin view, mempool, block index and tip are owned by one ChainState
//    behind one mutex; every validate-and-connect runs under its guard
// 2. A block moves Received -> StructurallyValid -> ConsensusValid ->
//    Connected, or ends Rejected; nothing is committed before
//    ConsensusValid
// 3. Connects, disconnects and whole reorgs are staged in nested overlays
//    and committed by one flush (coins, undo records and best-block pointer
//    in one atomic batch); any failure discards the overlays and leaves
//    coin view, mempool and tip untouched
// 4. The mempool follows the chain only after the commit succeeded
// 5. Observers run last and cannot undo anything
// 6. Rejected is recorded only for failures in data the block hash commits
//    to: the header, and the body through the merkle root. The PoS
//    signature is checked before the block is indexed or stored
// 7. A rejected block's body and the bodies of its descendants are
//    deleted, so a restart never reloads them

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use pocket_core::{
    Accepted, AdmissionContext, AssemblerPolicy, Block, BlockValidator, ChainError, ConsensusMode,
    ConsensusParams, Hash256, Mempool, MempoolEntry, MempoolPolicy, TimeSource, Transaction,
};
use pocket_state::{BlockUndo, CoinStore, CoinView, StateError, StoreBatch};

use crate::assembler::AssemblySnapshot;
use crate::block_index::{BlockIndex, BlockIndexEntry, BlockStatus, ChainTip};
use crate::difficulty;
use crate::engine::{BlockContext, ConsensusEngine, ConsensusError};
use crate::overlay::{notify_connected, notify_disconnected, BlockObserver, ClassifiedBlock};
use crate::pos_engine::{PosEngine, StakeCandidate};
use crate::pow_engine::PowEngine;

/// Blocks whose evicted mempool entries are kept for a disconnect.
const MAX_STASHED_BLOCKS: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block is on the active chain; `disconnected` blocks were rolled
    /// back to get there
    Connected { height: u32, disconnected: usize },
    /// Valid so far but on a branch with less work
    SideBranch { height: u32 },
    AlreadyKnown,
}

/// Result of moving the active chain.
#[derive(Debug, Default)]
struct Reorg {
    disconnected: Vec<(Block, u32)>,
    connected: Vec<(Block, u32)>,
}

/// Why a chain move was abandoned. Either way nothing was committed.
#[derive(Debug)]
enum SwitchError {
    /// `block` broke a consensus rule; the branch through it is dead
    Invalid { block: Hash256, error: ChainError },
    Failed(ChainError),
}

impl From<ChainError> for SwitchError {
    fn from(err: ChainError) -> Self {
        SwitchError::Failed(err)
    }
}

impl From<StateError> for SwitchError {
    fn from(err: StateError) -> Self {
        SwitchError::Failed(err.into())
    }
}

impl From<SwitchError> for ChainError {
    fn from(err: SwitchError) -> Self {
        match err {
            SwitchError::Invalid { error, .. } => error,
            SwitchError::Failed(error) => error,
        }
    }
}

/// Outcome of `activate_best_chain`.
#[derive(Debug, Default)]
struct Activation {
    disconnected: usize,
    /// Branch blocks rejected on the way, in the order they failed
    failures: Vec<(Hash256, ChainError)>,
}

pub struct ChainState {
    view: CoinView,
    mempool: Mempool,
    index: BlockIndex,
    params: ConsensusParams,
    clock: Arc<dyn TimeSource>,
    observers: Vec<Arc<dyn BlockObserver>>,
    /// Entries removed from the pool by each connected block
    stash: HashMap<Hash256, (u32, Vec<MempoolEntry>)>,
}

static POW_ENGINE: PowEngine = PowEngine;
static POS_ENGINE: PosEngine = PosEngine;

fn engine_for(mode: ConsensusMode) -> &'static dyn ConsensusEngine {
    match mode {
        ConsensusMode::ProofOfWork => &POW_ENGINE,
        ConsensusMode::ProofOfStake => &POS_ENGINE,
    }
}

impl ChainState {
    // PHASE 1: BOOTSTRAP

    /// **Open chain state over `store`**
    ///
    /// An empty store is initialized with the genesis block of `params`.
    /// Otherwise the block index is rebuilt from every stored block and the
    /// active chain is set from the best-block pointer. Stored blocks off
    /// the active chain come back as StructurallyValid and are validated
    /// again before they can become active.
    pub fn open(
        store: Arc<dyn CoinStore>,
        params: ConsensusParams,
        policy: MempoolPolicy,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, ChainError> {
        store.recover_interrupted_flush()?;
        let mut view = CoinView::new(store.clone());
        let mut index = BlockIndex::new(params.median_time_span);
        let genesis = params.genesis_block();
        let genesis_hash = genesis.hash();

        match store.best_block()? {
            None => {
                index.insert_genesis(&genesis.header);
                for tx in &genesis.transactions {
                    view.add_outputs(tx, 0)?;
                }
                let staged = view.staged();
                staged.put_block(&genesis)?;
                staged.put_undo(&genesis_hash, &BlockUndo::new())?;
                staged.set_best_block(genesis_hash);
                view.flush_all()?;
                info!("Initialized new chain at genesis {}", genesis_hash);
            }
            Some(best) => {
                let blocks = store.blocks()?;
                if !blocks.iter().any(|b| b.hash() == genesis_hash) {
                    return Err(ChainError::StorageFailure(format!(
                        "store does not hold genesis {}",
                        genesis_hash
                    )));
                }
                index.insert_genesis(&genesis.header);

                let mut children: HashMap<Hash256, Vec<Block>> = HashMap::new();
                for block in blocks {
                    if block.hash() != genesis_hash {
                        children.entry(block.header.prev_block).or_default().push(block);
                    }
                }
                let mut queue = VecDeque::from([genesis_hash]);
                while let Some(parent) = queue.pop_front() {
                    for child in children.remove(&parent).unwrap_or_default() {
                        let Some(mode) = child.mode() else { continue };
                        if let Some(entry) =
                            index.insert(&child.header, mode, BlockStatus::StructurallyValid)
                        {
                            queue.push_back(entry.hash);
                        }
                    }
                }
                if !index.contains(&best) {
                    return Err(ChainError::StorageFailure(format!(
                        "best block {} is not stored",
                        best
                    )));
                }
                index.set_active_tip(&best);
                for height in 1..=index.height() {
                    if let Some(hash) = index.active_at(height).map(|e| e.hash) {
                        index.set_status(&hash, BlockStatus::Connected);
                    }
                }
                info!(
                    "Loaded {} blocks, tip {} at height {}",
                    index.len(),
                    best,
                    index.height()
                );
            }
        }

        Ok(ChainState {
            view,
            mempool: Mempool::new(policy),
            index,
            params,
            clock,
            observers: Vec::new(),
            stash: HashMap::new(),
        })
    }

    pub fn register_observer(&mut self, observer: Arc<dyn BlockObserver>) {
        info!("Registered block observer {}", observer.name());
        self.observers.push(observer);
    }

    pub fn view(&self) -> &CoinView {
        &self.view
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn height(&self) -> u32 {
        self.index.height()
    }

    pub fn tip(&self) -> ChainTip {
        // the index holds at least genesis once open
        self.index.tip_summary().unwrap_or_default()
    }

    /// Expected bits for a `mode` block on top of `parent`.
    pub fn expected_bits(&self, parent: &Hash256, mode: ConsensusMode) -> u32 {
        let recent = self
            .index
            .recent_of_mode(parent, mode, self.params.retarget_window as usize);
        difficulty::next_bits(&self.params, mode, &recent)
    }

    // PHASE 2: TRANSACTIONS

    /// Admit `tx` to the mempool against the current tip.
    pub fn submit_transaction(
        &mut self,
        tx: Transaction,
        allow_absurd_fee: bool,
    ) -> Result<Accepted, ChainError> {
        let ctx = AdmissionContext {
            params: &self.params,
            next_height: self.index.height() + 1,
            now: self.clock.now(),
            allow_absurd_fee,
        };
        self.mempool.submit(tx, &self.view, &ctx)
    }

    /// Expire stale entries and trim the pool to size.
    pub fn maintain_mempool(&mut self) -> usize {
        let expired = self.mempool.expire(self.clock.now());
        expired + self.mempool.trim_to_size().len()
    }

    // PHASE 3: BLOCKS

    /// **Present a block to the gate**
    ///
    /// SAFETY: On `Err` the coin view, mempool and tip are exactly as
    /// before the call. An unknown parent yields `MissingInputs` so the
    /// caller can retry once the parent arrives.
    pub fn process_block(&mut self, block: Block) -> Result<BlockOutcome, ChainError> {
        let hash = block.hash();
        match self.accept_block(block) {
            Ok(outcome) => {
                debug!("Block {} processed: {:?}", hash, outcome);
                Ok(outcome)
            }
            Err(e) => {
                warn!("Rejected block {}: {}", hash, e);
                Err(e)
            }
        }
    }

    fn accept_block(&mut self, block: Block) -> Result<BlockOutcome, ChainError> {
        let hash = block.hash();
        if self.index.contains(&hash) {
            return if self.index.has_rejected_ancestor(&hash) {
                Err(ChainError::ConsensusViolation(format!("duplicate-invalid {}", hash)))
            } else {
                Ok(BlockOutcome::AlreadyKnown)
            };
        }

        // Received
        let parent = match self.index.get(&block.header.prev_block) {
            Some(parent) => parent.clone(),
            None => {
                info!("Block {} has unknown parent {}", hash, block.header.prev_block);
                return Err(ChainError::MissingInputs(Vec::new()));
            }
        };
        if self.index.has_rejected_ancestor(&parent.hash) {
            return Err(ChainError::ConsensusViolation("bad-prevblk".into()));
        }

        // StructurallyValid
        let mode = BlockValidator::validate(&block, &self.params, self.clock.now())?;
        self.check_header(&block, &parent, mode)?;

        let mut batch = StoreBatch::new();
        batch.put_block(&block)?;
        self.view.store().write(batch)?;
        let height = match self.index.insert(&block.header, mode, BlockStatus::StructurallyValid) {
            Some(entry) => entry.height,
            None => return Err(ChainError::MissingInputs(Vec::new())),
        };

        let activation = self.activate_best_chain()?;
        if self.index.is_active(&hash) {
            return Ok(BlockOutcome::Connected {
                height,
                disconnected: activation.disconnected,
            });
        }
        // the block itself or one of its ancestors failed to connect
        for (failed, error) in activation.failures {
            let on_branch = self
                .index
                .get(&failed)
                .and_then(|f| self.index.ancestor(&hash, f.height))
                .map_or(false, |a| a.hash == failed);
            if on_branch {
                return Err(error);
            }
        }
        info!("Block {} stored on a side branch at height {}", hash, height);
        Ok(BlockOutcome::SideBranch { height })
    }

    /// Header rules that need the parent but no coins.
    fn check_header(
        &self,
        block: &Block,
        parent: &BlockIndexEntry,
        mode: ConsensusMode,
    ) -> Result<(), ChainError> {
        let expected = self.expected_bits(&parent.hash, mode);
        if block.header.bits != expected {
            return Err(ConsensusError::BadDifficultyBits {
                expected,
                got: block.header.bits,
            }
            .into());
        }
        let median_time_past = self.index.median_time_past(&parent.hash);
        if block.header.time <= median_time_past {
            return Err(ConsensusError::TimeTooOld {
                time: block.header.time,
                median_time_past,
            }
            .into());
        }
        match mode {
            ConsensusMode::ProofOfWork => {
                PowEngine::check_proof(&block.hash(), block.header.bits, self.params.pow_limit_bits)?;
            }
            ConsensusMode::ProofOfStake => {
                // The signature is not part of the block hash. The stake must
                // come back to the staked script as coinstake output 1, which
                // the merkle root commits to, so that script names the signer.
                let signer = block
                    .transactions
                    .first()
                    .and_then(|coinstake| coinstake.outputs.get(1))
                    .ok_or(ConsensusError::StakeScriptMismatch)?;
                PosEngine::verify_signature(block, &signer.script_pubkey)?;
            }
        }
        Ok(())
    }

    /// **Move to the most-work valid branch**
    ///
    /// Keeps switching while some candidate beats the tip. A branch block
    /// that fails is rejected and the next best candidate is tried, so one
    /// bad block never keeps a valid branch from connecting. Only storage
    /// failures abort.
    fn activate_best_chain(&mut self) -> Result<Activation, ChainError> {
        let mut activation = Activation::default();
        loop {
            let (best, best_work) = match self.index.best_candidate() {
                Some(entry) => (entry.hash, entry.chain_work.clone()),
                None => break,
            };
            let tip = self.tip();
            if best == tip.hash || best_work <= tip.chain_work {
                break;
            }
            match self.switch_to(&best) {
                Ok(disconnected) => activation.disconnected += disconnected,
                Err(SwitchError::Invalid { block, error }) => {
                    self.reject_block(&block)?;
                    activation.failures.push((block, error));
                }
                Err(SwitchError::Failed(error)) => return Err(error),
            }
        }
        Ok(activation)
    }

    /// Mark `hash` Rejected and delete its body and every descendant body.
    fn reject_block(&mut self, hash: &Hash256) -> Result<(), ChainError> {
        self.index.set_status(hash, BlockStatus::Rejected);
        let mut batch = StoreBatch::new();
        batch.delete_block(hash);
        let descendants = self.index.descendants(hash);
        for descendant in &descendants {
            batch.delete_block(descendant);
        }
        self.view.store().write(batch)?;
        debug!("Pruned rejected block {} and {} descendants", hash, descendants.len());
        Ok(())
    }

    /// Roll the active tip back by one block.
    pub fn disconnect_tip(&mut self) -> Result<Block, ChainError> {
        let tip = self.tip();
        if tip.height == 0 {
            return Err(ChainError::ConsensusViolation("cannot disconnect genesis".into()));
        }
        let parent = self
            .index
            .get(&tip.hash)
            .map(|e| e.prev)
            .ok_or_else(|| ChainError::StorageFailure("tip not indexed".into()))?;
        self.switch_to(&parent).map_err(ChainError::from)?;
        self.load_block(&tip.hash)
    }

    /// **Make `target` the active tip**
    ///
    /// 1. Disconnect from the tip down to the fork point
    /// 2. Connect the branch up to `target`, each block in its own overlay
    /// 3. Commit everything with one flush
    /// 4. Update index, mempool and observers
    fn switch_to(&mut self, target: &Hash256) -> Result<usize, SwitchError> {
        let base_depth = self.view.overlay_depth();
        self.view.push_overlay();
        let staged = match self.stage_switch(target) {
            Ok(reorg) => reorg,
            Err(e) => {
                self.view.truncate(base_depth);
                return Err(e);
            }
        };
        if let Err(e) = self.view.flush_all() {
            // the batch is atomic: the store still holds the old tip
            self.view.discard_all();
            error!("Flush failed while moving to {}: {}", target, e);
            return Err(e.into());
        }

        self.index.set_active_tip(target);
        for (block, _) in &staged.disconnected {
            self.index.set_status(&block.hash(), BlockStatus::ConsensusValid);
        }
        for (block, _) in &staged.connected {
            self.index.set_status(&block.hash(), BlockStatus::Connected);
        }
        if !staged.disconnected.is_empty() {
            info!(
                "Reorganized to {}: disconnected {} blocks, connected {}",
                target,
                staged.disconnected.len(),
                staged.connected.len()
            );
        }
        for (block, height) in &staged.connected {
            info!(
                "Connected block {} at height {} ({} txs)",
                block.hash(),
                height,
                block.transactions.len()
            );
        }

        self.update_mempool(&staged)?;

        for (block, height) in &staged.disconnected {
            notify_disconnected(&self.observers, &ClassifiedBlock::new(block, *height));
        }
        for (block, height) in &staged.connected {
            notify_connected(&self.observers, &ClassifiedBlock::new(block, *height));
        }
        Ok(staged.disconnected.len())
    }

    /// Stage every disconnect and connect needed to reach `target` inside
    /// the overlay already pushed by the caller.
    fn stage_switch(&mut self, target: &Hash256) -> Result<Reorg, SwitchError> {
        let fork = self
            .index
            .fork_point(target)
            .map(|e| e.height)
            .ok_or_else(|| ChainError::StorageFailure(format!("no fork point for {}", target)))?;
        let mut reorg = Reorg::default();

        for height in (fork + 1..=self.index.height()).rev() {
            let hash = self
                .index
                .active_at(height)
                .map(|e| e.hash)
                .ok_or_else(|| ChainError::StorageFailure(format!("no active block at {}", height)))?;
            let block = self.load_block(&hash)?;
            let undo = self
                .view
                .store()
                .undo(&hash)?
                .ok_or_else(|| ChainError::StorageFailure(format!("no undo record for {}", hash)))?;
            disconnect_block(&mut self.view, &block, &undo)?;
            self.view.staged().set_best_block(block.header.prev_block);
            debug!("Staged disconnect of {} at height {}", hash, height);
            reorg.disconnected.push((block, height));
        }

        for hash in self.index.branch_to(target) {
            let block = self.load_block(&hash)?;
            let (entry, parent) = match self.index.get(&hash) {
                Some(entry) => match self.index.get(&entry.prev) {
                    Some(parent) => (entry.clone(), parent.clone()),
                    None => return Err(ChainError::StorageFailure(format!("parent of {} missing", hash)).into()),
                },
                None => return Err(ChainError::StorageFailure(format!("{} not indexed", hash)).into()),
            };

            self.view.push_overlay();
            let engine = engine_for(entry.mode);
            match connect_block(&mut self.view, &self.index, &self.params, engine, &block, &parent) {
                Ok(undo) => {
                    let staged = self.view.staged();
                    staged.put_undo(&hash, &undo)?;
                    staged.set_best_block(hash);
                    self.view.flush()?;
                    self.index.set_status(&hash, BlockStatus::ConsensusValid);
                    debug!("Staged connect of {} at height {}", hash, entry.height);
                    reorg.connected.push((block, entry.height));
                }
                Err(error) => {
                    self.view.pop_overlay()?;
                    if error.is_fatal() {
                        return Err(SwitchError::Failed(error));
                    }
                    warn!("Block {} failed to connect: {}", hash, error);
                    return Err(SwitchError::Invalid { block: hash, error });
                }
            }
        }
        Ok(reorg)
    }

    /// Feed committed chain movement back into the pool.
    fn update_mempool(&mut self, reorg: &Reorg) -> Result<(), ChainError> {
        let now = self.clock.now();
        let ctx = AdmissionContext {
            params: &self.params,
            next_height: self.index.height() + 1,
            now,
            allow_absurd_fee: true,
        };

        // oldest first so parents are back before their children
        for (block, height) in reorg.disconnected.iter().rev() {
            if let Some((_, entries)) = self.stash.remove(&block.hash()) {
                let restored = self.mempool.restore_entries(entries);
                debug!("Restored {} pool entries of block {}", restored, block.hash());
            }
            for tx in block.transactions.iter().skip(1) {
                if self.mempool.contains(&tx.txid()) {
                    continue;
                }
                if let Err(e) = self.mempool.readmit(tx.clone(), &self.view, &ctx, now, *height) {
                    debug!("Dropped disconnected tx {}: {}", tx.txid(), e);
                }
            }
        }

        for (block, height) in &reorg.connected {
            let removed = self.mempool.remove_for_block(&block.transactions);
            self.stash.insert(block.hash(), (*height, removed));
        }
        self.mempool.remove_unresolvable(&self.view)?;

        let floor = self.index.height().saturating_sub(MAX_STASHED_BLOCKS);
        self.stash.retain(|_, (height, _)| *height > floor);
        Ok(())
    }

    fn load_block(&self, hash: &Hash256) -> Result<Block, ChainError> {
        self.view
            .store()
            .block(hash)?
            .ok_or_else(|| ChainError::StorageFailure(format!("block {} not stored", hash)))
    }

    // PHASE 4: ASSEMBLY SNAPSHOT

    /// Capture what the assembler needs. `stake_script` selects the coins
    /// offered as stake; pool-spent coins are left out.
    pub fn assembly_snapshot(
        &self,
        policy: &AssemblerPolicy,
        stake_script: Option<&[u8]>,
    ) -> Result<AssemblySnapshot, ChainError> {
        let tip = self.tip();
        let mut stake_candidates = Vec::new();
        if let Some(script) = stake_script {
            for (outpoint, coin) in self.view.coins()? {
                if coin.script_pubkey != script || self.mempool.is_spent(&outpoint) {
                    continue;
                }
                let Some(block) = self.index.active_at(coin.height) else {
                    continue;
                };
                stake_candidates.push(StakeCandidate {
                    outpoint,
                    coin_time: block.time,
                    coin,
                });
            }
            stake_candidates.sort_by(|a, b| {
                b.coin
                    .value
                    .cmp(&a.coin.value)
                    .then_with(|| a.outpoint.cmp(&b.outpoint))
            });
        }
        Ok(AssemblySnapshot {
            pow_bits: self.expected_bits(&tip.hash, ConsensusMode::ProofOfWork),
            pos_bits: self.expected_bits(&tip.hash, ConsensusMode::ProofOfStake),
            tip,
            entries: self.mempool.snapshot(),
            stake_candidates,
            params: self.params.clone(),
            policy: policy.clone(),
        })
    }
}

/// **Apply `block` to the view as a child of `parent`**
///
/// SAFETY: The caller pushes an overlay first and discards it on `Err`.
/// Inputs resolve against the coins as of the earlier transactions of the
/// same block: outputs are added only after a transaction's inputs are
/// spent, so forward references find nothing.
fn connect_block(
    view: &mut CoinView,
    index: &BlockIndex,
    params: &ConsensusParams,
    engine: &dyn ConsensusEngine,
    block: &Block,
    parent: &BlockIndexEntry,
) -> Result<BlockUndo, ChainError> {
    let ctx = BlockContext {
        parent,
        index,
        view: &*view,
        params,
    };
    engine.verify_proof(block, &ctx)?;

    let height = parent.height + 1;
    let reward_tx = block
        .transactions
        .first()
        .ok_or_else(|| ChainError::MalformedInput("empty block".into()))?;
    if reward_tx.is_coinbase() && !reward_tx.inputs[0].script_sig.starts_with(&height.to_le_bytes()) {
        return Err(ChainError::ConsensusViolation("bad-cb-height".into()));
    }

    let mut undo = BlockUndo::new();
    let mut fees: u64 = 0;
    let mut stake_in: u64 = 0;
    for (i, tx) in block.transactions.iter().enumerate() {
        if !tx.is_coinbase() {
            let mut value_in: u64 = 0;
            for input in &tx.inputs {
                let coin = match view.spend(&input.prevout) {
                    Ok(coin) => coin,
                    Err(StateError::MissingCoin(outpoint)) => {
                        return Err(ConsensusError::MissingOrSpentInput { outpoint }.into())
                    }
                    Err(e) => return Err(e.into()),
                };
                if !coin.is_mature_at(height, params.coinbase_maturity) {
                    return Err(ConsensusError::PrematureSpend {
                        outpoint: input.prevout,
                        depth: coin.depth_at(height),
                    }
                    .into());
                }
                value_in = value_in
                    .checked_add(coin.value)
                    .filter(|v| params.money_range(*v))
                    .ok_or_else(|| ConsensusError::ValueConservation {
                        reason: format!("inputs of {} out of range", tx.txid()),
                    })?;
                undo.record(input.prevout, coin);
            }
            let value_out = tx.value_out().ok_or_else(|| ConsensusError::ValueConservation {
                reason: format!("outputs of {} overflow", tx.txid()),
            })?;
            if i == 0 {
                stake_in = value_in;
            } else {
                if value_out > value_in {
                    return Err(ConsensusError::ValueConservation {
                        reason: format!("{} spends {} from {}", tx.txid(), value_out, value_in),
                    }
                    .into());
                }
                fees = fees
                    .checked_add(value_in - value_out)
                    .ok_or_else(|| ConsensusError::Other("fee overflow".into()))?;
            }
        }
        view.add_outputs(tx, height)?;
    }

    let reward_out = reward_tx
        .value_out()
        .ok_or_else(|| ConsensusError::Other("reward overflow".into()))?;
    let (claimed, base) = match engine.mode() {
        ConsensusMode::ProofOfWork => (reward_out, params.subsidy_at(height)),
        ConsensusMode::ProofOfStake => (reward_out.saturating_sub(stake_in), params.stake_reward),
    };
    let allowed = base.saturating_add(fees);
    if claimed > allowed {
        return Err(ConsensusError::RewardTooHigh { claimed, allowed }.into());
    }
    Ok(undo)
}

/// Undo `block` using its undo record: per transaction in reverse, remove
/// the outputs it created and restore the coins it spent.
fn disconnect_block(view: &mut CoinView, block: &Block, undo: &BlockUndo) -> Result<(), ChainError> {
    let hash = block.hash();
    let corrupt = |reason: &str| ChainError::StorageFailure(format!("undo of {}: {}", hash, reason));
    let mut spent = undo.spent.iter().rev();
    for tx in block.transactions.iter().rev() {
        view.remove_outputs(tx)
            .map_err(|e| corrupt(&e.to_string()))?;
        if tx.is_coinbase() {
            continue;
        }
        for input in tx.inputs.iter().rev() {
            let (outpoint, coin) = spent.next().ok_or_else(|| corrupt("record too short"))?;
            if *outpoint != input.prevout {
                return Err(corrupt("record out of order"));
            }
            view.restore(*outpoint, coin.clone());
        }
    }
    if spent.next().is_some() {
        return Err(corrupt("record too long"));
    }
    Ok(())
}

/// Shared handle to the chain state.
#[derive(Clone)]
pub struct Chain {
    state: Arc<Mutex<ChainState>>,
}

/// Scoped exclusive access to the chain state.
pub type ChainGuard<'a> = MutexGuard<'a, ChainState>;

impl Chain {
    pub fn open(
        store: Arc<dyn CoinStore>,
        params: ConsensusParams,
        policy: MempoolPolicy,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, ChainError> {
        let state = ChainState::open(store, params, policy, clock)?;
        Ok(Chain {
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn lock(&self) -> ChainGuard<'_> {
        self.state.lock()
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<Accepted, ChainError> {
        self.lock().submit_transaction(tx, false)
    }

    pub fn process_block(&self, block: Block) -> Result<BlockOutcome, ChainError> {
        self.lock().process_block(block)
    }

    pub fn tip(&self) -> ChainTip {
        self.lock().tip()
    }

    pub fn assembly_snapshot(
        &self,
        policy: &AssemblerPolicy,
        stake_script: Option<&[u8]>,
    ) -> Result<AssemblySnapshot, ChainError> {
        self.lock().assembly_snapshot(policy, stake_script)
    }
}
