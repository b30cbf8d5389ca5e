// COIN VIEW
// Layered read-through cache over the durable coin store.
//
// SAFETY INVARIANTS:
// 1. Layers form a stack inside one arena; each layer names its parent and
//    only the last layer accepts writes
// 2. A lookup walks from the active layer toward the base and falls through
//    to the store; the first layer holding the outpoint decides
// 3. A spent outpoint is a tombstone in the active layer and reads as absent
//    from that layer upward; only `restore` brings it back
// 4. `flush` merges the active layer into its parent; flushing the base
//    writes one atomic batch and leaves an empty base
// 5. Discarding a layer undoes exactly the writes made in it

use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;

use pocket_core::{Coin, CoinLookup, OutPoint, Transaction};

use crate::error::{Result, StateError};
use crate::state_storage::{CoinStore, StoreBatch};

pub type LayerId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Unspent(Coin),
    Spent,
}

#[derive(Debug, Default)]
struct Layer {
    parent: Option<LayerId>,
    slots: BTreeMap<OutPoint, Slot>,
    /// Non-coin writes (undo, blocks, best block) riding on this layer
    staged: StoreBatch,
}

pub struct CoinView {
    store: Arc<dyn CoinStore>,
    layers: Vec<Layer>,
}

impl CoinView {
    pub fn new(store: Arc<dyn CoinStore>) -> Self {
        CoinView {
            store,
            layers: vec![Layer::default()],
        }
    }

    pub fn store(&self) -> &Arc<dyn CoinStore> {
        &self.store
    }

    pub fn active(&self) -> LayerId {
        self.layers.len() - 1
    }

    /// Number of overlays above the base layer.
    pub fn overlay_depth(&self) -> usize {
        self.layers.len() - 1
    }

    /// Start a copy-on-write layer on top of the active one.
    pub fn push_overlay(&mut self) -> LayerId {
        let parent = self.active();
        self.layers.push(Layer {
            parent: Some(parent),
            ..Layer::default()
        });
        self.active()
    }

    /// Throw away the active overlay and everything written to it.
    pub fn pop_overlay(&mut self) -> Result<()> {
        if self.layers.len() == 1 {
            return Err(StateError::BaseLayer);
        }
        if let Some(layer) = self.layers.pop() {
            debug!("Discarded overlay with {} touched coins", layer.slots.len());
        }
        Ok(())
    }

    /// Discard overlays until only `depth` remain.
    pub fn truncate(&mut self, depth: usize) {
        self.layers.truncate(depth + 1);
    }

    /// Drop every uncommitted write, base layer included, so reads see the
    /// store alone. Used after a failed base flush.
    pub fn discard_all(&mut self) {
        self.layers = vec![Layer::default()];
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        let mut cursor = Some(self.active());
        while let Some(id) = cursor {
            let layer = &self.layers[id];
            match layer.slots.get(outpoint) {
                Some(Slot::Unspent(coin)) => return Ok(Some(coin.clone())),
                Some(Slot::Spent) => return Ok(None),
                None => cursor = layer.parent,
            }
        }
        self.store.coin(outpoint)
    }

    pub fn has_coin(&self, outpoint: &OutPoint) -> Result<bool> {
        Ok(self.get(outpoint)?.is_some())
    }

    /// Mark `outpoint` spent in the active layer and return the coin.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Coin> {
        let coin = self
            .get(outpoint)?
            .ok_or(StateError::MissingCoin(*outpoint))?;
        self.active_layer().slots.insert(*outpoint, Slot::Spent);
        Ok(coin)
    }

    pub fn add(&mut self, outpoint: OutPoint, coin: Coin) -> Result<()> {
        if self.get(&outpoint)?.is_some() {
            return Err(StateError::CoinExists(outpoint));
        }
        self.active_layer().slots.insert(outpoint, Slot::Unspent(coin));
        Ok(())
    }

    /// Bring back a coin spent by a block being disconnected.
    pub fn restore(&mut self, outpoint: OutPoint, coin: Coin) {
        self.active_layer().slots.insert(outpoint, Slot::Unspent(coin));
    }

    /// Add every spendable output of `tx` as created at `height`.
    pub fn add_outputs(&mut self, tx: &Transaction, height: u32) -> Result<()> {
        let txid = tx.txid();
        let is_reward = tx.is_reward();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.is_unspendable() {
                continue;
            }
            self.add(OutPoint::new(txid, vout as u32), Coin::new(output, height, is_reward))?;
        }
        Ok(())
    }

    /// Remove the outputs `add_outputs` created for `tx`.
    pub fn remove_outputs(&mut self, tx: &Transaction) -> Result<()> {
        let txid = tx.txid();
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.is_unspendable() {
                continue;
            }
            self.spend(&OutPoint::new(txid, vout as u32))?;
        }
        Ok(())
    }

    /// Store writes that commit together with the active layer.
    pub fn staged(&mut self) -> &mut StoreBatch {
        &mut self.active_layer().staged
    }

    fn active_layer(&mut self) -> &mut Layer {
        let id = self.active();
        &mut self.layers[id]
    }

    /// Merge the active layer into its parent. For the base layer, write one
    /// atomic batch to the store. Returns the number of merged entries.
    pub fn flush(&mut self) -> Result<usize> {
        let id = self.active();
        match self.layers[id].parent {
            Some(parent) => {
                let Some(layer) = self.layers.pop() else {
                    return Ok(0);
                };
                let merged = layer.slots.len();
                let target = &mut self.layers[parent];
                target.slots.extend(layer.slots);
                target.staged.append(layer.staged);
                Ok(merged)
            }
            None => {
                let batch = self.base_batch()?;
                let written = batch.len();
                self.store.write(batch)?;
                self.layers[id] = Layer::default();
                debug!("Flushed base layer: {} store ops", written);
                Ok(written)
            }
        }
    }

    /// Flush every overlay and then the base layer.
    pub fn flush_all(&mut self) -> Result<()> {
        while self.overlay_depth() > 0 {
            self.flush()?;
        }
        self.flush()?;
        Ok(())
    }

    fn base_batch(&self) -> Result<StoreBatch> {
        let base = &self.layers[0];
        let mut batch = StoreBatch::new();
        for (outpoint, slot) in &base.slots {
            match slot {
                Slot::Unspent(coin) => batch.put_coin(outpoint, coin)?,
                Slot::Spent => batch.delete_coin(outpoint),
            }
        }
        batch.append(base.staged.clone());
        Ok(batch)
    }

    /// Every unspent coin visible from the active layer, in outpoint order.
    pub fn coins(&self) -> Result<BTreeMap<OutPoint, Coin>> {
        let mut coins: BTreeMap<OutPoint, Coin> = self.store.coins()?.into_iter().collect();
        for layer in &self.layers {
            for (outpoint, slot) in &layer.slots {
                match slot {
                    Slot::Unspent(coin) => {
                        coins.insert(*outpoint, coin.clone());
                    }
                    Slot::Spent => {
                        coins.remove(outpoint);
                    }
                }
            }
        }
        Ok(coins)
    }

    pub fn total_value(&self) -> Result<u128> {
        Ok(self.coins()?.values().map(|c| c.value as u128).sum())
    }
}

impl CoinLookup for CoinView {
    type Error = StateError;

    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.get(outpoint)
    }
}
