// DURABLE STORE
// Key/value persistence for coins, undo records, blocks and chain metadata.
//
// SAFETY INVARIANTS:
// 1. Every durable mutation goes through one atomic `StoreBatch`
// 2. A synced flush marker precedes each batch and the batch deletes it, so
//    a marker found at open means the last flush never committed
// 3. Because batches are atomic, an interrupted flush leaves the store at
//    its pre-flush state; recovery only discards the marker
// 4. Coin keys are `OutPoint::to_key`, values are `Coin::encode`

use log::{debug, info, warn};
use parking_lot::RwLock;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use pocket_core::codec;
use pocket_core::{Block, Coin, Hash256, OutPoint};

use crate::error::{Result, StateError};
use crate::undo::BlockUndo;

const BEST_BLOCK_KEY: &[u8] = b"best-block";
const FLUSH_MARKER_KEY: &[u8] = b"flush-marker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    Coins,
    Undo,
    Blocks,
    Meta,
}

impl Column {
    pub const ALL: [Column; 4] = [Column::Coins, Column::Undo, Column::Blocks, Column::Meta];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Coins => "coins",
            Column::Undo => "undo",
            Column::Blocks => "blocks",
            Column::Meta => "meta",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

/// Ordered set of writes applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreBatch {
    ops: Vec<BatchOp>,
    best_block: Option<Hash256>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Best-block pointer this batch moves the store to, if any.
    pub fn best_block(&self) -> Option<Hash256> {
        self.best_block
    }

    pub fn put(&mut self, column: Column, key: &[u8], value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            column,
            key: key.to_vec(),
            value,
        });
    }

    pub fn delete(&mut self, column: Column, key: &[u8]) {
        self.ops.push(BatchOp::Delete {
            column,
            key: key.to_vec(),
        });
    }

    pub fn put_coin(&mut self, outpoint: &OutPoint, coin: &Coin) -> Result<()> {
        self.put(Column::Coins, &outpoint.to_key(), coin.encode()?);
        Ok(())
    }

    pub fn delete_coin(&mut self, outpoint: &OutPoint) {
        self.delete(Column::Coins, &outpoint.to_key());
    }

    pub fn put_undo(&mut self, block: &Hash256, undo: &BlockUndo) -> Result<()> {
        self.put(Column::Undo, block.as_bytes(), undo.encode()?);
        Ok(())
    }

    pub fn delete_undo(&mut self, block: &Hash256) {
        self.delete(Column::Undo, block.as_bytes());
    }

    pub fn put_block(&mut self, block: &Block) -> Result<()> {
        self.put(Column::Blocks, block.hash().as_bytes(), block.encode()?);
        Ok(())
    }

    pub fn delete_block(&mut self, hash: &Hash256) {
        self.delete(Column::Blocks, hash.as_bytes());
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.put(Column::Meta, BEST_BLOCK_KEY, hash.as_bytes().to_vec());
        self.best_block = Some(hash);
    }

    /// Append `other` after this batch's writes.
    pub fn append(&mut self, other: StoreBatch) {
        self.ops.extend(other.ops);
        if other.best_block.is_some() {
            self.best_block = other.best_block;
        }
    }
}

/// Written before a batch and deleted by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushMarker {
    pub from: Option<Hash256>,
    pub to: Option<Hash256>,
    pub ops: u64,
}

pub trait CoinStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every op of `batch` or none of them.
    fn apply(&self, batch: &StoreBatch, sync: bool) -> Result<()>;

    fn for_each(
        &self,
        column: Column,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()>;

    /// Crash-safe write: marker first, then the batch which clears it.
    fn write(&self, mut batch: StoreBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let marker = FlushMarker {
            from: self.best_block()?,
            to: batch.best_block(),
            ops: batch.len() as u64,
        };
        let mut head = StoreBatch::new();
        head.put(Column::Meta, FLUSH_MARKER_KEY, codec::encode(&marker)?);
        self.apply(&head, true)?;

        batch.delete(Column::Meta, FLUSH_MARKER_KEY);
        self.apply(&batch, true)?;
        debug!("Flushed {} ops to the store", marker.ops);
        Ok(())
    }

    /// Discard the marker of a flush that never committed.
    fn recover_interrupted_flush(&self) -> Result<Option<FlushMarker>> {
        let Some(bytes) = self.get(Column::Meta, FLUSH_MARKER_KEY)? else {
            return Ok(None);
        };
        let marker: FlushMarker = codec::decode(&bytes)?;
        warn!(
            "Found interrupted flush ({} ops, {:?} -> {:?}); store remains at the earlier tip",
            marker.ops, marker.from, marker.to
        );
        let mut clear = StoreBatch::new();
        clear.delete(Column::Meta, FLUSH_MARKER_KEY);
        self.apply(&clear, true)?;
        Ok(Some(marker))
    }

    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.get(Column::Coins, &outpoint.to_key())?
            .map(|bytes| Coin::decode(&bytes).map_err(StateError::from))
            .transpose()
    }

    fn best_block(&self) -> Result<Option<Hash256>> {
        match self.get(Column::Meta, BEST_BLOCK_KEY)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| StateError::Corrupt {
                    column: Column::Meta.name(),
                    reason: "best-block pointer is not 32 bytes".into(),
                })?;
                Ok(Some(Hash256(raw)))
            }
        }
    }

    fn block(&self, hash: &Hash256) -> Result<Option<Block>> {
        self.get(Column::Blocks, hash.as_bytes())?
            .map(|bytes| Block::decode(&bytes).map_err(StateError::from))
            .transpose()
    }

    fn undo(&self, hash: &Hash256) -> Result<Option<BlockUndo>> {
        self.get(Column::Undo, hash.as_bytes())?
            .map(|bytes| BlockUndo::decode(&bytes))
            .transpose()
    }

    fn blocks(&self) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        self.for_each(Column::Blocks, &mut |_, value| {
            blocks.push(Block::decode(value)?);
            Ok(())
        })?;
        Ok(blocks)
    }

    /// Every stored coin in key order.
    fn coins(&self) -> Result<Vec<(OutPoint, Coin)>> {
        let mut coins = Vec::new();
        self.for_each(Column::Coins, &mut |key, value| {
            let outpoint = OutPoint::from_key(key).ok_or_else(|| StateError::Corrupt {
                column: Column::Coins.name(),
                reason: format!("bad key length {}", key.len()),
            })?;
            coins.push((outpoint, Coin::decode(value)?));
            Ok(())
        })?;
        Ok(coins)
    }
}

// PHASE 1: IN-MEMORY STORE

/// Column maps behind a lock. Used by tests and offline tooling.
#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<[BTreeMap<Vec<u8>, Vec<u8>>; 4]>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> usize {
        self.columns.read()[column.index()].len()
    }
}

impl CoinStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.columns.read()[column.index()].get(key).cloned())
    }

    fn apply(&self, batch: &StoreBatch, _sync: bool) -> Result<()> {
        let mut columns = self.columns.write();
        for op in batch.ops() {
            match op {
                BatchOp::Put { column, key, value } => {
                    columns[column.index()].insert(key.clone(), value.clone());
                }
                BatchOp::Delete { column, key } => {
                    columns[column.index()].remove(key);
                }
            }
        }
        Ok(())
    }

    fn for_each(
        &self,
        column: Column,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let columns = self.columns.read();
        for (key, value) in columns[column.index()].iter() {
            visit(key, value)?;
        }
        Ok(())
    }
}

// PHASE 2: ROCKSDB STORE

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Rocksdb,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub max_open_files: i32,
    /// Bytes
    pub write_buffer_size: usize,
    pub enable_compression: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Rocksdb,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
            enable_compression: true,
        }
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
}

impl RocksStore {
    /// Open or create the database, then resolve any interrupted flush.
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening coin store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);
        opts.set_write_buffer_size(config.write_buffer_size);
        if config.enable_compression {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let descriptors: Vec<ColumnFamilyDescriptor> = Column::ALL
            .iter()
            .map(|column| ColumnFamilyDescriptor::new(column.name(), Options::default()))
            .collect();
        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(&opts, path, descriptors)?;

        let store = RocksStore { db };
        store.recover_interrupted_flush()?;
        Ok(store)
    }

    fn cf(&self, column: Column) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(column.name())
            .ok_or_else(|| StateError::ColumnFamilyNotFound(column.name().to_string()))
    }
}

impl CoinStore for RocksStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(column)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    fn apply(&self, batch: &StoreBatch, sync: bool) -> Result<()> {
        let mut write = WriteBatch::default();
        for op in batch.ops() {
            match op {
                BatchOp::Put { column, key, value } => write.put_cf(&self.cf(*column)?, key, value),
                BatchOp::Delete { column, key } => write.delete_cf(&self.cf(*column)?, key),
            }
        }
        let mut opts = WriteOptions::default();
        opts.set_sync(sync);
        self.db.write_opt(write, &opts)?;
        Ok(())
    }

    fn for_each(
        &self,
        column: Column,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let cf = self.cf(column)?;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            visit(&key[..], &value[..])?;
        }
        Ok(())
    }
}

/// Open the store selected by `config`.
pub fn open_store<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Arc<dyn CoinStore>> {
    match config.backend {
        StorageBackend::Rocksdb => Ok(Arc::new(RocksStore::open(path, config)?)),
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_core::TxOut;

    fn coin(value: u64) -> Coin {
        Coin::new(&TxOut::new(value, vec![0x51]), 1, false)
    }

    fn exercise(store: &dyn CoinStore) {
        let op = OutPoint::new(Hash256([1; 32]), 0);
        let mut batch = StoreBatch::new();
        batch.put_coin(&op, &coin(5)).unwrap();
        batch.set_best_block(Hash256([2; 32]));
        store.write(batch).unwrap();

        assert_eq!(store.coin(&op).unwrap(), Some(coin(5)));
        assert_eq!(store.best_block().unwrap(), Some(Hash256([2; 32])));
        assert_eq!(store.get(Column::Meta, FLUSH_MARKER_KEY).unwrap(), None);

        let mut batch = StoreBatch::new();
        batch.delete_coin(&op);
        store.write(batch).unwrap();
        assert_eq!(store.coin(&op).unwrap(), None);
    }

    #[test]
    fn test_memory_store_write_clears_marker() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_rocks_store_write_clears_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path(), &StorageConfig::default()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_marker_recovered_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path(), &StorageConfig::default()).unwrap();
            let marker = FlushMarker {
                from: None,
                to: Some(Hash256([3; 32])),
                ops: 7,
            };
            let mut head = StoreBatch::new();
            head.put(Column::Meta, FLUSH_MARKER_KEY, codec::encode(&marker).unwrap());
            store.apply(&head, true).unwrap();
        }
        let store = RocksStore::open(dir.path(), &StorageConfig::default()).unwrap();
        assert_eq!(store.get(Column::Meta, FLUSH_MARKER_KEY).unwrap(), None);
        assert_eq!(store.best_block().unwrap(), None);
    }

    #[test]
    fn test_deleted_block_no_longer_listed() {
        let store = MemoryStore::new();
        let block = pocket_core::ConsensusParams::regtest().genesis_block();
        let mut batch = StoreBatch::new();
        batch.put_block(&block).unwrap();
        store.write(batch).unwrap();
        assert_eq!(store.blocks().unwrap().len(), 1);

        let mut batch = StoreBatch::new();
        batch.delete_block(&block.hash());
        store.write(batch).unwrap();
        assert!(store.blocks().unwrap().is_empty());
        assert_eq!(store.block(&block.hash()).unwrap(), None);
    }

    #[test]
    fn test_coins_iterate_in_key_order() {
        let store = MemoryStore::new();
        let mut batch = StoreBatch::new();
        let high = OutPoint::new(Hash256([1; 32]), 256);
        let low = OutPoint::new(Hash256([1; 32]), 1);
        batch.put_coin(&high, &coin(1)).unwrap();
        batch.put_coin(&low, &coin(2)).unwrap();
        store.write(batch).unwrap();
        let coins = store.coins().unwrap();
        assert_eq!(coins[0].0, low);
        assert_eq!(coins[1].0, high);
    }
}
