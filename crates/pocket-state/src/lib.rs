pub mod error;
pub mod state_storage;
pub mod coin_view;
pub mod undo;
pub mod snapshot;
pub mod utxo_query;

pub use coin_view::{CoinView, LayerId};
pub use error::StateError;
pub use snapshot::UtxoSnapshot;
pub use state_storage::{
    open_store, Column, CoinStore, FlushMarker, MemoryStore, RocksStore, StorageBackend,
    StorageConfig, StoreBatch,
};
pub use undo::BlockUndo;
pub use utxo_query::{query_utxos, UtxoResponse, MAX_GETUTXOS_OUTPOINTS};
