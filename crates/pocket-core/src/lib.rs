// === Primitives ===
pub mod hash;
pub mod codec;
pub mod script;
pub mod transaction;
pub mod coin;
pub mod block;
pub mod merkle_tree;

// === Rules and Policy ===
pub mod params;
pub mod error;
pub mod clock;
pub mod block_validation;

// === Transactions and Mempool ===
pub mod mempool;
pub mod tx_kind;

// === Re-exports for broader ecosystem access ===
pub use block::{Block, BlockHeader, ConsensusMode};
pub use block_validation::BlockValidator;
pub use clock::{FixedClock, SystemClock, TimeSource};
pub use codec::CodecError;
pub use coin::{Coin, CoinLookup};
pub use error::ChainError;
pub use hash::{double_sha256, Hash256};
pub use mempool::{Accepted, AdmissionContext, FeeRate, Mempool, MempoolEntry};
pub use params::{AssemblerPolicy, ConsensusParams, MempoolPolicy, COIN};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};
pub use tx_kind::TxKind;
