// === Proof Rules ===
pub mod difficulty;
pub mod engine;
pub mod pow_engine;
pub mod pos_engine;

// === Chain ===
pub mod block_index;
pub mod chain_state;

// === Block Production ===
pub mod assembler;

// === Application Overlay ===
pub mod overlay;

// === Re-exports ===
pub use assembler::{assemble, select_packages, AssembleError, AssemblySnapshot, BlockTemplate};
pub use block_index::{BlockIndex, BlockIndexEntry, BlockStatus, ChainTip};
pub use chain_state::{BlockOutcome, Chain, ChainGuard, ChainState};
pub use engine::{BlockContext, ConsensusEngine, ConsensusError};
pub use overlay::{BlockObserver, ClassifiedBlock, ObserverError, OverlayDispatcher};
pub use pos_engine::{PosEngine, StakeCandidate};
pub use pow_engine::PowEngine;
