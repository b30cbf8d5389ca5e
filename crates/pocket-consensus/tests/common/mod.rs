#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use pocket_consensus::{assemble, ChainState, PowEngine};
use pocket_core::script::{p2pk, OP_TRUE};
use pocket_core::{
    AssemblerPolicy, Block, ConsensusMode, ConsensusParams, FixedClock, MempoolPolicy, OutPoint,
    Transaction, TxIn, TxOut,
};
use pocket_state::{CoinStore, MemoryStore};

pub const START_TIME: i64 = 1_600_000_000 + 1_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn anyone() -> Vec<u8> {
    vec![OP_TRUE]
}

pub fn staker() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn staker_script() -> Vec<u8> {
    p2pk(&staker().verifying_key().to_bytes())
}

pub fn open_with(store: Arc<dyn CoinStore>, params: ConsensusParams) -> ChainState {
    open_with_policy(store, params, MempoolPolicy::default())
}

pub fn open_with_policy(
    store: Arc<dyn CoinStore>,
    params: ConsensusParams,
    policy: MempoolPolicy,
) -> ChainState {
    init_logging();
    ChainState::open(store, params, policy, Arc::new(FixedClock::new(START_TIME))).unwrap()
}

pub fn regtest_chain() -> ChainState {
    open_with(Arc::new(MemoryStore::new()), ConsensusParams::regtest())
}

/// Assemble, solve and connect one PoW block paying `payout`.
pub fn mine_pow(state: &mut ChainState, payout: &[u8]) -> Block {
    let block = solved_pow_block(state, payout);
    state.process_block(block.clone()).unwrap();
    block
}

pub fn solved_pow_block(state: &ChainState, payout: &[u8]) -> Block {
    let snapshot = state
        .assembly_snapshot(&AssemblerPolicy::default(), None)
        .unwrap();
    let template = assemble(&snapshot, payout, ConsensusMode::ProofOfWork).unwrap();
    let mut block = template.into_block();
    assert!(PowEngine::solve(&mut block, &AtomicBool::new(false)));
    block
}

pub fn genesis_coin(params: &ConsensusParams) -> OutPoint {
    OutPoint::new(params.genesis_block().transactions[0].txid(), 0)
}

/// Spend `prevout` worth `value` to an anyone-can-spend output minus `fee`.
pub fn spend(prevout: OutPoint, value: u64, fee: u64) -> Transaction {
    Transaction::new(
        vec![TxIn::new(prevout, Vec::new())],
        vec![TxOut::new(value - fee, anyone())],
    )
}
