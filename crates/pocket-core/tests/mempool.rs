use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;

use pocket_core::{
    AdmissionContext, Coin, CoinLookup, ConsensusParams, Hash256, Mempool, MempoolPolicy, OutPoint,
    Transaction, TxIn, TxOut,
};
use proptest::prelude::*;

const CONFIRMED: u8 = 6;
const COIN_VALUE: u64 = 1_000_000;

struct Confirmed(BTreeMap<OutPoint, Coin>);

impl CoinLookup for Confirmed {
    type Error = Infallible;

    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, Infallible> {
        Ok(self.0.get(outpoint).cloned())
    }
}

fn confirmed() -> Confirmed {
    Confirmed(
        (0..CONFIRMED)
            .map(|n| {
                (
                    OutPoint::new(Hash256([n + 1; 32]), 0),
                    Coin::new(&TxOut::new(COIN_VALUE, vec![0x51]), 1, false),
                )
            })
            .collect(),
    )
}

#[derive(Debug, Clone)]
enum Op {
    /// Spend up to two known outpoints, picked by index
    Submit(Vec<prop::sample::Index>, u64),
    Evict(prop::sample::Index),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (
            prop::collection::vec(any::<prop::sample::Index>(), 1..3),
            prop_oneof![Just(0u64), Just(2_000), Just(9_000), Just(40_000)],
        )
            .prop_map(|(picks, fee)| Op::Submit(picks, fee)),
        1 => any::<prop::sample::Index>().prop_map(Op::Evict),
    ]
}

fn ancestors_by_walk(pool: &Mempool, txid: &Hash256) -> BTreeSet<Hash256> {
    let mut found = BTreeSet::new();
    let mut stack = vec![*txid];
    while let Some(id) = stack.pop() {
        let Some(entry) = pool.get(&id) else { continue };
        for prevout in entry.spends() {
            if pool.contains(&prevout.txid) && found.insert(prevout.txid) {
                stack.push(prevout.txid);
            }
        }
    }
    found
}

fn check_invariants(pool: &Mempool, coins: &Confirmed) -> Result<(), TestCaseError> {
    let mut spent = BTreeSet::new();
    for entry in pool.entries() {
        let mut value_in = 0u64;
        for prevout in entry.spends() {
            prop_assert!(spent.insert(*prevout), "{} spent twice", prevout);
            prop_assert_eq!(pool.spender(prevout), Some(entry.txid));
            let value = match coins.0.get(prevout) {
                Some(coin) => coin.value,
                None => {
                    let parent = pool.get(&prevout.txid);
                    prop_assert!(parent.is_some(), "input {} unresolved", prevout);
                    let out = parent.and_then(|p| p.tx.outputs.get(prevout.vout as usize));
                    prop_assert!(out.is_some());
                    out.map_or(0, |o| o.value)
                }
            };
            value_in += value;
        }
        prop_assert_eq!(value_in - entry.tx.value_out().unwrap(), entry.fee);
        prop_assert_eq!(&entry.ancestors, &ancestors_by_walk(pool, &entry.txid));
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_pool_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = ConsensusParams::regtest();
        let coins = confirmed();
        let mut pool = Mempool::new(MempoolPolicy::default());
        let ctx = AdmissionContext { params: &params, next_height: 10, now: 0, allow_absurd_fee: false };

        // every outpoint ever created, with its value
        let mut known: Vec<(OutPoint, u64)> = coins.0.iter().map(|(op, c)| (*op, c.value)).collect();

        for (seed, op) in ops.into_iter().enumerate() {
            match op {
                Op::Submit(picks, fee) => {
                    let mut inputs: Vec<(OutPoint, u64)> = picks.iter().map(|p| known[p.index(known.len())]).collect();
                    inputs.sort();
                    inputs.dedup();
                    let value_in: u64 = inputs.iter().map(|(_, v)| v).sum();
                    let Some(spendable) = value_in.checked_sub(fee) else { continue };
                    let mut tx = Transaction::new(
                        inputs.iter().map(|(op, _)| TxIn::new(*op, vec![])).collect(),
                        vec![
                            TxOut::new(spendable / 2, vec![0x51]),
                            TxOut::new(spendable - spendable / 2, vec![0x51]),
                        ],
                    );
                    tx.lock_time = seed as u32;
                    let txid = tx.txid();
                    known.push((OutPoint::new(txid, 0), spendable / 2));
                    known.push((OutPoint::new(txid, 1), spendable - spendable / 2));

                    let before = pool.snapshot_bytes().unwrap();
                    match pool.submit(tx, &coins, &ctx) {
                        Ok(accepted) => {
                            prop_assert!(pool.contains(&txid));
                            for victim in &accepted.replaced {
                                prop_assert!(!pool.contains(victim));
                            }
                        }
                        Err(_) => prop_assert_eq!(pool.snapshot_bytes().unwrap(), before),
                    }
                }
                Op::Evict(pick) => {
                    let ids: Vec<Hash256> = pool.entries().map(|e| e.txid).collect();
                    if ids.is_empty() {
                        continue;
                    }
                    let victim = ids[pick.index(ids.len())];
                    let descendants = pool.descendants(&victim);
                    let removed = pool.remove_with_descendants(&victim);
                    prop_assert_eq!(removed.len(), descendants.len() + 1);
                }
            }
            check_invariants(&pool, &coins)?;
        }
    }
}
