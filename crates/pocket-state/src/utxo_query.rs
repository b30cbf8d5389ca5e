use serde::{Deserialize, Serialize};
use serde_json::json;

use pocket_core::codec;
use pocket_core::{ChainError, Coin, Hash256, Mempool, OutPoint, COIN};

use crate::coin_view::CoinView;

/// Most outpoints one query may ask about.
pub const MAX_GETUTXOS_OUTPOINTS: usize = 15;

/// Height reported for coins created by pool transactions.
pub const MEMPOOL_HEIGHT: u32 = 0x7fff_ffff;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoResponse {
    pub chain_height: u32,
    pub chain_tip: Hash256,
    /// One bit per queried outpoint in query order, LSB first in each byte
    pub bitmap: Vec<u8>,
    #[serde(skip)]
    pub bitmap_string: String,
    /// Coins for the hits, in query order
    pub outs: Vec<Coin>,
}

/// Report which of `outpoints` are unspent. With a pool, an outpoint is a
/// hit when no pool transaction spends it and it is either a confirmed coin
/// or an output of a pool transaction.
pub fn query_utxos(
    view: &CoinView,
    mempool: Option<&Mempool>,
    chain_height: u32,
    chain_tip: Hash256,
    outpoints: &[OutPoint],
) -> Result<UtxoResponse, ChainError> {
    if outpoints.len() > MAX_GETUTXOS_OUTPOINTS {
        return Err(ChainError::PolicyLimitExceeded(format!(
            "max outpoints exceeded (max: {}, tried: {})",
            MAX_GETUTXOS_OUTPOINTS,
            outpoints.len()
        )));
    }

    let mut bitmap = vec![0u8; outpoints.len().div_ceil(8)];
    let mut bitmap_string = String::with_capacity(outpoints.len());
    let mut outs = Vec::new();
    for (i, outpoint) in outpoints.iter().enumerate() {
        let coin = match mempool {
            Some(pool) if pool.is_spent(outpoint) => None,
            Some(pool) => match view.get(outpoint)? {
                Some(coin) => Some(coin),
                None => pool
                    .output(outpoint)
                    .map(|out| Coin::new(out, MEMPOOL_HEIGHT, false)),
            },
            None => view.get(outpoint)?,
        };
        let hit = coin.is_some();
        bitmap[i / 8] |= (hit as u8) << (i % 8);
        bitmap_string.push(if hit { '1' } else { '0' });
        outs.extend(coin);
    }

    Ok(UtxoResponse {
        chain_height,
        chain_tip,
        bitmap,
        bitmap_string,
        outs,
    })
}

impl UtxoResponse {
    /// {height, tip, bitmap, coins} in the wire codec.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainError> {
        Ok(codec::encode(self)?)
    }

    pub fn to_hex(&self) -> Result<String, ChainError> {
        Ok(hex::encode(self.to_bytes()?))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let utxos: Vec<serde_json::Value> = self
            .outs
            .iter()
            .map(|coin| {
                json!({
                    "height": coin.height,
                    "value": coin.value as f64 / COIN as f64,
                    "scriptPubKey": { "hex": hex::encode(&coin.script_pubkey) },
                })
            })
            .collect();
        json!({
            "chainHeight": self.chain_height,
            "chaintipHash": self.chain_tip.to_hex(),
            "bitmap": self.bitmap_string,
            "utxos": utxos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_storage::MemoryStore;
    use pocket_core::{AdmissionContext, ConsensusParams, MempoolPolicy, Transaction, TxIn, TxOut};
    use std::sync::Arc;

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Hash256([n; 32]), 0)
    }

    fn setup() -> (CoinView, Mempool, Transaction) {
        let mut view = CoinView::new(Arc::new(MemoryStore::new()));
        view.add(op(1), Coin::new(&TxOut::new(50_000, vec![0x51]), 1, false))
            .unwrap();
        view.add(op(2), Coin::new(&TxOut::new(60_000, vec![0x51]), 1, false))
            .unwrap();
        let params = ConsensusParams::regtest();
        let mut pool = Mempool::new(MempoolPolicy::default());
        let tx = Transaction::new(
            vec![TxIn::new(op(2), vec![])],
            vec![TxOut::new(55_000, vec![0x51])],
        );
        let ctx = AdmissionContext {
            params: &params,
            next_height: 5,
            now: 0,
            allow_absurd_fee: false,
        };
        pool.submit(tx.clone(), &view, &ctx).unwrap();
        (view, pool, tx)
    }

    #[test]
    fn test_bitmap_without_mempool() {
        let (view, _, tx) = setup();
        let query = [op(1), op(2), op(3), OutPoint::new(tx.txid(), 0)];
        let res = query_utxos(&view, None, 4, Hash256::ZERO, &query).unwrap();
        assert_eq!(res.bitmap, vec![0b0000_0011]);
        assert_eq!(res.bitmap_string, "1100");
        assert_eq!(res.outs.len(), 2);
    }

    #[test]
    fn test_bitmap_with_mempool() {
        let (view, pool, tx) = setup();
        let query = [op(1), op(2), op(3), OutPoint::new(tx.txid(), 0)];
        let res = query_utxos(&view, Some(&pool), 4, Hash256::ZERO, &query).unwrap();
        assert_eq!(res.bitmap, vec![0b0000_1001]);
        assert_eq!(res.bitmap_string, "1001");
        assert_eq!(res.outs[1].height, MEMPOOL_HEIGHT);
        assert_eq!(res.outs[1].value, 55_000);
    }

    #[test]
    fn test_bitmap_spans_bytes() {
        let (view, _, _) = setup();
        let mut query = vec![op(9); 8];
        query.push(op(1));
        let res = query_utxos(&view, None, 4, Hash256::ZERO, &query).unwrap();
        assert_eq!(res.bitmap, vec![0, 1]);
    }

    #[test]
    fn test_too_many_outpoints() {
        let (view, _, _) = setup();
        let query = vec![op(1); MAX_GETUTXOS_OUTPOINTS + 1];
        let err = query_utxos(&view, None, 4, Hash256::ZERO, &query).unwrap_err();
        assert_eq!(err.kind(), "policy-limit-exceeded");
    }

    #[test]
    fn test_encodings() {
        let (view, _, _) = setup();
        let res = query_utxos(&view, None, 4, Hash256([1; 32]), &[op(1)]).unwrap();
        let bytes = res.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &4u32.to_le_bytes());
        assert_eq!(res.to_hex().unwrap(), hex::encode(&bytes));
        let json = res.to_json();
        assert_eq!(json["bitmap"], "1");
        assert_eq!(json["utxos"][0]["height"], 1);
    }
}
