use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{self, CodecError};
use crate::hash::{double_sha256, Hash256};
use crate::script;

/// Identity of a spendable output: (transaction id, output index).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        OutPoint { txid, vout }
    }

    /// The outpoint referenced by a coinbase input.
    pub fn null() -> Self {
        OutPoint {
            txid: Hash256::ZERO,
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }

    /// Key layout used by the stores: txid followed by big-endian index so
    /// outputs of one transaction sort together and in order.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid.0);
        key[32..].copy_from_slice(&self.vout.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 36 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let mut vout = [0u8; 4];
        vout.copy_from_slice(&key[32..]);
        Some(OutPoint {
            txid: Hash256(txid),
            vout: u32::from_be_bytes(vout),
        })
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", &self.txid.to_hex()[..16], self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    /// Unlock script
    pub script_sig: Vec<u8>,
    /// Witness stack, excluded from the txid
    pub witness: Vec<Vec<u8>>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        TxIn {
            prevout,
            script_sig,
            witness: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    /// Lock script
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        TxOut {
            value,
            script_pubkey,
        }
    }

    /// Zero-value output with an empty script (marks a coinstake).
    pub fn empty() -> Self {
        TxOut {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }

    /// Never enters the coin set: the coinstake marker or a data carrier.
    pub fn is_unspendable(&self) -> bool {
        self.is_empty() || self.script_pubkey.first() == Some(&script::OP_RETURN)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

/// Borrowed view of a transaction without witnesses, hashed for the txid.
#[derive(Serialize)]
struct StrippedTx<'a> {
    version: u32,
    inputs: Vec<StrippedTxIn<'a>>,
    outputs: &'a [TxOut],
    lock_time: u32,
}

#[derive(Serialize)]
struct StrippedTxIn<'a> {
    prevout: &'a OutPoint,
    script_sig: &'a [u8],
    sequence: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Transaction {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Coinbase transaction for `height`. The height is committed in the
    /// unlock script so coinbases of different blocks never share a txid.
    pub fn coinbase(height: u32, outputs: Vec<TxOut>) -> Self {
        let mut script_sig = height.to_le_bytes().to_vec();
        script_sig.push(script::OP_TRUE);
        Transaction::new(vec![TxIn::new(OutPoint::null(), script_sig)], outputs)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// A coinstake spends real coins and marks itself with an empty first
    /// output.
    pub fn is_coinstake(&self) -> bool {
        !self.inputs.is_empty()
            && !self.inputs[0].prevout.is_null()
            && self.outputs.len() >= 2
            && self.outputs[0].is_empty()
    }

    /// Coins created by this transaction carry the coinbase/coinstake flag.
    pub fn is_reward(&self) -> bool {
        self.is_coinbase() || self.is_coinstake()
    }

    pub fn txid(&self) -> Hash256 {
        let stripped = StrippedTx {
            version: self.version,
            inputs: self
                .inputs
                .iter()
                .map(|i| StrippedTxIn {
                    prevout: &i.prevout,
                    script_sig: &i.script_sig,
                    sequence: i.sequence,
                })
                .collect(),
            outputs: &self.outputs,
            lock_time: self.lock_time,
        };
        // Encoding a borrowed view of owned data cannot fail.
        let bytes = codec::encode(&stripped).unwrap_or_default();
        double_sha256(&bytes)
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| !i.witness.is_empty())
    }

    /// Weight is the full serialized size in bytes.
    pub fn weight(&self) -> u64 {
        codec::encoded_len(self)
    }

    /// Sum of output values, `None` on overflow.
    pub fn value_out(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    /// Legacy sigop count over unlock and lock scripts.
    pub fn sigop_count(&self) -> u32 {
        let ins: u32 = self
            .inputs
            .iter()
            .map(|i| script::count_sigops(&i.script_sig))
            .sum();
        let outs: u32 = self
            .outputs
            .iter()
            .map(|o| script::count_sigops(&o.script_pubkey))
            .sum();
        ins + outs
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}
