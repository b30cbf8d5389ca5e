use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::transaction::{OutPoint, TxOut};

/// An unspent output together with where it was created.
///
/// Serialized field order is {height, is_reward, value, script}, the layout
/// consumed by UTXO query and snapshot tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub height: u32,
    /// Created by a coinbase or coinstake transaction
    pub is_reward: bool,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl Coin {
    pub fn new(output: &TxOut, height: u32, is_reward: bool) -> Self {
        Coin {
            height,
            is_reward,
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
        }
    }

    pub fn to_output(&self) -> TxOut {
        TxOut::new(self.value, self.script_pubkey.clone())
    }

    /// Confirmations the coin has when spent in a block at `spend_height`.
    pub fn depth_at(&self, spend_height: u32) -> u32 {
        spend_height.saturating_sub(self.height)
    }

    /// Reward coins may only be spent after `maturity` confirmations.
    pub fn is_mature_at(&self, spend_height: u32, maturity: u32) -> bool {
        !self.is_reward || self.depth_at(spend_height) >= maturity
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}

/// Read access to confirmed coins, implemented by the coin view.
pub trait CoinLookup {
    type Error: std::error::Error;

    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maturity() {
        let coin = Coin::new(&TxOut::new(10, vec![0x51]), 100, true);
        assert!(!coin.is_mature_at(150, 100));
        assert!(coin.is_mature_at(200, 100));

        let plain = Coin::new(&TxOut::new(10, vec![0x51]), 100, false);
        assert!(plain.is_mature_at(101, 100));
    }

    #[test]
    fn test_field_order_in_encoding() {
        let coin = Coin::new(&TxOut::new(0x0102, vec![0xab]), 7, true);
        let bytes = coin.encode().unwrap();
        assert_eq!(&bytes[..4], &7u32.to_le_bytes());
        assert_eq!(bytes[4], 1);
        assert_eq!(&bytes[5..13], &0x0102u64.to_le_bytes());
        assert_eq!(Coin::decode(&bytes).unwrap(), coin);
    }
}
