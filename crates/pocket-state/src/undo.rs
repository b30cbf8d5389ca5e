use serde::{Deserialize, Serialize};

use pocket_core::codec;
use pocket_core::{Coin, OutPoint};

use crate::error::Result;

/// Coins a block consumed, in the order it consumed them. Disconnecting the
/// block restores them in reverse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, Coin)>,
}

impl BlockUndo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outpoint: OutPoint, coin: Coin) {
        self.spent.push((outpoint, coin));
    }

    pub fn len(&self) -> usize {
        self.spent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(codec::encode(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(codec::decode(bytes)?)
    }
}
