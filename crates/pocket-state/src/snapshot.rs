// UTXO SNAPSHOTS
// Portable export of the full coin set at one chain tip.
//
// SAFETY INVARIANTS:
// 1. Records are written in outpoint order, so two nodes at the same tip
//    produce identical files
// 2. The trailing digest is SHA-256 over the header and every record in
//    file order; a snapshot that fails the digest is never returned
// 3. Each record is length-prefixed so no single decode exceeds the codec
//    limit however large the coin set is

use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

use pocket_core::codec;
use pocket_core::{Coin, Hash256, OutPoint};

use crate::coin_view::CoinView;
use crate::error::{Result, StateError};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
    pub best_block: Hash256,
    pub height: u32,
    pub coin_count: u64,
    pub total_value: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoSnapshot {
    pub header: SnapshotHeader,
    pub coins: Vec<(OutPoint, Coin)>,
    pub digest: Hash256,
}

impl UtxoSnapshot {
    /// Capture every coin visible from the view's active layer.
    pub fn capture(view: &CoinView, best_block: Hash256, height: u32) -> Result<Self> {
        let coins: Vec<(OutPoint, Coin)> = view.coins()?.into_iter().collect();
        let header = SnapshotHeader {
            version: SNAPSHOT_VERSION,
            best_block,
            height,
            coin_count: coins.len() as u64,
            total_value: coins.iter().map(|(_, c)| c.value as u128).sum(),
        };
        let digest = Self::compute_digest(&header, &coins)?;
        info!(
            "Captured UTXO snapshot at height {}: {} coins, digest {}",
            height, header.coin_count, digest
        );
        Ok(UtxoSnapshot {
            header,
            coins,
            digest,
        })
    }

    pub fn compute_digest(header: &SnapshotHeader, coins: &[(OutPoint, Coin)]) -> Result<Hash256> {
        let mut hasher = Sha256::new();
        hasher.update(codec::encode(header)?);
        for record in coins {
            hasher.update(codec::encode(record)?);
        }
        Ok(Hash256(hasher.finalize().into()))
    }

    pub fn verify(&self) -> Result<()> {
        if self.header.coin_count != self.coins.len() as u64 {
            return Err(StateError::DigestMismatch);
        }
        if Self::compute_digest(&self.header, &self.coins)? != self.digest {
            return Err(StateError::DigestMismatch);
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_record(writer, &codec::encode(&self.header)?)?;
        for record in &self.coins {
            write_record(writer, &codec::encode(record)?)?;
        }
        writer.write_all(self.digest.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let header: SnapshotHeader = codec::decode(&read_record(reader)?)?;
        if header.version != SNAPSHOT_VERSION {
            return Err(StateError::Corrupt {
                column: "snapshot",
                reason: format!("unsupported version {}", header.version),
            });
        }
        let mut coins = Vec::with_capacity(header.coin_count.min(1 << 20) as usize);
        for _ in 0..header.coin_count {
            coins.push(codec::decode(&read_record(reader)?)?);
        }
        let mut digest = [0u8; 32];
        reader.read_exact(&mut digest)?;
        let snapshot = UtxoSnapshot {
            header,
            coins,
            digest: Hash256(digest),
        };
        snapshot.verify()?;
        Ok(snapshot)
    }
}

fn write_record<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_record<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as u64;
    if len > codec::MAX_DECODE_BYTES {
        return Err(StateError::Corrupt {
            column: "snapshot",
            reason: format!("record of {} bytes", len),
        });
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_storage::MemoryStore;
    use pocket_core::TxOut;
    use std::sync::Arc;

    fn populated() -> CoinView {
        let mut view = CoinView::new(Arc::new(MemoryStore::new()));
        for n in 1..=3u8 {
            view.add(
                OutPoint::new(Hash256([n; 32]), n as u32),
                Coin::new(&TxOut::new(n as u64 * 100, vec![0x51]), n as u32, n == 1),
            )
            .unwrap();
        }
        view
    }

    #[test]
    fn test_write_read_verifies() {
        let snapshot = UtxoSnapshot::capture(&populated(), Hash256([7; 32]), 3).unwrap();
        assert_eq!(snapshot.header.total_value, 600);
        let mut bytes = Vec::new();
        snapshot.write_to(&mut bytes).unwrap();
        let read = UtxoSnapshot::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(read, snapshot);
    }

    #[test]
    fn test_tampered_snapshot_rejected() {
        let snapshot = UtxoSnapshot::capture(&populated(), Hash256([7; 32]), 3).unwrap();
        let mut bytes = Vec::new();
        snapshot.write_to(&mut bytes).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            UtxoSnapshot::read_from(&mut bytes.as_slice()),
            Err(StateError::DigestMismatch)
        ));
    }
}
