// NODE RUNTIME
// Opens the chain from the configured store and drives the miner.
//
// SAFETY INVARIANTS:
// 1. Every chain access goes through `Chain`, so mining rounds, mempool
//    maintenance and block processing never interleave inside the gate
// 2. The nonce search and stake search run on blocking threads and stop
//    at the next check of the shared cancel flag
// 3. A block found after cancellation is still presented; shutdown never
//    leaves a half-applied block because the gate commits atomically
// 4. A PoS template is fixed by the tip (time = MTP + 1), so after a miss
//    the miner waits for the tip to move instead of retrying the same kernel

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ed25519_dalek::SigningKey;
use log::{debug, info, warn};
use tokio::sync::{watch, Notify};

use pocket_consensus::{
    assemble, AssembleError, BlockObserver, BlockOutcome, Chain, ClassifiedBlock, ObserverError,
    PowEngine,
};
use pocket_core::script::p2pk;
use pocket_core::{Block, ConsensusMode, Hash256, SystemClock};
use pocket_state::{open_store, CoinStore, MemoryStore};

use crate::config::NodeConfig;

/// Publishes the active tip hash on every chain move.
struct TipWatch(watch::Sender<Hash256>);

impl BlockObserver for TipWatch {
    fn name(&self) -> &str {
        "tip-watch"
    }

    fn block_connected(&self, block: &ClassifiedBlock<'_>) -> Result<(), ObserverError> {
        self.0.send_replace(block.hash);
        Ok(())
    }

    fn block_disconnected(&self, block: &ClassifiedBlock<'_>) -> Result<(), ObserverError> {
        self.0.send_replace(block.block.header.prev_block);
        Ok(())
    }
}

fn watch_tip(chain: &Chain) -> watch::Receiver<Hash256> {
    let mut guard = chain.lock();
    let (sender, receiver) = watch::channel(guard.tip().hash);
    guard.register_observer(Arc::new(TipWatch(sender)));
    receiver
}

pub fn open_chain(config: &NodeConfig) -> Result<Chain> {
    let store: Arc<dyn CoinStore> = if config.uses_memory_store() {
        Arc::new(MemoryStore::new())
    } else {
        let dir = config.chain_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
        open_store(&dir, &config.storage)?
    };
    let chain = Chain::open(
        store,
        config.consensus.clone(),
        config.mempool.clone(),
        Arc::new(SystemClock),
    )?;
    let tip = chain.tip();
    info!("Chain open at height {} tip {}", tip.height, tip.hash);
    Ok(chain)
}

/// What one mining round needs, cloned out of the config.
#[derive(Clone)]
struct Miner {
    chain: Chain,
    config: NodeConfig,
    payout: Vec<u8>,
    stake_key: Option<SigningKey>,
}

impl Miner {
    /// Build and solve one block on the current tip. `None` when cancelled
    /// or when no stake is eligible yet.
    fn mine_one(&self, mode: ConsensusMode, cancel: &AtomicBool) -> Result<Option<Block>> {
        match mode {
            ConsensusMode::ProofOfWork => {
                let snapshot = self.chain.assembly_snapshot(&self.config.assembler, None)?;
                let mut block = assemble(&snapshot, &self.payout, mode)?.into_block();
                if PowEngine::solve(&mut block, cancel) {
                    Ok(Some(block))
                } else {
                    Ok(None)
                }
            }
            ConsensusMode::ProofOfStake => {
                let key = self
                    .stake_key
                    .as_ref()
                    .context("proof-of-stake mining without a stake key")?;
                let stake_script = p2pk(&key.verifying_key().to_bytes());
                let snapshot = self
                    .chain
                    .assembly_snapshot(&self.config.assembler, Some(&stake_script))?;
                match assemble(&snapshot, &self.payout, mode) {
                    Ok(template) => Ok(Some(template.sign(key)?)),
                    Err(e @ (AssembleError::NoEligibleStake | AssembleError::StakeKernelNotMet(_))) => {
                        debug!("No stake this round: {}", e);
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// **Mining loop**
///
/// Mines `mode` blocks on the tip until ctrl-c or until `limit` blocks
/// were connected, expiring and trimming the mempool every
/// `maintenance_interval_secs`.
pub async fn run(config: NodeConfig, mode: ConsensusMode, limit: Option<u32>) -> Result<()> {
    if config.miner.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(config.miner.threads)
            .build_global()
            .context("failed to size the mining thread pool")?;
    }
    let miner = Miner {
        chain: open_chain(&config)?,
        payout: config.miner.payout_script()?,
        stake_key: config.miner.signing_key()?,
        config,
    };

    let mut tips = watch_tip(&miner.chain);

    let cancel = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());
    let watcher = cancel.clone();
    let waker = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping miner"),
            Err(e) => warn!("Cannot listen for ctrl-c: {}", e),
        }
        watcher.store(true, Ordering::SeqCst);
        waker.notify_one();
    });

    let interval = Duration::from_secs(miner.config.miner.maintenance_interval_secs);
    let mut last_maintenance = Instant::now();
    let mut connected = 0u32;
    let mut idle_tip = None;
    info!("Mining {} blocks", mode.as_str());

    while !cancel.load(Ordering::SeqCst) && limit.map_or(true, |n| connected < n) {
        if last_maintenance.elapsed() >= interval {
            let dropped = miner.chain.lock().maintain_mempool();
            if dropped > 0 {
                info!("Mempool maintenance dropped {} entries", dropped);
            }
            last_maintenance = Instant::now();
        }

        let tip = *tips.borrow_and_update();
        let round = miner.clone();
        let flag = cancel.clone();
        let found = tokio::task::spawn_blocking(move || round.mine_one(mode, &flag)).await??;
        let Some(block) = found else {
            if mode == ConsensusMode::ProofOfStake {
                if idle_tip != Some(tip) {
                    info!("No stake meets the kernel on tip {}, waiting for the tip to move", tip);
                    idle_tip = Some(tip);
                }
                // maintenance still runs every interval while idle
                tokio::select! {
                    changed = tips.changed() => changed.context("tip watch closed")?,
                    _ = shutdown.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            continue;
        };

        let hash = block.hash();
        match miner.chain.process_block(block) {
            Ok(BlockOutcome::Connected { height, .. }) => {
                connected += 1;
                info!("Mined block {} at height {}", hash, height);
            }
            Ok(outcome) => debug!("Mined block {} not connected: {:?}", hash, outcome),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => warn!("Own block {} refused: {}", hash, e),
        }
    }

    let tip = miner.chain.tip();
    info!("Miner stopped at height {} tip {}", tip.height, tip.hash);
    Ok(())
}

pub fn export_utxos(config: &NodeConfig, output: &Path) -> Result<()> {
    let chain = open_chain(config)?;
    let guard = chain.lock();
    let tip = guard.tip();
    let snapshot = pocket_state::UtxoSnapshot::capture(guard.view(), tip.hash, tip.height)?;
    let file = std::fs::File::create(output)
        .with_context(|| format!("cannot create {}", output.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    snapshot.write_to(&mut writer)?;
    writer.flush()?;
    info!(
        "Wrote {} coins ({} total) to {}",
        snapshot.header.coin_count,
        snapshot.header.total_value,
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_state::StorageBackend;

    fn memory_regtest() -> NodeConfig {
        let mut config = NodeConfig::regtest();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    #[test]
    fn test_mine_one_pow_block() {
        let config = memory_regtest();
        let miner = Miner {
            chain: open_chain(&config).unwrap(),
            payout: config.miner.payout_script().unwrap(),
            stake_key: None,
            config,
        };
        let block = miner
            .mine_one(ConsensusMode::ProofOfWork, &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        let outcome = miner.chain.process_block(block).unwrap();
        assert!(matches!(outcome, BlockOutcome::Connected { height: 1, .. }));
    }

    #[test]
    fn test_pos_round_without_stake_is_idle() {
        let config = memory_regtest();
        let miner = Miner {
            chain: open_chain(&config).unwrap(),
            payout: config.miner.payout_script().unwrap(),
            stake_key: Some(SigningKey::from_bytes(&[3u8; 32])),
            config,
        };
        let found = miner
            .mine_one(ConsensusMode::ProofOfStake, &AtomicBool::new(false))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_tip_watch_follows_connects() {
        let config = memory_regtest();
        let miner = Miner {
            chain: open_chain(&config).unwrap(),
            payout: config.miner.payout_script().unwrap(),
            stake_key: None,
            config,
        };
        let mut tips = watch_tip(&miner.chain);
        let genesis = *tips.borrow_and_update();
        assert!(!tips.has_changed().unwrap());

        let block = miner
            .mine_one(ConsensusMode::ProofOfWork, &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        let hash = block.hash();
        miner.chain.process_block(block).unwrap();
        assert!(tips.has_changed().unwrap());
        assert_eq!(*tips.borrow_and_update(), hash);

        miner.chain.lock().disconnect_tip().unwrap();
        assert_eq!(*tips.borrow(), genesis);
    }

    #[test]
    fn test_export_writes_verifiable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::regtest();
        config.data_dir = dir.path().to_path_buf();
        let output = dir.path().join("utxos.bin");
        export_utxos(&config, &output).unwrap();

        let mut file = std::fs::File::open(&output).unwrap();
        let snapshot = pocket_state::UtxoSnapshot::read_from(&mut file).unwrap();
        assert_eq!(snapshot.header.height, 0);
        assert_eq!(snapshot.header.coin_count, 1);
    }
}
