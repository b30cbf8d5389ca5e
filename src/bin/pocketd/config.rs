use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use config::{Config, Environment, File};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use pocket_core::{AssemblerPolicy, ConsensusMode, ConsensusParams, MempoolPolicy};
use pocket_state::{StorageBackend, StorageConfig};

/// Prefix of environment overrides, e.g. `POCKET__MEMPOOL__EXPIRY_SECS`.
pub const ENV_PREFIX: &str = "POCKET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MineMode {
    Pow,
    Pos,
}

impl From<MineMode> for ConsensusMode {
    fn from(mode: MineMode) -> Self {
        match mode {
            MineMode::Pow => ConsensusMode::ProofOfWork,
            MineMode::Pos => ConsensusMode::ProofOfStake,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub mode: MineMode,
    /// Hex lock script receiving rewards
    pub payout_script: String,
    /// Nonce search threads, 0 for one per core
    pub threads: usize,
    /// Hex 32-byte ed25519 seed of the staking key
    pub stake_key: Option<String>,
    pub maintenance_interval_secs: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        MinerConfig {
            mode: MineMode::Pow,
            payout_script: String::new(),
            threads: 0,
            stake_key: None,
            maintenance_interval_secs: 60,
        }
    }
}

impl MinerConfig {
    pub fn payout_script(&self) -> Result<Vec<u8>> {
        hex::decode(&self.payout_script).context("miner.payout_script is not hex")
    }

    pub fn signing_key(&self) -> Result<Option<SigningKey>> {
        let Some(seed) = &self.stake_key else {
            return Ok(None);
        };
        let bytes = hex::decode(seed).context("miner.stake_key is not hex")?;
        let seed: [u8; 32] = match bytes.try_into() {
            Ok(seed) => seed,
            Err(bytes) => bail!("miner.stake_key must be 32 bytes, got {}", bytes.len()),
        };
        Ok(Some(SigningKey::from_bytes(&seed)))
    }
}

/// Everything `pocketd` reads at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub consensus: ConsensusParams,
    pub mempool: MempoolPolicy,
    pub assembler: AssemblerPolicy,
    pub storage: StorageConfig,
    pub miner: MinerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("pocket-data"),
            log_level: "info".into(),
            consensus: ConsensusParams::default(),
            mempool: MempoolPolicy::default(),
            assembler: AssemblerPolicy::default(),
            storage: StorageConfig::default(),
            miner: MinerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Local test network mined by an anyone-can-spend payout.
    pub fn regtest() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("pocket-regtest"),
            log_level: "debug".into(),
            consensus: ConsensusParams::regtest(),
            miner: MinerConfig {
                payout_script: hex::encode([pocket_core::script::OP_TRUE]),
                threads: 1,
                maintenance_interval_secs: 10,
                ..MinerConfig::default()
            },
            ..NodeConfig::default()
        }
    }

    /// **Layer the configuration sources**
    ///
    /// Built-in defaults (mainnet-like, or regtest), then the TOML file,
    /// then `POCKET__SECTION__KEY` environment variables. Later sources
    /// win.
    pub fn load(path: Option<&Path>, regtest: bool) -> Result<Self> {
        let defaults = if regtest {
            NodeConfig::regtest()
        } else {
            NodeConfig::default()
        };
        let mut builder = Config::builder().add_source(Config::try_from(&defaults)?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: NodeConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let consensus = &self.consensus;
        ensure!(consensus.median_time_span > 0, "consensus.median_time_span must be positive");
        ensure!(consensus.retarget_window >= 2, "consensus.retarget_window must be at least 2");
        ensure!(consensus.target_spacing_secs > 0, "consensus.target_spacing_secs must be positive");
        ensure!(
            consensus.stake_max_age_secs >= consensus.stake_min_age_secs,
            "consensus.stake_max_age_secs is below stake_min_age_secs"
        );
        ensure!(
            self.assembler.reserved_weight < self.assembler.max_block_weight,
            "assembler.reserved_weight leaves no room for transactions"
        );
        ensure!(
            self.mempool.max_tx_weight <= consensus.max_block_weight,
            "mempool.max_tx_weight exceeds the block weight limit"
        );
        self.miner.payout_script()?;
        let key = self.miner.signing_key()?;
        if self.miner.mode == MineMode::Pos && key.is_none() {
            bail!("miner.mode = \"pos\" needs miner.stake_key");
        }
        Ok(())
    }

    pub fn uses_memory_store(&self) -> bool {
        self.storage.backend == StorageBackend::Memory
    }

    pub fn chain_dir(&self) -> PathBuf {
        self.data_dir.join("chainstate")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::load(None, false).unwrap();
        assert_eq!(config.consensus.coinbase_maturity, 100);
        assert_eq!(config.miner.mode, MineMode::Pow);
        NodeConfig::regtest().validate().unwrap();
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
log_level = "warn"

[consensus]
coinbase_maturity = 7

[assembler]
reserved_weight = 8000

[storage]
backend = "memory"
"#
        )
        .unwrap();
        let config = NodeConfig::load(Some(file.path()), true).unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.consensus.coinbase_maturity, 7);
        // untouched keys keep the regtest defaults
        assert_eq!(config.consensus.stake_min_depth, 3);
        assert_eq!(config.assembler.reserved_weight, 8000);
        assert!(config.uses_memory_store());
    }

    #[test]
    fn test_env_overrides_file() {
        std::env::set_var("POCKET__MEMPOOL__ANCESTOR_COUNT_LIMIT", "9");
        let config = NodeConfig::load(None, true).unwrap();
        std::env::remove_var("POCKET__MEMPOOL__ANCESTOR_COUNT_LIMIT");
        assert_eq!(config.mempool.ancestor_count_limit, 9);
    }

    #[test]
    fn test_pos_requires_stake_key() {
        let mut config = NodeConfig::regtest();
        config.miner.mode = MineMode::Pos;
        assert!(config.validate().is_err());
        config.miner.stake_key = Some(hex::encode([7u8; 32]));
        config.validate().unwrap();
        config.miner.stake_key = Some("abcd".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_payout_script_rejected() {
        let mut config = NodeConfig::regtest();
        config.miner.payout_script = "zz".into();
        assert!(config.validate().is_err());
    }
}
