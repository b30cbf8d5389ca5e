mod config;
mod node;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;

use pocket_core::{ConsensusMode, Hash256, OutPoint};
use pocket_state::query_utxos;

use crate::config::{MineMode, NodeConfig};

#[derive(Parser)]
#[command(name = "pocketd")]
#[command(about = "Pocket hybrid PoW/PoS node", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `data_dir`
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Start from the regtest defaults instead of mainnet ones
    #[arg(long, global = true)]
    regtest: bool,

    /// Overrides `log_level`; RUST_LOG wins over both
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the chain and mine on its tip
    Run {
        /// Overrides `miner.mode`
        #[arg(long, value_enum)]
        mode: Option<MineMode>,

        /// Stop after this many connected blocks
        #[arg(long)]
        blocks: Option<u32>,
    },

    /// Write the coin set at the tip as a UTXO snapshot
    ExportUtxos { output: PathBuf },

    /// Report which outpoints (`txid:vout`) are unspent
    QueryUtxos {
        #[arg(required = true)]
        outpoints: Vec<String>,

        /// Print the binary response as hex instead of JSON
        #[arg(long)]
        hex: bool,
    },

    /// Print the effective configuration
    ShowConfig,
}

fn parse_outpoint(s: &str) -> Result<OutPoint> {
    let Some((txid, vout)) = s.split_once(':') else {
        bail!("outpoint {} is not txid:vout", s);
    };
    let txid = Hash256::from_hex(txid).with_context(|| format!("bad txid in {}", s))?;
    let vout = vout.parse().with_context(|| format!("bad vout in {}", s))?;
    Ok(OutPoint::new(txid, vout))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = NodeConfig::load(cli.config.as_deref(), cli.regtest)?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    env_logger::Builder::from_env(Env::default().default_filter_or(config.log_level.as_str())).init();

    match cli.command {
        Commands::Run { mode, blocks } => {
            let mode: ConsensusMode = mode.unwrap_or(config.miner.mode).into();
            info!("Starting pocketd in {}", config.data_dir.display());
            node::run(config, mode, blocks).await?;
        }
        Commands::ExportUtxos { output } => node::export_utxos(&config, &output)?,
        Commands::QueryUtxos { outpoints, hex } => {
            let outpoints = outpoints
                .iter()
                .map(|s| parse_outpoint(s))
                .collect::<Result<Vec<_>>>()?;
            let chain = node::open_chain(&config)?;
            let guard = chain.lock();
            let tip = guard.tip();
            // a fresh process has an empty pool: confirmed coins only
            let response = query_utxos(guard.view(), None, tip.height, tip.hash, &outpoints)?;
            if hex {
                println!("{}", response.to_hex()?);
            } else {
                println!("{}", serde_json::to_string_pretty(&response.to_json())?);
            }
        }
        Commands::ShowConfig => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
