use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser as _, Subcommand};
use serde_json::json;
use swap_intermediary::config::IntermediaryConfig;
use swap_intermediary::store::SqliteStore;
use swap_intermediary::swap::SwapKey;
use swap_intermediary::vault::Vault;

#[derive(Debug, clap::Parser)]
struct Args {
    /// JSON config; its store path is used unless --store-path is given.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    store_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    ListSwaps {
        /// to_btc, from_btc_ln or vault_swap
        #[arg(long)]
        family: Option<String>,
    },
    GetSwap {
        #[arg(long)]
        family: String,

        #[arg(long)]
        identifier_hash: String,

        #[arg(long, default_value_t = 0)]
        sequence: u64,
    },
    ListVaults,
    VaultBalances,
    CheckConfig,
}

fn main() -> Result<()> {
    swap_intermediary::logging::init().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => IntermediaryConfig::from_json_file(path)?,
        None => IntermediaryConfig::default(),
    };
    let store_path = args.store_path.unwrap_or_else(|| config.store_path.clone());
    let open_store = || SqliteStore::open(store_path.clone()).context("open store");

    let out = match args.command {
        Command::CheckConfig => serde_json::to_value(&config)?,
        Command::ListSwaps { family } => {
            let rows = open_store()?.swap_rows(family.as_deref())?;
            json!(
                rows.into_iter()
                    .map(|r| json!({
                      "family": r.namespace,
                      "key": r.key.to_string(),
                      "chain_id": r.chain_id,
                      "state": r.state,
                    }))
                    .collect::<Vec<_>>()
            )
        }
        Command::GetSwap {
            family,
            identifier_hash,
            sequence,
        } => {
            let key = SwapKey::new(identifier_hash, sequence);
            let swap: Option<serde_json::Value> = open_store()?.get_swap(&family, &key)?;
            swap.with_context(|| format!("swap {key} not found in {family}"))?
        }
        Command::ListVaults => {
            let rows = open_store()?.vault_rows()?;
            json!(
                rows.into_iter()
                    .map(|r| json!({
                      "key": r.key.to_string(),
                      "status": r.status,
                    }))
                    .collect::<Vec<_>>()
            )
        }
        Command::VaultBalances => {
            let vaults: Vec<Vault> = open_store()?.list_vaults()?;
            let mut out = Vec::with_capacity(vaults.len());
            for vault in vaults {
                let projected = vault.balances();
                out.push(json!({
                  "key": vault.key.to_string(),
                  "status": vault.status.name(),
                  "tokens": vault.tokens,
                  "confirmed": vault.confirmed.balances,
                  "projected": projected.as_ref().ok(),
                  "projection_error": projected.as_ref().err().map(|e| e.to_string()),
                  "pending": vault.pending.len(),
                  "replaced": vault.replaced.values().map(Vec::len).sum::<usize>(),
                  "ready": vault.is_ready(),
                  "latest_utxo": vault.latest_utxo().map(|u| u.to_string()),
                }));
            }
            json!(out)
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
