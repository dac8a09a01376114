use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::amounts::FeeConfig;
use crate::swap::from_btc_ln::FromBtcLnConfig;
use crate::swap::to_btc::ToBtcConfig;
use crate::vault::manager::VaultManagerConfig;
use crate::vault::swap::VaultSwapConfig;

/// Whole-process configuration, read from a JSON file. Every field has a
/// default so a config only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntermediaryConfig {
    pub store_path: PathBuf,
    pub swap_watchdog_secs: u64,
    pub vault_watchdog_secs: u64,
    /// Longest a swap may stay locked by one settlement action.
    pub swap_lock_secs: u64,
    pub to_btc: ToBtcConfig,
    pub from_btc_ln: FromBtcLnConfig,
    pub vaults: VaultManagerConfig,
    pub vault_swap: VaultSwapConfig,
}

impl Default for IntermediaryConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("swap-intermediary.sqlite"),
            swap_watchdog_secs: 30,
            vault_watchdog_secs: 60,
            swap_lock_secs: 60,
            to_btc: ToBtcConfig::default(),
            from_btc_ln: FromBtcLnConfig::default(),
            vaults: VaultManagerConfig::default(),
            vault_swap: VaultSwapConfig::default(),
        }
    }
}

impl IntermediaryConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.swap_watchdog_secs > 0, "swap_watchdog_secs must be > 0");
        ensure!(self.vault_watchdog_secs > 0, "vault_watchdog_secs must be > 0");
        ensure!(self.swap_lock_secs > 0, "swap_lock_secs must be > 0");
        check_fees("to_btc", &self.to_btc.fees)?;
        check_fees("from_btc_ln", &self.from_btc_ln.fees)?;
        check_fees("vault_swap", &self.vault_swap.fees)?;
        ensure!(
            self.to_btc.min_time_to_pay_secs < self.to_btc.escrow_timeout_secs,
            "to_btc.min_time_to_pay_secs must be below escrow_timeout_secs"
        );
        ensure!(self.vaults.claim_threshold > 0, "vaults.claim_threshold must be > 0");
        ensure!(
            self.vaults.required_confirmations > 0,
            "vaults.required_confirmations must be > 0"
        );
        Ok(())
    }
}

fn check_fees(section: &str, fees: &FeeConfig) -> Result<()> {
    ensure!(fees.min_sats <= fees.max_sats, "{section}.fees: min_sats above max_sats");
    ensure!(fees.max_fee_iterations > 0, "{section}.fees: max_fee_iterations must be > 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> Result<()> {
        let raw = r#"{ "swap_watchdog_secs": 5, "vaults": { "claim_threshold": 2 } }"#;
        let config: IntermediaryConfig = serde_json::from_str(raw)?;
        assert_eq!(config.swap_watchdog_secs, 5);
        assert_eq!(config.vaults.claim_threshold, 2);
        assert_eq!(config.vaults.lock_secs, VaultManagerConfig::default().lock_secs);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn inverted_fee_bounds_are_rejected() {
        let mut config = IntermediaryConfig::default();
        config.to_btc.fees.min_sats = config.to_btc.fees.max_sats + 1;
        assert!(config.validate().is_err());
    }
}
