#![allow(dead_code)]

pub mod mocks;
pub mod wait;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use swap_intermediary::chain::{ChainEvent, VaultEvent};
use swap_intermediary::config::IntermediaryConfig;
use swap_intermediary::intermediary::{Collaborators, Intermediary};
use swap_intermediary::plugins::SwapPlugin;
use swap_intermediary::price::TokenPrice;
use swap_intermediary::store::SqliteStore;
use swap_intermediary::vault::withdrawal::WithdrawalRequest;
use swap_intermediary::vault::{Utxo, Vault, VaultKey, VaultStatus, VaultToken};

use mocks::{MockChain, MockLightning, MockOracle, MockWallet};

pub const CHAIN_ID: &str = "testchain";
pub const OWNER: &str = "0xintermediary";
pub const TOKEN: &str = "USDC";

/// One whole token (no decimals) is worth 10 sats.
pub const PRICE: TokenPrice = TokenPrice {
    msat_per_token: 10_000,
    decimals: 0,
};

pub fn test_config() -> IntermediaryConfig {
    let mut config = IntermediaryConfig::default();
    config.to_btc.network = Network::Regtest;
    config.to_btc.required_confirmations = 1;
    config.vaults.required_confirmations = 1;
    config.vaults.claim_threshold = 2;
    config
}

type Parts = (Arc<MockChain>, Arc<MockWallet>, Arc<MockLightning>, Arc<MockOracle>);

pub struct Harness {
    pub node: Intermediary,
    pub chain: Arc<MockChain>,
    pub wallet: Arc<MockWallet>,
    pub lightning: Arc<MockLightning>,
    pub prices: Arc<MockOracle>,
}

impl Harness {
    pub fn new(config: &IntermediaryConfig) -> Result<Self> {
        Self::with_store(config, SqliteStore::open_in_memory()?)
    }

    pub fn with_store(config: &IntermediaryConfig, store: SqliteStore) -> Result<Self> {
        Self::with_plugins(config, store, Vec::new())
    }

    pub fn with_plugins(
        config: &IntermediaryConfig,
        store: SqliteStore,
        plugins: Vec<Arc<dyn SwapPlugin>>,
    ) -> Result<Self> {
        let chain = Arc::new(MockChain::new(CHAIN_ID, OWNER));
        let wallet = Arc::new(MockWallet::default());
        let lightning = Arc::new(MockLightning::default());
        let prices = Arc::new(MockOracle::new(PRICE));
        Self::build(config, store, (chain, wallet, lightning, prices), plugins)
    }

    /// Rebuilds a node over existing collaborators, as after a restart.
    pub fn restart(&self, config: &IntermediaryConfig, store: SqliteStore) -> Result<Self> {
        let parts = (
            self.chain.clone(),
            self.wallet.clone(),
            self.lightning.clone(),
            self.prices.clone(),
        );
        Self::build(config, store, parts, Vec::new())
    }

    fn build(
        config: &IntermediaryConfig,
        store: SqliteStore,
        (chain, wallet, lightning, prices): Parts,
        plugins: Vec<Arc<dyn SwapPlugin>>,
    ) -> Result<Self> {
        let _ = swap_intermediary::logging::init();
        let node = Intermediary::build(
            config,
            store,
            Collaborators {
                chains: vec![chain.clone()],
                wallet: wallet.clone(),
                lightning: lightning.clone(),
                prices: prices.clone(),
                plugins,
            },
        )
        .context("build intermediary")?;
        Ok(Self {
            node,
            chain,
            wallet,
            lightning,
            prices,
        })
    }

    pub async fn vault_event(&self, event: VaultEvent) -> Result<bool> {
        Ok(self.node.process_event(CHAIN_ID, &ChainEvent::Vault(event)).await?)
    }

    /// Funds, confirms and opens a single-token vault holding `balance`.
    pub async fn open_vault(&self, balance: u64) -> Result<Vault> {
        self.open_vault_with(TOKEN, 1, balance).await
    }

    pub async fn open_vault_with(
        &self,
        token: &str,
        multiplier: u64,
        balance: u64,
    ) -> Result<Vault> {
        let vault = self
            .node
            .vaults
            .create_vault(
                CHAIN_ID,
                vec![VaultToken {
                    token: token.to_string(),
                    multiplier,
                }],
                50_000,
            )
            .await?;
        self.wallet.set_confirmations(&vault.funding_utxo.txid, 1);
        self.node.vaults.check_vaults().await?;
        self.node.vaults.check_vaults().await?;
        anyhow::ensure!(
            self.chain.count(&format!("open_vault:{}", vault.key)) == 1,
            "vault open was not submitted"
        );

        self.vault_event(VaultEvent::Opened {
            owner: OWNER.to_string(),
            vault_id: vault.key.vault_id,
            utxo: vault.funding_utxo,
            tx_id: "open".to_string(),
        })
        .await?;
        self.vault_event(VaultEvent::Deposit {
            owner: OWNER.to_string(),
            vault_id: vault.key.vault_id,
            deposit_count: 1,
            raw_amounts: vec![balance],
            tx_id: "deposit".to_string(),
        })
        .await?;

        let vault = self.vault(&vault.key)?;
        anyhow::ensure!(vault.status == VaultStatus::Opened, "vault not opened");
        Ok(vault)
    }

    pub fn vault(&self, key: &VaultKey) -> Result<Vault> {
        self.node
            .vaults
            .get(key)
            .with_context(|| format!("vault {key} not found"))
    }
}

/// A withdrawal transaction spending `spent` back into the vault script.
pub fn withdrawal_tx(
    vault: &Vault,
    spent: Utxo,
    raw_amount: u64,
    recipient: &str,
) -> Result<Transaction> {
    let request = WithdrawalRequest {
        recipient: recipient.to_string(),
        raw_amounts: vec![raw_amount],
        caller_fee_ppm: 0,
        fronting_fee_ppm: 0,
        execution_fee_ppm: 0,
    };
    let vault_script = vault
        .btc_address
        .parse::<Address<NetworkUnchecked>>()
        .context("parse vault address")?
        .assume_checked()
        .script_pubkey();
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: spent.into(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut {
                value: Amount::from_sat(50_000),
                script_pubkey: vault_script,
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: request.op_return_script()?,
            },
        ],
    })
}

pub fn next_utxo(txid: Txid) -> Utxo {
    Utxo { txid, vout: 0 }
}
