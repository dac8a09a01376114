//! Wires stores, collaborators, handlers and watchdogs into one process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bitcoin::Transaction;
use tokio::task::JoinHandle;

use crate::amounts::AmountAssertions;
use crate::btc::BitcoinWallet;
use crate::btc::payout::PayoutQueue;
use crate::chain::{ChainEvent, ChainInterface, ChainSet};
use crate::config::IntermediaryConfig;
use crate::error::SwapResult;
use crate::lightning::LightningWallet;
use crate::plugins::{PluginChain, SwapPlugin};
use crate::price::PriceOracle;
use crate::store::SqliteStore;
use crate::swap::escrow::{EscrowHandlerConfig, EscrowSwapHandler};
use crate::swap::from_btc_ln::{FromBtcLnFamily, FromBtcLnHandler};
use crate::swap::handler::SwapHandler;
use crate::swap::to_btc::{ToBtcFamily, ToBtcHandler};
use crate::swap::watchdog::{Reconciler, spawn_watchdog};
use crate::vault::VaultKey;
use crate::vault::manager::VaultManager;
use crate::vault::swap::VaultSwapHandler;

pub struct Collaborators {
    pub chains: Vec<Arc<dyn ChainInterface>>,
    pub wallet: Arc<dyn BitcoinWallet>,
    pub lightning: Arc<dyn LightningWallet>,
    pub prices: Arc<dyn PriceOracle>,
    pub plugins: Vec<Arc<dyn SwapPlugin>>,
}

pub struct Intermediary {
    pub to_btc: Arc<ToBtcHandler>,
    pub from_btc_ln: Arc<FromBtcLnHandler>,
    pub vaults: Arc<VaultManager>,
    pub vault_swaps: Arc<VaultSwapHandler>,
    watchdogs: Vec<JoinHandle<()>>,
}

impl Intermediary {
    /// Loads every handler from `store` and builds its indexes. Must run
    /// inside a Tokio runtime.
    pub fn build(
        config: &IntermediaryConfig,
        store: SqliteStore,
        deps: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(Mutex::new(store));
        let chains = ChainSet::new(deps.chains);
        let plugins = PluginChain::new(deps.plugins);
        let assertions = AmountAssertions::new(plugins.clone());
        // The worker is detached; it stops once every queue handle is dropped.
        let (payouts, _worker) = PayoutQueue::spawn();
        let escrow_config = EscrowHandlerConfig {
            lock_duration: Duration::from_secs(config.swap_lock_secs),
        };

        let to_btc = EscrowSwapHandler::new(
            ToBtcFamily::new(
                config.to_btc.clone(),
                deps.wallet.clone(),
                deps.prices.clone(),
                payouts.clone(),
                assertions.clone(),
            ),
            SwapHandler::load(store.clone(), plugins.clone())?,
            chains.clone(),
            escrow_config.clone(),
        );
        let from_btc_ln = EscrowSwapHandler::new(
            FromBtcLnFamily::new(
                config.from_btc_ln.clone(),
                deps.lightning.clone(),
                deps.prices.clone(),
                assertions.clone(),
            ),
            SwapHandler::load(store.clone(), plugins.clone())?,
            chains.clone(),
            escrow_config,
        );
        let vaults = Arc::new(VaultManager::load(
            store.clone(),
            chains,
            deps.wallet.clone(),
            payouts,
            plugins.clone(),
            config.vaults.clone(),
        )?);
        let vault_swaps = VaultSwapHandler::new(
            SwapHandler::load(store, plugins)?,
            vaults.clone(),
            deps.wallet,
            deps.prices,
            assertions,
            config.vault_swap.clone(),
        );

        Ok(Self {
            to_btc: Arc::new(to_btc),
            from_btc_ln: Arc::new(from_btc_ln),
            vaults,
            vault_swaps: Arc::new(vault_swaps),
            watchdogs: Vec::new(),
        })
    }

    pub fn start_watchdogs(&mut self, config: &IntermediaryConfig) {
        let swaps = Duration::from_secs(config.swap_watchdog_secs);
        let reconcilers: [(Arc<dyn Reconciler>, Duration); 4] = [
            (self.to_btc.clone(), swaps),
            (self.from_btc_ln.clone(), swaps),
            (self.vault_swaps.clone(), swaps),
            (self.vaults.clone(), Duration::from_secs(config.vault_watchdog_secs)),
        ];
        for (reconciler, interval) in reconcilers {
            tracing::info!(
                watchdog = reconciler.name(),
                interval_secs = interval.as_secs(),
                "starting watchdog"
            );
            self.watchdogs.push(spawn_watchdog(reconciler, interval));
        }
    }

    /// Routes a chain event to whichever handler owns it. Vault events
    /// update the vault before the swap that spent it.
    pub async fn process_event(&self, chain_id: &str, event: &ChainEvent) -> SwapResult<bool> {
        match event {
            ChainEvent::Escrow(e) => {
                if self.to_btc.process_event(chain_id, e).await? {
                    return Ok(true);
                }
                self.from_btc_ln.process_event(chain_id, e).await
            }
            ChainEvent::Vault(e) => {
                let vault_changed = self.vaults.process_event(chain_id, e)?;
                let swap_changed = self.vault_swaps.process_event(e).await?;
                Ok(vault_changed || swap_changed)
            }
        }
    }

    pub async fn process_btc_transaction(&self, tx: &Transaction) -> SwapResult<Option<VaultKey>> {
        self.vaults.process_btc_transaction(tx).await
    }

    /// Stops the watchdogs. Queued payouts still run to completion.
    pub fn shutdown(self) {
        for task in self.watchdogs {
            task.abort();
        }
    }
}
