use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::{Address, Sequence, Transaction, Txid};
use serde::{Deserialize, Serialize};

use super::withdrawal::WithdrawalData;
use super::{Utxo, Vault, VaultCandidate, VaultKey, VaultRequest, VaultStatus, VaultToken};
use crate::btc::BitcoinWallet;
use crate::btc::payout::PayoutQueue;
use crate::chain::{ChainInterface, ChainSet, VaultEvent};
use crate::error::{SwapError, SwapResult};
use crate::lock::LockToken;
use crate::plugins::PluginChain;
use crate::store::SqliteStore;
use crate::swap::watchdog::Reconciler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FundingPolicy {
    /// Underpayment accepted without complaint.
    pub underpay_tolerance_ppm: u64,
    /// Overpayment above this is treated as hostile.
    pub overpay_cap_ppm: u64,
}

impl Default for FundingPolicy {
    fn default() -> Self {
        Self {
            underpay_tolerance_ppm: 1_000,
            overpay_cap_ppm: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingDecision {
    Accept,
    /// Not signed; the client keeps its coins and may retry.
    Refund(String),
    /// Not signed and the quote is retired for good. The client's inputs
    /// already commit to every output, so no burn output can be added; the
    /// funds never leave the client.
    Burn(String),
}

impl FundingPolicy {
    pub fn evaluate(
        &self,
        expected_sats: u64,
        paid_sats: u64,
        fee_rate: u64,
        min_fee_rate: u64,
    ) -> FundingDecision {
        if fee_rate < min_fee_rate {
            return FundingDecision::Burn(format!(
                "fee rate {fee_rate} sat/vB below quoted {min_fee_rate}"
            ));
        }
        let slack = |ppm: u64| {
            let slack =
                u128::from(expected_sats) * u128::from(ppm) / u128::from(crate::amounts::PPM);
            u64::try_from(slack).unwrap_or(u64::MAX)
        };
        if paid_sats.saturating_add(slack(self.underpay_tolerance_ppm)) < expected_sats {
            return FundingDecision::Refund(format!(
                "paid {paid_sats} sats, expected {expected_sats}"
            ));
        }
        if paid_sats > expected_sats.saturating_add(slack(self.overpay_cap_ppm)) {
            return FundingDecision::Burn(format!(
                "paid {paid_sats} sats, far above expected {expected_sats}"
            ));
        }
        FundingDecision::Accept
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultManagerConfig {
    pub required_confirmations: u32,
    pub funding_confirmations: u32,
    /// Self-claim once this many withdrawals are claimable.
    pub claim_threshold: usize,
    pub lock_secs: u64,
    pub open_retry_secs: u64,
    pub claim_retry_secs: u64,
    pub funding: FundingPolicy,
}

impl Default for VaultManagerConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 3,
            funding_confirmations: 1,
            claim_threshold: 10,
            lock_secs: 60,
            open_retry_secs: 600,
            claim_retry_secs: 600,
            funding: FundingPolicy::default(),
        }
    }
}

pub struct VaultManager {
    store: Arc<Mutex<SqliteStore>>,
    vaults: Mutex<HashMap<VaultKey, Vault>>,
    chains: ChainSet,
    wallet: Arc<dyn BitcoinWallet>,
    payouts: PayoutQueue,
    plugins: PluginChain,
    config: VaultManagerConfig,
}

impl VaultManager {
    pub fn load(
        store: Arc<Mutex<SqliteStore>>,
        chains: ChainSet,
        wallet: Arc<dyn BitcoinWallet>,
        payouts: PayoutQueue,
        plugins: PluginChain,
        config: VaultManagerConfig,
    ) -> Result<Self> {
        let loaded: Vec<Vault> = store
            .lock()
            .expect("store mutex poisoned")
            .list_vaults()
            .context("load vaults")?;
        let vaults: HashMap<_, _> = loaded.into_iter().map(|v| (v.key.clone(), v)).collect();
        tracing::info!(vaults = vaults.len(), "loaded vaults");

        Ok(Self {
            store,
            vaults: Mutex::new(vaults),
            chains,
            wallet,
            payouts,
            plugins,
            config,
        })
    }

    pub fn config(&self) -> &VaultManagerConfig {
        &self.config
    }

    pub fn chain(&self, chain_id: &str) -> SwapResult<Arc<dyn ChainInterface>> {
        self.chains.get(chain_id)
    }

    pub fn get(&self, key: &VaultKey) -> Option<Vault> {
        self.vaults.lock().expect("vaults mutex poisoned").get(key).cloned()
    }

    pub fn list(&self) -> Vec<Vault> {
        let mut out: Vec<_> = self
            .vaults
            .lock()
            .expect("vaults mutex poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn try_lock(&self, key: &VaultKey) -> Option<LockToken> {
        self.vaults
            .lock()
            .expect("vaults mutex poisoned")
            .get(key)?
            .lock
            .try_lock(Duration::from_secs(self.config.lock_secs))
    }

    /// Runs `mutate` on a copy and commits it only if it succeeds, so a
    /// failed mutation leaves the vault exactly as it was.
    pub fn update<T>(
        &self,
        key: &VaultKey,
        mutate: impl FnOnce(&mut Vault) -> SwapResult<T>,
    ) -> SwapResult<Option<T>> {
        let mut vaults = self.vaults.lock().expect("vaults mutex poisoned");
        let Some(current) = vaults.get(key) else {
            return Ok(None);
        };
        let mut next = current.clone();
        let out = mutate(&mut next)?;
        self.persist(&next)?;
        vaults.insert(key.clone(), next);
        Ok(Some(out))
    }

    fn persist(&self, vault: &Vault) -> Result<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .save_vault(&vault.key, vault.status.name(), vault)
    }

    pub async fn create_vault(
        &self,
        chain_id: &str,
        tokens: Vec<VaultToken>,
        funding_sats: u64,
    ) -> SwapResult<Vault> {
        if tokens.is_empty() {
            return Err(SwapError::invalid("vault needs at least one token"));
        }
        let chain = self.chain(chain_id)?;
        let owner = chain.address().to_string();

        let address = self.wallet.receive_address().await?;
        let fee_rate = self.wallet.fee_rate().await?;
        let txid = self
            .payouts
            .run({
                let wallet = self.wallet.clone();
                let address = address.clone();
                async move {
                    wallet
                        .send(&address, funding_sats, fee_rate, Sequence::ENABLE_RBF_NO_LOCKTIME)
                        .await
                }
            })
            .await??;
        let funding_utxo = self.find_output(&txid, &address).await?;

        let vault = {
            let mut vaults = self.vaults.lock().expect("vaults mutex poisoned");
            let vault_id = vaults
                .keys()
                .filter(|k| k.chain_id == chain_id && k.owner == owner)
                .map(|k| k.vault_id + 1)
                .max()
                .unwrap_or(0);
            let key = VaultKey {
                chain_id: chain_id.to_string(),
                owner,
                vault_id,
            };
            let vault = Vault::new(
                key.clone(),
                address.to_string(),
                tokens,
                self.config.required_confirmations,
                funding_utxo,
            );
            self.persist(&vault)?;
            vaults.insert(key, vault.clone());
            vault
        };
        tracing::info!(vault = %vault.key, utxo = %funding_utxo, "vault funding broadcast");
        Ok(vault)
    }

    async fn find_output(&self, txid: &Txid, address: &Address) -> Result<Utxo> {
        let tx = self
            .wallet
            .get_transaction(txid)
            .await?
            .with_context(|| format!("funding transaction {txid} not found"))?;
        let script = address.script_pubkey();
        let vout = tx
            .tx
            .output
            .iter()
            .position(|o| o.script_pubkey == script)
            .with_context(|| format!("funding transaction {txid} does not pay {address}"))?;
        Ok(Utxo {
            txid: *txid,
            vout: u32::try_from(vout).context("vout overflow")?,
        })
    }

    /// Applies a confirmed vault event. Closed vaults stay on disk so their
    /// ids are never reused.
    pub fn process_event(&self, chain_id: &str, event: &VaultEvent) -> SwapResult<bool> {
        let (owner, vault_id) = event.vault();
        let key = VaultKey {
            chain_id: chain_id.to_string(),
            owner: owner.to_string(),
            vault_id,
        };
        let Some(changed) = self.update(&key, |v| v.apply_event(event))? else {
            tracing::trace!(vault = %key, "ignoring event for unknown vault");
            return Ok(false);
        };
        if changed {
            tracing::info!(vault = %key, ?event, "vault event applied");
        }
        Ok(changed)
    }

    /// Admits a wallet-observed transaction that extends a vault's tip, such
    /// as a client fee bump. Returns the vault it was admitted to.
    pub async fn process_btc_transaction(&self, tx: &Transaction) -> SwapResult<Option<VaultKey>> {
        let Some(spent) = tx.input.first().map(|i| Utxo::from(i.previous_output)) else {
            return Ok(None);
        };
        let key = self
            .vaults
            .lock()
            .expect("vaults mutex poisoned")
            .values()
            .find(|v| v.status == VaultStatus::Opened && v.tip() == Some(spent))
            .map(|v| v.key.clone());
        let Some(key) = key else {
            return Ok(None);
        };

        let withdrawal = WithdrawalData::from_transaction(tx)
            .map_err(|e| SwapError::invalid(format!("not a vault withdrawal: {e:#}")))?;
        let Some(_lock) = self.try_lock(&key) else {
            return Err(SwapError::try_again(format!("vault {key} is busy")));
        };
        let btc_tx = withdrawal.btc_tx;
        self.update(&key, |v| v.add_withdrawal(withdrawal))?;
        tracing::info!(vault = %key, %btc_tx, "admitted observed withdrawal");
        Ok(Some(key))
    }

    /// Picks the smallest vault that can serve `request`; plugins may
    /// override the pick or veto.
    pub async fn select_vault(&self, request: &VaultRequest) -> SwapResult<Vault> {
        let mut candidates = Vec::new();
        for vault in self.list() {
            if vault.key.chain_id != request.chain_id
                || vault.key.owner != request.owner
                || vault.status != VaultStatus::Opened
                || !vault.is_ready()
            {
                continue;
            }
            let required = match request.required_raw(&vault) {
                Ok(Some(required)) => required,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(vault = %vault.key, error = %err, "vault cannot serve request");
                    continue;
                }
            };
            let balances = match vault.balances() {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(vault = %vault.key, error = %err, "vault projection failed");
                    continue;
                }
            };
            if required.iter().zip(&balances).all(|(r, b)| r <= b) {
                candidates.push((vault, balances));
            }
        }
        candidates.sort_by_key(|(_, b)| b.first().copied().unwrap_or_default());

        let views: Vec<VaultCandidate> = candidates
            .iter()
            .map(|(v, b)| VaultCandidate {
                key: v.key.clone(),
                balances: b.clone(),
            })
            .collect();
        if let Some(key) = self.plugins.select_vault(request, &views).await? {
            return candidates
                .into_iter()
                .find(|(v, _)| v.key == key)
                .map(|(v, _)| v)
                .ok_or_else(|| SwapError::invalid(format!("plugin selected unusable vault {key}")));
        }
        candidates
            .into_iter()
            .next()
            .map(|(v, _)| v)
            .ok_or(SwapError::NoVaultAvailable)
    }

    pub async fn check_vaults(&self) -> Result<()> {
        for vault in self.list() {
            if let Err(err) = self.check_vault(&vault).await {
                tracing::warn!(vault = %vault.key, error = %err, "vault check failed");
            }
        }
        Ok(())
    }

    async fn check_vault(&self, vault: &Vault) -> SwapResult<()> {
        match vault.status {
            VaultStatus::BtcInitiated => self.check_funding(vault).await,
            VaultStatus::BtcConfirmed => self.open_vault(vault).await,
            VaultStatus::Opened => {
                let Some(_lock) = self.try_lock(&vault.key) else {
                    return Ok(());
                };
                self.refresh_pending(&vault.key).await?;
                self.readmit_replaced(&vault.key).await?;
                self.claim_ready(&vault.key).await
            }
            VaultStatus::Closed => Ok(()),
        }
    }

    async fn check_funding(&self, vault: &Vault) -> SwapResult<()> {
        let confirmations = self
            .wallet
            .get_transaction(&vault.funding_utxo.txid)
            .await?
            .map(|t| t.confirmations);
        match confirmations {
            Some(c) if c >= self.config.funding_confirmations => {
                self.update(&vault.key, |v| {
                    if v.status == VaultStatus::BtcInitiated {
                        v.status = VaultStatus::BtcConfirmed;
                    }
                    Ok(())
                })?;
                tracing::info!(vault = %vault.key, "vault funding confirmed");
            }
            Some(_) => {}
            None => tracing::warn!(
                vault = %vault.key,
                txid = %vault.funding_utxo.txid,
                "vault funding transaction missing"
            ),
        }
        Ok(())
    }

    async fn open_vault(&self, vault: &Vault) -> SwapResult<()> {
        let now = crate::unix_now();
        let last = vault.metadata.get("open_submitted_at").and_then(|v| v.as_u64());
        if last.is_some_and(|t| now < t + self.config.open_retry_secs) {
            return Ok(());
        }
        let Some(lock) = self.try_lock(&vault.key) else {
            return Ok(());
        };
        let chain = self.chain(&vault.key.chain_id)?;
        lock.ensure_valid()?;
        let tx_id = chain.open_vault(vault).await?;
        tracing::info!(vault = %vault.key, %tx_id, "vault open submitted");
        self.update(&vault.key, |v| {
            v.metadata.insert("open_submitted_at".to_string(), now.into());
            Ok(())
        })?;
        Ok(())
    }

    /// Re-fetches every pending withdrawal. The first one that vanished is
    /// evicted together with everything chained after it.
    async fn refresh_pending(&self, key: &VaultKey) -> SwapResult<()> {
        let Some(vault) = self.get(key) else {
            return Ok(());
        };
        let mut confirmations = HashMap::new();
        let mut evicted = None;
        for pending in &vault.pending {
            match self.wallet.get_transaction(&pending.data.btc_tx).await? {
                Some(tx) => {
                    confirmations.insert(pending.data.btc_tx, tx.confirmations);
                }
                None => {
                    evicted = Some(pending.data.btc_tx);
                    break;
                }
            }
        }

        self.update(key, |v| {
            for p in &mut v.pending {
                if let Some(c) = confirmations.get(&p.data.btc_tx) {
                    p.confirmations = *c;
                }
            }
            if let Some(btc_tx) = &evicted {
                let count = v.evict_withdrawal(btc_tx);
                tracing::warn!(vault = %v.key, %btc_tx, count, "withdrawal evicted from mempool");
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Re-admits replaced withdrawals whose transactions are back, starting
    /// at the tip and following the chain as far as it reconstructs. Any
    /// failure rolls the whole attempt back.
    async fn readmit_replaced(&self, key: &VaultKey) -> SwapResult<()> {
        let Some(vault) = self.get(key) else {
            return Ok(());
        };
        let mut position = vault.next_position();
        let mut tip = vault.tip();
        let mut chain = Vec::new();

        'positions: while let Some(candidates) = vault.replaced.get(&position) {
            for candidate in candidates {
                if Some(candidate.spent_utxo) != tip {
                    continue;
                }
                if let Some(tx) = self.wallet.get_transaction(&candidate.btc_tx).await? {
                    chain.push((candidate.clone(), tx.confirmations));
                    tip = Some(candidate.created_utxo);
                    position += 1;
                    continue 'positions;
                }
            }
            break;
        }
        if chain.is_empty() {
            return Ok(());
        }

        let count = chain.len();
        let result = self.update(key, |v| {
            for (w, confirmations) in chain {
                let btc_tx = w.btc_tx;
                v.add_withdrawal(w)?;
                if let Some(p) = v.pending.iter_mut().find(|p| p.data.btc_tx == btc_tx) {
                    p.confirmations = confirmations;
                }
            }
            Ok(())
        });
        match result {
            Ok(_) => {
                tracing::info!(vault = %key, count, "re-admitted replaced withdrawals");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(vault = %key, count, error = %err, "re-admission rolled back");
                Err(err)
            }
        }
    }

    async fn claim_ready(&self, key: &VaultKey) -> SwapResult<()> {
        let Some(vault) = self.get(key) else {
            return Ok(());
        };
        let now = crate::unix_now();
        let last = vault.metadata.get("claim_submitted_at").and_then(|v| v.as_u64());
        if last.is_some_and(|t| now < t + self.config.claim_retry_secs) {
            return Ok(());
        }

        let claimable: Vec<WithdrawalData> = vault
            .pending
            .iter()
            .take_while(|p| p.confirmations >= vault.required_confirmations)
            .map(|p| p.data.clone())
            .collect();
        if claimable.is_empty() || claimable.len() < self.config.claim_threshold {
            return Ok(());
        }

        let chain = self.chain(&key.chain_id)?;
        let tx_id = chain.claim_withdrawals(&vault, &claimable).await?;
        let count = claimable.len();
        tracing::info!(vault = %key, %tx_id, count, "withdrawals claim submitted");
        self.update(key, |v| {
            v.metadata.insert("claim_submitted_at".to_string(), now.into());
            Ok(())
        })?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for VaultManager {
    fn name(&self) -> &'static str {
        "vaults"
    }

    async fn reconcile(&self) -> Result<()> {
        self.check_vaults().await
    }
}
