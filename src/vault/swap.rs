//! BTC → token swaps served from a vault.
//!
//! Phase one quotes against a selected vault and reserves nothing. In phase
//! two the client returns a transaction spending the vault tip; we recompute
//! the withdrawal from it, co-sign the vault input, admit and broadcast.

use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};

use super::manager::{FundingDecision, VaultManager};
use super::withdrawal::{WithdrawalData, WithdrawalRequest};
use super::{Utxo, VaultKey, VaultRequest, VaultStatus};
use crate::amounts::{
    AmountAssertions, AmountCheckContext, AmountQuote, AmountRequest, FeeConfig, SwapDirection,
};
use crate::btc::BitcoinWallet;
use crate::chain::VaultEvent;
use crate::error::{SwapError, SwapResult};
use crate::price::{Prefetch, PriceOracle, Rounding, TokenPrice};
use crate::swap::handler::SwapHandler;
use crate::swap::watchdog::Reconciler;
use crate::swap::{FamilyRecord, SwapFamily, SwapKey, SwapRecord, SwapState, TxRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultSwapState {
    Created,
    Signed,
    BtcConfirmed,
    Claimed,
    Failed,
    Expired,
}

impl SwapState for VaultSwapState {
    fn initial() -> Self {
        Self::Created
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Failed | Self::Expired)
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Claimed)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Signed => "signed",
            Self::BtcConfirmed => "btc_confirmed",
            Self::Claimed => "claimed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSwapData {
    pub vault: VaultKey,
    pub withdrawal: WithdrawalRequest,
    /// Where the client pays `amounts.amount_btc`.
    pub btc_address: String,
    pub min_fee_rate: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub btc_tx: Option<Txid>,
}

pub struct VaultSwapFamily;

impl SwapFamily for VaultSwapFamily {
    type State = VaultSwapState;
    type Data = VaultSwapData;
    const NAME: &'static str = "vault_swap";
}

pub type VaultSwapRecord = SwapRecord<VaultSwapState, VaultSwapData>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSwapConfig {
    pub fees: FeeConfig,
    pub quote_expiry_secs: u64,
    pub caller_fee_ppm: u32,
    pub fronting_fee_ppm: u32,
    pub execution_fee_ppm: u32,
    pub lock_secs: u64,
}

impl Default for VaultSwapConfig {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            quote_expiry_secs: 600,
            caller_fee_ppm: 0,
            fronting_fee_ppm: 0,
            execution_fee_ppm: 0,
            lock_secs: 60,
        }
    }
}

impl VaultSwapConfig {
    fn fee_ppm(&self) -> u32 {
        self.caller_fee_ppm
            .saturating_add(self.fronting_fee_ppm)
            .saturating_add(self.execution_fee_ppm)
    }
}

#[derive(Debug, Clone)]
pub struct VaultSwapRequest {
    pub chain_id: String,
    pub token: String,
    pub amount: u64,
    pub exact_in: bool,
    /// Client's address on the smart-contract chain.
    pub recipient: String,
    /// Gas token, paid on top in BTC.
    pub gas: Option<(String, u64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VaultSwapQuote {
    pub key: SwapKey,
    pub vault: VaultKey,
    pub vault_utxo: Utxo,
    pub vault_address: String,
    pub withdrawal: WithdrawalRequest,
    pub btc_address: String,
    pub amounts: AmountQuote,
    pub min_fee_rate: u64,
    pub expires_at: u64,
}

pub struct VaultSwapHandler {
    handler: SwapHandler<VaultSwapFamily>,
    vaults: Arc<VaultManager>,
    wallet: Arc<dyn BitcoinWallet>,
    prices: Arc<dyn PriceOracle>,
    assertions: AmountAssertions,
    config: VaultSwapConfig,
    btc_index: Mutex<HashMap<Txid, SwapKey>>,
}

impl VaultSwapHandler {
    pub fn new(
        handler: SwapHandler<VaultSwapFamily>,
        vaults: Arc<VaultManager>,
        wallet: Arc<dyn BitcoinWallet>,
        prices: Arc<dyn PriceOracle>,
        assertions: AmountAssertions,
        config: VaultSwapConfig,
    ) -> Self {
        let index = handler
            .pending()
            .into_iter()
            .filter_map(|r| r.data.btc_tx.map(|txid| (txid, r.key)))
            .collect();
        Self {
            handler,
            vaults,
            wallet,
            prices,
            assertions,
            config,
            btc_index: Mutex::new(index),
        }
    }

    pub fn handler(&self) -> &SwapHandler<VaultSwapFamily> {
        &self.handler
    }

    fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.config.lock_secs)
    }

    pub async fn quote(&self, request: VaultSwapRequest) -> SwapResult<VaultSwapQuote> {
        let owner = self.vaults.chain(&request.chain_id)?.address().to_string();

        let price: Prefetch<TokenPrice> =
            Prefetch::price(self.prices.clone(), request.chain_id.clone(), request.token.clone());
        let gas_price: Option<Prefetch<TokenPrice>> = request.gas.as_ref().map(|(token, _)| {
            Prefetch::price(self.prices.clone(), request.chain_id.clone(), token.clone())
        });
        let fee_rate = Prefetch::spawn({
            let wallet = self.wallet.clone();
            async move { wallet.fee_rate().await }
        });

        let check = AmountCheckContext {
            direction: SwapDirection::FromBtc,
            request: AmountRequest {
                chain_id: request.chain_id.clone(),
                token: request.token.clone(),
                amount: request.amount,
                exact_in: request.exact_in,
            },
        };
        let mut amounts = self
            .assertions
            .check_amount(&check, &self.config.fees, price, None)
            .await?;

        let mut tokens = vec![request.token.clone()];
        let mut token_amounts = vec![amounts.total_in_token];
        if let (Some((gas_token, gas_amount)), Some(gas_price)) = (&request.gas, gas_price) {
            let gas_sats = gas_price.resolve().await?.token_to_sats(*gas_amount, Rounding::Up)?;
            amounts.amount_btc = amounts
                .amount_btc
                .checked_add(gas_sats)
                .ok_or_else(|| SwapError::invalid("amount overflow"))?;
            tokens.push(gas_token.clone());
            token_amounts.push(*gas_amount);
        }

        let vault = self
            .vaults
            .select_vault(&VaultRequest {
                chain_id: request.chain_id.clone(),
                owner,
                tokens,
                amounts: token_amounts.clone(),
                fee_ppm: self.config.fee_ppm(),
            })
            .await?;
        let vault_utxo = vault
            .latest_utxo()
            .ok_or_else(|| SwapError::try_again(format!("vault {} is not ready", vault.key)))?;

        let raw_amounts = token_amounts
            .iter()
            .zip(&vault.tokens)
            .map(|(amount, token)| token.to_raw(*amount))
            .collect::<SwapResult<Vec<_>>>()?;
        let withdrawal = WithdrawalRequest {
            recipient: request.recipient,
            raw_amounts,
            caller_fee_ppm: self.config.caller_fee_ppm,
            fronting_fee_ppm: self.config.fronting_fee_ppm,
            execution_fee_ppm: self.config.execution_fee_ppm,
        };
        withdrawal.op_return_script()?;

        let btc_address = self.wallet.receive_address().await?.to_string();
        let min_fee_rate = fee_rate.resolve().await?;
        let expires_at = crate::unix_now() + self.config.quote_expiry_secs;

        let key = SwapKey::new(uuid::Uuid::new_v4().to_string(), 0);
        let record = VaultSwapRecord::new(
            key.clone(),
            request.chain_id,
            request.token,
            amounts,
            VaultSwapData {
                vault: vault.key.clone(),
                withdrawal: withdrawal.clone(),
                btc_address: btc_address.clone(),
                min_fee_rate,
                expires_at,
                btc_tx: None,
            },
        );
        self.handler.insert(record).await?;

        Ok(VaultSwapQuote {
            key,
            vault: vault.key,
            vault_utxo,
            vault_address: vault.btc_address,
            withdrawal,
            btc_address,
            amounts,
            min_fee_rate,
            expires_at,
        })
    }

    fn open_quote(&self, key: &SwapKey) -> SwapResult<VaultSwapRecord> {
        let record = self.handler.get(key).ok_or(SwapError::NotFound)?;
        if record.state != VaultSwapState::Created {
            return Err(SwapError::InvalidState {
                reason: format!("quote {key} is {}", record.state.name()),
            });
        }
        if crate::unix_now() >= record.data.expires_at {
            return Err(SwapError::QuoteExpired);
        }
        Ok(record)
    }

    /// Unsigned skeleton the client completes with its own inputs and change:
    /// vault input, next vault output, OP_RETURN and our payment output.
    pub async fn build_psbt_template(&self, key: &SwapKey) -> SwapResult<Psbt> {
        let record = self.open_quote(key)?;
        let vault = self.vaults.get(&record.data.vault).ok_or(SwapError::NoVaultAvailable)?;
        let utxo = vault
            .latest_utxo()
            .ok_or_else(|| SwapError::try_again(format!("vault {} is not ready", vault.key)))?;

        let prev_out = self.vault_output(utxo).await?;

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: utxo.into(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![
                TxOut {
                    value: prev_out.value,
                    script_pubkey: parse_address(&vault.btc_address)?.script_pubkey(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: record.data.withdrawal.op_return_script()?,
                },
                TxOut {
                    value: Amount::from_sat(record.amounts.amount_btc),
                    script_pubkey: parse_address(&record.data.btc_address)?.script_pubkey(),
                },
            ],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).context("build psbt template")?;
        psbt.inputs[0].witness_utxo = Some(prev_out);
        Ok(psbt)
    }

    /// Co-signs and broadcasts the client's transaction. Nothing is trusted
    /// beyond what the transaction itself says.
    pub async fn settle(&self, key: &SwapKey, psbt: Psbt) -> SwapResult<Txid> {
        let record = match self.open_quote(key) {
            Err(SwapError::QuoteExpired) => {
                self.handler
                    .transition(key, &[VaultSwapState::Created], VaultSwapState::Expired, |_| {})
                    .await?;
                return Err(SwapError::QuoteExpired);
            }
            other => other?,
        };
        let Some(swap_lock) = self.handler.try_lock(key, self.lock_duration()) else {
            return Err(SwapError::try_again(format!("quote {key} is being settled")));
        };
        let vault_key = record.data.vault.clone();
        let Some(vault_lock) = self.vaults.try_lock(&vault_key) else {
            return Err(SwapError::try_again(format!("vault {vault_key} is busy")));
        };

        let withdrawal = WithdrawalData::from_transaction(&psbt.unsigned_tx)
            .map_err(|e| SwapError::invalid(format!("not a vault withdrawal: {e:#}")))?;
        if withdrawal.request != record.data.withdrawal {
            return Err(SwapError::invalid("withdrawal data differs from the quote"));
        }

        let vault = self.vaults.get(&vault_key).ok_or(SwapError::NoVaultAvailable)?;
        if vault.status != VaultStatus::Opened
            || vault.latest_utxo() != Some(withdrawal.spent_utxo)
        {
            return Err(SwapError::try_again(format!("vault {vault_key} tip moved")));
        }
        let vault_script = parse_address(&vault.btc_address)?.script_pubkey();
        if psbt.unsigned_tx.output[0].script_pubkey != vault_script {
            return Err(SwapError::invalid("output 0 does not pay the vault"));
        }
        let vault_value = self.vault_output(withdrawal.spent_utxo).await?.value;
        if psbt.unsigned_tx.output[0].value < vault_value {
            return Err(SwapError::invalid(format!(
                "output 0 carries {} of the vault's {vault_value}",
                psbt.unsigned_tx.output[0].value
            )));
        }

        let our_script = parse_address(&record.data.btc_address)?.script_pubkey();
        let paid: u64 = psbt
            .unsigned_tx
            .output
            .iter()
            .skip(2)
            .filter(|o| o.script_pubkey == our_script)
            .map(|o| o.value.to_sat())
            .sum();

        let signed = self.wallet.sign_psbt(psbt, &[0]).await?;
        let fee = signed.fee().context("compute transaction fee")?;
        let tx = signed.extract_tx_unchecked_fee_rate();
        let vsize = u64::try_from(tx.vsize()).context("vsize overflow")?;
        let fee_rate = fee.to_sat() / vsize.max(1);

        let policy = &self.vaults.config().funding;
        match policy.evaluate(record.amounts.amount_btc, paid, fee_rate, record.data.min_fee_rate) {
            FundingDecision::Accept => {}
            FundingDecision::Refund(reason) => {
                tracing::info!(swap = %key, %reason, "settlement refused");
                return Err(SwapError::FundingMismatch { reason });
            }
            FundingDecision::Burn(reason) => {
                tracing::warn!(swap = %key, %reason, "settlement burned");
                self.handler
                    .transition(key, &[VaultSwapState::Created], VaultSwapState::Failed, |r| {
                        r.note("failure", reason.clone());
                    })
                    .await?;
                return Err(SwapError::FundingMismatch { reason });
            }
        }

        swap_lock.ensure_valid()?;
        vault_lock.ensure_valid()?;
        let btc_tx = withdrawal.btc_tx;
        self.vaults.update(&vault_key, |v| v.add_withdrawal(withdrawal))?;

        if let Err(err) = self.wallet.broadcast(&tx).await {
            self.vaults.update(&vault_key, |v| {
                v.remove_withdrawal(&btc_tx);
                Ok(())
            })?;
            tracing::warn!(
                swap = %key,
                %btc_tx,
                error = %format!("{err:#}"),
                "broadcast failed, withdrawal rolled back"
            );
            return Err(err.into());
        }

        self.btc_index
            .lock()
            .expect("btc index mutex poisoned")
            .insert(btc_tx, key.clone());
        self.handler
            .transition(key, &[VaultSwapState::Created], VaultSwapState::Signed, |r| {
                r.data.btc_tx = Some(btc_tx);
                r.set_tx_id(TxRole::Btc, btc_tx.to_string());
            })
            .await?;
        tracing::info!(swap = %key, vault = %vault_key, %btc_tx, "vault swap broadcast");
        Ok(btc_tx)
    }

    async fn vault_output(&self, utxo: Utxo) -> SwapResult<TxOut> {
        let prev = self
            .wallet
            .get_transaction(&utxo.txid)
            .await?
            .ok_or_else(|| SwapError::try_again(format!("vault utxo {utxo} not found")))?;
        prev.tx
            .output
            .get(utxo.vout as usize)
            .cloned()
            .ok_or_else(|| SwapError::InvalidState {
                reason: format!("vault utxo {utxo} does not exist"),
            })
    }

    fn find_by_btc_tx(&self, btc_tx: &Txid) -> Option<VaultSwapRecord> {
        let key = self
            .btc_index
            .lock()
            .expect("btc index mutex poisoned")
            .get(btc_tx)
            .cloned()?;
        self.handler.get(&key)
    }

    async fn finish(
        &self,
        record: &VaultSwapRecord,
        to: VaultSwapState,
        mutate: impl FnOnce(&mut VaultSwapRecord),
    ) -> SwapResult<()> {
        let from = [VaultSwapState::Signed, VaultSwapState::BtcConfirmed];
        if self
            .handler
            .transition(&record.key, &from, to, mutate)
            .await?
            .is_some()
            && let Some(btc_tx) = record.data.btc_tx
        {
            self.btc_index.lock().expect("btc index mutex poisoned").remove(&btc_tx);
        }
        Ok(())
    }

    pub async fn process_event(&self, event: &VaultEvent) -> SwapResult<bool> {
        let VaultEvent::Claimed { btc_tx, tx_id, .. } = event else {
            return Ok(false);
        };
        let Some(record) = self.find_by_btc_tx(btc_tx) else {
            return Ok(false);
        };
        self.finish(&record, VaultSwapState::Claimed, |r| {
            r.set_tx_id(TxRole::Claim, tx_id.clone())
        })
        .await?;
        Ok(true)
    }

    pub async fn process_past_swaps(&self) -> Result<()> {
        for record in self.handler.pending() {
            let key = record.key.clone();
            if let Err(err) = self.check_past_swap(record).await {
                tracing::warn!(
                    family = VaultSwapFamily::NAME,
                    swap = %key,
                    error = %err,
                    "watchdog check failed"
                );
            }
        }
        Ok(())
    }

    async fn check_past_swap(&self, record: FamilyRecord<VaultSwapFamily>) -> SwapResult<()> {
        match record.state {
            VaultSwapState::Created if crate::unix_now() >= record.data.expires_at => {
                self.handler
                    .transition(
                        &record.key,
                        &[VaultSwapState::Created],
                        VaultSwapState::Expired,
                        |_| {},
                    )
                    .await?;
            }
            VaultSwapState::Signed => {
                let Some(btc_tx) = record.data.btc_tx else {
                    return Ok(());
                };
                match self.wallet.get_transaction(&btc_tx).await? {
                    Some(tx) if tx.confirmations >= 1 => {
                        self.handler
                            .transition(
                                &record.key,
                                &[VaultSwapState::Signed],
                                VaultSwapState::BtcConfirmed,
                                |_| {},
                            )
                            .await?;
                    }
                    Some(_) => {}
                    None if !self.vault_knows(&record.data.vault, &btc_tx) => {
                        tracing::warn!(
                            swap = %record.key,
                            %btc_tx,
                            "withdrawal dropped from the vault chain"
                        );
                        self.finish(&record, VaultSwapState::Failed, |r| {
                            r.note("failure", "withdrawal replaced")
                        })
                        .await?;
                    }
                    None => {}
                }
            }
            VaultSwapState::BtcConfirmed => {
                let Some(btc_tx) = record.data.btc_tx else {
                    return Ok(());
                };
                let confirmed = self
                    .wallet
                    .get_transaction(&btc_tx)
                    .await?
                    .is_some_and(|tx| tx.confirmations >= 1);
                match (confirmed, self.vault_knows(&record.data.vault, &btc_tx)) {
                    // Drained by a later claim in the same batch.
                    (true, false) => {
                        tracing::info!(
                            swap = %record.key,
                            %btc_tx,
                            "withdrawal claimed without its own event"
                        );
                        self.finish(&record, VaultSwapState::Claimed, |r| {
                            r.note("claim", "claimed in batch");
                        })
                        .await?;
                    }
                    (true, true) => {}
                    (false, true) => {
                        tracing::warn!(swap = %record.key, %btc_tx, "withdrawal unconfirmed again");
                        self.handler
                            .transition(
                                &record.key,
                                &[VaultSwapState::BtcConfirmed],
                                VaultSwapState::Signed,
                                |_| {},
                            )
                            .await?;
                    }
                    (false, false) => {
                        tracing::warn!(
                            swap = %record.key,
                            %btc_tx,
                            "confirmed withdrawal dropped from the vault chain"
                        );
                        self.finish(&record, VaultSwapState::Failed, |r| {
                            r.note("failure", "withdrawal replaced")
                        })
                        .await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn vault_knows(&self, vault: &VaultKey, btc_tx: &Txid) -> bool {
        self.vaults.get(vault).is_some_and(|v| {
            v.position_of(btc_tx).is_some()
                || v.replaced.values().flatten().any(|w| &w.btc_tx == btc_tx)
        })
    }
}

#[async_trait]
impl Reconciler for VaultSwapHandler {
    fn name(&self) -> &'static str {
        VaultSwapFamily::NAME
    }

    async fn reconcile(&self) -> Result<()> {
        self.process_past_swaps().await
    }
}

fn parse_address(address: &str) -> SwapResult<Address> {
    Ok(Address::from_str(address)
        .with_context(|| format!("parse address {address}"))?
        .assume_checked())
}
