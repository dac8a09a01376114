//! Token → on-chain BTC swaps.
//!
//! The client locks tokens in an escrow claimable by us with proof of a
//! Bitcoin payout. We pay once the escrow is committed and claim once the
//! payout has enough confirmations.

use std::str::FromStr as _;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::{Address, Network, Sequence, Txid};
use serde::{Deserialize, Serialize};

use super::escrow::{EscrowFamily, EscrowState, EscrowSwapHandler, ExpiryPolicy};
use super::{FamilyRecord, SwapFamily, SwapKey, SwapRecord, SwapState, TxRole};
use crate::amounts::{
    AmountAssertions, AmountCheckContext, AmountQuote, AmountRequest, FeeConfig,
    NetworkFeeEstimator, SwapDirection,
};
use crate::btc::BitcoinWallet;
use crate::btc::payout::PayoutQueue;
use crate::chain::{EscrowData, InitAuthorization, escrow_hash};
use crate::error::{SwapError, SwapResult};
use crate::price::{Prefetch, PriceOracle, TokenPrice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToBtcState {
    Created,
    Committed,
    BtcSending,
    BtcSent,
    /// We will not pay; the client refunds after expiry.
    NonPayable,
    Claimed,
    Refunded,
    Canceled,
}

impl SwapState for ToBtcState {
    fn initial() -> Self {
        Self::Created
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Refunded | Self::Canceled)
    }

    fn is_settled(&self) -> bool {
        matches!(self, Self::Claimed)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Committed => "committed",
            Self::BtcSending => "btc_sending",
            Self::BtcSent => "btc_sent",
            Self::NonPayable => "non_payable",
            Self::Claimed => "claimed",
            Self::Refunded => "refunded",
            Self::Canceled => "canceled",
        }
    }
}

impl EscrowState for ToBtcState {
    fn is_uncommitted(&self) -> bool {
        matches!(self, Self::Created)
    }

    fn canceled() -> Self {
        Self::Canceled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToBtcData {
    pub escrow: EscrowData,
    pub authorization: InitAuthorization,
    pub payout_address: String,
    pub payout_sats: u64,
    pub fee_rate: u64,
    pub required_confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToBtcConfig {
    pub fees: FeeConfig,
    pub network: Network,
    pub authorization_timeout_secs: u64,
    pub escrow_timeout_secs: u64,
    /// Do not start a payout when less than this remains until escrow expiry.
    pub min_time_to_pay_secs: u64,
    pub required_confirmations: u32,
    pub claim_retry_secs: u64,
}

impl Default for ToBtcConfig {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            network: Network::Bitcoin,
            authorization_timeout_secs: 180,
            escrow_timeout_secs: 3 * 24 * 3600,
            min_time_to_pay_secs: 6 * 3600,
            required_confirmations: 2,
            claim_retry_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToBtcRequest {
    pub chain_id: String,
    pub token: String,
    pub amount: u64,
    pub exact_in: bool,
    pub payout_address: String,
    /// Client's address on the smart-contract chain.
    pub offerer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToBtcQuote {
    pub key: SwapKey,
    pub escrow: EscrowData,
    pub authorization: InitAuthorization,
    pub amounts: AmountQuote,
    pub fee_rate: u64,
}

pub type ToBtcRecord = SwapRecord<ToBtcState, ToBtcData>;
pub type ToBtcHandler = EscrowSwapHandler<ToBtcFamily>;

struct PayoutFeeEstimator {
    wallet: Arc<dyn BitcoinWallet>,
    address: Address,
}

#[async_trait]
impl NetworkFeeEstimator for PayoutFeeEstimator {
    async fn network_fee(&self, payout_sats: u64) -> anyhow::Result<u64> {
        self.wallet.estimate_payout_fee(&self.address, payout_sats).await
    }
}

/// BIP68 disable flag: the remaining bits carry no relative locktime.
const RELATIVE_LOCKTIME_DISABLED: u32 = 1 << 31;

/// nSequence tagging the payout inputs of `key`. It stays below the RBF
/// threshold.
pub fn payout_sequence(key: &SwapKey) -> Sequence {
    let hash = sha256::Hash::hash(key.to_string().as_bytes()).to_byte_array();
    let tag = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]) & 0x3fff_ffff;
    Sequence(RELATIVE_LOCKTIME_DISABLED | tag)
}

pub struct ToBtcFamily {
    config: ToBtcConfig,
    wallet: Arc<dyn BitcoinWallet>,
    prices: Arc<dyn PriceOracle>,
    payouts: PayoutQueue,
    assertions: AmountAssertions,
}

impl SwapFamily for ToBtcFamily {
    type State = ToBtcState;
    type Data = ToBtcData;
    const NAME: &'static str = "to_btc";
}

impl ToBtcFamily {
    pub fn new(
        config: ToBtcConfig,
        wallet: Arc<dyn BitcoinWallet>,
        prices: Arc<dyn PriceOracle>,
        payouts: PayoutQueue,
        assertions: AmountAssertions,
    ) -> Self {
        Self {
            config,
            wallet,
            prices,
            payouts,
            assertions,
        }
    }

    fn parse_address(&self, address: &str) -> SwapResult<Address> {
        Address::from_str(address)
            .map_err(|e| SwapError::invalid(format!("invalid payout address: {e}")))?
            .require_network(self.config.network)
            .map_err(|e| SwapError::invalid(format!("payout address network mismatch: {e}")))
    }

    pub async fn create_quote(
        &self,
        ctx: &ToBtcHandler,
        request: ToBtcRequest,
    ) -> SwapResult<ToBtcQuote> {
        let address = self.parse_address(&request.payout_address)?;
        let chain = ctx.chain(&request.chain_id)?;

        let price: Prefetch<TokenPrice> =
            Prefetch::price(self.prices.clone(), request.chain_id.clone(), request.token.clone());
        let fee_rate = Prefetch::spawn({
            let wallet = self.wallet.clone();
            async move { wallet.fee_rate().await }
        });

        let check = AmountCheckContext {
            direction: SwapDirection::ToBtc,
            request: AmountRequest {
                chain_id: request.chain_id.clone(),
                token: request.token.clone(),
                amount: request.amount,
                exact_in: request.exact_in,
            },
        };
        let estimator = PayoutFeeEstimator {
            wallet: self.wallet.clone(),
            address: address.clone(),
        };
        let amounts = self
            .assertions
            .check_amount(&check, &self.config.fees, price, Some(&estimator))
            .await?;
        let fee_rate = fee_rate.resolve().await?;

        let claim_hash = payout_claim_hash(&address, amounts.amount_btc);
        let sequence = ctx.handler().next_sequence(&claim_hash);
        let now = crate::unix_now();
        let escrow = EscrowData {
            escrow_hash: escrow_hash(&claim_hash, sequence, &request.offerer),
            claim_hash: claim_hash.clone(),
            offerer: request.offerer,
            claimer: chain.address().to_string(),
            token: request.token.clone(),
            amount: amounts.total_in_token,
            expiry: now + self.config.escrow_timeout_secs,
            sequence,
        };
        let authorization = chain
            .sign_init_authorization(&escrow, self.config.authorization_timeout_secs)
            .await?;

        let key = SwapKey::new(claim_hash, sequence);
        let mut record = ToBtcRecord::new(
            key.clone(),
            request.chain_id.clone(),
            request.token,
            amounts,
            ToBtcData {
                escrow: escrow.clone(),
                authorization: authorization.clone(),
                payout_address: address.to_string(),
                payout_sats: amounts.amount_btc,
                fee_rate,
                required_confirmations: self.config.required_confirmations,
            },
        );
        record.note("quoted_at", now);

        ctx.handler().insert(record).await?;
        ctx.index_escrow(&request.chain_id, &escrow.escrow_hash, &key);

        Ok(ToBtcQuote {
            key,
            escrow,
            authorization,
            amounts,
            fee_rate,
        })
    }

    /// Pays out a committed swap. Safe to call repeatedly: the payout is
    /// skipped when the wallet already holds a transaction tagged for it.
    async fn send_payout(&self, ctx: &ToBtcHandler, key: &SwapKey) -> SwapResult<()> {
        let Some(lock) = ctx.handler().try_lock(key, ctx.lock_duration()) else {
            tracing::debug!(swap = %key, "payout already in progress");
            return Ok(());
        };
        let Some(record) = ctx.handler().get(key) else {
            return Ok(());
        };
        if record.state != ToBtcState::Committed {
            return Ok(());
        }

        if crate::unix_now() + self.config.min_time_to_pay_secs > record.data.escrow.expiry {
            tracing::warn!(swap = %key, "too close to escrow expiry, not paying");
            ctx.transition(key, &[ToBtcState::Committed], ToBtcState::NonPayable, |r| {
                r.note("non_payable_reason", "escrow expiry too close");
            })
            .await?;
            return Ok(());
        }

        let address = self.parse_address(&record.data.payout_address)?;
        lock.ensure_valid()?;

        let wallet = self.wallet.clone();
        let amount = record.data.payout_sats;
        let fee_rate = record.data.fee_rate;
        let sequence = payout_sequence(key);
        let (txid, reused) = self
            .payouts
            .run(async move {
                if let Some(txid) = wallet.find_payment(&address, amount, sequence).await? {
                    return Ok::<_, anyhow::Error>((txid, true));
                }
                let txid = wallet.send(&address, amount, fee_rate, sequence).await?;
                Ok((txid, false))
            })
            .await??;

        tracing::info!(swap = %key, %txid, reused, "bitcoin payout broadcast");
        ctx.transition(key, &[ToBtcState::Committed], ToBtcState::BtcSending, |r| {
            r.set_tx_id(TxRole::Btc, txid.to_string());
        })
        .await?;
        Ok(())
    }

    async fn check_payout(&self, ctx: &ToBtcHandler, record: ToBtcRecord) -> SwapResult<()> {
        let txid = btc_txid(&record)?;
        match self.wallet.get_transaction(&txid).await? {
            Some(tx) if tx.confirmations >= record.data.required_confirmations => {
                if let Some(record) = ctx
                    .transition(&record.key, &[ToBtcState::BtcSending], ToBtcState::BtcSent, |_| {})
                    .await?
                {
                    self.submit_claim(ctx, record).await?;
                }
            }
            Some(tx) => {
                tracing::debug!(
                    swap = %record.key,
                    %txid,
                    confirmations = tx.confirmations,
                    "payout confirming"
                );
            }
            None => {
                tracing::warn!(swap = %record.key, %txid, "payout transaction not found in wallet");
            }
        }
        Ok(())
    }

    async fn submit_claim(&self, ctx: &ToBtcHandler, record: ToBtcRecord) -> SwapResult<()> {
        let now = crate::unix_now();
        let last = record
            .metadata
            .get("claim_submitted_at")
            .and_then(|v| v.as_u64());
        if last.is_some_and(|t| now < t + self.config.claim_retry_secs) {
            return Ok(());
        }

        let Some(lock) = ctx.handler().try_lock(&record.key, ctx.lock_duration()) else {
            return Ok(());
        };
        let txid = btc_txid(&record)?;
        let chain = ctx.chain(&record.chain_id)?;
        lock.ensure_valid()?;
        let claim_tx = chain.claim_with_btc_tx(&record.data.escrow, &txid).await?;

        tracing::info!(swap = %record.key, %claim_tx, "escrow claim submitted");
        ctx.handler().update(&record.key, |r| {
            r.note("claim_submitted_at", now);
            r.note("claim_submitted_tx", claim_tx.clone());
        })?;
        Ok(())
    }
}

#[async_trait]
impl EscrowFamily for ToBtcFamily {
    fn escrow(record: &FamilyRecord<Self>) -> Option<&EscrowData> {
        Some(&record.data.escrow)
    }

    fn authorization_expiry(record: &FamilyRecord<Self>) -> u64 {
        record.data.authorization.expiry
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::AwaitCounterparty
    }

    async fn on_initialize(
        &self,
        ctx: &ToBtcHandler,
        record: ToBtcRecord,
        _tx_id: Option<&str>,
    ) -> SwapResult<()> {
        ctx.transition(&record.key, &[ToBtcState::Created], ToBtcState::Committed, |_| {})
            .await?;
        self.send_payout(ctx, &record.key).await
    }

    async fn on_claim(
        &self,
        ctx: &ToBtcHandler,
        record: ToBtcRecord,
        tx_id: Option<&str>,
        _secret: Option<&str>,
    ) -> SwapResult<()> {
        ctx.transition(
            &record.key,
            &[
                ToBtcState::Committed,
                ToBtcState::BtcSending,
                ToBtcState::BtcSent,
                ToBtcState::NonPayable,
            ],
            ToBtcState::Claimed,
            |r| {
                if let Some(tx_id) = tx_id {
                    r.set_tx_id(TxRole::Claim, tx_id);
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn on_refund(
        &self,
        ctx: &ToBtcHandler,
        record: ToBtcRecord,
        tx_id: Option<&str>,
    ) -> SwapResult<()> {
        if matches!(record.state, ToBtcState::BtcSending | ToBtcState::BtcSent) {
            tracing::error!(swap = %record.key, "escrow refunded after bitcoin payout was sent");
        }
        ctx.transition(
            &record.key,
            &[
                ToBtcState::Created,
                ToBtcState::Committed,
                ToBtcState::BtcSending,
                ToBtcState::BtcSent,
                ToBtcState::NonPayable,
            ],
            ToBtcState::Refunded,
            |r| {
                if let Some(tx_id) = tx_id {
                    r.set_tx_id(TxRole::Refund, tx_id);
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn reconcile(&self, ctx: &ToBtcHandler, record: ToBtcRecord) -> SwapResult<()> {
        match record.state {
            ToBtcState::Committed => self.send_payout(ctx, &record.key).await,
            ToBtcState::BtcSending => self.check_payout(ctx, record).await,
            ToBtcState::BtcSent => self.submit_claim(ctx, record).await,
            _ => Ok(()),
        }
    }
}

fn btc_txid(record: &ToBtcRecord) -> SwapResult<Txid> {
    let txid = record
        .tx_id(TxRole::Btc)
        .ok_or_else(|| SwapError::InvalidState {
            reason: format!("swap {} has no payout txid", record.key),
        })?;
    Txid::from_str(txid).map_err(|e| SwapError::External(anyhow::anyhow!("parse payout txid: {e}")))
}

pub fn payout_claim_hash(address: &Address, amount_sats: u64) -> String {
    let mut data = address.script_pubkey().to_bytes();
    data.extend_from_slice(&amount_sats.to_le_bytes());
    sha256::Hash::hash(&data).to_string()
}
