//! Lightning → token swaps.
//!
//! The client pays a hold invoice locked to a payment hash it chose. Once the
//! HTLC is held we lock tokens in an escrow claimable with the preimage; the
//! client's claim reveals it and we settle the invoice.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use serde::{Deserialize, Serialize};

use super::escrow::{EscrowFamily, EscrowState, EscrowSwapHandler, ExpiryPolicy};
use super::{FamilyRecord, SwapFamily, SwapKey, SwapRecord, SwapState, TxRole};
use crate::amounts::{
    AmountAssertions, AmountCheckContext, AmountQuote, AmountRequest, FeeConfig, SwapDirection,
};
use crate::chain::{EscrowData, escrow_hash};
use crate::error::{SwapError, SwapResult};
use crate::lightning::invoice::ensure_invoice_matches;
use crate::lightning::{InvoiceStatus, LightningWallet};
use crate::price::{Prefetch, PriceOracle, TokenPrice};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FromBtcLnState {
    Created,
    Received,
    Committed,
    Claimed,
    Refunded,
    Canceled,
}

impl SwapState for FromBtcLnState {
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
            Self::Received => "received",
            Self::Committed => "committed",
            Self::Claimed => "claimed",
            Self::Refunded => "refunded",
            Self::Canceled => "canceled",
        }
    }
}

impl EscrowState for FromBtcLnState {
    fn is_uncommitted(&self) -> bool {
        matches!(self, Self::Created | Self::Received)
    }

    fn canceled() -> Self {
        Self::Canceled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FromBtcLnData {
    /// Hex payment hash; also the escrow claim hash.
    pub payment_hash: String,
    pub invoice: String,
    pub amount_msat: u64,
    pub claimer: String,
    pub invoice_expires_at: u64,
    #[serde(default)]
    pub escrow: Option<EscrowData>,
}

impl FromBtcLnData {
    fn payment_hash_bytes(&self) -> SwapResult<[u8; 32]> {
        parse_hash(&self.payment_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FromBtcLnConfig {
    pub fees: FeeConfig,
    pub invoice_expiry_secs: u64,
    pub escrow_timeout_secs: u64,
    pub init_retry_secs: u64,
}

impl Default for FromBtcLnConfig {
    fn default() -> Self {
        Self {
            fees: FeeConfig::default(),
            invoice_expiry_secs: 3600,
            escrow_timeout_secs: 12 * 3600,
            init_retry_secs: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FromBtcLnRequest {
    pub chain_id: String,
    pub token: String,
    pub amount: u64,
    pub exact_in: bool,
    /// Hex SHA-256 of a preimage only the client knows.
    pub payment_hash: String,
    /// Client's address on the smart-contract chain.
    pub claimer: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FromBtcLnQuote {
    pub key: SwapKey,
    pub invoice: String,
    pub amounts: AmountQuote,
}

pub type FromBtcLnRecord = SwapRecord<FromBtcLnState, FromBtcLnData>;
pub type FromBtcLnHandler = EscrowSwapHandler<FromBtcLnFamily>;

pub struct FromBtcLnFamily {
    config: FromBtcLnConfig,
    lightning: Arc<dyn LightningWallet>,
    prices: Arc<dyn PriceOracle>,
    assertions: AmountAssertions,
}

impl SwapFamily for FromBtcLnFamily {
    type State = FromBtcLnState;
    type Data = FromBtcLnData;
    const NAME: &'static str = "from_btc_ln";
}

impl FromBtcLnFamily {
    pub fn new(
        config: FromBtcLnConfig,
        lightning: Arc<dyn LightningWallet>,
        prices: Arc<dyn PriceOracle>,
        assertions: AmountAssertions,
    ) -> Self {
        Self {
            config,
            lightning,
            prices,
            assertions,
        }
    }

    pub async fn create_invoice(
        &self,
        ctx: &FromBtcLnHandler,
        request: FromBtcLnRequest,
    ) -> SwapResult<FromBtcLnQuote> {
        let payment_hash = parse_hash(&request.payment_hash)?;
        ctx.chain(&request.chain_id)?;

        let price: Prefetch<TokenPrice> =
            Prefetch::price(self.prices.clone(), request.chain_id.clone(), request.token.clone());
        let inbound = Prefetch::spawn({
            let lightning = self.lightning.clone();
            async move { lightning.inbound_liquidity_msat().await }
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
        let amounts = self
            .assertions
            .check_amount(&check, &self.config.fees, price, None)
            .await?;

        let amount_msat = amounts
            .amount_btc
            .checked_mul(1_000)
            .ok_or_else(|| SwapError::invalid("amount overflow"))?;
        let inbound = inbound.resolve().await?;
        if inbound < amount_msat {
            return Err(SwapError::InsufficientLiquidity {
                required: amount_msat,
                available: inbound,
            });
        }

        let hash_hex = hex::encode(payment_hash);
        let invoice = self
            .lightning
            .create_hold_invoice(
                &payment_hash,
                amount_msat,
                self.config.invoice_expiry_secs,
                &format!("swap to {} on {}", request.token, request.chain_id),
            )
            .await?;
        ensure_invoice_matches(&invoice, &payment_hash, amount_msat)?;

        let key = SwapKey::new(hash_hex.clone(), ctx.handler().next_sequence(&hash_hex));
        let record = FromBtcLnRecord::new(
            key.clone(),
            request.chain_id,
            request.token,
            amounts,
            FromBtcLnData {
                payment_hash: hash_hex,
                invoice: invoice.clone(),
                amount_msat,
                claimer: request.claimer,
                invoice_expires_at: crate::unix_now() + self.config.invoice_expiry_secs,
                escrow: None,
            },
        );
        ctx.handler().insert(record).await?;

        Ok(FromBtcLnQuote { key, invoice, amounts })
    }

    async fn check_invoice(
        &self,
        ctx: &FromBtcLnHandler,
        record: FromBtcLnRecord,
    ) -> SwapResult<()> {
        let payment_hash = record.data.payment_hash_bytes()?;
        match self.lightning.invoice_status(&payment_hash).await? {
            InvoiceStatus::Held { amount_msat } if amount_msat >= record.data.amount_msat => {
                let received = ctx
                    .transition(
                        &record.key,
                        &[FromBtcLnState::Created],
                        FromBtcLnState::Received,
                        |r| r.note("received_msat", amount_msat),
                    )
                    .await?;
                if received.is_some() {
                    self.commit(ctx, &record.key).await?;
                }
            }
            InvoiceStatus::Held { amount_msat } => {
                tracing::warn!(
                    swap = %record.key,
                    amount_msat,
                    expected = record.data.amount_msat,
                    "underpaid HTLC"
                );
            }
            InvoiceStatus::Canceled => {
                ctx.transition(
                    &record.key,
                    &[FromBtcLnState::Created],
                    FromBtcLnState::Canceled,
                    |_| {},
                )
                .await?;
            }
            InvoiceStatus::Unpaid | InvoiceStatus::Settled => {}
        }
        Ok(())
    }

    async fn commit(&self, ctx: &FromBtcLnHandler, key: &SwapKey) -> SwapResult<()> {
        let Some(lock) = ctx.handler().try_lock(key, ctx.lock_duration()) else {
            return Ok(());
        };
        let Some(record) = ctx.handler().get(key) else {
            return Ok(());
        };
        if record.state != FromBtcLnState::Received {
            return Ok(());
        }

        let now = crate::unix_now();
        let last = record.metadata.get("init_submitted_at").and_then(|v| v.as_u64());
        if last.is_some_and(|t| now < t + self.config.init_retry_secs) {
            return Ok(());
        }

        let payment_hash = record.data.payment_hash_bytes()?;
        if !matches!(
            self.lightning.invoice_status(&payment_hash).await?,
            InvoiceStatus::Held { .. }
        ) {
            return Err(SwapError::InvalidState {
                reason: format!("HTLC for {key} is no longer held"),
            });
        }

        let chain = ctx.chain(&record.chain_id)?;
        let escrow = match record.data.escrow.clone() {
            Some(escrow) => escrow,
            None => EscrowData {
                escrow_hash: escrow_hash(
                    &record.data.payment_hash,
                    key.sequence,
                    &record.data.claimer,
                ),
                claim_hash: record.data.payment_hash.clone(),
                offerer: chain.address().to_string(),
                claimer: record.data.claimer.clone(),
                token: record.token.clone(),
                amount: record.amounts.total_in_token,
                expiry: now + self.config.escrow_timeout_secs,
                sequence: key.sequence,
            },
        };

        // Indexed before submission so the initialize event always matches.
        ctx.handler().update(key, |r| {
            r.data.escrow = Some(escrow.clone());
            r.note("init_submitted_at", now);
        })?;
        ctx.index_escrow(&record.chain_id, &escrow.escrow_hash, key);

        lock.ensure_valid()?;
        let tx_id = chain.init_escrow(&escrow).await?;
        tracing::info!(swap = %key, %tx_id, "escrow initialized");

        ctx.transition(key, &[FromBtcLnState::Received], FromBtcLnState::Committed, |r| {
            r.set_tx_id(TxRole::Init, tx_id.clone());
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EscrowFamily for FromBtcLnFamily {
    fn escrow(record: &FamilyRecord<Self>) -> Option<&EscrowData> {
        record.data.escrow.as_ref()
    }

    fn authorization_expiry(record: &FamilyRecord<Self>) -> u64 {
        record.data.invoice_expires_at
    }

    fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy::RefundOurselves
    }

    /// Releases a still-held HTLC back to the payer before the swap is dropped.
    async fn can_cancel(
        &self,
        _ctx: &FromBtcLnHandler,
        record: &FromBtcLnRecord,
    ) -> SwapResult<bool> {
        let payment_hash = record.data.payment_hash_bytes()?;
        match self.lightning.invoice_status(&payment_hash).await? {
            InvoiceStatus::Settled => Ok(false),
            InvoiceStatus::Canceled => Ok(true),
            InvoiceStatus::Unpaid | InvoiceStatus::Held { .. } => {
                self.lightning.cancel_invoice(&payment_hash).await?;
                Ok(true)
            }
        }
    }

    async fn on_initialize(
        &self,
        ctx: &FromBtcLnHandler,
        record: FromBtcLnRecord,
        tx_id: Option<&str>,
    ) -> SwapResult<()> {
        ctx.transition(&record.key, &[FromBtcLnState::Received], FromBtcLnState::Committed, |r| {
            if let Some(tx_id) = tx_id {
                r.set_tx_id(TxRole::Init, tx_id);
            }
        })
        .await?;
        Ok(())
    }

    async fn on_claim(
        &self,
        ctx: &FromBtcLnHandler,
        record: FromBtcLnRecord,
        tx_id: Option<&str>,
        secret: Option<&str>,
    ) -> SwapResult<()> {
        let Some(secret) = secret else {
            return Err(SwapError::InvalidState {
                reason: format!("claim of {} carries no secret", record.key),
            });
        };
        let preimage = parse_hash(secret)?;
        if sha256::Hash::hash(&preimage).to_byte_array() != record.data.payment_hash_bytes()? {
            return Err(SwapError::FundingMismatch {
                reason: format!("secret does not match payment hash of {}", record.key),
            });
        }

        self.lightning.settle_invoice(&preimage).await?;
        tracing::info!(swap = %record.key, "invoice settled");

        ctx.transition(
            &record.key,
            &[FromBtcLnState::Received, FromBtcLnState::Committed],
            FromBtcLnState::Claimed,
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
        ctx: &FromBtcLnHandler,
        record: FromBtcLnRecord,
        tx_id: Option<&str>,
    ) -> SwapResult<()> {
        self.lightning
            .cancel_invoice(&record.data.payment_hash_bytes()?)
            .await?;
        ctx.transition(
            &record.key,
            &[FromBtcLnState::Received, FromBtcLnState::Committed],
            FromBtcLnState::Refunded,
            |r| {
                if let Some(tx_id) = tx_id {
                    r.set_tx_id(TxRole::Refund, tx_id);
                }
            },
        )
        .await?;
        Ok(())
    }

    async fn refund_expired(
        &self,
        ctx: &FromBtcLnHandler,
        record: FromBtcLnRecord,
    ) -> SwapResult<()> {
        let Some(lock) = ctx.handler().try_lock(&record.key, ctx.lock_duration()) else {
            return Ok(());
        };
        let Some(escrow) = record.data.escrow.as_ref() else {
            return Ok(());
        };
        let chain = ctx.chain(&record.chain_id)?;
        lock.ensure_valid()?;
        let refund_tx = chain.refund(escrow).await?;
        tracing::info!(swap = %record.key, %refund_tx, "expired escrow refunded");

        self.on_refund(ctx, record, Some(&refund_tx)).await
    }

    async fn reconcile(&self, ctx: &FromBtcLnHandler, record: FromBtcLnRecord) -> SwapResult<()> {
        match record.state {
            FromBtcLnState::Created => self.check_invoice(ctx, record).await,
            FromBtcLnState::Received => self.commit(ctx, &record.key).await,
            _ => Ok(()),
        }
    }
}

fn parse_hash(value: &str) -> SwapResult<[u8; 32]> {
    let bytes = hex::decode(value).map_err(|e| SwapError::invalid(format!("invalid hex: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| SwapError::invalid("expected 32 bytes"))
}
