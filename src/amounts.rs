//! Amount bounds and fee computation.
//!
//! All values are integers in the smallest unit of their denomination and fee
//! rates are in parts-per-million. Divisions round up when the remainder is
//! owed to the operator and down when it is owed to the user.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SwapError, SwapResult};
use crate::plugins::PluginChain;
use crate::price::{Prefetch, Rounding, TokenPrice, div, to_u64};

pub const PPM: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    FromBtc,
    ToBtc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub base_fee_sats: u64,
    pub fee_ppm: u64,
    pub min_sats: u64,
    pub max_sats: u64,
    /// Slack applied to the bounds before the network fee is resolved.
    pub tolerance_ppm: u64,
    pub max_fee_iterations: u32,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            base_fee_sats: 100,
            fee_ppm: 3_000,
            min_sats: 10_000,
            max_sats: 10_000_000,
            tolerance_ppm: 50_000,
            max_fee_iterations: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeOverride {
    pub base_fee_sats: u64,
    pub fee_ppm: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountRequest {
    pub chain_id: String,
    pub token: String,
    pub amount: u64,
    pub exact_in: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountCheckContext {
    pub direction: SwapDirection,
    pub request: AmountRequest,
}

impl AmountCheckContext {
    /// Whether the requested amount is denominated in the token (not sats).
    pub fn requested_in_token(&self) -> bool {
        match self.direction {
            SwapDirection::FromBtc => !self.request.exact_in,
            SwapDirection::ToBtc => self.request.exact_in,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmountQuote {
    /// The BTC leg: paid by the client for FromBtc, received for ToBtc.
    pub amount_btc: u64,
    pub swap_fee: u64,
    pub swap_fee_in_token: u64,
    pub network_fee: u64,
    pub network_fee_in_token: u64,
    /// The token leg: received by the client for FromBtc, paid for ToBtc.
    pub total_in_token: u64,
}

#[async_trait]
pub trait NetworkFeeEstimator: Send + Sync {
    async fn network_fee(&self, payout_sats: u64) -> anyhow::Result<u64>;
}

#[derive(Clone, Default)]
pub struct AmountAssertions {
    plugins: PluginChain,
}

impl AmountAssertions {
    pub fn new(plugins: PluginChain) -> Self {
        Self { plugins }
    }

    pub async fn check_amount(
        &self,
        ctx: &AmountCheckContext,
        fees: &FeeConfig,
        price: Prefetch<TokenPrice>,
        network_fee: Option<&dyn NetworkFeeEstimator>,
    ) -> SwapResult<AmountQuote> {
        if ctx.request.amount == 0 {
            return Err(SwapError::invalid("amount must be > 0"));
        }

        let mut fees = fees.clone();
        if let Some(o) = self.plugins.pre_amount_check(ctx).await? {
            fees.base_fee_sats = o.base_fee_sats;
            fees.fee_ppm = o.fee_ppm;
        }

        let price = price.resolve().await?;
        let amount = ctx.request.amount;

        let quote = match (ctx.direction, ctx.request.exact_in) {
            (SwapDirection::FromBtc, true) => from_btc_exact_in(amount, &fees, &price)?,
            (SwapDirection::FromBtc, false) => from_btc_exact_out(amount, &fees, &price)?,
            (SwapDirection::ToBtc, false) => {
                to_btc_exact_out(amount, &fees, &price, network_fee).await?
            }
            (SwapDirection::ToBtc, true) => {
                to_btc_exact_in(amount, &fees, &price, network_fee).await?
            }
        };

        tracing::debug!(
            direction = ?ctx.direction,
            exact_in = ctx.request.exact_in,
            amount,
            amount_btc = quote.amount_btc,
            swap_fee = quote.swap_fee,
            network_fee = quote.network_fee,
            total_in_token = quote.total_in_token,
            "amount checked"
        );

        Ok(self.plugins.post_amount_check(ctx, quote).await)
    }
}

/// Amount left after removing a percentage fee charged on that amount.
pub fn remove_percent_fee(gross: u64, fee_ppm: u64) -> SwapResult<u64> {
    let v = div(
        u128::from(gross) * u128::from(PPM),
        u128::from(PPM) + u128::from(fee_ppm),
        Rounding::Down,
    )?;
    Ok(to_u64(v)?)
}

pub fn percent_fee(amount: u64, fee_ppm: u64) -> SwapResult<u64> {
    let v = div(
        u128::from(amount) * u128::from(fee_ppm),
        u128::from(PPM),
        Rounding::Up,
    )?;
    Ok(to_u64(v)?)
}

fn checked_add(a: u64, b: u64) -> SwapResult<u64> {
    a.checked_add(b)
        .ok_or_else(|| SwapError::invalid("amount overflow"))
}

fn within(amount: u64, fees: &FeeConfig) -> bool {
    amount >= fees.min_sats && amount <= fees.max_sats
}

fn from_btc_exact_in(sats: u64, fees: &FeeConfig, price: &TokenPrice) -> SwapResult<AmountQuote> {
    if sats < fees.min_sats || sats <= fees.base_fee_sats {
        return Err(SwapError::AmountTooLow {
            min: fees.min_sats,
            max: fees.max_sats,
        });
    }
    if sats > fees.max_sats {
        return Err(SwapError::AmountTooHigh {
            min: fees.min_sats,
            max: fees.max_sats,
        });
    }

    let after_base = sats - fees.base_fee_sats;
    let out_btc = remove_percent_fee(after_base, fees.fee_ppm)?;
    let swap_fee = sats - out_btc;

    Ok(AmountQuote {
        amount_btc: sats,
        swap_fee,
        swap_fee_in_token: price.sats_to_token(swap_fee, Rounding::Up)?,
        network_fee: 0,
        network_fee_in_token: 0,
        total_in_token: price.sats_to_token(out_btc, Rounding::Down)?,
    })
}

fn from_btc_exact_out(
    token_out: u64,
    fees: &FeeConfig,
    price: &TokenPrice,
) -> SwapResult<AmountQuote> {
    let out_btc = price.token_to_sats(token_out, Rounding::Up)?;
    let swap_fee = checked_add(fees.base_fee_sats, percent_fee(out_btc, fees.fee_ppm)?)?;
    let amount_btc = checked_add(out_btc, swap_fee)?;

    if !within(amount_btc, fees) {
        let min_out =
            remove_percent_fee(fees.min_sats.saturating_sub(fees.base_fee_sats), fees.fee_ppm)?;
        let max_out =
            remove_percent_fee(fees.max_sats.saturating_sub(fees.base_fee_sats), fees.fee_ppm)?;
        let min = price.sats_to_token(min_out, Rounding::Up)?;
        let max = price.sats_to_token(max_out, Rounding::Down)?;
        return Err(if amount_btc < fees.min_sats {
            SwapError::AmountTooLow { min, max }
        } else {
            SwapError::AmountTooHigh { min, max }
        });
    }

    Ok(AmountQuote {
        amount_btc,
        swap_fee,
        swap_fee_in_token: price.sats_to_token(swap_fee, Rounding::Up)?,
        network_fee: 0,
        network_fee_in_token: 0,
        total_in_token: token_out,
    })
}

async fn estimate_network_fee(
    estimator: Option<&dyn NetworkFeeEstimator>,
    payout_sats: u64,
) -> SwapResult<u64> {
    match estimator {
        Some(e) => Ok(e.network_fee(payout_sats).await?),
        None => Ok(0),
    }
}

async fn to_btc_exact_out(
    payout_sats: u64,
    fees: &FeeConfig,
    price: &TokenPrice,
    estimator: Option<&dyn NetworkFeeEstimator>,
) -> SwapResult<AmountQuote> {
    if payout_sats < fees.min_sats {
        return Err(SwapError::AmountTooLow {
            min: fees.min_sats,
            max: fees.max_sats,
        });
    }
    if payout_sats > fees.max_sats {
        return Err(SwapError::AmountTooHigh {
            min: fees.min_sats,
            max: fees.max_sats,
        });
    }

    let swap_fee = checked_add(fees.base_fee_sats, percent_fee(payout_sats, fees.fee_ppm)?)?;
    let network_fee = estimate_network_fee(estimator, payout_sats).await?;
    let total_btc = checked_add(checked_add(payout_sats, swap_fee)?, network_fee)?;

    Ok(AmountQuote {
        amount_btc: payout_sats,
        swap_fee,
        swap_fee_in_token: price.sats_to_token(swap_fee, Rounding::Up)?,
        network_fee,
        network_fee_in_token: price.sats_to_token(network_fee, Rounding::Up)?,
        total_in_token: price.sats_to_token(total_btc, Rounding::Up)?,
    })
}

/// Token input required so the payout equals `payout_sats`.
fn required_token_in(
    payout_sats: u64,
    network_fee: u64,
    fees: &FeeConfig,
    price: &TokenPrice,
    rounding: Rounding,
) -> SwapResult<u64> {
    let gross = div(
        u128::from(payout_sats) * u128::from(PPM + fees.fee_ppm),
        u128::from(PPM),
        Rounding::Up,
    )?;
    let btc = to_u64(gross)?
        .saturating_add(fees.base_fee_sats)
        .saturating_add(network_fee);
    Ok(price.sats_to_token(btc, rounding)?)
}

fn payout_after_fees(in_btc: u64, network_fee: u64, fees: &FeeConfig) -> SwapResult<u64> {
    let after = in_btc
        .saturating_sub(fees.base_fee_sats)
        .saturating_sub(network_fee);
    remove_percent_fee(after, fees.fee_ppm)
}

async fn to_btc_exact_in(
    token_in: u64,
    fees: &FeeConfig,
    price: &TokenPrice,
    estimator: Option<&dyn NetworkFeeEstimator>,
) -> SwapResult<AmountQuote> {
    let in_btc = price.token_to_sats(token_in, Rounding::Down)?;
    let bounds = |network_fee: u64| -> SwapResult<(u64, u64)> {
        Ok((
            required_token_in(fees.min_sats, network_fee, fees, price, Rounding::Up)?,
            required_token_in(fees.max_sats, network_fee, fees, price, Rounding::Down)?,
        ))
    };

    // Coarse check before spending time on network fee estimation.
    let estimate = payout_after_fees(in_btc, 0, fees)?;
    let slack_min = fees
        .min_sats
        .saturating_sub(percent_fee(fees.min_sats, fees.tolerance_ppm)?);
    let slack_max = fees
        .max_sats
        .saturating_add(percent_fee(fees.max_sats, fees.tolerance_ppm)?);
    if estimate < slack_min {
        let (min, max) = bounds(0)?;
        return Err(SwapError::AmountTooLow { min, max });
    }
    if estimate > slack_max {
        let (min, max) = bounds(0)?;
        return Err(SwapError::AmountTooHigh { min, max });
    }

    let mut payout = estimate;
    let mut network_fee = 0;
    for _ in 0..fees.max_fee_iterations.max(1) {
        network_fee = estimate_network_fee(estimator, payout).await?;
        let next = payout_after_fees(in_btc, network_fee, fees)?;
        if next == payout {
            break;
        }
        payout = next;
    }

    if payout < fees.min_sats {
        let (min, max) = bounds(network_fee)?;
        return Err(SwapError::AmountTooLow { min, max });
    }
    if payout > fees.max_sats {
        let (min, max) = bounds(network_fee)?;
        return Err(SwapError::AmountTooHigh { min, max });
    }

    let swap_fee = in_btc.saturating_sub(network_fee).saturating_sub(payout);
    Ok(AmountQuote {
        amount_btc: payout,
        swap_fee,
        swap_fee_in_token: price.sats_to_token(swap_fee, Rounding::Up)?,
        network_fee,
        network_fee_in_token: price.sats_to_token(network_fee, Rounding::Up)?,
        total_in_token: token_in,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price() -> TokenPrice {
        // 1 sat == 1 token unit
        TokenPrice {
            msat_per_token: 1_000,
            decimals: 0,
        }
    }

    fn fees() -> FeeConfig {
        FeeConfig {
            base_fee_sats: 100,
            fee_ppm: 10_000,
            min_sats: 10_000,
            max_sats: 1_000_000,
            tolerance_ppm: 50_000,
            max_fee_iterations: 4,
        }
    }

    struct FlatFee(u64);

    #[async_trait]
    impl NetworkFeeEstimator for FlatFee {
        async fn network_fee(&self, _payout_sats: u64) -> anyhow::Result<u64> {
            Ok(self.0)
        }
    }

    struct ProportionalFee;

    #[async_trait]
    impl NetworkFeeEstimator for ProportionalFee {
        async fn network_fee(&self, payout_sats: u64) -> anyhow::Result<u64> {
            Ok(500 + payout_sats / 1_000)
        }
    }

    #[test]
    fn from_btc_exact_in_applies_base_then_percent_fee() -> SwapResult<()> {
        let q = from_btc_exact_in(100_000, &fees(), &price())?;
        assert_eq!(99_900u64 * 1_000_000 / 1_010_000, 98_910);
        assert_eq!(q.total_in_token, 98_910);
        assert_eq!(q.swap_fee, 1_090);
        assert_eq!(q.amount_btc, 100_000);
        Ok(())
    }

    #[test]
    fn from_btc_exact_out_rounds_fee_up() -> SwapResult<()> {
        let q = from_btc_exact_out(10_001, &fees(), &price())?;
        // 1% of 10_001 = 100.01 -> 101
        assert_eq!(q.swap_fee, 100 + 101);
        assert_eq!(q.amount_btc, 10_001 + 201);
        Ok(())
    }

    #[test]
    fn from_btc_bounds_are_inclusive() {
        assert!(from_btc_exact_in(10_000, &fees(), &price()).is_ok());
        assert!(from_btc_exact_in(1_000_000, &fees(), &price()).is_ok());
        assert!(matches!(
            from_btc_exact_in(9_999, &fees(), &price()),
            Err(SwapError::AmountTooLow { .. })
        ));
        assert!(matches!(
            from_btc_exact_in(1_000_001, &fees(), &price()),
            Err(SwapError::AmountTooHigh { .. })
        ));
    }

    #[tokio::test]
    async fn to_btc_exact_in_subtracts_network_fee_before_percent_fee() -> SwapResult<()> {
        let q = to_btc_exact_in(100_000, &fees(), &price(), Some(&FlatFee(1_000))).await?;
        assert_eq!(q.amount_btc, 98_900u64 * 1_000_000 / 1_010_000);
        assert_eq!(q.network_fee, 1_000);
        assert_eq!(q.swap_fee + q.network_fee + q.amount_btc, 100_000);
        Ok(())
    }

    #[tokio::test]
    async fn to_btc_exact_in_converges_on_amount_dependent_fee() -> SwapResult<()> {
        let q = to_btc_exact_in(200_000, &fees(), &price(), Some(&ProportionalFee)).await?;
        assert_eq!(q.network_fee, 500 + q.amount_btc / 1_000);
        Ok(())
    }

    #[tokio::test]
    async fn to_btc_exact_in_reports_bounds_in_token() {
        // 2 token units per sat
        let price = TokenPrice {
            msat_per_token: 500,
            decimals: 0,
        };
        let err = to_btc_exact_in(100, &fees(), &price, Some(&FlatFee(0)))
            .await
            .unwrap_err();
        match err {
            SwapError::AmountTooLow { min, .. } => {
                // 10_000 payout -> 10_100 gross + 100 base = 10_200 sats = 20_400 tokens
                assert_eq!(min, 20_400);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn to_btc_exact_out_adds_fees_in_token() -> SwapResult<()> {
        let q = to_btc_exact_out(50_000, &fees(), &price(), Some(&FlatFee(300))).await?;
        assert_eq!(q.swap_fee, 100 + 500);
        assert_eq!(q.total_in_token, 50_000 + 600 + 300);
        Ok(())
    }
}
