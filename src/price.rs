use std::future::Future;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

const MSAT_PER_SAT: u128 = 1_000;

/// Price of one whole token in millisatoshis, with the token's decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPrice {
    pub msat_per_token: u64,
    pub decimals: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Down,
    Up,
}

impl TokenPrice {
    fn unit_scale(&self) -> u128 {
        10u128.pow(u32::from(self.decimals))
    }

    pub fn token_to_sats(&self, token_amount: u64, rounding: Rounding) -> Result<u64> {
        let num = u128::from(token_amount) * u128::from(self.msat_per_token);
        let den = self.unit_scale() * MSAT_PER_SAT;
        to_u64(div(num, den, rounding)?)
    }

    pub fn sats_to_token(&self, sats: u64, rounding: Rounding) -> Result<u64> {
        let num = u128::from(sats) * MSAT_PER_SAT * self.unit_scale();
        let den = u128::from(self.msat_per_token);
        to_u64(div(num, den, rounding)?)
    }
}

pub fn div(num: u128, den: u128, rounding: Rounding) -> Result<u128> {
    anyhow::ensure!(den != 0, "division by zero");
    Ok(match rounding {
        Rounding::Down => num / den,
        Rounding::Up => num.div_ceil(den),
    })
}

pub fn to_u64(v: u128) -> Result<u64> {
    u64::try_from(v).context("amount overflows u64")
}

#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_price(&self, chain_id: &str, token: &str) -> Result<TokenPrice>;
}

/// A background fetch started early in a request to overlap latencies.
///
/// Dropping it aborts the fetch; fetches must be side-effect free.
pub struct Prefetch<T> {
    handle: Option<JoinHandle<Result<T>>>,
}

impl<T: Send + 'static> Prefetch<T> {
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(fut)),
        }
    }

    pub fn price(oracle: Arc<dyn PriceOracle>, chain_id: String, token: String) -> Self
    where
        T: From<TokenPrice>,
    {
        Self::spawn(async move {
            let price = oracle
                .get_price(&chain_id, &token)
                .await
                .with_context(|| format!("fetch price {chain_id}/{token}"))?;
            Ok(T::from(price))
        })
    }

    pub async fn resolve(mut self) -> Result<T> {
        let handle = self.handle.take().context("prefetch already resolved")?;
        handle.await.context("prefetch task aborted")?
    }
}

impl<T> Drop for Prefetch<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
