use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::amounts::{AmountCheckContext, AmountQuote, FeeOverride};
use crate::error::{SwapError, SwapResult};
use crate::swap::SwapKey;
use crate::vault::{VaultCandidate, VaultKey, VaultRequest};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapEventInfo {
    pub handler: &'static str,
    pub key: SwapKey,
    pub chain_id: String,
    pub state: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginRejection {
    pub code: u32,
    pub msg: String,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreAmountCheck {
    Continue,
    OverrideFees(FeeOverride),
    AmountTooLow { min: u64, max: u64 },
    AmountTooHigh { min: u64, max: u64 },
    Reject(PluginRejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VaultSelectionOverride {
    Select(VaultKey),
    Reject(PluginRejection),
}

/// Hooks invoked at fixed points of the swap lifecycle. Every hook defaults
/// to a no-op.
#[async_trait]
pub trait SwapPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_amount_check(&self, _ctx: &AmountCheckContext) -> Result<PreAmountCheck> {
        Ok(PreAmountCheck::Continue)
    }

    async fn post_amount_check(
        &self,
        _ctx: &AmountCheckContext,
        _quote: &AmountQuote,
    ) -> Result<Option<AmountQuote>> {
        Ok(None)
    }

    async fn select_vault(
        &self,
        _request: &VaultRequest,
        _candidates: &[VaultCandidate],
    ) -> Result<Option<VaultSelectionOverride>> {
        Ok(None)
    }

    async fn on_swap_create(&self, _swap: &SwapEventInfo) -> Result<()> {
        Ok(())
    }

    async fn on_swap_remove(&self, _swap: &SwapEventInfo) -> Result<()> {
        Ok(())
    }

    async fn on_swap_state_change(
        &self,
        _swap: &SwapEventInfo,
        _old_state: &'static str,
    ) -> Result<()> {
        Ok(())
    }
}

/// Ordered plugin list. A hook returning `Err` is logged and skipped; only
/// explicit rejections stop the chain.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn SwapPlugin>>,
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn SwapPlugin>>) -> Self {
        Self { plugins }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn pre_amount_check(
        &self,
        ctx: &AmountCheckContext,
    ) -> SwapResult<Option<FeeOverride>> {
        for plugin in &self.plugins {
            match plugin.pre_amount_check(ctx).await {
                Ok(PreAmountCheck::Continue) => {}
                Ok(PreAmountCheck::OverrideFees(fees)) => {
                    tracing::debug!(plugin = plugin.name(), ?fees, "plugin overrode fees");
                    return Ok(Some(fees));
                }
                Ok(PreAmountCheck::AmountTooLow { min, max }) => {
                    return Err(SwapError::AmountTooLow { min, max });
                }
                Ok(PreAmountCheck::AmountTooHigh { min, max }) => {
                    return Err(SwapError::AmountTooHigh { min, max });
                }
                Ok(PreAmountCheck::Reject(r)) => return Err(rejection(plugin.name(), r)),
                Err(err) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        error = %err,
                        "pre_amount_check hook failed"
                    );
                }
            }
        }
        Ok(None)
    }

    pub async fn post_amount_check(
        &self,
        ctx: &AmountCheckContext,
        quote: AmountQuote,
    ) -> AmountQuote {
        for plugin in &self.plugins {
            match plugin.post_amount_check(ctx, &quote).await {
                Ok(Some(replacement)) => return replacement,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        error = %err,
                        "post_amount_check hook failed"
                    );
                }
            }
        }
        quote
    }

    pub async fn select_vault(
        &self,
        request: &VaultRequest,
        candidates: &[VaultCandidate],
    ) -> SwapResult<Option<VaultKey>> {
        for plugin in &self.plugins {
            match plugin.select_vault(request, candidates).await {
                Ok(Some(VaultSelectionOverride::Select(key))) => return Ok(Some(key)),
                Ok(Some(VaultSelectionOverride::Reject(r))) => {
                    return Err(rejection(plugin.name(), r));
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        error = %err,
                        "select_vault hook failed"
                    );
                }
            }
        }
        Ok(None)
    }

    pub async fn swap_created(&self, swap: &SwapEventInfo) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_swap_create(swap).await {
                tracing::warn!(
                    plugin = plugin.name(),
                    swap = %swap.key,
                    error = %err,
                    "on_swap_create hook failed"
                );
            }
        }
    }

    pub async fn swap_removed(&self, swap: &SwapEventInfo) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_swap_remove(swap).await {
                tracing::warn!(
                    plugin = plugin.name(),
                    swap = %swap.key,
                    error = %err,
                    "on_swap_remove hook failed"
                );
            }
        }
    }

    pub async fn swap_state_changed(&self, swap: &SwapEventInfo, old_state: &'static str) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.on_swap_state_change(swap, old_state).await {
                tracing::warn!(
                    plugin = plugin.name(),
                    swap = %swap.key,
                    error = %err,
                    "on_swap_state_change hook failed"
                );
            }
        }
    }
}

fn rejection(plugin: &str, r: PluginRejection) -> SwapError {
    SwapError::PluginRejected {
        plugin: plugin.to_string(),
        code: r.code,
        msg: r.msg,
        data: r.data,
    }
}
