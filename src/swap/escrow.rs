//! Escrow-backed swaps: event routing and watchdog reconciliation.
//!
//! A family plugs in its event callbacks, a reconcile step and an expiry
//! policy; this layer owns the `(chain, escrow hash)` index and decides which
//! callback the on-chain truth calls for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::handler::SwapHandler;
use super::watchdog::Reconciler;
use super::{FamilyRecord, SwapFamily, SwapKey, SwapState, TxRole};
use crate::chain::{ChainInterface, ChainSet, CommitStatus, EscrowData, EscrowEvent};
use crate::error::SwapResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// We funded the escrow and must take it back ourselves.
    RefundOurselves,
    /// The counterparty funded it and refunds unilaterally.
    AwaitCounterparty,
}

pub trait EscrowState: SwapState {
    fn is_uncommitted(&self) -> bool;
    fn canceled() -> Self;
}

#[async_trait]
pub trait EscrowFamily: SwapFamily<State: EscrowState> + Sized {
    fn escrow(record: &FamilyRecord<Self>) -> Option<&EscrowData>;

    /// Unix seconds after which an uncommitted swap can be dropped.
    fn authorization_expiry(record: &FamilyRecord<Self>) -> u64;

    fn expiry_policy(&self) -> ExpiryPolicy;

    /// Last check before an uncommitted, lapsed swap is canceled.
    async fn can_cancel(
        &self,
        _ctx: &EscrowSwapHandler<Self>,
        _record: &FamilyRecord<Self>,
    ) -> SwapResult<bool> {
        Ok(true)
    }

    async fn on_initialize(
        &self,
        ctx: &EscrowSwapHandler<Self>,
        record: FamilyRecord<Self>,
        tx_id: Option<&str>,
    ) -> SwapResult<()>;

    async fn on_claim(
        &self,
        ctx: &EscrowSwapHandler<Self>,
        record: FamilyRecord<Self>,
        tx_id: Option<&str>,
        secret: Option<&str>,
    ) -> SwapResult<()>;

    async fn on_refund(
        &self,
        ctx: &EscrowSwapHandler<Self>,
        record: FamilyRecord<Self>,
        tx_id: Option<&str>,
    ) -> SwapResult<()>;

    /// Called for [`ExpiryPolicy::RefundOurselves`] once the escrow expired.
    async fn refund_expired(
        &self,
        _ctx: &EscrowSwapHandler<Self>,
        record: FamilyRecord<Self>,
    ) -> SwapResult<()> {
        tracing::debug!(
            family = Self::NAME,
            swap = %record.key,
            "escrow expired, waiting for counterparty refund"
        );
        Ok(())
    }

    /// Family-specific checks for swaps the chain status alone cannot advance.
    async fn reconcile(
        &self,
        _ctx: &EscrowSwapHandler<Self>,
        _record: FamilyRecord<Self>,
    ) -> SwapResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EscrowHandlerConfig {
    pub lock_duration: Duration,
}

impl Default for EscrowHandlerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
        }
    }
}

pub struct EscrowSwapHandler<F: EscrowFamily> {
    family: F,
    handler: SwapHandler<F>,
    chains: ChainSet,
    config: EscrowHandlerConfig,
    escrow_index: Mutex<HashMap<(String, String), SwapKey>>,
}

impl<F: EscrowFamily> EscrowSwapHandler<F> {
    pub fn new(
        family: F,
        handler: SwapHandler<F>,
        chains: ChainSet,
        config: EscrowHandlerConfig,
    ) -> Self {
        let this = Self {
            family,
            handler,
            chains,
            config,
            escrow_index: Mutex::new(HashMap::new()),
        };
        this.rebuild_index();
        this
    }

    pub fn family(&self) -> &F {
        &self.family
    }

    pub fn handler(&self) -> &SwapHandler<F> {
        &self.handler
    }

    pub fn chain(&self, chain_id: &str) -> SwapResult<Arc<dyn ChainInterface>> {
        self.chains.get(chain_id)
    }

    pub fn lock_duration(&self) -> Duration {
        self.config.lock_duration
    }

    pub fn rebuild_index(&self) {
        let mut index = self.escrow_index.lock().expect("escrow index mutex poisoned");
        index.clear();
        for record in self.handler.pending() {
            if let Some(escrow) = F::escrow(&record) {
                index.insert(
                    (record.chain_id.clone(), escrow.escrow_hash.clone()),
                    record.key.clone(),
                );
            }
        }
        tracing::debug!(family = F::NAME, entries = index.len(), "escrow index rebuilt");
    }

    pub fn index_escrow(&self, chain_id: &str, escrow_hash: &str, key: &SwapKey) {
        self.escrow_index
            .lock()
            .expect("escrow index mutex poisoned")
            .insert((chain_id.to_string(), escrow_hash.to_string()), key.clone());
    }

    fn unindex(&self, record: &FamilyRecord<F>) {
        if let Some(escrow) = F::escrow(record) {
            self.escrow_index
                .lock()
                .expect("escrow index mutex poisoned")
                .remove(&(record.chain_id.clone(), escrow.escrow_hash.clone()));
        }
    }

    pub fn find_by_escrow(&self, chain_id: &str, escrow_hash: &str) -> Option<FamilyRecord<F>> {
        let key = self
            .escrow_index
            .lock()
            .expect("escrow index mutex poisoned")
            .get(&(chain_id.to_string(), escrow_hash.to_string()))
            .cloned()?;
        self.handler.get(&key)
    }

    /// Applies `mutate` and moves to `to`, dropping the index entry when the
    /// swap becomes terminal.
    pub async fn transition(
        &self,
        key: &SwapKey,
        from: &[F::State],
        to: F::State,
        mutate: impl FnOnce(&mut FamilyRecord<F>),
    ) -> SwapResult<Option<FamilyRecord<F>>> {
        let next = self.handler.transition(key, from, to, mutate).await?;
        if let Some(record) = &next
            && record.state.is_terminal()
        {
            self.unindex(record);
        }
        Ok(next)
    }

    /// Routes one chain event. Returns `false` for events that match no swap.
    pub async fn process_event(&self, chain_id: &str, event: &EscrowEvent) -> SwapResult<bool> {
        let Some(record) = self.find_by_escrow(chain_id, event.escrow_hash()) else {
            tracing::trace!(
                family = F::NAME,
                chain_id,
                escrow_hash = event.escrow_hash(),
                "ignoring unmatched event"
            );
            return Ok(false);
        };

        tracing::debug!(family = F::NAME, swap = %record.key, ?event, "escrow event");
        match event {
            EscrowEvent::Initialize { tx_id, .. } => {
                let updated =
                    self.handler.update(&record.key, |r| r.set_tx_id(TxRole::Init, tx_id))?;
                let Some(record) = updated else {
                    return Ok(false);
                };
                self.family.on_initialize(self, record, Some(tx_id)).await?;
            }
            EscrowEvent::Claim { tx_id, secret, .. } => {
                self.family.on_claim(self, record, Some(tx_id), Some(secret)).await?;
            }
            EscrowEvent::Refund { tx_id, .. } => {
                let updated =
                    self.handler.update(&record.key, |r| r.set_tx_id(TxRole::Refund, tx_id))?;
                let Some(record) = updated else {
                    return Ok(false);
                };
                self.family.on_refund(self, record, Some(tx_id)).await?;
            }
        }
        Ok(true)
    }

    /// Watchdog pass over every active swap. One failing swap does not stop
    /// the others and leaves its own record untouched.
    pub async fn process_past_swaps(&self) -> Result<()> {
        let pending = self.handler.pending();
        for record in pending {
            let key = record.key.clone();
            if let Err(err) = self.check_past_swap(record).await {
                tracing::warn!(
                    family = F::NAME,
                    swap = %key,
                    error = %err,
                    "watchdog check failed"
                );
            }
        }
        Ok(())
    }

    async fn check_past_swap(&self, record: FamilyRecord<F>) -> SwapResult<()> {
        let status = match F::escrow(&record) {
            Some(escrow) => Some(self.chain(&record.chain_id)?.commit_status(escrow).await?),
            None => None,
        };
        let uncommitted = record.state.is_uncommitted();

        match status {
            None => self.expire_or_reconcile(record).await,
            Some(CommitStatus::NotCommitted) if uncommitted => {
                self.expire_or_reconcile(record).await
            }
            Some(CommitStatus::NotCommitted) => {
                tracing::warn!(
                    family = F::NAME,
                    swap = %record.key,
                    state = record.state.name(),
                    "escrow missing on chain"
                );
                self.family.reconcile(self, record).await
            }
            Some(CommitStatus::Committed) if uncommitted => {
                self.family.on_initialize(self, record, None).await
            }
            Some(CommitStatus::Committed) => self.family.reconcile(self, record).await,
            Some(CommitStatus::Paid { claim_tx, secret }) => {
                self.family
                    .on_claim(self, record, claim_tx.as_deref(), secret.as_deref())
                    .await
            }
            Some(CommitStatus::Refunded { refund_tx }) => {
                self.family.on_refund(self, record, refund_tx.as_deref()).await
            }
            Some(CommitStatus::Expired) => match self.family.expiry_policy() {
                ExpiryPolicy::RefundOurselves => self.family.refund_expired(self, record).await,
                ExpiryPolicy::AwaitCounterparty => self.family.reconcile(self, record).await,
            },
        }
    }

    async fn expire_or_reconcile(&self, record: FamilyRecord<F>) -> SwapResult<()> {
        if record.state.is_uncommitted() && crate::unix_now() >= F::authorization_expiry(&record) {
            if self.family.can_cancel(self, &record).await? {
                self.transition(&record.key, &[record.state], F::State::canceled(), |_| {})
                    .await?;
            }
            return Ok(());
        }
        self.family.reconcile(self, record).await
    }
}

#[async_trait]
impl<F: EscrowFamily> Reconciler for EscrowSwapHandler<F> {
    fn name(&self) -> &'static str {
        F::NAME
    }

    async fn reconcile(&self) -> Result<()> {
        self.process_past_swaps().await
    }
}
