//! Bitcoin-backed liquidity vaults modeled as a chain of UTXOs.
//!
//! Each withdrawal spends the current tip and creates the next one. The
//! vault tracks what the settlement contract has confirmed and, on top of
//! it, the ordered withdrawals still waiting to be claimed.

pub mod manager;
pub mod swap;
pub mod withdrawal;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Context as _;
use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

use crate::chain::VaultEvent;
use crate::error::{SwapError, SwapResult};
use crate::lock::EntityLock;
use withdrawal::WithdrawalData;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultKey {
    pub chain_id: String,
    pub owner: String,
    pub vault_id: u64,
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.chain_id, self.owner, self.vault_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    BtcInitiated,
    BtcConfirmed,
    Opened,
    Closed,
}

impl VaultStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BtcInitiated => "btc_initiated",
            Self::BtcConfirmed => "btc_confirmed",
            Self::Opened => "opened",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
}

impl From<OutPoint> for Utxo {
    fn from(o: OutPoint) -> Self {
        Self {
            txid: o.txid,
            vout: o.vout,
        }
    }
}

impl From<Utxo> for OutPoint {
    fn from(u: Utxo) -> Self {
        OutPoint {
            txid: u.txid,
            vout: u.vout,
        }
    }
}

impl fmt::Display for Utxo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A token held by the vault. On-chain amounts are raw units; one raw unit
/// is `multiplier` token base units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultToken {
    pub token: String,
    pub multiplier: u64,
}

impl VaultToken {
    pub fn to_raw(&self, token_amount: u64) -> SwapResult<u64> {
        if self.multiplier == 0 {
            return Err(SwapError::invalid(format!("token {} has zero multiplier", self.token)));
        }
        Ok(token_amount / self.multiplier)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedState {
    pub utxo: Option<Utxo>,
    pub balances: Vec<u64>,
    pub deposit_count: u64,
    pub withdrawal_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWithdrawal {
    pub data: WithdrawalData,
    pub confirmations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vault {
    pub key: VaultKey,
    pub status: VaultStatus,
    pub btc_address: String,
    /// Index 0 is the primary token, index 1 the optional gas token.
    pub tokens: Vec<VaultToken>,
    pub required_confirmations: u32,
    pub funding_utxo: Utxo,
    pub confirmed: ConfirmedState,
    #[serde(default)]
    pub pending: Vec<PendingWithdrawal>,
    /// Evicted withdrawals by the chain position they occupied.
    #[serde(default)]
    pub replaced: BTreeMap<u64, Vec<WithdrawalData>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,

    #[serde(skip)]
    pub lock: EntityLock,
}

impl Vault {
    pub fn new(
        key: VaultKey,
        btc_address: String,
        tokens: Vec<VaultToken>,
        required_confirmations: u32,
        funding_utxo: Utxo,
    ) -> Self {
        let balances = vec![0; tokens.len()];
        Self {
            key,
            status: VaultStatus::BtcInitiated,
            btc_address,
            tokens,
            required_confirmations,
            funding_utxo,
            confirmed: ConfirmedState {
                utxo: Some(funding_utxo),
                balances,
                deposit_count: 0,
                withdrawal_count: 0,
            },
            pending: Vec::new(),
            replaced: BTreeMap::new(),
            metadata: BTreeMap::new(),
            created_at: crate::unix_now(),
            lock: EntityLock::new(),
        }
    }

    /// Replays the confirmed balances through `withdrawals` in order.
    /// Fails without side effects if any balance would go negative.
    pub fn calculate_state_after<'a>(
        &self,
        withdrawals: impl IntoIterator<Item = &'a WithdrawalData>,
    ) -> SwapResult<Vec<u64>> {
        let mut balances = self.confirmed.balances.clone();
        for w in withdrawals {
            let amounts = w.total_raw_amounts()?;
            if amounts.len() > balances.len() {
                return Err(SwapError::invalid(format!(
                    "withdrawal {} names {} tokens, vault {} holds {}",
                    w.btc_tx,
                    amounts.len(),
                    self.key,
                    balances.len()
                )));
            }
            for (balance, amount) in balances.iter_mut().zip(amounts) {
                *balance = balance.checked_sub(amount).ok_or(SwapError::InsufficientLiquidity {
                    required: amount,
                    available: *balance,
                })?;
            }
        }
        Ok(balances)
    }

    pub fn balances(&self) -> SwapResult<Vec<u64>> {
        self.calculate_state_after(self.pending.iter().map(|p| &p.data))
    }

    pub fn tip(&self) -> Option<Utxo> {
        match self.pending.last() {
            Some(p) => Some(p.data.created_utxo),
            None => self.confirmed.utxo,
        }
    }

    /// No unconfirmed withdrawal sits at the end of the chain.
    pub fn is_ready(&self) -> bool {
        self.pending.last().is_none_or(|p| p.confirmations >= 1)
    }

    pub fn latest_utxo(&self) -> Option<Utxo> {
        if self.is_ready() { self.tip() } else { None }
    }

    pub fn next_position(&self) -> u64 {
        self.confirmed.withdrawal_count + self.pending.len() as u64
    }

    pub fn position_of(&self, btc_tx: &Txid) -> Option<u64> {
        self.pending
            .iter()
            .position(|p| &p.data.btc_tx == btc_tx)
            .map(|i| self.confirmed.withdrawal_count + i as u64)
    }

    /// Appends `w` if it extends the tip and keeps every balance non-negative.
    pub fn add_withdrawal(&mut self, w: WithdrawalData) -> SwapResult<()> {
        let tip = self.tip();
        if tip != Some(w.spent_utxo) {
            return Err(SwapError::try_again(format!(
                "withdrawal {} spends {}, vault {} tip is {}",
                w.btc_tx,
                w.spent_utxo,
                self.key,
                tip.map(|u| u.to_string()).unwrap_or_else(|| "unset".to_string())
            )));
        }
        self.calculate_state_after(self.pending.iter().map(|p| &p.data).chain([&w]))?;

        let position = self.next_position();
        if let Some(replaced) = self.replaced.get_mut(&position) {
            replaced.retain(|r| r.btc_tx != w.btc_tx);
            if replaced.is_empty() {
                self.replaced.remove(&position);
            }
        }
        self.pending.push(PendingWithdrawal { data: w, confirmations: 0 });
        Ok(())
    }

    /// Removes the withdrawal and everything chained after it.
    pub fn remove_withdrawal(&mut self, btc_tx: &Txid) -> Vec<WithdrawalData> {
        match self.pending.iter().position(|p| &p.data.btc_tx == btc_tx) {
            Some(i) => self.pending.drain(i..).map(|p| p.data).collect(),
            None => Vec::new(),
        }
    }

    /// Moves the withdrawal and its dependents to `replaced`, keyed by the
    /// positions they occupied.
    pub fn evict_withdrawal(&mut self, btc_tx: &Txid) -> usize {
        let Some(start) = self.position_of(btc_tx) else {
            return 0;
        };
        let removed = self.remove_withdrawal(btc_tx);
        let count = removed.len();
        for (offset, w) in removed.into_iter().enumerate() {
            let slot = self.replaced.entry(start + offset as u64).or_default();
            if !slot.iter().any(|r| r.btc_tx == w.btc_tx) {
                slot.push(w);
            }
        }
        count
    }

    /// Applies a confirmed on-chain event. Counters make replays no-ops;
    /// returns whether anything changed.
    pub fn apply_event(&mut self, event: &VaultEvent) -> SwapResult<bool> {
        match event {
            VaultEvent::Opened { utxo, .. } => {
                if matches!(self.status, VaultStatus::Opened | VaultStatus::Closed) {
                    return Ok(false);
                }
                self.status = VaultStatus::Opened;
                if self.pending.is_empty() {
                    self.confirmed.utxo = Some(*utxo);
                }
                Ok(true)
            }
            VaultEvent::Deposit {
                deposit_count,
                raw_amounts,
                ..
            } => {
                if *deposit_count <= self.confirmed.deposit_count {
                    return Ok(false);
                }
                if raw_amounts.len() > self.confirmed.balances.len() {
                    return Err(SwapError::invalid(format!(
                        "deposit into {} names unknown tokens",
                        self.key
                    )));
                }
                for (balance, amount) in self.confirmed.balances.iter_mut().zip(raw_amounts) {
                    *balance = balance
                        .checked_add(*amount)
                        .context("vault balance overflow")?;
                }
                self.confirmed.deposit_count = *deposit_count;
                Ok(true)
            }
            VaultEvent::Claimed {
                withdrawal_count,
                btc_tx,
                raw_amounts,
                new_utxo,
                ..
            } => {
                if *withdrawal_count <= self.confirmed.withdrawal_count {
                    return Ok(false);
                }
                if raw_amounts.len() > self.confirmed.balances.len() {
                    return Err(SwapError::invalid(format!(
                        "claim from {} names unknown tokens",
                        self.key
                    )));
                }
                for (balance, amount) in self.confirmed.balances.iter_mut().zip(raw_amounts) {
                    *balance = balance.checked_sub(*amount).ok_or_else(|| SwapError::InvalidState {
                        reason: format!("claim of {btc_tx} overdraws vault {}", self.key),
                    })?;
                }

                match self.pending.iter().position(|p| &p.data.btc_tx == btc_tx) {
                    Some(i) => {
                        self.pending.drain(..=i);
                    }
                    None if !self.pending.is_empty() => {
                        tracing::warn!(
                            vault = %self.key,
                            %btc_tx,
                            dropped = self.pending.len(),
                            "claimed withdrawal was not pending, dropping conflicting chain"
                        );
                        self.pending.clear();
                    }
                    None => {}
                }
                self.confirmed.utxo = Some(*new_utxo);
                self.confirmed.withdrawal_count = *withdrawal_count;
                self.replaced = self.replaced.split_off(withdrawal_count);
                Ok(true)
            }
            VaultEvent::Closed { .. } => {
                if self.status == VaultStatus::Closed {
                    return Ok(false);
                }
                self.status = VaultStatus::Closed;
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRequest {
    pub chain_id: String,
    pub owner: String,
    pub tokens: Vec<String>,
    pub amounts: Vec<u64>,
    pub fee_ppm: u32,
}

impl VaultRequest {
    /// Raw amounts `vault` would pay out including fee shares, or `None` if
    /// the vault does not hold the requested tokens.
    pub fn required_raw(&self, vault: &Vault) -> SwapResult<Option<Vec<u64>>> {
        if self.tokens.len() > vault.tokens.len()
            || self.tokens.iter().zip(&vault.tokens).any(|(t, v)| t != &v.token)
        {
            return Ok(None);
        }
        let mut out = Vec::with_capacity(self.amounts.len());
        for (amount, token) in self.amounts.iter().zip(&vault.tokens) {
            let raw = u128::from(token.to_raw(*amount)?);
            let fee = (raw * u128::from(self.fee_ppm)).div_ceil(u128::from(crate::amounts::PPM));
            out.push(u64::try_from(raw + fee).context("raw amount overflows u64")?);
        }
        Ok(Some(out))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultCandidate {
    pub key: VaultKey,
    pub balances: Vec<u64>,
}
