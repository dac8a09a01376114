//! Smart-contract chain collaborator and the events it emits.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::Txid;
use bitcoin::hashes::{Hash as _, sha256};
use serde::{Deserialize, Serialize};

use crate::error::{SwapError, SwapResult};
use crate::vault::withdrawal::WithdrawalData;
use crate::vault::{Utxo, Vault};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowData {
    pub escrow_hash: String,
    pub claim_hash: String,
    pub offerer: String,
    pub claimer: String,
    pub token: String,
    pub amount: u64,
    /// Unix seconds after which the offerer may refund.
    pub expiry: u64,
    pub sequence: u64,
}

/// Escrow identifier binding the claim hash, the request sequence and the
/// counterparty's address.
pub fn escrow_hash(claim_hash: &str, sequence: u64, counterparty: &str) -> String {
    let mut data = claim_hash.as_bytes().to_vec();
    data.extend_from_slice(&sequence.to_le_bytes());
    data.extend_from_slice(counterparty.as_bytes());
    sha256::Hash::hash(&data).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    NotCommitted,
    Committed,
    /// Claimed by the claimer. The secret is known for hash-locked escrows.
    Paid {
        claim_tx: Option<String>,
        secret: Option<String>,
    },
    Expired,
    Refunded {
        refund_tx: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitAuthorization {
    pub signature: String,
    /// Unix seconds after which the authorization can no longer be used.
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowEvent {
    Initialize {
        escrow_hash: String,
        tx_id: String,
    },
    Claim {
        escrow_hash: String,
        tx_id: String,
        secret: String,
    },
    Refund {
        escrow_hash: String,
        tx_id: String,
    },
}

impl EscrowEvent {
    pub fn escrow_hash(&self) -> &str {
        match self {
            Self::Initialize { escrow_hash, .. }
            | Self::Claim { escrow_hash, .. }
            | Self::Refund { escrow_hash, .. } => escrow_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultEvent {
    Opened {
        owner: String,
        vault_id: u64,
        utxo: Utxo,
        tx_id: String,
    },
    Deposit {
        owner: String,
        vault_id: u64,
        /// On-chain deposit counter after this deposit.
        deposit_count: u64,
        raw_amounts: Vec<u64>,
        tx_id: String,
    },
    Claimed {
        owner: String,
        vault_id: u64,
        /// On-chain withdrawal counter after this claim.
        withdrawal_count: u64,
        btc_tx: Txid,
        raw_amounts: Vec<u64>,
        new_utxo: Utxo,
        tx_id: String,
    },
    Closed {
        owner: String,
        vault_id: u64,
        tx_id: String,
    },
}

impl VaultEvent {
    pub fn vault(&self) -> (&str, u64) {
        match self {
            Self::Opened { owner, vault_id, .. }
            | Self::Deposit { owner, vault_id, .. }
            | Self::Claimed { owner, vault_id, .. }
            | Self::Closed { owner, vault_id, .. } => (owner, *vault_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Escrow(EscrowEvent),
    Vault(VaultEvent),
}

#[async_trait]
pub trait ChainInterface: Send + Sync {
    fn chain_id(&self) -> &str;

    fn address(&self) -> &str;

    async fn commit_status(&self, escrow: &EscrowData) -> Result<CommitStatus>;

    async fn sign_init_authorization(
        &self,
        escrow: &EscrowData,
        timeout_secs: u64,
    ) -> Result<InitAuthorization>;

    async fn init_escrow(&self, escrow: &EscrowData) -> Result<String>;

    async fn claim_with_btc_tx(&self, escrow: &EscrowData, btc_txid: &Txid) -> Result<String>;

    async fn refund(&self, escrow: &EscrowData) -> Result<String>;

    async fn open_vault(&self, vault: &Vault) -> Result<String>;

    async fn claim_withdrawals(
        &self,
        vault: &Vault,
        withdrawals: &[WithdrawalData],
    ) -> Result<String>;
}

#[derive(Clone, Default)]
pub struct ChainSet {
    chains: HashMap<String, Arc<dyn ChainInterface>>,
}

impl ChainSet {
    pub fn new(chains: Vec<Arc<dyn ChainInterface>>) -> Self {
        Self {
            chains: chains
                .into_iter()
                .map(|c| (c.chain_id().to_string(), c))
                .collect(),
        }
    }

    pub fn get(&self, chain_id: &str) -> SwapResult<Arc<dyn ChainInterface>> {
        self.chains
            .get(chain_id)
            .cloned()
            .ok_or_else(|| SwapError::invalid(format!("unknown chain {chain_id}")))
    }
}
