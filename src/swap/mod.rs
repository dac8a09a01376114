pub mod escrow;
pub mod from_btc_ln;
pub mod handler;
pub mod to_btc;
pub mod watchdog;

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::amounts::AmountQuote;
use crate::lock::EntityLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwapKey {
    pub identifier_hash: String,
    pub sequence: u64,
}

impl SwapKey {
    pub fn new(identifier_hash: impl Into<String>, sequence: u64) -> Self {
        Self {
            identifier_hash: identifier_hash.into(),
            sequence,
        }
    }
}

impl fmt::Display for SwapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.identifier_hash, self.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxRole {
    Init,
    Claim,
    Refund,
    Btc,
}

/// Family-specific swap state. Exactly one initial state; terminal states are
/// never left.
pub trait SwapState:
    Copy + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn initial() -> Self;
    fn is_terminal(&self) -> bool;
    /// Terminal and settled in the swap's favour (claimed).
    fn is_settled(&self) -> bool;
    fn name(&self) -> &'static str;
}

pub trait SwapFamily: Send + Sync + 'static {
    type State: SwapState;
    type Data: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Storage namespace and log name.
    const NAME: &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord<S, D> {
    pub key: SwapKey,
    pub chain_id: String,
    pub token: String,
    pub state: S,
    pub amounts: AmountQuote,
    #[serde(default)]
    pub tx_ids: BTreeMap<TxRole, String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: u64,
    pub data: D,

    #[serde(skip)]
    pub lock: EntityLock,
}

pub type FamilyRecord<F> = SwapRecord<<F as SwapFamily>::State, <F as SwapFamily>::Data>;

impl<S: SwapState, D> SwapRecord<S, D> {
    pub fn new(
        key: SwapKey,
        chain_id: impl Into<String>,
        token: impl Into<String>,
        amounts: AmountQuote,
        data: D,
    ) -> Self {
        Self {
            key,
            chain_id: chain_id.into(),
            token: token.into(),
            state: S::initial(),
            amounts,
            tx_ids: BTreeMap::new(),
            metadata: BTreeMap::new(),
            created_at: crate::unix_now(),
            data,
            lock: EntityLock::new(),
        }
    }

    pub fn tx_id(&self, role: TxRole) -> Option<&str> {
        self.tx_ids.get(&role).map(String::as_str)
    }

    pub fn set_tx_id(&mut self, role: TxRole, txid: impl Into<String>) {
        self.tx_ids.insert(role, txid.into());
    }

    pub fn note(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// A recorded claim proof is only valid together with a settled state.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.tx_id(TxRole::Claim).is_none() || self.state.is_settled(),
            "swap {} has a claim tx but state {}",
            self.key,
            self.state.name()
        );
        Ok(())
    }
}
