pub mod payout;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{Address, Psbt, Sequence, Transaction, Txid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTx {
    pub tx: Transaction,
    /// 0 while in the mempool.
    pub confirmations: u32,
}

#[async_trait]
pub trait BitcoinWallet: Send + Sync {
    async fn receive_address(&self) -> Result<Address>;

    /// Current fee rate estimate in sat/vB.
    async fn fee_rate(&self) -> Result<u64>;

    /// Network fee of paying `amount_sats` to `address` at the current fee rate.
    async fn estimate_payout_fee(&self, address: &Address, amount_sats: u64) -> Result<u64>;

    /// Pays `amount_sats` to `address`; every input carries `sequence`.
    async fn send(
        &self,
        address: &Address,
        amount_sats: u64,
        fee_rate: u64,
        sequence: Sequence,
    ) -> Result<Txid>;

    /// Finds a wallet transaction already paying exactly `amount_sats` to
    /// `address` whose inputs all carry `sequence`.
    async fn find_payment(
        &self,
        address: &Address,
        amount_sats: u64,
        sequence: Sequence,
    ) -> Result<Option<Txid>>;

    /// `None` if the transaction is neither confirmed nor in the mempool.
    async fn get_transaction(&self, txid: &Txid) -> Result<Option<WalletTx>>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid>;

    async fn sign_psbt(&self, psbt: Psbt, inputs: &[usize]) -> Result<Psbt>;
}
