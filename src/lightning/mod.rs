//! Lightning node collaborator (hold invoices).

pub mod invoice;

use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Unpaid,
    /// HTLCs are locked in and waiting for settle or cancel.
    Held { amount_msat: u64 },
    Settled,
    Canceled,
}

#[async_trait]
pub trait LightningWallet: Send + Sync {
    /// Returns a BOLT11 invoice for `payment_hash` that is held, not settled,
    /// when paid.
    async fn create_hold_invoice(
        &self,
        payment_hash: &[u8; 32],
        amount_msat: u64,
        expiry_secs: u64,
        description: &str,
    ) -> Result<String>;

    async fn invoice_status(&self, payment_hash: &[u8; 32]) -> Result<InvoiceStatus>;

    async fn settle_invoice(&self, preimage: &[u8; 32]) -> Result<()>;

    async fn cancel_invoice(&self, payment_hash: &[u8; 32]) -> Result<()>;

    /// Inbound liquidity available to receive, in msat.
    async fn inbound_liquidity_msat(&self) -> Result<u64>;
}
