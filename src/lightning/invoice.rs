use std::str::FromStr as _;

use anyhow::Result;
use bitcoin::hashes::Hash as _;
use lightning_invoice::Bolt11Invoice;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceSummary {
    pub payment_hash: [u8; 32],
    pub amount_msat: Option<u64>,
    pub expiry_secs: u64,
}

pub fn parse_bolt11(invoice: &str) -> Result<InvoiceSummary> {
    let invoice = Bolt11Invoice::from_str(invoice)
        .map_err(|e| anyhow::anyhow!("parse BOLT11 invoice: {e:?}"))?;
    Ok(InvoiceSummary {
        payment_hash: invoice.payment_hash().to_byte_array(),
        amount_msat: invoice.amount_milli_satoshis(),
        expiry_secs: invoice.expiry_time().as_secs(),
    })
}

/// Verifies an invoice issued by our node matches what the swap recorded.
pub fn ensure_invoice_matches(
    invoice: &str,
    payment_hash: &[u8; 32],
    amount_msat: u64,
) -> Result<()> {
    let summary = parse_bolt11(invoice)?;
    anyhow::ensure!(
        &summary.payment_hash == payment_hash,
        "invoice payment hash mismatch: expected {}, got {}",
        hex::encode(payment_hash),
        hex::encode(summary.payment_hash)
    );
    anyhow::ensure!(
        summary.amount_msat == Some(amount_msat),
        "invoice amount mismatch: expected {amount_msat} msat, got {:?}",
        summary.amount_msat
    );
    Ok(())
}
