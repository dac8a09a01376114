//! Vault withdrawal transactions and their OP_RETURN payload.
//!
//! Layout of the pushed payload:
//!
//! ```text
//! 0x01 | recipient_len u8 | recipient | n u8 | n x u64 BE raw amounts
//!      | caller_fee_ppm u32 BE | fronting_fee_ppm u32 BE | execution_fee_ppm u32 BE
//! ```
//!
//! Input 0 spends the vault UTXO, output 0 is the next vault UTXO and
//! output 1 carries the payload.

use anyhow::{Context as _, Result, bail, ensure};
use bitcoin::script::{Instruction, PushBytesBuf};
use bitcoin::{ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};

use super::Utxo;
use crate::amounts::PPM;

const PAYLOAD_VERSION: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub recipient: String,
    pub raw_amounts: Vec<u64>,
    pub caller_fee_ppm: u32,
    pub fronting_fee_ppm: u32,
    pub execution_fee_ppm: u32,
}

impl WithdrawalRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let recipient = self.recipient.as_bytes();
        let recipient_len = u8::try_from(recipient.len()).context("recipient too long")?;
        let n = u8::try_from(self.raw_amounts.len()).context("too many token amounts")?;

        let mut out = Vec::with_capacity(3 + recipient.len() + 8 * self.raw_amounts.len() + 12);
        out.push(PAYLOAD_VERSION);
        out.push(recipient_len);
        out.extend_from_slice(recipient);
        out.push(n);
        for amount in &self.raw_amounts {
            out.extend_from_slice(&amount.to_be_bytes());
        }
        out.extend_from_slice(&self.caller_fee_ppm.to_be_bytes());
        out.extend_from_slice(&self.fronting_fee_ppm.to_be_bytes());
        out.extend_from_slice(&self.execution_fee_ppm.to_be_bytes());
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader(payload);
        let version = r.u8()?;
        ensure!(version == PAYLOAD_VERSION, "unsupported withdrawal payload version {version}");

        let recipient_len = usize::from(r.u8()?);
        let recipient =
            String::from_utf8(r.take(recipient_len)?.to_vec()).context("recipient is not utf-8")?;

        let n = r.u8()?;
        let mut raw_amounts = Vec::with_capacity(usize::from(n));
        for _ in 0..n {
            raw_amounts.push(u64::from_be_bytes(r.array()?));
        }
        let caller_fee_ppm = u32::from_be_bytes(r.array()?);
        let fronting_fee_ppm = u32::from_be_bytes(r.array()?);
        let execution_fee_ppm = u32::from_be_bytes(r.array()?);
        ensure!(r.0.is_empty(), "{} trailing payload bytes", r.0.len());

        Ok(Self {
            recipient,
            raw_amounts,
            caller_fee_ppm,
            fronting_fee_ppm,
            execution_fee_ppm,
        })
    }

    pub fn op_return_script(&self) -> Result<ScriptBuf> {
        let push = PushBytesBuf::try_from(self.encode()?).context("withdrawal payload too large")?;
        Ok(ScriptBuf::new_op_return(push))
    }

    /// Raw amounts leaving the vault per token: the payout plus all fee
    /// shares, rounded up.
    pub fn total_raw_amounts(&self) -> Result<Vec<u64>> {
        let fee_ppm = u128::from(self.caller_fee_ppm)
            + u128::from(self.fronting_fee_ppm)
            + u128::from(self.execution_fee_ppm);
        self.raw_amounts
            .iter()
            .map(|&amount| {
                let fee = (u128::from(amount) * fee_ppm).div_ceil(u128::from(PPM));
                u64::try_from(u128::from(amount) + fee).context("withdrawal amount overflows u64")
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalData {
    pub btc_tx: Txid,
    pub spent_utxo: Utxo,
    pub created_utxo: Utxo,
    #[serde(flatten)]
    pub request: WithdrawalRequest,
}

impl WithdrawalData {
    /// Recomputes the withdrawal from the raw transaction alone.
    pub fn from_transaction(tx: &Transaction) -> Result<Self> {
        let input = tx.input.first().context("withdrawal has no inputs")?;
        ensure!(tx.output.len() >= 2, "withdrawal needs a vault output and an OP_RETURN output");

        let script = &tx.output[1].script_pubkey;
        ensure!(script.is_op_return(), "output 1 is not OP_RETURN");
        let mut payload = None;
        for instruction in script.instructions().skip(1) {
            match instruction.context("malformed OP_RETURN script")? {
                Instruction::PushBytes(bytes) if payload.is_none() => {
                    payload = Some(bytes.as_bytes())
                }
                _ => bail!("unexpected data in OP_RETURN script"),
            }
        }
        let payload = payload.context("OP_RETURN carries no payload")?;

        let btc_tx = tx.compute_txid();
        Ok(Self {
            btc_tx,
            spent_utxo: input.previous_output.into(),
            created_utxo: Utxo { txid: btc_tx, vout: 0 },
            request: WithdrawalRequest::decode(payload)?,
        })
    }

    pub fn total_raw_amounts(&self) -> Result<Vec<u64>> {
        self.request.total_raw_amounts()
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(self.0.len() >= n, "withdrawal payload truncated");
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        <[u8; N]>::try_from(bytes).context("withdrawal payload truncated")
    }
}
