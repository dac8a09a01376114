use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use anyhow::{Context as _, Result, bail, ensure};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, sha256, sha256d};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use swap_intermediary::btc::{BitcoinWallet, WalletTx};
use swap_intermediary::chain::{ChainInterface, CommitStatus, EscrowData, InitAuthorization};
use swap_intermediary::lightning::{InvoiceStatus, LightningWallet};
use swap_intermediary::price::{PriceOracle, TokenPrice};
use swap_intermediary::vault::Vault;
use swap_intermediary::vault::withdrawal::WithdrawalData;

/// Settlement chain that records every call and keeps escrow status in a map
/// tests can poke.
pub struct MockChain {
    id: String,
    address: String,
    statuses: Mutex<HashMap<String, CommitStatus>>,
    calls: Mutex<Vec<String>>,
}

impl MockChain {
    pub fn new(id: &str, address: &str) -> Self {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            statuses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_status(&self, escrow_hash: &str, status: CommitStatus) {
        self.statuses
            .lock()
            .expect("statuses mutex poisoned")
            .insert(escrow_hash.to_string(), status);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("calls mutex poisoned").push(call);
    }
}

#[async_trait]
impl ChainInterface for MockChain {
    fn chain_id(&self) -> &str {
        &self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn commit_status(&self, escrow: &EscrowData) -> Result<CommitStatus> {
        Ok(self
            .statuses
            .lock()
            .expect("statuses mutex poisoned")
            .get(&escrow.escrow_hash)
            .cloned()
            .unwrap_or(CommitStatus::NotCommitted))
    }

    async fn sign_init_authorization(
        &self,
        escrow: &EscrowData,
        timeout_secs: u64,
    ) -> Result<InitAuthorization> {
        Ok(InitAuthorization {
            signature: format!("sig:{}", escrow.escrow_hash),
            expiry: swap_intermediary::unix_now() + timeout_secs,
        })
    }

    async fn init_escrow(&self, escrow: &EscrowData) -> Result<String> {
        self.record(format!("init:{}", escrow.escrow_hash));
        self.set_status(&escrow.escrow_hash, CommitStatus::Committed);
        Ok(format!("init-tx:{}", escrow.escrow_hash))
    }

    async fn claim_with_btc_tx(&self, escrow: &EscrowData, btc_txid: &Txid) -> Result<String> {
        self.record(format!("claim_btc:{}:{btc_txid}", escrow.escrow_hash));
        Ok(format!("claim-tx:{}", escrow.escrow_hash))
    }

    async fn refund(&self, escrow: &EscrowData) -> Result<String> {
        self.record(format!("refund:{}", escrow.escrow_hash));
        let refund_tx = format!("refund-tx:{}", escrow.escrow_hash);
        self.set_status(
            &escrow.escrow_hash,
            CommitStatus::Refunded {
                refund_tx: Some(refund_tx.clone()),
            },
        );
        Ok(refund_tx)
    }

    async fn open_vault(&self, vault: &Vault) -> Result<String> {
        self.record(format!("open_vault:{}", vault.key));
        Ok(format!("open-tx:{}", vault.key))
    }

    async fn claim_withdrawals(
        &self,
        vault: &Vault,
        withdrawals: &[WithdrawalData],
    ) -> Result<String> {
        self.record(format!("claim_withdrawals:{}:{}", vault.key, withdrawals.len()));
        Ok(format!("claim-withdrawals-tx:{}", vault.key))
    }
}

/// In-memory wallet: every send or broadcast lands in a mempool whose
/// confirmations tests advance by hand.
pub struct MockWallet {
    counter: AtomicU32,
    fee_rate: AtomicU64,
    fail_broadcast: AtomicBool,
    txs: Mutex<HashMap<Txid, WalletTx>>,
    sends: Mutex<Vec<Txid>>,
}

impl Default for MockWallet {
    fn default() -> Self {
        Self {
            counter: AtomicU32::new(1),
            fee_rate: AtomicU64::new(2),
            fail_broadcast: AtomicBool::new(false),
            txs: Mutex::new(HashMap::new()),
            sends: Mutex::new(Vec::new()),
        }
    }
}

impl MockWallet {
    fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn new_address(&self) -> Address {
        let script = ScriptBuf::from_bytes(self.next().to_le_bytes().to_vec());
        Address::p2wsh(&script, Network::Regtest)
    }

    /// An outpoint nothing in the wallet knows about.
    pub fn foreign_outpoint(&self) -> OutPoint {
        let hash = sha256d::Hash::hash(&self.next().to_be_bytes());
        OutPoint {
            txid: Txid::from_byte_array(hash.to_byte_array()),
            vout: 0,
        }
    }

    pub fn insert_tx(&self, tx: Transaction, confirmations: u32) -> Txid {
        let txid = tx.compute_txid();
        self.txs
            .lock()
            .expect("txs mutex poisoned")
            .insert(txid, WalletTx { tx, confirmations });
        txid
    }

    pub fn set_confirmations(&self, txid: &Txid, confirmations: u32) {
        if let Some(tx) = self.txs.lock().expect("txs mutex poisoned").get_mut(txid) {
            tx.confirmations = confirmations;
        }
    }

    /// Simulates the transaction leaving the mempool.
    pub fn drop_tx(&self, txid: &Txid) -> Option<Transaction> {
        self.txs
            .lock()
            .expect("txs mutex poisoned")
            .remove(txid)
            .map(|t| t.tx)
    }

    pub fn set_fail_broadcast(&self, fail: bool) {
        self.fail_broadcast.store(fail, Ordering::SeqCst);
    }

    /// Transactions created through [`BitcoinWallet::send`].
    pub fn sends(&self) -> Vec<Txid> {
        self.sends.lock().expect("sends mutex poisoned").clone()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.txs.lock().expect("txs mutex poisoned").contains_key(txid)
    }
}

#[async_trait]
impl BitcoinWallet for MockWallet {
    async fn receive_address(&self) -> Result<Address> {
        Ok(self.new_address())
    }

    async fn fee_rate(&self) -> Result<u64> {
        Ok(self.fee_rate.load(Ordering::SeqCst))
    }

    async fn estimate_payout_fee(&self, _address: &Address, _amount_sats: u64) -> Result<u64> {
        Ok(150 * self.fee_rate.load(Ordering::SeqCst))
    }

    async fn send(
        &self,
        address: &Address,
        amount_sats: u64,
        _fee_rate: u64,
        sequence: Sequence,
    ) -> Result<Txid> {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: self.foreign_outpoint(),
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(amount_sats),
                script_pubkey: address.script_pubkey(),
            }],
        };
        let txid = self.insert_tx(tx, 0);
        self.sends.lock().expect("sends mutex poisoned").push(txid);
        Ok(txid)
    }

    async fn find_payment(
        &self,
        address: &Address,
        amount_sats: u64,
        sequence: Sequence,
    ) -> Result<Option<Txid>> {
        let script = address.script_pubkey();
        let amount = Amount::from_sat(amount_sats);
        Ok(self
            .txs
            .lock()
            .expect("txs mutex poisoned")
            .iter()
            .find(|(_, t)| {
                t.tx.input.iter().all(|i| i.sequence == sequence)
                    && t.tx
                        .output
                        .iter()
                        .any(|o| o.script_pubkey == script && o.value == amount)
            })
            .map(|(txid, _)| *txid))
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Option<WalletTx>> {
        Ok(self.txs.lock().expect("txs mutex poisoned").get(txid).cloned())
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            bail!("broadcast rejected: mempool conflict");
        }
        Ok(self.insert_tx(tx.clone(), 0))
    }

    async fn sign_psbt(&self, psbt: Psbt, inputs: &[usize]) -> Result<Psbt> {
        ensure!(
            inputs.iter().all(|&i| i < psbt.inputs.len()),
            "signing index out of range"
        );
        Ok(psbt)
    }
}

/// Produces the BOLT11 string for a hold invoice: payment hash, amount in
/// msat and expiry in seconds.
pub type InvoiceFactory = Box<dyn Fn(&[u8; 32], u64, u64) -> Result<String> + Send + Sync>;

pub struct MockLightning {
    invoices: Mutex<HashMap<[u8; 32], InvoiceStatus>>,
    settled: Mutex<Vec<[u8; 32]>>,
    canceled: Mutex<Vec<[u8; 32]>>,
    inbound_msat: AtomicU64,
    factory: Mutex<Option<InvoiceFactory>>,
}

impl Default for MockLightning {
    fn default() -> Self {
        Self {
            invoices: Mutex::new(HashMap::new()),
            settled: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            inbound_msat: AtomicU64::new(10_000_000_000),
            factory: Mutex::new(None),
        }
    }
}

impl MockLightning {
    pub fn set_invoice_factory(&self, factory: InvoiceFactory) {
        *self.factory.lock().expect("factory mutex poisoned") = Some(factory);
    }

    pub fn set_inbound_msat(&self, msat: u64) {
        self.inbound_msat.store(msat, Ordering::SeqCst);
    }

    pub fn set_status(&self, payment_hash: &[u8; 32], status: InvoiceStatus) {
        self.invoices
            .lock()
            .expect("invoices mutex poisoned")
            .insert(*payment_hash, status);
    }

    pub fn settled(&self) -> Vec<[u8; 32]> {
        self.settled.lock().expect("settled mutex poisoned").clone()
    }

    pub fn canceled(&self) -> Vec<[u8; 32]> {
        self.canceled.lock().expect("canceled mutex poisoned").clone()
    }
}

#[async_trait]
impl LightningWallet for MockLightning {
    async fn create_hold_invoice(
        &self,
        payment_hash: &[u8; 32],
        amount_msat: u64,
        expiry_secs: u64,
        _description: &str,
    ) -> Result<String> {
        let invoice = {
            let factory = self.factory.lock().expect("factory mutex poisoned");
            let factory = factory.as_ref().context("no invoice factory configured")?;
            factory(payment_hash, amount_msat, expiry_secs)?
        };
        self.set_status(payment_hash, InvoiceStatus::Unpaid);
        Ok(invoice)
    }

    async fn invoice_status(&self, payment_hash: &[u8; 32]) -> Result<InvoiceStatus> {
        self.invoices
            .lock()
            .expect("invoices mutex poisoned")
            .get(payment_hash)
            .copied()
            .with_context(|| format!("unknown invoice {}", hex::encode(payment_hash)))
    }

    async fn settle_invoice(&self, preimage: &[u8; 32]) -> Result<()> {
        let hash = sha256::Hash::hash(preimage).to_byte_array();
        let mut invoices = self.invoices.lock().expect("invoices mutex poisoned");
        let status = invoices
            .get_mut(&hash)
            .with_context(|| format!("unknown invoice {}", hex::encode(hash)))?;
        match status {
            InvoiceStatus::Held { .. } | InvoiceStatus::Settled => *status = InvoiceStatus::Settled,
            other => bail!("cannot settle invoice in state {other:?}"),
        }
        self.settled.lock().expect("settled mutex poisoned").push(hash);
        Ok(())
    }

    async fn cancel_invoice(&self, payment_hash: &[u8; 32]) -> Result<()> {
        self.set_status(payment_hash, InvoiceStatus::Canceled);
        self.canceled.lock().expect("canceled mutex poisoned").push(*payment_hash);
        Ok(())
    }

    async fn inbound_liquidity_msat(&self) -> Result<u64> {
        Ok(self.inbound_msat.load(Ordering::SeqCst))
    }
}

/// One price for every token.
pub struct MockOracle {
    price: TokenPrice,
}

impl MockOracle {
    pub fn new(price: TokenPrice) -> Self {
        Self { price }
    }
}

#[async_trait]
impl PriceOracle for MockOracle {
    async fn get_price(&self, _chain_id: &str, _token: &str) -> Result<TokenPrice> {
        Ok(self.price)
    }
}
