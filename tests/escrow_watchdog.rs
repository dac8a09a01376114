mod support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use swap_intermediary::chain::{ChainEvent, CommitStatus, EscrowEvent};
use swap_intermediary::store::SqliteStore;
use swap_intermediary::swap::TxRole;
use swap_intermediary::swap::to_btc::{ToBtcQuote, ToBtcRequest, ToBtcState, payout_sequence};

use support::wait::wait_for;
use support::{CHAIN_ID, Harness, TOKEN, test_config};

async fn quote(h: &Harness, payout_address: String) -> Result<ToBtcQuote> {
    let quote = h
        .node
        .to_btc
        .family()
        .create_quote(
            &h.node.to_btc,
            ToBtcRequest {
                chain_id: CHAIN_ID.to_string(),
                token: TOKEN.to_string(),
                amount: 100_000,
                exact_in: false,
                payout_address,
                offerer: "0xclient".to_string(),
            },
        )
        .await?;
    Ok(quote)
}

async fn escrow_event(h: &Harness, event: EscrowEvent) -> Result<bool> {
    Ok(h.node.process_event(CHAIN_ID, &ChainEvent::Escrow(event)).await?)
}

#[tokio::test]
async fn uncommitted_quote_is_canceled_after_authorization_lapses() -> Result<()> {
    let mut config = test_config();
    config.to_btc.authorization_timeout_secs = 0;
    let h = Harness::new(&config)?;

    let q = quote(&h, h.wallet.new_address().to_string()).await?;
    assert_eq!(q.amounts.amount_btc, 100_000);
    assert!(q.amounts.total_in_token > 10_000);
    assert_eq!(h.node.to_btc.handler().len(), 1);

    h.node.to_btc.process_past_swaps().await?;
    assert!(h.node.to_btc.handler().get(&q.key).is_none());
    assert!(h.node.to_btc.handler().is_empty());

    // A late commitment no longer matches anything.
    let matched = escrow_event(
        &h,
        EscrowEvent::Initialize {
            escrow_hash: q.escrow.escrow_hash.clone(),
            tx_id: "late-init".to_string(),
        },
    )
    .await?;
    assert!(!matched);
    assert!(h.wallet.sends().is_empty());
    Ok(())
}

#[tokio::test]
async fn committed_swap_is_paid_once_and_claimed() -> Result<()> {
    let h = Harness::new(&test_config())?;
    let q = quote(&h, h.wallet.new_address().to_string()).await?;
    let escrow_hash = q.escrow.escrow_hash.clone();

    let init = EscrowEvent::Initialize {
        escrow_hash: escrow_hash.clone(),
        tx_id: "init-1".to_string(),
    };
    assert!(escrow_event(&h, init.clone()).await?);
    h.chain.set_status(&escrow_hash, CommitStatus::Committed);

    let record = h.node.to_btc.handler().get(&q.key).context("swap missing")?;
    assert_eq!(record.state, ToBtcState::BtcSending);
    assert_eq!(record.tx_id(TxRole::Init), Some("init-1"));
    let payout = record.tx_id(TxRole::Btc).context("payout txid missing")?.to_string();
    assert_eq!(h.wallet.sends().len(), 1);

    // Redelivered event: no second payout.
    assert!(escrow_event(&h, init).await?);
    assert_eq!(h.wallet.sends().len(), 1);

    // Unconfirmed payout: nothing to claim yet.
    h.node.to_btc.process_past_swaps().await?;
    assert_eq!(h.chain.count("claim_btc:"), 0);

    h.wallet.set_confirmations(&h.wallet.sends()[0], 1);
    h.node.to_btc.process_past_swaps().await?;
    let record = h.node.to_btc.handler().get(&q.key).context("swap missing")?;
    assert_eq!(record.state, ToBtcState::BtcSent);
    assert_eq!(h.chain.calls().last(), Some(&format!("claim_btc:{escrow_hash}:{payout}")));

    // Inside the retry window the claim is not resubmitted.
    h.node.to_btc.process_past_swaps().await?;
    assert_eq!(h.chain.count("claim_btc:"), 1);

    let claim = EscrowEvent::Claim {
        escrow_hash: escrow_hash.clone(),
        tx_id: "claim-1".to_string(),
        secret: String::new(),
    };
    assert!(escrow_event(&h, claim.clone()).await?);
    assert!(h.node.to_btc.handler().get(&q.key).is_none());
    assert!(!escrow_event(&h, claim).await?);
    Ok(())
}

#[tokio::test]
async fn restarted_node_adopts_payout_sent_before_crash() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("node.sqlite3");
    let config = test_config();

    let first = Harness::with_store(&config, SqliteStore::open(path.clone())?)?;
    let address = first.wallet.new_address();
    let q = quote(&first, address.to_string()).await?;
    first
        .node
        .to_btc
        .transition(&q.key, &[ToBtcState::Created], ToBtcState::Committed, |_| {})
        .await?
        .context("commit transition")?;
    // The payout went out but the state change never made it to disk.
    let sent = {
        use swap_intermediary::btc::BitcoinWallet as _;
        first
            .wallet
            .send(&address, q.amounts.amount_btc, 2, payout_sequence(&q.key))
            .await?
    };

    let second = first.restart(&config, SqliteStore::open(path)?)?;
    first.node.shutdown();

    second.chain.set_status(&q.escrow.escrow_hash, CommitStatus::Committed);
    second.node.to_btc.process_past_swaps().await?;

    let record = second.node.to_btc.handler().get(&q.key).context("swap missing")?;
    assert_eq!(record.state, ToBtcState::BtcSending);
    assert_eq!(record.tx_id(TxRole::Btc), Some(sent.to_string().as_str()));
    assert_eq!(second.wallet.sends(), vec![sent]);
    Ok(())
}

#[tokio::test]
async fn recovery_only_adopts_the_payout_tagged_for_the_swap() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("node.sqlite3");
    let config = test_config();

    let first = Harness::with_store(&config, SqliteStore::open(path.clone())?)?;
    let address = first.wallet.new_address();
    let a = quote(&first, address.to_string()).await?;
    let b = quote(&first, address.to_string()).await?;
    assert_ne!(a.key, b.key);
    assert_eq!(a.amounts.amount_btc, b.amounts.amount_btc);
    for q in [&a, &b] {
        first
            .node
            .to_btc
            .transition(&q.key, &[ToBtcState::Created], ToBtcState::Committed, |_| {})
            .await?
            .context("commit transition")?;
    }
    // Only the first payout made it out before the crash.
    let sent = {
        use swap_intermediary::btc::BitcoinWallet as _;
        first
            .wallet
            .send(&address, a.amounts.amount_btc, 2, payout_sequence(&a.key))
            .await?
    };

    let second = first.restart(&config, SqliteStore::open(path)?)?;
    first.node.shutdown();
    for q in [&a, &b] {
        second.chain.set_status(&q.escrow.escrow_hash, CommitStatus::Committed);
    }
    second.node.to_btc.process_past_swaps().await?;

    let sends = second.wallet.sends();
    assert_eq!(sends.len(), 2);
    let a_btc = second.node.to_btc.handler().get(&a.key).context("swap a missing")?;
    let b_btc = second.node.to_btc.handler().get(&b.key).context("swap b missing")?;
    assert_eq!(a_btc.tx_id(TxRole::Btc), Some(sent.to_string().as_str()));
    let b_payout = b_btc.tx_id(TxRole::Btc).context("swap b unpaid")?;
    assert_ne!(b_payout, sent.to_string());
    assert_eq!(b_payout, sends[1].to_string());
    Ok(())
}

#[tokio::test]
async fn refund_before_payout_retires_swap() -> Result<()> {
    let h = Harness::new(&test_config())?;
    let q = quote(&h, h.wallet.new_address().to_string()).await?;
    h.node
        .to_btc
        .transition(&q.key, &[ToBtcState::Created], ToBtcState::Committed, |_| {})
        .await?
        .context("commit transition")?;

    let refunded = escrow_event(
        &h,
        EscrowEvent::Refund {
            escrow_hash: q.escrow.escrow_hash.clone(),
            tx_id: "refund-1".to_string(),
        },
    )
    .await?;
    assert!(refunded);
    assert!(h.node.to_btc.handler().get(&q.key).is_none());
    assert!(h.wallet.sends().is_empty());
    Ok(())
}

#[tokio::test]
async fn quote_rejects_foreign_network_address() -> Result<()> {
    let h = Harness::new(&test_config())?;
    let err = quote(&h, "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".to_string())
        .await
        .expect_err("mainnet address must be rejected");
    assert!(err.to_string().contains("network"), "unexpected error: {err:#}");
    assert!(h.node.to_btc.handler().is_empty());
    Ok(())
}

#[tokio::test]
async fn running_watchdog_cancels_lapsed_quote() -> Result<()> {
    let mut config = test_config();
    config.to_btc.authorization_timeout_secs = 0;
    config.swap_watchdog_secs = 1;
    let mut h = Harness::new(&config)?;
    let q = quote(&h, h.wallet.new_address().to_string()).await?;

    h.node.start_watchdogs(&config);
    let to_btc = Arc::clone(&h.node.to_btc);
    wait_for("lapsed quote canceled", Duration::from_secs(10), || {
        let to_btc = to_btc.clone();
        let key = q.key.clone();
        async move { Ok(to_btc.handler().get(&key).is_none().then_some(())) }
    })
    .await?;
    h.node.shutdown();
    Ok(())
}
