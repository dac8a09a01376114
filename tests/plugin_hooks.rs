mod support;

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use swap_intermediary::amounts::{AmountCheckContext, FeeOverride};
use swap_intermediary::chain::{ChainEvent, EscrowEvent};
use swap_intermediary::error::SwapError;
use swap_intermediary::plugins::{
    PluginRejection, PreAmountCheck, SwapEventInfo, SwapPlugin, VaultSelectionOverride,
};
use swap_intermediary::store::SqliteStore;
use swap_intermediary::swap::to_btc::{ToBtcQuote, ToBtcRequest, ToBtcState};
use swap_intermediary::vault::{VaultCandidate, VaultKey, VaultRequest};

use support::{CHAIN_ID, Harness, OWNER, TOKEN, test_config};

/// Records lifecycle callbacks and optionally waives swap fees.
#[derive(Default)]
struct Recorder {
    free: bool,
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().expect("events mutex poisoned").clone()
    }

    fn push(&self, event: String) {
        self.events.lock().expect("events mutex poisoned").push(event);
    }
}

#[async_trait]
impl SwapPlugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn pre_amount_check(&self, _ctx: &AmountCheckContext) -> Result<PreAmountCheck> {
        if self.free {
            return Ok(PreAmountCheck::OverrideFees(FeeOverride {
                base_fee_sats: 0,
                fee_ppm: 0,
            }));
        }
        Ok(PreAmountCheck::Continue)
    }

    async fn on_swap_create(&self, swap: &SwapEventInfo) -> Result<()> {
        self.push(format!("create:{}:{}", swap.handler, swap.state));
        Ok(())
    }

    async fn on_swap_state_change(
        &self,
        swap: &SwapEventInfo,
        old_state: &'static str,
    ) -> Result<()> {
        self.push(format!("change:{old_state}->{}", swap.state));
        Ok(())
    }

    async fn on_swap_remove(&self, swap: &SwapEventInfo) -> Result<()> {
        self.push(format!("remove:{}", swap.state));
        Ok(())
    }
}

/// Fails every hook it implements.
struct Broken;

#[async_trait]
impl SwapPlugin for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn pre_amount_check(&self, _ctx: &AmountCheckContext) -> Result<PreAmountCheck> {
        bail!("pricing backend down")
    }

    async fn on_swap_create(&self, _swap: &SwapEventInfo) -> Result<()> {
        bail!("audit log down")
    }
}

/// Pins vault selection to one vault, or refuses everything.
struct Picker {
    pick: Option<VaultKey>,
}

#[async_trait]
impl SwapPlugin for Picker {
    fn name(&self) -> &str {
        "picker"
    }

    async fn select_vault(
        &self,
        _request: &VaultRequest,
        _candidates: &[VaultCandidate],
    ) -> Result<Option<VaultSelectionOverride>> {
        Ok(Some(match &self.pick {
            Some(key) => VaultSelectionOverride::Select(key.clone()),
            None => VaultSelectionOverride::Reject(PluginRejection {
                code: 29_001,
                msg: "vault selection paused".to_string(),
                data: None,
            }),
        }))
    }
}

async fn quote(h: &Harness) -> Result<ToBtcQuote> {
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
                payout_address: h.wallet.new_address().to_string(),
                offerer: "0xclient".to_string(),
            },
        )
        .await?;
    Ok(quote)
}

fn vault_request(amount: u64) -> VaultRequest {
    VaultRequest {
        chain_id: CHAIN_ID.to_string(),
        owner: OWNER.to_string(),
        tokens: vec![TOKEN.to_string()],
        amounts: vec![amount],
        fee_ppm: 0,
    }
}

#[tokio::test]
async fn lifecycle_hooks_follow_the_swap() -> Result<()> {
    let recorder = Arc::new(Recorder::default());
    let h = Harness::with_plugins(
        &test_config(),
        SqliteStore::open_in_memory()?,
        vec![recorder.clone()],
    )?;

    let q = quote(&h).await?;
    assert!(q.amounts.swap_fee > 0);
    h.node
        .to_btc
        .transition(&q.key, &[ToBtcState::Created], ToBtcState::Committed, |_| {})
        .await?;
    h.node
        .process_event(
            CHAIN_ID,
            &ChainEvent::Escrow(EscrowEvent::Refund {
                escrow_hash: q.escrow.escrow_hash.clone(),
                tx_id: "refund-1".to_string(),
            }),
        )
        .await?;

    assert_eq!(
        recorder.events(),
        vec![
            "create:to_btc:created",
            "change:created->committed",
            "change:committed->refunded",
            "remove:refunded",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn failing_plugin_is_skipped_and_override_applies() -> Result<()> {
    let recorder = Arc::new(Recorder {
        free: true,
        ..Recorder::default()
    });
    let h = Harness::with_plugins(
        &test_config(),
        SqliteStore::open_in_memory()?,
        vec![Arc::new(Broken), recorder.clone()],
    )?;

    let q = quote(&h).await?;
    assert_eq!(q.amounts.swap_fee, 0);
    assert_eq!(q.amounts.swap_fee_in_token, 0);
    assert_eq!(recorder.events(), vec!["create:to_btc:created"]);
    assert!(h.node.to_btc.handler().get(&q.key).is_some());
    Ok(())
}

#[tokio::test]
async fn plugin_can_pin_or_refuse_vault_selection() -> Result<()> {
    let h = Harness::new(&test_config())?;
    let large = h.open_vault(5_000).await?;
    let small = h.open_vault(2_000).await?;
    assert_eq!(h.node.vaults.select_vault(&vault_request(1_000)).await?.key, small.key);

    let pinned = Harness::with_plugins(
        &test_config(),
        SqliteStore::open_in_memory()?,
        vec![Arc::new(Picker { pick: None })],
    )?;
    pinned.open_vault(5_000).await?;
    match pinned.node.vaults.select_vault(&vault_request(1_000)).await {
        Err(SwapError::PluginRejected { plugin, code, .. }) => {
            assert_eq!(plugin, "picker");
            assert_eq!(code, 29_001);
        }
        other => bail!("expected plugin rejection, got {other:?}"),
    }

    let chooser = Harness::with_plugins(
        &test_config(),
        SqliteStore::open_in_memory()?,
        vec![Arc::new(Picker { pick: Some(large.key.clone()) })],
    )?;
    let first = chooser.open_vault(5_000).await?;
    chooser.open_vault(2_000).await?;
    assert_eq!(first.key, large.key);
    assert_eq!(chooser.node.vaults.select_vault(&vault_request(1_000)).await?.key, first.key);
    Ok(())
}

#[tokio::test]
async fn misconfigured_vault_is_skipped_during_selection() -> Result<()> {
    let h = Harness::new(&test_config())?;
    let broken = h.open_vault_with(TOKEN, 0, 1_000).await?;
    let healthy = h.open_vault(5_000).await?;

    let picked = h.node.vaults.select_vault(&vault_request(1_000)).await?;
    assert_eq!(picked.key, healthy.key);
    assert_ne!(picked.key, broken.key);
    Ok(())
}
