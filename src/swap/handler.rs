use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};

use super::{FamilyRecord, SwapFamily, SwapKey, SwapState};
use crate::error::{SwapError, SwapResult};
use crate::lock::LockToken;
use crate::plugins::{PluginChain, SwapEventInfo};
use crate::store::SqliteStore;

/// Owns the active records of one swap family.
///
/// Records are loaded fully at startup and every mutation is written through
/// to the store before it becomes visible in memory. A transition is applied
/// only if the record is still in one of the expected source states, so
/// callers that resumed after an `.await` never act on a stale read.
pub struct SwapHandler<F: SwapFamily> {
    store: Arc<Mutex<SqliteStore>>,
    records: Mutex<HashMap<SwapKey, FamilyRecord<F>>>,
    plugins: PluginChain,
    _family: PhantomData<fn() -> F>,
}

impl<F: SwapFamily> SwapHandler<F> {
    pub fn load(store: Arc<Mutex<SqliteStore>>, plugins: PluginChain) -> Result<Self> {
        let loaded: Vec<FamilyRecord<F>> = store
            .lock()
            .expect("store mutex poisoned")
            .list_swaps(F::NAME)
            .with_context(|| format!("load {} swaps", F::NAME))?;

        let mut records = HashMap::new();
        for record in loaded {
            if record.state.is_terminal() {
                store
                    .lock()
                    .expect("store mutex poisoned")
                    .remove_swap(F::NAME, &record.key)
                    .context("remove terminal swap")?;
                continue;
            }
            records.insert(record.key.clone(), record);
        }
        tracing::info!(family = F::NAME, swaps = records.len(), "loaded swaps");

        Ok(Self {
            store,
            records: Mutex::new(records),
            plugins,
            _family: PhantomData,
        })
    }

    pub fn plugins(&self) -> &PluginChain {
        &self.plugins
    }

    pub fn get(&self, key: &SwapKey) -> Option<FamilyRecord<F>> {
        self.records
            .lock()
            .expect("records mutex poisoned")
            .get(key)
            .cloned()
    }

    pub fn find(&self, predicate: impl Fn(&FamilyRecord<F>) -> bool) -> Vec<FamilyRecord<F>> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .expect("records mutex poisoned")
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn pending(&self) -> Vec<FamilyRecord<F>> {
        self.find(|r| !r.state.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("records mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_sequence(&self, identifier_hash: &str) -> u64 {
        self.records
            .lock()
            .expect("records mutex poisoned")
            .keys()
            .filter(|k| k.identifier_hash == identifier_hash)
            .map(|k| k.sequence + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn try_lock(&self, key: &SwapKey, max_duration: Duration) -> Option<LockToken> {
        let records = self.records.lock().expect("records mutex poisoned");
        records.get(key)?.lock.try_lock(max_duration)
    }

    pub async fn insert(&self, record: FamilyRecord<F>) -> SwapResult<()> {
        let info = {
            let mut records = self.records.lock().expect("records mutex poisoned");
            if records.contains_key(&record.key) {
                return Err(SwapError::invalid(format!("swap {} already exists", record.key)));
            }
            self.persist(&record)?;
            let info = event_info::<F>(&record);
            records.insert(record.key.clone(), record);
            info
        };

        tracing::info!(family = F::NAME, swap = %info.key, "swap created");
        self.plugins.swap_created(&info).await;
        Ok(())
    }

    /// Applies `mutate` without a state change. Returns `None` if the swap is
    /// no longer active.
    pub fn update(
        &self,
        key: &SwapKey,
        mutate: impl FnOnce(&mut FamilyRecord<F>),
    ) -> SwapResult<Option<FamilyRecord<F>>> {
        let mut records = self.records.lock().expect("records mutex poisoned");
        let Some(current) = records.get(key) else {
            return Ok(None);
        };
        let mut next = current.clone();
        mutate(&mut next);
        next.check_invariants()?;
        self.persist(&next)?;
        records.insert(key.clone(), next.clone());
        Ok(Some(next))
    }

    /// Moves the swap to `to` if its current state is one of `from`.
    ///
    /// Terminal targets remove the record from active storage. Returns the
    /// updated record, or `None` if the precondition no longer holds.
    pub async fn transition(
        &self,
        key: &SwapKey,
        from: &[F::State],
        to: F::State,
        mutate: impl FnOnce(&mut FamilyRecord<F>),
    ) -> SwapResult<Option<FamilyRecord<F>>> {
        let (next, old_state) = {
            let mut records = self.records.lock().expect("records mutex poisoned");
            let Some(current) = records.get(key) else {
                return Ok(None);
            };
            if !from.contains(&current.state) {
                tracing::debug!(
                    family = F::NAME,
                    swap = %key,
                    state = current.state.name(),
                    target = to.name(),
                    "skipping stale transition"
                );
                return Ok(None);
            }

            let old_state = current.state;
            let mut next = current.clone();
            mutate(&mut next);
            next.state = to;
            next.check_invariants()?;

            if to.is_terminal() {
                // Keep the final state on disk until removal succeeds.
                self.persist(&next)?;
                self.store
                    .lock()
                    .expect("store mutex poisoned")
                    .remove_swap(F::NAME, key)?;
                records.remove(key);
            } else {
                self.persist(&next)?;
                records.insert(key.clone(), next.clone());
            }
            (next, old_state)
        };

        tracing::info!(
            family = F::NAME,
            swap = %key,
            from = old_state.name(),
            to = to.name(),
            "swap state changed"
        );

        let info = event_info::<F>(&next);
        self.plugins.swap_state_changed(&info, old_state.name()).await;
        if to.is_terminal() {
            self.plugins.swap_removed(&info).await;
        }
        Ok(Some(next))
    }

    fn persist(&self, record: &FamilyRecord<F>) -> Result<()> {
        self.store.lock().expect("store mutex poisoned").save_swap(
            F::NAME,
            &record.key,
            &record.chain_id,
            record.state.name(),
            record,
        )
    }
}

fn event_info<F: SwapFamily>(record: &FamilyRecord<F>) -> SwapEventInfo {
    SwapEventInfo {
        handler: F::NAME,
        key: record.key.clone(),
        chain_id: record.chain_id.clone(),
        state: record.state.name(),
    }
}
