//! In-process `SyncStore` with the same upsert and transaction semantics as
//! the Postgres store. Backs dry runs and the pipeline tests.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bsync_core::{Client, DefaulterDetail, NormalizedBundle, ProductClient, Proposal};
use tokio::sync::Mutex;

use crate::{BundleContext, BundleWriteStats, PersistenceError, SyncStore, UpsertOutcome};

pub type ClientKey = (i64, String);
pub type ProposalKey = (i64, String);
/// `(tenant, client id, proposal, certificate, competency or coverage)`.
pub type DetailKey = (i64, i64, String, String, String);

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow<T> {
    pub id: i64,
    pub broker_id: i64,
    pub client_id: Option<i64>,
    pub value: T,
    /// 1 on insert, bumped on every real change.
    pub revision: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTables {
    pub clients: BTreeMap<ClientKey, StoredRow<Client>>,
    pub proposals: BTreeMap<ProposalKey, StoredRow<Proposal>>,
    pub defaulters: BTreeMap<DetailKey, StoredRow<DefaulterDetail>>,
    pub products: BTreeMap<DetailKey, StoredRow<ProductClient>>,
    next_id: i64,
}

impl MemoryTables {
    pub fn row_count(&self) -> usize {
        self.clients.len() + self.proposals.len() + self.defaulters.len() + self.products.len()
    }

    pub fn client(&self, tenant_id: i64, digits: &str) -> Option<&StoredRow<Client>> {
        self.clients.get(&(tenant_id, digits.to_string()))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: MemoryTables,
    brokers: Vec<(i64, String)>,
    permissive: bool,
    pending_failures: VecDeque<PersistenceError>,
    poisoned_proposals: HashSet<String>,
    apply_calls: usize,
}

/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemorySyncStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unit name resolves to a broker, registered on first sight.
    pub fn permissive() -> Self {
        Self::from_state(MemoryState {
            permissive: true,
            ..MemoryState::default()
        })
    }

    /// Seed the `brokers` lookup with `(id, full name)` pairs.
    pub fn with_brokers<S: Into<String>>(brokers: impl IntoIterator<Item = (i64, S)>) -> Self {
        Self::from_state(MemoryState {
            brokers: brokers.into_iter().map(|(id, name)| (id, name.into())).collect(),
            ..MemoryState::default()
        })
    }

    fn from_state(state: MemoryState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn snapshot(&self) -> MemoryTables {
        self.state.lock().await.tables.clone()
    }

    /// Queue errors returned by the next `apply_bundle` calls, one per call.
    pub async fn inject_failures(&self, errors: impl IntoIterator<Item = PersistenceError>) {
        self.state.lock().await.pending_failures.extend(errors);
    }

    /// Writing this proposal fails with a data error, after earlier rows of the bundle were staged.
    pub async fn fail_on_proposal(&self, proposal_number: impl Into<String>) {
        self.state
            .lock()
            .await
            .poisoned_proposals
            .insert(proposal_number.into());
    }

    pub async fn apply_calls(&self) -> usize {
        self.state.lock().await.apply_calls
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn resolve_broker(&self, unit_name: &str) -> Result<Option<i64>, PersistenceError> {
        let mut state = self.state.lock().await;
        let wanted = unit_name.trim().to_uppercase();
        let mut matches: Vec<i64> = state
            .brokers
            .iter()
            .filter(|(_, name)| name.to_uppercase().starts_with(&wanted))
            .map(|(id, _)| *id)
            .collect();
        matches.sort_unstable();
        if let Some(id) = matches.first() {
            return Ok(Some(*id));
        }
        if state.permissive {
            let id = state.brokers.iter().map(|(id, _)| *id).max().unwrap_or(0) + 1;
            state.brokers.push((id, unit_name.trim().to_string()));
            return Ok(Some(id));
        }
        Ok(None)
    }

    async fn apply_bundle(
        &self,
        ctx: &BundleContext,
        bundle: &NormalizedBundle,
    ) -> Result<BundleWriteStats, PersistenceError> {
        let mut state = self.state.lock().await;
        state.apply_calls += 1;
        if let Some(err) = state.pending_failures.pop_front() {
            return Err(err);
        }
        // Work on a copy and swap it in only when the whole bundle succeeded.
        let mut tables = state.tables.clone();
        let stats = apply_to(&mut tables, ctx, bundle, &state.poisoned_proposals)?;
        state.tables = tables;
        Ok(stats)
    }

    async fn close(&self) {}
}

fn apply_to(
    tables: &mut MemoryTables,
    ctx: &BundleContext,
    bundle: &NormalizedBundle,
    poisoned_proposals: &HashSet<String>,
) -> Result<BundleWriteStats, PersistenceError> {
    let mut stats = BundleWriteStats::default();

    for client in &bundle.clients {
        let mut value = client.clone();
        value.source_id = None;
        let key = (ctx.tenant_id, client.document.digits().to_string());
        let (_, outcome) = upsert(&mut tables.clients, &mut tables.next_id, key, ctx.broker_id, None, value);
        stats.clients.record(outcome);
    }

    for proposal in &bundle.proposals {
        if poisoned_proposals.contains(&proposal.proposal_number) {
            return Err(PersistenceError::Data(format!(
                "proposal {} violates a table constraint",
                proposal.proposal_number
            )));
        }
        let client_key = (ctx.tenant_id, proposal.document.digits().to_string());
        let existing = tables.clients.get(&client_key).map(|row| row.id);
        let client_id = match existing {
            Some(id) => id,
            None => {
                let placeholder = Client::placeholder(proposal.document.clone(), proposal.client_name.clone());
                let (id, outcome) = upsert(
                    &mut tables.clients,
                    &mut tables.next_id,
                    client_key,
                    ctx.broker_id,
                    None,
                    placeholder,
                );
                stats.clients.record(outcome);
                id
            }
        };
        let key = (ctx.tenant_id, proposal.proposal_number.clone());
        let (_, outcome) = upsert(
            &mut tables.proposals,
            &mut tables.next_id,
            key,
            ctx.broker_id,
            Some(client_id),
            proposal.clone(),
        );
        stats.proposals.record(outcome);
    }

    for detail in &bundle.defaulters {
        let Some(client_id) = tables.client(ctx.tenant_id, detail.document.digits()).map(|row| row.id) else {
            stats.defaulters.record(UpsertOutcome::Skipped);
            continue;
        };
        let key = (
            ctx.tenant_id,
            client_id,
            detail.proposal_number.clone(),
            detail.certificate_number.clone(),
            detail.competency.clone(),
        );
        let (_, outcome) = upsert(
            &mut tables.defaulters,
            &mut tables.next_id,
            key,
            ctx.broker_id,
            Some(client_id),
            detail.clone(),
        );
        stats.defaulters.record(outcome);
    }

    for product in &bundle.products {
        let Some(client_id) = tables.client(ctx.tenant_id, product.document.digits()).map(|row| row.id) else {
            stats.products.record(UpsertOutcome::Skipped);
            continue;
        };
        let key = (
            ctx.tenant_id,
            client_id,
            product.proposal_number.clone(),
            product.certificate_number.clone(),
            product.coverage_name.clone(),
        );
        let (_, outcome) = upsert(
            &mut tables.products,
            &mut tables.next_id,
            key,
            ctx.broker_id,
            Some(client_id),
            product.clone(),
        );
        stats.products.record(outcome);
    }

    Ok(stats)
}

fn upsert<K: Ord, T: PartialEq>(
    table: &mut BTreeMap<K, StoredRow<T>>,
    next_id: &mut i64,
    key: K,
    broker_id: i64,
    client_id: Option<i64>,
    value: T,
) -> (i64, UpsertOutcome) {
    match table.entry(key) {
        Entry::Occupied(mut slot) => {
            let row = slot.get_mut();
            if row.broker_id == broker_id && row.client_id == client_id && row.value == value {
                return (row.id, UpsertOutcome::Unchanged);
            }
            row.broker_id = broker_id;
            row.client_id = client_id;
            row.value = value;
            row.revision += 1;
            (row.id, UpsertOutcome::Updated)
        }
        Entry::Vacant(slot) => {
            *next_id += 1;
            let id = *next_id;
            slot.insert(StoredRow {
                id,
                broker_id,
                client_id,
                value,
                revision: 1,
            });
            (id, UpsertOutcome::Inserted)
        }
    }
}
