//! Normalized entity store
//!
//! Canonical records are keyed by [`EntityKey`] and only move forward in
//! version. Local optimistic writes live in a separate overlay until the
//! server confirms or rejects them; every read merges the overlay on top of
//! the canonical record.
//!
//! Consumers observe the store through [`Selector`]s backed by tokio
//! `watch` channels. Mutations only mark entities dirty; [`NormalizedStore::dispatch`]
//! recomputes each affected selection once per batch and publishes it only
//! when it actually changed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use terminal_core::{EntityKey, EntityKind, EntityRecord, FieldMap, FieldValue};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::millis;
use crate::error::{SyncError, SyncResult};

// ============================================================================
// Queries
// ============================================================================

/// Slice of the store a consumer wants to observe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// One entity, with optimistic writes applied
    Entity(EntityKey),
    /// A single field of one entity
    Field(EntityKey, String),
    /// Every entity of a kind, ordered by id
    Kind(EntityKind),
}

impl Query {
    fn affected_by(&self, dirty: &HashSet<EntityKey>) -> bool {
        match self {
            Query::Entity(key) | Query::Field(key, _) => dirty.contains(key),
            Query::Kind(kind) => dirty.iter().any(|key| key.kind == *kind),
        }
    }
}

/// Current value of a [`Query`]
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Entity(Option<EntityRecord>),
    Field(Option<FieldValue>),
    Kind(Vec<EntityRecord>),
}

/// Live view of a query
///
/// Holds the latest selection; [`Selector::changed`] resolves whenever the
/// selected slice changes. Dropping the selector (or calling
/// [`Selector::dispose`]) stops notifications.
#[derive(Debug)]
pub struct Selector {
    query: Query,
    receiver: watch::Receiver<Selection>,
}

impl Selector {
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Latest selection
    pub fn current(&self) -> Selection {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change and return it
    pub async fn changed(&mut self) -> SyncResult<Selection> {
        self.receiver
            .changed()
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// True when a change arrived that has not been read yet
    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }

    pub fn dispose(self) {}
}

struct SelectorSlot {
    query: Query,
    sender: watch::Sender<Selection>,
}

// ============================================================================
// Optimistic mutations
// ============================================================================

/// A local write to apply ahead of server confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub key: EntityKey,
    pub fields: FieldMap,
}

impl Mutation {
    pub fn new(key: EntityKey, fields: FieldMap) -> Self {
        Self { key, fields }
    }

    /// Convenience for a single-field write
    pub fn field(key: EntityKey, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let mut fields = FieldMap::new();
        fields.insert(name.into(), value.into());
        Self { key, fields }
    }
}

/// Final result of an optimistic mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Confirmed,
    RolledBack { reason: SyncError },
}

/// Handle returned to the consumer that submitted a mutation
#[derive(Debug)]
pub struct PendingMutation {
    pub correlation_id: String,
    pub outcome: oneshot::Receiver<MutationOutcome>,
}

impl PendingMutation {
    /// A mutation rolled back before it reached the store
    pub fn rejected(reason: SyncError) -> Self {
        let (origin, outcome) = oneshot::channel();
        let _ = origin.send(MutationOutcome::RolledBack { reason });
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            outcome,
        }
    }

    /// Wait for confirmation or rollback
    pub async fn wait(self) -> MutationOutcome {
        self.outcome.await.unwrap_or(MutationOutcome::RolledBack {
            reason: SyncError::EngineClosed,
        })
    }
}

/// A rolled back optimistic write
#[derive(Debug, Clone, PartialEq)]
pub struct Revert {
    pub correlation_id: String,
    pub key: EntityKey,
    pub reason: SyncError,
}

#[derive(Debug)]
struct OptimisticEntry {
    correlation_id: String,
    key: EntityKey,
    fields: FieldMap,
    deadline: u64,
    origin: Option<oneshot::Sender<MutationOutcome>>,
}

impl OptimisticEntry {
    fn resolve(&mut self, outcome: MutationOutcome) {
        if let Some(origin) = self.origin.take() {
            // The submitter may have stopped waiting
            let _ = origin.send(outcome);
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// Canonical entity tables plus optimistic overlay
pub struct NormalizedStore {
    records: BTreeMap<EntityKey, EntityRecord>,
    /// Keyed by submission order so later writes win
    overlay: BTreeMap<u64, OptimisticEntry>,
    by_correlation: HashMap<String, u64>,
    next_overlay: u64,
    selectors: Vec<SelectorSlot>,
    dirty: HashSet<EntityKey>,
    optimistic_timeout: Duration,
}

impl NormalizedStore {
    pub fn new(optimistic_timeout: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            overlay: BTreeMap::new(),
            by_correlation: HashMap::new(),
            next_overlay: 0,
            selectors: Vec::new(),
            dirty: HashSet::new(),
            optimistic_timeout,
        }
    }

    // ------------------------------------------------------------------------
    // Canonical state
    // ------------------------------------------------------------------------

    /// Replace an entity's fields with a full snapshot
    ///
    /// Rejected when `version` is below the current version.
    pub fn apply_snapshot(
        &mut self,
        key: EntityKey,
        version: u64,
        fields: FieldMap,
        timestamp: DateTime<Utc>,
    ) -> bool {
        if let Some(record) = self.records.get(&key) {
            if version < record.version {
                warn!(
                    "[Store] Snapshot for {} at v{} older than v{}, ignored",
                    key, version, record.version
                );
                return false;
            }
        }

        debug!("[Store] Snapshot {} v{} ({} fields)", key, version, fields.len());
        self.dirty.insert(key.clone());
        self.records
            .insert(key.clone(), EntityRecord::new(key, version, fields, timestamp));
        true
    }

    /// Merge field-level changes
    ///
    /// No-op when the entity has no record yet or `version` does not advance it.
    pub fn apply_delta(
        &mut self,
        key: &EntityKey,
        fields: FieldMap,
        version: u64,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            debug!("[Store] Delta for unknown {} dropped", key);
            return false;
        };
        if version <= record.version {
            return false;
        }

        let mut changed = false;
        for (name, value) in fields {
            if record.fields.get(&name) != Some(&value) {
                record.fields.insert(name, value);
                changed = true;
            }
        }
        record.version = version;
        record.updated_at = timestamp;
        if changed {
            self.dirty.insert(key.clone());
        }
        true
    }

    /// Canonical record without optimistic writes
    pub fn canonical(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    /// Record as consumers see it: canonical state with pending writes on top
    pub fn get(&self, key: &EntityKey) -> Option<EntityRecord> {
        let mut merged = self.records.get(key).cloned();
        for entry in self.overlay.values().filter(|e| &e.key == key) {
            let record = merged.get_or_insert_with(|| {
                EntityRecord::new(key.clone(), 0, FieldMap::new(), DateTime::<Utc>::default())
            });
            record
                .fields
                .extend(entry.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    pub fn field(&self, key: &EntityKey, name: &str) -> Option<FieldValue> {
        self.get(key).and_then(|record| record.fields.get(name).cloned())
    }

    /// Every entity of `kind`, ordered by id
    pub fn by_kind(&self, kind: EntityKind) -> Vec<EntityRecord> {
        let keys: BTreeSet<&EntityKey> = self
            .records
            .keys()
            .chain(self.overlay.values().map(|e| &e.key))
            .filter(|key| key.kind == kind)
            .collect();
        keys.into_iter().filter_map(|key| self.get(key)).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // ------------------------------------------------------------------------
    // Optimistic overlay
    // ------------------------------------------------------------------------

    /// Apply `mutation` locally and return its correlation id with the
    /// channel its outcome will be delivered on
    pub fn submit_optimistic(&mut self, mutation: Mutation, now: u64) -> PendingMutation {
        let correlation_id = Uuid::new_v4().to_string();
        let (origin, outcome) = oneshot::channel();

        let order = self.next_overlay;
        self.next_overlay += 1;
        self.dirty.insert(mutation.key.clone());
        self.by_correlation.insert(correlation_id.clone(), order);
        self.overlay.insert(
            order,
            OptimisticEntry {
                correlation_id: correlation_id.clone(),
                key: mutation.key,
                fields: mutation.fields,
                deadline: now + millis(self.optimistic_timeout),
                origin: Some(origin),
            },
        );

        debug!("[Store] Optimistic write {} pending", correlation_id);
        PendingMutation {
            correlation_id,
            outcome,
        }
    }

    /// Settle a pending mutation
    ///
    /// Returns the revert when the server rejected it. Unknown ids (already
    /// expired or settled) are ignored.
    pub fn reconcile(&mut self, correlation_id: &str, outcome: Result<(), SyncError>) -> Option<Revert> {
        let Some(order) = self.by_correlation.remove(correlation_id) else {
            debug!("[Store] Reconcile for unknown mutation {} ignored", correlation_id);
            return None;
        };
        let mut entry = self.overlay.remove(&order)?;
        self.dirty.insert(entry.key.clone());

        match outcome {
            Ok(()) => {
                debug!("[Store] Mutation {} confirmed", correlation_id);
                entry.resolve(MutationOutcome::Confirmed);
                None
            }
            Err(reason) => {
                info!("[Store] Mutation {} rolled back: {}", correlation_id, reason);
                entry.resolve(MutationOutcome::RolledBack {
                    reason: reason.clone(),
                });
                Some(Revert {
                    correlation_id: entry.correlation_id,
                    key: entry.key,
                    reason,
                })
            }
        }
    }

    pub fn pending_mutations(&self) -> usize {
        self.overlay.len()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.overlay.values().map(|e| e.deadline).min()
    }

    /// Roll back every mutation whose deadline passed
    pub fn expire(&mut self, now: u64) -> Vec<Revert> {
        let expired: Vec<String> = self
            .overlay
            .values()
            .filter(|e| e.deadline <= now)
            .map(|e| e.correlation_id.clone())
            .collect();

        let timeout_ms = millis(self.optimistic_timeout);
        expired
            .iter()
            .filter_map(|id| self.reconcile(id, Err(SyncError::MutationTimeout { timeout_ms })))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Selectors
    // ------------------------------------------------------------------------

    /// Observe `query`; the selector starts out holding the current value
    pub fn select(&mut self, query: Query) -> Selector {
        let (sender, receiver) = watch::channel(self.evaluate(&query));
        self.selectors.push(SelectorSlot {
            query: query.clone(),
            sender,
        });
        Selector { query, receiver }
    }

    /// Publish changed selections and forget disposed selectors
    ///
    /// Returns how many selectors were notified.
    pub fn dispatch(&mut self) -> usize {
        self.selectors.retain(|slot| !slot.sender.is_closed());
        if self.dirty.is_empty() {
            return 0;
        }

        let dirty = std::mem::take(&mut self.dirty);
        let mut notified = 0;
        for slot in &self.selectors {
            if !slot.query.affected_by(&dirty) {
                continue;
            }
            let next = self.evaluate(&slot.query);
            let sent = slot.sender.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            });
            if sent {
                notified += 1;
            }
        }
        notified
    }

    /// Live selectors
    pub fn selector_count(&self) -> usize {
        self.selectors.iter().filter(|slot| !slot.sender.is_closed()).count()
    }

    fn evaluate(&self, query: &Query) -> Selection {
        match query {
            Query::Entity(key) => Selection::Entity(self.get(key)),
            Query::Field(key, name) => Selection::Field(self.field(key, name)),
            Query::Kind(kind) => Selection::Kind(self.by_kind(*kind)),
        }
    }
}
