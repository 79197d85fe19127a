//! Replicated document: the shared set of drawable elements.
//!
//! DESIGN
//! ======
//! Each element is a map of field registers. A register holds one JSON value
//! and the `Stamp` of the op that wrote it. Merging keeps the register with
//! the greater stamp, so every replica that has seen the same ops holds the
//! same state regardless of arrival order or duplication.
//!
//! - `Stamp` = Lamport clock + peer id; ordered by clock, then peer id.
//! - Deletes are tombstones in a grow-only set. A tombstoned id never becomes
//!   visible again, even if a concurrent field edit arrives later.
//! - Snapshot order is by each element's smallest-seen stamp, then id.
//! - Loaded snapshots are seeded with clock-0 stamps shared by every replica,
//!   so any live edit outranks seeded content. The stamp's peer half carries
//!   the snapshot generation (its `updatedAt`) and the load position.
//! - A newer generation supersedes an older one wholesale: seeded registers
//!   of the older snapshot are purged, and older seeded ops arriving later are
//!   ignored. Elements deleted before the newer save therefore stay gone.
//! - Clocks above `MAX_CLOCK` are rejected, so the local clock never wraps.
//!
//! Listeners receive one `ChangeSet` per transaction, tagged with its origin,
//! listing only elements whose visible value changed.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// Globally unique element id.
pub type ElementId = String;
/// Field name → value for one element.
pub type Fields = serde_json::Map<String, Value>;
/// Transient per-session peer identity.
pub type PeerId = Uuid;

/// Field marking an element deleted in renderer-provided element lists.
pub const IS_DELETED_FIELD: &str = "isDeleted";

/// Highest clock accepted from a peer. Leaves room for local ticks.
pub const MAX_CLOCK: u64 = u64::MAX >> 1;

// =============================================================================
// STAMPS
// =============================================================================

/// Logical timestamp of one op. Total order: clock, then peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub peer: PeerId,
}

impl Stamp {
    /// Stamp for the `index`-th element of the snapshot saved at `generation`.
    /// Clock 0 loses to every live edit; between seeded stamps the newer
    /// generation wins, and the index keeps the loaded order.
    #[must_use]
    pub fn seeded(generation: u64, index: usize) -> Self {
        Self { clock: 0, peer: Uuid::from_u128((u128::from(generation) << 64) | index as u128) }
    }

    /// The snapshot generation of a seeded stamp; `None` for live edits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn seed_generation(&self) -> Option<u64> {
        if self.clock == 0 { Some((self.peer.as_u128() >> 64) as u64) } else { None }
    }
}

// =============================================================================
// ELEMENTS + ERRORS
// =============================================================================

/// A visible element: id plus its non-null fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Element {
    /// Split a JSON object into id + fields.
    ///
    /// # Errors
    ///
    /// Rejects non-objects and objects without a non-empty string `id`.
    pub fn from_value(value: Value) -> Result<Self, MalformedElementError> {
        let Value::Object(mut fields) = value else {
            return Err(MalformedElementError::NotAnObject);
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => return Err(MalformedElementError::MissingId),
        };
        Ok(Self { id, fields })
    }

    /// Whether the renderer flagged this element as deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.fields
            .get(IS_DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MalformedElementError {
    #[error("element is not a JSON object")]
    NotAnObject,
    #[error("element has no string id")]
    MissingId,
    #[error("malformed op: {0}")]
    Op(String),
}

impl crate::frame::ErrorCode for MalformedElementError {
    fn error_code(&self) -> &'static str {
        "E_MALFORMED_ELEMENT"
    }
}

// =============================================================================
// MUTATIONS + WIRE UPDATES
// =============================================================================

/// One local edit inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Write these fields (null clears a field).
    Upsert { id: ElementId, fields: Fields },
    /// Tombstone the element.
    Delete { id: ElementId },
}

/// A local transaction. Applied atomically by [`Document::apply_local`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub edits: Vec<Edit>,
}

impl Mutation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn upsert(mut self, id: impl Into<ElementId>, fields: Fields) -> Self {
        self.edits.push(Edit::Upsert { id: id.into(), fields });
        self
    }

    #[must_use]
    pub fn delete(mut self, id: impl Into<ElementId>) -> Self {
        self.edits.push(Edit::Delete { id: id.into() });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

/// A stamped op as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: ElementId,
    pub stamp: Stamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Fields>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
}

impl Op {
    fn validate(&self) -> Result<(), MalformedElementError> {
        if self.id.is_empty() {
            return Err(MalformedElementError::MissingId);
        }
        if self.stamp.clock > MAX_CLOCK {
            return Err(MalformedElementError::Op(format!("clock {} out of range", self.stamp.clock)));
        }
        match (&self.set, self.delete) {
            (Some(_), false) | (None, true) => Ok(()),
            (Some(_), true) => Err(MalformedElementError::Op("op both sets and deletes".into())),
            (None, false) => Err(MalformedElementError::Op("op neither sets nor deletes".into())),
        }
    }
}

/// A batch of ops: the payload of `doc:update` and `doc:sync` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
    /// Newest snapshot generation the sender has seen, even when none of
    /// its seeded content survives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<u64>,
}

impl Update {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Parse an update from untrusted JSON, dropping malformed ops one by one.
    #[must_use]
    pub fn from_value_lenient(value: &Value) -> Self {
        let Some(raw_ops) = value.get("ops").and_then(Value::as_array) else {
            warn!(error = %MalformedElementError::Op("update has no ops array".into()), "doc: dropping update");
            return Self::default();
        };

        let ops = raw_ops
            .iter()
            .filter_map(|raw| {
                let parsed = serde_json::from_value::<Op>(raw.clone())
                    .map_err(|e| MalformedElementError::Op(e.to_string()))
                    .and_then(|op| op.validate().map(|()| op));
                match parsed {
                    Ok(op) => Some(op),
                    Err(e) => {
                        warn!(error = %e, "doc: dropping malformed op");
                        None
                    }
                }
            })
            .collect();
        let snapshot = value.get("snapshot").and_then(Value::as_u64);
        Self { ops, snapshot }
    }
}

// =============================================================================
// CHANGE NOTIFICATION
// =============================================================================

/// Where a transaction came from. Lets the scene binding skip its own edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// One visible change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upserted(Element),
    Removed(ElementId),
}

impl Change {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Change::Upserted(element) => &element.id,
            Change::Removed(id) => id,
        }
    }
}

/// Everything one transaction changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub origin: Origin,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Handle returned by [`Document::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ChangeListener = Box<dyn Fn(&ChangeSet) + Send + Sync>;

// =============================================================================
// DOCUMENT
// =============================================================================

#[derive(Debug, Clone)]
struct Register {
    value: Value,
    stamp: Stamp,
}

#[derive(Debug, Clone)]
struct Entry {
    fields: BTreeMap<String, Register>,
    tombstone: Option<Stamp>,
    first_seen: Stamp,
}

impl Entry {
    fn is_visible(&self) -> bool {
        self.tombstone.is_none() && self.fields.values().any(|reg| !reg.value.is_null())
    }

    fn visible(&self, id: &str) -> Option<Element> {
        if !self.is_visible() {
            return None;
        }
        let fields: Fields = self
            .fields
            .iter()
            .filter(|(_, reg)| !reg.value.is_null())
            .map(|(name, reg)| (name.clone(), reg.value.clone()))
            .collect();
        Some(Element { id: id.to_owned(), fields })
    }

    /// Drop seeded registers older than `generation`. Returns whether any
    /// were dropped.
    fn purge_seeds_before(&mut self, generation: u64) -> bool {
        let before = self.fields.len();
        self.fields
            .retain(|_, reg| reg.stamp.seed_generation().is_none_or(|g| g >= generation));
        if self.fields.len() == before {
            return false;
        }
        if let Some(oldest) = self.fields.values().map(|reg| reg.stamp).chain(self.tombstone).min() {
            self.first_seen = oldest;
        }
        true
    }

    fn is_vacant(&self) -> bool {
        self.fields.is_empty() && self.tombstone.is_none()
    }
}

/// The local replica.
pub struct Document {
    peer: PeerId,
    clock: u64,
    snapshot_generation: Option<u64>,
    entries: HashMap<ElementId, Entry>,
    listeners: Vec<(ListenerId, ChangeListener)>,
    next_listener: u64,
}

impl Document {
    /// An empty replica owned by `peer`.
    #[must_use]
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            clock: 0,
            snapshot_generation: None,
            entries: HashMap::new(),
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Highest clock seen so far.
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Newest snapshot generation seeded locally or seen from a peer.
    #[must_use]
    pub fn snapshot_generation(&self) -> Option<u64> {
        self.snapshot_generation
    }

    /// Register a change listener. Called synchronously after each transaction
    /// that changed something; it must not call back into this document.
    pub fn on_change(&mut self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn off_change(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Apply a local transaction and return the stamped ops to broadcast.
    /// A transaction that would overflow the clock is refused whole and
    /// yields an empty update.
    pub fn apply_local(&mut self, mutation: Mutation) -> Update {
        let ticks = u64::try_from(mutation.edits.len()).unwrap_or(u64::MAX);
        if self.clock.checked_add(ticks).is_none() {
            warn!(clock = self.clock, edits = ticks, "doc: clock exhausted, refusing local edit");
            return Update::default();
        }
        let mut ops = Vec::with_capacity(mutation.edits.len());
        for edit in mutation.edits {
            self.clock += 1;
            let stamp = Stamp { clock: self.clock, peer: self.peer };
            ops.push(match edit {
                Edit::Upsert { id, mut fields } => {
                    fields.remove("id");
                    Op { id, stamp, set: Some(fields), delete: false }
                }
                Edit::Delete { id } => Op { id, stamp, set: None, delete: true },
            });
        }
        let update = Update { ops, snapshot: None };
        self.merge(&update.ops, None, Origin::Local);
        update
    }

    /// Merge ops received from a peer. Idempotent.
    pub fn apply_remote(&mut self, update: &Update) -> ChangeSet {
        self.merge(&update.ops, update.snapshot, Origin::Remote)
    }

    /// Seed a freshly loaded snapshot saved at `generation` (its
    /// `updatedAt`). Non-objects, elements without an id and elements flagged
    /// `isDeleted` are skipped. Returns the number seeded.
    pub fn seed(&mut self, values: Vec<Value>, generation: u64) -> usize {
        let mut ops = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match Element::from_value(value) {
                Ok(element) if element.is_deleted() => {}
                Ok(element) => ops.push(Op {
                    id: element.id,
                    stamp: Stamp::seeded(generation, index),
                    set: Some(element.fields),
                    delete: false,
                }),
                Err(e) => warn!(error = %e, index, "doc: skipping malformed snapshot element"),
            }
        }
        let seeded = ops.len();
        self.merge(&ops, Some(generation), Origin::Remote);
        seeded
    }

    /// Visible elements in deterministic order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Element> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|(a_id, a), (b_id, b)| a.first_seen.cmp(&b.first_seen).then_with(|| a_id.cmp(b_id)));
        entries
            .into_iter()
            .filter_map(|(id, entry)| entry.visible(id))
            .collect()
    }

    /// One visible element.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Element> {
        self.entries.get(id).and_then(|entry| entry.visible(id))
    }

    #[must_use]
    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.tombstone.is_some())
    }

    /// Number of visible elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().filter(|entry| entry.is_visible()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every register and tombstone as ops, plus the snapshot generation,
    /// for reconnect exchange.
    #[must_use]
    pub fn full_state(&self) -> Update {
        let mut ops = Vec::new();
        for (id, entry) in &self.entries {
            for (name, reg) in &entry.fields {
                let mut set = Fields::new();
                set.insert(name.clone(), reg.value.clone());
                ops.push(Op { id: id.clone(), stamp: reg.stamp, set: Some(set), delete: false });
            }
            if let Some(stamp) = entry.tombstone {
                ops.push(Op { id: id.clone(), stamp, set: None, delete: true });
            }
        }
        Update { ops, snapshot: self.snapshot_generation }
    }

    // -------------------------------------------------------------------------
    // MERGE
    // -------------------------------------------------------------------------

    fn merge(&mut self, ops: &[Op], snapshot: Option<u64>, origin: Origin) -> ChangeSet {
        // PHASE: SNAPSHOT GENERATION
        let incoming = ops
            .iter()
            .filter_map(|op| op.stamp.seed_generation())
            .chain(snapshot)
            .max();
        let superseded = match (incoming, self.snapshot_generation) {
            (Some(new), Some(old)) if new > old => Some(new),
            (Some(new), None) => Some(new),
            _ => None,
        };
        let stale_ids: Vec<ElementId> = match superseded {
            Some(generation) => self
                .entries
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .fields
                        .values()
                        .any(|reg| reg.stamp.seed_generation().is_some_and(|g| g < generation))
                })
                .map(|(id, _)| id.clone())
                .collect(),
            None => Vec::new(),
        };

        // PHASE: CAPTURE BEFORE-IMAGES
        // WHY: a change is reported only if the visible value differs after
        // the whole transaction, not per op.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut before: Vec<(ElementId, Option<Element>)> = Vec::new();
        for id in stale_ids.iter().chain(ops.iter().map(|op| &op.id)) {
            if seen.insert(id.as_str()) {
                before.push((id.clone(), self.get(id)));
            }
        }

        if let Some(generation) = superseded {
            for id in &stale_ids {
                let vacant = self
                    .entries
                    .get_mut(id)
                    .is_some_and(|entry| entry.purge_seeds_before(generation) && entry.is_vacant());
                if vacant {
                    self.entries.remove(id);
                }
            }
            self.snapshot_generation = Some(generation);
        }

        for op in ops {
            if op.stamp.clock > MAX_CLOCK {
                warn!(id = %op.id, clock = op.stamp.clock, "doc: dropping op with out-of-range clock");
                continue;
            }
            let stale_seed = op
                .stamp
                .seed_generation()
                .zip(self.snapshot_generation)
                .is_some_and(|(g, current)| g < current);
            if stale_seed {
                continue;
            }
            self.merge_op(op);
        }

        let changes: Vec<Change> = before
            .into_iter()
            .filter_map(|(id, old)| match (old, self.get(&id)) {
                (old, Some(new)) if old.as_ref() != Some(&new) => Some(Change::Upserted(new)),
                (Some(_), None) => Some(Change::Removed(id)),
                _ => None,
            })
            .collect();

        let change_set = ChangeSet { origin, changes };
        if !change_set.is_empty() {
            for (_, listener) in &self.listeners {
                listener(&change_set);
            }
        }
        change_set
    }

    fn merge_op(&mut self, op: &Op) {
        self.clock = self.clock.max(op.stamp.clock);

        let entry = self.entries.entry(op.id.clone()).or_insert_with(|| Entry {
            fields: BTreeMap::new(),
            tombstone: None,
            first_seen: op.stamp,
        });
        entry.first_seen = entry.first_seen.min(op.stamp);

        if op.delete {
            entry.tombstone = Some(entry.tombstone.map_or(op.stamp, |t| t.min(op.stamp)));
        }

        let Some(set) = &op.set else {
            return;
        };
        for (name, value) in set {
            if name == "id" {
                continue;
            }
            match entry.fields.get_mut(name) {
                Some(reg) if reg.stamp >= op.stamp => {}
                Some(reg) => {
                    reg.value = value.clone();
                    reg.stamp = op.stamp;
                }
                None => {
                    entry
                        .fields
                        .insert(name.clone(), Register { value: value.clone(), stamp: op.stamp });
                }
            }
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("peer", &self.peer)
            .field("clock", &self.clock)
            .field("entries", &self.entries.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "doc_test.rs"]
mod tests;
