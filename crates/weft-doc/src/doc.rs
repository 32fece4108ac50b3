//! The shared document: named fragments, named maps, transactions and
//! update observers.

use crate::error::{DocError, Result};
use crate::id::{ClientId, ItemId, ParentRef};
use crate::map::{LwwMap, MapWrite, Stamp};
use crate::store::{Content, DeletedItem, ItemRecord, ItemStore};
use crate::update::{StateVector, Update};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Tag attached to a transaction naming the actor that produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin(String);

impl Origin {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The empty origin, used when nobody claims a change.
    pub fn none() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Origin {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

impl From<String> for Origin {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// What a committed transaction (local or remote) changed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionSummary {
    /// Items integrated by the transaction, in creation order.
    pub inserted: Vec<ItemId>,
    /// Items deleted by the transaction, in document order per deletion.
    pub deleted: Vec<DeletedItem>,
    /// Names of maps with at least one winning write.
    pub maps_changed: BTreeSet<String>,
}

impl TransactionSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.maps_changed.is_empty()
    }
}

/// Notification delivered to update observers after every commit.
pub struct UpdateEvent<'a> {
    pub update: &'a Update,
    pub origin: &'a Origin,
    /// `true` when the change was made on this replica.
    pub local: bool,
    pub summary: &'a TransactionSummary,
}

/// Handle returned by [`Doc::observe_update`].
pub type SubscriptionId = u64;

/// Callback invoked after each commit. Observers must not try to lock the
/// document they observe; they run while it is being mutated.
pub type UpdateObserver = Arc<dyn Fn(&UpdateEvent<'_>) + Send + Sync>;

/// A replica of a shared document.
pub struct Doc {
    client_id: ClientId,
    /// Lamport clock shared by item ids and map stamps.
    clock: u64,
    store: ItemStore,
    maps: HashMap<String, LwwMap>,
    /// Remote items waiting for their parent or origin.
    pending_items: Vec<ItemRecord>,
    /// Remote deletes of items not received yet.
    pending_deletes: BTreeSet<ItemId>,
    observers: Vec<(SubscriptionId, UpdateObserver)>,
    next_subscription: SubscriptionId,
    destroyed: bool,
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doc")
            .field("client_id", &self.client_id)
            .field("clock", &self.clock)
            .field("items", &self.store.len())
            .field("maps", &self.maps.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Doc {
    /// Create an empty document for the given replica.
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            clock: 0,
            store: ItemStore::default(),
            maps: HashMap::new(),
            pending_items: Vec::new(),
            pending_deletes: BTreeSet::new(),
            observers: Vec::new(),
            next_subscription: 1,
            destroyed: false,
        }
    }

    /// Create an empty document with a random replica id.
    pub fn with_random_client() -> Self {
        Self::new(ClientId::random())
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Release observers and refuse further mutation. Safe to call twice.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        debug!(client = %self.client_id, "destroying document");
        self.destroyed = true;
        self.observers.clear();
        self.pending_items.clear();
        self.pending_deletes.clear();
    }

    // === Observers ===

    /// Register a callback fired after every committed change.
    pub fn observe_update<F>(&mut self, observer: F) -> SubscriptionId
    where
        F: Fn(&UpdateEvent<'_>) + Send + Sync + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.observers.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unobserve_update(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _)| *sub != id);
        before != self.observers.len()
    }

    fn emit(&self, event: &UpdateEvent<'_>) {
        for (_, observer) in &self.observers {
            observer(event);
        }
    }

    // === Transactions ===

    /// Run `f` as one atomic transaction tagged with `origin`.
    ///
    /// Observers see a single event for everything `f` changed. Changes made
    /// before `f` returns an error are kept and still emitted so that every
    /// replica receives the same history.
    pub fn transact<R, F>(&mut self, origin: impl Into<Origin>, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R>,
    {
        if self.destroyed {
            return Err(DocError::Destroyed);
        }

        let mut txn = Transaction {
            doc: self,
            origin: origin.into(),
            update: Update::new(),
            summary: TransactionSummary::default(),
        };
        let result = f(&mut txn);
        let Transaction {
            origin,
            update,
            summary,
            ..
        } = txn;

        if !update.is_empty() {
            trace!(
                origin = %origin,
                inserted = summary.inserted.len(),
                deleted = summary.deleted.len(),
                "committing local transaction"
            );
            self.emit(&UpdateEvent {
                update: &update,
                origin: &origin,
                local: true,
                summary: &summary,
            });
        }
        result
    }

    /// Integrate an update produced by another replica.
    ///
    /// Applying the same update twice is a no-op.
    pub fn apply_update(&mut self, update: &Update, origin: impl Into<Origin>) -> Result<()> {
        if self.destroyed {
            return Err(DocError::Destroyed);
        }
        let origin = origin.into();
        let mut applied = Update::new();
        let mut summary = TransactionSummary::default();

        self.pending_items.extend(update.items.iter().cloned());
        self.integrate_pending(&mut applied, &mut summary);

        self.pending_deletes.extend(update.deletes.iter().copied());
        self.apply_pending_deletes(&mut applied, &mut summary)?;

        for write in &update.map_writes {
            self.observe_clock(write.stamp.clock);
            let map = self.maps.entry(write.map.clone()).or_default();
            if map.apply(&write.key, write.value.clone(), write.stamp) {
                summary.maps_changed.insert(write.map.clone());
                applied.map_writes.push(write.clone());
            }
        }

        if !applied.is_empty() {
            debug!(
                origin = %origin,
                items = applied.items.len(),
                deletes = applied.deletes.len(),
                map_writes = applied.map_writes.len(),
                pending = self.pending_items.len(),
                "applied remote update"
            );
            self.emit(&UpdateEvent {
                update: &applied,
                origin: &origin,
                local: false,
                summary: &summary,
            });
        }
        Ok(())
    }

    fn integrate_pending(&mut self, applied: &mut Update, summary: &mut TransactionSummary) {
        let mut pending = std::mem::take(&mut self.pending_items);
        pending.sort_by_key(|record| record.id);

        loop {
            let mut progressed = false;
            let mut waiting = Vec::new();

            for record in pending {
                if self.store.contains(&record.id) {
                    continue;
                }
                if !self.store.can_integrate(&record) {
                    waiting.push(record);
                    continue;
                }
                let id = record.id;
                match self.store.integrate(record.clone()) {
                    Ok(true) => {
                        self.observe_clock(id.clock);
                        summary.inserted.push(id);
                        applied.items.push(record);
                        progressed = true;
                    }
                    Ok(false) => {}
                    Err(err) => warn!(item = %id, error = %err, "dropping malformed remote item"),
                }
            }

            pending = waiting;
            if !progressed || pending.is_empty() {
                break;
            }
        }

        self.pending_items = pending;
    }

    fn apply_pending_deletes(
        &mut self,
        applied: &mut Update,
        summary: &mut TransactionSummary,
    ) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_deletes);
        for id in pending {
            if !self.store.contains(&id) {
                self.pending_deletes.insert(id);
                continue;
            }
            let first = summary.deleted.len();
            if self.store.delete(&id, &mut summary.deleted)? {
                for deleted in &summary.deleted[first..] {
                    applied.deletes.insert(deleted.id);
                }
            }
        }
        Ok(())
    }

    fn observe_clock(&mut self, clock: u64) {
        self.clock = self.clock.max(clock);
    }

    fn next_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    // === State transfer ===

    /// Highest known clock per client.
    ///
    /// A client's entry stays below its lowest item still waiting for
    /// dependencies, so peers keep resending everything from there on.
    pub fn state_vector(&self) -> StateVector {
        let mut sv = StateVector::new();
        for record in self.store.records() {
            sv.observe(&record.id);
        }
        for record in &self.pending_items {
            sv.exclude(&record.id);
        }
        sv
    }

    /// Everything a replica at `remote` is missing.
    ///
    /// Items still waiting for dependencies are forwarded as well. Deletes
    /// and map registers are sent in full; both apply idempotently.
    pub fn diff_update(&self, remote: &StateVector) -> Update {
        let mut items: Vec<ItemRecord> = self
            .store
            .records()
            .chain(self.pending_items.iter())
            .filter(|record| !remote.covers(&record.id))
            .cloned()
            .collect();
        items.sort_by_key(|record| record.id);
        items.dedup_by_key(|record| record.id);

        let mut map_names: Vec<&String> = self.maps.keys().collect();
        map_names.sort();
        let map_writes: Vec<MapWrite> = map_names
            .into_iter()
            .flat_map(|name| self.maps[name].writes(name))
            .collect();

        Update {
            items,
            deletes: self
                .store
                .deleted_ids()
                .chain(self.pending_deletes.iter())
                .copied()
                .collect(),
            map_writes,
        }
    }

    /// The full state as an update.
    pub fn encode_state(&self) -> Update {
        self.diff_update(&StateVector::new())
    }

    /// Number of remote items and deletes still waiting for dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending_items.len() + self.pending_deletes.len()
    }

    // === Reads ===

    /// Look up an item, deleted or not.
    pub fn item(&self, id: &ItemId) -> Option<&ItemRecord> {
        self.store.record(id)
    }

    /// Whether an item exists and has not been deleted.
    pub fn is_visible(&self, id: &ItemId) -> bool {
        self.store.is_deleted(id) == Some(false)
    }

    /// Whether an item exists and has been deleted.
    pub fn is_deleted(&self, id: &ItemId) -> bool {
        self.store.is_deleted(id) == Some(true)
    }

    /// Whether a container can currently hold visible content.
    pub fn is_live_container(&self, parent: &ParentRef) -> bool {
        match parent {
            ParentRef::Root(_) => true,
            ParentRef::Item(id) => {
                self.is_visible(id)
                    && self
                        .item(id)
                        .map(|record| record.content.is_element())
                        .unwrap_or(false)
            }
        }
    }

    /// All children of a container in order, tombstones included.
    pub fn children(&self, parent: &ParentRef) -> Vec<ItemId> {
        self.store.children(parent)
    }

    /// Visible children of a container in order.
    pub fn visible_children(&self, parent: &ParentRef) -> Vec<ItemId> {
        self.store.visible_children(parent)
    }

    /// Number of visible children of a container.
    pub fn content_len(&self, parent: &ParentRef) -> usize {
        self.store.content_len(parent)
    }

    /// Read a named map, if anything was ever written to it.
    pub fn map(&self, name: &str) -> Option<&LwwMap> {
        self.maps.get(name)
    }

    /// Render a root fragment as XML-like text (elements as tags).
    pub fn to_xml_string(&self, root: &str) -> String {
        let mut out = String::new();
        self.write_xml(&ParentRef::root(root), &mut out);
        out
    }

    fn write_xml(&self, parent: &ParentRef, out: &mut String) {
        for id in self.visible_children(parent) {
            match self.item(&id).map(|record| &record.content) {
                Some(Content::Char(c)) => out.push(*c),
                Some(Content::Element { name, .. }) => {
                    out.push('<');
                    out.push_str(name);
                    out.push('>');
                    self.write_xml(&ParentRef::Item(id), out);
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
                None => {}
            }
        }
    }
}

/// An open transaction on a [`Doc`].
pub struct Transaction<'doc> {
    doc: &'doc mut Doc,
    origin: Origin,
    update: Update,
    summary: TransactionSummary,
}

impl<'doc> Transaction<'doc> {
    /// Read access to the document mid-transaction.
    pub fn doc(&self) -> &Doc {
        self.doc
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// What this transaction changed so far.
    pub fn summary(&self) -> &TransactionSummary {
        &self.summary
    }

    /// Insert one item into `parent` right after `left` (`None` = at the head).
    pub fn insert(
        &mut self,
        parent: &ParentRef,
        left: Option<ItemId>,
        content: Content,
    ) -> Result<ItemId> {
        self.doc.store.validate_target(parent, left.as_ref())?;
        if let ParentRef::Item(parent_id) = parent {
            if self.doc.is_deleted(parent_id) {
                return Err(DocError::ParentDeleted(*parent_id));
            }
        }

        let id = ItemId::new(self.doc.client_id, self.doc.next_clock());
        let record = ItemRecord {
            id,
            parent: parent.clone(),
            origin: left,
            content,
        };
        self.doc.store.integrate(record.clone())?;
        self.update.items.push(record);
        self.summary.inserted.push(id);
        Ok(id)
    }

    /// Insert characters after `left`, returning their ids in order.
    pub fn insert_text(
        &mut self,
        parent: &ParentRef,
        left: Option<ItemId>,
        text: &str,
    ) -> Result<Vec<ItemId>> {
        let mut origin = left;
        let mut ids = Vec::with_capacity(text.len());
        for ch in text.chars() {
            let id = self.insert(parent, origin, Content::Char(ch))?;
            ids.push(id);
            origin = Some(id);
        }
        Ok(ids)
    }

    /// Insert an empty element after `left`.
    pub fn insert_element(
        &mut self,
        parent: &ParentRef,
        left: Option<ItemId>,
        name: impl Into<String>,
        attrs: BTreeMap<String, Value>,
    ) -> Result<ItemId> {
        self.insert(
            parent,
            left,
            Content::Element {
                name: name.into(),
                attrs,
            },
        )
    }

    /// Delete an item (and its subtree). Returns `false` if already deleted.
    pub fn delete(&mut self, id: &ItemId) -> Result<bool> {
        let first = self.summary.deleted.len();
        let changed = self.doc.store.delete(id, &mut self.summary.deleted)?;
        for deleted in &self.summary.deleted[first..] {
            self.update.deletes.insert(deleted.id);
        }
        Ok(changed)
    }

    /// Set a key in a named map.
    pub fn map_set(&mut self, map: &str, key: impl Into<String>, value: Value) {
        self.write_map(map, key.into(), Some(value));
    }

    /// Delete a key from a named map. Returns `false` if it was not set.
    pub fn map_delete(&mut self, map: &str, key: &str) -> bool {
        let live = self
            .doc
            .maps
            .get(map)
            .map(|m| m.contains_key(key))
            .unwrap_or(false);
        if live {
            self.write_map(map, key.to_string(), None);
        }
        live
    }

    /// Delete every live key of a named map, returning how many were removed.
    pub fn map_clear(&mut self, map: &str) -> usize {
        let keys = self.doc.maps.get(map).map(|m| m.keys()).unwrap_or_default();
        for key in &keys {
            self.write_map(map, key.clone(), None);
        }
        keys.len()
    }

    fn write_map(&mut self, map: &str, key: String, value: Option<Value>) {
        let stamp = Stamp::new(self.doc.next_clock(), self.doc.client_id);
        self.doc
            .maps
            .entry(map.to_string())
            .or_default()
            .apply(&key, value.clone(), stamp);
        self.summary.maps_changed.insert(map.to_string());
        self.update.map_writes.push(MapWrite {
            map: map.to_string(),
            key,
            value,
            stamp,
        });
    }
}
