//! Undo/Redo coordinator - origin-aware history over the shared document.
//!
//! Only local transactions tagged with a tracked origin are captured; remote
//! updates never touch the stacks. Undoing a step deletes the items it
//! inserted and re-creates copies of the items it deleted right next to
//! their tombstones. The inverse transaction is captured onto the opposite
//! stack, so redo is the same operation run the other way.
//!
//! Deletions of non-empty protected elements (by default paragraphs) are
//! never captured, and undo never deletes a protected element that still
//! has content.

use crate::binding::SYNC_ORIGIN;
use crate::config::CollabOptions;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use weft_doc::{
    Content, DeletedItem, Doc, ItemId, Origin, ParentRef, SubscriptionId, Transaction,
    TransactionSummary,
};

/// Origin of transactions run by the undo coordinator.
pub const UNDO_ORIGIN: &str = "undo";

/// One undoable step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistoryEntry {
    /// Items the step inserted.
    pub inserted: Vec<ItemId>,
    /// Items the step deleted, parents before children.
    pub deleted: Vec<DeletedItem>,
}

impl HistoryEntry {
    fn from_summary(summary: &TransactionSummary, protected: Option<&BTreeSet<String>>) -> Self {
        let deleted = match protected {
            Some(kinds) => filter_protected(&summary.deleted, kinds),
            None => summary.deleted.clone(),
        };
        let mut entry = Self {
            inserted: summary.inserted.clone(),
            deleted,
        };
        entry.cancel_transient();
        entry
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty()
    }

    fn merge(&mut self, other: HistoryEntry) {
        self.inserted.extend(other.inserted);
        self.deleted.extend(other.deleted);
        self.cancel_transient();
    }

    /// Items inserted and deleted within the same step need no restoring.
    fn cancel_transient(&mut self) {
        let inserted: HashSet<ItemId> = self.inserted.iter().copied().collect();
        self.deleted.retain(|d| !inserted.contains(&d.id));
    }
}

/// Drop deleted non-empty protected elements and everything below them.
fn filter_protected(deleted: &[DeletedItem], protected: &BTreeSet<String>) -> Vec<DeletedItem> {
    let mut dropped: HashSet<ItemId> = HashSet::new();
    let mut kept = Vec::with_capacity(deleted.len());
    for item in deleted {
        let under_dropped = item
            .parent
            .as_item()
            .map(|parent| dropped.contains(parent))
            .unwrap_or(false);
        let protected_element = item
            .content
            .element_name()
            .map(|name| protected.contains(name))
            .unwrap_or(false)
            && item.content_len > 0;

        if under_dropped || protected_element {
            dropped.insert(item.id);
        } else {
            kept.push(item.clone());
        }
    }
    kept
}

/// Undo settings derived from the extension options.
#[derive(Clone, Debug, PartialEq)]
pub struct UndoConfig {
    /// Always contains the sync binding's origin.
    pub tracked_origins: BTreeSet<Origin>,
    pub protected_nodes: BTreeSet<String>,
    pub capture_timeout: Duration,
    pub max_history: usize,
}

impl UndoConfig {
    pub fn from_options(options: &CollabOptions) -> Self {
        let mut tracked_origins = options.tracked_origins.clone();
        tracked_origins.insert(Origin::new(SYNC_ORIGIN));
        Self {
            tracked_origins,
            protected_nodes: options.protected_nodes.clone(),
            capture_timeout: options.capture_timeout,
            max_history: options.max_history,
        }
    }
}

impl Default for UndoConfig {
    fn default() -> Self {
        Self::from_options(&CollabOptions::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Capturing,
    Undoing,
    Redoing,
}

#[derive(Debug)]
struct History {
    undo: VecDeque<HistoryEntry>,
    redo: VecDeque<HistoryEntry>,
    mode: Mode,
    last_capture: Option<Instant>,
    /// Set when the next capture must start a new entry.
    boundary: bool,
    /// Tombstone -> the copy that replaced it on undo or redo.
    redone: HashMap<ItemId, ItemId>,
}

impl History {
    fn new() -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            mode: Mode::Capturing,
            last_capture: None,
            boundary: false,
            redone: HashMap::new(),
        }
    }

    fn capture(&mut self, entry: HistoryEntry, config: &UndoConfig) {
        let now = Instant::now();
        let recent = self
            .last_capture
            .map(|last| now.duration_since(last) < config.capture_timeout)
            .unwrap_or(false);

        self.redo.clear();
        match self.undo.back_mut() {
            Some(top) if recent && !self.boundary => top.merge(entry),
            _ => self.undo.push_back(entry),
        }
        while self.undo.len() > config.max_history {
            self.undo.pop_front();
        }
        self.last_capture = Some(now);
        self.boundary = false;
        self.prune_redone();
    }

    /// Keep only copy links reachable from entries still on a stack, each
    /// collapsed to a single hop.
    fn prune_redone(&mut self) {
        if self.redone.is_empty() {
            return;
        }
        let mut kept = HashMap::new();
        for entry in self.undo.iter().chain(self.redo.iter()) {
            let referenced = entry.inserted.iter().copied().chain(
                entry
                    .deleted
                    .iter()
                    .flat_map(|d| std::iter::once(d.id).chain(d.parent.as_item().copied())),
            );
            for id in referenced {
                let live = latest(&self.redone, id);
                if live != id {
                    kept.insert(id, live);
                }
            }
        }
        self.redone = kept;
    }
}

/// Maintains the local undo and redo stacks of one root fragment.
pub struct UndoCoordinator {
    doc: Arc<RwLock<Doc>>,
    fragment: String,
    config: UndoConfig,
    history: Arc<Mutex<History>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl UndoCoordinator {
    /// Start capturing local changes to `fragment`.
    pub fn new(doc: Arc<RwLock<Doc>>, fragment: impl Into<String>, config: UndoConfig) -> Self {
        let history = Arc::new(Mutex::new(History::new()));

        let observed = history.clone();
        let settings = config.clone();
        let subscription = doc.write().observe_update(move |event| {
            if !event.local {
                return;
            }
            let mut history = observed.lock();

            if event.origin.as_str() == UNDO_ORIGIN {
                let entry = HistoryEntry::from_summary(event.summary, None);
                if entry.is_empty() {
                    return;
                }
                let mode = history.mode;
                match mode {
                    Mode::Undoing => history.redo.push_back(entry),
                    Mode::Redoing => history.undo.push_back(entry),
                    Mode::Capturing => {}
                }
                return;
            }

            if !settings.tracked_origins.contains(event.origin) {
                return;
            }
            let entry = HistoryEntry::from_summary(event.summary, Some(&settings.protected_nodes));
            if entry.is_empty() {
                return;
            }
            trace!(
                origin = %event.origin,
                inserted = entry.inserted.len(),
                deleted = entry.deleted.len(),
                "capturing undo step"
            );
            history.capture(entry, &settings);
        });

        Self {
            doc,
            fragment: fragment.into(),
            config,
            history,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    pub fn config(&self) -> &UndoConfig {
        &self.config
    }

    pub fn undo_len(&self) -> usize {
        self.history.lock().undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.history.lock().redo.len()
    }

    pub fn can_undo(&self) -> bool {
        self.undo_len() > 0
    }

    pub fn can_redo(&self) -> bool {
        self.redo_len() > 0
    }

    /// Make the next captured change start a new undo step.
    pub fn stop_capturing(&self) {
        self.history.lock().boundary = true;
    }

    /// Forget both stacks.
    pub fn clear(&self) {
        let mut history = self.history.lock();
        history.undo.clear();
        history.redo.clear();
        history.redone.clear();
    }

    /// Revert the most recent step. Returns `false` if nothing changed.
    pub fn undo(&self) -> bool {
        self.pop(Mode::Undoing)
    }

    /// Re-apply the most recently undone step. Returns `false` if nothing
    /// changed.
    pub fn redo(&self) -> bool {
        self.pop(Mode::Redoing)
    }

    /// Stop observing the document. Safe to call twice.
    pub fn destroy(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            self.doc.write().unobserve_update(subscription);
            debug!(fragment = %self.fragment, "undo coordinator detached");
        }
    }

    /// Pop entries until one of them changes the document.
    fn pop(&self, mode: Mode) -> bool {
        loop {
            // The history lock must not be held while the doc emits events
            let (entry, mut redone) = {
                let mut history = self.history.lock();
                let stack = match mode {
                    Mode::Redoing => &mut history.redo,
                    _ => &mut history.undo,
                };
                let Some(entry) = stack.pop_back() else {
                    return false;
                };
                history.mode = mode;
                (entry, std::mem::take(&mut history.redone))
            };

            let result = self.doc.write().transact(UNDO_ORIGIN, |txn| {
                revert(txn, &self.fragment, &self.config.protected_nodes, &entry, &mut redone)
            });

            let mut history = self.history.lock();
            history.mode = Mode::Capturing;
            history.redone = redone;
            history.boundary = true;
            history.prune_redone();
            drop(history);

            match result {
                Ok(true) => {
                    debug!(?mode, "history step reverted");
                    return true;
                }
                Ok(false) => trace!(?mode, "skipping history step with no remaining effect"),
                Err(err) => {
                    warn!(?mode, error = %err, "failed to revert history step");
                    return false;
                }
            }
        }
    }
}

impl Drop for UndoCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Follow copies made by earlier undo/redo runs to the live version.
fn latest(redone: &HashMap<ItemId, ItemId>, id: ItemId) -> ItemId {
    let mut current = id;
    while let Some(next) = redone.get(&current) {
        current = *next;
    }
    current
}

/// Pre-order index of every item under `fragment`, tombstones included.
fn document_order(doc: &Doc, fragment: &str) -> HashMap<ItemId, usize> {
    let mut order = HashMap::new();
    let mut stack: Vec<ItemId> = doc.children(&ParentRef::root(fragment)).into_iter().rev().collect();
    while let Some(id) = stack.pop() {
        order.insert(id, order.len());
        stack.extend(doc.children(&ParentRef::Item(id)).into_iter().rev());
    }
    order
}

/// Whether an item lives (possibly deep) inside `fragment`.
fn in_scope(doc: &Doc, id: &ItemId, fragment: &str) -> bool {
    let mut current = *id;
    loop {
        match doc.item(&current).map(|record| &record.parent) {
            Some(ParentRef::Root(name)) => return name == fragment,
            Some(ParentRef::Item(parent)) => current = *parent,
            None => return false,
        }
    }
}

fn is_protected(content: &Content, protected: &BTreeSet<String>) -> bool {
    content
        .element_name()
        .map(|name| protected.contains(name))
        .unwrap_or(false)
}

/// Invert one history entry inside `txn`. Returns whether anything changed.
fn revert(
    txn: &mut Transaction<'_>,
    fragment: &str,
    protected: &BTreeSet<String>,
    entry: &HistoryEntry,
    redone: &mut HashMap<ItemId, ItemId>,
) -> weft_doc::Result<bool> {
    let mut changed = false;

    // Restore deletions. Items whose container is not back yet wait for
    // another pass.
    let order = document_order(txn.doc(), fragment);
    let mut pending: Vec<&DeletedItem> = entry
        .deleted
        .iter()
        .filter(|d| order.contains_key(&d.id))
        .collect();
    pending.sort_by_key(|d| order.get(&d.id).copied());
    let mut last_restored: HashMap<ParentRef, ItemId> = HashMap::new();
    loop {
        let before = pending.len();
        let mut waiting = Vec::new();
        for deleted in pending {
            let current = latest(redone, deleted.id);
            if txn.doc().is_visible(&current) {
                continue;
            }
            let parent = match &deleted.parent {
                ParentRef::Item(id) => ParentRef::Item(latest(redone, *id)),
                root => root.clone(),
            };
            if !txn.doc().is_live_container(&parent) {
                waiting.push(deleted);
                continue;
            }

            let tombstone_here = txn
                .doc()
                .item(&current)
                .map(|record| record.parent == parent)
                .unwrap_or(false);
            let left = if tombstone_here {
                Some(current)
            } else {
                last_restored.get(&parent).copied()
            };

            let copy = txn.insert(&parent, left, deleted.content.clone())?;
            redone.insert(current, copy);
            last_restored.insert(parent, copy);
            changed = true;
        }
        pending = waiting;
        if pending.is_empty() || pending.len() == before {
            break;
        }
    }

    // Remove insertions, children first so emptied protected elements go too
    for id in entry.inserted.iter().rev() {
        let current = latest(redone, *id);
        if !txn.doc().is_visible(&current) || !in_scope(txn.doc(), &current, fragment) {
            continue;
        }
        let keep = txn
            .doc()
            .item(&current)
            .map(|record| {
                is_protected(&record.content, protected)
                    && txn.doc().content_len(&ParentRef::Item(current)) > 0
            })
            .unwrap_or(true);
        if keep {
            continue;
        }
        changed |= txn.delete(&current)?;
    }

    Ok(changed)
}
