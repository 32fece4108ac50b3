//! Sync binding between the local editor state and the shared document.
//!
//! The binding is the only owner of the live [`Mapping`]. Local editor
//! transactions are translated into shared-document mutations inside one
//! transaction tagged with [`SYNC_ORIGIN`]; changes made by anyone else
//! (remote peers, the undo coordinator) are picked up by an update observer
//! and folded back into the local state on the next [`SyncBinding::reconcile`].

use crate::editor::{EditorState, Node, Selection, Step, Transaction};
use crate::error::Result;
use crate::mapping::Mapping;
use crate::position::{to_absolute, to_relative};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use weft_doc::{Doc, ItemId, ParentRef, RelativePosition, SubscriptionId};

/// Origin of shared transactions produced from local editor transactions.
pub const SYNC_ORIGIN: &str = "sync";

/// Origin of local transactions that opted out of the undo history.
pub const SYNC_NO_HISTORY_ORIGIN: &str = "sync:no-history";

const EVENT_CAPACITY: usize = 64;

/// Notifications emitted after reconciliation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindingEvent {
    /// The local state was rebuilt from the shared document.
    Reconciled { remote: bool },
    /// A remote change arrived; stored annotation ranges must be re-resolved.
    AnnotationsStale,
}

/// Read handle to the binding's current mapping.
///
/// Readers must call [`MappingHandle::get`] for every operation; the mapping
/// is swapped on each structural change.
#[derive(Clone, Default)]
pub struct MappingHandle(Arc<RwLock<Option<Arc<Mapping>>>>);

impl MappingHandle {
    pub fn get(&self) -> Option<Arc<Mapping>> {
        self.0.read().clone()
    }

    pub(crate) fn set(&self, mapping: Mapping) {
        *self.0.write() = Some(Arc::new(mapping));
    }

    pub(crate) fn clear(&self) {
        *self.0.write() = None;
    }
}

#[derive(Debug, Default)]
struct Dirty {
    remote: bool,
    structure: bool,
}

fn is_sync_origin(origin: &str) -> bool {
    origin == SYNC_ORIGIN || origin == SYNC_NO_HISTORY_ORIGIN
}

/// Binds one root fragment of a shared document to a local editor state.
pub struct SyncBinding {
    doc: Arc<RwLock<Doc>>,
    fragment: String,
    mapping: MappingHandle,
    state: EditorState,
    selection: Option<(RelativePosition, RelativePosition)>,
    dirty: Arc<Mutex<Dirty>>,
    subscription: Option<SubscriptionId>,
    events: broadcast::Sender<BindingEvent>,
}

impl SyncBinding {
    /// Attach to `fragment` of `doc` and render its current content.
    pub fn new(doc: Arc<RwLock<Doc>>, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        let dirty = Arc::new(Mutex::new(Dirty::default()));

        let flags = dirty.clone();
        let subscription = doc.write().observe_update(move |event| {
            let mut flags = flags.lock();
            if !event.local {
                flags.remote = true;
            }
            let structural = !event.summary.inserted.is_empty() || !event.summary.deleted.is_empty();
            if structural && !is_sync_origin(event.origin.as_str()) {
                flags.structure = true;
            }
        });

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut binding = Self {
            doc,
            fragment,
            mapping: MappingHandle::default(),
            state: EditorState::new(Node::doc(vec![])),
            selection: None,
            dirty,
            subscription: Some(subscription),
            events,
        };
        binding.rebuild();
        debug!(fragment = %binding.fragment, size = binding.state.doc.content_size(), "sync binding attached");
        binding
    }

    pub fn doc(&self) -> Arc<RwLock<Doc>> {
        self.doc.clone()
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    /// The reconciled local state.
    pub fn state(&self) -> &EditorState {
        &self.state
    }

    /// The current mapping.
    pub fn mapping(&self) -> Option<Arc<Mapping>> {
        self.mapping.get()
    }

    pub fn mapping_handle(&self) -> MappingHandle {
        self.mapping.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BindingEvent> {
        self.events.subscribe()
    }

    /// Whether shared changes are waiting to be reconciled.
    pub fn is_dirty(&self) -> bool {
        let dirty = self.dirty.lock();
        dirty.remote || dirty.structure
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    /// Move the local selection without touching the document.
    pub fn set_selection(&mut self, selection: Selection) -> Result<()> {
        let next = self
            .state
            .apply(&Transaction::new().set_selection(selection))?;
        self.state = next;
        self.remember_selection();
        Ok(())
    }

    /// Apply a local editor transaction.
    ///
    /// Echoes of shared changes (transactions whose origin is the sync
    /// origin) only trigger a rebuild; everything else is validated against
    /// the local state and written to the shared document atomically.
    pub fn apply_local(&mut self, tr: &Transaction) -> Result<()> {
        if tr.meta.origin.as_deref().is_some_and(is_sync_origin) {
            trace!("sync echo, rebuilding from shared state");
            self.dirty.lock().structure = true;
            self.reconcile();
            if let Some(selection) = tr.selection {
                self.set_selection(selection)?;
            }
            return Ok(());
        }

        let next = self.state.apply(tr)?;
        if tr.doc_changed() {
            let origin = if tr.meta.add_to_history {
                SYNC_ORIGIN
            } else {
                SYNC_NO_HISTORY_ORIGIN
            };
            let fragment = self.fragment.as_str();
            let written = self
                .doc
                .write()
                .transact(origin, |txn| Ok(write_transaction(txn, fragment, tr)))?;
            written?;
            self.rebuild();
            trace!(steps = tr.steps.len(), origin, "local transaction written to shared document");
        }

        let size = self.state.doc.content_size();
        self.state.selection = Selection::new(next.selection.anchor.min(size), next.selection.head.min(size));
        self.remember_selection();
        let _ = self.events.send(BindingEvent::Reconciled { remote: false });
        Ok(())
    }

    /// Fold pending shared changes into the local state.
    ///
    /// Returns `false` when nothing changed since the last call.
    pub fn reconcile(&mut self) -> bool {
        let dirty = std::mem::take(&mut *self.dirty.lock());
        if !dirty.remote && !dirty.structure {
            return false;
        }
        if dirty.structure {
            self.rebuild();
        }
        debug!(remote = dirty.remote, rebuilt = dirty.structure, "reconciled shared changes");
        let _ = self.events.send(BindingEvent::Reconciled {
            remote: dirty.remote,
        });
        if dirty.remote {
            let _ = self.events.send(BindingEvent::AnnotationsStale);
        }
        true
    }

    /// Detach from the shared document. Safe to call twice.
    pub fn destroy(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.doc.write().unobserve_update(subscription);
            self.mapping.clear();
            debug!(fragment = %self.fragment, "sync binding detached");
        }
    }

    /// Re-render from the shared document and restore the selection.
    fn rebuild(&mut self) {
        let doc = self.doc.read();
        let (node, mapping) = Mapping::build(&doc, &self.fragment);
        let size = mapping.size();

        let previous = self.state.selection;
        let restore = |rel: &RelativePosition, fallback: usize| {
            to_absolute(&doc, rel, &mapping).unwrap_or(fallback.min(size))
        };
        let selection = match &self.selection {
            Some((anchor, head)) => Selection::new(
                restore(anchor, previous.anchor),
                restore(head, previous.head),
            ),
            None => Selection::new(previous.anchor.min(size), previous.head.min(size)),
        };
        drop(doc);

        self.state = EditorState {
            doc: node,
            selection,
        };
        self.mapping.set(mapping);
        self.remember_selection();
    }

    fn remember_selection(&mut self) {
        let Some(mapping) = self.mapping.get() else {
            return;
        };
        let selection = self.state.selection;
        self.selection = to_relative(selection.anchor, &mapping)
            .and_then(|anchor| Ok((anchor, to_relative(selection.head, &mapping)?)))
            .ok();
    }
}

impl Drop for SyncBinding {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn write_transaction(txn: &mut weft_doc::Transaction<'_>, fragment: &str, tr: &Transaction) -> Result<()> {
    if let Some(replacement) = &tr.replaced_doc {
        replace_content(txn, fragment, replacement)?;
    }
    for step in &tr.steps {
        // Positions of later steps refer to the document after earlier ones
        let (_, mapping) = Mapping::build(txn.doc(), fragment);
        write_step(txn, &mapping, step)?;
    }
    Ok(())
}

/// Translate one local step into shared mutations.
fn write_step(txn: &mut weft_doc::Transaction<'_>, mapping: &Mapping, step: &Step) -> Result<()> {
    match step {
        Step::InsertText { pos, text } => {
            let (parent, left) = mapping.resolve_insert(*pos)?;
            txn.insert_text(&parent, left, text)?;
        }
        Step::InsertNode { pos, node } => {
            let (parent, left) = mapping.resolve_insert(*pos)?;
            write_node(txn, &parent, left, node)?;
        }
        Step::Delete { from, to } => {
            for id in mapping.items_in_range(*from, *to) {
                txn.delete(&id)?;
            }
        }
    }
    Ok(())
}

/// Insert a local node after `left`, returning the last item written.
fn write_node(
    txn: &mut weft_doc::Transaction<'_>,
    parent: &ParentRef,
    left: Option<ItemId>,
    node: &Node,
) -> Result<Option<ItemId>> {
    match node {
        Node::Text(text) => {
            let ids = txn.insert_text(parent, left, text)?;
            Ok(ids.last().copied().or(left))
        }
        Node::Element {
            kind,
            attrs,
            children,
        } => {
            let id = txn.insert_element(parent, left, kind.as_str(), attrs.clone())?;
            let inner = ParentRef::Item(id);
            let mut last = None;
            for child in children {
                last = write_node(txn, &inner, last, child)?;
            }
            Ok(Some(id))
        }
    }
}

/// Replace the whole fragment content with the children of `doc`.
fn replace_content(txn: &mut weft_doc::Transaction<'_>, fragment: &str, doc: &Node) -> Result<()> {
    let root = ParentRef::root(fragment);
    for id in txn.doc().visible_children(&root) {
        txn.delete(&id)?;
    }
    let mut last = txn.doc().children(&root).last().copied();
    for child in doc.children() {
        last = write_node(txn, &root, last, child)?;
    }
    Ok(())
}
