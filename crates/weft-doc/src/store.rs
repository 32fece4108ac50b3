//! Sequence tree - nested RGA sequences of characters and elements.
//!
//! Every container (a named root fragment or an element item) holds an
//! ordered list of children. Ordering follows the Replicated Growable Array
//! algorithm: each item remembers the sibling it was inserted after (its
//! origin), and items sharing an origin are ordered by descending id so
//! concurrent inserts at the same spot resolve the same way everywhere.
//!
//! Deleted items stay in the tree as tombstones so that later inserts and
//! relative positions can still refer to them.

use crate::error::{DocError, Result};
use crate::id::{ItemId, ParentRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// What an item holds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Content {
    /// A single character of text.
    Char(char),
    /// A structural node that can hold children.
    Element {
        name: String,
        attrs: BTreeMap<String, serde_json::Value>,
    },
}

impl Content {
    pub fn element(name: impl Into<String>) -> Self {
        Content::Element {
            name: name.into(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn is_element(&self) -> bool {
        matches!(self, Content::Element { .. })
    }

    pub fn element_name(&self) -> Option<&str> {
        match self {
            Content::Element { name, .. } => Some(name),
            Content::Char(_) => None,
        }
    }
}

/// Wire form of an item: everything a replica needs to integrate it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    pub parent: ParentRef,
    /// The sibling this item was inserted after (`None` = head of parent).
    pub origin: Option<ItemId>,
    pub content: Content,
}

/// An item removed by a transaction, as reported to observers.
#[derive(Clone, Debug, PartialEq)]
pub struct DeletedItem {
    pub id: ItemId,
    pub parent: ParentRef,
    pub content: Content,
    /// Number of visible children the item had right before deletion.
    pub content_len: usize,
}

#[derive(Clone, Debug)]
struct Item {
    record: ItemRecord,
    deleted: bool,
}

/// Attachment point for siblings in the RGA tree.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Slot {
    Head(ParentRef),
    After(ItemId),
}

impl Slot {
    fn of(record: &ItemRecord) -> Self {
        match record.origin {
            Some(origin) => Slot::After(origin),
            None => Slot::Head(record.parent.clone()),
        }
    }
}

/// All items of a document, indexed for ordered traversal.
#[derive(Clone, Debug, Default)]
pub(crate) struct ItemStore {
    items: HashMap<ItemId, Item>,
    /// Items hanging off each slot, sorted by descending id.
    slots: HashMap<Slot, Vec<ItemId>>,
}

impl ItemStore {
    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    pub fn record(&self, id: &ItemId) -> Option<&ItemRecord> {
        self.items.get(id).map(|item| &item.record)
    }

    pub fn is_deleted(&self, id: &ItemId) -> Option<bool> {
        self.items.get(id).map(|item| item.deleted)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &ItemRecord> + '_ {
        self.items.values().map(|item| &item.record)
    }

    pub fn deleted_ids(&self) -> impl Iterator<Item = &ItemId> + '_ {
        self.items
            .iter()
            .filter(|(_, item)| item.deleted)
            .map(|(id, _)| id)
    }

    /// Whether the parent and origin of a record are already known.
    pub fn can_integrate(&self, record: &ItemRecord) -> bool {
        let parent_known = match &record.parent {
            ParentRef::Root(_) => true,
            ParentRef::Item(parent) => self.items.contains_key(parent),
        };
        let origin_known = record
            .origin
            .map(|origin| self.items.contains_key(&origin))
            .unwrap_or(true);
        parent_known && origin_known
    }

    /// Check that `parent` can receive a child after `origin`.
    pub fn validate_target(&self, parent: &ParentRef, origin: Option<&ItemId>) -> Result<()> {
        if let ParentRef::Item(parent_id) = parent {
            let parent_item = self
                .items
                .get(parent_id)
                .ok_or(DocError::UnknownItem(*parent_id))?;
            if !parent_item.record.content.is_element() {
                return Err(DocError::NotAContainer(*parent_id));
            }
        }
        if let Some(origin) = origin {
            let origin_item = self
                .items
                .get(origin)
                .ok_or(DocError::UnknownItem(*origin))?;
            if &origin_item.record.parent != parent {
                return Err(DocError::ForeignOrigin { origin: *origin });
            }
        }
        Ok(())
    }

    /// Integrate a record whose dependencies are present.
    ///
    /// Returns `false` when the item was already known. Items landing in a
    /// deleted parent are integrated as tombstones.
    pub fn integrate(&mut self, record: ItemRecord) -> Result<bool> {
        if self.items.contains_key(&record.id) {
            return Ok(false);
        }
        self.validate_target(&record.parent, record.origin.as_ref())?;

        let born_deleted = record
            .parent
            .as_item()
            .and_then(|parent| self.items.get(parent))
            .map(|parent| parent.deleted)
            .unwrap_or(false);

        let id = record.id;
        let siblings = self.slots.entry(Slot::of(&record)).or_default();
        let pos = siblings
            .iter()
            .position(|c| c < &id)
            .unwrap_or(siblings.len());
        siblings.insert(pos, id);

        self.items.insert(
            id,
            Item {
                record,
                deleted: born_deleted,
            },
        );
        Ok(true)
    }

    /// Tombstone an item and, for elements, its whole subtree.
    ///
    /// Newly deleted items are appended to `out` in document order.
    /// Returns `false` when the item was already deleted.
    pub fn delete(&mut self, id: &ItemId, out: &mut Vec<DeletedItem>) -> Result<bool> {
        let item = self.items.get(id).ok_or(DocError::UnknownItem(*id))?;
        if item.deleted {
            return Ok(false);
        }

        let is_element = item.record.content.is_element();
        let as_parent = ParentRef::Item(*id);
        let content_len = if is_element {
            self.content_len(&as_parent)
        } else {
            0
        };

        let record = match self.items.get_mut(id) {
            Some(item) => {
                item.deleted = true;
                item.record.clone()
            }
            None => return Err(DocError::UnknownItem(*id)),
        };
        out.push(DeletedItem {
            id: *id,
            parent: record.parent,
            content: record.content,
            content_len,
        });

        if is_element {
            for child in self.children(&as_parent) {
                self.delete(&child, out)?;
            }
        }
        Ok(true)
    }

    /// All children of a container in order, tombstones included.
    pub fn children(&self, parent: &ParentRef) -> Vec<ItemId> {
        let mut out = Vec::new();
        let mut stack: Vec<ItemId> = Vec::new();

        if let Some(heads) = self.slots.get(&Slot::Head(parent.clone())) {
            stack.extend(heads.iter().rev().copied());
        }

        while let Some(id) = stack.pop() {
            out.push(id);
            // Push followers in reverse so the first one is visited next
            if let Some(followers) = self.slots.get(&Slot::After(id)) {
                stack.extend(followers.iter().rev().copied());
            }
        }
        out
    }

    /// Visible children of a container in order.
    pub fn visible_children(&self, parent: &ParentRef) -> Vec<ItemId> {
        self.children(parent)
            .into_iter()
            .filter(|id| self.items.get(id).map(|i| !i.deleted).unwrap_or(false))
            .collect()
    }

    /// Number of visible children of a container.
    pub fn content_len(&self, parent: &ParentRef) -> usize {
        self.children(parent)
            .iter()
            .filter(|id| self.items.get(id).map(|i| !i.deleted).unwrap_or(false))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ClientId;

    fn record(client: u64, clock: u64, parent: ParentRef, origin: Option<ItemId>, ch: char) -> ItemRecord {
        ItemRecord {
            id: ItemId::new(ClientId(client), clock),
            parent,
            origin,
            content: Content::Char(ch),
        }
    }

    fn text(store: &ItemStore, parent: &ParentRef) -> String {
        store
            .visible_children(parent)
            .iter()
            .filter_map(|id| match store.record(id).map(|r| &r.content) {
                Some(Content::Char(c)) => Some(*c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_sequential_inserts_follow_origins() {
        let root = ParentRef::root("doc");
        let mut store = ItemStore::default();

        let h = record(1, 1, root.clone(), None, 'H');
        let i = record(1, 2, root.clone(), Some(h.id), 'i');
        store.integrate(h).unwrap();
        store.integrate(i).unwrap();

        assert_eq!(text(&store, &root), "Hi");
    }

    #[test]
    fn test_concurrent_siblings_order_by_descending_id() {
        let root = ParentRef::root("doc");
        let mut store = ItemStore::default();

        let a = record(1, 1, root.clone(), None, 'a');
        let b = record(2, 1, root.clone(), None, 'b');
        store.integrate(a).unwrap();
        store.integrate(b).unwrap();

        // Client 2 wins the tie and comes first
        assert_eq!(text(&store, &root), "ba");
    }

    #[test]
    fn test_delete_element_tombstones_subtree() {
        let root = ParentRef::root("doc");
        let mut store = ItemStore::default();

        let para = ItemRecord {
            id: ItemId::new(ClientId(1), 1),
            parent: root.clone(),
            origin: None,
            content: Content::element("paragraph"),
        };
        let para_ref = ParentRef::Item(para.id);
        store.integrate(para.clone()).unwrap();
        store
            .integrate(record(1, 2, para_ref.clone(), None, 'x'))
            .unwrap();

        let mut out = Vec::new();
        assert!(store.delete(&para.id, &mut out).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content_len, 1);
        assert!(store.visible_children(&root).is_empty());

        // Late arrivals into the deleted element are born deleted
        store
            .integrate(record(2, 3, para_ref.clone(), None, 'y'))
            .unwrap();
        assert_eq!(store.is_deleted(&ItemId::new(ClientId(2), 3)), Some(true));
    }

    #[test]
    fn test_foreign_origin_is_rejected() {
        let root = ParentRef::root("doc");
        let other = ParentRef::root("other");
        let mut store = ItemStore::default();

        let a = record(1, 1, root, None, 'a');
        let a_id = a.id;
        store.integrate(a).unwrap();

        let stray = record(1, 2, other, Some(a_id), 'b');
        assert_eq!(
            store.integrate(stray),
            Err(DocError::ForeignOrigin { origin: a_id })
        );
    }
}
