//! Relative positions - positions anchored to item identity.
//!
//! A numeric index into a container shifts whenever something is inserted or
//! deleted before it. A [`RelativePosition`] instead names a neighbouring
//! item, so it keeps pointing at the same spot while peers edit around it.

use crate::doc::Doc;
use crate::id::{ItemId, ParentRef};
use serde::{Deserialize, Serialize};

/// Which neighbour a relative position sticks to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Assoc {
    /// Stick to the item on the right: the position is just before `item`.
    #[default]
    After,
    /// Stick to the item on the left: the position is just after `item`.
    Before,
}

/// A position inside a container that survives concurrent edits.
///
/// With [`Assoc::After`], `item: None` denotes the end of `parent`. With
/// [`Assoc::Before`], `item: None` denotes its start.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelativePosition {
    pub parent: ParentRef,
    pub item: Option<ItemId>,
    #[serde(default)]
    pub assoc: Assoc,
}

impl RelativePosition {
    /// Position just before `item` in `parent`.
    pub fn before(parent: ParentRef, item: ItemId) -> Self {
        Self {
            parent,
            item: Some(item),
            assoc: Assoc::After,
        }
    }

    /// Position at the end of `parent`.
    pub fn end_of(parent: ParentRef) -> Self {
        Self {
            parent,
            item: None,
            assoc: Assoc::After,
        }
    }
}

/// A relative position resolved against the current document state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAnchor {
    pub parent: ParentRef,
    /// Index among the visible children of `parent`.
    pub index: usize,
}

impl Doc {
    /// Build a relative position for a visible index of `parent`.
    ///
    /// Indexes past the end clamp to the end. Returns `None` if `parent` is
    /// not a live container.
    pub fn relative_from_index(
        &self,
        parent: &ParentRef,
        index: usize,
        assoc: Assoc,
    ) -> Option<RelativePosition> {
        if !self.is_live_container(parent) {
            return None;
        }
        let visible = self.visible_children(parent);
        let item = match assoc {
            Assoc::After => visible.get(index).copied(),
            Assoc::Before if index == 0 => None,
            Assoc::Before => visible.get(index - 1).or(visible.last()).copied(),
        };
        Some(RelativePosition {
            parent: parent.clone(),
            item,
            assoc,
        })
    }

    /// Resolve a relative position to a visible index.
    ///
    /// Returns `None` when the container (or any of its ancestors) has been
    /// deleted, or when the anchor item is unknown to this replica. An anchor
    /// item that was itself deleted resolves to where it used to be.
    pub fn resolve_relative(&self, rel: &RelativePosition) -> Option<ResolvedAnchor> {
        if !self.container_reachable(&rel.parent) {
            return None;
        }

        let index = match rel.item {
            None => match rel.assoc {
                Assoc::After => self.content_len(&rel.parent),
                Assoc::Before => 0,
            },
            Some(id) => {
                let record = self.item(&id)?;
                if record.parent != rel.parent {
                    return None;
                }
                let mut before = 0;
                for child in self.children(&rel.parent) {
                    if child == id {
                        break;
                    }
                    if self.is_visible(&child) {
                        before += 1;
                    }
                }
                match rel.assoc {
                    Assoc::After => before,
                    Assoc::Before if self.is_visible(&id) => before + 1,
                    Assoc::Before => before,
                }
            }
        };

        Some(ResolvedAnchor {
            parent: rel.parent.clone(),
            index,
        })
    }

    /// Whether a container and all of its ancestors are alive.
    fn container_reachable(&self, parent: &ParentRef) -> bool {
        let mut current = parent.clone();
        loop {
            match current {
                ParentRef::Root(_) => return true,
                ParentRef::Item(id) => {
                    if !self.is_live_container(&ParentRef::Item(id)) {
                        return false;
                    }
                    match self.item(&id) {
                        Some(record) => current = record.parent.clone(),
                        None => return false,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ClientId;
    use std::collections::BTreeMap;

    fn setup(text: &str) -> (Doc, ItemId) {
        let mut doc = Doc::new(ClientId(1));
        let para = doc
            .transact("test", |txn| {
                let para =
                    txn.insert_element(&ParentRef::root("prosemirror"), None, "paragraph", BTreeMap::new())?;
                txn.insert_text(&ParentRef::Item(para), None, text)?;
                Ok(para)
            })
            .unwrap();
        (doc, para)
    }

    #[test]
    fn test_round_trip_every_index() {
        let (doc, para) = setup("abcd");
        let parent = ParentRef::Item(para);
        for index in 0..=4 {
            for assoc in [Assoc::After, Assoc::Before] {
                let rel = doc.relative_from_index(&parent, index, assoc).unwrap();
                assert_eq!(doc.resolve_relative(&rel).unwrap().index, index);
            }
        }
    }

    #[test]
    fn test_survives_insert_before() {
        let (mut doc, para) = setup("world");
        let parent = ParentRef::Item(para);
        let rel = doc.relative_from_index(&parent, 2, Assoc::After).unwrap();

        doc.transact("test", |txn| txn.insert_text(&parent, None, "hi "))
            .unwrap();

        assert_eq!(doc.resolve_relative(&rel).unwrap().index, 5);
    }

    #[test]
    fn test_deleted_item_resolves_in_place() {
        let (mut doc, para) = setup("abc");
        let parent = ParentRef::Item(para);
        let rel = doc.relative_from_index(&parent, 1, Assoc::After).unwrap();

        let b = rel.item.unwrap();
        doc.transact("test", |txn| txn.delete(&b)).unwrap();

        assert_eq!(doc.resolve_relative(&rel).unwrap().index, 1);
    }

    #[test]
    fn test_deleted_container_is_unresolvable() {
        let (mut doc, para) = setup("abc");
        let rel = doc
            .relative_from_index(&ParentRef::Item(para), 1, Assoc::After)
            .unwrap();

        doc.transact("test", |txn| txn.delete(&para)).unwrap();

        assert_eq!(doc.resolve_relative(&rel), None);
    }

    #[test]
    fn test_unknown_item_is_unresolvable() {
        let (doc, para) = setup("abc");
        let rel = RelativePosition::before(ParentRef::Item(para), ItemId::new(ClientId(7), 99));
        assert_eq!(doc.resolve_relative(&rel), None);
    }
}
