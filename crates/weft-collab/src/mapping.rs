//! Mapping between local positions and shared-document items.
//!
//! A mapping is built from the visible shared tree in one walk that also
//! renders the local [`Node`] tree, so both always describe the same state.
//! It is only valid until the next structural change of the shared document.

use crate::editor::{Node, DOC_KIND};
use crate::error::{CollabError, Result};
use std::collections::{BTreeMap, HashMap};
use weft_doc::{Content, Doc, ItemId, ParentRef};

/// What sits right after a position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    /// A character, or the opening boundary of an element.
    Item(ItemId),
    /// The closing boundary of an element.
    Close(ItemId),
}

/// Position index of one reconciled document state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Mapping {
    fragment: String,
    tokens: Vec<Token>,
    item_pos: HashMap<ItemId, usize>,
    element_end: HashMap<ItemId, usize>,
    parents: HashMap<ItemId, ParentRef>,
    paths: HashMap<ItemId, Vec<usize>>,
    by_path: HashMap<Vec<usize>, ItemId>,
}

impl Mapping {
    /// Render a root fragment into a local document and index it.
    pub fn build(doc: &Doc, fragment: &str) -> (Node, Mapping) {
        let mut mapping = Mapping {
            fragment: fragment.to_string(),
            ..Default::default()
        };
        let mut path = Vec::new();
        let children = mapping.walk(doc, &ParentRef::root(fragment), &mut path);
        let node = Node::Element {
            kind: DOC_KIND.to_string(),
            attrs: BTreeMap::new(),
            children,
        };
        (node, mapping)
    }

    fn walk(&mut self, doc: &Doc, parent: &ParentRef, path: &mut Vec<usize>) -> Vec<Node> {
        let mut nodes: Vec<Node> = Vec::new();

        for id in doc.visible_children(parent) {
            let Some(record) = doc.item(&id) else {
                continue;
            };
            let pos = self.tokens.len();
            self.tokens.push(Token::Item(id));
            self.item_pos.insert(id, pos);
            self.parents.insert(id, parent.clone());

            match &record.content {
                Content::Char(c) => match nodes.last_mut() {
                    Some(Node::Text(text)) => text.push(*c),
                    _ => nodes.push(Node::Text(c.to_string())),
                },
                Content::Element { name, attrs } => {
                    path.push(nodes.len());
                    self.paths.insert(id, path.clone());
                    self.by_path.insert(path.clone(), id);

                    let children = self.walk(doc, &ParentRef::Item(id), path);
                    self.element_end.insert(id, self.tokens.len());
                    self.tokens.push(Token::Close(id));
                    path.pop();

                    nodes.push(Node::Element {
                        kind: name.clone(),
                        attrs: attrs.clone(),
                        children,
                    });
                }
            }
        }
        nodes
    }

    /// Name of the root fragment this mapping covers.
    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn root(&self) -> ParentRef {
        ParentRef::root(self.fragment.as_str())
    }

    /// Content size of the document.
    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    /// The token right after `pos`, or `None` at the document end.
    pub fn token_at(&self, pos: usize) -> Option<Token> {
        self.tokens.get(pos).copied()
    }

    /// Position right before an item (its opening boundary for elements).
    pub fn position_of(&self, id: &ItemId) -> Option<usize> {
        self.item_pos.get(id).copied()
    }

    /// Position of an element's closing boundary.
    pub fn element_end(&self, id: &ItemId) -> Option<usize> {
        self.element_end.get(id).copied()
    }

    pub fn parent_of(&self, id: &ItemId) -> Option<&ParentRef> {
        self.parents.get(id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.item_pos.contains_key(id)
    }

    /// Position at the end of a container's content.
    pub fn container_end(&self, parent: &ParentRef) -> Option<usize> {
        match parent {
            ParentRef::Root(name) if *name == self.fragment => Some(self.size()),
            ParentRef::Root(_) => None,
            ParentRef::Item(id) => self.element_end(id),
        }
    }

    /// Element item of the local node at `path`.
    pub fn item_at_path(&self, path: &[usize]) -> Option<ItemId> {
        self.by_path.get(path).copied()
    }

    /// Local node path of an element item.
    pub fn path_of(&self, id: &ItemId) -> Option<&[usize]> {
        self.paths.get(id).map(Vec::as_slice)
    }

    /// Container and left sibling for an insertion at `pos`.
    pub fn resolve_insert(&self, pos: usize) -> Result<(ParentRef, Option<ItemId>)> {
        if pos > self.size() {
            return Err(CollabError::OffsetOutOfRange {
                offset: pos,
                size: self.size(),
            });
        }
        if pos == 0 {
            return Ok((self.root(), None));
        }

        match self.tokens[pos - 1] {
            Token::Item(id) if self.element_end.contains_key(&id) => {
                Ok((ParentRef::Item(id), None))
            }
            Token::Item(id) | Token::Close(id) => {
                let parent = self.parents.get(&id).cloned().unwrap_or_else(|| self.root());
                Ok((parent, Some(id)))
            }
        }
    }

    /// Topmost items lying wholly inside `from..to`, in document order.
    pub fn items_in_range(&self, from: usize, to: usize) -> Vec<ItemId> {
        let mut out = Vec::new();
        let mut pos = from;
        let to = to.min(self.size());

        while pos < to {
            match self.tokens[pos] {
                Token::Item(id) => {
                    let end = self.element_end(&id).map(|close| close + 1).unwrap_or(pos + 1);
                    if end <= to {
                        out.push(id);
                        pos = end;
                    } else {
                        // Partly covered element: descend into its content
                        pos += 1;
                    }
                }
                Token::Close(_) => pos += 1,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_doc::ClientId;

    /// `<paragraph>Hi</paragraph><heading>Yo</heading>`
    fn sample() -> (Doc, ItemId, ItemId) {
        let mut doc = Doc::new(ClientId(1));
        let root = ParentRef::root("prosemirror");
        let (para, heading) = doc
            .transact("test", |txn| {
                let para = txn.insert_element(&root, None, "paragraph", BTreeMap::new())?;
                txn.insert_text(&ParentRef::Item(para), None, "Hi")?;
                let heading = txn.insert_element(&root, Some(para), "heading", BTreeMap::new())?;
                txn.insert_text(&ParentRef::Item(heading), None, "Yo")?;
                Ok((para, heading))
            })
            .unwrap();
        (doc, para, heading)
    }

    #[test]
    fn test_build_renders_and_indexes() {
        let (doc, para, heading) = sample();
        let (node, mapping) = Mapping::build(&doc, "prosemirror");

        assert_eq!(node.content_size(), mapping.size());
        assert_eq!(mapping.size(), 8);
        assert_eq!(mapping.position_of(&para), Some(0));
        assert_eq!(mapping.element_end(&para), Some(3));
        assert_eq!(mapping.position_of(&heading), Some(4));
        assert_eq!(mapping.token_at(3), Some(Token::Close(para)));
        assert_eq!(mapping.token_at(8), None);
        assert_eq!(node.children()[1].text_content(), "Yo");
    }

    #[test]
    fn test_paths_round_trip() {
        let (doc, para, heading) = sample();
        let (node, mapping) = Mapping::build(&doc, "prosemirror");

        assert_eq!(mapping.item_at_path(&[1]), Some(heading));
        assert_eq!(mapping.path_of(&para), Some(&[0][..]));
        assert_eq!(node.child_at_path(&[1]).and_then(Node::kind), Some("heading"));
    }

    #[test]
    fn test_resolve_insert() {
        let (doc, para, heading) = sample();
        let (_, mapping) = Mapping::build(&doc, "prosemirror");
        let h = doc.visible_children(&ParentRef::Item(para))[0];

        assert_eq!(mapping.resolve_insert(0).unwrap(), (mapping.root(), None));
        assert_eq!(mapping.resolve_insert(1).unwrap(), (ParentRef::Item(para), None));
        assert_eq!(mapping.resolve_insert(2).unwrap(), (ParentRef::Item(para), Some(h)));
        assert_eq!(mapping.resolve_insert(4).unwrap(), (mapping.root(), Some(para)));
        assert_eq!(mapping.resolve_insert(8).unwrap(), (mapping.root(), Some(heading)));
        assert!(mapping.resolve_insert(9).is_err());
    }

    #[test]
    fn test_items_in_range() {
        let (doc, para, heading) = sample();
        let (_, mapping) = Mapping::build(&doc, "prosemirror");
        let chars = doc.visible_children(&ParentRef::Item(para));
        let yo = doc.visible_children(&ParentRef::Item(heading));

        assert_eq!(mapping.items_in_range(0, 4), vec![para]);
        // Partly covers both elements
        assert_eq!(mapping.items_in_range(2, 6), vec![chars[1], yo[0]]);
        assert!(mapping.items_in_range(3, 4).is_empty());
    }
}
