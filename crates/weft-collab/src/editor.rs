//! Local editor model: a tree of nodes, positions, steps and transactions.
//!
//! Positions follow the usual rich-text convention. Inside an element's
//! content, every character takes one position, and a child element takes
//! its content size plus two (its opening and closing boundaries). Position
//! 0 is the start of the root's content.

use crate::error::{CollabError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Name of the root node kind.
pub const DOC_KIND: &str = "doc";

/// A node of the local document tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Element {
        kind: String,
        #[serde(default)]
        attrs: BTreeMap<String, Value>,
        #[serde(default)]
        children: Vec<Node>,
    },
    Text(String),
}

impl Node {
    /// An element without attributes.
    pub fn element(kind: impl Into<String>, children: Vec<Node>) -> Self {
        let mut children = children;
        normalize(&mut children);
        Node::Element {
            kind: kind.into(),
            attrs: BTreeMap::new(),
            children,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }

    /// A root document node.
    pub fn doc(children: Vec<Node>) -> Self {
        Self::element(DOC_KIND, children)
    }

    pub fn kind(&self) -> Option<&str> {
        match self {
            Node::Element { kind, .. } => Some(kind),
            Node::Text(_) => None,
        }
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Element { children, .. } => children,
            Node::Text(_) => &[],
        }
    }

    /// Positions this node occupies inside its parent.
    pub fn node_size(&self) -> usize {
        match self {
            Node::Text(text) => text.chars().count(),
            Node::Element { .. } => self.content_size() + 2,
        }
    }

    /// Positions available inside this node.
    pub fn content_size(&self) -> usize {
        match self {
            Node::Text(text) => text.chars().count(),
            Node::Element { children, .. } => children.iter().map(Node::node_size).sum(),
        }
    }

    /// Concatenated text of this node and its descendants.
    pub fn text_content(&self) -> String {
        match self {
            Node::Text(text) => text.clone(),
            Node::Element { children, .. } => children.iter().map(Node::text_content).collect(),
        }
    }

    /// Follow child indexes from this node.
    pub fn child_at_path(&self, path: &[usize]) -> Option<&Node> {
        path.iter()
            .try_fold(self, |node, index| node.children().get(*index))
    }
}

/// Merge adjacent text nodes and drop empty ones.
fn normalize(children: &mut Vec<Node>) {
    let mut merged: Vec<Node> = Vec::with_capacity(children.len());
    for child in children.drain(..) {
        if let Node::Text(text) = &child {
            if text.is_empty() {
                continue;
            }
            if let Some(Node::Text(prev)) = merged.last_mut() {
                prev.push_str(text);
                continue;
            }
        }
        merged.push(child);
    }
    *children = merged;
}

fn split_chars(text: &str, at: usize) -> (String, String) {
    let head: String = text.chars().take(at).collect();
    let tail: String = text.chars().skip(at).collect();
    (head, tail)
}

fn insert_into(children: &mut Vec<Node>, pos: usize, nodes: Vec<Node>) {
    let mut offset = 0;
    for i in 0..children.len() {
        if pos == offset {
            children.splice(i..i, nodes);
            normalize(children);
            return;
        }
        let size = children[i].node_size();
        if pos < offset + size {
            let split = match &children[i] {
                Node::Text(text) => Some(split_chars(text, pos - offset)),
                Node::Element { .. } => None,
            };
            match split {
                Some((head, tail)) => {
                    let mut replacement = vec![Node::Text(head)];
                    replacement.extend(nodes);
                    replacement.push(Node::Text(tail));
                    children.splice(i..=i, replacement);
                }
                None => {
                    if let Node::Element { children: inner, .. } = &mut children[i] {
                        insert_into(inner, pos - offset - 1, nodes);
                    }
                }
            }
            normalize(children);
            return;
        }
        offset += size;
    }
    children.extend(nodes);
    normalize(children);
}

/// Remove everything wholly inside `from..to`. Elements that are only
/// partly covered keep their boundaries and lose the covered content.
fn delete_from(children: &mut Vec<Node>, from: usize, to: usize) {
    let mut offset = 0;
    let mut kept = Vec::with_capacity(children.len());
    for mut child in children.drain(..) {
        let size = child.node_size();
        let (start, end) = (offset, offset + size);
        offset = end;

        if end <= from || start >= to {
            kept.push(child);
            continue;
        }
        if from <= start && end <= to {
            continue;
        }

        match &mut child {
            Node::Text(text) => {
                let cut_from = from.saturating_sub(start);
                let cut_to = (to - start).min(size);
                *text = text
                    .chars()
                    .enumerate()
                    .filter(|(i, _)| *i < cut_from || *i >= cut_to)
                    .map(|(_, c)| c)
                    .collect();
            }
            Node::Element { children: inner, .. } => {
                let inner_from = from.saturating_sub(start + 1);
                let inner_to = to.saturating_sub(start + 1).min(size - 2);
                if inner_from < inner_to {
                    delete_from(inner, inner_from, inner_to);
                }
            }
        }
        kept.push(child);
    }
    *children = kept;
    normalize(children);
}

/// A cursor or range selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn new(anchor: usize, head: usize) -> Self {
        Self { anchor, head }
    }

    pub fn cursor(pos: usize) -> Self {
        Self::new(pos, pos)
    }

    pub fn from(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn to(&self) -> usize {
        self.anchor.max(self.head)
    }

    pub fn is_empty(&self) -> bool {
        self.anchor == self.head
    }

    fn clamp(self, size: usize) -> Self {
        Self::new(self.anchor.min(size), self.head.min(size))
    }
}

/// One atomic change to the local document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Step {
    InsertText { pos: usize, text: String },
    InsertNode { pos: usize, node: Node },
    /// Remove the content wholly inside `from..to`.
    Delete { from: usize, to: usize },
}

impl Step {
    fn apply(&self, doc: &mut Node) -> Result<()> {
        let size = doc.content_size();
        let check = |offset: usize| {
            if offset > size {
                Err(CollabError::OffsetOutOfRange { offset, size })
            } else {
                Ok(())
            }
        };
        let Node::Element { children, .. } = doc else {
            return Err(CollabError::InvalidStep("document root must be an element".into()));
        };

        match self {
            Step::InsertText { pos, text } => {
                check(*pos)?;
                insert_into(children, *pos, vec![Node::Text(text.clone())]);
            }
            Step::InsertNode { pos, node } => {
                check(*pos)?;
                insert_into(children, *pos, vec![node.clone()]);
            }
            Step::Delete { from, to } => {
                check(*to)?;
                if from > to {
                    return Err(CollabError::InvalidStep(format!(
                        "delete range {}..{} is reversed",
                        from, to
                    )));
                }
                delete_from(children, *from, *to);
            }
        }
        Ok(())
    }

    fn map(&self, pos: usize, removed: usize) -> usize {
        match self {
            Step::InsertText { pos: at, text } if pos >= *at => pos + text.chars().count(),
            Step::InsertNode { pos: at, node } if pos >= *at => pos + node.node_size(),
            Step::Delete { to, .. } if pos >= *to => pos - removed,
            Step::Delete { from, .. } if pos > *from => *from,
            _ => pos,
        }
    }
}

/// Transaction metadata read by the collaboration plugins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionMeta {
    /// Set by plugins that produced the transaction (e.g. the sync binding).
    pub origin: Option<String>,
    /// `false` keeps the change out of the undo history.
    pub add_to_history: bool,
}

impl Default for TransactionMeta {
    fn default() -> Self {
        Self {
            origin: None,
            add_to_history: true,
        }
    }
}

/// A batch of steps applied to an [`EditorState`] as one unit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transaction {
    pub steps: Vec<Step>,
    pub selection: Option<Selection>,
    pub meta: TransactionMeta,
    /// Whole-document replacement, used for sync echoes.
    pub replaced_doc: Option<Node>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_text(mut self, pos: usize, text: impl Into<String>) -> Self {
        self.steps.push(Step::InsertText {
            pos,
            text: text.into(),
        });
        self
    }

    pub fn insert_node(mut self, pos: usize, node: Node) -> Self {
        self.steps.push(Step::InsertNode { pos, node });
        self
    }

    pub fn delete(mut self, from: usize, to: usize) -> Self {
        self.steps.push(Step::Delete { from, to });
        self
    }

    pub fn set_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn set_origin(mut self, origin: impl Into<String>) -> Self {
        self.meta.origin = Some(origin.into());
        self
    }

    /// Keep this transaction out of the undo history.
    pub fn without_history(mut self) -> Self {
        self.meta.add_to_history = false;
        self
    }

    pub fn replace_doc(mut self, doc: Node) -> Self {
        self.replaced_doc = Some(doc);
        self
    }

    pub fn doc_changed(&self) -> bool {
        !self.steps.is_empty() || self.replaced_doc.is_some()
    }
}

/// Document plus selection.
#[derive(Clone, Debug, PartialEq)]
pub struct EditorState {
    pub doc: Node,
    pub selection: Selection,
}

impl EditorState {
    pub fn new(doc: Node) -> Self {
        Self {
            doc,
            selection: Selection::default(),
        }
    }

    /// Apply a transaction, returning the next state.
    ///
    /// The selection is mapped through the steps unless the transaction
    /// sets one explicitly.
    pub fn apply(&self, tr: &Transaction) -> Result<EditorState> {
        let mut doc = match &tr.replaced_doc {
            Some(replaced) => replaced.clone(),
            None => self.doc.clone(),
        };
        let mut selection = self.selection;

        for step in &tr.steps {
            let before = doc.content_size();
            step.apply(&mut doc)?;
            let removed = before.saturating_sub(doc.content_size());
            selection = Selection::new(
                step.map(selection.anchor, removed),
                step.map(selection.head, removed),
            );
        }

        let size = doc.content_size();
        let selection = tr.selection.unwrap_or(selection);
        if selection.to() > size {
            return Err(CollabError::OffsetOutOfRange {
                offset: selection.to(),
                size,
            });
        }
        Ok(EditorState {
            doc,
            selection: selection.clamp(size),
        })
    }
}

/// Receives transactions produced by a command.
pub type Dispatch<'a> = &'a mut dyn FnMut(Transaction);

/// Arguments passed to a command.
///
/// Without `dispatch` a command only reports whether it could run.
pub struct CommandProps<'a> {
    pub state: &'a EditorState,
    pub dispatch: Option<Dispatch<'a>>,
}

/// A command that cannot be chained with others.
pub type NonChainableCommand = Box<dyn Fn(CommandProps<'_>) -> bool + Send + Sync>;
