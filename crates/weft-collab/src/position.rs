//! Position translation between absolute offsets and relative positions.

use crate::error::{CollabError, Result};
use crate::mapping::{Mapping, Token};
use weft_doc::{Doc, ParentRef, RelativePosition};

/// Convert an absolute offset into a relative position.
///
/// An offset in front of a character or element anchors to that item; an
/// offset in front of a closing boundary anchors to the end of that
/// element; the document end anchors to the end of the root fragment.
pub fn to_relative(offset: usize, mapping: &Mapping) -> Result<RelativePosition> {
    match mapping.token_at(offset) {
        Some(Token::Item(id)) => {
            let parent = mapping
                .parent_of(&id)
                .cloned()
                .unwrap_or_else(|| mapping.root());
            Ok(RelativePosition::before(parent, id))
        }
        Some(Token::Close(id)) => Ok(RelativePosition::end_of(ParentRef::Item(id))),
        None if offset == mapping.size() => Ok(RelativePosition::end_of(mapping.root())),
        None => Err(CollabError::OffsetOutOfRange {
            offset,
            size: mapping.size(),
        }),
    }
}

/// Convert a relative position back to an absolute offset.
///
/// Returns `None` when the anchored content no longer exists, or when the
/// mapping does not describe the document's current state.
pub fn to_absolute(doc: &Doc, rel: &RelativePosition, mapping: &Mapping) -> Option<usize> {
    let resolved = doc.resolve_relative(rel)?;
    let children = doc.visible_children(&resolved.parent);
    match children.get(resolved.index) {
        Some(id) => mapping.position_of(id),
        None => mapping.container_end(&resolved.parent),
    }
}
