//! Cursor presence over the awareness channel.
//!
//! The local selection is published as a pair of relative positions under a
//! configurable awareness field. Remote cursors are resolved against the
//! current mapping and turned into decorations by a cursor builder.

use crate::config::{CollabOptions, SelectionGetter, SyncOptions};
use crate::editor::EditorState;
use crate::error::Result;
use crate::mapping::Mapping;
use crate::position::{to_absolute, to_relative};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::trace;
use weft_doc::{Awareness, ClientId, Doc, RelativePosition};

/// Colour used when neither the peer nor the palette provides one.
pub const DEFAULT_CURSOR_COLOR: &str = "#ffa500";

/// Awareness field carrying `{ name, color }` of a peer.
pub const USER_FIELD: &str = "user";

/// Who a remote cursor belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorUser {
    pub client: ClientId,
    pub name: Option<String>,
    pub color: String,
}

/// Rendered caret label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorWidget {
    pub label: String,
    pub color: String,
}

/// Renders a remote peer's caret.
pub type CursorBuilder = Arc<dyn Fn(&CursorUser) -> CursorWidget + Send + Sync>;

pub fn default_cursor_builder() -> CursorBuilder {
    Arc::new(|user: &CursorUser| CursorWidget {
        label: user
            .name
            .clone()
            .unwrap_or_else(|| format!("User {}", user.client)),
        color: user.color.clone(),
    })
}

/// A remote selection resolved to absolute positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorDecoration {
    pub client: ClientId,
    pub anchor: usize,
    pub head: usize,
    pub widget: CursorWidget,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct CursorState {
    anchor: RelativePosition,
    head: RelativePosition,
}

/// Publishes the local cursor and renders remote ones.
pub struct CursorPlugin {
    awareness: Arc<RwLock<Awareness>>,
    field: String,
    builder: CursorBuilder,
    get_selection: SelectionGetter,
    sync_options: SyncOptions,
}

impl CursorPlugin {
    pub fn new(awareness: Arc<RwLock<Awareness>>, options: &CollabOptions) -> Self {
        Self {
            awareness,
            field: options.cursor_state_field.clone(),
            builder: options.cursor_builder.clone(),
            get_selection: options.get_selection.clone(),
            sync_options: options.sync_options.clone(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Publish the current selection as this peer's cursor.
    pub fn publish(&self, state: &EditorState, mapping: &Mapping) -> Result<()> {
        let selection = (self.get_selection)(state);
        let cursor = CursorState {
            anchor: to_relative(selection.anchor, mapping)?,
            head: to_relative(selection.head, mapping)?,
        };
        let value = serde_json::to_value(&cursor)?;

        let mut awareness = self.awareness.write();
        let unchanged = awareness
            .local_state()
            .and_then(|fields| fields.get(&self.field))
            == Some(&value);
        if !unchanged {
            trace!(anchor = selection.anchor, head = selection.head, "publishing cursor");
            awareness.set_local_field(&self.field, value);
        }
        Ok(())
    }

    /// Withdraw the local cursor.
    pub fn clear(&self) {
        let mut awareness = self.awareness.write();
        let has_cursor = awareness
            .local_state()
            .map(|fields| fields.get(&self.field).is_some_and(|v| !v.is_null()))
            .unwrap_or(false);
        if has_cursor {
            awareness.set_local_field(&self.field, Value::Null);
        }
    }

    /// Remote cursors that still resolve, ordered by client.
    pub fn decorations(&self, doc: &Doc, mapping: &Mapping) -> Vec<CursorDecoration> {
        let awareness = self.awareness.read();
        let mut decorations: Vec<CursorDecoration> = awareness
            .remote_states()
            .filter_map(|(client, state)| {
                let raw = state.fields.get(&self.field)?;
                let cursor: CursorState = serde_json::from_value(raw.clone()).ok()?;
                let anchor = to_absolute(doc, &cursor.anchor, mapping)?;
                let head = to_absolute(doc, &cursor.head, mapping)?;
                let user = self.user_of(*client, &state.fields);
                Some(CursorDecoration {
                    client: *client,
                    anchor,
                    head,
                    widget: (self.builder)(&user),
                })
            })
            .collect();
        decorations.sort_by_key(|d| d.client);
        decorations
    }

    fn user_of(&self, client: ClientId, fields: &Map<String, Value>) -> CursorUser {
        let user = fields.get(USER_FIELD);
        let name = user
            .and_then(|u| u.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let color = user
            .and_then(|u| u.get("color"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                name.as_ref()
                    .and_then(|n| self.sync_options.color_mapping.get(n))
                    .map(|c| c.light.clone())
            })
            .or_else(|| {
                let palette = &self.sync_options.colors;
                if palette.is_empty() {
                    None
                } else {
                    Some(palette[(client.0 % palette.len() as u64) as usize].light.clone())
                }
            })
            .unwrap_or_else(|| DEFAULT_CURSOR_COLOR.to_string());

        CursorUser {
            client,
            name,
            color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColorDef;
    use crate::editor::Selection;
    use serde_json::json;
    use std::collections::BTreeMap;
    use weft_doc::ParentRef;

    fn doc_and_mapping() -> (Doc, Mapping) {
        let mut doc = Doc::new(ClientId(1));
        doc.transact("test", |txn| {
            let para = txn.insert_element(
                &ParentRef::root("prosemirror"),
                None,
                "paragraph",
                BTreeMap::new(),
            )?;
            txn.insert_text(&ParentRef::Item(para), None, "Hello")
        })
        .unwrap();
        let (_, mapping) = Mapping::build(&doc, "prosemirror");
        (doc, mapping)
    }

    fn plugin(client: u64, options: &CollabOptions) -> CursorPlugin {
        CursorPlugin::new(Arc::new(RwLock::new(Awareness::new(ClientId(client)))), options)
    }

    #[test]
    fn test_remote_cursor_resolves() {
        let (doc, mapping) = doc_and_mapping();
        let options = CollabOptions::default();
        let local = plugin(1, &options);
        let remote = plugin(2, &options);

        let mut state = EditorState::new(crate::editor::Node::doc(vec![]));
        state.selection = Selection::new(1, 4);
        local.publish(&state, &mapping).unwrap();
        local
            .awareness
            .write()
            .set_local_field(USER_FIELD, json!({"name": "Ada", "color": "#00f"}));

        let update = local.awareness.write().take_local_update().unwrap();
        remote.awareness.write().apply_update(&update);

        let decorations = remote.decorations(&doc, &mapping);
        assert_eq!(decorations.len(), 1);
        assert_eq!(decorations[0].anchor, 1);
        assert_eq!(decorations[0].head, 4);
        assert_eq!(
            decorations[0].widget,
            CursorWidget {
                label: "Ada".into(),
                color: "#00f".into()
            }
        );
    }

    #[test]
    fn test_palette_color_for_anonymous_peer() {
        let (doc, mapping) = doc_and_mapping();
        let options = CollabOptions::builder()
            .sync_options(SyncOptions {
                colors: vec![ColorDef::new("#111", "#000"), ColorDef::new("#222", "#000")],
                ..Default::default()
            })
            .build();
        let local = plugin(3, &options);
        let remote = plugin(4, &options);

        let state = EditorState::new(crate::editor::Node::doc(vec![]));
        local.publish(&state, &mapping).unwrap();
        remote
            .awareness
            .write()
            .apply_update(&local.awareness.read().encode_update());

        let decorations = remote.decorations(&doc, &mapping);
        assert_eq!(decorations[0].widget.color, "#222");
        assert_eq!(decorations[0].widget.label, "User 3");
    }

    #[test]
    fn test_cleared_cursor_is_not_rendered() {
        let (doc, mapping) = doc_and_mapping();
        let options = CollabOptions::default();
        let local = plugin(1, &options);
        let remote = plugin(2, &options);

        let state = EditorState::new(crate::editor::Node::doc(vec![]));
        local.publish(&state, &mapping).unwrap();
        local.clear();
        remote
            .awareness
            .write()
            .apply_update(&local.awareness.read().encode_update());

        assert!(remote.decorations(&doc, &mapping).is_empty());
    }
}
