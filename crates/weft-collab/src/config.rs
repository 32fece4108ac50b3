//! Configuration for the collaboration extension.

use crate::cursor::{default_cursor_builder, CursorBuilder};
use crate::editor::{EditorState, Selection};
use crate::error::{CollabError, Result};
use crate::provider::{default_destroy_provider, DestroyProvider, ProviderSource};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use weft_doc::Origin;

/// Reads the selection to publish as this peer's cursor.
pub type SelectionGetter = Arc<dyn Fn(&EditorState) -> Selection + Send + Sync>;

/// A cursor colour pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorDef {
    pub light: String,
    pub dark: String,
}

impl ColorDef {
    pub fn new(light: impl Into<String>, dark: impl Into<String>) -> Self {
        Self {
            light: light.into(),
            dark: dark.into(),
        }
    }
}

/// Options passed through to the sync plugin.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Palette used for peers that do not announce a colour.
    pub colors: Vec<ColorDef>,
    /// Fixed colours per user name.
    pub color_mapping: BTreeMap<String, ColorDef>,
}

/// Names of the options, used to report what changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OptionKey {
    Provider,
    DestroyProvider,
    SyncOptions,
    CursorBuilder,
    CursorStateField,
    GetSelection,
    DisableUndo,
    ProtectedNodes,
    TrackedOrigins,
    CaptureTimeout,
    MaxHistory,
    FragmentName,
    AnnotationMapName,
}

/// Options whose change requires the extension to be registered again.
pub const STATIC_KEYS: [OptionKey; 3] = [
    OptionKey::DisableUndo,
    OptionKey::ProtectedNodes,
    OptionKey::TrackedOrigins,
];

/// Options whose change requires the plugin set to be reinstalled.
pub const PLUGIN_KEYS: [OptionKey; 5] = [
    OptionKey::CursorBuilder,
    OptionKey::CursorStateField,
    OptionKey::Provider,
    OptionKey::GetSelection,
    OptionKey::SyncOptions,
];

/// Configuration of [`CollabExtension`](crate::CollabExtension).
#[derive(Clone)]
pub struct CollabOptions {
    /// Required. The realtime provider, or a factory building it.
    pub provider: Option<ProviderSource>,
    pub destroy_provider: DestroyProvider,
    pub sync_options: SyncOptions,
    pub cursor_builder: CursorBuilder,
    /// Awareness field holding the cursor.
    pub cursor_state_field: String,
    pub get_selection: SelectionGetter,
    pub disable_undo: bool,
    /// Element kinds whose non-empty deletions are never undone.
    pub protected_nodes: BTreeSet<String>,
    /// Extra origins captured by undo, besides the sync binding's own.
    pub tracked_origins: BTreeSet<Origin>,
    /// Edits closer together than this merge into one undo step.
    pub capture_timeout: Duration,
    pub max_history: usize,
    /// Root fragment holding the document content.
    pub fragment_name: String,
    /// Shared map holding annotation records.
    pub annotation_map_name: String,
}

impl Default for CollabOptions {
    fn default() -> Self {
        Self {
            provider: None,
            destroy_provider: default_destroy_provider(),
            sync_options: SyncOptions::default(),
            cursor_builder: default_cursor_builder(),
            cursor_state_field: "cursor".to_string(),
            get_selection: Arc::new(|state: &EditorState| state.selection),
            disable_undo: false,
            protected_nodes: ["paragraph".to_string()].into_iter().collect(),
            tracked_origins: BTreeSet::new(),
            capture_timeout: Duration::from_millis(500),
            max_history: 1000,
            fragment_name: "prosemirror".to_string(),
            annotation_map_name: "annotations".to_string(),
        }
    }
}

impl fmt::Debug for CollabOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollabOptions")
            .field("provider", &self.provider)
            .field("sync_options", &self.sync_options)
            .field("cursor_state_field", &self.cursor_state_field)
            .field("disable_undo", &self.disable_undo)
            .field("protected_nodes", &self.protected_nodes)
            .field("tracked_origins", &self.tracked_origins)
            .field("capture_timeout", &self.capture_timeout)
            .field("max_history", &self.max_history)
            .field("fragment_name", &self.fragment_name)
            .field("annotation_map_name", &self.annotation_map_name)
            .finish_non_exhaustive()
    }
}

impl CollabOptions {
    pub fn builder() -> CollabOptionsBuilder {
        CollabOptionsBuilder::new()
    }

    /// Fail fast on missing required configuration.
    pub fn validate(&self) -> Result<()> {
        if self.provider.is_none() {
            return Err(CollabError::MissingProvider);
        }
        Ok(())
    }

    /// Keys that `update` would change.
    pub fn changed_keys(&self, update: &CollabOptionsUpdate) -> BTreeSet<OptionKey> {
        let mut changed = BTreeSet::new();
        let mut mark = |key, differs: bool| {
            if differs {
                changed.insert(key);
            }
        };

        if let Some(provider) = &update.provider {
            let same = self
                .provider
                .as_ref()
                .map(|current| current.same_as(provider))
                .unwrap_or(false);
            mark(OptionKey::Provider, !same);
        }
        if let Some(destroy) = &update.destroy_provider {
            mark(OptionKey::DestroyProvider, !Arc::ptr_eq(destroy, &self.destroy_provider));
        }
        if let Some(sync) = &update.sync_options {
            mark(OptionKey::SyncOptions, *sync != self.sync_options);
        }
        if let Some(builder) = &update.cursor_builder {
            mark(OptionKey::CursorBuilder, !Arc::ptr_eq(builder, &self.cursor_builder));
        }
        if let Some(field) = &update.cursor_state_field {
            mark(OptionKey::CursorStateField, *field != self.cursor_state_field);
        }
        if let Some(getter) = &update.get_selection {
            mark(OptionKey::GetSelection, !Arc::ptr_eq(getter, &self.get_selection));
        }
        if let Some(disable) = update.disable_undo {
            mark(OptionKey::DisableUndo, disable != self.disable_undo);
        }
        if let Some(nodes) = &update.protected_nodes {
            mark(OptionKey::ProtectedNodes, *nodes != self.protected_nodes);
        }
        if let Some(origins) = &update.tracked_origins {
            mark(OptionKey::TrackedOrigins, *origins != self.tracked_origins);
        }
        if let Some(timeout) = update.capture_timeout {
            mark(OptionKey::CaptureTimeout, timeout != self.capture_timeout);
        }
        if let Some(max) = update.max_history {
            mark(OptionKey::MaxHistory, max != self.max_history);
        }
        if let Some(name) = &update.fragment_name {
            mark(OptionKey::FragmentName, *name != self.fragment_name);
        }
        if let Some(name) = &update.annotation_map_name {
            mark(OptionKey::AnnotationMapName, *name != self.annotation_map_name);
        }
        changed
    }

    /// Overwrite every option present in `update`.
    pub fn apply(&mut self, update: CollabOptionsUpdate) {
        if let Some(provider) = update.provider {
            self.provider = Some(provider);
        }
        if let Some(destroy) = update.destroy_provider {
            self.destroy_provider = destroy;
        }
        if let Some(sync) = update.sync_options {
            self.sync_options = sync;
        }
        if let Some(builder) = update.cursor_builder {
            self.cursor_builder = builder;
        }
        if let Some(field) = update.cursor_state_field {
            self.cursor_state_field = field;
        }
        if let Some(getter) = update.get_selection {
            self.get_selection = getter;
        }
        if let Some(disable) = update.disable_undo {
            self.disable_undo = disable;
        }
        if let Some(nodes) = update.protected_nodes {
            self.protected_nodes = nodes;
        }
        if let Some(origins) = update.tracked_origins {
            self.tracked_origins = origins;
        }
        if let Some(timeout) = update.capture_timeout {
            self.capture_timeout = timeout;
        }
        if let Some(max) = update.max_history {
            self.max_history = max;
        }
        if let Some(name) = update.fragment_name {
            self.fragment_name = name;
        }
        if let Some(name) = update.annotation_map_name {
            self.annotation_map_name = name;
        }
    }
}

/// A partial set of options for [`CollabExtension::set_options`](crate::CollabExtension::set_options).
#[derive(Clone, Default)]
pub struct CollabOptionsUpdate {
    pub provider: Option<ProviderSource>,
    pub destroy_provider: Option<DestroyProvider>,
    pub sync_options: Option<SyncOptions>,
    pub cursor_builder: Option<CursorBuilder>,
    pub cursor_state_field: Option<String>,
    pub get_selection: Option<SelectionGetter>,
    pub disable_undo: Option<bool>,
    pub protected_nodes: Option<BTreeSet<String>>,
    pub tracked_origins: Option<BTreeSet<Origin>>,
    pub capture_timeout: Option<Duration>,
    pub max_history: Option<usize>,
    pub fragment_name: Option<String>,
    pub annotation_map_name: Option<String>,
}

/// Builder for [`CollabOptions`].
pub struct CollabOptionsBuilder {
    options: CollabOptions,
}

impl CollabOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: CollabOptions::default(),
        }
    }

    pub fn provider(mut self, source: ProviderSource) -> Self {
        self.options.provider = Some(source);
        self
    }

    pub fn destroy_provider(mut self, destroy: DestroyProvider) -> Self {
        self.options.destroy_provider = destroy;
        self
    }

    pub fn sync_options(mut self, sync: SyncOptions) -> Self {
        self.options.sync_options = sync;
        self
    }

    pub fn cursor_builder(mut self, builder: CursorBuilder) -> Self {
        self.options.cursor_builder = builder;
        self
    }

    pub fn cursor_state_field(mut self, field: impl Into<String>) -> Self {
        self.options.cursor_state_field = field.into();
        self
    }

    pub fn get_selection(mut self, getter: SelectionGetter) -> Self {
        self.options.get_selection = getter;
        self
    }

    pub fn disable_undo(mut self, disabled: bool) -> Self {
        self.options.disable_undo = disabled;
        self
    }

    pub fn protected_nodes<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.protected_nodes = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn tracked_origin(mut self, origin: impl Into<Origin>) -> Self {
        self.options.tracked_origins.insert(origin.into());
        self
    }

    pub fn capture_timeout(mut self, timeout: Duration) -> Self {
        self.options.capture_timeout = timeout;
        self
    }

    pub fn max_history(mut self, max: usize) -> Self {
        self.options.max_history = max;
        self
    }

    pub fn fragment_name(mut self, name: impl Into<String>) -> Self {
        self.options.fragment_name = name.into();
        self
    }

    pub fn annotation_map_name(mut self, name: impl Into<String>) -> Self {
        self.options.annotation_map_name = name.into();
        self
    }

    pub fn build(self) -> CollabOptions {
        self.options
    }
}

impl Default for CollabOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CollabOptions::default();
        assert_eq!(options.cursor_state_field, "cursor");
        assert!(!options.disable_undo);
        assert!(options.protected_nodes.contains("paragraph"));
        assert_eq!(options.protected_nodes.len(), 1);
        assert!(options.tracked_origins.is_empty());
        assert_eq!(options.capture_timeout, Duration::from_millis(500));
        assert_eq!(options.max_history, 1000);
        assert_eq!(options.fragment_name, "prosemirror");
        assert_eq!(options.annotation_map_name, "annotations");
    }

    #[test]
    fn test_missing_provider_fails_validation() {
        let options = CollabOptions::default();
        assert_eq!(options.validate(), Err(CollabError::MissingProvider));
    }

    #[test]
    fn test_builder() {
        let options = CollabOptions::builder()
            .cursor_state_field("caret")
            .disable_undo(true)
            .protected_nodes(["paragraph", "heading"])
            .tracked_origin("import")
            .max_history(10)
            .build();

        assert_eq!(options.cursor_state_field, "caret");
        assert!(options.disable_undo);
        assert_eq!(options.protected_nodes.len(), 2);
        assert!(options.tracked_origins.contains(&Origin::new("import")));
        assert_eq!(options.max_history, 10);
    }

    #[test]
    fn test_changed_keys_ignores_equal_values() {
        let options = CollabOptions::default();
        let update = CollabOptionsUpdate {
            cursor_state_field: Some("cursor".into()),
            disable_undo: Some(true),
            get_selection: Some(options.get_selection.clone()),
            ..Default::default()
        };

        let changed = options.changed_keys(&update);
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec![OptionKey::DisableUndo]);
    }

    #[test]
    fn test_key_groups_are_disjoint() {
        for key in STATIC_KEYS {
            assert!(!PLUGIN_KEYS.contains(&key));
        }
    }
}
