//! The collaboration extension: provider lifecycle, plugin set, commands
//! and key bindings.

use crate::annotation::SharedAnnotationStore;
use crate::binding::{BindingEvent, SyncBinding, SYNC_ORIGIN};
use crate::config::{CollabOptions, CollabOptionsUpdate, OptionKey, PLUGIN_KEYS, STATIC_KEYS};
use crate::cursor::{CursorDecoration, CursorPlugin};
use crate::editor::{CommandProps, EditorState, NonChainableCommand, Transaction};
use crate::error::{CollabError, Result};
use crate::mapping::Mapping;
use crate::plugin::{PluginStates, CURSOR_PLUGIN, SYNC_PLUGIN, UNDO_PLUGIN};
use crate::provider::{LazyProvider, Provider};
use crate::registry::{AnnotationExtension, ExtensionRegistry};
use crate::undo::{UndoConfig, UndoCoordinator};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};
use weft_doc::Doc;

/// Editor shortcuts handled by the extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NamedShortcut {
    Undo,
    Redo,
}

impl NamedShortcut {
    /// Default key chord.
    pub fn keys(&self) -> &'static str {
        match self {
            NamedShortcut::Undo => "Mod-z",
            NamedShortcut::Redo => "Mod-Shift-z",
        }
    }
}

/// What [`CollabExtension::set_options`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OptionsChange {
    pub changed: BTreeSet<OptionKey>,
    /// The previous provider was torn down.
    pub provider_replaced: bool,
    pub plugins_reinstalled: bool,
    /// A static option changed; the host must register the extension again.
    pub needs_reregistration: bool,
}

struct AnnotationLink {
    extension: Arc<AnnotationExtension>,
    events: broadcast::Receiver<BindingEvent>,
}

/// Real-time collaboration for one editor.
pub struct CollabExtension {
    options: CollabOptions,
    provider: LazyProvider,
    plugins: PluginStates,
    annotations: Option<AnnotationLink>,
    destroyed: bool,
}

impl CollabExtension {
    pub const NAME: &'static str = "collaboration";

    /// Validate the options. Fails without a provider.
    pub fn new(options: CollabOptions) -> Result<Self> {
        options.validate()?;
        let source = options.provider.clone().ok_or(CollabError::MissingProvider)?;
        Ok(Self {
            options,
            provider: LazyProvider::new(source),
            plugins: PluginStates::new(),
            annotations: None,
            destroyed: false,
        })
    }

    pub fn name(&self) -> &'static str {
        Self::NAME
    }

    pub fn options(&self) -> &CollabOptions {
        &self.options
    }

    /// The provider, resolved on first use.
    pub fn provider(&mut self) -> Arc<dyn Provider> {
        self.provider.get()
    }

    pub fn plugins(&self) -> &PluginStates {
        &self.plugins
    }

    pub fn binding(&self) -> Option<&SyncBinding> {
        SYNC_PLUGIN.get(&self.plugins)
    }

    /// The reconciled editor state, once plugins are installed.
    pub fn state(&self) -> Option<&EditorState> {
        self.binding().map(SyncBinding::state)
    }

    pub fn undo_coordinator(&self) -> Option<Arc<UndoCoordinator>> {
        UNDO_PLUGIN.get(&self.plugins).cloned()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Build the sync, cursor and (unless disabled) undo plugins, replacing
    /// any installed ones.
    pub fn create_plugins(&mut self) {
        self.teardown_plugins();

        let provider = self.provider.get();
        let doc = provider.doc();
        let binding = SyncBinding::new(doc.clone(), self.options.fragment_name.as_str());
        let cursor = CursorPlugin::new(provider.awareness(), &self.options);

        self.plugins.insert(SYNC_PLUGIN, binding);
        self.plugins.insert(CURSOR_PLUGIN, cursor);
        if !self.options.disable_undo {
            let undo = UndoCoordinator::new(
                doc,
                self.options.fragment_name.as_str(),
                UndoConfig::from_options(&self.options),
            );
            self.plugins.insert(UNDO_PLUGIN, Arc::new(undo));
        }
        debug!(plugins = ?self.plugins.names(), "collaboration plugins installed");

        if let Some(link) = self.annotations.take() {
            self.link_annotations(link.extension);
        }
    }

    /// Wire the annotation feature to the shared document, if installed.
    ///
    /// Returns `false` when the registry has no annotation extension; the
    /// editor then runs without annotation sync.
    pub fn on_view(&mut self, registry: &ExtensionRegistry) -> bool {
        let Some(extension) = registry.get::<AnnotationExtension>() else {
            debug!("annotation extension not installed, annotation sync disabled");
            self.annotations = None;
            return false;
        };
        if self.binding().is_none() {
            self.create_plugins();
        }
        self.link_annotations(extension)
    }

    fn link_annotations(&mut self, extension: Arc<AnnotationExtension>) -> bool {
        let Some(binding) = SYNC_PLUGIN.get(&self.plugins) else {
            return false;
        };
        let store = SharedAnnotationStore::new(
            binding.doc(),
            self.options.annotation_map_name.as_str(),
            binding.mapping_handle(),
        );
        extension.set_store(Arc::new(store));
        let events = binding.subscribe();
        self.annotations = Some(AnnotationLink { extension, events });
        true
    }

    /// Fold pending shared changes into the editor and redraw annotations
    /// after remote updates. Returns whether anything was reconciled.
    pub fn process(&mut self) -> bool {
        let reconciled = SYNC_PLUGIN
            .get_mut(&mut self.plugins)
            .map(SyncBinding::reconcile)
            .unwrap_or(false);

        if let Some(link) = &mut self.annotations {
            let mut stale = false;
            loop {
                match link.events.try_recv() {
                    Ok(BindingEvent::AnnotationsStale) | Err(TryRecvError::Lagged(_)) => stale = true,
                    Ok(BindingEvent::Reconciled { .. }) => {}
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            if stale {
                link.extension.redraw_annotations();
            }
        }

        if reconciled {
            self.publish_cursor();
        }
        reconciled
    }

    /// Apply an editor transaction and publish the resulting cursor.
    pub fn dispatch(&mut self, tr: Transaction) -> Result<()> {
        let binding = SYNC_PLUGIN
            .get_mut(&mut self.plugins)
            .ok_or(CollabError::NoMapping)?;
        binding.apply_local(&tr)?;
        self.publish_cursor();
        Ok(())
    }

    /// Run a command against the current state, dispatching what it produces.
    pub fn run_command(&mut self, command: &NonChainableCommand) -> Result<bool> {
        let Some(state) = self.state().cloned() else {
            return Ok(false);
        };
        let mut produced = Vec::new();
        let ran = {
            let mut dispatch = |tr: Transaction| produced.push(tr);
            command(CommandProps {
                state: &state,
                dispatch: Some(&mut dispatch),
            })
        };
        for tr in produced {
            self.dispatch(tr)?;
        }
        Ok(ran)
    }

    /// Whether a command could run, without running it.
    pub fn can_run(&self, command: &NonChainableCommand) -> bool {
        match self.state() {
            Some(state) => command(CommandProps {
                state,
                dispatch: None,
            }),
            None => false,
        }
    }

    /// Remote cursors resolved against the current document.
    pub fn cursor_decorations(&self) -> Vec<CursorDecoration> {
        let (Some(cursor), Some(binding)) = (CURSOR_PLUGIN.get(&self.plugins), self.binding()) else {
            return Vec::new();
        };
        let Some(mapping) = binding.mapping() else {
            return Vec::new();
        };
        let doc = binding.doc();
        let doc = doc.read();
        cursor.decorations(&doc, &mapping)
    }

    fn publish_cursor(&self) {
        let (Some(cursor), Some(binding)) = (CURSOR_PLUGIN.get(&self.plugins), self.binding()) else {
            return;
        };
        let Some(mapping) = binding.mapping() else {
            return;
        };
        if let Err(err) = cursor.publish(binding.state(), &mapping) {
            warn!(error = %err, "failed to publish cursor");
        }
    }

    /// Apply new options.
    ///
    /// A new provider tears the previous one down (with the previous
    /// teardown routine if that changed too). Plugin options reinstall the
    /// plugin set; static options ask the host to register the extension
    /// again.
    pub fn set_options(&mut self, update: CollabOptionsUpdate) -> OptionsChange {
        let changed = self.options.changed_keys(&update);
        let previous_destroy = self.options.destroy_provider.clone();
        self.options.apply(update);

        let mut provider_replaced = false;
        if changed.contains(&OptionKey::Provider) {
            if let Some(source) = self.options.provider.clone() {
                if let Some(previous) = self.provider.replace(source) {
                    let destroy = if changed.contains(&OptionKey::DestroyProvider) {
                        previous_destroy
                    } else {
                        self.options.destroy_provider.clone()
                    };
                    self.teardown_plugins();
                    destroy(previous.as_ref());
                    provider_replaced = true;
                    debug!("previous realtime provider torn down");
                }
            }
        }

        let installed = !self.plugins.is_empty() || provider_replaced;
        let plugins_reinstalled = installed && PLUGIN_KEYS.iter().any(|key| changed.contains(key));
        if plugins_reinstalled {
            self.create_plugins();
        }

        OptionsChange {
            needs_reregistration: STATIC_KEYS.iter().any(|key| changed.contains(key)),
            changed,
            provider_replaced,
            plugins_reinstalled,
        }
    }

    fn teardown_plugins(&mut self) {
        if let Some(mut binding) = self.plugins.remove(SYNC_PLUGIN) {
            binding.destroy();
        }
        if let Some(undo) = self.plugins.remove(UNDO_PLUGIN) {
            undo.destroy();
        }
        if let Some(cursor) = self.plugins.remove(CURSOR_PLUGIN) {
            cursor.clear();
        }
        self.plugins.clear();
    }

    /// Tear the provider down. Safe to call twice; does nothing if the
    /// provider was never resolved.
    pub fn on_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.teardown_plugins();
        if let Some(provider) = self.provider.take() {
            (self.options.destroy_provider)(provider.as_ref());
            debug!("realtime provider destroyed");
        }
    }

    /// Undo the last local change. Returns `false` when undo is disabled or
    /// nothing was left to undo; `true` without a dispatch when it could run.
    pub fn y_undo(&self) -> NonChainableCommand {
        self.history_command(UndoCoordinator::can_undo, UndoCoordinator::undo)
    }

    /// Redo the last undone change.
    pub fn y_redo(&self) -> NonChainableCommand {
        self.history_command(UndoCoordinator::can_redo, UndoCoordinator::redo)
    }

    fn history_command(
        &self,
        ready: fn(&UndoCoordinator) -> bool,
        run: fn(&UndoCoordinator) -> bool,
    ) -> NonChainableCommand {
        let disabled = self.options.disable_undo;
        let undo = self.undo_coordinator();
        let target = self
            .binding()
            .map(|binding| (binding.doc(), binding.fragment().to_string()));

        Box::new(move |props: CommandProps<'_>| {
            if disabled {
                return false;
            }
            let Some(undo) = &undo else {
                return false;
            };
            if !ready(undo) {
                return false;
            }
            let Some(dispatch) = props.dispatch else {
                return true;
            };
            if !run(undo) {
                return false;
            }
            if let Some((doc, fragment)) = &target {
                dispatch(echo(doc, fragment));
            }
            true
        })
    }

    pub fn undo_shortcut(&self, props: CommandProps<'_>) -> bool {
        (self.y_undo())(props)
    }

    pub fn redo_shortcut(&self, props: CommandProps<'_>) -> bool {
        (self.y_redo())(props)
    }

    /// Shortcut table of the extension.
    pub fn key_bindings(&self) -> Vec<(NamedShortcut, NonChainableCommand)> {
        vec![
            (NamedShortcut::Undo, self.y_undo()),
            (NamedShortcut::Redo, self.y_redo()),
        ]
    }
}

impl Drop for CollabExtension {
    fn drop(&mut self) {
        self.teardown_plugins();
    }
}

/// Transaction telling the editor to take the shared document as is.
fn echo(doc: &Arc<RwLock<Doc>>, fragment: &str) -> Transaction {
    let (node, _) = Mapping::build(&doc.read(), fragment);
    Transaction::new().replace_doc(node).set_origin(SYNC_ORIGIN)
}
