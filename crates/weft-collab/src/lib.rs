//! # weft-collab
//!
//! Real-time collaborative editing core for Weft.
//!
//! This crate provides:
//! - Position translation between editor offsets and drift-free relative anchors
//! - Range annotations stored in the shared document
//! - A sync binding that keeps editor state and the shared document in step
//! - Origin-aware undo/redo that never reverts other peers' work
//! - Remote cursor presence over awareness
//! - An in-memory provider for wiring peers together without a network
//!
//! ## Example
//!
//! ```rust,ignore
//! use weft_collab::{CollabExtension, CollabOptions, MemoryHub, MemoryProvider, Node, ProviderSource, Transaction};
//! use weft_doc::ClientId;
//!
//! let hub = MemoryHub::new();
//! let provider = MemoryProvider::new(&hub, ClientId(1));
//! let options = CollabOptions::builder()
//!     .provider(ProviderSource::instance(provider))
//!     .build();
//!
//! let mut editor = CollabExtension::new(options)?;
//! editor.create_plugins();
//! editor.dispatch(Transaction::new().insert_node(0, Node::element("paragraph", vec![])))?;
//! editor.dispatch(Transaction::new().insert_text(1, "Hello"))?;
//! assert!(editor.run_command(&editor.y_undo())?);
//! ```

pub mod annotation;
pub mod binding;
pub mod config;
pub mod cursor;
pub mod editor;
pub mod error;
pub mod extension;
pub mod mapping;
pub mod memory;
pub mod plugin;
pub mod position;
pub mod provider;
pub mod registry;
pub mod undo;

// Position translation
pub use mapping::{Mapping, Token};
pub use position::{to_absolute, to_relative};

// Annotations
pub use annotation::{Annotation, AnnotationStore, SharedAnnotationStore};
pub use registry::{AnnotationExtension, ExtensionRegistry};

// Editor model
pub use editor::{
    CommandProps, Dispatch, EditorState, Node, NonChainableCommand, Selection, Step, Transaction,
    TransactionMeta,
};

// Sync binding
pub use binding::{BindingEvent, MappingHandle, SyncBinding, SYNC_NO_HISTORY_ORIGIN, SYNC_ORIGIN};

// Undo
pub use undo::{HistoryEntry, UndoConfig, UndoCoordinator, UNDO_ORIGIN};

// Presence
pub use cursor::{CursorBuilder, CursorDecoration, CursorPlugin, CursorUser, CursorWidget};

// Extension and configuration
pub use config::{
    CollabOptions, CollabOptionsBuilder, CollabOptionsUpdate, ColorDef, OptionKey,
    SelectionGetter, SyncOptions,
};
pub use extension::{CollabExtension, NamedShortcut, OptionsChange};
pub use plugin::{PluginKey, PluginStates, CURSOR_PLUGIN, SYNC_PLUGIN, UNDO_PLUGIN};

// Providers
pub use memory::{HubMessage, MemoryHub, MemoryProvider, PROVIDER_ORIGIN};
pub use provider::{
    default_destroy_provider, DestroyProvider, LazyProvider, Provider, ProviderFactory,
    ProviderSource,
};

// Error exports
pub use error::{CollabError, Result};
