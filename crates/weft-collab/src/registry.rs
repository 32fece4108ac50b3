//! Capability registry used to find optional co-extensions.

use crate::annotation::{Annotation, AnnotationStore};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Extensions installed in one editor, keyed by type.
#[derive(Default)]
pub struct ExtensionRegistry {
    inner: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an extension, replacing any previous one of the same type.
    pub fn register<T: Any + Send + Sync>(&mut self, extension: Arc<T>) {
        self.inner.insert(TypeId::of::<T>(), extension);
    }

    /// Look up an extension; `None` when it is not installed.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.get(&TypeId::of::<T>())?.clone().downcast().ok()
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.inner.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// The annotation feature as seen by the collaboration extension: it accepts
/// a store and can be asked to redraw.
#[derive(Default)]
pub struct AnnotationExtension {
    store: RwLock<Option<Arc<dyn AnnotationStore>>>,
    redraws: AtomicUsize,
}

impl AnnotationExtension {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `store` for every annotation operation from now on.
    pub fn set_store(&self, store: Arc<dyn AnnotationStore>) {
        *self.store.write() = Some(store);
    }

    pub fn store(&self) -> Option<Arc<dyn AnnotationStore>> {
        self.store.read().clone()
    }

    /// Re-resolve every annotation against the current document.
    pub fn redraw_annotations(&self) -> Vec<Annotation> {
        self.redraws.fetch_add(1, Ordering::SeqCst);
        let annotations = self
            .store()
            .map(|store| store.format_annotations())
            .unwrap_or_default();
        trace!(count = annotations.len(), "redrawing annotations");
        annotations
    }

    /// How many times annotations were redrawn.
    pub fn redraw_count(&self) -> usize {
        self.redraws.load(Ordering::SeqCst)
    }
}
