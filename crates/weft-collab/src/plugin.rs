//! Typed access to plugin-local state.
//!
//! Plugin states live in a [`PluginStates`] owned by one editor instance and
//! are read through a typed [`PluginKey`], so nothing is looked up through
//! process-wide globals.

use crate::binding::SyncBinding;
use crate::cursor::CursorPlugin;
use crate::undo::UndoCoordinator;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed handle to one plugin's state.
pub struct PluginKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PluginKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PluginKey<T> {}

impl<T> fmt::Debug for PluginKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PluginKey({})", self.name)
    }
}

impl<T: Any + Send + Sync> PluginKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn get<'a>(&self, states: &'a PluginStates) -> Option<&'a T> {
        states.inner.get(self.name)?.downcast_ref()
    }

    pub fn get_mut<'a>(&self, states: &'a mut PluginStates) -> Option<&'a mut T> {
        states.inner.get_mut(self.name)?.downcast_mut()
    }
}

/// Sync binding state.
pub const SYNC_PLUGIN: PluginKey<SyncBinding> = PluginKey::new("sync");
/// Cursor presence state.
pub const CURSOR_PLUGIN: PluginKey<CursorPlugin> = PluginKey::new("cursor");
/// Undo coordinator state.
pub const UNDO_PLUGIN: PluginKey<Arc<UndoCoordinator>> = PluginKey::new("undo");

/// The installed plugin set of one editor.
#[derive(Default)]
pub struct PluginStates {
    inner: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl PluginStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a plugin state, returning `false` if it replaced another.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: PluginKey<T>, state: T) -> bool {
        self.inner.insert(key.name, Box::new(state)).is_none()
    }

    pub fn remove<T: Any + Send + Sync>(&mut self, key: PluginKey<T>) -> Option<T> {
        let boxed = self.inner.remove(key.name)?;
        boxed.downcast::<T>().ok().map(|state| *state)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// Installed plugin names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.inner.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Drop every plugin state.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl fmt::Debug for PluginStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginStates")
            .field("plugins", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: PluginKey<usize> = PluginKey::new("counter");
    const LABEL: PluginKey<String> = PluginKey::new("label");

    #[test]
    fn test_typed_access() {
        let mut states = PluginStates::new();
        assert!(states.insert(COUNTER, 1));
        states.insert(LABEL, "hello".to_string());

        *COUNTER.get_mut(&mut states).unwrap() += 1;
        assert_eq!(COUNTER.get(&states), Some(&2));
        assert_eq!(LABEL.get(&states).map(String::as_str), Some("hello"));
        assert_eq!(states.names(), vec!["counter", "label"]);
    }

    #[test]
    fn test_wrong_type_is_none() {
        let mut states = PluginStates::new();
        states.insert(COUNTER, 1);
        let imposter: PluginKey<String> = PluginKey::new("counter");
        assert!(imposter.get(&states).is_none());
    }

    #[test]
    fn test_remove_and_replace() {
        let mut states = PluginStates::new();
        states.insert(COUNTER, 1);
        assert!(!states.insert(COUNTER, 5));
        assert_eq!(states.remove(COUNTER), Some(5));
        assert!(states.is_empty());
    }
}
