//! Realtime provider contract and lazy provider resolution.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use weft_doc::{Awareness, Doc};

/// Connects a shared document and its awareness channel to other peers.
///
/// `disconnect` and `destroy` may be called any number of times.
pub trait Provider: Send + Sync {
    /// The shared document this provider synchronizes.
    fn doc(&self) -> Arc<RwLock<Doc>>;

    /// The presence channel for per-peer metadata such as cursors.
    fn awareness(&self) -> Arc<RwLock<Awareness>>;

    fn disconnect(&self);

    fn destroy(&self);
}

/// Builds a provider on first use.
pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// Tears a provider down when it is replaced or the extension is destroyed.
pub type DestroyProvider = Arc<dyn Fn(&dyn Provider) + Send + Sync>;

/// Where the extension gets its provider from.
#[derive(Clone)]
pub enum ProviderSource {
    Instance(Arc<dyn Provider>),
    Factory(ProviderFactory),
}

impl ProviderSource {
    pub fn instance<P: Provider + 'static>(provider: Arc<P>) -> Self {
        ProviderSource::Instance(provider)
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn Provider> + Send + Sync + 'static,
    {
        ProviderSource::Factory(Arc::new(factory))
    }

    fn resolve(&self) -> Arc<dyn Provider> {
        match self {
            ProviderSource::Instance(provider) => provider.clone(),
            ProviderSource::Factory(factory) => factory(),
        }
    }

    /// Identity comparison.
    pub fn same_as(&self, other: &ProviderSource) -> bool {
        match (self, other) {
            (ProviderSource::Instance(a), ProviderSource::Instance(b)) => Arc::ptr_eq(a, b),
            (ProviderSource::Factory(a), ProviderSource::Factory(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ProviderSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderSource::Instance(_) => write!(f, "ProviderSource::Instance"),
            ProviderSource::Factory(_) => write!(f, "ProviderSource::Factory"),
        }
    }
}

/// Disconnect, destroy the provider, then destroy its document.
pub fn default_destroy_provider() -> DestroyProvider {
    Arc::new(|provider: &dyn Provider| {
        provider.disconnect();
        provider.destroy();
        provider.doc().write().destroy();
    })
}

/// A provider that is resolved on first access and then memoized.
pub struct LazyProvider {
    source: ProviderSource,
    resolved: Option<Arc<dyn Provider>>,
}

impl LazyProvider {
    pub fn new(source: ProviderSource) -> Self {
        Self {
            source,
            resolved: None,
        }
    }

    /// Resolve once and cache.
    pub fn get(&mut self) -> Arc<dyn Provider> {
        if let Some(provider) = &self.resolved {
            return provider.clone();
        }
        debug!(source = ?self.source, "resolving realtime provider");
        let provider = self.source.resolve();
        self.resolved = Some(provider.clone());
        provider
    }

    /// The cached provider, without resolving.
    pub fn resolved(&self) -> Option<Arc<dyn Provider>> {
        self.resolved.clone()
    }

    pub fn source(&self) -> &ProviderSource {
        &self.source
    }

    /// Switch to a new source, handing back the previously resolved provider.
    pub fn replace(&mut self, source: ProviderSource) -> Option<Arc<dyn Provider>> {
        self.source = source;
        self.resolved.take()
    }

    /// Forget the cached provider, handing it back for teardown.
    pub fn take(&mut self) -> Option<Arc<dyn Provider>> {
        self.resolved.take()
    }
}
