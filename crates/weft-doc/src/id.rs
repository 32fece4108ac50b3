//! Replica and item identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifies one replica (one editing peer) of a shared document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Draw a fresh id from ulid entropy.
    pub fn random() -> Self {
        Self(Ulid::new().random() as u64)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Unique identifier of an item (a character or an element) in the document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    /// The replica that created this item.
    pub client: ClientId,
    /// Lamport clock at creation.
    pub clock: u64,
}

impl ItemId {
    pub fn new(client: ClientId, clock: u64) -> Self {
        Self { client, clock }
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher clock = later in causal order
        // Tie-break on client for determinism
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.client.cmp(&other.client))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.client)
    }
}

/// The container an item lives in: a named root fragment or an element item.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParentRef {
    Root(String),
    Item(ItemId),
}

impl ParentRef {
    pub fn root(name: impl Into<String>) -> Self {
        ParentRef::Root(name.into())
    }

    pub fn as_item(&self) -> Option<&ItemId> {
        match self {
            ParentRef::Item(id) => Some(id),
            ParentRef::Root(_) => None,
        }
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentRef::Root(name) => write!(f, "root:{}", name),
            ParentRef::Item(id) => write!(f, "item:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_ordering_uses_clock_first() {
        let a = ItemId::new(ClientId(9), 1);
        let b = ItemId::new(ClientId(1), 2);
        assert!(a < b);

        let c = ItemId::new(ClientId(2), 2);
        assert!(b < c);
    }

    #[test]
    fn test_random_clients_differ() {
        assert_ne!(ClientId::random(), ClientId::random());
    }
}
