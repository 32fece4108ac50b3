//! Document updates, state vectors and their encoding.

use crate::error::Result;
use crate::id::{ClientId, ItemId};
use crate::lattice::Lattice;
use crate::map::MapWrite;
use crate::store::ItemRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A batch of changes exchanged between replicas.
///
/// Items are kept in ascending id order, which is also dependency order:
/// an item's parent and origin always carry a smaller Lamport clock.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub items: Vec<ItemRecord>,
    pub deletes: BTreeSet<ItemId>,
    pub map_writes: Vec<MapWrite>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deletes.is_empty() && self.map_writes.is_empty()
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Lattice for Update {
    fn bottom() -> Self {
        Self::default()
    }

    fn join(&self, other: &Self) -> Self {
        let mut items: BTreeMap<ItemId, ItemRecord> = BTreeMap::new();
        for record in self.items.iter().chain(other.items.iter()) {
            items.entry(record.id).or_insert_with(|| record.clone());
        }

        let deletes = self.deletes.union(&other.deletes).copied().collect();

        let mut writes: BTreeMap<(String, String), MapWrite> = BTreeMap::new();
        for write in self.map_writes.iter().chain(other.map_writes.iter()) {
            let key = (write.map.clone(), write.key.clone());
            match writes.get(&key) {
                Some(existing) if existing.stamp >= write.stamp => {}
                _ => {
                    writes.insert(key, write.clone());
                }
            }
        }

        Update {
            items: items.into_values().collect(),
            deletes,
            map_writes: writes.into_values().collect(),
        }
    }
}

/// Highest clock seen per client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ClientId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock known for a client (0 if none).
    pub fn get(&self, client: &ClientId) -> u64 {
        self.0.get(client).copied().unwrap_or(0)
    }

    /// Record that an item is known.
    pub fn observe(&mut self, id: &ItemId) {
        let entry = self.0.entry(id.client).or_insert(0);
        *entry = (*entry).max(id.clock);
    }

    /// Lower a client's entry so that `id` is no longer covered.
    pub fn exclude(&mut self, id: &ItemId) {
        if let Some(entry) = self.0.get_mut(&id.client) {
            *entry = (*entry).min(id.clock.saturating_sub(1));
        }
    }

    /// Whether an item is covered by this vector.
    pub fn covers(&self, id: &ItemId) -> bool {
        id.clock <= self.get(&id.client)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ParentRef;
    use crate::map::Stamp;
    use crate::store::Content;
    use serde_json::json;

    fn char_record(client: u64, clock: u64, ch: char) -> ItemRecord {
        ItemRecord {
            id: ItemId::new(ClientId(client), clock),
            parent: ParentRef::root("doc"),
            origin: None,
            content: Content::Char(ch),
        }
    }

    #[test]
    fn test_join_orders_items_by_id() {
        let a = Update {
            items: vec![char_record(1, 3, 'c')],
            ..Default::default()
        };
        let b = Update {
            items: vec![char_record(2, 1, 'a')],
            ..Default::default()
        };

        let joined = a.join(&b);
        assert_eq!(joined.items[0].id.clock, 1);
        assert_eq!(joined.items[1].id.clock, 3);
        assert_eq!(joined, b.join(&a));
    }

    #[test]
    fn test_join_keeps_latest_map_write() {
        let write = |clock, value| MapWrite {
            map: "annotations".into(),
            key: "a1".into(),
            value: Some(json!(value)),
            stamp: Stamp::new(clock, ClientId(1)),
        };
        let a = Update {
            map_writes: vec![write(1, "old")],
            ..Default::default()
        };
        let b = Update {
            map_writes: vec![write(2, "new")],
            ..Default::default()
        };

        let joined = a.join(&b);
        assert_eq!(joined.map_writes.len(), 1);
        assert_eq!(joined.map_writes[0].value, Some(json!("new")));
        assert!(a.leq(&joined));
    }

    #[test]
    fn test_encode_decode() {
        let update = Update {
            items: vec![char_record(1, 1, 'x')],
            deletes: [ItemId::new(ClientId(2), 7)].into_iter().collect(),
            map_writes: Vec::new(),
        };
        let bytes = update.encode().unwrap();
        assert_eq!(Update::decode(&bytes).unwrap(), update);
    }

    #[test]
    fn test_state_vector_covers() {
        let mut sv = StateVector::new();
        sv.observe(&ItemId::new(ClientId(1), 4));
        sv.observe(&ItemId::new(ClientId(1), 2));

        assert!(sv.covers(&ItemId::new(ClientId(1), 4)));
        assert!(!sv.covers(&ItemId::new(ClientId(1), 5)));
        assert!(!sv.covers(&ItemId::new(ClientId(2), 1)));
    }

    #[test]
    fn test_state_vector_exclude() {
        let mut sv = StateVector::new();
        sv.observe(&ItemId::new(ClientId(1), 9));
        sv.exclude(&ItemId::new(ClientId(1), 4));
        sv.exclude(&ItemId::new(ClientId(2), 4));

        assert!(sv.covers(&ItemId::new(ClientId(1), 3)));
        assert!(!sv.covers(&ItemId::new(ClientId(1), 4)));
        assert!(!sv.covers(&ItemId::new(ClientId(1), 9)));
        assert_eq!(sv.get(&ClientId(2)), 0);
    }
}
