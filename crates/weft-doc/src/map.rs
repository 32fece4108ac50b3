//! Last-Write-Wins map of JSON values.
//!
//! Each key is an LWW register: the write with the highest stamp wins, with
//! ties broken on the writing client. Deletes are writes of `None`, so a
//! delete and a concurrent set resolve like any two writes.

use crate::id::ClientId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Ordering stamp of a map write (Lamport clock, then client).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub client: ClientId,
}

impl Stamp {
    pub fn new(clock: u64, client: ClientId) -> Self {
        Self { clock, client }
    }
}

/// Wire form of a single write to a named map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapWrite {
    pub map: String,
    pub key: String,
    /// `None` records a delete.
    pub value: Option<Value>,
    pub stamp: Stamp,
}

#[derive(Clone, Debug, PartialEq)]
struct Register {
    value: Option<Value>,
    stamp: Stamp,
}

/// A named map inside a shared document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LwwMap {
    entries: BTreeMap<String, Register>,
}

impl LwwMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live value at a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|r| r.value.as_ref())
    }

    /// Check if a key holds a live value.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterate over live entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|(k, r)| r.value.as_ref().map(|v| (k, v)))
    }

    /// Live keys in key order.
    pub fn keys(&self) -> Vec<String> {
        self.iter().map(|(k, _)| k.clone()).collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a write; returns whether it won.
    pub(crate) fn apply(&mut self, key: &str, value: Option<Value>, stamp: Stamp) -> bool {
        match self.entries.get_mut(key) {
            Some(existing) if existing.stamp >= stamp => false,
            Some(existing) => {
                existing.value = value;
                existing.stamp = stamp;
                true
            }
            None => {
                self.entries
                    .insert(key.to_string(), Register { value, stamp });
                true
            }
        }
    }

    /// Every register (tombstones included) as writes, for state transfer.
    pub(crate) fn writes(&self, map: &str) -> Vec<MapWrite> {
        self.entries
            .iter()
            .map(|(key, r)| MapWrite {
                map: map.to_string(),
                key: key.clone(),
                value: r.value.clone(),
                stamp: r.stamp,
            })
            .collect()
    }
}
