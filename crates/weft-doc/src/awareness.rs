//! Awareness - ephemeral per-peer state such as cursors and user names.
//!
//! Awareness state is never persisted in the document. Each peer owns one
//! JSON object and bumps a clock whenever it changes; remote copies are
//! replaced only by states carrying a higher clock.

use crate::error::Result;
use crate::id::ClientId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// One peer's awareness state.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerState {
    pub clock: u64,
    pub fields: Map<String, Value>,
    /// Local receive time (milliseconds since epoch).
    pub last_updated: u64,
}

/// Wire entry for one peer. `state: None` announces that the peer left.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client: ClientId,
    pub clock: u64,
    pub state: Option<Map<String, Value>>,
}

/// A batch of awareness changes exchanged between peers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Awareness change notifications.
#[derive(Clone, Debug, PartialEq)]
pub enum AwarenessEvent {
    Added(ClientId),
    Updated(ClientId),
    Removed(ClientId),
}

/// Awareness tracker for one replica.
#[derive(Debug)]
pub struct Awareness {
    client_id: ClientId,
    states: HashMap<ClientId, PeerState>,
    local_clock: u64,
    local_dirty: bool,
    event_tx: broadcast::Sender<AwarenessEvent>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            client_id,
            states: HashMap::new(),
            local_clock: 0,
            local_dirty: false,
            event_tx,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Subscribe to awareness events.
    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessEvent> {
        self.event_tx.subscribe()
    }

    /// The local state, if any.
    pub fn local_state(&self) -> Option<&Map<String, Value>> {
        self.states.get(&self.client_id).map(|s| &s.fields)
    }

    /// Replace the local state. `None` marks this peer as gone.
    pub fn set_local_state(&mut self, state: Option<Map<String, Value>>) {
        self.local_clock += 1;
        self.local_dirty = true;
        let event = match state {
            Some(fields) => {
                let existed = self
                    .states
                    .insert(
                        self.client_id,
                        PeerState {
                            clock: self.local_clock,
                            fields,
                            last_updated: now_millis(),
                        },
                    )
                    .is_some();
                if existed {
                    AwarenessEvent::Updated(self.client_id)
                } else {
                    AwarenessEvent::Added(self.client_id)
                }
            }
            None => {
                self.states.remove(&self.client_id);
                AwarenessEvent::Removed(self.client_id)
            }
        };
        let _ = self.event_tx.send(event);
    }

    /// Set one field of the local state, creating the state if needed.
    pub fn set_local_field(&mut self, field: &str, value: Value) {
        let mut fields = self.local_state().cloned().unwrap_or_default();
        fields.insert(field.to_string(), value);
        self.set_local_state(Some(fields));
    }

    /// All known states, keyed by client.
    pub fn states(&self) -> &HashMap<ClientId, PeerState> {
        &self.states
    }

    /// States of every peer except this one.
    pub fn remote_states(&self) -> impl Iterator<Item = (&ClientId, &PeerState)> + '_ {
        self.states
            .iter()
            .filter(move |(client, _)| **client != self.client_id)
    }

    /// The full local state as an update, for answering a joining peer.
    pub fn encode_update(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client: self.client_id,
                clock: self.local_clock,
                state: self.local_state().cloned(),
            }],
        }
    }

    /// Take the local change made since the last call, if any.
    pub fn take_local_update(&mut self) -> Option<AwarenessUpdate> {
        if !self.local_dirty {
            return None;
        }
        self.local_dirty = false;
        Some(self.encode_update())
    }

    /// Apply an update from another peer.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) {
        for entry in &update.entries {
            if entry.client == self.client_id {
                continue;
            }
            let known = self.states.get(&entry.client).map(|s| s.clock);
            if matches!(known, Some(clock) if clock >= entry.clock) {
                continue;
            }

            let event = match &entry.state {
                Some(fields) => {
                    self.states.insert(
                        entry.client,
                        PeerState {
                            clock: entry.clock,
                            fields: fields.clone(),
                            last_updated: now_millis(),
                        },
                    );
                    if known.is_some() {
                        AwarenessEvent::Updated(entry.client)
                    } else {
                        AwarenessEvent::Added(entry.client)
                    }
                }
                None => {
                    if self.states.remove(&entry.client).is_none() {
                        continue;
                    }
                    AwarenessEvent::Removed(entry.client)
                }
            };
            trace!(client = %entry.client, clock = entry.clock, "awareness update");
            let _ = self.event_tx.send(event);
        }
    }

    /// Forget remote peers, e.g. when their connection closes.
    pub fn remove_states(&mut self, clients: &[ClientId]) {
        for client in clients {
            if *client != self.client_id && self.states.remove(client).is_some() {
                let _ = self.event_tx.send(AwarenessEvent::Removed(*client));
            }
        }
    }

    /// Drop remote peers not heard from within `timeout_ms`.
    pub fn remove_stale(&mut self, timeout_ms: u64) -> Vec<ClientId> {
        let now = now_millis();
        let stale: Vec<ClientId> = self
            .remote_states()
            .filter(|(_, state)| now.saturating_sub(state.last_updated) > timeout_ms)
            .map(|(client, _)| *client)
            .collect();
        self.remove_states(&stale);
        stale
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_local_field_round_trip() {
        let mut a = Awareness::new(ClientId(1));
        let mut b = Awareness::new(ClientId(2));

        a.set_local_field("cursor", json!({"anchor": 1}));
        let update = a.take_local_update().unwrap();
        assert!(a.take_local_update().is_none());

        b.apply_update(&update);
        let state = &b.states()[&ClientId(1)];
        assert_eq!(state.fields["cursor"], json!({"anchor": 1}));
    }

    #[test]
    fn test_older_clock_is_ignored() {
        let mut a = Awareness::new(ClientId(1));
        let mut b = Awareness::new(ClientId(2));

        a.set_local_field("name", json!("old"));
        let old = a.encode_update();
        a.set_local_field("name", json!("new"));
        let new = a.encode_update();

        b.apply_update(&new);
        b.apply_update(&old);
        assert_eq!(b.states()[&ClientId(1)].fields["name"], json!("new"));
    }

    #[test]
    fn test_null_state_removes_peer() {
        let mut a = Awareness::new(ClientId(1));
        let mut b = Awareness::new(ClientId(2));
        let mut events = b.subscribe();

        a.set_local_field("name", json!("a"));
        b.apply_update(&a.encode_update());
        a.set_local_state(None);
        b.apply_update(&a.encode_update());

        assert!(b.states().get(&ClientId(1)).is_none());
        assert_eq!(events.try_recv().unwrap(), AwarenessEvent::Added(ClientId(1)));
        assert_eq!(events.try_recv().unwrap(), AwarenessEvent::Removed(ClientId(1)));
    }

    #[test]
    fn test_remove_stale_keeps_local() {
        let mut a = Awareness::new(ClientId(1));
        a.set_local_field("name", json!("me"));
        a.apply_update(&AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client: ClientId(3),
                clock: 1,
                state: Some(Map::new()),
            }],
        });

        // With a zero window anything older than now is stale
        std::thread::sleep(std::time::Duration::from_millis(2));
        let removed = a.remove_stale(0);
        assert_eq!(removed, vec![ClientId(3)]);
        assert!(a.local_state().is_some());
    }
}
