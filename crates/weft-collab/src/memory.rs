//! In-memory realtime provider for tests, demos and simulation.
//!
//! A [`MemoryHub`] plays the role of the network: every connected
//! [`MemoryProvider`] gets an unbounded inbox. Local document updates are
//! relayed to all other peers as they are committed; incoming messages are
//! applied when the owner calls [`MemoryProvider::pump`].

use crate::provider::Provider;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use weft_doc::{Awareness, AwarenessUpdate, ClientId, Doc, Origin, StateVector, SubscriptionId, Update};

/// Origin tag of updates applied from the hub.
pub const PROVIDER_ORIGIN: &str = "provider";

/// Messages exchanged through the hub.
#[derive(Clone, Debug)]
pub enum HubMessage {
    /// "This is what I have." Peers answer with the missing state.
    SyncStep1 { state_vector: StateVector, reply: bool },
    /// The missing state, encoded.
    SyncStep2(Vec<u8>),
    /// An incremental update, encoded.
    Update(Vec<u8>),
    /// An awareness update, encoded.
    Awareness(Vec<u8>),
    /// The sender disconnected.
    Leave,
}

#[derive(Clone, Debug)]
struct Envelope {
    from: ClientId,
    message: HubMessage,
}

type Inbox = mpsc::UnboundedSender<Envelope>;

/// A shared in-memory "network" connecting providers.
#[derive(Clone, Default)]
pub struct MemoryHub {
    peers: Arc<RwLock<HashMap<ClientId, Inbox>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn join(&self, client: ClientId, inbox: Inbox) {
        self.peers.write().insert(client, inbox);
    }

    fn leave(&self, client: ClientId) {
        self.peers.write().remove(&client);
    }

    fn send(&self, from: ClientId, to: ClientId, message: HubMessage) {
        if let Some(inbox) = self.peers.read().get(&to) {
            let _ = inbox.send(Envelope { from, message });
        }
    }

    fn broadcast(&self, from: ClientId, message: HubMessage) {
        for (client, inbox) in self.peers.read().iter() {
            if *client != from {
                let _ = inbox.send(Envelope {
                    from,
                    message: message.clone(),
                });
            }
        }
    }
}

/// A provider connected to a [`MemoryHub`].
pub struct MemoryProvider {
    client_id: ClientId,
    hub: MemoryHub,
    doc: Arc<RwLock<Doc>>,
    awareness: Arc<RwLock<Awareness>>,
    outbox: Inbox,
    inbox: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    subscription: Mutex<Option<SubscriptionId>>,
    connected: AtomicBool,
    destroyed: AtomicBool,
}

impl MemoryProvider {
    /// Create a provider with a fresh document and connect it.
    pub fn new(hub: &MemoryHub, client_id: ClientId) -> Arc<Self> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            client_id,
            hub: hub.clone(),
            doc: Arc::new(RwLock::new(Doc::new(client_id))),
            awareness: Arc::new(RwLock::new(Awareness::new(client_id))),
            outbox,
            inbox: Mutex::new(inbox),
            subscription: Mutex::new(None),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        provider.connect();
        provider
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Join the hub and start the sync handshake. No-op if already
    /// connected or destroyed.
    pub fn connect(&self) {
        if self.is_destroyed() || self.connected.swap(true, Ordering::SeqCst) {
            return;
        }

        self.hub.join(self.client_id, self.outbox.clone());

        let hub = self.hub.clone();
        let client = self.client_id;
        let subscription = self.doc.write().observe_update(move |event| {
            if !event.local {
                return;
            }
            match event.update.encode() {
                Ok(bytes) => hub.broadcast(client, HubMessage::Update(bytes)),
                Err(err) => warn!(error = %err, "failed to encode local update"),
            }
        });
        *self.subscription.lock() = Some(subscription);

        let state_vector = self.doc.read().state_vector();
        self.hub.broadcast(
            self.client_id,
            HubMessage::SyncStep1 {
                state_vector,
                reply: true,
            },
        );
        // Edits made while offline go out without waiting for the handshake
        let offline = self.doc.read().encode_state();
        if !offline.is_empty() {
            match offline.encode() {
                Ok(bytes) => self.hub.broadcast(self.client_id, HubMessage::Update(bytes)),
                Err(err) => warn!(error = %err, "failed to encode offline state"),
            }
        }
        self.broadcast_awareness(self.awareness.read().encode_update());
        debug!(client = %self.client_id, peers = self.hub.peer_count(), "memory provider connected");
    }

    /// Apply every queued message. Returns how many were handled.
    pub fn pump(&self) -> usize {
        if let Some(update) = self.awareness.write().take_local_update() {
            if self.is_connected() {
                self.broadcast_awareness(update);
            }
        }

        let mut handled = 0;
        loop {
            let next = self.inbox.lock().try_recv();
            let Ok(envelope) = next else {
                break;
            };
            self.handle(envelope);
            handled += 1;
        }
        handled
    }

    fn handle(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            HubMessage::SyncStep1 {
                state_vector,
                reply,
            } => {
                let diff = self.doc.read().diff_update(&state_vector);
                match diff.encode() {
                    Ok(bytes) => self.hub.send(self.client_id, from, HubMessage::SyncStep2(bytes)),
                    Err(err) => warn!(error = %err, "failed to encode sync reply"),
                }
                if reply {
                    let state_vector = self.doc.read().state_vector();
                    self.hub.send(
                        self.client_id,
                        from,
                        HubMessage::SyncStep1 {
                            state_vector,
                            reply: false,
                        },
                    );
                    if let Ok(bytes) = self.awareness.read().encode_update().encode() {
                        self.hub.send(self.client_id, from, HubMessage::Awareness(bytes));
                    }
                }
            }
            HubMessage::SyncStep2(bytes) | HubMessage::Update(bytes) => {
                let result = Update::decode(&bytes).and_then(|update| {
                    self.doc
                        .write()
                        .apply_update(&update, Origin::new(PROVIDER_ORIGIN))
                });
                if let Err(err) = result {
                    warn!(from = %from, error = %err, "dropping undecodable update");
                }
            }
            HubMessage::Awareness(bytes) => match AwarenessUpdate::decode(&bytes) {
                Ok(update) => self.awareness.write().apply_update(&update),
                Err(err) => warn!(from = %from, error = %err, "dropping awareness update"),
            },
            HubMessage::Leave => self.awareness.write().remove_states(&[from]),
        }
    }

    fn broadcast_awareness(&self, update: AwarenessUpdate) {
        match update.encode() {
            Ok(bytes) => self.hub.broadcast(self.client_id, HubMessage::Awareness(bytes)),
            Err(err) => warn!(error = %err, "failed to encode awareness update"),
        }
    }
}

impl Provider for MemoryProvider {
    fn doc(&self) -> Arc<RwLock<Doc>> {
        self.doc.clone()
    }

    fn awareness(&self) -> Arc<RwLock<Awareness>> {
        self.awareness.clone()
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = self.subscription.lock().take() {
            self.doc.write().unobserve_update(subscription);
        }
        self.hub.broadcast(self.client_id, HubMessage::Leave);
        self.hub.leave(self.client_id);
        debug!(client = %self.client_id, "memory provider disconnected");
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
        self.awareness.write().set_local_state(None);
        debug!(client = %self.client_id, "memory provider destroyed");
    }
}
