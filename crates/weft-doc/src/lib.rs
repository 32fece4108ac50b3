//! # weft-doc
//!
//! Shared document CRDT for Weft collaborative editing.
//!
//! This crate provides:
//! - Nested sequences of characters and elements (RGA ordering) under named root fragments
//! - Named Last-Write-Wins maps of JSON values
//! - Atomic transactions tagged with an origin, and update observers
//! - Updates that merge as a join-semilattice, plus state vectors for initial sync
//! - Relative positions that survive concurrent edits
//! - Awareness (ephemeral per-peer presence state)
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use weft_doc::{Assoc, ClientId, Doc, ParentRef};
//!
//! let mut doc = Doc::new(ClientId(1));
//! let root = ParentRef::root("prosemirror");
//! let para = doc
//!     .transact("user", |txn| {
//!         let para = txn.insert_element(&root, None, "paragraph", BTreeMap::new())?;
//!         txn.insert_text(&ParentRef::Item(para), None, "Hello")?;
//!         Ok(para)
//!     })
//!     .unwrap();
//!
//! let anchor = doc
//!     .relative_from_index(&ParentRef::Item(para), 5, Assoc::After)
//!     .unwrap();
//! assert_eq!(doc.resolve_relative(&anchor).unwrap().index, 5);
//! assert_eq!(doc.to_xml_string("prosemirror"), "<paragraph>Hello</paragraph>");
//! ```

pub mod awareness;
pub mod doc;
pub mod error;
pub mod id;
pub mod lattice;
pub mod map;
pub mod relative;
mod store;
pub mod update;

pub use awareness::{Awareness, AwarenessEntry, AwarenessEvent, AwarenessUpdate, PeerState};
pub use doc::{
    Doc, Origin, SubscriptionId, Transaction, TransactionSummary, UpdateEvent, UpdateObserver,
};
pub use error::{DocError, Result};
pub use id::{ClientId, ItemId, ParentRef};
pub use lattice::Lattice;
pub use map::{LwwMap, MapWrite, Stamp};
pub use relative::{Assoc, RelativePosition, ResolvedAnchor};
pub use store::{Content, DeletedItem, ItemRecord};
pub use update::{StateVector, Update};
