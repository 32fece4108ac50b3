//! Range annotations stored in the shared document.
//!
//! Each annotation lives in a named shared map under its id. The stored value
//! holds the payload fields plus `from` and `to` as serialized relative
//! positions, so ranges follow their content through concurrent edits. The
//! field names are part of the persisted layout.

use crate::binding::MappingHandle;
use crate::error::{CollabError, Result};
use crate::mapping::Mapping;
use crate::position::{to_absolute, to_relative};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{trace, warn};
use ulid::Ulid;
use weft_doc::{Doc, RelativePosition};

const ID_FIELD: &str = "id";
const FROM_FIELD: &str = "from";
const TO_FIELD: &str = "to";

/// An annotation with absolute positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub from: usize,
    pub to: usize,
    /// Arbitrary payload, e.g. a class name or comment thread id.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Annotation {
    pub fn new(id: impl Into<String>, from: usize, to: usize) -> Self {
        Self {
            id: id.into(),
            from,
            to,
            data: Map::new(),
        }
    }

    /// An annotation with a fresh unique id.
    pub fn generate(from: usize, to: usize) -> Self {
        Self::new(Ulid::new().to_string(), from, to)
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Storage backend of the annotation feature.
pub trait AnnotationStore: Send + Sync {
    /// Insert an annotation, replacing any existing one with the same id.
    fn add_annotation(&self, annotation: Annotation) -> Result<()>;

    /// Replace the payload of an annotation, keeping its range. Unknown ids
    /// are ignored.
    fn update_annotation(&self, id: &str, data: Map<String, Value>) -> Result<()>;

    /// Remove annotations by id in one transaction. Unknown ids are ignored.
    fn remove_annotations(&self, ids: &[String]) -> Result<()>;

    /// Replace every annotation in one transaction.
    fn set_annotations(&self, annotations: Vec<Annotation>) -> Result<()>;

    /// Every annotation whose range still resolves, with absolute positions.
    fn format_annotations(&self) -> Vec<Annotation>;
}

/// [`AnnotationStore`] backed by a shared map of the collaborative document.
pub struct SharedAnnotationStore {
    doc: Arc<RwLock<Doc>>,
    map_name: String,
    mapping: MappingHandle,
}

impl SharedAnnotationStore {
    pub fn new(doc: Arc<RwLock<Doc>>, map_name: impl Into<String>, mapping: MappingHandle) -> Self {
        Self {
            doc,
            map_name: map_name.into(),
            mapping,
        }
    }

    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    fn current_mapping(&self) -> Result<Arc<Mapping>> {
        self.mapping.get().ok_or(CollabError::NoMapping)
    }

    /// Stored form of an annotation.
    fn to_stored(&self, annotation: Annotation, mapping: &Mapping) -> Result<(String, Value)> {
        let from = to_relative(annotation.from, mapping)?;
        let to = to_relative(annotation.to, mapping)?;

        let mut stored = annotation.data;
        stored.insert(ID_FIELD.into(), Value::String(annotation.id.clone()));
        stored.insert(FROM_FIELD.into(), serde_json::to_value(from)?);
        stored.insert(TO_FIELD.into(), serde_json::to_value(to)?);
        Ok((annotation.id, Value::Object(stored)))
    }

    fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut weft_doc::Transaction<'_>),
    {
        self.doc.write().transact(weft_doc::Origin::none(), |txn| {
            f(txn);
            Ok(())
        })?;
        Ok(())
    }
}

impl AnnotationStore for SharedAnnotationStore {
    fn add_annotation(&self, annotation: Annotation) -> Result<()> {
        let mapping = self.current_mapping()?;
        let (id, stored) = self.to_stored(annotation, &mapping)?;
        trace!(id = %id, "adding annotation");
        self.write(|txn| txn.map_set(&self.map_name, id, stored))
    }

    fn update_annotation(&self, id: &str, data: Map<String, Value>) -> Result<()> {
        let existing = self
            .doc
            .read()
            .map(&self.map_name)
            .and_then(|map| map.get(id))
            .cloned();
        let Some(Value::Object(existing)) = existing else {
            trace!(id, "ignoring update of unknown annotation");
            return Ok(());
        };

        let mut stored = data;
        stored.insert(ID_FIELD.into(), Value::String(id.to_string()));
        for field in [FROM_FIELD, TO_FIELD] {
            if let Some(position) = existing.get(field) {
                stored.insert(field.into(), position.clone());
            }
        }
        self.write(|txn| txn.map_set(&self.map_name, id, Value::Object(stored)))
    }

    fn remove_annotations(&self, ids: &[String]) -> Result<()> {
        self.write(|txn| {
            for id in ids {
                txn.map_delete(&self.map_name, id);
            }
        })
    }

    fn set_annotations(&self, annotations: Vec<Annotation>) -> Result<()> {
        let mapping = self.current_mapping()?;
        // Translate everything first so a bad range leaves the map untouched
        let stored = annotations
            .into_iter()
            .map(|annotation| self.to_stored(annotation, &mapping))
            .collect::<Result<Vec<_>>>()?;

        self.write(|txn| {
            txn.map_clear(&self.map_name);
            for (id, value) in stored {
                txn.map_set(&self.map_name, id, value);
            }
        })
    }

    fn format_annotations(&self) -> Vec<Annotation> {
        let Some(mapping) = self.mapping.get() else {
            return Vec::new();
        };
        let doc = self.doc.read();
        let Some(map) = doc.map(&self.map_name) else {
            return Vec::new();
        };

        let resolve = |value: Option<&Value>| {
            let rel: RelativePosition = serde_json::from_value(value?.clone()).ok()?;
            to_absolute(&doc, &rel, &mapping)
        };

        map.iter()
            .filter_map(|(key, value)| {
                let Value::Object(fields) = value else {
                    warn!(key = %key, "skipping malformed annotation record");
                    return None;
                };
                let from = resolve(fields.get(FROM_FIELD))?;
                let to = resolve(fields.get(TO_FIELD))?;

                let mut data = fields.clone();
                data.remove(FROM_FIELD);
                data.remove(TO_FIELD);
                let id = match data.remove(ID_FIELD) {
                    Some(Value::String(id)) => id,
                    _ => key.clone(),
                };
                Some(Annotation { id, from, to, data })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use weft_doc::{ClientId, ParentRef};

    struct Fixture {
        doc: Arc<RwLock<Doc>>,
        mapping: MappingHandle,
        store: SharedAnnotationStore,
    }

    impl Fixture {
        /// `<paragraph>Hello world</paragraph>`
        fn new() -> Self {
            let mut doc = Doc::new(ClientId(1));
            doc.transact("setup", |txn| {
                let para = txn.insert_element(
                    &ParentRef::root("prosemirror"),
                    None,
                    "paragraph",
                    BTreeMap::new(),
                )?;
                txn.insert_text(&ParentRef::Item(para), None, "Hello world")
            })
            .unwrap();
            let doc = Arc::new(RwLock::new(doc));
            let mapping = MappingHandle::default();
            let store = SharedAnnotationStore::new(doc.clone(), "annotations", mapping.clone());
            let fixture = Self {
                doc,
                mapping,
                store,
            };
            fixture.refresh();
            fixture
        }

        fn refresh(&self) {
            let (_, mapping) = Mapping::build(&self.doc.read(), "prosemirror");
            self.mapping.set(mapping);
        }

        fn para(&self) -> ParentRef {
            ParentRef::Item(self.doc.read().visible_children(&ParentRef::root("prosemirror"))[0])
        }
    }

    #[test]
    fn test_add_and_format() {
        let fx = Fixture::new();
        fx.store
            .add_annotation(Annotation::new("a1", 1, 6).with("className", json!("note")))
            .unwrap();

        let annotations = fx.store.format_annotations();
        assert_eq!(
            annotations,
            vec![Annotation::new("a1", 1, 6).with("className", json!("note"))]
        );
    }

    #[test]
    fn test_stored_layout() {
        let fx = Fixture::new();
        fx.store.add_annotation(Annotation::new("a1", 1, 6)).unwrap();

        let doc = fx.doc.read();
        let stored = doc.map("annotations").and_then(|m| m.get("a1")).unwrap();
        assert_eq!(stored["id"], json!("a1"));
        assert!(serde_json::from_value::<RelativePosition>(stored["from"].clone()).is_ok());
        assert!(serde_json::from_value::<RelativePosition>(stored["to"].clone()).is_ok());
    }

    #[test]
    fn test_add_same_id_overwrites() {
        let fx = Fixture::new();
        fx.store.add_annotation(Annotation::new("a1", 1, 3)).unwrap();
        fx.store.add_annotation(Annotation::new("a1", 7, 12)).unwrap();

        assert_eq!(fx.store.format_annotations(), vec![Annotation::new("a1", 7, 12)]);
    }

    #[test]
    fn test_update_keeps_range_and_replaces_payload() {
        let fx = Fixture::new();
        fx.store
            .add_annotation(Annotation::new("a1", 1, 6).with("color", json!("red")))
            .unwrap();

        let mut data = Map::new();
        data.insert("label".into(), json!("todo"));
        fx.store.update_annotation("a1", data).unwrap();

        assert_eq!(
            fx.store.format_annotations(),
            vec![Annotation::new("a1", 1, 6).with("label", json!("todo"))]
        );
    }

    #[test]
    fn test_update_unknown_id_is_noop() {
        let fx = Fixture::new();
        fx.store.update_annotation("missing", Map::new()).unwrap();
        assert!(fx.doc.read().map("annotations").is_none());
    }

    #[test]
    fn test_remove_ignores_unknown_ids() {
        let fx = Fixture::new();
        fx.store.add_annotation(Annotation::new("a1", 1, 3)).unwrap();
        fx.store.add_annotation(Annotation::new("a2", 3, 5)).unwrap();

        fx.store
            .remove_annotations(&["a1".to_string(), "nope".to_string()])
            .unwrap();
        assert_eq!(fx.store.format_annotations(), vec![Annotation::new("a2", 3, 5)]);
    }

    #[test]
    fn test_set_annotations_is_one_transaction() {
        let fx = Fixture::new();
        fx.store.add_annotation(Annotation::new("old", 1, 3)).unwrap();

        let events = Arc::new(RwLock::new(0usize));
        let counter = events.clone();
        fx.doc.write().observe_update(move |_| *counter.write() += 1);

        fx.store
            .set_annotations(vec![Annotation::new("n1", 1, 2), Annotation::new("n2", 2, 4)])
            .unwrap();
        assert_eq!(*events.read(), 1);
        assert_eq!(
            fx.store.format_annotations(),
            vec![Annotation::new("n1", 1, 2), Annotation::new("n2", 2, 4)]
        );

        fx.store.set_annotations(vec![]).unwrap();
        assert!(fx.store.format_annotations().is_empty());
    }

    #[test]
    fn test_bad_range_leaves_store_untouched() {
        let fx = Fixture::new();
        fx.store.add_annotation(Annotation::new("a1", 1, 3)).unwrap();

        let result = fx
            .store
            .set_annotations(vec![Annotation::new("n1", 1, 99)]);
        assert!(matches!(result, Err(CollabError::OffsetOutOfRange { .. })));
        assert_eq!(fx.store.format_annotations(), vec![Annotation::new("a1", 1, 3)]);
    }

    #[test]
    fn test_range_follows_insert_before_it() {
        let fx = Fixture::new();
        // "world"
        fx.store.add_annotation(Annotation::new("a1", 7, 12)).unwrap();

        let para = fx.para();
        fx.doc
            .write()
            .transact("peer", |txn| txn.insert_text(&para, None, ">> "))
            .unwrap();
        fx.refresh();

        assert_eq!(fx.store.format_annotations(), vec![Annotation::new("a1", 10, 15)]);
    }

    #[test]
    fn test_deleted_anchor_drops_annotation() {
        let fx = Fixture::new();
        fx.store.add_annotation(Annotation::new("a1", 1, 3)).unwrap();

        let para = fx.para();
        let id = para.as_item().copied().unwrap();
        fx.doc.write().transact("peer", |txn| txn.delete(&id)).unwrap();
        fx.refresh();

        assert!(fx.store.format_annotations().is_empty());
    }

    #[test]
    fn test_without_mapping() {
        let doc = Arc::new(RwLock::new(Doc::new(ClientId(1))));
        let store = SharedAnnotationStore::new(doc, "annotations", MappingHandle::default());
        assert_eq!(
            store.add_annotation(Annotation::new("a1", 0, 0)),
            Err(CollabError::NoMapping)
        );
        assert!(store.format_annotations().is_empty());
    }
}
