//! JSON snapshot persistence for the in-memory store.
//!
//! A snapshot is the full logical content: entities (id, type, scalars) and
//! the symmetric link rows. Loading validates every record against the
//! schema, so a snapshot written for one schema fails loudly against
//! another instead of resolving nonsense.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use constel_engine::EntityId;
use constel_query::Schema;

use crate::{EntityRecord, Inner, LinkEdge, MemoryStore};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot does not decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("snapshot names unknown entity type `{0}`")]
    UnknownEntityType(String),
    #[error("snapshot link references unknown entity {0}")]
    DanglingLink(EntityId),
    #[error("snapshot has duplicate entity id {0}")]
    DuplicateEntity(EntityId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntity {
    pub id: EntityId,
    pub entity_type: String,
    #[serde(default)]
    pub scalars: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLink {
    pub a: EntityId,
    pub role_a: String,
    pub b: EntityId,
    pub role_b: String,
}

/// Serializable content of one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub entities: Vec<SnapshotEntity>,
    pub links: Vec<SnapshotLink>,
}

impl MemoryStore {
    /// Export the current content. The change log and revision are runtime
    /// state and stay behind.
    pub fn to_snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        Snapshot {
            entities: inner
                .entities
                .iter()
                .map(|(id, r)| SnapshotEntity {
                    id: *id,
                    entity_type: r.entity_type.clone(),
                    scalars: r.scalars.clone(),
                })
                .collect(),
            links: inner
                .links
                .iter()
                .map(|e| SnapshotLink {
                    a: e.a,
                    role_a: e.role_a.clone(),
                    b: e.b,
                    role_b: e.role_b.clone(),
                })
                .collect(),
        }
    }

    /// Build a store from a snapshot, validating it against `schema`.
    pub fn from_snapshot(schema: Schema, snapshot: &Snapshot) -> Result<Self, PersistError> {
        let mut entities = BTreeMap::new();
        let mut next_id: EntityId = 1;
        for e in &snapshot.entities {
            if !schema.has_entity_type(&e.entity_type) {
                return Err(PersistError::UnknownEntityType(e.entity_type.clone()));
            }
            if entities
                .insert(
                    e.id,
                    EntityRecord {
                        entity_type: e.entity_type.clone(),
                        scalars: e.scalars.clone(),
                    },
                )
                .is_some()
            {
                return Err(PersistError::DuplicateEntity(e.id));
            }
            next_id = next_id.max(e.id + 1);
        }

        let mut links = std::collections::BTreeSet::new();
        for l in &snapshot.links {
            for end in [l.a, l.b] {
                if !entities.contains_key(&end) {
                    return Err(PersistError::DanglingLink(end));
                }
            }
            links.insert(LinkEdge::normalized(
                l.a,
                l.role_a.clone(),
                l.b,
                l.role_b.clone(),
            ));
        }

        debug!(
            entities = entities.len(),
            links = links.len(),
            "loaded snapshot"
        );
        Ok(MemoryStore {
            schema,
            inner: parking_lot::RwLock::new(Inner {
                next_id,
                revision: 0,
                entities,
                links,
                changelog: Vec::new(),
            }),
        })
    }

    /// Write the snapshot to `path` as pretty JSON.
    pub fn save_to(&self, path: &Path) -> Result<(), PersistError> {
        let text = serde_json::to_string_pretty(&self.to_snapshot())?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Load a snapshot file against `schema`.
    pub fn load_from(schema: Schema, path: &Path) -> Result<Self, PersistError> {
        let text = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&text)?;
        MemoryStore::from_snapshot(schema, &snapshot)
    }
}
