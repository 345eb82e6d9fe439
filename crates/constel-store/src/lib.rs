//! In-memory reference store for the Constel engine.
//!
//! Facts are held symmetrically: one logical association is one normalized
//! [`LinkEdge`] carrying the role name of *both* endpoints, so "post has
//! paragraph" and "paragraph has post" are the same row read from either
//! side. There is no owning table and no derived inverse index.
//!
//! The store implements the engine's [`StorePort`]: batches apply atomically
//! under a write lock against a scratch copy that is swapped in only on full
//! success, the revision counter backs the engine's compare-and-swap, and
//! every committed batch appends a [`ChangeRecord`] to a capped change log.

pub mod persistence;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use constel_engine::{
    ApplyReceipt, ChangeBatch, ChangeOp, EntityId, EntityRef, Revision, ScalarFilter, StoreError,
    StorePort, TempId,
};
use constel_query::{RoleKind, Schema};

/// How many change records the log retains.
const CHANGELOG_CAP: usize = 1024;

/// One committed batch in the change log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    /// Revision this commit produced.
    pub revision: Revision,
    pub ops: usize,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity_type: String,
    pub scalars: BTreeMap<String, Value>,
}

/// A symmetric link, normalized so `(a, role_a) <= (b, role_b)`.
///
/// `role_a` is the role *of `a`* whose partners include `b`, and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkEdge {
    pub a: EntityId,
    pub role_a: String,
    pub b: EntityId,
    pub role_b: String,
}

impl LinkEdge {
    fn normalized(a: EntityId, role_a: String, b: EntityId, role_b: String) -> Self {
        if (b, role_b.as_str()) < (a, role_a.as_str()) {
            LinkEdge {
                a: b,
                role_a: role_b,
                b: a,
                role_b: role_a,
            }
        } else {
            LinkEdge { a, role_a, b, role_b }
        }
    }

    /// Partner of `entity` through `role`, if this edge carries it.
    fn partner_of(&self, entity: EntityId, role: &str) -> Option<EntityId> {
        if self.a == entity && self.role_a == role {
            Some(self.b)
        } else if self.b == entity && self.role_b == role {
            Some(self.a)
        } else {
            None
        }
    }

    fn touches(&self, entity: EntityId) -> bool {
        self.a == entity || self.b == entity
    }
}

#[derive(Debug, Clone, Default)]
struct Inner {
    next_id: EntityId,
    revision: Revision,
    entities: BTreeMap<EntityId, EntityRecord>,
    links: BTreeSet<LinkEdge>,
    changelog: Vec<ChangeRecord>,
}

/// The reference backend used by tests and the CLI.
pub struct MemoryStore {
    schema: Schema,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(schema: Schema) -> Self {
        MemoryStore {
            schema,
            inner: RwLock::new(Inner {
                next_id: 1,
                ..Inner::default()
            }),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The committed change log, oldest first.
    pub fn changes(&self) -> Vec<ChangeRecord> {
        self.inner.read().changelog.clone()
    }

    /// Test/seeding convenience: create one entity through a regular batch.
    pub fn seed_entity(
        &self,
        entity_type: &str,
        scalars: &[(&str, Value)],
    ) -> Result<EntityId, StoreError> {
        let mut batch = ChangeBatch::default();
        let temp = batch.next_temp();
        batch.ops.push(ChangeOp::CreateEntity {
            temp,
            entity_type: entity_type.to_string(),
        });
        for (role, value) in scalars {
            batch.ops.push(ChangeOp::SetScalar {
                entity: EntityRef::New(temp),
                role: (*role).to_string(),
                value: value.clone(),
            });
        }
        let receipt = self.apply(batch, None)?;
        Ok(receipt.created[0])
    }

    /// Test/seeding convenience: link two existing entities.
    pub fn seed_link(&self, from: EntityId, role: &str, to: EntityId) -> Result<(), StoreError> {
        self.apply(
            ChangeBatch {
                ops: vec![ChangeOp::Link {
                    from: EntityRef::Existing(from),
                    role: role.to_string(),
                    to: EntityRef::Existing(to),
                }],
            },
            None,
        )?;
        Ok(())
    }

    fn role_of(
        &self,
        entities: &BTreeMap<EntityId, EntityRecord>,
        entity: EntityId,
        role: &str,
    ) -> Result<constel_query::RoleInfo, StoreError> {
        let record = entities
            .get(&entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        self.schema
            .role(&record.entity_type, role)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRole {
                entity,
                role: role.to_string(),
            })
    }

    fn resolve_ref(
        created: &BTreeMap<TempId, EntityId>,
        entities: &BTreeMap<EntityId, EntityRecord>,
        r: EntityRef,
    ) -> Result<EntityId, StoreError> {
        match r {
            EntityRef::Existing(id) => {
                if entities.contains_key(&id) {
                    Ok(id)
                } else {
                    Err(StoreError::UnknownEntity(id))
                }
            }
            EntityRef::New(temp) => created.get(&temp).copied().ok_or_else(|| {
                StoreError::Backend(format!("temp id {} referenced before creation", temp.0))
            }),
        }
    }
}

impl StorePort for MemoryStore {
    fn revision(&self) -> Revision {
        self.inner.read().revision
    }

    fn fetch_matching(
        &self,
        entity_type: &str,
        filters: &[ScalarFilter],
    ) -> Result<Vec<EntityId>, StoreError> {
        if !self.schema.has_entity_type(entity_type) {
            return Err(StoreError::UnknownEntityType(entity_type.to_string()));
        }
        let inner = self.inner.read();
        let mut out = Vec::new();
        for (id, record) in &inner.entities {
            if record.entity_type != entity_type {
                continue;
            }
            let ok = filters
                .iter()
                .all(|f| f.matches(record.scalars.get(f.role())));
            if ok {
                out.push(*id);
            }
        }
        Ok(out)
    }

    fn fetch_scalar(&self, entity: EntityId, role: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read();
        let record = inner
            .entities
            .get(&entity)
            .ok_or(StoreError::UnknownEntity(entity))?;
        Ok(record.scalars.get(role).cloned())
    }

    fn fetch_associated(&self, entity: EntityId, role: &str) -> Result<Vec<EntityId>, StoreError> {
        let inner = self.inner.read();
        if !inner.entities.contains_key(&entity) {
            return Err(StoreError::UnknownEntity(entity));
        }
        Ok(inner
            .links
            .iter()
            .filter_map(|edge| edge.partner_of(entity, role))
            .collect())
    }

    fn entity_type_of(&self, entity: EntityId) -> Result<String, StoreError> {
        let inner = self.inner.read();
        inner
            .entities
            .get(&entity)
            .map(|r| r.entity_type.clone())
            .ok_or(StoreError::UnknownEntity(entity))
    }

    fn apply(
        &self,
        batch: ChangeBatch,
        expected: Option<Revision>,
    ) -> Result<ApplyReceipt, StoreError> {
        let mut inner = self.inner.write();
        if let Some(exp) = expected {
            if exp != inner.revision {
                return Err(StoreError::RevisionConflict {
                    expected: exp,
                    actual: inner.revision,
                });
            }
        }

        // All-or-nothing: mutate a scratch copy, swap in on full success.
        let mut entities = inner.entities.clone();
        let mut links = inner.links.clone();
        let mut next_id = inner.next_id;
        let mut created: BTreeMap<TempId, EntityId> = BTreeMap::new();
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();

        for op in &batch.ops {
            match op {
                ChangeOp::CreateEntity { temp, entity_type } => {
                    if !self.schema.has_entity_type(entity_type) {
                        return Err(StoreError::UnknownEntityType(entity_type.clone()));
                    }
                    let id = next_id;
                    next_id += 1;
                    entities.insert(
                        id,
                        EntityRecord {
                            entity_type: entity_type.clone(),
                            scalars: BTreeMap::new(),
                        },
                    );
                    created.insert(*temp, id);
                    *counts.entry("create").or_default() += 1;
                }
                ChangeOp::SetScalar { entity, role, value } => {
                    let id = Self::resolve_ref(&created, &entities, *entity)?;
                    let info = self.role_of(&entities, id, role)?;
                    if info.kind != RoleKind::Scalar {
                        return Err(StoreError::UnknownRole {
                            entity: id,
                            role: role.clone(),
                        });
                    }
                    if let Some(record) = entities.get_mut(&id) {
                        record.scalars.insert(role.clone(), value.clone());
                    }
                    *counts.entry("set").or_default() += 1;
                }
                ChangeOp::ClearScalar { entity, role } => {
                    let id = Self::resolve_ref(&created, &entities, *entity)?;
                    if let Some(record) = entities.get_mut(&id) {
                        record.scalars.remove(role);
                    }
                    *counts.entry("clear").or_default() += 1;
                }
                ChangeOp::Link { from, role, to } => {
                    let from_id = Self::resolve_ref(&created, &entities, *from)?;
                    let to_id = Self::resolve_ref(&created, &entities, *to)?;
                    let info = self.role_of(&entities, from_id, role)?;
                    if !info.kind.is_association() {
                        return Err(StoreError::UnknownRole {
                            entity: from_id,
                            role: role.clone(),
                        });
                    }
                    let Some(reverse) = info.reverse.clone() else {
                        return Err(StoreError::Backend(format!(
                            "association role `{role}` has no reverse direction"
                        )));
                    };
                    // To-one roles hold at most one partner on either side.
                    if info.kind == RoleKind::ToOne {
                        links.retain(|e| e.partner_of(from_id, role).is_none());
                    }
                    if let Some(partner_info) = self
                        .schema
                        .role(&info.target.clone().unwrap_or_default(), &reverse)
                    {
                        if partner_info.kind == RoleKind::ToOne {
                            links.retain(|e| e.partner_of(to_id, &reverse).is_none());
                        }
                    }
                    links.insert(LinkEdge::normalized(
                        from_id,
                        role.clone(),
                        to_id,
                        reverse,
                    ));
                    *counts.entry("link").or_default() += 1;
                }
                ChangeOp::Unlink { from, role, to } => {
                    let from_id = Self::resolve_ref(&created, &entities, *from)?;
                    let to_id = Self::resolve_ref(&created, &entities, *to)?;
                    links.retain(|e| {
                        !(e.partner_of(from_id, role) == Some(to_id))
                    });
                    *counts.entry("unlink").or_default() += 1;
                }
                ChangeOp::DeleteEntity { entity } => {
                    if entities.remove(entity).is_none() {
                        return Err(StoreError::UnknownEntity(*entity));
                    }
                    links.retain(|e| !e.touches(*entity));
                    *counts.entry("delete").or_default() += 1;
                }
            }
        }

        let ops = batch.ops.len();
        inner.entities = entities;
        inner.links = links;
        inner.next_id = next_id;
        inner.revision += 1;

        let summary = counts
            .iter()
            .map(|(k, v)| format!("{k}:{v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let record = ChangeRecord {
            id: Uuid::new_v4(),
            at: Utc::now(),
            revision: inner.revision,
            ops,
            summary,
        };
        debug!(revision = inner.revision, ops, "committed batch");
        inner.changelog.push(record);
        if inner.changelog.len() > CHANGELOG_CAP {
            let drop = inner.changelog.len() - CHANGELOG_CAP;
            inner.changelog.drain(..drop);
        }

        let created_ids = created.values().copied().collect();
        Ok(ApplyReceipt {
            revision: inner.revision,
            created: created_ids,
        })
    }
}
