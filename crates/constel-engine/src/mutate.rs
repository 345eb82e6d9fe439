//! Mutation engine: assert / create / update / delete.
//!
//! Every mutation runs the same state machine:
//!
//! ```text
//! START → RESOLVE_CURRENT → [update: VERIFY_LOCK] → DIFF/VALIDATE → APPLY → COMMIT
//! ```
//!
//! RESOLVE_CURRENT anchors on the *identifying* scalar roles of the resource
//! (declared in the schema): their submitted values select the current
//! record, while other submitted scalars and association partners are desired
//! state, fetched for diffing rather than used as filters. Without that split
//! a strict resolve over all values would return empty whenever a value
//! changed, and `create` could never observe a contradiction. A resource that
//! names no identifying value anchors on its submitted values directly, so it
//! can no-op or create but never rewrite unrelated records.
//!
//! APPLY hands one [`ChangeBatch`] to the store with the revision observed
//! before RESOLVE_CURRENT; the store commits it only if the revision still
//! matches, which makes VERIFY_LOCK → COMMIT effectively atomic. Every
//! mutation either fully commits or has no observable effect.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, warn};

use constel_query::{
    parse_query, MatchArm, MatchMode, NodePayload, QueryModel, QueryNode, RoleInfo, RoleKind,
    Schema,
};

use crate::cancel::CancelToken;
use crate::constellation::EntityId;
use crate::error::{EngineError, EngineResult};
use crate::lockhash::lock_hash;
use crate::port::{ChangeBatch, ChangeOp, EntityRef, Revision, StoreError, StorePort, TempId};
use crate::resolve::Resolver;
use crate::serialize::serialize_constellation;
use crate::value;

/// Outcome of a committed mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    /// Store revision after the commit (unchanged for a no-op).
    pub revision: Revision,
    pub created: Vec<EntityId>,
    pub deleted: Vec<EntityId>,
}

/// The client-facing engine surface: resolve plus the four mutations.
///
/// Holds only borrowed handles; one value per request is the intended use,
/// and concurrent engines over the same store are fine.
pub struct Engine<'a> {
    schema: &'a Schema,
    store: &'a dyn StorePort,
    cancel: CancelToken,
}

impl<'a> Engine<'a> {
    pub fn new(schema: &'a Schema, store: &'a dyn StorePort) -> Self {
        Engine {
            schema,
            store,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn resolver(&self) -> Resolver<'a> {
        Resolver::new(self.schema, self.store).with_cancel(self.cancel.clone())
    }

    /// Resolve a raw query: returns the nested result values and the lock
    /// hash over them.
    pub fn resolve(&self, raw: &Value) -> EngineResult<(Value, String)> {
        let model = parse_query(raw, self.schema)?;
        let constellation = self.resolver().resolve(&model)?;
        let hash = lock_hash(&constellation);
        Ok((serialize_constellation(&constellation), hash))
    }

    /// Assert the facts named by the resource: overwrite contradicting
    /// values, create the record when none exists, leave the rest untouched.
    pub fn assert(&self, raw: &Value) -> EngineResult<MutationOutcome> {
        self.upsert(raw, true)
    }

    /// Like assert, but an existing record with a differing submitted value
    /// fails with `Contradiction` instead of being overwritten.
    pub fn create(&self, raw: &Value) -> EngineResult<MutationOutcome> {
        self.upsert(raw, false)
    }

    fn upsert(&self, raw: &Value, overwrite: bool) -> EngineResult<MutationOutcome> {
        let model = parse_query(raw, self.schema)?;
        self.cancel.checkpoint()?;
        let expected = self.store.revision();
        let mut batch = ChangeBatch::default();

        for root in &model.roots {
            let entity_type = root.role.clone();
            let anchor = QueryModel {
                roots: vec![self.anchor_node(&entity_type, root, &entity_type, false)?],
            };
            let current = self.resolver().resolve(&anchor)?;
            let matched = current.top_level_entities();
            debug!(
                entity_type,
                matched = matched.len(),
                overwrite,
                "upsert resolved current state"
            );

            if matched.is_empty() {
                self.create_ops(&mut batch, &entity_type, root.children(), &entity_type)?;
            } else {
                for id in matched {
                    self.diff_entity(
                        &mut batch,
                        &entity_type,
                        id,
                        root.children(),
                        &entity_type,
                        overwrite,
                    )?;
                }
            }
        }
        self.commit(batch, expected, false)
    }

    /// Replace the value set denoted by the resource, contingent on the
    /// client's lock hash still matching current state.
    pub fn update(&self, raw: &Value, new_values: &Value, lock: &str) -> EngineResult<MutationOutcome> {
        let model = parse_query(raw, self.schema)?;
        self.cancel.checkpoint()?;
        let expected = self.store.revision();

        let mut anchor_roots = Vec::with_capacity(model.roots.len());
        for root in &model.roots {
            anchor_roots.push(self.anchor_node(&root.role, root, &root.role, true)?);
        }
        let current = self.resolver().resolve(&QueryModel {
            roots: anchor_roots,
        })?;

        // VERIFY_LOCK: byte-for-byte over the fields this resource names.
        let current_hash = lock_hash(&current);
        if current_hash != lock {
            warn!(supplied = lock, "stale lock hash, aborting update");
            return Err(EngineError::LockMismatch);
        }

        let mut batch = ChangeBatch::default();
        for root in &model.roots {
            let vals = new_values
                .get(&root.role)
                .ok_or_else(|| EngineError::IncompleteResource {
                    path: root.role.clone(),
                })?;
            for id in root_entities(&current, &root.role) {
                self.update_entity(&mut batch, &root.role, id, root.children(), vals, &root.role)?;
            }
        }
        self.commit(batch, expected, true)
    }

    /// Delete the top-level matched entities, cascading through mandatory
    /// dependencies; optional dependents survive, orphaned.
    pub fn delete(&self, raw: &Value) -> EngineResult<MutationOutcome> {
        let model = parse_query(raw, self.schema)?;
        self.cancel.checkpoint()?;
        let expected = self.store.revision();
        let current = self.resolver().resolve(&model)?;

        let targets = current.top_level_entities();
        let deleted = self.cascade(&targets)?;
        debug!(
            targets = targets.len(),
            total = deleted.len(),
            "delete cascade computed"
        );

        let mut batch = ChangeBatch::default();
        for id in &deleted {
            batch.ops.push(ChangeOp::DeleteEntity { entity: *id });
        }
        let mut outcome = self.commit(batch, expected, false)?;
        outcome.deleted = deleted.into_iter().collect();
        Ok(outcome)
    }

    fn commit(
        &self,
        batch: ChangeBatch,
        expected: Revision,
        lock_scoped: bool,
    ) -> EngineResult<MutationOutcome> {
        self.cancel.checkpoint()?;
        if batch.is_empty() {
            return Ok(MutationOutcome {
                revision: self.store.revision(),
                ..MutationOutcome::default()
            });
        }
        match self.store.apply(batch, Some(expected)) {
            Ok(receipt) => Ok(MutationOutcome {
                revision: receipt.revision,
                created: receipt.created,
                deleted: Vec::new(),
            }),
            // A racing commit between VERIFY_LOCK and APPLY surfaces as a
            // stale lock for updates and a store conflict otherwise.
            Err(StoreError::RevisionConflict { .. }) if lock_scoped => {
                warn!("revision moved between lock check and apply");
                Err(EngineError::LockMismatch)
            }
            Err(e) => Err(EngineError::Store(e)),
        }
    }

    // ------------------------------------------------------------------
    // Resource interpretation
    // ------------------------------------------------------------------

    /// Build the RESOLVE_CURRENT form of a resource node.
    ///
    /// Submitted values on non-identifying scalar roles become fetch-only so
    /// a changed value cannot hide the current record, but only while an
    /// identifying value still pins it; a node with no identifying value
    /// anchors on its submitted values as-is. With `filter_associations`
    /// unset (upserts), association children fetch their partners instead of
    /// filtering, so a record whose partner differs still resolves and the
    /// diff can see the conflict.
    fn anchor_node(
        &self,
        entity_type: &str,
        node: &QueryNode,
        path: &str,
        filter_associations: bool,
    ) -> EngineResult<QueryNode> {
        let NodePayload::Match { mode, children } = &node.payload else {
            return Ok(node.clone());
        };
        let has_identity = children.iter().any(|c| {
            self.schema
                .role(entity_type, &c.role)
                .map(|r| r.kind == RoleKind::Scalar && r.identifying)
                .unwrap_or(false)
                && submitted_value(c).is_some()
        });
        let mut out_children = Vec::with_capacity(children.len());
        for child in children {
            let child_path = format!("{path}.{}", child.role);
            match &child.payload {
                NodePayload::Aggregate { .. } => {
                    return Err(EngineError::UnresolvableQuery {
                        path: child_path,
                        message: "aggregates cannot appear in a mutation resource".to_string(),
                    });
                }
                NodePayload::Filter { .. } => out_children.push(child.clone()),
                NodePayload::Match { .. } => {
                    let role = self.role_info(entity_type, &child.role, &child_path)?;
                    if role.kind == RoleKind::Scalar {
                        out_children.push(match submitted_value(child) {
                            Some(_) if !role.identifying && has_identity => {
                                fetch_only_node(&child.role)
                            }
                            _ => child.clone(),
                        });
                    } else if filter_associations {
                        let target = role.target.clone().unwrap_or_default();
                        out_children.push(self.anchor_node(&target, child, &child_path, true)?);
                    } else {
                        out_children.push(fetch_only_node(&child.role));
                    }
                }
            }
        }
        Ok(QueryNode {
            role: node.role.clone(),
            recursive: node.recursive,
            payload: NodePayload::Match {
                mode: mode.clone(),
                children: out_children,
            },
        })
    }

    /// Ops that create a fresh entity for this resource subtree, linking or
    /// creating its association partners.
    fn create_ops(
        &self,
        batch: &mut ChangeBatch,
        entity_type: &str,
        children: &[QueryNode],
        path: &str,
    ) -> EngineResult<TempId> {
        let temp = batch.next_temp();
        batch.ops.push(ChangeOp::CreateEntity {
            temp,
            entity_type: entity_type.to_string(),
        });
        let me = EntityRef::New(temp);

        for child in children {
            let child_path = format!("{path}.{}", child.role);
            let role = self.role_info(entity_type, &child.role, &child_path)?;
            if role.kind == RoleKind::Scalar {
                let v = submitted_value(child).ok_or_else(|| EngineError::IncompleteResource {
                    path: child_path.clone(),
                })?;
                batch.ops.push(ChangeOp::SetScalar {
                    entity: me,
                    role: child.role.clone(),
                    value: v,
                });
            } else {
                let target = role.target.clone().unwrap_or_default();
                for partner in self.desired_partners(batch, &target, child, &child_path)? {
                    batch.ops.push(ChangeOp::Link {
                        from: me,
                        role: child.role.clone(),
                        to: partner,
                    });
                }
            }
        }
        Ok(temp)
    }

    /// Resolve the partners an association child of a resource denotes,
    /// creating them when they do not exist but carry submitted values.
    fn desired_partners(
        &self,
        batch: &mut ChangeBatch,
        target_type: &str,
        child: &QueryNode,
        path: &str,
    ) -> EngineResult<Vec<EntityRef>> {
        let arms: Vec<&[QueryNode]> = match &child.payload {
            NodePayload::Match {
                mode: MatchMode::FetchOnly,
                ..
            } => return Ok(Vec::new()),
            NodePayload::Match {
                mode: MatchMode::Required,
                children,
            } => vec![children.as_slice()],
            NodePayload::Match {
                mode: MatchMode::AnyOf(arms),
                ..
            } => arms
                .iter()
                .filter_map(|arm| match arm {
                    MatchArm::Nested(children) => Some(children.as_slice()),
                    _ => None,
                })
                .collect(),
            _ => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for arm_children in arms {
            let anchor = QueryNode {
                role: target_type.to_string(),
                recursive: false,
                payload: NodePayload::Match {
                    mode: MatchMode::Required,
                    children: arm_children.to_vec(),
                },
            };
            let anchored = self.anchor_node(target_type, &anchor, path, true)?;
            let found = self
                .resolver()
                .resolve(&QueryModel {
                    roots: vec![anchored],
                })?
                .top_level_entities();
            if found.is_empty() {
                let temp = self.create_ops(batch, target_type, arm_children, path)?;
                out.push(EntityRef::New(temp));
            } else {
                out.extend(found.into_iter().map(EntityRef::Existing));
            }
        }
        Ok(out)
    }

    /// Diff an existing entity against the resource: contradicting scalars
    /// are overwritten (assert) or rejected (create); missing facts are
    /// filled in; unmentioned facts stay untouched.
    fn diff_entity(
        &self,
        batch: &mut ChangeBatch,
        entity_type: &str,
        id: EntityId,
        children: &[QueryNode],
        path: &str,
        overwrite: bool,
    ) -> EngineResult<()> {
        for child in children {
            let child_path = format!("{path}.{}", child.role);
            let role = self.role_info(entity_type, &child.role, &child_path)?;
            if role.kind == RoleKind::Scalar {
                let submitted =
                    submitted_value(child).ok_or_else(|| EngineError::IncompleteResource {
                        path: child_path.clone(),
                    })?;
                self.cancel.checkpoint()?;
                match self.store.fetch_scalar(id, &child.role)? {
                    Some(existing) if value::value_eq(&existing, &submitted) => {}
                    Some(existing) if !overwrite => {
                        warn!(path = child_path, "create contradicts existing fact");
                        return Err(EngineError::Contradiction {
                            path: child_path,
                            existing,
                            submitted,
                        });
                    }
                    _ => batch.ops.push(ChangeOp::SetScalar {
                        entity: EntityRef::Existing(id),
                        role: child.role.clone(),
                        value: submitted,
                    }),
                }
            } else {
                let target = role.target.clone().unwrap_or_default();
                if !has_submitted_content(child) {
                    continue;
                }
                self.cancel.checkpoint()?;
                let current = self.store.fetch_associated(id, &child.role)?;

                // Partners already satisfying the nested anchor are kept and
                // diffed; absent partners are linked in (or created).
                let wanted = nested_children(child).unwrap_or(&[]);
                let shell = QueryNode {
                    role: child.role.clone(),
                    recursive: false,
                    payload: NodePayload::Match {
                        mode: MatchMode::Required,
                        children: wanted.to_vec(),
                    },
                };
                let anchored = self.anchor_node(&target, &shell, &child_path, true)?;
                let mut satisfied = Vec::new();
                for p in &current {
                    let kept = self
                        .resolver()
                        .resolve_one(&target, *p, anchored.children())?;
                    if kept {
                        satisfied.push(*p);
                    }
                }
                if satisfied.is_empty() {
                    // A to-one partner that fails the submitted match is an
                    // existing fact the resource contradicts.
                    if role.kind == RoleKind::ToOne && !overwrite {
                        if let Some(&existing) = current.first() {
                            warn!(path = child_path, "create contradicts existing partner");
                            return Err(EngineError::Contradiction {
                                path: child_path,
                                existing: self.partner_summary(&target, existing, wanted)?,
                                submitted: submitted_summary(wanted),
                            });
                        }
                    }
                    for partner in self.desired_partners(batch, &target, child, &child_path)? {
                        batch.ops.push(ChangeOp::Link {
                            from: EntityRef::Existing(id),
                            role: child.role.clone(),
                            to: partner,
                        });
                    }
                } else {
                    for p in satisfied {
                        self.diff_entity(batch, &target, p, wanted, &child_path, overwrite)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply `new_values` to one matched entity of an update resource.
    fn update_entity(
        &self,
        batch: &mut ChangeBatch,
        entity_type: &str,
        id: EntityId,
        children: &[QueryNode],
        new_values: &Value,
        path: &str,
    ) -> EngineResult<()> {
        for child in children {
            let child_path = format!("{path}.{}", child.role);
            if matches!(child.payload, NodePayload::Filter { .. }) {
                continue;
            }
            let role = self.role_info(entity_type, &child.role, &child_path)?;
            let Some(desired) = new_values.get(&child.role) else {
                // Omitted keys keep their current value.
                continue;
            };
            if role.kind == RoleKind::Scalar {
                self.cancel.checkpoint()?;
                let existing = self.store.fetch_scalar(id, &child.role)?;
                if desired.is_null() {
                    if existing.is_some() {
                        batch.ops.push(ChangeOp::ClearScalar {
                            entity: EntityRef::Existing(id),
                            role: child.role.clone(),
                        });
                    }
                } else if !matches!(&existing, Some(v) if value::value_eq(v, desired)) {
                    batch.ops.push(ChangeOp::SetScalar {
                        entity: EntityRef::Existing(id),
                        role: child.role.clone(),
                        value: desired.clone(),
                    });
                }
            } else {
                let target = role.target.clone().unwrap_or_default();
                self.replace_association(batch, id, &role, &target, desired, &child_path)?;
            }
        }
        Ok(())
    }

    /// Replace the partner set of one association role with the entities the
    /// desired values denote (by their identifying scalars).
    fn replace_association(
        &self,
        batch: &mut ChangeBatch,
        id: EntityId,
        role: &RoleInfo,
        target_type: &str,
        desired: &Value,
        path: &str,
    ) -> EngineResult<()> {
        let wanted_specs: Vec<&Value> = match desired {
            Value::Null => Vec::new(),
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        let mut wanted = Vec::new();
        for spec in wanted_specs {
            let Some(map) = spec.as_object() else {
                return Err(EngineError::IncompleteResource {
                    path: path.to_string(),
                });
            };
            let mut filters = Vec::new();
            for (k, v) in map {
                filters.push(QueryNode {
                    role: k.clone(),
                    recursive: false,
                    payload: NodePayload::Match {
                        mode: MatchMode::AnyOf(vec![MatchArm::Literal(v.clone())]),
                        children: Vec::new(),
                    },
                });
            }
            let found = self
                .resolver()
                .resolve(&QueryModel {
                    roots: vec![QueryNode {
                        role: target_type.to_string(),
                        recursive: false,
                        payload: NodePayload::Match {
                            mode: MatchMode::Required,
                            children: filters.clone(),
                        },
                    }],
                })?
                .top_level_entities();
            if found.is_empty() {
                let temp = self.create_ops(batch, target_type, &filters, path)?;
                wanted.push(EntityRef::New(temp));
            } else {
                wanted.extend(found.into_iter().map(EntityRef::Existing));
            }
        }

        self.cancel.checkpoint()?;
        let current = self.store.fetch_associated(id, &role.name)?;
        for p in &current {
            if !wanted.contains(&EntityRef::Existing(*p)) {
                batch.ops.push(ChangeOp::Unlink {
                    from: EntityRef::Existing(id),
                    role: role.name.clone(),
                    to: EntityRef::Existing(*p),
                });
            }
        }
        for w in wanted {
            if !matches!(w, EntityRef::Existing(p) if current.contains(&p)) {
                batch.ops.push(ChangeOp::Link {
                    from: EntityRef::Existing(id),
                    role: role.name.clone(),
                    to: w,
                });
            }
        }
        Ok(())
    }

    /// Transitive closure of mandatory dependents over the initial targets.
    fn cascade(&self, targets: &[EntityId]) -> EngineResult<BTreeSet<EntityId>> {
        let mut deleted: BTreeSet<EntityId> = targets.iter().copied().collect();
        let mut queue: Vec<EntityId> = targets.to_vec();

        while let Some(e) = queue.pop() {
            self.cancel.checkpoint()?;
            let ty = self.store.entity_type_of(e)?;
            let roles: Vec<RoleInfo> = self.schema.roles(&ty).cloned().collect();
            for role in roles.iter().filter(|r| r.kind.is_association()) {
                let Some(reverse) = role.reverse.as_deref() else {
                    continue;
                };
                let Some(target_ty) = role.target.as_deref() else {
                    continue;
                };
                let depends = self
                    .schema
                    .role(target_ty, reverse)
                    .map(|r| r.mandatory)
                    .unwrap_or(false);
                if !depends {
                    continue;
                }
                self.cancel.checkpoint()?;
                for p in self.store.fetch_associated(e, &role.name)? {
                    if deleted.contains(&p) {
                        continue;
                    }
                    // p holds a mandatory role pointing back; it survives only
                    // if some partner of that role is not being deleted.
                    self.cancel.checkpoint()?;
                    let survives = self
                        .store
                        .fetch_associated(p, reverse)?
                        .into_iter()
                        .any(|q| !deleted.contains(&q));
                    if !survives {
                        deleted.insert(p);
                        queue.push(p);
                    }
                }
            }
        }
        Ok(deleted)
    }

    /// The existing partner's side of a contradiction: its values for the
    /// scalar roles the resource named.
    fn partner_summary(
        &self,
        entity_type: &str,
        id: EntityId,
        children: &[QueryNode],
    ) -> EngineResult<Value> {
        let mut map = serde_json::Map::new();
        for child in children {
            let is_scalar = self
                .schema
                .role(entity_type, &child.role)
                .map(|r| r.kind == RoleKind::Scalar)
                .unwrap_or(false);
            if !is_scalar {
                continue;
            }
            self.cancel.checkpoint()?;
            if let Some(v) = self.store.fetch_scalar(id, &child.role)? {
                map.insert(child.role.clone(), v);
            }
        }
        Ok(Value::Object(map))
    }

    fn role_info(&self, entity_type: &str, role: &str, path: &str) -> EngineResult<RoleInfo> {
        self.schema
            .role(entity_type, role)
            .cloned()
            .ok_or_else(|| EngineError::UnresolvableQuery {
                path: path.to_string(),
                message: "role not in schema".to_string(),
            })
    }
}

/// The single submitted value of a scalar resource child, if it names one.
fn submitted_value(node: &QueryNode) -> Option<Value> {
    match &node.payload {
        NodePayload::Match {
            mode: MatchMode::AnyOf(arms),
            ..
        } => match arms.as_slice() {
            [MatchArm::Literal(v)] => Some(v.clone()),
            _ => None,
        },
        _ => None,
    }
}

/// The nested resource children of an association child: the object form or
/// a single-arm array. Multi-arm and fetch-only children carry none.
fn nested_children(node: &QueryNode) -> Option<&[QueryNode]> {
    match &node.payload {
        NodePayload::Match {
            mode: MatchMode::Required,
            children,
        } => Some(children),
        NodePayload::Match {
            mode: MatchMode::AnyOf(arms),
            ..
        } => match arms.as_slice() {
            [MatchArm::Nested(children)] => Some(children),
            _ => None,
        },
        _ => None,
    }
}

/// The submitted side of a contradiction: the values the resource named.
fn submitted_summary(children: &[QueryNode]) -> Value {
    let mut map = serde_json::Map::new();
    for child in children {
        if let Some(v) = submitted_value(child) {
            map.insert(child.role.clone(), v);
        }
    }
    Value::Object(map)
}

fn fetch_only_node(role: &str) -> QueryNode {
    QueryNode {
        role: role.to_string(),
        recursive: false,
        payload: NodePayload::Match {
            mode: MatchMode::FetchOnly,
            children: Vec::new(),
        },
    }
}

/// Does this association subtree carry any submitted values (so that an
/// upsert should materialize it)?
fn has_submitted_content(node: &QueryNode) -> bool {
    match &node.payload {
        NodePayload::Match {
            mode: MatchMode::FetchOnly,
            ..
        } => false,
        NodePayload::Match {
            mode: MatchMode::Required,
            children,
        } => !children.is_empty(),
        NodePayload::Match {
            mode: MatchMode::AnyOf(arms),
            ..
        } => arms
            .iter()
            .any(|arm| matches!(arm, MatchArm::Nested(c) if !c.is_empty())),
        _ => false,
    }
}

fn root_entities(
    current: &crate::constellation::Constellation,
    role: &str,
) -> Vec<EntityId> {
    use crate::constellation::ResultNode;
    for (name, node) in &current.roots {
        if name != role {
            continue;
        }
        return match node {
            ResultNode::Many(items) => items
                .iter()
                .filter_map(|n| match n {
                    ResultNode::Entity { id, .. } => Some(*id),
                    _ => None,
                })
                .collect(),
            ResultNode::Entity { id, .. } => vec![*id],
            _ => Vec::new(),
        };
    }
    Vec::new()
}
