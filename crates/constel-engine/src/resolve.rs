//! Resolver/executor: walks a query model depth-first against the schema and
//! store port, producing a result constellation.
//!
//! Strategy (schema-driven, no cost model):
//!
//! 1. each top-level node issues a single `fetch_matching` with its scalar
//!    filters pushed down (no per-child request amplification),
//! 2. every candidate entity resolves its children recursively: scalars read
//!    directly, associations trigger scoped fetches, filters prune, and
//!    aggregates compute over the unfiltered target association unless
//!    filters are nested under the aggregate's own target,
//! 3. `AnyOf` arms implement inner-join-like filtering; `FetchOnly` (empty
//!    array) requests outer-join semantics and never excludes,
//! 4. recursive roles traverse with a visited set per traversal root, so
//!    cyclic graphs terminate and each entity appears once.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use constel_query::{
    AggregateKind, MatchArm, MatchMode, NodePayload, QueryModel, QueryNode, RoleInfo, RoleKind,
    Schema,
};

use crate::cancel::CancelToken;
use crate::constellation::{Constellation, EntityId, ResultNode};
use crate::error::{EngineError, EngineResult};
use crate::port::{ScalarFilter, StorePort};
use crate::value;

/// One resolution pass over one store handle. Stateless between calls.
pub struct Resolver<'a> {
    schema: &'a Schema,
    store: &'a dyn StorePort,
    cancel: CancelToken,
}

impl<'a> Resolver<'a> {
    pub fn new(schema: &'a Schema, store: &'a dyn StorePort) -> Self {
        Resolver {
            schema,
            store,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve a whole query model into a constellation.
    pub fn resolve(&self, model: &QueryModel) -> EngineResult<Constellation> {
        let mut roots = Vec::with_capacity(model.roots.len());
        for node in &model.roots {
            roots.push((node.role.clone(), self.resolve_root(node)?));
        }
        Ok(Constellation { roots })
    }

    /// Does one specific entity satisfy the given child criteria? Used by
    /// the mutation engine to test nested "having" scopes without a
    /// whole-database fetch.
    pub fn resolve_one(
        &self,
        entity_type: &str,
        id: EntityId,
        children: &[QueryNode],
    ) -> EngineResult<bool> {
        Ok(self.resolve_entity(entity_type, id, children)?.is_some())
    }

    /// Resolve one top-level node: whole-database scope for its entity type.
    fn resolve_root(&self, node: &QueryNode) -> EngineResult<ResultNode> {
        let entity_type = node.role.as_str();
        let filters = self.pushdown_filters(entity_type, node.children());
        self.cancel.checkpoint()?;
        let candidates = self.store.fetch_matching(entity_type, &filters)?;
        debug!(
            entity_type,
            candidates = candidates.len(),
            filters = filters.len(),
            "resolved top-level candidates"
        );

        let mut matched = Vec::new();
        for id in candidates {
            if let Some(entity) = self.resolve_entity(entity_type, id, node.children())? {
                matched.push(entity);
            }
        }
        // No match is an empty sequence, not an error.
        Ok(ResultNode::Many(matched))
    }

    /// Scalar filters a top-level fetch can evaluate by itself.
    fn pushdown_filters(&self, entity_type: &str, children: &[QueryNode]) -> Vec<ScalarFilter> {
        let mut filters = Vec::new();
        for child in children {
            let Some(role) = self.schema.role(entity_type, &child.role) else {
                continue;
            };
            if role.kind != RoleKind::Scalar {
                continue;
            }
            match &child.payload {
                NodePayload::Match {
                    mode: MatchMode::AnyOf(arms),
                    ..
                } => {
                    let mut values = Vec::new();
                    let mut accept_absent = false;
                    for arm in arms {
                        match arm {
                            MatchArm::Literal(v) => values.push(v.clone()),
                            MatchArm::Absent => accept_absent = true,
                            MatchArm::Nested(_) => {}
                        }
                    }
                    filters.push(ScalarFilter::AnyOf {
                        role: child.role.clone(),
                        values,
                        accept_absent,
                    });
                }
                NodePayload::Match {
                    mode: MatchMode::Required,
                    children: filter_children,
                } => {
                    for fc in filter_children {
                        if let NodePayload::Filter { op, operand } = &fc.payload {
                            filters.push(ScalarFilter::Compare {
                                role: child.role.clone(),
                                op: *op,
                                operand: operand.clone(),
                            });
                        }
                    }
                }
                _ => {}
            }
        }
        filters
    }

    /// Resolve one entity against a child list. `Ok(None)` means the entity
    /// fails a mandatory/AnyOf criterion and is excluded from its parent.
    fn resolve_entity(
        &self,
        entity_type: &str,
        id: EntityId,
        children: &[QueryNode],
    ) -> EngineResult<Option<ResultNode>> {
        let mut fields = Vec::with_capacity(children.len());
        for child in children {
            match &child.payload {
                NodePayload::Filter { .. } => {
                    // The parser only places filters under scalar roles.
                    return Err(EngineError::UnresolvableQuery {
                        path: child.role.clone(),
                        message: "value filter outside a scalar role".to_string(),
                    });
                }
                NodePayload::Aggregate { kind, target } => {
                    let v = self.resolve_aggregate(entity_type, id, *kind, target)?;
                    fields.push((child.role.clone(), ResultNode::Scalar(v)));
                }
                NodePayload::Match { mode, children: _ } => {
                    let role = self.role_info(entity_type, &child.role)?;
                    let resolved = if role.kind == RoleKind::Scalar {
                        self.resolve_scalar_child(id, &role, mode, child)?
                    } else if child.recursive {
                        self.resolve_recursive_child(id, &role, mode, child)?
                    } else {
                        self.resolve_association_child(id, &role, mode, child)?
                    };
                    match resolved {
                        Some(node) => fields.push((child.display_role(), node)),
                        None => return Ok(None),
                    }
                }
            }
        }
        Ok(Some(ResultNode::Entity { id, fields }))
    }

    fn role_info(&self, entity_type: &str, role: &str) -> EngineResult<RoleInfo> {
        self.schema
            .role(entity_type, role)
            .cloned()
            .ok_or_else(|| EngineError::UnresolvableQuery {
                path: format!("{entity_type}.{role}"),
                message: "role not in schema".to_string(),
            })
    }

    /// Scalar child: read the value, apply filters or arm matching.
    /// `Ok(None)` excludes the parent.
    fn resolve_scalar_child(
        &self,
        id: EntityId,
        role: &RoleInfo,
        mode: &MatchMode,
        child: &QueryNode,
    ) -> EngineResult<Option<ResultNode>> {
        self.cancel.checkpoint()?;
        let fetched = self.store.fetch_scalar(id, &role.name)?;
        match mode {
            MatchMode::FetchOnly => Ok(Some(
                fetched.map(ResultNode::Scalar).unwrap_or(ResultNode::Absent),
            )),
            MatchMode::Required => {
                let Some(v) = fetched else {
                    return Ok(None);
                };
                for fc in child.children() {
                    if let NodePayload::Filter { op, operand } = &fc.payload {
                        if !value::satisfies(&v, *op, operand) {
                            return Ok(None);
                        }
                    }
                }
                Ok(Some(ResultNode::Scalar(v)))
            }
            MatchMode::AnyOf(arms) => {
                let matched = match &fetched {
                    Some(v) => arms.iter().any(|arm| match arm {
                        MatchArm::Literal(want) => value::value_eq(v, want),
                        MatchArm::Absent | MatchArm::Nested(_) => false,
                    }),
                    None => arms.iter().any(|arm| matches!(arm, MatchArm::Absent)),
                };
                if !matched {
                    return Ok(None);
                }
                Ok(Some(
                    fetched.map(ResultNode::Scalar).unwrap_or(ResultNode::Absent),
                ))
            }
        }
    }

    /// Non-recursive association child. `Ok(None)` excludes the parent.
    fn resolve_association_child(
        &self,
        id: EntityId,
        role: &RoleInfo,
        mode: &MatchMode,
        child: &QueryNode,
    ) -> EngineResult<Option<ResultNode>> {
        let target = role.target.as_deref().unwrap_or_default();
        self.cancel.checkpoint()?;
        let partners = self.store.fetch_associated(id, &role.name)?;

        match mode {
            MatchMode::FetchOnly => {
                let mut resolved = Vec::with_capacity(partners.len());
                for p in partners {
                    if let Some(node) = self.resolve_entity(target, p, &[])? {
                        resolved.push(node);
                    }
                }
                Ok(Some(wrap_association(role.kind, resolved)))
            }
            MatchMode::Required => {
                let mut resolved = Vec::with_capacity(partners.len());
                for p in partners {
                    if let Some(node) = self.resolve_entity(target, p, child.children())? {
                        resolved.push(node);
                    }
                }
                if resolved.is_empty() {
                    // Mandatory presence: absence excludes the parent.
                    return Ok(None);
                }
                Ok(Some(wrap_association(role.kind, resolved)))
            }
            MatchMode::AnyOf(arms) => {
                let accepts_absence = arms.iter().any(|arm| matches!(arm, MatchArm::Absent));
                let mut resolved = Vec::new();
                for p in &partners {
                    for arm in arms {
                        if let MatchArm::Nested(children) = arm {
                            if let Some(node) = self.resolve_entity(target, *p, children)? {
                                resolved.push(node);
                                break;
                            }
                        }
                    }
                }
                if resolved.is_empty() {
                    if accepts_absence && partners.is_empty() {
                        return Ok(Some(ResultNode::Absent));
                    }
                    return Ok(None);
                }
                Ok(Some(wrap_association(role.kind, resolved)))
            }
        }
    }

    /// Recursive association child (`role*`): repeated traversal along the
    /// same role, visited set per traversal root, nested-sequence result.
    fn resolve_recursive_child(
        &self,
        id: EntityId,
        role: &RoleInfo,
        mode: &MatchMode,
        child: &QueryNode,
    ) -> EngineResult<Option<ResultNode>> {
        let criteria: &[QueryNode] = match mode {
            MatchMode::Required | MatchMode::FetchOnly => child.children(),
            MatchMode::AnyOf(arms) => match arms.as_slice() {
                [MatchArm::Nested(children)] => children.as_slice(),
                _ => {
                    return Err(EngineError::UnresolvableQuery {
                        path: child.display_role(),
                        message: "recursive role takes a single nested match".to_string(),
                    });
                }
            },
        };
        let target = role.target.as_deref().unwrap_or_default();

        // Distinct recursive nodes must not share visited state; the set is
        // rooted here, at this node under this entity.
        let mut visited: HashSet<EntityId> = HashSet::new();
        visited.insert(id);
        let levels = self.recurse(target, role, child, criteria, id, &mut visited)?;

        if levels.is_empty() && matches!(mode, MatchMode::Required) {
            return Ok(None);
        }
        Ok(Some(ResultNode::Many(levels)))
    }

    fn recurse(
        &self,
        target: &str,
        role: &RoleInfo,
        node: &QueryNode,
        criteria: &[QueryNode],
        from: EntityId,
        visited: &mut HashSet<EntityId>,
    ) -> EngineResult<Vec<ResultNode>> {
        self.cancel.checkpoint()?;
        let partners = self.store.fetch_associated(from, &role.name)?;
        let mut out = Vec::new();
        for p in partners {
            if !visited.insert(p) {
                continue;
            }
            let Some(resolved) = self.resolve_entity(target, p, criteria)? else {
                continue;
            };
            let ResultNode::Entity { id, mut fields } = resolved else {
                continue;
            };
            let deeper = self.recurse(target, role, node, criteria, p, visited)?;
            fields.push((node.display_role(), ResultNode::Many(deeper)));
            out.push(ResultNode::Entity { id, fields });
        }
        Ok(out)
    }

    /// Aggregate over a target role of the current entity.
    fn resolve_aggregate(
        &self,
        entity_type: &str,
        id: EntityId,
        kind: AggregateKind,
        target: &QueryNode,
    ) -> EngineResult<Value> {
        let role = self.role_info(entity_type, &target.role)?;

        if role.kind == RoleKind::Scalar {
            self.cancel.checkpoint()?;
            let fetched = self.store.fetch_scalar(id, &role.name)?;
            return match kind {
                AggregateKind::Count => Ok(Value::from(u64::from(fetched.is_some()))),
                _ => fold(kind, fetched.into_iter().collect(), &target.role),
            };
        }

        let target_type = role.target.as_deref().unwrap_or_default();
        self.cancel.checkpoint()?;
        let partners = self.store.fetch_associated(id, &role.name)?;

        // The aggregate scope is the unfiltered association; only filters
        // nested under the aggregate's own target narrow it.
        let mut matched = Vec::new();
        for p in partners {
            if let Some(node) = self.resolve_entity(target_type, p, target.children())? {
                matched.push(node);
            }
        }

        if kind == AggregateKind::Count {
            return Ok(Value::from(matched.len() as u64));
        }

        // Fold over the scalar values selected by the target's scalar child.
        let scalar_role = target
            .children()
            .iter()
            .find(|c| {
                matches!(c.payload, NodePayload::Match { .. })
                    && self
                        .schema
                        .role(target_type, &c.role)
                        .map(|r| r.kind == RoleKind::Scalar)
                        .unwrap_or(false)
            })
            .map(|c| c.role.clone())
            .ok_or_else(|| EngineError::UnresolvableQuery {
                path: target.role.clone(),
                message: format!("`{}` needs a scalar role under its target", kind.token()),
            })?;

        let mut values = Vec::new();
        for node in &matched {
            if let ResultNode::Entity { fields, .. } = node {
                for (name, field) in fields {
                    if name == &scalar_role {
                        if let ResultNode::Scalar(v) = field {
                            values.push(v.clone());
                        }
                    }
                }
            }
        }
        fold(kind, values, &target.role)
    }
}

fn wrap_association(kind: RoleKind, mut resolved: Vec<ResultNode>) -> ResultNode {
    match kind {
        RoleKind::ToOne => {
            if resolved.is_empty() {
                ResultNode::Absent
            } else {
                resolved.swap_remove(0)
            }
        }
        _ => ResultNode::Many(resolved),
    }
}

/// Fold scalar values into one aggregate result.
fn fold(kind: AggregateKind, values: Vec<Value>, path: &str) -> EngineResult<Value> {
    match kind {
        AggregateKind::Count => Ok(Value::from(values.len() as u64)),
        AggregateKind::Sum | AggregateKind::Avg => {
            let mut sum = 0.0f64;
            let mut all_ints = true;
            for v in &values {
                let Some(f) = v.as_f64() else {
                    return Err(EngineError::UnresolvableQuery {
                        path: path.to_string(),
                        message: format!("`{}` over non-numeric value {v}", kind.token()),
                    });
                };
                all_ints &= v.as_i64().is_some();
                sum += f;
            }
            if kind == AggregateKind::Sum {
                if all_ints {
                    Ok(Value::from(sum as i64))
                } else {
                    Ok(Value::from(sum))
                }
            } else if values.is_empty() {
                Ok(Value::Null)
            } else {
                Ok(Value::from(sum / values.len() as f64))
            }
        }
        AggregateKind::Min | AggregateKind::Max => {
            let mut best: Option<Value> = None;
            for v in values {
                best = Some(match best {
                    None => v,
                    Some(b) => {
                        let ord =
                            value::value_cmp(&v, &b).ok_or_else(|| EngineError::UnresolvableQuery {
                                path: path.to_string(),
                                message: format!("`{}` over incomparable values", kind.token()),
                            })?;
                        let take_new = match kind {
                            AggregateKind::Min => ord.is_lt(),
                            _ => ord.is_gt(),
                        };
                        if take_new {
                            v
                        } else {
                            b
                        }
                    }
                });
            }
            Ok(best.unwrap_or(Value::Null))
        }
    }
}
