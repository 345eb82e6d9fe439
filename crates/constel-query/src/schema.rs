//! Schema types: entity types and their bi-directional roles.
//!
//! Every association is symmetric. Declaring `post.paragraph ->
//! many(paragraph) reverse "post"` makes `paragraph.post` a first-class role
//! as well: either the target type declares it explicitly (to attach
//! `mandatory`/cardinality information) or it is materialized automatically as
//! a to-many role pointing back. There is no privileged "owning" side.
//!
//! Schemas are explicit configuration loaded from JSON and passed into each
//! parse/resolve/mutate call. Nothing here is process-global.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cardinality/shape of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    /// A plain attribute value on the entity.
    Scalar,
    /// Association to at most one partner entity.
    ToOne,
    /// Association to any number of partner entities.
    ToMany,
}

impl RoleKind {
    pub fn is_association(self) -> bool {
        matches!(self, RoleKind::ToOne | RoleKind::ToMany)
    }
}

/// A role as declared in a schema document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleDecl {
    pub name: String,
    pub kind: RoleKind,
    /// Target entity type; required for associations, absent for scalars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Name of the same association seen from the target type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse: Option<String>,
    /// A mandatory role is a hard dependency: an entity whose mandatory
    /// partners are all deleted is cascade-deleted too.
    #[serde(default)]
    pub mandatory: bool,
    /// Identifying scalar roles anchor mutation resolution (see the mutation
    /// engine): their submitted values select the current record, all other
    /// submitted values are desired state.
    #[serde(default)]
    pub identifying: bool,
}

/// An entity type as declared in a schema document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTypeDecl {
    pub name: String,
    pub roles: Vec<RoleDecl>,
}

/// The raw, serializable schema document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDoc {
    pub entity_types: Vec<EntityTypeDecl>,
}

/// Resolved information about one role, reverse roles included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleInfo {
    pub name: String,
    pub kind: RoleKind,
    /// Target entity type for associations.
    pub target: Option<String>,
    /// Role name of the same association on the target type.
    pub reverse: Option<String>,
    pub mandatory: bool,
    pub identifying: bool,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("duplicate entity type `{0}`")]
    DuplicateEntityType(String),
    #[error("duplicate role `{role}` on `{entity_type}`")]
    DuplicateRole { entity_type: String, role: String },
    #[error("role `{entity_type}.{role}` is an association but names no target type")]
    MissingTarget { entity_type: String, role: String },
    #[error("role `{entity_type}.{role}` targets unknown entity type `{target}`")]
    UnknownTarget {
        entity_type: String,
        role: String,
        target: String,
    },
    #[error("scalar role `{entity_type}.{role}` must not declare a target or reverse")]
    ScalarWithTarget { entity_type: String, role: String },
    #[error(
        "reverse mismatch: `{entity_type}.{role}` names reverse `{reverse}` \
         but `{target}.{reverse}` does not point back"
    )]
    ReverseMismatch {
        entity_type: String,
        role: String,
        target: String,
        reverse: String,
    },
}

/// A validated schema with both directions of every association resolved.
#[derive(Debug, Clone)]
pub struct Schema {
    types: BTreeMap<String, BTreeMap<String, RoleInfo>>,
}

impl Schema {
    /// Validate a schema document and materialize reverse roles.
    pub fn from_doc(doc: &SchemaDoc) -> Result<Self, SchemaError> {
        let mut types: BTreeMap<String, BTreeMap<String, RoleInfo>> = BTreeMap::new();

        for et in &doc.entity_types {
            if types.contains_key(&et.name) {
                return Err(SchemaError::DuplicateEntityType(et.name.clone()));
            }
            let mut roles = BTreeMap::new();
            for decl in &et.roles {
                if roles.contains_key(&decl.name) {
                    return Err(SchemaError::DuplicateRole {
                        entity_type: et.name.clone(),
                        role: decl.name.clone(),
                    });
                }
                if decl.kind == RoleKind::Scalar && (decl.target.is_some() || decl.reverse.is_some())
                {
                    return Err(SchemaError::ScalarWithTarget {
                        entity_type: et.name.clone(),
                        role: decl.name.clone(),
                    });
                }
                if decl.kind.is_association() && decl.target.is_none() {
                    return Err(SchemaError::MissingTarget {
                        entity_type: et.name.clone(),
                        role: decl.name.clone(),
                    });
                }
                roles.insert(
                    decl.name.clone(),
                    RoleInfo {
                        name: decl.name.clone(),
                        kind: decl.kind,
                        target: decl.target.clone(),
                        reverse: decl.reverse.clone(),
                        mandatory: decl.mandatory,
                        identifying: decl.identifying,
                    },
                );
            }
            types.insert(et.name.clone(), roles);
        }

        // Check targets and materialize missing reverse roles so that both
        // directions of every association are first-class.
        let declared: Vec<(String, RoleInfo)> = types
            .iter()
            .flat_map(|(ty, roles)| roles.values().map(move |r| (ty.clone(), r.clone())))
            .collect();

        for (ty, role) in &declared {
            let Some(target) = role.target.clone() else {
                continue;
            };
            if !types.contains_key(&target) {
                return Err(SchemaError::UnknownTarget {
                    entity_type: ty.clone(),
                    role: role.name.clone(),
                    target,
                });
            }
            let Some(reverse) = role.reverse.clone() else {
                continue;
            };
            let Some(target_roles) = types.get_mut(&target) else {
                continue;
            };
            match target_roles.get(&reverse) {
                Some(existing) => {
                    let points_back = existing.target.as_deref() == Some(ty.as_str())
                        && (existing.reverse.is_none()
                            || existing.reverse.as_deref() == Some(role.name.as_str()));
                    if !points_back {
                        return Err(SchemaError::ReverseMismatch {
                            entity_type: ty.clone(),
                            role: role.name.clone(),
                            target,
                            reverse,
                        });
                    }
                }
                None => {
                    target_roles.insert(
                        reverse.clone(),
                        RoleInfo {
                            name: reverse.clone(),
                            kind: RoleKind::ToMany,
                            target: Some(ty.clone()),
                            reverse: Some(role.name.clone()),
                            mandatory: false,
                            identifying: false,
                        },
                    );
                }
            }
        }

        // Patch reverse names onto explicitly declared counterparts that left
        // theirs implicit.
        let pairs: Vec<(String, String, String)> = types
            .values()
            .flat_map(|roles| {
                roles
                    .values()
                    .filter_map(|r| match (r.target.clone(), r.reverse.clone()) {
                        (Some(t), Some(rev)) => Some((t, rev, r.name.clone())),
                        _ => None,
                    })
            })
            .collect();
        for (target, reverse, role) in pairs {
            if let Some(counterpart) = types.get_mut(&target).and_then(|r| r.get_mut(&reverse)) {
                if counterpart.reverse.is_none() {
                    counterpart.reverse = Some(role);
                }
            }
        }

        Ok(Schema { types })
    }

    /// Parse a schema from its JSON document form.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, SchemaJsonError> {
        let doc: SchemaDoc =
            serde_json::from_value(raw.clone()).map_err(SchemaJsonError::Decode)?;
        Schema::from_doc(&doc).map_err(SchemaJsonError::Invalid)
    }

    /// Does `name` name an entity type?
    pub fn has_entity_type(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// All entity type names, sorted.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Look up a role (either direction) on an entity type.
    pub fn role(&self, entity_type: &str, role: &str) -> Option<&RoleInfo> {
        self.types.get(entity_type)?.get(role)
    }

    /// All roles of an entity type, sorted by name.
    pub fn roles(&self, entity_type: &str) -> impl Iterator<Item = &RoleInfo> {
        self.types
            .get(entity_type)
            .into_iter()
            .flat_map(|roles| roles.values())
    }
}

#[derive(Debug, Error)]
pub enum SchemaJsonError {
    #[error("schema document does not decode: {0}")]
    Decode(#[source] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] SchemaError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blog_doc() -> SchemaDoc {
        serde_json::from_value(json!({
            "entity_types": [
                {
                    "name": "post",
                    "roles": [
                        {"name": "slug", "kind": "scalar", "identifying": true},
                        {"name": "title", "kind": "scalar"},
                        {"name": "author", "kind": "to_one", "target": "author", "reverse": "post"},
                        {"name": "paragraph", "kind": "to_many", "target": "paragraph", "reverse": "post"},
                        {"name": "comment", "kind": "to_many", "target": "comment", "reverse": "post"}
                    ]
                },
                {
                    "name": "author",
                    "roles": [{"name": "name", "kind": "scalar", "identifying": true}]
                },
                {
                    "name": "paragraph",
                    "roles": [
                        {"name": "body", "kind": "scalar"},
                        {"name": "post", "kind": "to_one", "target": "post", "reverse": "paragraph", "mandatory": true}
                    ]
                },
                {
                    "name": "comment",
                    "roles": [{"name": "body", "kind": "scalar"}]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn reverse_roles_are_materialized() {
        let schema = Schema::from_doc(&blog_doc()).unwrap();

        // `author.post` was never declared; it exists because `post.author`
        // names it as reverse.
        let role = schema.role("author", "post").unwrap();
        assert_eq!(role.kind, RoleKind::ToMany);
        assert_eq!(role.target.as_deref(), Some("post"));
        assert_eq!(role.reverse.as_deref(), Some("author"));

        // `comment.post` likewise.
        let role = schema.role("comment", "post").unwrap();
        assert_eq!(role.target.as_deref(), Some("post"));
        assert!(!role.mandatory);
    }

    #[test]
    fn explicit_reverse_keeps_its_declaration() {
        let schema = Schema::from_doc(&blog_doc()).unwrap();
        // `paragraph.post` is declared mandatory; materialization must not
        // clobber it.
        let role = schema.role("paragraph", "post").unwrap();
        assert_eq!(role.kind, RoleKind::ToOne);
        assert!(role.mandatory);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let doc: SchemaDoc = serde_json::from_value(json!({
            "entity_types": [
                {"name": "post", "roles": [
                    {"name": "author", "kind": "to_one", "target": "nobody"}
                ]}
            ]
        }))
        .unwrap();
        assert!(matches!(
            Schema::from_doc(&doc),
            Err(SchemaError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn scalar_with_target_is_rejected() {
        let doc: SchemaDoc = serde_json::from_value(json!({
            "entity_types": [
                {"name": "post", "roles": [
                    {"name": "title", "kind": "scalar", "target": "post"}
                ]}
            ]
        }))
        .unwrap();
        assert!(matches!(
            Schema::from_doc(&doc),
            Err(SchemaError::ScalarWithTarget { .. })
        ));
    }
}
