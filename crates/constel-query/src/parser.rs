//! Query parser: raw JSON tree → validated [`QueryModel`].
//!
//! Key classification is an explicit, fixed-precedence step (no reflection):
//!
//! 1. operator token (`<`, `<=`, `=`, `!=`, `>=`, `>`, `~`) → value filter
//! 2. aggregate token (`count`, `sum`, `avg`, `min`, `max`) → aggregate
//! 3. anything else → role lookup on the parent entity type, either direction
//!
//! Unknown role names fail immediately with the offending dotted path; they
//! are never silently ignored.

use serde_json::Value;
use thiserror::Error;

use crate::node::{
    AggregateKind, FilterOp, MatchArm, MatchMode, NodePayload, QueryModel, QueryNode,
};
use crate::schema::{RoleInfo, RoleKind, Schema};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("query root must be a non-empty object")]
    RootShape,
    #[error("unknown entity type `{name}` at `{path}`")]
    UnknownEntityType { path: String, name: String },
    #[error("unknown role `{role}` on `{entity_type}` at `{path}`")]
    UnknownRole {
        path: String,
        entity_type: String,
        role: String,
    },
    #[error("operator `{op}` at `{path}` must compare a scalar role")]
    OperatorPlacement { path: String, op: String },
    #[error("operator `{op}` at `{path}` needs a scalar literal operand")]
    OperatorOperand { path: String, op: String },
    #[error("scalar role at `{path}` cannot take a nested object match")]
    ScalarNested { path: String },
    #[error("association role at `{path}` cannot match a bare literal")]
    AssociationLiteral { path: String },
    #[error("entity content at `{path}` must be an object, `[]`, or a single nested object")]
    EntityContent { path: String },
    #[error("recursive role at `{path}` must be an association back onto `{entity_type}`")]
    RecursiveNotSelf { path: String, entity_type: String },
    #[error("recursion marker is not allowed on a top-level entity type at `{path}`")]
    RecursiveTopLevel { path: String },
    #[error("aggregate at `{path}`: {message}")]
    BadAggregate { path: String, message: String },
}

/// Parse and validate a raw query against `schema`.
///
/// Top-level keys name entity types (the query is scoped to the whole
/// database); nested keys are classified per the precedence above.
pub fn parse_query(raw: &Value, schema: &Schema) -> Result<QueryModel, ParseError> {
    let Some(map) = raw.as_object() else {
        return Err(ParseError::RootShape);
    };
    if map.is_empty() {
        return Err(ParseError::RootShape);
    }

    let mut roots = Vec::with_capacity(map.len());
    for (key, value) in map {
        if key.ends_with('*') {
            return Err(ParseError::RecursiveTopLevel { path: key.clone() });
        }
        if !schema.has_entity_type(key) {
            return Err(ParseError::UnknownEntityType {
                path: key.clone(),
                name: key.clone(),
            });
        }
        let children = parse_entity_content(schema, key, value, key)?;
        roots.push(QueryNode {
            role: key.clone(),
            recursive: false,
            payload: NodePayload::Match {
                mode: entity_content_mode(value),
                children,
            },
        });
    }
    Ok(QueryModel { roots })
}

fn join(path: &str, key: &str) -> String {
    format!("{path}.{key}")
}

/// Mode implied by the content shape of an entity-scoped node.
fn entity_content_mode(value: &Value) -> MatchMode {
    match value {
        Value::Array(items) if items.is_empty() => MatchMode::FetchOnly,
        _ => MatchMode::Required,
    }
}

/// Parse the content of a node scoped to `entity_type`: an object of child
/// keys, or an array form at top level.
fn parse_entity_content(
    schema: &Schema,
    entity_type: &str,
    value: &Value,
    path: &str,
) -> Result<Vec<QueryNode>, ParseError> {
    match value {
        Value::Object(map) => parse_entity_children(schema, entity_type, map, path),
        // Top-level `{"post": []}` fetches all posts with no nested shape.
        Value::Array(items) if items.is_empty() => Ok(Vec::new()),
        Value::Array(items) => {
            // Arm unions live on association roles, not at entity scope; the
            // array form here only tolerates a single nested object.
            if let [Value::Object(map)] = items.as_slice() {
                parse_entity_children(schema, entity_type, map, path)
            } else {
                Err(ParseError::EntityContent {
                    path: path.to_string(),
                })
            }
        }
        _ => Err(ParseError::EntityContent {
            path: path.to_string(),
        }),
    }
}

/// Classify and parse every key of an object scoped to `entity_type`.
fn parse_entity_children(
    schema: &Schema,
    entity_type: &str,
    map: &serde_json::Map<String, Value>,
    path: &str,
) -> Result<Vec<QueryNode>, ParseError> {
    let mut children = Vec::with_capacity(map.len());
    for (key, value) in map {
        let child_path = join(path, key);
        if let Some(op) = FilterOp::from_token(key) {
            // Operators compare the value of the *enclosing scalar role*;
            // directly under an entity there is nothing to compare.
            return Err(ParseError::OperatorPlacement {
                path: child_path,
                op: op.token().to_string(),
            });
        }
        if let Some(kind) = AggregateKind::from_token(key) {
            children.push(parse_aggregate(schema, entity_type, kind, value, &child_path)?);
            continue;
        }
        children.push(parse_role(schema, entity_type, key, value, &child_path)?);
    }
    Ok(children)
}

fn parse_role(
    schema: &Schema,
    entity_type: &str,
    key: &str,
    value: &Value,
    path: &str,
) -> Result<QueryNode, ParseError> {
    let (role_name, recursive) = match key.strip_suffix('*') {
        Some(stripped) => (stripped, true),
        None => (key, false),
    };
    let Some(role) = schema.role(entity_type, role_name) else {
        return Err(ParseError::UnknownRole {
            path: path.to_string(),
            entity_type: entity_type.to_string(),
            role: role_name.to_string(),
        });
    };
    if recursive {
        let self_referential =
            role.kind.is_association() && role.target.as_deref() == Some(entity_type);
        if !self_referential {
            return Err(ParseError::RecursiveNotSelf {
                path: path.to_string(),
                entity_type: entity_type.to_string(),
            });
        }
    }

    let payload = if role.kind == RoleKind::Scalar {
        parse_scalar_content(value, path)?
    } else {
        parse_association_content(schema, role, value, path)?
    };
    Ok(QueryNode {
        role: role_name.to_string(),
        recursive,
        payload,
    })
}

/// Content of a scalar role: literals, operator objects, or arrays thereof.
fn parse_scalar_content(value: &Value, path: &str) -> Result<NodePayload, ParseError> {
    match value {
        Value::Object(map) => {
            let mut filters = Vec::with_capacity(map.len());
            for (key, operand) in map {
                let Some(op) = FilterOp::from_token(key) else {
                    return Err(ParseError::ScalarNested {
                        path: join(path, key),
                    });
                };
                if operand.is_object() || operand.is_array() {
                    return Err(ParseError::OperatorOperand {
                        path: join(path, key),
                        op: op.token().to_string(),
                    });
                }
                filters.push(QueryNode {
                    role: op.token().to_string(),
                    recursive: false,
                    payload: NodePayload::Filter {
                        op,
                        operand: operand.clone(),
                    },
                });
            }
            Ok(NodePayload::Match {
                mode: MatchMode::Required,
                children: filters,
            })
        }
        Value::Array(items) if items.is_empty() => Ok(NodePayload::Match {
            mode: MatchMode::FetchOnly,
            children: Vec::new(),
        }),
        Value::Array(items) => {
            let mut arms = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Null => arms.push(MatchArm::Absent),
                    Value::Object(_) | Value::Array(_) => {
                        return Err(ParseError::ScalarNested {
                            path: path.to_string(),
                        });
                    }
                    literal => arms.push(MatchArm::Literal(literal.clone())),
                }
            }
            Ok(NodePayload::Match {
                mode: MatchMode::AnyOf(arms),
                children: Vec::new(),
            })
        }
        // Bare `null` means "value may be absent".
        Value::Null => Ok(NodePayload::Match {
            mode: MatchMode::AnyOf(vec![MatchArm::Absent]),
            children: Vec::new(),
        }),
        // Bare literal is shorthand for a one-element AnyOf.
        literal => Ok(NodePayload::Match {
            mode: MatchMode::AnyOf(vec![MatchArm::Literal(literal.clone())]),
            children: Vec::new(),
        }),
    }
}

/// Content of an association role: nested objects, arrays of arms, or `[]`.
fn parse_association_content(
    schema: &Schema,
    role: &RoleInfo,
    value: &Value,
    path: &str,
) -> Result<NodePayload, ParseError> {
    let target = role.target.as_deref().unwrap_or_default();
    match value {
        Value::Object(map) => {
            let children = parse_entity_children(schema, target, map, path)?;
            Ok(NodePayload::Match {
                mode: MatchMode::Required,
                children,
            })
        }
        Value::Array(items) if items.is_empty() => Ok(NodePayload::Match {
            mode: MatchMode::FetchOnly,
            children: Vec::new(),
        }),
        Value::Array(items) => {
            let mut arms = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Null => arms.push(MatchArm::Absent),
                    Value::Object(map) => {
                        arms.push(MatchArm::Nested(parse_entity_children(
                            schema, target, map, path,
                        )?));
                    }
                    _ => {
                        return Err(ParseError::AssociationLiteral {
                            path: path.to_string(),
                        });
                    }
                }
            }
            Ok(NodePayload::Match {
                mode: MatchMode::AnyOf(arms),
                children: Vec::new(),
            })
        }
        _ => Err(ParseError::AssociationLiteral {
            path: path.to_string(),
        }),
    }
}

/// Aggregate content: `"role"` or `{"role": <nested filters>}`.
fn parse_aggregate(
    schema: &Schema,
    entity_type: &str,
    kind: AggregateKind,
    value: &Value,
    path: &str,
) -> Result<QueryNode, ParseError> {
    let target = match value {
        Value::String(role_name) => {
            parse_role(schema, entity_type, role_name, &Value::Array(Vec::new()), path)?
        }
        Value::Object(map) => {
            if map.len() != 1 {
                return Err(ParseError::BadAggregate {
                    path: path.to_string(),
                    message: "target object must have exactly one role key".to_string(),
                });
            }
            let (role_name, nested) = match map.iter().next() {
                Some((k, v)) => (k.clone(), v.clone()),
                None => {
                    return Err(ParseError::BadAggregate {
                        path: path.to_string(),
                        message: "target object must have exactly one role key".to_string(),
                    });
                }
            };
            parse_role(schema, entity_type, &role_name, &nested, &join(path, &role_name))?
        }
        _ => {
            return Err(ParseError::BadAggregate {
                path: path.to_string(),
                message: "target must be a role name or a single-role object".to_string(),
            });
        }
    };
    Ok(QueryNode {
        role: kind.token().to_string(),
        recursive: false,
        payload: NodePayload::Aggregate {
            kind,
            target: Box::new(target),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blog_schema() -> Schema {
        Schema::from_json(&json!({
            "entity_types": [
                {
                    "name": "post",
                    "roles": [
                        {"name": "slug", "kind": "scalar", "identifying": true},
                        {"name": "title", "kind": "scalar"},
                        {"name": "score", "kind": "scalar"},
                        {"name": "author", "kind": "to_one", "target": "author", "reverse": "post"},
                        {"name": "comment", "kind": "to_many", "target": "comment", "reverse": "post"}
                    ]
                },
                {
                    "name": "author",
                    "roles": [{"name": "name", "kind": "scalar", "identifying": true}]
                },
                {
                    "name": "comment",
                    "roles": [{"name": "body", "kind": "scalar"}]
                },
                {
                    "name": "topic",
                    "roles": [
                        {"name": "name", "kind": "scalar", "identifying": true},
                        {"name": "parent", "kind": "to_one", "target": "topic", "reverse": "child"}
                    ]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn nested_author_match_parses() {
        let schema = blog_schema();
        let model =
            parse_query(&json!({"post": {"author": {"name": ["Bloggs"]}}}), &schema).unwrap();
        assert_eq!(model.roots.len(), 1);
        let post = &model.roots[0];
        assert_eq!(post.role, "post");
        let author = &post.children()[0];
        assert_eq!(author.role, "author");
        let name = &author.children()[0];
        match &name.payload {
            NodePayload::Match {
                mode: MatchMode::AnyOf(arms),
                ..
            } => assert_eq!(arms, &vec![MatchArm::Literal(json!("Bloggs"))]),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn empty_array_is_fetch_only() {
        let schema = blog_schema();
        let model = parse_query(&json!({"post": {"comment": []}}), &schema).unwrap();
        let comment = &model.roots[0].children()[0];
        assert!(matches!(
            comment.payload,
            NodePayload::Match {
                mode: MatchMode::FetchOnly,
                ..
            }
        ));
    }

    #[test]
    fn operator_object_on_scalar_role() {
        let schema = blog_schema();
        let model = parse_query(&json!({"post": {"score": {">": 5}}}), &schema).unwrap();
        let score = &model.roots[0].children()[0];
        let filter = &score.children()[0];
        assert!(matches!(
            filter.payload,
            NodePayload::Filter {
                op: FilterOp::Gt,
                ..
            }
        ));
    }

    #[test]
    fn trailing_star_marks_recursive() {
        let schema = blog_schema();
        let model = parse_query(&json!({"topic": {"parent*": []}}), &schema).unwrap();
        let parent = &model.roots[0].children()[0];
        assert_eq!(parent.role, "parent");
        assert!(parent.recursive);
    }

    #[test]
    fn recursion_requires_self_target() {
        let schema = blog_schema();
        let err = parse_query(&json!({"post": {"author*": []}}), &schema).unwrap_err();
        assert!(matches!(err, ParseError::RecursiveNotSelf { .. }));
    }

    #[test]
    fn unknown_role_names_the_path() {
        let schema = blog_schema();
        let err =
            parse_query(&json!({"post": {"author": {"nam": ["x"]}}}), &schema).unwrap_err();
        match err {
            ParseError::UnknownRole { path, role, .. } => {
                assert_eq!(path, "post.author.nam");
                assert_eq!(role, "nam");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn reverse_role_is_queryable() {
        // `author.post` exists only as the materialized reverse direction.
        let schema = blog_schema();
        let model = parse_query(&json!({"author": {"post": []}}), &schema).unwrap();
        assert_eq!(model.roots[0].children()[0].role, "post");
    }

    #[test]
    fn aggregate_token_beats_nothing_but_operator() {
        let schema = blog_schema();
        let model = parse_query(&json!({"post": {"count": "comment"}}), &schema).unwrap();
        let count = &model.roots[0].children()[0];
        match &count.payload {
            NodePayload::Aggregate { kind, target } => {
                assert_eq!(*kind, AggregateKind::Count);
                assert_eq!(target.role, "comment");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn aggregate_with_nested_filters() {
        let schema = blog_schema();
        let model = parse_query(
            &json!({"post": {"count": {"comment": {"body": ["spam"]}}}}),
            &schema,
        )
        .unwrap();
        let count = &model.roots[0].children()[0];
        match &count.payload {
            NodePayload::Aggregate { target, .. } => {
                assert_eq!(target.role, "comment");
                assert_eq!(target.children().len(), 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn operator_directly_under_entity_is_rejected() {
        let schema = blog_schema();
        let err = parse_query(&json!({"post": {">": 5}}), &schema).unwrap_err();
        assert!(matches!(err, ParseError::OperatorPlacement { .. }));
    }

    #[test]
    fn multi_object_entity_content_is_rejected_by_shape() {
        let schema = blog_schema();
        let err = parse_query(
            &json!({"post": [{"slug": []}, {"title": []}]}),
            &schema,
        )
        .unwrap_err();
        match err {
            ParseError::EntityContent { path } => assert_eq!(path, "post"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_entity_type_is_rejected() {
        let schema = blog_schema();
        let err = parse_query(&json!({"nonsense": {}}), &schema).unwrap_err();
        assert!(matches!(err, ParseError::UnknownEntityType { .. }));
    }
}
