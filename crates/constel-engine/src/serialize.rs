//! Result serializer: constellation → client-facing nested values.
//!
//! The emitted structure mirrors the query shape exactly: entities become
//! objects keyed by the roles the query asked for (recursive roles keep
//! their `*` spelling), to-many associations and recursive expansions become
//! arrays, scalars and aggregates become plain values, absence becomes
//! `null`.

use serde_json::{Map, Value};

use crate::constellation::{Constellation, ResultNode};

/// Render a constellation as the nested value shape of its query.
pub fn serialize_constellation(constellation: &Constellation) -> Value {
    let mut out = Map::new();
    for (role, node) in &constellation.roots {
        out.insert(role.clone(), serialize_node(node));
    }
    Value::Object(out)
}

fn serialize_node(node: &ResultNode) -> Value {
    match node {
        ResultNode::Scalar(v) => v.clone(),
        ResultNode::Absent => Value::Null,
        ResultNode::Many(items) => Value::Array(items.iter().map(serialize_node).collect()),
        ResultNode::Entity { fields, .. } => {
            let mut out = Map::new();
            for (name, child) in fields {
                out.insert(name.clone(), serialize_node(child));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mirrors_the_query_shape() {
        let c = Constellation {
            roots: vec![(
                "post".to_string(),
                ResultNode::Many(vec![ResultNode::Entity {
                    id: 7,
                    fields: vec![
                        ("title".to_string(), ResultNode::Scalar(json!("Hello"))),
                        (
                            "comment".to_string(),
                            ResultNode::Many(vec![ResultNode::Entity {
                                id: 9,
                                fields: vec![(
                                    "body".to_string(),
                                    ResultNode::Scalar(json!("Nice")),
                                )],
                            }]),
                        ),
                        ("editor".to_string(), ResultNode::Absent),
                    ],
                }]),
            )],
        };
        assert_eq!(
            serialize_constellation(&c),
            json!({
                "post": [{
                    "title": "Hello",
                    "comment": [{"body": "Nice"}],
                    "editor": null
                }]
            })
        );
    }
}
