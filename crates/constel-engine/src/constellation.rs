//! Result constellation: the resolved mirror of a query tree.

use serde_json::Value;

/// Stable entity identity assigned by the underlying store.
pub type EntityId = u64;

/// A resolved node, one per query node it mirrors.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultNode {
    /// A scalar value, filter echo, or aggregate result.
    Scalar(Value),
    /// A matched entity and its resolved child roles, in query order.
    Entity {
        id: EntityId,
        fields: Vec<(String, ResultNode)>,
    },
    /// A to-many association or recursive expansion.
    Many(Vec<ResultNode>),
    /// An optional role with no value.
    Absent,
}

impl ResultNode {
    /// All entity identities reachable from this node, in traversal order.
    pub fn entity_ids(&self, out: &mut Vec<EntityId>) {
        match self {
            ResultNode::Scalar(_) | ResultNode::Absent => {}
            ResultNode::Entity { id, fields } => {
                out.push(*id);
                for (_, child) in fields {
                    child.entity_ids(out);
                }
            }
            ResultNode::Many(items) => {
                for item in items {
                    item.entity_ids(out);
                }
            }
        }
    }
}

/// The root result: one resolved node per top-level query node.
///
/// Owned by one request/response cycle; the mutation engine keeps one
/// transiently to diff current state against submitted values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Constellation {
    pub roots: Vec<(String, ResultNode)>,
}

impl Constellation {
    /// Entities matched directly by the top-level nodes (no descendants).
    pub fn top_level_entities(&self) -> Vec<EntityId> {
        let mut out = Vec::new();
        for (_, node) in &self.roots {
            match node {
                ResultNode::Entity { id, .. } => out.push(*id),
                ResultNode::Many(items) => {
                    for item in items {
                        if let ResultNode::Entity { id, .. } = item {
                            out.push(*id);
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }
}
