//! Parsed query tree types.
//!
//! A [`QueryModel`] is immutable after parsing and lives for one
//! request/response cycle. Child order is preserved only so the serialized
//! result mirrors the submitted shape; it carries no semantic weight (the
//! lock hash is order-independent).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators usable as keys in a query (`{"score": {">": 5}}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
    /// Case-insensitive substring match, spelled `~`.
    Like,
}

impl FilterOp {
    /// Operator token table. Checked before aggregate and role names, which
    /// fixes the precedence: operator > aggregate > role.
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "<" => FilterOp::Lt,
            "<=" => FilterOp::Le,
            "=" => FilterOp::Eq,
            "!=" => FilterOp::Ne,
            ">=" => FilterOp::Ge,
            ">" => FilterOp::Gt,
            "~" => FilterOp::Like,
            _ => return None,
        })
    }

    pub fn token(self) -> &'static str {
        match self {
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Ge => ">=",
            FilterOp::Gt => ">",
            FilterOp::Like => "~",
        }
    }
}

/// Aggregate functions usable as keys in a query (`{"count": "comment"}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateKind {
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "count" => AggregateKind::Count,
            "sum" => AggregateKind::Sum,
            "avg" => AggregateKind::Avg,
            "min" => AggregateKind::Min,
            "max" => AggregateKind::Max,
            _ => return None,
        })
    }

    pub fn token(self) -> &'static str {
        match self {
            AggregateKind::Count => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
        }
    }
}

/// One element of a non-empty `AnyOf` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchArm {
    /// Literal value equality.
    Literal(Value),
    /// `null`: the value may be absent.
    Absent,
    /// A nested object: full nested match against the associated entity.
    Nested(Vec<QueryNode>),
}

/// How a role node matches its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchMode {
    /// Single nested object: presence is required (inner join).
    Required,
    /// Empty array: fetch the value, never exclude the parent (outer join).
    FetchOnly,
    /// Non-empty array: the value/entity must match at least one arm.
    AnyOf(Vec<MatchArm>),
}

/// Payload of a query node; a node has exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodePayload {
    /// A role match with nested structure.
    Match {
        mode: MatchMode,
        children: Vec<QueryNode>,
    },
    /// A comparison against the parent role's scalar value.
    Filter { op: FilterOp, operand: Value },
    /// An aggregate over a target role of the parent entity.
    Aggregate {
        kind: AggregateKind,
        target: Box<QueryNode>,
    },
}

/// A node in the parsed query tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryNode {
    /// Role name without any trailing `*`.
    pub role: String,
    /// `true` when the query spelled the role `role*`: child matches are
    /// reapplied transitively along the same role.
    pub recursive: bool,
    pub payload: NodePayload,
}

impl QueryNode {
    /// Children of a match node; empty for filters and aggregates.
    pub fn children(&self) -> &[QueryNode] {
        match &self.payload {
            NodePayload::Match { children, .. } => children,
            _ => &[],
        }
    }

    /// The display name this node serializes under (`role` or `role*`).
    pub fn display_role(&self) -> String {
        if self.recursive {
            format!("{}*", self.role)
        } else {
            self.role.clone()
        }
    }
}

/// A whole parsed query: one or more top-level role matches, each scoped to
/// an entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryModel {
    pub roots: Vec<QueryNode>,
}
