//! Constel query model (canonical surface)
//!
//! This crate defines the parsed, validated in-memory representation of a
//! client-submitted nested query (a *constellation* query) together with the
//! schema types the parser validates against.
//!
//! The query surface is a plain JSON tree: object keys are classified as
//! operator tokens, aggregate tokens, or role names (in that precedence
//! order), and array values select between fetch-only, any-of, and nested
//! matching. Parsing is schema-checked: a key that is neither a recognized
//! token nor a role on the parent entity type fails immediately with a
//! dotted-path error, it is never silently ignored.

pub mod node;
pub mod parser;
pub mod schema;

pub use node::{AggregateKind, FilterOp, MatchArm, MatchMode, NodePayload, QueryModel, QueryNode};
pub use parser::{parse_query, ParseError};
pub use schema::{RoleInfo, RoleKind, Schema, SchemaError};
