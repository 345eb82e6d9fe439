//! Store access port: the abstract interface between the engine and
//! whichever physical backend is plugged in.
//!
//! The engine only ever touches the store through this trait; it is the
//! single shared resource and the only point where a request may block.
//! `apply` is atomic per call, and with an expected revision it acts as a
//! compare-and-swap, which is what makes VERIFY_LOCK → COMMIT effectively
//! atomic for optimistic updates.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use constel_query::FilterOp;

use crate::constellation::EntityId;
use crate::value;

/// Monotonic store revision, bumped on every committed batch.
pub type Revision = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),
    #[error("unknown entity type `{0}`")]
    UnknownEntityType(String),
    #[error("unknown role `{role}` on entity {entity}")]
    UnknownRole { entity: EntityId, role: String },
    #[error("revision conflict: expected {expected}, store is at {actual}")]
    RevisionConflict { expected: Revision, actual: Revision },
    #[error("backend failure: {0}")]
    Backend(String),
}

/// A scalar predicate pushed down into `fetch_matching`.
///
/// Filters on one fetch are conjunctive; `AnyOf` is disjunctive over its own
/// values (this is how non-empty query arrays reach the store in one fetch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarFilter {
    Compare {
        role: String,
        op: FilterOp,
        operand: Value,
    },
    AnyOf {
        role: String,
        values: Vec<Value>,
        /// `null` arm present: an absent value also satisfies the filter.
        accept_absent: bool,
    },
}

impl ScalarFilter {
    /// Evaluate against one fetched value (`None` = absent). Backends without
    /// native predicates can scan with this.
    pub fn matches(&self, fetched: Option<&Value>) -> bool {
        match self {
            ScalarFilter::Compare { op, operand, .. } => match fetched {
                Some(v) => value::satisfies(v, *op, operand),
                None => false,
            },
            ScalarFilter::AnyOf {
                values,
                accept_absent,
                ..
            } => match fetched {
                Some(v) => values.iter().any(|want| value::value_eq(v, want)),
                None => *accept_absent,
            },
        }
    }

    pub fn role(&self) -> &str {
        match self {
            ScalarFilter::Compare { role, .. } | ScalarFilter::AnyOf { role, .. } => role,
        }
    }
}

/// Placeholder identity for an entity created inside the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TempId(pub usize);

/// Reference to an entity that either already exists or is created by a
/// `CreateEntity` op earlier in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityRef {
    Existing(EntityId),
    New(TempId),
}

/// One elementary change. Links are symmetric: `Link`/`Unlink` name the role
/// as seen from `from`; the store maintains the reverse direction itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeOp {
    CreateEntity {
        temp: TempId,
        entity_type: String,
    },
    SetScalar {
        entity: EntityRef,
        role: String,
        value: Value,
    },
    ClearScalar {
        entity: EntityRef,
        role: String,
    },
    Link {
        from: EntityRef,
        role: String,
        to: EntityRef,
    },
    Unlink {
        from: EntityRef,
        role: String,
        to: EntityRef,
    },
    DeleteEntity {
        entity: EntityId,
    },
}

/// An atomic set of changes: applied fully or not at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub ops: Vec<ChangeOp>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Allocate the next temp id for a `CreateEntity` op.
    pub fn next_temp(&self) -> TempId {
        let n = self
            .ops
            .iter()
            .filter(|op| matches!(op, ChangeOp::CreateEntity { .. }))
            .count();
        TempId(n)
    }
}

/// Result of a committed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReceipt {
    /// Revision after the commit.
    pub revision: Revision,
    /// Realized identities for the batch's `CreateEntity` ops, in temp order.
    pub created: Vec<EntityId>,
}

/// The abstract store consumed by the resolver and mutation engine.
pub trait StorePort {
    /// Current revision; observed before a resolution that a later `apply`
    /// wants to CAS against.
    fn revision(&self) -> Revision;

    /// All entities of `entity_type` whose scalars satisfy every filter.
    /// One fetch per top-level query node; not required to be restartable.
    fn fetch_matching(
        &self,
        entity_type: &str,
        filters: &[ScalarFilter],
    ) -> Result<Vec<EntityId>, StoreError>;

    /// The value of a scalar role, or `None` when absent.
    fn fetch_scalar(&self, entity: EntityId, role: &str) -> Result<Option<Value>, StoreError>;

    /// Partner entities of an association role, natural store order.
    fn fetch_associated(&self, entity: EntityId, role: &str) -> Result<Vec<EntityId>, StoreError>;

    /// Entity type of an existing entity.
    fn entity_type_of(&self, entity: EntityId) -> Result<String, StoreError>;

    /// Apply a batch atomically. With `expected`, commit only if the revision
    /// still matches (compare-and-swap); otherwise `RevisionConflict`.
    fn apply(
        &self,
        batch: ChangeBatch,
        expected: Option<Revision>,
    ) -> Result<ApplyReceipt, StoreError>;
}
