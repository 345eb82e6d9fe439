//! Constel engine: query resolution and mutation over an abstract fact store.
//!
//! The engine is request-scoped and stateless: every call takes an explicit
//! schema and store handle, so concurrent sessions over different stores
//! coexist without ambient globals. The only blocking points are calls
//! through the [`port::StorePort`]; cooperative cancellation is checked
//! before each of them.
//!
//! Pipeline: raw query → [`constel_query::QueryModel`] → [`resolve::Resolver`]
//! → [`constellation::Constellation`] → { [`lockhash`], [`serialize`] }.
//! Mutations re-resolve current state, verify the lock hash where supplied,
//! diff, and hand one atomic [`port::ChangeBatch`] to the store.

pub mod cancel;
pub mod constellation;
pub mod error;
pub mod lockhash;
pub mod mutate;
pub mod port;
pub mod resolve;
pub mod serialize;
pub mod value;

pub use cancel::CancelToken;
pub use constellation::{Constellation, EntityId, ResultNode};
pub use error::{EngineError, EngineResult};
pub use lockhash::lock_hash;
pub use mutate::{Engine, MutationOutcome};
pub use port::{
    ApplyReceipt, ChangeBatch, ChangeOp, EntityRef, Revision, ScalarFilter, StoreError, StorePort,
    TempId,
};
pub use resolve::Resolver;
pub use serialize::serialize_constellation;
