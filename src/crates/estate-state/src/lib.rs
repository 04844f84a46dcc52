//! Thread-scoped checkpointed state storage for the estate workflow engine.
//!
//! A run's state lives in a JSON document keyed by `thread_id`. Nodes commit
//! partial updates as [`StatePatch`]es; a [`PatchSchema`] decides per field
//! whether an update overwrites, merges, adds or appends. The
//! [`StateStore`] trait provides atomic, optimistically versioned commits
//! with single-writer semantics per thread, plus session-scoped listing and
//! deletion. [`InMemoryStateStore`] is the reference backend; durable
//! backends implement the same trait.

pub mod error;
pub mod memory;
pub mod patch;
pub mod serializer;
pub mod store;

pub use error::{PatchError, Result, StateStoreError};
pub use memory::InMemoryStateStore;
pub use patch::{
    run_state_schema, AppendReducer, AppendUniqueReducer, CounterReducer, MergeMapReducer,
    OverwriteReducer, PatchSchema, Reducer, StatePatch,
};
pub use serializer::{StateSerializer, SCHEMA_VERSION};
pub use store::{StateStore, ThreadSummary, VersionedState};
