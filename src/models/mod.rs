//! Core data types: memories, graph edges, sync queue entries.

mod graph;
mod memory;
mod sync;

pub use graph::{Association, Direction, GraphPath, RelationshipType, Subgraph};
pub use memory::{
    MAX_TAG_LENGTH, Memory, MemoryQueryResult, MetadataPatch, TagMatch, iso_from_timestamp,
};
pub use sync::{SyncOpKind, SyncOperation, SyncStatus};
