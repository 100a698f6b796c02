//! Persistence layer: the relational Canonical Store (Postgres) and the
//! typed property Graph Store (Neo4j). The two stores are intentionally
//! kept behind separate traits rather than unified behind one repository
//! abstraction, since they serve different access patterns: row-oriented
//! lookups and CAS updates on one side, graph traversal and vector search
//! on the other.

pub mod canonical_store;
pub mod graph_store;
pub mod object_store;

pub use canonical_store::{CanonicalStore, PostgresCanonicalStore};
pub use graph_store::{
    GraphChunkHit, GraphNeighbor, GraphSearchHit, GraphStore, HybridSearchResult, Neo4jGraphStore,
    VectorIndexLabel,
};
pub use object_store::{FilesystemObjectStore, ObjectStore};
