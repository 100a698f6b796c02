//! Domain model types shared across the ingestion pipeline, the two
//! storage tiers, and the retriever: Document, DomainConfig, Chunk,
//! CanonicalNode, NodeAlias, EnrichmentQueueItem, GraphEntity, GraphRelation,
//! and MentionsEdge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Document ingestion lifecycle. Transitions are validated by
/// [`validate_status_transition`]; callers never construct an edge outside
/// this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Updating,
    Deleting,
}

impl DocumentStatus {
    fn allowed_targets(self) -> &'static [DocumentStatus] {
        use DocumentStatus::*;
        match self {
            Pending => &[Processing, Deleting],
            Processing => &[Completed, Failed],
            Completed => &[Updating, Deleting],
            Failed => &[Deleting],
            Updating => &[Processing, Deleting],
            Deleting => &[],
        }
    }
}

/// A document may only move along the edges of this explicit state
/// machine. Setting `Failed` additionally
/// requires a non-empty error log, checked by the caller before invoking
/// this function (see `storage::canonical_store::CanonicalStore::update_document_status`).
pub fn validate_status_transition(from: DocumentStatus, to: DocumentStatus) -> bool {
    from.allowed_targets().contains(&to)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnrichmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

fn enrichment_allowed_targets(from: EnrichmentStatus) -> &'static [EnrichmentStatus] {
    use EnrichmentStatus::*;
    match from {
        Pending => &[Processing],
        Processing => &[Completed, Failed],
        Completed => &[],
        Failed => &[],
    }
}

pub fn validate_enrichment_transition(from: EnrichmentStatus, to: EnrichmentStatus) -> bool {
    enrichment_allowed_targets(from).contains(&to)
}

/// An ingested source document and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub filename: String,
    /// SHA-256 hex digest, 64 chars, globally unique.
    pub content_hash: String,
    pub storage_location: String,
    pub status: DocumentStatus,
    pub error_log: Option<String>,
    pub domain_config_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The active ontology: which entity and relation types the Extractor and
/// Validator are allowed to use for a given ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologySchema {
    pub entity_types: Vec<String>,
    pub relation_types: Vec<String>,
    /// Optional per-relation-type source/target type constraints, keyed by
    /// relation type name.
    #[serde(default)]
    pub source_types: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub target_types: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub id: i64,
    pub name: String,
    pub schema: OntologySchema,
}

/// A contiguous token window of a Document's text, with its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: i64,
    pub sequence_num: i64,
    pub text: String,
    pub token_count: i64,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// The single source of truth for a resolved entity, independent of any
/// document that mentions it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalNode {
    pub id: i64,
    pub node_type: String,
    pub canonical_name: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// A surface form that maps to a canonical node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAlias {
    pub id: i64,
    pub alias: String,
    pub canonical_node_id: i64,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentQueueItem {
    pub id: i64,
    pub raw_name: String,
    pub proposed_type: String,
    pub context_chunk: String,
    pub status: EnrichmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A node materialized in the graph store, keyed by the CanonicalNode's id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntity {
    pub canonical_id: i64,
    pub node_type: String,
    pub canonical_name: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// A typed directed edge between two GraphEntities, with optional
/// chunk provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelation {
    pub source_canonical_id: i64,
    pub target_canonical_id: i64,
    pub relation_type: String,
    pub chunk_id: Option<String>,
}

/// An edge from a Chunk to each GraphEntity it mentions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionsEdge {
    pub chunk_id: String,
    pub canonical_id: i64,
}

/// An entity as extracted by the LLM before resolution: `id` is a
/// temporary, LLM-generated identifier local to one chunk, not a
/// canonical identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub temp_id: String,
    pub name: String,
    pub entity_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub source_temp_id: String,
    pub target_temp_id: String,
    pub relation_type: String,
    pub chunk_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub entities: Vec<ExtractedEntity>,
    pub relations: Vec<ExtractedRelation>,
}

pub fn new_chunk_id() -> String {
    Uuid::new_v4().to_string()
}

/// Distinct set of entity types referenced by a batch of extracted
/// entities, useful for logging and test assertions.
pub fn distinct_entity_types(entities: &[ExtractedEntity]) -> HashSet<String> {
    entities.iter().map(|e| e.entity_type.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_state_machine_matches_spec_table() {
        use DocumentStatus::*;
        assert!(validate_status_transition(Pending, Processing));
        assert!(validate_status_transition(Pending, Deleting));
        assert!(!validate_status_transition(Pending, Completed));
        assert!(validate_status_transition(Processing, Completed));
        assert!(validate_status_transition(Processing, Failed));
        assert!(validate_status_transition(Completed, Updating));
        assert!(validate_status_transition(Completed, Deleting));
        assert!(validate_status_transition(Failed, Deleting));
        assert!(!validate_status_transition(Failed, Processing));
        assert!(validate_status_transition(Updating, Processing));
        assert!(!validate_status_transition(Deleting, Pending));
        assert!(Deleting.allowed_targets().is_empty());
    }

    #[test]
    fn enrichment_state_machine_is_linear() {
        use EnrichmentStatus::*;
        assert!(validate_enrichment_transition(Pending, Processing));
        assert!(validate_enrichment_transition(Processing, Completed));
        assert!(validate_enrichment_transition(Processing, Failed));
        assert!(!validate_enrichment_transition(Pending, Completed));
        assert!(!validate_enrichment_transition(Completed, Processing));
    }
}
