//! The ingestion pipeline: Parse -> Chunk -> Embed -> Extract -> Validate ->
//! Resolve -> Upsert, orchestrated per-document, plus the background
//! Enrichment Worker that drains unresolved entities back into the
//! Canonical Store.

pub mod chunker;
pub mod embedder;
pub mod enrichment;
pub mod extractor;
pub mod orchestrator;
pub mod parser;
pub mod resolver;
pub mod validator;

pub use chunker::{Chunker, TiktokenEncoder, TokenEncoder};
pub use embedder::{DynEmbedder, DynEmbeddingProvider, Embedder, EmbeddingProvider, RigEmbeddingProvider};
pub use enrichment::EnrichmentWorker;
pub use extractor::{DynExtractionProvider, DynExtractor, ExtractionProvider, Extractor, RigExtractionProvider};
pub use orchestrator::Orchestrator;
pub use parser::{DefaultParser, DocumentParser};
pub use resolver::{remap_relations, ResolutionOutcome, Resolver};
pub use validator::validate_and_filter;
