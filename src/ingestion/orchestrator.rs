//! Per-document ingestion pipeline and its companion deletion flow:
//! PENDING -> PROCESSING, fetch bytes, parse, chunk, embed, upsert chunks
//! into the graph, extract, validate, resolve (enqueuing what the
//! Harmonizer can't place), remap relations, upsert entities/relations,
//! link MENTIONS edges, PROCESSING -> COMPLETED. Transient failures retry
//! with backoff; exhausted or permanent failures route to a dead-letter
//! path that marks the document FAILED with the error recorded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::ingestion::chunker::Chunker;
use crate::ingestion::embedder::{DynEmbedder, DynEmbeddingProvider};
use crate::ingestion::extractor::DynExtractor;
use crate::ingestion::parser::DocumentParser;
use crate::ingestion::resolver::{remap_relations, Resolver};
use crate::ingestion::validator::validate_and_filter;
use crate::models::{Document, DocumentStatus, GraphEntity, GraphRelation};
use crate::storage::canonical_store::CanonicalStore;
use crate::storage::graph_store::GraphStore;
use crate::storage::object_store::ObjectStore;

const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Retries `f` up to `max_attempts` times with exponential backoff (2^n
/// seconds), but only for errors `EngineError::is_transient()` reports as
/// retryable. A permanent error, or a transient one past the last attempt,
/// returns immediately. An explicit loop rather than a task-queue-provided
/// retry, since there is no task broker here.
async fn retry_with_backoff<T, F, Fut>(step: &str, max_attempts: u32, mut f: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let backoff = Duration::from_secs(2u64.saturating_pow(attempt));
                tracing::warn!(step, attempt, backoff_secs = backoff.as_secs(), error = %e, "transient failure, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(step, attempt, error = %e, "step failed, not retrying further");
                return Err(e);
            }
        }
    }
}

pub struct Orchestrator {
    canonical_store: Arc<dyn CanonicalStore>,
    graph_store: Arc<dyn GraphStore>,
    object_store: Arc<dyn ObjectStore>,
    parser: Arc<dyn DocumentParser>,
    chunker: Chunker,
    embedder: DynEmbedder,
    extractor: DynExtractor,
    resolver: Resolver<DynEmbeddingProvider>,
    soft_budget: Duration,
    hard_budget: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        canonical_store: Arc<dyn CanonicalStore>,
        graph_store: Arc<dyn GraphStore>,
        object_store: Arc<dyn ObjectStore>,
        parser: Arc<dyn DocumentParser>,
        chunker: Chunker,
        embedder: DynEmbedder,
        extractor: DynExtractor,
        resolver: Resolver<DynEmbeddingProvider>,
        cfg: &EngineConfig,
    ) -> Self {
        Self {
            canonical_store,
            graph_store,
            object_store,
            parser,
            chunker,
            embedder,
            extractor,
            resolver,
            soft_budget: Duration::from_secs(cfg.orchestrator_soft_budget_secs),
            hard_budget: Duration::from_secs(cfg.orchestrator_hard_budget_secs),
        }
    }

    /// Runs the full pipeline for `document_id`, racing it against the
    /// configured soft/hard budgets. A soft-budget breach is logged and the
    /// run is allowed to continue; a hard-budget breach aborts the run and
    /// routes to the dead-letter path, same as an ordinary failure would.
    pub async fn process_document(&self, document_id: i64) {
        let started = Instant::now();
        let pipeline = self.run_pipeline(document_id);
        tokio::pin!(pipeline);

        let soft_sleep = tokio::time::sleep(self.soft_budget);
        tokio::pin!(soft_sleep);
        let hard_sleep = tokio::time::sleep(self.hard_budget);
        tokio::pin!(hard_sleep);

        let mut soft_warned = false;
        let result = loop {
            tokio::select! {
                res = &mut pipeline => break res,
                _ = &mut soft_sleep, if !soft_warned => {
                    soft_warned = true;
                    tracing::warn!(document_id, elapsed_secs = started.elapsed().as_secs(), "orchestrator soft budget exceeded, continuing toward hard budget");
                }
                _ = &mut hard_sleep => {
                    break Err(EngineError::PermanentProvider(format!(
                        "document {document_id} exceeded the orchestrator hard budget"
                    )));
                }
            }
        };

        if let Err(e) = result {
            self.route_to_dead_letter(document_id, &e).await;
        }
    }

    /// Marks the document FAILED with the error recorded, unless its
    /// current state can't legally make that transition (e.g. it moved to
    /// DELETING mid-run), in which case we just log and leave it alone.
    async fn route_to_dead_letter(&self, document_id: i64, error: &EngineError) {
        tracing::error!(document_id, error = %error, "routing document to dead letter");
        match self
            .canonical_store
            .update_document_status(document_id, DocumentStatus::Failed, Some(&error.to_string()))
            .await
        {
            Ok(_) => {}
            Err(EngineError::InvalidStatusTransition { from, to }) => {
                tracing::warn!(document_id, from, to, "dead letter could not mark FAILED, document moved on already");
            }
            Err(e) => {
                tracing::error!(document_id, error = %e, "dead letter handler itself failed");
            }
        }
    }

    /// Cooperative cancellation check: re-reads the document's current
    /// status and reports whether the run should abort because it moved to
    /// `DELETING` out from under us (e.g. a concurrent `delete_document`
    /// call). Called between major pipeline steps rather than held as a
    /// lock, per the "no in-process long-running locks" concurrency model.
    async fn should_abort_for_deletion(&self, document_id: i64) -> EngineResult<bool> {
        let document = self
            .canonical_store
            .get_document(document_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))?;
        Ok(document.status == DocumentStatus::Deleting)
    }

    async fn run_pipeline(&self, document_id: i64) -> EngineResult<()> {
        let document = self
            .canonical_store
            .get_document(document_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))?;
        let domain_config = self
            .canonical_store
            .get_domain_config(document.domain_config_id)
            .await?
            .ok_or_else(|| {
                EngineError::Consistency(format!("document {document_id} references a missing domain config"))
            })?;

        // 1. PENDING -> PROCESSING.
        self.canonical_store
            .update_document_status(document_id, DocumentStatus::Processing, None)
            .await?;

        // 2. Fetch the raw bytes from the object store.
        let storage_location = document.storage_location.clone();
        let bytes = retry_with_backoff("fetch_bytes", MAX_RETRY_ATTEMPTS, || {
            self.object_store.get(&storage_location)
        })
        .await?;

        if self.should_abort_for_deletion(document_id).await? {
            tracing::info!(document_id, "document moved to DELETING mid-run, aborting cleanly");
            return Ok(());
        }

        // 3. Parse -> Chunk.
        let text = self.parser.parse(&bytes, &document.filename)?;
        let mut chunks = self.chunker.chunk(document_id, &text);
        if chunks.is_empty() {
            tracing::warn!(document_id, "document produced no chunks, marking complete");
            self.canonical_store
                .update_document_status(document_id, DocumentStatus::Completed, None)
                .await?;
            return Ok(());
        }

        // 4. Embed chunks.
        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = retry_with_backoff("embed_chunks", MAX_RETRY_ATTEMPTS, || {
            self.embedder.embed_all(&chunk_texts)
        })
        .await?;
        if embeddings.len() != chunks.len() {
            return Err(EngineError::Consistency(format!(
                "embedded {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings.into_iter()) {
            chunk.embedding = embedding;
        }

        // 5. Upsert Document + Chunks into the Graph Store.
        {
            let filename = document.filename.clone();
            let chunks_ref = &chunks;
            retry_with_backoff("upsert_chunks", MAX_RETRY_ATTEMPTS, || async {
                self.graph_store.upsert_document(document_id, &filename).await?;
                for chunk in chunks_ref {
                    self.graph_store
                        .upsert_chunk(document_id, &chunk.id, &chunk.text, &chunk.embedding)
                        .await?;
                }
                Ok(())
            })
            .await?;
        }

        if self.should_abort_for_deletion(document_id).await? {
            tracing::info!(document_id, "document moved to DELETING mid-run, aborting cleanly");
            return Ok(());
        }

        // 6. Extract entities/relations (fanned out across chunks).
        let (extracted_entities, extracted_relations) =
            self.extractor.extract_from_all_chunks(&chunks, &domain_config.schema).await;

        // 7. Validate against the active ontology.
        let (validated_entities, validated_relations) =
            validate_and_filter(extracted_entities, extracted_relations, &domain_config.schema);
        if validated_entities.is_empty() {
            tracing::info!(document_id, "no ontology-valid entities extracted");
            self.canonical_store
                .update_document_status(document_id, DocumentStatus::Completed, None)
                .await?;
            return Ok(());
        }

        if self.should_abort_for_deletion(document_id).await? {
            tracing::info!(document_id, "document moved to DELETING mid-run, aborting cleanly");
            return Ok(());
        }

        // 8. Resolve entities against the Canonical Store; unresolved ones
        // are enqueued for the Enrichment Worker with a best-effort context
        // chunk (first chunk whose text contains the surface form).
        let (resolved_map, unresolved) = self.resolver.resolve_all(&validated_entities).await?;
        for entity in &unresolved {
            let context_chunk = chunks
                .iter()
                .find(|c| c.text.contains(entity.name.as_str()))
                .map(|c| c.text.as_str())
                .unwrap_or_else(|| chunks[0].text.as_str());
            self.canonical_store
                .enqueue_enrichment(&entity.name, &entity.entity_type, context_chunk)
                .await?;
        }

        // 9. Remap relations to canonical ids; drop unresolved endpoints and
        // self-loops created by two surface forms resolving to one node.
        let remapped = remap_relations(&validated_relations, &resolved_map);

        // 10. Upsert validated entities + remapped relations into the
        // graph, then link each chunk to the entities its relations
        // provenance names (MENTIONS follows relation chunk_id, same as the
        // teacher's relation-merge query does).
        let mut canonical_nodes = HashMap::new();
        for canonical_id in resolved_map.values().copied() {
            if canonical_nodes.contains_key(&canonical_id) {
                continue;
            }
            let node = self.canonical_store.get_canonical_node(canonical_id).await?.ok_or_else(|| {
                EngineError::Consistency(format!("resolved canonical node {canonical_id} vanished mid-ingestion"))
            })?;
            canonical_nodes.insert(canonical_id, node);
        }

        let graph_entities: Vec<GraphEntity> = canonical_nodes
            .values()
            .map(|n| GraphEntity {
                canonical_id: n.id,
                node_type: n.node_type.clone(),
                canonical_name: n.canonical_name.clone(),
                embedding: n.embedding.clone(),
            })
            .collect();
        let graph_relations: Vec<GraphRelation> = remapped
            .into_iter()
            .map(|(source, target, relation_type, chunk_id)| GraphRelation {
                source_canonical_id: source,
                target_canonical_id: target,
                relation_type,
                chunk_id,
            })
            .collect();

        retry_with_backoff("upsert_entities_and_relations", MAX_RETRY_ATTEMPTS, || async {
            self.graph_store.upsert_entities(&graph_entities).await?;
            self.graph_store.upsert_relations(&graph_relations).await?;
            Ok(())
        })
        .await?;

        let mut mentions_by_chunk: HashMap<String, Vec<i64>> = HashMap::new();
        for relation in &graph_relations {
            if let Some(chunk_id) = &relation.chunk_id {
                let ids = mentions_by_chunk.entry(chunk_id.clone()).or_default();
                ids.push(relation.source_canonical_id);
                ids.push(relation.target_canonical_id);
            }
        }
        for (chunk_id, mut canonical_ids) in mentions_by_chunk {
            canonical_ids.sort_unstable();
            canonical_ids.dedup();
            self.graph_store.link_chunk_to_entities(&chunk_id, &canonical_ids).await?;
        }

        // 11. PROCESSING -> COMPLETED.
        self.canonical_store
            .update_document_status(document_id, DocumentStatus::Completed, None)
            .await?;
        tracing::info!(document_id, chunks = chunks.len(), entities = graph_entities.len(), "ingestion complete");
        Ok(())
    }

    /// Deletes a document: DELETING transition first (propagated as-is if
    /// illegal, since that means the document is already gone or mid-update
    /// and the caller should see the real reason), then the graph subgraph,
    /// object-store blob, and relational row. Failures past the transition
    /// mark the document FAILED before re-raising.
    pub async fn delete_document(&self, document_id: i64) -> EngineResult<()> {
        let document = self
            .canonical_store
            .get_document(document_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))?;

        self.canonical_store
            .update_document_status(document_id, DocumentStatus::Deleting, None)
            .await?;

        if let Err(e) = self.delete_artifacts(document_id, &document).await {
            tracing::error!(document_id, error = %e, "failed to clean up document artifacts during delete");
            let _ = self
                .canonical_store
                .update_document_status(document_id, DocumentStatus::Failed, Some(&e.to_string()))
                .await;
            return Err(e);
        }

        Ok(())
    }

    async fn delete_artifacts(&self, document_id: i64, document: &Document) -> EngineResult<()> {
        self.graph_store.delete_document(document_id).await?;
        self.object_store.delete(&document.storage_location).await?;
        self.canonical_store.delete_document_row(document_id).await?;
        Ok(())
    }
}
