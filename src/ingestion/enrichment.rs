//! The Enrichment Worker: periodically drains the Canonical Store's
//! enrichment queue, asking the LLM to propose a canonical name for each
//! unresolved entity, then folding it into the Canonical Store via the
//! atomic get-or-create. Runs as a single in-process polling loop since
//! there is no task broker here.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult};
use crate::ingestion::embedder::DynEmbedder;
use crate::models::EnrichmentStatus;
use crate::security::sanitize_for_prompt;
use crate::storage::canonical_store::CanonicalStore;

const ENRICHMENT_ALIAS_CONFIDENCE: f32 = 0.98;

#[derive(Debug, Deserialize)]
struct CanonicalNameResponse {
    canonical_name: String,
}

/// Asks an LLM for the canonical name of a raw entity mention, given its
/// proposed type and originating chunk text. A thin seam so the worker can
/// be tested without a live provider.
#[async_trait::async_trait]
pub trait CanonicalNamingProvider: Send + Sync {
    async fn propose_canonical_name(&self, raw_name: &str, proposed_type: &str, context_chunk: &str) -> EngineResult<String>;
}

pub struct RigCanonicalNamingProvider {
    model: String,
}

impl RigCanonicalNamingProvider {
    pub fn from_config(cfg: &crate::config::EngineConfig) -> Self {
        Self { model: cfg.extraction_model.clone() }
    }
}

#[async_trait::async_trait]
impl CanonicalNamingProvider for RigCanonicalNamingProvider {
    async fn propose_canonical_name(&self, raw_name: &str, proposed_type: &str, context_chunk: &str) -> EngineResult<String> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let model_name = if self.model.is_empty() { "gpt-4o-mini" } else { self.model.as_str() };
        let agent = client
            .agent(model_name)
            .preamble(
                "You resolve a raw entity mention to its single canonical name. \
                 Respond ONLY with JSON of the form {\"canonical_name\": \"Canonical Name\"}.",
            )
            .temperature(0.0)
            .build();

        let raw_name = sanitize_for_prompt(raw_name, "enrichment raw_name");
        let proposed_type = sanitize_for_prompt(proposed_type, "enrichment proposed_type");
        let context_chunk = sanitize_for_prompt(context_chunk, "enrichment context_chunk");
        let prompt = format!(
            "Given the entity name \"{raw_name}\" of approximate type \"{proposed_type}\" found in context: \"{context_chunk}\", provide its canonical name."
        );

        let response = agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| EngineError::TransientProvider(e.to_string()))?;

        let cleaned = response.trim().trim_start_matches("```json").trim_end_matches("```").trim();
        let parsed: CanonicalNameResponse = serde_json::from_str(cleaned)?;
        Ok(parsed.canonical_name)
    }
}

pub struct EnrichmentWorker {
    store: Arc<dyn CanonicalStore>,
    naming: Arc<dyn CanonicalNamingProvider>,
    embedder: DynEmbedder,
    batch_size: i64,
    poll_interval: Duration,
}

impl EnrichmentWorker {
    pub fn new(
        store: Arc<dyn CanonicalStore>,
        naming: Arc<dyn CanonicalNamingProvider>,
        embedder: DynEmbedder,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            naming,
            embedder,
            // Matches `schedule_enrichment`'s fixed `.limit(100)` dispatch batch.
            batch_size: 100,
            poll_interval,
        }
    }

    /// Runs forever, waking every `poll_interval` to drain PENDING items.
    /// Intended to be spawned as its own task by the binary.
    pub async fn run_forever(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once().await {
                tracing::error!(error = %e, "enrichment scheduler pass failed");
            }
        }
    }

    /// Leases and processes one batch. Exposed separately from
    /// `run_forever` so tests and manual triggers can drive a single pass.
    pub async fn run_once(&self) -> EngineResult<usize> {
        let items = self.store.lease_pending_enrichment_items(self.batch_size).await?;
        tracing::info!(count = items.len(), "enrichment worker leased items");
        for item in &items {
            if let Err(e) = self.enrich_one(item.id, &item.raw_name, &item.proposed_type, &item.context_chunk).await {
                tracing::error!(item_id = item.id, error = %e, "enrichment failed for item");
                let _ = self.store.update_enrichment_status(item.id, EnrichmentStatus::Failed).await;
            }
        }
        Ok(items.len())
    }

    async fn enrich_one(&self, item_id: i64, raw_name: &str, proposed_type: &str, context_chunk: &str) -> EngineResult<()> {
        let canonical_name = self.naming.propose_canonical_name(raw_name, proposed_type, context_chunk).await?;

        let embedding = self
            .embedder
            .embed_batch(&[canonical_name.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Consistency("embedding provider returned no vector".to_string()))?;

        let (node, created) =
            self.store.get_or_create_canonical_node(&canonical_name, proposed_type, &embedding).await?;
        if created {
            tracing::info!(canonical_name = %canonical_name, "created new canonical node via enrichment");
        } else {
            tracing::info!(canonical_name = %canonical_name, "enrichment resolved to existing canonical node");
        }

        if self.store.find_alias_case_insensitive(raw_name).await?.is_none() {
            self.store.insert_alias(raw_name, node.id, ENRICHMENT_ALIAS_CONFIDENCE).await?;
        }

        self.store.update_enrichment_status(item_id, EnrichmentStatus::Completed).await?;
        tracing::info!(raw_name, canonical_name = %canonical_name, "enrichment complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::embedder::{EmbeddingProvider, Embedder};
    use crate::models::{CanonicalNode, Document, DocumentStatus, DomainConfig, EnrichmentQueueItem, NodeAlias, OntologySchema};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct FakeNaming {
        name: String,
    }

    #[async_trait]
    impl CanonicalNamingProvider for FakeNaming {
        async fn propose_canonical_name(&self, _raw: &str, _t: &str, _ctx: &str) -> EngineResult<String> {
            Ok(self.name.clone())
        }
    }

    struct FakeEmbeddingProvider;

    #[async_trait]
    impl EmbeddingProvider for FakeEmbeddingProvider {
        async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }
    }

    struct FakeStore {
        items: Mutex<Vec<EnrichmentQueueItem>>,
        aliases_inserted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CanonicalStore for FakeStore {
        async fn get_document_by_hash(&self, _h: &str) -> EngineResult<Option<Document>> {
            unimplemented!()
        }
        async fn get_document(&self, _id: i64) -> EngineResult<Option<Document>> {
            unimplemented!()
        }
        async fn insert_document(&self, _f: &str, _h: &str, _s: &str, _d: i64) -> EngineResult<Document> {
            unimplemented!()
        }
        async fn update_document_status(
            &self,
            _id: i64,
            _s: DocumentStatus,
            _e: Option<&str>,
        ) -> EngineResult<Document> {
            unimplemented!()
        }
        async fn delete_document_row(&self, _id: i64) -> EngineResult<()> {
            unimplemented!()
        }
        async fn get_domain_config(&self, _id: i64) -> EngineResult<Option<DomainConfig>> {
            unimplemented!()
        }
        async fn create_domain_config(&self, _n: &str, _s: &OntologySchema) -> EngineResult<DomainConfig> {
            unimplemented!()
        }
        async fn get_canonical_node(&self, _id: i64) -> EngineResult<Option<CanonicalNode>> {
            unimplemented!()
        }
        async fn find_alias_case_insensitive(&self, _a: &str) -> EngineResult<Option<NodeAlias>> {
            Ok(None)
        }
        async fn nearest_canonical_node(&self, _e: &[f32]) -> EngineResult<Option<(CanonicalNode, f32)>> {
            unimplemented!()
        }
        async fn get_or_create_canonical_node(
            &self,
            name: &str,
            node_type: &str,
            embedding: &[f32],
        ) -> EngineResult<(CanonicalNode, bool)> {
            Ok((
                CanonicalNode { id: 42, node_type: node_type.to_string(), canonical_name: name.to_string(), embedding: embedding.to_vec() },
                true,
            ))
        }
        async fn insert_alias(&self, alias: &str, _cid: i64, _conf: f32) -> EngineResult<NodeAlias> {
            self.aliases_inserted.lock().unwrap().push(alias.to_string());
            Ok(NodeAlias { id: 1, alias: alias.to_string(), canonical_node_id: 42, confidence: 0.98 })
        }
        async fn enqueue_enrichment(&self, _r: &str, _p: &str, _c: &str) -> EngineResult<EnrichmentQueueItem> {
            unimplemented!()
        }
        async fn lease_pending_enrichment_items(&self, limit: i64) -> EngineResult<Vec<EnrichmentQueueItem>> {
            let mut items = self.items.lock().unwrap();
            let n = (limit as usize).min(items.len());
            Ok(items.drain(0..n).collect())
        }
        async fn update_enrichment_status(&self, _id: i64, _s: EnrichmentStatus) -> EngineResult<()> {
            Ok(())
        }
    }

    fn item(id: i64, raw_name: &str) -> EnrichmentQueueItem {
        let now = Utc::now();
        EnrichmentQueueItem {
            id,
            raw_name: raw_name.to_string(),
            proposed_type: "Person".to_string(),
            context_chunk: "Alice Smith works here.".to_string(),
            status: EnrichmentStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn enriches_and_aliases_an_unresolved_mention() {
        let store = Arc::new(FakeStore {
            items: Mutex::new(vec![item(1, "Alice")]),
            aliases_inserted: Mutex::new(Vec::new()),
        });
        let naming = Arc::new(FakeNaming { name: "Alice Smith".to_string() });
        let embedder = Embedder::new(Arc::new(FakeEmbeddingProvider) as Arc<dyn EmbeddingProvider>, 8);
        let worker = EnrichmentWorker::new(store.clone(), naming, embedder, Duration::from_secs(60));

        let processed = worker.run_once().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(store.aliases_inserted.lock().unwrap().as_slice(), &["Alice".to_string()]);
    }

    #[tokio::test]
    async fn empty_queue_processes_nothing() {
        let store = Arc::new(FakeStore { items: Mutex::new(Vec::new()), aliases_inserted: Mutex::new(Vec::new()) });
        let naming = Arc::new(FakeNaming { name: "X".to_string() });
        let embedder = Embedder::new(Arc::new(FakeEmbeddingProvider) as Arc<dyn EmbeddingProvider>, 8);
        let worker = EnrichmentWorker::new(store, naming, embedder, Duration::from_secs(60));
        assert_eq!(worker.run_once().await.unwrap(), 0);
    }
}
