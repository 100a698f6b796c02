//! Hybrid retriever: vector search over chunk embeddings, LLM-planned graph
//! traversal, and Reciprocal Rank Fusion across the two.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::ingestion::embedder::DynEmbedder;
use crate::rag::planner::{plan_query, QueryPlan, QueryPlanProvider};
use crate::security::identifier::sanitize_label;
use crate::storage::graph_store::GraphStore;

pub use crate::storage::graph_store::GraphChunkHit as RetrievedChunk;

const FIND_CONNECTIONS_MAX_HOPS: u32 = 3;
/// Chunks pulled per semantically-matched entity when the planner routes to
/// `semantic_search`, matching `_get_entity_attributes`'s own `k=5` default
/// scaled down since we call it once per entity hit rather than once total.
const CHUNKS_PER_ENTITY_HIT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Graph,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vector" => Ok(SearchMode::Vector),
            "graph" => Ok(SearchMode::Graph),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(EngineError::Validation(format!("unknown search mode: {other}"))),
        }
    }
}

pub struct Retriever {
    graph_store: Arc<dyn GraphStore>,
    embedder: DynEmbedder,
    planner: Arc<dyn QueryPlanProvider>,
    rrf_k: u32,
}

impl Retriever {
    pub fn new(graph_store: Arc<dyn GraphStore>, embedder: DynEmbedder, planner: Arc<dyn QueryPlanProvider>, rrf_k: u32) -> Self {
        Self { graph_store, embedder, planner, rrf_k }
    }

    async fn embed_one(&self, text: &str) -> EngineResult<Vec<f32>> {
        self.embedder
            .embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EngineError::Consistency("embedding provider returned no vector for query".to_string()))
    }

    /// Pure vector search on chunk embeddings.
    async fn vector_search(&self, query: &str, k: usize) -> EngineResult<Vec<RetrievedChunk>> {
        let embedding = self.embed_one(query).await?;
        self.graph_store.vector_search_chunks(&embedding, k).await
    }

    /// LLM-planned entity search, expanded to the chunks that mention each
    /// matched entity so results stay chunk-shaped like every other branch.
    async fn semantic_search(&self, query: &str, plan: &QueryPlan, k: usize) -> EngineResult<Vec<RetrievedChunk>> {
        let entity_type = plan.string_param("entity_type").and_then(|t| sanitize_label(&t).ok());
        let embedding = self.embed_one(query).await?;
        let hybrid_results = self.graph_store.hybrid_search(&embedding, k, true).await?;

        let mut hits = Vec::new();
        for result in hybrid_results {
            if let Some(ref wanted_type) = entity_type {
                if &result.hit.node_type != wanted_type {
                    continue;
                }
            }
            let mentioning_chunks =
                self.graph_store.get_attributes(&result.hit.canonical_name, CHUNKS_PER_ENTITY_HIT).await?;
            for mut chunk in mentioning_chunks {
                chunk.score = result.hit.score;
                hits.push(chunk);
            }
        }
        hits.truncate(k);
        Ok(hits)
    }

    /// Executes the graph branch: plan the query's intent, then dispatch to
    /// the matching graph-store operation. Matches `_graph_search`'s
    /// intent-to-method table exactly.
    async fn graph_search(&self, query: &str, k: usize) -> EngineResult<Vec<RetrievedChunk>> {
        let plan = plan_query(self.planner.as_ref(), query).await;

        match plan.intent.as_str() {
            "find_connections" => {
                let names = plan.string_array_param("entity_names");
                self.graph_store.find_connections(&names, FIND_CONNECTIONS_MAX_HOPS, k).await
            }
            "find_mitigating_controls" => {
                let risk_name = plan.string_param("risk_name").unwrap_or_default();
                self.graph_store.find_mitigating_controls(&risk_name, k).await
            }
            "get_attributes" => {
                let entity_name = plan.string_param("entity_name").unwrap_or_default();
                self.graph_store.get_attributes(&entity_name, k).await
            }
            _ => self.semantic_search(query, &plan, k).await,
        }
    }

    /// Fuses multiple ranked result sets by chunk id: `score = sum(1 /
    /// (rrf_k + rank))` across every set a chunk appears in, 1-indexed rank.
    fn reciprocal_rank_fusion(&self, result_sets: Vec<Vec<RetrievedChunk>>) -> Vec<RetrievedChunk> {
        let mut scores: HashMap<String, f64> = HashMap::new();
        let mut docs_by_id: HashMap<String, RetrievedChunk> = HashMap::new();

        for results in result_sets {
            for (idx, chunk) in results.into_iter().enumerate() {
                let rank = (idx + 1) as f64;
                let doc_id = chunk.chunk_id.clone();
                docs_by_id.entry(doc_id.clone()).or_insert(chunk);
                let rrf_score = 1.0 / (self.rrf_k as f64 + rank);
                *scores.entry(doc_id).or_insert(0.0) += rrf_score;
            }
        }

        let mut fused: Vec<RetrievedChunk> = scores
            .into_iter()
            .filter_map(|(id, score)| {
                docs_by_id.remove(&id).map(|mut c| {
                    c.score = score;
                    c
                })
            })
            .collect();
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        fused
    }

    /// The main retrieval entry point: plans the query's intent, then
    /// dispatches to vector search, graph search, or both.
    pub async fn retrieve(&self, query: &str, top_k: usize, mode: SearchMode) -> EngineResult<Vec<RetrievedChunk>> {
        match mode {
            SearchMode::Vector => self.vector_search(query, top_k).await,
            SearchMode::Graph => self.graph_search(query, top_k).await,
            SearchMode::Hybrid => {
                let widened = top_k * 2;
                let (vector_results, graph_results) =
                    tokio::try_join!(self.vector_search(query, widened), self.graph_search(query, widened))?;
                let mut fused = self.reciprocal_rank_fusion(vec![vector_results, graph_results]);
                fused.truncate(top_k);
                Ok(fused)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str) -> RetrievedChunk {
        RetrievedChunk { chunk_id: id.to_string(), document_id: Some(1), text: format!("text for {id}"), score: 0.0 }
    }

    fn fake_retriever() -> Retriever {
        // RRF is pure given result sets, so a minimal retriever with no
        // live dependencies is enough to exercise `reciprocal_rank_fusion`.
        struct Unused;
        #[async_trait::async_trait]
        impl crate::ingestion::embedder::EmbeddingProvider for Unused {
            async fn embed_batch(&self, _texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
                unimplemented!()
            }
        }
        #[async_trait::async_trait]
        impl crate::rag::planner::QueryPlanProvider for Unused {
            async fn complete_plan_json(&self, _s: &str, _u: &str) -> EngineResult<String> {
                unimplemented!()
            }
        }
        struct UnusedStore;
        #[async_trait::async_trait]
        impl GraphStore for UnusedStore {
            async fn initialize_schema(&self, _d: usize) -> EngineResult<()> {
                unimplemented!()
            }
            async fn upsert_document(&self, _d: i64, _f: &str) -> EngineResult<()> {
                unimplemented!()
            }
            async fn upsert_chunk(&self, _d: i64, _c: &str, _t: &str, _e: &[f32]) -> EngineResult<()> {
                unimplemented!()
            }
            async fn upsert_entities(&self, _e: &[crate::models::GraphEntity]) -> EngineResult<()> {
                unimplemented!()
            }
            async fn upsert_relations(&self, _r: &[crate::models::GraphRelation]) -> EngineResult<()> {
                unimplemented!()
            }
            async fn link_chunk_to_entities(&self, _c: &str, _ids: &[i64]) -> EngineResult<()> {
                unimplemented!()
            }
            async fn delete_document(&self, _d: i64) -> EngineResult<()> {
                unimplemented!()
            }
            async fn garbage_collect_orphans(&self) -> EngineResult<i64> {
                unimplemented!()
            }
            async fn vector_search(&self, _v: &[f32], _k: usize) -> EngineResult<Vec<crate::storage::graph_store::GraphSearchHit>> {
                unimplemented!()
            }
            async fn vector_search_chunks(&self, _v: &[f32], _k: usize) -> EngineResult<Vec<RetrievedChunk>> {
                unimplemented!()
            }
            async fn hybrid_search(&self, _v: &[f32], _k: usize, _e: bool) -> EngineResult<Vec<crate::storage::graph_store::HybridSearchResult>> {
                unimplemented!()
            }
            async fn find_connections(&self, _n: &[String], _h: u32, _l: usize) -> EngineResult<Vec<RetrievedChunk>> {
                unimplemented!()
            }
            async fn find_mitigating_controls(&self, _r: &str, _l: usize) -> EngineResult<Vec<RetrievedChunk>> {
                unimplemented!()
            }
            async fn get_attributes(&self, _n: &str, _l: usize) -> EngineResult<Vec<RetrievedChunk>> {
                unimplemented!()
            }
        }

        Retriever::new(
            Arc::new(UnusedStore),
            crate::ingestion::embedder::Embedder::new(Arc::new(Unused) as Arc<dyn crate::ingestion::embedder::EmbeddingProvider>, 8),
            Arc::new(Unused),
            60,
        )
    }

    #[test]
    fn fuses_overlapping_result_sets_by_chunk_id() {
        let retriever = fake_retriever();
        let vector_results = vec![chunk("a"), chunk("b"), chunk("c")];
        let graph_results = vec![chunk("b"), chunk("a")];
        let fused = retriever.reciprocal_rank_fusion(vec![vector_results, graph_results]);
        // "a" appears at rank 1 in both sets, "b" at rank 2 then rank 1: both
        // outrank "c" (only in one set, at rank 3).
        let ids: Vec<&str> = fused.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids[2], "c");
        assert!(ids[0] == "a" || ids[0] == "b");
    }

    #[test]
    fn search_mode_parses_known_values() {
        assert_eq!(SearchMode::from_str("vector").unwrap(), SearchMode::Vector);
        assert_eq!(SearchMode::from_str("graph").unwrap(), SearchMode::Graph);
        assert_eq!(SearchMode::from_str("hybrid").unwrap(), SearchMode::Hybrid);
        assert!(SearchMode::from_str("bogus").is_err());
    }
}
