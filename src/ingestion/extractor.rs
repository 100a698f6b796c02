//! LLM-backed entity/relation extraction with a per-ontology dynamic
//! prompt, built on a rig-core completion call per chunk.

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use serde::Deserialize;
use std::sync::Arc;

use crate::config::{EngineConfig, LlmProvider};
use crate::error::{EngineError, EngineResult};
use crate::models::{Chunk, ExtractedEntity, ExtractedRelation, ExtractionResult, OntologySchema};
use crate::security::{sanitize_for_prompt, sanitize_ontology_schema};

#[derive(Debug, Deserialize)]
struct RawExtractedEntity {
    id: String,
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
}

#[derive(Debug, Deserialize)]
struct RawExtractedRelation {
    source: String,
    target: String,
    #[serde(rename = "type")]
    relation_type: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawExtractionResult {
    #[serde(default)]
    entities: Vec<RawExtractedEntity>,
    #[serde(default)]
    relations: Vec<RawExtractedRelation>,
}

/// Builds the extraction system prompt for a given ontology. Returns an
/// empty string when there are no entity types, signalling callers to
/// short-circuit without invoking the provider.
fn create_dynamic_prompt(schema: &OntologySchema) -> String {
    let sanitized = sanitize_ontology_schema(&schema.entity_types, &schema.relation_types);
    if sanitized.entity_types.is_empty() {
        return String::new();
    }

    let relation_list = if sanitized.relation_types.is_empty() {
        "NONE".to_string()
    } else {
        sanitized.relation_types.join(", ")
    };

    format!(
        "You are an expert knowledge graph extractor. Your task is to identify entities and \
their relationships from the provided text according to a strict, user-defined ontology.\n\
Follow these rules:\n\
1.  Identify Entities: Find all significant entities. Entities MUST be one of the following \
types: {}.\n\
2.  Assign Canonical IDs: Create a unique, simple, uppercase, snake_case identifier for each \
entity (e.g., 'ELON_MUSK', 'TESLA_MOTORS').\n\
3.  Identify Relationships: Find explicit relationships between the identified entities. \
Relationships MUST be one of the following types: {}.\n\
4.  Format Output: Respond ONLY with a valid JSON object of the form \
{{\"entities\": [{{\"id\": string, \"name\": string, \"type\": string}}], \
\"relations\": [{{\"source\": string, \"target\": string, \"type\": string}}]}}.\n\
5.  If no entities or relations are found, return an empty list for the corresponding key. \
Do not explain.",
        sanitized.entity_types.join(", "),
        relation_list
    )
}

#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn complete_json(&self, system_prompt: &str, chunk_text: &str) -> EngineResult<String>;
}

#[async_trait]
impl ExtractionProvider for Arc<dyn ExtractionProvider> {
    async fn complete_json(&self, system_prompt: &str, chunk_text: &str) -> EngineResult<String> {
        self.as_ref().complete_json(system_prompt, chunk_text).await
    }
}

pub type DynExtractionProvider = Arc<dyn ExtractionProvider>;
pub type DynExtractor = Extractor<DynExtractionProvider>;

pub struct RigExtractionProvider {
    provider: LlmProvider,
    model: String,
}

impl RigExtractionProvider {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            provider: cfg.llm_provider,
            model: cfg.extraction_model.clone(),
        }
    }
}

#[async_trait]
impl ExtractionProvider for RigExtractionProvider {
    async fn complete_json(&self, system_prompt: &str, chunk_text: &str) -> EngineResult<String> {
        match self.provider {
            LlmProvider::OpenAi => self.complete_with_openai(system_prompt, chunk_text).await,
            other => Err(EngineError::Configuration(format!(
                "extraction is not available for provider {other:?}"
            ))),
        }
    }
}

impl RigExtractionProvider {
    async fn complete_with_openai(&self, system_prompt: &str, chunk_text: &str) -> EngineResult<String> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::openai;

        let client = openai::Client::from_env();
        let model_name = if self.model.is_empty() { "gpt-4o-mini" } else { self.model.as_str() };

        let agent = client.agent(model_name).preamble(system_prompt).temperature(0.0).build();

        let sanitized_chunk = sanitize_for_prompt(chunk_text, "extraction chunk");
        let response = agent
            .prompt(sanitized_chunk.as_str())
            .await
            .map_err(|e| EngineError::TransientProvider(e.to_string()))?;

        Ok(response
            .trim()
            .trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string())
    }
}

pub struct Extractor<P: ExtractionProvider> {
    provider: P,
}

impl<P: ExtractionProvider> Extractor<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Extracts entities and relations from a single chunk. Per-chunk
    /// provider or parse failures yield an empty result and are logged,
    /// never propagated, so one bad chunk never stalls the batch.
    pub async fn extract_from_chunk(&self, chunk_text: &str, schema: &OntologySchema) -> ExtractionResult {
        if chunk_text.trim().is_empty() || schema.entity_types.is_empty() {
            return ExtractionResult::default();
        }

        let system_prompt = create_dynamic_prompt(schema);
        if system_prompt.is_empty() {
            tracing::warn!("skipping extraction due to empty ontology schema");
            return ExtractionResult::default();
        }

        let completion = match self.provider.complete_json(&system_prompt, chunk_text).await {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "extraction provider call failed");
                return ExtractionResult::default();
            }
        };

        match serde_json::from_str::<RawExtractionResult>(&completion) {
            Ok(raw) => {
                tracing::info!(
                    entities = raw.entities.len(),
                    relations = raw.relations.len(),
                    "extracted entities and relations from chunk"
                );
                ExtractionResult {
                    entities: raw
                        .entities
                        .into_iter()
                        .map(|e| ExtractedEntity {
                            temp_id: e.id,
                            name: e.name,
                            entity_type: e.entity_type,
                        })
                        .collect(),
                    relations: raw
                        .relations
                        .into_iter()
                        .map(|r| ExtractedRelation {
                            source_temp_id: r.source,
                            target_temp_id: r.target,
                            relation_type: r.relation_type,
                            chunk_id: None,
                        })
                        .collect(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, response = %completion, "could not parse extraction JSON for chunk");
                ExtractionResult::default()
            }
        }
    }

    /// Fans out `extract_from_chunk` across all chunks concurrently, then
    /// deduplicates entities by temporary id (first occurrence wins) and
    /// annotates every relation with its originating chunk id.
    pub async fn extract_from_all_chunks(
        &self,
        chunks: &[Chunk],
        schema: &OntologySchema,
    ) -> (Vec<ExtractedEntity>, Vec<ExtractedRelation>) {
        if schema.entity_types.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let futures = chunks.iter().map(|c| self.extract_from_chunk(&c.text, schema));
        let results = join_all(futures).await;

        let mut all_entities: IndexMap<String, ExtractedEntity> = IndexMap::new();
        let mut all_relations = Vec::new();

        for (chunk, result) in chunks.iter().zip(results.into_iter()) {
            for entity in result.entities {
                all_entities.entry(entity.temp_id.clone()).or_insert(entity);
            }
            for relation in result.relations {
                all_relations.push(ExtractedRelation {
                    chunk_id: Some(chunk.id.clone()),
                    ..relation
                });
            }
        }

        (all_entities.into_values().collect(), all_relations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn schema() -> OntologySchema {
        OntologySchema {
            entity_types: vec!["Person".to_string()],
            relation_types: vec!["KNOWS".to_string()],
            source_types: Default::default(),
            target_types: Default::default(),
        }
    }

    fn chunk(id: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: 1,
            sequence_num: 0,
            text: text.to_string(),
            token_count: 2,
            embedding: Vec::new(),
        }
    }

    struct FakeProvider {
        response: String,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExtractionProvider for FakeProvider {
        async fn complete_json(&self, _system_prompt: &str, _chunk_text: &str) -> EngineResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn empty_ontology_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = Extractor::new(FakeProvider { response: "{}".to_string(), calls: calls.clone() });
        let empty_schema = OntologySchema {
            entity_types: vec![],
            relation_types: vec![],
            source_types: Default::default(),
            target_types: Default::default(),
        };
        let result = extractor.extract_from_chunk("Alice knows Bob.", &empty_schema).await;
        assert!(result.entities.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_json_yields_empty_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = Extractor::new(FakeProvider {
            response: "not json".to_string(),
            calls,
        });
        let result = extractor.extract_from_chunk("Alice knows Bob.", &schema()).await;
        assert!(result.entities.is_empty());
        assert!(result.relations.is_empty());
    }

    #[tokio::test]
    async fn dedups_entities_by_temp_id_first_occurrence_wins() {
        let response = serde_json::json!({
            "entities": [
                {"id": "ALICE", "name": "Alice", "type": "Person"},
                {"id": "ALICE", "name": "Alice Smith", "type": "Person"}
            ],
            "relations": []
        })
        .to_string();
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = Extractor::new(FakeProvider { response, calls });
        let chunks = vec![chunk("c1", "Alice."), chunk("c2", "Alice again.")];
        let (entities, _) = extractor.extract_from_all_chunks(&chunks, &schema()).await;
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Alice");
    }

    #[tokio::test]
    async fn relations_are_annotated_with_chunk_id() {
        let response = serde_json::json!({
            "entities": [],
            "relations": [{"source": "A", "target": "B", "type": "KNOWS"}]
        })
        .to_string();
        let calls = Arc::new(AtomicUsize::new(0));
        let extractor = Extractor::new(FakeProvider { response, calls });
        let chunks = vec![chunk("c1", "A knows B.")];
        let (_, relations) = extractor.extract_from_all_chunks(&chunks, &schema()).await;
        assert_eq!(relations[0].chunk_id.as_deref(), Some("c1"));
    }
}
