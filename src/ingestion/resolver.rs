//! Neuro-symbolic entity resolution (the "Harmonizer"). Resolves extracted
//! entity strings against the Canonical Store. Pipeline: exact alias match
//! -> vector similarity -> enrichment queue.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineResult;
use crate::ingestion::embedder::{Embedder, EmbeddingProvider};
use crate::models::{ExtractedEntity, ExtractedRelation};
use crate::storage::canonical_store::CanonicalStore;

pub enum ResolutionOutcome {
    Resolved { canonical_id: i64 },
    Unresolved { name: String, entity_type: String },
}

pub struct Resolver<P: EmbeddingProvider> {
    store: Arc<dyn CanonicalStore>,
    embedder: Embedder<P>,
    resolution_threshold: f32,
}

impl<P: EmbeddingProvider> Resolver<P> {
    pub fn new(store: Arc<dyn CanonicalStore>, embedder: Embedder<P>, resolution_threshold: f32) -> Self {
        Self { store, embedder, resolution_threshold }
    }

    /// Step 1 (symbolic): case-insensitive exact alias match.
    async fn find_by_exact_match(&self, alias_text: &str) -> EngineResult<Option<i64>> {
        let alias = self.store.find_alias_case_insensitive(alias_text).await?;
        if let Some(ref a) = alias {
            tracing::info!(
                alias = alias_text,
                canonical_id = a.canonical_node_id,
                "resolved via exact alias match"
            );
        }
        Ok(alias.map(|a| a.canonical_node_id))
    }

    /// Step 2 (neuro): nearest canonical node by embedding cosine
    /// similarity. Returns `None` if the store is empty.
    async fn find_by_vector_similarity(&self, name: &str) -> EngineResult<Option<(i64, f32)>> {
        let embedding = self.embedder.embed_batch(&[name.to_string()]).await?;
        let Some(embedding) = embedding.into_iter().next() else {
            return Ok(None);
        };
        if embedding.is_empty() {
            return Ok(None);
        }

        let nearest = self.store.nearest_canonical_node(&embedding).await?;
        Ok(nearest.map(|(node, similarity)| {
            tracing::info!(name, canonical_name = %node.canonical_name, similarity, "vector search found closest match");
            (node.id, similarity)
        }))
    }

    /// Resolves a single entity using the neuro-symbolic pipeline.
    pub async fn resolve_entity(&self, name: &str, entity_type: &str) -> EngineResult<ResolutionOutcome> {
        if let Some(canonical_id) = self.find_by_exact_match(name).await? {
            return Ok(ResolutionOutcome::Resolved { canonical_id });
        }

        if let Some((canonical_id, similarity)) = self.find_by_vector_similarity(name).await? {
            if similarity >= self.resolution_threshold {
                return Ok(ResolutionOutcome::Resolved { canonical_id });
            }
        }

        tracing::info!(name, "could not resolve with high confidence, enqueuing for enrichment");
        Ok(ResolutionOutcome::Unresolved {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
        })
    }

    /// Resolves a batch of entities, returning the temp-id -> canonical-id
    /// map for resolved entities and the list of unresolved ones.
    pub async fn resolve_all(
        &self,
        entities: &[ExtractedEntity],
    ) -> EngineResult<(HashMap<String, i64>, Vec<ExtractedEntity>)> {
        let mut resolved_map = HashMap::new();
        let mut unresolved_items = Vec::new();

        for entity in entities {
            match self.resolve_entity(&entity.name, &entity.entity_type).await? {
                ResolutionOutcome::Resolved { canonical_id } => {
                    resolved_map.insert(entity.temp_id.clone(), canonical_id);
                }
                ResolutionOutcome::Unresolved { .. } => {
                    unresolved_items.push(entity.clone());
                }
            }
        }

        Ok((resolved_map, unresolved_items))
    }
}

/// Remaps extracted relations' temporary ids to canonical ids using
/// `id_map`, dropping relations whose source or target never resolved and
/// dropping self-loops created by two surface forms resolving to the same
/// canonical node.
pub fn remap_relations(
    relations: &[ExtractedRelation],
    id_map: &HashMap<String, i64>,
) -> Vec<(i64, i64, String, Option<String>)> {
    relations
        .iter()
        .filter_map(|r| {
            let source_id = id_map.get(&r.source_temp_id)?;
            let target_id = id_map.get(&r.target_temp_id)?;
            if source_id == target_id {
                return None;
            }
            Some((*source_id, *target_id, r.relation_type.clone(), r.chunk_id.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(source: &str, target: &str) -> ExtractedRelation {
        ExtractedRelation {
            source_temp_id: source.to_string(),
            target_temp_id: target.to_string(),
            relation_type: "KNOWS".to_string(),
            chunk_id: Some("c1".to_string()),
        }
    }

    #[test]
    fn drops_relations_with_unresolved_endpoints() {
        let mut id_map = HashMap::new();
        id_map.insert("A".to_string(), 1);
        let relations = vec![relation("A", "B")];
        let remapped = remap_relations(&relations, &id_map);
        assert!(remapped.is_empty());
    }

    #[test]
    fn drops_self_loops_from_merged_aliases() {
        let mut id_map = HashMap::new();
        id_map.insert("A".to_string(), 1);
        id_map.insert("B".to_string(), 1);
        let relations = vec![relation("A", "B")];
        let remapped = remap_relations(&relations, &id_map);
        assert!(remapped.is_empty());
    }

    #[test]
    fn keeps_resolved_cross_entity_relations() {
        let mut id_map = HashMap::new();
        id_map.insert("A".to_string(), 1);
        id_map.insert("B".to_string(), 2);
        let relations = vec![relation("A", "B")];
        let remapped = remap_relations(&relations, &id_map);
        assert_eq!(remapped, vec![(1, 2, "KNOWS".to_string(), Some("c1".to_string()))]);
    }
}
