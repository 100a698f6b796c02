//! Typed property graph backed by Neo4j, with native cosine-similarity
//! vector indexes, built on the `neo4rs` driver and its Cypher query
//! builder.
//!
//! Every extracted entity is stored under a single `:Entity` label with a
//! `type` property rather than a dynamic per-type label, so `sanitize_label`
//! only ever guards relationship types and the index maintenance path,
//! never arbitrary entity labels chosen by extracted text.

use async_trait::async_trait;
use neo4rs::{query, Graph};

use crate::error::{EngineError, EngineResult};
use crate::models::{GraphEntity, GraphRelation};
use crate::security::identifier::sanitize_label;

/// Which native vector index a similarity search targets. The graph carries
/// one index per node label (`initialize_schema` creates both): a chunk-level
/// index for passage retrieval and an entity-level index for graph search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorIndexLabel {
    Entity,
    Chunk,
}

impl VectorIndexLabel {
    fn index_name(self) -> &'static str {
        match self {
            VectorIndexLabel::Entity => "entityEmbeddingIndex",
            VectorIndexLabel::Chunk => "chunkEmbeddingIndex",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphSearchHit {
    pub canonical_id: i64,
    pub canonical_name: String,
    pub node_type: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct GraphNeighbor {
    pub relation_type: String,
    pub canonical_id: i64,
    pub canonical_name: String,
    pub node_type: String,
}

#[derive(Debug, Clone)]
pub struct HybridSearchResult {
    pub hit: GraphSearchHit,
    pub neighbors: Vec<GraphNeighbor>,
}

/// A chunk-shaped retrieval result: the common currency the Retriever fuses
/// across vector search and every graph-intent branch, whether it came from
/// a plain similarity search or from walking relationships off a resolved
/// entity.
#[derive(Debug, Clone)]
pub struct GraphChunkHit {
    pub chunk_id: String,
    pub document_id: Option<i64>,
    pub text: String,
    pub score: f64,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn initialize_schema(&self, embedding_dimensions: usize) -> EngineResult<()>;

    async fn upsert_document(&self, document_id: i64, filename: &str) -> EngineResult<()>;
    async fn upsert_chunk(
        &self,
        document_id: i64,
        chunk_id: &str,
        text: &str,
        embedding: &[f32],
    ) -> EngineResult<()>;
    async fn upsert_entities(&self, entities: &[GraphEntity]) -> EngineResult<()>;
    async fn upsert_relations(&self, relations: &[GraphRelation]) -> EngineResult<()>;
    async fn link_chunk_to_entities(&self, chunk_id: &str, canonical_ids: &[i64]) -> EngineResult<()>;

    async fn delete_document(&self, document_id: i64) -> EngineResult<()>;
    async fn garbage_collect_orphans(&self) -> EngineResult<i64>;

    /// Pure entity-embedding similarity search (no graph expansion).
    async fn vector_search(&self, query_vector: &[f32], top_k: usize) -> EngineResult<Vec<GraphSearchHit>>;
    /// Pure chunk-embedding similarity search, the Retriever's `vector`
    /// search-type path and the base of its `hybrid` fusion.
    async fn vector_search_chunks(&self, query_vector: &[f32], top_k: usize) -> EngineResult<Vec<GraphChunkHit>>;
    async fn hybrid_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        expand_neighbors: bool,
    ) -> EngineResult<Vec<HybridSearchResult>>;

    /// Chunks mentioning any entity on a shortest path (≤`max_hops`) between
    /// any two of `entity_names`. Entity names match by substring, as the
    /// original's `WHERE e.name CONTAINS name` does.
    async fn find_connections(&self, entity_names: &[String], max_hops: u32, limit: usize) -> EngineResult<Vec<GraphChunkHit>>;
    /// Chunks mentioning a Control that `MITIGATES` a Risk whose name
    /// contains `risk_name`.
    async fn find_mitigating_controls(&self, risk_name: &str, limit: usize) -> EngineResult<Vec<GraphChunkHit>>;
    /// Chunks mentioning an entity whose name contains `entity_name`,
    /// falling back to a synthesized `"name: type"` line when an entity has
    /// no chunk mentions at all.
    async fn get_attributes(&self, entity_name: &str, limit: usize) -> EngineResult<Vec<GraphChunkHit>>;
}

/// True when a query failure looks like a missing/unsupported vector index
/// rather than some other Cypher or connection error, mirroring the
/// original's `"vector" in str(e).lower() or "index" in str(e).lower()`
/// sniff before falling back to an unranked scan.
fn is_vector_index_error(error: &neo4rs::Error) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("vector") || message.contains("index")
}

pub struct Neo4jGraphStore {
    graph: Graph,
}

impl Neo4jGraphStore {
    pub async fn connect(uri: &str, user: &str, password: &str) -> EngineResult<Self> {
        let url = url::Url::parse(uri).map_err(|e| EngineError::Configuration(format!("invalid NEO4J_URI: {e}")))?;
        let host = url.host_str().unwrap_or("localhost");
        let port = url.port().unwrap_or(7687);
        let addr = format!("{host}:{port}");

        tracing::info!(addr, "connecting to Neo4j");
        let graph = Graph::new(&addr, user, password)
            .await
            .map_err(EngineError::Graph)?;
        tracing::info!("Neo4j connection established");
        Ok(Self { graph })
    }
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn initialize_schema(&self, embedding_dimensions: usize) -> EngineResult<()> {
        let constraints = [
            "CREATE CONSTRAINT document_id IF NOT EXISTS FOR (d:Document) REQUIRE d.id IS UNIQUE",
            "CREATE CONSTRAINT chunk_id IF NOT EXISTS FOR (c:Chunk) REQUIRE c.id IS UNIQUE",
            "CREATE CONSTRAINT entity_canonical_id IF NOT EXISTS FOR (e:Entity) REQUIRE e.canonical_id IS UNIQUE",
        ];
        for stmt in constraints {
            self.graph.run(query(stmt)).await?;
        }

        for label in [VectorIndexLabel::Entity, VectorIndexLabel::Chunk] {
            let index_name = label.index_name();
            let node_label = match label {
                VectorIndexLabel::Entity => "Entity",
                VectorIndexLabel::Chunk => "Chunk",
            };
            let cypher = format!(
                "CREATE VECTOR INDEX {index_name} IF NOT EXISTS
                 FOR (n:{node_label}) ON (n.embedding)
                 OPTIONS {{ indexConfig: {{
                   `vector.dimensions`: {embedding_dimensions},
                   `vector.similarity_function`: 'cosine'
                 }} }}"
            );
            self.graph.run(query(&cypher)).await?;
        }

        tracing::info!("graph schema initialized");
        Ok(())
    }

    async fn upsert_document(&self, document_id: i64, filename: &str) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MERGE (d:Document {id: $doc_id})
                     ON CREATE SET d.filename = $filename, d.created_at = timestamp()
                     ON MATCH SET d.filename = $filename, d.updated_at = timestamp()",
                )
                .param("doc_id", document_id)
                .param("filename", filename),
            )
            .await?;
        Ok(())
    }

    async fn upsert_chunk(
        &self,
        document_id: i64,
        chunk_id: &str,
        text: &str,
        embedding: &[f32],
    ) -> EngineResult<()> {
        let embedding_f64: Vec<f64> = embedding.iter().map(|v| *v as f64).collect();
        self.graph
            .run(
                query(
                    "MATCH (d:Document {id: $doc_id})
                     MERGE (c:Chunk {id: $chunk_id})
                     ON CREATE SET c.text = $text, c.embedding = $embedding, c.document_id = $doc_id, c.created_at = timestamp()
                     ON MATCH SET c.text = $text, c.embedding = $embedding, c.document_id = $doc_id, c.updated_at = timestamp()
                     MERGE (d)-[:HAS_CHUNK]->(c)",
                )
                .param("doc_id", document_id)
                .param("chunk_id", chunk_id)
                .param("text", text)
                .param("embedding", embedding_f64),
            )
            .await?;
        Ok(())
    }

    async fn upsert_entities(&self, entities: &[GraphEntity]) -> EngineResult<()> {
        for entity in entities {
            let embedding_f64: Vec<f64> = entity.embedding.iter().map(|v| *v as f64).collect();
            self.graph
                .run(
                    query(
                        "MERGE (e:Entity {canonical_id: $canonical_id})
                         ON CREATE SET e.name = $name, e.type = $node_type, e.embedding = $embedding, e.created_at = timestamp()
                         ON MATCH SET e.name = $name, e.type = $node_type, e.embedding = $embedding, e.updated_at = timestamp()",
                    )
                    .param("canonical_id", entity.canonical_id)
                    .param("name", entity.canonical_name.as_str())
                    .param("node_type", entity.node_type.as_str())
                    .param("embedding", embedding_f64),
                )
                .await?;
        }
        Ok(())
    }

    async fn upsert_relations(&self, relations: &[GraphRelation]) -> EngineResult<()> {
        // Cypher doesn't allow parameterized relationship types, so relations
        // are grouped by type and one query is issued per group.
        let mut grouped: std::collections::HashMap<String, Vec<&GraphRelation>> = std::collections::HashMap::new();
        for rel in relations {
            grouped.entry(rel.relation_type.clone()).or_default().push(rel);
        }

        for (relation_type, batch) in grouped {
            let safe_type = sanitize_label(&relation_type)?;
            let cypher = format!(
                "UNWIND $batch AS row
                 MATCH (s:Entity {{canonical_id: row.source}})
                 MATCH (t:Entity {{canonical_id: row.target}})
                 MERGE (s)-[r:{safe_type}]->(t)
                 ON CREATE SET r.chunk_id = row.chunk_id, r.created_at = timestamp()
                 ON MATCH SET r.chunk_id = row.chunk_id, r.updated_at = timestamp()"
            );

            let rows: Vec<neo4rs::BoltMap> = batch
                .iter()
                .map(|r| {
                    let mut map = std::collections::HashMap::new();
                    map.insert("source".to_string(), neo4rs::BoltType::from(r.source_canonical_id));
                    map.insert("target".to_string(), neo4rs::BoltType::from(r.target_canonical_id));
                    map.insert(
                        "chunk_id".to_string(),
                        r.chunk_id
                            .clone()
                            .map(neo4rs::BoltType::from)
                            .unwrap_or(neo4rs::BoltType::Null(neo4rs::BoltNull)),
                    );
                    neo4rs::BoltMap::from(map)
                })
                .collect();

            self.graph.run(query(&cypher).param("batch", rows)).await?;
        }
        Ok(())
    }

    async fn link_chunk_to_entities(&self, chunk_id: &str, canonical_ids: &[i64]) -> EngineResult<()> {
        if canonical_ids.is_empty() {
            return Ok(());
        }
        self.graph
            .run(
                query(
                    "MATCH (c:Chunk {id: $chunk_id})
                     UNWIND $ids AS cid
                     MATCH (e:Entity {canonical_id: cid})
                     MERGE (c)-[:MENTIONS]->(e)",
                )
                .param("chunk_id", chunk_id)
                .param("ids", canonical_ids.to_vec()),
            )
            .await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: i64) -> EngineResult<()> {
        self.graph
            .run(
                query(
                    "MATCH (d:Document {id: $doc_id})-[:HAS_CHUNK]->(c:Chunk)
                     DETACH DELETE c",
                )
                .param("doc_id", document_id),
            )
            .await?;
        self.graph
            .run(query("MATCH (d:Document {id: $doc_id}) DETACH DELETE d").param("doc_id", document_id))
            .await?;
        tracing::info!(document_id, "deleted document and its chunks");
        Ok(())
    }

    async fn garbage_collect_orphans(&self) -> EngineResult<i64> {
        let mut cursor = self
            .graph
            .execute(query(
                "MATCH (e:Entity)
                 WHERE NOT (e)<-[:MENTIONS]-()
                 WITH e, e.canonical_id AS deleted_id
                 DETACH DELETE e
                 RETURN count(deleted_id) AS deleted_count",
            ))
            .await?;

        let count = if let Some(row) = cursor.next().await? {
            row.get::<i64>("deleted_count").unwrap_or(0)
        } else {
            0
        };
        tracing::info!(count, "garbage collected orphaned entities");
        Ok(count)
    }

    async fn vector_search(&self, query_vector: &[f32], top_k: usize) -> EngineResult<Vec<GraphSearchHit>> {
        let vec_f64: Vec<f64> = query_vector.iter().map(|v| *v as f64).collect();
        let index_name = VectorIndexLabel::Entity.index_name();
        let primary = self
            .graph
            .execute(
                query(&format!(
                    "CALL db.index.vector.queryNodes('{index_name}', $k, $embedding)
                     YIELD node, score
                     RETURN node.canonical_id AS canonical_id, node.name AS name, node.type AS node_type, score
                     ORDER BY score DESC"
                ))
                .param("k", top_k as i64)
                .param("embedding", vec_f64),
            )
            .await;

        // On index absence, fall back to an unranked scan capped at top_k,
        // same as the original's except-branch around `queryNodes`.
        let mut cursor = match primary {
            Ok(cursor) => cursor,
            Err(e) if is_vector_index_error(&e) => {
                tracing::warn!(error = %e, "entity vector search failed (likely no vector index support), falling back to unranked scan");
                self.graph
                    .execute(
                        query(
                            "MATCH (node:Entity)
                             RETURN node.canonical_id AS canonical_id, node.name AS name, node.type AS node_type, 0.5 AS score
                             LIMIT $k",
                        )
                        .param("k", top_k as i64),
                    )
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await? {
            hits.push(GraphSearchHit {
                canonical_id: row.get("canonical_id").unwrap_or_default(),
                canonical_name: row.get("name").unwrap_or_default(),
                node_type: row.get("node_type").unwrap_or_default(),
                score: row.get("score").unwrap_or_default(),
            });
        }
        Ok(hits)
    }

    async fn vector_search_chunks(&self, query_vector: &[f32], top_k: usize) -> EngineResult<Vec<GraphChunkHit>> {
        let vec_f64: Vec<f64> = query_vector.iter().map(|v| *v as f64).collect();
        let index_name = VectorIndexLabel::Chunk.index_name();
        let primary = self
            .graph
            .execute(
                query(&format!(
                    "CALL db.index.vector.queryNodes('{index_name}', $k, $embedding)
                     YIELD node, score
                     RETURN node.id AS chunk_id, node.text AS text, node.document_id AS document_id, score
                     ORDER BY score DESC"
                ))
                .param("k", top_k as i64)
                .param("embedding", vec_f64),
            )
            .await;

        // Same documented fallback as `vector_search`: an index-absence
        // error degrades to an unranked scan of chunks rather than failing
        // the query outright.
        let mut cursor = match primary {
            Ok(cursor) => cursor,
            Err(e) if is_vector_index_error(&e) => {
                tracing::warn!(error = %e, "chunk vector search failed (likely no vector index support), falling back to unranked scan");
                self.graph
                    .execute(
                        query(
                            "MATCH (d:Document)-[:HAS_CHUNK]->(c:Chunk)
                             RETURN c.id AS chunk_id, c.text AS text, d.id AS document_id, 0.5 AS score
                             LIMIT $k",
                        )
                        .param("k", top_k as i64),
                    )
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await? {
            hits.push(GraphChunkHit {
                chunk_id: row.get("chunk_id").unwrap_or_default(),
                document_id: row.get("document_id").ok(),
                text: row.get("text").unwrap_or_default(),
                score: row.get("score").unwrap_or_default(),
            });
        }
        Ok(hits)
    }

    async fn hybrid_search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        expand_neighbors: bool,
    ) -> EngineResult<Vec<HybridSearchResult>> {
        let hits = self.vector_search(query_vector, top_k).await?;
        let mut results = Vec::with_capacity(hits.len());

        for hit in hits {
            let neighbors = if expand_neighbors {
                self.neighbors_of(hit.canonical_id).await?
            } else {
                Vec::new()
            };
            results.push(HybridSearchResult { hit, neighbors });
        }
        Ok(results)
    }

    async fn find_connections(&self, entity_names: &[String], max_hops: u32, limit: usize) -> EngineResult<Vec<GraphChunkHit>> {
        if entity_names.is_empty() {
            return Ok(Vec::new());
        }

        let cypher = format!(
            "UNWIND $names AS name
             MATCH (e:Entity)
             WHERE e.name CONTAINS name
             WITH collect(DISTINCT e) AS entities
             UNWIND entities AS e1
             UNWIND entities AS e2
             WITH e1, e2 WHERE id(e1) < id(e2)
             MATCH path = shortestPath((e1)-[*..{max_hops}]-(e2))
             UNWIND nodes(path) AS node
             MATCH (c:Chunk)-[:MENTIONS]->(node)
             RETURN DISTINCT c.id AS chunk_id, c.text AS text, c.document_id AS document_id, 1.0 AS score
             LIMIT $limit"
        );

        let mut cursor = self
            .graph
            .execute(
                query(&cypher)
                    .param("names", entity_names.to_vec())
                    .param("limit", limit as i64),
            )
            .await?;

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await? {
            hits.push(GraphChunkHit {
                chunk_id: row.get("chunk_id").unwrap_or_default(),
                document_id: row.get("document_id").ok(),
                text: row.get("text").unwrap_or_default(),
                score: row.get("score").unwrap_or(1.0),
            });
        }
        Ok(hits)
    }

    async fn find_mitigating_controls(&self, risk_name: &str, limit: usize) -> EngineResult<Vec<GraphChunkHit>> {
        if risk_name.is_empty() {
            return Ok(Vec::new());
        }

        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (r:Entity {type: 'Risk'})<-[:MITIGATES]-(c:Entity {type: 'Control'})
                     WHERE r.name CONTAINS $risk_name
                     MATCH (chunk:Chunk)-[:MENTIONS]->(c)
                     RETURN chunk.id AS chunk_id, chunk.text AS text, chunk.document_id AS document_id, 2.0 AS score
                     LIMIT $limit",
                )
                .param("risk_name", risk_name)
                .param("limit", limit as i64),
            )
            .await?;

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await? {
            hits.push(GraphChunkHit {
                chunk_id: row.get("chunk_id").unwrap_or_default(),
                document_id: row.get("document_id").ok(),
                text: row.get("text").unwrap_or_default(),
                score: row.get("score").unwrap_or(2.0),
            });
        }
        Ok(hits)
    }

    async fn get_attributes(&self, entity_name: &str, limit: usize) -> EngineResult<Vec<GraphChunkHit>> {
        if entity_name.is_empty() {
            return Ok(Vec::new());
        }

        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (e:Entity)
                     WHERE e.name CONTAINS $name
                     OPTIONAL MATCH (c:Chunk)-[:MENTIONS]->(e)
                     RETURN COALESCE(c.id, toString(e.canonical_id)) AS chunk_id,
                            COALESCE(c.text, e.name + ': ' + COALESCE(e.type, 'Entity')) AS text,
                            c.document_id AS document_id,
                            3.0 AS score
                     LIMIT $limit",
                )
                .param("name", entity_name)
                .param("limit", limit as i64),
            )
            .await?;

        let mut hits = Vec::new();
        while let Some(row) = cursor.next().await? {
            hits.push(GraphChunkHit {
                chunk_id: row.get("chunk_id").unwrap_or_default(),
                document_id: row.get("document_id").ok(),
                text: row.get("text").unwrap_or_default(),
                score: row.get("score").unwrap_or(3.0),
            });
        }
        Ok(hits)
    }
}

impl Neo4jGraphStore {
    async fn neighbors_of(&self, canonical_id: i64) -> EngineResult<Vec<GraphNeighbor>> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (n:Entity {canonical_id: $canonical_id})-[r]-(m:Entity)
                     RETURN type(r) AS relation_type, m.canonical_id AS canonical_id, m.name AS name, m.type AS node_type
                     LIMIT 10",
                )
                .param("canonical_id", canonical_id),
            )
            .await?;

        let mut neighbors = Vec::new();
        while let Some(row) = cursor.next().await? {
            neighbors.push(GraphNeighbor {
                relation_type: row.get("relation_type").unwrap_or_default(),
                canonical_id: row.get("canonical_id").unwrap_or_default(),
                canonical_name: row.get("name").unwrap_or_default(),
                node_type: row.get("node_type").unwrap_or_default(),
            });
        }
        Ok(neighbors)
    }
}
