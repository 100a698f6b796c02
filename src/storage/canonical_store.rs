//! Relational "Canonical Store" tier: documents, domain configs, canonical
//! nodes, aliases, and the enrichment queue, built on `sqlx::PgPool` with
//! `pgvector`-typed `query_as` calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

use crate::error::{EngineError, EngineResult};
use crate::models::{
    validate_status_transition, CanonicalNode, Document, DocumentStatus, DomainConfig,
    EnrichmentQueueItem, EnrichmentStatus, NodeAlias, OntologySchema,
};

/// Repository trait over the relational tier, so the Orchestrator and
/// Resolver depend on an abstraction rather than a concrete `PgPool`.
#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn get_document_by_hash(&self, content_hash: &str) -> EngineResult<Option<Document>>;
    async fn get_document(&self, id: i64) -> EngineResult<Option<Document>>;
    async fn insert_document(
        &self,
        filename: &str,
        content_hash: &str,
        storage_location: &str,
        domain_config_id: i64,
    ) -> EngineResult<Document>;
    async fn update_document_status(
        &self,
        doc_id: i64,
        status: DocumentStatus,
        error_log: Option<&str>,
    ) -> EngineResult<Document>;
    /// Removes a document's relational row outright. Only valid once the
    /// document has already been driven to `DELETING` and its graph/storage
    /// artifacts are gone (see `ingestion::orchestrator::delete_document`).
    async fn delete_document_row(&self, doc_id: i64) -> EngineResult<()>;

    async fn get_domain_config(&self, id: i64) -> EngineResult<Option<DomainConfig>>;
    async fn create_domain_config(&self, name: &str, schema: &OntologySchema) -> EngineResult<DomainConfig>;

    async fn get_canonical_node(&self, id: i64) -> EngineResult<Option<CanonicalNode>>;
    async fn find_alias_case_insensitive(&self, alias: &str) -> EngineResult<Option<NodeAlias>>;
    async fn nearest_canonical_node(
        &self,
        embedding: &[f32],
    ) -> EngineResult<Option<(CanonicalNode, f32)>>;
    /// Atomic get-or-create: returns the node and whether it was newly
    /// created. Exactly one concurrent caller for a given `name` observes
    /// `created = true`.
    async fn get_or_create_canonical_node(
        &self,
        name: &str,
        node_type: &str,
        embedding: &[f32],
    ) -> EngineResult<(CanonicalNode, bool)>;
    async fn insert_alias(&self, alias: &str, canonical_node_id: i64, confidence: f32) -> EngineResult<NodeAlias>;

    async fn enqueue_enrichment(
        &self,
        raw_name: &str,
        proposed_type: &str,
        context_chunk: &str,
    ) -> EngineResult<EnrichmentQueueItem>;
    /// Leases up to `limit` PENDING items via a CAS to PROCESSING, so two
    /// workers never observe the same item in PROCESSING simultaneously.
    async fn lease_pending_enrichment_items(&self, limit: i64) -> EngineResult<Vec<EnrichmentQueueItem>>;
    async fn update_enrichment_status(&self, item_id: i64, status: EnrichmentStatus) -> EngineResult<()>;
}

pub struct PostgresCanonicalStore {
    pool: PgPool,
}

impl PostgresCanonicalStore {
    pub async fn connect(database_url: &str, statement_timeout_secs: u64) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(0)
            .acquire_timeout(std::time::Duration::from_secs(statement_timeout_secs))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct DocumentRow {
    id: i64,
    filename: String,
    content_hash: String,
    storage_location: String,
    status: String,
    error_log: Option<String>,
    domain_config_id: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn into_model(self) -> EngineResult<Document> {
        Ok(Document {
            id: self.id,
            filename: self.filename,
            content_hash: self.content_hash,
            storage_location: self.storage_location,
            status: status_from_str(&self.status)?,
            error_log: self.error_log,
            domain_config_id: self.domain_config_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct DomainConfigRow {
    id: i64,
    name: String,
    schema_json: serde_json::Value,
}

impl DomainConfigRow {
    fn into_model(self) -> EngineResult<DomainConfig> {
        Ok(DomainConfig {
            id: self.id,
            name: self.name,
            schema: serde_json::from_value(self.schema_json)?,
        })
    }
}

#[derive(FromRow)]
struct CanonicalNodeRow {
    id: i64,
    node_type: String,
    canonical_name: String,
    embedding: Vector,
}

impl CanonicalNodeRow {
    fn into_model(self) -> CanonicalNode {
        CanonicalNode {
            id: self.id,
            node_type: self.node_type,
            canonical_name: self.canonical_name,
            embedding: self.embedding.to_vec(),
        }
    }
}

#[derive(FromRow)]
struct NodeAliasRow {
    id: i64,
    alias: String,
    canonical_node_id: i64,
    confidence: f32,
}

impl From<NodeAliasRow> for NodeAlias {
    fn from(row: NodeAliasRow) -> Self {
        NodeAlias {
            id: row.id,
            alias: row.alias,
            canonical_node_id: row.canonical_node_id,
            confidence: row.confidence,
        }
    }
}

#[derive(FromRow)]
struct EnrichmentQueueItemRow {
    id: i64,
    raw_name: String,
    proposed_type: String,
    context_chunk: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EnrichmentQueueItemRow {
    fn into_model(self) -> EngineResult<EnrichmentQueueItem> {
        Ok(EnrichmentQueueItem {
            id: self.id,
            raw_name: self.raw_name,
            proposed_type: self.proposed_type,
            context_chunk: self.context_chunk.unwrap_or_default(),
            status: enrichment_status_from_str(&self.status)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn status_as_str(status: DocumentStatus) -> &'static str {
    match status {
        DocumentStatus::Pending => "PENDING",
        DocumentStatus::Processing => "PROCESSING",
        DocumentStatus::Completed => "COMPLETED",
        DocumentStatus::Failed => "FAILED",
        DocumentStatus::Updating => "UPDATING",
        DocumentStatus::Deleting => "DELETING",
    }
}

fn status_from_str(s: &str) -> EngineResult<DocumentStatus> {
    match s {
        "PENDING" => Ok(DocumentStatus::Pending),
        "PROCESSING" => Ok(DocumentStatus::Processing),
        "COMPLETED" => Ok(DocumentStatus::Completed),
        "FAILED" => Ok(DocumentStatus::Failed),
        "UPDATING" => Ok(DocumentStatus::Updating),
        "DELETING" => Ok(DocumentStatus::Deleting),
        other => Err(EngineError::Consistency(format!("unknown document status in store: {other}"))),
    }
}

fn enrichment_status_as_str(status: EnrichmentStatus) -> &'static str {
    match status {
        EnrichmentStatus::Pending => "PENDING",
        EnrichmentStatus::Processing => "PROCESSING",
        EnrichmentStatus::Completed => "COMPLETED",
        EnrichmentStatus::Failed => "FAILED",
    }
}

fn enrichment_status_from_str(s: &str) -> EngineResult<EnrichmentStatus> {
    match s {
        "PENDING" => Ok(EnrichmentStatus::Pending),
        "PROCESSING" => Ok(EnrichmentStatus::Processing),
        "COMPLETED" => Ok(EnrichmentStatus::Completed),
        "FAILED" => Ok(EnrichmentStatus::Failed),
        other => Err(EngineError::Consistency(format!("unknown enrichment status in store: {other}"))),
    }
}

const DOCUMENT_COLUMNS: &str =
    "id, filename, content_hash, storage_location, status, error_log, domain_config_id, created_at, updated_at";

#[async_trait]
impl CanonicalStore for PostgresCanonicalStore {
    async fn get_document_by_hash(&self, content_hash: &str) -> EngineResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE content_hash = $1"
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_model).transpose()
    }

    async fn get_document(&self, id: i64) -> EngineResult<Option<Document>> {
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_model).transpose()
    }

    async fn insert_document(
        &self,
        filename: &str,
        content_hash: &str,
        storage_location: &str,
        domain_config_id: i64,
    ) -> EngineResult<Document> {
        if self.get_document_by_hash(content_hash).await?.is_some() {
            return Err(EngineError::DuplicateHash(content_hash.to_string()));
        }

        let now = Utc::now();
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "INSERT INTO documents (filename, content_hash, storage_location, status, domain_config_id, created_at, updated_at)
             VALUES ($1, $2, $3, 'PENDING', $4, $5, $5)
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(filename)
        .bind(content_hash)
        .bind(storage_location)
        .bind(domain_config_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                EngineError::DuplicateHash(content_hash.to_string())
            }
            _ => EngineError::Database(e),
        })?;

        row.into_model()
    }

    async fn update_document_status(
        &self,
        doc_id: i64,
        status: DocumentStatus,
        error_log: Option<&str>,
    ) -> EngineResult<Document> {
        let doc = self
            .get_document(doc_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("document {doc_id}")))?;

        if doc.status != status && !validate_status_transition(doc.status, status) {
            return Err(EngineError::InvalidStatusTransition {
                from: status_as_str(doc.status).to_string(),
                to: status_as_str(status).to_string(),
            });
        }

        if status == DocumentStatus::Failed && error_log.map(str::is_empty).unwrap_or(true) {
            return Err(EngineError::Validation(
                "error_log is required when setting status to FAILED".to_string(),
            ));
        }

        let now = Utc::now();
        let row = sqlx::query_as::<_, DocumentRow>(&format!(
            "UPDATE documents SET status = $1, error_log = $2, updated_at = $3
             WHERE id = $4
             RETURNING {DOCUMENT_COLUMNS}"
        ))
        .bind(status_as_str(status))
        .bind(error_log)
        .bind(now)
        .bind(doc_id)
        .fetch_one(&self.pool)
        .await?;

        row.into_model()
    }

    async fn delete_document_row(&self, doc_id: i64) -> EngineResult<()> {
        sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_domain_config(&self, id: i64) -> EngineResult<Option<DomainConfig>> {
        let row = sqlx::query_as::<_, DomainConfigRow>(
            "SELECT id, name, schema_json FROM domain_configs WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DomainConfigRow::into_model).transpose()
    }

    async fn create_domain_config(&self, name: &str, schema: &OntologySchema) -> EngineResult<DomainConfig> {
        let schema_json = serde_json::to_value(schema)?;
        let row = sqlx::query_as::<_, DomainConfigRow>(
            "INSERT INTO domain_configs (name, schema_json) VALUES ($1, $2)
             RETURNING id, name, schema_json",
        )
        .bind(name)
        .bind(&schema_json)
        .fetch_one(&self.pool)
        .await?;

        row.into_model()
    }

    async fn get_canonical_node(&self, id: i64) -> EngineResult<Option<CanonicalNode>> {
        let row = sqlx::query_as::<_, CanonicalNodeRow>(
            "SELECT id, node_type, canonical_name, embedding FROM canonical_nodes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CanonicalNodeRow::into_model))
    }

    async fn find_alias_case_insensitive(&self, alias: &str) -> EngineResult<Option<NodeAlias>> {
        let row = sqlx::query_as::<_, NodeAliasRow>(
            "SELECT id, alias, canonical_node_id, confidence FROM node_aliases WHERE alias ILIKE $1 LIMIT 1",
        )
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(NodeAlias::from))
    }

    async fn nearest_canonical_node(&self, embedding: &[f32]) -> EngineResult<Option<(CanonicalNode, f32)>> {
        let vector = Vector::from(embedding.to_vec());

        #[derive(FromRow)]
        struct NearestRow {
            id: i64,
            node_type: String,
            canonical_name: String,
            embedding: Vector,
            distance: f64,
        }

        let row = sqlx::query_as::<_, NearestRow>(
            "SELECT id, node_type, canonical_name, embedding, (embedding <=> $1) as distance
             FROM canonical_nodes
             ORDER BY embedding <=> $1
             LIMIT 1",
        )
        .bind(&vector)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let similarity = 1.0 - r.distance as f32;
            (
                CanonicalNode {
                    id: r.id,
                    node_type: r.node_type,
                    canonical_name: r.canonical_name,
                    embedding: r.embedding.to_vec(),
                },
                similarity,
            )
        }))
    }

    async fn get_or_create_canonical_node(
        &self,
        name: &str,
        node_type: &str,
        embedding: &[f32],
    ) -> EngineResult<(CanonicalNode, bool)> {
        let vector = Vector::from(embedding.to_vec());

        if let Some(row) = sqlx::query_as::<_, CanonicalNodeRow>(
            "SELECT id, node_type, canonical_name, embedding FROM canonical_nodes WHERE canonical_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        {
            return Ok((row.into_model(), false));
        }

        let inserted = sqlx::query_as::<_, CanonicalNodeRow>(
            "INSERT INTO canonical_nodes (node_type, canonical_name, embedding)
             VALUES ($1, $2, $3)
             ON CONFLICT (canonical_name) DO NOTHING
             RETURNING id, node_type, canonical_name, embedding",
        )
        .bind(node_type)
        .bind(name)
        .bind(&vector)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into_model(), true));
        }

        // Lost the race: another caller inserted between our SELECT and
        // our INSERT. Re-read the row their transaction committed.
        let row = sqlx::query_as::<_, CanonicalNodeRow>(
            "SELECT id, node_type, canonical_name, embedding FROM canonical_nodes WHERE canonical_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| EngineError::Consistency(format!("failed to get or create canonical node '{name}'")))?;

        Ok((row.into_model(), false))
    }

    async fn insert_alias(&self, alias: &str, canonical_node_id: i64, confidence: f32) -> EngineResult<NodeAlias> {
        let row = sqlx::query_as::<_, NodeAliasRow>(
            "INSERT INTO node_aliases (alias, canonical_node_id, confidence)
             VALUES ($1, $2, $3)
             ON CONFLICT (alias) DO UPDATE SET alias = EXCLUDED.alias
             RETURNING id, alias, canonical_node_id, confidence",
        )
        .bind(alias)
        .bind(canonical_node_id)
        .bind(confidence)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn enqueue_enrichment(
        &self,
        raw_name: &str,
        proposed_type: &str,
        context_chunk: &str,
    ) -> EngineResult<EnrichmentQueueItem> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, EnrichmentQueueItemRow>(
            "INSERT INTO enrichment_queue (raw_name, proposed_type, context_chunk, status, created_at, updated_at)
             VALUES ($1, $2, $3, 'PENDING', $4, $4)
             RETURNING id, raw_name, proposed_type, context_chunk, status, created_at, updated_at",
        )
        .bind(raw_name)
        .bind(proposed_type)
        .bind(context_chunk)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        row.into_model()
    }

    async fn lease_pending_enrichment_items(&self, limit: i64) -> EngineResult<Vec<EnrichmentQueueItem>> {
        let now = Utc::now();
        let rows = sqlx::query_as::<_, EnrichmentQueueItemRow>(
            "UPDATE enrichment_queue
             SET status = 'PROCESSING', updated_at = $1
             WHERE id IN (
                 SELECT id FROM enrichment_queue
                 WHERE status = 'PENDING'
                 ORDER BY created_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, raw_name, proposed_type, context_chunk, status, created_at, updated_at",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EnrichmentQueueItemRow::into_model).collect()
    }

    async fn update_enrichment_status(&self, item_id: i64, status: EnrichmentStatus) -> EngineResult<()> {
        let now = Utc::now();
        sqlx::query("UPDATE enrichment_queue SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(enrichment_status_as_str(status))
            .bind(now)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
            DocumentStatus::Updating,
            DocumentStatus::Deleting,
        ] {
            assert_eq!(status_from_str(status_as_str(status)).unwrap(), status);
        }
    }

    #[test]
    fn enrichment_status_round_trips_through_strings() {
        for status in [
            EnrichmentStatus::Pending,
            EnrichmentStatus::Processing,
            EnrichmentStatus::Completed,
            EnrichmentStatus::Failed,
        ] {
            assert_eq!(enrichment_status_from_str(enrichment_status_as_str(status)).unwrap(), status);
        }
    }
}
