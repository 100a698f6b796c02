//! Process entry point: loads configuration, connects both storage tiers,
//! wires the ingestion and retrieval stacks behind `Engine`, spawns the
//! background Enrichment Worker, and waits for a shutdown signal. This
//! binary does not serve HTTP itself; it composes the engine the way an
//! enclosing host would, for local development and smoke testing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use jenezis_engine::config::EngineConfig;
use jenezis_engine::engine::Engine;
use jenezis_engine::ingestion::{
    Chunker, DefaultParser, Embedder, EnrichmentWorker, Extractor, Orchestrator, Resolver,
    RigEmbeddingProvider, RigExtractionProvider, TiktokenEncoder,
};
use jenezis_engine::ingestion::enrichment::RigCanonicalNamingProvider;
use jenezis_engine::rag::{Generator, RigAnswerProvider, RigQueryPlanProvider, Retriever};
use jenezis_engine::storage::{FilesystemObjectStore, Neo4jGraphStore, PostgresCanonicalStore};

const ENRICHMENT_POLL_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = EngineConfig::from_env().context("loading configuration")?;

    let canonical_store = Arc::new(
        PostgresCanonicalStore::connect(&cfg.database_url, cfg.db_statement_timeout_secs)
            .await
            .context("connecting to the canonical store")?,
    );
    let graph_store = Arc::new(
        Neo4jGraphStore::connect(&cfg.neo4j_uri, &cfg.neo4j_user, &cfg.neo4j_password)
            .await
            .context("connecting to the graph store")?,
    );
    graph_store
        .initialize_schema(cfg.embedding_dimensions)
        .await
        .context("initializing graph schema")?;

    let object_store = Arc::new(FilesystemObjectStore::new(
        cfg.storage_endpoint.clone().unwrap_or_else(|| "./storage".to_string()),
    ));

    let embedding_provider: Arc<dyn jenezis_engine::ingestion::EmbeddingProvider> =
        Arc::new(RigEmbeddingProvider::from_config(&cfg));
    let new_embedder = || Embedder::new(embedding_provider.clone(), cfg.embedding_batch_size);

    let extraction_provider: Arc<dyn jenezis_engine::ingestion::ExtractionProvider> =
        Arc::new(RigExtractionProvider::from_config(&cfg));
    let extractor = Extractor::new(extraction_provider);

    let chunker = Chunker::new(
        cfg.chunk_size,
        cfg.chunk_overlap,
        Box::new(TiktokenEncoder::for_model(&cfg.embedding_model)?),
    )
    .context("building chunker")?;

    let resolver = Resolver::new(canonical_store.clone(), new_embedder(), cfg.resolution_threshold);

    let orchestrator = Arc::new(Orchestrator::new(
        canonical_store.clone(),
        graph_store.clone(),
        object_store.clone(),
        Arc::new(DefaultParser),
        chunker,
        new_embedder(),
        extractor,
        resolver,
        &cfg,
    ));

    let planner: Arc<dyn jenezis_engine::rag::QueryPlanProvider> = Arc::new(RigQueryPlanProvider::from_config(&cfg));
    let retriever = Retriever::new(graph_store.clone(), new_embedder(), planner, cfg.rrf_k);
    let generator = Generator::new(Box::new(RigAnswerProvider::from_config(&cfg)));

    // No host (HTTP server, CLI, message consumer, ...) is wired in here;
    // building `Engine` proves the composition and keeps its background
    // orchestrator/enrichment tasks alive for the lifetime of the process.
    let _engine = Engine::new(cfg.clone(), canonical_store.clone(), object_store, orchestrator, retriever, generator);

    let naming_provider: Arc<dyn jenezis_engine::ingestion::enrichment::CanonicalNamingProvider> =
        Arc::new(RigCanonicalNamingProvider::from_config(&cfg));
    let enrichment_worker = EnrichmentWorker::new(
        canonical_store,
        naming_provider,
        new_embedder(),
        Duration::from_secs(ENRICHMENT_POLL_INTERVAL_SECS),
    );
    tokio::spawn(async move {
        enrichment_worker.run_forever().await;
    });

    tracing::info!("engine ready");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");

    Ok(())
}
