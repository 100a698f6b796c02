//! Configuration loading (environment + `.env`), covering every key the
//! ingestion pipeline, graph and relational stores, and the hybrid
//! retriever need at process start.

use std::env;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAi,
    OpenRouter,
    Anthropic,
}

impl LlmProvider {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "openrouter" => Ok(Self::OpenRouter),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(anyhow!("unsupported llm_provider: {other}")),
        }
    }
}

/// Complete application configuration, loaded once at process start and
/// handed to the Orchestrator/Retriever by dependency injection rather than
/// fetched from a global singleton.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    // Relational store (Canonical Store)
    pub database_url: String,
    // Graph store
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    // Object storage (host-owned in practice; kept for completeness)
    pub storage_endpoint: Option<String>,

    // LLM
    pub llm_provider: LlmProvider,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub embedding_batch_size: usize,
    pub extraction_model: String,
    pub generator_model: String,
    pub extraction_temperature: f32,
    pub generator_temperature: f32,

    // Ingestion
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Resolution & retrieval
    pub resolution_threshold: f32,
    pub rrf_k: u32,

    // Upload limits
    pub max_upload_bytes: u64,

    // Timeouts (seconds)
    pub llm_timeout_secs: u64,
    pub db_statement_timeout_secs: u64,
    pub orchestrator_soft_budget_secs: u64,
    pub orchestrator_hard_budget_secs: u64,
}

fn read_secret_file(env_var_name: &str) -> Option<String> {
    let file_env_var = format!("{env_var_name}_FILE");
    let secret_path = env::var(&file_env_var).ok()?;
    let path = Path::new(&secret_path);
    if path.is_file() {
        std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
    } else {
        None
    }
}

/// Reads `name`, preferring a Docker-secret file referenced by `{name}_FILE`
/// over the plain environment variable, falling back to `default` if given.
fn env_or_secret(name: &str, default: Option<&str>) -> Result<String> {
    if let Some(secret) = read_secret_file(name) {
        return Ok(secret);
    }
    match env::var(name) {
        Ok(v) => Ok(v),
        Err(_) => default
            .map(|d| d.to_string())
            .ok_or_else(|| anyhow!("missing required environment variable: {name}")),
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|e| anyhow!("invalid value for {name}: {e}")),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env_or_secret("DATABASE_URL", None).context("loading relational store config")?;
        let neo4j_uri = env_or_secret("NEO4J_URI", Some("bolt://localhost:7687"))?;
        let neo4j_user = env_or_secret("NEO4J_USER", Some("neo4j"))?;
        let neo4j_password = env_or_secret("NEO4J_PASSWORD", Some(""))?;
        let storage_endpoint = env::var("STORAGE_ENDPOINT").ok();

        let llm_provider_str = env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = LlmProvider::from_str(&llm_provider_str)?;

        let chunk_size = env_parsed("CHUNK_SIZE", 512usize)?;
        let chunk_overlap = env_parsed("CHUNK_OVERLAP", 50usize)?;
        if chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "CHUNK_OVERLAP ({chunk_overlap}) must be smaller than CHUNK_SIZE ({chunk_size})"
            ));
        }

        Ok(Self {
            database_url,
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            storage_endpoint,
            llm_provider,
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            embedding_dimensions: env_parsed("EMBEDDING_DIMENSIONS", 1536usize)?,
            embedding_batch_size: env_parsed("EMBEDDING_BATCH_SIZE", 128usize)?,
            extraction_model: env::var("EXTRACTION_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            generator_model: env::var("GENERATOR_MODEL")
                .unwrap_or_else(|_| "gpt-4-turbo".to_string()),
            extraction_temperature: env_parsed("EXTRACTION_TEMPERATURE", 0.0f32)?,
            generator_temperature: env_parsed("GENERATOR_TEMPERATURE", 0.2f32)?,
            chunk_size,
            chunk_overlap,
            resolution_threshold: env_parsed("RESOLUTION_THRESHOLD", 0.95f32)?,
            rrf_k: env_parsed("RRF_K", 60u32)?,
            max_upload_bytes: env_parsed("MAX_UPLOAD_BYTES", 50 * 1024 * 1024u64)?,
            llm_timeout_secs: env_parsed("LLM_TIMEOUT_SECS", 60u64)?,
            db_statement_timeout_secs: env_parsed("DB_STATEMENT_TIMEOUT_SECS", 30u64)?,
            orchestrator_soft_budget_secs: env_parsed("ORCHESTRATOR_SOFT_BUDGET_SECS", 9 * 60u64)?,
            orchestrator_hard_budget_secs: env_parsed("ORCHESTRATOR_HARD_BUDGET_SECS", 10 * 60u64)?,
        })
    }
}
