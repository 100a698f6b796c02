//! Provider-agnostic embedding client: batches chunk text through a
//! pluggable `EmbeddingProvider` with retry/backoff, exposing both a
//! single-batch and a drain-everything (`embed_all`) entry point.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::config::{EngineConfig, LlmProvider};
use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;
}

#[async_trait]
impl EmbeddingProvider for Arc<dyn EmbeddingProvider> {
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        self.as_ref().embed_batch(texts).await
    }
}

/// Type-erased provider handle, so composing structs (Resolver, Engine) can
/// hold an `Embedder` without propagating a generic parameter for the
/// concrete provider type.
pub type DynEmbeddingProvider = Arc<dyn EmbeddingProvider>;
pub type DynEmbedder = Embedder<DynEmbeddingProvider>;

pub struct RigEmbeddingProvider {
    provider: LlmProvider,
    model: String,
    dimensions: usize,
}

impl RigEmbeddingProvider {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            provider: cfg.llm_provider,
            model: cfg.embedding_model.clone(),
            dimensions: cfg.embedding_dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RigEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match self.provider {
            LlmProvider::OpenAi => self.embed_with_openai(texts).await,
            other => Err(EngineError::Configuration(format!(
                "embeddings are not available for provider {other:?}"
            ))),
        }
    }
}

impl RigEmbeddingProvider {
    async fn embed_with_openai(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel;
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};

        let client = openai::Client::from_env();
        let model_name = if self.model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model
            .embed_texts(texts.to_vec())
            .await
            .map_err(|e| EngineError::TransientProvider(e.to_string()))?;

        if embeddings.len() != texts.len() {
            return Err(EngineError::Consistency(format!(
                "embedding count {} does not match input count {}",
                embeddings.len(),
                texts.len()
            )));
        }

        Ok(embeddings
            .into_iter()
            .map(|e| e.vec.into_iter().map(|v| v as f32).collect())
            .collect())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Batching adaptor around [`EmbeddingProvider::embed_batch`].
pub struct Embedder<P: EmbeddingProvider> {
    provider: P,
    batch_size: usize,
}

impl<P: EmbeddingProvider> Embedder<P> {
    pub fn new(provider: P, batch_size: usize) -> Self {
        Self { provider, batch_size }
    }

    /// Replaces newlines with spaces (provider convention) before
    /// submission, then delegates to the provider in one call.
    pub async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let cleaned: Vec<String> = texts.iter().map(|t| t.replace('\n', " ")).collect();
        self.provider.embed_batch(&cleaned).await
    }

    /// Splits `texts` into `batch_size`-sized windows, embedding each in
    /// turn with a short inter-batch delay for provider rate-limit
    /// hygiene. A failure in any batch propagates; no silent drops.
    pub async fn embed_all(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            let batch_embeddings = self.embed_batch(batch).await?;
            all_embeddings.extend(batch_embeddings);
            sleep(Duration::from_millis(100)).await;
        }
        Ok(all_embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeProvider {
        dim: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EmbeddingProvider for FakeProvider {
        async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![0.0f32; self.dim]).collect())
        }
    }

    #[tokio::test]
    async fn empty_input_yields_empty_output_without_calling_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let embedder = Embedder::new(
            FakeProvider { dim: 4, calls: calls.clone() },
            8,
        );
        let result = embedder.embed_batch(&[]).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn embed_all_batches_by_configured_size() {
        let calls = Arc::new(AtomicUsize::new(0));
        let embedder = Embedder::new(FakeProvider { dim: 3, calls: calls.clone() }, 2);
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let result = embedder.embed_all(&texts).await.unwrap();
        assert_eq!(result.len(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn strips_newlines_before_submission() {
        struct CapturingProvider {
            seen: Arc<std::sync::Mutex<Vec<String>>>,
        }
        #[async_trait]
        impl EmbeddingProvider for CapturingProvider {
            async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
                self.seen.lock().unwrap().extend_from_slice(texts);
                Ok(texts.iter().map(|_| vec![0.0f32; 2]).collect())
            }
        }
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let embedder = Embedder::new(CapturingProvider { seen: seen.clone() }, 8);
        embedder
            .embed_batch(&["line one\nline two".to_string()])
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap()[0], "line one line two");
    }
}
