//! Token-count-based sliding-window chunker, built on `tiktoken-rs` and
//! wrapped behind a small trait so the tokenizer can be swapped without
//! touching callers.

use tiktoken_rs::CoreBPE;

use crate::error::{EngineError, EngineResult};
use crate::models::{new_chunk_id, Chunk};

/// Encoder abstraction the Chunker depends on, so tests and alternate
/// tokenizers don't need a live `tiktoken` model download.
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
}

pub struct TiktokenEncoder {
    bpe: CoreBPE,
}

impl TiktokenEncoder {
    /// Resolves a model name to its tiktoken encoding, falling back to
    /// `cl100k_base` for unknown models.
    pub fn for_model(model_name: &str) -> EngineResult<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model_name).or_else(|_| {
            tracing::warn!(model_name, "no tiktoken encoder found, using cl100k_base");
            tiktoken_rs::cl100k_base()
        });
        let bpe = bpe.map_err(|e| EngineError::Configuration(format!("loading tokenizer: {e}")))?;
        Ok(Self { bpe })
    }
}

impl TokenEncoder for TiktokenEncoder {
    fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe.encode_with_special_tokens(text)
    }

    fn decode(&self, tokens: &[u32]) -> String {
        self.bpe.decode(tokens.to_vec()).unwrap_or_default()
    }
}

pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    encoder: Box<dyn TokenEncoder>,
}

impl Chunker {
    pub fn new(
        chunk_size: usize,
        chunk_overlap: usize,
        encoder: Box<dyn TokenEncoder>,
    ) -> EngineResult<Self> {
        if chunk_overlap >= chunk_size {
            return Err(EngineError::Configuration(
                "chunk_overlap must be smaller than chunk_size".to_string(),
            ));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            encoder,
        })
    }

    /// Splits `document_text` into an ordered, materialized sequence of
    /// chunks. Empty input yields the empty sequence.
    pub fn chunk(&self, document_id: i64, document_text: &str) -> Vec<Chunk> {
        if document_text.is_empty() {
            return Vec::new();
        }

        let tokens = self.encoder.encode(document_text);
        let mut chunks = Vec::new();
        let mut start_index = 0usize;
        let mut sequence_num = 0i64;
        let stride = self.chunk_size - self.chunk_overlap;

        while start_index < tokens.len() {
            let end_index = (start_index + self.chunk_size).min(tokens.len());
            let chunk_tokens = &tokens[start_index..end_index];
            if chunk_tokens.is_empty() {
                break;
            }

            let text = self.encoder.decode(chunk_tokens);
            chunks.push(Chunk {
                id: new_chunk_id(),
                document_id,
                sequence_num,
                text,
                token_count: chunk_tokens.len() as i64,
                embedding: Vec::new(),
            });

            sequence_num += 1;
            start_index += stride;
        }

        tracing::info!(count = chunks.len(), document_id, "split document into chunks");
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WhitespaceEncoder;

    impl TokenEncoder for WhitespaceEncoder {
        fn encode(&self, text: &str) -> Vec<u32> {
            (0..text.split_whitespace().count() as u32).collect()
        }

        fn decode(&self, tokens: &[u32]) -> String {
            tokens.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(" ")
        }
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        let err = Chunker::new(10, 10, Box::new(WhitespaceEncoder)).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn empty_text_yields_empty_sequence() {
        let chunker = Chunker::new(512, 50, Box::new(WhitespaceEncoder)).unwrap();
        assert!(chunker.chunk(1, "").is_empty());
    }

    #[test]
    fn chunk_ids_are_unique_across_calls() {
        let chunker = Chunker::new(4, 1, Box::new(WhitespaceEncoder)).unwrap();
        let a = chunker.chunk(1, "one two three four five six seven eight");
        let b = chunker.chunk(1, "one two three four five six seven eight");
        assert!(a.iter().all(|c| !b.iter().any(|d| d.id == c.id)));
    }

    #[test]
    fn sequence_numbers_are_ordered() {
        let chunker = Chunker::new(4, 1, Box::new(WhitespaceEncoder)).unwrap();
        let chunks = chunker.chunk(7, "one two three four five six seven eight nine ten");
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_num, i as i64);
            assert_eq!(c.document_id, 7);
        }
    }
}
