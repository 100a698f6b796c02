//! Turns raw uploaded bytes into plain text prior to chunking, ahead of the
//! Orchestrator's "Parse -> Chunk" step. Special-cases PDF via `pdf-extract`
//! and falls through to UTF-8 text for everything else.

use crate::error::{EngineError, EngineResult};

pub trait DocumentParser: Send + Sync {
    fn parse(&self, bytes: &[u8], filename: &str) -> EngineResult<String>;
}

fn extension_of(filename: &str) -> String {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default()
}

pub struct DefaultParser;

impl DocumentParser for DefaultParser {
    fn parse(&self, bytes: &[u8], filename: &str) -> EngineResult<String> {
        match extension_of(filename).as_str() {
            "pdf" => pdf_extract::extract_text_from_mem(bytes)
                .map_err(|e| EngineError::Validation(format!("could not extract text from PDF '{filename}': {e}"))),
            _ => String::from_utf8(bytes.to_vec())
                .map_err(|e| EngineError::Validation(format!("file '{filename}' is not valid UTF-8 text: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_by_extension_fallthrough() {
        let parser = DefaultParser;
        let text = parser.parse(b"hello world", "notes.md").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn rejects_non_utf8_text_files() {
        let parser = DefaultParser;
        let err = parser.parse(&[0xFF, 0xFE, 0x00], "broken.txt").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        assert_eq!(extension_of("Report.PDF"), "pdf");
    }
}
