//! Security-sensitive text handling: prompt-injection defenses and
//! boundary input sanitation, kept in one module tree so every call site
//! that touches untrusted text imports from here rather than reimplementing
//! ad hoc checks.

pub mod filename;
pub mod prompt;

pub use filename::{sanitize_filename, validate_streamed_size, validate_upload_size};
pub use prompt::{
    contains_dangerous_cypher, detect_injection_patterns, normalize_unicode, sanitize_for_prompt,
    sanitize_ontology_schema, sanitize_context_for_generation, validate_llm_json_output,
    ContextDocument, SanitizedOntologySchema,
};

/// Safe-identifier gate used before any string is spliced into Cypher as a
/// label or relation type.
pub mod identifier {
    use once_cell::sync::Lazy;
    use regex::Regex;

    use crate::error::{EngineError, EngineResult};

    pub const MAX_LABEL_LENGTH: usize = 64;

    static SAFE_IDENTIFIER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").expect("safe identifier regex"));

    static FORBIDDEN_SUBSTRINGS: &[&str] = &["`", "'", "\"", "[", "]", "(", ")", ";", "//", "\n", "\r"];

    /// Validates a label/relation-type before it is interpolated into a
    /// Cypher query string. Rejects anything not matching the safe
    /// identifier pattern, plus a belt-and-braces scan for characters that
    /// could terminate a Cypher token even if the regex were ever loosened.
    pub fn sanitize_label(label: &str) -> EngineResult<String> {
        if label.len() > MAX_LABEL_LENGTH {
            return Err(EngineError::InvalidLabel {
                label: label.to_string(),
                reason: format!("exceeds {MAX_LABEL_LENGTH} characters"),
            });
        }
        if !SAFE_IDENTIFIER.is_match(label) {
            return Err(EngineError::InvalidLabel {
                label: label.to_string(),
                reason: "does not match ^[A-Za-z][A-Za-z0-9_]{0,63}$".to_string(),
            });
        }
        for forbidden in FORBIDDEN_SUBSTRINGS {
            if label.contains(forbidden) {
                return Err(EngineError::InvalidLabel {
                    label: label.to_string(),
                    reason: format!("contains forbidden substring '{forbidden}'"),
                });
            }
        }
        Ok(label.to_string())
    }

}
