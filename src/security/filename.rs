//! Filename sanitization and upload-size validation for the Submit/Update
//! boundary.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{EngineError, EngineResult};

static PROTOCOL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[a-zA-Z][a-zA-Z0-9+.\-]*://").expect("protocol regex"));

static DANGEROUS_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\-. ]").expect("dangerous char regex"));

static REPEATED_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[_.]{2,}").expect("repeated separator regex"));

fn url_decode_once(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn basename(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

/// Sanitizes a submitted filename: strips null bytes, double URL-decodes,
/// rejects protocol prefixes, extracts the basename, replaces unsafe
/// characters with underscores, collapses repeated separators, and caps
/// length to 255 while preserving the extension. Idempotent: applying it
/// to its own output returns the same string.
pub fn sanitize_filename(filename: &str) -> EngineResult<String> {
    if filename.is_empty() {
        return Err(EngineError::Validation("filename is required".to_string()));
    }

    let sanitized = filename.replace('\0', "");
    let sanitized = url_decode_once(&url_decode_once(&sanitized));

    if PROTOCOL_PREFIX.is_match(&sanitized) {
        return Err(EngineError::Validation(
            "protocol prefixes are not allowed in filename".to_string(),
        ));
    }

    let sanitized = basename(&sanitized);
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return Err(EngineError::Validation(
            "filename is invalid after sanitization".to_string(),
        ));
    }

    let sanitized = DANGEROUS_CHARS.replace_all(&sanitized, "_").into_owned();
    let sanitized = REPEATED_SEPARATORS.replace_all(&sanitized, "_").into_owned();

    let sanitized = if sanitized.len() > 255 {
        match sanitized.rsplit_once('.') {
            Some((name, ext)) if !ext.is_empty() => {
                let max_name_len = 255usize.saturating_sub(ext.len() + 1);
                format!("{}.{}", &name[..name.len().min(max_name_len)], ext)
            }
            _ => sanitized[..255].to_string(),
        }
    } else {
        sanitized
    };

    Ok(sanitized)
}

/// Enforces the upload size cap. The caller checks a declared
/// Content-Length first (fast rejection); this function re-checks the
/// actual streamed length so a forged header cannot bypass the limit.
pub fn validate_upload_size(declared_len: Option<u64>, max_upload_bytes: u64) -> EngineResult<()> {
    if let Some(declared) = declared_len {
        if declared > max_upload_bytes {
            return Err(EngineError::Validation(format!(
                "file too large: declared {declared} bytes exceeds {max_upload_bytes} byte cap"
            )));
        }
    }
    Ok(())
}

pub fn validate_streamed_size(total_size_so_far: u64, max_upload_bytes: u64) -> EngineResult<()> {
    if total_size_so_far > max_upload_bytes {
        return Err(EngineError::Validation(format!(
            "file too large: exceeds {max_upload_bytes} byte cap"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_path_traversal_and_null_bytes() {
        let result = sanitize_filename("../../../etc/passwd\0.pdf").unwrap();
        assert!(!result.contains('/'));
        assert!(!result.contains('\\'));
        assert!(!result.contains(".."));
        assert!(!result.contains('\0'));
    }

    #[test]
    fn rejects_protocol_prefixes() {
        assert!(sanitize_filename("s3://bucket/key.pdf").is_err());
        assert!(sanitize_filename("file:///etc/passwd").is_err());
    }

    #[test]
    fn is_idempotent() {
        let once = sanitize_filename("Report (final) v2!!.pdf").unwrap();
        let twice = sanitize_filename(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_empty_and_dot_paths() {
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename(".").is_err());
        assert!(sanitize_filename("..").is_err());
    }

    #[test]
    fn double_url_decodes_encoded_traversal() {
        let result = sanitize_filename("%252e%252e%252fpasswd").unwrap();
        assert!(!result.contains(".."));
    }

    #[test]
    fn caps_length_preserving_extension() {
        let long_name = format!("{}.pdf", "a".repeat(400));
        let result = sanitize_filename(&long_name).unwrap();
        assert!(result.len() <= 255);
        assert!(result.ends_with(".pdf"));
    }

    #[test]
    fn rejects_declared_oversize() {
        assert!(validate_upload_size(Some(51 * 1024 * 1024), 50 * 1024 * 1024).is_err());
    }

    #[test]
    fn accepts_declared_within_cap() {
        assert!(validate_upload_size(Some(10), 50 * 1024 * 1024).is_ok());
        assert!(validate_upload_size(None, 50 * 1024 * 1024).is_ok());
    }
}
