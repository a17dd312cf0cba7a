use axum::http::StatusCode;
use once_cell::sync::Lazy;
use regex::Regex;

/// Any run of 20+ alphanumerics is treated as a potential credential and
/// masked before a message reaches the log table or the ring buffer.
static SECRET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9_-]{20,}").unwrap());

pub fn redact(msg: &str) -> String {
    SECRET_RE.replace_all(msg, "[REDACTED]").into_owned()
}

/// Truncate provider error bodies to the logged snippet size.
pub fn snippet(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

pub fn internalize<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("engine error: {e}"))
}

pub fn not_found(what: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{what} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_long_tokens() {
        let msg = "auth failed for key sk_live_abcdef1234567890abcdef against provider";
        let out = redact(msg);
        assert!(!out.contains("sk_live_abcdef1234567890abcdef"));
        assert!(out.contains("[REDACTED]"));
        assert!(out.contains("auth failed for key"));
    }

    #[test]
    fn leaves_short_words_alone() {
        assert_eq!(redact("feed fetch failed: 404"), "feed fetch failed: 404");
    }

    #[test]
    fn snippet_respects_char_boundaries() {
        let s = "abcé".repeat(200);
        let cut = snippet(&s, 500);
        assert!(cut.len() <= 500);
        assert!(s.starts_with(&cut));
    }
}
