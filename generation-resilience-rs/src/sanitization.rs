//! # Fault Text Sanitization
//!
//! Removes credentials from fault text before it is stored in a
//! [`FaultInfo`](crate::types::FaultInfo) or written to a diagnostic record,
//! and bounds the length of echoed text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Maximum characters of raw fault text kept in `details.raw_error`
pub const RAW_ERROR_LIMIT: usize = 2_000;

/// Maximum characters of raw fault text echoed into a message
pub const MESSAGE_ECHO_LIMIT: usize = 200;

// (pattern, replacement) pairs; applied in order
static SENSITIVE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        // Key/value style credentials
        (
            Regex::new(r#"(?i)(api[_-]?key|apikey|token|secret|password|passwd|credential)s?(["']?\s*[=:]\s*["']?)[^"'\s,}]+"#).unwrap(),
            "${1}${2}[REDACTED]",
        ),
        // OAuth bearer tokens
        (Regex::new(r"(?i)bearer\s+[a-zA-Z0-9._\-]+").unwrap(), "Bearer [REDACTED]"),
        // JWTs
        (Regex::new(r"eyJ[a-zA-Z0-9\-_]+\.eyJ[a-zA-Z0-9\-_]+\.[a-zA-Z0-9\-_]+").unwrap(), "[REDACTED]"),
        // Google API keys
        (Regex::new(r"AIza[A-Za-z0-9_\-]{35}").unwrap(), "[REDACTED]"),
        // OpenAI style secret keys
        (Regex::new(r"sk-[A-Za-z0-9_\-]{20,}").unwrap(), "[REDACTED]"),
        // AWS access keys
        (Regex::new(r"AKIA[A-Z0-9]{16}").unwrap(), "[REDACTED]"),
        // GitHub tokens
        (Regex::new(r"gh[pousr]_[A-Za-z0-9_]{36,}").unwrap(), "[REDACTED]"),
    ]
});

// Object keys whose values are credentials whatever their shape
static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(api[_-]?key|apikey|token|access[_-]?token|secret|password|passwd|credential|authorization)s?$").unwrap()
});

/// Redacts credentials from a piece of fault text
pub fn sanitize_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    for (pattern, replacement) in SENSITIVE_PATTERNS.iter() {
        sanitized = pattern.replace_all(&sanitized, *replacement).into_owned();
    }

    sanitized
}

/// Truncates to at most `limit` characters, never splitting a code point
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Sanitizes and bounds text for storage in fault details
pub fn sanitize_raw(text: &str) -> String {
    truncate(&sanitize_message(text), RAW_ERROR_LIMIT)
}

/// Redacts credentials from parsed fault JSON.
///
/// Values under credential-named keys are replaced outright and every other
/// string leaf goes through [`sanitize_message`].
pub fn sanitize_json(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_message(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_json).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(_) | Value::Number(_) if SENSITIVE_KEY.is_match(&key) => {
                            Value::String("[REDACTED]".to_string())
                        }
                        other => sanitize_json(other),
                    };
                    (key, value)
                })
                .collect(),
        ),
        other => other,
    }
}
