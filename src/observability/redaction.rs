//! Redaction of sensitive values before they reach log output
//!
//! Only log fields are screened. Payloads delivered to handlers and callers
//! are never modified.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Keys whose values are masked in logged payloads
const SENSITIVE_KEYS: &[&str] = &["password"];

const MASK: &str = "*******";

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)\b(password|secret|token)\s*([=:])\s*\S+").ok());

/// `scheme://user:password@` credentials embedded in URLs
static URL_CREDENTIALS: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"([a-zA-Z][a-zA-Z0-9+.-]*://[^:/@\s]+):[^@\s]+@").ok());

fn is_sensitive(key: &str) -> bool {
    SENSITIVE_KEYS
        .iter()
        .any(|sensitive| key.eq_ignore_ascii_case(sensitive))
}

fn mask(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(format!("{MASK}({})", s.chars().count())),
        _ => Value::String(MASK.to_string()),
    }
}

/// Copy of `payload` with every password value masked
///
/// String values become `*******(<length>)`; any other value becomes
/// `*******`. Objects and arrays are walked recursively.
pub fn screen_payload(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let screened = if is_sensitive(key) {
                        mask(value)
                    } else {
                        screen_payload(value)
                    };
                    (key.clone(), screened)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(screen_payload).collect()),
        other => other.clone(),
    }
}

/// Mask secrets in free text
///
/// Covers `password=...`, `secret: ...` and `token=...` fragments and the
/// password part of URL credentials.
pub fn screen_text(text: &str) -> String {
    let screened = match SECRET_PATTERN.as_ref() {
        Some(pattern) => pattern.replace_all(text, "${1}${2}***").into_owned(),
        None => text.to_string(),
    };
    match URL_CREDENTIALS.as_ref() {
        Some(pattern) => pattern.replace_all(&screened, "${1}:***@").into_owned(),
        None => screened,
    }
}
