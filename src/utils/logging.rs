//! Helpers for keeping log lines short and free of secrets.

use serde_json::{Map, Value};

/// Default preview length in characters.
pub const DEFAULT_PREVIEW_CHARS: usize = 240;

/// Keys always redacted regardless of substring matching.
const REDACT_KEYS: &[&str] = &["authorization", "api_key", "apikey"];

/// Preview limit from `AI_LOG_PREVIEW`, falling back to the default.
pub fn preview_limit() -> usize {
    std::env::var("AI_LOG_PREVIEW")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PREVIEW_CHARS)
}

/// Shorten `value` for logging.
///
/// Text longer than `limit` characters (or the configured preview limit)
/// is cut at a char boundary and suffixed with the number of dropped chars.
pub fn preview(value: &str, limit: Option<usize>) -> String {
    let limit = limit.unwrap_or_else(preview_limit);
    let total = value.chars().count();
    if total <= limit {
        return value.to_string();
    }
    let kept: String = value.chars().take(limit).collect();
    format!("{}… (+{} chars)", kept, total - limit)
}

/// Copy of `map` with secret-looking values replaced by `<redacted>`.
pub fn redact(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| {
            if is_secret_key(k) {
                (k.clone(), Value::String("<redacted>".to_string()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

fn is_secret_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    REDACT_KEYS.contains(&lower.as_str())
        || lower.contains("token")
        || lower.contains("secret")
        || lower.contains("key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_preview_short_unchanged() {
        assert_eq!(preview("hello", Some(10)), "hello");
    }

    #[test]
    fn test_preview_truncates_with_count() {
        assert_eq!(preview("abcdefghij", Some(4)), "abcd… (+6 chars)");
    }

    #[test]
    fn test_preview_multibyte_boundary() {
        let text = "ééééé";
        assert_eq!(preview(text, Some(2)), "éé… (+3 chars)");
    }

    #[test]
    fn test_redact() {
        let value = json!({
            "topic": "Graphs",
            "Authorization": "Bearer abc",
            "deploy_key": "k",
            "user_token": "t",
            "client_secret": "s",
        });
        let redacted = redact(value.as_object().unwrap());
        assert_eq!(redacted["topic"], "Graphs");
        assert_eq!(redacted["Authorization"], "<redacted>");
        assert_eq!(redacted["deploy_key"], "<redacted>");
        assert_eq!(redacted["user_token"], "<redacted>");
        assert_eq!(redacted["client_secret"], "<redacted>");
    }
}
