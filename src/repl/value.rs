//! Result caps and the truncation/error sentinels.

use serde_json::{json, Value};

/// Marker key on oversize results.
pub const TRUNCATED_KEY: &str = "__truncated";
/// Marker key on captured execution failures.
pub const RLM_ERROR_KEY: &str = "__rlm_error";

const STACK_EXCERPT_CHARS: usize = 500;

/// Truncate a string in place to at most `max` characters.
pub fn truncate_chars(text: &mut String, max: usize) {
    if text.chars().count() > max {
        *text = text.chars().take(max).collect();
    }
}

/// Cap a value at `cap` characters of its JSON form.
///
/// Oversize values are replaced by the truncation sentinel carrying the
/// original length and a prefix of the serialized data.
pub fn cap_result(value: Value, cap: usize) -> Value {
    let serialized = value.to_string();
    let length = serialized.chars().count();
    if length <= cap {
        return value;
    }
    let data: String = serialized.chars().take(cap).collect();
    json!({
        TRUNCATED_KEY: true,
        "originalLength": length,
        "data": data,
    })
}

/// Captured execution failure, fed back to the model as metadata.
pub fn rlm_error_sentinel(message: &str, stack: &str) -> Value {
    let mut stack_excerpt = stack.to_string();
    truncate_chars(&mut stack_excerpt, STACK_EXCERPT_CHARS);
    json!({
        RLM_ERROR_KEY: true,
        "message": message,
        "stack": stack_excerpt,
    })
}

pub fn is_truncated(value: &Value) -> bool {
    value
        .get(TRUNCATED_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn is_rlm_error(value: &Value) -> bool {
    value
        .get(RLM_ERROR_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

pub fn error_message(value: &Value) -> Option<&str> {
    if is_rlm_error(value) {
        value.get("message").and_then(Value::as_str)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_pass_through() {
        let value = json!({"a": [1, 2, 3]});
        assert_eq!(cap_result(value.clone(), 100_000), value);
    }

    #[test]
    fn oversize_value_becomes_sentinel() {
        let value = Value::String("x".repeat(200_001));
        let capped = cap_result(value, 100_000);
        assert!(is_truncated(&capped));
        assert!(capped["originalLength"].as_u64().unwrap() > 100_000);
        assert_eq!(capped["data"].as_str().unwrap().chars().count(), 100_000);
    }

    #[test]
    fn error_sentinel_trims_stack() {
        let sentinel = rlm_error_sentinel("boom", &"frame\n".repeat(200));
        assert!(is_rlm_error(&sentinel));
        assert_eq!(error_message(&sentinel), Some("boom"));
        assert!(sentinel["stack"].as_str().unwrap().chars().count() <= 500);
    }
}
