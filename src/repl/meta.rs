//! Metadata production: what the model is allowed to see about values.
//!
//! Raw execution output never enters a prompt. These pure functions reduce
//! values to structural descriptors (type, shape, size, short preview) and
//! result outcomes to one metadata string each.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::value;
use super::ExecuteOutcome;
use crate::config::Limits;

/// Structural descriptor of one REPL variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDescriptor {
    pub name: String,
    /// "string" | "number" | "boolean" | "null" | "array" | "object"
    /// | "truncated" | "error"
    pub kind: String,
    /// Array length, when an array.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    /// Schema of array elements ("object with keys [..]", "string", "mixed").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_schema: Option<String>,
    /// Key list, when an object (capped).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
    /// String length in characters, when a string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_length: Option<usize>,
    /// Size of the JSON form in characters.
    pub size_chars: usize,
    /// Short preview of the JSON form.
    pub preview: String,
}

const MAX_LISTED_KEYS: usize = 24;

fn kind_of(value: &Value) -> &'static str {
    if value::is_truncated(value) {
        return "truncated";
    }
    if value::is_rlm_error(value) {
        return "error";
    }
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn element_schema(items: &[Value]) -> String {
    let Some(first) = items.first() else {
        return "empty".to_string();
    };
    let first_kind = kind_of(first);
    if items.iter().any(|item| kind_of(item) != first_kind) {
        return "mixed".to_string();
    }
    if let Value::Object(map) = first {
        let keys: Vec<&str> = map.keys().take(MAX_LISTED_KEYS).map(String::as_str).collect();
        format!("object with keys [{}]", keys.join(", "))
    } else {
        first_kind.to_string()
    }
}

fn preview_of(value: &Value, max_chars: usize) -> String {
    let mut preview = match value {
        Value::String(text) => format!("{:?}", text),
        other => other.to_string(),
    };
    if preview.chars().count() > max_chars {
        preview = preview.chars().take(max_chars).collect::<String>() + "…";
    }
    preview
}

/// Describe one variable for the environment metadata block.
pub fn describe(name: &str, val: &Value, limits: &Limits) -> VarDescriptor {
    let serialized = val.to_string();
    let mut descriptor = VarDescriptor {
        name: name.to_string(),
        kind: kind_of(val).to_string(),
        length: None,
        element_schema: None,
        keys: None,
        string_length: None,
        size_chars: serialized.chars().count(),
        preview: preview_of(val, limits.var_preview_max_chars),
    };
    match val {
        Value::Array(items) => {
            descriptor.length = Some(items.len());
            descriptor.element_schema = Some(element_schema(items));
        }
        Value::Object(map) => {
            descriptor.keys = Some(
                map.keys()
                    .take(MAX_LISTED_KEYS)
                    .cloned()
                    .collect::<Vec<_>>(),
            );
        }
        Value::String(text) => {
            descriptor.string_length = Some(text.chars().count());
        }
        _ => {}
    }
    descriptor
}

/// Render descriptors as the human-readable lines of the prompt section.
pub fn render_descriptors(descriptors: &[VarDescriptor]) -> String {
    descriptors
        .iter()
        .map(|descriptor| {
            let shape = match descriptor.kind.as_str() {
                "array" => format!(
                    "array[{}] of {}",
                    descriptor.length.unwrap_or(0),
                    descriptor.element_schema.as_deref().unwrap_or("unknown")
                ),
                "object" => format!(
                    "object with keys [{}]",
                    descriptor
                        .keys
                        .as_deref()
                        .unwrap_or(&[])
                        .join(", ")
                ),
                "string" => format!("string ({} chars)", descriptor.string_length.unwrap_or(0)),
                other => other.to_string(),
            };
            format!(
                "- {}: {} ({} chars) preview: {}",
                descriptor.name, shape, descriptor.size_chars, descriptor.preview
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// JSON form of the descriptors, carried on the `env-update` event.
pub fn descriptors_json(descriptors: &[VarDescriptor]) -> String {
    serde_json::to_string(descriptors).unwrap_or_else(|_| "[]".to_string())
}

/// Build the result metadata string for one executed block.
pub fn result_metadata(outcome: &ExecuteOutcome, limits: &Limits) -> String {
    if let Some(error) = &outcome.error {
        return format!("Result: ERROR {error}");
    }
    let Some(result) = &outcome.result else {
        return "void".to_string();
    };
    if value::is_rlm_error(result) {
        let message = value::error_message(result).unwrap_or("unknown error");
        return format!("Result: ERROR {message}");
    }
    if value::is_truncated(result) {
        let original = result
            .get("originalLength")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        return format!(
            "Result: TRUNCATED value of {original} JSON chars (cap {}). Narrow the \
             selector or slice the data before returning it.",
            limits.exec_result_cap
        );
    }
    let descriptor = describe("result", result, limits);
    let mut preview = preview_of(result, limits.preview_max_chars);
    value::truncate_chars(&mut preview, limits.preview_max_chars + 1);
    match descriptor.kind.as_str() {
        "array" => format!(
            "Result: array[{}] of {} ({} chars) preview: {preview}",
            descriptor.length.unwrap_or(0),
            descriptor.element_schema.as_deref().unwrap_or("unknown"),
            descriptor.size_chars
        ),
        "object" => format!(
            "Result: object with keys [{}] ({} chars) preview: {preview}",
            descriptor.keys.as_deref().unwrap_or(&[]).join(", "),
            descriptor.size_chars
        ),
        "string" => format!(
            "Result: string ({} chars) preview: {preview}",
            descriptor.string_length.unwrap_or(0)
        ),
        "null" => "Result: null".to_string(),
        other => format!("Result: {other} {preview}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(result: Option<Value>, error: Option<&str>) -> ExecuteOutcome {
        ExecuteOutcome {
            result,
            error: error.map(str::to_string),
            final_called: false,
            final_value: None,
        }
    }

    #[test]
    fn void_result_is_void() {
        assert_eq!(result_metadata(&outcome(None, None), &Limits::default()), "void");
    }

    #[test]
    fn error_outcome_has_error_prefix() {
        let metadata = result_metadata(&outcome(None, Some("x is not defined")), &Limits::default());
        assert!(metadata.starts_with("Result: ERROR"));
        assert!(metadata.contains("x is not defined"));
    }

    #[test]
    fn error_sentinel_result_has_error_prefix() {
        let sentinel = value::rlm_error_sentinel("bad selector", "");
        let metadata = result_metadata(&outcome(Some(sentinel), None), &Limits::default());
        assert!(metadata.starts_with("Result: ERROR bad selector"));
    }

    #[test]
    fn truncated_result_advises_narrowing() {
        let capped = value::cap_result(Value::String("z".repeat(150_000)), 100_000);
        let metadata = result_metadata(&outcome(Some(capped), None), &Limits::default());
        assert!(metadata.contains("TRUNCATED"));
        assert!(metadata.contains("Narrow the selector"));
    }

    #[test]
    fn array_descriptor_reports_shape_not_content() {
        let value = json!([{"title": "a", "url": "u"}, {"title": "b", "url": "v"}]);
        let descriptor = describe("results", &value, &Limits::default());
        assert_eq!(descriptor.kind, "array");
        assert_eq!(descriptor.length, Some(2));
        assert_eq!(
            descriptor.element_schema.as_deref(),
            Some("object with keys [title, url]")
        );
    }

    #[test]
    fn preview_respects_cap() {
        let limits = Limits::default();
        let value = Value::String("a".repeat(5_000));
        let descriptor = describe("big", &value, &limits);
        assert!(descriptor.preview.chars().count() <= limits.var_preview_max_chars + 1);
        assert_eq!(descriptor.string_length, Some(5_000));
    }

    #[test]
    fn descriptors_render_one_line_each() {
        let limits = Limits::default();
        let descriptors = vec![
            describe("env.count", &json!(3), &limits),
            describe("rows", &json!(["a", "b"]), &limits),
        ];
        let text = render_descriptors(&descriptors);
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("env.count: number"));
        assert!(text.contains("rows: array[2] of string"));
    }
}
