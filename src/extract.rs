//! Extracts executable code blocks from model responses.
//!
//! Deterministic fallback chain: `repl`-tagged fences, then any fence, then a
//! JSON payload with a top-level `"code"` field, then a heuristic bare-code
//! scan. An empty result is valid and routes the iteration into the no-code
//! continuation path.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::repl::api::API_NAMES;

static FENCE_REPL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?ms)^[ \t]*```repl[ \t]*\r?\n(.*?)^[ \t]*```[ \t]*$").expect("repl fence regex")
});

static FENCE_ANY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?ms)^[ \t]*```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)^[ \t]*```[ \t]*$")
        .expect("generic fence regex")
});

static CODE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(const|let|var|await|return|if|for|while|try|catch|function|class)\b|^\s*env\.|^\s*log\(|^\s*setFinal\(|^\s*//",
    )
    .expect("code line regex")
});

/// Extract code blocks, first non-empty strategy wins.
pub fn extract_blocks(response: &str) -> Vec<String> {
    let fenced = fenced_blocks(&FENCE_REPL, response);
    if !fenced.is_empty() {
        return fenced;
    }
    let fenced = fenced_blocks(&FENCE_ANY, response);
    if !fenced.is_empty() {
        return fenced;
    }
    if let Some(code) = json_code_payload(response) {
        return vec![code];
    }
    bare_code_blocks(response)
}

/// Render blocks back into the canonical fenced form.
///
/// `extract_blocks(render_fenced(extract_blocks(text)))` is stable up to
/// whitespace, which keeps replayed transcripts well-formed.
pub fn render_fenced(blocks: &[String]) -> String {
    blocks
        .iter()
        .map(|block| format!("```repl\n{}\n```", block.trim_end()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn fenced_blocks(pattern: &Regex, response: &str) -> Vec<String> {
    pattern
        .captures_iter(response)
        .filter_map(|captures| captures.get(1))
        .map(|code| code.as_str().trim_end().to_string())
        .filter(|code| !code.trim().is_empty())
        .collect()
}

fn json_code_payload(response: &str) -> Option<String> {
    if let Some(code) = code_field(response.trim()) {
        return Some(code);
    }
    // Embedded object: attempt a prefix parse at each opening brace.
    for (index, byte) in response.bytes().enumerate() {
        if byte != b'{' {
            continue;
        }
        let mut parser = serde_json::Deserializer::from_str(&response[index..]).into_iter::<Value>();
        if let Some(Ok(value)) = parser.next() {
            if let Some(code) = value
                .get("code")
                .and_then(Value::as_str)
                .filter(|code| !code.trim().is_empty())
            {
                return Some(code.to_string());
            }
        }
    }
    None
}

fn code_field(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("code")
        .and_then(Value::as_str)
        .filter(|code| !code.trim().is_empty())
        .map(str::to_string)
}

fn looks_like_code(line: &str) -> bool {
    if CODE_LINE.is_match(line) {
        return true;
    }
    let trimmed = line.trim_start();
    API_NAMES.iter().any(|name| {
        trimmed
            .strip_prefix(name)
            .map(|rest| rest.starts_with('(') || rest.starts_with('.'))
            .unwrap_or(false)
    })
}

fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    for ch in line.chars() {
        match ch {
            '{' | '(' | '[' => delta += 1,
            '}' | ')' | ']' => delta -= 1,
            _ => {}
        }
    }
    delta
}

fn bare_code_blocks(response: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut depth: i32 = 0;
    let mut pending_blanks = 0usize;

    let mut flush = |current: &mut Vec<String>, depth: &mut i32| {
        if !current.is_empty() {
            blocks.push(current.join("\n"));
            current.clear();
        }
        *depth = 0;
    };

    for line in response.lines() {
        let trimmed = line.trim();

        // Inside an open brace/paren group, everything continues the block.
        if !current.is_empty() && depth > 0 {
            current.push(line.to_string());
            depth += brace_delta(line);
            continue;
        }

        if trimmed.is_empty() {
            if !current.is_empty() {
                pending_blanks += 1;
            }
            continue;
        }

        let continuation = !current.is_empty()
            && (trimmed.starts_with('}')
                || trimmed.starts_with(')')
                || trimmed.starts_with(']')
                || trimmed.starts_with('.'));

        if looks_like_code(trimmed) || continuation {
            for _ in 0..pending_blanks {
                current.push(String::new());
            }
            pending_blanks = 0;
            current.push(line.to_string());
            depth += brace_delta(line);
        } else {
            pending_blanks = 0;
            flush(&mut current, &mut depth);
        }
    }
    flush(&mut current, &mut depth);

    blocks
        .into_iter()
        .filter(|block| !block.trim().is_empty())
        .collect()
}
