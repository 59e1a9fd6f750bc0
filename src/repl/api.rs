//! The capability surface: exposed names plus the canned renderer-side
//! snippets backing the rich DOM operations.
//!
//! Everything above `exec` level (`getText`, `getLinks`, click/type/scroll,
//! the search and wiki helpers) is composed here as JavaScript sent through
//! the driver's `exec`, so the consumed driver contract stays minimal.

/// Every identifier the sandbox exposes. Used for global filtering in the
/// environment metadata and by the bare-code extraction heuristic.
pub const API_NAMES: &[&str] = &[
    "tabs",
    "activeTab",
    "openTab",
    "closeTab",
    "navigate",
    "switchTab",
    "waitForLoad",
    "waitForSelector",
    "execInTab",
    "getText",
    "getDOM",
    "getLinks",
    "getInputs",
    "querySelector",
    "querySelectorAll",
    "getSearchResults",
    "getWikiTables",
    "click",
    "type",
    "scroll",
    "parseHTML",
    "parsePage",
    "domQueryAll",
    "domQueryOne",
    "domText",
    "freeDoc",
    "llm_query",
    "llm_batch",
    "env",
    "setFinal",
    "log",
    "sleep",
    "__data",
];

/// Engine-level globals excluded from the user-variable enumeration.
pub const GLOBAL_ALLOWLIST: &[&str] = &[
    "globalThis",
    "Infinity",
    "NaN",
    "undefined",
    "Object",
    "Function",
    "Array",
    "String",
    "Number",
    "Boolean",
    "Symbol",
    "Math",
    "JSON",
    "Date",
    "RegExp",
    "Error",
    "AggregateError",
    "TypeError",
    "RangeError",
    "SyntaxError",
    "EvalError",
    "ReferenceError",
    "URIError",
    "Promise",
    "Proxy",
    "Reflect",
    "Map",
    "Set",
    "WeakMap",
    "WeakSet",
    "WeakRef",
    "FinalizationRegistry",
    "ArrayBuffer",
    "SharedArrayBuffer",
    "DataView",
    "Atomics",
    "Int8Array",
    "Uint8Array",
    "Uint8ClampedArray",
    "Int16Array",
    "Uint16Array",
    "Int32Array",
    "Uint32Array",
    "Float16Array",
    "Float32Array",
    "Float64Array",
    "BigInt",
    "BigInt64Array",
    "BigUint64Array",
    "Intl",
    "eval",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "decodeURI",
    "decodeURIComponent",
    "encodeURI",
    "encodeURIComponent",
    "escape",
    "unescape",
];

/// JS literal for an optional CSS selector (JSON escaping doubles as JS).
fn js_str(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// Shared element serializer prelude for renderer snippets.
const SERIALIZE_ELEMENT: &str = "const ser = (el) => ({ tag: el.tagName.toLowerCase(), id: el.id || \"\", className: (typeof el.className === \"string\" ? el.className : \"\"), text: (el.innerText || el.textContent || \"\").slice(0, 500), attrs: Object.fromEntries(Array.from(el.attributes || []).map((a) => [a.name, a.value])) });";

pub(crate) fn snippet_get_text(selector: Option<&str>) -> String {
    match selector {
        Some(selector) => format!(
            "(() => {{ const el = document.querySelector({sel}); return el ? (el.innerText || el.textContent || \"\") : null; }})()",
            sel = js_str(selector)
        ),
        None => "(() => (document.body ? (document.body.innerText || \"\") : \"\"))()".to_string(),
    }
}

pub(crate) fn snippet_get_dom(selector: Option<&str>) -> String {
    match selector {
        Some(selector) => format!(
            "(() => {{ const el = document.querySelector({sel}); return el ? el.outerHTML : null; }})()",
            sel = js_str(selector)
        ),
        None => "document.documentElement.outerHTML".to_string(),
    }
}

pub(crate) fn snippet_get_links() -> String {
    "Array.from(document.querySelectorAll(\"a[href]\")).map((a) => ({ text: (a.innerText || \"\").trim().slice(0, 200), href: a.href }))"
        .to_string()
}

pub(crate) fn snippet_get_inputs() -> String {
    format!(
        "(() => {{ {SERIALIZE_ELEMENT} return Array.from(document.querySelectorAll(\"input, textarea, select, button\")).map(ser); }})()"
    )
}

pub(crate) fn snippet_query_selector(selector: &str) -> String {
    format!(
        "(() => {{ {SERIALIZE_ELEMENT} const el = document.querySelector({sel}); if (!el) return null; const out = ser(el); out.innerHTML = (el.innerHTML || \"\").slice(0, 2000); out.childCount = el.children.length; return out; }})()",
        sel = js_str(selector)
    )
}

pub(crate) fn snippet_query_selector_all(selector: &str) -> String {
    format!(
        "(() => {{ {SERIALIZE_ELEMENT} return Array.from(document.querySelectorAll({sel})).map(ser); }})()",
        sel = js_str(selector)
    )
}

/// Generic result extraction that covers the common engines' markup.
pub(crate) fn snippet_search_results() -> String {
    "(() => { const out = []; const seen = new Set(); const anchors = document.querySelectorAll(\"a h3, a h2, .result__a, .result__title a\"); for (const heading of anchors) { const a = heading.closest(\"a\") || heading; const href = a.href || \"\"; if (!href || seen.has(href)) continue; seen.add(href); const container = a.closest(\"[data-sokoban-container], .g, .result, li, article\") || a.parentElement; const snippetEl = container ? container.querySelector(\"[data-sncf], .VwiC3b, .result__snippet, p\") : null; out.push({ title: (heading.innerText || \"\").trim().slice(0, 300), url: href, snippet: snippetEl ? (snippetEl.innerText || \"\").trim().slice(0, 500) : \"\" }); if (out.length >= 20) break; } return out; })()"
        .to_string()
}

pub(crate) fn snippet_wiki_tables() -> String {
    "(() => Array.from(document.querySelectorAll(\"table.wikitable\")).map((table) => Array.from(table.rows).map((row) => Array.from(row.cells).map((cell) => (cell.innerText || \"\").trim().slice(0, 300)))))()"
        .to_string()
}

pub(crate) fn snippet_click(selector: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); if (!el) throw new Error(\"no element matches \" + {sel}); el.click(); return true; }})()",
        sel = js_str(selector)
    )
}

pub(crate) fn snippet_type(selector: &str, text: &str) -> String {
    format!(
        "(() => {{ const el = document.querySelector({sel}); if (!el) throw new Error(\"no element matches \" + {sel}); el.focus(); el.value = {val}; el.dispatchEvent(new Event(\"input\", {{ bubbles: true }})); el.dispatchEvent(new Event(\"change\", {{ bubbles: true }})); return true; }})()",
        sel = js_str(selector),
        val = js_str(text)
    )
}

pub(crate) fn snippet_scroll(direction: &str, amount: f64) -> String {
    let (dx, dy) = match direction {
        "up" => (0.0, -amount),
        "left" => (-amount, 0.0),
        "right" => (amount, 0.0),
        _ => (0.0, amount),
    };
    format!("(() => {{ window.scrollBy({dx}, {dy}); return true; }})()")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_are_escaped_into_snippets() {
        let snippet = snippet_query_selector("a[href=\"x\"]");
        assert!(snippet.contains("a[href=\\\"x\\\"]"));
    }

    #[test]
    fn get_text_without_selector_reads_body() {
        assert!(snippet_get_text(None).contains("document.body"));
        assert!(snippet_get_text(Some("#main")).contains("#main"));
    }

    #[test]
    fn scroll_direction_maps_to_axes() {
        assert!(snippet_scroll("up", 500.0).contains("scrollBy(0, -500)"));
        assert!(snippet_scroll("down", 500.0).contains("scrollBy(0, 500)"));
        assert!(snippet_scroll("right", 250.0).contains("scrollBy(250, 0)"));
    }

    #[test]
    fn api_names_cover_the_documented_surface() {
        for name in ["setFinal", "env", "llm_query", "llm_batch", "execInTab"] {
            assert!(API_NAMES.contains(&name), "missing {name}");
        }
    }
}
