//! Text-level hoisting of top-level declarations.
//!
//! `const`/`let`/`var` at statement level are rewritten to plain assignments
//! and their names collected, so the engine can pre-declare them as `var`s at
//! global scope and the bindings survive across executions. Declarations in
//! `for(...)` headers and anything nested inside braces are left alone.
//!
//! The scanner tracks strings, template literals and comments, but a template
//! literal whose interpolation itself contains a top-level-looking
//! declaration can still confuse it; that is an accepted limitation of the
//! text-based approach.

/// Result of the hoisting pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Hoisted {
    /// Declared names, in order of first appearance, deduplicated.
    pub names: Vec<String>,
    /// Source with hoisted declaration keywords removed.
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Code,
    Single,
    Double,
    Template,
    LineComment,
    BlockComment,
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_' || ch == '$'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '$'
}

/// Scan `code` and hoist top-level declarations.
pub fn hoist(code: &str) -> Hoisted {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut names: Vec<String> = Vec::new();

    let mut mode = Mode::Code;
    let mut depth: i32 = 0;
    let mut template_expr_depth: Vec<i32> = Vec::new();
    // True when the previous meaningful token could end a statement, so a
    // keyword here starts a new statement.
    let mut at_statement_start = true;

    let mut index = 0usize;
    while index < chars.len() {
        let ch = chars[index];
        let next = chars.get(index + 1).copied();

        match mode {
            Mode::Single => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(next) = next {
                        out.push(next);
                        index += 2;
                        continue;
                    }
                } else if ch == '\'' || ch == '\n' {
                    mode = Mode::Code;
                }
                index += 1;
                continue;
            }
            Mode::Double => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(next) = next {
                        out.push(next);
                        index += 2;
                        continue;
                    }
                } else if ch == '"' || ch == '\n' {
                    mode = Mode::Code;
                }
                index += 1;
                continue;
            }
            Mode::Template => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(next) = next {
                        out.push(next);
                        index += 2;
                        continue;
                    }
                } else if ch == '`' {
                    mode = Mode::Code;
                } else if ch == '$' && next == Some('{') {
                    out.push('{');
                    index += 2;
                    template_expr_depth.push(depth);
                    depth += 1;
                    mode = Mode::Code;
                    continue;
                }
                index += 1;
                continue;
            }
            Mode::LineComment => {
                out.push(ch);
                if ch == '\n' {
                    mode = Mode::Code;
                    at_statement_start = true;
                }
                index += 1;
                continue;
            }
            Mode::BlockComment => {
                out.push(ch);
                if ch == '*' && next == Some('/') {
                    out.push('/');
                    index += 2;
                    mode = Mode::Code;
                    continue;
                }
                index += 1;
                continue;
            }
            Mode::Code => {}
        }

        match ch {
            '\'' => {
                mode = Mode::Single;
                out.push(ch);
                index += 1;
                continue;
            }
            '"' => {
                mode = Mode::Double;
                out.push(ch);
                index += 1;
                continue;
            }
            '`' => {
                mode = Mode::Template;
                out.push(ch);
                index += 1;
                continue;
            }
            '/' if next == Some('/') => {
                mode = Mode::LineComment;
                out.push(ch);
                index += 1;
                continue;
            }
            '/' if next == Some('*') => {
                mode = Mode::BlockComment;
                out.push(ch);
                index += 1;
                continue;
            }
            '{' | '(' | '[' => {
                depth += 1;
                at_statement_start = ch == '{';
                out.push(ch);
                index += 1;
                continue;
            }
            '}' | ')' | ']' => {
                depth -= 1;
                if ch == '}' {
                    if let Some(resume) = template_expr_depth.last().copied() {
                        if depth == resume {
                            template_expr_depth.pop();
                            mode = Mode::Template;
                            out.push(ch);
                            index += 1;
                            continue;
                        }
                    }
                }
                at_statement_start = ch == '}';
                out.push(ch);
                index += 1;
                continue;
            }
            ';' | '\n' => {
                at_statement_start = true;
                out.push(ch);
                index += 1;
                continue;
            }
            ch if ch.is_whitespace() => {
                out.push(ch);
                index += 1;
                continue;
            }
            _ => {}
        }

        // Keyword detection at top level, statement position only.
        if depth == 0 && at_statement_start && is_ident_start(ch) {
            let word_end = {
                let mut end = index;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                end
            };
            let word: String = chars[index..word_end].iter().collect();
            if matches!(word.as_str(), "const" | "let" | "var") {
                // Parse the declarator list: identifiers only, no patterns.
                if let Some(parsed) = parse_declarators(&chars, word_end) {
                    for name in &parsed {
                        if !names.contains(name) {
                            names.push(name.clone());
                        }
                    }
                    // Drop the keyword and the whitespace after it.
                    let mut skip = word_end;
                    while skip < chars.len() && chars[skip].is_whitespace() && chars[skip] != '\n' {
                        skip += 1;
                    }
                    index = skip;
                    at_statement_start = false;
                    continue;
                }
            }
            // Plain identifier: copy it wholesale so keywords inside names
            // ("constant") never match.
            for &word_char in &chars[index..word_end] {
                out.push(word_char);
            }
            index = word_end;
            at_statement_start = false;
            continue;
        }

        at_statement_start = false;
        out.push(ch);
        index += 1;
    }

    Hoisted { names, code: out }
}

/// Check that a declarator list starting after the keyword is made of plain
/// identifiers, and return their names. Destructuring patterns return `None`
/// and the declaration is left untouched.
fn parse_declarators(chars: &[char], mut index: usize) -> Option<Vec<String>> {
    let mut names = Vec::new();
    loop {
        while index < chars.len() && chars[index].is_whitespace() {
            index += 1;
        }
        if index >= chars.len() || !is_ident_start(chars[index]) {
            return if names.is_empty() { None } else { Some(names) };
        }
        let start = index;
        while index < chars.len() && is_ident_char(chars[index]) {
            index += 1;
        }
        names.push(chars[start..index].iter().collect());

        while index < chars.len() && chars[index].is_whitespace() {
            index += 1;
        }
        match chars.get(index) {
            // `let a, b = 2;` requires continuing past the next declarator only when
            // the separator comma sits at the top nesting level of the
            // initializer expression.
            Some('=') => {
                let mut inner_depth = 0i32;
                let mut inner_mode = Mode::Code;
                index += 1;
                while index < chars.len() {
                    let ch = chars[index];
                    match inner_mode {
                        Mode::Single => {
                            if ch == '\\' {
                                index += 1;
                            } else if ch == '\'' {
                                inner_mode = Mode::Code;
                            }
                        }
                        Mode::Double => {
                            if ch == '\\' {
                                index += 1;
                            } else if ch == '"' {
                                inner_mode = Mode::Code;
                            }
                        }
                        Mode::Template => {
                            if ch == '\\' {
                                index += 1;
                            } else if ch == '`' {
                                inner_mode = Mode::Code;
                            }
                        }
                        _ => match ch {
                            '\'' => inner_mode = Mode::Single,
                            '"' => inner_mode = Mode::Double,
                            '`' => inner_mode = Mode::Template,
                            '{' | '(' | '[' => inner_depth += 1,
                            '}' | ')' | ']' => {
                                if inner_depth == 0 {
                                    return Some(names);
                                }
                                inner_depth -= 1;
                            }
                            ',' if inner_depth == 0 => break,
                            ';' | '\n' if inner_depth == 0 => return Some(names),
                            _ => {}
                        },
                    }
                    index += 1;
                }
                if index >= chars.len() {
                    return Some(names);
                }
                index += 1; // past the comma
            }
            Some(',') => {
                index += 1;
            }
            _ => return Some(names),
        }
    }
}

/// Statement-leading keywords that can never be wrapped in `return (...)`.
const STATEMENT_KEYWORDS: &[&str] = &[
    "const", "let", "var", "if", "else", "for", "while", "do", "switch", "try", "catch",
    "finally", "function", "class", "return", "throw", "break", "continue", "debugger",
    "async",
];

/// Split the final top-level expression statement off `code`, so the
/// evaluator can `return` it and report the block's completion value.
/// Returns `None` when the last statement is not a plain expression.
pub fn split_trailing_expression(code: &str) -> Option<(String, String)> {
    let bytes: Vec<(usize, char)> = code.char_indices().collect();
    let mut mode = Mode::Code;
    let mut depth: i32 = 0;
    let mut template_expr_depth: Vec<i32> = Vec::new();
    let mut pending_start = true;
    let mut last_start: Option<usize> = None;
    let mut prev_meaningful: Option<char> = None;

    let mut position = 0usize;
    while position < bytes.len() {
        let (byte_index, ch) = bytes[position];
        let next = bytes.get(position + 1).map(|&(_, ch)| ch);

        match mode {
            Mode::Single => {
                if ch == '\\' {
                    position += 2;
                    continue;
                }
                if ch == '\'' || ch == '\n' {
                    mode = Mode::Code;
                }
                position += 1;
                continue;
            }
            Mode::Double => {
                if ch == '\\' {
                    position += 2;
                    continue;
                }
                if ch == '"' || ch == '\n' {
                    mode = Mode::Code;
                }
                position += 1;
                continue;
            }
            Mode::Template => {
                if ch == '\\' {
                    position += 2;
                    continue;
                }
                if ch == '`' {
                    mode = Mode::Code;
                } else if ch == '$' && next == Some('{') {
                    template_expr_depth.push(depth);
                    depth += 1;
                    mode = Mode::Code;
                    position += 2;
                    continue;
                }
                position += 1;
                continue;
            }
            Mode::LineComment => {
                if ch == '\n' {
                    mode = Mode::Code;
                }
                position += 1;
                continue;
            }
            Mode::BlockComment => {
                if ch == '*' && next == Some('/') {
                    mode = Mode::Code;
                    position += 2;
                    continue;
                }
                position += 1;
                continue;
            }
            Mode::Code => {}
        }

        match ch {
            '\'' => {
                mode = Mode::Single;
                prev_meaningful = Some('\'');
            }
            '"' => {
                mode = Mode::Double;
                prev_meaningful = Some('"');
            }
            '`' => {
                mode = Mode::Template;
                prev_meaningful = Some('`');
            }
            '/' if next == Some('/') => {
                mode = Mode::LineComment;
                position += 2;
                continue;
            }
            '/' if next == Some('*') => {
                mode = Mode::BlockComment;
                position += 2;
                continue;
            }
            '{' | '(' | '[' => {
                depth += 1;
                prev_meaningful = Some(ch);
            }
            '}' | ')' | ']' => {
                depth -= 1;
                prev_meaningful = Some(ch);
                if ch == '}' {
                    if let Some(resume) = template_expr_depth.last().copied() {
                        if depth == resume {
                            template_expr_depth.pop();
                            mode = Mode::Template;
                            position += 1;
                            continue;
                        }
                    }
                    if depth == 0 {
                        pending_start = true;
                    }
                }
            }
            ';' => {
                if depth == 0 {
                    pending_start = true;
                }
                prev_meaningful = None;
            }
            ch if ch.is_whitespace() => {
                if ch == '\n' && depth == 0 {
                    pending_start = true;
                }
            }
            _ => {
                if depth == 0 && pending_start {
                    // A line starting with an operator, or following a
                    // dangling operator, continues the previous expression.
                    let continues = matches!(
                        ch,
                        '.' | '+' | '-' | '*' | '/' | '%' | '?' | ':' | '&' | '|' | '=' | '<'
                            | '>' | ','
                    ) || matches!(
                        prev_meaningful,
                        Some(
                            '+' | '-' | '*' | '/' | '%' | '=' | '<' | '>' | '&' | '|' | '?'
                                | ':' | ',' | '('
                        )
                    );
                    if !continues {
                        last_start = Some(byte_index);
                    }
                    pending_start = false;
                }
                prev_meaningful = Some(ch);
            }
        }
        position += 1;
    }

    let start = last_start?;
    let tail = code[start..]
        .trim()
        .trim_end_matches(';')
        .trim_end()
        .to_string();
    if tail.is_empty() || tail.starts_with("//") || tail.starts_with("/*") {
        return None;
    }
    let first_word: String = tail
        .chars()
        .take_while(|&ch| is_ident_char(ch))
        .collect();
    if STATEMENT_KEYWORDS.contains(&first_word.as_str()) {
        return None;
    }
    Some((code[..start].to_string(), tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hoists_simple_declarations() {
        let hoisted = hoist("const x = 5;\nlet y = x + 1;");
        assert_eq!(hoisted.names, vec!["x", "y"]);
        assert_eq!(hoisted.code, "x = 5;\ny = x + 1;");
    }

    #[test]
    fn leaves_for_headers_alone() {
        let hoisted = hoist("for (let i = 0; i < 3; i++) { log(i); }");
        assert!(hoisted.names.is_empty());
        assert_eq!(hoisted.code, "for (let i = 0; i < 3; i++) { log(i); }");
    }

    #[test]
    fn leaves_nested_declarations_alone() {
        let hoisted = hoist("function f() {\n  const inner = 1;\n  return inner;\n}\nconst outer = f();");
        assert_eq!(hoisted.names, vec!["outer"]);
        assert!(hoisted.code.contains("const inner = 1;"));
        assert!(hoisted.code.contains("outer = f();"));
    }

    #[test]
    fn skips_keywords_inside_strings_and_comments() {
        let hoisted = hoist("const a = \"const b = 2;\"; // const c = 3;\n/* let d = 4; */");
        assert_eq!(hoisted.names, vec!["a"]);
        assert!(hoisted.code.contains("\"const b = 2;\""));
        assert!(hoisted.code.contains("// const c = 3;"));
    }

    #[test]
    fn handles_multiple_declarators() {
        let hoisted = hoist("let a = 1, b = 2;");
        assert_eq!(hoisted.names, vec!["a", "b"]);
        assert_eq!(hoisted.code, "a = 1, b = 2;");
    }

    #[test]
    fn initializer_with_call_keeps_single_name() {
        let hoisted = hoist("const rows = await getWikiTables(tab, { deep: true });");
        assert_eq!(hoisted.names, vec!["rows"]);
        assert_eq!(hoisted.code, "rows = await getWikiTables(tab, { deep: true });");
    }

    #[test]
    fn destructuring_is_left_untouched() {
        let source = "const { a, b } = env.pair;";
        let hoisted = hoist(source);
        assert!(hoisted.names.is_empty());
        assert_eq!(hoisted.code, source);
    }

    #[test]
    fn declaration_without_initializer() {
        let hoisted = hoist("let buffer;");
        assert_eq!(hoisted.names, vec!["buffer"]);
        assert_eq!(hoisted.code, "buffer;");
    }

    #[test]
    fn names_deduplicate_across_statements() {
        let hoisted = hoist("let x = 1;\nlet x = 2;");
        assert_eq!(hoisted.names, vec!["x"]);
        assert_eq!(hoisted.code, "x = 1;\nx = 2;");
    }

    #[test]
    fn template_expression_nesting_survives() {
        let hoisted = hoist("const msg = `count: ${items.length}`;");
        assert_eq!(hoisted.names, vec!["msg"]);
        assert_eq!(hoisted.code, "msg = `count: ${items.length}`;");
    }

    #[test]
    fn trailing_expression_is_split_off() {
        let (head, tail) = split_trailing_expression("x = 5;\nx + 1").unwrap();
        assert_eq!(head, "x = 5;\n");
        assert_eq!(tail, "x + 1");
    }

    #[test]
    fn trailing_call_with_semicolon() {
        let (_, tail) = split_trailing_expression("a();\nsetFinal(\"hello\");").unwrap();
        assert_eq!(tail, "setFinal(\"hello\")");
    }

    #[test]
    fn trailing_statement_keywords_are_not_split() {
        assert!(split_trailing_expression("if (a) { b(); }").is_none());
        assert!(split_trailing_expression("x = 1;\nfor (const y of z) { log(y); }").is_none());
        assert!(split_trailing_expression("return 1;").is_none());
    }

    #[test]
    fn whole_code_as_single_expression() {
        let (head, tail) = split_trailing_expression("1 + 1").unwrap();
        assert!(head.is_empty());
        assert_eq!(tail, "1 + 1");
    }

    #[test]
    fn method_chain_on_next_line_stays_together() {
        let (_, tail) =
            split_trailing_expression("rows\n  .map((row) => row[0])\n  .join(\",\")").unwrap();
        assert_eq!(tail, "rows\n  .map((row) => row[0])\n  .join(\",\")");
    }

    #[test]
    fn multiline_call_is_one_statement() {
        let (head, tail) = split_trailing_expression("a();\nquerySelector(\n  tab,\n  \"#x\"\n)").unwrap();
        assert_eq!(head, "a();\n");
        assert!(tail.starts_with("querySelector"));
    }
}
