//! Extracts dependency specifiers from source text without executing or
//! fully parsing it. This mirrors how the teacher's bundler keeps loading
//! and resolving as narrow, pluggable steps (see `bundle::modules`): here the
//! "load" step is a single linear scan rather than a full AST parse, which is
//! what keeps `findAll` safe against adversarial inputs (spec requires it
//! terminate in linear time, never hang on unbalanced quotes in comments).

use crate::error::MatchError;

/// A bare token produced by the linear scanner. Only the handful of shapes
/// `findAll` cares about are represented; everything else collapses to
/// `Other`.
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Punct(char),
    Other,
}

#[derive(Debug, Clone)]
struct Spanned {
    tok: Tok,
}

/// Tokenizes a JS-ish source, stripping line/block comments and resolving
/// string literal contents, without ever recursing: a single pass over the
/// bytes with a small state flag. Terminates even on unterminated strings or
/// comments since both simply run to end-of-input.
fn tokenize_js(source: &str) -> Vec<Spanned> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    let n = chars.len();

    while i < n {
        let c = chars[i];

        // Line comment.
        if c == '/' && i + 1 < n && chars[i + 1] == '/' {
            i += 2;
            while i < n && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }

        // Block comment.
        if c == '/' && i + 1 < n && chars[i + 1] == '*' {
            i += 2;
            while i < n && !(chars[i] == '*' && i + 1 < n && chars[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(n);
            continue;
        }

        // String literal: ' or ".
        if c == '\'' || c == '"' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            while i < n && chars[i] != quote {
                if chars[i] == '\\' && i + 1 < n {
                    value.push(unescape(chars[i + 1]));
                    i += 2;
                } else {
                    value.push(chars[i]);
                    i += 1;
                }
            }
            i = (i + 1).min(n); // consume closing quote (if present)
            out.push(Spanned { tok: Tok::Str(value) });
            continue;
        }

        // Template literal: treat `${...}` as nested code so braces still
        // balance, but the literal as a whole is opaque (no specifier value).
        if c == '`' {
            i += 1;
            let mut depth = 0usize;
            while i < n {
                if chars[i] == '\\' && i + 1 < n {
                    i += 2;
                    continue;
                }
                if chars[i] == '`' && depth == 0 {
                    i += 1;
                    break;
                }
                if chars[i] == '$' && i + 1 < n && chars[i + 1] == '{' {
                    depth += 1;
                    i += 2;
                    continue;
                }
                if chars[i] == '{' && depth > 0 {
                    depth += 1;
                }
                if chars[i] == '}' && depth > 0 {
                    depth -= 1;
                }
                i += 1;
            }
            out.push(Spanned { tok: Tok::Other });
            continue;
        }

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < n && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            out.push(Spanned { tok: Tok::Ident(word) });
            continue;
        }

        if "(){}[];,.=!<>".contains(c) {
            out.push(Spanned { tok: Tok::Punct(c) });
            i += 1;
            continue;
        }

        out.push(Spanned { tok: Tok::Other });
        i += 1;
    }

    out
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    }
}

/// Evaluates `"LIT" == "LIT"` / `!=` / `===` / `!==` shaped conditions.
fn eval_literal_cmp(a: &str, negate: bool, b: &str) -> bool {
    if negate {
        a != b
    } else {
        a == b
    }
}

struct LiteralGate {
    taken: bool,
    /// Index of the token immediately following the condition's `)`.
    after: usize,
}

/// Recognizes `if ( "LIT" <op> "LIT" )` where `<op>` is a run of `=`/`!`
/// punctuation (`==`, `!=`, `===`, `!==`), returning the statically known
/// outcome. Any other shape (non-literal operand, unrecognized operator)
/// returns `None` so the condition is treated as unknown.
fn parse_literal_if_condition(tokens: &[Spanned], if_idx: usize) -> Option<LiteralGate> {
    let mut j = if_idx + 1;
    if !matches!(tokens.get(j).map(|t| &t.tok), Some(Tok::Punct('('))) {
        return None;
    }
    j += 1;
    let a = match tokens.get(j).map(|t| &t.tok) {
        Some(Tok::Str(s)) => s.clone(),
        _ => return None,
    };
    j += 1;

    let op_start = j;
    while matches!(tokens.get(j).map(|t| &t.tok), Some(Tok::Punct('=')) | Some(Tok::Punct('!'))) {
        j += 1;
    }
    if j == op_start {
        return None;
    }
    let negate = matches!(tokens.get(op_start).map(|t| &t.tok), Some(Tok::Punct('!')));

    let b = match tokens.get(j).map(|t| &t.tok) {
        Some(Tok::Str(s)) => s.clone(),
        _ => return None,
    };
    j += 1;
    if !matches!(tokens.get(j).map(|t| &t.tok), Some(Tok::Punct(')'))) {
        return None;
    }
    j += 1;

    Some(LiteralGate {
        taken: eval_literal_cmp(&a, negate, &b),
        after: j,
    })
}

/// Finds the token index of the matching closing `}` for the `{` at
/// `open_idx`, scanning forward by brace depth. Bounded by token count, so it
/// always terminates even for malformed/unbalanced input (returns the last
/// token index in that case).
fn find_matching_brace(tokens: &[Spanned], open_idx: usize) -> usize {
    let mut depth = 0i32;
    let mut i = open_idx;
    while i < tokens.len() {
        match &tokens[i].tok {
            Tok::Punct('{') => depth += 1,
            Tok::Punct('}') => {
                depth -= 1;
                if depth == 0 {
                    return i;
                }
            }
            _ => {}
        }
        i += 1;
    }
    tokens.len().saturating_sub(1)
}

/// Extracts `require("x")` / `import ... from "x"` specifiers from a JS (or
/// TS/JSX) source string, honoring statically-false conditional gating.
///
/// Mirrors spec.md §4.1: call-style and declaration-style imports are both
/// recognized, occurrences inside strings/comments never appear (guaranteed
/// by scanning the tokenized stream rather than raw text), and a constantly
/// false `"LIT" == "LIT"`-shaped guard suppresses its block.
pub fn find_all_js(source: &str) -> Result<Vec<String>, MatchError> {
    let tokens = tokenize_js(source);
    let mut out = Vec::new();
    // Token ranges (inclusive) scheduled for skipping once the scan reaches
    // their start — statically-false `if` blocks, or the `else` of a
    // statically-true one.
    let mut skip_ranges: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;

    while i < tokens.len() {
        if let Some(pos) = skip_ranges.iter().position(|&(start, _)| start == i) {
            let (_, end) = skip_ranges.swap_remove(pos);
            i = end + 1;
            continue;
        }

        match &tokens[i].tok {
            Tok::Ident(word) if word == "require" => {
                if matches!(tokens.get(i + 1).map(|t| &t.tok), Some(Tok::Punct('('))) {
                    if let Some(Tok::Str(spec)) = tokens.get(i + 2).map(|t| &t.tok) {
                        out.push(spec.clone());
                        i += 3;
                        continue;
                    }
                }
            }
            Tok::Ident(word) if word == "import" => {
                // Bare: import "x";
                if let Some(Tok::Str(spec)) = tokens.get(i + 1).map(|t| &t.tok) {
                    out.push(spec.clone());
                    i += 2;
                    continue;
                }
                // Declaration forms: scan ahead to the statement-ending `;`
                // or the next `from "x"` pair, whichever comes first.
                let mut j = i + 1;
                while j < tokens.len() {
                    match &tokens[j].tok {
                        Tok::Ident(w) if w == "from" => {
                            if let Some(Tok::Str(spec)) = tokens.get(j + 1).map(|t| &t.tok) {
                                out.push(spec.clone());
                            }
                            break;
                        }
                        Tok::Punct(';') => break,
                        _ => {}
                    }
                    j += 1;
                }
                i = j + 1;
                continue;
            }
            Tok::Ident(word) if word == "if" => {
                if let Some(gate) = parse_literal_if_condition(&tokens, i) {
                    let open_brace = gate.after;
                    if matches!(tokens.get(open_brace).map(|t| &t.tok), Some(Tok::Punct('{'))) {
                        let close_brace = find_matching_brace(&tokens, open_brace);
                        if !gate.taken {
                            // Condition constantly false: skip the if-block
                            // body entirely.
                            skip_ranges.push((open_brace, close_brace));
                        } else if let (Some(Tok::Ident(w)), Some(Tok::Punct('{'))) = (
                            tokens.get(close_brace + 1).map(|t| &t.tok),
                            tokens.get(close_brace + 2).map(|t| &t.tok),
                        ) {
                            // Condition constantly true: the else branch (if
                            // any) can never run.
                            if w == "else" {
                                let else_open = close_brace + 2;
                                let else_close = find_matching_brace(&tokens, else_open);
                                skip_ranges.push((else_open, else_close));
                            }
                        }
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }

    Ok(out)
}

/// Extracts `@import "x";` / `@import url(x);` specifiers from a CSS/LESS
/// source string. Comments and string literals are skipped the same way as
/// the JS scanner; CSS has no line comments.
pub fn find_all_css(source: &str) -> Result<Vec<String>, MatchError> {
    let chars: Vec<char> = source.chars().collect();
    let n = chars.len();
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < n {
        let c = chars[i];

        if c == '/' && i + 1 < n && chars[i + 1] == '*' {
            i += 2;
            while i < n && !(chars[i] == '*' && i + 1 < n && chars[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(n);
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            while i < n && chars[i] != quote {
                if chars[i] == '\\' {
                    i += 1;
                }
                i += 1;
            }
            i = (i + 1).min(n);
            continue;
        }

        if c == '@' && source_matches(&chars, i, "@import") {
            i += "@import".len();
            // Skip whitespace.
            while i < n && chars[i].is_whitespace() {
                i += 1;
            }
            if i < n && (chars[i] == '"' || chars[i] == '\'') {
                let quote = chars[i];
                i += 1;
                let start = i;
                while i < n && chars[i] != quote {
                    i += 1;
                }
                out.push(chars[start..i].iter().collect());
                i = (i + 1).min(n);
                continue;
            }
            if i + 3 < n && chars[i] == 'u' && chars[i + 1] == 'r' && chars[i + 2] == 'l' && chars[i + 3] == '(' {
                i += 4;
                while i < n && chars[i].is_whitespace() {
                    i += 1;
                }
                let quoted = i < n && (chars[i] == '"' || chars[i] == '\'');
                let quote = if quoted { chars[i] } else { ')' };
                if quoted {
                    i += 1;
                }
                let start = i;
                while i < n && chars[i] != quote {
                    i += 1;
                }
                out.push(chars[start..i].iter().collect());
                i = (i + 1).min(n);
                continue;
            }
            continue;
        }

        i += 1;
    }

    Ok(out)
}

fn source_matches(chars: &[char], at: usize, needle: &str) -> bool {
    let needle_chars: Vec<char> = needle.chars().collect();
    if at + needle_chars.len() > chars.len() {
        return false;
    }
    chars[at..at + needle_chars.len()] == needle_chars[..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_require_calls() {
        let src = r#"const a = require("./a"); const b = require('yen');"#;
        assert_eq!(find_all_js(src).unwrap(), vec!["./a", "yen"]);
    }

    #[test]
    fn finds_import_declarations() {
        let src = r#"
import def from "./home_dep.js";
import * as ns from "ns-mod";
import "./side-effect.css";
import { a, b } from "pkg";
"#;
        assert_eq!(
            find_all_js(src).unwrap(),
            vec!["./home_dep.js", "ns-mod", "./side-effect.css", "pkg"]
        );
    }

    #[test]
    fn ignores_strings_and_comments() {
        let src = r#"
// require("commented-out")
/* import x from "block-commented"; */
const msg = "contains require(\"fake\") inside a string";
const real = require("./real");
"#;
        assert_eq!(find_all_js(src).unwrap(), vec!["./real"]);
    }

    #[test]
    fn false_literal_condition_suppresses_branch() {
        let src = r#"
if ("browser" == "node") {
    require("./node-only");
} else {
    require("./browser-only");
}
"#;
        assert_eq!(find_all_js(src).unwrap(), vec!["./browser-only"]);
    }

    #[test]
    fn true_literal_condition_keeps_if_suppresses_else() {
        let src = r#"
if ("a" == "a") {
    require("./taken");
} else {
    require("./skipped");
}
"#;
        assert_eq!(find_all_js(src).unwrap(), vec!["./taken"]);
    }

    #[test]
    fn unknown_condition_keeps_both_branches() {
        let src = r#"
if (typeof window !== "undefined") {
    require("./a");
} else {
    require("./b");
}
"#;
        assert_eq!(find_all_js(src).unwrap(), vec!["./a", "./b"]);
    }

    #[test]
    fn terminates_on_unbalanced_quotes_in_comments() {
        let src = "/* unterminated \" quote inside a comment\nconst x = require(\"./after\");";
        // The unbalanced quote is inside the (still open) block comment, so
        // everything after it is consumed by the comment scanner too; the
        // call is that this never hangs, regardless of the exact result.
        let _ = find_all_js(src).unwrap();
    }

    #[test]
    fn finds_css_imports() {
        let src = r#"
/* @import "commented"; */
@import "./base.css";
@import url(./theme.css);
@import url("./quoted.css");
"#;
        assert_eq!(
            find_all_css(src).unwrap(),
            vec!["./base.css", "./theme.css", "./quoted.css"]
        );
    }

    #[test]
    fn css_matcher_ignores_js_forms() {
        let src = r#"require("./not-css"); import x from "./also-not-css";"#;
        assert!(find_all_css(src).unwrap().is_empty());
    }
}
