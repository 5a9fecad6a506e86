//! Pure text stages that turn near-JSON into JSON.
//!
//! Every stage is string-aware: content inside double-quoted strings is never
//! rewritten except to escape raw control characters.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("static regex")
});
static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("static regex"));
static LEADING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([{\[])\s*,").expect("static regex"));
static DOUBLE_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*),").expect("static regex"));
static MISSING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([}\]])(\s*)([{\[])").expect("static regex"));

/// Strip surrounding code fences and whitespace.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(inner) = FENCED.captures(trimmed).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    // Opening fence with the closing one cut off.
    if let Some(rest) = trimmed.strip_prefix("```") {
        return match rest.find('\n') {
            Some(nl) => rest[nl + 1..].trim(),
            None => rest.trim(),
        };
    }
    trimmed
}

/// Parse `text` as a JSON object. Arrays and scalars do not count.
pub fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// A run of text that is either entirely inside or entirely outside a
/// double-quoted string. String segments include their quotes.
struct Segment<'a> {
    in_string: bool,
    text: &'a str,
}

fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                out.push(Segment { in_string: true, text: &text[start..=i] });
                start = i + 1;
                in_string = false;
            }
        } else if c == '"' {
            if start < i {
                out.push(Segment { in_string: false, text: &text[start..i] });
            }
            start = i;
            in_string = true;
        }
    }
    if start < text.len() {
        out.push(Segment { in_string, text: &text[start..] });
    }
    out
}

fn last_significant(out: &str) -> Option<char> {
    out.trim_end().chars().last()
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '{' | '}' | '[' | ']' | ':' | ',' | '"' | '\'' | '/' | '#')
}

fn push_escaped_control(c: char, out: &mut String) {
    match c {
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        c if (c as u32) < 0x20 => {}
        c => out.push(c),
    }
}

/// Copy a double-quoted string, escaping raw control characters.
fn copy_double_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                out.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
                continue;
            }
            '"' => {
                out.push('"');
                return i + 1;
            }
            c => push_escaped_control(c, out),
        }
        i += 1;
    }
    chars.len()
}

/// Index of the quote closing a single-quoted string opened at `start`.
/// A closing quote must be followed by a structural character, so
/// apostrophes inside the text do not end it.
fn single_quote_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '\'' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, None | Some(',' | ':' | '}' | ']')) {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn convert_single_quoted(chars: &[char], start: usize, end: usize, out: &mut String) {
    out.push('"');
    let mut i = start + 1;
    while i < end {
        let c = chars[i];
        match c {
            '\\' if chars.get(i + 1) == Some(&'\'') => {
                out.push('\'');
                i += 1;
            }
            '\\' => {
                out.push('\\');
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 1;
            }
            '"' => out.push_str("\\\""),
            c => push_escaped_control(c, out),
        }
        i += 1;
    }
    out.push('"');
}

/// Delimiters and comment starts end an unquoted value. `//` only counts
/// after whitespace so URLs survive.
fn ends_bare_value(chars: &[char], i: usize) -> bool {
    match chars[i] {
        ',' | '}' | ']' | '\n' | '#' => true,
        '/' => match chars.get(i + 1) {
            Some('*') => true,
            Some('/') => i > 0 && chars[i - 1].is_whitespace(),
            _ => false,
        },
        _ => false,
    }
}

/// Emit a bareword as a quoted key, a literal, or a quoted scalar value.
fn convert_bareword(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut word_end = start;
    while word_end < chars.len() && is_word_char(chars[word_end]) {
        word_end += 1;
    }
    let after = chars[word_end..].iter().find(|c| !c.is_whitespace());
    let in_value_position = last_significant(out) == Some(':');

    if after == Some(&':') && !in_value_position {
        let key: String = chars[start..word_end].iter().collect();
        out.push_str(&Value::String(key).to_string());
        return word_end;
    }

    let mut value_end = start;
    while value_end < chars.len() && !ends_bare_value(chars, value_end) {
        value_end += 1;
    }
    let raw: String = chars[start..value_end].iter().collect();
    let trimmed = raw.trim_end();
    let literal = match trimmed {
        "True" => Some("true"),
        "False" => Some("false"),
        "None" => Some("null"),
        other => match serde_json::from_str::<Value>(other) {
            Ok(Value::Number(_) | Value::Bool(_) | Value::Null) => Some(other),
            _ => None,
        },
    };
    match literal {
        Some(lit) => out.push_str(lit),
        None => out.push_str(&Value::String(trimmed.to_string()).to_string()),
    }
    out.push_str(&raw[trimmed.len()..]);
    value_end
}

/// Strip comments, convert single quotes, quote unquoted keys and scalar
/// values, and map Python literals onto JSON ones.
pub fn normalize_tokens(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => i = copy_double_quoted(&chars, i, &mut out),
            '\'' => {
                let opens_string = matches!(
                    last_significant(&out),
                    None | Some('{' | '[' | ',' | ':')
                );
                match single_quote_end(&chars, i).filter(|_| opens_string) {
                    Some(end) => {
                        convert_single_quoted(&chars, i, end, &mut out);
                        i = end + 1;
                    }
                    None => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            c if is_word_char(c) => i = convert_bareword(&chars, i, &mut out),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn ends_value(segment: &str) -> bool {
    let trimmed = segment.trim_end();
    let has_newline = segment[trimmed.len()..].contains('\n');
    has_newline
        && trimmed
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '}' | ']' | 'e' | 'l'))
}

/// Remove stray commas and insert missing ones between adjacent values.
pub fn fix_commas(text: &str) -> String {
    let segs = segments(text);
    let mut out = String::with_capacity(text.len() + 8);
    let mut prev_was_string = false;
    for (idx, seg) in segs.iter().enumerate() {
        if seg.in_string {
            out.push_str(seg.text);
            prev_was_string = true;
            continue;
        }
        let mut fixed = TRAILING_COMMA.replace_all(seg.text, "$1").into_owned();
        fixed = LEADING_COMMA.replace_all(&fixed, "$1").into_owned();
        fixed = DOUBLE_COMMA.replace_all(&fixed, ",$1").into_owned();
        fixed = MISSING_COMMA.replace_all(&fixed, "$1,$2$3").into_owned();

        let next_is_string = segs.get(idx + 1).is_some_and(|s| s.in_string);
        if next_is_string {
            if prev_was_string && fixed.trim().is_empty() {
                // Two adjacent strings: `"a" "b"`.
                fixed.insert(0, ',');
            } else if ends_value(&fixed) {
                let cut = fixed.trim_end().len();
                fixed.insert(cut, ',');
            }
        }
        out.push_str(&fixed);
        prev_was_string = false;
    }
    out
}

struct Frame {
    closer: char,
    member_start: usize,
    seen_colon: bool,
}

/// Close unterminated strings and unmatched `{`/`[`, dropping a dangling
/// half-written member. Excess closers are left alone.
pub fn balance(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<Frame> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' | '[' => {
                out.push(c);
                stack.push(Frame {
                    closer: if c == '{' { '}' } else { ']' },
                    member_start: out.len(),
                    seen_colon: false,
                });
            }
            '}' | ']' => {
                if stack.iter().any(|f| f.closer == c) {
                    while let Some(frame) = stack.pop() {
                        if frame.closer == c {
                            break;
                        }
                        out.push(frame.closer);
                    }
                }
                out.push(c);
            }
            ',' => {
                if let Some(frame) = stack.last_mut() {
                    frame.member_start = out.len();
                    frame.seen_colon = false;
                }
                out.push(c);
            }
            ':' => {
                if let Some(frame) = stack.last_mut() {
                    frame.seen_colon = true;
                }
                out.push(c);
            }
            c => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    if let Some(frame) = stack.last() {
        let dangling_key = frame.closer == '}'
            && !frame.seen_colon
            && !out[frame.member_start..].trim().is_empty();
        if dangling_key {
            out.truncate(frame.member_start);
        }
    }

    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str(" null");
    }

    while let Some(frame) = stack.pop() {
        out.push(frame.closer);
    }
    out
}

/// The first `{...}` span whose braces balance, ignoring braces in strings.
pub fn first_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Greedy span from the first `{` to the last `}`, or to the end of the text
/// when the object was cut off.
pub fn greedy_object_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    match text.rfind('}') {
        Some(end) if end > start => Some(&text[start..=end]),
        _ => Some(&text[start..]),
    }
}
