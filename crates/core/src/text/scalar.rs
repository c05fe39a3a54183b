//! Scalar formatting and plain-scalar resolution

use crate::node::Node;
use std::fmt::Write;

/// Characters that may not start a plain scalar
const INDICATORS: &[char] = &[
    '-', '?', ':', ',', '[', ']', '{', '}', '#', '&', '*', '!', '|', '>', '\'', '"', '%', '@', '`',
];

/// Resolve an unquoted scalar to its typed value
pub fn resolve_plain(text: &str) -> Node {
    match text {
        "" | "~" | "null" | "Null" | "NULL" => return Node::Null,
        "true" | "True" | "TRUE" => return Node::Bool(true),
        "false" | "False" | "FALSE" => return Node::Bool(false),
        ".inf" | ".Inf" | ".INF" | "+.inf" | "+.Inf" | "+.INF" => return Node::Float(f64::INFINITY),
        "-.inf" | "-.Inf" | "-.INF" => return Node::Float(f64::NEG_INFINITY),
        ".nan" | ".NaN" | ".NAN" => return Node::Float(f64::NAN),
        _ => {}
    }
    if is_int(text) {
        if let Ok(value) = text.parse::<i64>() {
            return Node::Int(value);
        }
    }
    if is_float(text) {
        if let Ok(value) = text.parse::<f64>() {
            return Node::Float(value);
        }
    }
    Node::Str(text.to_string())
}

fn strip_sign(text: &str) -> &str {
    text.strip_prefix(['-', '+']).unwrap_or(text)
}

fn is_int(text: &str) -> bool {
    let digits = strip_sign(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_float(text: &str) -> bool {
    let body = strip_sign(text);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };
    let mut digits = 0;
    let mut dots = 0;
    for b in mantissa.bytes() {
        match b {
            b'0'..=b'9' => digits += 1,
            b'.' => dots += 1,
            _ => return false,
        }
    }
    if digits == 0 || dots > 1 {
        return false;
    }
    match exponent {
        Some(exp) => is_int(exp),
        None => true,
    }
}

/// Format a float so it reads back as a float
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        ".nan".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { ".inf" } else { "-.inf" }.to_string()
    } else {
        // Debug keeps a fractional part or exponent and round-trips exactly
        format!("{:?}", value)
    }
}

/// True if `text` can be written without quotes in any position
fn is_plain_text(text: &str) -> bool {
    if text.is_empty() || text.trim() != text {
        return false;
    }
    if text.starts_with(INDICATORS) || text.starts_with("---") || text.starts_with("...") {
        return false;
    }
    if text.ends_with(':') || text.contains(": ") || text.contains(" #") {
        return false;
    }
    !text
        .chars()
        .any(|c| c.is_control() || matches!(c, ',' | '[' | ']' | '{' | '}'))
}

/// True if a string value can be written plain and read back as the same string
pub fn is_plain_string(text: &str) -> bool {
    is_plain_text(text) && matches!(resolve_plain(text), Node::Str(_))
}

/// Format a mapping key
pub fn format_key(key: &str) -> String {
    if is_plain_text(key) {
        key.to_string()
    } else {
        quote(key)
    }
}

/// Double-quote a string with escapes
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => {
                let code = c as u32;
                if code <= 0xff {
                    let _ = write!(out, "\\x{:02x}", code);
                } else {
                    let _ = write!(out, "\\u{:04x}", code);
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Format a scalar node; `None` for non-scalars
pub fn format_scalar(node: &Node) -> Option<String> {
    Some(match node {
        Node::Null => "null".to_string(),
        Node::Bool(b) => b.to_string(),
        Node::Int(i) => i.to_string(),
        Node::Float(f) => format_float(*f),
        Node::Str(s) if is_plain_string(s) => s.clone(),
        Node::Str(s) => quote(s),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_plain() {
        assert_eq!(resolve_plain("null"), Node::Null);
        assert_eq!(resolve_plain("true"), Node::Bool(true));
        assert_eq!(resolve_plain("-42"), Node::Int(-42));
        assert_eq!(resolve_plain("6.0"), Node::Float(6.0));
        assert_eq!(resolve_plain("1e21"), Node::Float(1e21));
        assert_eq!(resolve_plain(".5"), Node::Float(0.5));
        assert_eq!(resolve_plain("inf"), Node::Str("inf".into()));
        assert_eq!(resolve_plain("1.2.3"), Node::Str("1.2.3".into()));
        assert!(matches!(resolve_plain(".nan"), Node::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_float_formatting_reads_back() {
        for value in [6.0, 0.1, -2.5e-7, 1e21, f64::MAX, f64::INFINITY] {
            let text = format_float(value);
            assert_eq!(resolve_plain(&text), Node::Float(value), "{}", text);
        }
    }

    #[test]
    fn test_ambiguous_strings_are_quoted() {
        for text in ["true", "12", "", " padded", "a: b", "- item", "[x]", "null", "line\nbreak"] {
            let formatted = format_scalar(&Node::Str(text.to_string())).unwrap();
            assert!(formatted.starts_with('"'), "{:?} -> {}", text, formatted);
        }
        assert_eq!(format_scalar(&Node::from("hello world")).unwrap(), "hello world");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("a\"b\\c\n"), "\"a\\\"b\\\\c\\n\"");
        assert_eq!(quote("\u{1}"), "\"\\x01\"");
    }

    #[test]
    fn test_keys_quoted_only_when_structural() {
        assert_eq!(format_key("number"), "number");
        assert_eq!(format_key("12"), "12");
        assert_eq!(format_key("a key: with colon"), "\"a key: with colon\"");
    }
}
