//! Parser for the textual segment
//!
//! Line-oriented and indentation-aware. Supports block mappings and
//! sequences, compact `- key: value` items, single-line flow collections,
//! quoted scalars, comments, anchors, aliases and tags.

use super::scalar::resolve_plain;
use crate::error::{Error, Result};
use crate::node::{Mapping, Node, Shared, TaggedNode};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

/// A parsed document: the schema tag from the `---` line and the root node
#[derive(Debug)]
pub struct ParsedText {
    pub schema: Option<String>,
    pub root: Node,
}

#[derive(Debug, Clone)]
struct Line<'a> {
    /// Zero-based line number within the whole file
    number: usize,
    /// Byte offset of the first content character within the file
    offset: u64,
    indent: usize,
    text: &'a str,
}

/// Parse `text`. `first_line` and `base_offset` locate the text within the
/// enclosing file so errors point at absolute positions.
pub fn parse_document(text: &str, first_line: usize, base_offset: u64) -> Result<ParsedText> {
    let mut parser = Parser::new(text, first_line, base_offset)?;
    parser.document()
}

#[derive(Default)]
struct Props {
    anchor: Option<String>,
    tag: Option<String>,
}

impl Props {
    fn is_empty(&self) -> bool {
        self.anchor.is_none() && self.tag.is_none()
    }
}

struct Parser<'a> {
    lines: Vec<Line<'a>>,
    pos: usize,
    anchors: AHashMap<String, Node>,
    /// Anchors whose node is still being parsed
    pending: AHashSet<String>,
    end_offset: u64,
    end_line: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, first_line: usize, base_offset: u64) -> Result<Self> {
        let mut lines = Vec::new();
        let mut offset = base_offset;
        let mut number = first_line;
        for raw in text.split_inclusive('\n') {
            let line = raw.trim_end_matches(['\n', '\r']);
            let content = line.trim_start_matches(' ');
            let indent = line.len() - content.len();
            if content.starts_with('\t') {
                return Err(Error::TextSegmentParse {
                    line: number + 1,
                    column: indent + 1,
                    offset: offset + indent as u64,
                    message: "tabs are not allowed in indentation".into(),
                });
            }
            let content = content.trim_end();
            if !content.is_empty() && !content.starts_with('#') {
                lines.push(Line {
                    number,
                    offset: offset + indent as u64,
                    indent,
                    text: content,
                });
            }
            offset += raw.len() as u64;
            number += 1;
        }
        Ok(Self {
            lines,
            pos: 0,
            anchors: AHashMap::new(),
            pending: AHashSet::new(),
            end_offset: offset,
            end_line: number,
        })
    }

    fn error_at(&self, line: &Line<'_>, column: usize, message: impl Into<String>) -> Error {
        Error::TextSegmentParse {
            line: line.number + 1,
            column: line.indent + column + 1,
            offset: line.offset + column as u64,
            message: message.into(),
        }
    }

    fn error_at_end(&self, message: impl Into<String>) -> Error {
        Error::TextSegmentParse {
            line: self.end_line + 1,
            column: 1,
            offset: self.end_offset,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<Line<'a>> {
        self.lines.get(self.pos).cloned()
    }

    fn is_end_marker(line: &Line<'_>) -> bool {
        line.indent == 0 && line.text == "..."
    }

    fn document(&mut self) -> Result<ParsedText> {
        let start = loop {
            let Some(line) = self.peek() else {
                return Err(self.error_at_end("missing document start '---'"));
            };
            self.pos += 1;
            if line.indent == 0 && (line.text == "---" || line.text.starts_with("--- ")) {
                break line;
            }
            if !line.text.starts_with('%') {
                return Err(self.error_at(&line, 0, "expected document start '---'"));
            }
        };

        let rest = &start.text[3..];
        let (props, consumed) = self.props(&start, rest, 3)?;
        let rest = rest[consumed..].trim_start();
        let column = start.text.len() - rest.len();
        if let Some(anchor) = &props.anchor {
            return Err(self.error_at(&start, 4, format!("root node cannot carry anchor '{}'", anchor)));
        }

        let root = if rest.is_empty() {
            match self.peek() {
                Some(next) if !Self::is_end_marker(&next) => self.block(next.indent)?,
                _ => Node::Null,
            }
        } else {
            self.inline(&start, rest, column)?
        };

        if let Some(line) = self.peek() {
            if Self::is_end_marker(&line) {
                self.pos += 1;
                if let Some(extra) = self.peek() {
                    return Err(self.error_at(&extra, 0, "content after document end"));
                }
            } else {
                return Err(self.error_at(&line, 0, "unexpected content"));
            }
        }

        Ok(ParsedText {
            schema: props.tag,
            root,
        })
    }

    fn block(&mut self, indent: usize) -> Result<Node> {
        match self.peek() {
            Some(line) if is_seq_item(line.text) => self.sequence(indent),
            _ => self.mapping(indent),
        }
    }

    fn mapping(&mut self, indent: usize) -> Result<Node> {
        let mut mapping = Mapping::new();
        while let Some(line) = self.peek() {
            if line.indent < indent || Self::is_end_marker(&line) {
                break;
            }
            if line.indent > indent {
                return Err(self.error_at(&line, 0, "unexpected indentation"));
            }
            if is_seq_item(line.text) {
                return Err(self.error_at(&line, 0, "expected a mapping key, found a sequence item"));
            }
            let Some((key, value_start)) = self.split_key(&line, line.text)? else {
                return Err(self.error_at(&line, 0, "expected 'key: value'"));
            };
            if mapping.contains_key(&key) {
                return Err(self.error_at(&line, 0, format!("duplicate key '{}'", key)));
            }
            self.pos += 1;
            let value = self.value(&line, value_start, indent, true)?;
            mapping.insert(key, value);
        }
        Ok(Node::Mapping(Shared::new(mapping)))
    }

    fn sequence(&mut self, indent: usize) -> Result<Node> {
        let mut items = Vec::new();
        while let Some(line) = self.peek() {
            if line.indent < indent || Self::is_end_marker(&line) || !is_seq_item(line.text) {
                if line.indent > indent {
                    return Err(self.error_at(&line, 0, "unexpected indentation"));
                }
                break;
            }
            if line.indent > indent {
                return Err(self.error_at(&line, 0, "unexpected indentation"));
            }
            let after = &line.text[1..];
            let rest = after.trim_start();
            let column = line.text.len() - rest.len();

            let compact = !rest.is_empty()
                && !rest.starts_with(['[', '{', '*', '&', '!'])
                && self.split_key(&line, rest)?.is_some();
            if compact {
                // `- key: value` opens a mapping indented to the key
                let entry = &mut self.lines[self.pos];
                entry.indent = indent + column;
                entry.offset += column as u64;
                entry.text = rest;
                items.push(self.mapping(indent + column)?);
            } else {
                self.pos += 1;
                items.push(self.value(&line, column, indent, false)?);
            }
        }
        Ok(Node::Sequence(Shared::new(items)))
    }

    /// Parse the value that starts at byte `column` of `line`. Nested blocks
    /// must be indented past `parent`; a mapping value may also be a
    /// sequence at the parent's own indentation.
    fn value(&mut self, line: &Line<'a>, column: usize, parent: usize, in_mapping: bool) -> Result<Node> {
        let text = &line.text[column..];
        let (props, consumed) = self.props(line, text, column)?;
        let rest = text[consumed..].trim_start();
        let column = line.text.len() - rest.len();

        if let Some(anchor) = &props.anchor {
            self.pending.insert(anchor.clone());
        }

        let node = if rest.is_empty() {
            match self.peek() {
                Some(next) if next.indent > parent && !Self::is_end_marker(&next) => self.block(next.indent)?,
                Some(next) if in_mapping && next.indent == parent && is_seq_item(next.text) => {
                    self.sequence(parent)?
                }
                _ => Node::Null,
            }
        } else if rest.starts_with('*') {
            if !props.is_empty() {
                return Err(self.error_at(line, column, "an alias cannot carry an anchor or tag"));
            }
            let (node, used) = self.alias(line, rest, column)?;
            self.trailing(line, &rest[used..], column + used)?;
            node
        } else {
            self.inline(line, rest, column)?
        };

        Ok(self.finish(node, props))
    }

    /// Apply a tag and register an anchor
    fn finish(&mut self, node: Node, props: Props) -> Node {
        let node = match props.tag {
            Some(tag) => Node::Tagged(Arc::new(TaggedNode { tag, node })),
            None => node,
        };
        if let Some(anchor) = props.anchor {
            self.pending.remove(&anchor);
            self.anchors.insert(anchor, node.clone());
        }
        node
    }

    /// A value that fits on the rest of the line: scalar or flow collection
    fn inline(&mut self, line: &Line<'a>, text: &str, column: usize) -> Result<Node> {
        if text.starts_with(['[', '{']) {
            let mut flow = Flow {
                text,
                pos: 0,
                line,
                column,
            };
            let node = flow.node(self)?;
            let used = flow.pos;
            self.trailing(line, &text[used..], column + used)?;
            return Ok(node);
        }
        if text.starts_with(['"', '\'']) {
            let (value, used) = self.quoted(line, text, column)?;
            self.trailing(line, &text[used..], column + used)?;
            return Ok(Node::Str(value));
        }
        if text.starts_with(['|', '>']) {
            return Err(self.error_at(line, column, "block scalars are not supported"));
        }
        if text.starts_with(['@', '`']) {
            return Err(self.error_at(line, column, "reserved indicator"));
        }
        Ok(resolve_plain(strip_comment(text)))
    }

    /// Only whitespace or a comment may follow a complete value
    fn trailing(&self, line: &Line<'_>, text: &str, column: usize) -> Result<()> {
        let rest = text.trim_start();
        if rest.is_empty() || (rest.starts_with('#') && rest.len() < text.len()) {
            Ok(())
        } else {
            Err(self.error_at(line, column + (text.len() - rest.len()), "unexpected trailing characters"))
        }
    }

    /// Parse `&anchor` and `!tag` in either order; returns bytes consumed
    fn props(&self, line: &Line<'_>, text: &str, column: usize) -> Result<(Props, usize)> {
        let mut props = Props::default();
        let mut pos = 0;
        loop {
            let rest = &text[pos..];
            let trimmed = rest.trim_start();
            let skip = rest.len() - trimmed.len();
            let (slot, what) = if trimmed.starts_with('&') {
                (&mut props.anchor, "anchor")
            } else if trimmed.starts_with('!') {
                (&mut props.tag, "tag")
            } else {
                break;
            };
            let token_len = trimmed.find(' ').unwrap_or(trimmed.len());
            let value = &trimmed[1..token_len];
            if value.is_empty() {
                return Err(self.error_at(line, column + pos + skip, format!("empty {}", what)));
            }
            if slot.is_some() {
                return Err(self.error_at(line, column + pos + skip, format!("duplicate {}", what)));
            }
            *slot = Some(value.to_string());
            pos += skip + token_len;
        }
        Ok((props, pos))
    }

    fn alias(&self, line: &Line<'_>, text: &str, column: usize) -> Result<(Node, usize)> {
        let len = text[1..]
            .find(|c: char| c == ' ' || c == ',' || c == ']' || c == '}')
            .map_or(text.len(), |i| i + 1);
        let name = &text[1..len];
        if name.is_empty() {
            return Err(self.error_at(line, column, "empty alias"));
        }
        if self.pending.contains(name) {
            return Err(Error::CyclicReference {
                path: format!("*{} (line {})", name, line.number + 1),
            });
        }
        match self.anchors.get(name) {
            Some(node) => Ok((node.clone(), len)),
            None => Err(self.error_at(line, column, format!("unknown anchor '{}'", name))),
        }
    }

    /// Parse a quoted scalar at the start of `text`; returns bytes consumed
    fn quoted(&self, line: &Line<'_>, text: &str, column: usize) -> Result<(String, usize)> {
        let quote = text.as_bytes()[0];
        let mut out = String::new();
        let mut chars = text.char_indices().skip(1).peekable();
        while let Some((i, c)) = chars.next() {
            match c {
                '\'' if quote == b'\'' => {
                    if let Some((_, '\'')) = chars.peek() {
                        chars.next();
                        out.push('\'');
                    } else {
                        return Ok((out, i + 1));
                    }
                }
                '"' if quote == b'"' => return Ok((out, i + 1)),
                '\\' if quote == b'"' => {
                    let Some((_, escape)) = chars.next() else {
                        break;
                    };
                    let hex_len = match escape {
                        'x' => 2,
                        'u' => 4,
                        'U' => 8,
                        _ => 0,
                    };
                    if hex_len > 0 {
                        let digits: String = (0..hex_len).filter_map(|_| chars.next().map(|(_, c)| c)).collect();
                        let decoded = u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32);
                        match decoded {
                            Some(c) if digits.len() == hex_len => out.push(c),
                            _ => return Err(self.error_at(line, column + i, "invalid escape sequence")),
                        }
                        continue;
                    }
                    out.push(match escape {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '0' => '\0',
                        '"' => '"',
                        '\\' => '\\',
                        '/' => '/',
                        ' ' => ' ',
                        _ => return Err(self.error_at(line, column + i, format!("unknown escape '\\{}'", escape))),
                    });
                }
                c => out.push(c),
            }
        }
        Err(self.error_at(line, column, "unterminated quoted scalar"))
    }

    /// Split `key: rest`; returns the key and the byte offset of the value
    /// within `line.text`. `None` if `text` is not a mapping entry.
    fn split_key(&self, line: &Line<'_>, text: &str) -> Result<Option<(String, usize)>> {
        let base = line.text.len() - text.len();
        let (key, after) = if text.starts_with(['"', '\'']) {
            let (key, used) = self.quoted(line, text, base)?;
            let after = text[used..].trim_start();
            if !after.starts_with(':') {
                return Ok(None);
            }
            (key, text.len() - after.len())
        } else {
            let bytes = text.as_bytes();
            let mut found = None;
            for (i, b) in bytes.iter().enumerate() {
                if *b == b'#' && i > 0 && bytes[i - 1] == b' ' {
                    break;
                }
                if *b == b':' && bytes.get(i + 1).map_or(true, |n| *n == b' ') {
                    found = Some(i);
                    break;
                }
            }
            let Some(i) = found else {
                return Ok(None);
            };
            let key = text[..i].trim_end();
            if key.is_empty() {
                return Ok(None);
            }
            (key.to_string(), i)
        };
        let value_start = base + after + 1;
        let rest = &line.text[value_start..];
        if !rest.is_empty() && !rest.starts_with(' ') {
            return Ok(None);
        }
        Ok(Some((key, value_start)))
    }
}

fn is_seq_item(text: &str) -> bool {
    text == "-" || text.starts_with("- ")
}

fn strip_comment(text: &str) -> &str {
    match text.find(" #") {
        Some(i) => text[..i].trim_end(),
        None => text,
    }
}

/// Cursor over a single-line flow collection
struct Flow<'t, 'l, 'a> {
    text: &'t str,
    pos: usize,
    line: &'l Line<'a>,
    column: usize,
}

impl<'t, 'l, 'a> Flow<'t, 'l, 'a> {
    fn rest(&self) -> &'t str {
        &self.text[self.pos..]
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn error(&self, parser: &Parser<'a>, message: &str) -> Error {
        if self.pos >= self.text.len() {
            parser.error_at(self.line, self.column + self.pos, format!("{} (flow collections must fit on one line)", message))
        } else {
            parser.error_at(self.line, self.column + self.pos, message.to_string())
        }
    }

    fn expect(&mut self, parser: &Parser<'a>, c: char) -> Result<()> {
        self.skip_ws();
        if self.rest().starts_with(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(parser, &format!("expected '{}'", c)))
        }
    }

    fn node(&mut self, parser: &mut Parser<'a>) -> Result<Node> {
        self.skip_ws();
        let (props, used) = parser.props(self.line, self.rest(), self.column + self.pos)?;
        self.pos += used;
        self.skip_ws();
        if let Some(anchor) = &props.anchor {
            parser.pending.insert(anchor.clone());
        }
        let rest = self.rest();
        let node = if rest.starts_with('[') {
            self.pos += 1;
            let mut items = Vec::new();
            loop {
                self.skip_ws();
                if self.rest().starts_with(']') {
                    self.pos += 1;
                    break;
                }
                items.push(self.node(parser)?);
                self.skip_ws();
                if self.rest().starts_with(',') {
                    self.pos += 1;
                } else {
                    self.expect(parser, ']')?;
                    break;
                }
            }
            Node::Sequence(Shared::new(items))
        } else if rest.starts_with('{') {
            self.pos += 1;
            let mut mapping = Mapping::new();
            loop {
                self.skip_ws();
                if self.rest().starts_with('}') {
                    self.pos += 1;
                    break;
                }
                let key_pos = self.pos;
                let key = match self.scalar(parser, true)? {
                    Node::Str(s) => s,
                    other => super::scalar::format_scalar(&other).unwrap_or_default(),
                };
                if mapping.contains_key(&key) {
                    return Err(parser.error_at(self.line, self.column + key_pos, format!("duplicate key '{}'", key)));
                }
                self.expect(parser, ':')?;
                let value = self.node(parser)?;
                mapping.insert(key, value);
                self.skip_ws();
                if self.rest().starts_with(',') {
                    self.pos += 1;
                } else {
                    self.expect(parser, '}')?;
                    break;
                }
            }
            Node::Mapping(Shared::new(mapping))
        } else if rest.starts_with('*') {
            if !props.is_empty() {
                return Err(self.error(parser, "an alias cannot carry an anchor or tag"));
            }
            let (node, used) = parser.alias(self.line, rest, self.column + self.pos)?;
            self.pos += used;
            node
        } else {
            self.scalar(parser, false)?
        };
        Ok(parser.finish(node, props))
    }

    /// Quoted or plain scalar inside a flow collection
    fn scalar(&mut self, parser: &Parser<'a>, key: bool) -> Result<Node> {
        let rest = self.rest();
        if rest.starts_with(['"', '\'']) {
            let (value, used) = parser.quoted(self.line, rest, self.column + self.pos)?;
            self.pos += used;
            return Ok(Node::Str(value));
        }
        let bytes = rest.as_bytes();
        let mut end = bytes.len();
        for (i, b) in bytes.iter().enumerate() {
            let stop = match b {
                b',' | b']' | b'}' => true,
                b':' => key || bytes.get(i + 1).map_or(true, |n| *n == b' '),
                b'#' => i > 0 && bytes[i - 1] == b' ',
                _ => false,
            };
            if stop {
                end = i;
                break;
            }
        }
        let text = rest[..end].trim_end();
        if text.is_empty() && !key {
            return Err(self.error(parser, "expected a value"));
        }
        self.pos += end;
        Ok(if key { Node::Str(text.to_string()) } else { resolve_plain(text) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ParsedText> {
        parse_document(text, 0, 0)
    }

    fn get(node: &Node, key: &str) -> Node {
        node.as_mapping().unwrap().read().get(key).cloned().unwrap()
    }

    #[test]
    fn test_parse_basic_document() -> Result<()> {
        let doc = parse("--- !core/tessera-1.0.0\nnumber: 6.0\nlist: [1, 4, 9, 16]\n...\n")?;
        assert_eq!(doc.schema.as_deref(), Some("core/tessera-1.0.0"));
        assert_eq!(get(&doc.root, "number"), Node::Float(6.0));
        assert_eq!(get(&doc.root, "list"), Node::seq([1, 4, 9, 16]));
        Ok(())
    }

    #[test]
    fn test_anchor_and_alias_share_identity() -> Result<()> {
        let doc = parse("---\na: &id001\n  x: 1\nb: *id001\n")?;
        assert!(get(&doc.root, "a").ptr_eq(&get(&doc.root, "b")));
        Ok(())
    }

    #[test]
    fn test_block_sequences() -> Result<()> {
        let text = "---\nitems:\n- name: a\n  size: 2\n- [1, 2]\n-\n  nested: true\n- plain text # comment\nafter: x\n";
        let doc = parse(text)?;
        let items = get(&doc.root, "items");
        let items = items.as_sequence().unwrap().read();
        assert_eq!(items.len(), 4);
        assert_eq!(get(&items[0], "size"), Node::Int(2));
        assert_eq!(items[1], Node::seq([1, 2]));
        assert_eq!(get(&items[2], "nested"), Node::Bool(true));
        assert_eq!(items[3], Node::from("plain text"));
        assert_eq!(get(&doc.root, "after"), Node::from("x"));
        Ok(())
    }

    #[test]
    fn test_tags_and_quoted_values() -> Result<()> {
        let text = "---\nw: !acme/widget-1.2.0\n  n: 3\n\"quoted key\": \"a\\nb\"\nsingle: 'it''s'\nflow: {a: 1, b: [x, y]}\n";
        let doc = parse(text)?;
        let w = get(&doc.root, "w");
        let tagged = w.as_tagged().unwrap();
        assert_eq!(tagged.tag, "acme/widget-1.2.0");
        assert_eq!(get(&tagged.node, "n"), Node::Int(3));
        assert_eq!(get(&doc.root, "quoted key"), Node::from("a\nb"));
        assert_eq!(get(&doc.root, "single"), Node::from("it's"));
        let flow = get(&doc.root, "flow");
        assert_eq!(get(&flow, "b"), Node::seq(["x", "y"]));
        Ok(())
    }

    #[test]
    fn test_error_positions() {
        let err = parse("---\na: 1\nb: [1, 2\n").unwrap_err();
        match err {
            Error::TextSegmentParse { line, column, offset, .. } => {
                assert_eq!(line, 3);
                assert_eq!(column, 9);
                assert_eq!(offset, 17);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let err = parse("---\na: 1\na: 2\n").unwrap_err();
        assert!(matches!(err, Error::TextSegmentParse { line: 3, .. }));
    }

    #[test]
    fn test_bad_indentation_rejected() {
        assert!(parse("---\na:\n    b: 1\n  c: 2\n").is_err());
        assert!(parse("---\na: 1\n\tb: 2\n").is_err());
    }

    #[test]
    fn test_unknown_alias_rejected() {
        assert!(matches!(
            parse("---\na: *nope\n").unwrap_err(),
            Error::TextSegmentParse { .. }
        ));
    }

    #[test]
    fn test_self_alias_is_cycle() {
        assert!(matches!(
            parse("---\na: &x\n  b: *x\n").unwrap_err(),
            Error::CyclicReference { .. }
        ));
    }

    #[test]
    fn test_header_comments_and_offsets() -> Result<()> {
        let doc = parse_document("#TESSERA 1.0.0\n--- {}\n", 0, 0)?;
        assert_eq!(doc.root, Node::empty_map());
        let err = parse_document("---\nx: [\n", 2, 100).unwrap_err();
        assert!(matches!(err, Error::TextSegmentParse { line: 4, .. }));
        Ok(())
    }
}
