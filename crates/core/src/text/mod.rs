//! The human-readable textual segment
//!
//! A small YAML subset: block and flow collections, plain and quoted
//! scalars, anchors, aliases and `!tag` annotations. The emitter's output is
//! always accepted by the parser.

mod emit;
mod parse;
mod scalar;

pub use emit::emit_document;
pub use parse::{parse_document, ParsedText};
pub use scalar::{format_scalar, resolve_plain};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::node::Node;

    fn roundtrip(root: &Node) -> Result<Node> {
        let text = emit_document(root, Some("core/tessera-1.0.0"))?;
        Ok(parse_document(&text, 0, 0)?.root)
    }

    #[test]
    fn test_emitted_text_parses_back() -> Result<()> {
        let shared = Node::seq(["x", "y"]);
        let root = Node::map([
            ("null", Node::Null),
            ("flags", Node::seq([true, false])),
            ("weird keys", Node::map([("a: b", 1), ("- dash", 2), ("", 3)])),
            ("strings", Node::seq(["12", "true", "", "multi\nline", "tab\there", "ünïcode"])),
            ("floats", Node::seq([0.5, -1e-300, f64::INFINITY, f64::NEG_INFINITY])),
            ("nested", Node::seq([Node::seq([1, 2]), Node::seq([3, 4])])),
            ("one", shared.clone()),
            ("two", shared),
            ("tagged", Node::tagged("acme/thing-2.0.0", Node::map([("v", Node::seq([1]))]))),
        ]);
        let back = roundtrip(&root)?;
        assert_eq!(back, root);

        let map = back.as_mapping().unwrap().read();
        assert!(map.get("one").unwrap().ptr_eq(map.get("two").unwrap()));
        Ok(())
    }

    #[test]
    fn test_shared_sequence_inside_flow_keeps_identity() -> Result<()> {
        let shared = Node::seq([1, 2]);
        let root = Node::map([("grid", Node::seq([shared.clone(), shared]))]);
        let back = roundtrip(&root)?;
        let grid = back.as_mapping().unwrap().read().get("grid").cloned().unwrap();
        let rows = grid.as_sequence().unwrap().read();
        assert!(rows[0].ptr_eq(&rows[1]));
        Ok(())
    }

    #[test]
    fn test_nan_roundtrip() -> Result<()> {
        let back = roundtrip(&Node::map([("x", f64::NAN)]))?;
        let value = back.as_mapping().unwrap().read().get("x").cloned().unwrap();
        assert!(matches!(value, Node::Float(f) if f.is_nan()));
        Ok(())
    }
}
