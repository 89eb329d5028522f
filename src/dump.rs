//! Text rendering of a decoded tree (dump text, one-line summaries).

use crate::bits::Bits;
use crate::derive::{DerivationRegistry, DerivedValue};
use crate::tree::{NodeId, NodeKind, ValueTree};
use crate::value::Value;

/// What [`dump`] prints besides names and values.
#[derive(Debug, Clone, Copy)]
pub struct DumpOptions<'r> {
    /// Append the source span of every node.
    pub show_spans: bool,
    /// Byte arrays and raw captures longer than this are cut off.
    pub max_bytes: usize,
    /// Evaluate Derived fields through this registry instead of printing their state.
    pub registry: Option<&'r DerivationRegistry>,
}

impl Default for DumpOptions<'_> {
    fn default() -> Self {
        DumpOptions {
            show_spans: false,
            max_bytes: 16,
            registry: None,
        }
    }
}

fn hex_string(b: &[u8], max: usize) -> String {
    let shown = b.iter().take(max).map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ");
    if b.len() > max {
        format!("{} .. ({} bytes)", shown, b.len())
    } else {
        shown
    }
}

/// Raw scalar string for a leaf value.
pub fn format_value(v: &Value, max_bytes: usize) -> String {
    match v {
        Value::Bytes(b) => format!("hex({})", hex_string(b, max_bytes)),
        Value::Str(s) => format!("{:?}", s),
        Value::Enum { value, name: Some(n) } => format!("{} ({})", n, value),
        Value::Bits(b) if b.len() > 64 => format!("<{} bits>", b.len()),
        other => other.to_string(),
    }
}

/// The whole tree, one node per line, children indented under their parent.
pub fn dump(tree: &ValueTree, options: &DumpOptions<'_>) -> String {
    let mut lines = Vec::new();
    dump_node(tree, tree.root(), None, 0, options, &mut lines);
    lines.join("\n")
}

fn dump_node(
    tree: &ValueTree,
    id: NodeId,
    label: Option<String>,
    indent: usize,
    options: &DumpOptions<'_>,
    lines: &mut Vec<String>,
) {
    let pad = "  ".repeat(indent);
    let label = label.map(|l| format!("{}: ", l)).unwrap_or_default();
    let Some(node) = tree.get(id) else {
        lines.push(format!("{}{}<removed {}>", pad, label, id));
        return;
    };
    let span = if options.show_spans {
        format!(" @{}", node.span())
    } else {
        String::new()
    };
    let tag = node.tag().map(|t| format!(" {}", t)).unwrap_or_default();
    match node.kind() {
        NodeKind::Leaf(leaf) => {
            lines.push(format!("{}{}{}{}", pad, label, format_value(leaf.value(), options.max_bytes), span));
        }
        NodeKind::Struct(s) => {
            lines.push(format!("{}{}struct{}{}", pad, label, tag, span));
            for (name, child) in s.fields() {
                dump_node(tree, child, Some(name.to_string()), indent + 1, options, lines);
            }
            push_padding(s.padding(), &pad, options, lines);
        }
        NodeKind::Sequence(q) => {
            lines.push(format!("{}{}sequence{} [{}]{}", pad, label, tag, q.len(), span));
            for (i, child) in q.items().iter().enumerate() {
                dump_node(tree, *child, Some(format!("[{}]", i)), indent + 1, options, lines);
            }
            push_padding(q.padding(), &pad, options, lines);
        }
        NodeKind::Error(e) => {
            let raw = e.raw().to_bytes();
            lines.push(format!(
                "{}{}<error {}: {}> raw({}){}",
                pad,
                label,
                e.kind(),
                e.message(),
                hex_string(&raw, options.max_bytes),
                span
            ));
        }
        NodeKind::Derived(d) => match options.registry {
            Some(registry) => match registry.evaluate(tree, id) {
                Ok(v) => match v.as_ref() {
                    DerivedValue::Value(value) => lines.push(format!(
                        "{}{}= {} (derived `{}`)",
                        pad,
                        label,
                        format_value(value, options.max_bytes),
                        d.function()
                    )),
                    DerivedValue::Tree(sub) => {
                        lines.push(format!("{}{}= derived `{}`", pad, label, d.function()));
                        let mut nested = Vec::new();
                        dump_node(sub, sub.root(), None, indent + 1, options, &mut nested);
                        lines.extend(nested);
                    }
                },
                Err(e) => lines.push(format!("{}{}<derived `{}` failed: {}>", pad, label, d.function(), e)),
            },
            None => {
                let state = if tree.is_stale(id) { "stale" } else { "cached" };
                lines.push(format!("{}{}<derived `{}`, {}>", pad, label, d.function(), state));
            }
        },
    }
}

fn push_padding(padding: &Bits, pad: &str, options: &DumpOptions<'_>, lines: &mut Vec<String>) {
    if !padding.is_empty() {
        lines.push(format!(
            "{}  <padding {} bits> raw({})",
            pad,
            padding.len(),
            hex_string(&padding.to_bytes(), options.max_bytes)
        ));
    }
}

/// First line of the rendering of `id` (for tree views).
pub fn summary_line(tree: &ValueTree, id: NodeId) -> String {
    let mut lines = Vec::new();
    dump_node(tree, id, None, 0, &DumpOptions::default(), &mut lines);
    lines.into_iter().next().unwrap_or_default()
}
