//! Encoder protocol: serializing a [`ValueTree`] back to bits.
//!
//! The default rules ([`TreeEncoder`]):
//!
//! - a leaf writes its interpreted value in its declared width, whatever its raw bits were;
//! - an ErrorNode writes its captured raw bits verbatim;
//! - a Derived field writes nothing when its function has an inverse and fails
//!   with `NotEncodable` otherwise;
//! - structs and sequences concatenate their children, then any padding left
//!   inside their declared size.
//!
//! After the pass, every link whose measurement changed (a resized payload, a
//! grown sequence, a moved target) has its integer field patched in the output.

use crate::bits::{BitSink, Bits};
use crate::derive::DerivationRegistry;
use crate::error::{Error, Result};
use crate::tree::{Link, Measure, NodeId, NodeKind, ValueTree};
use crate::value::{LeafType, Value};
use std::collections::HashMap;
use tracing::{debug, trace};

/// Writes one node (and, through [`Encoding::node`], its children).
pub trait Encoder {
    fn encode(&self, tree: &ValueTree, node: NodeId, sink: &mut BitSink, cx: &mut Encoding<'_>) -> Result<()>;
}

impl<E: Encoder + ?Sized> Encoder for &E {
    fn encode(&self, tree: &ValueTree, node: NodeId, sink: &mut BitSink, cx: &mut Encoding<'_>) -> Result<()> {
        (**self).encode(tree, node, sink, cx)
    }
}

impl<E: Encoder + ?Sized> Encoder for std::sync::Arc<E> {
    fn encode(&self, tree: &ValueTree, node: NodeId, sink: &mut BitSink, cx: &mut Encoding<'_>) -> Result<()> {
        (**self).encode(tree, node, sink, cx)
    }
}

/// The format-agnostic encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeEncoder;

impl Encoder for TreeEncoder {
    fn encode(&self, tree: &ValueTree, node: NodeId, sink: &mut BitSink, cx: &mut Encoding<'_>) -> Result<()> {
        encode_default(self, tree, node, sink, cx)
    }
}

/// The default rules for `node`; children go back through `encoder`, so a
/// plug-in can override a few tags and delegate everything else here.
pub fn encode_default(
    encoder: &dyn Encoder,
    tree: &ValueTree,
    node: NodeId,
    sink: &mut BitSink,
    cx: &mut Encoding<'_>,
) -> Result<()> {
    let n = tree.node(node)?;
    match n.kind() {
        NodeKind::Leaf(leaf) => leaf.encode(sink),
        NodeKind::Error(e) => {
            sink.write_bits(e.raw());
            Ok(())
        }
        NodeKind::Derived(d) => {
            let invertible = cx
                .registry
                .and_then(|r| r.get(d.function()))
                .is_some_and(|f| f.has_inverse());
            if invertible {
                Ok(())
            } else {
                Err(Error::NotEncodable(format!(
                    "derived field {node} (`{}`) has no inverse",
                    d.function()
                )))
            }
        }
        NodeKind::Struct(s) => {
            for (_, child) in s.fields() {
                cx.node(encoder, tree, child, sink)?;
            }
            sink.write_bits(s.padding());
            Ok(())
        }
        NodeKind::Sequence(q) => {
            for child in q.items() {
                cx.node(encoder, tree, *child, sink)?;
            }
            sink.write_bits(q.padding());
            Ok(())
        }
    }
}

/// State of one encode pass.
pub struct Encoding<'r> {
    registry: Option<&'r DerivationRegistry>,
    placed: HashMap<NodeId, (u64, u64)>,
}

impl<'r> Encoding<'r> {
    pub fn new(registry: Option<&'r DerivationRegistry>) -> Self {
        Encoding {
            registry,
            placed: HashMap::new(),
        }
    }

    pub fn registry(&self) -> Option<&'r DerivationRegistry> {
        self.registry
    }

    /// Encode `id` with `encoder` and record where its bits landed.
    pub fn node(&mut self, encoder: &dyn Encoder, tree: &ValueTree, id: NodeId, sink: &mut BitSink) -> Result<()> {
        let start = sink.position();
        encoder.encode(tree, id, sink, self)?;
        self.placed.insert(id, (start, sink.position()));
        Ok(())
    }

    /// Output bit range of an encoded node.
    pub fn placed(&self, id: NodeId) -> Option<(u64, u64)> {
        self.placed.get(&id).copied()
    }

    fn measure(&self, tree: &ValueTree, link: &Link) -> Option<u64> {
        match link.measure() {
            Measure::Length { .. } => self.placed(link.target()).map(|(s, e)| e - s),
            Measure::Count => tree
                .get(link.target())?
                .as_sequence()
                .map(|q| q.len() as u64),
            Measure::Offset { base, .. } => {
                let (t, _) = self.placed(link.target())?;
                let (b, _) = self.placed(base)?;
                t.checked_sub(b)
            }
        }
    }

    /// Patch every live link whose measurement drifted from its decode-time value.
    fn patch_links(&self, tree: &ValueTree, sink: &mut BitSink) -> Result<()> {
        for link in tree.links() {
            let Some((start, end)) = self.placed(link.field()) else { continue };
            let Some(current) = self.measure(tree, link) else { continue };
            let Some(leaf) = tree.get(link.field()).and_then(|n| n.as_leaf()) else { continue };
            let LeafType::UInt(_) = leaf.ty() else { continue };
            let Some(stored) = leaf.value().as_u64() else { continue };

            let delta = current as i128 - link.original() as i128;
            if delta == 0 {
                continue;
            }
            let unit = match link.measure() {
                Measure::Length { unit_bits } | Measure::Offset { unit_bits, .. } => unit_bits as i128,
                Measure::Count => 1,
            };
            if delta % unit != 0 {
                return Err(Error::mismatch(format!(
                    "size of {} changed by {delta} bits, not a multiple of {unit}",
                    link.target()
                )));
            }
            let patched = stored as i128 + delta / unit;
            let value = u64::try_from(patched)
                .map_err(|_| Error::mismatch(format!("link field {} would become {patched}", link.field())))?;

            let mut tmp = BitSink::new();
            leaf.ty().encode(&Value::UInt(value), end - start, &mut tmp)?;
            sink.overwrite(start, &tmp.into_bits())?;
            debug!(field = %link.field(), target = %link.target(), from = stored, to = value, "patched link");
        }
        Ok(())
    }
}

/// Encode the whole tree.
pub fn encode(tree: &ValueTree, registry: Option<&DerivationRegistry>) -> Result<Bits> {
    encode_with(tree, tree.root(), &TreeEncoder, registry)
}

/// Encode one subtree; links whose endpoints lie outside it are left alone.
pub fn encode_node(tree: &ValueTree, node: NodeId, registry: Option<&DerivationRegistry>) -> Result<Bits> {
    encode_with(tree, node, &TreeEncoder, registry)
}

pub fn encode_with(
    tree: &ValueTree,
    node: NodeId,
    encoder: &dyn Encoder,
    registry: Option<&DerivationRegistry>,
) -> Result<Bits> {
    let mut sink = BitSink::new();
    let mut cx = Encoding::new(registry);
    cx.node(encoder, tree, node, &mut sink)?;
    cx.patch_links(tree, &mut sink)?;
    trace!(bits = sink.position(), "encoded {node}");
    Ok(sink.into_bits())
}
