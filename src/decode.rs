//! Decoder protocol: turning a [`BitCursor`] into a [`ValueTree`].
//!
//! Format plug-ins implement [`Decoder`] for each grammar element. Aggregates are
//! built through [`Decoding::decode_struct`] and [`Decoding::decode_sequence`],
//! whose scopes enforce failure isolation:
//!
//! - A failing child becomes an ErrorNode in its place. Siblings decoded before it
//!   are kept.
//! - If the child declared its [`extent`](Decoder::extent), the ErrorNode covers
//!   that extent (clipped to the region) and decoding continues after it.
//!   A child that succeeds owns its whole extent too: bits it left unread
//!   become the padding of the struct or sequence it returned.
//! - Otherwise the ErrorNode captures the rest of the enclosing region and every
//!   later sibling becomes a zero-width ErrorNode ([`Outcome::Skipped`]).
//! - A child that declared [`Recovery::Abort`] does not get an ErrorNode: its
//!   error propagates and the enclosing aggregate fails as a whole, becoming a
//!   single ErrorNode one level up.
//!
//! Decoding a source always yields a tree. Only a span that does not fit the
//! source is a hard error.

use crate::bits::Bits;
use crate::cursor::BitCursor;
use crate::error::{format_path, Diagnostic, Error, ErrorKind, PathSegment, Result};
use crate::source::{BitSource, SourceSpan};
use crate::tree::{ErrorNode, Leaf, Measure, Node, NodeId, NodeKind, SequenceNode, StructNode, ValueTree};
use crate::value::{Endianness, LeafType, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// How a decoder's failure is contained, declared before it consumes any bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recovery {
    /// Failure is local: the enclosing aggregate substitutes an ErrorNode.
    #[default]
    Recoverable,
    /// Failure leaves the enclosing aggregate unusable; it fails as a whole.
    Abort,
}

/// One grammar element of a format plug-in.
pub trait Decoder {
    fn recovery(&self) -> Recovery {
        Recovery::Recoverable
    }

    /// Bits this element occupies, when known up front (fixed width or length-prefixed).
    fn extent(&self, _ctx: &DecodeContext) -> Option<u64> {
        None
    }

    /// Decode one node starting at the cursor position and return its id.
    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId>;
}

impl<D: Decoder + ?Sized> Decoder for &D {
    fn recovery(&self) -> Recovery {
        (**self).recovery()
    }
    fn extent(&self, ctx: &DecodeContext) -> Option<u64> {
        (**self).extent(ctx)
    }
    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        (**self).decode(cursor, ctx, out)
    }
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn recovery(&self) -> Recovery {
        (**self).recovery()
    }
    fn extent(&self, ctx: &DecodeContext) -> Option<u64> {
        (**self).extent(ctx)
    }
    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        (**self).decode(cursor, ctx, out)
    }
}

impl<D: Decoder + ?Sized> Decoder for Arc<D> {
    fn recovery(&self) -> Recovery {
        (**self).recovery()
    }
    fn extent(&self, ctx: &DecodeContext) -> Option<u64> {
        (**self).extent(ctx)
    }
    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        (**self).decode(cursor, ctx, out)
    }
}

/// A closure used as a [`Decoder`]; recoverable, extent unknown.
pub struct FnDecoder<F>(F);

pub fn from_fn<F>(f: F) -> FnDecoder<F>
where
    F: Fn(&mut BitCursor, &DecodeContext, &mut Decoding) -> Result<NodeId>,
{
    FnDecoder(f)
}

impl<F> Decoder for FnDecoder<F>
where
    F: Fn(&mut BitCursor, &DecodeContext, &mut Decoding) -> Result<NodeId>,
{
    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        (self.0)(cursor, ctx, out)
    }
}

/// A decoder with overridden recovery class and/or extent.
pub struct Declared<D> {
    inner: D,
    recovery: Option<Recovery>,
    extent: Option<u64>,
}

impl<D: Decoder> Decoder for Declared<D> {
    fn recovery(&self) -> Recovery {
        self.recovery.unwrap_or_else(|| self.inner.recovery())
    }
    fn extent(&self, ctx: &DecodeContext) -> Option<u64> {
        self.extent.or_else(|| self.inner.extent(ctx))
    }
    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        self.inner.decode(cursor, ctx, out)
    }
}

pub trait DecoderExt: Decoder + Sized {
    fn aborting(self) -> Declared<Self> {
        Declared {
            inner: self,
            recovery: Some(Recovery::Abort),
            extent: None,
        }
    }

    fn with_extent(self, bits: u64) -> Declared<Self> {
        Declared {
            inner: self,
            recovery: None,
            extent: Some(bits),
        }
    }
}

impl<D: Decoder> DecoderExt for D {}

/// Format-specific parameters handed down to decoders.
#[derive(Debug, Clone, Default)]
pub struct DecodeContext {
    endianness: Endianness,
    length_hint: Option<u64>,
    params: BTreeMap<String, Value>,
}

impl DecodeContext {
    pub fn new() -> Self {
        DecodeContext::default()
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// A length in bits passed down from a sibling (e.g. a size prefix).
    pub fn with_length_hint(mut self, bits: u64) -> Self {
        self.length_hint = Some(bits);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn length_hint(&self) -> Option<u64> {
        self.length_hint
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// Limits for one decode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Aggregates nested deeper than this fail with `StructuralCorruption`.
    pub max_depth: usize,
    /// Diagnostics beyond this count are counted but not stored.
    pub max_diagnostics: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            max_depth: 256,
            max_diagnostics: 10_000,
        }
    }
}

/// What happened to one field or element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Decoded(NodeId),
    /// The child failed; an ErrorNode stands in its place.
    Failed(NodeId),
    /// Not attempted because an earlier sibling failed without a known extent.
    Skipped(NodeId),
}

impl Outcome {
    pub fn id(self) -> NodeId {
        match self {
            Outcome::Decoded(id) | Outcome::Failed(id) | Outcome::Skipped(id) => id,
        }
    }

    pub fn decoded(self) -> Option<NodeId> {
        match self {
            Outcome::Decoded(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_decoded(self) -> bool {
        matches!(self, Outcome::Decoded(_))
    }
}

/// Arena and diagnostics lengths to roll back to when a child fails.
#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    nodes: usize,
    diagnostics: usize,
    dropped: usize,
}

/// Set once an aggregate can no longer place its remaining children.
#[derive(Debug, Clone)]
struct Poison {
    kind: ErrorKind,
    reason: String,
}

/// Result of a decode pass.
#[derive(Debug)]
pub struct Decoded {
    pub tree: ValueTree,
    pub diagnostics: Vec<Diagnostic>,
    /// Diagnostics past `max_diagnostics` that were dropped.
    pub dropped_diagnostics: usize,
    /// Bits of the decoded region after the root node.
    pub trailing: Option<SourceSpan>,
}

impl Decoded {
    /// No ErrorNode was produced.
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty() && self.dropped_diagnostics == 0
    }
}

/// Decode the whole source.
pub fn decode(source: &BitSource, decoder: &dyn Decoder) -> Decoded {
    decode_with(source, decoder, &DecodeContext::default(), DecodeOptions::default())
}

pub fn decode_with(
    source: &BitSource,
    decoder: &dyn Decoder,
    ctx: &DecodeContext,
    options: DecodeOptions,
) -> Decoded {
    let out = Decoding::new(options);
    let mut cursor = BitCursor::new(source);
    out.decode_root(&mut cursor, decoder, ctx)
}

/// Decode one span of the source; fails only if the span does not fit the source.
pub fn decode_span(
    source: &BitSource,
    span: SourceSpan,
    decoder: &dyn Decoder,
    ctx: &DecodeContext,
    options: DecodeOptions,
) -> Result<Decoded> {
    let mut cursor = BitCursor::over(source, span)?;
    let out = Decoding::new(options);
    Ok(out.decode_root(&mut cursor, decoder, ctx))
}

/// State of one decode pass: the tree under construction and its diagnostics.
#[derive(Debug)]
pub struct Decoding {
    tree: ValueTree,
    diagnostics: Vec<Diagnostic>,
    dropped: usize,
    path: Vec<PathSegment>,
    depth: usize,
    options: DecodeOptions,
}

impl Decoding {
    pub fn new(options: DecodeOptions) -> Self {
        Decoding {
            tree: ValueTree::empty(),
            diagnostics: Vec::new(),
            dropped: 0,
            path: Vec::new(),
            depth: 0,
            options,
        }
    }

    pub fn tree(&self) -> &ValueTree {
        &self.tree
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Path of the node currently being decoded.
    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    fn decode_root(mut self, cursor: &mut BitCursor, decoder: &dyn Decoder, ctx: &DecodeContext) -> Decoded {
        let mut poison = None;
        let outcome = self.run_child(
            cursor,
            None,
            Recovery::Recoverable,
            decoder.extent(ctx),
            &mut poison,
            |c, out| decoder.decode(c, ctx, out),
        );
        let root = match outcome {
            Ok(Outcome::Decoded(id)) => id,
            Ok(Outcome::Failed(id)) | Ok(Outcome::Skipped(id)) => {
                warn!(source = %cursor.source().id(), "root decoder failed; tree is a single ErrorNode");
                id
            }
            // A recoverable root only fails on cursor repositioning; keep a tree regardless.
            Err(err) => {
                let start = cursor.position();
                // Reading exactly `remaining()` bits cannot run past the region.
                let raw = cursor.read_rest().unwrap_or_default();
                self.error_node(cursor.span_from(start), raw, &err)
            }
        };
        self.tree.set_root(root);
        let trailing = (!cursor.is_empty())
            .then(|| SourceSpan::new(cursor.source().id(), cursor.position(), cursor.end()));
        Decoded {
            tree: self.tree,
            diagnostics: self.diagnostics,
            dropped_diagnostics: self.dropped,
            trailing,
        }
    }

    /// Push a leaf node.
    pub fn leaf(&mut self, span: SourceSpan, raw: Bits, value: Value, ty: LeafType, tag: Option<&str>) -> NodeId {
        self.tree
            .push(Node::new(span, NodeKind::Leaf(Leaf::new(raw, value, ty))).tagged(tag))
    }

    /// Read `width` bits and interpret them as `ty`.
    pub fn read_leaf(&mut self, cursor: &mut BitCursor, width: u64, ty: LeafType) -> Result<NodeId> {
        let start = cursor.position();
        let raw = cursor.read(width)?;
        let value = ty.interpret(&raw, start)?;
        Ok(self.leaf(cursor.span_from(start), raw, value, ty, None))
    }

    /// Push an ErrorNode for `err` over `span` and record the diagnostic.
    pub fn error_node(&mut self, span: SourceSpan, raw: Bits, err: &Error) -> NodeId {
        debug!(path = %format_path(&self.path), %span, kind = %err.kind(), "substituting ErrorNode: {}", err);
        if self.diagnostics.len() < self.options.max_diagnostics {
            self.diagnostics
                .push(Diagnostic::from_error(err, span, self.path.clone()));
        } else {
            self.dropped += 1;
        }
        let node = ErrorNode::new(err.kind(), err.to_string(), raw);
        self.tree.push(Node::new(span, NodeKind::Error(node)))
    }

    fn skipped_node(&mut self, cursor: &BitCursor, poison: &Poison) -> NodeId {
        let span = SourceSpan::empty_at(cursor.source().id(), cursor.position());
        let node = ErrorNode::new(poison.kind, format!("not decoded: {}", poison.reason), Bits::new());
        self.tree.push(Node::new(span, NodeKind::Error(node)))
    }

    /// Run one child decode with failure isolation.
    fn run_child<F>(
        &mut self,
        cursor: &mut BitCursor,
        segment: Option<PathSegment>,
        recovery: Recovery,
        extent: Option<u64>,
        poison: &mut Option<Poison>,
        f: F,
    ) -> Result<Outcome>
    where
        F: FnOnce(&mut BitCursor, &mut Decoding) -> Result<NodeId>,
    {
        if let Some(p) = poison.as_ref() {
            return Ok(Outcome::Skipped(self.skipped_node(cursor, p)));
        }
        let start = cursor.position();
        let bound = extent.map(|n| n.min(cursor.remaining()));
        let mut sub = match bound {
            Some(n) => cursor.sub(n)?,
            None => cursor.clone(),
        };
        let mark = self.checkpoint();
        let pushed = segment.is_some();
        if let Some(seg) = segment {
            self.path.push(seg);
        }

        let result = if self.depth >= self.options.max_depth {
            Err(Error::corrupt(
                start,
                format!("nesting deeper than {} levels", self.options.max_depth),
            ))
        } else {
            self.depth += 1;
            let r = f(&mut sub, self);
            self.depth -= 1;
            r
        };
        let result = result.and_then(|id| self.fill_extent(&mut sub, id, bound));

        let outcome = match result {
            Ok(id) => {
                cursor.seek(sub.position())?;
                trace!(path = %format_path(&self.path), bits = sub.position().saturating_sub(start), "decoded");
                Ok(Outcome::Decoded(id))
            }
            Err(err) => {
                self.rollback(mark);
                if recovery == Recovery::Abort {
                    debug!(path = %format_path(&self.path), "aborting enclosing aggregate: {}", err);
                    Err(err)
                } else {
                    let end = match bound {
                        Some(n) => start + n,
                        None => cursor.end(),
                    };
                    cursor.seek(start)?;
                    let raw = cursor.read(end - start)?;
                    let span = SourceSpan::new(cursor.source().id(), start, end);
                    if bound.is_none() {
                        *poison = Some(Poison {
                            kind: err.kind(),
                            reason: format!(
                                "preceding `{}` failed without a known extent",
                                format_path(&self.path)
                            ),
                        });
                    }
                    Ok(Outcome::Failed(self.error_node(span, raw, &err)))
                }
            }
        };
        if pushed {
            self.path.pop();
        }
        outcome
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            nodes: self.tree.mark(),
            diagnostics: self.diagnostics.len(),
            dropped: self.dropped,
        }
    }

    /// Forget nodes and diagnostics recorded since `mark`.
    fn rollback(&mut self, mark: Checkpoint) {
        self.tree.truncate(mark.nodes);
        self.diagnostics.truncate(mark.diagnostics);
        self.dropped = mark.dropped;
    }

    /// A child with a declared size owns all of it: bits it left unread become
    /// the padding of the aggregate it returned. Any other node must fill its extent.
    fn fill_extent(&mut self, sub: &mut BitCursor, id: NodeId, bound: Option<u64>) -> Result<NodeId> {
        if bound.is_none() || sub.is_empty() {
            return Ok(id);
        }
        let from = sub.position();
        let end = sub.end();
        let raw = sub.read_rest()?;
        if self.tree.pad(id, raw, end) {
            debug!(path = %format_path(&self.path), bits = end - from, "unread bits of declared size kept as padding");
            Ok(id)
        } else {
            Err(Error::corrupt(
                from,
                format!("{} bits of the declared size were left undecoded", end - from),
            ))
        }
    }

    /// Shorten ErrorNode `id` to end at `end`, together with its diagnostic.
    fn cut_capture(&mut self, id: NodeId, end: u64) -> Result<()> {
        let old = self.tree.node(id)?.span();
        self.tree.shrink_error(id, end)?;
        let new = self.tree.node(id)?.span();
        if let Some(d) = self.diagnostics.iter_mut().rev().find(|d| d.span == old) {
            d.span = new;
        }
        Ok(())
    }

    /// Decode a struct. `body` declares the fields in order through the scope.
    ///
    /// If `body` returns an error (typically an aborting child), everything it
    /// allocated is discarded and the error is returned.
    pub fn decode_struct<F>(
        &mut self,
        cursor: &mut BitCursor,
        ctx: &DecodeContext,
        tag: Option<&str>,
        body: F,
    ) -> Result<NodeId>
    where
        F: FnOnce(&mut StructScope<'_>) -> Result<()>,
    {
        let start = cursor.position();
        let mark = self.checkpoint();
        let placeholder = SourceSpan::empty_at(cursor.source().id(), start);
        let id = self
            .tree
            .push(Node::new(placeholder, NodeKind::Struct(StructNode::default())).tagged(tag));
        let mut scope = StructScope {
            out: &mut *self,
            cursor: &mut *cursor,
            ctx,
            id,
            fields: Vec::new(),
            poison: None,
            capture: None,
        };
        let result = body(&mut scope);
        let StructScope { fields, .. } = scope;
        if let Err(err) = result {
            self.rollback(mark);
            return Err(err);
        }
        let span = self.covering_span(cursor, start, fields.iter().map(|(_, c)| *c));
        self.tree.finish_struct(id, span, fields);
        Ok(id)
    }

    /// Decode a sequence. `body` decodes the elements through the scope.
    pub fn decode_sequence<F>(
        &mut self,
        cursor: &mut BitCursor,
        ctx: &DecodeContext,
        tag: Option<&str>,
        body: F,
    ) -> Result<NodeId>
    where
        F: FnOnce(&mut SequenceScope<'_>) -> Result<()>,
    {
        let start = cursor.position();
        let mark = self.checkpoint();
        let placeholder = SourceSpan::empty_at(cursor.source().id(), start);
        let id = self
            .tree
            .push(Node::new(placeholder, NodeKind::Sequence(SequenceNode::default())).tagged(tag));
        let mut scope = SequenceScope {
            out: &mut *self,
            cursor: &mut *cursor,
            ctx,
            id,
            items: Vec::new(),
            poison: None,
        };
        let result = body(&mut scope);
        let SequenceScope { items, .. } = scope;
        if let Err(err) = result {
            self.rollback(mark);
            return Err(err);
        }
        let span = self.covering_span(cursor, start, items.iter().copied());
        self.tree.finish_sequence(id, span, items);
        Ok(id)
    }

    /// `[start, position)` widened to cover every child (children may be placed by seeking).
    fn covering_span(&self, cursor: &BitCursor, start: u64, children: impl Iterator<Item = NodeId>) -> SourceSpan {
        let mut span = cursor.span_from(start);
        for child in children {
            if let Some(node) = self.tree.get(child) {
                if let Some(u) = span.union(&node.span()) {
                    span = u;
                }
            }
        }
        span
    }

    /// Capture the rest of the cursor's region as an ErrorNode for `err`.
    fn capture_rest(&mut self, cursor: &mut BitCursor, segment: PathSegment, err: &Error) -> Result<NodeId> {
        let start = cursor.position();
        let raw = cursor.read_rest()?;
        self.path.push(segment);
        let id = self.error_node(cursor.span_from(start), raw, err);
        self.path.pop();
        Ok(id)
    }
}

/// Field-by-field construction of one struct node.
pub struct StructScope<'s> {
    out: &'s mut Decoding,
    cursor: &'s mut BitCursor,
    ctx: &'s DecodeContext,
    id: NodeId,
    fields: Vec<(String, NodeId)>,
    poison: Option<Poison>,
    /// The ErrorNode that captured the rest of the region when `poison` was set.
    capture: Option<NodeId>,
}

impl<'s> StructScope<'s> {
    /// Id the struct will have once finished.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cursor(&self) -> &BitCursor {
        &*self.cursor
    }

    pub fn ctx(&self) -> &DecodeContext {
        self.ctx
    }

    pub fn tree(&self) -> &ValueTree {
        &self.out.tree
    }

    pub fn is_poisoned(&self) -> bool {
        self.poison.is_some()
    }

    /// Reposition for a sibling whose offset is known independently of what came
    /// before (fixed-offset layouts).
    ///
    /// After an unbounded failure, `pos` may fall inside the failed field's
    /// capture: the capture is cut back to end at `pos` and later fields decode
    /// again. A forward jump keeps the skipped bits as a raw field named
    /// `gap@<start>`. A position inside bits an earlier field holds is corruption.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        let here = self.cursor.position();
        if let (Some(_), Some(capture)) = (&self.poison, self.capture) {
            let start = self.out.tree.node(capture)?.span().start();
            if pos < start {
                return Err(Error::corrupt(pos, format!("seek lands before the capture at bit {start}")));
            }
            if pos <= here {
                self.out.cut_capture(capture, pos)?;
                self.cursor.seek(pos)?;
                self.poison = None;
                self.capture = None;
                return Ok(());
            }
        }
        if pos < here {
            return Err(Error::corrupt(pos, format!("seek lands inside bits decoded up to {here}")));
        }
        if pos > here {
            let name = format!("gap@{here}");
            self.check_unique(&name)?;
            let id = self.out.read_leaf(&mut *self.cursor, pos - here, LeafType::Raw)?;
            self.fields.push((name, id));
        }
        self.poison = None;
        self.capture = None;
        Ok(())
    }

    fn record(&mut self, name: &str, was_poisoned: bool, outcome: Outcome) {
        if !was_poisoned && self.poison.is_some() {
            self.capture = Some(outcome.id());
        }
        self.fields.push((name.to_string(), outcome.id()));
    }

    fn check_unique(&self, name: &str) -> Result<()> {
        if self.fields.iter().any(|(n, _)| n == name) {
            return Err(Error::mismatch(format!("duplicate field `{name}`")));
        }
        Ok(())
    }

    pub fn field(&mut self, name: &str, decoder: &dyn Decoder) -> Result<Outcome> {
        let ctx = self.ctx;
        self.field_in(name, ctx, decoder)
    }

    /// Like [`field`](Self::field) with a different context for this child.
    pub fn field_in(&mut self, name: &str, ctx: &DecodeContext, decoder: &dyn Decoder) -> Result<Outcome> {
        self.check_unique(name)?;
        let was_poisoned = self.is_poisoned();
        let outcome = self.out.run_child(
            &mut *self.cursor,
            Some(PathSegment::Field(name.to_string())),
            decoder.recovery(),
            decoder.extent(ctx),
            &mut self.poison,
            |c, out| decoder.decode(c, ctx, out),
        )?;
        self.record(name, was_poisoned, outcome);
        Ok(outcome)
    }

    /// A nested struct declared inline.
    pub fn struct_field<F>(&mut self, name: &str, tag: Option<&str>, body: F) -> Result<Outcome>
    where
        F: FnOnce(&mut StructScope<'_>) -> Result<()>,
    {
        self.nested(name, None, |c, ctx, out| out.decode_struct(c, ctx, tag, body))
    }

    /// A nested struct whose size (`bits`) is known, e.g. from a length prefix.
    pub fn struct_field_within<F>(&mut self, name: &str, bits: u64, tag: Option<&str>, body: F) -> Result<Outcome>
    where
        F: FnOnce(&mut StructScope<'_>) -> Result<()>,
    {
        self.nested(name, Some(bits), |c, ctx, out| out.decode_struct(c, ctx, tag, body))
    }

    /// A nested sequence declared inline.
    pub fn sequence_field<F>(&mut self, name: &str, tag: Option<&str>, body: F) -> Result<Outcome>
    where
        F: FnOnce(&mut SequenceScope<'_>) -> Result<()>,
    {
        self.nested(name, None, |c, ctx, out| out.decode_sequence(c, ctx, tag, body))
    }

    /// A nested sequence whose size (`bits`) is known.
    pub fn sequence_field_within<F>(&mut self, name: &str, bits: u64, tag: Option<&str>, body: F) -> Result<Outcome>
    where
        F: FnOnce(&mut SequenceScope<'_>) -> Result<()>,
    {
        self.nested(name, Some(bits), |c, ctx, out| out.decode_sequence(c, ctx, tag, body))
    }

    fn nested<F>(&mut self, name: &str, extent: Option<u64>, f: F) -> Result<Outcome>
    where
        F: FnOnce(&mut BitCursor, &DecodeContext, &mut Decoding) -> Result<NodeId>,
    {
        self.check_unique(name)?;
        let ctx = self.ctx;
        let was_poisoned = self.is_poisoned();
        let outcome = self.out.run_child(
            &mut *self.cursor,
            Some(PathSegment::Field(name.to_string())),
            Recovery::Recoverable,
            extent,
            &mut self.poison,
            |c, out| {
                // The run clips the cursor to the region; a declared size past it is truncation.
                if let Some(bits) = extent.filter(|bits| *bits > c.remaining()) {
                    return Err(Error::OutOfRange {
                        position: c.position(),
                        requested: bits,
                        available: c.remaining(),
                    });
                }
                f(c, ctx, out)
            },
        )?;
        self.record(name, was_poisoned, outcome);
        Ok(outcome)
    }

    /// Record a decoder-detected problem: the rest of the region becomes field `name`.
    pub fn fail_rest(&mut self, name: &str, err: Error) -> Result<NodeId> {
        self.check_unique(name)?;
        let kind = err.kind();
        let id = self
            .out
            .capture_rest(&mut *self.cursor, PathSegment::Field(name.to_string()), &err)?;
        self.fields.push((name.to_string(), id));
        self.poison = Some(Poison {
            kind,
            reason: format!("`{name}` was corrupt"),
        });
        self.capture = Some(id);
        Ok(id)
    }

    /// Id of an already declared field.
    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    /// Interpreted value of a decoded leaf field.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.out.tree.value(self.get(name)?)
    }

    /// Integer value of a decoded leaf field; `None` if absent or failed.
    pub fn uint(&self, name: &str) -> Option<u64> {
        self.value(name)?.as_u64()
    }

    fn decoded_pair(&self, field: &str, target: &str) -> Result<Option<(NodeId, NodeId)>> {
        let lookup = |name: &str| {
            self.get(name)
                .ok_or_else(|| Error::mismatch(format!("no field `{name}` declared yet")))
        };
        let (f, t) = (lookup(field)?, lookup(target)?);
        let failed = |id: NodeId| self.out.tree.get(id).map_or(true, Node::is_error);
        // Corrupt fields are not kept in sync.
        if failed(f) || failed(t) {
            return Ok(None);
        }
        Ok(Some((f, t)))
    }

    /// `field` holds the size of `target` in units of `unit_bits`.
    pub fn length_of(&mut self, field: &str, target: &str, unit_bits: u64) -> Result<()> {
        match self.decoded_pair(field, target)? {
            Some((f, t)) => self.out.tree.add_link(f, t, Measure::Length { unit_bits }),
            None => Ok(()),
        }
    }

    /// `field` holds the element count of sequence `target`.
    pub fn count_of(&mut self, field: &str, target: &str) -> Result<()> {
        match self.decoded_pair(field, target)? {
            Some((f, t)) => self.out.tree.add_link(f, t, Measure::Count),
            None => Ok(()),
        }
    }

    /// `field` holds the position of `target` relative to `base`, in units of `unit_bits`.
    pub fn offset_of(&mut self, field: &str, target: NodeId, unit_bits: u64, base: NodeId) -> Result<()> {
        let f = self
            .get(field)
            .ok_or_else(|| Error::mismatch(format!("no field `{field}` declared yet")))?;
        if self.out.tree.get(f).map_or(true, Node::is_error)
            || self.out.tree.get(target).map_or(true, Node::is_error)
        {
            return Ok(());
        }
        self.out.tree.add_link(f, target, Measure::Offset { unit_bits, base })
    }

    /// A Derived virtual field over this whole struct.
    pub fn derived(&mut self, name: &str, function: &str) -> Result<NodeId> {
        let id = self.id;
        self.derived_nodes(name, function, vec![id])
    }

    /// A Derived virtual field over the named sibling fields.
    pub fn derived_over(&mut self, name: &str, function: &str, closure: &[&str]) -> Result<NodeId> {
        let ids = closure
            .iter()
            .map(|n| {
                self.get(n)
                    .ok_or_else(|| Error::mismatch(format!("no field `{n}` declared yet")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.derived_nodes(name, function, ids)
    }

    fn derived_nodes(&mut self, name: &str, function: &str, closure: Vec<NodeId>) -> Result<NodeId> {
        self.check_unique(name)?;
        let span = SourceSpan::empty_at(self.cursor.source().id(), self.cursor.position());
        let node = Node::new(span, NodeKind::Derived(crate::tree::DerivedNode::new(function, closure)));
        let id = self.out.tree.push(node);
        self.fields.push((name.to_string(), id));
        Ok(id)
    }
}

/// Element-by-element construction of one sequence node.
pub struct SequenceScope<'s> {
    out: &'s mut Decoding,
    cursor: &'s mut BitCursor,
    ctx: &'s DecodeContext,
    id: NodeId,
    items: Vec<NodeId>,
    poison: Option<Poison>,
}

impl<'s> SequenceScope<'s> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cursor(&self) -> &BitCursor {
        &*self.cursor
    }

    pub fn ctx(&self) -> &DecodeContext {
        self.ctx
    }

    pub fn tree(&self) -> &ValueTree {
        &self.out.tree
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// An earlier element failed without a known extent; nothing more can be placed.
    pub fn is_poisoned(&self) -> bool {
        self.poison.is_some()
    }

    pub fn element(&mut self, decoder: &dyn Decoder) -> Result<Outcome> {
        let ctx = self.ctx;
        self.element_in(ctx, decoder)
    }

    pub fn element_in(&mut self, ctx: &DecodeContext, decoder: &dyn Decoder) -> Result<Outcome> {
        let index = self.items.len();
        let outcome = self.out.run_child(
            &mut *self.cursor,
            Some(PathSegment::Index(index)),
            decoder.recovery(),
            decoder.extent(ctx),
            &mut self.poison,
            |c, out| decoder.decode(c, ctx, out),
        )?;
        self.items.push(outcome.id());
        Ok(outcome)
    }

    /// An element struct declared inline.
    pub fn struct_element<F>(&mut self, tag: Option<&str>, body: F) -> Result<Outcome>
    where
        F: FnOnce(&mut StructScope<'_>) -> Result<()>,
    {
        let index = self.items.len();
        let ctx = self.ctx;
        let outcome = self.out.run_child(
            &mut *self.cursor,
            Some(PathSegment::Index(index)),
            Recovery::Recoverable,
            None,
            &mut self.poison,
            |c, out| out.decode_struct(c, ctx, tag, body),
        )?;
        self.items.push(outcome.id());
        Ok(outcome)
    }

    /// Exactly `n` elements, stopping early once nothing more can be placed.
    pub fn repeat(&mut self, n: u64, decoder: &dyn Decoder) -> Result<()> {
        for _ in 0..n {
            let before = self.cursor.position();
            let outcome = self.element(decoder)?;
            if self.is_poisoned() {
                break;
            }
            if self.cursor.position() != before {
                continue;
            }
            // A zero-width element with input left would repeat up to `n` times.
            if outcome.is_decoded() && !self.cursor.is_empty() {
                self.fail_rest(Error::corrupt(before, "sequence element consumed no input"))?;
            }
            break;
        }
        Ok(())
    }

    /// Elements until the region is exhausted.
    pub fn until_end(&mut self, decoder: &dyn Decoder) -> Result<()> {
        self.until(|c| c.is_empty(), decoder)
    }

    /// Elements until `stop` returns true for the cursor (checked before each element)
    /// or the region is exhausted.
    pub fn until<P>(&mut self, mut stop: P, decoder: &dyn Decoder) -> Result<()>
    where
        P: FnMut(&BitCursor) -> bool,
    {
        while !self.cursor.is_empty() && !stop(&*self.cursor) && !self.is_poisoned() {
            let before = self.cursor.position();
            self.element(decoder)?;
            // A zero-width element would repeat forever.
            if self.cursor.position() == before && !self.is_poisoned() {
                self.fail_rest(Error::corrupt(before, "sequence element consumed no input"))?;
            }
        }
        Ok(())
    }

    /// The rest of the region becomes one ErrorNode element.
    pub fn fail_rest(&mut self, err: Error) -> Result<NodeId> {
        let index = self.items.len();
        let kind = err.kind();
        let id = self
            .out
            .capture_rest(&mut *self.cursor, PathSegment::Index(index), &err)?;
        self.items.push(id);
        self.poison = Some(Poison {
            kind,
            reason: format!("element [{index}] was corrupt"),
        });
        Ok(id)
    }
}
