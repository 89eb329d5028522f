//! The reflective Value Tree: an arena of nodes addressed by [`NodeId`].
//!
//! Parents hold the ids of their children; back-references (a node's parent, a
//! Derived node's closure, a link's endpoints) are plain ids, so the tree is
//! acyclic by construction and is dropped as a whole. Removed nodes leave
//! tombstones: a stale id answers `None` instead of aliasing another node.
//!
//! Every node carries a version stamp. An edit bumps the stamp of the edited
//! node and of all its ancestors; Derived caches compare the stamps of their
//! closure to decide whether they are stale.

use crate::bits::{BitSink, Bits};
use crate::derive::DerivedValue;
use crate::error::{Error, ErrorKind, PathSegment, Result};
use crate::source::{BitSource, SourceSpan};
use crate::value::{LeafType, Value};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Index of a node in its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(i: usize) -> Self {
        NodeId(i as u32)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Raw bits of known width plus their interpretation.
#[derive(Debug, Clone)]
pub struct Leaf {
    raw: Bits,
    value: Value,
    ty: LeafType,
    width: u64,
}

impl Leaf {
    pub fn new(raw: Bits, value: Value, ty: LeafType) -> Self {
        let width = raw.len();
        Leaf { raw, value, ty, width }
    }

    /// The bits as decoded; not updated by edits.
    pub fn raw(&self) -> &Bits {
        &self.raw
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn ty(&self) -> &LeafType {
        &self.ty
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    /// Write the leaf in its declared width. A string still equal to its decoded
    /// text keeps the decoded bytes, padding after the NUL included.
    pub fn encode(&self, sink: &mut BitSink) -> Result<()> {
        if matches!(self.ty, LeafType::Str)
            && self.raw.len() == self.width
            && self.ty.interpret(&self.raw, 0).is_ok_and(|v| v == self.value)
        {
            sink.write_bits(&self.raw);
            return Ok(());
        }
        self.ty.encode(&self.value, self.width, sink)
    }
}

/// Named fields in declaration order.
#[derive(Debug, Clone, Default)]
pub struct StructNode {
    fields: Vec<(String, NodeId)>,
    padding: Bits,
}

impl StructNode {
    pub fn fields(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.fields.iter().map(|(n, id)| (n.as_str(), *id))
    }

    pub fn get(&self, name: &str) -> Option<NodeId> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bits of the declared region left after the last field, written back after it.
    pub fn padding(&self) -> &Bits {
        &self.padding
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequenceNode {
    items: Vec<NodeId>,
    padding: Bits,
}

impl SequenceNode {
    pub fn items(&self) -> &[NodeId] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bits of the declared region left after the last element.
    pub fn padding(&self) -> &Bits {
        &self.padding
    }
}

/// A region that failed to decode: diagnostic plus the flat raw capture.
#[derive(Debug, Clone)]
pub struct ErrorNode {
    kind: ErrorKind,
    message: String,
    raw: Bits,
}

impl ErrorNode {
    pub fn new(kind: ErrorKind, message: impl Into<String>, raw: Bits) -> Self {
        ErrorNode {
            kind,
            message: message.into(),
            raw,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn raw(&self) -> &Bits {
        &self.raw
    }
}

pub(crate) struct DerivedCache {
    pub(crate) stamp: Vec<Option<u64>>,
    pub(crate) result: Result<Arc<DerivedValue>>,
}

/// Placeholder bound to a registered derivation function and the nodes it reads.
pub struct DerivedNode {
    function: String,
    closure: Vec<NodeId>,
    pub(crate) cache: Mutex<Option<DerivedCache>>,
}

impl DerivedNode {
    pub fn new(function: impl Into<String>, closure: Vec<NodeId>) -> Self {
        DerivedNode {
            function: function.into(),
            closure,
            cache: Mutex::new(None),
        }
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn closure(&self) -> &[NodeId] {
        &self.closure
    }
}

impl Clone for DerivedNode {
    // Copies start with an empty cache.
    fn clone(&self) -> Self {
        DerivedNode::new(self.function.clone(), self.closure.clone())
    }
}

impl fmt::Debug for DerivedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedNode")
            .field("function", &self.function)
            .field("closure", &self.closure)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Leaf(Leaf),
    Struct(StructNode),
    Sequence(SequenceNode),
    Error(ErrorNode),
    Derived(DerivedNode),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Leaf(_) => "leaf",
            NodeKind::Struct(_) => "struct",
            NodeKind::Sequence(_) => "sequence",
            NodeKind::Error(_) => "error",
            NodeKind::Derived(_) => "derived",
        }
    }

    fn children(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Struct(s) => s.fields.iter().map(|(_, id)| *id).collect(),
            NodeKind::Sequence(q) => q.items.clone(),
            _ => Vec::new(),
        }
    }

    fn remap(&mut self, map: &HashMap<NodeId, NodeId>) {
        match self {
            NodeKind::Struct(s) => {
                s.fields.retain_mut(|(_, id)| match map.get(id) {
                    Some(new) => {
                        *id = *new;
                        true
                    }
                    None => false,
                });
            }
            NodeKind::Sequence(q) => {
                q.items = q.items.iter().filter_map(|id| map.get(id).copied()).collect();
            }
            NodeKind::Derived(d) => {
                // Closure members outside the copied subtree cannot follow the copy.
                d.closure = d.closure.iter().filter_map(|id| map.get(id).copied()).collect();
            }
            NodeKind::Leaf(_) | NodeKind::Error(_) => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    parent: Option<NodeId>,
    tag: Option<Arc<str>>,
    span: SourceSpan,
    kind: NodeKind,
    version: u64,
}

impl Node {
    pub fn new(span: SourceSpan, kind: NodeKind) -> Self {
        Node {
            parent: None,
            tag: None,
            span,
            kind,
            version: 0,
        }
    }

    pub fn tagged(mut self, tag: Option<&str>) -> Self {
        self.tag = tag.map(Arc::from);
        self
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Format/type tag assigned by the decoder, e.g. `zip.local_file`.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn span(&self) -> SourceSpan {
        self.span
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn as_leaf(&self) -> Option<&Leaf> {
        match &self.kind {
            NodeKind::Leaf(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructNode> {
        match &self.kind {
            NodeKind::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&SequenceNode> {
        match &self.kind {
            NodeKind::Sequence(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorNode> {
        match &self.kind {
            NodeKind::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_derived(&self) -> Option<&DerivedNode> {
        match &self.kind {
            NodeKind::Derived(d) => Some(d),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, NodeKind::Error(_))
    }
}

/// What a link's integer field measures about its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    /// Encoded size of the target in units of `unit_bits`.
    Length { unit_bits: u64 },
    /// Number of elements of a sequence target.
    Count,
    /// Start of the target relative to the start of `base`, in units of `unit_bits`.
    Offset { unit_bits: u64, base: NodeId },
}

/// A size/count/offset prefix that the encoder keeps consistent with its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    field: NodeId,
    target: NodeId,
    measure: Measure,
    original: u64,
}

impl Link {
    pub fn field(&self) -> NodeId {
        self.field
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn measure(&self) -> Measure {
        self.measure
    }

    /// Measurement observed when the link was declared (bits for length/offset).
    pub fn original(&self) -> u64 {
        self.original
    }

    fn nodes(&self) -> impl Iterator<Item = NodeId> {
        let base = match self.measure {
            Measure::Offset { base, .. } => Some(base),
            _ => None,
        };
        [self.field, self.target].into_iter().chain(base)
    }
}

/// Decoded representation of one input: an arena of nodes plus links.
#[derive(Debug, Clone)]
pub struct ValueTree {
    nodes: Vec<Option<Node>>,
    root: NodeId,
    links: Vec<Link>,
    clock: u64,
}

impl ValueTree {
    pub(crate) fn empty() -> Self {
        ValueTree {
            nodes: Vec::new(),
            root: NodeId(0),
            links: Vec::new(),
            clock: 0,
        }
    }

    /// A one-leaf tree whose span points at a fresh source holding the encoded value.
    ///
    /// This is how new material enters a tree: build a fragment, then
    /// [`replace_subtree`](Self::replace_subtree) or [`insert_element`](Self::insert_element).
    pub fn leaf_fragment(ty: LeafType, width: u64, value: Value) -> Result<ValueTree> {
        let mut sink = BitSink::new();
        ty.encode(&value, width, &mut sink)?;
        let source = BitSource::from_bits(&sink.into_bits());
        let raw = source.read(0, width)?;
        let mut tree = ValueTree::empty();
        let leaf = Leaf { raw, value, ty, width };
        let root = tree.push(Node::new(source.span(), NodeKind::Leaf(leaf)));
        tree.root = root;
        Ok(tree)
    }

    // ── construction (decode side) ────────────────────────────────────────────

    pub(crate) fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Some(node));
        id
    }

    pub(crate) fn mark(&self) -> usize {
        self.nodes.len()
    }

    /// Drop every node allocated at or after `mark`, together with links touching them.
    pub(crate) fn truncate(&mut self, mark: usize) {
        self.nodes.truncate(mark);
        self.links.retain(|l| l.nodes().all(|id| id.index() < mark));
    }

    pub(crate) fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub(crate) fn adopt(&mut self, parent: NodeId, child: NodeId) {
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
    }

    pub(crate) fn finish_struct(&mut self, id: NodeId, span: SourceSpan, fields: Vec<(String, NodeId)>) {
        for (_, child) in &fields {
            self.adopt(id, *child);
        }
        if let Some(node) = self.node_mut(id) {
            node.span = span;
            node.kind = NodeKind::Struct(StructNode {
                fields,
                padding: Bits::new(),
            });
        }
    }

    pub(crate) fn finish_sequence(&mut self, id: NodeId, span: SourceSpan, items: Vec<NodeId>) {
        for child in &items {
            self.adopt(id, *child);
        }
        if let Some(node) = self.node_mut(id) {
            node.span = span;
            node.kind = NodeKind::Sequence(SequenceNode {
                items,
                padding: Bits::new(),
            });
        }
    }

    /// Attach the unread tail of a declared region to the aggregate `id` and
    /// widen its span to `end`. Returns false when `id` is not a struct or sequence.
    pub(crate) fn pad(&mut self, id: NodeId, raw: Bits, end: u64) -> bool {
        let Some(node) = self.node_mut(id) else { return false };
        match &mut node.kind {
            NodeKind::Struct(StructNode { padding, .. }) | NodeKind::Sequence(SequenceNode { padding, .. }) => {
                *padding = raw;
            }
            _ => return false,
        }
        node.span = SourceSpan::new(node.span.source(), node.span.start(), end);
        true
    }

    /// Cut the raw capture of ErrorNode `id` back to end at bit `end`.
    pub(crate) fn shrink_error(&mut self, id: NodeId, end: u64) -> Result<()> {
        let node = self.node_mut(id).ok_or(Error::InvalidNode(id))?;
        let (start, old_end) = (node.span.start(), node.span.end());
        if end < start || end > old_end {
            return Err(Error::OutOfRange {
                position: end,
                requested: 0,
                available: old_end.saturating_sub(start),
            });
        }
        let kind = node.kind.name();
        let NodeKind::Error(e) = &mut node.kind else {
            return Err(Error::mismatch(format!("{id} is a {kind}, not an error")));
        };
        e.raw = e
            .raw
            .slice(0, end - start)
            .ok_or_else(|| Error::mismatch(format!("{id} holds fewer raw bits than its span")))?;
        node.span = SourceSpan::new(node.span.source(), start, end);
        Ok(())
    }

    // ── read access ──────────────────────────────────────────────────────────

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id).ok_or(Error::InvalidNode(id))
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field of a struct node by exact name.
    pub fn field(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.get(id)?.as_struct()?.get(name)
    }

    pub fn element(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.get(id)?.as_sequence()?.items.get(index).copied()
    }

    /// Resolve a path such as `header.entries[2].name` from the root. The empty path is the root.
    pub fn lookup(&self, path: &str) -> Option<NodeId> {
        let mut at = self.root;
        if path.is_empty() {
            return self.get(at).map(|_| at);
        }
        for part in path.split('.') {
            if part.is_empty() {
                return None;
            }
            let (name, mut rest) = match part.find('[') {
                Some(i) => (&part[..i], &part[i..]),
                None => (part, ""),
            };
            if !name.is_empty() {
                at = self.field(at, name)?;
            }
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped.find(']')?;
                let index: usize = stripped[..close].parse().ok()?;
                at = self.element(at, index)?;
                rest = &stripped[close + 1..];
            }
            if !rest.is_empty() {
                return None;
            }
        }
        Some(at)
    }

    /// Layout children: struct fields in order, or sequence elements.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id).map(|n| n.kind.children()).unwrap_or_default()
    }

    /// `id` and everything below it, pre-order.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if self.get(next).is_none() {
                continue;
            }
            out.push(next);
            let mut kids = self.children(next);
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// Field names and indices from the root down to `id`.
    pub fn path_of(&self, id: NodeId) -> Vec<PathSegment> {
        let mut segs = Vec::new();
        let mut at = id;
        while let Some(parent) = self.get(at).and_then(Node::parent) {
            match self.get(parent).map(Node::kind) {
                Some(NodeKind::Struct(s)) => {
                    if let Some((name, _)) = s.fields.iter().find(|(_, c)| *c == at) {
                        segs.push(PathSegment::Field(name.clone()));
                    }
                }
                Some(NodeKind::Sequence(q)) => {
                    if let Some(i) = q.items.iter().position(|c| *c == at) {
                        segs.push(PathSegment::Index(i));
                    }
                }
                _ => {}
            }
            at = parent;
        }
        segs.reverse();
        segs
    }

    pub fn value(&self, id: NodeId) -> Option<&Value> {
        self.get(id)?.as_leaf().map(Leaf::value)
    }

    pub fn uint(&self, id: NodeId) -> Option<u64> {
        self.value(id)?.as_u64()
    }

    /// All live ErrorNodes, in allocation order.
    pub fn error_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, n)| match n {
            Some(node) if node.is_error() => Some(NodeId::from_index(i)),
            _ => None,
        })
    }

    /// Nodes whose span escapes their parent's span. Parents and children over
    /// different sources (material inserted by edits) are not compared.
    pub fn span_violations(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            let Some(parent) = node.parent.and_then(|p| self.get(p)) else { continue };
            if parent.span.source() == node.span.source() && !parent.span.contains(&node.span) {
                out.push(NodeId::from_index(i));
            }
        }
        out
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Current version stamps of `ids`; `None` for removed nodes.
    pub(crate) fn stamp(&self, ids: &[NodeId]) -> Vec<Option<u64>> {
        ids.iter().map(|id| self.get(*id).map(|n| n.version)).collect()
    }

    /// Whether a Derived node has no cached result for the current state of its closure.
    pub fn is_stale(&self, id: NodeId) -> bool {
        let Some(d) = self.get(id).and_then(Node::as_derived) else {
            return false;
        };
        let stamp = self.stamp(&d.closure);
        match d.cache.lock().as_ref() {
            Some(cached) => cached.stamp != stamp,
            None => true,
        }
    }

    // ── links and derived fields ─────────────────────────────────────────────

    /// Declare that the integer leaf `field` measures `target`.
    pub fn add_link(&mut self, field: NodeId, target: NodeId, measure: Measure) -> Result<()> {
        let f = self.node(field)?;
        match f.as_leaf().map(Leaf::ty) {
            Some(LeafType::UInt(_)) => {}
            _ => {
                return Err(Error::mismatch(format!(
                    "link field {field} must be an unsigned integer leaf"
                )))
            }
        }
        let t = self.node(target)?;
        let original = match measure {
            Measure::Length { unit_bits } => {
                require_unit(unit_bits)?;
                t.span.len()
            }
            Measure::Count => t
                .as_sequence()
                .map(|q| q.items.len() as u64)
                .ok_or_else(|| Error::mismatch(format!("count target {target} is not a sequence")))?,
            Measure::Offset { unit_bits, base } => {
                require_unit(unit_bits)?;
                let b = self.node(base)?;
                if b.span.source() != t.span.source() || t.span.start() < b.span.start() {
                    return Err(Error::mismatch(format!(
                        "offset target {target} does not follow base {base}"
                    )));
                }
                t.span.start() - b.span.start()
            }
        };
        self.links.push(Link {
            field,
            target,
            measure,
            original,
        });
        Ok(())
    }

    /// Append a Derived virtual field to a struct node.
    pub fn attach_derived(
        &mut self,
        parent: NodeId,
        name: &str,
        function: &str,
        closure: Vec<NodeId>,
    ) -> Result<NodeId> {
        for id in &closure {
            self.node(*id)?;
        }
        let p = self.node(parent)?;
        let s = p
            .as_struct()
            .ok_or_else(|| Error::mismatch(format!("{parent} is a {}, not a struct", p.kind.name())))?;
        if s.get(name).is_some() {
            return Err(Error::mismatch(format!("struct {parent} already has a field `{name}`")));
        }
        let span = SourceSpan::empty_at(p.span.source(), p.span.end());
        let mut node = Node::new(span, NodeKind::Derived(DerivedNode::new(function, closure)));
        node.parent = Some(parent);
        let id = self.push(node);
        if let Some(NodeKind::Struct(s)) = self.node_mut(parent).map(|n| &mut n.kind) {
            s.fields.push((name.to_string(), id));
        }
        Ok(id)
    }

    // ── edits ────────────────────────────────────────────────────────────────

    /// Bump the version of `id` and all its ancestors.
    fn touch(&mut self, id: NodeId) {
        self.clock += 1;
        let clock = self.clock;
        let mut at = Some(id);
        while let Some(cur) = at {
            at = match self.node_mut(cur) {
                Some(node) => {
                    node.version = clock;
                    node.parent
                }
                None => None,
            };
        }
    }

    /// Replace a leaf's interpreted value. The leaf keeps its type and width.
    pub fn set_value(&mut self, id: NodeId, value: Value) -> Result<()> {
        let node = self.node_mut(id).ok_or(Error::InvalidNode(id))?;
        match &mut node.kind {
            NodeKind::Leaf(leaf) => {
                leaf.ty.check(&value, leaf.width)?;
                leaf.value = value;
            }
            other => {
                return Err(Error::mismatch(format!("{id} is a {}, not a leaf", other.name())));
            }
        }
        self.touch(id);
        Ok(())
    }

    /// Replace whatever is at `id` by a new leaf, possibly of another type or width.
    pub fn replace_leaf(&mut self, id: NodeId, ty: LeafType, width: u64, value: Value) -> Result<()> {
        let fragment = ValueTree::leaf_fragment(ty, width, value)?;
        self.replace_subtree(id, &fragment, fragment.root())
    }

    /// Replace the subtree at `id` by a copy of `from` in `src`. The node keeps its id.
    pub fn replace_subtree(&mut self, id: NodeId, src: &ValueTree, from: NodeId) -> Result<()> {
        let parent = self.node(id)?.parent;
        src.node(from)?;
        let old: Vec<NodeId> = self.descendants(id).into_iter().skip(1).collect();
        for dead in old {
            self.nodes[dead.index()] = None;
        }
        self.copy_in(src, from, Some(id), parent)?;
        self.touch(id);
        Ok(())
    }

    /// Insert a copy of `from` in `src` at `index` of sequence `seq`.
    pub fn insert_element(
        &mut self,
        seq: NodeId,
        index: usize,
        src: &ValueTree,
        from: NodeId,
    ) -> Result<NodeId> {
        let len = self.sequence_len(seq)?;
        if index > len {
            return Err(Error::OutOfRange {
                position: index as u64,
                requested: 1,
                available: len as u64,
            });
        }
        src.node(from)?;
        let new = self.copy_in(src, from, None, Some(seq))?;
        if let Some(NodeKind::Sequence(q)) = self.node_mut(seq).map(|n| &mut n.kind) {
            q.items.insert(index, new);
        }
        self.touch(seq);
        Ok(new)
    }

    pub fn push_element(&mut self, seq: NodeId, src: &ValueTree, from: NodeId) -> Result<NodeId> {
        let len = self.sequence_len(seq)?;
        self.insert_element(seq, len, src, from)
    }

    /// Remove element `index`; later elements shift down but keep their spans.
    pub fn remove_element(&mut self, seq: NodeId, index: usize) -> Result<()> {
        let len = self.sequence_len(seq)?;
        if index >= len {
            return Err(Error::OutOfRange {
                position: index as u64,
                requested: 1,
                available: len as u64,
            });
        }
        let removed = match self.node_mut(seq).map(|n| &mut n.kind) {
            Some(NodeKind::Sequence(q)) => q.items.remove(index),
            _ => return Err(Error::InvalidNode(seq)),
        };
        for dead in self.descendants(removed) {
            self.nodes[dead.index()] = None;
        }
        self.touch(seq);
        Ok(())
    }

    fn sequence_len(&self, seq: NodeId) -> Result<usize> {
        let node = self.node(seq)?;
        node.as_sequence()
            .map(SequenceNode::len)
            .ok_or_else(|| Error::mismatch(format!("{seq} is a {}, not a sequence", node.kind.name())))
    }

    /// Duplicate `from` (in `src`) into this arena. The copy's root goes into
    /// `slot` when given, otherwise into a fresh slot.
    fn copy_in(
        &mut self,
        src: &ValueTree,
        from: NodeId,
        slot: Option<NodeId>,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let order = src.descendants(from);
        let mut map = HashMap::with_capacity(order.len());
        for (i, old) in order.iter().enumerate() {
            let new = match (i, slot) {
                (0, Some(s)) => s,
                _ => {
                    let id = NodeId::from_index(self.nodes.len());
                    self.nodes.push(None);
                    id
                }
            };
            map.insert(*old, new);
        }
        for old in &order {
            let mut node = src.node(*old)?.clone();
            node.kind.remap(&map);
            node.parent = if *old == from {
                parent
            } else {
                node.parent.and_then(|p| map.get(&p).copied())
            };
            self.nodes[map[old].index()] = Some(node);
        }
        for link in &src.links {
            if link.nodes().all(|id| map.contains_key(&id)) {
                let measure = match link.measure {
                    Measure::Offset { unit_bits, base } => Measure::Offset {
                        unit_bits,
                        base: map[&base],
                    },
                    m => m,
                };
                self.links.push(Link {
                    field: map[&link.field],
                    target: map[&link.target],
                    measure,
                    original: link.original,
                });
            }
        }
        Ok(map[&from])
    }
}

fn require_unit(unit_bits: u64) -> Result<()> {
    if unit_bits == 0 {
        return Err(Error::mismatch("link unit must be at least one bit"));
    }
    Ok(())
}

/// A tree shared across threads under a single-writer / multiple-reader lock.
#[derive(Debug, Clone)]
pub struct SharedTree {
    inner: Arc<RwLock<ValueTree>>,
}

impl SharedTree {
    pub fn new(tree: ValueTree) -> Self {
        SharedTree {
            inner: Arc::new(RwLock::new(tree)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ValueTree> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ValueTree> {
        self.inner.write()
    }

    /// Take the tree back if this is the last handle.
    pub fn try_into_inner(self) -> std::result::Result<ValueTree, SharedTree> {
        Arc::try_unwrap(self.inner)
            .map(RwLock::into_inner)
            .map_err(|inner| SharedTree { inner })
    }
}
