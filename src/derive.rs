//! Lazily evaluated, cached derived values.
//!
//! A Derived node names a registered function and the nodes it reads (its
//! closure). [`DerivationRegistry::evaluate`] computes the value on first access
//! and caches it next to the node together with the version stamps of the
//! closure. Any edit inside the closure bumps one of those stamps, so the next
//! access recomputes. Failures are cached like successes: a function that
//! cannot handle its input is reported once per tree state.
//!
//! Evaluation takes the node's cache lock for the duration of the call. A
//! derivation function must therefore not evaluate its own node.

use crate::bits::Bits;
use crate::encode::encode_node;
use crate::error::{Error, Result};
use crate::tree::{DerivedCache, DerivedNode, NodeId, NodeKind, ValueTree};
use crate::value::{LeafType, Value};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a derivation: a plain value (a checksum) or a whole tree (a
/// decompressed payload decoded with another format).
#[derive(Debug, Clone)]
pub enum DerivedValue {
    Value(Value),
    Tree(ValueTree),
}

impl DerivedValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            DerivedValue::Value(v) => Some(v),
            DerivedValue::Tree(_) => None,
        }
    }

    pub fn as_tree(&self) -> Option<&ValueTree> {
        match self {
            DerivedValue::Tree(t) => Some(t),
            DerivedValue::Value(_) => None,
        }
    }
}

impl From<Value> for DerivedValue {
    fn from(v: Value) -> Self {
        DerivedValue::Value(v)
    }
}

impl From<ValueTree> for DerivedValue {
    fn from(t: ValueTree) -> Self {
        DerivedValue::Tree(t)
    }
}

/// Read-only window a derivation function sees: the tree and its closure.
#[derive(Clone, Copy)]
pub struct SubtreeView<'t> {
    tree: &'t ValueTree,
    closure: &'t [NodeId],
    function: &'t str,
}

impl<'t> SubtreeView<'t> {
    pub fn tree(&self) -> &'t ValueTree {
        self.tree
    }

    pub fn closure(&self) -> &'t [NodeId] {
        self.closure
    }

    /// First closure member; for struct-level derivations, the struct itself.
    pub fn root(&self) -> Option<NodeId> {
        self.closure.first().copied()
    }

    /// A closure member named `name` in its parent, or else a field `name` of a
    /// struct closure member.
    pub fn field(&self, name: &str) -> Option<NodeId> {
        self.closure
            .iter()
            .copied()
            .find(|id| self.name_of(*id) == Some(name))
            .or_else(|| self.closure.iter().find_map(|id| self.tree.field(*id, name)))
    }

    fn name_of(&self, id: NodeId) -> Option<&'t str> {
        let parent = self.tree.get(id)?.parent()?;
        self.tree
            .get(parent)?
            .as_struct()?
            .fields()
            .find(|(_, c)| *c == id)
            .map(|(n, _)| n)
    }

    /// Error attributed to the function being evaluated.
    pub fn error(&self, message: impl Into<String>) -> Error {
        Error::derivation(self.function, message)
    }

    fn require(&self, name: &str) -> Result<NodeId> {
        self.field(name)
            .ok_or_else(|| self.error(format!("no field `{name}` in closure")))
    }

    pub fn value(&self, name: &str) -> Result<&'t Value> {
        let id = self.require(name)?;
        self.tree
            .value(id)
            .ok_or_else(|| self.error(format!("field `{name}` is not a leaf")))
    }

    pub fn uint(&self, name: &str) -> Result<u64> {
        self.value(name)?
            .as_u64()
            .ok_or_else(|| self.error(format!("field `{name}` is not an integer")))
    }

    pub fn bytes(&self, name: &str) -> Result<&'t Bytes> {
        self.value(name)?
            .as_bytes()
            .ok_or_else(|| self.error(format!("field `{name}` is not a byte array")))
    }

    /// The current encoding of a field, reflecting edits.
    pub fn encoded(&self, name: &str) -> Result<Bits> {
        encode_node(self.tree, self.require(name)?, None)
    }
}

/// One edit produced by an inverse function.
#[derive(Debug, Clone)]
pub enum PatchOp {
    SetValue {
        node: NodeId,
        value: Value,
    },
    ReplaceLeaf {
        node: NodeId,
        ty: LeafType,
        width: u64,
        value: Value,
    },
    Replace {
        node: NodeId,
        fragment: ValueTree,
    },
}

/// Edits that make the tree agree with a new derived value.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new() -> Self {
        Patch::default()
    }

    pub fn set_value(mut self, node: NodeId, value: Value) -> Self {
        self.ops.push(PatchOp::SetValue { node, value });
        self
    }

    pub fn replace_leaf(mut self, node: NodeId, ty: LeafType, width: u64, value: Value) -> Self {
        self.ops.push(PatchOp::ReplaceLeaf { node, ty, width, value });
        self
    }

    pub fn replace(mut self, node: NodeId, fragment: ValueTree) -> Self {
        self.ops.push(PatchOp::Replace { node, fragment });
        self
    }

    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply every op in order. All ops are validated first, so a rejected patch
    /// leaves the tree untouched.
    pub fn apply(self, tree: &mut ValueTree) -> Result<()> {
        enum Ready {
            Set(NodeId, Value),
            Replace(NodeId, ValueTree),
        }
        let mut ready = Vec::with_capacity(self.ops.len());
        for op in self.ops {
            match op {
                PatchOp::SetValue { node, value } => {
                    let leaf = tree.node(node)?.as_leaf().ok_or_else(|| {
                        Error::mismatch(format!("patch sets a value on non-leaf {node}"))
                    })?;
                    leaf.ty().check(&value, leaf.width())?;
                    ready.push(Ready::Set(node, value));
                }
                PatchOp::ReplaceLeaf { node, ty, width, value } => {
                    tree.node(node)?;
                    ready.push(Ready::Replace(node, ValueTree::leaf_fragment(ty, width, value)?));
                }
                PatchOp::Replace { node, fragment } => {
                    tree.node(node)?;
                    fragment.node(fragment.root())?;
                    ready.push(Ready::Replace(node, fragment));
                }
            }
        }
        for op in ready {
            match op {
                Ready::Set(node, value) => tree.set_value(node, value)?,
                Ready::Replace(node, fragment) => tree.replace_subtree(node, &fragment, fragment.root())?,
            }
        }
        Ok(())
    }
}

type DeriveFn = dyn Fn(&SubtreeView<'_>) -> Result<DerivedValue> + Send + Sync;
type InverseFn = dyn Fn(&SubtreeView<'_>, &DerivedValue) -> Result<Patch> + Send + Sync;

/// A named derivation function, optionally invertible.
#[derive(Clone)]
pub struct Derivation {
    name: String,
    function: Arc<DeriveFn>,
    inverse: Option<Arc<InverseFn>>,
}

impl Derivation {
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&SubtreeView<'_>) -> Result<DerivedValue> + Send + Sync + 'static,
    {
        Derivation {
            name: name.into(),
            function: Arc::new(function),
            inverse: None,
        }
    }

    /// Map a new derived value back to edits of the closure.
    pub fn with_inverse<G>(mut self, inverse: G) -> Self
    where
        G: Fn(&SubtreeView<'_>, &DerivedValue) -> Result<Patch> + Send + Sync + 'static,
    {
        self.inverse = Some(Arc::new(inverse));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_inverse(&self) -> bool {
        self.inverse.is_some()
    }
}

impl fmt::Debug for Derivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derivation")
            .field("name", &self.name)
            .field("invertible", &self.has_inverse())
            .finish()
    }
}

/// Derivation functions by name, plus which struct tags get which derived fields.
#[derive(Debug, Clone, Default)]
pub struct DerivationRegistry {
    functions: HashMap<String, Derivation>,
    bindings: HashMap<String, Vec<(String, String)>>,
}

impl DerivationRegistry {
    pub fn new() -> Self {
        DerivationRegistry::default()
    }

    /// Register a function; returns the one it replaced, if any.
    pub fn register(&mut self, derivation: Derivation) -> Option<Derivation> {
        self.functions.insert(derivation.name.clone(), derivation)
    }

    pub fn get(&self, name: &str) -> Option<&Derivation> {
        self.functions.get(name)
    }

    /// Structs tagged `tag` get a derived field `field` computed by `function`
    /// over the whole struct, once [`attach`](Self::attach) runs.
    pub fn bind(&mut self, tag: impl Into<String>, field: impl Into<String>, function: impl Into<String>) {
        self.bindings
            .entry(tag.into())
            .or_default()
            .push((field.into(), function.into()));
    }

    /// `(field, function)` pairs bound to `tag`.
    pub fn functions_for<'a>(&'a self, tag: &str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.bindings
            .get(tag)
            .into_iter()
            .flatten()
            .map(|(f, g)| (f.as_str(), g.as_str()))
    }

    /// Place the bound derived fields on every tagged struct of `tree` that lacks
    /// them. Returns how many were added.
    pub fn attach(&self, tree: &mut ValueTree) -> Result<usize> {
        let mut added = 0;
        for id in tree.descendants(tree.root()) {
            let Some(node) = tree.get(id) else { continue };
            let (Some(tag), Some(s)) = (node.tag(), node.as_struct()) else { continue };
            let missing: Vec<(String, String)> = self
                .functions_for(tag)
                .filter(|(field, _)| s.get(field).is_none())
                .map(|(f, g)| (f.to_string(), g.to_string()))
                .collect();
            for (field, function) in missing {
                tree.attach_derived(id, &field, &function, vec![id])?;
                added += 1;
            }
        }
        debug!(added, "attached derived fields");
        Ok(added)
    }

    fn resolve<'t>(&self, tree: &'t ValueTree, id: NodeId) -> Result<(&'t DerivedNode, &Derivation)> {
        let node = tree.node(id)?;
        let NodeKind::Derived(d) = node.kind() else {
            return Err(Error::mismatch(format!("{id} is a {}, not a derived field", node.kind().name())));
        };
        let f = self
            .get(d.function())
            .ok_or_else(|| Error::derivation(d.function(), "function is not registered"))?;
        if d.closure().is_empty() || d.closure().iter().any(|c| tree.get(*c).is_none()) {
            return Err(Error::derivation(d.function(), "closure refers to removed nodes"));
        }
        Ok((d, f))
    }

    /// The derived value at `id`, computed at most once per state of its closure.
    pub fn evaluate(&self, tree: &ValueTree, id: NodeId) -> Result<Arc<DerivedValue>> {
        let (d, f) = self.resolve(tree, id)?;
        let stamp = tree.stamp(d.closure());
        let mut cache = d.cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.stamp == stamp {
                return cached.result.clone();
            }
        }
        let view = SubtreeView {
            tree,
            closure: d.closure(),
            function: d.function(),
        };
        let result = (f.function)(&view).map(Arc::new).map_err(|e| match e {
            Error::Derivation { .. } => e,
            other => Error::derivation(d.function(), other.to_string()),
        });
        if let Err(e) = &result {
            warn!(node = %id, function = d.function(), "derived value failed: {}", e);
        }
        *cache = Some(DerivedCache {
            stamp,
            result: result.clone(),
        });
        result
    }

    /// Make the tree agree with a new value for the derived field at `id`.
    /// Fails with `NotEncodable` when the function has no inverse.
    pub fn write_back(&self, tree: &mut ValueTree, id: NodeId, value: &DerivedValue) -> Result<()> {
        let patch = {
            let (d, f) = self.resolve(tree, id)?;
            let inverse = f.inverse.as_ref().ok_or_else(|| {
                Error::NotEncodable(format!("derived field {id} (`{}`) has no inverse", d.function()))
            })?;
            let view = SubtreeView {
                tree,
                closure: d.closure(),
                function: d.function(),
            };
            inverse(&view, value)?
        };
        debug!(node = %id, ops = patch.ops().len(), "applying inverse patch");
        patch.apply(tree)
    }
}
