//! Installed format plug-ins, looked up by identifier.

use crate::bits::Bits;
use crate::decode::{decode_with, DecodeContext, DecodeOptions, Decoded, Decoder};
use crate::derive::DerivationRegistry;
use crate::encode::{encode_with, Encoder, TreeEncoder};
use crate::error::Result;
use crate::source::BitSource;
use crate::tree::ValueTree;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub type SharedDecoder = Arc<dyn Decoder + Send + Sync>;
pub type SharedEncoder = Arc<dyn Encoder + Send + Sync>;

/// A decoder/encoder pair with the context it decodes under.
#[derive(Clone)]
pub struct Format {
    id: String,
    decoder: SharedDecoder,
    encoder: SharedEncoder,
    context: DecodeContext,
    options: DecodeOptions,
}

impl Format {
    /// A format encoded with the default tree rules.
    pub fn new<D>(id: impl Into<String>, decoder: D) -> Self
    where
        D: Decoder + Send + Sync + 'static,
    {
        Format {
            id: id.into(),
            decoder: Arc::new(decoder),
            encoder: Arc::new(TreeEncoder),
            context: DecodeContext::default(),
            options: DecodeOptions::default(),
        }
    }

    pub fn with_encoder<E>(mut self, encoder: E) -> Self
    where
        E: Encoder + Send + Sync + 'static,
    {
        self.encoder = Arc::new(encoder);
        self
    }

    pub fn with_context(mut self, context: DecodeContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn decoder(&self) -> &SharedDecoder {
        &self.decoder
    }

    pub fn encoder(&self) -> &SharedEncoder {
        &self.encoder
    }

    pub fn context(&self) -> &DecodeContext {
        &self.context
    }

    pub fn decode(&self, source: &BitSource) -> Decoded {
        debug!(format = %self.id, source = %source.id(), bits = source.len_bits(), "decoding");
        decode_with(source, &*self.decoder, &self.context, self.options)
    }

    pub fn encode(&self, tree: &ValueTree, registry: Option<&DerivationRegistry>) -> Result<Bits> {
        encode_with(tree, tree.root(), &*self.encoder, registry)
    }
}

impl fmt::Debug for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Format")
            .field("id", &self.id)
            .field("context", &self.context)
            .finish()
    }
}

/// Formats by exact identifier.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<Format>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        FormatRegistry::default()
    }

    /// Install a format; returns the one previously registered under its id.
    pub fn register(&mut self, format: Format) -> Option<Arc<Format>> {
        self.formats.insert(format.id.clone(), Arc::new(format))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Format>> {
        self.formats.get(id).cloned()
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<Format>> {
        self.formats.remove(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.formats.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}
