//! # bitscope: reflective bit-level decode/encode engine
//!
//! Decodes arbitrary binary files into a format-agnostic, editable Value Tree in
//! which every datum knows the exact bits it came from, and encodes the tree back.
//!
//! ## Pieces
//!
//! - **Bit Source / Cursor**: immutable, shareable input (`BitSource`) read through
//!   bounded, cheaply cloned cursors (`BitCursor`). Bits are numbered MSB-first.
//! - **Value Tree**: an arena of `Leaf`, `Struct`, `Sequence`, `ErrorNode` and
//!   `Derived` nodes, each with a `SourceSpan` into its source.
//! - **Decoder protocol**: format plug-ins implement `Decoder`; struct and sequence
//!   scopes turn a failing child into an `ErrorNode` instead of failing the file.
//! - **Encoder protocol**: `TreeEncoder` writes edited values, copies ErrorNode bits
//!   verbatim and patches size/count/offset prefixes.
//! - **Derivation registry**: cached, lazily evaluated derived values (checksums,
//!   decompressed payloads) invalidated by edits to the data they read.
//!
//! ## Example
//!
//! ```
//! use bitscope::{decode, encode, prim, BitSource, DecodeContext, Decoding, BitCursor, NodeId, Result};
//!
//! fn header(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
//!     out.decode_struct(c, ctx, Some("demo.header"), |s| {
//!         s.field("magic", &prim::magic(&b"DEMO"[..]))?;
//!         s.field("len", &prim::u16().little_endian())?;
//!         let len = s.uint("len").unwrap_or(0);
//!         s.field("data", &prim::bytes(len))?;
//!         s.length_of("len", "data", 8)
//!     })
//! }
//!
//! let src = BitSource::new(b"DEMO\x03\x00abc".to_vec());
//! let out = decode(&src, &bitscope::decode::from_fn(header));
//! assert!(out.is_clean());
//! let data = out.tree.lookup("data").unwrap();
//! assert_eq!(out.tree.node(data).unwrap().span().len(), 24);
//! assert_eq!(encode(&out.tree, None).unwrap().to_bytes(), b"DEMO\x03\x00abc");
//! ```

pub mod bits;
pub mod cursor;
pub mod decode;
pub mod derive;
pub mod dump;
pub mod encode;
pub mod error;
pub mod format;
pub mod prim;
pub mod source;
pub mod tree;
pub mod value;

pub use bits::{BitSink, Bits};
pub use cursor::BitCursor;
pub use decode::{
    decode, decode_span, decode_with, DecodeContext, DecodeOptions, Decoded, Decoder, DecoderExt, Decoding,
    Outcome, Recovery, SequenceScope, StructScope,
};
pub use derive::{Derivation, DerivationRegistry, DerivedValue, Patch, PatchOp, SubtreeView};
pub use dump::{dump, DumpOptions};
pub use encode::{encode, encode_node, encode_with, Encoder, Encoding, TreeEncoder};
pub use error::{Diagnostic, Error, ErrorKind, PathSegment, Result};
pub use format::{Format, FormatRegistry};
pub use source::{BitSource, SourceId, SourceSpan};
pub use tree::{Link, Measure, Node, NodeId, NodeKind, SharedTree, ValueTree};
pub use value::{enum_names, Endianness, LeafType, Value};
