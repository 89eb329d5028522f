//! Ready-made leaf decoders: integers, flags, floats, enums, byte runs, magic
//! numbers, fixed-width strings and padding.
//!
//! All of them declare their extent when it is known up front, so a failure
//! inside one of them never hides the siblings that follow.

use crate::cursor::BitCursor;
use crate::decode::{DecodeContext, Decoder, Decoding};
use crate::error::{Error, Result};
use crate::tree::NodeId;
use crate::value::{EnumNames, Endianness, LeafType};
use bytes::Bytes;

#[derive(Debug, Clone, PartialEq)]
enum ScalarKind {
    UInt,
    SInt,
    Bool,
    Float,
    Enum(EnumNames),
}

/// A fixed-width numeric leaf. Without an explicit byte order the context's is used.
#[derive(Debug, Clone, PartialEq)]
pub struct Scalar {
    width: u64,
    kind: ScalarKind,
    endianness: Option<Endianness>,
}

impl Scalar {
    fn new(width: u64, kind: ScalarKind) -> Self {
        Scalar {
            width,
            kind,
            endianness: None,
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.endianness = Some(Endianness::Big);
        self
    }

    pub fn little_endian(mut self) -> Self {
        self.endianness = Some(Endianness::Little);
        self
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn leaf_type(&self, ctx: &DecodeContext) -> LeafType {
        let e = self.endianness.unwrap_or_else(|| ctx.endianness());
        match &self.kind {
            ScalarKind::UInt => LeafType::UInt(e),
            ScalarKind::SInt => LeafType::SInt(e),
            ScalarKind::Bool => LeafType::Bool,
            ScalarKind::Float => LeafType::Float(e),
            ScalarKind::Enum(names) => LeafType::Enum(e, names.clone()),
        }
    }
}

impl Decoder for Scalar {
    fn extent(&self, _ctx: &DecodeContext) -> Option<u64> {
        Some(self.width)
    }

    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        out.read_leaf(cursor, self.width, self.leaf_type(ctx))
    }
}

pub fn uint(width: u64) -> Scalar {
    Scalar::new(width, ScalarKind::UInt)
}

pub fn u8() -> Scalar {
    uint(8)
}

pub fn u16() -> Scalar {
    uint(16)
}

pub fn u32() -> Scalar {
    uint(32)
}

pub fn u64() -> Scalar {
    uint(64)
}

pub fn sint(width: u64) -> Scalar {
    Scalar::new(width, ScalarKind::SInt)
}

/// A one-bit boolean.
pub fn flag() -> Scalar {
    Scalar::new(1, ScalarKind::Bool)
}

/// A boolean stored in `width` bits; values other than 0 and 1 are corruption.
pub fn boolean(width: u64) -> Scalar {
    Scalar::new(width, ScalarKind::Bool)
}

pub fn float32() -> Scalar {
    Scalar::new(32, ScalarKind::Float)
}

pub fn float64() -> Scalar {
    Scalar::new(64, ScalarKind::Float)
}

pub fn enumeration(width: u64, names: EnumNames) -> Scalar {
    Scalar::new(width, ScalarKind::Enum(names))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteLen {
    Fixed(u64),
    /// Taken from [`DecodeContext::length_hint`] (in bits).
    Hint,
    Rest,
}

/// A run of whole bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteArray {
    len: ByteLen,
}

/// Exactly `n` bytes.
pub fn bytes(n: u64) -> ByteArray {
    ByteArray { len: ByteLen::Fixed(n) }
}

/// As many bits as the context's length hint says.
pub fn hinted_bytes() -> ByteArray {
    ByteArray { len: ByteLen::Hint }
}

/// Everything up to the end of the enclosing region.
pub fn rest() -> ByteArray {
    ByteArray { len: ByteLen::Rest }
}

impl Decoder for ByteArray {
    fn extent(&self, ctx: &DecodeContext) -> Option<u64> {
        match self.len {
            ByteLen::Fixed(n) => n.checked_mul(8),
            ByteLen::Hint => ctx.length_hint(),
            ByteLen::Rest => None,
        }
    }

    fn decode(&self, cursor: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        let width = match self.len {
            ByteLen::Fixed(n) => n
                .checked_mul(8)
                .ok_or_else(|| Error::corrupt(cursor.position(), format!("byte count {n} is absurd")))?,
            ByteLen::Hint => ctx
                .length_hint()
                .ok_or_else(|| Error::mismatch("hinted byte array without a length hint"))?,
            ByteLen::Rest => cursor.remaining(),
        };
        out.read_leaf(cursor, width, LeafType::Bytes)
    }
}

/// A constant signature; any other content is structural corruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Magic {
    expected: Bytes,
}

pub fn magic(expected: impl Into<Bytes>) -> Magic {
    Magic {
        expected: expected.into(),
    }
}

impl Decoder for Magic {
    fn extent(&self, _ctx: &DecodeContext) -> Option<u64> {
        Some(self.expected.len() as u64 * 8)
    }

    fn decode(&self, cursor: &mut BitCursor, _ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        let start = cursor.position();
        let width = self.expected.len() as u64 * 8;
        let found = cursor.peek(width)?.to_bytes();
        if found != self.expected.as_ref() {
            return Err(Error::corrupt(
                start,
                format!("bad magic {:02x?}, expected {:02x?}", found, self.expected.as_ref()),
            ));
        }
        out.read_leaf(cursor, width, LeafType::Bytes)
    }
}

/// A NUL-padded UTF-8 string occupying exactly `n` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedStr {
    bytes: u64,
}

pub fn fixed_str(n: u64) -> FixedStr {
    FixedStr { bytes: n }
}

impl Decoder for FixedStr {
    fn extent(&self, _ctx: &DecodeContext) -> Option<u64> {
        Some(self.bytes * 8)
    }

    fn decode(&self, cursor: &mut BitCursor, _ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        out.read_leaf(cursor, self.bytes * 8, LeafType::Str)
    }
}

/// Uninterpreted bits kept verbatim: reserved fields, padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raw {
    bits: u64,
}

pub fn raw(bits: u64) -> Raw {
    Raw { bits }
}

impl Decoder for Raw {
    fn extent(&self, _ctx: &DecodeContext) -> Option<u64> {
        Some(self.bits)
    }

    fn decode(&self, cursor: &mut BitCursor, _ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        out.read_leaf(cursor, self.bits, LeafType::Raw)
    }
}

/// Padding up to the next multiple of `to` bits, kept as a raw leaf (possibly empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Align {
    to: u64,
}

pub fn align(to: u64) -> Align {
    Align { to }
}

impl Decoder for Align {
    fn decode(&self, cursor: &mut BitCursor, _ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
        let pad = match self.to {
            0 => 0,
            to => (to - cursor.position() % to) % to,
        };
        out.read_leaf(cursor, pad, LeafType::Raw)
    }
}
