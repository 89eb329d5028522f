//! Immutable bit sources and the spans that point into them.

use crate::bits::Bits;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle of one [`BitSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    fn fresh() -> Self {
        SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A read-only, randomly addressable run of bits.
///
/// Cloning is O(1) and the source is `Send + Sync`; any number of cursors in any
/// number of threads may read it at once. How the bytes were obtained (a file, a
/// memory map via `Bytes::from_owner`, a network buffer) is up to the caller.
#[derive(Clone)]
pub struct BitSource {
    id: SourceId,
    name: Option<Arc<str>>,
    bytes: Bytes,
    len_bits: u64,
}

impl BitSource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len_bits = bytes.len() as u64 * 8;
        BitSource {
            id: SourceId::fresh(),
            name: None,
            bytes,
            len_bits,
        }
    }

    /// A source whose last byte is only partially used.
    pub fn with_bit_len(bytes: impl Into<Bytes>, len_bits: u64) -> Result<Self> {
        let mut source = BitSource::new(bytes);
        if len_bits > source.len_bits {
            return Err(Error::OutOfRange {
                position: 0,
                requested: len_bits,
                available: source.len_bits,
            });
        }
        source.len_bits = len_bits;
        Ok(source)
    }

    /// A fresh source holding exactly `bits`, used for nodes created by edits.
    pub fn from_bits(bits: &Bits) -> Self {
        let len = bits.len();
        BitSource {
            id: SourceId::fresh(),
            name: None,
            bytes: Bytes::from(bits.to_bytes()),
            len_bits: len,
        }
    }

    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn len_bits(&self) -> u64 {
        self.len_bits
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// The whole source as one span.
    pub fn span(&self) -> SourceSpan {
        SourceSpan::new(self.id, 0, self.len_bits)
    }

    /// `len` bits starting at bit `offset`, zero-copy.
    pub fn read(&self, offset: u64, len: u64) -> Result<Bits> {
        let end = offset.checked_add(len).filter(|&e| e <= self.len_bits);
        if end.is_none() {
            return Err(Error::OutOfRange {
                position: offset,
                requested: len,
                available: self.len_bits.saturating_sub(offset),
            });
        }
        let first = (offset / 8) as usize;
        let last = (offset + len).div_ceil(8) as usize;
        Ok(Bits::from_parts(
            self.bytes.slice(first..last.max(first)),
            (offset % 8) as u8,
            len,
        ))
    }
}

impl fmt::Debug for BitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitSource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("len_bits", &self.len_bits)
            .finish()
    }
}

/// Half-open bit range `[start, end)` in one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceSpan {
    source: SourceId,
    start: u64,
    end: u64,
}

impl SourceSpan {
    /// Panics if `start > end`, like slicing with an inverted range.
    pub fn new(source: SourceId, start: u64, end: u64) -> Self {
        assert!(start <= end, "span start {start} is past end {end}");
        SourceSpan { source, start, end }
    }

    pub fn empty_at(source: SourceId, at: u64) -> Self {
        SourceSpan::new(source, at, at)
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, other: &SourceSpan) -> bool {
        self.source == other.source && self.start <= other.start && other.end <= self.end
    }

    /// Smallest span covering both; `None` across sources.
    pub fn union(&self, other: &SourceSpan) -> Option<SourceSpan> {
        (self.source == other.source).then(|| {
            SourceSpan::new(
                self.source,
                self.start.min(other.start),
                self.end.max(other.end),
            )
        })
    }

    /// The byte range, when both ends fall on byte boundaries.
    pub fn byte_range(&self) -> Option<Range<usize>> {
        (self.start % 8 == 0 && self.end % 8 == 0)
            .then(|| (self.start / 8) as usize..(self.end / 8) as usize)
    }
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{})", self.source, self.start, self.end)
    }
}
