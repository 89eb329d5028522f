//! Bounded, cheaply cloned reader over a [`BitSource`].

use crate::bits::Bits;
use crate::error::{Error, Result};
use crate::source::{BitSource, SourceSpan};
use crate::value::Endianness;
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

/// Sequential / random-access reader limited to the region `[start, end)` of a source.
///
/// Cloning and [`sub`](BitCursor::sub) / [`slice`](BitCursor::slice) are O(1): they
/// share the source buffer and only copy three offsets.
#[derive(Debug, Clone)]
pub struct BitCursor {
    source: BitSource,
    start: u64,
    end: u64,
    pos: u64,
}

impl BitCursor {
    pub fn new(source: &BitSource) -> Self {
        BitCursor {
            source: source.clone(),
            start: 0,
            end: source.len_bits(),
            pos: 0,
        }
    }

    /// Cursor over `span`, which must lie inside `source`.
    pub fn over(source: &BitSource, span: SourceSpan) -> Result<Self> {
        if span.source() != source.id() || span.end() > source.len_bits() {
            return Err(Error::OutOfRange {
                position: span.start(),
                requested: span.len(),
                available: source.len_bits().saturating_sub(span.start()),
            });
        }
        Ok(BitCursor {
            source: source.clone(),
            start: span.start(),
            end: span.end(),
            pos: span.start(),
        })
    }

    pub fn source(&self) -> &BitSource {
        &self.source
    }

    /// Absolute bit offset in the source.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.end
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// The whole region this cursor may read.
    pub fn region(&self) -> SourceSpan {
        SourceSpan::new(self.source.id(), self.start, self.end)
    }

    /// Span from `start` (absolute) to the current position.
    pub fn span_from(&self, start: u64) -> SourceSpan {
        SourceSpan::new(self.source.id(), start.min(self.pos), self.pos)
    }

    fn out_of_range(&self, n: u64) -> Error {
        Error::OutOfRange {
            position: self.pos,
            requested: n,
            available: self.remaining(),
        }
    }

    pub fn peek(&self, n: u64) -> Result<Bits> {
        if n > self.remaining() {
            return Err(self.out_of_range(n));
        }
        self.source.read(self.pos, n)
    }

    pub fn read(&mut self, n: u64) -> Result<Bits> {
        let bits = self.peek(n)?;
        self.pos += n;
        Ok(bits)
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        if n > self.remaining() {
            return Err(self.out_of_range(n));
        }
        self.pos += n;
        Ok(())
    }

    /// Read everything up to the end of the region.
    pub fn read_rest(&mut self) -> Result<Bits> {
        self.read(self.remaining())
    }

    /// Move to an absolute position inside the region.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos < self.start || pos > self.end {
            return Err(Error::OutOfRange {
                position: pos,
                requested: 0,
                available: 0,
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Skip to the next multiple of `to` bits (absolute); returns the bits skipped.
    pub fn align(&mut self, to: u64) -> Result<u64> {
        if to == 0 {
            return Ok(0);
        }
        let pad = (to - self.pos % to) % to;
        self.skip(pad)?;
        Ok(pad)
    }

    pub fn read_uint(&mut self, width: u32, endianness: Endianness) -> Result<u64> {
        let v = self.peek_uint(width, endianness)?;
        self.pos += width as u64;
        Ok(v)
    }

    pub fn peek_uint(&self, width: u32, endianness: Endianness) -> Result<u64> {
        if width > 64 {
            return Err(Error::mismatch(format!("integer width {width} exceeds 64 bits")));
        }
        let bits = self.peek(width as u64)?;
        uint_from_bits(&bits, endianness)
    }

    /// `n` whole bytes; zero-copy when the cursor is byte aligned.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let bits = self.read(n as u64 * 8)?;
        Ok(bits.into_bytes())
    }

    /// Whether the next bits equal `expected`, without advancing.
    pub fn starts_with(&self, expected: &[u8]) -> bool {
        self.peek(expected.len() as u64 * 8)
            .map(|b| b.to_bytes() == expected)
            .unwrap_or(false)
    }

    /// The next `n` bits as their own cursor; `self` does not move.
    pub fn sub(&self, n: u64) -> Result<BitCursor> {
        if n > self.remaining() {
            return Err(self.out_of_range(n));
        }
        Ok(BitCursor {
            source: self.source.clone(),
            start: self.pos,
            end: self.pos + n,
            pos: self.pos,
        })
    }

    /// A cursor scoped to any span contained in this cursor's region.
    pub fn slice(&self, span: SourceSpan) -> Result<BitCursor> {
        if !self.region().contains(&span) {
            return Err(Error::OutOfRange {
                position: span.start(),
                requested: span.len(),
                available: self.end.saturating_sub(span.start()),
            });
        }
        Ok(BitCursor {
            source: self.source.clone(),
            start: span.start(),
            end: span.end(),
            pos: span.start(),
        })
    }
}

/// Interpret `bits` as an unsigned integer in the given byte order.
pub(crate) fn uint_from_bits(bits: &Bits, endianness: Endianness) -> Result<u64> {
    let width = bits.len();
    if width > 64 {
        return Err(Error::mismatch(format!("integer width {width} exceeds 64 bits")));
    }
    match endianness {
        Endianness::Big => bits
            .to_uint()
            .ok_or_else(|| Error::mismatch("integer wider than 64 bits")),
        Endianness::Little => {
            if width % 8 != 0 {
                return Err(Error::mismatch(format!(
                    "little-endian integer width {width} is not a whole number of bytes"
                )));
            }
            if width == 0 {
                return Ok(0);
            }
            let buf = bits.to_bytes();
            Ok(LittleEndian::read_uint(&buf, buf.len()))
        }
    }
}
