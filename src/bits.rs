//! Raw bit sequences and the output bit sink.
//!
//! Bits are numbered MSB-first: bit 0 of a buffer is the most significant bit
//! of its first byte. A [`Bits`] is a view into a shared [`Bytes`] buffer plus a
//! sub-byte head offset, so slicing never copies.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use std::fmt;

/// An immutable sequence of bits of known length.
#[derive(Clone, Default)]
pub struct Bits {
    buf: Bytes,
    /// Offset of bit 0 inside `buf[0]` (0..8).
    head: u8,
    len: u64,
}

impl Bits {
    pub fn new() -> Self {
        Bits::default()
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let buf = bytes.into();
        let len = buf.len() as u64 * 8;
        Bits { buf, head: 0, len }
    }

    /// `buf` must hold at least `head + len` bits.
    pub(crate) fn from_parts(buf: Bytes, head: u8, len: u64) -> Self {
        debug_assert!(head < 8);
        debug_assert!(buf.len() as u64 * 8 >= head as u64 + len);
        Bits { buf, head, len }
    }

    /// The low `width` bits of `value`, most significant first.
    pub fn from_uint(value: u64, width: u32) -> Self {
        let mut sink = BitSink::new();
        sink.write_uint(value, width);
        sink.into_bits()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the bits start on a byte boundary and cover whole bytes.
    pub fn is_byte_aligned(&self) -> bool {
        self.head == 0 && self.len % 8 == 0
    }

    pub fn bit(&self, i: u64) -> Option<bool> {
        if i >= self.len {
            return None;
        }
        let abs = self.head as u64 + i;
        let byte = self.buf[(abs / 8) as usize];
        Some((byte >> (7 - (abs % 8))) & 1 == 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| self.bit(i).unwrap_or(false))
    }

    /// Sub-range `[start, start + len)` without copying.
    pub fn slice(&self, start: u64, len: u64) -> Option<Bits> {
        if start.checked_add(len)? > self.len {
            return None;
        }
        let abs = self.head as u64 + start;
        let first = (abs / 8) as usize;
        let last = (abs + len).div_ceil(8) as usize;
        Some(Bits {
            buf: self.buf.slice(first..last.max(first)),
            head: (abs % 8) as u8,
            len,
        })
    }

    /// The bits read as a big-endian unsigned integer. `None` above 64 bits.
    pub fn to_uint(&self) -> Option<u64> {
        if self.len > 64 {
            return None;
        }
        if self.len == 0 {
            return Some(0);
        }
        if let Some(bytes) = self.as_aligned() {
            return Some(BigEndian::read_uint(bytes, bytes.len()));
        }
        Some(self.iter().fold(0u64, |acc, b| (acc << 1) | b as u64))
    }

    /// Borrow the underlying bytes when the view is byte aligned.
    pub fn as_aligned(&self) -> Option<&[u8]> {
        if self.is_byte_aligned() {
            Some(&self.buf[..(self.len / 8) as usize])
        } else {
            None
        }
    }

    /// Bytes holding the bits left-aligned; the unused tail of the last byte is zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.len.div_ceil(8) as usize;
        let mut out = vec![0u8; n];
        if self.head == 0 {
            out.copy_from_slice(&self.buf[..n]);
        } else {
            let h = self.head as u32;
            for (i, b) in out.iter_mut().enumerate() {
                let hi = self.buf[i] << h;
                let lo = self.buf.get(i + 1).map_or(0, |next| next >> (8 - h));
                *b = hi | lo;
            }
        }
        let rem = (self.len % 8) as u32;
        if rem != 0 {
            if let Some(last) = out.last_mut() {
                *last &= 0xFFu8 << (8 - rem);
            }
        }
        out
    }

    /// Zero-copy when aligned.
    pub fn into_bytes(self) -> Bytes {
        if self.is_byte_aligned() {
            let n = (self.len / 8) as usize;
            self.buf.slice(..n)
        } else {
            Bytes::from(self.to_bytes())
        }
    }
}

impl PartialEq for Bits {
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        match (self.as_aligned(), other.as_aligned()) {
            (Some(a), Some(b)) => a == b,
            _ => self.to_bytes() == other.to_bytes(),
        }
    }
}

impl Eq for Bits {}

impl fmt::Debug for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bits[{}](", self.len)?;
        for (i, b) in self.to_bytes().iter().take(32).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", b)?;
        }
        if self.len > 32 * 8 {
            f.write_str(" ..")?;
        }
        f.write_str(")")
    }
}

impl From<&[u8]> for Bits {
    fn from(b: &[u8]) -> Self {
        Bits::from_bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Bits {
    fn from(b: Vec<u8>) -> Self {
        Bits::from_bytes(b)
    }
}

/// Append-only bit writer used by encoders.
///
/// Bits past `len` in the last byte are always zero.
#[derive(Debug, Clone, Default)]
pub struct BitSink {
    buf: Vec<u8>,
    len: u64,
}

impl BitSink {
    pub fn new() -> Self {
        BitSink::default()
    }

    /// Bits written so far; also the position of the next bit.
    pub fn position(&self) -> u64 {
        self.len
    }

    fn is_aligned(&self) -> bool {
        self.len % 8 == 0
    }

    pub fn push_bit(&mut self, bit: bool) {
        let off = (self.len % 8) as u32;
        if off == 0 {
            self.buf.push(0);
        }
        if bit {
            if let Some(last) = self.buf.last_mut() {
                *last |= 0x80 >> off;
            }
        }
        self.len += 1;
    }

    /// Write the low `width` bits of `value`, most significant first. Widths above 64 are clamped.
    pub fn write_uint(&mut self, value: u64, width: u32) {
        let width = width.min(64);
        if self.is_aligned() && width % 8 == 0 && width > 0 {
            let n = (width / 8) as usize;
            let mut tmp = [0u8; 8];
            BigEndian::write_uint(&mut tmp[..n], value & mask(width), n);
            self.buf.extend_from_slice(&tmp[..n]);
            self.len += width as u64;
            return;
        }
        for i in (0..width).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.is_aligned() {
            self.buf.extend_from_slice(bytes);
            self.len += bytes.len() as u64 * 8;
        } else {
            for b in bytes {
                self.write_uint(*b as u64, 8);
            }
        }
    }

    pub fn write_bits(&mut self, bits: &Bits) {
        if let Some(bytes) = bits.as_aligned() {
            self.write_bytes(bytes);
            return;
        }
        let whole = bits.to_bytes();
        let full = (bits.len() / 8) as usize;
        self.write_bytes(&whole[..full]);
        let rem = (bits.len() % 8) as u32;
        if rem != 0 {
            self.write_uint((whole[full] >> (8 - rem)) as u64, rem);
        }
    }

    /// Replace already-written bits starting at `pos`.
    pub fn overwrite(&mut self, pos: u64, bits: &Bits) -> Result<()> {
        let end = pos.saturating_add(bits.len());
        if end > self.len {
            return Err(Error::OutOfRange {
                position: pos,
                requested: bits.len(),
                available: self.len.saturating_sub(pos),
            });
        }
        for (i, bit) in bits.iter().enumerate() {
            let abs = pos + i as u64;
            let byte = &mut self.buf[(abs / 8) as usize];
            let m = 0x80u8 >> (abs % 8);
            if bit {
                *byte |= m;
            } else {
                *byte &= !m;
            }
        }
        Ok(())
    }

    pub fn into_bits(self) -> Bits {
        let len = self.len;
        Bits::from_parts(Bytes::from(self.buf), 0, len)
    }
}

pub(crate) fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}
