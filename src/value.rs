//! Interpreted leaf values and the leaf encodings that map them to and from bits.

use crate::bits::{mask, BitSink, Bits};
use crate::cursor::uint_from_bits;
use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

/// Byte order for multi-byte integers and floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// The typed interpretation of a leaf's raw bits.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt(u64),
    SInt(i64),
    Bool(bool),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    Enum { value: u64, name: Option<String> },
    /// Uninterpreted bits (padding, reserved, opaque sub-byte fields).
    Bits(Bits),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(x) => Some(*x),
            Value::Enum { value, .. } => Some(*value),
            Value::SInt(x) => (*x).try_into().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SInt(x) => Some(*x),
            Value::UInt(x) => (*x).try_into().ok(),
            Value::Enum { value, .. } => (*value).try_into().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Enum { name: Some(n), .. } => Some(n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_bits(&self) -> Option<&Bits> {
        match self {
            Value::Bits(b) => Some(b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::UInt(_) => "uint",
            Value::SInt(_) => "sint",
            Value::Bool(_) => "bool",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Enum { .. } => "enum",
            Value::Bits(_) => "bits",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::UInt(x) => write!(f, "{}", x),
            Value::SInt(x) => write!(f, "{}", x),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "\"{}\"", s.escape_debug()),
            Value::Bytes(b) => {
                for byte in b.iter().take(16) {
                    write!(f, "{:02x}", byte)?;
                }
                if b.len() > 16 {
                    write!(f, "..({} bytes)", b.len())?;
                }
                Ok(())
            }
            Value::Enum { value, name: Some(n) } => write!(f, "{}({})", n, value),
            Value::Enum { value, name: None } => write!(f, "{}", value),
            Value::Bits(b) if b.len() <= 16 => {
                f.write_str("0b")?;
                for bit in b.iter() {
                    f.write_str(if bit { "1" } else { "0" })?;
                }
                Ok(())
            }
            Value::Bits(b) => write!(f, "<{} bits>", b.len()),
        }
    }
}

/// Known names of an enum leaf, by numeric value.
pub type EnumNames = Arc<[(u64, String)]>;

pub fn enum_names(pairs: &[(u64, &str)]) -> EnumNames {
    pairs.iter().map(|(v, n)| (*v, n.to_string())).collect()
}

/// How a leaf's bits are interpreted and re-encoded.
///
/// The width lives on the leaf itself; every edit is checked against it with
/// [`LeafType::check`].
#[derive(Debug, Clone, PartialEq)]
pub enum LeafType {
    UInt(Endianness),
    /// Two's complement.
    SInt(Endianness),
    /// Zero or one; any other value is corruption.
    Bool,
    /// IEEE 754, 32 or 64 bits.
    Float(Endianness),
    Bytes,
    /// UTF-8 text, NUL-terminated and NUL-padded to the field width.
    Str,
    Enum(Endianness, EnumNames),
    Raw,
}

impl LeafType {
    pub fn name(&self) -> &'static str {
        match self {
            LeafType::UInt(_) => "uint",
            LeafType::SInt(_) => "sint",
            LeafType::Bool => "bool",
            LeafType::Float(_) => "float",
            LeafType::Bytes => "bytes",
            LeafType::Str => "str",
            LeafType::Enum(..) => "enum",
            LeafType::Raw => "raw",
        }
    }

    /// Turn raw bits into a value. `position` is only used for error reporting.
    pub fn interpret(&self, raw: &Bits, position: u64) -> Result<Value> {
        let width = raw.len();
        match self {
            LeafType::UInt(e) => Ok(Value::UInt(uint_from_bits(raw, *e)?)),
            LeafType::SInt(e) => {
                let u = uint_from_bits(raw, *e)?;
                Ok(Value::SInt(sign_extend(u, width as u32)))
            }
            LeafType::Bool => match raw.to_uint() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                Some(other) => Err(Error::corrupt(position, format!("boolean field holds {other}"))),
                None => Err(Error::mismatch(format!("boolean width {width} exceeds 64 bits"))),
            },
            LeafType::Float(e) => {
                let u = uint_from_bits(raw, *e)?;
                match width {
                    32 => Ok(Value::Float(f32::from_bits(u as u32) as f64)),
                    64 => Ok(Value::Float(f64::from_bits(u))),
                    _ => Err(Error::mismatch(format!("float width must be 32 or 64, got {width}"))),
                }
            }
            LeafType::Bytes => {
                require_whole_bytes(width)?;
                Ok(Value::Bytes(raw.clone().into_bytes()))
            }
            LeafType::Str => {
                require_whole_bytes(width)?;
                let bytes = raw.to_bytes();
                let end = bytes.iter().position(|c| *c == 0).unwrap_or(bytes.len());
                match std::str::from_utf8(&bytes[..end]) {
                    Ok(s) => Ok(Value::Str(s.to_string())),
                    Err(e) => Err(Error::corrupt(position, format!("string is not UTF-8: {e}"))),
                }
            }
            LeafType::Enum(e, names) => {
                let value = uint_from_bits(raw, *e)?;
                let name = lookup_name(names, value).map(str::to_string);
                Ok(Value::Enum { value, name })
            }
            LeafType::Raw => Ok(Value::Bits(raw.clone())),
        }
    }

    /// Whether `value` can be written by this leaf type in exactly `width` bits.
    pub fn check(&self, value: &Value, width: u64) -> Result<()> {
        let mismatch = || {
            Error::mismatch(format!(
                "{} leaf of {} bits cannot hold {} value {}",
                self.name(),
                width,
                value.type_name(),
                value
            ))
        };
        match (self, value) {
            (LeafType::UInt(e), Value::UInt(v)) => {
                check_int_width(width, *e)?;
                if *v > mask(width as u32) {
                    return Err(mismatch());
                }
            }
            (LeafType::SInt(e), Value::SInt(v)) => {
                check_int_width(width, *e)?;
                if width < 64 {
                    let half = 1i64 << (width - 1);
                    if *v < -half || *v >= half {
                        return Err(mismatch());
                    }
                }
            }
            (LeafType::Bool, Value::Bool(_)) => check_int_width(width, Endianness::Big)?,
            (LeafType::Float(_), Value::Float(_)) => {
                if width != 32 && width != 64 {
                    return Err(mismatch());
                }
            }
            (LeafType::Bytes, Value::Bytes(b)) => {
                if b.len() as u64 * 8 != width {
                    return Err(mismatch());
                }
            }
            (LeafType::Str, Value::Str(s)) => {
                require_whole_bytes(width)?;
                if s.len() as u64 * 8 > width || s.as_bytes().contains(&0) {
                    return Err(mismatch());
                }
            }
            (LeafType::Enum(e, names), Value::Enum { value, name }) => {
                check_int_width(width, *e)?;
                if *value > mask(width as u32) {
                    return Err(mismatch());
                }
                if let Some(n) = name {
                    if lookup_name(names, *value) != Some(n.as_str()) {
                        return Err(Error::mismatch(format!(
                            "enum name `{n}` does not belong to value {value}"
                        )));
                    }
                }
            }
            (LeafType::Raw, Value::Bits(b)) => {
                if b.len() != width {
                    return Err(mismatch());
                }
            }
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    /// Write `value` in `width` bits. Fails with `TypeMismatch` exactly when [`check`](Self::check) does.
    pub fn encode(&self, value: &Value, width: u64, sink: &mut BitSink) -> Result<()> {
        self.check(value, width)?;
        let w = width as u32;
        match (self, value) {
            (LeafType::UInt(e), Value::UInt(v)) => write_int(sink, *v, w, *e),
            (LeafType::SInt(e), Value::SInt(v)) => write_int(sink, (*v as u64) & mask(w), w, *e),
            (LeafType::Bool, Value::Bool(b)) => write_int(sink, *b as u64, w, Endianness::Big),
            (LeafType::Float(e), Value::Float(x)) => {
                let u = if w == 32 { (*x as f32).to_bits() as u64 } else { x.to_bits() };
                write_int(sink, u, w, *e)
            }
            (LeafType::Bytes, Value::Bytes(b)) => sink.write_bytes(b),
            (LeafType::Str, Value::Str(s)) => {
                sink.write_bytes(s.as_bytes());
                let pad = (width / 8) as usize - s.len();
                sink.write_bytes(&vec![0u8; pad]);
            }
            (LeafType::Enum(e, _), Value::Enum { value, .. }) => write_int(sink, *value, w, *e),
            (LeafType::Raw, Value::Bits(b)) => sink.write_bits(b),
            _ => unreachable!("check() accepted a mismatched pair"),
        }
        Ok(())
    }

    /// The known name of an enum value, for enum leaves.
    pub fn enum_name(&self, value: u64) -> Option<&str> {
        match self {
            LeafType::Enum(_, names) => lookup_name(names, value),
            _ => None,
        }
    }
}

fn lookup_name(names: &EnumNames, value: u64) -> Option<&str> {
    names.iter().find(|(v, _)| *v == value).map(|(_, n)| n.as_str())
}

fn sign_extend(u: u64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return u as i64;
    }
    if (u >> (width - 1)) & 1 == 1 {
        (u | !mask(width)) as i64
    } else {
        u as i64
    }
}

fn require_whole_bytes(width: u64) -> Result<()> {
    if width % 8 != 0 {
        return Err(Error::mismatch(format!("width {width} is not a whole number of bytes")));
    }
    Ok(())
}

fn check_int_width(width: u64, e: Endianness) -> Result<()> {
    if width == 0 || width > 64 {
        return Err(Error::mismatch(format!("integer width must be 1..=64, got {width}")));
    }
    if e == Endianness::Little {
        require_whole_bytes(width)?;
    }
    Ok(())
}

fn write_int(sink: &mut BitSink, v: u64, width: u32, e: Endianness) {
    match e {
        Endianness::Big => sink.write_uint(v, width),
        Endianness::Little => {
            let n = (width / 8) as usize;
            let mut tmp = [0u8; 8];
            LittleEndian::write_uint(&mut tmp[..n], v & mask(width), n);
            sink.write_bytes(&tmp[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(ty: &LeafType, v: &Value, width: u64) -> Vec<u8> {
        let mut sink = BitSink::new();
        ty.encode(v, width, &mut sink).expect("encode");
        sink.into_bits().to_bytes()
    }

    #[test]
    fn signed_values_sign_extend() {
        let raw = Bits::from_uint(0b1110, 4);
        let v = LeafType::SInt(Endianness::Big).interpret(&raw, 0).expect("interpret");
        assert_eq!(v, Value::SInt(-2));
        assert_eq!(encoded(&LeafType::SInt(Endianness::Big), &v, 8), vec![0xfe]);
    }

    #[test]
    fn uint_range_is_checked_against_width() {
        let ty = LeafType::UInt(Endianness::Little);
        assert!(ty.check(&Value::UInt(0xffff), 16).is_ok());
        assert!(matches!(ty.check(&Value::UInt(0x1_0000), 16), Err(Error::TypeMismatch(_))));
        assert!(matches!(ty.check(&Value::SInt(1), 16), Err(Error::TypeMismatch(_))));
        assert_eq!(encoded(&ty, &Value::UInt(0x1234), 16), vec![0x34, 0x12]);
    }

    #[test]
    fn strings_are_nul_padded() {
        let ty = LeafType::Str;
        let raw = Bits::from_bytes(b"abc\0\0\0".to_vec());
        let v = ty.interpret(&raw, 0).expect("interpret");
        assert_eq!(v, Value::Str("abc".into()));
        assert_eq!(encoded(&ty, &v, 48), b"abc\0\0\0".to_vec());
        assert!(ty.check(&Value::Str("toolong".into()), 48).is_err());
    }

    #[test]
    fn bool_rejects_other_values() {
        let raw = Bits::from_uint(2, 2);
        assert!(matches!(
            LeafType::Bool.interpret(&raw, 7),
            Err(Error::StructuralCorruption { position: 7, .. })
        ));
    }

    #[test]
    fn enum_names_must_match_value() {
        let ty = LeafType::Enum(Endianness::Big, enum_names(&[(0, "stored"), (8, "deflated")]));
        let v = ty.interpret(&Bits::from_uint(8, 16), 0).expect("interpret");
        assert_eq!(v, Value::Enum { value: 8, name: Some("deflated".into()) });
        let wrong = Value::Enum { value: 0, name: Some("deflated".into()) };
        assert!(ty.check(&wrong, 16).is_err());
        assert!(ty.check(&Value::Enum { value: 3, name: None }, 16).is_ok());
    }

    #[test]
    fn floats_round_trip_in_both_widths() {
        for (width, e) in [(32, Endianness::Little), (64, Endianness::Big)] {
            let ty = LeafType::Float(e);
            let bytes = encoded(&ty, &Value::Float(1.5), width);
            let v = ty.interpret(&Bits::from_bytes(bytes), 0).expect("interpret");
            assert_eq!(v, Value::Float(1.5));
        }
    }
}
