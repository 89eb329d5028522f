//! Small demo format plug-ins shared by the integration tests.

#![allow(dead_code)]

use bitscope::decode::from_fn;
use bitscope::{
    decode, encode, prim, BitCursor, BitSource, DecodeContext, Decoding, Derivation, DerivationRegistry, DerivedValue,
    Error, Format, FormatRegistry, LeafType, NodeId, Patch, Result, StructScope, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `"DEMO" len:u16le data[len]`
pub fn header(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_struct(c, ctx, Some("demo.header"), |s| {
        s.field("magic", &prim::magic(&b"DEMO"[..]))?;
        s.field("len", &prim::u16().little_endian())?;
        let len = s.uint("len").unwrap_or(0);
        s.field("data", &prim::bytes(len))?;
        s.length_of("len", "data", 8)
    })
}

pub fn header_bytes(data: &[u8]) -> Vec<u8> {
    let mut v = b"DEMO".to_vec();
    v.extend_from_slice(&(data.len() as u16).to_le_bytes());
    v.extend_from_slice(data);
    v
}

fn record_body(s: &mut StructScope<'_>) -> Result<()> {
    let start = s.cursor().position();
    s.field("kind", &prim::u8())?;
    match s.uint("kind") {
        Some(1) | Some(2) => {}
        other => return Err(Error::corrupt(start, format!("unknown record kind {:?}", other))),
    }
    s.field("payload", &prim::rest())?;
    Ok(())
}

/// `size:u8 body[size] { kind:u8 (1 or 2) payload.. }`
pub fn entry(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_struct(c, ctx, Some("demo.entry"), |s| {
        s.field("size", &prim::u8())?;
        let size = s.uint("size").unwrap_or(0);
        s.struct_field_within("body", size * 8, Some("demo.record"), record_body)?;
        s.length_of("size", "body", 8)
    })
}

/// `"RECS" entry*`
pub fn container(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_struct(c, ctx, Some("demo.container"), |s| {
        s.field("magic", &prim::magic(&b"RECS"[..]))?;
        s.sequence_field("entries", Some("demo.entries"), |q| q.until_end(&from_fn(entry)))?;
        Ok(())
    })
}

/// Container bytes for `(kind, payload)` records.
pub fn container_bytes(records: &[(u8, &[u8])]) -> Vec<u8> {
    let mut v = b"RECS".to_vec();
    for (kind, payload) in records {
        v.push(payload.len() as u8 + 1);
        v.push(*kind);
        v.extend_from_slice(payload);
    }
    v
}

/// `count:u8 items[count]:u16be`
pub fn list(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_struct(c, ctx, Some("demo.list"), |s| {
        s.field("count", &prim::u8())?;
        let count = s.uint("count").unwrap_or(0);
        s.sequence_field("items", None, |q| q.repeat(count, &prim::u16()))?;
        s.count_of("count", "items")
    })
}

/// `version:3 urgent:1 reserved:4 id:u8`
pub fn flags(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_struct(c, ctx, Some("demo.flags"), |s| {
        s.field("version", &prim::uint(3))?;
        s.field("urgent", &prim::flag())?;
        s.field("reserved", &prim::raw(4))?;
        s.field("id", &prim::u8())?;
        Ok(())
    })
}

/// Big-endian words until the end of the region.
pub fn words(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_sequence(c, ctx, Some("demo.words"), |q| q.until_end(&prim::u16()))
}

/// A zip-like stored member:
/// `"PK\x03\x04" crc:u32le size:u32le name_len:u8 name[name_len] data[size]`
/// with a derived `payload` (the data decoded as words).
pub fn stored(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_struct(c, ctx, Some("demo.stored"), |s| {
        s.field("magic", &prim::magic(&b"PK\x03\x04"[..]))?;
        s.field("crc", &prim::u32().little_endian())?;
        s.field("size", &prim::u32().little_endian())?;
        s.field("name_len", &prim::u8())?;
        let name_len = s.uint("name_len").unwrap_or(0);
        s.field("name", &prim::fixed_str(name_len))?;
        let size = s.uint("size").unwrap_or(0);
        s.field("data", &prim::bytes(size))?;
        s.length_of("name_len", "name", 8)?;
        s.length_of("size", "data", 8)?;
        s.derived("payload", "demo.words")?;
        Ok(())
    })
}

pub fn stored_bytes(name: &str, data: &[u8]) -> Vec<u8> {
    let mut v = b"PK\x03\x04".to_vec();
    v.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    v.extend_from_slice(&(data.len() as u32).to_le_bytes());
    v.push(name.len() as u8);
    v.extend_from_slice(name.as_bytes());
    v.extend_from_slice(data);
    v
}

/// Registry with the demo derivations. `calls` counts evaluations of `demo.words`.
///
/// - `demo.words`: data decoded as words; inverse re-encodes them into `data`.
/// - `demo.crc32`: CRC-32 of `data`; inverse stores it into `crc`. Bound to
///   `demo.stored` structs as field `checksum`.
/// - `demo.sum`: byte sum of `data`; not invertible.
pub fn registry(calls: Arc<AtomicUsize>) -> DerivationRegistry {
    let mut r = DerivationRegistry::new();
    r.register(
        Derivation::new("demo.words", move |view| {
            calls.fetch_add(1, Ordering::SeqCst);
            let data = view.bytes("data")?.clone();
            let decoded = decode(&BitSource::new(data), &from_fn(words));
            if !decoded.is_clean() {
                return Err(view.error("data is not a whole number of words"));
            }
            Ok(DerivedValue::Tree(decoded.tree))
        })
        .with_inverse(|view, value| {
            let tree = value.as_tree().ok_or_else(|| view.error("expected a word tree"))?;
            let bits = encode(tree, None)?;
            let data = view.field("data").ok_or_else(|| view.error("no data field"))?;
            let width = bits.len();
            Ok(Patch::new().replace_leaf(data, LeafType::Bytes, width, Value::Bytes(bits.into_bytes())))
        }),
    );
    r.register(
        Derivation::new("demo.crc32", |view| {
            let crc = crc32fast::hash(view.bytes("data")?);
            Ok(Value::UInt(crc as u64).into())
        })
        .with_inverse(|view, value| {
            let crc = view.field("crc").ok_or_else(|| view.error("no crc field"))?;
            let v = value.as_value().cloned().ok_or_else(|| view.error("expected a value"))?;
            Ok(Patch::new().set_value(crc, v))
        }),
    );
    r.register(Derivation::new("demo.sum", |view| {
        let sum: u64 = view.bytes("data")?.iter().map(|b| *b as u64).sum();
        Ok(Value::UInt(sum).into())
    }));
    r.bind("demo.stored", "checksum", "demo.crc32");
    r
}

pub fn formats() -> FormatRegistry {
    let mut f = FormatRegistry::new();
    f.register(Format::new("demo.header", from_fn(header)));
    f.register(Format::new("demo.container", from_fn(container)));
    f.register(Format::new("demo.list", from_fn(list)));
    f.register(Format::new("demo.stored", from_fn(stored)));
    f
}
