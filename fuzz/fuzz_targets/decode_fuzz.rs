//! Decode fuzz target: feed arbitrary bytes to a length-prefixed record decoder.
//! Decoding must not panic, every span must nest, and an unedited tree must
//! encode back to the exact input.
//! Build with: cargo fuzz run decode_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use bitscope::{decode, decode::from_fn, encode, prim, BitCursor, BitSource, DecodeContext, Decoding, NodeId, Result};
#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

/// `tag:u8 len:u8 flags:4 pad:4 body[len] { word:u16* }`, repeated to the end.
#[cfg(fuzzing)]
fn record(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_struct(c, ctx, Some("fuzz.record"), |s| {
        s.field("tag", &prim::u8())?;
        s.field("len", &prim::u8())?;
        s.field("flags", &prim::uint(4))?;
        s.field("pad", &prim::raw(4))?;
        let len = s.uint("len").unwrap_or(0);
        s.sequence_field_within("body", len * 8, None, |q| q.until_end(&prim::u16()))?;
        s.length_of("len", "body", 8)
    })
}

#[cfg(fuzzing)]
fn records(c: &mut BitCursor, ctx: &DecodeContext, out: &mut Decoding) -> Result<NodeId> {
    out.decode_sequence(c, ctx, Some("fuzz.records"), |q| q.until_end(&from_fn(record)))
}

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let src = BitSource::new(data.to_vec());
    let out = decode(&src, &from_fn(records));
    assert!(out.tree.span_violations().is_empty());
    let bits = encode(&out.tree, None).expect("unedited tree encodes");
    let trailing = out.trailing.map(|s| s.len()).unwrap_or(0);
    assert_eq!(bits.len() + trailing, src.len_bits());
    assert_eq!(&bits.to_bytes()[..], &data[..bits.to_bytes().len()]);
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run decode_fuzz");
}
