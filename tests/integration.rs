//! Integration tests: decoding with failure isolation, diagnostics and round-trip encoding.

mod common;

use bitscope::decode::from_fn;
use bitscope::{
    decode, decode_span, decode_with, dump, encode, prim, BitSource, DecodeContext, DecodeOptions, DecoderExt,
    DumpOptions, Error, ErrorKind, SourceSpan, Value,
};
use common::{container, container_bytes, entry, flags, formats, header, header_bytes};

#[test]
fn test_truncated_payload_becomes_error_node() {
    let mut bytes = b"DEMO".to_vec();
    bytes.extend_from_slice(&[0x0a, 0x00, 0xaa, 0xbb]);
    let src = BitSource::new(bytes.clone());
    let out = decode(&src, &from_fn(header));
    let tree = &out.tree;

    let root = tree.node(tree.root()).expect("root");
    assert!(root.as_struct().is_some(), "root must stay a struct");
    let magic = tree.lookup("magic").expect("magic");
    assert_eq!(
        tree.value(magic).and_then(Value::as_bytes).map(|b| b.to_vec()),
        Some(b"DEMO".to_vec())
    );
    assert_eq!(tree.lookup("len").and_then(|id| tree.uint(id)), Some(10));

    let data = tree.node(tree.lookup("data").expect("data")).expect("data node");
    let err = data.as_error().expect("data is an ErrorNode");
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(data.span(), SourceSpan::new(src.id(), 48, 64));
    assert_eq!(err.raw().to_bytes(), vec![0xaa, 0xbb]);

    assert_eq!(out.diagnostics.len(), 1);
    assert_eq!(out.diagnostics[0].path_string(), "data");
    assert!(out.trailing.is_none());
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), bytes);
}

#[test]
fn test_corrupt_record_is_contained() {
    let bytes = container_bytes(&[(1, &[1, 2]), (9, &[7]), (2, &[5])]);
    let src = BitSource::new(bytes.clone());
    let out = decode(&src, &from_fn(container));
    let tree = &out.tree;

    let entries = tree.lookup("entries").expect("entries");
    assert_eq!(tree.children(entries).len(), 3);
    assert_eq!(tree.lookup("entries[0].body.kind").and_then(|id| tree.uint(id)), Some(1));
    assert_eq!(tree.lookup("entries[2].body.kind").and_then(|id| tree.uint(id)), Some(2));

    let bad = tree.node(tree.lookup("entries[1].body").expect("body")).expect("node");
    assert_eq!(bad.as_error().map(|e| e.kind()), Some(ErrorKind::StructuralCorruption));
    assert_eq!(bad.span().len(), 16);

    assert_eq!(out.diagnostics.len(), 1);
    assert_eq!(out.diagnostics[0].path_string(), "entries[1].body");
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), bytes);
}

#[test]
fn test_unbounded_failure_skips_later_siblings() {
    let failing = from_fn(|c, _, _| Err(Error::corrupt(c.position(), "unsupported")));
    let decoder = from_fn(move |c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.field("a", &failing)?;
            s.field("b", &prim::u8())?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![1, 2]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;

    let a = tree.node(tree.lookup("a").expect("a")).expect("node");
    assert!(a.is_error());
    assert_eq!(a.span().len(), 16);
    let b = tree.node(tree.lookup("b").expect("b")).expect("node");
    assert!(b.is_error());
    assert!(b.span().is_empty());
    assert_eq!(b.as_error().map(|e| e.kind()), Some(ErrorKind::StructuralCorruption));
    assert_eq!(out.diagnostics.len(), 1);
}

#[test]
fn test_bounded_failure_keeps_later_siblings() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.field("flag", &prim::boolean(8))?;
            s.field("next", &prim::u8())?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![7, 42]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;
    assert!(tree.node(tree.lookup("flag").expect("flag")).expect("node").is_error());
    assert_eq!(tree.lookup("next").and_then(|id| tree.uint(id)), Some(42));
}

#[test]
fn test_aborting_child_fails_enclosing_struct() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.struct_field("hdr", None, |h| {
                h.field("x", &prim::u8())?;
                h.field("y", &prim::u32().aborting())?;
                Ok(())
            })?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![1, 2, 3]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;

    let hdr = tree.node(tree.lookup("hdr").expect("hdr")).expect("node");
    assert_eq!(hdr.as_error().map(|e| e.kind()), Some(ErrorKind::OutOfRange));
    assert_eq!(hdr.span().len(), 24);
    assert!(tree.lookup("hdr.x").is_none());
    assert_eq!(tree.error_nodes().count(), 1);
    assert_eq!(out.diagnostics[0].path_string(), "hdr");
}

#[test]
fn test_failing_root_yields_error_root() {
    let src = BitSource::new(vec![0xff; 5]);
    let out = decode(&src, &from_fn(|c, _, _| Err(Error::corrupt(c.position(), "not this format"))));
    let root = out.tree.node(out.tree.root()).expect("root");
    assert!(root.is_error());
    assert_eq!(root.span(), src.span());
    assert_eq!(out.diagnostics.len(), 1);
    assert!(out.diagnostics[0].path.is_empty());
    assert_eq!(encode(&out.tree, None).expect("encode").to_bytes(), vec![0xff; 5]);
}

#[test]
fn test_trailing_bits_are_reported() {
    let mut bytes = header_bytes(b"ab");
    bytes.extend_from_slice(&[9, 9, 9]);
    let src = BitSource::new(bytes);
    let out = decode(&src, &from_fn(header));
    assert!(out.is_clean());
    let trailing = out.trailing.expect("trailing");
    assert_eq!(trailing.len(), 24);
    assert_eq!(trailing.start(), 64);
}

#[test]
fn test_bitfields_have_sub_byte_spans() {
    let bytes = vec![0b1011_0110, 0x2a];
    let src = BitSource::new(bytes.clone());
    let out = decode(&src, &from_fn(flags));
    let tree = &out.tree;
    assert!(out.is_clean());

    let span = |path: &str| tree.node(tree.lookup(path).expect(path)).expect("node").span();
    assert_eq!((span("version").start(), span("version").end()), (0, 3));
    assert_eq!((span("urgent").start(), span("urgent").end()), (3, 4));
    assert_eq!((span("reserved").start(), span("reserved").end()), (4, 8));
    assert_eq!((span("id").start(), span("id").end()), (8, 16));
    assert_eq!(tree.lookup("version").and_then(|id| tree.uint(id)), Some(5));
    assert_eq!(tree.lookup("urgent").and_then(|id| tree.value(id)), Some(&Value::Bool(true)));
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), bytes);
}

#[test]
fn test_spans_are_contained_in_parents() {
    let src = BitSource::new(container_bytes(&[(1, &[1, 2, 3]), (2, &[]), (5, &[0])]));
    let out = decode(&src, &from_fn(container));
    assert!(out.tree.span_violations().is_empty());
    let root = out.tree.node(out.tree.root()).expect("root");
    assert_eq!(root.span(), src.span());
}

#[test]
fn test_oversized_entry_is_out_of_range() {
    let mut bytes = container_bytes(&[(1, &[1])]);
    bytes.extend_from_slice(&[40, 1, 2]);
    let src = BitSource::new(bytes.clone());
    let out = decode(&src, &from_fn(container));
    let tree = &out.tree;
    let body = tree.node(tree.lookup("entries[1].body").expect("body")).expect("node");
    assert_eq!(body.as_error().map(|e| e.kind()), Some(ErrorKind::OutOfRange));
    assert_eq!(body.span().len(), 16);
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), bytes);
}

#[test]
fn test_zero_width_element_stops_sequence() {
    let decoder = from_fn(|c, ctx, out| out.decode_sequence(c, ctx, None, |q| q.until_end(&prim::raw(0))));
    let src = BitSource::new(vec![1, 2, 3]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;
    let items = tree.children(tree.root());
    assert_eq!(items.len(), 2);
    let rest = tree.node(items[1]).expect("node");
    assert_eq!(rest.as_error().map(|e| e.kind()), Some(ErrorKind::StructuralCorruption));
    assert_eq!(rest.span().len(), 24);
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), vec![1, 2, 3]);
}

fn nest(
    c: &mut bitscope::BitCursor,
    ctx: &DecodeContext,
    out: &mut bitscope::Decoding,
) -> bitscope::Result<bitscope::NodeId> {
    out.decode_struct(c, ctx, Some("nest"), |s| {
        s.field("child", &from_fn(nest))?;
        Ok(())
    })
}

#[test]
fn test_nesting_depth_is_limited() {
    let src = BitSource::new(vec![0; 4]);
    let options = DecodeOptions {
        max_depth: 8,
        ..DecodeOptions::default()
    };
    let out = decode_with(&src, &from_fn(nest), &DecodeContext::default(), options);
    assert_eq!(out.diagnostics.len(), 1);
    assert_eq!(out.diagnostics[0].kind, ErrorKind::StructuralCorruption);
    assert!(out.diagnostics[0].message.contains("nesting"));
    assert_eq!(out.diagnostics[0].path.len(), 8);
}

#[test]
fn test_diagnostics_are_capped() {
    let src = BitSource::new(container_bytes(&[(7, &[]), (8, &[]), (1, &[])]));
    let options = DecodeOptions {
        max_diagnostics: 1,
        ..DecodeOptions::default()
    };
    let out = decode_with(&src, &from_fn(container), &DecodeContext::default(), options);
    assert_eq!(out.diagnostics.len(), 1);
    assert_eq!(out.dropped_diagnostics, 1);
    assert_eq!(out.tree.error_nodes().count(), 2);
    assert!(!out.is_clean());
}

#[test]
fn test_decode_span_checks_bounds() {
    let src = BitSource::new(container_bytes(&[(1, &[4]), (2, &[5])]));
    // Second entry only: bytes 7..10.
    let span = SourceSpan::new(src.id(), 56, 80);
    let out = decode_span(&src, span, &from_fn(entry), &DecodeContext::default(), DecodeOptions::default())
        .expect("span inside source");
    assert!(out.is_clean());
    assert_eq!(out.tree.lookup("body.kind").and_then(|id| out.tree.uint(id)), Some(2));
    assert_eq!(out.tree.node(out.tree.root()).expect("root").span(), span);

    let past_end = SourceSpan::new(src.id(), 0, 1000);
    assert!(decode_span(&src, past_end, &from_fn(entry), &DecodeContext::default(), DecodeOptions::default()).is_err());
    let other = BitSource::new(vec![0; 16]);
    assert!(decode_span(&src, other.span(), &from_fn(entry), &DecodeContext::default(), DecodeOptions::default()).is_err());
}

#[test]
fn test_concurrent_decodes_share_one_source() {
    let records: Vec<(u8, &[u8])> = (0..64).map(|i| (1 + (i % 2) as u8, &b"payload"[..])).collect();
    let src = BitSource::new(container_bytes(&records));
    let expected = encode(&decode(&src, &from_fn(container)).tree, None).expect("encode");
    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let out = decode(&src, &from_fn(container));
                assert!(out.is_clean());
                assert_eq!(encode(&out.tree, None).expect("encode"), expected);
            });
        }
    });
}

#[test]
fn test_format_registry_lookup() {
    let mut registry = formats();
    assert_eq!(registry.ids(), vec!["demo.container", "demo.header", "demo.list", "demo.stored"]);
    let format = registry.get("demo.header").expect("header format");
    let src = BitSource::new(header_bytes(b"xyz"));
    let out = format.decode(&src);
    assert!(out.is_clean());
    assert_eq!(format.encode(&out.tree, None).expect("encode").to_bytes(), header_bytes(b"xyz"));

    assert!(registry.remove("demo.header").is_some());
    assert!(registry.get("demo.header").is_none());
    assert_eq!(registry.len(), 3);
}

#[test]
fn test_context_byte_order_reaches_fields() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.field("n", &prim::u16())?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![0x01, 0x02]);
    let ctx = DecodeContext::new().with_endianness(bitscope::Endianness::Little);
    let out = decode_with(&src, &decoder, &ctx, DecodeOptions::default());
    assert_eq!(out.tree.lookup("n").and_then(|id| out.tree.uint(id)), Some(0x0201));
}

#[test]
fn test_declared_size_fixes_next_sibling_offset() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.struct_field_within("a", 16, None, |a| {
                a.field("x", &prim::u8())?;
                Ok(())
            })?;
            s.field("b", &prim::u8())?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![1, 2, 3]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;
    assert!(out.is_clean());
    assert!(out.trailing.is_none());

    let b = tree.lookup("b").expect("b");
    assert_eq!(tree.uint(b), Some(3));
    let span = tree.node(b).expect("node").span();
    assert_eq!((span.start(), span.end()), (16, 24));

    let a = tree.node(tree.lookup("a").expect("a")).expect("node");
    assert_eq!(a.span().len(), 16);
    assert_eq!(a.as_struct().map(|s| s.padding().to_bytes()), Some(vec![2]));
    assert!(tree.span_violations().is_empty());
    assert!(dump(tree, &DumpOptions::default()).contains("<padding 8 bits> raw(02)"));
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), vec![1, 2, 3]);
}

#[test]
fn test_declared_sequence_size_and_leaf_extent() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.sequence_field_within("words", 24, None, |q| q.repeat(1, &prim::u16()))?;
            s.field("narrow", &prim::u8().with_extent(16))?;
            s.field("tail", &prim::u8())?;
            Ok(())
        })
    });
    let bytes = vec![0, 1, 2, 3, 4, 5];
    let src = BitSource::new(bytes.clone());
    let out = decode(&src, &decoder);
    let tree = &out.tree;

    let words = tree.node(tree.lookup("words").expect("words")).expect("node");
    assert_eq!(words.as_sequence().map(|q| q.len()), Some(1));
    assert_eq!(words.as_sequence().map(|q| q.padding().len()), Some(8));

    // A leaf must fill its declared size.
    let narrow = tree.node(tree.lookup("narrow").expect("narrow")).expect("node");
    assert_eq!(narrow.as_error().map(|e| e.kind()), Some(ErrorKind::StructuralCorruption));
    assert_eq!(narrow.span().len(), 16);
    assert_eq!(tree.lookup("tail").and_then(|id| tree.uint(id)), Some(5));
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), bytes);
}

fn corrupt_field(c: &mut bitscope::BitCursor, _: &DecodeContext, _: &mut bitscope::Decoding) -> bitscope::Result<bitscope::NodeId> {
    Err(Error::corrupt(c.position(), "unreadable"))
}

#[test]
fn test_seek_after_unbounded_failure_round_trips() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.field("a", &from_fn(corrupt_field))?;
            s.field("lost", &prim::u8())?;
            s.seek(16)?;
            s.field("b", &prim::u8())?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![9, 9, 42]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;

    let a = tree.node(tree.lookup("a").expect("a")).expect("node");
    assert_eq!((a.span().start(), a.span().end()), (0, 16));
    assert_eq!(a.as_error().map(|e| e.raw().to_bytes()), Some(vec![9, 9]));
    assert_eq!(out.diagnostics.len(), 1);
    assert_eq!(out.diagnostics[0].span, a.span());
    assert!(tree.node(tree.lookup("lost").expect("lost")).expect("node").span().is_empty());
    assert_eq!(tree.lookup("b").and_then(|id| tree.uint(id)), Some(42));
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), vec![9, 9, 42]);
}

#[test]
fn test_forward_seek_keeps_skipped_bits() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.field("x", &prim::u8())?;
            s.seek(24)?;
            s.field("y", &prim::u8())?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![1, 2, 3, 4]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;
    assert!(out.is_clean());
    let gap = tree.lookup("gap@8").expect("gap");
    assert_eq!(tree.node(gap).expect("node").span().len(), 16);
    assert_eq!(tree.lookup("y").and_then(|id| tree.uint(id)), Some(4));
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), vec![1, 2, 3, 4]);
}

#[test]
fn test_seek_into_decoded_bits_is_corruption() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.field("x", &prim::u16())?;
            s.seek(8)?;
            s.field("y", &prim::u8())?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![1, 2, 3]);
    let out = decode(&src, &decoder);
    let root = out.tree.node(out.tree.root()).expect("root");
    assert_eq!(root.as_error().map(|e| e.kind()), Some(ErrorKind::StructuralCorruption));
    assert_eq!(encode(&out.tree, None).expect("encode").to_bytes(), vec![1, 2, 3]);
}

#[test]
fn test_discarded_children_leave_no_diagnostics() {
    let decoder = from_fn(|c, ctx, out| {
        out.decode_struct(c, ctx, None, |s| {
            s.struct_field("hdr", None, |h| {
                h.field("flag", &prim::boolean(8))?;
                h.field("y", &prim::u32().aborting())?;
                Ok(())
            })?;
            Ok(())
        })
    });
    let src = BitSource::new(vec![7, 1]);
    let out = decode(&src, &decoder);
    assert_eq!(out.tree.error_nodes().count(), 1);
    assert_eq!(out.diagnostics.len(), 1);
    assert_eq!(out.diagnostics[0].path_string(), "hdr");
}

#[test]
fn test_repeat_stops_on_zero_width_element() {
    let decoder = from_fn(|c, ctx, out| out.decode_sequence(c, ctx, None, |q| q.repeat(2_000_000, &prim::raw(0))));
    let src = BitSource::new(vec![5]);
    let out = decode(&src, &decoder);
    let tree = &out.tree;
    let items = tree.children(tree.root());
    assert_eq!(items.len(), 2);
    let rest = tree.node(items[1]).expect("node");
    assert_eq!(rest.as_error().map(|e| e.kind()), Some(ErrorKind::StructuralCorruption));
    assert_eq!(rest.span().len(), 8);
    assert_eq!(out.diagnostics.len(), 1);
    assert_eq!(encode(tree, None).expect("encode").to_bytes(), vec![5]);
}
