//! Derived-value tests: lazy evaluation, caching, invalidation and inverse write-back.

mod common;

use bitscope::decode::from_fn;
use bitscope::{
    decode, dump, encode, BitSource, DerivedValue, DumpOptions, Error, ErrorKind, Value, ValueTree,
};
use common::{registry, stored, stored_bytes, words};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn stored_tree(data: &[u8]) -> ValueTree {
    let src = BitSource::new(stored_bytes("a.txt", data));
    let out = decode(&src, &from_fn(stored));
    assert!(out.is_clean(), "{:?}", out.diagnostics);
    out.tree
}

fn word_values(value: &DerivedValue) -> Vec<u64> {
    let tree = value.as_tree().expect("word tree");
    tree.children(tree.root())
        .into_iter()
        .filter_map(|id| tree.uint(id))
        .collect()
}

#[test]
fn test_derived_value_is_computed_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let reg = registry(calls.clone());
    let tree = stored_tree(&[0, 1, 0, 2]);
    let payload = tree.lookup("payload").expect("payload");

    assert!(tree.is_stale(payload));
    let first = reg.evaluate(&tree, payload).expect("evaluate");
    let second = reg.evaluate(&tree, payload).expect("evaluate");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!tree.is_stale(payload));
    assert_eq!(word_values(&first), vec![1, 2]);
}

#[test]
fn test_edit_inside_closure_recomputes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let reg = registry(calls.clone());
    let mut tree = stored_tree(&[0, 1, 0, 2]);
    let payload = tree.lookup("payload").expect("payload");
    reg.evaluate(&tree, payload).expect("evaluate");

    let data = tree.lookup("data").expect("data");
    tree.set_value(data, Value::Bytes(vec![0, 3, 0, 4].into())).expect("edit");
    assert!(tree.is_stale(payload));
    let again = reg.evaluate(&tree, payload).expect("evaluate");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(word_values(&again), vec![3, 4]);
}

#[test]
fn test_edit_outside_closure_keeps_cache() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = stored_tree(&[1, 2, 3]);
    let root = tree.root();
    let data = tree.lookup("data").expect("data");
    let sum = tree.attach_derived(root, "sum", "demo.sum", vec![data]).expect("attach");

    let value = reg.evaluate(&tree, sum).expect("evaluate");
    assert_eq!(value.as_value(), Some(&Value::UInt(6)));

    let name = tree.lookup("name").expect("name");
    tree.set_value(name, Value::Str("b.txt".into())).expect("rename");
    assert!(!tree.is_stale(sum));

    tree.set_value(data, Value::Bytes(vec![5, 5, 5].into())).expect("edit data");
    assert!(tree.is_stale(sum));
    assert_eq!(reg.evaluate(&tree, sum).expect("evaluate").as_value(), Some(&Value::UInt(15)));
}

#[test]
fn test_failure_is_a_cached_value() {
    let calls = Arc::new(AtomicUsize::new(0));
    let reg = registry(calls.clone());
    let tree = stored_tree(&[1, 2, 3]);
    let payload = tree.lookup("payload").expect("payload");

    let err = reg.evaluate(&tree, payload).expect_err("odd length");
    assert_eq!(err.kind(), ErrorKind::DerivationError);
    assert_eq!(reg.evaluate(&tree, payload).expect_err("still odd"), err);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unknown_function_and_wrong_node() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = stored_tree(&[0, 1]);
    let root = tree.root();
    let ghost = tree.attach_derived(root, "ghost", "nope", vec![root]).expect("attach");
    assert!(matches!(reg.evaluate(&tree, ghost), Err(Error::Derivation { .. })));

    let data = tree.lookup("data").expect("data");
    assert_eq!(reg.evaluate(&tree, data).expect_err("not derived").kind(), ErrorKind::TypeMismatch);
}

#[test]
fn test_encoding_needs_an_inverse() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = stored_tree(&[0, 1]);

    // `payload` cannot be encoded without the registry's inverse.
    assert_eq!(encode(&tree, None).expect_err("no registry").kind(), ErrorKind::NotEncodable);
    assert!(encode(&tree, Some(&reg)).is_ok());

    let root = tree.root();
    let data = tree.lookup("data").expect("data");
    tree.attach_derived(root, "sum", "demo.sum", vec![data]).expect("attach");
    assert_eq!(encode(&tree, Some(&reg)).expect_err("sum has no inverse").kind(), ErrorKind::NotEncodable);
}

#[test]
fn test_round_trip_with_invertible_derived_fields() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let bytes = stored_bytes("a.txt", &[0, 1, 0, 2]);
    let mut tree = decode(&BitSource::new(bytes.clone()), &from_fn(stored)).tree;
    assert_eq!(reg.attach(&mut tree).expect("attach"), 1);
    assert_eq!(reg.attach(&mut tree).expect("attach again"), 0);
    assert_eq!(encode(&tree, Some(&reg)).expect("encode").to_bytes(), bytes);
}

#[test]
fn test_bound_checksum_matches_stored_crc() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = stored_tree(b"hello world!");
    reg.attach(&mut tree).expect("attach");
    let checksum = tree.lookup("checksum").expect("checksum");
    let crc = tree.lookup("crc").and_then(|id| tree.uint(id)).expect("crc");
    let computed = reg.evaluate(&tree, checksum).expect("evaluate");
    assert_eq!(computed.as_value(), Some(&Value::UInt(crc)));
}

#[test]
fn test_write_back_rewrites_payload_and_checksum() -> anyhow::Result<()> {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = stored_tree(&[0, 1, 0, 2]);
    reg.attach(&mut tree)?;
    let payload = tree.lookup("payload").expect("payload");
    let checksum = tree.lookup("checksum").expect("checksum");

    let replacement = decode(&BitSource::new(vec![0, 7, 0, 8, 0, 9]), &from_fn(words)).tree;
    reg.write_back(&mut tree, payload, &DerivedValue::Tree(replacement))?;
    assert!(tree.is_stale(checksum));

    let crc = reg.evaluate(&tree, checksum)?;
    reg.write_back(&mut tree, checksum, &crc)?;

    let encoded = encode(&tree, Some(&reg))?.to_bytes();
    assert_eq!(encoded, stored_bytes("a.txt", &[0, 7, 0, 8, 0, 9]));

    let again = decode(&BitSource::new(encoded), &from_fn(stored)).tree;
    let payload = again.lookup("payload").expect("payload");
    assert_eq!(word_values(&*reg.evaluate(&again, payload)?), vec![7, 8, 9]);
    Ok(())
}

#[test]
fn test_write_back_without_inverse_is_not_encodable() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = stored_tree(&[1]);
    let root = tree.root();
    let data = tree.lookup("data").expect("data");
    let sum = tree.attach_derived(root, "sum", "demo.sum", vec![data]).expect("attach");
    let err = reg
        .write_back(&mut tree, sum, &DerivedValue::Value(Value::UInt(3)))
        .expect_err("no inverse");
    assert_eq!(err.kind(), ErrorKind::NotEncodable);
}

#[test]
fn test_rejected_patch_leaves_tree_untouched() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let mut tree = stored_tree(&[0, 1]);
    reg.attach(&mut tree).expect("attach");
    let checksum = tree.lookup("checksum").expect("checksum");
    let before = encode(&tree, Some(&reg)).expect("encode");

    // A CRC field cannot hold a string.
    let err = reg
        .write_back(&mut tree, checksum, &DerivedValue::Value(Value::Str("x".into())))
        .expect_err("mismatched value");
    assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    assert_eq!(encode(&tree, Some(&reg)).expect("encode"), before);
}

#[test]
fn test_concurrent_evaluation_computes_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let reg = registry(calls.clone());
    let tree = stored_tree(&[0, 1, 0, 2, 0, 3]);
    let payload = tree.lookup("payload").expect("payload");
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let value = reg.evaluate(&tree, payload).expect("evaluate");
                assert_eq!(word_values(&value), vec![1, 2, 3]);
            });
        }
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dump_shows_derived_state() {
    let reg = registry(Arc::new(AtomicUsize::new(0)));
    let tree = stored_tree(&[0, 1]);
    let lazy = dump(&tree, &DumpOptions::default());
    assert!(lazy.contains("payload: <derived `demo.words`, stale>"), "{lazy}");

    let options = DumpOptions {
        registry: Some(&reg),
        ..DumpOptions::default()
    };
    let evaluated = dump(&tree, &options);
    assert!(evaluated.contains("payload: = derived `demo.words`"), "{evaluated}");
    assert!(evaluated.contains("name: \"a.txt\""), "{evaluated}");
    assert!(!tree.is_stale(tree.lookup("payload").expect("payload")));
}
