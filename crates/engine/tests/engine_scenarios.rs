//! End-to-end engine scenarios: builder laws, internment, operations.

use loam_engine::ops;
use loam_engine::{AutoScenario, Builder, Kind, Value};

fn seq_ints(b: &Builder, xs: &[i64]) -> Value {
    let items: Vec<Value> = xs.iter().map(|&i| b.int_of(i)).collect();
    b.sequence_of(&items)
}

#[test]
fn inline_and_outline_strings() {
    let b = Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap();

    let short = b.str_of("short1");
    assert!(short.is_in_place());
    let bytes = unsafe { short.as_bytes() }.unwrap();
    assert_eq!(bytes.len(), 6);
    assert_eq!(bytes, b"short1");

    let long = b.str_of("long string out of place");
    assert!(!long.is_in_place());
    assert_eq!(unsafe { long.as_str() }, Some("long string out of place"));
}

#[test]
fn dedup_internment_collapses_identical_trees() {
    let b = Builder::with_scenario(AutoScenario::PerTagFreeDedup, 256 * 1024).unwrap();

    let make = |b: &Builder| {
        b.sequence_of(&[
            b.str_of("a string that is not inline"),
            b.int_of(1 << 61),
            b.float_of(0.25),
        ])
    };
    let s1 = make(&b);
    let s2 = make(&b);
    assert_eq!(b.compare(s1, s2), 0);
    // Internment: structurally identical roots share one pointer.
    assert_eq!(s1.payload_ptr(), s2.payload_ptr());

    // intern(intern(x)) == intern(x)
    assert_eq!(b.internalize(s1), s1);
}

#[test]
fn copies_compare_equal_across_builders() {
    let b1 = Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap();
    let b2 = Builder::with_scenario(AutoScenario::PerObjFree, 64 * 1024).unwrap();

    let original = b1.mapping_of(&[
        (b1.str_of("list"), seq_ints(&b1, &[5, 4, 3])),
        (b1.str_of("deep key much longer than seven"), b1.float_of(2.5)),
    ]);
    let copy = b2.deep_copy(original);
    assert!(b2.contains_value(copy));
    assert_eq!(b2.compare(copy, original), 0);
}

#[test]
fn path_set_shares_untouched_spine() {
    let b = Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap();
    // [10, [100, 200]]
    let v = b.sequence_of(&[b.int_of(10), seq_ints(&b, &[100, 200])]);
    let out = ops::set_at_path(&b, v, &[b.int_of(1), b.int_of(1)], b.int_of(2000));

    let inner = ops::get_at(&b, out, 1);
    assert_eq!(unsafe { ops::get_at(&b, inner, 1).as_int() }, Some(2000));
    assert_eq!(unsafe { ops::get_at(&b, inner, 0).as_int() }, Some(100));
    assert_eq!(unsafe { ops::get_at_path(&b, out, &[b.int_of(0)]).as_int() }, Some(10));

    // The original is untouched.
    let old_inner = ops::get_at(&b, v, 1);
    assert_eq!(unsafe { ops::get_at(&b, old_inner, 1).as_int() }, Some(200));
}

#[test]
fn sort_reverse_unique_laws() {
    let b = Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap();
    let xs = seq_ints(&b, &[5, 3, 5, 1, 3, 9]);

    let sorted = ops::sort(&b, xs);
    assert_eq!(b.compare(ops::sort(&b, sorted), sorted), 0);

    let rev = ops::reverse(&b, xs);
    assert_eq!(b.compare(ops::reverse(&b, rev), xs), 0);

    let doubled = ops::concat(&b, xs, &[xs]);
    assert_eq!(
        b.compare(ops::unique(&b, doubled), ops::unique(&b, xs)),
        0
    );
}

#[test]
fn mixed_kind_ordering_is_stable() {
    let b = Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap();
    let mixed = b.sequence_of(&[
        b.str_of("zz"),
        b.int_of(3),
        b.null_of(),
        b.bool_of(true),
        b.float_of(1.5),
    ]);
    let sorted = ops::sort(&b, mixed);
    let kinds: Vec<Kind> = unsafe { sorted.seq_items() }
        .unwrap()
        .iter()
        .map(|v| v.kind())
        .collect();
    assert_eq!(
        kinds,
        vec![Kind::Null, Kind::Bool, Kind::Int, Kind::Float, Kind::String]
    );
}

#[test]
fn empty_and_single_element_collections() {
    let b = Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap();

    let empty_seq = b.sequence_of(&[]);
    let empty_map = b.mapping_of(&[]);
    assert_eq!(unsafe { empty_seq.collection_count() }, Some(0));
    assert_eq!(unsafe { empty_map.collection_count() }, Some(0));
    assert_eq!(b.compare(empty_seq, b.sequence_of(&[])), 0);
    assert_ne!(b.compare(empty_seq, empty_map), 0);

    let one = b.sequence_of(&[b.int_of(1)]);
    assert_eq!(unsafe { one.collection_count() }, Some(1));
    assert_eq!(b.compare(ops::reverse(&b, one), one), 0);

    let empty_str = b.str_of("");
    assert_eq!(unsafe { empty_str.as_bytes() }, Some(&b""[..]));
}

#[test]
fn release_then_fresh_tag_starts_empty() {
    use loam_engine::{TagAllocator, TagConfig};
    let alloc = loam_engine::MallocAllocator::new();
    let t1 = alloc.get_tag(&TagConfig::default()).unwrap();
    alloc.alloc(t1, 128, 8).unwrap();
    assert!(alloc.info(t1).unwrap().used > 0);
    alloc.release_tag(t1);
    let t2 = alloc.get_tag(&TagConfig::default()).unwrap();
    assert_eq!(alloc.info(t2).unwrap().used, 0);
}
