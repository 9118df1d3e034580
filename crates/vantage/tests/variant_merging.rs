//! Variants reduced by the merge engine inside a running engine.

mod common;

use common::{b, n, obj, os, t, TestEngine};
use vantage::{Builtin, MergeAttributes, MergeDirective, NodeResult, ProgramBuilder, WriteMode};

#[test]
fn overlay_follows_qualifiers() {
    let mut pb = ProgramBuilder::new();
    let q1 = pb.state(os(&[b(true)]));
    let q2 = pb.state(os(&[b(true)]));
    let high = pb.constant(os(&[obj(&[("a", vec![n(1.0)]), ("x", vec![t("A")])])]));
    let low = pb.constant(os(&[obj(&[("a", vec![n(2.0)]), ("y", vec![t("B")])])]));
    let v = pb.variant(&[(Some(q1), high), (Some(q2), low)]);
    pb.output("v", v);
    let mut engine = TestEngine::new(pb.build());

    engine.assert_output(
        "v",
        &[obj(&[("a", vec![n(1.0)]), ("x", vec![t("A")]), ("y", vec![t("B")])])],
    );

    engine.set(q1, &[b(false)]);
    engine.assert_output("v", &[obj(&[("a", vec![n(2.0)]), ("y", vec![t("B")])])]);

    engine.set(q2, &[b(false)]);
    engine.assert_output("v", &[]);

    engine.set(q1, &[b(true)]);
    engine.assert_output("v", &[obj(&[("a", vec![n(1.0)]), ("x", vec![t("A")])])]);
}

#[test]
fn identified_rows_align_across_variants() {
    let mut pb = ProgramBuilder::new();
    let hi_rows = pb.state(os(&[
        obj(&[("id", vec![n(1.0)]), ("v", vec![t("a")])]),
        obj(&[("id", vec![n(2.0)]), ("v", vec![t("b")])]),
    ]));
    let lo_rows = pb.state(os(&[
        obj(&[("id", vec![n(2.0)]), ("v", vec![t("B")]), ("w", vec![t("x")])]),
        obj(&[("id", vec![n(3.0)]), ("v", vec![t("c")])]),
    ]));
    let hi = pb.identify(hi_rows, "id");
    let lo = pb.identify(lo_rows, "id");
    let v = pb.variant(&[(None, hi), (None, lo)]);
    pb.output("rows", v);
    let mut engine = TestEngine::new(pb.build());

    engine.assert_output(
        "rows",
        &[
            obj(&[("id", vec![n(1.0)]), ("v", vec![t("a")])]),
            obj(&[("id", vec![n(2.0)]), ("v", vec![t("b")]), ("w", vec![t("x")])]),
            obj(&[("id", vec![n(3.0)]), ("v", vec![t("c")])]),
        ],
    );

    // dropping row 2 from the high side exposes the low one unchanged
    engine.set(hi_rows, &[obj(&[("id", vec![n(1.0)]), ("v", vec![t("a")])])]);
    let rows = engine.output("rows");
    assert_eq!(rows.len(), 3);
    assert!(rows.contains(&obj(&[("id", vec![n(2.0)]), ("v", vec![t("B")]), ("w", vec![t("x")])])));
}

#[test]
fn pushed_write_appends_after_lower_variants() {
    let mut pb = ProgramBuilder::new();
    let added = pb.state(NodeResult::empty());
    let base = pb.constant(os(&[t("x")]));
    let v = pb.variant(&[(None, added), (None, base)]);
    pb.output("list", v);
    let mut engine = TestEngine::new(pb.build());
    engine.assert_output("list", &[t("x")]);

    let node = engine.node(added);
    engine
        .engine
        .write(
            node,
            os(&[t("y")]),
            WriteMode::Replace,
            Some(MergeAttributes::Global(MergeDirective::PUSH)),
            None,
        )
        .unwrap();
    engine.cycle();
    engine.assert_output("list", &[t("x"), t("y")]);
}

#[test]
fn atomic_element_blocks_lower_merging() {
    let mut pb = ProgramBuilder::new();
    let high = pb.constant(
        os(&[obj(&[("a", vec![n(1.0)]), ("b", vec![n(2.0)])])])
            .with_merge_attributes(MergeAttributes::Global(MergeDirective::ATOMIC)),
    );
    let low = pb.constant(os(&[obj(&[("a", vec![n(9.0)]), ("c", vec![n(3.0)])])]));
    let v = pb.variant(&[(None, high), (None, low)]);
    pb.output("v", v);
    let engine = TestEngine::new(pb.build());

    engine.assert_output("v", &[obj(&[("a", vec![n(1.0)]), ("b", vec![n(2.0)])])]);
}

#[test]
fn scalar_high_variant_replaces_lower() {
    let mut pb = ProgramBuilder::new();
    let flag = pb.state(os(&[b(true)]));
    let seven = pb.constant(os(&[n(7.0)]));
    let three = pb.constant(os(&[n(3.0)]));
    let v = pb.variant(&[(Some(flag), seven), (None, three)]);
    let doubled = pb.apply(Builtin::Plus, &[v, v]);
    pb.output("doubled", doubled);
    let mut engine = TestEngine::new(pb.build());

    engine.assert_output("doubled", &[n(14.0)]);
    engine.set(flag, &[b(false)]);
    engine.assert_output("doubled", &[n(6.0)]);
}
