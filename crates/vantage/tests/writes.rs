//! External writes into `state` nodes: modes, positions and attribute paths.

mod common;

use common::{b, n, obj, os, t, TestEngine};
use vantage::{Builtin, EngineError, EnvId, ProgramBuilder, WriteMode, WritePosition};

fn single_state(initial: vantage::NodeResult) -> (TestEngine, vantage::NodeId) {
    let mut pb = ProgramBuilder::new();
    let st = pb.state(initial);
    pb.output("st", st);
    let mut engine = TestEngine::new(pb.build());
    let node = engine.node(st);
    (engine, node)
}

#[test]
fn merge_mode_overlays_the_written_object() {
    let (mut engine, node) = single_state(os(&[obj(&[("a", vec![n(1.0)]), ("b", vec![n(2.0)])])]));
    let changed = engine
        .engine
        .write(node, os(&[obj(&[("a", vec![n(5.0)])])]), WriteMode::Merge, None, None)
        .unwrap();
    assert!(changed);
    engine.cycle();
    engine.assert_output("st", &[obj(&[("a", vec![n(5.0)]), ("b", vec![n(2.0)])])]);
}

#[test]
fn push_mode_appends() {
    let (mut engine, node) = single_state(os(&[n(1.0)]));
    engine.engine.write(node, os(&[n(2.0)]), WriteMode::Push, None, None).unwrap();
    engine.engine.write(node, os(&[n(3.0)]), WriteMode::Push, None, None).unwrap();
    engine.cycle();
    engine.assert_output("st", &[n(1.0), n(2.0), n(3.0)]);
}

#[test]
fn identical_write_reports_no_change() {
    let (mut engine, node) = single_state(os(&[n(4.0)]));
    let changed = engine.engine.write(node, os(&[n(4.0)]), WriteMode::Replace, None, None).unwrap();
    assert!(!changed);
    assert_eq!(engine.cycle().stats.evaluations, 0);
}

#[test]
fn positions_are_applied_back_to_front() {
    let (mut engine, node) = single_state(os(&[n(1.0), n(2.0), n(3.0), n(4.0)]));
    let positions = [WritePosition::new(0, 1), WritePosition::new(2, 2)];
    engine
        .engine
        .write(node, os(&[n(9.0)]), WriteMode::Replace, None, Some(&positions))
        .unwrap();
    engine.cycle();
    engine.assert_output("st", &[n(9.0), n(2.0), n(9.0)]);
}

#[test]
fn positional_write_keeps_identifiers_aligned() {
    let rows = os(&[t("a"), t("b"), t("c")]).with_identifiers(vec![n(10.0), n(20.0), n(30.0)]);
    let (mut engine, node) = single_state(rows);
    engine
        .engine
        .write(node, os(&[t("z")]), WriteMode::Replace, None, Some(&[WritePosition::new(1, 1)]))
        .unwrap();
    engine.cycle();

    let result = engine.engine.result(node).unwrap();
    assert_eq!(result.values(), &[t("a"), t("z"), t("c")]);
    assert_eq!(result.identifiers.as_deref(), Some(&[n(10.0), t("z"), n(30.0)][..]));
}

#[test]
fn attribute_path_write_touches_every_selected_element() {
    let (mut engine, node) = single_state(os(&[
        obj(&[("a", vec![n(1.0)])]),
        obj(&[("a", vec![n(2.0)])]),
        obj(&[("a", vec![n(3.0)])]),
    ]));
    let position = WritePosition::new(0, 2).with_path(&["done"]);
    engine
        .engine
        .write(node, os(&[b(true)]), WriteMode::Merge, None, Some(&[position]))
        .unwrap();
    engine.cycle();
    engine.assert_output(
        "st",
        &[
            obj(&[("a", vec![n(1.0)]), ("done", vec![b(true)])]),
            obj(&[("a", vec![n(2.0)]), ("done", vec![b(true)])]),
            obj(&[("a", vec![n(3.0)])]),
        ],
    );
}

#[test]
fn only_state_nodes_accept_writes() {
    let mut pb = ProgramBuilder::new();
    let st = pb.state(os(&[n(1.0)]));
    let neg = pb.apply(Builtin::Minus, &[st, st]);
    pb.output("zero", neg);
    let mut engine = TestEngine::new(pb.build());
    let neg_node = engine.node(neg);

    let err = engine
        .engine
        .write(neg_node, os(&[n(1.0)]), WriteMode::Replace, None, None)
        .unwrap_err();
    assert!(matches!(err, EngineError::NotWritable(id) if id == neg_node));

    // by function node id
    assert!(engine.engine.write_state(st, EnvId::ROOT, os(&[n(6.0)]), WriteMode::Replace).unwrap());
    engine.cycle();
    engine.assert_output("zero", &[n(0.0)]);
}
