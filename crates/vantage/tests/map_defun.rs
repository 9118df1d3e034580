//! Mapping a defun over data: one invocation environment per element.

mod common;

use common::{n, obj, os, t, TestEngine};
use vantage::funcnode::FnId;
use vantage::{Builtin, NodeResult, ProgramBuilder};

/// `data` mapped through `x * 2`.
fn doubling(initial: NodeResult) -> (TestEngine, FnId) {
    let mut pb = ProgramBuilder::new();
    let data = pb.state(initial);
    let (defun, param) = pb.defun_parameter();
    let two = pb.constant(os(&[n(2.0)]));
    let body = pb.apply(Builtin::Mul, &[param, two]);
    pb.finish_defun(defun, body);
    let mapped = pb.map_defun(defun, data);
    pb.output("mapped", mapped);
    (TestEngine::new(pb.build()), data)
}

#[test]
fn instances_follow_the_data() {
    let (mut engine, data) = doubling(os(&[n(1.0), n(2.0), n(3.0)]));
    engine.assert_output("mapped", &[n(2.0), n(4.0), n(6.0)]);
    // root plus one invocation per element
    assert_eq!(engine.engine.environments().len(), 4);
    let nodes_with_three = engine.engine.len();

    engine.set(data, &[n(5.0)]);
    engine.assert_output("mapped", &[n(10.0)]);
    assert_eq!(engine.engine.environments().len(), 2);
    // two nodes (parameter, body) per invocation
    assert_eq!(engine.engine.len(), nodes_with_three - 4);

    engine.set(data, &[n(1.0), n(2.0), n(3.0), n(4.0)]);
    engine.assert_output("mapped", &[n(2.0), n(4.0), n(6.0), n(8.0)]);
    assert_eq!(engine.engine.environments().len(), 5);

    engine.set(data, &[]);
    engine.assert_output("mapped", &[]);
    assert_eq!(engine.engine.environments().len(), 1);
}

#[test]
fn element_updates_reuse_invocations() {
    let (mut engine, data) = doubling(os(&[n(1.0), n(2.0)]));
    let envs_before: Vec<_> = engine.engine.environments().get(vantage::EnvId::ROOT).unwrap().children.clone();

    engine.set(data, &[n(1.0), n(7.0)]);
    engine.assert_output("mapped", &[n(2.0), n(14.0)]);
    let envs_after = engine.engine.environments().get(vantage::EnvId::ROOT).unwrap().children.clone();
    assert_eq!(envs_before, envs_after);
}

#[test]
fn identities_of_the_data_carry_over() {
    let mut pb = ProgramBuilder::new();
    let rows = pb.state(os(&[
        obj(&[("id", vec![t("a")]), ("n", vec![n(1.0)])]),
        obj(&[("id", vec![t("b")]), ("n", vec![n(2.0)])]),
    ]));
    let identified = pb.identify(rows, "id");
    let (defun, param) = pb.defun_parameter();
    let size = pb.apply(Builtin::Size, &[param]);
    pb.finish_defun(defun, size);
    let mapped = pb.map_defun(defun, identified);
    pb.output("sizes", mapped);
    let mut engine = TestEngine::new(pb.build());

    engine.assert_output("sizes", &[n(1.0), n(1.0)]);
    let mapped_node = engine.node(mapped);
    assert_eq!(
        engine.engine.result(mapped_node).unwrap().identifiers.as_deref(),
        Some(&[t("a"), t("b")][..])
    );
}
