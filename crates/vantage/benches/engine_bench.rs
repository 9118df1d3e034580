//! Engine benchmarks: change propagation, variant merging, mapped defuns.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use vantage::merge::{merge_variants, Candidate};
use vantage::{Builtin, Engine, EngineConfig, EnvId, NodeResult, ProgramBuilder, Value, WriteMode};

/// A chain of `n` additions fed by one writable node.
fn chain_engine(n: usize) -> (Engine, vantage::NodeId) {
    let mut b = ProgramBuilder::new();
    let input = b.state(NodeResult::single(Value::number(0.0)));
    let one = b.constant(NodeResult::single(Value::number(1.0)));
    let mut last = input;
    for _ in 0..n {
        last = b.apply(Builtin::Plus, &[last, one]);
    }
    b.output("end", last);
    let mut engine = Engine::new(b.build(), EngineConfig::default()).expect("valid program");
    engine.observe_output("end").expect("output exists");
    engine.run_cycle();
    let input_node = engine.node_for(input, EnvId::ROOT).expect("input node");
    (engine, input_node)
}

fn bench_chain_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_propagation");

    for n in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("write_and_cycle", n), &n, |b, &n| {
            let (mut engine, input) = chain_engine(n);
            let mut counter = 0.0;
            b.iter(|| {
                counter += 1.0;
                engine
                    .write(input, NodeResult::single(Value::number(counter)), WriteMode::Replace, None, None)
                    .expect("writable");
                engine.run_cycle();
            });
        });

        // Nothing dirty: a cycle should cost next to nothing
        group.bench_with_input(BenchmarkId::new("steady_state", n), &n, |b, &n| {
            let (mut engine, _) = chain_engine(n);
            b.iter(|| {
                engine.run_cycle();
            });
        });
    }

    group.finish();
}

fn rows(n: usize, label: &str) -> NodeResult {
    let values = (0..n)
        .map(|i| {
            Value::object([
                ("id", vec![Value::number(i as f64)]),
                ("label", vec![Value::text(format!("{}{}", label, i))]),
            ])
        })
        .collect();
    let ids = (0..n).map(|i| Value::number(i as f64)).collect();
    NodeResult::new(values).with_identifiers(ids)
}

fn bench_identity_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_merge");

    for n in [10, 100, 1000] {
        let high = rows(n, "high");
        let low = rows(n + n / 2, "low");
        group.bench_with_input(BenchmarkId::new("two_candidates", n), &n, |b, _| {
            b.iter(|| merge_variants(&[Candidate::new(&high), Candidate::new(&low)]));
        });
    }

    group.finish();
}

fn bench_map_defun(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_defun");

    for n in [10, 100] {
        group.bench_with_input(BenchmarkId::new("grow_from_empty", n), &n, |b, &n| {
            b.iter(|| {
                let mut pb = ProgramBuilder::new();
                let data = pb.state(NodeResult::empty());
                let (defun, param) = pb.defun_parameter();
                let two = pb.constant(NodeResult::single(Value::number(2.0)));
                let body = pb.apply(Builtin::Mul, &[param, two]);
                pb.finish_defun(defun, body);
                let mapped = pb.map_defun(defun, data);
                pb.output("mapped", mapped);

                let mut engine = Engine::new(pb.build(), EngineConfig::default()).expect("valid program");
                engine.observe_output("mapped").expect("output exists");
                let data_node = engine.node_for(data, EnvId::ROOT).expect("data node");
                let values = (0..n).map(|i| Value::number(i as f64)).collect();
                engine
                    .write(data_node, NodeResult::new(values), WriteMode::Replace, None, None)
                    .expect("writable");
                engine.run_cycle();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_chain_propagation,
    bench_identity_merge,
    bench_map_defun
);
criterion_main!(benches);
