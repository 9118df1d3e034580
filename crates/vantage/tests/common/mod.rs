//! Shared harness for the integration tests.
#![allow(dead_code)]

use vantage::funcnode::FnId;
use vantage::{
    CycleReport, Engine, EngineConfig, EnvId, NodeId, NodeResult, Program, Value, WriteMode,
};

pub fn n(v: f64) -> Value {
    Value::number(v)
}

pub fn t(s: &str) -> Value {
    Value::text(s)
}

pub fn b(v: bool) -> Value {
    Value::Bool(v)
}

pub fn obj(fields: &[(&str, Vec<Value>)]) -> Value {
    Value::object(fields.iter().map(|(k, v)| (k.to_string(), v.clone())))
}

pub fn os(values: &[Value]) -> NodeResult {
    NodeResult::new(values.to_vec())
}

/// An engine with every program output observed and one cycle run.
pub struct TestEngine {
    pub engine: Engine,
    pub first_cycle: CycleReport,
}

impl TestEngine {
    pub fn new(program: Program) -> Self {
        Self::with_config(program, EngineConfig::default())
    }

    pub fn with_config(program: Program, config: EngineConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut engine = Engine::new(program, config).expect("valid program");
        engine.observe_all_outputs().expect("outputs");
        let first_cycle = engine.run_cycle();
        Self { engine, first_cycle }
    }

    pub fn node(&mut self, fn_id: FnId) -> NodeId {
        self.engine.node_for(fn_id, EnvId::ROOT).expect("node")
    }

    pub fn output(&self, name: &str) -> Vec<Value> {
        self.engine.read_output(name).expect("output")
    }

    pub fn assert_output(&self, name: &str, expected: &[Value]) {
        assert_eq!(self.output(name), expected, "output '{}'", name);
    }

    /// Replace the value of a `state` node and run one cycle.
    pub fn set(&mut self, fn_id: FnId, values: &[Value]) -> CycleReport {
        let node = self.node(fn_id);
        self.engine
            .write(node, os(values), WriteMode::Replace, None, None)
            .expect("writable");
        self.engine.run_cycle()
    }

    pub fn cycle(&mut self) -> CycleReport {
        self.engine.run_cycle()
    }
}
