//! Vantage: incremental evaluation of compiled constraint programs.
//!
//! A compiled function-node graph is instantiated into evaluation nodes
//! that compute only while observed, re-evaluate only when an input
//! changed, and reduce priority-ordered variants with the merge engine.

pub mod arena;
pub mod config;
pub mod datasource;
pub mod diagnostics;
pub mod engine;
pub mod environment;
pub mod error;
pub mod funcnode;
pub mod merge;
pub mod node;
pub mod ops;
pub mod result;
pub mod scheduler;
pub mod value;

pub use arena::NodeId;
pub use config::EngineConfig;
pub use datasource::{DataSourceProvider, SharedData};
pub use engine::{CycleOutcome, CycleReport, Engine, WriteMode, WritePosition};
pub use environment::EnvId;
pub use error::{EngineError, EvalError};
pub use funcnode::{FunctionGraph, Locality, Program, ProgramBuilder};
pub use merge::{merge_pair, merge_variants, Candidate};
pub use ops::Builtin;
pub use result::{DataSourceHandle, MergeAttributes, MergeDirective, NodeResult};
pub use value::Value;
