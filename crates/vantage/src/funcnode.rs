//! Compiled function-node graph consumed by the engine.
//!
//! A function node is a deduplicated, context-shared description of one
//! computation step. The engine instantiates it once per context (area
//! instance or defun invocation) as an evaluation node.

use crate::error::EngineError;
use crate::ops::Builtin;
use crate::result::{DataSourceHandle, NodeResult};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type FnId = u32;
pub type TemplateId = u32;
pub type DefunId = u32;

/// Which context a function node is instantiated in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locality {
    /// One instance for the whole program
    #[default]
    Global,
    /// One instance per area with this template
    Area(TemplateId),
    /// One instance per invocation of this defun
    Defun(DefunId),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Const(NodeResult),
    /// Writable state with an initial value
    State { initial: NodeResult },
    Apply { builtin: Builtin, args: Vec<FnId> },
    AttributeValue { attributes: Vec<(Arc<str>, FnId)> },
    /// Priority-ordered candidates, highest first. A missing qualifier
    /// means "always active".
    Variant {
        qualifiers: Vec<Option<FnId>>,
        values: Vec<FnId>,
        #[serde(default)]
        unmergeable: Vec<bool>,
    },
    Query { query: FnId, data: FnId },
    /// Identify the elements of `data` by the value of `attribute`
    Identify { data: FnId, attribute: Arc<str> },
    ExternalData { source: DataSourceHandle },
    Parameter { defun: DefunId, index: usize },
    /// Apply a one-parameter defun to every element of `data`
    MapDefun { defun: DefunId, data: FnId },
}

impl FunctionKind {
    /// Function nodes this one reads from, in input-slot order.
    pub fn inputs(&self) -> Vec<FnId> {
        match self {
            FunctionKind::Const(_)
            | FunctionKind::State { .. }
            | FunctionKind::ExternalData { .. }
            | FunctionKind::Parameter { .. } => Vec::new(),
            FunctionKind::Apply { args, .. } => args.clone(),
            FunctionKind::AttributeValue { attributes } => attributes.iter().map(|(_, id)| *id).collect(),
            FunctionKind::Variant { qualifiers, values, .. } => {
                qualifiers.iter().flatten().copied().chain(values.iter().copied()).collect()
            }
            FunctionKind::Query { query, data } => vec![*query, *data],
            FunctionKind::Identify { data, .. } => vec![*data],
            FunctionKind::MapDefun { data, .. } => vec![*data],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub id: FnId,
    /// Topological pass assigned by the compiler
    pub step: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub locality: Locality,
    pub kind: FunctionKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Defun {
    pub id: DefunId,
    pub body: FnId,
    pub parameters: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputBinding {
    pub name: String,
    pub node: FnId,
}

/// A compiled program as handed over by the optimizer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub nodes: Vec<FunctionNode>,
    #[serde(default)]
    pub defuns: Vec<Defun>,
    #[serde(default)]
    pub outputs: Vec<OutputBinding>,
}

impl Program {
    pub fn from_json(source: &str) -> Result<Self, EngineError> {
        let program: Program = serde_json::from_str(source)?;
        Ok(program)
    }
}

/// Indexed, validated form of a [`Program`].
#[derive(Debug, Default)]
pub struct FunctionGraph {
    nodes: FxHashMap<FnId, FunctionNode>,
    defuns: FxHashMap<DefunId, Defun>,
    outputs: Vec<OutputBinding>,
}

impl FunctionGraph {
    pub fn new(program: Program) -> Result<Self, EngineError> {
        let mut nodes = FxHashMap::default();
        for node in program.nodes {
            let id = node.id;
            if nodes.insert(id, node).is_some() {
                return Err(EngineError::Program(format!("duplicate function node {}", id)));
            }
        }
        let mut defuns = FxHashMap::default();
        for defun in program.defuns {
            let id = defun.id;
            if defuns.insert(id, defun).is_some() {
                return Err(EngineError::Program(format!("duplicate defun {}", id)));
            }
        }
        let graph = Self {
            nodes,
            defuns,
            outputs: program.outputs,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<(), EngineError> {
        for node in self.nodes.values() {
            for input in node.kind.inputs() {
                if !self.nodes.contains_key(&input) {
                    return Err(EngineError::Program(format!(
                        "function node {} reads unknown node {}",
                        node.id, input
                    )));
                }
            }
            match &node.kind {
                FunctionKind::Variant { qualifiers, values, unmergeable } => {
                    if qualifiers.len() != values.len() {
                        return Err(EngineError::Program(format!(
                            "variant {} has {} qualifiers for {} values",
                            node.id,
                            qualifiers.len(),
                            values.len()
                        )));
                    }
                    if unmergeable.len() > values.len() {
                        return Err(EngineError::Program(format!(
                            "variant {} has more unmergeable flags than values",
                            node.id
                        )));
                    }
                }
                FunctionKind::Parameter { defun, index } => {
                    let def = self.defuns.get(defun).ok_or(EngineError::UnknownDefun(*defun))?;
                    if *index >= def.parameters {
                        return Err(EngineError::Program(format!(
                            "parameter {} out of range for defun {}",
                            index, defun
                        )));
                    }
                }
                FunctionKind::MapDefun { defun, .. } => {
                    let def = self.defuns.get(defun).ok_or(EngineError::UnknownDefun(*defun))?;
                    if def.parameters != 1 {
                        return Err(EngineError::Program(format!(
                            "defun {} mapped over data must take one parameter",
                            defun
                        )));
                    }
                }
                _ => {}
            }
        }
        for defun in self.defuns.values() {
            if !self.nodes.contains_key(&defun.body) {
                return Err(EngineError::UnknownFunctionNode(defun.body));
            }
        }
        for output in &self.outputs {
            if !self.nodes.contains_key(&output.node) {
                return Err(EngineError::UnknownFunctionNode(output.node));
            }
        }
        self.check_acyclic()
    }

    /// Iterative DFS with an explicit stack of (node, next input index).
    fn check_acyclic(&self) -> Result<(), EngineError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: FxHashMap<FnId, Mark> = FxHashMap::default();
        let mut roots: Vec<FnId> = self.nodes.keys().copied().collect();
        roots.sort_unstable();
        for root in roots {
            if marks.contains_key(&root) {
                continue;
            }
            let mut stack: Vec<(FnId, Vec<FnId>, usize)> = vec![(root, self.nodes[&root].kind.inputs(), 0)];
            marks.insert(root, Mark::Visiting);
            while let Some((id, inputs, next)) = stack.last_mut() {
                if let Some(&input) = inputs.get(*next) {
                    *next += 1;
                    match marks.get(&input) {
                        Some(Mark::Visiting) => {
                            return Err(EngineError::Program(format!(
                                "function node {} is part of a cycle through {}",
                                input, id
                            )));
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(input, Mark::Visiting);
                            let inputs = self.nodes[&input].kind.inputs();
                            stack.push((input, inputs, 0));
                        }
                    }
                } else {
                    marks.insert(*id, Mark::Done);
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: FnId) -> Result<&FunctionNode, EngineError> {
        self.nodes.get(&id).ok_or(EngineError::UnknownFunctionNode(id))
    }

    pub fn defun(&self, id: DefunId) -> Result<&Defun, EngineError> {
        self.defuns.get(&id).ok_or(EngineError::UnknownDefun(id))
    }

    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Result<FnId, EngineError> {
        self.outputs
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.node)
            .ok_or_else(|| EngineError::UnknownOutput(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Assembles programs in tests and tools the way the compiler would:
/// every node's step is one past the highest step among its inputs.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    program: Program,
    next_id: FnId,
    next_defun: DefunId,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn step_after(&self, inputs: &[FnId]) -> u32 {
        inputs
            .iter()
            .filter_map(|id| self.program.nodes.iter().find(|n| n.id == *id))
            .map(|n| n.step + 1)
            .max()
            .unwrap_or(0)
    }

    fn locality_of(&self, inputs: &[FnId]) -> Locality {
        // the most local input decides where the node lives
        let mut locality = Locality::Global;
        for node in inputs
            .iter()
            .filter_map(|id| self.program.nodes.iter().find(|n| n.id == *id))
        {
            match (locality, node.locality) {
                (_, Locality::Defun(d)) => locality = Locality::Defun(d),
                (Locality::Global, Locality::Area(t)) => locality = Locality::Area(t),
                _ => {}
            }
        }
        locality
    }

    pub fn add(&mut self, kind: FunctionKind) -> FnId {
        let inputs = kind.inputs();
        let id = self.next_id;
        self.next_id += 1;
        let step = self.step_after(&inputs);
        let locality = self.locality_of(&inputs);
        self.program.nodes.push(FunctionNode {
            id,
            step,
            priority: 0,
            locality,
            kind,
        });
        id
    }

    pub fn constant(&mut self, result: NodeResult) -> FnId {
        self.add(FunctionKind::Const(result))
    }

    pub fn state(&mut self, initial: NodeResult) -> FnId {
        self.add(FunctionKind::State { initial })
    }

    pub fn apply(&mut self, builtin: Builtin, args: &[FnId]) -> FnId {
        self.add(FunctionKind::Apply {
            builtin,
            args: args.to_vec(),
        })
    }

    pub fn attribute_value(&mut self, attributes: &[(&str, FnId)]) -> FnId {
        self.add(FunctionKind::AttributeValue {
            attributes: attributes.iter().map(|(k, id)| (Arc::from(*k), *id)).collect(),
        })
    }

    pub fn variant(&mut self, arms: &[(Option<FnId>, FnId)]) -> FnId {
        self.add(FunctionKind::Variant {
            qualifiers: arms.iter().map(|(q, _)| *q).collect(),
            values: arms.iter().map(|(_, v)| *v).collect(),
            unmergeable: Vec::new(),
        })
    }

    pub fn query(&mut self, query: FnId, data: FnId) -> FnId {
        self.add(FunctionKind::Query { query, data })
    }

    pub fn identify(&mut self, data: FnId, attribute: &str) -> FnId {
        self.add(FunctionKind::Identify {
            data,
            attribute: attribute.into(),
        })
    }

    pub fn external(&mut self, source: DataSourceHandle) -> FnId {
        self.add(FunctionKind::ExternalData { source })
    }

    /// Start a one-parameter defun; returns its id and the parameter node.
    pub fn defun_parameter(&mut self) -> (DefunId, FnId) {
        let defun = self.next_defun;
        self.next_defun += 1;
        let parameter = self.add(FunctionKind::Parameter { defun, index: 0 });
        self.set_locality(parameter, Locality::Defun(defun));
        (defun, parameter)
    }

    pub fn finish_defun(&mut self, defun: DefunId, body: FnId) {
        self.program.defuns.push(Defun {
            id: defun,
            body,
            parameters: 1,
        });
    }

    pub fn map_defun(&mut self, defun: DefunId, data: FnId) -> FnId {
        self.add(FunctionKind::MapDefun { defun, data })
    }

    pub fn set_step(&mut self, id: FnId, step: u32) -> &mut Self {
        if let Some(node) = self.program.nodes.iter_mut().find(|n| n.id == id) {
            node.step = step;
        }
        self
    }

    pub fn set_priority(&mut self, id: FnId, priority: i32) -> &mut Self {
        if let Some(node) = self.program.nodes.iter_mut().find(|n| n.id == id) {
            node.priority = priority;
        }
        self
    }

    pub fn set_locality(&mut self, id: FnId, locality: Locality) -> &mut Self {
        if let Some(node) = self.program.nodes.iter_mut().find(|n| n.id == id) {
            node.locality = locality;
        }
        self
    }

    pub fn output(&mut self, name: &str, node: FnId) -> &mut Self {
        self.program.outputs.push(OutputBinding {
            name: name.to_string(),
            node,
        });
        self
    }

    pub fn build(self) -> Program {
        self.program
    }
}
