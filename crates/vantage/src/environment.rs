//! Evaluation environments.
//!
//! An environment is the context a function node is instantiated in: the
//! program root, an area instance, or one invocation of a defun. Each one
//! caches the evaluation nodes built for it, so looking up a function node
//! twice in the same context yields the same evaluation node.

use crate::arena::NodeId;
use crate::error::EngineError;
use crate::funcnode::{DefunId, FnId, Locality, TemplateId};
use crate::result::NodeResult;
use rustc_hash::FxHashMap;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const ROOT: Self = Self(0);
}

impl Default for EnvId {
    fn default() -> Self {
        Self::ROOT
    }
}

impl std::fmt::Display for EnvId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "env{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EnvKind {
    Root,
    Area { template: TemplateId },
    Defun { defun: DefunId },
}

#[derive(Debug)]
pub struct Environment {
    pub kind: EnvKind,
    pub parent: Option<EnvId>,
    pub children: Vec<EnvId>,
    nodes: FxHashMap<FnId, NodeId>,
    arguments: Vec<NodeResult>,
    ref_count: u32,
}

impl Environment {
    fn new(kind: EnvKind, parent: Option<EnvId>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            nodes: FxHashMap::default(),
            arguments: Vec::new(),
            ref_count: 1,
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Registry of all live environments, owned by the engine.
#[derive(Debug)]
pub struct Environments {
    envs: FxHashMap<EnvId, Environment>,
    next_id: u32,
}

impl Default for Environments {
    fn default() -> Self {
        Self::new()
    }
}

impl Environments {
    pub fn new() -> Self {
        let mut envs = FxHashMap::default();
        envs.insert(EnvId::ROOT, Environment::new(EnvKind::Root, None));
        Self { envs, next_id: 1 }
    }

    fn create(&mut self, kind: EnvKind, parent: EnvId) -> Result<EnvId, EngineError> {
        let id = EnvId(self.next_id);
        let parent_env = self
            .envs
            .get_mut(&parent)
            .ok_or_else(|| EngineError::MissingEnvironment(parent.to_string()))?;
        parent_env.children.push(id);
        self.next_id += 1;
        self.envs.insert(id, Environment::new(kind, Some(parent)));
        Ok(id)
    }

    pub fn create_area(&mut self, parent: EnvId, template: TemplateId) -> Result<EnvId, EngineError> {
        self.create(EnvKind::Area { template }, parent)
    }

    pub fn create_defun_invocation(
        &mut self,
        parent: EnvId,
        defun: DefunId,
        arguments: Vec<NodeResult>,
    ) -> Result<EnvId, EngineError> {
        let id = self.create(EnvKind::Defun { defun }, parent)?;
        if let Some(env) = self.envs.get_mut(&id) {
            env.arguments = arguments;
        }
        Ok(id)
    }

    pub fn get(&self, env: EnvId) -> Option<&Environment> {
        self.envs.get(&env)
    }

    pub fn contains(&self, env: EnvId) -> bool {
        self.envs.contains_key(&env)
    }

    pub fn parent(&self, env: EnvId) -> Option<EnvId> {
        self.envs.get(&env).and_then(|e| e.parent)
    }

    fn ancestors(&self, env: EnvId) -> impl Iterator<Item = (EnvId, &Environment)> {
        std::iter::successors(self.envs.get(&env).map(|e| (env, e)), |(_, e)| {
            e.parent.and_then(|p| self.envs.get(&p).map(|pe| (p, pe)))
        })
    }

    /// Nearest environment, starting at `env` itself, that is an instance
    /// of area template `template`.
    pub fn parent_with_template_id(&self, env: EnvId, template: TemplateId) -> Option<EnvId> {
        self.ancestors(env)
            .find(|(_, e)| e.kind == EnvKind::Area { template })
            .map(|(id, _)| id)
    }

    pub fn parent_with_defun(&self, env: EnvId, defun: DefunId) -> Option<EnvId> {
        self.ancestors(env)
            .find(|(_, e)| e.kind == EnvKind::Defun { defun })
            .map(|(id, _)| id)
    }

    /// The area a defun invocation runs on behalf of (root if none).
    pub fn evaluation_area(&self, env: EnvId) -> EnvId {
        self.ancestors(env)
            .find(|(_, e)| !matches!(e.kind, EnvKind::Defun { .. }))
            .map(|(id, _)| id)
            .unwrap_or(EnvId::ROOT)
    }

    /// Environment in which a node with `locality` lives when requested from `env`.
    pub fn resolve(&self, env: EnvId, locality: Locality) -> Result<EnvId, EngineError> {
        match locality {
            Locality::Global => Ok(EnvId::ROOT),
            Locality::Area(template) => self
                .parent_with_template_id(env, template)
                .ok_or_else(|| EngineError::MissingEnvironment(format!("area template {} from {}", template, env))),
            Locality::Defun(defun) => self
                .parent_with_defun(env, defun)
                .ok_or_else(|| EngineError::MissingEnvironment(format!("defun {} from {}", defun, env))),
        }
    }

    pub fn link(&mut self, env: EnvId) {
        if let Some(e) = self.envs.get_mut(&env) {
            e.ref_count += 1;
        }
    }

    /// Returns true when the last reference is gone.
    pub fn unlink(&mut self, env: EnvId) -> bool {
        match self.envs.get_mut(&env) {
            Some(e) => {
                e.ref_count = e.ref_count.saturating_sub(1);
                e.ref_count == 0
            }
            None => false,
        }
    }

    /// Drop an environment record. Its nodes must already be destroyed.
    pub fn remove(&mut self, env: EnvId) -> Option<Environment> {
        if env == EnvId::ROOT {
            return None;
        }
        let removed = self.envs.remove(&env)?;
        if let Some(parent) = removed.parent.and_then(|p| self.envs.get_mut(&p)) {
            parent.children.retain(|c| *c != env);
        }
        Some(removed)
    }

    pub fn cached(&self, env: EnvId, fn_id: FnId) -> Option<NodeId> {
        self.envs.get(&env).and_then(|e| e.nodes.get(&fn_id).copied())
    }

    pub fn insert(&mut self, env: EnvId, fn_id: FnId, node: NodeId) {
        if let Some(e) = self.envs.get_mut(&env) {
            e.nodes.insert(fn_id, node);
        }
    }

    pub fn forget(&mut self, env: EnvId, fn_id: FnId) {
        if let Some(e) = self.envs.get_mut(&env) {
            e.nodes.remove(&fn_id);
        }
    }

    pub fn nodes_in(&self, env: EnvId) -> Vec<NodeId> {
        self.envs
            .get(&env)
            .map(|e| e.nodes.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn argument(&self, env: EnvId, index: usize) -> Option<&NodeResult> {
        self.envs.get(&env).and_then(|e| e.arguments.get(index))
    }

    /// Returns true when the stored argument changed.
    pub fn set_argument(&mut self, env: EnvId, index: usize, value: NodeResult) -> bool {
        let Some(e) = self.envs.get_mut(&env) else {
            return false;
        };
        if e.arguments.len() <= index {
            e.arguments.resize_with(index + 1, NodeResult::empty);
        }
        if e.arguments[index] == value {
            return false;
        }
        e.arguments[index] = value;
        true
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn locality_resolves_through_ancestors() {
        let mut envs = Environments::new();
        let area = envs.create_area(EnvId::ROOT, 7).unwrap();
        let inner = envs.create_area(area, 8).unwrap();
        let call = envs.create_defun_invocation(inner, 3, vec![]).unwrap();

        assert_eq!(envs.resolve(call, Locality::Global).unwrap(), EnvId::ROOT);
        assert_eq!(envs.resolve(call, Locality::Area(7)).unwrap(), area);
        assert_eq!(envs.resolve(call, Locality::Defun(3)).unwrap(), call);
        assert_eq!(envs.evaluation_area(call), inner);
        assert!(matches!(
            envs.resolve(area, Locality::Area(8)),
            Err(EngineError::MissingEnvironment(_))
        ));
    }

    #[test]
    fn link_counting() {
        let mut envs = Environments::new();
        let area = envs.create_area(EnvId::ROOT, 1).unwrap();
        envs.link(area);
        assert!(!envs.unlink(area));
        assert!(envs.unlink(area));
        assert!(envs.remove(area).is_some());
        assert!(envs.get(EnvId::ROOT).unwrap().children.is_empty());
        assert!(envs.remove(EnvId::ROOT).is_none());
    }

    #[test]
    fn arguments_report_changes() {
        let mut envs = Environments::new();
        let call = envs.create_defun_invocation(EnvId::ROOT, 0, vec![NodeResult::empty()]).unwrap();
        let one = NodeResult::single(Value::number(1.0));
        assert!(envs.set_argument(call, 0, one.clone()));
        assert!(!envs.set_argument(call, 0, one.clone()));
        assert_eq!(envs.argument(call, 0), Some(&one));
    }
}
