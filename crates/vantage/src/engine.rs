//! The engine: owns the node arena, the queue and the environments, and
//! drives the activation and update protocol between nodes.
//!
//! Nodes only refer to each other through [`NodeId`]s, so every protocol
//! step that touches more than one node lives here rather than on the node.

use crate::arena::{NodeArena, NodeId};
use crate::config::EngineConfig;
use crate::datasource::{DataSourceProvider, DataSourceRegistry};
use crate::diagnostics::{find_deferral_cycles, Profile};
use crate::environment::{EnvId, Environments};
use crate::error::EngineError;
use crate::funcnode::{DefunId, FnId, FunctionGraph, FunctionKind, Program, TemplateId};
use crate::merge::{merge_pair, tag_all};
use crate::node::{EvalContext, Evaluation, EvaluationNode, Inputs, NodeKind, WatcherEntry, WatcherId};
use crate::result::{DataSourceHandle, MergeAttributes, MergeDirective, NodeResult};
use crate::scheduler::{CycleStats, QueueKey, Scheduler};
use crate::value::{AttributeMap, Value};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// How a written value combines with the value already stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Replace,
    /// Written value merged over the old one
    Merge,
    /// Written value appended after the old one
    Push,
}

/// Element range `[index, index + length)`, optionally narrowed to an
/// attribute path inside each element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WritePosition {
    pub index: usize,
    #[serde(default = "one")]
    pub length: usize,
    #[serde(default)]
    pub path: Vec<Arc<str>>,
}

fn one() -> usize {
    1
}

impl WritePosition {
    pub fn new(index: usize, length: usize) -> Self {
        Self {
            index,
            length,
            path: Vec::new(),
        }
    }

    pub fn with_path<S: AsRef<str>>(mut self, path: &[S]) -> Self {
        self.path = path.iter().map(|s| Arc::from(s.as_ref())).collect();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleOutcome {
    Stable,
    /// The evaluation cap was hit; outputs may be stale
    Unstable { pending: usize },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub stats: CycleStats,
    pub outcome: CycleOutcome,
    /// Deferral cycles found when the cycle stalled
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deferral_cycles: Vec<Vec<NodeId>>,
    /// Dirty nodes whose value could not be computed yet; they run again
    /// at the start of the next cycle
    pub retries: usize,
}

impl CycleReport {
    pub fn is_stable(&self) -> bool {
        self.outcome == CycleOutcome::Stable
    }
}

pub struct Engine {
    pub(crate) graph: FunctionGraph,
    pub(crate) arena: NodeArena,
    pub(crate) scheduler: Scheduler,
    pub(crate) environments: Environments,
    pub(crate) data_sources: DataSourceRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) profile: Profile,
    next_watcher_id: WatcherId,
    outputs: BTreeMap<String, NodeId>,
}

impl Engine {
    pub fn new(program: Program, config: EngineConfig) -> Result<Self, EngineError> {
        Ok(Self::with_graph(FunctionGraph::new(program)?, config))
    }

    pub fn with_graph(graph: FunctionGraph, config: EngineConfig) -> Self {
        Self {
            graph,
            arena: NodeArena::new(),
            scheduler: Scheduler::new(),
            environments: Environments::new(),
            data_sources: DataSourceRegistry::new(),
            config,
            profile: Profile::default(),
            next_watcher_id: 1,
            outputs: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn graph(&self) -> &FunctionGraph {
        &self.graph
    }

    pub fn environments(&self) -> &Environments {
        &self.environments
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn node(&self, id: NodeId) -> Option<&EvaluationNode> {
        self.arena.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &EvaluationNode)> {
        self.arena.iter()
    }

    /// Number of live evaluation nodes.
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn register_data_source(&mut self, provider: Box<dyn DataSourceProvider>) -> DataSourceHandle {
        self.data_sources.register(provider)
    }

    pub fn data_sources(&self) -> &DataSourceRegistry {
        &self.data_sources
    }

    fn ctx(&self) -> EvalContext<'_> {
        EvalContext {
            arena: &self.arena,
            environments: &self.environments,
            data_sources: &self.data_sources,
        }
    }

    // ==================================================================
    // Environments and node construction
    // ==================================================================

    pub fn create_area(&mut self, parent: EnvId, template: TemplateId) -> Result<EnvId, EngineError> {
        self.environments.create_area(parent, template)
    }

    pub fn link_environment(&mut self, env: EnvId) {
        self.environments.link(env);
    }

    /// Drop one reference; the environment and its nodes go with the last.
    pub fn unlink_environment(&mut self, env: EnvId) {
        if self.environments.unlink(env) {
            self.release_environment(env);
        }
    }

    /// Destroy every node built in `env` and its child environments.
    pub fn release_environment(&mut self, env: EnvId) {
        if env == EnvId::ROOT || !self.environments.contains(env) {
            return;
        }
        let children = self
            .environments
            .get(env)
            .map(|e| e.children.clone())
            .unwrap_or_default();
        for child in children.into_iter().rev() {
            self.release_environment(child);
        }
        // consumers are built after their inputs: destroy newest first
        let mut nodes: Vec<(WatcherId, NodeId)> = self
            .environments
            .nodes_in(env)
            .into_iter()
            .filter_map(|id| self.arena.get(id).map(|n| (n.watcher_id, id)))
            .collect();
        nodes.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (_, id) in nodes {
            if self.arena.is_valid(id) {
                self.destroy_node(id);
            }
        }
        self.environments.remove(env);
        log::debug!("released {}", env);
    }

    /// Look up the evaluation node backing `fn_id` as seen from `env`,
    /// building it (and its inputs) on first use.
    pub fn node_for(&mut self, fn_id: FnId, env: EnvId) -> Result<NodeId, EngineError> {
        let fnode = self.graph.node(fn_id)?;
        let target_env = self.environments.resolve(env, fnode.locality)?;
        if let Some(id) = self.environments.cached(target_env, fn_id) {
            return Ok(id);
        }
        let (step, priority) = (fnode.step, fnode.priority);
        let kind = NodeKind::from_function(&fnode.kind);
        let input_fns = fnode.kind.inputs();
        let constant = match &fnode.kind {
            FunctionKind::Const(result) => Some(result.clone()),
            _ => None,
        };

        let mut inputs = Inputs::new();
        for input in input_fns {
            inputs.push(self.node_for(input, target_env)?);
        }

        let watcher_id = self.next_watcher_id();
        let mut node = EvaluationNode::new(watcher_id, Some(fn_id), target_env, kind, inputs.clone(), step, priority);
        if let Some(result) = constant {
            node.result = result;
            node.constant = true;
            node.input_has_changed = false;
        }
        let id = self.arena.alloc(node);
        self.environments.insert(target_env, fn_id, id);
        for (pos, input) in inputs.iter().enumerate() {
            self.add_watcher(*input, id, pos, false, true)?;
        }
        self.fold_constant(id);
        self.mark_fragility(id);
        log::trace!("built {} for function node {} in {}", id, fn_id, target_env);
        Ok(id)
    }

    fn next_watcher_id(&mut self) -> WatcherId {
        let id = self.next_watcher_id;
        self.next_watcher_id += 1;
        id
    }

    /// Pure nodes over constant inputs are evaluated once and never again.
    fn fold_constant(&mut self, id: NodeId) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        if !node.kind.is_foldable()
            || !node
                .inputs
                .iter()
                .all(|i| self.arena.get(*i).is_some_and(|n| n.constant))
        {
            return;
        }
        let folded = match node.eval(&self.ctx()) {
            Ok(Evaluation::Computed(result)) => result,
            _ => return,
        };
        if let Some(node) = self.arena.get_mut(id) {
            node.result = folded;
            node.constant = true;
            node.input_has_changed = false;
        }
    }

    /// A node whose inputs might not have completed when it is popped must
    /// check before evaluating.
    fn mark_fragility(&mut self, id: NodeId) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        let fragile = !node.constant
            && (node.kind.is_schedule_fragile()
                || node.inputs.iter().any(|i| {
                    self.arena
                        .get(*i)
                        .is_some_and(|input| !input.constant && input.step >= node.step)
                }));
        if let Some(node) = self.arena.get_mut(id) {
            node.fragile = fragile;
        }
    }

    // ==================================================================
    // Outputs
    // ==================================================================

    /// Create a permanently active root watcher on `fn_id` in `env`.
    pub fn observe(&mut self, fn_id: FnId, env: EnvId) -> Result<NodeId, EngineError> {
        let target = self.node_for(fn_id, env)?;
        let step = self.arena.get(target).ok_or(EngineError::UnknownNode(target))?.step + 1;
        let watcher_id = self.next_watcher_id();
        let mut output = EvaluationNode::new(watcher_id, None, env, NodeKind::Output, smallvec![target], step, 0);
        output.pinned = true;
        let id = self.arena.alloc(output);
        self.add_watcher(target, id, 0, true, true)?;
        self.schedule(id);
        Ok(id)
    }

    pub fn observe_output(&mut self, name: &str) -> Result<NodeId, EngineError> {
        if let Some(id) = self.outputs.get(name) {
            return Ok(*id);
        }
        let fn_id = self.graph.output(name)?;
        let id = self.observe(fn_id, EnvId::ROOT)?;
        self.outputs.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn observe_all_outputs(&mut self) -> Result<Vec<NodeId>, EngineError> {
        let names: Vec<String> = self.graph.outputs().iter().map(|o| o.name.clone()).collect();
        names.iter().map(|name| self.observe_output(name)).collect()
    }

    pub fn observed_outputs(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.outputs.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn unobserve(&mut self, output: NodeId) -> Result<(), EngineError> {
        self.outputs.retain(|_, id| *id != output);
        self.destroy(output)
    }

    pub fn result(&self, node: NodeId) -> Result<&NodeResult, EngineError> {
        self.arena
            .get(node)
            .map(|n| &n.result)
            .ok_or(EngineError::UnknownNode(node))
    }

    /// Current values of a node, with data sources materialized.
    pub fn read(&self, node: NodeId) -> Result<Vec<Value>, EngineError> {
        let result = self.result(node)?;
        match result.data_source() {
            None => Ok(result.values().to_vec()),
            Some(handle) => Ok(self.data_sources.materialize(handle)?.unwrap_or_default()),
        }
    }

    pub fn read_output(&self, name: &str) -> Result<Vec<Value>, EngineError> {
        let id = self
            .outputs
            .get(name)
            .ok_or_else(|| EngineError::UnknownOutput(name.to_string()))?;
        self.read(*id)
    }

    // ==================================================================
    // Watchers and activation
    // ==================================================================

    /// Register `watcher` to be told at input slot `pos` when `node` changes.
    ///
    /// A constant node replies immediately and registers nothing.
    pub fn add_watcher(
        &mut self,
        node: NodeId,
        watcher: NodeId,
        pos: usize,
        force_first_update: bool,
        conditionally_activate: bool,
    ) -> Result<(), EngineError> {
        let watcher_node = self.arena.get(watcher).ok_or(EngineError::UnknownNode(watcher))?;
        let watcher_id = watcher_node.watcher_id;
        let watcher_active = watcher_node.is_active();

        let target = self.arena.get_mut(node).ok_or(EngineError::UnknownNode(node))?;
        if target.constant {
            self.input_changed(watcher, pos);
            return Ok(());
        }
        let activate = conditionally_activate && watcher_active;
        let entry = target.watchers.entry(watcher_id).or_insert_with(|| WatcherEntry {
            watcher,
            positions: SmallVec::new(),
            active_count: 0,
        });
        entry.positions.push(pos);
        if activate {
            entry.active_count += 1;
            self.increment_activation(node);
        }

        if force_first_update {
            match self.arena.get_mut(node) {
                Some(target) if target.is_pending() => target.pending_forced.push((watcher, pos)),
                _ => self.input_changed(watcher, pos),
            }
        }
        Ok(())
    }

    /// Remove every registration of `watcher` on `node`.
    pub fn remove_watcher(&mut self, node: NodeId, watcher: NodeId) -> Result<(), EngineError> {
        let watcher_id = self.arena.get(watcher).ok_or(EngineError::UnknownNode(watcher))?.watcher_id;
        let target = self.arena.get_mut(node).ok_or(EngineError::UnknownNode(node))?;
        target.pending_forced.retain(|(w, _)| *w != watcher);
        let Some(entry) = target.watchers.remove(&watcher_id) else {
            return Ok(());
        };
        for _ in 0..entry.active_count {
            self.decrement_activation(node);
        }
        Ok(())
    }

    /// Remove one callback position of `watcher` on `node`.
    pub fn remove_watcher_for_pos(&mut self, node: NodeId, watcher: NodeId, pos: usize) -> Result<(), EngineError> {
        let watcher_id = self.arena.get(watcher).ok_or(EngineError::UnknownNode(watcher))?.watcher_id;
        self.detach_position(node, watcher, watcher_id, pos);
        Ok(())
    }

    fn detach_position(&mut self, node: NodeId, watcher: NodeId, watcher_id: WatcherId, pos: usize) {
        let Some(target) = self.arena.get_mut(node) else {
            return;
        };
        target.pending_forced.retain(|(w, p)| !(*w == watcher && *p == pos));
        let Some(entry) = target.watchers.get_mut(&watcher_id) else {
            return;
        };
        let Some(index) = entry.positions.iter().position(|p| *p == pos) else {
            return;
        };
        entry.positions.remove(index);
        let counted = entry.active_count > entry.positions.len() as u32;
        if counted {
            entry.active_count -= 1;
        }
        if entry.positions.is_empty() {
            target.watchers.remove(&watcher_id);
        }
        if counted {
            self.decrement_activation(node);
        }
    }

    pub fn nr_active_watchers(&self, node: NodeId) -> Option<u32> {
        self.arena.get(node).map(|n| n.nr_active_watchers)
    }

    fn increment_activation(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        let was_active = node.is_active();
        node.nr_active_watchers += 1;
        if !was_active {
            self.on_activated(id);
        }
    }

    fn decrement_activation(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        assert!(
            node.nr_active_watchers > 0,
            "activation count of {} would drop below zero",
            id
        );
        node.nr_active_watchers -= 1;
        if !node.is_active() {
            self.on_deactivated(id);
        }
    }

    /// 0 → 1: activate every registered input slot, then catch up if dirty.
    fn on_activated(&mut self, id: NodeId) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        let inputs = node.inputs.clone();
        let watcher_id = node.watcher_id;
        log::trace!("activate {}", id);
        for (pos, input) in inputs.iter().enumerate() {
            let counted = self
                .arena
                .get_mut(*input)
                .and_then(|n| n.watchers.get_mut(&watcher_id))
                .filter(|entry| entry.positions.contains(&pos))
                .map(|entry| entry.active_count += 1)
                .is_some();
            if counted {
                self.increment_activation(*input);
            }
        }
        if self
            .arena
            .get(id)
            .is_some_and(|n| n.input_has_changed || n.force_update)
        {
            self.schedule(id);
        }
    }

    /// 1 → 0: drop out of the queue and release every input slot.
    fn on_deactivated(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        log::trace!("deactivate {}", id);
        if let Some(key) = node.scheduled_at.take() {
            self.scheduler.unschedule(key);
        }
        let inputs = node.inputs.clone();
        let watcher_id = node.watcher_id;
        self.clear_deferral(id);
        self.release_awaiting(id);
        for (pos, input) in inputs.iter().enumerate() {
            let counted = self
                .arena
                .get_mut(*input)
                .and_then(|n| n.watchers.get_mut(&watcher_id))
                .filter(|entry| entry.positions.contains(&pos) && entry.active_count > 0)
                .map(|entry| entry.active_count -= 1)
                .is_some();
            if counted {
                self.decrement_activation(*input);
            }
        }
    }

    // ==================================================================
    // Update protocol
    // ==================================================================

    /// An input of `node` has new output.
    pub fn update_input(&mut self, node: NodeId, pos: usize) -> Result<(), EngineError> {
        if !self.arena.is_valid(node) {
            return Err(EngineError::UnknownNode(node));
        }
        self.input_changed(node, pos);
        Ok(())
    }

    fn input_changed(&mut self, id: NodeId, pos: usize) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        node.input_has_changed = true;
        log::trace!("{} input {} changed", id, pos);
        if node.is_active() {
            self.schedule(id);
        }
    }

    fn schedule(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        if node.is_pending() {
            return;
        }
        let key = QueueKey::new(node.step, node.priority, id);
        node.scheduled_at = Some(key);
        self.scheduler.schedule(key);
    }

    /// Scheduler entry point for a popped node.
    fn update_output(&mut self, id: NodeId) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        if !node.is_active() {
            return;
        }
        if matches!(node.kind, NodeKind::MapDefun { .. }) && node.input_has_changed {
            self.sync_map_defun(id);
        }

        let Some(node) = self.arena.get(id) else {
            return;
        };
        if node.fragile && !node.skip_defer_check {
            let waiting_on: Vec<NodeId> = node
                .inputs
                .iter()
                .copied()
                .filter(|i| self.arena.get(*i).is_some_and(|n| n.is_pending()))
                .collect();
            if !waiting_on.is_empty() {
                self.defer(id, &waiting_on);
                return;
            }
        }

        let dirty = node.input_has_changed || node.force_update;
        if let Some(node) = self.arena.get_mut(id) {
            node.skip_defer_check = false;
            node.input_has_changed = false;
        }
        if !dirty {
            self.flush_forced(id);
            self.release_awaiting(id);
            return;
        }

        let started = self.config.profile.then(Instant::now);
        let evaluation = match self.arena.get(id) {
            Some(node) => node.eval(&self.ctx()),
            None => return,
        };
        if let Some(started) = started {
            self.profile.record_eval(id, started.elapsed());
        }

        match evaluation {
            Ok(Evaluation::Computed(result)) => {
                let Some(node) = self.arena.get_mut(id) else {
                    return;
                };
                let forced = std::mem::take(&mut node.force_update);
                if result != node.result {
                    node.result = result;
                    node.nr_changes += 1;
                    self.inform_watchers(id);
                } else if forced && node.result.data_source().is_some() {
                    // same handle, new content behind it
                    self.inform_watchers(id);
                } else {
                    self.flush_forced(id);
                }
            }
            Ok(Evaluation::Indeterminate) => {
                if let Some(node) = self.arena.get_mut(id) {
                    node.input_has_changed = true;
                }
                self.scheduler.retry_next_cycle(id);
                self.flush_forced(id);
            }
            Err(error) => {
                log::error!("evaluation of {} failed: {}", id, error);
                self.flush_forced(id);
            }
        }
        self.release_awaiting(id);
    }

    fn inform_watchers(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        node.pending_forced.clear();
        let external = node.result.data_source().is_some();
        let targets: Vec<(NodeId, usize)> = node
            .watchers
            .values()
            .flat_map(|entry| entry.positions.iter().map(move |pos| (entry.watcher, *pos)))
            .collect();
        let started = self.config.profile.then(Instant::now);
        for (watcher, pos) in targets {
            // a watcher passing the handle on must pass the change on too
            if external {
                if let Some(w) = self.arena.get_mut(watcher) {
                    w.force_update = true;
                }
            }
            self.input_changed(watcher, pos);
        }
        if let Some(started) = started {
            self.profile.record_inform(id, started.elapsed());
        }
    }

    fn flush_forced(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        let forced = std::mem::take(&mut node.pending_forced);
        for (watcher, pos) in forced {
            self.input_changed(watcher, pos);
        }
    }

    // ==================================================================
    // Deferral
    // ==================================================================

    fn defer(&mut self, id: NodeId, waiting_on: &[NodeId]) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        assert!(!node.deferred, "node {} deferred while already deferred", id);
        node.deferred = true;
        let watchers: Vec<NodeId> = node.watchers.values().map(|e| e.watcher).collect();
        self.scheduler.defer(id);
        for input in waiting_on {
            if let Some(input) = self.arena.get_mut(*input) {
                input.awaiting_this.insert(id);
            }
        }
        log::debug!("defer {} on {:?}", id, waiting_on);

        // fragile watchers queued behind this node would read its stale value
        for watcher in watchers {
            let Some(w) = self.arena.get_mut(watcher) else {
                continue;
            };
            if !(w.fragile && w.is_active() && w.is_scheduled()) {
                continue;
            }
            if let Some(key) = w.scheduled_at.take() {
                self.scheduler.unschedule(key);
            }
            w.deferred = true;
            self.scheduler.defer(watcher);
            if let Some(node) = self.arena.get_mut(id) {
                node.awaiting_this.insert(watcher);
            }
            log::debug!("defer {} behind {}", watcher, id);
        }
    }

    /// Drop deferral bookkeeping without rescheduling.
    fn clear_deferral(&mut self, id: NodeId) -> bool {
        let Some(node) = self.arena.get_mut(id) else {
            return false;
        };
        if !node.deferred {
            return false;
        }
        node.deferred = false;
        let inputs = node.inputs.clone();
        self.scheduler.undefer(id);
        for input in inputs {
            if let Some(input) = self.arena.get_mut(input) {
                input.awaiting_this.remove(&id);
            }
        }
        true
    }

    fn undefer(&mut self, id: NodeId) {
        if self.clear_deferral(id) && self.arena.get(id).is_some_and(|n| n.is_active()) {
            self.schedule(id);
        }
    }

    fn release_awaiting(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        let waiting = std::mem::take(&mut node.awaiting_this);
        for waiter in waiting {
            self.undefer(waiter);
        }
    }

    // ==================================================================
    // Change cycles
    // ==================================================================

    pub fn has_pending_work(&self) -> bool {
        !self.scheduler.is_idle() || self.scheduler.has_retries()
    }

    /// Stabilize every dirty active node, or stop at the evaluation cap.
    pub fn run_cycle(&mut self) -> CycleReport {
        let cycle = self.scheduler.next_cycle();
        for retry in self.scheduler.take_retries() {
            if self.arena.get(retry).is_some_and(|n| n.is_active()) {
                self.schedule(retry);
            }
        }

        let max = self.config.max_evaluations_per_cycle;
        let mut evaluations = 0u64;
        let mut deferral_cycles = Vec::new();
        loop {
            while self.scheduler.peek().is_some() {
                if evaluations >= max {
                    let pending = self.scheduler.queue_len() + self.scheduler.deferred().count();
                    log::warn!(
                        "cycle {} did not stabilize within {} evaluations, {} nodes pending",
                        cycle,
                        max,
                        pending
                    );
                    return CycleReport {
                        stats: self.scheduler.stats(),
                        outcome: CycleOutcome::Unstable { pending },
                        deferral_cycles,
                        retries: self.scheduler.retry_len(),
                    };
                }
                let Some(key) = self.scheduler.pop() else {
                    break;
                };
                evaluations += 1;
                if let Some(node) = self.arena.get_mut(key.node) {
                    node.scheduled_at = None;
                }
                self.update_output(key.node);
            }

            if !self.scheduler.has_deferred() {
                break;
            }
            // nothing runnable but deferred nodes left: they wait on each other
            let stalled: Vec<NodeId> = self.scheduler.deferred().collect();
            if self.config.detect_cycles_on_stall {
                for found in find_deferral_cycles(&self.arena, &stalled) {
                    log::warn!("deferral cycle: {:?}", found);
                    deferral_cycles.push(found);
                }
            }
            log::warn!("cycle {} stalled with {} deferred nodes, forcing", cycle, stalled.len());
            for id in stalled {
                if let Some(node) = self.arena.get_mut(id) {
                    node.skip_defer_check = true;
                }
                self.undefer(id);
            }
        }

        let retries = self.scheduler.retry_len();
        if retries > 0 {
            log::debug!(
                "cycle {} stable after {} evaluations, {} nodes retry next cycle",
                cycle,
                evaluations,
                retries
            );
        } else {
            log::debug!("cycle {} stable after {} evaluations", cycle, evaluations);
        }
        CycleReport {
            stats: self.scheduler.stats(),
            outcome: CycleOutcome::Stable,
            deferral_cycles,
            retries,
        }
    }

    /// Run cycles until nothing is left to do, at most `max_cycles` times.
    pub fn run_until_stable(&mut self, max_cycles: usize) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        for _ in 0..max_cycles {
            let report = self.run_cycle();
            let done = report.is_stable() && !self.has_pending_work();
            reports.push(report);
            if done {
                break;
            }
        }
        reports
    }

    // ==================================================================
    // External changes
    // ==================================================================

    /// Write into a writable node. Returns whether its value changed.
    pub fn write(
        &mut self,
        node: NodeId,
        value: NodeResult,
        mode: WriteMode,
        attributes: Option<MergeAttributes>,
        positions: Option<&[WritePosition]>,
    ) -> Result<bool, EngineError> {
        let target = self.arena.get(node).ok_or(EngineError::UnknownNode(node))?;
        let NodeKind::Writable { initial, written } = &target.kind else {
            return Err(EngineError::NotWritable(node));
        };
        let current = written.as_ref().unwrap_or(initial);
        let new_value = match positions {
            None | Some([]) => {
                let mut combined = combine(current, value, mode);
                combined.merge_attributes = attributes;
                combined
            }
            Some(positions) => write_positions(current, &value, mode, positions)?,
        };

        let Some(target) = self.arena.get_mut(node) else {
            return Err(EngineError::UnknownNode(node));
        };
        let NodeKind::Writable { initial, written } = &mut target.kind else {
            return Err(EngineError::NotWritable(node));
        };
        if written.as_ref().unwrap_or(&*initial) == &new_value {
            return Ok(false);
        }
        *written = Some(new_value);
        log::debug!("write {} ({:?})", node, mode);
        self.input_changed(node, 0);
        Ok(true)
    }

    /// Write into the `State` node `fn_id` as seen from `env`.
    pub fn write_state(
        &mut self,
        fn_id: FnId,
        env: EnvId,
        value: NodeResult,
        mode: WriteMode,
    ) -> Result<bool, EngineError> {
        let node = self.node_for(fn_id, env)?;
        self.write(node, value, mode, None, None)
    }

    /// The content behind `handle` changed: consumers re-read it.
    pub fn notify_data_source_changed(&mut self, handle: DataSourceHandle) {
        let bound: Vec<NodeId> = self
            .arena
            .iter()
            .filter(|(_, n)| matches!(n.kind, NodeKind::ExternalData { source } if source == handle))
            .map(|(id, _)| id)
            .collect();
        for id in bound {
            let Some(node) = self.arena.get_mut(id) else {
                continue;
            };
            if node.is_active() {
                node.force_update = true;
                self.schedule(id);
            } else {
                self.inform_watchers(id);
            }
        }
    }

    // ==================================================================
    // Destruction
    // ==================================================================

    pub fn destroy(&mut self, id: NodeId) -> Result<(), EngineError> {
        if !self.arena.is_valid(id) {
            return Err(EngineError::UnknownNode(id));
        }
        self.destroy_node(id);
        Ok(())
    }

    fn destroy_node(&mut self, id: NodeId) {
        let Some(node) = self.arena.get_mut(id) else {
            return;
        };
        if let Some(key) = node.scheduled_at.take() {
            self.scheduler.unschedule(key);
        }
        self.clear_deferral(id);
        self.scheduler.forget_retry(id);
        self.release_awaiting(id);

        // final word to the watchers
        if let Some(node) = self.arena.get_mut(id) {
            if !node.result.is_empty() {
                node.result = NodeResult::empty();
                self.inform_watchers(id);
            }
        }

        let Some(node) = self.arena.get(id) else {
            return;
        };
        let inputs = node.inputs.clone();
        let watcher_id = node.watcher_id;
        let (env, fn_id) = (node.env, node.fn_id);
        let instances = match &node.kind {
            NodeKind::MapDefun { instances, .. } => instances.clone(),
            _ => Vec::new(),
        };
        for (pos, input) in inputs.iter().enumerate() {
            self.detach_position(*input, id, watcher_id, pos);
        }
        for instance in instances.into_iter().rev() {
            self.release_environment(instance);
        }
        if let Some(fn_id) = fn_id {
            if self.environments.cached(env, fn_id) == Some(id) {
                self.environments.forget(env, fn_id);
            }
        }
        self.outputs.retain(|_, out| *out != id);
        self.profile.forget(id);
        self.arena.free(id);
        log::trace!("destroyed {}", id);
    }

    // ==================================================================
    // Defun application
    // ==================================================================

    /// Bring the invocations of a `MapDefun` node in line with its data:
    /// one child environment per element, its body watched at `1 + k`.
    fn sync_map_defun(&mut self, id: NodeId) {
        let Some(node) = self.arena.get(id) else {
            return;
        };
        let NodeKind::MapDefun { defun, instances } = &node.kind else {
            return;
        };
        let (defun, old_len, env) = (*defun, instances.len(), node.env);
        let data = match self.ctx().values_of(node.inputs[0]) {
            Ok(Some(values)) => values.into_owned(),
            Ok(None) => return,
            Err(error) => {
                log::error!("mapping defun {} at {}: {}", defun, id, error);
                return;
            }
        };
        let body_fn = match self.graph.defun(defun) {
            Ok(def) => def.body,
            Err(error) => {
                log::error!("{}", error);
                return;
            }
        };

        let instances = match &self.arena.get(id).map(|n| &n.kind) {
            Some(NodeKind::MapDefun { instances, .. }) => instances.clone(),
            _ => return,
        };
        for (k, element) in data.iter().enumerate().take(old_len) {
            if self
                .environments
                .set_argument(instances[k], 0, NodeResult::single(element.clone()))
            {
                self.notify_parameters(instances[k]);
            }
        }

        for (k, element) in data.iter().enumerate().skip(old_len) {
            if let Err(error) = self.add_instance(id, env, defun, body_fn, k, element.clone()) {
                log::error!("invocation {} of defun {} at {}: {}", k, defun, id, error);
                return;
            }
        }

        for k in (data.len()..old_len).rev() {
            let watcher_id = match self.arena.get(id) {
                Some(node) => node.watcher_id,
                None => return,
            };
            let (body, instance) = match self.arena.get_mut(id) {
                Some(node) => {
                    let body = node.inputs.pop();
                    let instance = match &mut node.kind {
                        NodeKind::MapDefun { instances, .. } => instances.pop(),
                        _ => None,
                    };
                    (body, instance)
                }
                None => return,
            };
            if let Some(body) = body {
                self.detach_position(body, id, watcher_id, 1 + k);
            }
            if let Some(instance) = instance {
                self.release_environment(instance);
            }
        }
    }

    fn add_instance(
        &mut self,
        id: NodeId,
        env: EnvId,
        defun: DefunId,
        body_fn: FnId,
        k: usize,
        element: Value,
    ) -> Result<(), EngineError> {
        let child = self
            .environments
            .create_defun_invocation(env, defun, vec![NodeResult::single(element)])?;
        let body = self.node_for(body_fn, child)?;
        if let Some(node) = self.arena.get_mut(id) {
            node.inputs.push(body);
            if let NodeKind::MapDefun { instances, .. } = &mut node.kind {
                instances.push(child);
            }
        }
        self.add_watcher(body, id, 1 + k, true, true)
    }

    fn notify_parameters(&mut self, env: EnvId) {
        let parameters: Vec<NodeId> = self
            .environments
            .nodes_in(env)
            .into_iter()
            .filter(|id| {
                self.arena
                    .get(*id)
                    .is_some_and(|n| matches!(n.kind, NodeKind::Parameter { .. }))
            })
            .collect();
        for parameter in parameters {
            self.input_changed(parameter, 0);
        }
    }
}

/// Combine a written value with the current one.
fn combine(current: &NodeResult, value: NodeResult, mode: WriteMode) -> NodeResult {
    let mut combined = match mode {
        WriteMode::Replace => value,
        WriteMode::Merge => merge_pair(&value, current),
        WriteMode::Push => {
            if current.is_empty() {
                value
            } else {
                merge_pair(&tag_all(value, MergeDirective::PUSH), current)
            }
        }
    };
    combined.merge_attributes = None;
    combined
}

fn write_positions(
    current: &NodeResult,
    value: &NodeResult,
    mode: WriteMode,
    positions: &[WritePosition],
) -> Result<NodeResult, EngineError> {
    let mut values = current.values().to_vec();
    let mut identifiers = current.identifiers.clone().filter(|ids| ids.len() == current.len());
    let mut sorted: Vec<&WritePosition> = positions.iter().collect();
    // splicing back to front keeps earlier indices valid
    sorted.sort_by(|a, b| b.index.cmp(&a.index));

    for position in sorted {
        let end = match position.index.checked_add(position.length) {
            Some(end) if end <= values.len() => end,
            end => {
                return Err(EngineError::PositionOutOfRange {
                    index: position.index,
                    end: end.unwrap_or(usize::MAX),
                    len: values.len(),
                });
            }
        };
        if position.path.is_empty() {
            let part = NodeResult::new(values[position.index..end].to_vec());
            let replacement = combine(&part, value.clone(), mode);
            if let Some(ids) = identifiers.as_mut() {
                let new_ids = replacement
                    .identifiers
                    .clone()
                    .unwrap_or_else(|| replacement.values().to_vec());
                ids.splice(position.index..end, new_ids);
            }
            values.splice(position.index..end, replacement.values().iter().cloned());
        } else {
            for element in &mut values[position.index..end] {
                *element = write_at_path(element, &position.path, value, mode);
            }
        }
    }

    let mut result = NodeResult::new(values);
    if let Some(ids) = identifiers {
        if ids.len() == result.len() {
            result = result.with_identifiers(ids);
        }
    }
    Ok(result)
}

fn write_at_path(element: &Value, path: &[Arc<str>], value: &NodeResult, mode: WriteMode) -> Value {
    let Some((name, rest)) = path.split_first() else {
        return element.clone();
    };
    let mut fields: AttributeMap = element.as_object().cloned().unwrap_or_default();
    let old = fields.remove(name).unwrap_or_default();
    let new = if rest.is_empty() {
        combine(&NodeResult::new(old), value.clone(), mode).values().to_vec()
    } else {
        match old.as_slice() {
            [] => vec![write_at_path(&Value::Object(Arc::default()), rest, value, mode)],
            os => os.iter().map(|v| write_at_path(v, rest, value, mode)).collect(),
        }
    };
    fields.insert(name.clone(), new);
    Value::Object(Arc::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funcnode::ProgramBuilder;
    use crate::ops::Builtin;

    fn n(v: f64) -> Value {
        Value::number(v)
    }

    #[test]
    fn constant_subtrees_are_folded() {
        let mut b = ProgramBuilder::new();
        let one = b.constant(NodeResult::single(n(1.0)));
        let two = b.constant(NodeResult::single(n(2.0)));
        let sum = b.apply(Builtin::Plus, &[one, two]);
        b.output("sum", sum);
        let mut engine = Engine::new(b.build(), EngineConfig::default()).unwrap();
        let out = engine.observe_output("sum").unwrap();
        engine.run_cycle();

        let sum_node = engine.node_for(sum, EnvId::ROOT).unwrap();
        assert!(engine.node(sum_node).unwrap().constant);
        assert_eq!(engine.nr_active_watchers(sum_node), Some(0));
        assert_eq!(engine.read(out).unwrap(), vec![n(3.0)]);
    }

    #[test]
    fn evaluation_fault_keeps_previous_result() {
        let mut b = ProgramBuilder::new();
        let x = b.state(NodeResult::single(n(4.0)));
        let y = b.state(NodeResult::single(n(2.0)));
        let q = b.apply(Builtin::Div, &[x, y]);
        b.output("q", q);
        let mut engine = Engine::new(b.build(), EngineConfig::default()).unwrap();
        let out = engine.observe_output("q").unwrap();
        engine.run_cycle();
        assert_eq!(engine.read(out).unwrap(), vec![n(2.0)]);

        let y_node = engine.node_for(y, EnvId::ROOT).unwrap();
        engine
            .write(y_node, NodeResult::single(n(0.0)), WriteMode::Replace, None, None)
            .unwrap();
        let report = engine.run_cycle();
        assert!(report.is_stable());
        assert_eq!(engine.read(out).unwrap(), vec![n(2.0)]);
    }

    #[test]
    fn writing_a_computed_node_is_rejected() {
        let mut b = ProgramBuilder::new();
        let x = b.state(NodeResult::single(n(1.0)));
        let neg = b.apply(Builtin::Not, &[x]);
        let mut engine = Engine::new(b.build(), EngineConfig::default()).unwrap();
        let node = engine.node_for(neg, EnvId::ROOT).unwrap();
        assert!(matches!(
            engine.write(node, NodeResult::empty(), WriteMode::Replace, None, None),
            Err(EngineError::NotWritable(_))
        ));
    }

    #[test]
    fn positional_write_into_attribute_path() {
        let current = NodeResult::new(vec![
            Value::object([("a", vec![n(1.0)])]),
            Value::object([("a", vec![n(2.0)])]),
        ]);
        let written = write_positions(
            &current,
            &NodeResult::single(n(9.0)),
            WriteMode::Replace,
            &[WritePosition::new(1, 1).with_path(&["a"])],
        )
        .unwrap();
        assert_eq!(written.values()[0].get("a"), &[n(1.0)]);
        assert_eq!(written.values()[1].get("a"), &[n(9.0)]);
    }

    #[test]
    fn positional_write_out_of_range() {
        let current = NodeResult::new(vec![n(1.0)]);
        let err = write_positions(
            &current,
            &NodeResult::single(n(2.0)),
            WriteMode::Replace,
            &[WritePosition::new(0, 2)],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::PositionOutOfRange { end: 2, len: 1, .. }));
    }

    #[test]
    fn stalled_deferrals_are_reported_and_forced() {
        let mut b = ProgramBuilder::new();
        let a = b.state(NodeResult::single(n(1.0)));
        let v1 = b.variant(&[(None, a)]);
        let v2 = b.variant(&[(None, a)]);
        b.output("v1", v1).output("v2", v2);
        let mut engine = Engine::new(b.build(), EngineConfig::default()).unwrap();
        engine.observe_all_outputs().unwrap();
        engine.run_cycle();

        // wire the two variants onto each other behind the watcher protocol's back
        let v1_node = engine.node_for(v1, EnvId::ROOT).unwrap();
        let v2_node = engine.node_for(v2, EnvId::ROOT).unwrap();
        engine.arena.get_mut(v1_node).unwrap().inputs.push(v2_node);
        engine.arena.get_mut(v2_node).unwrap().inputs.push(v1_node);
        engine.update_input(v1_node, 0).unwrap();
        engine.update_input(v2_node, 0).unwrap();

        let report = engine.run_cycle();
        assert!(report.is_stable());
        assert_eq!(report.stats.deferrals, 2);
        assert_eq!(report.deferral_cycles.len(), 1);
        let mut found = report.deferral_cycles[0].clone();
        found.sort();
        let mut expected = vec![v1_node, v2_node];
        expected.sort();
        assert_eq!(found, expected);
        assert!(!engine.scheduler.has_deferred());
        assert_eq!(engine.read_output("v1").unwrap(), vec![n(1.0)]);
    }

    #[test]
    fn positional_write_with_overflowing_range() {
        let current = NodeResult::new(vec![n(1.0), n(2.0)]);
        let err = write_positions(
            &current,
            &NodeResult::single(n(2.0)),
            WriteMode::Replace,
            &[WritePosition::new(1, usize::MAX)],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::PositionOutOfRange { index: 1, len: 2, .. }));
    }

    #[test]
    fn push_write_appends() {
        let current = NodeResult::new(vec![n(1.0)]);
        let pushed = combine(&current, NodeResult::single(n(2.0)), WriteMode::Push);
        assert_eq!(pushed.values(), &[n(1.0), n(2.0)]);
        assert!(pushed.merge_attributes.is_none());
    }
}
