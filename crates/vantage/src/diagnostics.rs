//! Introspection: structured and textual dumps, per-node profiling, and
//! detection of deferral cycles.

use crate::arena::{NodeArena, NodeId};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::value::DisplayOs;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::fmt::Write;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProfileEntry {
    pub evaluations: u64,
    pub eval_time: Duration,
    pub inform_time: Duration,
}

/// Per-node timings, recorded only when profiling is enabled.
#[derive(Debug, Default)]
pub struct Profile {
    entries: FxHashMap<NodeId, ProfileEntry>,
}

impl Profile {
    pub fn record_eval(&mut self, node: NodeId, elapsed: Duration) {
        let entry = self.entries.entry(node).or_default();
        entry.evaluations += 1;
        entry.eval_time += elapsed;
    }

    pub fn record_inform(&mut self, node: NodeId, elapsed: Duration) {
        self.entries.entry(node).or_default().inform_time += elapsed;
    }

    pub fn get(&self, node: NodeId) -> Option<&ProfileEntry> {
        self.entries.get(&node)
    }

    pub fn forget(&mut self, node: NodeId) {
        self.entries.remove(&node);
    }

    /// Entries ordered by total time spent, most expensive first.
    pub fn hottest(&self) -> Vec<(NodeId, &ProfileEntry)> {
        let mut entries: Vec<_> = self.entries.iter().map(|(id, e)| (*id, e)).collect();
        entries.sort_by(|a, b| {
            (b.1.eval_time + b.1.inform_time)
                .cmp(&(a.1.eval_time + a.1.inform_time))
                .then(a.0.cmp(&b.0))
        });
        entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Explained {
    Node(Box<Explanation>),
    /// Already dumped above
    Seen { see: String },
}

#[derive(Debug, Serialize)]
struct Explanation {
    id: String,
    watcher_id: u64,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_node: Option<u32>,
    env: String,
    step: u32,
    priority: i32,
    active_watchers: u32,
    watchers: usize,
    constant: bool,
    fragile: bool,
    scheduled: bool,
    deferred: bool,
    dirty: bool,
    changes: u64,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    identifiers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    profile: Option<ProfileEntry>,
    inputs: Vec<Explained>,
}

impl Engine {
    /// Structured dump of `node` and everything it reads from.
    pub fn explain(&self, node: NodeId) -> Result<serde_json::Value, EngineError> {
        if !self.arena.is_valid(node) {
            return Err(EngineError::UnknownNode(node));
        }
        let mut seen = FxHashSet::default();
        Ok(serde_json::to_value(self.explain_node(node, &mut seen))?)
    }

    fn explain_node(&self, id: NodeId, seen: &mut FxHashSet<NodeId>) -> Explained {
        if !seen.insert(id) {
            return Explained::Seen { see: id.to_string() };
        }
        let Some(node) = self.arena.get(id) else {
            return Explained::Seen {
                see: format!("{} (destroyed)", id),
            };
        };
        let inputs = node.inputs.iter().map(|i| self.explain_node(*i, seen)).collect();
        Explained::Node(Box::new(Explanation {
            id: id.to_string(),
            watcher_id: node.watcher_id,
            kind: node.kind.name(),
            function_node: node.fn_id,
            env: node.env.to_string(),
            step: node.step,
            priority: node.priority,
            active_watchers: node.nr_active_watchers,
            watchers: node.watchers.len(),
            constant: node.constant,
            fragile: node.fragile,
            scheduled: node.is_scheduled(),
            deferred: node.deferred,
            dirty: node.input_has_changed,
            changes: node.nr_changes,
            value: result_text(&node.result, self),
            identifiers: node
                .result
                .identifiers
                .as_deref()
                .map(|ids| DisplayOs(ids).to_string()),
            profile: self.profile.get(id).cloned(),
            inputs,
        }))
    }

    /// Indented text dump of `node` and its inputs.
    pub fn to_full_string(&self, node: NodeId) -> String {
        let mut out = String::new();
        let mut seen = FxHashSet::default();
        self.write_tree(&mut out, node, 0, &mut seen);
        out
    }

    fn write_tree(&self, out: &mut String, id: NodeId, depth: usize, seen: &mut FxHashSet<NodeId>) {
        let indent = "  ".repeat(depth);
        let Some(node) = self.arena.get(id) else {
            let _ = writeln!(out, "{}{} <destroyed>", indent, id);
            return;
        };
        let mut flags = String::new();
        if node.constant {
            flags.push_str(" const");
        }
        if node.is_active() {
            let _ = write!(flags, " active={}", node.nr_active_watchers);
        }
        if node.is_scheduled() {
            flags.push_str(" scheduled");
        }
        if node.deferred {
            flags.push_str(" deferred");
        }
        if node.input_has_changed {
            flags.push_str(" dirty");
        }
        let _ = writeln!(
            out,
            "{}{} {}@{} step={} prio={}{} = {}",
            indent,
            id,
            node.kind.name(),
            node.env,
            node.step,
            node.priority,
            flags,
            result_text(&node.result, self)
        );
        if !seen.insert(id) {
            if !node.inputs.is_empty() {
                let _ = writeln!(out, "{}  ...", indent);
            }
            return;
        }
        for input in &node.inputs {
            self.write_tree(out, *input, depth + 1, seen);
        }
    }

    /// Dump of every observed output.
    pub fn dump_outputs(&self) -> String {
        let mut out = String::new();
        for (name, id) in self.observed_outputs() {
            let _ = writeln!(out, "{}:", name);
            out.push_str(&self.to_full_string(id));
        }
        out
    }
}

fn result_text(result: &crate::result::NodeResult, engine: &Engine) -> String {
    match result.data_source() {
        Some(handle) => format!(
            "<external {}>",
            engine.data_sources.name(handle).unwrap_or("?")
        ),
        None => DisplayOs(result.values()).to_string(),
    }
}

/// Cycles among deferred nodes, each reported once, starting at its
/// smallest node id. A deferred node points at every input that is itself
/// still deferred.
pub fn find_deferral_cycles(arena: &NodeArena, deferred: &[NodeId]) -> Vec<Vec<NodeId>> {
    let waits_on = |id: NodeId| -> Vec<NodeId> {
        let mut targets: Vec<NodeId> = arena
            .get(id)
            .map(|n| {
                n.inputs
                    .iter()
                    .copied()
                    .filter(|i| arena.get(*i).is_some_and(|input| input.deferred))
                    .collect()
            })
            .unwrap_or_default();
        // speculative deferral: a watcher waiting on a deferred node it reads from
        for (other, node) in arena.iter() {
            if node.deferred && node.awaiting_this.contains(&id) && !targets.contains(&other) {
                targets.push(other);
            }
        }
        targets
    };

    let mut found: Vec<Vec<NodeId>> = Vec::new();
    let mut done: FxHashSet<NodeId> = FxHashSet::default();
    for &start in deferred {
        if done.contains(&start) {
            continue;
        }
        let mut path: Vec<NodeId> = vec![start];
        let mut stack: Vec<(Vec<NodeId>, usize)> = vec![(waits_on(start), 0)];
        while let Some((targets, next)) = stack.last_mut() {
            let Some(&target) = targets.get(*next) else {
                stack.pop();
                if let Some(finished) = path.pop() {
                    done.insert(finished);
                }
                continue;
            };
            *next += 1;
            if let Some(at) = path.iter().position(|p| *p == target) {
                let cycle = normalize(&path[at..]);
                if !found.contains(&cycle) {
                    found.push(cycle);
                }
            } else if !done.contains(&target) {
                path.push(target);
                let targets = waits_on(target);
                stack.push((targets, 0));
            }
        }
    }
    found
}

fn normalize(cycle: &[NodeId]) -> Vec<NodeId> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(i, _)| i)
        .unwrap_or(0);
    cycle[start..].iter().chain(&cycle[..start]).copied().collect()
}
