//! Evaluation nodes: the runtime instance of one function node in one context.

use crate::arena::{NodeArena, NodeId};
use crate::datasource::DataSourceRegistry;
use crate::environment::{EnvId, Environments};
use crate::error::EvalError;
use crate::funcnode::{DefunId, FnId, FunctionKind};
use crate::merge::{merge_variants, Candidate};
use crate::ops::Builtin;
use crate::result::{DataSourceHandle, NodeResult, SubIdentifiers};
use crate::scheduler::QueueKey;
use crate::value::{is_true, AttributeMap, IdKey, Value};
use smallvec::SmallVec;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Stable numeric identity, never reused.
pub type WatcherId = u64;

pub type Inputs = SmallVec<[NodeId; 4]>;

/// One watcher registered on a node.
#[derive(Debug, Clone)]
pub struct WatcherEntry {
    pub watcher: NodeId,
    /// Callback positions (input slots of the watcher)
    pub positions: SmallVec<[usize; 2]>,
    /// How many of `positions` currently count towards activation
    pub active_count: u32,
}

/// The kind-specific part of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Const,
    Writable {
        initial: NodeResult,
        written: Option<NodeResult>,
    },
    Apply {
        builtin: Builtin,
    },
    AttributeValue {
        attributes: Vec<Arc<str>>,
    },
    Variant {
        /// Input slot of each arm's qualifier, if any
        qualifier_slots: Vec<Option<usize>>,
        /// Input slot of each arm's value
        value_slots: Vec<usize>,
        unmergeable: Vec<bool>,
    },
    Query,
    Identify {
        attribute: Arc<str>,
    },
    ExternalData {
        source: DataSourceHandle,
    },
    Parameter {
        index: usize,
    },
    /// Input 0 is the data; input `1 + k` is the body of invocation `k`
    MapDefun {
        defun: DefunId,
        instances: Vec<EnvId>,
    },
    /// Root watcher created by `Engine::observe`
    Output,
}

impl NodeKind {
    pub fn from_function(kind: &FunctionKind) -> Self {
        match kind {
            FunctionKind::Const(_) => NodeKind::Const,
            FunctionKind::State { initial } => NodeKind::Writable {
                initial: initial.clone(),
                written: None,
            },
            FunctionKind::Apply { builtin, .. } => NodeKind::Apply { builtin: *builtin },
            FunctionKind::AttributeValue { attributes } => NodeKind::AttributeValue {
                attributes: attributes.iter().map(|(name, _)| name.clone()).collect(),
            },
            FunctionKind::Variant {
                qualifiers,
                values,
                unmergeable,
            } => {
                // inputs are laid out as: present qualifiers, then values
                let mut next = 0;
                let qualifier_slots = qualifiers
                    .iter()
                    .map(|q| {
                        q.map(|_| {
                            next += 1;
                            next - 1
                        })
                    })
                    .collect();
                let value_slots = (next..next + values.len()).collect();
                NodeKind::Variant {
                    qualifier_slots,
                    value_slots,
                    unmergeable: unmergeable.clone(),
                }
            }
            FunctionKind::Query { .. } => NodeKind::Query,
            FunctionKind::Identify { attribute, .. } => NodeKind::Identify {
                attribute: attribute.clone(),
            },
            FunctionKind::ExternalData { source } => NodeKind::ExternalData { source: *source },
            FunctionKind::Parameter { index, .. } => NodeKind::Parameter { index: *index },
            FunctionKind::MapDefun { defun, .. } => NodeKind::MapDefun {
                defun: *defun,
                instances: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Const => "const",
            NodeKind::Writable { .. } => "writable",
            NodeKind::Apply { .. } => "apply",
            NodeKind::AttributeValue { .. } => "attributeValue",
            NodeKind::Variant { .. } => "variant",
            NodeKind::Query => "query",
            NodeKind::Identify { .. } => "identify",
            NodeKind::ExternalData { .. } => "externalData",
            NodeKind::Parameter { .. } => "parameter",
            NodeKind::MapDefun { .. } => "mapDefun",
            NodeKind::Output => "output",
        }
    }

    /// Kinds whose inputs the static step numbering cannot order reliably.
    pub fn is_schedule_fragile(&self) -> bool {
        matches!(self, NodeKind::Variant { .. } | NodeKind::MapDefun { .. })
    }

    /// Pure kinds fold to constants when all their inputs are constant.
    pub fn is_foldable(&self) -> bool {
        matches!(
            self,
            NodeKind::Apply { .. }
                | NodeKind::AttributeValue { .. }
                | NodeKind::Variant { .. }
                | NodeKind::Query
                | NodeKind::Identify { .. }
        )
    }
}

#[derive(Debug)]
pub struct EvaluationNode {
    pub watcher_id: WatcherId,
    pub fn_id: Option<FnId>,
    pub env: EnvId,
    pub kind: NodeKind,
    pub result: NodeResult,
    pub inputs: Inputs,
    pub watchers: BTreeMap<WatcherId, WatcherEntry>,
    pub nr_active_watchers: u32,
    pub input_has_changed: bool,
    pub scheduled_at: Option<QueueKey>,
    pub deferred: bool,
    /// Deferred nodes to release when this node completes
    pub awaiting_this: BTreeSet<NodeId>,
    /// Watchers owed an update even if the value does not change
    pub pending_forced: SmallVec<[(NodeId, usize); 2]>,
    pub force_update: bool,
    /// Set after a stall: evaluate once without the deferral check
    pub skip_defer_check: bool,
    pub nr_changes: u64,
    pub step: u32,
    pub priority: i32,
    pub constant: bool,
    pub fragile: bool,
    /// Active regardless of watchers (outputs)
    pub pinned: bool,
}

impl EvaluationNode {
    pub fn new(
        watcher_id: WatcherId,
        fn_id: Option<FnId>,
        env: EnvId,
        kind: NodeKind,
        inputs: Inputs,
        step: u32,
        priority: i32,
    ) -> Self {
        let fragile = kind.is_schedule_fragile();
        Self {
            watcher_id,
            fn_id,
            env,
            kind,
            result: NodeResult::empty(),
            inputs,
            watchers: BTreeMap::new(),
            nr_active_watchers: 0,
            input_has_changed: true,
            scheduled_at: None,
            deferred: false,
            awaiting_this: BTreeSet::new(),
            pending_forced: SmallVec::new(),
            force_update: false,
            skip_defer_check: false,
            nr_changes: 0,
            step,
            priority,
            constant: false,
            fragile,
            pinned: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.pinned || self.nr_active_watchers > 0
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled_at.is_some()
    }

    /// Not yet up to date within the running cycle.
    pub fn is_pending(&self) -> bool {
        self.scheduled_at.is_some() || self.deferred
    }
}

/// Outcome of a successful `eval`.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Computed(NodeResult),
    /// The value cannot be computed yet
    Indeterminate,
}

/// Read-only view handed to `eval`: inputs can be read, never written.
pub struct EvalContext<'a> {
    pub arena: &'a NodeArena,
    pub environments: &'a Environments,
    pub data_sources: &'a DataSourceRegistry,
}

static EMPTY: NodeResult = NodeResult {
    content: crate::result::Content::Data(Vec::new()),
    identifiers: None,
    sub_identifiers: None,
    merge_attributes: None,
};

impl<'a> EvalContext<'a> {
    /// Result of an input; destroyed inputs read as empty.
    pub fn result(&self, id: NodeId) -> &'a NodeResult {
        self.arena.get(id).map(|n| &n.result).unwrap_or(&EMPTY)
    }

    /// Values of an input with data sources materialized.
    /// `None` when a data source has nothing to offer yet.
    pub fn values_of(&self, id: NodeId) -> Result<Option<Cow<'a, [Value]>>, EvalError> {
        let result = self.result(id);
        match result.data_source() {
            None => Ok(Some(Cow::Borrowed(result.values()))),
            Some(handle) => Ok(self.data_sources.materialize(handle)?.map(Cow::Owned)),
        }
    }
}

macro_rules! values_or_indeterminate {
    ($ctx:expr, $id:expr) => {
        match $ctx.values_of($id)? {
            Some(values) => values,
            None => return Ok(Evaluation::Indeterminate),
        }
    };
}

impl EvaluationNode {
    /// Compute this node's value from its inputs' current results.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Evaluation, EvalError> {
        let computed = match &self.kind {
            NodeKind::Const => self.result.clone(),
            NodeKind::Writable { initial, written } => written.clone().unwrap_or_else(|| initial.clone()),
            NodeKind::Output => ctx.result(self.inputs[0]).clone(),
            NodeKind::ExternalData { source } => NodeResult::external(*source),
            NodeKind::Parameter { index } => ctx
                .environments
                .argument(self.env, *index)
                .cloned()
                .unwrap_or_default(),
            NodeKind::Apply { builtin } => {
                let mut args = Vec::with_capacity(self.inputs.len());
                for input in &self.inputs {
                    args.push(values_or_indeterminate!(ctx, *input));
                }
                let slices: Vec<&[Value]> = args.iter().map(|a| a.as_ref()).collect();
                NodeResult::new(builtin.apply(&slices)?)
            }
            NodeKind::AttributeValue { attributes } => {
                let mut fields = AttributeMap::new();
                let mut sub = SubIdentifiers::new();
                for (name, input) in attributes.iter().zip(&self.inputs) {
                    let values = values_or_indeterminate!(ctx, *input);
                    let input_result = ctx.result(*input);
                    if input_result.has_identities() {
                        if let Some(ids) = &input_result.identifiers {
                            sub.insert(name.clone(), ids.clone());
                        }
                    }
                    fields.insert(name.clone(), values.into_owned());
                }
                let result = NodeResult::single(Value::Object(Arc::new(fields)));
                if sub.is_empty() {
                    result
                } else {
                    result.with_sub_identifiers(vec![Some(sub)])
                }
            }
            NodeKind::Variant {
                qualifier_slots,
                value_slots,
                unmergeable,
            } => {
                let mut candidates = Vec::with_capacity(value_slots.len());
                for (arm, value_slot) in value_slots.iter().enumerate() {
                    let active = match qualifier_slots[arm] {
                        Some(slot) => is_true(&values_or_indeterminate!(ctx, self.inputs[slot])),
                        None => true,
                    };
                    candidates.push(
                        Candidate::new(ctx.result(self.inputs[*value_slot]))
                            .with_active(active)
                            .with_unmergeable_below(unmergeable.get(arm).copied().unwrap_or(false)),
                    );
                }
                merge_variants(&candidates)
            }
            NodeKind::Query => {
                let query = values_or_indeterminate!(ctx, self.inputs[0]);
                let data = values_or_indeterminate!(ctx, self.inputs[1]);
                run_query(&query, &data, ctx.result(self.inputs[1]).identifiers.as_deref())
            }
            NodeKind::Identify { attribute } => {
                let data = values_or_indeterminate!(ctx, self.inputs[0]);
                let identifiers = data
                    .iter()
                    .map(|element| match element.get(attribute) {
                        [id] if id.is_scalar() => id.clone(),
                        _ => element.clone(),
                    })
                    .collect();
                NodeResult::new(data.into_owned()).with_identifiers(identifiers)
            }
            NodeKind::MapDefun { instances, .. } => {
                let data_result = ctx.result(self.inputs[0]);
                let mut values = Vec::new();
                let mut one_each = true;
                for k in 0..instances.len() {
                    let Some(&body) = self.inputs.get(1 + k) else {
                        break;
                    };
                    let out = values_or_indeterminate!(ctx, body);
                    one_each &= out.len() == 1;
                    values.extend(out.iter().cloned());
                }
                let result = NodeResult::new(values);
                match &data_result.identifiers {
                    Some(ids) if one_each && ids.len() == instances.len() => result.with_identifiers(ids.clone()),
                    _ => result,
                }
            }
        };
        Ok(Evaluation::Computed(computed))
    }
}

/// Selection and projection of attribute-value data.
///
/// Scalar queries select data elements equal to one of them. An object
/// query selects objects whose attributes intersect the query's; attributes
/// set to `_` are projected instead of tested.
fn run_query(query: &[Value], data: &[Value], identifiers: Option<&[Value]>) -> NodeResult {
    let query_objects: Vec<&AttributeMap> = query.iter().filter_map(Value::as_object).collect();

    if query_objects.is_empty() {
        let mut values = Vec::new();
        let mut ids = Vec::new();
        for (i, element) in data.iter().enumerate() {
            if query.contains(element) {
                values.push(element.clone());
                if let Some(id) = identifiers.and_then(|ids| ids.get(i)) {
                    ids.push(id.clone());
                }
            }
        }
        return with_ids(values, ids);
    }

    let mut values = Vec::new();
    let mut ids = Vec::new();
    let mut projecting = false;
    for q in query_objects {
        projecting |= projects(q);
        for (i, element) in data.iter().enumerate() {
            if let Some(out) = match_element(q, element) {
                if !projects(q) {
                    if let Some(id) = identifiers.and_then(|ids| ids.get(i)) {
                        ids.push(id.clone());
                    }
                }
                values.extend(out);
            }
        }
    }
    if projecting {
        NodeResult::new(values)
    } else {
        with_ids(values, ids)
    }
}

fn with_ids(values: Vec<Value>, ids: Vec<Value>) -> NodeResult {
    if !ids.is_empty() && ids.len() == values.len() && ids.iter().any(|id| IdKey::from_value(id).is_some()) {
        NodeResult::new(values).with_identifiers(ids)
    } else {
        NodeResult::new(values)
    }
}

fn projects(query: &AttributeMap) -> bool {
    query.values().any(|qv| match qv.as_slice() {
        [Value::Projector] => true,
        [Value::Object(nested)] => projects(nested),
        _ => false,
    })
}

fn match_element(query: &AttributeMap, element: &Value) -> Option<Vec<Value>> {
    let fields = element.as_object()?;
    let mut projected: Option<Vec<Value>> = None;
    for (name, qv) in query {
        let dv = fields.get(name).map(Vec::as_slice).unwrap_or(&[]);
        match qv.as_slice() {
            [Value::Projector] => {
                if dv.is_empty() {
                    return None;
                }
                projected.get_or_insert_with(Vec::new).extend(dv.iter().cloned());
            }
            [Value::Object(nested)] => {
                let mut matched = false;
                let mut inner = Vec::new();
                for sub in dv {
                    if let Some(out) = match_element(nested, sub) {
                        matched = true;
                        inner.extend(out);
                    }
                }
                if !matched {
                    return None;
                }
                if projects(nested) {
                    projected.get_or_insert_with(Vec::new).extend(inner);
                }
            }
            _ => {
                if !dv.iter().any(|v| qv.contains(v)) {
                    return None;
                }
            }
        }
    }
    Some(projected.unwrap_or_else(|| vec![element.clone()]))
}
