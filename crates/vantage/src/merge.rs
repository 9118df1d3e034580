//! Merge engine: reduces priority-ordered variant candidates to one result.
//!
//! Candidates are overlaid highest priority first. Three regimes:
//! - no identities: positional overlay, attribute by attribute
//! - identities: elements realigned by identity, equal identities sub-merged
//! - sub-identities only: each attribute merged by its nested identities
//!
//! An ordered sequence of length != 1 without identities is unmergeable:
//! once met, lower-priority data at that path is dropped. Empty sequences
//! defer to the next lower priority.

use crate::result::{MergeDirective, NodeResult, SubIdentifiers};
use crate::value::{AttributeMap, IdKey, Value};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One entry of a variant list.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub result: &'a NodeResult,
    /// Qualifier state
    pub active: bool,
    /// Nothing below this candidate takes part in the merge
    pub unmergeable_below: bool,
}

impl<'a> Candidate<'a> {
    pub fn new(result: &'a NodeResult) -> Self {
        Self {
            result,
            active: true,
            unmergeable_below: false,
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_unmergeable_below(mut self, unmergeable_below: bool) -> Self {
        self.unmergeable_below = unmergeable_below;
        self
    }
}

/// Merge a variant list (highest priority first) into one result.
pub fn merge_variants(candidates: &[Candidate<'_>]) -> NodeResult {
    let mut live: Vec<&NodeResult> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !candidate.active || candidate.result.is_empty() {
            continue;
        }
        if candidate.result.data_source().is_some() {
            // external data cannot be decomposed: it wins if nothing above it,
            // otherwise it and everything below is dropped
            if live.is_empty() {
                live.push(candidate.result);
            }
            break;
        }
        live.push(candidate.result);
        if candidate.unmergeable_below {
            break;
        }
    }

    match live.as_slice() {
        [] => NodeResult::empty(),
        [single] => (*single).clone(),
        _ if live.iter().any(|r| r.has_identities()) => merge_identified(&live),
        _ if live.iter().any(|r| r.has_sub_identifiers()) => merge_by_sub_identities(&live)
            .unwrap_or_else(|| NodeResult::new(overlay_candidates(&live))),
        _ => NodeResult::new(overlay_candidates(&live)),
    }
}

/// Merge `high` over `low`.
pub fn merge_pair(high: &NodeResult, low: &NodeResult) -> NodeResult {
    merge_variants(&[Candidate::new(high), Candidate::new(low)])
}

/// Positional overlay without identities.
fn overlay_candidates(live: &[&NodeResult]) -> Vec<Value> {
    let (mut merged, pushed) = overlay_split(live);
    merged.extend(pushed);
    merged
}

/// Merged regular elements, and the pushed elements of every level that
/// survived, lowest priority first.
fn overlay_split(live: &[&NodeResult]) -> (Vec<Value>, Vec<Value>) {
    let Some((top, rest)) = live.split_first() else {
        return (Vec::new(), Vec::new());
    };

    let mut regular = Vec::with_capacity(top.len());
    let mut pushed = Vec::new();
    let mut atomic = false;
    for (i, value) in top.values().iter().enumerate() {
        let directive = top.directive_at(i);
        if directive.push {
            pushed.push(value.clone());
        } else {
            atomic |= directive.atomic;
            regular.push(value.clone());
        }
    }

    if !regular.is_empty() && (atomic || rest.is_empty() || !is_mergeable(&regular)) {
        return (regular, pushed);
    }
    let (low, mut below_pushed) = overlay_split(rest);
    below_pushed.extend(pushed);
    let merged = if regular.is_empty() { low } else { overlay(regular, low) };
    (merged, below_pushed)
}

fn is_mergeable(os: &[Value]) -> bool {
    matches!(os, [Value::Object(_)])
}

/// Overlay `high` onto `low`: `high` wins unless empty.
pub fn overlay(high: Vec<Value>, low: Vec<Value>) -> Vec<Value> {
    if high.is_empty() {
        return low;
    }
    if low.is_empty() {
        return high;
    }
    match (high.as_slice(), low.as_slice()) {
        ([Value::Object(h)], [Value::Object(l)]) => {
            vec![Value::Object(Arc::new(overlay_attributes(h, l)))]
        }
        _ => high,
    }
}

fn overlay_attributes(high: &AttributeMap, low: &AttributeMap) -> AttributeMap {
    let mut merged = high.clone();
    for (name, low_os) in low {
        match merged.get_mut(name) {
            Some(high_os) => {
                let h = std::mem::take(high_os);
                *high_os = overlay(h, low_os.clone());
            }
            None => {
                merged.insert(name.clone(), low_os.clone());
            }
        }
    }
    merged
}

struct Bucket {
    id: Option<IdKey>,
    value: Value,
    sub: Option<SubIdentifiers>,
    atomic: bool,
}

struct Pushed {
    follows: Option<IdKey>,
    value: Value,
    sub: Option<SubIdentifiers>,
}

/// Identity-aligned merge.
fn merge_identified(live: &[&NodeResult]) -> NodeResult {
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut by_id: FxHashMap<IdKey, usize> = FxHashMap::default();
    let mut pushed: Vec<Pushed> = Vec::new();

    for result in live {
        for (i, value) in result.values().iter().enumerate() {
            let directive = result.directive_at(i);
            let id = result.identity_at(i);
            let sub = result.sub_identifiers_at(i).cloned();

            if directive.push {
                pushed.push(Pushed {
                    follows: id,
                    value: value.clone(),
                    sub,
                });
                continue;
            }

            match id.as_ref().and_then(|id| by_id.get(id)).copied() {
                Some(index) => {
                    let bucket = &mut buckets[index];
                    if !bucket.atomic {
                        let (value, sub) = merge_elements(&bucket.value, bucket.sub.as_ref(), value, sub.as_ref());
                        bucket.value = value;
                        bucket.sub = sub;
                    }
                }
                None => {
                    if let Some(id) = &id {
                        by_id.insert(id.clone(), buckets.len());
                    }
                    buckets.push(Bucket {
                        id,
                        value: value.clone(),
                        sub,
                        atomic: directive.atomic,
                    });
                }
            }
        }
    }

    let mut values = Vec::with_capacity(buckets.len() + pushed.len());
    let mut identifiers = Vec::with_capacity(values.capacity());
    let mut subs = Vec::with_capacity(values.capacity());
    let mut placed = vec![false; pushed.len()];

    for bucket in buckets {
        identifiers.push(identifier_of(bucket.id.as_ref(), &bucket.value));
        let id = bucket.id;
        values.push(bucket.value);
        subs.push(bucket.sub);
        if id.is_none() {
            continue;
        }
        for (p, push) in pushed.iter().enumerate() {
            if !placed[p] && push.follows == id {
                placed[p] = true;
                identifiers.push(identifier_of(push.follows.as_ref(), &push.value));
                values.push(push.value.clone());
                subs.push(push.sub.clone());
            }
        }
    }
    for (push, done) in pushed.into_iter().zip(placed) {
        if !done {
            identifiers.push(identifier_of(push.follows.as_ref(), &push.value));
            values.push(push.value);
            subs.push(push.sub);
        }
    }

    let mut merged = NodeResult::new(values).with_identifiers(identifiers);
    if subs.iter().any(Option::is_some) {
        merged = merged.with_sub_identifiers(subs);
    }
    merged
}

/// Elements without an explicit identity are identified by themselves;
/// for non-scalars that means "no identity".
fn identifier_of(id: Option<&IdKey>, value: &Value) -> Value {
    id.map(IdKey::to_value).unwrap_or_else(|| value.clone())
}

/// Pairwise merge of two elements sharing an identity (`high` wins).
fn merge_elements(
    high: &Value,
    high_sub: Option<&SubIdentifiers>,
    low: &Value,
    low_sub: Option<&SubIdentifiers>,
) -> (Value, Option<SubIdentifiers>) {
    let mut h = NodeResult::single(high.clone());
    if let Some(sub) = high_sub {
        h = h.with_sub_identifiers(vec![Some(sub.clone())]);
    }
    let mut l = NodeResult::single(low.clone());
    if let Some(sub) = low_sub {
        l = l.with_sub_identifiers(vec![Some(sub.clone())]);
    }
    let merged = merge_pair(&h, &l);
    let sub = merged.sub_identifiers_at(0).cloned();
    let value = merged
        .values()
        .first()
        .cloned()
        .unwrap_or_else(|| high.clone());
    (value, sub)
}

/// Merge pushed one level down: every candidate is a single object and each
/// attribute is merged on its own, by identity where nested identities exist.
/// `None` when the candidates do not have that shape.
fn merge_by_sub_identities(live: &[&NodeResult]) -> Option<NodeResult> {
    let mut objects: Vec<(&AttributeMap, Option<&SubIdentifiers>)> = Vec::with_capacity(live.len());
    for result in live {
        let directive = result.directive_at(0);
        match result.values() {
            [Value::Object(fields)] if !directive.push => {
                objects.push((fields, result.sub_identifiers_at(0)));
                if directive.atomic {
                    break;
                }
            }
            _ => return None,
        }
    }

    let names: BTreeSet<&Arc<str>> = objects.iter().flat_map(|(fields, _)| fields.keys()).collect();
    let mut fields = AttributeMap::new();
    let mut sub_out = SubIdentifiers::new();

    for name in names {
        let per_candidate: Vec<NodeResult> = objects
            .iter()
            .map(|(fields, sub)| {
                let os = fields.get(name).cloned().unwrap_or_default();
                let ids = sub.and_then(|s| s.get(name)).cloned();
                match ids {
                    Some(ids) => NodeResult::new(os).with_identifiers(ids),
                    None => NodeResult::new(os),
                }
            })
            .collect();
        let candidates: Vec<Candidate<'_>> = per_candidate.iter().map(Candidate::new).collect();
        let merged = merge_variants(&candidates);
        if let Some(ids) = merged.identifiers.clone() {
            sub_out.insert(name.clone(), ids);
        }
        fields.insert(name.clone(), merged.values().to_vec());
    }

    let result = NodeResult::single(Value::Object(Arc::new(fields)));
    Some(if sub_out.is_empty() {
        result
    } else {
        result.with_sub_identifiers(vec![Some(sub_out)])
    })
}

/// Directive helper used by writers: tag every element of `result`.
pub fn tag_all(result: NodeResult, directive: MergeDirective) -> NodeResult {
    result.with_merge_attributes(crate::result::MergeAttributes::Global(directive))
}
