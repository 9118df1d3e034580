//! Result container carried from a node to its watchers.

use crate::value::{IdKey, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Handle of an external, lazily materialized data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataSourceHandle(pub u32);

/// Merge directive attached to an element (or to a whole result).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeDirective {
    /// Concatenate after the merged lower-priority remainder instead of overlaying
    #[serde(default)]
    pub push: bool,
    /// Block any lower-priority merging into this element
    #[serde(default)]
    pub atomic: bool,
}

impl MergeDirective {
    pub const NONE: Self = Self { push: false, atomic: false };
    pub const PUSH: Self = Self { push: true, atomic: false };
    pub const ATOMIC: Self = Self { push: false, atomic: true };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MergeAttributes {
    Global(MergeDirective),
    PerElement(Vec<MergeDirective>),
}

/// Identities of the elements of each attribute, per result element.
pub type SubIdentifiers = BTreeMap<Arc<str>, Vec<Value>>;

/// Either real data or the marker that data lives in an external source.
///
/// Keeping both in one enum means a result with a data source can never
/// carry stale values next to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Content {
    Data(Vec<Value>),
    External(DataSourceHandle),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_identifiers: Option<Vec<Option<SubIdentifiers>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_attributes: Option<MergeAttributes>,
}

impl Default for NodeResult {
    fn default() -> Self {
        Self::empty()
    }
}

impl NodeResult {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            content: Content::Data(values),
            identifiers: None,
            sub_identifiers: None,
            merge_attributes: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn single(value: Value) -> Self {
        Self::new(vec![value])
    }

    pub fn external(handle: DataSourceHandle) -> Self {
        Self {
            content: Content::External(handle),
            identifiers: None,
            sub_identifiers: None,
            merge_attributes: None,
        }
    }

    pub fn with_identifiers(mut self, identifiers: Vec<Value>) -> Self {
        self.identifiers = Some(identifiers);
        self
    }

    pub fn with_sub_identifiers(mut self, sub_identifiers: Vec<Option<SubIdentifiers>>) -> Self {
        self.sub_identifiers = Some(sub_identifiers);
        self
    }

    pub fn with_merge_attributes(mut self, attributes: MergeAttributes) -> Self {
        self.merge_attributes = Some(attributes);
        self
    }

    /// Inline values; empty for results backed by a data source.
    pub fn values(&self) -> &[Value] {
        match &self.content {
            Content::Data(values) => values,
            Content::External(_) => &[],
        }
    }

    pub fn data_source(&self) -> Option<DataSourceHandle> {
        match self.content {
            Content::External(handle) => Some(handle),
            Content::Data(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_source().is_none() && self.values().is_empty()
    }

    pub fn directive_at(&self, index: usize) -> MergeDirective {
        match &self.merge_attributes {
            None => MergeDirective::NONE,
            Some(MergeAttributes::Global(d)) => *d,
            Some(MergeAttributes::PerElement(ds)) => ds.get(index).copied().unwrap_or_default(),
        }
    }

    pub fn identity_at(&self, index: usize) -> Option<IdKey> {
        self.identifiers
            .as_ref()
            .and_then(|ids| ids.get(index))
            .and_then(IdKey::from_value)
    }

    /// True when at least one element carries a scalar identity.
    pub fn has_identities(&self) -> bool {
        (0..self.len()).any(|i| self.identity_at(i).is_some())
    }

    pub fn sub_identifiers_at(&self, index: usize) -> Option<&SubIdentifiers> {
        self.sub_identifiers
            .as_ref()
            .and_then(|subs| subs.get(index))
            .and_then(Option::as_ref)
    }

    pub fn has_sub_identifiers(&self) -> bool {
        (0..self.len()).any(|i| self.sub_identifiers_at(i).is_some_and(|s| !s.is_empty()))
    }
}
