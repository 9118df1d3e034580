//! Element model for ordered sequences.
//!
//! Every result carried between nodes is an ordered sequence of [`Value`]s.
//! Aggregates are `Arc`-wrapped so cloning a result is cheap.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Attribute name → ordered sequence. `BTreeMap` keeps dumps deterministic.
pub type AttributeMap = BTreeMap<Arc<str>, Vec<Value>>;

/// A single element of an ordered sequence.
///
/// Equality treats numbers as `OrderedFloat`s, so `NaN` equals itself and a
/// node recomputing `NaN` does not count as changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(Arc<str>),
    Bool(bool),
    /// Attribute-value object (nested ordered sequences per attribute)
    Object(Arc<AttributeMap>),
    /// Opaque, non-decomposable object reference (e.g. an area)
    Opaque(u64),
    /// Query projection marker `_`
    Projector,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => OrderedFloat(*a) == OrderedFloat(*b),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            (Value::Projector, Value::Projector) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    pub fn number(v: f64) -> Self {
        Value::Number(v)
    }

    pub fn text(v: impl Into<String>) -> Self {
        Value::Text(v.into().into())
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Vec<Value>)>) -> Self {
        Value::Object(Arc::new(
            fields
                .into_iter()
                .map(|(k, v)| (Arc::from(k.into()), v))
                .collect(),
        ))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&AttributeMap> {
        match self {
            Value::Object(v) => Some(v.as_ref()),
            _ => None,
        }
    }

    /// Attribute lookup on an object element; empty for anything else.
    pub fn get(&self, attribute: &str) -> &[Value] {
        self.as_object()
            .and_then(|fields| fields.get(attribute))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Number(_) | Value::Text(_) | Value::Bool(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Opaque(id) => write!(f, "@{}", id),
            Value::Projector => write!(f, "_"),
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, (name, os)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, DisplayOs(os))?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Display adapter for an ordered sequence: single elements print bare.
pub struct DisplayOs<'a>(pub &'a [Value]);

impl fmt::Display for DisplayOs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return write!(f, "{}", self.0[0]);
        }
        write!(f, "o(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Hashable identity of an element. Only scalars can serve as identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdKey {
    Number(OrderedFloat<f64>),
    Text(Arc<str>),
    Bool(bool),
}

impl IdKey {
    /// `None` for non-scalar identities, which then count as "no identity".
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(IdKey::Number(OrderedFloat(*n))),
            Value::Text(s) => Some(IdKey::Text(s.clone())),
            Value::Bool(b) => Some(IdKey::Bool(*b)),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            IdKey::Number(n) => Value::Number(n.0),
            IdKey::Text(s) => Value::Text(s.clone()),
            IdKey::Bool(b) => Value::Bool(*b),
        }
    }
}

/// Truthiness of an ordered sequence: false when empty or all `false`.
pub fn is_true(os: &[Value]) -> bool {
    os.iter().any(|v| !matches!(v, Value::Bool(false)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_attribute_lookup() {
        let obj = Value::object([("a", vec![Value::number(1.0)]), ("b", vec![])]);
        assert_eq!(obj.get("a"), &[Value::number(1.0)]);
        assert!(obj.get("b").is_empty());
        assert!(obj.get("missing").is_empty());
        assert!(Value::number(3.0).get("a").is_empty());
    }

    #[test]
    fn only_scalars_are_identities() {
        assert_eq!(
            IdKey::from_value(&Value::number(2.0)),
            Some(IdKey::Number(OrderedFloat(2.0)))
        );
        assert!(IdKey::from_value(&Value::object([("a", vec![])])).is_none());
        assert!(IdKey::from_value(&Value::Opaque(7)).is_none());
    }

    #[test]
    fn nan_equals_itself() {
        let nan = Value::number(f64::INFINITY - f64::INFINITY);
        assert_eq!(nan, nan.clone());
        assert_eq!(
            Value::object([("x", vec![Value::number(f64::NAN)])]),
            Value::object([("x", vec![Value::number(f64::NAN)])])
        );
        assert_ne!(nan, Value::number(0.0));
    }

    #[test]
    fn truthiness() {
        assert!(!is_true(&[]));
        assert!(!is_true(&[Value::Bool(false), Value::Bool(false)]));
        assert!(is_true(&[Value::Bool(false), Value::number(0.0)]));
    }

    #[test]
    fn display_nested() {
        let obj = Value::object([("a", vec![Value::number(1.0), Value::text("x")])]);
        assert_eq!(obj.to_string(), "{a: o(1, \"x\")}");
    }
}
