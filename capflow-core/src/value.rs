//! Recursive tagged values
//!
//! A [`Value`] is the unit of analysis state: a scalar (number, string,
//! boolean), a bounded collection (set, map, list), or absent. Every value
//! carries an optional mutability tag naming the scope it belongs to.
//! Equality and hashing are structural over the data kind and payload; tags
//! and bound descriptors do not take part.

use crate::collection::{ValueList, ValueMap, ValueSet};
use capflow_types::{Bound, BoundError, Mutability};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised by value and collection operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValueError {
    /// Unknown numeric mutation name; this is a programming error in the caller
    #[error("\"{0}\" is not a valid operation")]
    InvalidOperation(String),

    #[error("collections have incompatible time windows")]
    IncompatibleBounds,

    #[error("expected a {expected} value, found {found}")]
    KindMismatch { expected: ValueKind, found: ValueKind },

    #[error("invalid collection capacity {0}")]
    InvalidCapacity(f64),

    #[error(transparent)]
    InvalidWindow(#[from] BoundError),
}

/// Discriminant of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Absent,
    Number,
    String,
    Boolean,
    Set,
    Map,
    List,
}

impl ValueKind {
    pub fn is_collection(&self) -> bool {
        matches!(self, ValueKind::Set | ValueKind::Map | ValueKind::List)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Absent => "absent",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Boolean => "boolean",
            ValueKind::Set => "set",
            ValueKind::Map => "map",
            ValueKind::List => "list",
        };
        f.write_str(name)
    }
}

/// Payload of a [`Value`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Data {
    #[default]
    Absent,
    Number(#[serde(with = "number_repr")] f64),
    String(String),
    Boolean(bool),
    Set(ValueSet),
    Map(ValueMap),
    List(ValueList),
}

/// Numbers with NaN and the infinities written as named strings
///
/// JSON has no literal for non-finite floats and serde_json writes them as
/// `null`, which is read back as NaN.
mod number_repr {
    use serde::de::{self, Unexpected, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    pub fn serialize<S: Serializer>(n: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if n.is_nan() {
            serializer.serialize_str(NAN)
        } else if n.is_infinite() {
            serializer.serialize_str(if *n > 0.0 { INFINITY } else { NEG_INFINITY })
        } else {
            serializer.serialize_f64(*n)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(NumberVisitor)
    }

    struct NumberVisitor;

    impl<'de> Visitor<'de> for NumberVisitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"Infinity\" or \"-Infinity\"")
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
            match v {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(Unexpected::Str(other), &self)),
            }
        }

        fn visit_unit<E: de::Error>(self) -> Result<f64, E> {
            Ok(f64::NAN)
        }
    }
}

/// Canonical bit pattern so that `0.0 == -0.0` and NaN equals itself
fn number_bits(n: f64) -> u64 {
    if n == 0.0 {
        0
    } else if n.is_nan() {
        f64::NAN.to_bits()
    } else {
        n.to_bits()
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Data::Absent, Data::Absent) => true,
            (Data::Number(a), Data::Number(b)) => number_bits(*a) == number_bits(*b),
            (Data::String(a), Data::String(b)) => a == b,
            (Data::Boolean(a), Data::Boolean(b)) => a == b,
            (Data::Set(a), Data::Set(b)) => a == b,
            (Data::Map(a), Data::Map(b)) => a == b,
            (Data::List(a), Data::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Data {}

impl Hash for Data {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Data::Absent => {}
            Data::Number(n) => number_bits(*n).hash(state),
            Data::String(s) => s.hash(state),
            Data::Boolean(b) => b.hash(state),
            Data::Set(s) => s.hash(state),
            Data::Map(m) => m.hash(state),
            Data::List(l) => l.hash(state),
        }
    }
}

/// Named in-place numeric mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Set,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl NumericOp {
    pub fn apply(self, current: f64, operand: f64) -> f64 {
        match self {
            NumericOp::Set => operand,
            NumericOp::Add => current + operand,
            NumericOp::Subtract => current - operand,
            NumericOp::Multiply => current * operand,
            NumericOp::Divide => current / operand,
        }
    }
}

impl FromStr for NumericOp {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(NumericOp::Set),
            "add" => Ok(NumericOp::Add),
            "subtract" => Ok(NumericOp::Subtract),
            "mult" | "multiply" => Ok(NumericOp::Multiply),
            "div" | "divide" => Ok(NumericOp::Divide),
            other => Err(ValueError::InvalidOperation(other.to_string())),
        }
    }
}

/// Sort direction for [`Value::compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueOrder {
    #[default]
    Ascending,
    Descending,
}

/// A tagged analysis value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Value {
    data: Data,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    mutability: Option<Mutability>,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

impl Value {
    pub fn new(data: Data) -> Self {
        Value {
            data,
            mutability: None,
        }
    }

    pub fn absent() -> Self {
        Value::default()
    }

    pub fn number(n: f64) -> Self {
        Value::new(Data::Number(n))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::new(Data::String(s.into()))
    }

    pub fn boolean(b: bool) -> Self {
        Value::new(Data::Boolean(b))
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub fn kind(&self) -> ValueKind {
        match self.data {
            Data::Absent => ValueKind::Absent,
            Data::Number(_) => ValueKind::Number,
            Data::String(_) => ValueKind::String,
            Data::Boolean(_) => ValueKind::Boolean,
            Data::Set(_) => ValueKind::Set,
            Data::Map(_) => ValueKind::Map,
            Data::List(_) => ValueKind::List,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self.data, Data::Absent)
    }

    pub fn mutability(&self) -> Option<Mutability> {
        self.mutability
    }

    /// Stamp `mutability` onto this value and everything nested in it
    pub fn set_mutability(&mut self, mutability: Mutability) {
        self.mutability = Some(mutability);
        match &mut self.data {
            Data::Set(set) => set.set_mutability(mutability),
            Data::Map(map) => map.set_mutability(mutability),
            Data::List(list) => list.set_mutability(mutability),
            _ => {}
        }
    }

    pub fn with_mutability(mut self, mutability: Mutability) -> Self {
        self.set_mutability(mutability);
        self
    }

    /// Bound descriptor of a collection value; `None` for scalars
    pub fn bound(&self) -> Option<Bound> {
        match &self.data {
            Data::Set(set) => Some(set.bound()),
            Data::Map(map) => Some(map.bound()),
            Data::List(list) => Some(list.bound()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self.data {
            Data::Number(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            Data::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.data {
            Data::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&ValueSet> {
        match &self.data {
            Data::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut ValueSet> {
        match &mut self.data {
            Data::Set(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match &self.data {
            Data::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut ValueMap> {
        match &mut self.data {
            Data::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ValueList> {
        match &self.data {
            Data::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut ValueList> {
        match &mut self.data {
            Data::List(list) => Some(list),
            _ => None,
        }
    }

    /// Apply a numeric mutation in place
    pub fn modify_number(&mut self, op: NumericOp, operand: f64) -> Result<(), ValueError> {
        match &mut self.data {
            Data::Number(n) => {
                *n = op.apply(*n, operand);
                Ok(())
            }
            _ => Err(ValueError::KindMismatch {
                expected: ValueKind::Number,
                found: self.kind(),
            }),
        }
    }

    /// Apply a numeric mutation given by name (`set`, `add`, `subtract`, ...)
    pub fn modify_number_named(&mut self, op: &str, operand: f64) -> Result<(), ValueError> {
        let op = op.parse::<NumericOp>()?;
        self.modify_number(op, operand)
    }

    /// Restart an expired time window at `now`, dropping its members
    ///
    /// Returns true if the window had expired. Non-windowed values are left
    /// untouched.
    pub fn refresh_window(&mut self, now: i64) -> bool {
        match &mut self.data {
            Data::Set(set) => set.refresh_window(now),
            Data::Map(map) => map.refresh_window(now),
            Data::List(list) => list.refresh_window(now),
            _ => false,
        }
    }

    /// Order two scalars of the same kind; `None` when they are not comparable
    pub fn compare(&self, other: &Value, order: ValueOrder) -> Option<Ordering> {
        let ordering = match (&self.data, &other.data) {
            (Data::Number(a), Data::Number(b)) => a.partial_cmp(b)?,
            (Data::String(a), Data::String(b)) => a.cmp(b),
            (Data::Boolean(a), Data::Boolean(b)) => a.cmp(b),
            _ => return None,
        };
        Some(match order {
            ValueOrder::Ascending => ordering,
            ValueOrder::Descending => ordering.reverse(),
        })
    }
}

impl From<ValueSet> for Value {
    fn from(set: ValueSet) -> Self {
        Value::new(Data::Set(set))
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::new(Data::Map(map))
    }
}

impl From<ValueList> for Value {
    fn from(list: ValueList) -> Self {
        Value::new(Data::List(list))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::boolean(b)
    }
}

fn write_elements<'a>(
    f: &mut fmt::Formatter<'_>,
    elements: impl Iterator<Item = &'a Value>,
) -> fmt::Result {
    f.write_str("[ ")?;
    for (i, element) in elements.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", element)?;
    }
    f.write_str(" ]")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Data::Absent => Ok(()),
            Data::Number(n) => write!(f, "{}", n),
            Data::String(s) => write!(f, "\"{}\"", s),
            Data::Boolean(b) => write!(f, "{}", b),
            Data::Set(set) => write_elements(f, set.iter()),
            Data::List(list) => write_elements(f, list.iter()),
            Data::Map(map) => {
                f.write_str("{ ")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "\"{}\": {}", key, value)?;
                }
                f.write_str(" }")
            }
        }
    }
}
