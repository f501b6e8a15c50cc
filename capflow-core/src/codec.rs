//! JSON state document codec
//!
//! State documents are JSON objects. Collection metadata travels in the
//! property name:
//!
//! | property name              | meaning                               |
//! |----------------------------|---------------------------------------|
//! | `set$name` / `list$name`   | unbounded set / list                  |
//! | `set*5*name`               | set holding at most 5 members         |
//! | `set%1000%60000%name`      | set windowed from 1000 for 60000 ms   |
//! | `name`                     | unbounded map (object value)          |
//! | `*5*name`, `%1000%60000%name` | bounded / windowed map             |
//!
//! Windowed collections are only valid in variable state. A windowed
//! collection whose window has closed is restarted at load time with its
//! members dropped.

use crate::collection::{ValueList, ValueMap, ValueSet};
use crate::state::NUMBER_EVENTS;
use crate::value::{Data, Value};
use capflow_types::{Bound, Mutability, TimeWindow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as Json};
use thiserror::Error;
use tracing::warn;

static COLLECTION_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(set|list)([$*%])(.*)$").expect("valid collection key regex"));

/// Errors raised while decoding a state document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("invalid property \"{key}\": {reason}")]
    MalformedKey { key: String, reason: String },

    #[error("time-windowed property \"{0}\" is not allowed in constant state")]
    WindowInConstantScope(String),

    #[error("property \"{0}\" must not be null")]
    NullMember(String),

    #[error("state document is not a JSON object")]
    NotAnObject,

    #[error("property \"{0}\" holds a number that cannot be represented")]
    UnsupportedValue(String),

    #[error("invalid JSON: {0}")]
    Json(String),
}

/// Kind of collection named by an array property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Set,
    List,
}

/// Parsed array property name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionKey {
    pub kind: CollectionKind,
    pub name: String,
    pub bound: Bound,
}

fn malformed(key: &str, reason: impl Into<String>) -> CodecError {
    CodecError::MalformedKey {
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn checked_name<'a>(key: &str, name: &'a str) -> Result<&'a str, CodecError> {
    if name.is_empty() {
        return Err(malformed(key, "collection name is empty"));
    }
    Ok(name)
}

/// Parse the `$name`, `*cap*name` or `%start%length%name` part of a key
fn parse_decoration(
    key: &str,
    decoration: &str,
    scope: Mutability,
) -> Result<(String, Bound), CodecError> {
    match decoration.chars().next() {
        Some('$') => {
            let fields: Vec<&str> = decoration.split('$').collect();
            if fields.len() != 2 {
                return Err(malformed(key, "expected $<name>"));
            }
            let name = checked_name(key, fields[1])?;
            Ok((name.to_string(), Bound::Unbounded))
        }
        Some('*') => {
            let fields: Vec<&str> = decoration.split('*').collect();
            if fields.len() != 3 {
                return Err(malformed(key, "expected *<capacity>*<name>"));
            }
            let capacity = fields[1].parse::<usize>().map_err(|_| {
                malformed(key, "capacity must be a non-negative integer")
            })?;
            let name = checked_name(key, fields[2])?;
            Ok((name.to_string(), Bound::capacity(capacity)))
        }
        Some('%') => {
            if scope == Mutability::Constant {
                return Err(CodecError::WindowInConstantScope(key.to_string()));
            }
            let fields: Vec<&str> = decoration.split('%').collect();
            if fields.len() != 4 {
                return Err(malformed(key, "expected %<windowStart>%<windowLength>%<name>"));
            }
            let start = fields[1]
                .parse::<i64>()
                .map_err(|_| malformed(key, "window start must be an integer"))?;
            let length = fields[2]
                .parse::<i64>()
                .map_err(|_| malformed(key, "window length must be an integer"))?;
            let window = TimeWindow::new(start, length).map_err(|e| malformed(key, e.to_string()))?;
            let name = checked_name(key, fields[3])?;
            Ok((name.to_string(), Bound::window(window)))
        }
        _ => Err(malformed(key, "expected $<name>, *<capacity>*<name> or %<start>%<length>%<name>")),
    }
}

/// Parse the property name of an array-valued member
pub fn parse_collection_key(key: &str, scope: Mutability) -> Result<CollectionKey, CodecError> {
    let captures = COLLECTION_KEY
        .captures(key)
        .ok_or_else(|| malformed(key, "array properties must be named set... or list..."))?;
    let kind = match &captures[1] {
        "set" => CollectionKind::Set,
        _ => CollectionKind::List,
    };
    let decoration = &key[captures[1].len()..];
    let (name, bound) = parse_decoration(key, decoration, scope)?;
    Ok(CollectionKey { kind, name, bound })
}

/// Parse the property name of an object-valued member
pub fn parse_map_key(key: &str, scope: Mutability) -> Result<(String, Bound), CodecError> {
    if key.starts_with('*') || key.starts_with('%') {
        parse_decoration(key, key, scope)
    } else {
        Ok((key.to_string(), Bound::Unbounded))
    }
}

fn decoration_suffix(name: &str, bound: Bound, unbounded: &str) -> String {
    match bound {
        Bound::Unbounded => format!("{}{}", unbounded, name),
        Bound::Capacity { capacity } => format!("*{}*{}", capacity, name),
        Bound::Window { window } => {
            format!("%{}%{}%{}", window.start(), window.length(), name)
        }
    }
}

/// Property name for `value` stored under `name`, carrying its bound
pub fn decorate_key(name: &str, value: &Value) -> String {
    match value.data() {
        Data::Set(set) => format!("set{}", decoration_suffix(name, set.bound(), "$")),
        Data::List(list) => format!("list{}", decoration_suffix(name, list.bound(), "$")),
        Data::Map(map) => decoration_suffix(name, map.bound(), ""),
        _ => name.to_string(),
    }
}

/// Decodes state documents into value maps for one scope
#[derive(Debug, Clone)]
pub struct DocumentDecoder {
    scope: Mutability,
    now: i64,
    count_events: bool,
}

impl DocumentDecoder {
    /// Variable-scope decoders bump the top-level event counter by default
    pub fn new(scope: Mutability, now: i64) -> Self {
        Self {
            scope,
            now,
            count_events: scope == Mutability::Variable,
        }
    }

    pub fn counting_events(mut self, count_events: bool) -> Self {
        self.count_events = count_events;
        self
    }

    pub fn decode_str(&self, text: &str) -> Result<ValueMap, CodecError> {
        let document: Json =
            serde_json::from_str(text).map_err(|e| CodecError::Json(e.to_string()))?;
        self.decode(&document)
    }

    /// Decode a top-level document; every member is tagged with the scope
    pub fn decode(&self, document: &Json) -> Result<ValueMap, CodecError> {
        let object = document.as_object().ok_or(CodecError::NotAnObject)?;
        let mut values = ValueMap::new();
        for (key, member) in object {
            let (name, value) = self.decode_member(key, member)?;
            let value = match (name.as_str(), value.as_number()) {
                (NUMBER_EVENTS, Some(count)) if self.count_events => Value::number(count + 1.0),
                _ => value.with_mutability(self.scope),
            };
            values.insert(name, value);
        }
        Ok(values)
    }

    fn decode_member(&self, key: &str, member: &Json) -> Result<(String, Value), CodecError> {
        match member {
            Json::Null => Err(CodecError::NullMember(key.to_string())),
            Json::Array(elements) => {
                let parsed = parse_collection_key(key, self.scope)?;
                let value = self.decode_array(key, parsed.kind, parsed.bound, elements)?;
                Ok((parsed.name, value))
            }
            Json::Object(object) => {
                let (name, bound) = parse_map_key(key, self.scope)?;
                Ok((name, self.decode_object(bound, object)?))
            }
            scalar => Ok((key.to_string(), decode_scalar(key, scalar)?)),
        }
    }

    fn decode_array(
        &self,
        key: &str,
        kind: CollectionKind,
        mut bound: Bound,
        elements: &[Json],
    ) -> Result<Value, CodecError> {
        let mut live = true;
        if let Some(window) = bound.time_window() {
            if !window.is_live(self.now) {
                bound = Bound::window(window.restarted(self.now));
                live = false;
            }
        }
        let mut decoded = Vec::new();
        if live {
            for element in elements.iter().filter(|e| !e.is_null()) {
                decoded.push(self.decode_element(key, element)?);
            }
        }
        let value = match kind {
            CollectionKind::Set => {
                let mut set = ValueSet::with_bound(bound);
                for element in decoded {
                    set.insert(element);
                }
                Value::from(set)
            }
            CollectionKind::List => {
                let mut list = ValueList::with_bound(bound);
                for element in decoded {
                    list.push(element);
                }
                Value::from(list)
            }
        };
        Ok(value)
    }

    /// Array elements carry no property name, so nested collections are unbounded
    fn decode_element(&self, key: &str, element: &Json) -> Result<Value, CodecError> {
        match element {
            Json::Array(nested) => {
                self.decode_array(key, CollectionKind::List, Bound::Unbounded, nested)
            }
            Json::Object(object) => self.decode_object(Bound::Unbounded, object),
            scalar => decode_scalar(key, scalar),
        }
    }

    fn decode_object(&self, mut bound: Bound, object: &JsonMap<String, Json>) -> Result<Value, CodecError> {
        let mut live = true;
        if let Some(window) = bound.time_window() {
            if !window.is_live(self.now) {
                bound = Bound::window(window.restarted(self.now));
                live = false;
            }
        }
        let mut map = ValueMap::with_bound(bound);
        if live {
            for (key, member) in object {
                let (name, value) = self.decode_member(key, member)?;
                map.insert(name, value);
            }
        }
        Ok(Value::from(map))
    }
}

fn decode_scalar(key: &str, scalar: &Json) -> Result<Value, CodecError> {
    match scalar {
        Json::Bool(b) => Ok(Value::boolean(*b)),
        Json::String(s) => Ok(Value::string(s.as_str())),
        Json::Number(n) => n
            .as_f64()
            .map(Value::number)
            .ok_or_else(|| CodecError::UnsupportedValue(key.to_string())),
        _ => Err(CodecError::NullMember(key.to_string())),
    }
}

/// Encodes value maps into JSON documents
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentEncoder {
    decorate: bool,
    scope: Option<Mutability>,
}

impl DocumentEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit collection bounds in property names so the document can be decoded
    pub fn decorated(mut self, decorate: bool) -> Self {
        self.decorate = decorate;
        self
    }

    /// Only emit map members that are untagged or tagged with `scope`
    pub fn scoped(mut self, scope: Mutability) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn encode(&self, values: &ValueMap) -> Json {
        Json::Object(self.encode_map(values))
    }

    pub fn encode_string(&self, values: &ValueMap) -> String {
        self.encode(values).to_string()
    }

    fn in_scope(&self, value: &Value) -> bool {
        match (self.scope, value.mutability()) {
            (Some(scope), Some(tag)) => scope == tag,
            _ => true,
        }
    }

    fn encode_map(&self, values: &ValueMap) -> JsonMap<String, Json> {
        let mut object = JsonMap::new();
        for (name, value) in values.iter() {
            if !self.in_scope(value) {
                continue;
            }
            let Some(encoded) = self.encode_value(name, value) else {
                continue;
            };
            let key = if self.decorate {
                decorate_key(name, value)
            } else {
                name.to_string()
            };
            object.insert(key, encoded);
        }
        object
    }

    /// JSON form of `value`; `None` for absent values and non-finite numbers
    pub fn encode_value(&self, name: &str, value: &Value) -> Option<Json> {
        match value.data() {
            Data::Absent => None,
            Data::Number(n) => match JsonNumber::from_f64(*n) {
                Some(number) => Some(Json::Number(number)),
                None => {
                    warn!(property = name, value = %n, "Skipping non-finite number");
                    None
                }
            },
            Data::String(s) => Some(Json::String(s.clone())),
            Data::Boolean(b) => Some(Json::Bool(*b)),
            Data::Set(set) => Some(self.encode_elements(name, set.iter())),
            Data::List(list) => Some(self.encode_elements(name, list.iter())),
            Data::Map(map) => Some(Json::Object(self.encode_map(map))),
        }
    }

    fn encode_elements<'a>(&self, name: &str, elements: impl Iterator<Item = &'a Value>) -> Json {
        Json::Array(
            elements
                .filter_map(|element| self.encode_value(name, element))
                .collect(),
        )
    }
}
