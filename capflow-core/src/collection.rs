//! Bounded collections and set algebra
//!
//! Sets, maps and lists carry a [`Bound`]: unbounded, a capacity enforced by
//! evicting the least-recently-inserted member, or a time window after which
//! all members expire together. Capacity is never below the member count.

use crate::value::{Data, Value, ValueError, ValueKind};
use capflow_types::{Bound, Mutability, TimeWindow};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

fn hash_one<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

fn over_capacity(bound: &Bound, len: usize) -> bool {
    bound.limit().is_some_and(|capacity| len > capacity)
}

/// Restart `bound`'s window at `now` if it has closed
fn expire(bound: &mut Bound, now: i64) -> bool {
    if let Some(window) = bound.time_window() {
        if !window.is_live(now) {
            *bound = Bound::window(window.restarted(now));
            return true;
        }
    }
    false
}

/// Insertion-ordered set of unique values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "SetRepr", into = "SetRepr")]
pub struct ValueSet {
    order: VecDeque<Value>,
    members: HashSet<Value>,
    bound: Bound,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bound(bound: Bound) -> Self {
        Self {
            bound,
            ..Self::default()
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_bound(Bound::capacity(capacity))
    }

    pub fn windowed(window: TimeWindow) -> Self {
        Self::with_bound(Bound::window(window))
    }

    /// Build a set from `members`, raising a capacity bound to fit them all
    pub fn from_members(bound: Bound, members: impl IntoIterator<Item = Value>) -> Self {
        let mut set = Self::new();
        for member in members {
            set.insert(member);
        }
        set.bound = bound.clamped_to(set.len());
        set
    }

    pub fn bound(&self) -> Bound {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.members.contains(value)
    }

    /// Members from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.order.iter()
    }

    /// Insert `value`, evicting the oldest members beyond capacity
    ///
    /// Returns false if the value was already present; its position is kept.
    pub fn insert(&mut self, value: Value) -> bool {
        if self.members.contains(&value) {
            return false;
        }
        self.members.insert(value.clone());
        self.order.push_back(value);
        while over_capacity(&self.bound, self.order.len()) {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        true
    }

    pub fn remove(&mut self, value: &Value) -> bool {
        if !self.members.remove(value) {
            return false;
        }
        self.order.retain(|member| member != value);
        true
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }

    pub fn refresh_window(&mut self, now: i64) -> bool {
        let expired = expire(&mut self.bound, now);
        if expired {
            self.clear();
        }
        expired
    }

    pub(crate) fn set_mutability(&mut self, mutability: Mutability) {
        for member in self.order.iter_mut() {
            member.set_mutability(mutability);
        }
        self.members = self.order.iter().cloned().collect();
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|member| other.contains(member))
    }
}

impl Eq for ValueSet {}

impl Hash for ValueSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let combined = self
            .order
            .iter()
            .fold(0u64, |acc, member| acc.wrapping_add(hash_one(member)));
        state.write_usize(self.len());
        state.write_u64(combined);
    }
}

#[derive(Serialize, Deserialize)]
struct SetRepr {
    #[serde(default)]
    bound: Bound,
    members: Vec<Value>,
}

impl From<SetRepr> for ValueSet {
    fn from(repr: SetRepr) -> Self {
        ValueSet::from_members(repr.bound, repr.members)
    }
}

impl From<ValueSet> for SetRepr {
    fn from(set: ValueSet) -> Self {
        SetRepr {
            bound: set.bound,
            members: set.order.into_iter().collect(),
        }
    }
}

/// String-keyed map that remembers key insertion order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "MapRepr", into = "MapRepr")]
pub struct ValueMap {
    entries: HashMap<String, Value>,
    order: VecDeque<String>,
    bound: Bound,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bound(bound: Bound) -> Self {
        Self {
            bound,
            ..Self::default()
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_bound(Bound::capacity(capacity))
    }

    pub fn windowed(window: TimeWindow) -> Self {
        Self::with_bound(Bound::window(window))
    }

    pub fn from_entries(
        bound: Bound,
        entries: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        let mut map = Self::new();
        for (key, value) in entries {
            map.insert(key, value);
        }
        map.bound = bound.clamped_to(map.len());
        map
    }

    pub fn bound(&self) -> Bound {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Entries from oldest to newest key
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.order
            .iter()
            .filter_map(move |key| self.entries.get(key).map(|value| (key.as_str(), value)))
    }

    /// Insert or replace `key`; a replaced key keeps its position
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if let Some(slot) = self.entries.get_mut(&key) {
            return Some(std::mem::replace(slot, value));
        }
        self.entries.insert(key.clone(), value);
        self.order.push_back(key);
        while over_capacity(&self.bound, self.order.len()) {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        None
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key)?;
        self.order.retain(|existing| existing != key);
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn refresh_window(&mut self, now: i64) -> bool {
        let expired = expire(&mut self.bound, now);
        if expired {
            self.clear();
        }
        expired
    }

    pub(crate) fn set_mutability(&mut self, mutability: Mutability) {
        for value in self.entries.values_mut() {
            value.set_mutability(mutability);
        }
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

impl Eq for ValueMap {}

impl Hash for ValueMap {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let combined = self
            .entries
            .iter()
            .fold(0u64, |acc, entry| acc.wrapping_add(hash_one(&entry)));
        state.write_usize(self.len());
        state.write_u64(combined);
    }
}

#[derive(Serialize, Deserialize)]
struct MapRepr {
    #[serde(default)]
    bound: Bound,
    entries: Vec<(String, Value)>,
}

impl From<MapRepr> for ValueMap {
    fn from(repr: MapRepr) -> Self {
        ValueMap::from_entries(repr.bound, repr.entries)
    }
}

impl From<ValueMap> for MapRepr {
    fn from(map: ValueMap) -> Self {
        let bound = map.bound;
        let ValueMap {
            mut entries, order, ..
        } = map;
        MapRepr {
            bound,
            entries: order
                .into_iter()
                .filter_map(|key| entries.remove(&key).map(|value| (key, value)))
                .collect(),
        }
    }
}

/// Ordered sequence; pushing beyond capacity drops the front
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ListRepr", into = "ListRepr")]
pub struct ValueList {
    elements: VecDeque<Value>,
    bound: Bound,
}

impl ValueList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bound(bound: Bound) -> Self {
        Self {
            bound,
            ..Self::default()
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_bound(Bound::capacity(capacity))
    }

    pub fn windowed(window: TimeWindow) -> Self {
        Self::with_bound(Bound::window(window))
    }

    pub fn from_elements(bound: Bound, elements: impl IntoIterator<Item = Value>) -> Self {
        let elements: VecDeque<Value> = elements.into_iter().collect();
        Self {
            bound: bound.clamped_to(elements.len()),
            elements,
        }
    }

    pub fn bound(&self) -> Bound {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.elements.get(index)
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.elements.contains(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.elements.iter()
    }

    pub fn push(&mut self, value: Value) {
        self.elements.push_back(value);
        while over_capacity(&self.bound, self.elements.len()) {
            self.elements.pop_front();
        }
    }

    pub fn remove(&mut self, index: usize) -> Option<Value> {
        self.elements.remove(index)
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }

    pub fn refresh_window(&mut self, now: i64) -> bool {
        let expired = expire(&mut self.bound, now);
        if expired {
            self.clear();
        }
        expired
    }

    pub(crate) fn set_mutability(&mut self, mutability: Mutability) {
        for element in self.elements.iter_mut() {
            element.set_mutability(mutability);
        }
    }
}

impl PartialEq for ValueList {
    fn eq(&self, other: &Self) -> bool {
        self.elements == other.elements
    }
}

impl Eq for ValueList {}

impl Hash for ValueList {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.elements.hash(state);
    }
}

#[derive(Serialize, Deserialize)]
struct ListRepr {
    #[serde(default)]
    bound: Bound,
    elements: Vec<Value>,
}

impl From<ListRepr> for ValueList {
    fn from(repr: ListRepr) -> Self {
        ValueList::from_elements(repr.bound, repr.elements)
    }
}

impl From<ValueList> for ListRepr {
    fn from(list: ValueList) -> Self {
        ListRepr {
            bound: list.bound,
            elements: list.elements.into_iter().collect(),
        }
    }
}

fn number_operand(value: &Value) -> Result<f64, ValueError> {
    value.as_number().ok_or(ValueError::KindMismatch {
        expected: ValueKind::Number,
        found: value.kind(),
    })
}

/// Capacity bound from a script-supplied number
///
/// A capacity of `i32::MAX` or more is the "no limit" sentinel.
pub fn capacity_bound(capacity: &Value) -> Result<Bound, ValueError> {
    let capacity = number_operand(capacity)?;
    if capacity.is_nan() || capacity < 0.0 {
        return Err(ValueError::InvalidCapacity(capacity));
    }
    if capacity >= i32::MAX as f64 {
        return Ok(Bound::Unbounded);
    }
    Ok(Bound::capacity(capacity as usize))
}

/// Window bound from script-supplied start and length
pub fn window_bound(start: &Value, length: &Value) -> Result<Bound, ValueError> {
    let start = number_operand(start)?;
    let length = number_operand(length)?;
    let window = TimeWindow::new(start as i64, length as i64)?;
    Ok(Bound::window(window))
}

/// Check that `a` and `b` are collections of one kind with matching windows
fn check_operands(a: &Value, b: &Value) -> Result<Bound, ValueError> {
    if !a.kind().is_collection() {
        return Err(ValueError::KindMismatch {
            expected: ValueKind::Set,
            found: a.kind(),
        });
    }
    if a.kind() != b.kind() {
        return Err(ValueError::KindMismatch {
            expected: a.kind(),
            found: b.kind(),
        });
    }
    let (bound_a, bound_b) = (a.bound().unwrap_or_default(), b.bound().unwrap_or_default());
    if !bound_a.window_compatible(&bound_b) {
        return Err(ValueError::IncompatibleBounds);
    }
    Ok(match (bound_a, bound_b) {
        (Bound::Window { .. }, _) => bound_a,
        (Bound::Capacity { capacity: x }, Bound::Capacity { capacity: y }) => x
            .checked_add(y)
            .map(Bound::capacity)
            .unwrap_or(Bound::Unbounded),
        _ => Bound::Unbounded,
    })
}

/// Union of two collections of the same kind
///
/// Members are inserted `a` first, then `b`, under the combined bound: a
/// shared window, the sum of two capacities, or unbounded when either operand
/// is. For maps, `b` wins on key collisions. Lists are concatenated.
pub fn combine(a: &Value, b: &Value) -> Result<Value, ValueError> {
    let bound = check_operands(a, b)?;
    let combined = match (a.data(), b.data()) {
        (Data::Set(x), Data::Set(y)) => {
            let mut out = ValueSet::with_bound(bound);
            for member in x.iter().chain(y.iter()) {
                out.insert(member.clone());
            }
            Value::from(out)
        }
        (Data::Map(x), Data::Map(y)) => {
            let mut out = ValueMap::with_bound(bound);
            for (key, value) in x.iter().chain(y.iter()) {
                out.insert(key, value.clone());
            }
            Value::from(out)
        }
        (Data::List(x), Data::List(y)) => {
            let mut out = ValueList::with_bound(bound);
            for element in x.iter().chain(y.iter()) {
                out.push(element.clone());
            }
            Value::from(out)
        }
        _ => {
            return Err(ValueError::KindMismatch {
                expected: a.kind(),
                found: b.kind(),
            })
        }
    };
    Ok(combined)
}

/// Members of `a` not in `b`, or in both when `intersect` is set
///
/// The result keeps `a`'s bound. Maps are compared by key.
pub fn difference(a: &Value, b: &Value, intersect: bool) -> Result<Value, ValueError> {
    check_operands(a, b)?;
    let bound = a.bound().unwrap_or_default();
    let result = match (a.data(), b.data()) {
        (Data::Set(x), Data::Set(y)) => Value::from(ValueSet::from_members(
            bound,
            x.iter().filter(|m| y.contains(m) == intersect).cloned(),
        )),
        (Data::Map(x), Data::Map(y)) => Value::from(ValueMap::from_entries(
            bound,
            x.iter()
                .filter(|(key, _)| y.contains_key(key) == intersect)
                .map(|(key, value)| (key.to_string(), value.clone())),
        )),
        (Data::List(x), Data::List(y)) => Value::from(ValueList::from_elements(
            bound,
            x.iter().filter(|e| y.contains(e) == intersect).cloned(),
        )),
        _ => {
            return Err(ValueError::KindMismatch {
                expected: a.kind(),
                found: b.kind(),
            })
        }
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers(range: std::ops::Range<i32>) -> impl DoubleEndedIterator<Item = Value> {
        range.map(|n| Value::number(n as f64))
    }

    fn window(start: i64, length: i64) -> TimeWindow {
        TimeWindow::new(start, length).unwrap()
    }

    #[test]
    fn test_set_evicts_oldest() {
        let mut set = ValueSet::bounded(3);
        for value in numbers(0..5) {
            set.insert(value);
        }
        assert_eq!(set.len(), 3);
        let kept: Vec<_> = set.iter().filter_map(Value::as_number).collect();
        assert_eq!(kept, vec![2.0, 3.0, 4.0]);
        assert!(!set.contains(&Value::number(0.0)));
    }

    #[test]
    fn test_set_reinsert_keeps_position() {
        let mut set = ValueSet::bounded(2);
        assert!(set.insert(Value::string("a")));
        assert!(set.insert(Value::string("b")));
        assert!(!set.insert(Value::string("a")));
        set.insert(Value::string("c"));
        let kept: Vec<_> = set.iter().filter_map(Value::as_str).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }

    #[test]
    fn test_factories_clamp_capacity() {
        let set = ValueSet::from_members(Bound::capacity(1), numbers(0..4));
        assert_eq!(set.len(), 4);
        assert_eq!(set.bound(), Bound::capacity(4));

        let list = ValueList::from_elements(Bound::capacity(0), numbers(0..2));
        assert_eq!(list.bound(), Bound::capacity(2));
    }

    #[test]
    fn test_map_replace_keeps_order_and_evicts() {
        let mut map = ValueMap::bounded(2);
        map.insert("a", Value::number(1.0));
        map.insert("b", Value::number(2.0));
        assert_eq!(map.insert("a", Value::number(3.0)), Some(Value::number(1.0)));
        map.insert("c", Value::number(4.0));
        let keys: Vec<_> = map.keys().collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(map.remove("b"), Some(Value::number(2.0)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_list_push_drops_front() {
        let mut list = ValueList::bounded(2);
        for value in numbers(0..3) {
            list.push(value);
        }
        assert_eq!(list.get(0), Some(&Value::number(1.0)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_window_refresh() {
        let mut set = ValueSet::windowed(window(100, 50));
        set.insert(Value::number(1.0));

        assert!(!set.refresh_window(149));
        assert_eq!(set.len(), 1);

        assert!(set.refresh_window(150));
        assert!(set.is_empty());
        assert_eq!(set.bound(), Bound::window(window(150, 50)));
    }

    #[test]
    fn test_capacity_bound_from_number() {
        assert_eq!(capacity_bound(&Value::number(5.0)), Ok(Bound::capacity(5)));
        assert_eq!(
            capacity_bound(&Value::number(i32::MAX as f64)),
            Ok(Bound::Unbounded)
        );
        assert_eq!(
            capacity_bound(&Value::number(-1.0)),
            Err(ValueError::InvalidCapacity(-1.0))
        );
        assert!(matches!(
            window_bound(&Value::number(0.0), &Value::number(0.0)),
            Err(ValueError::InvalidWindow(_))
        ));
    }

    #[test]
    fn test_combine_sums_capacities() {
        let a = Value::from(ValueSet::from_members(Bound::capacity(2), numbers(0..2)));
        let b = Value::from(ValueSet::from_members(Bound::capacity(3), numbers(1..4)));
        let combined = combine(&a, &b).unwrap();
        let set = combined.as_set().unwrap();
        assert_eq!(set.bound(), Bound::capacity(5));
        assert_eq!(set.len(), 4);
        assert_eq!(combined.mutability(), None);
    }

    #[test]
    fn test_combine_with_unbounded_is_unbounded() {
        let a = Value::from(ValueSet::from_members(Bound::capacity(2), numbers(0..2)));
        let b = Value::from(ValueSet::from_members(Bound::Unbounded, numbers(5..6)));
        let combined = combine(&a, &b).unwrap();
        assert_eq!(combined.bound(), Some(Bound::Unbounded));
    }

    #[test]
    fn test_combine_overflow_becomes_unbounded() {
        let a = Value::from(ValueSet::bounded(usize::MAX));
        let b = Value::from(ValueSet::bounded(1));
        assert_eq!(combine(&a, &b).unwrap().bound(), Some(Bound::Unbounded));
    }

    #[test]
    fn test_combine_windows_must_match() {
        let a = Value::from(ValueSet::windowed(window(0, 100)));
        let b = Value::from(ValueSet::windowed(window(10, 100)));
        let c = Value::from(ValueSet::windowed(window(0, 200)));
        let d = Value::from(ValueSet::new());
        assert_eq!(combine(&a, &b), Err(ValueError::IncompatibleBounds));
        assert_eq!(combine(&a, &c), Err(ValueError::IncompatibleBounds));
        assert_eq!(combine(&a, &d), Err(ValueError::IncompatibleBounds));
        assert_eq!(
            difference(&d, &a, false),
            Err(ValueError::IncompatibleBounds)
        );

        let same = Value::from(ValueSet::from_members(
            Bound::window(window(0, 100)),
            numbers(0..10),
        ));
        let combined = combine(&a, &same).unwrap();
        assert_eq!(combined.as_set().unwrap().len(), 10);
        assert_eq!(combined.bound(), Some(Bound::window(window(0, 100))));
    }

    #[test]
    fn test_combine_rejects_mixed_kinds() {
        let set = Value::from(ValueSet::new());
        let list = Value::from(ValueList::new());
        assert!(matches!(
            combine(&set, &list),
            Err(ValueError::KindMismatch { .. })
        ));
        assert!(matches!(
            combine(&Value::number(1.0), &Value::number(2.0)),
            Err(ValueError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_difference_and_intersection() {
        let a = Value::from(ValueSet::from_members(Bound::capacity(10), numbers(0..5)));
        let b = Value::from(ValueSet::from_members(Bound::Unbounded, numbers(3..8)));

        let diff = difference(&a, &b, false).unwrap();
        assert_eq!(
            diff.as_set().unwrap(),
            &ValueSet::from_members(Bound::Unbounded, numbers(0..3))
        );
        assert_eq!(diff.bound(), Some(Bound::capacity(10)));

        let both = difference(&a, &b, true).unwrap();
        assert_eq!(
            both.as_set().unwrap(),
            &ValueSet::from_members(Bound::Unbounded, numbers(3..5))
        );
    }

    #[test]
    fn test_map_combine_prefers_later_operand() {
        let mut x = ValueMap::new();
        x.insert("k", Value::number(1.0));
        x.insert("only-x", Value::boolean(true));
        let mut y = ValueMap::new();
        y.insert("k", Value::number(2.0));

        let combined = combine(&Value::from(x.clone()), &Value::from(y.clone())).unwrap();
        let map = combined.as_map().unwrap();
        assert_eq!(map.get("k"), Some(&Value::number(2.0)));
        assert_eq!(map.len(), 2);

        let keyed = difference(&Value::from(x), &Value::from(y), false).unwrap();
        let keys: Vec<_> = keyed.as_map().unwrap().keys().collect();
        assert_eq!(keys, vec!["only-x"]);
    }

    #[test]
    fn test_set_equality_ignores_bound_and_order() {
        let a = ValueSet::from_members(Bound::capacity(3), numbers(0..3));
        let b = ValueSet::from_members(Bound::Unbounded, numbers(0..3).rev());
        assert_eq!(a, b);
        assert_eq!(hash_one(&a), hash_one(&b));
    }

    #[test]
    fn test_serde_keeps_bound_and_order() {
        let set = ValueSet::from_members(Bound::capacity(5), numbers(0..3));
        let json = serde_json::to_string(&set).unwrap();
        let back: ValueSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bound(), Bound::capacity(5));
        let order: Vec<_> = back.iter().filter_map(Value::as_number).collect();
        assert_eq!(order, vec![0.0, 1.0, 2.0]);
    }
}
