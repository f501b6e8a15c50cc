//! Shared types for capflow
//!
//! This crate provides the identifiers and bound descriptors used across the
//! capflow crates: analysis and entity ids, the mutability scope tag, and the
//! capacity/time-window bound attached to every collection value.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Analysis identifier (the name of an analysis script)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisId(pub String);

impl AnalysisId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnalysisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnalysisId {
    fn from(id: &str) -> Self {
        AnalysisId(id.to_string())
    }
}

/// Entity identifier (the subject variable state is scoped to)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId(id.to_string())
    }
}

/// Scope a value belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutability {
    /// Shared by every entity of an analysis
    Constant,
    /// Private to one (analysis, entity) pair
    Variable,
}

impl fmt::Display for Mutability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutability::Constant => write!(f, "constant"),
            Mutability::Variable => write!(f, "variable"),
        }
    }
}

/// Errors raised when constructing bound descriptors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundError {
    #[error("time window start must not be negative (got {0})")]
    NegativeWindowStart(i64),

    #[error("time window length must be positive (got {0})")]
    NonPositiveWindowLength(i64),
}

/// Time window in epoch milliseconds
///
/// Members of a windowed collection are live while `now < start + length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    start: i64,
    length: i64,
}

impl TimeWindow {
    pub fn new(start: i64, length: i64) -> Result<Self, BoundError> {
        if start < 0 {
            return Err(BoundError::NegativeWindowStart(start));
        }
        if length <= 0 {
            return Err(BoundError::NonPositiveWindowLength(length));
        }
        Ok(Self { start, length })
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn length(&self) -> i64 {
        self.length
    }

    /// First instant at which the window is no longer live
    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.length)
    }

    pub fn is_live(&self, now: i64) -> bool {
        now < self.end()
    }

    /// A window of the same length beginning at `now`
    pub fn restarted(&self, now: i64) -> Self {
        Self {
            start: now.max(0),
            length: self.length,
        }
    }
}

/// Bound descriptor of a collection value
///
/// Capacity and time window are mutually exclusive for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Bound {
    #[default]
    Unbounded,
    /// Least-recently-inserted members are evicted beyond this size
    Capacity { capacity: usize },
    /// Members expire together when the window closes
    Window { window: TimeWindow },
}

impl Bound {
    pub fn capacity(capacity: usize) -> Self {
        Bound::Capacity { capacity }
    }

    pub fn window(window: TimeWindow) -> Self {
        Bound::Window { window }
    }

    /// The capacity limit, if this is a capacity bound
    pub fn limit(&self) -> Option<usize> {
        match self {
            Bound::Capacity { capacity } => Some(*capacity),
            _ => None,
        }
    }

    pub fn time_window(&self) -> Option<TimeWindow> {
        match self {
            Bound::Window { window } => Some(*window),
            _ => None,
        }
    }

    pub fn is_windowed(&self) -> bool {
        matches!(self, Bound::Window { .. })
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, Bound::Unbounded)
    }

    /// Raise a capacity bound so it holds at least `len` members
    pub fn clamped_to(self, len: usize) -> Self {
        match self {
            Bound::Capacity { capacity } => Bound::Capacity {
                capacity: capacity.max(len),
            },
            other => other,
        }
    }

    /// Whether two bounds agree on their time-window parameters
    ///
    /// Two non-windowed bounds always agree; a windowed and a non-windowed
    /// bound never do.
    pub fn window_compatible(&self, other: &Bound) -> bool {
        self.time_window() == other.time_window()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_validation() {
        assert!(TimeWindow::new(0, 10).is_ok());
        assert_eq!(
            TimeWindow::new(-1, 10),
            Err(BoundError::NegativeWindowStart(-1))
        );
        assert_eq!(
            TimeWindow::new(5, 0),
            Err(BoundError::NonPositiveWindowLength(0))
        );
    }

    #[test]
    fn test_window_liveness() {
        let window = TimeWindow::new(1_000, 500).unwrap();
        assert!(window.is_live(1_499));
        assert!(!window.is_live(1_500));

        let restarted = window.restarted(2_000);
        assert_eq!(restarted.start(), 2_000);
        assert_eq!(restarted.length(), 500);
    }

    #[test]
    fn test_window_end_saturates() {
        let window = TimeWindow::new(i64::MAX - 1, 10).unwrap();
        assert_eq!(window.end(), i64::MAX);
    }

    #[test]
    fn test_clamp_only_touches_capacity() {
        assert_eq!(Bound::capacity(2).clamped_to(5), Bound::capacity(5));
        assert_eq!(Bound::capacity(8).clamped_to(5), Bound::capacity(8));
        assert_eq!(Bound::Unbounded.clamped_to(5), Bound::Unbounded);
    }

    #[test]
    fn test_window_compatibility() {
        let a = Bound::window(TimeWindow::new(10, 100).unwrap());
        let b = Bound::window(TimeWindow::new(10, 100).unwrap());
        let c = Bound::window(TimeWindow::new(11, 100).unwrap());

        assert!(a.window_compatible(&b));
        assert!(!a.window_compatible(&c));
        assert!(!a.window_compatible(&Bound::Unbounded));
        assert!(Bound::capacity(3).window_compatible(&Bound::Unbounded));
    }

    #[test]
    fn test_ids_serialize_as_strings() {
        let id = AnalysisId::new("fraud");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"fraud\"");
        assert_eq!(EntityId::from("user-1").to_string(), "user-1");
    }
}
