use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Closed integer range `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IntInterval {
    pub min: i32,
    pub max: i32,
}

impl IntInterval {
    pub const UNBOUNDED: IntInterval = IntInterval { min: i32::MIN, max: i32::MAX };
    pub const ZERO: IntInterval = IntInterval { min: 0, max: 0 };

    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min as i64 <= value && value <= self.max as i64
    }

    /// Both bounds moved by `delta`. Unbounded ends stay unbounded, finite
    /// ends saturate at the `i32` range.
    pub fn shifted(&self, delta: i64) -> Self {
        let shift = |bound: i32| match bound {
            i32::MIN | i32::MAX => bound,
            b => saturate(b as i64 + delta),
        };
        Self {
            min: shift(self.min),
            max: shift(self.max),
        }
    }

    pub fn clamp(&self, value: i64) -> i32 {
        saturate(value.max(self.min as i64).min(self.max as i64))
    }
}

impl fmt::Display for IntInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Closed range over epoch seconds or energy accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LongInterval {
    pub min: i64,
    pub max: i64,
}

impl LongInterval {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl From<IntInterval> for LongInterval {
    fn from(i: IntInterval) -> Self {
        Self { min: i.min as i64, max: i.max as i64 }
    }
}

pub fn saturate(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Step function `offset-seconds -> W`.
pub type PowerProfile = BTreeMap<i32, i32>;

/// `offset-seconds -> bound`. Step function for power, piecewise linear for energy.
pub type Corridor = BTreeMap<i32, IntInterval>;

/// Absolute timeline `epoch-second -> W`.
pub type PowerTimeline = BTreeMap<i64, i32>;

/// Navigation helpers for ordered maps read as step functions.
pub trait StepMap<K, V> {
    fn floor_entry(&self, key: K) -> Option<(K, &V)>;
    fn higher_entry(&self, key: K) -> Option<(K, &V)>;

    fn floor_value(&self, key: K) -> Option<&V> {
        self.floor_entry(key).map(|(_, v)| v)
    }

    fn higher_key(&self, key: K) -> Option<K> {
        self.higher_entry(key).map(|(k, _)| k)
    }
}

impl<K: Ord + Copy, V> StepMap<K, V> for BTreeMap<K, V> {
    fn floor_entry(&self, key: K) -> Option<(K, &V)> {
        self.range(..=key).next_back().map(|(k, v)| (*k, v))
    }

    fn higher_entry(&self, key: K) -> Option<(K, &V)> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.range((Excluded(key), Unbounded)).next().map(|(k, v)| (*k, v))
    }
}
