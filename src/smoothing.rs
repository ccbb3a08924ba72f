//! Smoothing and interpolation primitives.
//!
//! Small numeric helpers shared by sensors, curves and fan controllers:
//! exponential moving averages, a bounded rolling window, linear and step
//! interpolation over sparse control points, and nearest-value lookup.

use std::collections::{BTreeMap, VecDeque};

/// Updates an exponential moving average with a new sample.
///
/// `n` is the configured window size. The result approximates, but does not
/// equal, a simple moving average over the last `n` samples.
///
/// # Example
///
/// ```
/// use fanwarden::smoothing::update_moving_avg;
///
/// assert_eq!(update_moving_avg(10.0, 2, 20.0), 15.0);
/// ```
pub fn update_moving_avg(old: f64, n: usize, new: f64) -> f64 {
    let n = n.max(1) as f64;
    old + (new - old) / n
}

/// Linearly interpolates `x` over control points sorted by key.
///
/// Values at or below the smallest key clamp to the first point, values at
/// or above the largest key clamp to the last point. Exact key hits return
/// the stored value. An empty map yields `0.0`.
pub fn interpolate_linear<K>(points: &BTreeMap<K, f64>, x: f64) -> f64
where
    K: Copy + Ord + Into<f64>,
{
    let (Some((&first_key, &first_value)), Some((&last_key, &last_value))) =
        (points.first_key_value(), points.last_key_value())
    else {
        return 0.0;
    };

    if x <= first_key.into() {
        return first_value;
    }
    if x >= last_key.into() {
        return last_value;
    }

    let mut lower = (first_key.into(), first_value);
    for (&key, &value) in points {
        let key: f64 = key.into();
        if key == x {
            return value;
        }
        if key > x {
            let (lower_key, lower_value) = lower;
            let ratio = (x - lower_key) / (key - lower_key);
            return lower_value + ratio * (value - lower_value);
        }
        lower = (key, value);
    }

    last_value
}

/// Returns the value of the closest point at or below `x`, without blending.
///
/// Values below the smallest key clamp to the first point.
pub fn interpolate_step<K, V>(points: &BTreeMap<K, V>, x: K) -> Option<V>
where
    K: Copy + Ord,
    V: Copy,
{
    points
        .range(..=x)
        .next_back()
        .or_else(|| points.first_key_value())
        .map(|(_, value)| *value)
}

/// Expands sparse control points into one linearly interpolated entry per
/// duty cycle in `start..=end`.
pub fn interpolate_linear_range<K>(points: &BTreeMap<K, f64>, start: u8, end: u8) -> BTreeMap<u8, f64>
where
    K: Copy + Ord + Into<f64>,
{
    (start..=end)
        .map(|pwm| (pwm, interpolate_linear(points, f64::from(pwm))))
        .collect()
}

/// Finds the element of `sorted` closest to `target`.
///
/// Uses binary search; ties are broken toward the smaller value.
///
/// # Example
///
/// ```
/// use fanwarden::smoothing::find_closest;
///
/// assert_eq!(find_closest(54, &[0, 58, 100]), Some(58));
/// assert_eq!(find_closest(29, &[0, 58, 100]), Some(0));
/// ```
pub fn find_closest(target: u8, sorted: &[u8]) -> Option<u8> {
    match sorted.binary_search(&target) {
        Ok(idx) => Some(sorted[idx]),
        Err(0) => sorted.first().copied(),
        Err(idx) if idx == sorted.len() => sorted.last().copied(),
        Err(idx) => {
            let below = sorted[idx - 1];
            let above = sorted[idx];
            if target - below <= above - target {
                Some(below)
            } else {
                Some(above)
            }
        }
    }
}

/// Bounded window over the most recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl RollingWindow {
    /// Creates an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Fills the whole window with `value`.
    pub fn fill(&mut self, value: f64) {
        self.values.clear();
        self.values.extend(std::iter::repeat_n(value, self.capacity));
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    pub fn avg(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
