//! View descriptors, aggregation kinds, and snapshot data.

use std::collections::HashMap;
use std::time::SystemTime;

use crate::bucket::{BucketBoundaries, Bucketing};
use crate::tag::TagKey;

/// How a view folds recorded values into its rows.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Number of observations.
    Count,
    /// Running sum of observed values.
    Sum,
    /// Full streaming distribution over the given bucket layout.
    Distribution(BucketBoundaries),
}

/// Time extent of a view's aggregation.
///
/// Only cumulative windows are implemented; the variants exist so the
/// projection machinery extends to interval windows without an API break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Window {
    /// Aggregate over the view's whole lifetime.
    #[default]
    Cumulative,
}

/// Immutable definition of a view: a measure, an aggregation kind, a
/// window, and the tag columns that form each row key.
#[derive(Debug, Clone)]
pub struct ViewDescriptor {
    name: String,
    measure_name: String,
    aggregation: Aggregation,
    window: Window,
    columns: Vec<TagKey>,
}

impl Default for ViewDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewDescriptor {
    pub fn new() -> Self {
        Self {
            name: String::new(),
            measure_name: String::new(),
            aggregation: Aggregation::Count,
            window: Window::Cumulative,
            columns: Vec::new(),
        }
    }

    /// Sets the view name (informational; not part of view identity).
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the measure this view aggregates, by registered name.
    pub fn set_measure(mut self, measure_name: impl Into<String>) -> Self {
        self.measure_name = measure_name.into();
        self
    }

    /// Sets the aggregation kind.
    pub fn set_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Sets the aggregation window.
    pub fn set_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    /// Appends a tag column. Column keys must be distinct.
    pub fn add_column(mut self, column: TagKey) -> Self {
        self.columns.push(column);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn measure_name(&self) -> &str {
        &self.measure_name
    }

    pub fn aggregation(&self) -> &Aggregation {
        &self.aggregation
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn columns(&self) -> &[TagKey] {
        &self.columns
    }

    /// Whether two descriptors denote the same aggregate state: equal
    /// aggregation, window, and column list. Names are ignored.
    pub fn same_aggregate(&self, other: &ViewDescriptor) -> bool {
        self.aggregation == other.aggregation
            && self.window == other.window
            && self.columns == other.columns
    }
}

/// Streaming distribution statistics for one view row.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    count: u64,
    mean: f64,
    sum_of_squared_deviation: f64,
    min: f64,
    max: f64,
    bucket_counts: Vec<i64>,
}

impl Distribution {
    pub(crate) fn new(num_buckets: u32) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            sum_of_squared_deviation: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            bucket_counts: vec![0; num_buckets as usize],
        }
    }

    /// Folds in a single observation (synchronous record path).
    pub(crate) fn add(&mut self, value: f64, bucketing: &BucketBoundaries) {
        self.count += 1;
        let new_mean = self.mean + (value - self.mean) / self.count as f64;
        self.sum_of_squared_deviation += (value - self.mean) * (value - new_mean);
        self.mean = new_mean;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.bucket_counts[bucketing.bucket_for(value) as usize] += 1;
    }

    /// Folds in pre-aggregated statistics from a drained delta, using the
    /// parallel combination of two Welford states.
    ///
    /// `buckets` carries the other side's counts when its layout matches
    /// this distribution's; scalar statistics merge regardless.
    pub(crate) fn merge(
        &mut self,
        count: u64,
        mean: f64,
        sum_of_squared_deviation: f64,
        min: f64,
        max: f64,
        buckets: Option<&[i64]>,
    ) {
        if count == 0 {
            return;
        }
        let n1 = self.count as f64;
        let n2 = count as f64;
        let n = n1 + n2;
        let delta = mean - self.mean;
        self.mean += delta * n2 / n;
        self.sum_of_squared_deviation += sum_of_squared_deviation + delta * delta * n1 * n2 / n;
        self.count += count;
        self.min = self.min.min(min);
        self.max = self.max.max(max);

        if let Some(buckets) = buckets {
            debug_assert_eq!(buckets.len(), self.bucket_counts.len());
            for (own, other) in self.bucket_counts.iter_mut().zip(buckets) {
                *own += *other;
            }
        }
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Running mean; meaningful only when `count() > 0`.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sum of observations, read out as `count * mean`.
    pub fn sum(&self) -> f64 {
        self.count as f64 * self.mean
    }

    /// Sum of squared deviations from the mean.
    pub fn sum_of_squared_deviation(&self) -> f64 {
        self.sum_of_squared_deviation
    }

    /// Smallest observation.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest observation.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Per-bucket observation counts.
    pub fn bucket_counts(&self) -> &[i64] {
        &self.bucket_counts
    }
}

/// Row data of a view snapshot, keyed by the projected tag values.
#[derive(Debug, Clone)]
pub enum ViewRows {
    Count(HashMap<Vec<String>, u64>),
    Sum(HashMap<Vec<String>, f64>),
    Distribution(HashMap<Vec<String>, Distribution>),
}

impl ViewRows {
    /// Count rows, when the view aggregates counts.
    pub fn counts(&self) -> Option<&HashMap<Vec<String>, u64>> {
        match self {
            ViewRows::Count(rows) => Some(rows),
            _ => None,
        }
    }

    /// Sum rows, when the view aggregates sums.
    pub fn sums(&self) -> Option<&HashMap<Vec<String>, f64>> {
        match self {
            ViewRows::Sum(rows) => Some(rows),
            _ => None,
        }
    }

    /// Distribution rows, when the view aggregates distributions.
    pub fn distributions(&self) -> Option<&HashMap<Vec<String>, Distribution>> {
        match self {
            ViewRows::Distribution(rows) => Some(rows),
            _ => None,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            ViewRows::Count(rows) => rows.len(),
            ViewRows::Sum(rows) => rows.len(),
            ViewRows::Distribution(rows) => rows.len(),
        }
    }

    /// Whether the view has no rows yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Immutable snapshot of a view's aggregated state.
#[derive(Debug, Clone)]
pub struct ViewData {
    /// When the view started aggregating.
    pub start_time: SystemTime,
    /// Timestamp of the snapshot's most recent contribution (or the start
    /// time for an empty view).
    pub end_time: SystemTime,
    /// The aggregated rows.
    pub rows: ViewRows,
}
