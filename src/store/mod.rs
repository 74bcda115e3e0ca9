//! Per-measure view fan-out and aggregate storage.
//!
//! The store receives either single values (synchronous path) or drained
//! per-window accumulators (delta path) and folds them into every view
//! registered on the measure. One lock guards the whole store; record
//! dispatch takes it in write mode because view row maps are not
//! independently locked.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::bucket::{BucketBoundaries, Bucketing};
use crate::delta::accum::MeasureAccumulator;
use crate::error::{Error, Result};
use crate::tag::{TagKey, TagSet};
use crate::view::{Aggregation, Distribution, ViewData, ViewDescriptor, ViewRows};

/// Non-owning reference to a registered view.
///
/// Scoped to the measure it was registered on; it is invalidated when the
/// last consumer of the view unregisters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewHandle {
    measure_index: usize,
    view_id: u64,
}

/// Row storage for one view, by aggregation kind.
#[derive(Debug)]
enum RowStore {
    Count(HashMap<Vec<String>, u64>),
    Sum(HashMap<Vec<String>, f64>),
    Distribution {
        bucketing: BucketBoundaries,
        rows: HashMap<Vec<String>, Distribution>,
    },
}

impl RowStore {
    fn new(aggregation: &Aggregation) -> Self {
        match aggregation {
            Aggregation::Count => RowStore::Count(HashMap::new()),
            Aggregation::Sum => RowStore::Sum(HashMap::new()),
            Aggregation::Distribution(bucketing) => RowStore::Distribution {
                bucketing: bucketing.clone(),
                rows: HashMap::new(),
            },
        }
    }

    fn snapshot(&self) -> ViewRows {
        match self {
            RowStore::Count(rows) => ViewRows::Count(rows.clone()),
            RowStore::Sum(rows) => ViewRows::Sum(rows.clone()),
            RowStore::Distribution { rows, .. } => ViewRows::Distribution(rows.clone()),
        }
    }
}

/// One registered view: descriptor, pre-sorted column projection, row
/// data, and the number of consumers sharing it.
#[derive(Debug)]
struct ViewState {
    id: u64,
    descriptor: ViewDescriptor,
    /// Columns sorted by key name, each carrying its index in the
    /// descriptor's declared order.
    column_indexes: Vec<(TagKey, usize)>,
    consumers: usize,
    start_time: SystemTime,
    last_update: SystemTime,
    rows: RowStore,
}

impl ViewState {
    fn new(id: u64, descriptor: ViewDescriptor, now: SystemTime) -> Self {
        let mut column_indexes: Vec<(TagKey, usize)> = descriptor
            .columns()
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), i))
            .collect();
        column_indexes.sort_by(|a, b| a.0.cmp(&b.0));

        let rows = RowStore::new(descriptor.aggregation());
        Self {
            id,
            descriptor,
            column_indexes,
            consumers: 1,
            start_time: now,
            last_update: now,
            rows,
        }
    }

    /// Projects sorted record tags onto the view's column set: matched
    /// columns copy the tag value at the column's declared position,
    /// unmatched columns stay empty.
    fn row_key(&self, tags: &[(TagKey, String)]) -> Vec<String> {
        let mut values = vec![String::new(); self.column_indexes.len()];
        let mut column = 0;
        let mut tag = 0;
        while column < self.column_indexes.len() && tag < tags.len() {
            match self.column_indexes[column].0.cmp(&tags[tag].0) {
                // A recorded tag has no matching column.
                Ordering::Greater => tag += 1,
                // A view column has no corresponding tag.
                Ordering::Less => column += 1,
                Ordering::Equal => {
                    values[self.column_indexes[column].1] = tags[tag].1.clone();
                    column += 1;
                    tag += 1;
                }
            }
        }
        values
    }

    /// Folds in one observation (synchronous path).
    fn record_value(&mut self, value: f64, tags: &[(TagKey, String)], now: SystemTime) {
        let key = self.row_key(tags);
        self.last_update = now;
        match &mut self.rows {
            RowStore::Count(rows) => *rows.entry(key).or_insert(0) += 1,
            RowStore::Sum(rows) => *rows.entry(key).or_insert(0.0) += value,
            RowStore::Distribution { bucketing, rows } => {
                let num_buckets = bucketing.num_buckets();
                rows.entry(key)
                    .or_insert_with(|| Distribution::new(num_buckets))
                    .add(value, bucketing);
            }
        }
    }

    /// Folds in a drained accumulator (delta path). Distribution rows
    /// adopt the bucket vector recorded under this view's own layout;
    /// when the layout was not yet registered in the drained window only
    /// the scalar statistics merge.
    fn merge_accumulated(
        &mut self,
        accum: &MeasureAccumulator,
        delta_boundaries: &[BucketBoundaries],
        tags: &[(TagKey, String)],
        now: SystemTime,
    ) {
        let key = self.row_key(tags);
        self.last_update = now;
        match &mut self.rows {
            RowStore::Count(rows) => *rows.entry(key).or_insert(0) += accum.count(),
            RowStore::Sum(rows) => *rows.entry(key).or_insert(0.0) += accum.sum(),
            RowStore::Distribution { bucketing, rows } => {
                let buckets = accum.histogram_for(delta_boundaries, bucketing);
                let num_buckets = bucketing.num_buckets();
                rows.entry(key)
                    .or_insert_with(|| Distribution::new(num_buckets))
                    .merge(
                        accum.count(),
                        accum.mean(),
                        accum.sum_of_squared_deviation(),
                        accum.min(),
                        accum.max(),
                        buckets,
                    );
            }
        }
    }

    fn snapshot(&self) -> ViewData {
        ViewData {
            start_time: self.start_time,
            end_time: self.last_update,
            rows: self.rows.snapshot(),
        }
    }
}

/// All views registered on one measure, in registration order.
#[derive(Debug, Default)]
struct MeasureViews {
    views: Vec<ViewState>,
}

#[derive(Default)]
struct StoreState {
    measures: Vec<MeasureViews>,
    next_view_id: u64,
}

/// The view aggregation store.
#[derive(Default)]
pub struct ViewStore {
    state: RwLock<StoreState>,
}

impl ViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fan-out slot for a newly registered measure. The slot's
    /// position must equal the catalog's assigned index.
    pub fn add_measure(&self, expected_index: usize) {
        let mut state = self.state.write();
        if state.measures.len() != expected_index {
            error!(
                expected_index,
                actual = state.measures.len(),
                "measure slot out of step with catalog"
            );
            panic!("measure slot out of step with catalog");
        }
        state.measures.push(MeasureViews::default());
    }

    /// Registers a consumer for `descriptor` on the given measure. A view
    /// whose aggregation, window, and columns all match an existing one
    /// shares that view's state.
    pub fn add_consumer(
        &self,
        measure_index: usize,
        descriptor: ViewDescriptor,
        now: SystemTime,
    ) -> ViewHandle {
        let mut state = self.state.write();
        let measure = &mut state.measures[measure_index];
        if let Some(view) = measure
            .views
            .iter_mut()
            .find(|v| v.descriptor.same_aggregate(&descriptor))
        {
            view.consumers += 1;
            return ViewHandle {
                measure_index,
                view_id: view.id,
            };
        }

        let id = state.next_view_id;
        state.next_view_id += 1;
        info!(view = descriptor.name(), measure_index, "view registered");
        state.measures[measure_index]
            .views
            .push(ViewState::new(id, descriptor, now));
        ViewHandle {
            measure_index,
            view_id: id,
        }
    }

    /// Drops one consumer; the view and its rows are destroyed when the
    /// last consumer goes away.
    pub fn remove_consumer(&self, handle: ViewHandle) -> Result<()> {
        let mut state = self.state.write();
        let Some(measure) = state.measures.get_mut(handle.measure_index) else {
            error!(
                measure_index = handle.measure_index,
                "view handle names a measure slot that does not exist"
            );
            panic!("view handle names a measure slot that does not exist");
        };
        let Some(position) = measure.views.iter().position(|v| v.id == handle.view_id) else {
            return Err(Error::StaleViewHandle);
        };

        let view = &mut measure.views[position];
        view.consumers -= 1;
        if view.consumers == 0 {
            info!(view = view.descriptor.name(), "view unregistered");
            measure.views.remove(position);
        }
        Ok(())
    }

    /// Snapshot of the view's aggregated rows.
    pub fn get_data(&self, handle: ViewHandle) -> Result<ViewData> {
        let state = self.state.read();
        let view = state
            .measures
            .get(handle.measure_index)
            .and_then(|m| m.views.iter().find(|v| v.id == handle.view_id))
            .ok_or(Error::StaleViewHandle)?;
        Ok(view.snapshot())
    }

    /// Synchronous record path: dispatches each resolved value straight
    /// into the measure's views with a per-call timestamp.
    pub fn record_now(
        &self,
        measurements: &[(usize, f64)],
        tags: &[(TagKey, String)],
        now: SystemTime,
    ) {
        let mut state = self.state.write();
        for &(index, value) in measurements {
            debug_assert!(index < state.measures.len(), "measure index out of range");
            let Some(measure) = state.measures.get_mut(index) else {
                continue;
            };
            for view in &mut measure.views {
                view.record_value(value, tags, now);
            }
        }
    }

    /// Delta drain path: folds a whole window's accumulator for one
    /// `(measure, tag set)` pair into the measure's views.
    pub fn merge_recorded(
        &self,
        measure_index: usize,
        accum: &MeasureAccumulator,
        delta_boundaries: &[BucketBoundaries],
        tags: &TagSet,
        now: SystemTime,
    ) {
        let mut state = self.state.write();
        debug_assert!(
            measure_index < state.measures.len(),
            "measure index out of range"
        );
        let Some(measure) = state.measures.get_mut(measure_index) else {
            return;
        };
        for view in &mut measure.views {
            view.merge_accumulated(accum, delta_boundaries, tags.pairs(), now);
        }
    }
}
