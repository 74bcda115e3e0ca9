use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::SystemTime;

use crate::bucket::BucketBoundaries;
use crate::error::Result;
use crate::store::ViewStore;
use crate::tag::TagSet;

use super::accum::MeasureAccumulator;

/// Write-side staging table for one harvest window.
///
/// Maps each distinct tag set to one accumulator per registered measure.
/// The measure count and boundary lists are copies taken when the delta
/// was opened, so a captured delta can be drained without holding the
/// pipeline's configuration lock.
///
/// Not internally synchronized; the pipeline serializes access.
#[derive(Debug, Default)]
pub struct Delta {
    num_measures: usize,
    registered_boundaries: Vec<Vec<BucketBoundaries>>,
    table: HashMap<TagSet, Vec<MeasureAccumulator>>,
}

impl Delta {
    /// Records resolved `(measure index, value)` pairs under `tags`.
    ///
    /// The full accumulator row is materialized zeroed on the first
    /// record for a tag set. Every allocation the call needs is staged
    /// before any statistic moves, so an exhausted allocator surfaces as
    /// an error with the delta left consistent and the caller may retry.
    ///
    /// Indices outside the captured configuration are dropped; the
    /// engine validates ids before resolving, so a miss here means the
    /// record raced a measure registration.
    pub fn record(&mut self, measurements: &[(usize, f64)], tags: TagSet) -> Result<()> {
        self.table.try_reserve(1)?;

        let num_measures = self.num_measures;
        let boundaries = &self.registered_boundaries;
        let row = match self.table.entry(tags) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut row = Vec::new();
                row.try_reserve_exact(num_measures)?;
                row.resize_with(num_measures, MeasureAccumulator::default);
                entry.insert(row)
            }
        };

        // Stage the bucket vectors for every touched accumulator first;
        // a zeroed row with unallocated histograms is still an empty row
        // to the drain, so failing here leaves no partial data.
        for &(index, _) in measurements {
            debug_assert!(index < num_measures, "measure index out of range");
            if let (Some(accum), Some(bounds)) = (row.get_mut(index), boundaries.get(index)) {
                accum.ensure_histograms(bounds)?;
            }
        }

        for &(index, value) in measurements {
            let (Some(accum), Some(bounds)) = (row.get_mut(index), boundaries.get(index)) else {
                continue;
            };
            accum.record(value, bounds)?;
        }
        Ok(())
    }

    /// Empties the table and forgets the captured configuration.
    pub fn clear(&mut self) {
        self.table.clear();
        self.registered_boundaries.clear();
        self.num_measures = 0;
    }

    /// Exchanges contents with `other` and reopens `self` with the given
    /// configuration. `other` is left holding the previously active data,
    /// ready to be consumed; its old (already drained) table is recycled
    /// as the fresh shell.
    pub fn swap_and_reset(
        &mut self,
        num_measures: usize,
        registered_boundaries: &[Vec<BucketBoundaries>],
        other: &mut Delta,
    ) {
        std::mem::swap(&mut self.table, &mut other.table);
        std::mem::swap(&mut self.registered_boundaries, &mut other.registered_boundaries);
        other.num_measures = self.num_measures;

        self.table.clear();
        self.num_measures = num_measures;
        self.registered_boundaries.clear();
        self.registered_boundaries
            .extend_from_slice(registered_boundaries);
    }

    /// Drains every non-empty accumulator into the view store, stamping
    /// all of them with a single timestamp taken by the caller.
    pub fn consume(&self, store: &ViewStore, now: SystemTime) {
        for (tags, row) in &self.table {
            for (index, accum) in row.iter().enumerate().take(self.num_measures) {
                if accum.count() == 0 {
                    continue;
                }
                store.merge_recorded(
                    index,
                    accum,
                    &self.registered_boundaries[index],
                    tags,
                    now,
                );
            }
        }
    }

    /// Number of distinct tag sets staged in this delta.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether nothing has been recorded since the delta was opened.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
