use tracing::error;

use crate::bucket::{BucketBoundaries, Bucketing};
use crate::error::Result;

/// Streaming statistics for one measure within one delta window.
///
/// Tracks count, running mean, sum of squared deviations (Welford form),
/// extremes, and one bucket-count vector per boundary set registered for
/// the owning measure. The boundary list passed to [`record`] must stay
/// identical across the accumulator's lifetime; the pipeline's swap
/// protocol guarantees this by flushing on every configuration change.
///
/// [`record`]: MeasureAccumulator::record
#[derive(Debug, Clone)]
pub struct MeasureAccumulator {
    count: u64,
    mean: f64,
    sum_of_squared_deviation: f64,
    min: f64,
    max: f64,
    histograms: Vec<Vec<i64>>,
}

impl Default for MeasureAccumulator {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            sum_of_squared_deviation: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            histograms: Vec::new(),
        }
    }
}

impl MeasureAccumulator {
    /// Allocates the per-boundary bucket vectors if they do not exist
    /// yet. On allocation failure nothing is mutated, so a caller can
    /// stage every allocation a record needs before moving statistics.
    pub fn ensure_histograms(&mut self, boundaries: &[BucketBoundaries]) -> Result<()> {
        if boundaries.is_empty() || !self.histograms.is_empty() {
            return Ok(());
        }
        let mut histograms = Vec::new();
        histograms.try_reserve_exact(boundaries.len())?;
        for bucketing in boundaries {
            let num_buckets = bucketing.num_buckets() as usize;
            let mut histogram = Vec::new();
            histogram.try_reserve_exact(num_buckets)?;
            histogram.resize(num_buckets, 0i64);
            histograms.push(histogram);
        }
        self.histograms = histograms;
        Ok(())
    }

    /// Records `value`, updating the scalar statistics by the method of
    /// provisional means and incrementing one bucket per boundary set.
    ///
    /// Fails only when the first observation cannot allocate its bucket
    /// vectors; the accumulator is unchanged in that case.
    pub fn record(&mut self, value: f64, boundaries: &[BucketBoundaries]) -> Result<()> {
        self.ensure_histograms(boundaries)?;

        // A saturated counter means the surrounding system has broken
        // its monotonicity contract; abort rather than wrap.
        if self.count == u64::MAX {
            error!("observation count overflow");
            std::process::abort();
        }
        self.count += 1;
        let new_mean = self.mean + (value - self.mean) / self.count as f64;
        self.sum_of_squared_deviation += (value - self.mean) * (value - new_mean);
        self.mean = new_mean;

        self.min = self.min.min(value);
        self.max = self.max.max(value);

        for (histogram, bucketing) in self.histograms.iter_mut().zip(boundaries) {
            histogram[bucketing.bucket_for(value) as usize] += 1;
        }
        Ok(())
    }

    /// Number of recorded observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Running mean; meaningful only when `count() > 0`.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sum of the observations, derived as `count * mean` to avoid
    /// cancellation in a separately maintained sum.
    pub fn sum(&self) -> f64 {
        self.count as f64 * self.mean
    }

    /// Sum of squared deviations from the mean.
    pub fn sum_of_squared_deviation(&self) -> f64 {
        self.sum_of_squared_deviation
    }

    /// Smallest recorded value.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest recorded value.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Bucket counts aligned with the boundary list passed to `record`.
    pub fn histograms(&self) -> &[Vec<i64>] {
        &self.histograms
    }

    /// Returns the bucket-count vector recorded under `wanted`, given the
    /// boundary list this accumulator was recorded against. `None` when
    /// `wanted` was not registered at the time the delta was opened.
    pub fn histogram_for<'a>(
        &'a self,
        boundaries: &[BucketBoundaries],
        wanted: &BucketBoundaries,
    ) -> Option<&'a [i64]> {
        let index = boundaries.iter().position(|b| b == wanted)?;
        self.histograms.get(index).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_stats(values: &[f64]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let ssd = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
        (mean, ssd)
    }

    #[test]
    fn test_welford_matches_batch_statistics() {
        let values = [3.0, 1.5, -2.25, 10.0, 4.75, 0.5, 100.125, -7.0];
        let mut accum = MeasureAccumulator::default();
        for v in values {
            accum.record(v, &[]).expect("record");
        }

        let (mean, ssd) = batch_stats(&values);
        assert_eq!(accum.count(), values.len() as u64);
        assert!((accum.mean() - mean).abs() < 1e-9 * mean.abs());
        assert!((accum.sum_of_squared_deviation() - ssd).abs() < 1e-9 * ssd);
        assert_eq!(accum.min(), -7.0);
        assert_eq!(accum.max(), 100.125);
        assert!((accum.sum() - values.iter().sum::<f64>()).abs() < 1e-9);
    }

    #[test]
    fn test_first_observation_overrides_extremes() {
        let mut accum = MeasureAccumulator::default();
        accum.record(-3.0, &[]).expect("record");
        assert_eq!(accum.min(), -3.0);
        assert_eq!(accum.max(), -3.0);
    }

    #[test]
    fn test_histograms_allocated_on_first_record() {
        let boundaries = vec![
            BucketBoundaries::explicit(vec![0.0, 10.0]),
            BucketBoundaries::explicit(vec![5.0]),
        ];
        let mut accum = MeasureAccumulator::default();
        assert!(accum.histograms().is_empty());

        accum.record(7.0, &boundaries).expect("record");
        assert_eq!(accum.histograms().len(), 2);
        assert_eq!(accum.histograms()[0], vec![0, 1, 0]);
        assert_eq!(accum.histograms()[1], vec![0, 1]);
    }

    #[test]
    fn test_ensure_histograms_is_idempotent() {
        let boundaries = vec![BucketBoundaries::explicit(vec![0.0, 1.0])];
        let mut accum = MeasureAccumulator::default();
        accum.ensure_histograms(&boundaries).expect("first");
        accum.record(0.5, &boundaries).expect("record");
        accum.ensure_histograms(&boundaries).expect("second");
        assert_eq!(accum.histograms()[0], vec![0, 1, 0]);
    }

    #[test]
    fn test_histogram_conservation() {
        let boundaries = vec![
            BucketBoundaries::explicit(vec![0.0, 1.0, 2.0]),
            BucketBoundaries::exponential(3, 10.0, 0.1),
        ];
        let mut accum = MeasureAccumulator::default();
        let n = 57;
        for i in 0..n {
            accum
                .record(f64::from(i) * 0.17 - 1.0, &boundaries)
                .expect("record");
        }

        for histogram in accum.histograms() {
            assert_eq!(histogram.iter().sum::<i64>(), i64::from(n));
        }
    }

    #[test]
    fn test_histogram_for_matches_by_boundary_equality() {
        let b0 = BucketBoundaries::explicit(vec![0.0, 1.0]);
        let b1 = BucketBoundaries::explicit(vec![0.0, 0.5, 1.0]);
        let boundaries = vec![b0.clone(), b1.clone()];

        let mut accum = MeasureAccumulator::default();
        accum.record(0.75, &boundaries).expect("record");

        assert_eq!(
            accum.histogram_for(&boundaries, &b0),
            Some(vec![0, 1, 0].as_slice())
        );
        assert_eq!(
            accum.histogram_for(&boundaries, &b1),
            Some(vec![0, 0, 1, 0].as_slice())
        );

        let unregistered = BucketBoundaries::explicit(vec![100.0]);
        assert_eq!(accum.histogram_for(&boundaries, &unregistered), None);
    }

    #[test]
    fn test_no_boundaries_keeps_histograms_empty() {
        let mut accum = MeasureAccumulator::default();
        accum.record(1.0, &[]).expect("record");
        accum.record(2.0, &[]).expect("record");
        assert!(accum.histograms().is_empty());
        assert_eq!(accum.count(), 2);
    }
}
