//! Double-buffered delta pipeline between recorders and the view store.
//!
//! Recorders stage measurements in the active delta under a single
//! short-held lock; a dedicated harvester thread periodically swaps the
//! active delta out and drains it into the view store. The swap itself is
//! an O(1) state exchange, and draining runs with the record lock
//! released, so recorders never block on view work.

pub mod accum;
pub mod buffer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::bucket::BucketBoundaries;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::ViewStore;
use crate::tag::TagSet;

use self::buffer::Delta;

/// Active delta and the authoritative configuration, guarded together:
/// anything that changes the configuration must flush before releasing
/// the lock, so no record can observe a delta whose measure count or
/// boundaries disagree with the live configuration.
#[derive(Default)]
struct ActiveState {
    num_measures: usize,
    registered_boundaries: Vec<Vec<BucketBoundaries>>,
    active: Delta,
}

/// The drain-side delta shell, recycled across harvests.
#[derive(Default)]
struct HarvestState {
    last: Delta,
}

/// Owns the active delta, the harvest thread, and the swap-and-drain
/// protocol.
///
/// Lock order is strict: `delta` before `harvester`. The store's own
/// lock is only ever taken with `delta` released.
pub struct DeltaPipeline {
    harvest_interval: Duration,
    store: Arc<ViewStore>,
    clock: Arc<dyn Clock>,

    delta: Mutex<ActiveState>,
    harvester: Mutex<HarvestState>,

    stop_requested: Mutex<bool>,
    wake: Condvar,
    stopped: AtomicBool,
    harvester_thread: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaPipeline {
    /// Starts a pipeline and its harvester thread.
    pub fn new(
        harvest_interval: Duration,
        store: Arc<ViewStore>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self {
            harvest_interval,
            store,
            clock,
            delta: Mutex::new(ActiveState::default()),
            harvester: Mutex::new(HarvestState::default()),
            stop_requested: Mutex::new(false),
            wake: Condvar::new(),
            stopped: AtomicBool::new(false),
            harvester_thread: Mutex::new(None),
        });

        let worker = Arc::clone(&pipeline);
        let handle = std::thread::Builder::new()
            .name("aggview-harvester".to_string())
            .spawn(move || worker.run_harvester())
            .expect("spawning harvester thread");
        *pipeline.harvester_thread.lock() = Some(handle);

        info!(interval = ?harvest_interval, "delta pipeline started");
        pipeline
    }

    /// Appends a slot for a newly registered measure and flushes inline,
    /// so the fresh delta adopts the widened configuration.
    pub fn add_measure(&self) {
        let mut delta = self.delta.lock();
        let mut harvester = self.harvester.lock();
        delta.num_measures += 1;
        delta.registered_boundaries.push(Vec::new());
        self.flush_locked(delta, &mut harvester);
    }

    /// Registers `boundaries` for the measure at `index` unless an equal
    /// set is already present; registration flushes inline for the same
    /// reason as [`add_measure`].
    ///
    /// [`add_measure`]: DeltaPipeline::add_measure
    pub fn add_boundaries(&self, index: usize, boundaries: &BucketBoundaries) {
        let mut delta = self.delta.lock();
        if delta.registered_boundaries[index]
            .iter()
            .any(|b| b == boundaries)
        {
            return;
        }
        let mut harvester = self.harvester.lock();
        delta.registered_boundaries[index].push(boundaries.clone());
        self.flush_locked(delta, &mut harvester);
    }

    /// Stages resolved measurements into the active delta. This is the
    /// hot path: one lock, a map upsert, and the scalar updates.
    ///
    /// Fails only when the allocator cannot grow the staging tables; the
    /// delta is left consistent and the caller may retry.
    pub fn record(&self, measurements: &[(usize, f64)], tags: TagSet) -> Result<()> {
        let mut delta = self.delta.lock();
        delta.active.record(measurements, tags)
    }

    /// Swaps the active delta out and drains it. On return, every record
    /// issued before the call has been delivered to the view store.
    pub fn flush(&self) {
        let delta = self.delta.lock();
        let mut harvester = self.harvester.lock();
        self.flush_locked(delta, &mut harvester);
    }

    /// Stops the harvester, joins it, and performs one final drain.
    /// Idempotent; records issued afterwards sit in the active delta
    /// until an explicit [`flush`].
    ///
    /// [`flush`]: DeltaPipeline::flush
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut stop = self.stop_requested.lock();
            *stop = true;
            self.wake.notify_all();
        }
        if let Some(handle) = self.harvester_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("harvester thread panicked");
            }
        }
        self.flush();
        info!("delta pipeline stopped");
    }

    /// Requires both locks, in order. Exchanges the active delta with the
    /// recycled shell, releases the record lock so recorders proceed
    /// against the fresh delta, then drains the captured window.
    fn flush_locked(&self, mut delta: MutexGuard<'_, ActiveState>, harvester: &mut HarvestState) {
        let state = &mut *delta;
        state.active.swap_and_reset(
            state.num_measures,
            &state.registered_boundaries,
            &mut harvester.last,
        );
        drop(delta);

        if !harvester.last.is_empty() {
            debug!(tag_sets = harvester.last.len(), "draining delta");
        }
        harvester.last.consume(&self.store, self.clock.now());
    }

    /// Harvester loop: sleep one interval, drain, repeat. The stop flag
    /// is examined after every wake-up and before re-locking.
    fn run_harvester(&self) {
        loop {
            {
                let mut stop = self.stop_requested.lock();
                if !*stop {
                    self.wake.wait_for(&mut stop, self.harvest_interval);
                }
                if *stop {
                    return;
                }
            }
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::clock::ManualClock;
    use crate::view::{Aggregation, ViewDescriptor};

    fn harness(interval: Duration) -> (Arc<DeltaPipeline>, Arc<ViewStore>) {
        let store = Arc::new(ViewStore::new());
        let clock = Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH));
        let pipeline = DeltaPipeline::new(interval, Arc::clone(&store), clock);
        (pipeline, store)
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        TagSet::from_pairs(pairs.iter().map(|(k, v)| (*k, (*v).to_string())))
    }

    #[test]
    fn test_flush_delivers_records_to_store() {
        let (pipeline, store) = harness(Duration::from_secs(3600));
        store.add_measure(0);
        pipeline.add_measure();
        let handle = store.add_consumer(
            0,
            ViewDescriptor::new()
                .set_measure("m")
                .set_aggregation(Aggregation::Sum),
            SystemTime::UNIX_EPOCH,
        );

        pipeline.record(&[(0, 2.0)], tags(&[])).expect("record");
        pipeline.record(&[(0, 3.0)], tags(&[])).expect("record");

        // Nothing reaches the store before the flush.
        assert!(store.get_data(handle).expect("data").rows.is_empty());

        pipeline.flush();
        let rows = store.get_data(handle).expect("data");
        let sums = rows.rows.sums().expect("sum rows");
        assert_eq!(sums.get(&Vec::new()), Some(&5.0));

        pipeline.stop();
    }

    #[test]
    fn test_records_during_drain_go_to_next_window() {
        let (pipeline, store) = harness(Duration::from_secs(3600));
        store.add_measure(0);
        pipeline.add_measure();
        let handle = store.add_consumer(
            0,
            ViewDescriptor::new()
                .set_measure("m")
                .set_aggregation(Aggregation::Count),
            SystemTime::UNIX_EPOCH,
        );

        pipeline.record(&[(0, 1.0)], tags(&[])).expect("record");
        pipeline.flush();
        pipeline.record(&[(0, 1.0)], tags(&[])).expect("record");
        pipeline.flush();

        let data = store.get_data(handle).expect("data");
        assert_eq!(data.rows.counts().expect("rows").get(&Vec::new()), Some(&2));

        pipeline.stop();
    }

    #[test]
    fn test_add_boundaries_is_idempotent() {
        let (pipeline, _store) = harness(Duration::from_secs(3600));
        pipeline.add_measure();

        let boundaries = BucketBoundaries::explicit(vec![0.0, 1.0]);
        pipeline.add_boundaries(0, &boundaries);
        pipeline.add_boundaries(0, &BucketBoundaries::explicit(vec![1.0, 0.0]));

        let delta = pipeline.delta.lock();
        assert_eq!(delta.registered_boundaries[0].len(), 1);
        drop(delta);

        pipeline.stop();
    }

    #[test]
    fn test_config_change_reopens_active_delta() {
        let (pipeline, _store) = harness(Duration::from_secs(3600));
        pipeline.add_measure();
        pipeline.record(&[(0, 1.0)], tags(&[])).expect("record");
        pipeline.add_measure();

        // The inline flush drained the staged record and reopened the
        // active delta with the new configuration.
        let delta = pipeline.delta.lock();
        assert_eq!(delta.num_measures, 2);
        assert!(delta.active.is_empty());
        drop(delta);

        pipeline.stop();
    }

    #[test]
    fn test_harvester_drains_without_explicit_flush() {
        let (pipeline, store) = harness(Duration::from_millis(50));
        store.add_measure(0);
        pipeline.add_measure();
        let handle = store.add_consumer(
            0,
            ViewDescriptor::new()
                .set_measure("m")
                .set_aggregation(Aggregation::Count),
            SystemTime::UNIX_EPOCH,
        );

        pipeline
            .record(&[(0, 1.0)], tags(&[("status", "200")]))
            .expect("record");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let data = store.get_data(handle).expect("data");
            if !data.rows.is_empty() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "harvester did not drain within the deadline"
            );
            std::thread::sleep(Duration::from_millis(10));
        }

        pipeline.stop();
    }

    #[test]
    fn test_stop_performs_final_drain() {
        let (pipeline, store) = harness(Duration::from_secs(3600));
        store.add_measure(0);
        pipeline.add_measure();
        let handle = store.add_consumer(
            0,
            ViewDescriptor::new()
                .set_measure("m")
                .set_aggregation(Aggregation::Count),
            SystemTime::UNIX_EPOCH,
        );

        pipeline.record(&[(0, 1.0)], tags(&[])).expect("record");
        pipeline.stop();

        let data = store.get_data(handle).expect("data");
        assert_eq!(data.rows.counts().expect("rows").get(&Vec::new()), Some(&1));

        // Stopping twice is harmless.
        pipeline.stop();
    }

    #[test]
    fn test_concurrent_recorders_preserve_every_event() {
        let (pipeline, store) = harness(Duration::from_millis(20));
        store.add_measure(0);
        pipeline.add_measure();
        let handle = store.add_consumer(
            0,
            ViewDescriptor::new()
                .set_measure("m")
                .set_aggregation(Aggregation::Count),
            SystemTime::UNIX_EPOCH,
        );

        let threads: u64 = 4;
        let per_thread: u64 = 2_000;
        let mut handles = Vec::new();
        for t in 0..threads {
            let pipeline = Arc::clone(&pipeline);
            handles.push(std::thread::spawn(move || {
                let worker = t.to_string();
                for _ in 0..per_thread {
                    pipeline
                        .record(&[(0, 1.0)], tags(&[("worker", worker.as_str())]))
                        .expect("record");
                }
            }));
        }
        for h in handles {
            h.join().expect("recorder thread panicked");
        }

        pipeline.flush();
        let data = store.get_data(handle).expect("data");
        let total: u64 = data.rows.counts().expect("rows").values().sum();
        assert_eq!(total, threads * per_thread);

        pipeline.stop();
    }
}
