//! Engine facade: catalog, delta pipeline, and view store behind one
//! handle.
//!
//! [`Engine::new`] builds an isolated instance (used throughout the test
//! suite); [`global`] memoizes one process-wide engine with default
//! configuration.

use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::delta::DeltaPipeline;
use crate::error::{Error, Result};
use crate::measure::{
    Measurement, MeasureDescriptor, MeasureId, MeasureKind, MeasureRegistry, MeasureValue,
};
use crate::store::{ViewHandle, ViewStore};
use crate::tag::TagSet;
use crate::view::{Aggregation, ViewData, ViewDescriptor};

/// A metrics aggregation engine instance.
pub struct Engine {
    registry: MeasureRegistry,
    store: Arc<ViewStore>,
    pipeline: Option<Arc<DeltaPipeline>>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Builds an engine with the system clock.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds an engine with an injected time source.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;

        let store = Arc::new(ViewStore::new());
        let pipeline = config.enable_delta_path.then(|| {
            DeltaPipeline::new(
                config.harvest_interval,
                Arc::clone(&store),
                Arc::clone(&clock),
            )
        });

        Ok(Arc::new(Self {
            registry: MeasureRegistry::new(),
            store,
            pipeline,
            clock,
        }))
    }

    /// Registers a measure and returns its id.
    pub fn register_measure(&self, descriptor: MeasureDescriptor) -> Result<MeasureId> {
        let id = self.registry.register(descriptor)?;
        self.store.add_measure(id.index());
        if let Some(pipeline) = &self.pipeline {
            pipeline.add_measure();
        }
        Ok(id)
    }

    /// Registers a view over a previously registered measure. Equal
    /// descriptors (aggregation, window, columns) share one aggregate.
    pub fn register_view(&self, descriptor: ViewDescriptor) -> Result<ViewHandle> {
        let id = self
            .registry
            .id_for(descriptor.measure_name())
            .ok_or_else(|| Error::UnknownMeasure(descriptor.measure_name().to_string()))?;

        if let (Some(pipeline), Aggregation::Distribution(boundaries)) =
            (&self.pipeline, descriptor.aggregation())
        {
            pipeline.add_boundaries(id.index(), boundaries);
        }

        Ok(self
            .store
            .add_consumer(id.index(), descriptor, self.clock.now()))
    }

    /// Drops a view registration; the underlying aggregate is destroyed
    /// when its last consumer unregisters.
    pub fn unregister_view(&self, handle: ViewHandle) -> Result<()> {
        self.store.remove_consumer(handle)
    }

    /// Records measurements under string tags.
    ///
    /// Fails only on allocator exhaustion while staging into the delta;
    /// nothing is recorded in that case and the caller may retry.
    pub fn record(&self, measurements: &[Measurement], tags: &[(&str, &str)]) -> Result<()> {
        self.record_tagged(
            measurements,
            TagSet::from_pairs(tags.iter().map(|(k, v)| (*k, (*v).to_string()))),
        )
    }

    /// Records measurements under a pre-built tag set.
    ///
    /// Measurements naming an unknown measure, or carrying a payload that
    /// disagrees with the measure's declared kind, are skipped; the rest
    /// of the call proceeds. An allocation failure while staging into the
    /// delta is returned to the caller with no partial state left behind.
    pub fn record_tagged(&self, measurements: &[Measurement], tags: TagSet) -> Result<()> {
        let mut resolved = Vec::with_capacity(measurements.len());
        for measurement in measurements {
            let Some(kind) = self.registry.kind(measurement.id()) else {
                warn!(index = measurement.id().index(), "record for unknown measure dropped");
                continue;
            };
            // The declared kind routes the payload; a mismatched field is
            // a caller bug and the measurement is dropped.
            let value = match (kind, measurement.value()) {
                (MeasureKind::Real, MeasureValue::Real(v)) => v,
                (MeasureKind::Integral, MeasureValue::Integral(v)) => v as f64,
                (declared, _) => {
                    warn!(
                        index = measurement.id().index(),
                        ?declared,
                        "measurement payload disagrees with declared kind, dropped"
                    );
                    continue;
                }
            };
            resolved.push((measurement.id().index(), value));
        }
        if resolved.is_empty() {
            return Ok(());
        }

        match &self.pipeline {
            Some(pipeline) => pipeline.record(&resolved, tags),
            None => {
                self.store.record_now(&resolved, tags.pairs(), self.clock.now());
                Ok(())
            }
        }
    }

    /// Blocks until every record issued before the call has been
    /// delivered to the view store. A no-op on the synchronous path.
    pub fn flush(&self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.flush();
        }
    }

    /// Snapshot of a view's aggregated rows.
    pub fn get_view_data(&self, handle: ViewHandle) -> Result<ViewData> {
        self.store.get_data(handle)
    }

    /// Stops the harvester after one final drain. Idempotent.
    pub fn shutdown(&self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.stop();
        }
    }

    /// The measure catalog.
    pub fn registry(&self) -> &MeasureRegistry {
        &self.registry
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The process-wide engine, built on first use with default
/// configuration. Its harvester runs for the process lifetime.
pub fn global() -> &'static Arc<Engine> {
    static GLOBAL: OnceLock<Arc<Engine>> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        Engine::new(EngineConfig::default()).expect("default engine configuration is valid")
    })
}
