//! aggview - incremental metrics view aggregation.
//!
//! Ingests per-call measurements tagged with string dimensions and
//! maintains, for every registered view, an incrementally updated
//! aggregate: counts, sums, or bucketed distributions with streaming
//! mean/variance/min/max.
//!
//! Records stage into a double-buffered delta under one short-held lock;
//! a background harvester periodically swaps the active delta out and
//! drains it into the registered views. `flush()` forces an immediate
//! drain for callers that need read-your-writes snapshots.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod measure;
pub mod store;
pub mod tag;
pub mod view;

pub use bucket::{BucketBoundaries, Bucketing};
pub use config::EngineConfig;
pub use engine::{global, Engine};
pub use error::{Error, Result};
pub use measure::{Measurement, MeasureDescriptor, MeasureId, MeasureKind};
pub use store::ViewHandle;
pub use tag::{TagKey, TagSet};
pub use view::{Aggregation, Distribution, ViewData, ViewDescriptor, ViewRows, Window};
