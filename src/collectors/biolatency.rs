use std::sync::Arc;

use super::{CollectionUnit, CollectorContext};
use crate::error::CollectorError;
use crate::snapshot::decode::{CounterRecord, HistogramRecord};

pub const PROGRAM: &str = "biolatency";

/// Block I/O completion latency per container.
pub struct BioLatencyCollector {
    ctx: Arc<CollectorContext>,
}

impl BioLatencyCollector {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }
}

impl CollectionUnit for BioLatencyCollector {
    fn name(&self) -> &str {
        "biolatency"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;
        self.ctx
            .for_each_cgroup_entry(PROGRAM, "bio_latency", |id, h: HistogramRecord| {
                if let Some(avg) = h.average_seconds() {
                    m.disk_io_latency_seconds
                        .with_label_values(&self.ctx.labels(id))
                        .observe(avg);
                }
            })?;
        self.ctx
            .for_each_cgroup_entry(PROGRAM, "bio_count", |id, c: CounterRecord| {
                m.disk_io_total
                    .with_label_values(&self.ctx.labels(id))
                    .inc_by(c.count);
            })?;
        Ok(())
    }
}
