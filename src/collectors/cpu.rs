//! Run-queue latency and context switches per container.

use std::sync::Arc;
use tracing::trace;

use super::{CollectionUnit, CollectorContext};
use crate::config::CpuConfig;
use crate::error::CollectorError;
use crate::snapshot::decode::{CounterRecord, HistogramRecord};

pub const PROGRAM: &str = "cpu_sched";

pub struct CpuCollector {
    ctx: Arc<CollectorContext>,
    scheduling: bool,
    throttling: bool,
}

impl CpuCollector {
    /// `scheduling` gates run-queue latency, `throttling` context switches.
    pub fn new(ctx: Arc<CollectorContext>, config: &CpuConfig) -> Self {
        Self {
            ctx,
            scheduling: config.scheduling,
            throttling: config.throttling,
        }
    }
}

impl CollectionUnit for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;

        let mut latency = 0;
        if self.scheduling {
            latency = self.ctx.for_each_cgroup_entry(
                PROGRAM,
                "runq_latency",
                |id, hist: HistogramRecord| {
                    if let Some(avg) = hist.average_seconds() {
                        m.cpu_runqueue_latency_seconds
                            .with_label_values(&self.ctx.labels(id))
                            .observe(avg);
                    }
                },
            )?;
        }

        let mut switches = 0;
        if self.throttling {
            switches = self.ctx.for_each_cgroup_entry(
                PROGRAM,
                "ctx_switches",
                |id, c: CounterRecord| {
                    m.cpu_context_switches_total
                        .with_label_values(&self.ctx.labels(id))
                        .inc_by(c.count);
                },
            )?;
        }

        trace!("cpu: {} latency, {} context switch entries", latency, switches);
        Ok(())
    }
}
