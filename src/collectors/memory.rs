//! OOM kills and major page faults per container.

use std::sync::Arc;

use super::{CollectionUnit, CollectorContext};
use crate::config::MemoryConfig;
use crate::error::CollectorError;
use crate::snapshot::decode::CounterRecord;

pub const PROGRAM: &str = "mem";

pub struct MemoryCollector {
    ctx: Arc<CollectorContext>,
    oom: bool,
    page_faults: bool,
}

impl MemoryCollector {
    pub fn new(ctx: Arc<CollectorContext>, config: &MemoryConfig) -> Self {
        Self {
            ctx,
            oom: config.oom,
            page_faults: config.page_faults,
        }
    }
}

impl CollectionUnit for MemoryCollector {
    fn name(&self) -> &str {
        "memory"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;
        if self.oom {
            self.ctx
                .for_each_cgroup_entry(PROGRAM, "oom_kills", |id, c: CounterRecord| {
                    m.mem_oom_kills_total
                        .with_label_values(&self.ctx.labels(id))
                        .inc_by(c.count);
                })?;
        }
        if self.page_faults {
            self.ctx
                .for_each_cgroup_entry(PROGRAM, "major_faults", |id, c: CounterRecord| {
                    m.mem_major_page_faults_total
                        .with_label_values(&self.ctx.labels(id))
                        .inc_by(c.count);
                })?;
        }
        Ok(())
    }
}
