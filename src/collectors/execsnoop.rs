use std::sync::Arc;

use super::{CollectionUnit, CollectorContext};
use crate::error::CollectorError;
use crate::snapshot::decode::ExecStatsRecord;

pub const PROGRAM: &str = "execsnoop";

/// exec, exit and fork counts per container.
pub struct ExecSnoopCollector {
    ctx: Arc<CollectorContext>,
}

impl ExecSnoopCollector {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }
}

impl CollectionUnit for ExecSnoopCollector {
    fn name(&self) -> &str {
        "execsnoop"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;
        self.ctx
            .for_each_cgroup_entry(PROGRAM, "exec_stats", |id, s: ExecStatsRecord| {
                let labels = self.ctx.labels(id);
                m.proc_execs_total.with_label_values(&labels).inc_by(s.execs);
                m.proc_exits_total.with_label_values(&labels).inc_by(s.exits);
                m.proc_forks_total.with_label_values(&labels).inc_by(s.forks);
            })?;
        Ok(())
    }
}
