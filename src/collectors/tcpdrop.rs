use std::sync::Arc;

use super::{CollectionUnit, CollectorContext};
use crate::error::CollectorError;
use crate::snapshot::decode::CounterRecord;

pub const PROGRAM: &str = "tcpdrop";

/// Kernel TCP packet drops per container.
pub struct TcpDropCollector {
    ctx: Arc<CollectorContext>,
}

impl TcpDropCollector {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }
}

impl CollectionUnit for TcpDropCollector {
    fn name(&self) -> &str {
        "tcpdrop"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;
        self.ctx
            .for_each_cgroup_entry(PROGRAM, "tcp_drops", |id, c: CounterRecord| {
                m.net_tcp_drops_total
                    .with_label_values(&self.ctx.labels(id))
                    .inc_by(c.count);
            })?;
        Ok(())
    }
}
