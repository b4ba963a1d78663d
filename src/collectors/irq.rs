//! Hard and soft IRQ time attributed to the interrupted container.

use std::sync::Arc;

use super::{CollectionUnit, CollectorContext};
use crate::error::CollectorError;
use crate::snapshot::decode::{CounterRecord, HistogramRecord};

pub const HARDIRQS: &str = "hardirqs";
pub const SOFTIRQS: &str = "softirqs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IrqKind {
    Hard,
    Soft,
}

pub struct IrqCollector {
    ctx: Arc<CollectorContext>,
    kind: IrqKind,
}

impl IrqCollector {
    pub fn hard(ctx: Arc<CollectorContext>) -> Self {
        Self {
            ctx,
            kind: IrqKind::Hard,
        }
    }

    pub fn soft(ctx: Arc<CollectorContext>) -> Self {
        Self {
            ctx,
            kind: IrqKind::Soft,
        }
    }
}

impl CollectionUnit for IrqCollector {
    fn name(&self) -> &str {
        match self.kind {
            IrqKind::Hard => HARDIRQS,
            IrqKind::Soft => SOFTIRQS,
        }
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;
        match self.kind {
            IrqKind::Hard => {
                self.ctx
                    .for_each_cgroup_entry(HARDIRQS, "irq_latency", |id, h: HistogramRecord| {
                        if let Some(avg) = h.average_seconds() {
                            m.irq_latency_seconds
                                .with_label_values(&self.ctx.labels(id))
                                .observe(avg);
                        }
                    })?;
                self.ctx
                    .for_each_cgroup_entry(HARDIRQS, "irq_count", |id, c: CounterRecord| {
                        m.irq_total
                            .with_label_values(&self.ctx.labels(id))
                            .inc_by(c.count);
                    })?;
            }
            IrqKind::Soft => {
                self.ctx.for_each_cgroup_entry(
                    SOFTIRQS,
                    "softirq_latency",
                    |id, h: HistogramRecord| {
                        if let Some(avg) = h.average_seconds() {
                            m.softirq_latency_seconds
                                .with_label_values(&self.ctx.labels(id))
                                .observe(avg);
                        }
                    },
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::snapshot::decode::{encode_cgroup_key, Record};

    #[test]
    fn test_soft_unit_only_touches_softirq_tables() {
        let f = fixture();
        f.identities.register(1, identity("web"));
        let hard = f.tables.add(HARDIRQS, "irq_count", 8, 8);
        f.tables.add(HARDIRQS, "irq_latency", 8, HistogramRecord::SIZE);
        let soft = f.tables.add(SOFTIRQS, "softirq_latency", 8, HistogramRecord::SIZE);
        hard.insert(&encode_cgroup_key(1), &CounterRecord { count: 5 }.encode());
        let h = HistogramRecord {
            count: 1,
            sum_ns: 1_000,
            ..Default::default()
        };
        soft.insert(&encode_cgroup_key(1), &h.encode());

        IrqCollector::soft(Arc::clone(&f.ctx)).collect().unwrap();
        assert_eq!(hard.len(), 1);
        assert!(soft.is_empty());

        IrqCollector::hard(Arc::clone(&f.ctx)).collect().unwrap();
        assert_eq!(f.ctx.metrics.irq_total.with_label_values(&labels("web")).get(), 5);
    }
}
