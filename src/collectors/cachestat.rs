use std::sync::Arc;

use super::{CollectionUnit, CollectorContext};
use crate::error::CollectorError;
use crate::snapshot::decode::CacheStatsRecord;

pub const PROGRAM: &str = "cachestat";

/// Page cache activity per container.
pub struct CacheStatCollector {
    ctx: Arc<CollectorContext>,
}

impl CacheStatCollector {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }
}

impl CollectionUnit for CacheStatCollector {
    fn name(&self) -> &str {
        "cachestat"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;
        self.ctx
            .for_each_cgroup_entry(PROGRAM, "cache_stats", |id, s: CacheStatsRecord| {
                let labels = self.ctx.labels(id);
                m.cache_accesses_total.with_label_values(&labels).inc_by(s.accesses);
                m.cache_additions_total.with_label_values(&labels).inc_by(s.additions);
                m.cache_dirtied_total.with_label_values(&labels).inc_by(s.dirtied);
                m.cache_buf_dirtied_total
                    .with_label_values(&labels)
                    .inc_by(s.buf_dirtied);
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::snapshot::decode::{encode_cgroup_key, Record};

    #[test]
    fn test_cachestat_fields() {
        let f = fixture();
        f.identities.register(5, identity("etl"));
        let table = f.tables.add(PROGRAM, "cache_stats", 8, CacheStatsRecord::SIZE);
        let stats = CacheStatsRecord {
            accesses: 100,
            additions: 20,
            dirtied: 7,
            buf_dirtied: 1,
        };
        table.insert(&encode_cgroup_key(5), &stats.encode());

        CacheStatCollector::new(Arc::clone(&f.ctx)).collect().unwrap();

        let m = &f.ctx.metrics;
        assert_eq!(m.cache_accesses_total.with_label_values(&labels("etl")).get(), 100);
        assert_eq!(m.cache_dirtied_total.with_label_values(&labels("etl")).get(), 7);
    }
}
