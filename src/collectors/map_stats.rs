//! Kernel table occupancy and update-error gauges.
//!
//! Probes keep a per-CPU array `<table>_stats` next to each cgroup-keyed
//! table: index 0 counts live entries, index 1 counts failed updates.

use std::sync::Arc;
use tracing::trace;

use super::{CollectionUnit, CollectorContext, CGROUP_KEYED_TABLES, COMPOSITE_KEYED_TABLES};
use crate::error::{CollectorError, MapError};
use crate::snapshot::{sum_percpu_i64, MAX_ENTRIES};

const ENTRIES_SLOT: u32 = 0;
const ERRORS_SLOT: u32 = 1;

pub struct MapStatsCollector {
    ctx: Arc<CollectorContext>,
}

impl MapStatsCollector {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }

    fn read_slot(&self, program: &str, stats_table: &str, slot: u32) -> Result<Option<i64>, CollectorError> {
        let table = match self.ctx.tables.table(program, stats_table) {
            Ok(t) => t,
            // Older probe builds carry no stats companion.
            Err(MapError::UnknownTable { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(slices) = table.lookup_percpu(&slot.to_le_bytes())? else {
            return Ok(None);
        };
        Ok(Some(sum_percpu_i64(&slices)?))
    }
}

impl CollectionUnit for MapStatsCollector {
    fn name(&self) -> &str {
        "bpf_map_stats"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;
        for &(program, table) in CGROUP_KEYED_TABLES.iter().chain(COMPOSITE_KEYED_TABLES) {
            if !self.ctx.tables.is_loaded(program) {
                continue;
            }
            let stats_table = format!("{table}_stats");
            let Some(entries) = self.read_slot(program, &stats_table, ENTRIES_SLOT)? else {
                trace!("No stats companion for {}", table);
                continue;
            };
            m.bpf_map_entries.with_label_values(&[table]).set(entries);
            m.bpf_map_capacity
                .with_label_values(&[table])
                .set(MAX_ENTRIES as i64);
            if let Some(errors) = self.read_slot(program, &stats_table, ERRORS_SLOT)? {
                m.bpf_map_update_errors.with_label_values(&[table]).set(errors);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[test]
    fn test_percpu_slots_are_summed() {
        let f = fixture();
        f.tables.add("mem", "oom_kills", 8, 8);
        let stats = f.tables.add("mem", "oom_kills_stats", 4, 8);
        stats.insert_percpu(
            &0u32.to_le_bytes(),
            vec![3i64.to_le_bytes().to_vec(), 4i64.to_le_bytes().to_vec()],
        );
        stats.insert_percpu(
            &1u32.to_le_bytes(),
            vec![0i64.to_le_bytes().to_vec(), 2i64.to_le_bytes().to_vec()],
        );

        MapStatsCollector::new(Arc::clone(&f.ctx)).collect().unwrap();

        let m = &f.ctx.metrics;
        assert_eq!(m.bpf_map_entries.with_label_values(&["oom_kills"]).get(), 7);
        assert_eq!(m.bpf_map_update_errors.with_label_values(&["oom_kills"]).get(), 2);
        assert_eq!(
            m.bpf_map_capacity.with_label_values(&["oom_kills"]).get(),
            MAX_ENTRIES as i64
        );
    }
}
