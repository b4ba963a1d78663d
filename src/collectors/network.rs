//! TCP traffic, retransmits and round-trip time per container.

use std::sync::Arc;

use super::{CollectionUnit, CollectorContext};
use crate::error::CollectorError;
use crate::snapshot::decode::{HistogramRecord, TcpStatsRecord};

pub const PROGRAM: &str = "net";

pub struct NetworkCollector {
    ctx: Arc<CollectorContext>,
}

impl NetworkCollector {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }
}

impl CollectionUnit for NetworkCollector {
    fn name(&self) -> &str {
        "network"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let m = &self.ctx.metrics;

        self.ctx
            .for_each_cgroup_entry(PROGRAM, "tcp_stats_map", |id, s: TcpStatsRecord| {
                let labels = self.ctx.labels(id);
                m.net_tcp_bytes_sent_total
                    .with_label_values(&labels)
                    .inc_by(s.bytes_sent);
                m.net_tcp_bytes_received_total
                    .with_label_values(&labels)
                    .inc_by(s.bytes_received);
                m.net_tcp_retransmits_total
                    .with_label_values(&labels)
                    .inc_by(s.retransmits);
                m.net_tcp_connections_total
                    .with_label_values(&labels)
                    .inc_by(s.connections);
                if let Some(rtt) = s.average_rtt_seconds() {
                    m.net_tcp_rtt_seconds.with_label_values(&labels).observe(rtt);
                }
            })?;

        // The RTT histogram is drained so it cannot fill up; only its sample
        // count is exported, the average comes from tcp_stats.
        self.ctx
            .for_each_cgroup_entry(PROGRAM, "rtt_hist", |id, h: HistogramRecord| {
                m.net_tcp_rtt_samples_total
                    .with_label_values(&self.ctx.labels(id))
                    .inc_by(h.count);
            })?;
        Ok(())
    }
}
