//! Collection units.
//!
//! Each unit drains the tables of one probe program, joins the cgroup ids
//! against the identity resolver and emits Prometheus series. Units share no
//! mutable state besides the resolver and the (internally synchronised)
//! metric families, so one failing unit cannot corrupt another.

pub mod biolatency;
pub mod cachestat;
pub mod cpu;
pub mod execsnoop;
pub mod irq;
pub mod map_stats;
pub mod memory;
pub mod network;
pub mod syscall;
pub mod tcpdrop;

use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::config::Config;
use crate::error::CollectorError;
use crate::identity::{CgroupIdentityResolver, ContainerIdentity};
use crate::metrics::AgentMetrics;
use crate::snapshot::decode::{decode_cgroup_id, Record};
use crate::snapshot::{drain, Entry, TableSource};

/// Tables keyed by the bare 8-byte cgroup id, as (program, table).
pub const CGROUP_KEYED_TABLES: &[(&str, &str)] = &[
    ("cpu_sched", "runq_latency"),
    ("cpu_sched", "ctx_switches"),
    ("net", "tcp_stats_map"),
    ("net", "rtt_hist"),
    ("mem", "oom_kills"),
    ("mem", "major_faults"),
    ("biolatency", "bio_latency"),
    ("biolatency", "bio_count"),
    ("cachestat", "cache_stats"),
    ("tcpdrop", "tcp_drops"),
    ("hardirqs", "irq_latency"),
    ("hardirqs", "irq_count"),
    ("softirqs", "softirq_latency"),
    ("execsnoop", "exec_stats"),
];

/// Tables keyed by (cgroup id, sub-key) with the cgroup id in the first 8 bytes.
pub const COMPOSITE_KEYED_TABLES: &[(&str, &str)] = &[("syscall", "syscall_stats_map")];

/// One independently schedulable unit of collection work.
pub trait CollectionUnit: Send + Sync {
    fn name(&self) -> &str;

    fn collect(&self) -> Result<(), CollectorError>;
}

/// Dependencies shared by every unit.
pub struct CollectorContext {
    pub tables: Arc<dyn TableSource>,
    pub identities: Arc<CgroupIdentityResolver>,
    pub metrics: Arc<AgentMetrics>,
    pub node_name: String,
}

impl CollectorContext {
    /// Drains one table, or `None` when its program is not loaded.
    pub fn drain_table(&self, program: &str, table: &str) -> Result<Option<Vec<Entry>>, CollectorError> {
        if !self.tables.is_loaded(program) {
            trace!("Skipping {}/{}: program not loaded", program, table);
            return Ok(None);
        }
        let handle = self.tables.table(program, table)?;
        Ok(Some(drain(handle.as_ref())?))
    }

    /// Drains a cgroup-keyed table and calls `emit` for every entry whose
    /// cgroup id resolves. Returns the number of emitted entries.
    pub fn for_each_cgroup_entry<R, F>(
        &self,
        program: &str,
        table: &str,
        mut emit: F,
    ) -> Result<usize, CollectorError>
    where
        R: Record,
        F: FnMut(&ContainerIdentity, R),
    {
        let Some(entries) = self.drain_table(program, table)? else {
            return Ok(0);
        };

        let mut emitted = 0;
        for (key, value) in entries {
            let cgroup_id = decode_cgroup_id(&key)?;
            let Some(identity) = self.identities.resolve(cgroup_id) else {
                // Host processes and containers of unwatched namespaces.
                continue;
            };
            emit(&identity, R::decode(&value)?);
            emitted += 1;
        }
        Ok(emitted)
    }

    pub fn labels<'a>(&'a self, identity: &'a ContainerIdentity) -> [&'a str; 4] {
        crate::metrics::pod_labels(identity, &self.node_name)
    }
}

/// A unit plus its scheduling attributes.
#[derive(Clone)]
pub struct CollectorDescriptor {
    pub name: String,
    pub enabled: bool,
    /// `None` runs the unit every cycle.
    pub interval: Option<Duration>,
    pub unit: Arc<dyn CollectionUnit>,
}

impl CollectorDescriptor {
    pub fn new(unit: Arc<dyn CollectionUnit>) -> Self {
        Self {
            name: unit.name().to_string(),
            enabled: true,
            interval: None,
            unit,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval(mut self, interval: Option<Duration>) -> Self {
        self.interval = interval;
        self
    }
}

/// Builds the unit registry once at startup. A unit is enabled when its
/// program is configured and no override disables it.
pub fn build_units(config: &Config, ctx: Arc<CollectorContext>) -> Vec<CollectorDescriptor> {
    let programs = config.enabled_programs();
    let units: Vec<(Arc<dyn CollectionUnit>, bool)> = vec![
        (
            Arc::new(cpu::CpuCollector::new(Arc::clone(&ctx), &config.cpu)),
            programs.contains(&cpu::PROGRAM),
        ),
        (
            Arc::new(network::NetworkCollector::new(Arc::clone(&ctx))),
            programs.contains(&network::PROGRAM),
        ),
        (
            Arc::new(memory::MemoryCollector::new(Arc::clone(&ctx), &config.memory)),
            programs.contains(&memory::PROGRAM),
        ),
        (
            Arc::new(syscall::SyscallCollector::new(Arc::clone(&ctx))),
            programs.contains(&syscall::PROGRAM),
        ),
        (
            Arc::new(biolatency::BioLatencyCollector::new(Arc::clone(&ctx))),
            programs.contains(&biolatency::PROGRAM),
        ),
        (
            Arc::new(cachestat::CacheStatCollector::new(Arc::clone(&ctx))),
            programs.contains(&cachestat::PROGRAM),
        ),
        (
            Arc::new(tcpdrop::TcpDropCollector::new(Arc::clone(&ctx))),
            programs.contains(&tcpdrop::PROGRAM),
        ),
        (
            Arc::new(irq::IrqCollector::hard(Arc::clone(&ctx))),
            programs.contains(&irq::HARDIRQS),
        ),
        (
            Arc::new(irq::IrqCollector::soft(Arc::clone(&ctx))),
            programs.contains(&irq::SOFTIRQS),
        ),
        (
            Arc::new(execsnoop::ExecSnoopCollector::new(Arc::clone(&ctx))),
            programs.contains(&execsnoop::PROGRAM),
        ),
        (
            Arc::new(map_stats::MapStatsCollector::new(Arc::clone(&ctx))),
            !programs.is_empty(),
        ),
    ];

    units
        .into_iter()
        .map(|(unit, program_enabled)| {
            let name = unit.name().to_string();
            CollectorDescriptor::new(unit)
                .with_enabled(program_enabled && config.collector_enabled(&name))
                .with_interval(config.collector_interval(&name))
        })
        .collect()
}
