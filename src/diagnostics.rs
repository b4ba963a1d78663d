//! Read-only agent diagnostics and health derivation.
//!
//! Collection health is derived from the last successful cycle: the agent is
//! healthy while a cycle completed within [`HEALTHY_CYCLE_FACTOR`] poll
//! intervals. Before the first cycle it is healthy for the initial delay plus
//! the same allowance. Failed probe programs degrade health without making
//! the agent unhealthy.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ebpf::{FailedProgram, LoadedProgram, ProgramInventory};
use crate::orchestrator::Orchestrator;

/// Number of poll intervals a cycle may be overdue before health fails.
pub const HEALTHY_CYCLE_FACTOR: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub collection: HealthStatus,
    pub probes: HealthStatus,
    pub last_success: Option<String>,
    pub failed_programs: Vec<String>,
    pub shutting_down: bool,
}

impl HealthReport {
    /// Degraded agents still serve metrics, so only unhealthy maps to 503.
    pub fn is_serving(&self) -> bool {
        self.status != HealthStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentityStats {
    pub live: usize,
    pub grace: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub git_sha: Option<&'static str>,
    pub build_timestamp: Option<&'static str>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_sha: option_env!("VERGEN_GIT_SHA"),
            build_timestamp: option_env!("VERGEN_BUILD_TIMESTAMP"),
        }
    }
}

/// Point-in-time snapshot served on `/diagnostics`.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub build: BuildInfo,
    pub node_name: String,
    pub started_at: String,
    pub uptime_seconds: u64,
    pub last_success: Option<String>,
    pub shutting_down: bool,
    pub collecting: bool,
    pub loaded_programs: Vec<LoadedProgram>,
    pub failed_programs: Vec<FailedProgram>,
    pub enabled_collectors: Vec<String>,
    pub enabled_collector_count: usize,
    pub identities: IdentityStats,
    pub health: HealthReport,
}

/// Whether collection is keeping up with its poll interval.
pub fn collection_healthy(
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    uptime: Duration,
    poll_interval: Duration,
    initial_delay: Duration,
) -> bool {
    let allowance = poll_interval * HEALTHY_CYCLE_FACTOR;
    match last_success {
        Some(at) => now
            .signed_duration_since(at)
            .to_std()
            // A timestamp in the future means the clock stepped back.
            .map_or(true, |age| age <= allowance),
        None => uptime <= initial_delay + allowance,
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Assembles diagnostics from the live agent components.
pub struct DiagnosticsSource {
    orchestrator: Arc<Orchestrator>,
    programs: Arc<dyn ProgramInventory>,
    node_name: String,
    poll_interval: Duration,
    initial_delay: Duration,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl DiagnosticsSource {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        programs: Arc<dyn ProgramInventory>,
        node_name: impl Into<String>,
        poll_interval: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            orchestrator,
            programs,
            node_name: node_name.into(),
            poll_interval,
            initial_delay,
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn health(&self) -> HealthReport {
        self.health_at(Utc::now(), self.started.elapsed())
    }

    pub fn health_at(&self, now: DateTime<Utc>, uptime: Duration) -> HealthReport {
        let last_success = self.orchestrator.last_success();
        let collection = if collection_healthy(
            last_success,
            now,
            uptime,
            self.poll_interval,
            self.initial_delay,
        ) {
            HealthStatus::Ok
        } else {
            HealthStatus::Unhealthy
        };

        let failed_programs: Vec<String> = self
            .programs
            .failed_programs()
            .into_iter()
            .map(|p| p.name)
            .collect();
        let probes = if failed_programs.is_empty() {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        let status = match (collection, probes) {
            (HealthStatus::Unhealthy, _) => HealthStatus::Unhealthy,
            (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Ok,
        };

        HealthReport {
            status,
            collection,
            probes,
            last_success: last_success.map(rfc3339),
            failed_programs,
            shutting_down: self.orchestrator.is_shutting_down(),
        }
    }

    pub fn snapshot(&self) -> Diagnostics {
        let enabled_collectors: Vec<String> = self
            .orchestrator
            .enabled_units()
            .into_iter()
            .map(str::to_string)
            .collect();
        let identities = self.orchestrator.identities();

        Diagnostics {
            build: BuildInfo::current(),
            node_name: self.node_name.clone(),
            started_at: rfc3339(self.started_at),
            uptime_seconds: self.started.elapsed().as_secs(),
            last_success: self.orchestrator.last_success().map(rfc3339),
            shutting_down: self.orchestrator.is_shutting_down(),
            collecting: self.orchestrator.is_collecting(),
            loaded_programs: self.programs.loaded_programs(),
            failed_programs: self.programs.failed_programs(),
            enabled_collector_count: enabled_collectors.len(),
            enabled_collectors,
            identities: IdentityStats {
                live: identities.live_len(),
                grace: identities.grace_len(),
            },
            health: self.health(),
        }
    }
}
