//! kpod-metrics library
//!
//! Per-pod kernel metrics for Kubernetes nodes. Kernel probes account events
//! per cgroup id in kernel-resident tables; this crate loads the probes,
//! drains their tables on a fixed cadence, joins cgroup ids against pod and
//! container identity and exports the values as Prometheus series.
//!
//! # Layout
//!
//! - [`ebpf`]: handle registry and probe program lifecycle
//! - [`snapshot`]: read-and-clear table draining and record decoding
//! - [`identity`]: cgroup id to container identity, with a deletion grace cache
//! - [`discovery`]: running pods, their cgroup directories and identity sync
//! - [`collectors`]: one collection unit per probe program
//! - [`orchestrator`]: single-flight collection cycles with a deadline
//! - [`diagnostics`] and [`server`]: health and the HTTP surface
//!
//! # Usage
//!
//! ```rust
//! use kpod_metrics::identity::{CgroupIdentityResolver, ContainerIdentity};
//!
//! let resolver = CgroupIdentityResolver::new();
//! resolver.register(42, ContainerIdentity {
//!     pod_uid: "uid".into(),
//!     container_id: "c0ffee".into(),
//!     namespace: "default".into(),
//!     pod_name: "web-0".into(),
//!     container_name: "app".into(),
//! });
//! resolver.on_deleted(42);
//!
//! // Still resolvable until the grace period elapses.
//! assert!(resolver.resolve(42).is_some());
//! ```
//!
//! # Feature Flags
//!
//! - `ebpf` (default): load probes through libbpf. Without it the agent runs
//!   with no programs loaded.

pub mod cardinality;
pub mod cli;
pub mod collectors;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod ebpf;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod orchestrator;
pub mod server;
pub mod snapshot;
pub mod startup_checks;

// Re-export main types for convenience
pub use identity::{CgroupIdentityResolver, ContainerIdentity};
pub use orchestrator::{CycleOutcome, Orchestrator};
