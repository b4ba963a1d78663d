//! kpod-metrics - version 0.1.0
//!
//! Node agent entry point: loads kernel probes, runs collection cycles on a
//! fixed cadence and serves the resulting metrics over HTTP.

use anyhow::Context;
use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::{net::TcpListener, signal, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use kpod_metrics::cardinality::estimate_cardinality;
use kpod_metrics::cli::{Args, Commands, LogLevel};
use kpod_metrics::collectors::{build_units, syscall, CollectorContext};
use kpod_metrics::config::{
    resolve_config, show_config, validate_effective_config, Config, DEFAULT_BIND_ADDR, DEFAULT_PORT,
};
use kpod_metrics::diagnostics::DiagnosticsSource;
use kpod_metrics::discovery::{
    CgroupfsPathResolver, FilePodProvider, IdentitySync, NamespaceFilter, PodCgroupMapper,
    PodProvider, StaticPodProvider,
};
use kpod_metrics::ebpf::{DefaultBackend, ProgramManager};
use kpod_metrics::identity::CgroupIdentityResolver;
use kpod_metrics::metrics::{AgentMetrics, CollectionMetrics, ProgramMetrics};
use kpod_metrics::orchestrator::Orchestrator;
use kpod_metrics::server::{router, AppState};
use kpod_metrics::snapshot::TableSource;
use kpod_metrics::startup_checks::{self, check_btf};

/// Initializes tracing with the CLI level, falling back to the config file.
fn setup_logging(config: &Config, args: &Args) {
    let level = args
        .log_level
        .or_else(|| config.log_level.as_deref().and_then(LogLevel::parse))
        .unwrap_or(LogLevel::Info);

    let Some(max_level) = level.as_tracing() else {
        return;
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", level);
}

fn pod_provider(config: &Config) -> Arc<dyn PodProvider> {
    let filter = NamespaceFilter::new(&config.filter.namespaces, &config.filter.exclude_namespaces);
    match &config.discovery.pod_list_path {
        Some(path) => {
            info!("Discovering pods from {}", path.display());
            Arc::new(FilePodProvider::new(path.clone(), filter))
        }
        None => {
            warn!("⚠️  No pod list configured - no container will be resolved");
            warn!("   Set discovery.pod_list_path to a kubelet /pods document");
            Arc::new(StaticPodProvider::new(Vec::new()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
    }
}

/// Main application entry point.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        show_config(&config, args.config_format)?;
        return Ok(());
    }

    let config = resolve_config(&args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }

    setup_logging(&config, &args);

    if let Some(Commands::CheckRequirements { strict }) = &args.command {
        println!("🔍 Checking Runtime Requirements");
        println!("================================\n");

        if *strict && !config.bpf.enabled {
            eprintln!("\n❌ eBPF collection is disabled in the configuration");
            std::process::exit(1);
        }
        match startup_checks::validate_requirements(config.bpf.enabled, &config.cgroup.root) {
            Ok(_) => {
                println!("\n✅ All requirements met - ready for production!");
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("\n❌ Requirements check failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let node_name = config.node_name().to_string();
    info!("Starting kpod-metrics on node {}", node_name);

    let btf_present = match startup_checks::validate_requirements(config.bpf.enabled, &config.cgroup.root) {
        Ok(found) => found.btf_present,
        Err(e) => {
            error!("❌ Startup validation failed: {}", e);
            error!("   The agent will start but may not collect anything!");
            check_btf(Path::new(kpod_metrics::ebpf::BTF_PATH))
        }
    };

    // Initialize Prometheus metrics registry
    let registry = Registry::new();
    let agent_metrics = Arc::new(AgentMetrics::new(&registry)?);
    let collection_metrics = CollectionMetrics::new(&registry)?;
    let program_metrics = ProgramMetrics::new(&registry)?;
    debug!("All metrics registered successfully");

    let programs = Arc::new(
        ProgramManager::new(DefaultBackend, config.bpf.program_dir.clone(), btf_present)
            .with_metrics(program_metrics),
    );
    let summary = programs.load_all(&config.enabled_programs());
    info!(
        "Probe programs: {} loaded, {} failed",
        summary.loaded.len(),
        summary.failed.len()
    );

    let tables: Arc<dyn TableSource> = programs.clone();
    if tables.is_loaded(syscall::PROGRAM) {
        if let Err(e) = syscall::populate_tracked_syscalls(tables.as_ref(), &config.syscall.tracked_syscalls) {
            warn!("⚠️  Failed to populate tracked syscalls: {}", e);
        }
    }

    let identities = Arc::new(CgroupIdentityResolver::new());
    let ctx = Arc::new(CollectorContext {
        tables: Arc::clone(&tables),
        identities: Arc::clone(&identities),
        metrics: Arc::clone(&agent_metrics),
        node_name: node_name.clone(),
    });
    let units = build_units(&config, ctx);

    let provider = pod_provider(&config);
    match provider.discovered_pods() {
        Ok(pods) => estimate_cardinality(&config, &pods).log(),
        Err(e) => debug!("Skipping cardinality estimate: {}", e),
    }
    let mapper = Arc::new(PodCgroupMapper::new(
        provider,
        Arc::new(CgroupfsPathResolver::new(config.cgroup.root.clone())),
        node_name.clone(),
    ));
    let sync = Arc::new(IdentitySync::new(Arc::clone(&identities)));

    let orchestrator = Arc::new(
        Orchestrator::new(units, Arc::clone(&tables), identities, config.collection_timeout())
            .with_targets(mapper, sync)
            .with_metrics(collection_metrics)
            .with_agent_metrics(agent_metrics, node_name.clone()),
    );
    info!(
        "Enabled collectors: {}",
        orchestrator.enabled_units().join(", ")
    );

    // Collection timer; overlapping triggers are skipped by the orchestrator.
    let poll_interval = config.poll_interval();
    let initial_delay = config.initial_delay();
    let timer = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if orchestrator.is_shutting_down() {
                    break;
                }
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    orchestrator.trigger().await;
                });
            }
        })
    };

    let state = Arc::new(AppState {
        registry,
        diagnostics: DiagnosticsSource::new(
            Arc::clone(&orchestrator),
            programs.clone(),
            node_name,
            poll_interval,
            initial_delay,
        ),
    });

    let bind_ip_str = config.bind.as_deref().unwrap_or(DEFAULT_BIND_ADDR);
    let port = config.port.unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = format!("{}:{}", bind_ip_str, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", bind_ip_str, port))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("kpod-metrics listening on http://{}:{}", bind_ip_str, port);

    let server = axum::serve(listener, router(state));

    let mut server_error = None;
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {}", e);
                server_error = Some(e);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining collection...");
        }
    }

    timer.abort();
    if !orchestrator.close().await {
        warn!("⚠️  Unloading probes while collection is still running");
    }
    let destroyed = programs.destroy_all();
    info!("Destroyed {} probe programs", destroyed);

    if let Some(e) = server_error {
        return Err(e.into());
    }
    info!("kpod-metrics stopped gracefully");
    Ok(())
}

