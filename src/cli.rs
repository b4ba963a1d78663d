//! CLI arguments and subcommands for kpod-metrics.

use clap::{Parser, Subcommand, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum ConfigFormat {
    #[default]
    Yaml,
    Json,
    Toml,
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "kpod-metrics",
    about = "Per-pod kernel metrics agent for Kubernetes nodes",
    long_about = "Per-pod kernel metrics agent for Kubernetes nodes.\n\n\
                  Attaches eBPF probes, drains their per-cgroup tables every poll interval \
                  and exports the values as Prometheus metrics labelled by namespace, pod \
                  and container.",
    version,
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// HTTP listen port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bind to specific interface/IP
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Log level
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Collection profile: minimal, standard, comprehensive or custom
    #[arg(long)]
    pub profile: Option<String>,

    /// Node name used as the `node` label (defaults to $NODE_NAME)
    #[arg(long)]
    pub node_name: Option<String>,

    /// Directory holding the compiled probe objects
    #[arg(long)]
    pub program_dir: Option<PathBuf>,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,

    /// Output format for --show-config
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check kernel and privilege requirements, then exit
    CheckRequirements {
        /// Also fail when eBPF collection is disabled in the config
        #[arg(long)]
        strict: bool,
    },
}

impl LogLevel {
    pub fn as_tracing(self) -> Option<tracing::Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(tracing::Level::ERROR),
            LogLevel::Warn => Some(tracing::Level::WARN),
            LogLevel::Info => Some(tracing::Level::INFO),
            LogLevel::Debug => Some(tracing::Level::DEBUG),
            LogLevel::Trace => Some(tracing::Level::TRACE),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(s, true).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "kpod-metrics",
            "--port",
            "9200",
            "--profile",
            "minimal",
            "--node-name",
            "worker-1",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.port, Some(9200));
        assert_eq!(args.profile.as_deref(), Some("minimal"));
        assert_eq!(args.node_name.as_deref(), Some("worker-1"));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        assert!(args.command.is_none());
    }

    #[test]
    fn test_check_requirements_subcommand() {
        let args = Args::try_parse_from(["kpod-metrics", "check-requirements"]).unwrap();
        assert!(matches!(
            args.command,
            Some(Commands::CheckRequirements { strict: false })
        ));
    }

    #[test]
    fn test_log_level_names() {
        assert!(matches!(LogLevel::parse("WARN"), Some(LogLevel::Warn)));
        assert!(LogLevel::parse("loud").is_none());
        assert_eq!(LogLevel::Off.as_tracing(), None);
    }
}
