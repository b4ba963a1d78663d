//! Configuration management for kpod-metrics.
//!
//! Configuration is loaded from YAML, JSON or TOML (by extension), merged with
//! CLI flags (CLI > file > default) and then expanded by the selected
//! collection profile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::cli::{Args, ConfigFormat};
use crate::collectors::syscall::{syscall_number, DEFAULT_TRACKED_SYSCALLS};

// Default configuration constants
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9101;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 10_000;
pub const DEFAULT_COLLECTION_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_PROGRAM_DIR: &str = "/app/bpf";
pub const DEFAULT_CGROUP_ROOT: &str = "/host/sys/fs/cgroup";

pub const PROFILES: &[&str] = &["minimal", "standard", "comprehensive", "custom"];

const DEFAULT_PATHS: &[&str] = &[
    "/etc/kpod-metrics/config.yaml",
    "/etc/kpod-metrics/config.yml",
    "/etc/kpod-metrics/config.json",
    "/etc/kpod-metrics/config.toml",
    "./kpod-metrics.yaml",
    "./kpod-metrics.yml",
    "./kpod-metrics.json",
    "./kpod-metrics.toml",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("cannot render TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("unknown profile '{0}', expected one of minimal, standard, comprehensive, custom")]
    UnknownProfile(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpfConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_program_dir", alias = "program-dir")]
    pub program_dir: PathBuf,
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program_dir: default_program_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    #[serde(default)]
    pub scheduling: bool,
    #[serde(default)]
    pub throttling: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub tcp: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub oom: bool,
    #[serde(default, alias = "page-faults")]
    pub page_faults: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "tracked-syscalls")]
    pub tracked_syscalls: Vec<String>,
}

/// Optional probes, all off unless configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedConfig {
    #[serde(default)]
    pub biolatency: bool,
    #[serde(default)]
    pub cachestat: bool,
    #[serde(default)]
    pub tcpdrop: bool,
    #[serde(default)]
    pub hardirqs: bool,
    #[serde(default)]
    pub softirqs: bool,
    #[serde(default)]
    pub execsnoop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Namespaces to include; empty means all.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default = "default_excluded_namespaces", alias = "exclude-namespaces")]
    pub exclude_namespaces: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            exclude_namespaces: default_excluded_namespaces(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CgroupConfig {
    #[serde(default = "default_cgroup_root")]
    pub root: PathBuf,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: default_cgroup_root(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Kubelet `/pods` JSON document refreshed by an external watcher.
    #[serde(alias = "pod-list-path")]
    pub pod_list_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_profile() -> String {
    "standard".to_string()
}
fn default_program_dir() -> PathBuf {
    PathBuf::from(DEFAULT_PROGRAM_DIR)
}
fn default_cgroup_root() -> PathBuf {
    PathBuf::from(DEFAULT_CGROUP_ROOT)
}
fn default_excluded_namespaces() -> Vec<String> {
    vec!["kube-system".to_string(), "kube-public".to_string()]
}

/// Agent configuration.
///
/// Plain values come before nested sections so the struct renders as TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(alias = "node-name")]
    pub node_name: Option<String>,

    // Server configuration
    pub port: Option<u16>,
    pub bind: Option<String>,
    #[serde(alias = "log-level")]
    pub log_level: Option<String>,

    // Collection cadence
    #[serde(alias = "poll-interval-ms")]
    pub poll_interval_ms: Option<u64>,
    #[serde(alias = "initial-delay-ms")]
    pub initial_delay_ms: Option<u64>,
    #[serde(alias = "collection-timeout-ms")]
    pub collection_timeout_ms: Option<u64>,

    #[serde(default)]
    pub bpf: BpfConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub syscall: SyscallConfig,
    #[serde(default)]
    pub extended: ExtendedConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub cgroup: CgroupConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Per-unit enable overrides, keyed by collector name.
    #[serde(default)]
    pub collectors: BTreeMap<String, bool>,
    /// Per-unit interval in milliseconds; units without one run every cycle.
    #[serde(default, alias = "collector-intervals")]
    pub collector_intervals: BTreeMap<String, u64>,
}

/// Core collection sections owned by a built-in profile.
struct ProfileSections {
    cpu: CpuConfig,
    network: NetworkConfig,
    memory: MemoryConfig,
    syscall: bool,
}

impl ProfileSections {
    fn standard() -> Self {
        Self {
            cpu: CpuConfig {
                scheduling: true,
                throttling: true,
            },
            network: NetworkConfig { tcp: true },
            memory: MemoryConfig {
                oom: true,
                page_faults: true,
            },
            syscall: false,
        }
    }

    fn builtin(profile: &str) -> Option<Self> {
        match profile {
            "minimal" => Some(Self {
                cpu: CpuConfig {
                    scheduling: true,
                    throttling: false,
                },
                network: NetworkConfig { tcp: false },
                memory: MemoryConfig {
                    oom: true,
                    page_faults: false,
                },
                syscall: false,
            }),
            "standard" => Some(Self::standard()),
            "comprehensive" => Some(Self {
                syscall: true,
                ..Self::standard()
            }),
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self {
            profile: default_profile(),
            node_name: None,
            port: Some(DEFAULT_PORT),
            bind: Some(DEFAULT_BIND_ADDR.to_string()),
            log_level: Some("info".into()),
            poll_interval_ms: Some(DEFAULT_POLL_INTERVAL_MS),
            initial_delay_ms: Some(DEFAULT_INITIAL_DELAY_MS),
            collection_timeout_ms: Some(DEFAULT_COLLECTION_TIMEOUT_MS),
            bpf: BpfConfig::default(),
            cpu: CpuConfig::default(),
            network: NetworkConfig::default(),
            memory: MemoryConfig::default(),
            syscall: SyscallConfig::default(),
            extended: ExtendedConfig::default(),
            filter: FilterConfig::default(),
            cgroup: CgroupConfig::default(),
            discovery: DiscoveryConfig::default(),
            collectors: BTreeMap::new(),
            collector_intervals: BTreeMap::new(),
        };
        config.set_sections(ProfileSections::standard());
        config
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms.unwrap_or(DEFAULT_INITIAL_DELAY_MS))
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(
            self.collection_timeout_ms
                .unwrap_or(DEFAULT_COLLECTION_TIMEOUT_MS),
        )
    }

    pub fn node_name(&self) -> &str {
        self.node_name.as_deref().unwrap_or("unknown")
    }

    /// Rewrites the core collection sections for the selected profile.
    /// `custom` keeps them verbatim.
    pub fn apply_profile(&mut self) -> Result<(), ConfigError> {
        if self.profile == "custom" {
            return Ok(());
        }
        let sections = ProfileSections::builtin(&self.profile)
            .ok_or_else(|| ConfigError::UnknownProfile(self.profile.clone()))?;
        self.set_sections(sections);
        Ok(())
    }

    fn set_sections(&mut self, sections: ProfileSections) {
        self.cpu = sections.cpu;
        self.network = sections.network;
        self.memory = sections.memory;
        self.syscall.enabled = sections.syscall;
        if sections.syscall && self.syscall.tracked_syscalls.is_empty() {
            self.syscall.tracked_syscalls = DEFAULT_TRACKED_SYSCALLS
                .iter()
                .map(|s| s.to_string())
                .collect();
        }
    }

    /// Probe programs to load, in load order.
    pub fn enabled_programs(&self) -> Vec<&'static str> {
        if !self.bpf.enabled {
            return Vec::new();
        }
        let ext = &self.extended;
        [
            ("cpu_sched", self.cpu.scheduling || self.cpu.throttling),
            ("net", self.network.tcp),
            ("mem", self.memory.oom || self.memory.page_faults),
            ("syscall", self.syscall.enabled),
            ("biolatency", ext.biolatency),
            ("cachestat", ext.cachestat),
            ("tcpdrop", ext.tcpdrop),
            ("hardirqs", ext.hardirqs),
            ("softirqs", ext.softirqs),
            ("execsnoop", ext.execsnoop),
        ]
        .into_iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| name)
        .collect()
    }

    /// Administrative override for a collector; defaults to enabled.
    pub fn collector_enabled(&self, name: &str) -> bool {
        self.collectors.get(name).copied().unwrap_or(true)
    }

    pub fn collector_interval(&self, name: &str) -> Option<Duration> {
        self.collector_intervals
            .get(name)
            .map(|ms| Duration::from_millis(*ms))
    }
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), ConfigError> {
    if !PROFILES.contains(&cfg.profile.as_str()) {
        return Err(ConfigError::UnknownProfile(cfg.profile.clone()));
    }
    if cfg.poll_interval_ms == Some(0) {
        return Err(ConfigError::Invalid("poll_interval_ms must be > 0".into()));
    }
    if cfg.collection_timeout_ms == Some(0) {
        return Err(ConfigError::Invalid(
            "collection_timeout_ms must be > 0".into(),
        ));
    }
    if let Some((name, _)) = cfg.collector_intervals.iter().find(|(_, ms)| **ms == 0) {
        return Err(ConfigError::Invalid(format!(
            "collector_intervals.{name} must be > 0"
        )));
    }
    if let Some(bind) = cfg.bind.as_deref() {
        bind.parse::<std::net::IpAddr>()
            .map_err(|_| ConfigError::Invalid(format!("bind '{bind}' is not an IP address")))?;
    }

    let unknown: Vec<&str> = cfg
        .syscall
        .tracked_syscalls
        .iter()
        .map(String::as_str)
        .filter(|s| syscall_number(s).is_none())
        .collect();
    if !unknown.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "unknown tracked syscalls: {}",
            unknown.join(", ")
        )));
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref())?
    };

    if let Some(bind_ip) = args.bind {
        config.bind = Some(bind_ip.to_string());
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }
    if let Some(level) = args.log_level {
        config.log_level = Some(format!("{level:?}").to_lowercase());
    }
    if let Some(profile) = &args.profile {
        config.profile = profile.clone();
    }
    if let Some(dir) = &args.program_dir {
        config.bpf.program_dir = dir.clone();
    }

    config.node_name = args
        .node_name
        .clone()
        .or(config.node_name)
        .or_else(|| std::env::var("NODE_NAME").ok().filter(|s| !s.is_empty()));

    config.apply_profile()?;
    Ok(config)
}

/// Parses configuration text in the format implied by `path`'s extension.
pub fn parse_config(path: &Path, content: &str) -> Result<Config, ConfigError> {
    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(content)?,
        Some("toml") => toml::from_str(content)?,
        // Default to YAML
        _ => serde_yaml::from_str(content)?,
    };
    Ok(config)
}

/// Loads `path`, or the first existing default location, or defaults.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match DEFAULT_PATHS.iter().map(Path::new).find(|p| p.exists()) {
            Some(p) => p.to_path_buf(),
            None => return Ok(Config::default()),
        },
    };

    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let config = parse_config(&path, &content)?;
    info!("Loaded configuration from: {}", path.display());
    Ok(config)
}

/// Renders configuration in the requested format.
pub fn render_config(config: &Config, format: ConfigFormat) -> Result<String, ConfigError> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    })
}

/// Shows configuration in requested format
pub fn show_config(config: &Config, format: ConfigFormat) -> Result<(), ConfigError> {
    println!("{}", render_config(config, format)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.profile, "standard");
        assert_eq!(config.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.collection_timeout(), Duration::from_secs(20));
        assert_eq!(config.port, Some(9101));
        assert!(config.network.tcp);
        assert!(config.cpu.throttling && config.memory.page_faults);
        assert!(!config.syscall.enabled);
        assert_eq!(config.enabled_programs(), vec!["cpu_sched", "net", "mem"]);
        validate_effective_config(&config).unwrap();
    }

    #[test]
    fn test_profiles() {
        let mut config = Config {
            profile: "minimal".into(),
            ..Config::default()
        };
        config.apply_profile().unwrap();
        assert_eq!(config.enabled_programs(), vec!["cpu_sched", "mem"]);

        config.profile = "comprehensive".into();
        config.apply_profile().unwrap();
        assert!(config.enabled_programs().contains(&"syscall"));
        assert!(config.syscall.tracked_syscalls.contains(&"read".to_string()));

        config.profile = "turbo".into();
        assert!(matches!(
            config.apply_profile(),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_custom_profile_keeps_sections() {
        let yaml = r#"
profile: custom
cpu:
  scheduling: false
network:
  tcp: true
extended:
  execsnoop: true
"#;
        let mut config = parse_config(Path::new("c.yaml"), yaml).unwrap();
        config.apply_profile().unwrap();
        assert_eq!(config.enabled_programs(), vec!["net", "execsnoop"]);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = Config {
            poll_interval_ms: Some(0),
            ..Config::default()
        };
        assert!(validate_effective_config(&config).is_err());

        let mut config = Config::default();
        config.syscall.tracked_syscalls = vec!["read".into(), "frobnicate".into()];
        let err = validate_effective_config(&config).unwrap_err();
        assert!(err.to_string().contains("frobnicate"));

        let config = Config {
            profile: "turbo".into(),
            ..Config::default()
        };
        assert!(matches!(
            validate_effective_config(&config),
            Err(ConfigError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_load_each_format() {
        let dir = tempfile::tempdir().unwrap();
        let cases = [
            ("c.yaml", "port: 9300\nbpf:\n  program-dir: /opt/bpf\n"),
            ("c.json", r#"{"port": 9300, "bpf": {"program_dir": "/opt/bpf"}}"#),
            ("c.toml", "port = 9300\n[bpf]\nprogram_dir = \"/opt/bpf\"\n"),
        ];
        for (name, body) in cases {
            let path = dir.path().join(name);
            fs::File::create(&path)
                .unwrap()
                .write_all(body.as_bytes())
                .unwrap();
            let config = load_config(Some(&path)).unwrap();
            assert_eq!(config.port, Some(9300), "{name}");
            assert_eq!(config.bpf.program_dir, PathBuf::from("/opt/bpf"), "{name}");
            assert!(config.bpf.enabled, "{name}");
        }
    }

    #[test]
    fn test_cli_overrides_file() {
        let args = Args {
            no_config: true,
            port: Some(9999),
            profile: Some("minimal".into()),
            node_name: Some("worker-7".into()),
            ..Args::default()
        };
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.port, Some(9999));
        assert_eq!(config.node_name(), "worker-7");
        assert!(!config.network.tcp);
    }

    #[test]
    fn test_render_all_formats() {
        let config = Config::default();
        for format in [ConfigFormat::Yaml, ConfigFormat::Json, ConfigFormat::Toml] {
            let text = render_config(&config, format).unwrap();
            assert!(text.contains("poll_interval_ms"), "{format:?}");
        }
    }
}
