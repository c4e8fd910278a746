use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

/// Default plaintext port of the metrics backend.
pub const DEFAULT_SINK_PORT: u16 = 2003;

/// Largest echo payload that fits an unfragmented IPv4 packet on a 1500 MTU.
pub const MAX_PAYLOAD_SIZE: usize = 1472;

/// Top-level configuration for the pfstatsd daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Tick interval shared by every gathering path. Default: 5s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// ALTQ queue counter collection.
    #[serde(default)]
    pub queues: QueuesConfig,

    /// ICMP probing.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Per-interface traffic counters.
    #[serde(default)]
    pub interfaces: InterfacesConfig,

    /// Metrics backend delivery.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Privilege escalation wrapper for the counter dump command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Elevation {
    #[default]
    None,
    Sudo,
    Doas,
}

impl Elevation {
    /// Non-interactive argv prefix for this mode.
    pub fn prefix(self) -> Option<&'static [&'static str]> {
        match self {
            Self::None => None,
            Self::Sudo => Some(&["sudo", "-n"]),
            Self::Doas => Some(&["doas", "-n"]),
        }
    }
}

/// Which queues or interfaces are turned into metric points.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SelectionRepr")]
pub enum NameSelection {
    #[default]
    All,
    Names(Vec<String>),
}

impl NameSelection {
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SelectionRepr {
    Keyword(String),
    Names(Vec<String>),
}

impl TryFrom<SelectionRepr> for NameSelection {
    type Error = String;

    fn try_from(repr: SelectionRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            SelectionRepr::Keyword(k) if k == "all" => Ok(Self::All),
            SelectionRepr::Keyword(k) => {
                Err(format!("select must be \"all\" or a list of names, got {k:?}"))
            }
            SelectionRepr::Names(names) => Ok(Self::Names(names)),
        }
    }
}

/// Queue counter collection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuesConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Counter dump command as an argv list. Default: `pfctl -s queue -v`.
    #[serde(default = "default_queue_command")]
    pub command: Vec<String>,

    /// Elevation wrapper. Default: none.
    #[serde(default)]
    pub elevation: Elevation,

    /// Default: all.
    #[serde(default)]
    pub select: NameSelection,

    /// Skip queues that have children. Default: true.
    #[serde(default = "default_true")]
    pub leaf_only: bool,
}

/// Interface byte counter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfacesConfig {
    /// Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Default: all.
    #[serde(default)]
    pub select: NameSelection,
}

/// ICMP probe configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Hosts or addresses to probe. Empty disables probing.
    #[serde(default)]
    pub targets: Vec<String>,

    /// Reply wait measured from the tick, capped at nine tenths of the
    /// interval. Default: 1s.
    #[serde(default = "default_probe_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Echo payload bytes. Default: 56.
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
}

/// Metrics backend connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Backend `host[:port]`; IPv6 hosts go in brackets.
    #[serde(default)]
    pub address: String,

    /// Optional prefix prepended to every metric name.
    #[serde(default)]
    pub namespace: String,

    /// Points held while disconnected. Default: 10000.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Points per write. Default: 500.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// First reconnect delay. Default: 500ms.
    #[serde(default = "default_backoff_floor", with = "humantime_serde")]
    pub backoff_floor: Duration,

    /// Reconnect delay cap. Default: 30s.
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// Default: 5s.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Default: 5s.
    #[serde(default = "default_io_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090". Empty disables the server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

fn default_queue_command() -> Vec<String> {
    ["pfctl", "-s", "queue", "-v"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_payload_size() -> usize {
    56
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    500
}

fn default_backoff_floor() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(30)
}

fn default_io_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            queues: QueuesConfig::default(),
            probe: ProbeConfig::default(),
            interfaces: InterfacesConfig::default(),
            sink: SinkConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: default_queue_command(),
            elevation: Elevation::None,
            select: NameSelection::All,
            leaf_only: true,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            timeout: default_probe_timeout(),
            payload_size: default_payload_size(),
        }
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            namespace: String::new(),
            buffer_capacity: default_buffer_capacity(),
            batch_size: default_batch_size(),
            backoff_floor: default_backoff_floor(),
            backoff_max: default_backoff_max(),
            connect_timeout: default_io_timeout(),
            write_timeout: default_io_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Errors ---

/// Invalid configuration. Always fatal before the first tick.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("probe target {0:?} is listed more than once")]
    DuplicateTarget(String),

    #[error("resolving probe target {host:?}: {reason}")]
    Unresolvable { host: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A backend `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Splits `host[:port]`, falling back to `default_port`.
///
/// IPv6 literals must be bracketed (`[::1]:2003`, `[::1]`).
pub fn parse_host(address: &str, default_port: u16) -> Result<HostPort, ConfigError> {
    let bad = |reason: &str| ConfigError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let address = address.trim();
    if address.is_empty() {
        return Err(bad("empty address"));
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| bad("unclosed '['"))?;
        let port = match tail {
            "" => None,
            t => Some(t.strip_prefix(':').ok_or_else(|| bad("junk after ']'"))?),
        };
        (host, port)
    } else {
        match address.matches(':').count() {
            0 => (address, None),
            1 => {
                let (host, port) = address.split_once(':').ok_or_else(|| bad("missing port"))?;
                (host, Some(port))
            }
            _ => {
                return Err(bad(
                    "an IPv6 address must be enclosed in square brackets",
                ))
            }
        }
    };

    if host.is_empty() {
        return Err(bad("empty host"));
    }

    let port = match port {
        None | Some("") => default_port,
        Some(p) => p.parse::<u16>().map_err(|_| bad("port is not a number in 0-65535"))?,
    };

    Ok(HostPort {
        host: host.to_string(),
        port,
    })
}

fn validate_selection(field: &'static str, select: &NameSelection) -> Result<(), ConfigError> {
    let NameSelection::Names(names) = select else {
        return Ok(());
    };
    if names.is_empty() {
        return Err(ConfigError::invalid(
            field,
            "must list at least one name, or be \"all\"",
        ));
    }
    if names.iter().any(|n| n.trim().is_empty()) {
        return Err(ConfigError::invalid(field, "contains a blank name"));
    }
    Ok(())
}

fn valid_namespace(ns: &str) -> bool {
    ns.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()
            .with_context(|| format!("validating config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("interval", "must be positive"));
        }

        if self.queues.enabled {
            if self.queues.command.first().map_or(true, |c| c.trim().is_empty()) {
                return Err(ConfigError::invalid(
                    "queues.command",
                    "is required when queues are enabled",
                ));
            }
            validate_selection("queues.select", &self.queues.select)?;
        }

        if self.interfaces.enabled {
            validate_selection("interfaces.select", &self.interfaces.select)?;
        }

        if self.probe.timeout.is_zero() {
            return Err(ConfigError::invalid("probe.timeout", "must be positive"));
        }
        if self.probe.payload_size > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::invalid(
                "probe.payload_size",
                format!("must be at most {MAX_PAYLOAD_SIZE}"),
            ));
        }
        let mut seen = HashSet::new();
        for target in &self.probe.targets {
            if target.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "probe.targets",
                    "contains a blank host",
                ));
            }
            if !seen.insert(target.as_str()) {
                return Err(ConfigError::DuplicateTarget(target.clone()));
            }
        }

        if self.sink.address.trim().is_empty() {
            return Err(ConfigError::invalid("sink.address", "is required"));
        }
        parse_host(&self.sink.address, DEFAULT_SINK_PORT)?;
        if !valid_namespace(&self.sink.namespace) {
            return Err(ConfigError::invalid(
                "sink.namespace",
                "may only contain letters, digits, '.', '_' and '-'",
            ));
        }
        if self.sink.buffer_capacity == 0 {
            return Err(ConfigError::invalid("sink.buffer_capacity", "must be positive"));
        }
        if self.sink.batch_size == 0 {
            return Err(ConfigError::invalid("sink.batch_size", "must be positive"));
        }
        if self.sink.backoff_floor.is_zero() {
            return Err(ConfigError::invalid("sink.backoff_floor", "must be positive"));
        }
        if self.sink.backoff_floor > self.sink.backoff_max {
            return Err(ConfigError::invalid(
                "sink.backoff_max",
                "must not be smaller than sink.backoff_floor",
            ));
        }
        if self.sink.connect_timeout.is_zero() || self.sink.write_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "sink timeouts",
                "must be positive",
            ));
        }

        Ok(())
    }

    /// Resolved backend address. Only call after `validate`.
    pub fn sink_address(&self) -> Result<HostPort, ConfigError> {
        parse_host(&self.sink.address, DEFAULT_SINK_PORT)
    }
}
