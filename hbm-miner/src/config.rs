//! Device settings.
//!
//! Parsed once from environment variables and shared read-only between the
//! workers. See [`DeviceSettings::from_env`] for the variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::fpga::regs::MAX_MIXERS;
use crate::tracing::prelude::*;
use crate::types::IntensitySettings;

/// Port boards listen on when a host entry names none.
pub const DEFAULT_PORT: u16 = 2000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid host entry {0:?}")]
    InvalidHost(String),

    #[error("invalid port range {0:?}")]
    InvalidPortRange(String),

    #[error("no hosts configured")]
    NoHosts,
}

/// Network address of one board.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    /// Parse a single `host` or `host:port` entry.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match expand_host(s)?.as_slice() {
            [one] => Ok(one.clone()),
            _ => Err(ConfigError::InvalidHost(s.to_string())),
        }
    }
}

/// Expand one host entry: `host`, `host:port` or `host:first-last`.
pub fn expand_host(entry: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let entry = entry.trim();
    let (host, ports) = match entry.rsplit_once(':') {
        Some((host, ports)) => (host, Some(ports)),
        None => (entry, None),
    };
    if host.is_empty() {
        return Err(ConfigError::InvalidHost(entry.to_string()));
    }

    let range = match ports {
        None => DEFAULT_PORT..=DEFAULT_PORT,
        Some(ports) => match ports.split_once('-') {
            Some((first, last)) => {
                let bad = || ConfigError::InvalidPortRange(ports.to_string());
                let first: u16 = first.trim().parse().map_err(|_| bad())?;
                let last: u16 = last.trim().parse().map_err(|_| bad())?;
                if last < first {
                    return Err(bad());
                }
                first..=last
            }
            None => {
                let port: u16 = ports
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidHost(entry.to_string()))?;
                port..=port
            }
        },
    };

    Ok(range
        .map(|port| Endpoint {
            host: host.to_string(),
            port,
        })
        .collect())
}

/// Expand a comma-separated host list into one endpoint per board.
pub fn expand_hosts(list: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let mut endpoints = Vec::new();
    for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
        endpoints.extend(expand_host(entry)?);
    }
    if endpoints.is_empty() {
        return Err(ConfigError::NoHosts);
    }
    Ok(endpoints)
}

/// Where the light cache for a new epoch comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// The bitstream derives the cache from the seed.
    #[default]
    OnChip,
    /// The host streams a precomputed cache into HBM.
    Upload,
}

/// How the hash core hands back candidate nonces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceReporting {
    /// One nonce per interrupt.
    #[default]
    Interrupt,
    /// Legacy: sleep, then read up to four nonce slots.
    Polled,
}

/// Settings shared by every board.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub hosts: Vec<Endpoint>,

    /// Per-transaction transport timeout.
    pub transport_timeout: Duration,

    /// Rail A (wiper) target in mV; 0 leaves the rail untouched.
    pub rail_a_mv: u32,

    /// Rail B (PMBus) target in mV; 0 leaves the rail untouched.
    pub rail_b_mv: u32,

    /// Core clock to run at after DAG generation; 0 keeps the bitstream
    /// default.
    pub target_clock_mhz: u32,

    pub dag_mixers: u32,

    /// Upper bound on one interrupt wait (or the polled-mode sleep).
    pub work_delay: Duration,

    /// Static patience and intensity, overridden by the tuner when it has
    /// an opinion.
    pub intensity: IntensitySettings,

    pub skip_stall_detection: bool,

    /// Turn poll, interrupt and control-word failures into fatal errors.
    pub die_on_error: bool,

    /// Regenerate the DAG even if the board already holds this epoch.
    pub force_dag: bool,

    /// Start DAG generation without waiting for it to finish.
    pub skip_dag_wait: bool,

    pub cache_strategy: CacheStrategy,
    pub nonce_reporting: NonceReporting,

    /// Always log HBM stack temperatures in the status line.
    pub show_stack_stats: bool,

    /// Auto-tune level; 0 disables.
    pub auto_tune: u8,
    pub tune_file: Option<PathBuf>,

    /// How often a running search samples telemetry.
    pub telemetry_interval: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            transport_timeout: Duration::from_millis(5000),
            rail_a_mv: 0,
            rail_b_mv: 0,
            target_clock_mhz: 0,
            dag_mixers: 8,
            work_delay: Duration::from_micros(100_000),
            intensity: IntensitySettings::default(),
            skip_stall_detection: false,
            die_on_error: false,
            force_dag: false,
            skip_dag_wait: false,
            cache_strategy: CacheStrategy::OnChip,
            nonce_reporting: NonceReporting::Interrupt,
            show_stack_stats: false,
            auto_tune: 0,
            tune_file: None,
            telemetry_interval: Duration::from_secs(5),
        }
    }
}

impl DeviceSettings {
    /// Build settings from environment variables.
    ///
    /// Returns `Ok(None)` when `HBM_HOSTS` is unset.
    ///
    /// # Environment Variables
    ///
    /// - `HBM_HOSTS`: comma-separated `host[:port|:first-last]` (required)
    /// - `HBM_TIMEOUT_MS`: transport timeout (default: 5000)
    /// - `HBM_RAIL_A_MV`, `HBM_RAIL_B_MV`: voltage targets (default: 0, untouched)
    /// - `HBM_CLOCK_MHZ`: core clock after DAG generation (default: 0, stock)
    /// - `HBM_DAG_MIXERS`: DAG generator mixers (default: 8, 1 to 21)
    /// - `HBM_WORK_DELAY_US`: interrupt wait bound (default: 100000)
    /// - `HBM_PATIENCE`, `HBM_INTENSITY_N`, `HBM_INTENSITY_D`: core tuning (default: 0)
    /// - `HBM_SKIP_STALL_DETECT`, `HBM_DIE_ON_ERROR`, `HBM_FORCE_DAG`,
    ///   `HBM_SKIP_DAG_WAIT`, `HBM_CACHE_UPLOAD`, `HBM_POLLED_NONCES`,
    ///   `HBM_SHOW_STACK_STATS`: flags, set to `1` or `true`
    /// - `HBM_AUTOTUNE`: auto-tune level (default: 0)
    /// - `HBM_TUNE_FILE`: saved tunes
    /// - `HBM_TELEMETRY_SECS`: telemetry interval while searching (default: 5)
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(hosts) = std::env::var("HBM_HOSTS") else {
            return Ok(None);
        };
        let defaults = Self::default();

        let settings = Self {
            hosts: expand_hosts(&hosts)?,
            transport_timeout: env_parse("HBM_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.transport_timeout),
            rail_a_mv: env_parse("HBM_RAIL_A_MV").unwrap_or(defaults.rail_a_mv),
            rail_b_mv: env_parse("HBM_RAIL_B_MV").unwrap_or(defaults.rail_b_mv),
            target_clock_mhz: env_parse("HBM_CLOCK_MHZ").unwrap_or(defaults.target_clock_mhz),
            dag_mixers: dag_mixers(env_parse("HBM_DAG_MIXERS").unwrap_or(defaults.dag_mixers)),
            work_delay: env_parse("HBM_WORK_DELAY_US")
                .map(Duration::from_micros)
                .unwrap_or(defaults.work_delay),
            intensity: IntensitySettings {
                patience: env_parse("HBM_PATIENCE").unwrap_or(0),
                intensity_n: env_parse("HBM_INTENSITY_N").unwrap_or(0),
                intensity_d: env_parse("HBM_INTENSITY_D").unwrap_or(0),
            },
            skip_stall_detection: env_flag("HBM_SKIP_STALL_DETECT"),
            die_on_error: env_flag("HBM_DIE_ON_ERROR"),
            force_dag: env_flag("HBM_FORCE_DAG"),
            skip_dag_wait: env_flag("HBM_SKIP_DAG_WAIT"),
            cache_strategy: if env_flag("HBM_CACHE_UPLOAD") {
                CacheStrategy::Upload
            } else {
                CacheStrategy::OnChip
            },
            nonce_reporting: if env_flag("HBM_POLLED_NONCES") {
                NonceReporting::Polled
            } else {
                NonceReporting::Interrupt
            },
            show_stack_stats: env_flag("HBM_SHOW_STACK_STATS"),
            auto_tune: env_parse("HBM_AUTOTUNE").unwrap_or(defaults.auto_tune),
            tune_file: std::env::var("HBM_TUNE_FILE").ok().map(PathBuf::from),
            telemetry_interval: env_parse("HBM_TELEMETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.telemetry_interval),
        };
        Ok(Some(settings))
    }

    /// Display name of the board at `index`.
    pub fn device_name(index: usize) -> String {
        format!("hbm-{}", index)
    }
}

// A present but malformed value is logged and treated as unset.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn dag_mixers(requested: u32) -> u32 {
    let mixers = requested.clamp(1, MAX_MIXERS);
    if mixers != requested {
        warn!(requested, using = mixers, "HBM_DAG_MIXERS out of range");
    }
    mixers
}
