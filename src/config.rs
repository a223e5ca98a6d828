use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HOSTLIST: &str = "1.1.1.1 8.8.8.8";
pub const HOSTLIST_ENV: &str = "HOSTLIST";
pub const DEFAULT_DATABASE: &str = "pingmon.sqlite";
pub const OUTCOME_QUEUE_DEPTH: usize = 100;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PROBE_JITTER: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe timings. Fixed at startup, never exposed as flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub probe_interval: Duration,
    /// Upper bound (exclusive) of the random delay added to `probe_interval`.
    pub jitter: Duration,
    pub probe_timeout: Duration,
    pub reap_interval: Duration,
    pub restart_backoff: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        let reap_interval = PROBE_TIMEOUT * 3;
        Self {
            probe_interval: PROBE_INTERVAL,
            jitter: PROBE_JITTER,
            probe_timeout: PROBE_TIMEOUT,
            reap_interval,
            restart_backoff: reap_interval * 3,
        }
    }
}

impl Cadence {
    /// Probe period for one correlator: the base interval plus a random
    /// offset, so many addresses do not fire in lockstep.
    pub fn jittered_interval(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(0);
        if jitter_ms == 0 {
            return self.probe_interval;
        }
        self.probe_interval + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub hosts: Vec<String>,
    pub database: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            database: PathBuf::from(DEFAULT_DATABASE),
        }
    }
}

impl AppConfig {
    pub fn get_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("PingLedger").join("config.json"))
    }

    pub fn load() -> Self {
        let Some(path) = Self::get_config_path() else {
            return AppConfig::default();
        };
        if !path.exists() {
            return AppConfig::default();
        }
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                log::warn!("failed to parse {}: {e}", path.display());
                AppConfig::default()
            }),
            Err(e) => {
                log::warn!("failed to read {}: {e}", path.display());
                AppConfig::default()
            }
        }
    }

    pub fn parse(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }
}

/// Where the monitored host list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSource {
    Arguments,
    Environment,
    ConfigFile,
    BuiltIn,
}

/// Picks the host list: arguments first, then the `HOSTLIST` value, then the
/// config file, then the built-in default.
pub fn resolve_hosts(
    args: &[String],
    env_hostlist: Option<&str>,
    config: &AppConfig,
) -> (Vec<String>, HostSource) {
    let hosts = non_empty(args.iter().map(String::as_str));
    if !hosts.is_empty() {
        return (hosts, HostSource::Arguments);
    }
    if let Some(list) = env_hostlist {
        let hosts = non_empty(list.split(' '));
        if !hosts.is_empty() {
            return (hosts, HostSource::Environment);
        }
    }
    let hosts = non_empty(config.hosts.iter().map(String::as_str));
    if !hosts.is_empty() {
        return (hosts, HostSource::ConfigFile);
    }
    (non_empty(DEFAULT_HOSTLIST.split(' ')), HostSource::BuiltIn)
}

fn non_empty<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}
