use std::sync::OnceLock;

use serde::Deserialize;

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_max_team_domains() -> usize {
    32
}

fn default_local_pool_size() -> usize {
    4 * 1024 * 1024
}

fn default_team_window_size() -> usize {
    4 * 1024 * 1024
}

fn default_log_level() -> String {
    "warn".to_owned()
}

fn default_shared_windows() -> Switch {
    Switch::On
}

#[derive(Deserialize, Debug, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    On,
    Off,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Use direct memory copies for peers that share memory with the
    /// calling unit, default: on
    #[serde(default = "default_shared_windows")]
    pub shared_windows: Switch,

    /// Diagnostic verbosity: error, warn, info, debug, trace.
    /// Read by the embedding application when installing its tracing
    /// subscriber, default: warn
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upper bound on concurrently live teams carrying locality
    /// trees, default: 32
    #[serde(default = "default_max_team_domains")]
    pub max_team_domains: usize,

    /// Seconds a blocking rendezvous may stall before a potential
    /// deadlock warning is printed, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// Bytes reserved per unit for non-collective allocations,
    /// default: 4 MiB
    #[serde(default = "default_local_pool_size")]
    pub local_pool_size: usize,

    /// Bytes reserved per unit per team for collective allocations,
    /// default: 4 MiB
    #[serde(default = "default_team_window_size")]
    pub team_window_size: usize,
}

impl Config {
    pub fn shared_windows_enabled(&self) -> bool {
        self.shared_windows == Switch::On
    }
}

/// Get the current environment variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("STRATUM_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
