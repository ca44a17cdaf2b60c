use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::master::StreamingRouting;
use crate::master::balancer::Strategy;

/// Cluster and processing settings.
///
/// Values start from the defaults below, are optionally replaced by a JSON file, and are finally
/// overridden by environment variables (`.env` included):
///
/// ```json
/// {
///   "master_host": "127.0.0.1",
///   "master_port": 10000,
///   "max_workers": 10,
///   "load_balancing": "least_loaded"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub master_host: String,
    pub master_port: u16,
    pub max_workers: usize,
    pub processing_timeout_minutes: u64,
    pub health_check_interval_secs: u64,
    pub health_probe_timeout_secs: u64,
    pub rpc_timeout_secs: u64,
    pub load_balancing: Strategy,
    pub streaming_routing: StreamingRouting,
    pub streaming_window_seconds: i64,
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".to_string(),
            master_port: 10000,
            max_workers: 10,
            processing_timeout_minutes: 10,
            health_check_interval_secs: 30,
            health_probe_timeout_secs: 5,
            rpc_timeout_secs: 600,
            load_balancing: Strategy::RoundRobin,
            streaming_routing: StreamingRouting::Pinned,
            streaming_window_seconds: 300,
            data_path: PathBuf::from("./data"),
        }
    }
}

impl Config {
    /// Loads the config from an optional JSON file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Overrides fields from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MASTER_HOST") {
            self.master_host = v;
        }
        override_parsed(&lookup, "MASTER_PORT", &mut self.master_port)?;
        override_parsed(&lookup, "CLUSTER_MAX_WORKERS", &mut self.max_workers)?;
        override_parsed(
            &lookup,
            "PROCESSING_TIMEOUT_MINUTES",
            &mut self.processing_timeout_minutes,
        )?;
        override_parsed(
            &lookup,
            "HEALTH_CHECK_INTERVAL_SECS",
            &mut self.health_check_interval_secs,
        )?;
        override_parsed(
            &lookup,
            "HEALTH_PROBE_TIMEOUT_SECS",
            &mut self.health_probe_timeout_secs,
        )?;
        override_parsed(&lookup, "RPC_TIMEOUT_SECS", &mut self.rpc_timeout_secs)?;
        override_parsed(&lookup, "LOAD_BALANCING", &mut self.load_balancing)?;
        override_parsed(&lookup, "STREAMING_ROUTING", &mut self.streaming_routing)?;
        override_parsed(
            &lookup,
            "STREAMING_WINDOW_SECONDS",
            &mut self.streaming_window_seconds,
        )?;
        if let Some(v) = lookup("DATA_PATH") {
            self.data_path = PathBuf::from(v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(invalid("CLUSTER_MAX_WORKERS", 0, "must be at least 1"));
        }
        if self.processing_timeout_minutes == 0 {
            return Err(invalid("PROCESSING_TIMEOUT_MINUTES", 0, "must be at least 1"));
        }
        if self.health_check_interval_secs == 0 {
            return Err(invalid("HEALTH_CHECK_INTERVAL_SECS", 0, "must be at least 1"));
        }
        if self.streaming_window_seconds <= 0 {
            return Err(invalid(
                "STREAMING_WINDOW_SECONDS",
                self.streaming_window_seconds,
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_minutes * 60)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health_probe_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Client deadline for submitting a batch or window to the master.
    ///
    /// Outlasts the master's own batch timeout plus one worker call, so a batch that times
    /// out on the master is reported as such instead of as a dropped connection.
    pub fn submit_timeout(&self) -> Duration {
        self.processing_timeout() + self.rpc_timeout()
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, e))?;
    }
    Ok(())
}

fn invalid(key: &str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::env;
    use std::fs;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.master_addr(), "127.0.0.1:10000");
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.processing_timeout(), Duration::from_secs(600));
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.load_balancing, Strategy::RoundRobin);
        assert_eq!(config.streaming_routing, StreamingRouting::Pinned);
    }

    #[test]
    fn test_submit_timeout_outlasts_master_deadlines() {
        let config = Config::default();
        assert_eq!(config.submit_timeout(), Duration::from_secs(1200));
        assert!(config.submit_timeout() > config.processing_timeout());
        assert!(config.submit_timeout() > config.rpc_timeout());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup_from(&[
                ("MASTER_PORT", "12000"),
                ("CLUSTER_MAX_WORKERS", "3"),
                ("LOAD_BALANCING", "least_loaded"),
                ("STREAMING_ROUTING", "balanced"),
                ("DATA_PATH", "/srv/topology"),
            ]))
            .unwrap();

        assert_eq!(config.master_port, 12000);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.load_balancing, Strategy::LeastLoaded);
        assert_eq!(config.streaming_routing, StreamingRouting::Balanced);
        assert_eq!(config.data_path, PathBuf::from("/srv/topology"));
    }

    #[test]
    fn test_invalid_value_names_key() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup_from(&[("MASTER_PORT", "not-a-port")]))
            .unwrap_err();

        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "MASTER_PORT");
                assert_eq!(value, "not-a-port");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup_from(&[("LOAD_BALANCING", "fastest")]))
            .unwrap_err();
        assert!(err.to_string().contains("LOAD_BALANCING"));
    }

    #[test]
    fn test_zero_workers_fails_validation() {
        let config = Config {
            max_workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_file_keeps_missing_defaults() {
        let path = env::temp_dir().join("arc_velocity_test_config.json");
        fs::write(&path, r#"{ "master_port": 11000, "load_balancing": "random" }"#).unwrap();

        let config = Config::from_json_file(&path).unwrap();

        assert_eq!(config.master_port, 11000);
        assert_eq!(config.load_balancing, Strategy::Random);
        assert_eq!(config.max_workers, 10);

        fs::remove_file(&path).unwrap();
    }
}
