//! Configuration required to instantiate the core: namespace, store
//! connection, and reaper tuning.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_namespace() -> String {
    "mlq_default".to_string()
}

fn default_reaper_period_secs() -> u64 {
    1
}

fn default_job_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u64 {
    5
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:5001".parse().unwrap()
}

/// Core configuration. Deserializable from a YAML file (`serde_yaml`) and
/// overridable from CLI flags.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_reaper_period_secs")]
    pub reaper_period_secs: u64,

    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u64,

    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            redis_url: default_redis_url(),
            reaper_period_secs: default_reaper_period_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            max_retries: default_max_retries(),
            http_addr: default_http_addr(),
        }
    }
}

impl Config {
    /// Loads a YAML config file, falling back to defaults for any field it
    /// doesn't specify.
    pub fn from_yaml_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn reaper_period(&self) -> Duration {
        Duration::from_secs(self.reaper_period_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.namespace, "mlq_default");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.job_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg: Config = serde_yaml::from_str("namespace: custom_ns\nmax_retries: 2\n").unwrap();
        assert_eq!(cfg.namespace, "custom_ns");
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.redis_url, default_redis_url());
    }
}
