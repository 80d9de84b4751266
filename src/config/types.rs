use crate::limit::ResourceLimitSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// "memory" (process-local) or "redis" (shared store).
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Budget for a single store round-trip, humantime form ("5s", "750ms").
    #[serde(default = "default_op_timeout")]
    pub op_timeout: String,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub admin: AdminSettings,

    /// Resources configured at startup; `QuotaGate::configure` can add or
    /// replace entries at runtime.
    #[serde(default)]
    pub resources: HashMap<String, ResourceLimitSet>,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            op_timeout: default_op_timeout(),
            redis: RedisSettings::default(),
            admin: AdminSettings::default(),
            resources: HashMap::new(),
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

fn default_op_timeout() -> String {
    "5s".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Logical database index.
    #[serde(default)]
    pub db: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSettings {
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            listen: default_admin_listen(),
        }
    }
}

fn default_admin_listen() -> String {
    "0.0.0.0:9090".to_string()
}

impl LimiterSettings {
    /// Parsed store-operation timeout.
    pub fn op_timeout(&self) -> Duration {
        humantime::parse_duration(&self.op_timeout).unwrap_or(Duration::from_secs(5))
    }
}
