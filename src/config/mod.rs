pub mod types;


pub use types::*;

use anyhow::Result;
use std::path::Path;

impl LimiterSettings {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used and the limiter starts with the
    /// process-local backend and no resources configured.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: LimiterSettings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!(
                "config file not found at {}, using defaults",
                path.display()
            );
            LimiterSettings::default()
        };

        settings.apply_env_overrides();

        settings.validate()?;
        tracing::info!(
            "config: loaded, backend={}, resources={}",
            settings.backend,
            settings.resources.len()
        );
        Ok(settings)
    }

    /// Environment variable overrides for connection/infra settings. Resource
    /// limit sets come from the file or runtime `configure` calls only.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QUOTAGATE_BACKEND") {
            self.backend = v;
        }
        if let Ok(v) = std::env::var("QUOTAGATE_OP_TIMEOUT") {
            self.op_timeout = v;
        }

        if let Ok(v) = std::env::var("QUOTAGATE_REDIS_HOST") {
            self.redis.host = v;
        }
        if let Ok(v) = std::env::var("QUOTAGATE_REDIS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.redis.port = n;
            }
        }
        if let Ok(v) = std::env::var("QUOTAGATE_REDIS_DB") {
            if let Ok(n) = v.parse::<u32>() {
                self.redis.db = n;
            }
        }

        if let Ok(v) = std::env::var("QUOTAGATE_ADMIN_LISTEN") {
            self.admin.listen = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.backend.as_str() {
            "memory" | "redis" => {}
            other => anyhow::bail!("unknown backend {:?}, use \"memory\" or \"redis\"", other),
        }

        if let Err(e) = humantime::parse_duration(&self.op_timeout) {
            anyhow::bail!("bad op_timeout {:?}: {}", self.op_timeout, e);
        }

        if self.backend == "redis" && self.redis.host.is_empty() {
            anyhow::bail!("redis host cannot be empty");
        }

        for name in self.resources.keys() {
            if name.is_empty() {
                anyhow::bail!("resource name cannot be empty");
            }
        }
        Ok(())
    }
}
