use crate::config::LimiterSettings;
use crate::gate::QuotaGate;
use crate::metrics::Metrics;
use crate::store::{MemoryStore, RedisStore, SeriesStore};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Idle series older than the widest window any limit type can carry are
/// eligible for sweeping.
const SWEEP_IDLE_SECS: u64 = 3600;

/// Shared server state, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<ArcSwap<LimiterSettings>>,
    pub gate: Arc<QuotaGate>,
    pub metrics: Metrics,
}

impl AppState {
    pub async fn new(settings: LimiterSettings) -> Result<Self> {
        let metrics = Metrics::install();

        let op_timeout = settings.op_timeout();
        let store = match settings.backend.as_str() {
            "redis" => {
                let redis = RedisStore::connect(&settings.redis, op_timeout)
                    .await
                    .map_err(|e| anyhow::anyhow!("redis backend: {}", e))?;
                info!(
                    "store: redis connected, host={}, port={}, db={}",
                    settings.redis.host, settings.redis.port, settings.redis.db
                );
                SeriesStore::Redis(redis)
            }
            _ => {
                let memory = MemoryStore::new();
                memory.start_sweeper(SWEEP_IDLE_SECS);
                info!("store: process-local memory, sweep_idle={}s", SWEEP_IDLE_SECS);
                SeriesStore::Memory(memory)
            }
        };

        let gate = Arc::new(QuotaGate::new(store));
        for (resource, limits) in &settings.resources {
            gate.configure(resource, limits.clone());
        }

        Ok(Self {
            settings: Arc::new(ArcSwap::new(Arc::new(settings))),
            gate,
            metrics,
        })
    }
}
