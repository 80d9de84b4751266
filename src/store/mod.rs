//! Timestamp series storage.
//!
//! Two interchangeable variants hold, per series key, the ordered multiset of
//! weighted event timestamps: a process-local map and a shared Redis store.
//! Both expose the same contract; `reserve` is the single atomic
//! prune + weigh + conditional-append step the limiter builds on.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::LimiterError;
use std::time::Instant;

/// Result of an atomic admission attempt on one series.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub admitted: bool,
    /// Weight sum inside the window after the attempt.
    pub load: f64,
    /// Smallest timestamp still in the series, if any.
    pub oldest: Option<f64>,
    /// Member token of the appended entry; present iff admitted. Used for
    /// best-effort rollback by exact member.
    pub member: Option<String>,
}

/// Read-only view of one series after pruning.
#[derive(Debug, Clone, Copy)]
pub struct SeriesView {
    pub load: f64,
    pub oldest: Option<f64>,
}

/// Encode one entry as `<nanos>:<weight>:<nonce>`.
///
/// The weight rides in the member payload because the shared store scores by
/// timestamp; the random nonce keeps two same-timestamp same-weight
/// admissions distinct.
pub fn encode_member(ts: f64, weight: f64) -> String {
    let nanos = (ts * 1e9) as u64;
    let nonce: u64 = rand::random();
    let mut nanos_buf = itoa::Buffer::new();
    let mut nonce_buf = itoa::Buffer::new();
    let weight_str = weight.to_string();

    let nanos_str = nanos_buf.format(nanos);
    let nonce_str = nonce_buf.format(nonce);
    let mut member = String::with_capacity(nanos_str.len() + weight_str.len() + nonce_str.len() + 2);
    member.push_str(nanos_str);
    member.push(':');
    member.push_str(&weight_str);
    member.push(':');
    member.push_str(nonce_str);
    member
}

/// Storage backend, dispatched by variant.
///
/// Operations are observably atomic per key; concurrent calls on different
/// keys do not serialize against each other.
pub enum SeriesStore {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl SeriesStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            SeriesStore::Memory(_) => "memory",
            SeriesStore::Redis(_) => "redis",
        }
    }

    /// Prune entries older than `cutoff`, then append `(now, weight)` iff the
    /// post-append load stays within `limit`. Atomic per key on both
    /// backends. `unit_weights` marks series that only ever hold weight-1
    /// entries, enabling the cardinality fast path on the shared store.
    pub async fn reserve(
        &self,
        key: &str,
        cutoff: f64,
        now: f64,
        weight: f64,
        limit: f64,
        unit_weights: bool,
    ) -> Result<Reservation, LimiterError> {
        let start = Instant::now();
        let result = match self {
            SeriesStore::Memory(s) => s.reserve(key, cutoff, now, weight, limit).await,
            SeriesStore::Redis(s) => {
                s.reserve(key, cutoff, now, weight, limit, unit_weights).await
            }
        };
        self.record_op("reserve", start, &result);
        result
    }

    /// Prune by `cutoff` and read load + oldest without mutating admissions.
    pub async fn peek(
        &self,
        key: &str,
        cutoff: f64,
        unit_weights: bool,
    ) -> Result<SeriesView, LimiterError> {
        let start = Instant::now();
        let result = match self {
            SeriesStore::Memory(s) => s.peek(key, cutoff).await,
            SeriesStore::Redis(s) => s.peek(key, cutoff, unit_weights).await,
        };
        self.record_op("peek", start, &result);
        result
    }

    /// Remove one entry by exact member token. Returns whether it was found.
    pub async fn remove(&self, key: &str, member: &str) -> Result<bool, LimiterError> {
        let start = Instant::now();
        let result = match self {
            SeriesStore::Memory(s) => s.remove(key, member).await,
            SeriesStore::Redis(s) => s.remove(key, member).await,
        };
        self.record_op("remove", start, &result);
        result
    }

    pub async fn clear(&self, key: &str) -> Result<(), LimiterError> {
        match self {
            SeriesStore::Memory(s) => s.clear(key).await,
            SeriesStore::Redis(s) => s.clear(key).await,
        }
    }

    pub async fn all_keys(&self) -> Result<Vec<String>, LimiterError> {
        match self {
            SeriesStore::Memory(s) => s.all_keys().await,
            SeriesStore::Redis(s) => s.all_keys().await,
        }
    }

    /// Approximate bytes held by all series.
    pub async fn report_memory(&self) -> Result<u64, LimiterError> {
        match self {
            SeriesStore::Memory(s) => s.report_memory().await,
            SeriesStore::Redis(s) => s.report_memory().await,
        }
    }

    /// Reachability probe. Always succeeds for the local variant.
    pub async fn ping(&self) -> Result<(), LimiterError> {
        match self {
            SeriesStore::Memory(_) => Ok(()),
            SeriesStore::Redis(s) => s.ping().await,
        }
    }

    fn record_op<T>(&self, op: &'static str, start: Instant, result: &Result<T, LimiterError>) {
        metrics::histogram!(
            "limiter_store_op_duration_seconds",
            "op" => op,
            "backend" => self.backend_name(),
        )
        .record(start.elapsed().as_secs_f64());

        if result.is_err() {
            metrics::counter!(
                "limiter_store_errors_total",
                "op" => op,
                "backend" => self.backend_name(),
            )
            .increment(1);
        }
    }
}
