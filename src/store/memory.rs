use crate::error::LimiterError;
use crate::store::{encode_member, Reservation, SeriesView};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Process-local timestamp store.
///
/// One `SeriesCell` per key; all reads and mutations of a series happen under
/// its own `tokio::sync::Mutex`, so admissions on the same key are totally
/// ordered while different keys never contend.
///
/// Series whose callers go idle are swept by a background task (`start_sweeper`)
/// once their last access is older than the widest configured window.
#[derive(Clone)]
pub struct MemoryStore {
    series: Arc<DashMap<String, Arc<SeriesCell>>>,
}

struct SeriesCell {
    inner: Mutex<Series>,
    /// Last access in microseconds since process start (for the sweeper).
    /// Atomic so it is updated outside the lock.
    last_access: AtomicU64,
}

#[derive(Default)]
struct Series {
    /// Entries sorted ascending by timestamp. Duplicates allowed.
    entries: VecDeque<Entry>,
    /// Incrementally maintained weight sum of `entries`.
    total_weight: f64,
}

struct Entry {
    ts: f64,
    weight: f64,
    member: String,
}

/// Sweeper wakes up this often.
const SWEEP_INTERVAL_SECS: u64 = 60;

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

impl Series {
    fn prune(&mut self, cutoff: f64) {
        while let Some(front) = self.entries.front() {
            if front.ts < cutoff {
                self.total_weight -= front.weight;
                self.entries.pop_front();
            } else {
                break;
            }
        }
        // Pin the incremental sum back to exact zero so float residue from
        // repeated subtraction cannot accumulate across window turnovers.
        if self.entries.is_empty() {
            self.total_weight = 0.0;
        }
    }

    /// Insert keeping ascending timestamp order. Concurrent callers can take
    /// their wall-clock reading before losing the lock race, so an entry may
    /// arrive with a timestamp slightly behind the back of the queue.
    fn insert(&mut self, ts: f64, weight: f64, member: String) {
        let mut idx = self.entries.len();
        while idx > 0 && self.entries[idx - 1].ts > ts {
            idx -= 1;
        }
        self.entries.insert(idx, Entry { ts, weight, member });
        self.total_weight += weight;
    }

    fn oldest(&self) -> Option<f64> {
        self.entries.front().map(|e| e.ts)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            series: Arc::new(DashMap::new()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast path: key already exists, no allocation.
    fn cell(&self, key: &str) -> Arc<SeriesCell> {
        if let Some(entry) = self.series.get(key) {
            return entry.value().clone();
        }
        self.series
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(SeriesCell {
                    inner: Mutex::new(Series::default()),
                    last_access: AtomicU64::new(now_us()),
                })
            })
            .clone()
    }

    pub(super) async fn reserve(
        &self,
        key: &str,
        cutoff: f64,
        now: f64,
        weight: f64,
        limit: f64,
    ) -> Result<Reservation, LimiterError> {
        let cell = self.cell(key);
        cell.last_access.store(now_us(), Ordering::Relaxed);

        let mut series = cell.inner.lock().await;
        series.prune(cutoff);

        if series.total_weight + weight <= limit {
            let member = encode_member(now, weight);
            series.insert(now, weight, member.clone());
            Ok(Reservation {
                admitted: true,
                load: series.total_weight,
                oldest: series.oldest(),
                member: Some(member),
            })
        } else {
            Ok(Reservation {
                admitted: false,
                load: series.total_weight,
                oldest: series.oldest(),
                member: None,
            })
        }
    }

    pub(super) async fn peek(&self, key: &str, cutoff: f64) -> Result<SeriesView, LimiterError> {
        // Absent key: nothing to prune, load is zero. Reads must not create
        // series, otherwise `status` on a quiet resource would pin memory.
        let Some(cell) = self.series.get(key).map(|e| e.value().clone()) else {
            return Ok(SeriesView {
                load: 0.0,
                oldest: None,
            });
        };

        let mut series = cell.inner.lock().await;
        series.prune(cutoff);
        Ok(SeriesView {
            load: series.total_weight,
            oldest: series.oldest(),
        })
    }

    pub(super) async fn remove(&self, key: &str, member: &str) -> Result<bool, LimiterError> {
        let Some(cell) = self.series.get(key).map(|e| e.value().clone()) else {
            return Ok(false);
        };

        let mut series = cell.inner.lock().await;
        let Some(idx) = series.entries.iter().position(|e| e.member == member) else {
            return Ok(false);
        };
        let entry = series.entries.remove(idx).expect("index in bounds");
        series.total_weight -= entry.weight;
        if series.entries.is_empty() {
            series.total_weight = 0.0;
        }
        Ok(true)
    }

    pub(super) async fn clear(&self, key: &str) -> Result<(), LimiterError> {
        self.series.remove(key);
        Ok(())
    }

    pub(super) async fn all_keys(&self) -> Result<Vec<String>, LimiterError> {
        Ok(self.series.iter().map(|e| e.key().clone()).collect())
    }

    pub(super) async fn report_memory(&self) -> Result<u64, LimiterError> {
        // Snapshot cells first: locking a series while holding the map's
        // shard guard would stall writers on that shard.
        let cells: Vec<(u64, Arc<SeriesCell>)> = self
            .series
            .iter()
            .map(|e| (e.key().len() as u64, e.value().clone()))
            .collect();

        let mut bytes = 0u64;
        for (key_len, cell) in cells {
            bytes += key_len;
            let series = cell.inner.lock().await;
            for e in &series.entries {
                bytes += (std::mem::size_of::<Entry>() + e.member.len()) as u64;
            }
        }
        Ok(bytes)
    }

    /// Spawn a background task that drops series untouched for longer than
    /// `max_idle_secs`. Call once after constructing the store.
    pub fn start_sweeper(&self, max_idle_secs: u64) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                let dropped = store.sweep(max_idle_secs);
                if dropped > 0 {
                    tracing::debug!("store: memory: swept idle series, dropped={}", dropped);
                }
                metrics::gauge!("limiter_series_keys", "backend" => "memory")
                    .set(store.series.len() as f64);
            }
        });
    }

    /// Remove series whose last access is older than `max_idle_secs`.
    /// Returns the number of series dropped.
    pub fn sweep(&self, max_idle_secs: u64) -> usize {
        let now = now_us();
        let idle_us = max_idle_secs.saturating_mul(1_000_000);
        let before = self.series.len();
        self.series
            .retain(|_, cell| now.saturating_sub(cell.last_access.load(Ordering::Relaxed)) < idle_us);
        before - self.series.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_admits_until_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let r = store
                .reserve("k:rps", 0.0, 100.0 + i as f64 * 0.01, 1.0, 5.0)
                .await
                .unwrap();
            assert!(r.admitted, "admission {} should pass", i);
            assert_eq!(r.load, (i + 1) as f64);
        }
        let r = store.reserve("k:rps", 99.05, 100.05, 1.0, 5.0).await.unwrap();
        assert!(!r.admitted);
        assert_eq!(r.load, 5.0);
        assert_eq!(r.oldest, Some(100.0));
        assert!(r.member.is_none());
    }

    #[tokio::test]
    async fn prune_drops_entries_before_cutoff() {
        let store = MemoryStore::new();
        store.reserve("k", 0.0, 10.0, 2.0, 100.0).await.unwrap();
        store.reserve("k", 0.0, 11.0, 3.0, 100.0).await.unwrap();
        store.reserve("k", 0.0, 12.0, 4.0, 100.0).await.unwrap();

        // Cutoff between the first and second entry: load drops to 3 + 4.
        let view = store.peek("k", 10.5).await.unwrap();
        assert_eq!(view.load, 7.0);
        assert_eq!(view.oldest, Some(11.0));

        // Entry exactly at the cutoff stays.
        let view = store.peek("k", 11.0).await.unwrap();
        assert_eq!(view.load, 7.0);
    }

    #[tokio::test]
    async fn remove_by_member_subtracts_weight() {
        let store = MemoryStore::new();
        let r = store.reserve("k", 0.0, 10.0, 4.0, 100.0).await.unwrap();
        store.reserve("k", 0.0, 11.0, 6.0, 100.0).await.unwrap();

        let member = r.member.unwrap();
        assert!(store.remove("k", &member).await.unwrap());
        let view = store.peek("k", 0.0).await.unwrap();
        assert_eq!(view.load, 6.0);
        assert_eq!(view.oldest, Some(11.0));

        // Second removal of the same member is a no-op.
        assert!(!store.remove("k", &member).await.unwrap());
    }

    #[tokio::test]
    async fn peek_does_not_create_series() {
        let store = MemoryStore::new();
        let view = store.peek("ghost", 0.0).await.unwrap();
        assert_eq!(view.load, 0.0);
        assert!(view.oldest.is_none());
        assert!(store.all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_inserts_keep_sorted_front() {
        let store = MemoryStore::new();
        store.reserve("k", 0.0, 20.0, 1.0, 100.0).await.unwrap();
        // A racer observed an earlier wall-clock instant.
        store.reserve("k", 0.0, 19.5, 1.0, 100.0).await.unwrap();

        let view = store.peek("k", 0.0).await.unwrap();
        assert_eq!(view.oldest, Some(19.5));
    }

    #[tokio::test]
    async fn sweep_drops_only_idle_series() {
        let store = MemoryStore::new();
        store.reserve("fresh", 0.0, 1.0, 1.0, 10.0).await.unwrap();
        assert_eq!(store.sweep(3600), 0);
        assert_eq!(store.all_keys().await.unwrap().len(), 1);

        // Zero idle budget drops everything touched before this instant.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.sweep(0), 1);
        assert!(store.all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let store = MemoryStore::new();
        store.reserve("a", 0.0, 1.0, 5.0, 5.0).await.unwrap();
        let r = store.reserve("b", 0.0, 1.0, 5.0, 5.0).await.unwrap();
        assert!(r.admitted);
        assert_eq!(store.peek("a", 0.0).await.unwrap().load, 5.0);
        assert_eq!(store.peek("b", 0.0).await.unwrap().load, 5.0);
    }
}
