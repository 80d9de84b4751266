//! Multi-limit resource manager.
//!
//! Binds a resource name to its active limits and evaluates them jointly,
//! tightest window first. A call passes only if every active limit admits;
//! otherwise admissions already made for the call are rolled back and the
//! rejector demanding the longest wait is reported as the binding limit.

use crate::clock;
use crate::error::LimiterError;
use crate::limit::{LimitKind, LimitSpec, LimitType, ResourceLimitSet};
use crate::store::SeriesStore;
use crate::window::{self, WindowCheck};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub struct ResourceManager {
    store: Arc<SeriesStore>,
    resources: DashMap<String, Arc<ResourceEntry>>,
}

struct ResourceEntry {
    configuration: ResourceLimitSet,
    /// Active limits in evaluation order (rps, rpm, rph, tps, tpm).
    active: Vec<(LimitType, LimitSpec)>,
}

/// Joint decision across all active limits of one resource.
#[derive(Debug, Clone)]
pub struct Decision {
    pub admitted: bool,
    /// Maximum wait among rejecting limits; zero when admitted.
    pub wait: f64,
    /// The limit demanding that wait.
    pub binding: Option<(LimitType, LimitSpec)>,
    /// Load on the binding limit's series, or on the tightest limit when
    /// admitted.
    pub load: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitUsage {
    pub current: f64,
    pub limit: f64,
}

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    pub resource_key: String,
    pub configuration: ResourceLimitSet,
    pub current_usage: BTreeMap<&'static str, LimitUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_timestamp: Option<f64>,
    /// How long a unit-weight call would have to wait right now.
    pub sleep_time_hint: f64,
}

impl ResourceManager {
    pub fn new(store: Arc<SeriesStore>) -> Self {
        Self {
            store,
            resources: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.store
    }

    /// Install or replace the limit set for a resource. Idempotent;
    /// non-positive values deactivate their limit type. Series state is kept,
    /// so re-enabling a limit sees whatever entries are still in its window.
    /// Not atomic with in-flight checks; new values apply on the next check.
    pub fn configure(&self, resource: &str, limits: ResourceLimitSet) {
        let entry = ResourceEntry {
            configuration: limits.normalized(),
            active: limits.active(),
        };
        self.resources.insert(resource.to_string(), Arc::new(entry));
        tracing::info!(
            "manager: resource configured, resource={}, active_limits={}",
            resource,
            self.resources
                .get(resource)
                .map(|e| e.active.len())
                .unwrap_or(0)
        );
    }

    pub fn is_configured(&self, resource: &str) -> bool {
        self.resources.contains_key(resource)
    }

    pub fn resource_names(&self) -> Vec<String> {
        self.resources.iter().map(|e| e.key().clone()).collect()
    }

    /// Normalized limit set for a configured resource.
    pub fn configuration(&self, resource: &str) -> Option<ResourceLimitSet> {
        self.resources
            .get(resource)
            .map(|e| e.configuration.clone())
    }

    /// Widest window among the resource's active limits, used as the coordinator's
    /// total-wait budget.
    pub fn widest_window(&self, resource: &str) -> f64 {
        self.resources
            .get(resource)
            .map(|e| {
                e.active
                    .iter()
                    .map(|(_, spec)| spec.window)
                    .fold(0.0, f64::max)
            })
            .unwrap_or(0.0)
    }

    /// Evaluate all active limits for one call.
    ///
    /// `weight` counts against token limits; request limits always count 1.
    /// After the first rejection the remaining limits are probed read-only so
    /// every rejector's wait is collected without creating admissions that
    /// would immediately need rolling back.
    pub async fn check(
        &self,
        base_key: &str,
        resource: &str,
        weight: f64,
        now: f64,
    ) -> Result<Decision, LimiterError> {
        let Some(entry) = self.resources.get(resource).map(|e| e.value().clone()) else {
            // Unconfigured resources carry no limits: nothing to count.
            return Ok(Decision {
                admitted: true,
                wait: 0.0,
                binding: None,
                load: 0.0,
            });
        };

        let mut admissions: Vec<(String, String)> = Vec::new();
        let mut rejectors: Vec<(LimitType, LimitSpec, WindowCheck)> = Vec::new();
        let mut first_load = 0.0;

        for &(limit_type, spec) in &entry.active {
            let effective_weight = match limit_type.kind() {
                LimitKind::Request => 1.0,
                LimitKind::Token => weight,
            };
            let key = format!("{}:{}", base_key, limit_type.suffix());

            let check = if rejectors.is_empty() {
                let result =
                    window::check_and_admit(&self.store, &key, limit_type, spec, effective_weight, now)
                        .await;
                match result {
                    Ok(check) => check,
                    Err(e) => {
                        // Clean up this call's earlier admissions before
                        // surfacing the store error.
                        self.rollback(&admissions).await;
                        return Err(e);
                    }
                }
            } else {
                match window::probe(&self.store, &key, limit_type, spec, effective_weight, now).await
                {
                    Ok(check) => check,
                    Err(e) => {
                        self.rollback(&admissions).await;
                        return Err(e);
                    }
                }
            };

            if check.admitted {
                if admissions.is_empty() && rejectors.is_empty() {
                    first_load = check.load;
                }
                if let Some(member) = check.member {
                    admissions.push((key, member));
                }
            } else {
                rejectors.push((limit_type, spec, check));
            }
        }

        if rejectors.is_empty() {
            return Ok(Decision {
                admitted: true,
                wait: 0.0,
                binding: None,
                load: first_load,
            });
        }

        self.rollback(&admissions).await;

        let (limit_type, spec, check) = rejectors
            .into_iter()
            .max_by(|a, b| a.2.wait.total_cmp(&b.2.wait))
            .expect("at least one rejector");

        Ok(Decision {
            admitted: false,
            wait: check.wait,
            binding: Some((limit_type, spec)),
            load: check.load,
        })
    }

    /// Best-effort removal of this call's admissions. A failed removal leaves
    /// the entry counting toward future load until it ages out: safe but
    /// slightly conservative.
    async fn rollback(&self, admissions: &[(String, String)]) {
        for (key, member) in admissions {
            match self.store.remove(key, member).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("manager: rollback member already gone, key={}", key);
                }
                Err(e) => {
                    warn!("manager: rollback failed, key={}, error={}", key, e);
                    metrics::counter!("limiter_rollback_failures_total").increment(1);
                }
            }
        }
    }

    /// Current usage snapshot for one resource key.
    pub async fn status(&self, base_key: &str, resource: &str) -> Result<ResourceStatus, LimiterError> {
        let now = clock::now_secs();
        let Some(entry) = self.resources.get(resource).map(|e| e.value().clone()) else {
            return Ok(ResourceStatus {
                resource_key: base_key.to_string(),
                configuration: ResourceLimitSet::default(),
                current_usage: BTreeMap::new(),
                oldest_timestamp: None,
                sleep_time_hint: 0.0,
            });
        };

        let mut usage = BTreeMap::new();
        let mut oldest: Option<f64> = None;
        let mut hint: f64 = 0.0;

        for &(limit_type, spec) in &entry.active {
            let key = format!("{}:{}", base_key, limit_type.suffix());
            let unit_weights = limit_type.kind() == LimitKind::Request;
            let view = self.store.peek(&key, now - spec.window, unit_weights).await?;

            usage.insert(
                limit_type.as_str(),
                LimitUsage {
                    current: view.load,
                    limit: spec.limit,
                },
            );

            oldest = match (oldest, view.oldest) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            // A unit-weight call would block on this limit right now.
            if view.load + 1.0 > spec.limit {
                if let Some(t0) = view.oldest {
                    hint = hint.max((t0 + spec.window - now).max(0.0));
                }
            }
        }

        Ok(ResourceStatus {
            resource_key: base_key.to_string(),
            configuration: entry.configuration.clone(),
            current_usage: usage,
            oldest_timestamp: oldest,
            sleep_time_hint: hint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> ResourceManager {
        ResourceManager::new(Arc::new(SeriesStore::Memory(MemoryStore::new())))
    }

    fn limits(rps: Option<f64>, rpm: Option<f64>, tps: Option<f64>) -> ResourceLimitSet {
        ResourceLimitSet {
            requests_per_second: rps,
            requests_per_minute: rpm,
            requests_per_hour: None,
            tokens_per_second: tps,
            tokens_per_minute: None,
        }
    }

    #[tokio::test]
    async fn unconfigured_resource_admits() {
        let m = manager();
        let d = m.check("ghost", "ghost", 1.0, 0.0).await.unwrap();
        assert!(d.admitted);
        assert_eq!(d.load, 0.0);
    }

    #[tokio::test]
    async fn binding_limit_is_the_longest_wait() {
        let m = manager();
        m.configure("user", limits(Some(5.0), Some(10.0), None));

        // Five admissions at t=0 fill the second window, half the minute one.
        for i in 0..5 {
            let d = m
                .check("user_bob", "user", 1.0, i as f64 * 0.01)
                .await
                .unwrap();
            assert!(d.admitted, "call {} should admit", i);
        }

        // Sixth call: rps rejects (wait ~1s), rpm still has headroom.
        let d = m.check("user_bob", "user", 1.0, 0.05).await.unwrap();
        assert!(!d.admitted);
        let (lt, _) = d.binding.unwrap();
        assert_eq!(lt, LimitType::RequestsPerSecond);
        assert!(d.wait > 0.9 && d.wait <= 1.0);

        // Second window turns over; five more admissions fill the minute.
        for i in 0..5 {
            let d = m
                .check("user_bob", "user", 1.0, 1.1 + i as f64 * 0.01)
                .await
                .unwrap();
            assert!(d.admitted, "second-window call {} should admit", i);
        }

        // Both limits now reject; rpm demands the longer wait and binds.
        let d = m.check("user_bob", "user", 1.0, 1.2).await.unwrap();
        assert!(!d.admitted);
        let (lt, spec) = d.binding.unwrap();
        assert_eq!(lt, LimitType::RequestsPerMinute);
        assert_eq!(spec.window, 60.0);
        // Oldest rpm entry is at ~0.0, so the wait is just short of 60s.
        assert!(d.wait > 58.0 && d.wait <= 60.0);
        assert_eq!(d.load, 10.0);
    }

    #[tokio::test]
    async fn rejected_call_rolls_back_earlier_admissions() {
        let m = manager();
        m.configure("x", limits(Some(10.0), Some(1.0), None));

        // Timestamps track the real clock so `status` (which prunes by the
        // current window) still sees these entries.
        let t0 = clock::now_secs();
        let d = m.check("x", "x", 1.0, t0).await.unwrap();
        assert!(d.admitted);

        // Second call: rps admits, rpm rejects; the rps entry is removed.
        let d = m.check("x", "x", 1.0, t0 + 0.01).await.unwrap();
        assert!(!d.admitted);
        assert_eq!(d.binding.unwrap().0, LimitType::RequestsPerMinute);

        let status = m.status("x", "x").await.unwrap();
        let rps = &status.current_usage["requests_per_second"];
        assert_eq!(rps.current, 1.0, "only the first call's entry remains");
        let rpm = &status.current_usage["requests_per_minute"];
        assert_eq!(rpm.current, 1.0);
    }

    #[tokio::test]
    async fn weight_counts_against_token_limits_only() {
        let m = manager();
        m.configure("llm", limits(Some(100.0), None, Some(100.0)));

        // Three weighted calls: request side counts 3, token side 120 > 100.
        let t0 = clock::now_secs();
        assert!(m.check("llm", "llm", 40.0, t0).await.unwrap().admitted);
        assert!(m.check("llm", "llm", 40.0, t0 + 0.1).await.unwrap().admitted);
        let d = m.check("llm", "llm", 40.0, t0 + 0.2).await.unwrap();
        assert!(!d.admitted);
        let (lt, _) = d.binding.unwrap();
        assert_eq!(lt, LimitType::TokensPerSecond);
        assert!((d.wait - 0.8).abs() < 1e-9);

        let status = m.status("llm", "llm").await.unwrap();
        assert_eq!(status.current_usage["requests_per_second"].current, 2.0);
        assert_eq!(status.current_usage["tokens_per_second"].current, 80.0);
    }

    #[tokio::test]
    async fn reconfigure_deactivates_and_keeps_series() {
        let m = manager();
        m.configure("r", limits(Some(1.0), None, None));
        let t0 = clock::now_secs();
        assert!(m.check("r", "r", 1.0, t0).await.unwrap().admitted);
        assert!(!m.check("r", "r", 1.0, t0 + 0.1).await.unwrap().admitted);

        // Deactivate rps: calls pass freely.
        m.configure("r", limits(Some(0.0), None, None));
        assert!(m.check("r", "r", 1.0, t0 + 0.2).await.unwrap().admitted);
        assert_eq!(m.widest_window("r"), 0.0);

        // Re-enable: the first admission is still inside the window.
        m.configure("r", limits(Some(2.0), None, None));
        let status = m.status("r", "r").await.unwrap();
        assert_eq!(status.current_usage["requests_per_second"].current, 1.0);
    }

    #[tokio::test]
    async fn key_isolation_across_users() {
        let m = manager();
        m.configure("user", limits(Some(2.0), None, None));

        for i in 0..2 {
            let t = i as f64 * 0.01;
            assert!(m.check("user_alice", "user", 1.0, t).await.unwrap().admitted);
            assert!(m.check("user_bob", "user", 1.0, t).await.unwrap().admitted);
        }
        assert!(!m.check("user_alice", "user", 1.0, 0.05).await.unwrap().admitted);
        assert!(!m.check("user_bob", "user", 1.0, 0.05).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn status_reports_hint_when_saturated() {
        let m = manager();
        m.configure("user", limits(Some(1.0), None, None));
        m.check("user", "user", 1.0, clock::now_secs()).await.unwrap();

        let status = m.status("user", "user").await.unwrap();
        assert!(status.sleep_time_hint > 0.0 && status.sleep_time_hint <= 1.0);
        assert!(status.oldest_timestamp.is_some());
        assert_eq!(status.configuration.requests_per_second, Some(1.0));
    }
}
