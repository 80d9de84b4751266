//! Admit/sleep coordinator, the crate's top-level entry point.
//!
//! `acquire` consults the resource manager, sleeps out reported waits, and
//! returns one Outcome per call. The total wait is bounded by the widest
//! window configured on the resource; a caller-supplied deadline turns
//! blocking into immediate return, and a cancellation token is honored at
//! every sleep boundary and before each retry.

use crate::clock;
use crate::error::LimiterError;
use crate::limit::{LimitSpec, LimitType, ResourceLimitSet};
use crate::manager::{ResourceManager, ResourceStatus};
use crate::store::SeriesStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Admitted,
    RateLimited,
    Exhausted,
    BackendError,
    Cancelled,
}

/// One record per `acquire` call. The shape is stable: log pipelines and any
/// HTTP adapter serialize it as-is.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub resource_key: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<LimitType>,

    /// Binding limit's maximum cumulative weight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,

    /// Binding limit's window in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<f64>,

    pub wait: f64,
    pub load: f64,
    pub backend: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full-control variant of `acquire`.
pub struct AcquireRequest<'a> {
    pub resource: &'a str,
    pub user_id: Option<&'a str>,
    /// Counts against token limits; request limits always count 1.
    pub weight: f64,
    /// Latest instant the call may still be sleeping. `None` blocks up to the
    /// widest configured window; a deadline already in the past makes
    /// rejection immediate.
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl<'a> AcquireRequest<'a> {
    pub fn new(resource: &'a str) -> Self {
        Self {
            resource,
            user_id: None,
            weight: 1.0,
            deadline: None,
            cancel: None,
        }
    }

    pub fn user(mut self, user_id: &'a str) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Diagnostics snapshot for the storage backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub variant: &'static str,
    pub connection_state: String,
    pub key_count: usize,
    pub approximate_memory_bytes: u64,
}

pub struct QuotaGate {
    manager: ResourceManager,
}

impl QuotaGate {
    pub fn new(store: SeriesStore) -> Self {
        Self::with_store(Arc::new(store))
    }

    pub fn with_store(store: Arc<SeriesStore>) -> Self {
        Self {
            manager: ResourceManager::new(store),
        }
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    pub fn store(&self) -> &Arc<SeriesStore> {
        self.manager.store()
    }

    /// Install or replace the limit set for a resource. Idempotent.
    pub fn configure(&self, resource: &str, limits: ResourceLimitSet) {
        self.manager.configure(resource, limits);
    }

    /// Block-and-retry acquisition: sleeps out waits until admitted, the
    /// widest-window budget is spent, or the backend fails.
    pub async fn acquire(
        &self,
        resource: &str,
        user_id: Option<&str>,
        weight: f64,
    ) -> Result<Outcome, LimiterError> {
        let mut request = AcquireRequest::new(resource).weight(weight);
        request.user_id = user_id;
        self.acquire_with(request).await
    }

    /// Immediate-return acquisition: a rejected call reports `rate_limited`
    /// with its wait instead of sleeping.
    pub async fn try_acquire(
        &self,
        resource: &str,
        user_id: Option<&str>,
        weight: f64,
    ) -> Result<Outcome, LimiterError> {
        let mut request = AcquireRequest::new(resource)
            .weight(weight)
            .deadline(Instant::now());
        request.user_id = user_id;
        self.acquire_with(request).await
    }

    pub async fn acquire_with(&self, request: AcquireRequest<'_>) -> Result<Outcome, LimiterError> {
        if !(request.weight > 0.0) || !request.weight.is_finite() {
            return Err(LimiterError::InvalidArgument(format!(
                "weight must be a positive finite number, got {}",
                request.weight
            )));
        }

        let resource_key = match request.user_id {
            Some(user) => format!("{}_{}", request.resource, user),
            None => request.resource.to_string(),
        };
        let backend = self.store().backend_name();
        let budget = self.manager.widest_window(request.resource);
        let started = Instant::now();

        loop {
            if let Some(ref token) = request.cancel {
                if token.is_cancelled() {
                    return Ok(self.terminal(cancelled(&resource_key, started, backend)));
                }
            }

            let now = clock::now_secs();
            let decision = match self
                .manager
                .check(&resource_key, request.resource, request.weight, now)
                .await
            {
                Ok(decision) => decision,
                Err(e @ LimiterError::InvalidArgument(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "acquire: backend error, key={}, backend={}, error={}",
                        resource_key, backend, e
                    );
                    return Ok(self.terminal(Outcome {
                        status: OutcomeStatus::BackendError,
                        resource_key,
                        limit_type: None,
                        limit: None,
                        window: None,
                        wait: started.elapsed().as_secs_f64(),
                        load: 0.0,
                        backend,
                        error: Some(e.to_string()),
                    }));
                }
            };

            if decision.admitted {
                info!(
                    "acquire: admitted, key={}, load={}, backend={}",
                    resource_key, decision.load, backend
                );
                return Ok(self.terminal(Outcome {
                    status: OutcomeStatus::Admitted,
                    resource_key,
                    limit_type: None,
                    limit: None,
                    window: None,
                    wait: 0.0,
                    load: decision.load,
                    backend,
                    error: None,
                }));
            }

            let (limit_type, spec) = decision
                .binding
                .map(|(lt, spec)| (Some(lt), Some(spec)))
                .unwrap_or((None, None));
            let elapsed = started.elapsed().as_secs_f64();

            // Total wait is bounded by the widest configured window.
            if elapsed > budget {
                info!(
                    "acquire: exhausted, key={}, elapsed={:.3}s, budget={:.3}s, backend={}",
                    resource_key, elapsed, budget, backend
                );
                return Ok(self.terminal(rejected(
                    OutcomeStatus::Exhausted,
                    &resource_key,
                    limit_type,
                    spec,
                    elapsed,
                    decision.load,
                    backend,
                )));
            }

            // A deadline the sleep would overrun means the caller wants the
            // wait reported, not slept.
            if let Some(deadline) = request.deadline {
                let wakes_at = Instant::now() + Duration::from_secs_f64(decision.wait);
                if wakes_at > deadline {
                    info!(
                        "acquire: rate limited, key={}, limit_type={}, wait={:.3}s, load={}, backend={}",
                        resource_key,
                        limit_type.map(LimitType::as_str).unwrap_or("none"),
                        decision.wait,
                        decision.load,
                        backend
                    );
                    return Ok(self.terminal(rejected(
                        OutcomeStatus::RateLimited,
                        &resource_key,
                        limit_type,
                        spec,
                        decision.wait,
                        decision.load,
                        backend,
                    )));
                }
            }

            debug!(
                "acquire: sleeping, key={}, limit_type={}, limit={:?}, window={:?}, wait={:.3}s, load={}, backend={}",
                resource_key,
                limit_type.map(LimitType::as_str).unwrap_or("none"),
                spec.map(|s| s.limit),
                spec.map(|s| s.window),
                decision.wait,
                decision.load,
                backend
            );
            metrics::histogram!("limiter_sleep_duration_seconds").record(decision.wait);

            let sleep = tokio::time::sleep(Duration::from_secs_f64(decision.wait));
            match request.cancel {
                Some(ref token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Ok(self.terminal(cancelled(&resource_key, started, backend)));
                        }
                        _ = sleep => {}
                    }
                }
                None => sleep.await,
            }
        }
    }

    /// Usage snapshot for one resource key.
    pub async fn status(
        &self,
        resource: &str,
        user_id: Option<&str>,
    ) -> Result<ResourceStatus, LimiterError> {
        let resource_key = match user_id {
            Some(user) => format!("{}_{}", resource, user),
            None => resource.to_string(),
        };
        self.manager.status(&resource_key, resource).await
    }

    /// Backend diagnostics. Infallible: reachability problems land in
    /// `connection_state` instead of an error.
    pub async fn backend_info(&self) -> BackendInfo {
        let store = self.store();
        let variant = store.backend_name();

        let connection_state = match store.ping().await {
            Ok(()) => "connected".to_string(),
            Err(e) => format!("unreachable: {}", e),
        };

        let key_count = store.all_keys().await.map(|k| k.len()).unwrap_or(0);
        let approximate_memory_bytes = store.report_memory().await.unwrap_or(0);

        BackendInfo {
            variant,
            connection_state,
            key_count,
            approximate_memory_bytes,
        }
    }

    fn terminal(&self, outcome: Outcome) -> Outcome {
        let status = match outcome.status {
            OutcomeStatus::Admitted => "admitted",
            OutcomeStatus::RateLimited => "rate_limited",
            OutcomeStatus::Exhausted => "exhausted",
            OutcomeStatus::BackendError => "backend_error",
            OutcomeStatus::Cancelled => "cancelled",
        };
        metrics::counter!("limiter_acquire_total", "status" => status).increment(1);
        outcome
    }
}

fn rejected(
    status: OutcomeStatus,
    resource_key: &str,
    limit_type: Option<LimitType>,
    spec: Option<LimitSpec>,
    wait: f64,
    load: f64,
    backend: &'static str,
) -> Outcome {
    Outcome {
        status,
        resource_key: resource_key.to_string(),
        limit_type,
        limit: spec.map(|s| s.limit),
        window: spec.map(|s| s.window),
        wait,
        load,
        backend,
        error: None,
    }
}

fn cancelled(resource_key: &str, started: Instant, backend: &'static str) -> Outcome {
    info!(
        "acquire: cancelled, key={}, elapsed={:.3}s, backend={}",
        resource_key,
        started.elapsed().as_secs_f64(),
        backend
    );
    Outcome {
        status: OutcomeStatus::Cancelled,
        resource_key: resource_key.to_string(),
        limit_type: None,
        limit: None,
        window: None,
        wait: started.elapsed().as_secs_f64(),
        load: 0.0,
        backend,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn gate() -> QuotaGate {
        QuotaGate::new(SeriesStore::Memory(MemoryStore::new()))
    }

    fn rps(limit: f64) -> ResourceLimitSet {
        ResourceLimitSet {
            requests_per_second: Some(limit),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unconfigured_resource_admits_immediately() {
        let g = gate();
        let outcome = g.acquire("anything", None, 1.0).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Admitted);
        assert_eq!(outcome.wait, 0.0);
        assert_eq!(outcome.resource_key, "anything");
    }

    #[tokio::test]
    async fn user_id_namespaces_the_key() {
        let g = gate();
        g.configure("user", rps(1.0));

        let a = g.try_acquire("user", Some("alice"), 1.0).await.unwrap();
        assert_eq!(a.status, OutcomeStatus::Admitted);
        assert_eq!(a.resource_key, "user_alice");

        // Bob's window is untouched by Alice's admission.
        let b = g.try_acquire("user", Some("bob"), 1.0).await.unwrap();
        assert_eq!(b.status, OutcomeStatus::Admitted);

        let a2 = g.try_acquire("user", Some("alice"), 1.0).await.unwrap();
        assert_eq!(a2.status, OutcomeStatus::RateLimited);
        assert_eq!(a2.limit_type, Some(LimitType::RequestsPerSecond));
        assert!(a2.wait > 0.0 && a2.wait <= 1.0);
    }

    #[tokio::test]
    async fn blocking_acquire_sleeps_out_the_window() {
        let g = gate();
        g.configure("api", rps(1.0));

        assert_eq!(
            g.acquire("api", None, 1.0).await.unwrap().status,
            OutcomeStatus::Admitted
        );

        let started = Instant::now();
        let second = g.acquire("api", None, 1.0).await.unwrap();
        assert_eq!(second.status, OutcomeStatus::Admitted);
        // Admission required sleeping out most of the one-second window.
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test]
    async fn oversized_weight_exhausts_without_recording() {
        let g = gate();
        let limits = ResourceLimitSet {
            tokens_per_second: Some(5.0),
            ..Default::default()
        };
        g.configure("llm", limits);

        let outcome = g.try_acquire("llm", None, 6.0).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::RateLimited);
        assert!(outcome.wait <= 1.0);

        let blocking = g.acquire("llm", None, 6.0).await.unwrap();
        assert_eq!(blocking.status, OutcomeStatus::Exhausted);

        let status = g.status("llm", None).await.unwrap();
        assert_eq!(status.current_usage["tokens_per_second"].current, 0.0);
    }

    #[tokio::test]
    async fn cancellation_is_honored_mid_sleep() {
        let g = Arc::new(gate());
        g.configure("api", rps(1.0));
        g.acquire("api", None, 1.0).await.unwrap();

        let token = CancellationToken::new();
        let handle = {
            let g = g.clone();
            let token = token.clone();
            tokio::spawn(async move {
                g.acquire_with(AcquireRequest::new("api").cancel(token)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Cancelled);
        assert!(outcome.wait < 1.0);
    }

    #[tokio::test]
    async fn pre_cancelled_token_returns_without_store_writes() {
        let g = gate();
        g.configure("api", rps(5.0));

        let token = CancellationToken::new();
        token.cancel();
        let outcome = g
            .acquire_with(AcquireRequest::new("api").cancel(token))
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Cancelled);

        let status = g.status("api", None).await.unwrap();
        assert_eq!(status.current_usage["requests_per_second"].current, 0.0);
    }

    #[tokio::test]
    async fn invalid_weight_is_rejected_upfront() {
        let g = gate();
        g.configure("api", rps(5.0));

        assert!(g.acquire("api", None, 0.0).await.is_err());
        assert!(g.acquire("api", None, -1.0).await.is_err());
        assert!(g.acquire("api", None, f64::NAN).await.is_err());
    }

    #[tokio::test]
    async fn outcome_serializes_with_stable_shape() {
        let g = gate();
        g.configure("user", rps(1.0));
        g.try_acquire("user", Some("bob"), 1.0).await.unwrap();
        let outcome = g.try_acquire("user", Some("bob"), 1.0).await.unwrap();

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "rate_limited");
        assert_eq!(json["resource_key"], "user_bob");
        assert_eq!(json["limit_type"], "requests_per_second");
        assert_eq!(json["limit"], 1.0);
        assert_eq!(json["window"], 1.0);
        assert_eq!(json["backend"], "memory");
        assert!(json["wait"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn backend_info_reports_memory_variant() {
        let g = gate();
        g.configure("api", rps(5.0));
        g.acquire("api", None, 1.0).await.unwrap();

        let info = g.backend_info().await;
        assert_eq!(info.variant, "memory");
        assert_eq!(info.connection_state, "connected");
        assert_eq!(info.key_count, 1);
        assert!(info.approximate_memory_bytes > 0);
    }
}
