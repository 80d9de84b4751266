//! Sliding-window admission for one series.
//!
//! The store does the atomic prune + weigh + append; this module owns the
//! window arithmetic: cutoff placement, the wait-until-relief formula, and
//! the oversized-weight edge.

use crate::error::LimiterError;
use crate::limit::{LimitKind, LimitSpec, LimitType};
use crate::store::SeriesStore;

/// Outcome of one limit check against one series.
#[derive(Debug, Clone)]
pub struct WindowCheck {
    pub admitted: bool,
    /// Minimum seconds until the series frees the next slot. Zero when
    /// admitted; also zero on the transient empty-series rejection, which
    /// callers treat as "retry immediately".
    pub wait: f64,
    /// Weight sum inside the window after this check.
    pub load: f64,
    /// Rollback token for the appended entry; present iff admitted.
    pub member: Option<String>,
}

/// Admit `(now, weight)` into `key` if the window has headroom, else report
/// the minimum wait.
///
/// The wait is `oldest + window - now`: the instant the oldest entry leaves
/// the window and the load drops by that entry's weight. That is the smallest
/// possible relief, so a caller sleeping this long is guaranteed progress but
/// not admission, so it must re-check.
pub async fn check_and_admit(
    store: &SeriesStore,
    key: &str,
    limit_type: LimitType,
    spec: LimitSpec,
    weight: f64,
    now: f64,
) -> Result<WindowCheck, LimiterError> {
    let unit_weights = limit_type.kind() == LimitKind::Request;
    let cutoff = now - spec.window;

    // A weight that exceeds the whole budget can never be admitted; record
    // nothing and report a full-window wait so callers can detect and fail.
    if weight > spec.limit {
        let view = store.peek(key, cutoff, unit_weights).await?;
        return Ok(WindowCheck {
            admitted: false,
            wait: spec.window,
            load: view.load,
            member: None,
        });
    }

    let reservation = store
        .reserve(key, cutoff, now, weight, spec.limit, unit_weights)
        .await?;

    if reservation.admitted {
        Ok(WindowCheck {
            admitted: true,
            wait: 0.0,
            load: reservation.load,
            member: reservation.member,
        })
    } else {
        Ok(WindowCheck {
            admitted: false,
            wait: wait_for_relief(reservation.oldest, spec.window, now),
            load: reservation.load,
            member: None,
        })
    }
}

/// Read-only variant: report whether `(now, weight)` would be admitted,
/// without appending. Used once an earlier limit has already rejected the
/// call, so later limits contribute their waits without creating admissions
/// that would immediately need rolling back.
pub async fn probe(
    store: &SeriesStore,
    key: &str,
    limit_type: LimitType,
    spec: LimitSpec,
    weight: f64,
    now: f64,
) -> Result<WindowCheck, LimiterError> {
    let unit_weights = limit_type.kind() == LimitKind::Request;
    let cutoff = now - spec.window;
    let view = store.peek(key, cutoff, unit_weights).await?;

    if weight > spec.limit {
        return Ok(WindowCheck {
            admitted: false,
            wait: spec.window,
            load: view.load,
            member: None,
        });
    }

    if view.load + weight <= spec.limit {
        Ok(WindowCheck {
            admitted: true,
            wait: 0.0,
            load: view.load,
            member: None,
        })
    } else {
        Ok(WindowCheck {
            admitted: false,
            wait: wait_for_relief(view.oldest, spec.window, now),
            load: view.load,
            member: None,
        })
    }
}

fn wait_for_relief(oldest: Option<f64>, window: f64, now: f64) -> f64 {
    match oldest {
        Some(t0) => (t0 + window - now).max(0.0),
        // Another admitter freed the series between the load check and the
        // oldest peek; retry immediately.
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SeriesStore};

    fn memory_store() -> SeriesStore {
        SeriesStore::Memory(MemoryStore::new())
    }

    #[tokio::test]
    async fn admits_then_rejects_with_wait() {
        let store = memory_store();
        let spec = LimitSpec::for_type(LimitType::RequestsPerSecond, 2.0);

        let a = check_and_admit(&store, "u:rps", LimitType::RequestsPerSecond, spec, 1.0, 100.0)
            .await
            .unwrap();
        assert!(a.admitted);
        assert_eq!(a.wait, 0.0);
        assert_eq!(a.load, 1.0);
        assert!(a.member.is_some());

        let b = check_and_admit(&store, "u:rps", LimitType::RequestsPerSecond, spec, 1.0, 100.2)
            .await
            .unwrap();
        assert!(b.admitted);

        let c = check_and_admit(&store, "u:rps", LimitType::RequestsPerSecond, spec, 1.0, 100.4)
            .await
            .unwrap();
        assert!(!c.admitted);
        assert_eq!(c.load, 2.0);
        // Oldest entry at 100.0 leaves the window at 101.0.
        assert!((c.wait - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn window_turnover_frees_slots() {
        let store = memory_store();
        let spec = LimitSpec::for_type(LimitType::RequestsPerSecond, 1.0);
        let lt = LimitType::RequestsPerSecond;

        assert!(check_and_admit(&store, "k", lt, spec, 1.0, 50.0)
            .await
            .unwrap()
            .admitted);
        assert!(!check_and_admit(&store, "k", lt, spec, 1.0, 50.5)
            .await
            .unwrap()
            .admitted);
        // 51.1 is past 50.0 + 1.0: the old entry is pruned.
        let again = check_and_admit(&store, "k", lt, spec, 1.0, 51.1).await.unwrap();
        assert!(again.admitted);
        assert_eq!(again.load, 1.0);
    }

    #[tokio::test]
    async fn weighted_admissions_accumulate() {
        let store = memory_store();
        let spec = LimitSpec::for_type(LimitType::TokensPerSecond, 100.0);
        let lt = LimitType::TokensPerSecond;

        assert!(check_and_admit(&store, "llm:tps", lt, spec, 40.0, 0.0)
            .await
            .unwrap()
            .admitted);
        assert!(check_and_admit(&store, "llm:tps", lt, spec, 40.0, 0.1)
            .await
            .unwrap()
            .admitted);

        let third = check_and_admit(&store, "llm:tps", lt, spec, 40.0, 0.2)
            .await
            .unwrap();
        assert!(!third.admitted);
        assert_eq!(third.load, 80.0);
        // First entry leaves at 1.0; we are at 0.2.
        assert!((third.wait - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn oversized_weight_records_nothing() {
        let store = memory_store();
        let spec = LimitSpec::for_type(LimitType::TokensPerSecond, 5.0);
        let lt = LimitType::TokensPerSecond;

        for _ in 0..3 {
            let check = check_and_admit(&store, "big:tps", lt, spec, 6.0, 10.0)
                .await
                .unwrap();
            assert!(!check.admitted);
            assert_eq!(check.wait, spec.window);
            assert_eq!(check.load, 0.0);
        }
        assert!(store.all_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn probe_never_mutates() {
        let store = memory_store();
        let spec = LimitSpec::for_type(LimitType::RequestsPerMinute, 10.0);
        let lt = LimitType::RequestsPerMinute;

        let p = probe(&store, "q:rpm", lt, spec, 1.0, 0.0).await.unwrap();
        assert!(p.admitted);
        assert_eq!(p.load, 0.0);

        check_and_admit(&store, "q:rpm", lt, spec, 1.0, 0.0)
            .await
            .unwrap();
        let p = probe(&store, "q:rpm", lt, spec, 1.0, 0.1).await.unwrap();
        assert!(p.admitted);
        assert_eq!(p.load, 1.0);

        // Probing does not append: load is unchanged after many probes.
        for _ in 0..5 {
            probe(&store, "q:rpm", lt, spec, 1.0, 0.2).await.unwrap();
        }
        let view = store.peek("q:rpm", 0.0, true).await.unwrap();
        assert_eq!(view.load, 1.0);
    }

    #[tokio::test]
    async fn probe_reports_binding_wait_when_full() {
        let store = memory_store();
        let spec = LimitSpec::for_type(LimitType::RequestsPerMinute, 1.0);
        let lt = LimitType::RequestsPerMinute;

        check_and_admit(&store, "w:rpm", lt, spec, 1.0, 100.0)
            .await
            .unwrap();
        let p = probe(&store, "w:rpm", lt, spec, 1.0, 110.0).await.unwrap();
        assert!(!p.admitted);
        assert!((p.wait - 50.0).abs() < 1e-9);
    }
}
