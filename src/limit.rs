use serde::{Deserialize, Serialize};

/// What an entry's weight counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Every admission counts 1 regardless of caller weight.
    Request,
    /// Every admission counts the caller-supplied weight.
    Token,
}

/// The five limit types a resource can carry, in evaluation order.
///
/// Evaluation goes tightest-window first so the common rejection happens
/// before any admissions that would need rolling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    RequestsPerSecond,
    RequestsPerMinute,
    RequestsPerHour,
    TokensPerSecond,
    TokensPerMinute,
}

impl LimitType {
    pub const ORDERED: [LimitType; 5] = [
        LimitType::RequestsPerSecond,
        LimitType::RequestsPerMinute,
        LimitType::RequestsPerHour,
        LimitType::TokensPerSecond,
        LimitType::TokensPerMinute,
    ];

    /// Series-key suffix. Part of the shared-store compatibility surface.
    pub fn suffix(self) -> &'static str {
        match self {
            LimitType::RequestsPerSecond => "rps",
            LimitType::RequestsPerMinute => "rpm",
            LimitType::RequestsPerHour => "rph",
            LimitType::TokensPerSecond => "tps",
            LimitType::TokensPerMinute => "tpm",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LimitType::RequestsPerSecond => "requests_per_second",
            LimitType::RequestsPerMinute => "requests_per_minute",
            LimitType::RequestsPerHour => "requests_per_hour",
            LimitType::TokensPerSecond => "tokens_per_second",
            LimitType::TokensPerMinute => "tokens_per_minute",
        }
    }

    pub fn window_secs(self) -> f64 {
        match self {
            LimitType::RequestsPerSecond | LimitType::TokensPerSecond => 1.0,
            LimitType::RequestsPerMinute | LimitType::TokensPerMinute => 60.0,
            LimitType::RequestsPerHour => 3600.0,
        }
    }

    pub fn kind(self) -> LimitKind {
        match self {
            LimitType::RequestsPerSecond
            | LimitType::RequestsPerMinute
            | LimitType::RequestsPerHour => LimitKind::Request,
            LimitType::TokensPerSecond | LimitType::TokensPerMinute => LimitKind::Token,
        }
    }
}

/// One active limit: at most `limit` cumulative weight inside any window of
/// `window` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitSpec {
    pub limit: f64,
    pub window: f64,
}

impl LimitSpec {
    pub fn for_type(limit_type: LimitType, limit: f64) -> Self {
        Self {
            limit,
            window: limit_type.window_secs(),
        }
    }
}

/// Per-resource limit configuration as callers (and the config file) supply
/// it. Absent or non-positive values deactivate the limit type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimitSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<f64>,
}

impl ResourceLimitSet {
    fn raw(&self, limit_type: LimitType) -> Option<f64> {
        match limit_type {
            LimitType::RequestsPerSecond => self.requests_per_second,
            LimitType::RequestsPerMinute => self.requests_per_minute,
            LimitType::RequestsPerHour => self.requests_per_hour,
            LimitType::TokensPerSecond => self.tokens_per_second,
            LimitType::TokensPerMinute => self.tokens_per_minute,
        }
    }

    /// Active limits in evaluation order. Non-positive and non-finite values
    /// normalize to inactive.
    pub fn active(&self) -> Vec<(LimitType, LimitSpec)> {
        LimitType::ORDERED
            .iter()
            .filter_map(|&lt| match self.raw(lt) {
                Some(n) if n > 0.0 && n.is_finite() => Some((lt, LimitSpec::for_type(lt, n))),
                _ => None,
            })
            .collect()
    }

    /// The same set with inactive values dropped, as `status` reports it.
    pub fn normalized(&self) -> Self {
        let keep = |v: Option<f64>| v.filter(|n| *n > 0.0 && n.is_finite());
        Self {
            requests_per_second: keep(self.requests_per_second),
            requests_per_minute: keep(self.requests_per_minute),
            requests_per_hour: keep(self.requests_per_hour),
            tokens_per_second: keep(self.tokens_per_second),
            tokens_per_minute: keep(self.tokens_per_minute),
        }
    }
}
