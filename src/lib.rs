//! Per-resource request quotas enforced by a precise sliding-window counter.
//!
//! Each resource carries up to five limits (requests per second / minute /
//! hour, tokens per second / minute); a call is admitted only when every
//! active limit has headroom, and a rejected call learns the minimum wait
//! until the binding limit frees a slot. Series state lives either in
//! process-local memory or in a shared Redis store, where one Lua script
//! keeps concurrent admissions linearizable per key.
//!
//! ```no_run
//! use quotagate::{QuotaGate, ResourceLimitSet};
//! use quotagate::store::{MemoryStore, SeriesStore};
//!
//! # async fn demo() -> Result<(), quotagate::LimiterError> {
//! let gate = QuotaGate::new(SeriesStore::Memory(MemoryStore::new()));
//! gate.configure(
//!     "user",
//!     ResourceLimitSet {
//!         requests_per_second: Some(5.0),
//!         requests_per_minute: Some(100.0),
//!         ..Default::default()
//!     },
//! );
//!
//! let outcome = gate.acquire("user", Some("alice"), 1.0).await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod limit;
pub mod manager;
pub mod metrics;
pub mod server;
pub mod store;
pub mod window;

pub use error::LimiterError;
pub use gate::{AcquireRequest, BackendInfo, Outcome, OutcomeStatus, QuotaGate};
pub use limit::{LimitSpec, LimitType, ResourceLimitSet};
pub use manager::{ResourceManager, ResourceStatus};
