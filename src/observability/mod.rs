//! Metrics registry and correlated logging context.
//!
//! Grounded on `enterprise::tracing::{metrics, span, correlation}`: a small
//! Prometheus-flavored counter/gauge/histogram registry plus a span type that
//! carries the kernel's correlation fields through `tracing`.

pub mod metrics;
pub mod span;

pub use metrics::{Counter, Gauge, Histogram, MetricRegistry};
pub use span::CorrelatedSpan;

/// Pre-registered metric series the kernel emits. Registering these by name
/// up front (in `SyncServer::new`, mirroring the teacher's `MetricRegistry`
/// construction) means every deployment scrapes the same series whether or
/// not the code path that increments them has run yet.
pub mod series {
    /// Counter: fail-closed decisions, labeled by `reason`.
    pub const FAIL_CLOSED_TOTAL: &str = "lfcc_fail_closed_total";
    /// Counter: messages rejected by structural validation, labeled by `source`.
    pub const SYNC_INVALID_MESSAGES_TOTAL: &str = "lfcc_sync_invalid_messages_total";
    /// Counter: handshake failures, labeled by `reason`.
    pub const SYNC_HANDSHAKE_FAILURES_TOTAL: &str = "lfcc_sync_handshake_failures_total";
    /// Histogram: time to apply an update to storage, in milliseconds.
    pub const UPDATE_APPLY_LATENCY_MS: &str = "lfcc_update_apply_latency_ms";
    /// Counter: frontier verification outcomes, labeled by `outcome`.
    pub const VERIFICATION_OUTCOME_TOTAL: &str = "lfcc_verification_outcome_total";
    /// Counter: conflict-triggered client retries, labeled by `doc_id`.
    pub const CONFLICT_RETRY_TOTAL: &str = "lfcc_conflict_retry_total";
    /// Histogram: wire payload mapping/(de)serialization duration, in milliseconds.
    pub const MAPPING_DURATION_MS: &str = "lfcc_mapping_duration_ms";
}
