//! Metrics registry for gateway observability
//!
//! Provides OpenTelemetry instruments for:
//! - Cluster client pool (constructions, invalidations, cached clients)
//! - Resource proxy (upstream calls and latency)
//! - Stream bridge sessions (opened, closed, active)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

/// Global meter for gateway metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("kubegate"));

// ============================================================================
// Cluster Client Pool Metrics
// ============================================================================

/// Counter of client constructions (including the health probe)
///
/// Labels:
/// - `result`: success, not_found, unreachable
pub static CLIENT_CONSTRUCTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubegate_client_constructions_total")
        .with_description("Total number of cluster client constructions")
        .with_unit("{constructions}")
        .build()
});

/// Counter of client invalidations
///
/// Labels:
/// - `cause`: credential_change, circuit_breaker, idle, removed
pub static CLIENT_INVALIDATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubegate_client_invalidations_total")
        .with_description("Total number of cluster client invalidations")
        .with_unit("{invalidations}")
        .build()
});

/// Gauge of clients currently cached in the pool
pub static CLIENTS_CACHED: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kubegate_clients_cached")
        .with_description("Number of cluster clients currently cached")
        .with_unit("{clients}")
        .build()
});

// ============================================================================
// Resource Proxy Metrics
// ============================================================================

/// Counter of upstream calls issued by the resource proxy
///
/// Labels:
/// - `verb`: list, get, create, replace, delete, logs, exec
/// - `outcome`: ok, conflict, upstream, unreachable, deadline
pub static UPSTREAM_CALLS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubegate_upstream_calls_total")
        .with_description("Total number of upstream cluster API calls")
        .with_unit("{calls}")
        .build()
});

/// Histogram of upstream call duration
///
/// Labels:
/// - `verb`: list, get, create, replace, delete, logs, exec
pub static UPSTREAM_CALL_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("kubegate_upstream_call_duration_seconds")
        .with_description("Duration of upstream cluster API calls in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Session Metrics
// ============================================================================

/// Counter of bridge sessions opened
///
/// Labels:
/// - `target`: pod-exec, node-ssh
pub static SESSIONS_OPENED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubegate_sessions_opened_total")
        .with_description("Total number of stream bridge sessions opened")
        .with_unit("{sessions}")
        .build()
});

/// Counter of bridge sessions closed
///
/// Labels:
/// - `reason`: client_closed, upstream_closed, idle_timeout, deadline, cluster_removed, admin, error
pub static SESSIONS_CLOSED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("kubegate_sessions_closed_total")
        .with_description("Total number of stream bridge sessions closed")
        .with_unit("{sessions}")
        .build()
});

/// Gauge of sessions currently registered
pub static SESSIONS_ACTIVE: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("kubegate_sessions_active")
        .with_description("Number of stream bridge sessions currently registered")
        .with_unit("{sessions}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Why a pooled client was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationCause {
    /// Descriptor was updated
    CredentialChange,
    /// Too many consecutive transport failures
    CircuitBreaker,
    /// Unused for the idle period
    Idle,
    /// Descriptor was deleted
    Removed,
}

impl InvalidationCause {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialChange => "credential_change",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Idle => "idle",
            Self::Removed => "removed",
        }
    }
}
