//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Membership status and heartbeat loss
//! - Inbound event application outcomes
//! - Pending buffer depth and evictions
//! - Conflict detection
//! - Federated query fan-out
//! - Outbound production
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `cohort_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use cohort_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_inbound_event("member-a", "applied");
//! metrics::record_federated_query("find", 3, 1, Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Membership
// =============================================================================

/// Record a member status transition.
pub fn record_member_transition(member_id: &str, status: &str) {
    counter!(
        "cohort_member_transitions_total",
        "member_id" => member_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Gauge for members per status.
pub fn set_members_by_status(status: &str, count: usize) {
    gauge!("cohort_members", "status" => status.to_string()).set(count as f64);
}

/// Record a registry event that was ignored (e.g. from a tombstoned member).
pub fn record_registry_event_ignored(reason: &str) {
    counter!("cohort_registry_events_ignored_total", "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Type registry
// =============================================================================

/// Record a type registration outcome (accepted, new_version, rejected, duplicate).
pub fn record_type_registration(outcome: &str) {
    counter!("cohort_type_registrations_total", "outcome" => outcome.to_string()).increment(1);
}

/// Gauge for number of known type GUIDs.
pub fn set_known_types(count: usize) {
    gauge!("cohort_known_types").set(count as f64);
}

// =============================================================================
// Inbound replication
// =============================================================================

/// Record the outcome of applying one inbound event.
pub fn record_inbound_event(origin: &str, outcome: &str) {
    counter!(
        "cohort_inbound_events_total",
        "origin" => origin.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record event apply latency.
pub fn record_apply_latency(origin: &str, duration: Duration) {
    histogram!("cohort_apply_duration_seconds", "origin" => origin.to_string())
        .record(duration.as_secs_f64());
}

/// Record an apply failure kept in the failure log.
pub fn record_apply_failure(origin: &str) {
    counter!("cohort_apply_failures_total", "origin" => origin.to_string()).increment(1);
}

/// Gauge for events waiting on a registration or type.
pub fn set_pending_events(count: usize) {
    gauge!("cohort_pending_events").set(count as f64);
}

/// Record pending events evicted or dropped (reason: timeout, overflow).
pub fn record_pending_dropped(reason: &str, count: usize) {
    if count > 0 {
        counter!("cohort_pending_dropped_total", "reason" => reason.to_string())
            .increment(count as u64);
    }
}

/// Record pending events released for application.
pub fn record_pending_released(count: usize) {
    if count > 0 {
        counter!("cohort_pending_released_total").increment(count as u64);
    }
}

/// Gauge for reference copies held locally.
pub fn set_reference_copies(count: usize) {
    gauge!("cohort_reference_copies").set(count as f64);
}

/// Record copies marked stale or purged for a member.
pub fn record_member_copies(member_id: &str, action: &str, count: usize) {
    counter!(
        "cohort_member_copies_total",
        "member_id" => member_id.to_string(),
        "action" => action.to_string()
    )
    .increment(count as u64);
}

/// Record an inbound event dropped by a full dispatch partition queue.
pub fn record_dispatch_backpressure(origin: &str) {
    counter!("cohort_dispatch_backpressure_total", "origin" => origin.to_string()).increment(1);
}

/// Gauge for active dispatch partitions.
pub fn set_dispatch_partitions(count: usize) {
    gauge!("cohort_dispatch_partitions").set(count as f64);
}

// =============================================================================
// Outbound
// =============================================================================

/// Record an outbound event publication.
pub fn record_outbound_event(kind: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "cohort_outbound_events_total",
        "kind" => kind.to_string(),
        "status" => status
    )
    .increment(1);
}

// =============================================================================
// Conflicts
// =============================================================================

/// Record a conflict report (new record or coalesced occurrence).
pub fn record_conflict(kind: &str, coalesced: bool) {
    let disposition = if coalesced { "coalesced" } else { "new" };
    counter!(
        "cohort_conflicts_total",
        "kind" => kind.to_string(),
        "disposition" => disposition
    )
    .increment(1);
}

/// Gauge for OPEN conflict records.
pub fn set_open_conflicts(count: usize) {
    gauge!("cohort_open_conflicts").set(count as f64);
}

// =============================================================================
// Federated queries
// =============================================================================

/// Record a federated query with its per-member result.
pub fn record_federated_query(operation: &str, responded: usize, warnings: usize, duration: Duration) {
    let op = operation.to_string();
    counter!("cohort_federated_queries_total", "operation" => op.clone()).increment(1);
    counter!("cohort_federated_member_responses_total", "operation" => op.clone())
        .increment(responded as u64);
    if warnings > 0 {
        counter!("cohort_federated_member_warnings_total", "operation" => op.clone())
            .increment(warnings as u64);
    }
    histogram!("cohort_federated_query_duration_seconds", "operation" => op)
        .record(duration.as_secs_f64());
}

/// Record one member call outcome (ok, timeout, error, circuit_open).
pub fn record_member_call(member_id: &str, outcome: &str, duration: Duration) {
    counter!(
        "cohort_member_calls_total",
        "member_id" => member_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("cohort_member_call_duration_seconds", "member_id" => member_id.to_string())
        .record(duration.as_secs_f64());
}

/// 1 while a member's query circuit is open.
pub fn set_member_circuit_open(member_id: &str, open: bool) {
    gauge!("cohort_member_circuit_open", "member_id" => member_id.to_string())
        .set(if open { 1.0 } else { 0.0 });
}

/// Record a federated query that failed outright.
pub fn record_federated_failure(operation: &str, reason: &str) {
    counter!(
        "cohort_federated_failures_total",
        "operation" => operation.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// =============================================================================
// Engine
// =============================================================================

/// Engine state as its discriminant: 0 created .. 2 running .. 5 failed.
pub fn set_engine_state(code: u8) {
    gauge!("cohort_engine_state").set(f64::from(code));
}

/// Record errors by type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "cohort_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
