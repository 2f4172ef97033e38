// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cohort engine.
//!
//! Configuration is passed to [`CohortEngine::new()`](crate::CohortEngine::new)
//! and can be constructed programmatically or deserialized from JSON/YAML by
//! the embedding daemon.
//!
//! # Quick Start
//!
//! ```rust
//! use cohort_engine::config::CohortConfig;
//!
//! let config = CohortConfig {
//!     local_member_id: "repo.london-1".into(),
//!     display_name: "London catalogue".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! CohortConfig
//! ├── local_member_id: String       # This member's metadata collection ID
//! ├── display_name: String
//! └── settings: CohortSettings
//!     ├── membership: MembershipConfig   # heartbeats, registration timeout
//!     ├── replication: ReplicationConfig # pending buffer, lock stripes
//!     ├── outbound: OutboundConfig       # local connector retry policy
//!     ├── query: QueryConfig             # fan-out limit, member timeout
//!     └── conflicts: ConflictConfig      # coalescing window
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "local_member_id": "repo.london-1",
//!   "display_name": "London catalogue",
//!   "settings": {
//!     "membership": { "heartbeat_interval": "10s", "missed_heartbeats_threshold": 3 },
//!     "query": { "fan_out_limit": 8, "member_timeout": "5s" }
//!   }
//! }
//! ```

use crate::error::{CohortError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use crate::circuit_breaker::CircuitConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `CohortEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortConfig {
    /// Metadata collection ID of the local member. Events carrying this
    /// origin are our own echoes and are ignored on the inbound side.
    pub local_member_id: String,

    /// Human readable name announced at registration.
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub settings: CohortSettings,
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            local_member_id: "local.dev.member.default".to_string(),
            display_name: "local development member".to_string(),
            settings: CohortSettings::default(),
        }
    }
}

impl CohortConfig {
    /// Create a minimal config for testing: short timeouts, small buffers.
    pub fn for_testing(local_member_id: &str) -> Self {
        Self {
            local_member_id: local_member_id.to_string(),
            display_name: format!("{local_member_id} (test)"),
            settings: CohortSettings {
                membership: MembershipConfig {
                    heartbeat_interval: "100ms".to_string(),
                    registration_timeout: "1s".to_string(),
                    ..Default::default()
                },
                replication: ReplicationConfig {
                    pending_capacity: 64,
                    pending_timeout: "1s".to_string(),
                    ..Default::default()
                },
                outbound: OutboundConfig {
                    max_attempts: 3,
                    initial_backoff_ms: 5,
                    max_backoff_ms: 20,
                },
                query: QueryConfig {
                    member_timeout: "200ms".to_string(),
                    ..Default::default()
                },
                conflicts: ConflictConfig::default(),
            },
        }
    }

    /// Reject configurations that would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.local_member_id.trim().is_empty() {
            return Err(CohortError::Config("local_member_id must not be empty".to_string()));
        }
        let s = &self.settings;
        if s.membership.missed_heartbeats_threshold == 0 {
            return Err(CohortError::Config(
                "membership.missed_heartbeats_threshold must be at least 1".to_string(),
            ));
        }
        if s.replication.pending_capacity == 0 {
            return Err(CohortError::Config("replication.pending_capacity must be > 0".to_string()));
        }
        if s.replication.lock_stripes == 0 {
            return Err(CohortError::Config("replication.lock_stripes must be > 0".to_string()));
        }
        if s.replication.partition_queue_depth == 0 {
            return Err(CohortError::Config(
                "replication.partition_queue_depth must be > 0".to_string(),
            ));
        }
        if s.query.fan_out_limit == 0 {
            return Err(CohortError::Config("query.fan_out_limit must be > 0".to_string()));
        }
        if s.query.default_page_size == 0 || s.query.default_page_size > s.query.max_page_size {
            return Err(CohortError::Config(
                "query.default_page_size must be in 1..=max_page_size".to_string(),
            ));
        }
        if s.outbound.max_attempts == 0 {
            return Err(CohortError::Config("outbound.max_attempts must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Grouped tunables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CohortSettings {
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub conflicts: ConflictConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// MembershipConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Heartbeat and registration policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Expected interval between events (or refreshes) from each member.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// Consecutive missed intervals before a member becomes UNREACHABLE.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats_threshold: u32,

    /// How long a member may stay REGISTERING before it is logged as stuck.
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout: String,

    /// Whether the background heartbeat sweep and local heartbeat run.
    #[serde(default = "default_true")]
    pub sweep_enabled: bool,
}

fn default_heartbeat_interval() -> String {
    "10s".to_string()
}

fn default_missed_heartbeats() -> u32 {
    3
}

fn default_registration_timeout() -> String {
    "60s".to_string()
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            missed_heartbeats_threshold: default_missed_heartbeats(),
            registration_timeout: default_registration_timeout(),
            sweep_enabled: true,
        }
    }
}

impl MembershipConfig {
    pub fn heartbeat_interval_duration(&self) -> Duration {
        parse_duration_or(&self.heartbeat_interval, Duration::from_secs(10))
    }

    pub fn registration_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.registration_timeout, Duration::from_secs(60))
    }

    /// Silence longer than this marks a member UNREACHABLE.
    pub fn unreachable_after(&self) -> Duration {
        self.heartbeat_interval_duration()
            .saturating_mul(self.missed_heartbeats_threshold.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Inbound application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Maximum events held while awaiting a registration or a type.
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,

    /// How long a pending event may wait before it is evicted.
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout: String,

    /// Number of lock stripes guarding per-GUID critical sections.
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,

    /// How many recent apply failures to retain for operators.
    #[serde(default = "default_failure_log_capacity")]
    pub failure_log_capacity: usize,

    /// Depth of each per-origin dispatch queue.
    #[serde(default = "default_partition_queue_depth")]
    pub partition_queue_depth: usize,

    /// Throttle inbound dispatch across all partitions.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_pending_capacity() -> usize {
    1024
}

fn default_pending_timeout() -> String {
    "60s".to_string()
}

fn default_lock_stripes() -> usize {
    64
}

fn default_failure_log_capacity() -> usize {
    256
}

fn default_partition_queue_depth() -> usize {
    1024
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            pending_capacity: default_pending_capacity(),
            pending_timeout: default_pending_timeout(),
            lock_stripes: default_lock_stripes(),
            failure_log_capacity: default_failure_log_capacity(),
            partition_queue_depth: default_partition_queue_depth(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl ReplicationConfig {
    pub fn pending_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.pending_timeout, Duration::from_secs(60))
    }

    /// Rate limit for inbound dispatch, or `None` if disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                per_second: self.rate_limit_per_sec,
                burst: self.rate_limit_burst,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OutboundConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry policy for reading local changes before publishing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    #[serde(default = "default_outbound_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_outbound_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_outbound_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_outbound_attempts() -> usize {
    5
}

fn default_outbound_initial_backoff_ms() -> u64 {
    50
}

fn default_outbound_max_backoff_ms() -> u64 {
    2000
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_outbound_attempts(),
            initial_backoff_ms: default_outbound_initial_backoff_ms(),
            max_backoff_ms: default_outbound_max_backoff_ms(),
        }
    }
}

impl OutboundConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueryConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Federated query fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Maximum member calls in flight for one query.
    #[serde(default = "default_fan_out_limit")]
    pub fan_out_limit: usize,

    /// Per-member call timeout.
    #[serde(default = "default_member_timeout")]
    pub member_timeout: String,

    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Consecutive member failures before its circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open member circuit waits before probing again (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_fan_out_limit() -> usize {
    8
}

fn default_member_timeout() -> String {
    "5s".to_string()
}

fn default_page_size() -> usize {
    100
}

fn default_max_page_size() -> usize {
    1000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            fan_out_limit: default_fan_out_limit(),
            member_timeout: default_member_timeout(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout_sec: default_circuit_reset_timeout(),
        }
    }
}

impl QueryConfig {
    pub fn member_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.member_timeout, Duration::from_secs(5))
    }

    /// Clamp a requested page size into `1..=max_page_size`.
    pub fn effective_page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1))
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            probe_calls: 1,
            open_wait: Duration::from_secs(self.circuit_reset_timeout_sec),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ConflictConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Conflict bookkeeping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Reports of the same kind and reference inside this window are
    /// coalesced into one open record.
    #[serde(default = "default_coalesce_window")]
    pub coalesce_window: String,
}

fn default_coalesce_window() -> String {
    "5m".to_string()
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            coalesce_window: default_coalesce_window(),
        }
    }
}

impl ConflictConfig {
    pub fn coalesce_window_duration(&self) -> Duration {
        parse_duration_or(&self.coalesce_window, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CohortConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.local_member_id, "local.dev.member.default");
    }

    #[test]
    fn test_membership_defaults() {
        let config = MembershipConfig::default();
        assert_eq!(config.missed_heartbeats_threshold, 3);
        assert_eq!(config.heartbeat_interval_duration(), Duration::from_secs(10));
        assert_eq!(config.unreachable_after(), Duration::from_secs(30));
        assert!(config.sweep_enabled);
    }

    #[test]
    fn test_duration_parsing_formats() {
        let cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("250ms", Duration::from_millis(250)),
        ];
        for (input, expected) in cases {
            let config = QueryConfig {
                member_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.member_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back() {
        let config = ReplicationConfig {
            pending_timeout: "soon".to_string(),
            ..Default::default()
        };
        assert_eq!(config.pending_timeout_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_empty_member_id() {
        let mut config = CohortConfig::default();
        config.local_member_id = "  ".to_string();
        assert!(matches!(config.validate(), Err(CohortError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = CohortConfig::default();
        config.settings.membership.missed_heartbeats_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_fan_out() {
        let mut config = CohortConfig::default();
        config.settings.query.fan_out_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_page_size_clamps() {
        let config = QueryConfig::default();
        assert_eq!(config.effective_page_size(None), 100);
        assert_eq!(config.effective_page_size(Some(0)), 1);
        assert_eq!(config.effective_page_size(Some(50_000)), 1000);
    }

    #[test]
    fn test_rate_limit_config() {
        let mut config = ReplicationConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        config.rate_limit_per_sec = 500;
        config.rate_limit_burst = 50;
        let rate = config.rate_limit_config().unwrap();
        assert_eq!(rate.per_second, 500);
        assert_eq!(rate.burst, 50);
    }

    #[test]
    fn test_outbound_retry_config() {
        let retry = OutboundConfig::default().retry_config();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(50));
        assert_eq!(retry.max_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_for_testing_config() {
        let config = CohortConfig::for_testing("member-t");
        assert_eq!(config.local_member_id, "member-t");
        assert!(config.validate().is_ok());
        assert_eq!(
            config.settings.query.member_timeout_duration(),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_config_json_roundtrip_with_partial_settings() {
        let json = r#"{
            "local_member_id": "repo-1",
            "settings": { "query": { "fan_out_limit": 2 } }
        }"#;
        let parsed: CohortConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.local_member_id, "repo-1");
        assert_eq!(parsed.settings.query.fan_out_limit, 2);
        assert_eq!(parsed.settings.query.default_page_size, 100);
        assert_eq!(parsed.settings.membership.missed_heartbeats_threshold, 3);
    }

    #[test]
    fn test_coalesce_window_default() {
        assert_eq!(
            ConflictConfig::default().coalesce_window_duration(),
            Duration::from_secs(300)
        );
    }
}
