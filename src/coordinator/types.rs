// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (registration published)
//!    ↓                              ↓
//! Stopped ←── ShuttingDown ←──── Running
//!
//! Starting ──(channel failure)──→ Failed
//! ```
//!
//! - **Created**: after `CohortEngine::new()`. Nothing published, no tasks.
//! - **Starting**: publishing the local registration, subscribing.
//! - **Running**: consuming the channel; heartbeat, sweep and eviction tasks live.
//! - **ShuttingDown**: tasks signalled, partitions draining.
//! - **Stopped**: clean shutdown. Safe to drop.
//! - **Failed**: start-up failed. Check logs.

use crate::membership::MemberStatus;
use crate::types::MemberId;
use serde::Serialize;
use std::collections::BTreeMap;

/// State of the cohort engine. The discriminant doubles as the state gauge value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum EngineState {
    Created = 0,
    Starting = 1,
    Running = 2,
    ShuttingDown = 3,
    Stopped = 4,
    Failed = 5,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }

    /// No further events are accepted in this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote member as seen from here.
#[derive(Debug, Clone, Serialize)]
pub struct MemberHealth {
    pub member_id: MemberId,
    pub status: MemberStatus,
    /// Milliseconds since the member was last heard from.
    pub silent_ms: Option<u64>,
    /// Federated queries to this member are short-circuited.
    pub circuit_open: bool,
}

/// Snapshot for monitoring endpoints. Collected without I/O.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and the event channel is being consumed.
    pub ready: bool,
    pub members_by_status: BTreeMap<String, usize>,
    pub members: Vec<MemberHealth>,
    pub known_types: usize,
    pub reference_copies: usize,
    pub pending_events: usize,
    pub pending_by_reason: BTreeMap<&'static str, usize>,
    pub open_conflicts: usize,
    pub recent_apply_failures: usize,
    pub dispatch_partitions: usize,
    /// Ready with no unreachable members.
    pub healthy: bool,
}
