// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cohort membership tracking.
//!
//! # Member Lifecycle
//!
//! ```text
//! (registration) → Registering ──confirm──→ Active ⇄ Unreachable
//!                        │                    │          │
//!                        └────────────────────┴──────────┴──→ Deregistered (terminal)
//! ```
//!
//! - Any event from a member counts as a heartbeat ([`MembershipManager::record_activity`]).
//! - A member silent for `missed_heartbeats_threshold` intervals becomes
//!   UNREACHABLE. That is a status change, not an error.
//! - DEREGISTERED is a tombstone: the entry is kept so that stale reference
//!   copies can be recognized, and later registrations under the same id are
//!   ignored.

use crate::config::MembershipConfig;
use crate::error::{CohortError, Result};
use crate::metrics;
use crate::types::{MemberId, MemberRegistration};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Status of a cohort member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Registering,
    Active,
    Unreachable,
    Deregistered,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Registering => "REGISTERING",
            Self::Active => "ACTIVE",
            Self::Unreachable => "UNREACHABLE",
            Self::Deregistered => "DEREGISTERED",
        })
    }
}

/// A peer repository in the cohort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CohortMember {
    pub member_id: MemberId,
    pub display_name: String,
    pub origin_timestamp_ms: i64,
    pub supported_type_versions: BTreeMap<String, u64>,
    pub status: MemberStatus,
}

/// What a membership operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// First registration seen; the member is REGISTERING.
    Registered,
    /// Known member re-registered; details refreshed, status kept.
    Reregistered,
    /// UNREACHABLE → ACTIVE.
    Reinstated,
    /// Heartbeat recorded, status unchanged.
    Refreshed,
    /// Member tombstoned.
    Deregistered,
    /// Nothing happened (unknown or tombstoned member).
    Ignored,
}

#[derive(Debug, Clone)]
struct MemberEntry {
    member: CohortMember,
    last_seen: Instant,
    registered_at: Instant,
    /// Never swept for missed heartbeats.
    pinned: bool,
}

/// Tracks cohort peers and their capabilities.
pub struct MembershipManager {
    local_member_id: MemberId,
    config: MembershipConfig,
    members: DashMap<MemberId, MemberEntry>,
}

impl MembershipManager {
    pub fn new(local_member_id: MemberId, config: MembershipConfig) -> Self {
        Self {
            local_member_id,
            config,
            members: DashMap::new(),
        }
    }

    pub fn local_member_id(&self) -> &MemberId {
        &self.local_member_id
    }

    /// Handle a registration (or re-registration) from the channel.
    pub fn on_registration_event(&self, registration: &MemberRegistration) -> MembershipChange {
        let now = Instant::now();
        let id = registration.member_id.clone();

        let change = match self.members.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.member.status == MemberStatus::Deregistered {
                    drop(occupied);
                    warn!(member_id = %id, "Registration from deregistered member ignored");
                    metrics::record_registry_event_ignored("deregistered");
                    return MembershipChange::Ignored;
                }
                entry.member.display_name = registration.display_name.clone();
                entry.member.origin_timestamp_ms = registration.origin_timestamp_ms;
                entry.member.supported_type_versions = registration.supported_type_versions.clone();
                entry.last_seen = now;
                if entry.member.status == MemberStatus::Unreachable {
                    entry.member.status = MemberStatus::Active;
                    MembershipChange::Reinstated
                } else {
                    MembershipChange::Reregistered
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemberEntry {
                    member: CohortMember {
                        member_id: id.clone(),
                        display_name: registration.display_name.clone(),
                        origin_timestamp_ms: registration.origin_timestamp_ms,
                        supported_type_versions: registration.supported_type_versions.clone(),
                        status: MemberStatus::Registering,
                    },
                    last_seen: now,
                    registered_at: now,
                    pinned: false,
                });
                MembershipChange::Registered
            }
        };

        match change {
            MembershipChange::Registered => {
                info!(member_id = %id, display_name = %registration.display_name, "Member registering");
                metrics::record_member_transition(id.as_str(), "REGISTERING");
            }
            MembershipChange::Reinstated => {
                info!(member_id = %id, "Member re-registered, reinstated as ACTIVE");
                metrics::record_member_transition(id.as_str(), "ACTIVE");
            }
            _ => debug!(member_id = %id, "Member re-registered"),
        }
        self.publish_status_gauges();
        change
    }

    /// REGISTERING → ACTIVE once the type-registry exchange is done.
    pub fn confirm_registration(&self, member_id: &MemberId) -> Result<MemberStatus> {
        let mut entry = self
            .members
            .get_mut(member_id)
            .ok_or_else(|| CohortError::UnknownMember {
                member_id: member_id.to_string(),
            })?;

        let status = entry.member.status;
        match status {
            MemberStatus::Deregistered => Err(CohortError::MemberDeregistered {
                member_id: member_id.to_string(),
            }),
            MemberStatus::Registering => {
                entry.member.status = MemberStatus::Active;
                entry.last_seen = Instant::now();
                drop(entry);
                info!(member_id = %member_id, "Member registration confirmed, now ACTIVE");
                metrics::record_member_transition(member_id.as_str(), "ACTIVE");
                self.publish_status_gauges();
                Ok(MemberStatus::Active)
            }
            other => Ok(other),
        }
    }

    /// A refresh request from a member: counts as a heartbeat.
    pub fn on_refresh_request(&self, member_id: &MemberId) -> MembershipChange {
        self.record_activity(member_id)
    }

    /// Tombstone a member. Unknown members get a tombstone too.
    pub fn on_deregistration(&self, member_id: &MemberId) -> MembershipChange {
        if member_id == &self.local_member_id {
            warn!(member_id = %member_id, "Ignoring deregistration of the local member");
            return MembershipChange::Ignored;
        }
        let now = Instant::now();
        let mut entry = self
            .members
            .entry(member_id.clone())
            .or_insert_with(|| MemberEntry {
                member: CohortMember {
                    member_id: member_id.clone(),
                    display_name: String::new(),
                    origin_timestamp_ms: 0,
                    supported_type_versions: BTreeMap::new(),
                    status: MemberStatus::Deregistered,
                },
                last_seen: now,
                registered_at: now,
                pinned: false,
            });
        let previous = entry.member.status;
        entry.member.status = MemberStatus::Deregistered;
        drop(entry);

        if previous == MemberStatus::Deregistered {
            debug!(member_id = %member_id, "Member already deregistered");
        } else {
            info!(member_id = %member_id, previous = %previous, "Member deregistered");
            metrics::record_member_transition(member_id.as_str(), "DEREGISTERED");
        }
        self.publish_status_gauges();
        MembershipChange::Deregistered
    }

    /// Record that a member was heard from. UNREACHABLE members are reinstated.
    pub fn record_activity(&self, member_id: &MemberId) -> MembershipChange {
        let Some(mut entry) = self.members.get_mut(member_id) else {
            return MembershipChange::Ignored;
        };
        let status = entry.member.status;
        match status {
            MemberStatus::Deregistered => MembershipChange::Ignored,
            MemberStatus::Unreachable => {
                entry.member.status = MemberStatus::Active;
                entry.last_seen = Instant::now();
                drop(entry);
                info!(member_id = %member_id, "Member heard from again, now ACTIVE");
                metrics::record_member_transition(member_id.as_str(), "ACTIVE");
                self.publish_status_gauges();
                MembershipChange::Reinstated
            }
            MemberStatus::Active | MemberStatus::Registering => {
                entry.last_seen = Instant::now();
                MembershipChange::Refreshed
            }
        }
    }

    /// Register the local member as ACTIVE. It is never swept.
    pub fn register_local(&self, registration: &MemberRegistration) {
        self.on_registration_event(registration);
        if let Some(mut entry) = self.members.get_mut(&self.local_member_id) {
            entry.member.status = MemberStatus::Active;
        }
        self.publish_status_gauges();
    }

    /// Register a member that never heartbeats (e.g. a replayed archive) as
    /// ACTIVE. Fails if the id is tombstoned.
    pub fn register_pinned(&self, registration: &MemberRegistration) -> Result<()> {
        if self.on_registration_event(registration) == MembershipChange::Ignored {
            return Err(CohortError::MemberDeregistered {
                member_id: registration.member_id.to_string(),
            });
        }
        if let Some(mut entry) = self.members.get_mut(&registration.member_id) {
            entry.member.status = MemberStatus::Active;
            entry.pinned = true;
        }
        info!(member_id = %registration.member_id, "Pinned member registered as ACTIVE");
        self.publish_status_gauges();
        Ok(())
    }

    /// Mark silent members UNREACHABLE; returns the members that changed.
    pub fn check_heartbeats(&self) -> Vec<MemberId> {
        self.check_heartbeats_at(Instant::now())
    }

    /// [`check_heartbeats`](Self::check_heartbeats) with an explicit clock reading.
    pub fn check_heartbeats_at(&self, now: Instant) -> Vec<MemberId> {
        let limit = self.config.unreachable_after();
        let registration_timeout = self.config.registration_timeout_duration();
        let mut changed = Vec::new();

        for mut entry in self.members.iter_mut() {
            if entry.key() == &self.local_member_id || entry.pinned {
                continue;
            }
            let silent_for = now.saturating_duration_since(entry.last_seen);
            let status = entry.member.status;
            match status {
                MemberStatus::Active if silent_for > limit => {
                    entry.member.status = MemberStatus::Unreachable;
                    warn!(
                        member_id = %entry.key(),
                        silent_ms = silent_for.as_millis() as u64,
                        threshold = self.config.missed_heartbeats_threshold,
                        "Member missed heartbeats, now UNREACHABLE"
                    );
                    metrics::record_member_transition(entry.key().as_str(), "UNREACHABLE");
                    changed.push(entry.key().clone());
                }
                MemberStatus::Registering
                    if now.saturating_duration_since(entry.registered_at) > registration_timeout =>
                {
                    warn!(
                        member_id = %entry.key(),
                        "Member still REGISTERING after registration timeout"
                    );
                }
                _ => {}
            }
        }

        if !changed.is_empty() {
            changed.sort();
            self.publish_status_gauges();
        }
        changed
    }

    pub fn status_of(&self, member_id: &MemberId) -> Option<MemberStatus> {
        self.members.get(member_id).map(|e| e.member.status)
    }

    pub fn get(&self, member_id: &MemberId) -> Option<CohortMember> {
        self.members.get(member_id).map(|e| e.member.clone())
    }

    /// Events from this member may be applied now.
    pub fn accepts_events_from(&self, member_id: &MemberId) -> bool {
        matches!(
            self.status_of(member_id),
            Some(MemberStatus::Active | MemberStatus::Registering)
        )
    }

    /// ACTIVE members ordered by member id.
    pub fn list_active_members(&self) -> Vec<CohortMember> {
        self.list_by(|s| s == MemberStatus::Active)
    }

    /// Every known member, including tombstones, ordered by member id.
    pub fn list_members(&self) -> Vec<CohortMember> {
        self.list_by(|_| true)
    }

    /// Time since the member was last heard from.
    pub fn silent_for(&self, member_id: &MemberId) -> Option<Duration> {
        self.members.get(member_id).map(|e| e.last_seen.elapsed())
    }

    fn list_by(&self, keep: impl Fn(MemberStatus) -> bool) -> Vec<CohortMember> {
        let mut out: Vec<CohortMember> = self
            .members
            .iter()
            .filter(|e| keep(e.member.status))
            .map(|e| e.member.clone())
            .collect();
        out.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        out
    }

    /// Count of members per status.
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for status in [
            MemberStatus::Registering,
            MemberStatus::Active,
            MemberStatus::Unreachable,
            MemberStatus::Deregistered,
        ] {
            counts.insert(status.to_string(), 0);
        }
        for entry in self.members.iter() {
            *counts.entry(entry.member.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    fn publish_status_gauges(&self) {
        for (status, count) in self.status_counts() {
            metrics::set_members_by_status(&status, count);
        }
    }
}
