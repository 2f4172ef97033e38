// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bulk archive loading.
//!
//! An archive is replayed as ordinary TYPE_DEF_ADDED and *_CREATED events
//! from a synthetic origin `archive:<archive_id>`. Conflicts with live
//! cohort content are detected and quarantined exactly as for any member.

use crate::error::Result;
use crate::membership::MembershipManager;
use crate::replication::{ApplyOutcome, ReplicationEngine};
use crate::types::{
    EventKind, EventPayload, InstanceAction, InstanceBody, InstanceCategory, InstanceEvent,
    InstanceGuid, MemberId, MemberRegistration, TypeDef,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A bundle of type definitions and instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortArchive {
    pub archive_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub type_defs: Vec<TypeDef>,
    #[serde(default)]
    pub instances: Vec<ArchivedInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedInstance {
    pub guid: InstanceGuid,
    pub category: InstanceCategory,
    #[serde(default = "first_version")]
    pub version: u64,
    pub body: InstanceBody,
}

fn first_version() -> u64 {
    1
}

/// Tally of a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub applied: usize,
    pub duplicates: usize,
    pub quarantined: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl CohortArchive {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Synthetic member the archive's events originate from.
    pub fn origin(&self) -> MemberId {
        MemberId::new(format!("archive:{}", self.archive_id))
    }

    /// Type events first, then instances, in archive order.
    pub fn to_events(&self) -> Vec<InstanceEvent> {
        let origin = self.origin();
        let types = self
            .type_defs
            .iter()
            .map(|def| InstanceEvent::type_def(origin.clone(), def.clone(), false));
        let instances = self.instances.iter().map(|inst| {
            let kind = match inst.category {
                InstanceCategory::Entity => EventKind::Entity(InstanceAction::Created),
                InstanceCategory::Relationship => EventKind::Relationship(InstanceAction::Created),
            };
            InstanceEvent::new(
                origin.clone(),
                kind,
                inst.guid.clone(),
                inst.version.max(1),
                EventPayload::Instance(inst.body.clone()),
            )
        });
        types.chain(instances).collect()
    }

    /// Register the archive's origin and apply every event.
    pub fn replay(
        &self,
        membership: &MembershipManager,
        replication: &ReplicationEngine,
    ) -> Result<ArchiveReport> {
        let origin = self.origin();
        let display_name = if self.display_name.is_empty() {
            origin.to_string()
        } else {
            self.display_name.clone()
        };
        membership.register_pinned(&MemberRegistration::new(origin.clone(), display_name))?;

        let mut report = ArchiveReport::default();
        for event in self.to_events() {
            match replication.apply_inbound_event(&event) {
                Ok(ApplyOutcome::Applied) => report.applied += 1,
                Ok(ApplyOutcome::Duplicate) => report.duplicates += 1,
                Ok(ApplyOutcome::Quarantined(_)) => report.quarantined += 1,
                Ok(ApplyOutcome::Rejected(_)) => report.rejected += 1,
                Ok(other) => {
                    warn!(event_id = %event.event_id, outcome = ?other, "Archive event not applied");
                    report.failed += 1;
                }
                Err(_) => report.failed += 1,
            }
        }

        info!(
            archive_id = %self.archive_id,
            applied = report.applied,
            duplicates = report.duplicates,
            quarantined = report.quarantined,
            rejected = report.rejected,
            failed = report.failed,
            "Archive replayed"
        );
        Ok(report)
    }
}
