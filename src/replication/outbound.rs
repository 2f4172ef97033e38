// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound production: turn a local change into exactly one published event.
//!
//! The current state is read from the local connector (with backoff), the
//! instance version is advanced, and the event is published. Only locally
//! homed instances produce events.

use super::{CopyStatus, ReplicationEngine};
use crate::conflict::ConflictKind;
use crate::connector::{ConnectorError, InstanceRecord};
use crate::error::{CohortError, Result};
use crate::federation::QueryCriteria;
use crate::metrics;
use crate::resilience::retry_with_backoff;
use crate::types::{
    Classification, ClassificationAction, CohortEvent, EventKind, EventPayload, InstanceAction,
    InstanceCategory, InstanceEvent, InstanceGuid, MemberId,
};
use tracing::{debug, info, warn};

/// A change made to the local repository.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// CREATED, UPDATED, DELETED, PURGED, RESTORED or RETYPED.
    Instance {
        guid: InstanceGuid,
        category: InstanceCategory,
        action: InstanceAction,
    },
    Reidentified {
        guid: InstanceGuid,
        previous_guid: InstanceGuid,
        category: InstanceCategory,
    },
    /// The local member took over the home role.
    Rehomed {
        guid: InstanceGuid,
        previous_home: MemberId,
        category: InstanceCategory,
    },
    Classified {
        guid: InstanceGuid,
        classification: Classification,
        reclassified: bool,
    },
    Declassified {
        guid: InstanceGuid,
        name: String,
    },
}

impl LocalChange {
    pub fn guid(&self) -> &InstanceGuid {
        match self {
            Self::Instance { guid, .. }
            | Self::Reidentified { guid, .. }
            | Self::Rehomed { guid, .. }
            | Self::Classified { guid, .. }
            | Self::Declassified { guid, .. } => guid,
        }
    }

    fn kind(&self) -> EventKind {
        let wrap = |category: InstanceCategory, action| match category {
            InstanceCategory::Entity => EventKind::Entity(action),
            InstanceCategory::Relationship => EventKind::Relationship(action),
        };
        match self {
            Self::Instance { category, action, .. } => wrap(*category, *action),
            Self::Reidentified { category, .. } => wrap(*category, InstanceAction::Reidentified),
            Self::Rehomed { category, .. } => wrap(*category, InstanceAction::Rehomed),
            Self::Classified { reclassified, .. } => EventKind::Classification(if *reclassified {
                ClassificationAction::Reclassified
            } else {
                ClassificationAction::Classified
            }),
            Self::Declassified { .. } => EventKind::Classification(ClassificationAction::Declassified),
        }
    }

    /// Whether the event needs the instance state from the local repository.
    fn needs_local_read(&self) -> bool {
        !matches!(
            self,
            Self::Instance {
                action: InstanceAction::Purged,
                ..
            } | Self::Classified { .. }
                | Self::Declassified { .. }
        )
    }
}

impl ReplicationEngine {
    /// Publish one event describing a local change.
    ///
    /// Returns the published event. If publishing fails the version counter
    /// is not advanced, so a retry produces the same version. Changes to the
    /// same instance are published in call order with distinct versions.
    pub async fn produce_outbound_event(&self, change: LocalChange) -> Result<InstanceEvent> {
        let kind = change.kind();
        let guid = change.guid().clone();
        let _guards = self.lock_outbound(&change).await;

        let record = if change.needs_local_read() {
            self.read_local(&guid).await?
        } else {
            None
        };

        let last = self.local_versions.get(&guid).map(|v| *v).unwrap_or(0);
        let version = match &change {
            // Classification changes do not advance the instance version.
            LocalChange::Classified { .. } | LocalChange::Declassified { .. } => last.max(1),
            _ => (last + 1).max(record.as_ref().map(|r| r.version).unwrap_or(0)),
        };

        let payload = match (&change, record) {
            (LocalChange::Instance { action, .. }, None) => match action {
                InstanceAction::Deleted | InstanceAction::Purged => EventPayload::Empty,
                _ => return Err(self.missing_local(&guid, kind)),
            },
            (LocalChange::Instance { .. }, Some(r)) => EventPayload::Instance(r.body),
            (LocalChange::Reidentified { previous_guid, .. }, Some(r)) => EventPayload::Reidentify {
                previous_guid: previous_guid.clone(),
                body: r.body,
            },
            (LocalChange::Rehomed { previous_home, .. }, Some(r)) => EventPayload::Rehome {
                previous_home: previous_home.clone(),
                body: r.body,
            },
            (LocalChange::Reidentified { .. } | LocalChange::Rehomed { .. }, None) => {
                return Err(self.missing_local(&guid, kind))
            }
            (LocalChange::Classified { classification, .. }, _) => {
                let mut classification = classification.clone();
                classification.origin_member_id = self.local_member_id.clone();
                EventPayload::Classification(classification)
            }
            (LocalChange::Declassified { name, .. }, _) => EventPayload::Declassify { name: name.clone() },
        };

        let event = InstanceEvent::new(self.local_member_id.clone(), kind, guid.clone(), version, payload);
        event.validate()?;

        if let Err(e) = self.channel.publish(CohortEvent::Instance(event.clone())).await {
            warn!(
                instance_guid = %guid,
                kind = %kind,
                version,
                error = %e,
                "Failed to publish outbound event"
            );
            metrics::record_outbound_event(&kind.to_string(), false);
            return Err(CohortError::Channel(e.to_string()));
        }

        self.local_versions.insert(guid.clone(), version);
        self.claim_local_home(&change);
        metrics::record_outbound_event(&kind.to_string(), true);
        debug!(
            event_id = %event.event_id,
            instance_guid = %guid,
            kind = %kind,
            version,
            "Outbound event published"
        );
        Ok(event)
    }

    /// Claim the home role for every instance in the local repository.
    ///
    /// A remote member already recorded as home of one of these GUIDs has its copy
    /// quarantined and a DUPLICATE_GUID conflict is raised. Returns the
    /// number of instances claimed.
    pub async fn claim_local_instances(&self) -> Result<usize> {
        let connector = self.local_connector.clone();
        let criteria = QueryCriteria::default();
        let records = retry_with_backoff(
            "local_scan",
            &self.retry,
            |_: &ConnectorError| true,
            || connector.find(&criteria),
        )
        .await
        .map_err(|e| CohortError::connector(self.local_member_id.as_str(), e.0))?;

        let local = self.local_member_id.clone();
        let mut claimed = 0;
        for guid in records
            .into_iter()
            .filter(|r| r.home_member_id == local)
            .map(|r| r.guid)
        {
            let _outbound = self.outbound_stripes[self.stripe_index(&guid)].lock().await;
            let displaced = {
                let _stripe = self.stripe_for(&guid).lock();
                self.store.with_slot(&guid, |slot| {
                    let displaced = match slot.home.as_ref() {
                        Some(home) if home == &local => None,
                        Some(home) => slot
                            .copies
                            .get_mut(home)
                            .filter(|c| c.status != CopyStatus::Purged)
                            .map(|copy| {
                                copy.status = CopyStatus::Quarantined;
                                home.clone()
                            }),
                        None => None,
                    };
                    slot.home = Some(local.clone());
                    displaced
                })
            };

            if let Some(remote) = displaced {
                let record = self.conflicts.report(
                    ConflictKind::DuplicateGuid,
                    &[local.clone(), remote.clone()],
                    guid.as_str(),
                    format!("local instance {guid} also homed at {remote}; remote copy quarantined"),
                );
                warn!(
                    instance_guid = %guid,
                    remote = %remote,
                    conflict_id = %record.id,
                    "Local instance collides with a remote home"
                );
            }
            claimed += 1;
        }

        info!(claimed, "Local instances claimed");
        Ok(claimed)
    }

    /// Lock the outbound stripes of every GUID the change touches, in index
    /// order. Concurrent changes to one instance publish one at a time.
    async fn lock_outbound(&self, change: &LocalChange) -> Vec<tokio::sync::MutexGuard<'_, ()>> {
        let mut indexes = vec![self.stripe_index(change.guid())];
        if let LocalChange::Reidentified { previous_guid, .. } = change {
            indexes.push(self.stripe_index(previous_guid));
        }
        indexes.sort_unstable();
        indexes.dedup();

        let mut guards = Vec::with_capacity(indexes.len());
        for index in indexes {
            guards.push(self.outbound_stripes[index].lock().await);
        }
        guards
    }

    async fn read_local(&self, guid: &InstanceGuid) -> Result<Option<InstanceRecord>> {
        let connector = self.local_connector.clone();
        retry_with_backoff(
            "local_read",
            &self.retry,
            |_: &ConnectorError| true,
            || connector.get_by_guid(guid),
        )
        .await
        .map_err(|e| CohortError::connector(self.local_member_id.as_str(), e.0))
    }

    fn missing_local(&self, guid: &InstanceGuid, kind: EventKind) -> CohortError {
        CohortError::connector(
            self.local_member_id.as_str(),
            format!("{kind}: instance {guid} not found in the local repository"),
        )
    }

    /// Record the local member as home so remote claims surface as conflicts.
    fn claim_local_home(&self, change: &LocalChange) {
        let local = self.local_member_id.clone();
        match change {
            LocalChange::Instance {
                guid,
                action: InstanceAction::Purged,
                ..
            } => {
                self.store.with_slot(guid, |slot| {
                    if slot.home.as_ref() == Some(&local) {
                        slot.home = None;
                    }
                });
            }
            LocalChange::Instance { guid, .. } => {
                self.store.with_slot(guid, |slot| {
                    slot.home.get_or_insert(local);
                });
            }
            LocalChange::Rehomed {
                guid,
                previous_home,
                ..
            } => {
                self.store.with_slot(guid, |slot| {
                    slot.copies.remove(previous_home);
                    slot.home = Some(local);
                });
                info!(instance_guid = %guid, from = %previous_home, "Instance rehomed to local member");
            }
            LocalChange::Reidentified {
                guid,
                previous_guid,
                ..
            } => {
                self.local_versions.remove(previous_guid);
                self.store.with_slot(previous_guid, |slot| {
                    if slot.home.as_ref() == Some(&local) {
                        slot.home = None;
                    }
                });
                self.store.with_slot(guid, |slot| {
                    slot.home.get_or_insert(local);
                });
            }
            LocalChange::Classified { .. } | LocalChange::Declassified { .. } => {}
        }
    }
}
