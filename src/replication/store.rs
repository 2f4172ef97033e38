// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reference copy storage.
//!
//! Each instance GUID owns one slot holding the accepted home member and
//! every copy keyed by the member that sent it. Keeping the home and the
//! copies in the same slot means a rehome updates both in one map entry;
//! readers never observe two homes for a GUID.
//!
//! A copy from a member other than the accepted home is QUARANTINED: it is
//! kept addressable by (GUID, member) but never served as the instance.

use crate::connector::{InstanceRecord, Provenance};
use crate::types::{EventId, InstanceBody, InstanceCategory, InstanceGuid, MemberId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a locally cached copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CopyStatus {
    Current,
    /// Logically deleted at the home member; restorable.
    Deleted,
    /// Home member deregistered; awaiting operator confirmation.
    Stale,
    /// Conflicting claim held back from merging.
    Quarantined,
    /// Body dropped; identity and version kept for idempotence.
    Purged,
}

/// A non-authoritative cached replica of a remote instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCopy {
    pub instance_guid: InstanceGuid,
    pub home_member_id: MemberId,
    pub instance_version: u64,
    pub last_applied_event_id: EventId,
    pub category: InstanceCategory,
    pub status: CopyStatus,
    pub body: Option<InstanceBody>,
}

impl ReferenceCopy {
    /// Served by queries: current, with a body.
    pub fn is_queryable(&self) -> bool {
        self.status == CopyStatus::Current && self.body.is_some()
    }

    pub fn to_record(&self) -> Option<InstanceRecord> {
        let body = self.body.clone()?;
        Some(InstanceRecord {
            guid: self.instance_guid.clone(),
            home_member_id: self.home_member_id.clone(),
            version: self.instance_version,
            provenance: Provenance::ReferenceCopy,
            body,
        })
    }
}

/// Everything known about one GUID.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuidSlot {
    /// Accepted home member, if any.
    pub home: Option<MemberId>,
    /// Copies by sending member. The home's copy is the reference copy;
    /// any other entry is quarantined.
    pub copies: BTreeMap<MemberId, ReferenceCopy>,
}

impl GuidSlot {
    pub fn home_copy(&self) -> Option<&ReferenceCopy> {
        self.home.as_ref().and_then(|h| self.copies.get(h))
    }

    fn is_empty(&self) -> bool {
        self.home.is_none() && self.copies.is_empty()
    }
}

#[derive(Default)]
pub struct ReferenceStore {
    slots: DashMap<InstanceGuid, GuidSlot>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the slot for `guid`, creating it if absent.
    ///
    /// Empty slots left behind by `f` are removed.
    pub fn with_slot<R>(&self, guid: &InstanceGuid, f: impl FnOnce(&mut GuidSlot) -> R) -> R {
        let (result, empty) = {
            let mut slot = self.slots.entry(guid.clone()).or_default();
            let result = f(&mut slot);
            (result, slot.is_empty())
        };
        if empty {
            self.slots.remove_if(guid, |_, s| s.is_empty());
        }
        result
    }

    /// Remove and return the slot for `guid`.
    pub fn take_slot(&self, guid: &InstanceGuid) -> Option<GuidSlot> {
        self.slots.remove(guid).map(|(_, slot)| slot)
    }

    pub fn slot(&self, guid: &InstanceGuid) -> Option<GuidSlot> {
        self.slots.get(guid).map(|s| s.clone())
    }

    pub fn home_of(&self, guid: &InstanceGuid) -> Option<MemberId> {
        self.slots.get(guid).and_then(|s| s.home.clone())
    }

    /// The reference copy held for the home member.
    pub fn get(&self, guid: &InstanceGuid) -> Option<ReferenceCopy> {
        self.slots.get(guid).and_then(|s| s.home_copy().cloned())
    }

    /// A copy sent by a specific member (home or quarantined).
    pub fn get_from(&self, guid: &InstanceGuid, member: &MemberId) -> Option<ReferenceCopy> {
        self.slots.get(guid).and_then(|s| s.copies.get(member).cloned())
    }

    /// Home copies that may be served by queries.
    pub fn queryable_copies(&self) -> Vec<ReferenceCopy> {
        self.slots
            .iter()
            .filter_map(|s| s.home_copy().filter(|c| c.is_queryable()).cloned())
            .collect()
    }

    /// All copies held in QUARANTINED status.
    pub fn quarantined_copies(&self) -> Vec<ReferenceCopy> {
        self.slots
            .iter()
            .flat_map(|s| {
                s.copies
                    .values()
                    .filter(|c| c.status == CopyStatus::Quarantined)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of reference copies (home copies, excluding the local member's).
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.home_copy().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set `status` on every copy sent by `member`; returns how many changed.
    /// Purged and quarantined copies keep their status.
    pub fn set_status_for_member(&self, member: &MemberId, status: CopyStatus) -> usize {
        let mut changed = 0;
        for mut slot in self.slots.iter_mut() {
            if let Some(copy) = slot.copies.get_mut(member) {
                let pinned = matches!(copy.status, CopyStatus::Purged | CopyStatus::Quarantined);
                if copy.status != status && !pinned {
                    copy.status = status;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Drop every copy sent by `member` and release its home claims.
    pub fn purge_member(&self, member: &MemberId) -> usize {
        let mut purged = 0;
        for mut slot in self.slots.iter_mut() {
            if slot.copies.remove(member).is_some() {
                purged += 1;
            }
            if slot.home.as_ref() == Some(member) {
                slot.home = None;
            }
        }
        self.slots.retain(|_, s| !s.is_empty());
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy(guid: &str, home: &str, version: u64) -> ReferenceCopy {
        ReferenceCopy {
            instance_guid: guid.into(),
            home_member_id: home.into(),
            instance_version: version,
            last_applied_event_id: EventId::generate(),
            category: InstanceCategory::Entity,
            status: CopyStatus::Current,
            body: Some(InstanceBody::new("t", "T", 0)),
        }
    }

    fn put(store: &ReferenceStore, c: ReferenceCopy) {
        let guid = c.instance_guid.clone();
        store.with_slot(&guid, |slot| {
            slot.home = Some(c.home_member_id.clone());
            slot.copies.insert(c.home_member_id.clone(), c);
        });
    }

    #[test]
    fn test_get_returns_home_copy_only() {
        let store = ReferenceStore::new();
        put(&store, copy("g1", "a", 1));
        store.with_slot(&"g1".into(), |slot| {
            let mut q = copy("g1", "b", 1);
            q.status = CopyStatus::Quarantined;
            slot.copies.insert("b".into(), q);
        });

        assert_eq!(store.get(&"g1".into()).unwrap().home_member_id.as_str(), "a");
        assert_eq!(store.queryable_copies().len(), 1);
        assert_eq!(store.quarantined_copies().len(), 1);
        assert!(store.get_from(&"g1".into(), &"b".into()).is_some());
    }

    #[test]
    fn test_empty_slot_removed() {
        let store = ReferenceStore::new();
        store.with_slot(&"g1".into(), |_| ());
        assert!(store.slot(&"g1".into()).is_none());
    }

    #[test]
    fn test_stale_then_purge_member() {
        let store = ReferenceStore::new();
        put(&store, copy("g1", "a", 1));
        put(&store, copy("g2", "a", 3));
        put(&store, copy("g3", "b", 1));

        assert_eq!(store.set_status_for_member(&"a".into(), CopyStatus::Stale), 2);
        assert_eq!(store.queryable_copies().len(), 1);
        // Already stale: unchanged.
        assert_eq!(store.set_status_for_member(&"a".into(), CopyStatus::Stale), 0);

        assert_eq!(store.purge_member(&"a".into()), 2);
        assert!(store.home_of(&"g1".into()).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_stale_keeps_quarantined_copies() {
        let store = ReferenceStore::new();
        put(&store, copy("g1", "a", 1));
        put(&store, copy("g2", "b", 1));
        store.with_slot(&"g1".into(), |slot| {
            let mut q = copy("g1", "b", 1);
            q.status = CopyStatus::Quarantined;
            slot.copies.insert("b".into(), q);
        });

        assert_eq!(store.set_status_for_member(&"b".into(), CopyStatus::Stale), 1);
        assert_eq!(
            store.get_from(&"g1".into(), &"b".into()).unwrap().status,
            CopyStatus::Quarantined
        );
        assert_eq!(store.quarantined_copies().len(), 1);
        assert_eq!(store.get(&"g2".into()).unwrap().status, CopyStatus::Stale);
    }

    #[test]
    fn test_to_record_marks_provenance() {
        let record = copy("g1", "a", 4).to_record().unwrap();
        assert_eq!(record.provenance, Provenance::ReferenceCopy);
        assert_eq!(record.version, 4);

        let mut purged = copy("g1", "a", 5);
        purged.body = None;
        purged.status = CopyStatus::Purged;
        assert!(purged.to_record().is_none());
        assert!(!purged.is_queryable());
    }
}
