// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine: applies inbound instance events to the reference copy
//! store and produces outbound events for local changes.
//!
//! # Apply Algorithm
//!
//! ```text
//! event ─→ validate ─→ self echo? ─→ origin known? ─→ type event? ─→ registry
//!                        │ ignore       │ no: buffer
//!                        │              │ deregistered: drop
//!                        ▼              ▼
//!          earlier event for this instance pending? ─→ queue behind it
//!          type known? ─────────────────────────────→ buffer until TYPE_DEF
//!          lock GUID stripe(s)
//!          version ≤ stored? ───────────────────────→ duplicate, no-op
//!          sender is not the home? ─────────────────→ DUPLICATE_GUID, quarantine
//!          REHOMED / REIDENTIFIED ──────────────────→ re-key copy and home together
//!          otherwise upsert body and version
//! ```
//!
//! # Concurrency
//!
//! Mutations of one GUID happen under that GUID's lock stripe; unrelated
//! GUIDs proceed in parallel. REIDENTIFIED takes both stripes in index
//! order. The pending buffer has its own short-lived lock and is never held
//! while an event is applied. Outbound production of one GUID is serialized
//! by a separate async stripe that stays held while the event is published.
//!
//! # Failures
//!
//! A failed apply is recorded in a bounded failure log and returned to the
//! caller; it never blocks later events of the same partition.

mod outbound;
pub mod pending;
pub mod store;

pub use outbound::LocalChange;
pub use pending::{PendingEntry, PendingReason};
pub use store::{CopyStatus, GuidSlot, ReferenceCopy, ReferenceStore};

use crate::channel::EventChannel;
use crate::config::CohortSettings;
use crate::conflict::{ConflictId, ConflictKind, ConflictResolver};
use crate::connector::RepositoryConnector;
use crate::error::{CohortError, Result};
use crate::membership::{MemberStatus, MembershipManager};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::type_registry::{RegistrationOutcome, TypeRegistry};
use crate::types::{
    now_millis, ClassificationAction, EventId, EventKind, EventPayload, InstanceAction,
    InstanceBody, InstanceCategory, InstanceEvent, InstanceGuid, MemberId, TypeGuid,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use pending::PendingBuffer;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Shared services the engine components are wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub membership: Arc<MembershipManager>,
    pub registry: Arc<TypeRegistry>,
    pub conflicts: Arc<ConflictResolver>,
    pub channel: Arc<dyn EventChannel>,
    pub local_connector: Arc<dyn RepositoryConnector>,
}

/// What applying one inbound event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already applied (or superseded); no-op.
    Duplicate,
    Buffered(PendingReason),
    /// Conflicting write held back; see the conflict record.
    Quarantined(ConflictId),
    /// Type definition rejected by the registry.
    Rejected(String),
    /// Not applied and not retained.
    Dropped(String),
    /// Our own event echoed back by the channel.
    Ignored,
}

impl ApplyOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Duplicate => "duplicate",
            Self::Buffered(_) => "buffered",
            Self::Quarantined(_) => "quarantined",
            Self::Rejected(_) => "rejected",
            Self::Dropped(_) => "dropped",
            Self::Ignored => "ignored",
        }
    }
}

/// An inbound event that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyFailure {
    pub event_id: EventId,
    pub origin_member_id: MemberId,
    pub instance_guid: InstanceGuid,
    pub kind: String,
    pub error: String,
    pub at_ms: i64,
}

/// Result of mutating a slot, decided under the slot's lock.
enum SlotResult {
    Applied,
    Duplicate,
    Conflict { home: Option<MemberId> },
    ClassificationConflict { owner: MemberId },
    MissingInstance,
    Dropped(String),
}

pub struct ReplicationEngine {
    local_member_id: MemberId,
    membership: Arc<MembershipManager>,
    registry: Arc<TypeRegistry>,
    conflicts: Arc<ConflictResolver>,
    channel: Arc<dyn EventChannel>,
    local_connector: Arc<dyn RepositoryConnector>,
    retry: RetryConfig,
    store: ReferenceStore,
    pending: Mutex<PendingBuffer>,
    stripes: Vec<Mutex<()>>,
    /// Held across read, version assignment and publish of a local change.
    outbound_stripes: Vec<tokio::sync::Mutex<()>>,
    failures: Mutex<VecDeque<ApplyFailure>>,
    failure_capacity: usize,
    /// Last version assigned to each locally homed instance.
    local_versions: DashMap<InstanceGuid, u64>,
}

impl ReplicationEngine {
    pub fn new(local_member_id: MemberId, settings: &CohortSettings, deps: Collaborators) -> Self {
        let replication = &settings.replication;
        let stripe_count = replication.lock_stripes.max(1);
        let stripes = (0..stripe_count).map(|_| Mutex::new(())).collect();
        let outbound_stripes = (0..stripe_count).map(|_| tokio::sync::Mutex::new(())).collect();
        Self {
            local_member_id,
            membership: deps.membership,
            registry: deps.registry,
            conflicts: deps.conflicts,
            channel: deps.channel,
            local_connector: deps.local_connector,
            retry: settings.outbound.retry_config(),
            store: ReferenceStore::new(),
            pending: Mutex::new(PendingBuffer::new(
                replication.pending_capacity,
                replication.pending_timeout_duration(),
            )),
            stripes,
            outbound_stripes,
            failures: Mutex::new(VecDeque::new()),
            failure_capacity: replication.failure_log_capacity.max(1),
            local_versions: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ReferenceStore {
        &self.store
    }

    pub fn local_member_id(&self) -> &MemberId {
        &self.local_member_id
    }

    /// Apply one inbound event. Safe to call with redelivered events.
    pub fn apply_inbound_event(&self, event: &InstanceEvent) -> Result<ApplyOutcome> {
        self.apply_tracked(event, Instant::now())
    }

    fn apply_tracked(&self, event: &InstanceEvent, buffered_at: Instant) -> Result<ApplyOutcome> {
        let start = Instant::now();
        let origin = event.origin_member_id.as_str();
        let result = self.apply_one(event, buffered_at);

        match &result {
            Ok(outcome) => {
                metrics::record_inbound_event(origin, outcome.label());
                debug!(
                    event_id = %event.event_id,
                    origin,
                    kind = %event.kind,
                    instance_guid = %event.instance_guid,
                    version = event.instance_version,
                    outcome = outcome.label(),
                    "Inbound event processed"
                );
            }
            Err(e) => {
                metrics::record_inbound_event(origin, "failed");
                self.record_failure(event, e);
            }
        }
        metrics::record_apply_latency(origin, start.elapsed());
        result
    }

    fn apply_one(&self, event: &InstanceEvent, buffered_at: Instant) -> Result<ApplyOutcome> {
        event.validate()?;
        let origin = &event.origin_member_id;

        if origin == &self.local_member_id {
            return Ok(ApplyOutcome::Ignored);
        }

        match self.membership.status_of(origin) {
            None => {
                return self.buffer(
                    event,
                    PendingReason::AwaitingRegistration(origin.clone()),
                    buffered_at,
                )
            }
            Some(MemberStatus::Deregistered) => {
                return Ok(ApplyOutcome::Dropped(format!("origin {origin} is deregistered")))
            }
            Some(_) => {
                self.membership.record_activity(origin);
            }
        }

        if event.kind.is_type_event() {
            return self.apply_type_event(event);
        }

        {
            let pending = self.pending.lock();
            if pending.contains_event(&event.event_id) {
                return Ok(ApplyOutcome::Duplicate);
            }
            if pending.has_pending_for(origin, &event.instance_guid) {
                drop(pending);
                return self.buffer(
                    event,
                    PendingReason::QueuedBehind(event.instance_guid.clone()),
                    buffered_at,
                );
            }
        }

        if let Some(type_guid) = event.required_type() {
            if !self.registry.is_type_known(type_guid) {
                return self.buffer(event, PendingReason::AwaitingType(type_guid.clone()), buffered_at);
            }
        }

        let result = match &event.payload {
            EventPayload::Reidentify { previous_guid, body } => {
                self.apply_reidentify(event, previous_guid, body)?
            }
            _ => {
                let _stripe = self.stripe_for(&event.instance_guid).lock();
                self.apply_locked(event)?
            }
        };

        let outcome = match result {
            SlotResult::Applied => ApplyOutcome::Applied,
            SlotResult::Duplicate => ApplyOutcome::Duplicate,
            SlotResult::Dropped(reason) => ApplyOutcome::Dropped(reason),
            SlotResult::MissingInstance => {
                return self.buffer(
                    event,
                    PendingReason::AwaitingInstance(event.instance_guid.clone()),
                    buffered_at,
                )
            }
            SlotResult::Conflict { home } => {
                let mut members = vec![origin.clone()];
                members.extend(home.clone());
                let record = self.conflicts.report(
                    ConflictKind::DuplicateGuid,
                    &members,
                    event.instance_guid.as_str(),
                    format!(
                        "{} from {} claims instance homed at {}; copy quarantined",
                        event.kind,
                        origin,
                        home.as_ref().map(|h| h.as_str()).unwrap_or("another member")
                    ),
                );
                ApplyOutcome::Quarantined(record.id)
            }
            SlotResult::ClassificationConflict { owner } => {
                let record = self.conflicts.report(
                    ConflictKind::ClassificationConflict,
                    &[origin.clone(), owner.clone()],
                    event.instance_guid.as_str(),
                    format!(
                        "{} from {} on a classification owned by {}",
                        event.kind, origin, owner
                    ),
                );
                ApplyOutcome::Quarantined(record.id)
            }
        };

        if outcome == ApplyOutcome::Applied && event.kind.category().is_some() {
            self.release_pending_for_instance(&event.instance_guid);
        }
        Ok(outcome)
    }

    fn apply_type_event(&self, event: &InstanceEvent) -> Result<ApplyOutcome> {
        let EventPayload::TypeDef(def) = &event.payload else {
            return Err(CohortError::MalformedEvent(format!(
                "{} without a type definition",
                event.kind
            )));
        };
        let already_current = self
            .registry
            .get(&def.guid)
            .is_some_and(|stored| stored.version >= def.version);

        match self.registry.register_type(def.clone(), &event.origin_member_id) {
            RegistrationOutcome::Rejected(reason) => Ok(ApplyOutcome::Rejected(reason)),
            RegistrationOutcome::Accepted | RegistrationOutcome::AcceptedAsNewVersion => {
                self.release_pending_for_type(&def.guid);
                if already_current {
                    Ok(ApplyOutcome::Duplicate)
                } else {
                    Ok(ApplyOutcome::Applied)
                }
            }
        }
    }

    fn apply_locked(&self, event: &InstanceEvent) -> Result<SlotResult> {
        match event.kind {
            EventKind::Classification(action) => Ok(self.apply_classification(event, action)),
            EventKind::Entity(InstanceAction::Rehomed)
            | EventKind::Relationship(InstanceAction::Rehomed) => Ok(self.apply_rehome(event)),
            EventKind::Entity(action) | EventKind::Relationship(action) => {
                Ok(self.apply_instance(event, action))
            }
            EventKind::TypeDefAdded | EventKind::TypeDefUpdated => Err(CohortError::Internal(
                "type event routed to instance apply".to_string(),
            )),
        }
    }

    fn apply_instance(&self, event: &InstanceEvent, action: InstanceAction) -> SlotResult {
        let origin = &event.origin_member_id;
        let local = &self.local_member_id;

        self.store.with_slot(&event.instance_guid, |slot| {
            if let Some(existing) = slot.copies.get(origin) {
                if event.instance_version <= existing.instance_version {
                    return SlotResult::Duplicate;
                }
            }

            let origin_is_home = match &slot.home {
                None => true,
                Some(home) if home == origin => true,
                // A purged home copy no longer holds the GUID.
                Some(home) if home != local => slot
                    .copies
                    .get(home)
                    .is_some_and(|c| c.status == CopyStatus::Purged),
                Some(_) => false,
            };

            let previous = slot.copies.get(origin).cloned();
            let mut copy = build_copy(event, action, previous.as_ref());

            if !origin_is_home {
                copy.status = CopyStatus::Quarantined;
                slot.copies.insert(origin.clone(), copy);
                return SlotResult::Conflict {
                    home: slot.home.clone(),
                };
            }

            if let Some(old_home) = slot.home.replace(origin.clone()) {
                if &old_home != origin {
                    slot.copies.remove(&old_home);
                }
            }
            slot.copies.insert(origin.clone(), copy);
            SlotResult::Applied
        })
    }

    fn apply_rehome(&self, event: &InstanceEvent) -> SlotResult {
        let EventPayload::Rehome {
            previous_home,
            body,
        } = &event.payload
        else {
            return SlotResult::Dropped("REHOMED without rehome payload".to_string());
        };
        let origin = &event.origin_member_id;

        self.store.with_slot(&event.instance_guid, |slot| {
            if slot.home.as_ref() == Some(origin) {
                let existing = slot.copies.get(origin);
                if existing.is_some_and(|c| event.instance_version <= c.instance_version) {
                    return SlotResult::Duplicate;
                }
                let copy = copy_from_body(event, body.clone(), existing);
                slot.copies.insert(origin.clone(), copy);
                return SlotResult::Applied;
            }
            if slot.home.as_ref().is_some_and(|h| h != previous_home) {
                let mut copy = copy_from_body(event, body.clone(), slot.copies.get(origin));
                copy.status = CopyStatus::Quarantined;
                slot.copies.insert(origin.clone(), copy);
                return SlotResult::Conflict {
                    home: slot.home.clone(),
                };
            }
            if let Some(prev) = slot.copies.get(previous_home) {
                if event.instance_version <= prev.instance_version {
                    return SlotResult::Duplicate;
                }
            }

            // Old key out, new key in, home switched: one slot mutation.
            let base = slot
                .copies
                .remove(previous_home)
                .or_else(|| slot.copies.get(origin).cloned());
            let copy = copy_from_body(event, body.clone(), base.as_ref());
            slot.copies.insert(origin.clone(), copy);
            slot.home = Some(origin.clone());
            info!(
                instance_guid = %event.instance_guid,
                from = %previous_home,
                to = %origin,
                version = event.instance_version,
                "Instance rehomed"
            );
            SlotResult::Applied
        })
    }

    fn apply_reidentify(
        &self,
        event: &InstanceEvent,
        previous_guid: &InstanceGuid,
        body: &InstanceBody,
    ) -> Result<SlotResult> {
        let new_guid = &event.instance_guid;
        let origin = &event.origin_member_id;

        let a = self.stripe_index(previous_guid);
        let b = self.stripe_index(new_guid);
        let (lo, hi) = (a.min(b), a.max(b));
        let _first = self.stripes[lo].lock();
        let _second = (lo != hi).then(|| self.stripes[hi].lock());

        let new_slot = self.store.slot(new_guid).unwrap_or_default();
        if let Some(existing) = new_slot.copies.get(origin) {
            if event.instance_version <= existing.instance_version {
                return Ok(SlotResult::Duplicate);
            }
        }

        let old_slot = self.store.slot(previous_guid).unwrap_or_default();
        let new_home_taken = new_slot.home.as_ref().is_some_and(|h| h != origin);
        let old_home_other = old_slot.home.as_ref().is_some_and(|h| h != origin);

        if new_home_taken || old_home_other {
            let home = if new_home_taken {
                new_slot.home.clone()
            } else {
                old_slot.home.clone()
            };
            self.store.with_slot(new_guid, |slot| {
                let mut copy = copy_from_body(event, body.clone(), slot.copies.get(origin));
                copy.status = CopyStatus::Quarantined;
                slot.copies.insert(origin.clone(), copy);
            });
            return Ok(SlotResult::Conflict { home });
        }

        if let Some(old) = old_slot.copies.get(origin) {
            if event.instance_version <= old.instance_version {
                return Ok(SlotResult::Duplicate);
            }
        }

        let base = old_slot.copies.get(origin).cloned();
        let copy = copy_from_body(event, body.clone(), base.as_ref());
        self.store.with_slot(new_guid, |slot| {
            slot.copies.insert(origin.clone(), copy);
            slot.home = Some(origin.clone());
        });
        self.store.with_slot(previous_guid, |slot| {
            slot.copies.remove(origin);
            if slot.home.as_ref() == Some(origin) {
                slot.home = None;
            }
        });

        info!(
            from = %previous_guid,
            to = %new_guid,
            home = %origin,
            "Instance reidentified"
        );
        Ok(SlotResult::Applied)
    }

    fn apply_classification(&self, event: &InstanceEvent, action: ClassificationAction) -> SlotResult {
        let origin = &event.origin_member_id;
        let local = &self.local_member_id;

        self.store.with_slot(&event.instance_guid, |slot| {
            let Some(home) = slot.home.clone() else {
                return SlotResult::MissingInstance;
            };
            if &home == local {
                return SlotResult::Dropped(
                    "classification of a locally homed instance belongs to the local repository"
                        .to_string(),
                );
            }
            let Some(copy) = slot.copies.get_mut(&home) else {
                return SlotResult::MissingInstance;
            };
            let Some(body) = copy.body.as_mut() else {
                return SlotResult::Dropped(format!(
                    "instance {} has no body ({:?})",
                    event.instance_guid, copy.status
                ));
            };

            match (&event.payload, action) {
                (EventPayload::Classification(incoming), _) => {
                    match body.classifications.get(&incoming.name) {
                        Some(existing) if &existing.origin_member_id != origin => {
                            SlotResult::ClassificationConflict {
                                owner: existing.origin_member_id.clone(),
                            }
                        }
                        Some(existing) if incoming.version <= existing.version => {
                            SlotResult::Duplicate
                        }
                        _ => {
                            let mut classification = incoming.clone();
                            classification.origin_member_id = origin.clone();
                            body.classifications
                                .insert(classification.name.clone(), classification);
                            copy.last_applied_event_id = event.event_id.clone();
                            SlotResult::Applied
                        }
                    }
                }
                (EventPayload::Declassify { name }, ClassificationAction::Declassified) => {
                    match body.classifications.get(name) {
                        None => SlotResult::Duplicate,
                        Some(existing) if &existing.origin_member_id != origin => {
                            SlotResult::ClassificationConflict {
                                owner: existing.origin_member_id.clone(),
                            }
                        }
                        Some(_) => {
                            body.classifications.remove(name);
                            copy.last_applied_event_id = event.event_id.clone();
                            SlotResult::Applied
                        }
                    }
                }
                _ => SlotResult::Dropped(format!("{} with mismatched payload", event.kind)),
            }
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pending buffer
    // ═══════════════════════════════════════════════════════════════════════

    fn buffer(
        &self,
        event: &InstanceEvent,
        reason: PendingReason,
        buffered_at: Instant,
    ) -> Result<ApplyOutcome> {
        let now = Instant::now();
        let mut pending = self.pending.lock();

        if now.saturating_duration_since(buffered_at) > pending.timeout() {
            drop(pending);
            warn!(
                event_id = %event.event_id,
                origin = %event.origin_member_id,
                reason = %reason,
                "Pending event timed out, dropped"
            );
            metrics::record_pending_dropped("timeout", 1);
            return Ok(ApplyOutcome::Dropped(format!("timed out while {reason}")));
        }

        match pending.push(event.clone(), reason.clone(), buffered_at, now) {
            Ok(evicted) => {
                let len = pending.len();
                drop(pending);
                self.log_evicted(&evicted);
                metrics::set_pending_events(len);
                debug!(
                    event_id = %event.event_id,
                    origin = %event.origin_member_id,
                    reason = %reason,
                    pending = len,
                    "Inbound event buffered"
                );
                Ok(ApplyOutcome::Buffered(reason))
            }
            Err(overflow) => {
                drop(pending);
                warn!(
                    event_id = %event.event_id,
                    origin = %event.origin_member_id,
                    capacity = overflow.capacity,
                    "Pending buffer full, event dropped"
                );
                metrics::record_pending_dropped("overflow", 1);
                Ok(ApplyOutcome::Dropped(format!(
                    "pending buffer full ({} events)",
                    overflow.capacity
                )))
            }
        }
    }

    fn log_evicted(&self, evicted: &[PendingEntry]) {
        for entry in evicted {
            warn!(
                event_id = %entry.event.event_id,
                origin = %entry.event.origin_member_id,
                instance_guid = %entry.event.instance_guid,
                reason = %entry.reason,
                "Pending event expired, dropped"
            );
        }
        metrics::record_pending_dropped("timeout", evicted.len());
    }

    /// Drop pending events older than the timeout; returns how many.
    pub fn evict_expired(&self) -> usize {
        let (evicted, len) = {
            let mut pending = self.pending.lock();
            let evicted = pending.evict_expired(Instant::now());
            (evicted, pending.len())
        };
        self.log_evicted(&evicted);
        metrics::set_pending_events(len);
        evicted.len()
    }

    /// Re-apply events held for `origin` (e.g. after it registered).
    pub fn release_pending_for_origin(&self, origin: &MemberId) -> usize {
        let entries = self.pending.lock().take_for_origins(std::slice::from_ref(origin));
        self.reapply(entries)
    }

    /// Re-apply events waiting on a type, with the rest of their partitions.
    pub fn release_pending_for_type(&self, type_guid: &TypeGuid) -> usize {
        let entries = {
            let mut pending = self.pending.lock();
            let origins = pending.origins_waiting_on(&PendingReason::AwaitingType(type_guid.clone()));
            if origins.is_empty() {
                return 0;
            }
            pending.take_for_origins(&origins)
        };
        self.reapply(entries)
    }

    fn release_pending_for_instance(&self, guid: &InstanceGuid) -> usize {
        let entries = {
            let mut pending = self.pending.lock();
            let origins = pending.origins_waiting_on(&PendingReason::AwaitingInstance(guid.clone()));
            if origins.is_empty() {
                return 0;
            }
            pending.take_for_origins(&origins)
        };
        self.reapply(entries)
    }

    fn reapply(&self, entries: Vec<PendingEntry>) -> usize {
        if entries.is_empty() {
            return 0;
        }
        let mut released = 0;
        for entry in entries {
            match self.apply_tracked(&entry.event, entry.buffered_at) {
                Ok(ApplyOutcome::Buffered(_)) => {}
                Ok(_) => released += 1,
                Err(e) => debug!(event_id = %entry.event.event_id, error = %e, "Released event failed"),
            }
        }
        metrics::record_pending_released(released);
        metrics::set_pending_events(self.pending_len());
        released
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_reason_counts(&self) -> std::collections::BTreeMap<&'static str, usize> {
        self.pending.lock().reason_counts()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Member lifecycle effects
    // ═══════════════════════════════════════════════════════════════════════

    /// Mark every copy from a deregistered member STALE and drop its pending
    /// events. Copies are excluded from queries but not removed.
    pub fn mark_member_stale(&self, member: &MemberId) -> usize {
        let dropped = self.pending.lock().discard_origin(member);
        if !dropped.is_empty() {
            warn!(member_id = %member, count = dropped.len(), "Pending events from deregistered member dropped");
            metrics::record_pending_dropped("deregistered", dropped.len());
        }
        let changed = self.store.set_status_for_member(member, CopyStatus::Stale);
        info!(member_id = %member, copies = changed, "Reference copies marked stale");
        metrics::record_member_copies(member.as_str(), "stale", changed);
        changed
    }

    /// Remove every copy from a member once its removal is confirmed.
    pub fn purge_member_copies(&self, member: &MemberId) -> usize {
        let purged = self.store.purge_member(member);
        info!(member_id = %member, copies = purged, "Reference copies purged");
        metrics::record_member_copies(member.as_str(), "purged", purged);
        metrics::set_reference_copies(self.store.len());
        purged
    }

    /// Raise DUPLICATE_GUID for an instance that several members serve as
    /// home. Repeated reports coalesce into the open record.
    pub fn report_home_collision(&self, guid: &InstanceGuid, homes: &[MemberId]) -> ConflictId {
        let names: Vec<&str> = homes.iter().map(|m| m.as_str()).collect();
        let record = self.conflicts.report(
            ConflictKind::DuplicateGuid,
            homes,
            guid.as_str(),
            format!("instance {guid} served as home by {}", names.join(", ")),
        );
        debug!(instance_guid = %guid, conflict_id = %record.id, "Home collision reported");
        record.id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Failure log
    // ═══════════════════════════════════════════════════════════════════════

    fn record_failure(&self, event: &InstanceEvent, error: &CohortError) {
        warn!(
            event_id = %event.event_id,
            origin = %event.origin_member_id,
            instance_guid = %event.instance_guid,
            kind = %event.kind,
            error = %error,
            "Inbound event failed to apply"
        );
        metrics::record_apply_failure(event.origin_member_id.as_str());
        let mut failures = self.failures.lock();
        if failures.len() >= self.failure_capacity {
            failures.pop_front();
        }
        failures.push_back(ApplyFailure {
            event_id: event.event_id.clone(),
            origin_member_id: event.origin_member_id.clone(),
            instance_guid: event.instance_guid.clone(),
            kind: event.kind.to_string(),
            error: error.to_string(),
            at_ms: now_millis(),
        });
    }

    /// Most recent apply failures, oldest first.
    pub fn recent_failures(&self) -> Vec<ApplyFailure> {
        self.failures.lock().iter().cloned().collect()
    }

    fn stripe_index(&self, guid: &InstanceGuid) -> usize {
        let mut hasher = DefaultHasher::new();
        guid.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    fn stripe_for(&self, guid: &InstanceGuid) -> &Mutex<()> {
        &self.stripes[self.stripe_index(guid)]
    }
}

/// Copy resulting from an instance lifecycle event.
fn build_copy(
    event: &InstanceEvent,
    action: InstanceAction,
    previous: Option<&ReferenceCopy>,
) -> ReferenceCopy {
    let previous_body = previous.and_then(|p| p.body.clone());
    let (status, body) = match action {
        InstanceAction::Purged => (CopyStatus::Purged, None),
        InstanceAction::Deleted => (
            CopyStatus::Deleted,
            event.body().cloned().or(previous_body),
        ),
        _ => (CopyStatus::Current, event.body().cloned()),
    };
    let body = body.map(|b| merge_foreign_classifications(b, previous, &event.origin_member_id));
    ReferenceCopy {
        instance_guid: event.instance_guid.clone(),
        home_member_id: event.origin_member_id.clone(),
        instance_version: event.instance_version,
        last_applied_event_id: event.event_id.clone(),
        category: event.kind.category().unwrap_or(InstanceCategory::Entity),
        status,
        body,
    }
}

fn copy_from_body(
    event: &InstanceEvent,
    body: InstanceBody,
    previous: Option<&ReferenceCopy>,
) -> ReferenceCopy {
    ReferenceCopy {
        instance_guid: event.instance_guid.clone(),
        home_member_id: event.origin_member_id.clone(),
        instance_version: event.instance_version,
        last_applied_event_id: event.event_id.clone(),
        category: event.kind.category().unwrap_or(InstanceCategory::Entity),
        status: CopyStatus::Current,
        body: Some(merge_foreign_classifications(body, previous, &event.origin_member_id)),
    }
}

/// Keep classifications owned by other members across a body replacement.
fn merge_foreign_classifications(
    mut body: InstanceBody,
    previous: Option<&ReferenceCopy>,
    home: &MemberId,
) -> InstanceBody {
    if let Some(prev_body) = previous.and_then(|p| p.body.as_ref()) {
        for (name, classification) in &prev_body.classifications {
            if &classification.origin_member_id != home {
                body.classifications
                    .entry(name.clone())
                    .or_insert_with(|| classification.clone());
            }
        }
    }
    body
}
