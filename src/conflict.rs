// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict bookkeeping.
//!
//! The resolver records conflicts; it never arbitrates. Detection sites
//! (type registry, replication) quarantine the offending write and call
//! [`ConflictResolver::report`]. Choosing a winner is an operator action,
//! surfaced here only as [`ConflictResolver::resolve`] / [`ConflictResolver::ignore`].
//!
//! Reports of the same kind against the same reference are coalesced into
//! one OPEN record while they arrive within the configured window, so a
//! redelivered event does not produce a second record.

use crate::metrics;
use crate::types::{now_millis, MemberId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Identifier of a conflict record, unique per resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(pub u64);

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conflict-{}", self.0)
    }
}

/// What kind of conflict was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictKind {
    /// Two members claim to be home for the same instance GUID.
    DuplicateGuid,
    /// A type definition cannot be reconciled with the canonical one.
    TypeIncompatible,
    /// A member changed a classification owned by another member.
    ClassificationConflict,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DuplicateGuid => "DUPLICATE_GUID",
            Self::TypeIncompatible => "TYPE_INCOMPATIBLE",
            Self::ClassificationConflict => "CLASSIFICATION_CONFLICT",
        })
    }
}

/// Operator-facing state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionState {
    Open,
    Ignored,
    Resolved,
}

/// A detected conflict. Records are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub kind: ConflictKind,
    /// Sorted, without duplicates.
    pub involved_member_ids: Vec<MemberId>,
    /// Instance GUID or type GUID/name the conflict is about.
    pub reference: String,
    /// Most recent human readable description.
    pub detail: String,
    pub resolution_state: ResolutionState,
    /// How many reports were coalesced into this record.
    pub occurrences: u32,
    pub first_reported_at_ms: i64,
    pub last_reported_at_ms: i64,
}

impl ConflictRecord {
    pub fn is_open(&self) -> bool {
        self.resolution_state == ResolutionState::Open
    }

    pub fn involves(&self, member_id: &MemberId) -> bool {
        self.involved_member_ids.binary_search(member_id).is_ok()
    }
}

struct Entry {
    record: ConflictRecord,
    last_seen: Instant,
}

#[derive(Default)]
struct ConflictBook {
    records: BTreeMap<ConflictId, Entry>,
    /// (kind, reference) → the OPEN record reports coalesce into.
    open_index: HashMap<(ConflictKind, String), ConflictId>,
    next_id: u64,
}

impl ConflictBook {
    fn open_count(&self) -> usize {
        self.records.values().filter(|e| e.record.is_open()).count()
    }
}

/// Creates, coalesces and exposes conflict records.
pub struct ConflictResolver {
    coalesce_window: Duration,
    book: RwLock<ConflictBook>,
}

impl ConflictResolver {
    pub fn new(coalesce_window: Duration) -> Self {
        Self {
            coalesce_window,
            book: RwLock::new(ConflictBook::default()),
        }
    }

    /// Record a conflict, coalescing with an OPEN record of the same kind and
    /// reference reported within the window.
    pub fn report(
        &self,
        kind: ConflictKind,
        members: &[MemberId],
        reference: &str,
        detail: impl Into<String>,
    ) -> ConflictRecord {
        self.report_at(kind, members, reference, detail, Instant::now())
    }

    /// [`report`](Self::report) with an explicit clock reading.
    pub fn report_at(
        &self,
        kind: ConflictKind,
        members: &[MemberId],
        reference: &str,
        detail: impl Into<String>,
        now: Instant,
    ) -> ConflictRecord {
        let detail = detail.into();
        let now_ms = now_millis();
        let key = (kind, reference.to_string());
        let mut book = self.book.write();

        let coalesce_into = book.open_index.get(&key).copied().filter(|id| {
            book.records.get(id).is_some_and(|entry| {
                entry.record.is_open()
                    && now.saturating_duration_since(entry.last_seen) <= self.coalesce_window
            })
        });

        if let Some(id) = coalesce_into {
            if let Some(entry) = book.records.get_mut(&id) {
                let record = &mut entry.record;
                for member in members {
                    if let Err(pos) = record.involved_member_ids.binary_search(member) {
                        record.involved_member_ids.insert(pos, member.clone());
                    }
                }
                record.occurrences = record.occurrences.saturating_add(1);
                record.detail = detail;
                record.last_reported_at_ms = now_ms;
                entry.last_seen = now;
                metrics::record_conflict(&kind.to_string(), true);
                info!(
                    conflict_id = %id,
                    kind = %kind,
                    reference,
                    occurrences = record.occurrences,
                    "Conflict report coalesced"
                );
                return record.clone();
            }
        }

        book.next_id += 1;
        let id = ConflictId(book.next_id);
        let mut involved: Vec<MemberId> = members.to_vec();
        involved.sort();
        involved.dedup();

        let record = ConflictRecord {
            id,
            kind,
            involved_member_ids: involved,
            reference: reference.to_string(),
            detail,
            resolution_state: ResolutionState::Open,
            occurrences: 1,
            first_reported_at_ms: now_ms,
            last_reported_at_ms: now_ms,
        };

        warn!(
            conflict_id = %id,
            kind = %kind,
            reference,
            members = ?record.involved_member_ids,
            detail = %record.detail,
            "Conflict detected"
        );

        book.records.insert(
            id,
            Entry {
                record: record.clone(),
                last_seen: now,
            },
        );
        book.open_index.insert(key, id);
        metrics::record_conflict(&kind.to_string(), false);
        metrics::set_open_conflicts(book.open_count());
        record
    }

    /// Snapshot of all OPEN records, oldest first.
    ///
    /// The snapshot is taken up front; records raised while iterating are
    /// not included.
    pub fn open(&self) -> impl Iterator<Item = ConflictRecord> {
        let book = self.book.read();
        let open: Vec<ConflictRecord> = book
            .records
            .values()
            .filter(|e| e.record.is_open())
            .map(|e| e.record.clone())
            .collect();
        open.into_iter()
    }

    /// Every record ever raised, oldest first.
    pub fn all(&self) -> Vec<ConflictRecord> {
        self.book.read().records.values().map(|e| e.record.clone()).collect()
    }

    pub fn get(&self, id: ConflictId) -> Option<ConflictRecord> {
        self.book.read().records.get(&id).map(|e| e.record.clone())
    }

    pub fn open_count(&self) -> usize {
        self.book.read().open_count()
    }

    /// OPEN record for a kind and reference, if any.
    pub fn open_for(&self, kind: ConflictKind, reference: &str) -> Option<ConflictRecord> {
        let book = self.book.read();
        book.open_index
            .get(&(kind, reference.to_string()))
            .and_then(|id| book.records.get(id))
            .map(|e| e.record.clone())
    }

    /// Mark a record RESOLVED. Returns `None` for an unknown id.
    pub fn resolve(&self, id: ConflictId) -> Option<ConflictRecord> {
        self.transition(id, ResolutionState::Resolved)
    }

    /// Mark a record IGNORED. A RESOLVED record stays RESOLVED.
    pub fn ignore(&self, id: ConflictId) -> Option<ConflictRecord> {
        self.transition(id, ResolutionState::Ignored)
    }

    fn transition(&self, id: ConflictId, target: ResolutionState) -> Option<ConflictRecord> {
        let mut book = self.book.write();
        let entry = book.records.get_mut(&id)?;
        let record = &mut entry.record;
        if record.resolution_state != ResolutionState::Resolved {
            record.resolution_state = target;
        }
        let key = (record.kind, record.reference.clone());
        let snapshot = record.clone();

        if book.open_index.get(&key) == Some(&id) {
            book.open_index.remove(&key);
        }
        info!(conflict_id = %id, state = ?snapshot.resolution_state, "Conflict state changed");
        metrics::set_open_conflicts(book.open_count());
        Some(snapshot)
    }
}
