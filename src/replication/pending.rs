// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded buffer for inbound events that cannot be applied yet.
//!
//! An event waits here while its origin has not registered, its type is not
//! known, the instance it classifies has not arrived, or an earlier event
//! for the same instance from the same origin is itself waiting.
//!
//! Entries are kept in arrival order. Capacity is fixed; when full, expired
//! entries are evicted first and the incoming event is refused if that does
//! not free a slot. Released entries keep their original arrival time, so
//! re-buffering never extends an event's deadline.

use crate::types::{EventId, InstanceEvent, InstanceGuid, MemberId, TypeGuid};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Why an event is waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingReason {
    AwaitingRegistration(MemberId),
    AwaitingType(TypeGuid),
    AwaitingInstance(InstanceGuid),
    /// An earlier event for the same instance and origin is pending.
    QueuedBehind(InstanceGuid),
}

impl fmt::Display for PendingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingRegistration(m) => write!(f, "awaiting registration of {m}"),
            Self::AwaitingType(t) => write!(f, "awaiting type {t}"),
            Self::AwaitingInstance(g) => write!(f, "awaiting instance {g}"),
            Self::QueuedBehind(g) => write!(f, "queued behind pending event for {g}"),
        }
    }
}

/// One buffered event.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub event: InstanceEvent,
    pub reason: PendingReason,
    pub buffered_at: Instant,
}

/// The buffer refused an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOverflow {
    pub capacity: usize,
}

#[derive(Debug)]
pub struct PendingBuffer {
    entries: BTreeMap<u64, PendingEntry>,
    next_seq: u64,
    capacity: usize,
    timeout: Duration,
}

impl PendingBuffer {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
            capacity,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Buffer an event. Returns the evicted (expired) events on success.
    pub fn push(
        &mut self,
        event: InstanceEvent,
        reason: PendingReason,
        buffered_at: Instant,
        now: Instant,
    ) -> Result<Vec<PendingEntry>, PendingOverflow> {
        let mut evicted = Vec::new();
        if self.entries.len() >= self.capacity {
            evicted = self.evict_expired(now);
            // Evicting anything frees a slot, so a full buffer here evicted nothing.
            if self.entries.len() >= self.capacity {
                return Err(PendingOverflow {
                    capacity: self.capacity,
                });
            }
        }
        self.next_seq += 1;
        self.entries.insert(
            self.next_seq,
            PendingEntry {
                event,
                reason,
                buffered_at,
            },
        );
        Ok(evicted)
    }

    /// Remove and return entries older than the timeout.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<PendingEntry> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.buffered_at) > timeout)
            .map(|(seq, _)| *seq)
            .collect();
        expired
            .into_iter()
            .filter_map(|seq| self.entries.remove(&seq))
            .collect()
    }

    /// Whether an event from `origin` for `guid` is waiting.
    pub fn has_pending_for(&self, origin: &MemberId, guid: &InstanceGuid) -> bool {
        self.entries
            .values()
            .any(|e| &e.event.origin_member_id == origin && &e.event.instance_guid == guid)
    }

    pub fn contains_event(&self, event_id: &EventId) -> bool {
        self.entries.values().any(|e| &e.event.event_id == event_id)
    }

    /// Take every entry from the given origins, in arrival order.
    pub fn take_for_origins(&mut self, origins: &[MemberId]) -> Vec<PendingEntry> {
        self.take_where(|e| origins.contains(&e.event.origin_member_id))
    }

    /// Origins with at least one entry matching `reason`.
    pub fn origins_waiting_on(&self, reason: &PendingReason) -> Vec<MemberId> {
        let mut origins: Vec<MemberId> = self
            .entries
            .values()
            .filter(|e| &e.reason == reason)
            .map(|e| e.event.origin_member_id.clone())
            .collect();
        origins.sort();
        origins.dedup();
        origins
    }

    /// Drop every entry from an origin (it deregistered).
    pub fn discard_origin(&mut self, origin: &MemberId) -> Vec<PendingEntry> {
        self.take_where(|e| &e.event.origin_member_id == origin)
    }

    fn take_where(&mut self, keep: impl Fn(&PendingEntry) -> bool) -> Vec<PendingEntry> {
        let seqs: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| keep(e))
            .map(|(seq, _)| *seq)
            .collect();
        seqs.into_iter()
            .filter_map(|seq| self.entries.remove(&seq))
            .collect()
    }

    /// Count of entries per reason kind, for health reporting.
    pub fn reason_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            let key = match entry.reason {
                PendingReason::AwaitingRegistration(_) => "awaiting_registration",
                PendingReason::AwaitingType(_) => "awaiting_type",
                PendingReason::AwaitingInstance(_) => "awaiting_instance",
                PendingReason::QueuedBehind(_) => "queued_behind",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}
