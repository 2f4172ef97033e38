// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Inbound dispatch: one ordered queue per origin member.
//!
//! Each origin gets a dedicated worker task fed by a bounded mpsc queue, so
//! one member's events are applied strictly in arrival order while
//! different members' streams proceed concurrently.
//!
//! # Backpressure
//!
//! When a partition queue is full, `dispatch` waits for room instead of
//! dropping the event. The wait is reported as a backpressure metric.
//!
//! # Shutdown
//!
//! [`InboundDispatcher::close`] drops every queue sender; each worker
//! applies whatever is already queued and then exits.
//! [`InboundDispatcher::drain_partition`] does the same for one origin.

use crate::error::{CohortError, Result};
use crate::metrics;
use crate::replication::ReplicationEngine;
use crate::resilience::RateLimiter;
use crate::types::{InstanceEvent, MemberId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

pub struct InboundDispatcher {
    engine: Arc<ReplicationEngine>,
    queue_depth: usize,
    rate_limiter: Option<Arc<RateLimiter>>,
    partitions: DashMap<MemberId, mpsc::Sender<InstanceEvent>>,
    workers: Mutex<Vec<(MemberId, JoinHandle<()>)>>,
    applied: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl InboundDispatcher {
    pub fn new(
        engine: Arc<ReplicationEngine>,
        queue_depth: usize,
        rate_limiter: Option<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            engine,
            queue_depth: queue_depth.max(1),
            rate_limiter,
            partitions: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            applied: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an event on its origin's partition.
    pub async fn dispatch(&self, event: InstanceEvent) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CohortError::Shutdown);
        }
        let origin = event.origin_member_id.clone();
        let sender = self.partition_for(&origin);

        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                metrics::record_dispatch_backpressure(origin.as_str());
                debug!(origin = %origin, "Partition queue full, waiting");
                sender.send(event).await.map_err(|_| CohortError::Shutdown)
            }
            Err(TrySendError::Closed(_)) => Err(CohortError::Shutdown),
        }
    }

    fn partition_for(&self, origin: &MemberId) -> mpsc::Sender<InstanceEvent> {
        if let Some(sender) = self.partitions.get(origin) {
            return sender.clone();
        }
        let sender = self
            .partitions
            .entry(origin.clone())
            .or_insert_with(|| self.spawn_partition(origin.clone()))
            .clone();
        metrics::set_dispatch_partitions(self.partitions.len());
        sender
    }

    fn spawn_partition(&self, origin: MemberId) -> mpsc::Sender<InstanceEvent> {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let handle = tokio::spawn(run_partition(
            origin.clone(),
            rx,
            Arc::clone(&self.engine),
            self.rate_limiter.clone(),
            Arc::clone(&self.applied),
        ));
        self.workers.lock().push((origin, handle));
        tx
    }

    /// Close the partition of `origin` and wait until everything already
    /// queued on it has been applied. A later event opens a new partition.
    pub async fn drain_partition(&self, origin: &MemberId) {
        if self.partitions.remove(origin).is_some() {
            metrics::set_dispatch_partitions(self.partitions.len());
        }
        let drained: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut *workers)
                .into_iter()
                .partition(|(member, _)| member == origin);
            *workers = rest;
            matching.into_iter().map(|(_, handle)| handle).collect()
        };
        for worker in drained {
            let _ = worker.await;
        }
        debug!(origin = %origin, "Partition drained");
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Events taken off a queue and applied (whatever the outcome).
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Close every partition and wait for queued events to be applied.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.partitions.clear();
        metrics::set_dispatch_partitions(0);

        let workers = std::mem::take(&mut *self.workers.lock());
        let count = workers.len();
        for (_, worker) in workers {
            let _ = worker.await;
        }
        info!(partitions = count, "Inbound dispatch drained");
    }
}

async fn run_partition(
    origin: MemberId,
    mut rx: mpsc::Receiver<InstanceEvent>,
    engine: Arc<ReplicationEngine>,
    rate_limiter: Option<Arc<RateLimiter>>,
    applied: Arc<AtomicU64>,
) {
    let span = info_span!("partition", origin = %origin);
    async move {
        debug!("Partition worker started");
        while let Some(event) = rx.recv().await {
            if let Some(ref limiter) = rate_limiter {
                limiter.acquire().await;
            }
            // Failures are recorded by the engine; the partition keeps going.
            let _ = engine.apply_inbound_event(&event);
            applied.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Partition worker stopped");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryEventChannel;
    use crate::config::CohortConfig;
    use crate::conflict::ConflictResolver;
    use crate::connector::InMemoryConnector;
    use crate::membership::MembershipManager;
    use crate::replication::Collaborators;
    use crate::resilience::RateLimitConfig;
    use crate::type_registry::TypeRegistry;
    use crate::types::{EventKind, EventPayload, InstanceAction, InstanceBody, MemberRegistration, TypeDef};
    use std::time::Duration;

    fn engine() -> Arc<ReplicationEngine> {
        let config = CohortConfig::for_testing("local");
        let local = MemberId::new("local");
        let conflicts = Arc::new(ConflictResolver::new(Duration::from_secs(60)));
        let channel = Arc::new(InMemoryEventChannel::default());
        let membership = Arc::new(MembershipManager::new(local.clone(), config.settings.membership.clone()));
        for id in ["member-a", "member-b"] {
            membership.on_registration_event(&MemberRegistration::new(id, id));
            membership.confirm_registration(&id.into()).unwrap();
        }
        let registry = Arc::new(TypeRegistry::new(local.clone(), conflicts.clone(), channel.clone()));
        registry.register_type(TypeDef::entity("type-asset", "Asset", 1), &local);
        let deps = Collaborators {
            membership,
            registry,
            conflicts,
            channel,
            local_connector: Arc::new(InMemoryConnector::new("local")),
        };
        Arc::new(ReplicationEngine::new(local, &config.settings, deps))
    }

    fn update(origin: &str, guid: &str, version: u64) -> InstanceEvent {
        InstanceEvent::new(
            origin.into(),
            EventKind::Entity(if version == 1 {
                InstanceAction::Created
            } else {
                InstanceAction::Updated
            }),
            guid.into(),
            version,
            EventPayload::Instance(
                InstanceBody::new("type-asset", "Asset", 1).with_property("v", version.into()),
            ),
        )
    }

    #[tokio::test]
    async fn test_partition_applies_in_arrival_order() {
        let engine = engine();
        let dispatcher = InboundDispatcher::new(engine.clone(), 4, None);

        for version in 1..=20 {
            dispatcher.dispatch(update("member-a", "x", version)).await.unwrap();
            dispatcher.dispatch(update("member-b", "y", version)).await.unwrap();
        }
        assert_eq!(dispatcher.partition_count(), 2);
        dispatcher.close().await;

        assert_eq!(dispatcher.applied_count(), 40);
        assert_eq!(engine.store().get(&"x".into()).unwrap().instance_version, 20);
        assert_eq!(engine.store().get(&"y".into()).unwrap().instance_version, 20);
        assert!(engine.recent_failures().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_after_close_is_rejected() {
        let dispatcher = InboundDispatcher::new(engine(), 4, None);
        dispatcher.close().await;
        let err = dispatcher.dispatch(update("member-a", "x", 1)).await.unwrap_err();
        assert!(matches!(err, CohortError::Shutdown));
    }

    #[tokio::test]
    async fn test_rate_limited_partition_still_drains() {
        let engine = engine();
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            per_second: 1000,
            burst: 5,
        }));
        let dispatcher = InboundDispatcher::new(engine.clone(), 2, Some(limiter));
        for version in 1..=10 {
            dispatcher.dispatch(update("member-a", "x", version)).await.unwrap();
        }
        dispatcher.close().await;
        assert_eq!(engine.store().get(&"x".into()).unwrap().instance_version, 10);
    }

    #[tokio::test]
    async fn test_drain_partition_applies_queued_events() {
        let engine = engine();
        let dispatcher = InboundDispatcher::new(engine.clone(), 4, None);
        for version in 1..=3 {
            dispatcher.dispatch(update("member-a", "x", version)).await.unwrap();
        }
        dispatcher.drain_partition(&"member-a".into()).await;

        assert_eq!(dispatcher.partition_count(), 0);
        assert_eq!(dispatcher.applied_count(), 3);
        assert_eq!(engine.store().get(&"x".into()).unwrap().instance_version, 3);

        // The origin gets a fresh partition on its next event.
        dispatcher.dispatch(update("member-a", "x", 4)).await.unwrap();
        assert_eq!(dispatcher.partition_count(), 1);
        dispatcher.close().await;
        assert_eq!(engine.store().get(&"x".into()).unwrap().instance_version, 4);
    }

    #[tokio::test]
    async fn test_drain_partition_leaves_other_origins_running() {
        let engine = engine();
        let dispatcher = InboundDispatcher::new(engine.clone(), 4, None);
        dispatcher.dispatch(update("member-a", "x", 1)).await.unwrap();
        dispatcher.dispatch(update("member-b", "y", 1)).await.unwrap();

        dispatcher.drain_partition(&"member-a".into()).await;
        assert_eq!(dispatcher.partition_count(), 1);

        dispatcher.dispatch(update("member-b", "y", 2)).await.unwrap();
        dispatcher.close().await;
        assert_eq!(engine.store().get(&"y".into()).unwrap().instance_version, 2);
    }
}
