// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cohort engine coordinator.
//!
//! Wires the cohort services together and owns their lifecycle:
//! - Membership via [`crate::membership::MembershipManager`]
//! - Type definitions via [`crate::type_registry::TypeRegistry`]
//! - Reference copies via [`crate::replication::ReplicationEngine`]
//! - Federated reads via [`crate::federation::FederatedQueryEngine`]
//!
//! # Architecture
//!
//! 1. `start()` subscribes to the event channel and publishes the local registration
//! 2. A consumer task routes every channel event (see `router`)
//! 3. Periodic tasks publish heartbeats, sweep silent members and evict
//!    expired pending events
//! 4. `shutdown()` stops the tasks and drains the dispatch partitions

mod router;
mod tasks;
mod types;

pub use types::{EngineState, HealthCheck, MemberHealth};

use crate::archive::{ArchiveReport, CohortArchive};
use crate::channel::EventChannel;
use crate::config::CohortConfig;
use crate::conflict::ConflictResolver;
use crate::connector::RepositoryConnector;
use crate::dispatch::InboundDispatcher;
use crate::error::{CohortError, Result};
use crate::federation::FederatedQueryEngine;
use crate::membership::{MemberStatus, MembershipManager};
use crate::metrics;
use crate::replication::{Collaborators, LocalChange, ReplicationEngine};
use crate::resilience::RateLimiter;
use crate::type_registry::{RegistrationOutcome, TypeRegistry};
use crate::types::{CohortEvent, InstanceEvent, MemberId, TypeDef};
use parking_lot::Mutex;
use router::Router;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One member's participation in a cohort.
pub struct CohortEngine {
    config: CohortConfig,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    conflicts: Arc<ConflictResolver>,
    router: Arc<Router>,

    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CohortEngine {
    /// Build every service for `config`. Nothing is published until
    /// [`start()`](Self::start).
    ///
    /// `local_connector` is the local repository; its member id must match
    /// `config.local_member_id`.
    pub fn new(
        config: CohortConfig,
        channel: Arc<dyn EventChannel>,
        local_connector: Arc<dyn RepositoryConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let local_member_id = MemberId::new(config.local_member_id.clone());
        if local_connector.member_id() != &local_member_id {
            return Err(CohortError::Config(format!(
                "local connector belongs to {}, expected {}",
                local_connector.member_id(),
                local_member_id
            )));
        }

        let settings = &config.settings;
        let conflicts = Arc::new(ConflictResolver::new(settings.conflicts.coalesce_window_duration()));
        let membership = Arc::new(MembershipManager::new(
            local_member_id.clone(),
            settings.membership.clone(),
        ));
        let registry = Arc::new(TypeRegistry::new(
            local_member_id.clone(),
            Arc::clone(&conflicts),
            Arc::clone(&channel),
        ));
        let replication = Arc::new(ReplicationEngine::new(
            local_member_id.clone(),
            settings,
            Collaborators {
                membership: Arc::clone(&membership),
                registry: Arc::clone(&registry),
                conflicts: Arc::clone(&conflicts),
                channel: Arc::clone(&channel),
                local_connector: Arc::clone(&local_connector),
            },
        ));
        let federation = Arc::new(FederatedQueryEngine::new(
            settings.query.clone(),
            Arc::clone(&membership),
            Arc::clone(&registry),
            Arc::clone(&replication),
            local_connector,
        ));

        let rate_limiter = settings.replication.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.per_second,
                burst = cfg.burst,
                "Rate limiting enabled for inbound dispatch"
            );
            Arc::new(RateLimiter::new(cfg))
        });
        let dispatcher = InboundDispatcher::new(
            Arc::clone(&replication),
            settings.replication.partition_queue_depth,
            rate_limiter,
        );

        let router = Arc::new(Router {
            local_member_id,
            display_name: config.display_name.clone(),
            channel,
            membership,
            registry,
            replication,
            federation,
            dispatcher,
        });

        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_engine_state(EngineState::Created as u8);

        Ok(Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            conflicts,
            router,
            task_handles: Mutex::new(Vec::new()),
        })
    }

    pub fn local_member_id(&self) -> &MemberId {
        &self.router.local_member_id
    }

    pub fn config(&self) -> &CohortConfig {
        &self.config
    }

    pub fn membership(&self) -> &Arc<MembershipManager> {
        &self.router.membership
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.router.registry
    }

    pub fn conflicts(&self) -> &Arc<ConflictResolver> {
        &self.conflicts
    }

    pub fn replication(&self) -> &Arc<ReplicationEngine> {
        &self.router.replication
    }

    pub fn federation(&self) -> &Arc<FederatedQueryEngine> {
        &self.router.federation
    }

    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(state as u8);
    }

    /// Join the cohort.
    ///
    /// 1. Registers the local member and claims the home role for every
    ///    instance in the local repository
    /// 2. Subscribes to the channel and publishes the local registration
    /// 3. Spawns the heartbeat, membership sweep and pending-eviction tasks
    pub async fn start(&self) -> Result<()> {
        let claimed = self.state_tx.send_if_modified(|state| {
            if *state == EngineState::Created {
                *state = EngineState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(CohortError::InvalidState {
                expected: EngineState::Created.to_string(),
                actual: self.state().to_string(),
            });
        }
        metrics::set_engine_state(EngineState::Starting as u8);

        info!(
            member_id = %self.local_member_id(),
            display_name = %self.config.display_name,
            "Starting cohort engine"
        );

        let router = &self.router;
        router.membership.register_local(&router.announcement());

        // Remote claims on local GUIDs must find the local home recorded.
        if let Err(e) = router.replication.claim_local_instances().await {
            error!(error = %e, "Failed to scan the local repository");
            metrics::record_error("coordinator", "local_scan");
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        // Subscribe first so answers to our registration are not missed.
        let events = router.channel.subscribe();
        self.spawn(tasks::run_consumer(
            Arc::clone(router),
            events,
            self.shutdown_rx.clone(),
        ));

        if let Err(e) = router.publish_registration().await {
            error!(error = %e, "Failed to publish local registration");
            let _ = self.shutdown_tx.send(true);
            self.join_tasks().await;
            self.set_state(EngineState::Failed);
            return Err(e);
        }

        let membership = &self.config.settings.membership;
        let heartbeat = membership.heartbeat_interval_duration();
        self.spawn(tasks::run_heartbeat(
            Arc::clone(router),
            heartbeat,
            self.shutdown_rx.clone(),
        ));
        if membership.sweep_enabled {
            self.spawn(tasks::run_membership_sweep(
                Arc::clone(router),
                heartbeat,
                self.shutdown_rx.clone(),
            ));
        }
        let eviction = (self.config.settings.replication.pending_timeout_duration() / 2)
            .max(Duration::from_millis(10));
        self.spawn(tasks::run_pending_eviction(
            Arc::clone(router),
            eviction,
            self.shutdown_rx.clone(),
        ));

        self.set_state(EngineState::Running);
        info!(
            heartbeat_ms = heartbeat.as_millis() as u64,
            sweep = membership.sweep_enabled,
            "Cohort engine running"
        );
        Ok(())
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.task_handles.lock().push(tokio::spawn(task));
    }

    /// Route one channel event. Instance events are queued on their
    /// origin's partition and applied asynchronously.
    pub async fn handle_event(&self, event: CohortEvent) -> Result<()> {
        if self.state().is_terminal() {
            return Err(CohortError::Shutdown);
        }
        self.router.route(event).await
    }

    /// Publish a change made to the local repository.
    pub async fn produce_outbound_event(&self, change: LocalChange) -> Result<InstanceEvent> {
        self.require_running()?;
        self.router.replication.produce_outbound_event(change).await
    }

    /// Register a locally owned type and publish it to the cohort.
    pub async fn register_local_type(&self, def: TypeDef) -> Result<RegistrationOutcome> {
        self.require_running()?;
        self.router.registry.register_local_type(def).await
    }

    /// Replay an archive into this member's reference copies.
    pub fn load_archive(&self, archive: &CohortArchive) -> Result<ArchiveReport> {
        archive.replay(&self.router.membership, &self.router.replication)
    }

    fn require_running(&self) -> Result<()> {
        let state = self.state();
        if state == EngineState::Running {
            Ok(())
        } else {
            Err(CohortError::InvalidState {
                expected: EngineState::Running.to_string(),
                actual: state.to_string(),
            })
        }
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let router = &self.router;
        let open_circuits: HashSet<MemberId> = router.federation.open_circuits().into_iter().collect();

        let members: Vec<MemberHealth> = router
            .membership
            .list_members()
            .into_iter()
            .filter(|m| &m.member_id != self.local_member_id())
            .map(|m| MemberHealth {
                silent_ms: router
                    .membership
                    .silent_for(&m.member_id)
                    .map(|d| d.as_millis() as u64),
                circuit_open: open_circuits.contains(&m.member_id),
                status: m.status,
                member_id: m.member_id,
            })
            .collect();
        let unreachable = members
            .iter()
            .filter(|m| m.status == MemberStatus::Unreachable)
            .count();

        let ready = state == EngineState::Running;
        HealthCheck {
            state,
            ready,
            members_by_status: router.membership.status_counts(),
            members,
            known_types: router.registry.len(),
            reference_copies: router.replication.store().len(),
            pending_events: router.replication.pending_len(),
            pending_by_reason: router.replication.pending_reason_counts(),
            open_conflicts: self.conflicts.open_count(),
            recent_apply_failures: router.replication.recent_failures().len(),
            dispatch_partitions: router.dispatcher.partition_count(),
            healthy: ready && unreachable == 0,
        }
    }

    /// Leave the running state.
    ///
    /// 1. Signals every background task to stop and waits for it
    /// 2. Closes the dispatch partitions, applying what is already queued
    ///
    /// The local member is not deregistered: peers see it go UNREACHABLE
    /// and reinstate it when it comes back.
    pub async fn shutdown(&self) {
        match self.state() {
            EngineState::Stopped => return,
            EngineState::Created => {
                self.set_state(EngineState::Stopped);
                return;
            }
            _ => {}
        }

        info!("Shutting down cohort engine");
        self.set_state(EngineState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        self.join_tasks().await;
        self.router.dispatcher.close().await;

        self.set_state(EngineState::Stopped);
        info!("Cohort engine stopped");
    }

    async fn join_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.task_handles.lock());
        let task_count = handles.len();
        if task_count > 0 {
            debug!(task_count, "Waiting for background tasks");
        }
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }
    }
}
