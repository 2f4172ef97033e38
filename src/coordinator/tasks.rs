// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background tasks owned by the coordinator.
//!
//! Every task exits when the shutdown watch flips to `true`.

use super::router::Router;
use crate::metrics;
use crate::types::{CohortEvent, RegistryEvent};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Consume the event channel until shutdown or until the stream ends.
pub(crate) async fn run_consumer(
    router: Arc<Router>,
    mut events: BoxStream<'static, CohortEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("consumer", member_id = %router.local_member_id);
    async move {
        let _ = shutdown_rx.borrow_and_update();
        info!("Channel consumer started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                next = events.next() => {
                    let Some(event) = next else {
                        warn!("Event channel closed");
                        break;
                    };
                    if let Err(e) = router.route(event).await {
                        warn!(error = %e, "Failed to route event");
                        metrics::record_error("coordinator", "route");
                    }
                }
            }
        }

        info!("Channel consumer stopped");
    }
    .instrument(span)
    .await
}

/// Publish a refresh request for the local member every interval.
pub(crate) async fn run_heartbeat(
    router: Arc<Router>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("heartbeat");
    run_periodic(interval, shutdown_rx, || {
        let router = Arc::clone(&router);
        async move {
            let event = CohortEvent::Registry(RegistryEvent::RefreshRequest {
                member_id: router.local_member_id.clone(),
            });
            if let Err(e) = router.channel.publish(event).await {
                warn!(error = %e, "Heartbeat publish failed");
                metrics::record_error("coordinator", "heartbeat");
            }
        }
    })
    .instrument(span)
    .await
}

/// Mark silent members UNREACHABLE.
pub(crate) async fn run_membership_sweep(
    router: Arc<Router>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("membership_sweep");
    run_periodic(interval, shutdown_rx, || {
        let router = Arc::clone(&router);
        async move {
            let changed = router.membership.check_heartbeats();
            if !changed.is_empty() {
                debug!(members = ?changed, "Members marked unreachable");
            }
        }
    })
    .instrument(span)
    .await
}

/// Drop pending events that outlived the pending timeout.
pub(crate) async fn run_pending_eviction(
    router: Arc<Router>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("pending_eviction");
    run_periodic(interval, shutdown_rx, || {
        let router = Arc::clone(&router);
        async move {
            let evicted = router.replication.evict_expired();
            if evicted > 0 {
                info!(evicted, "Evicted expired pending events");
            }
        }
    })
    .instrument(span)
    .await
}

/// Tick `work` every `interval`. The immediate first tick is skipped.
async fn run_periodic<F, Fut>(interval: Duration, mut shutdown_rx: watch::Receiver<bool>, mut work: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let _ = shutdown_rx.borrow_and_update();
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => work().await,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Periodic task stopping");
                    break;
                }
            }
        }
    }
}
