// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event channel abstraction.
//!
//! The channel is an ordered-per-key, at-least-once pub/sub transport. The
//! engine publishes registry traffic and outbound instance events through
//! it and consumes inbound events from [`EventChannel::subscribe`].
//! Consumers must tolerate redelivery and reordering across keys.
//!
//! [`InMemoryEventChannel`] is a process-local implementation backed by a
//! tokio broadcast channel. It also records everything published, which
//! tests use to assert on outbound traffic.

use crate::types::{CohortEvent, InstanceEvent};
use futures::stream::{self, BoxStream};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::warn;

/// Boxed publish future.
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + 'a>>;

/// Transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ChannelError(pub String);

/// Pub/sub transport for cohort traffic.
pub trait EventChannel: Send + Sync + 'static {
    /// Publish one event. Delivery is at-least-once.
    fn publish(&self, event: CohortEvent) -> PublishFuture<'_>;

    /// Stream of events published after the call.
    fn subscribe(&self) -> BoxStream<'static, CohortEvent>;
}

/// In-process channel with a recorded publish log.
pub struct InMemoryEventChannel {
    sender: broadcast::Sender<CohortEvent>,
    log: Mutex<Vec<CohortEvent>>,
    fail_publishes: AtomicBool,
}

impl InMemoryEventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            log: Mutex::new(Vec::new()),
            fail_publishes: AtomicBool::new(false),
        }
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<CohortEvent> {
        self.log.lock().clone()
    }

    /// Instance events published so far, in order.
    pub fn published_instance_events(&self) -> Vec<InstanceEvent> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| match e {
                CohortEvent::Instance(ev) => Some(ev.clone()),
                CohortEvent::Registry(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }

    /// Make subsequent publishes fail (for failure-path tests).
    pub fn set_failing(&self, failing: bool) {
        self.fail_publishes.store(failing, Ordering::SeqCst);
    }
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventChannel for InMemoryEventChannel {
    fn publish(&self, event: CohortEvent) -> PublishFuture<'_> {
        let result = if self.fail_publishes.load(Ordering::SeqCst) {
            Err(ChannelError("channel unavailable".to_string()))
        } else {
            self.log.lock().push(event.clone());
            // No subscribers is not an error: the log still has it.
            let _ = self.sender.send(event);
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn subscribe(&self) -> BoxStream<'static, CohortEvent> {
        let rx = self.sender.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event channel subscriber lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }
}
