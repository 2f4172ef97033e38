// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing of channel traffic.
//!
//! Registry events are applied inline: they are rare, and a registration
//! must be confirmed before the member's buffered events can be released.
//! Instance and type events go to the origin's dispatch partition so they
//! are applied in arrival order.

use crate::channel::EventChannel;
use crate::dispatch::InboundDispatcher;
use crate::error::{CohortError, Result};
use crate::federation::FederatedQueryEngine;
use crate::membership::{MembershipChange, MembershipManager};
use crate::metrics;
use crate::replication::ReplicationEngine;
use crate::type_registry::TypeRegistry;
use crate::types::{CohortEvent, MemberId, MemberRegistration, RegistryEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything a routed event can touch. Shared with the background tasks.
pub(crate) struct Router {
    pub(crate) local_member_id: MemberId,
    pub(crate) display_name: String,
    pub(crate) channel: Arc<dyn EventChannel>,
    pub(crate) membership: Arc<MembershipManager>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) replication: Arc<ReplicationEngine>,
    pub(crate) federation: Arc<FederatedQueryEngine>,
    pub(crate) dispatcher: InboundDispatcher,
}

impl Router {
    /// The local registration, advertising every type currently known.
    pub(crate) fn announcement(&self) -> MemberRegistration {
        self.registry.list().into_iter().fold(
            MemberRegistration::new(self.local_member_id.clone(), self.display_name.clone()),
            |registration, summary| registration.with_type(&summary.name, summary.version),
        )
    }

    pub(crate) async fn publish_registration(&self) -> Result<()> {
        let registration = self.announcement();
        self.channel
            .publish(CohortEvent::Registry(RegistryEvent::Registration(registration)))
            .await
            .map_err(|e| CohortError::Channel(e.to_string()))
    }

    pub(crate) async fn route(&self, event: CohortEvent) -> Result<()> {
        if event.partition_key() == &self.local_member_id {
            debug!("Skipping own event");
            return Ok(());
        }
        match event {
            CohortEvent::Registry(registry_event) => {
                self.on_registry_event(registry_event).await;
                Ok(())
            }
            CohortEvent::Instance(instance_event) => self.dispatcher.dispatch(instance_event).await,
        }
    }

    async fn on_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Registration(registration) => self.on_registration(&registration).await,
            RegistryEvent::RefreshRequest { member_id } => {
                if self.membership.on_refresh_request(&member_id) == MembershipChange::Reinstated {
                    self.replication.release_pending_for_origin(&member_id);
                }
            }
            RegistryEvent::Deregistration { member_id } => {
                // Events the member sent before leaving are still applied.
                self.dispatcher.drain_partition(&member_id).await;
                if self.membership.on_deregistration(&member_id) == MembershipChange::Deregistered {
                    let staled = self.replication.mark_member_stale(&member_id);
                    self.federation.remove_connector(&member_id);
                    info!(member_id = %member_id, copies_staled = staled, "Member left the cohort");
                }
            }
        }
    }

    async fn on_registration(&self, registration: &MemberRegistration) {
        let member_id = &registration.member_id;
        let change = self.membership.on_registration_event(registration);
        if change == MembershipChange::Ignored {
            return;
        }

        if change == MembershipChange::Registered {
            // The newcomer has not seen our registration yet.
            if let Err(e) = self.publish_registration().await {
                warn!(member_id = %member_id, error = %e, "Failed to answer registration");
                metrics::record_error("coordinator", "announce");
            }
        }

        let negotiation = self.registry.negotiate(&registration.supported_type_versions);
        if !negotiation.is_fully_compatible() {
            warn!(
                member_id = %member_id,
                unknown_types = ?negotiation.unknown,
                skewed_types = negotiation.skewed.len(),
                "Member type versions differ from local registry"
            );
        }

        match self.membership.confirm_registration(member_id) {
            Ok(_) => {
                let released = self.replication.release_pending_for_origin(member_id);
                if released > 0 {
                    debug!(member_id = %member_id, released, "Released events held for registration");
                }
            }
            Err(e) => warn!(member_id = %member_id, error = %e, "Registration not confirmed"),
        }
    }
}
