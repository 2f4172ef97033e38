//! Event, type and engine fixtures.

use cohort_engine::channel::InMemoryEventChannel;
use cohort_engine::config::CohortConfig;
use cohort_engine::conflict::ConflictResolver;
use cohort_engine::connector::InMemoryConnector;
use cohort_engine::coordinator::CohortEngine;
use cohort_engine::membership::MembershipManager;
use cohort_engine::replication::{Collaborators, ReplicationEngine};
use cohort_engine::type_registry::TypeRegistry;
use cohort_engine::types::{
    CohortEvent, EventKind, EventPayload, InstanceAction, InstanceBody, InstanceEvent, MemberId,
    MemberRegistration, RegistryEvent, TypeDef,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const ASSET_TYPE: &str = "type-asset";

pub fn asset_type() -> TypeDef {
    TypeDef::entity(ASSET_TYPE, "Asset", 1).with_attribute("name", "string")
}

pub fn body(name: &str, created_at_ms: i64) -> InstanceBody {
    InstanceBody::new(ASSET_TYPE, "Asset", created_at_ms).with_property("name", json!(name))
}

pub fn entity_event(origin: &str, guid: &str, version: u64, action: InstanceAction, body: InstanceBody) -> InstanceEvent {
    InstanceEvent::new(
        origin.into(),
        EventKind::Entity(action),
        guid.into(),
        version,
        EventPayload::Instance(body),
    )
}

pub fn created(origin: &str, guid: &str, name: &str) -> InstanceEvent {
    entity_event(origin, guid, 1, InstanceAction::Created, body(name, 1_000))
}

pub fn updated(origin: &str, guid: &str, version: u64, name: &str) -> InstanceEvent {
    entity_event(origin, guid, version, InstanceAction::Updated, body(name, 1_000))
}

pub fn registration(member_id: &str) -> CohortEvent {
    CohortEvent::Registry(RegistryEvent::Registration(
        MemberRegistration::new(member_id, member_id).with_type("Asset", 1),
    ))
}

pub fn refresh(member_id: &str) -> CohortEvent {
    CohortEvent::Registry(RegistryEvent::RefreshRequest {
        member_id: member_id.into(),
    })
}

/// An engine on `channel` whose local repository is an in-memory store.
pub fn test_engine(
    member_id: &str,
    channel: &Arc<InMemoryEventChannel>,
) -> (Arc<CohortEngine>, Arc<InMemoryConnector>) {
    test_engine_with(CohortConfig::for_testing(member_id), channel)
}

pub fn test_engine_with(
    config: CohortConfig,
    channel: &Arc<InMemoryEventChannel>,
) -> (Arc<CohortEngine>, Arc<InMemoryConnector>) {
    let connector = Arc::new(InMemoryConnector::new(config.local_member_id.clone()));
    let engine = CohortEngine::new(config, channel.clone(), connector.clone()).unwrap();
    (Arc::new(engine), connector)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Services wired without a coordinator, for driving the replication
/// engine synchronously.
pub struct Services {
    pub membership: Arc<MembershipManager>,
    pub registry: Arc<TypeRegistry>,
    pub conflicts: Arc<ConflictResolver>,
    pub channel: Arc<InMemoryEventChannel>,
    pub replication: Arc<ReplicationEngine>,
}

impl Services {
    pub fn new(local: &str) -> Self {
        let config = CohortConfig::for_testing(local);
        let local_id = MemberId::new(local);
        let conflicts = Arc::new(ConflictResolver::new(Duration::from_secs(60)));
        let channel = Arc::new(InMemoryEventChannel::default());
        let membership = Arc::new(MembershipManager::new(
            local_id.clone(),
            config.settings.membership.clone(),
        ));
        let registry = Arc::new(TypeRegistry::new(local_id.clone(), conflicts.clone(), channel.clone()));
        let replication = Arc::new(ReplicationEngine::new(
            local_id.clone(),
            &config.settings,
            Collaborators {
                membership: membership.clone(),
                registry: registry.clone(),
                conflicts: conflicts.clone(),
                channel: channel.clone(),
                local_connector: Arc::new(InMemoryConnector::new(local_id)),
            },
        ));
        Self {
            membership,
            registry,
            conflicts,
            channel,
            replication,
        }
    }

    /// Register and confirm a remote member.
    pub fn join(&self, member_id: &str) {
        self.membership
            .on_registration_event(&MemberRegistration::new(member_id, member_id));
        self.membership
            .confirm_registration(&MemberId::new(member_id))
            .unwrap();
    }
}
