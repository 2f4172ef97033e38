// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end cohort scenarios against in-memory channels and connectors.
//!
//! Run with: cargo test --test integration

mod common;

use cohort_engine::archive::CohortArchive;
use cohort_engine::channel::InMemoryEventChannel;
use cohort_engine::conflict::ConflictKind;
use cohort_engine::coordinator::EngineState;
use cohort_engine::federation::{QueryCriteria, WarningKind};
use cohort_engine::membership::MemberStatus;
use cohort_engine::replication::{ApplyOutcome, CopyStatus, LocalChange};
use cohort_engine::types::{
    CohortEvent, EventKind, EventPayload, InstanceAction, InstanceCategory, InstanceEvent,
    InstanceGuid, MemberId, MemberRegistration,
};
use common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn guid(s: &str) -> InstanceGuid {
    InstanceGuid::new(s)
}

fn member(s: &str) -> MemberId {
    MemberId::new(s)
}

fn type_event(origin: &str) -> CohortEvent {
    CohortEvent::Instance(InstanceEvent::type_def(origin.into(), asset_type(), false))
}

// =============================================================================
// Replay idempotence
// =============================================================================

#[tokio::test]
async fn replayed_creation_is_applied_once() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    engine.start().await.unwrap();

    engine.handle_event(registration("member-a")).await.unwrap();
    engine.handle_event(type_event("member-a")).await.unwrap();
    let creation = created("member-a", "x", "first");
    engine.handle_event(CohortEvent::Instance(creation.clone())).await.unwrap();

    // member-b joins later and the same event is delivered again.
    engine.handle_event(registration("member-b")).await.unwrap();
    engine.handle_event(CohortEvent::Instance(creation)).await.unwrap();
    engine.shutdown().await;

    let store = engine.replication().store();
    assert_eq!(store.len(), 1);
    let copy = store.get(&guid("x")).unwrap();
    assert_eq!(copy.instance_version, 1);
    assert_eq!(copy.home_member_id, member("member-a"));
    assert_eq!(engine.conflicts().open_count(), 0);
    assert!(engine.replication().recent_failures().is_empty());
}

#[tokio::test]
async fn events_before_registration_are_released_in_order() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    engine.start().await.unwrap();

    engine.handle_event(type_event("member-a")).await.unwrap();
    engine
        .handle_event(CohortEvent::Instance(created("member-a", "x", "v1")))
        .await
        .unwrap();
    engine
        .handle_event(CohortEvent::Instance(updated("member-a", "x", 2, "v2")))
        .await
        .unwrap();
    let replication = engine.replication().clone();
    assert!(eventually(WAIT, || replication.pending_len() == 3).await);

    engine.handle_event(registration("member-a")).await.unwrap();
    engine.shutdown().await;

    assert_eq!(engine.replication().pending_len(), 0);
    let copy = engine.replication().store().get(&guid("x")).unwrap();
    assert_eq!(copy.instance_version, 2);
}

// =============================================================================
// Duplicate GUID
// =============================================================================

#[tokio::test]
async fn duplicate_guid_from_two_homes_is_quarantined() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    engine.start().await.unwrap();

    engine.handle_event(registration("member-a")).await.unwrap();
    engine.handle_event(registration("member-b")).await.unwrap();
    engine.handle_event(type_event("member-a")).await.unwrap();
    let replication = engine.replication().clone();
    assert!(eventually(WAIT, || engine.registry().len() == 1).await);

    engine
        .handle_event(CohortEvent::Instance(created("member-a", "x", "from-a")))
        .await
        .unwrap();
    engine
        .handle_event(CohortEvent::Instance(created("member-b", "x", "from-b")))
        .await
        .unwrap();
    engine.shutdown().await;

    // Partitions run concurrently: either member may have won the GUID.
    let conflict = engine
        .conflicts()
        .open_for(ConflictKind::DuplicateGuid, "x")
        .expect("duplicate GUID conflict");
    assert!(conflict.involves(&member("member-a")));
    assert!(conflict.involves(&member("member-b")));

    let home = replication.store().home_of(&guid("x")).unwrap();
    let other = if home == member("member-a") { member("member-b") } else { member("member-a") };
    let winner = replication.store().get_from(&guid("x"), &home).unwrap();
    let loser = replication.store().get_from(&guid("x"), &other).unwrap();
    assert_eq!(winner.status, CopyStatus::Current);
    assert_eq!(loser.status, CopyStatus::Quarantined);

    let page = engine.federation().find(QueryCriteria::default()).await.unwrap();
    let hits: Vec<_> = page.value.instances.iter().filter(|r| r.guid == guid("x")).collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].home_member_id, home);
}

// =============================================================================
// Unreachable members
// =============================================================================

#[tokio::test]
async fn unreachable_member_excluded_then_reinstated() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    engine.start().await.unwrap();

    engine.handle_event(registration("member-a")).await.unwrap();
    engine.handle_event(type_event("member-a")).await.unwrap();
    engine
        .handle_event(CohortEvent::Instance(created("member-a", "x", "v1")))
        .await
        .unwrap();
    let replication = engine.replication().clone();
    assert!(eventually(WAIT, || replication.store().get(&guid("x")).is_some()).await);

    let found = engine.federation().find(QueryCriteria::default()).await.unwrap();
    assert_eq!(found.value.instances.len(), 1);

    // 100ms heartbeat interval, 3 missed heartbeats.
    let membership = engine.membership().clone();
    assert!(
        eventually(WAIT, || membership.status_of(&member("member-a")) == Some(MemberStatus::Unreachable)).await
    );
    let found = engine.federation().find(QueryCriteria::default()).await.unwrap();
    assert!(found.value.instances.is_empty());

    engine
        .handle_event(CohortEvent::Instance(updated("member-a", "x", 2, "v2")))
        .await
        .unwrap();
    assert!(eventually(WAIT, || replication.store().get(&guid("x")).map(|c| c.instance_version) == Some(2)).await);
    assert_ne!(membership.status_of(&member("member-a")), Some(MemberStatus::Deregistered));

    let found = engine.federation().find(QueryCriteria::default()).await.unwrap();
    assert_eq!(found.value.instances.len(), 1);
    assert_eq!(found.value.instances[0].version, 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn refresh_requests_keep_a_member_active() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    engine.start().await.unwrap();
    engine.handle_event(registration("member-a")).await.unwrap();

    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.handle_event(refresh("member-a")).await.unwrap();
    }
    assert_eq!(
        engine.membership().status_of(&member("member-a")),
        Some(MemberStatus::Active)
    );
    engine.shutdown().await;
}

// =============================================================================
// Federated query with partial failure
// =============================================================================

#[tokio::test]
async fn find_returns_responders_with_warnings_for_the_rest() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, local) = test_engine("local", &channel);
    engine.start().await.unwrap();
    engine.registry().register_type(asset_type(), &member("local"));
    local.put("local-1", 1, body("mine", 1));

    let healthy = Arc::new(MockConnector::new("member-a"));
    healthy.put("a-1", 1, body("theirs", 2));
    let failing = Arc::new(MockConnector::new("member-b"));
    failing.set_failing(true);
    let slow = Arc::new(MockConnector::new("member-c"));
    slow.set_delay(Duration::from_secs(2));

    for (id, connector) in [("member-a", &healthy), ("member-b", &failing), ("member-c", &slow)] {
        engine.handle_event(registration(id)).await.unwrap();
        engine.federation().register_connector(connector.clone());
    }

    let result = engine.federation().find(QueryCriteria::default()).await.unwrap();

    let guids: Vec<&str> = result.value.instances.iter().map(|r| r.guid.as_str()).collect();
    assert_eq!(guids, vec!["local-1", "a-1"]);
    assert_eq!(result.responded, vec![member("local"), member("member-a")]);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.member_id == member("member-b") && matches!(w.kind, WarningKind::Failed(_))));
    assert!(result
        .warnings
        .iter()
        .any(|w| w.member_id == member("member-c") && w.kind == WarningKind::TimedOut));
    engine.shutdown().await;
}

// =============================================================================
// Rehome atomicity
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rehome_never_exposes_a_homeless_instance() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    let membership = engine.membership();
    for id in ["member-a", "member-b"] {
        membership.on_registration_event(&MemberRegistration::new(id, id));
        membership.confirm_registration(&member(id)).unwrap();
    }
    engine.registry().register_type(asset_type(), &member("member-a"));
    let replication = engine.replication().clone();
    replication
        .apply_inbound_event(&created("member-a", "x", "start"))
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let replication = replication.clone();
        let done = done.clone();
        tokio::task::spawn_blocking(move || {
            let mut observations = 0u64;
            while !done.load(Ordering::Acquire) {
                let copy = replication.store().get(&guid("x"));
                assert!(copy.is_some(), "instance had no home copy mid-rehome");
                let slot = replication.store().slot(&guid("x")).unwrap();
                assert_eq!(slot.copies.len(), 1, "two copies visible mid-rehome");
                observations += 1;
            }
            observations
        })
    };

    let mut home = "member-a";
    for version in 2..=300u64 {
        let next = if home == "member-a" { "member-b" } else { "member-a" };
        let rehome = InstanceEvent::new(
            next.into(),
            EventKind::Entity(InstanceAction::Rehomed),
            "x".into(),
            version,
            EventPayload::Rehome {
                previous_home: home.into(),
                body: body("moving", 1_000),
            },
        );
        assert_eq!(
            replication.apply_inbound_event(&rehome).unwrap(),
            ApplyOutcome::Applied
        );
        home = next;
    }
    done.store(true, Ordering::Release);

    assert!(reader.await.unwrap() > 0);
    assert_eq!(replication.store().home_of(&guid("x")), Some(member(home)));
    assert_eq!(replication.store().get(&guid("x")).unwrap().instance_version, 300);
}

// =============================================================================
// Two members over one channel
// =============================================================================

#[tokio::test]
async fn two_members_replicate_over_a_shared_channel() {
    let channel = Arc::new(InMemoryEventChannel::new(1024));
    let (alpha, alpha_repo) = test_engine("alpha", &channel);
    let (beta, _) = test_engine("beta", &channel);
    alpha.start().await.unwrap();
    beta.start().await.unwrap();

    let (alpha_members, beta_members) = (alpha.membership().clone(), beta.membership().clone());
    assert!(
        eventually(WAIT, || {
            alpha_members.status_of(&member("beta")) == Some(MemberStatus::Active)
                && beta_members.status_of(&member("alpha")) == Some(MemberStatus::Active)
        })
        .await
    );

    alpha.register_local_type(asset_type()).await.unwrap();
    alpha_repo.put("g1", 1, body("shared", 10));
    let event = alpha
        .produce_outbound_event(LocalChange::Instance {
            guid: guid("g1"),
            category: InstanceCategory::Entity,
            action: InstanceAction::Created,
        })
        .await
        .unwrap();
    assert_eq!(event.instance_version, 1);

    let beta_replication = beta.replication().clone();
    assert!(eventually(WAIT, || beta_replication.store().get(&guid("g1")).is_some()).await);
    let copy = beta_replication.store().get(&guid("g1")).unwrap();
    assert_eq!(copy.home_member_id, member("alpha"));

    alpha_repo.put("g1", 2, body("shared-v2", 10));
    alpha
        .produce_outbound_event(LocalChange::Instance {
            guid: guid("g1"),
            category: InstanceCategory::Entity,
            action: InstanceAction::Updated,
        })
        .await
        .unwrap();
    assert!(
        eventually(WAIT, || beta_replication
            .store()
            .get(&guid("g1"))
            .map(|c| c.instance_version)
            == Some(2))
        .await
    );

    let found = beta
        .federation()
        .find(QueryCriteria::default().with_type("Asset"))
        .await
        .unwrap();
    assert_eq!(found.value.instances.len(), 1);
    assert_eq!(found.value.instances[0].version, 2);

    // alpha stops heartbeating; beta eventually stops trusting its copies.
    alpha.shutdown().await;
    assert!(
        eventually(WAIT, || beta_members.status_of(&member("alpha")) == Some(MemberStatus::Unreachable)).await
    );
    let found = beta.federation().find(QueryCriteria::default()).await.unwrap();
    assert!(found.value.instances.is_empty());
    beta.shutdown().await;
}

// =============================================================================
// Archives and lifecycle
// =============================================================================

#[tokio::test]
async fn archive_contents_are_queryable() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    engine.start().await.unwrap();

    let archive = CohortArchive::from_json(
        br#"{
            "archive_id": "starter",
            "display_name": "Starter pack",
            "type_defs": [
                {"guid": "type-asset", "name": "Asset", "version": 1, "category": "ENTITY",
                 "attributes": [{"name": "name", "type_name": "string"}]}
            ],
            "instances": [
                {"guid": "arch-1", "category": "ENTITY", "version": 1,
                 "body": {"type_guid": "type-asset", "type_name": "Asset", "created_at_ms": 1,
                          "updated_at_ms": 1, "properties": {"name": "seed"}}}
            ]
        }"#,
    )
    .unwrap();
    let report = engine.load_archive(&archive).unwrap();
    assert_eq!(report.applied, 2);

    // Pinned: never swept even though it never heartbeats.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let found = engine
        .federation()
        .get_by_guid(&guid("arch-1"))
        .await
        .unwrap();
    let record = found.value.expect("archived instance");
    assert_eq!(record.home_member_id, member("archive:starter"));
    engine.shutdown().await;
}

#[tokio::test]
async fn engine_lifecycle_and_health() {
    let channel = Arc::new(InMemoryEventChannel::default());
    let (engine, _) = test_engine("local", &channel);
    let mut states = engine.state_receiver();
    assert_eq!(engine.state(), EngineState::Created);
    assert!(!engine.health_check().ready);

    engine.start().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), EngineState::Running);

    engine.handle_event(registration("member-a")).await.unwrap();
    let health = engine.health_check();
    assert!(health.ready);
    assert!(health.healthy);
    assert_eq!(health.members_by_status.get("ACTIVE"), Some(&2));

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(!engine.health_check().ready);
    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);
}
