// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Federated queries across the cohort.
//!
//! A query fans out to the local connector and every ACTIVE remote member's
//! connector, bounded by a bulkhead, a per-member timeout and a per-member
//! circuit breaker. Local reference copies join the candidate set without
//! a remote call.
//!
//! ```text
//!           ┌─ local connector ───────┐
//! criteria ─┼─ member B (timeout, CB) ─┼─→ filter live homes + known types
//!           ├─ member C (timeout, CB) ─┤   dedup by GUID (home > copy, version)
//!           └─ reference copy store ───┘   sort (created_at, guid), page
//! ```
//!
//! A member that times out, fails, or has an open circuit contributes
//! nothing and is reported as a [`MemberWarning`]. The call fails only when
//! no member responded at all.

use crate::circuit_breaker::{CircuitError, MemberCircuits};
use crate::config::QueryConfig;
use crate::connector::{ConnectorResult, InstanceRecord, Provenance, RepositoryConnector};
use crate::error::{CohortError, Result};
use crate::membership::{MemberStatus, MembershipManager};
use crate::metrics;
use crate::replication::ReplicationEngine;
use crate::resilience::Bulkhead;
use crate::type_registry::TypeRegistry;
use crate::types::{InstanceBody, InstanceGuid, MemberId};
use dashmap::DashMap;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Criteria and results
// ═══════════════════════════════════════════════════════════════════════════════

/// What to look for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryCriteria {
    /// Type name; subtypes match too.
    pub type_name: Option<String>,
    /// Exact-match property filters.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    pub page_size: Option<usize>,
    /// Opaque token from a previous page.
    pub continuation: Option<String>,
}

impl QueryCriteria {
    pub fn with_type(mut self, type_name: &str) -> Self {
        self.type_name = Some(type_name.to_string());
        self
    }

    pub fn with_property(mut self, name: &str, value: Value) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }

    /// Every property filter is present with an equal value.
    pub fn matches_properties(&self, body: &InstanceBody) -> bool {
        self.properties
            .iter()
            .all(|(name, value)| body.properties.get(name) == Some(value))
    }
}

/// Why a member contributed nothing (or less than everything).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    TimedOut,
    Failed(String),
    CircuitOpen,
    /// Records dropped because their type is unknown locally.
    UnknownTypeDropped(usize),
}

/// Non-fatal per-member problem attached to a federated response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberWarning {
    pub member_id: MemberId,
    pub kind: WarningKind,
}

impl MemberWarning {
    fn new(member_id: MemberId, kind: WarningKind) -> Self {
        Self { member_id, kind }
    }
}

impl fmt::Display for MemberWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WarningKind::TimedOut => write!(f, "{}: timed out", self.member_id),
            WarningKind::Failed(e) => write!(f, "{}: failed: {}", self.member_id, e),
            WarningKind::CircuitOpen => write!(f, "{}: circuit open, skipped", self.member_id),
            WarningKind::UnknownTypeDropped(n) => {
                write!(f, "{}: {} record(s) of unknown type dropped", self.member_id, n)
            }
        }
    }
}

/// A value plus the warnings collected while producing it.
#[derive(Debug, Clone)]
pub struct FederatedResult<T> {
    pub value: T,
    pub warnings: Vec<MemberWarning>,
    /// Members that answered, sorted.
    pub responded: Vec<MemberId>,
}

/// One page of `find` results.
#[derive(Debug, Clone, Default)]
pub struct FindPage {
    pub instances: Vec<InstanceRecord>,
    /// Token for the next page; `None` on the last page.
    pub continuation: Option<String>,
}

/// Position after the last returned record: (created_at_ms, guid).
///
/// Tokens carry no member state, so paging makes progress even when the
/// member set changes between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    pub created_at_ms: i64,
    pub guid: String,
}

const TOKEN_PREFIX: &str = "c1";

impl ContinuationToken {
    fn after(record: &InstanceRecord) -> Self {
        Self {
            created_at_ms: record.body.created_at_ms,
            guid: record.guid.as_str().to_string(),
        }
    }

    pub fn encode(&self) -> String {
        format!("{TOKEN_PREFIX}.{}.{}", self.created_at_ms, self.guid)
    }

    pub fn parse(token: &str) -> Result<Self> {
        let invalid = || CohortError::InvalidContinuationToken(token.to_string());
        let mut parts = token.splitn(3, '.');
        if parts.next() != Some(TOKEN_PREFIX) {
            return Err(invalid());
        }
        let created_at_ms = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(invalid)?;
        let guid = parts.next().filter(|g| !g.is_empty()).ok_or_else(invalid)?;
        Ok(Self {
            created_at_ms,
            guid: guid.to_string(),
        })
    }

    fn precedes(&self, record: &InstanceRecord) -> bool {
        (self.created_at_ms, self.guid.as_str()) < record.ordering_key()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

type MemberCall<T> = Pin<Box<dyn Future<Output = ConnectorResult<T>> + Send + 'static>>;

pub struct FederatedQueryEngine {
    local_member_id: MemberId,
    config: QueryConfig,
    membership: Arc<MembershipManager>,
    registry: Arc<TypeRegistry>,
    replication: Arc<ReplicationEngine>,
    local_connector: Arc<dyn RepositoryConnector>,
    connectors: DashMap<MemberId, Arc<dyn RepositoryConnector>>,
    circuits: MemberCircuits,
    bulkhead: Bulkhead,
}

impl FederatedQueryEngine {
    pub fn new(
        config: QueryConfig,
        membership: Arc<MembershipManager>,
        registry: Arc<TypeRegistry>,
        replication: Arc<ReplicationEngine>,
        local_connector: Arc<dyn RepositoryConnector>,
    ) -> Self {
        Self {
            local_member_id: membership.local_member_id().clone(),
            circuits: MemberCircuits::new(config.circuit_config()),
            bulkhead: Bulkhead::new(config.fan_out_limit.max(1)),
            config,
            membership,
            registry,
            replication,
            local_connector,
            connectors: DashMap::new(),
        }
    }

    /// Make a remote member's repository queryable.
    pub fn register_connector(&self, connector: Arc<dyn RepositoryConnector>) {
        let member = connector.member_id().clone();
        debug!(member_id = %member, "Connector registered");
        self.connectors.insert(member, connector);
    }

    pub fn remove_connector(&self, member_id: &MemberId) {
        self.connectors.remove(member_id);
        self.circuits.remove(member_id);
    }

    /// Members whose query circuit currently looks open.
    pub fn open_circuits(&self) -> Vec<MemberId> {
        self.circuits.likely_open()
    }

    pub async fn find(&self, criteria: QueryCriteria) -> Result<FederatedResult<FindPage>> {
        let (_never, cancel) = watch::channel(false);
        self.find_with_cancel(criteria, cancel).await
    }

    /// `find`, aborting every in-flight member call once `cancel` turns true.
    pub async fn find_with_cancel(
        &self,
        criteria: QueryCriteria,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<FederatedResult<FindPage>> {
        let start = Instant::now();
        let after = criteria
            .continuation
            .as_deref()
            .map(ContinuationToken::parse)
            .transpose()
            .inspect_err(|_| metrics::record_federated_failure("find", "invalid_token"))?;
        let page_size = self.config.effective_page_size(criteria.page_size);

        let shared = Arc::new(criteria.clone());
        let fan_out = self
            .fan_out("find", &mut cancel, move |connector| -> MemberCall<Vec<InstanceRecord>> {
                let criteria = shared.clone();
                Box::pin(async move { connector.find(&criteria).await })
            })
            .await?;

        let mut candidates: Vec<(MemberId, InstanceRecord)> = fan_out
            .responses
            .into_iter()
            .flat_map(|(member, records)| records.into_iter().map(move |r| (member.clone(), r)))
            .collect();
        candidates.extend(
            self.replication
                .store()
                .queryable_copies()
                .into_iter()
                .filter_map(|c| c.to_record())
                .map(|r| (r.home_member_id.clone(), r)),
        );

        let mut warnings = fan_out.warnings;
        let admitted = self.admit(candidates, &mut warnings);
        self.report_home_collisions(&admitted);
        let mut merged: Vec<InstanceRecord> = dedup(admitted)
            .into_iter()
            .filter(|r| criteria.matches_properties(&r.body))
            .filter(|r| self.matches_type(&criteria, r))
            .filter(|r| after.as_ref().map_or(true, |t| t.precedes(r)))
            .collect();
        merged.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));

        let has_more = merged.len() > page_size;
        merged.truncate(page_size);
        let continuation = if has_more {
            merged.last().map(|r| ContinuationToken::after(r).encode())
        } else {
            None
        };

        let responded = fan_out.responded;
        metrics::record_federated_query("find", responded.len(), warnings.len(), start.elapsed());
        debug!(
            results = merged.len(),
            responded = responded.len(),
            warnings = warnings.len(),
            has_more,
            "Federated find complete"
        );
        Ok(FederatedResult {
            value: FindPage {
                instances: merged,
                continuation,
            },
            warnings,
            responded,
        })
    }

    /// Every page of a query as a lazy stream; stops after the last page or
    /// the first error.
    pub fn find_pages(
        self: &Arc<Self>,
        criteria: QueryCriteria,
    ) -> BoxStream<'static, Result<FederatedResult<FindPage>>> {
        let engine = Arc::clone(self);
        Box::pin(stream::unfold(Some(criteria), move |state| {
            let engine = engine.clone();
            async move {
                let criteria = state?;
                match engine.find(criteria.clone()).await {
                    Ok(page) => {
                        let next = page
                            .value
                            .continuation
                            .clone()
                            .map(|token| criteria.with_continuation(token));
                        Some((Ok(page), next))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        }))
    }

    /// Single instance by GUID; `value` is `None` when not found.
    pub async fn get_by_guid(&self, guid: &InstanceGuid) -> Result<FederatedResult<Option<InstanceRecord>>> {
        let (_never, cancel) = watch::channel(false);
        self.get_by_guid_with_cancel(guid, cancel).await
    }

    pub async fn get_by_guid_with_cancel(
        &self,
        guid: &InstanceGuid,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<FederatedResult<Option<InstanceRecord>>> {
        let start = Instant::now();
        let target = guid.clone();
        let fan_out = self
            .fan_out("get_by_guid", &mut cancel, move |connector| -> MemberCall<Option<InstanceRecord>> {
                let guid = target.clone();
                Box::pin(async move { connector.get_by_guid(&guid).await })
            })
            .await?;

        let mut candidates: Vec<(MemberId, InstanceRecord)> = fan_out
            .responses
            .into_iter()
            .filter_map(|(member, record)| record.map(|r| (member, r)))
            .filter(|(_, r)| &r.guid == guid)
            .collect();
        if let Some(record) = self
            .replication
            .store()
            .get(guid)
            .filter(|c| c.is_queryable())
            .and_then(|c| c.to_record())
        {
            candidates.push((record.home_member_id.clone(), record));
        }

        let mut warnings = fan_out.warnings;
        let admitted = self.admit(candidates, &mut warnings);
        self.report_home_collisions(&admitted);
        let found = dedup(admitted).into_iter().next();

        let responded = fan_out.responded;
        metrics::record_federated_query("get_by_guid", responded.len(), warnings.len(), start.elapsed());
        Ok(FederatedResult {
            value: found,
            warnings,
            responded,
        })
    }

    /// Call every source concurrently and collect what comes back.
    #[instrument(skip_all, fields(operation = operation))]
    async fn fan_out<T, F>(
        &self,
        operation: &'static str,
        cancel: &mut watch::Receiver<bool>,
        call: F,
    ) -> Result<FanOut<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RepositoryConnector>) -> MemberCall<T>,
    {
        if *cancel.borrow() {
            metrics::record_federated_failure(operation, "cancelled");
            return Err(CohortError::QueryCancelled);
        }

        let sources = self.sources();
        let attempted = sources.len();
        let timeout = self.config.member_timeout_duration();
        let mut set = JoinSet::new();

        for (member, connector) in sources {
            let circuit = self.circuits.for_member(&member);
            let bulkhead = self.bulkhead.clone();
            let fut = call(connector);
            set.spawn(async move {
                let started = Instant::now();
                let outcome = match bulkhead.acquire().await {
                    Ok(_permit) => {
                        let result = circuit
                            .call(async move {
                                match tokio::time::timeout(timeout, fut).await {
                                    Ok(Ok(value)) => Ok(value),
                                    Ok(Err(e)) => Err(WarningKind::Failed(e.0)),
                                    Err(_) => Err(WarningKind::TimedOut),
                                }
                            })
                            .await;
                        match result {
                            Ok(value) => Ok(value),
                            Err(CircuitError::Rejected) => Err(WarningKind::CircuitOpen),
                            Err(CircuitError::Inner(kind)) => Err(kind),
                        }
                    }
                    Err(e) => Err(WarningKind::Failed(e.to_string())),
                };
                (member, outcome, started.elapsed())
            });
        }

        let mut collected = FanOut {
            responses: Vec::new(),
            responded: Vec::new(),
            warnings: Vec::new(),
        };
        let mut cancel_live = true;

        loop {
            tokio::select! {
                biased;
                changed = cancel.changed(), if cancel_live => {
                    if changed.is_err() {
                        cancel_live = false;
                    } else if *cancel.borrow() {
                        set.abort_all();
                        warn!(operation, in_flight = set.len(), "Federated query cancelled");
                        metrics::record_federated_failure(operation, "cancelled");
                        return Err(CohortError::QueryCancelled);
                    }
                }
                joined = set.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((member, Ok(value), elapsed)) => {
                            metrics::record_member_call(member.as_str(), "ok", elapsed);
                            collected.responded.push(member.clone());
                            collected.responses.push((member, value));
                        }
                        Ok((member, Err(kind), elapsed)) => {
                            let outcome = match &kind {
                                WarningKind::TimedOut => "timeout",
                                WarningKind::CircuitOpen => "circuit_open",
                                _ => "error",
                            };
                            metrics::record_member_call(member.as_str(), outcome, elapsed);
                            let warning = MemberWarning::new(member, kind);
                            warn!(operation, warning = %warning, "Member contributed no results");
                            collected.warnings.push(warning);
                        }
                        Err(e) => {
                            warn!(operation, error = %e, "Member call task failed");
                        }
                    }
                }
            }
        }

        collected.responded.sort();
        if collected.responses.is_empty() {
            metrics::record_federated_failure(operation, "no_members_responded");
            return Err(CohortError::NoMembersResponded {
                attempted,
                warnings: collected.warnings,
            });
        }
        Ok(collected)
    }

    /// The local connector plus every ACTIVE remote member with a connector.
    fn sources(&self) -> Vec<(MemberId, Arc<dyn RepositoryConnector>)> {
        let mut sources = vec![(self.local_member_id.clone(), self.local_connector.clone())];
        for member in self.membership.list_active_members() {
            if member.member_id == self.local_member_id {
                continue;
            }
            match self.connectors.get(&member.member_id) {
                Some(connector) => sources.push((member.member_id, connector.clone())),
                None => debug!(member_id = %member.member_id, "Active member has no connector"),
            }
        }
        sources
    }

    fn home_is_live(&self, home: &MemberId) -> bool {
        home == &self.local_member_id
            || self.membership.status_of(home) == Some(MemberStatus::Active)
    }

    /// Keep records with a live home and a known type; count the rest.
    fn admit(
        &self,
        candidates: Vec<(MemberId, InstanceRecord)>,
        warnings: &mut Vec<MemberWarning>,
    ) -> Vec<InstanceRecord> {
        let mut unknown: BTreeMap<MemberId, usize> = BTreeMap::new();
        let admitted = candidates
            .into_iter()
            .filter(|(_, r)| self.home_is_live(&r.home_member_id))
            .filter_map(|(source, r)| {
                if self.registry.is_type_known(&r.body.type_guid) {
                    Some(r)
                } else {
                    *unknown.entry(source).or_insert(0) += 1;
                    None
                }
            })
            .collect();
        for (member, count) in unknown {
            warnings.push(MemberWarning::new(member, WarningKind::UnknownTypeDropped(count)));
        }
        admitted
    }

    /// Two members each answering as home of one GUID is a DUPLICATE_GUID.
    fn report_home_collisions(&self, records: &[InstanceRecord]) {
        for (guid, homes) in home_collisions(records) {
            self.replication.report_home_collision(&guid, &homes);
        }
    }

    fn matches_type(&self, criteria: &QueryCriteria, record: &InstanceRecord) -> bool {
        match &criteria.type_name {
            None => true,
            Some(name) => {
                record.body.type_name == *name
                    || self.registry.is_subtype_of(&record.body.type_guid, name)
            }
        }
    }
}

/// Outcome of one fan-out round.
struct FanOut<T> {
    responses: Vec<(MemberId, T)>,
    responded: Vec<MemberId>,
    warnings: Vec<MemberWarning>,
}

/// One record per GUID: home provenance wins, then the higher version.
fn dedup(records: Vec<InstanceRecord>) -> Vec<InstanceRecord> {
    let mut best: HashMap<InstanceGuid, InstanceRecord> = HashMap::new();
    for record in records {
        match best.get(&record.guid) {
            Some(current) if !preferred(&record, current) => {}
            _ => {
                best.insert(record.guid.clone(), record);
            }
        }
    }
    best.into_values().collect()
}

/// GUIDs served with home provenance by more than one member.
fn home_collisions(records: &[InstanceRecord]) -> Vec<(InstanceGuid, Vec<MemberId>)> {
    let mut homes: BTreeMap<&InstanceGuid, Vec<MemberId>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.provenance == Provenance::Home) {
        let members = homes.entry(&record.guid).or_default();
        if !members.contains(&record.home_member_id) {
            members.push(record.home_member_id.clone());
        }
    }
    homes
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(guid, members)| (guid.clone(), members))
        .collect()
}

fn preferred(candidate: &InstanceRecord, current: &InstanceRecord) -> bool {
    let rank = |r: &InstanceRecord| (r.provenance == Provenance::Home, r.version);
    rank(candidate) > rank(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryEventChannel;
    use crate::config::CohortConfig;
    use crate::conflict::{ConflictKind, ConflictResolver};
    use crate::connector::{BoxFuture, ConnectorError, InMemoryConnector};
    use crate::replication::Collaborators;
    use crate::types::{
        EventKind, EventPayload, InstanceAction, InstanceEvent, MemberRegistration, TypeDef,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<FederatedQueryEngine>,
        membership: Arc<MembershipManager>,
        replication: Arc<ReplicationEngine>,
        local: Arc<InMemoryConnector>,
        conflicts: Arc<ConflictResolver>,
    }

    fn fixture() -> Fixture {
        let config = CohortConfig::for_testing("local");
        let local_id = MemberId::new("local");
        let conflicts = Arc::new(ConflictResolver::new(Duration::from_secs(60)));
        let channel = Arc::new(InMemoryEventChannel::default());
        let membership = Arc::new(MembershipManager::new(local_id.clone(), config.settings.membership.clone()));
        membership.register_local(&MemberRegistration::new("local", "local"));
        let registry = Arc::new(TypeRegistry::new(local_id.clone(), conflicts.clone(), channel.clone()));
        registry.register_type(TypeDef::entity("type-asset", "Asset", 1), &local_id);
        registry.register_type(
            TypeDef::entity("type-table", "Table", 1).with_supertype("Asset"),
            &local_id,
        );
        let local = Arc::new(InMemoryConnector::new("local"));
        let deps = Collaborators {
            membership: membership.clone(),
            registry: registry.clone(),
            conflicts: conflicts.clone(),
            channel,
            local_connector: local.clone(),
        };
        let replication = Arc::new(ReplicationEngine::new(local_id, &config.settings, deps));
        let engine = Arc::new(FederatedQueryEngine::new(
            config.settings.query.clone(),
            membership.clone(),
            registry,
            replication.clone(),
            local.clone(),
        ));
        Fixture {
            engine,
            membership,
            replication,
            local,
            conflicts,
        }
    }

    fn join(f: &Fixture, id: &str) {
        f.membership.on_registration_event(&MemberRegistration::new(id, id));
        f.membership.confirm_registration(&MemberId::new(id)).unwrap();
    }

    fn asset(created: i64, name: &str) -> InstanceBody {
        InstanceBody::new("type-asset", "Asset", created).with_property("name", json!(name))
    }

    struct Failing(MemberId);

    impl RepositoryConnector for Failing {
        fn member_id(&self) -> &MemberId {
            &self.0
        }
        fn find(&self, _: &QueryCriteria) -> BoxFuture<'_, Vec<InstanceRecord>> {
            Box::pin(async { Err(ConnectorError("connection refused".into())) })
        }
        fn get_by_guid(&self, _: &InstanceGuid) -> BoxFuture<'_, Option<InstanceRecord>> {
            Box::pin(async { Err(ConnectorError("connection refused".into())) })
        }
    }

    struct Slow(MemberId);

    impl RepositoryConnector for Slow {
        fn member_id(&self) -> &MemberId {
            &self.0
        }
        fn find(&self, _: &QueryCriteria) -> BoxFuture<'_, Vec<InstanceRecord>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(vec![])
            })
        }
        fn get_by_guid(&self, _: &InstanceGuid) -> BoxFuture<'_, Option<InstanceRecord>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(None)
            })
        }
    }

    #[test]
    fn test_continuation_token_parse() {
        let token = ContinuationToken {
            created_at_ms: 42,
            guid: "a.b.c".to_string(),
        };
        assert_eq!(ContinuationToken::parse(&token.encode()).unwrap(), token);
        assert!(ContinuationToken::parse("garbage").is_err());
        assert!(ContinuationToken::parse("c1.x.guid").is_err());
        assert!(ContinuationToken::parse("c1.5.").is_err());
    }

    #[tokio::test]
    async fn test_find_merges_members_and_pages() {
        let f = fixture();
        join(&f, "member-b");
        let remote = Arc::new(InMemoryConnector::new("member-b"));
        f.engine.register_connector(remote.clone());

        f.local.put("g1", 1, asset(10, "a"));
        remote.put("g2", 1, asset(20, "b"));
        f.local.put("g3", 1, asset(30, "c"));

        let first = f
            .engine
            .find(QueryCriteria::default().with_page_size(2))
            .await
            .unwrap();
        let guids: Vec<&str> = first.value.instances.iter().map(|r| r.guid.as_str()).collect();
        assert_eq!(guids, vec!["g1", "g2"]);
        assert!(first.warnings.is_empty());
        assert_eq!(first.responded.len(), 2);

        let token = first.value.continuation.unwrap();
        let second = f
            .engine
            .find(QueryCriteria::default().with_page_size(2).with_continuation(token))
            .await
            .unwrap();
        assert_eq!(second.value.instances.len(), 1);
        assert_eq!(second.value.instances[0].guid.as_str(), "g3");
        assert!(second.value.continuation.is_none());
    }

    #[tokio::test]
    async fn test_find_prefers_home_over_reference_copy() {
        let f = fixture();
        join(&f, "member-b");
        let remote = Arc::new(InMemoryConnector::new("member-b"));
        f.engine.register_connector(remote.clone());
        remote.put("g1", 5, asset(10, "home"));

        let event = InstanceEvent::new(
            "member-b".into(),
            EventKind::Entity(InstanceAction::Created),
            "g1".into(),
            4,
            EventPayload::Instance(asset(10, "copy")),
        );
        f.replication.apply_inbound_event(&event).unwrap();

        let result = f.engine.find(QueryCriteria::default()).await.unwrap();
        assert_eq!(result.value.instances.len(), 1);
        let record = &result.value.instances[0];
        assert_eq!(record.provenance, Provenance::Home);
        assert_eq!(record.body.properties["name"], json!("home"));
    }

    #[tokio::test]
    async fn test_reference_copies_of_unreachable_home_excluded() {
        let f = fixture();
        join(&f, "member-b");
        let event = InstanceEvent::new(
            "member-b".into(),
            EventKind::Entity(InstanceAction::Created),
            "g1".into(),
            1,
            EventPayload::Instance(asset(10, "copy")),
        );
        f.replication.apply_inbound_event(&event).unwrap();
        assert_eq!(f.engine.find(QueryCriteria::default()).await.unwrap().value.instances.len(), 1);

        f.membership
            .check_heartbeats_at(Instant::now() + Duration::from_secs(3600));
        assert!(f.engine.find(QueryCriteria::default()).await.unwrap().value.instances.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_returns_warnings() {
        let f = fixture();
        join(&f, "member-b");
        join(&f, "member-c");
        f.engine.register_connector(Arc::new(Failing("member-b".into())));
        f.engine.register_connector(Arc::new(Slow("member-c".into())));
        f.local.put("g1", 1, asset(10, "a"));

        let result = f.engine.find(QueryCriteria::default()).await.unwrap();
        assert_eq!(result.value.instances.len(), 1);
        assert_eq!(result.responded, vec![MemberId::new("local")]);
        let kinds: BTreeMap<&str, &WarningKind> = result
            .warnings
            .iter()
            .map(|w| (w.member_id.as_str(), &w.kind))
            .collect();
        assert!(matches!(kinds["member-b"], WarningKind::Failed(_)));
        assert_eq!(kinds["member-c"], &WarningKind::TimedOut);
    }

    #[tokio::test]
    async fn test_type_filter_matches_subtypes() {
        let f = fixture();
        f.local.put("g1", 1, asset(10, "a"));
        f.local.put("g2", 1, InstanceBody::new("type-table", "Table", 20));
        f.local.put("g3", 1, InstanceBody::new("type-unknown", "Mystery", 30));

        let assets = f.engine.find(QueryCriteria::default().with_type("Asset")).await.unwrap();
        assert_eq!(assets.value.instances.len(), 2);
        assert_eq!(
            assets.warnings,
            vec![MemberWarning::new("local".into(), WarningKind::UnknownTypeDropped(1))]
        );

        let tables = f.engine.find(QueryCriteria::default().with_type("Table")).await.unwrap();
        assert_eq!(tables.value.instances.len(), 1);
    }

    #[tokio::test]
    async fn test_two_homes_for_one_guid_raise_conflict() {
        let f = fixture();
        join(&f, "member-b");
        let remote = Arc::new(InMemoryConnector::new("member-b"));
        f.engine.register_connector(remote.clone());
        f.local.put("g1", 1, asset(10, "mine"));
        remote.put("g1", 3, asset(10, "theirs"));
        remote.put("g2", 1, asset(20, "other"));

        let page = f.engine.find(QueryCriteria::default()).await.unwrap();
        assert_eq!(page.value.instances.len(), 2);
        let record = f
            .conflicts
            .open_for(ConflictKind::DuplicateGuid, "g1")
            .expect("conflict raised");
        assert_eq!(
            record.involved_member_ids,
            vec![MemberId::new("local"), MemberId::new("member-b")]
        );

        // Reads of the same GUID coalesce into the open record.
        f.engine.get_by_guid(&"g1".into()).await.unwrap();
        assert_eq!(f.conflicts.open_count(), 1);
        assert_eq!(f.conflicts.open_for(ConflictKind::DuplicateGuid, "g1").unwrap().id, record.id);
    }

    #[tokio::test]
    async fn test_get_by_guid_not_found_and_found() {
        let f = fixture();
        f.local.put("g1", 1, asset(10, "a"));

        let found = f.engine.get_by_guid(&"g1".into()).await.unwrap();
        assert_eq!(found.value.unwrap().guid.as_str(), "g1");
        let missing = f.engine.get_by_guid(&"nope".into()).await.unwrap();
        assert!(missing.value.is_none());
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let f = fixture();
        let err = f
            .engine
            .find(QueryCriteria::default().with_continuation("not-a-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, CohortError::InvalidContinuationToken(_)));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_calls() {
        let f = fixture();
        join(&f, "member-c");
        f.engine.register_connector(Arc::new(Slow("member-c".into())));
        let (tx, rx) = watch::channel(false);

        let engine = f.engine.clone();
        let handle = tokio::spawn(async move {
            engine.find_with_cancel(QueryCriteria::default(), rx).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(CohortError::QueryCancelled)));
    }

    #[tokio::test]
    async fn test_find_pages_streams_every_page() {
        use futures::StreamExt;

        let f = fixture();
        for i in 0..5 {
            f.local.put(format!("g{i}"), 1, asset(i, "x"));
        }
        let pages: Vec<_> = f
            .engine
            .find_pages(QueryCriteria::default().with_page_size(2))
            .collect()
            .await;
        assert_eq!(pages.len(), 3);
        let total: usize = pages.iter().map(|p| p.as_ref().unwrap().value.instances.len()).sum();
        assert_eq!(total, 5);
    }
}
