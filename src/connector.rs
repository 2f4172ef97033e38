// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Repository connector integration traits.
//!
//! A connector gives access to one member's authoritative store. The engine
//! uses connectors in two places:
//! 1. Federated queries fan out to every ACTIVE member's connector.
//! 2. Outbound production reads local changes from the local connector.
//!
//! Inbound remote events never go through a connector; they land in the
//! reference copy store only.
//!
//! # Example
//!
//! ```rust,no_run
//! use cohort_engine::connector::{BoxFuture, InstanceRecord, RepositoryConnector};
//! use cohort_engine::federation::QueryCriteria;
//! use cohort_engine::types::{InstanceGuid, MemberId};
//!
//! struct MyRepository { member_id: MemberId }
//!
//! impl RepositoryConnector for MyRepository {
//!     fn member_id(&self) -> &MemberId {
//!         &self.member_id
//!     }
//!
//!     fn find(&self, _criteria: &QueryCriteria) -> BoxFuture<'_, Vec<InstanceRecord>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn get_by_guid(&self, _guid: &InstanceGuid) -> BoxFuture<'_, Option<InstanceRecord>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//! }
//! ```

use crate::federation::QueryCriteria;
use crate::types::{InstanceBody, InstanceGuid, MemberId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Result type for connector operations.
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ConnectorResult<T>> + Send + 'a>>;

/// Simplified error for connector operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ConnectorError(pub String);

/// Where a record returned by a query came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provenance {
    /// Read from the home member's authoritative store.
    Home,
    /// Read from a non-authoritative reference copy.
    ReferenceCopy,
}

/// One instance as returned by a connector or the reference copy store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub guid: InstanceGuid,
    pub home_member_id: MemberId,
    pub version: u64,
    pub provenance: Provenance,
    pub body: InstanceBody,
}

impl InstanceRecord {
    /// A record read from the home member.
    pub fn home(
        guid: impl Into<InstanceGuid>,
        home_member_id: impl Into<MemberId>,
        version: u64,
        body: InstanceBody,
    ) -> Self {
        Self {
            guid: guid.into(),
            home_member_id: home_member_id.into(),
            version,
            provenance: Provenance::Home,
            body,
        }
    }

    /// Stable paging key: creation time, then GUID.
    pub fn ordering_key(&self) -> (i64, &str) {
        (self.body.created_at_ms, self.guid.as_str())
    }
}

/// Trait defining what we need from a member's repository.
///
/// `find` may return a superset of the matches; the engine re-applies the
/// criteria (including type and paging) to whatever comes back.
pub trait RepositoryConnector: Send + Sync + 'static {
    /// Member whose authoritative store this connector reads.
    fn member_id(&self) -> &MemberId;

    /// Instances matching the criteria.
    fn find(&self, criteria: &QueryCriteria) -> BoxFuture<'_, Vec<InstanceRecord>>;

    /// A single instance by GUID.
    fn get_by_guid(&self, guid: &InstanceGuid) -> BoxFuture<'_, Option<InstanceRecord>>;
}

/// In-memory authoritative store, for standalone members and tests.
pub struct InMemoryConnector {
    member_id: MemberId,
    instances: RwLock<BTreeMap<InstanceGuid, InstanceRecord>>,
}

impl InMemoryConnector {
    pub fn new(member_id: impl Into<MemberId>) -> Self {
        Self {
            member_id: member_id.into(),
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert or replace an instance homed at this member.
    pub fn put(&self, guid: impl Into<InstanceGuid>, version: u64, body: InstanceBody) {
        let guid = guid.into();
        let record = InstanceRecord::home(guid.clone(), self.member_id.clone(), version, body);
        self.instances.write().insert(guid, record);
    }

    pub fn remove(&self, guid: &InstanceGuid) -> Option<InstanceRecord> {
        self.instances.write().remove(guid)
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

impl RepositoryConnector for InMemoryConnector {
    fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    fn find(&self, criteria: &QueryCriteria) -> BoxFuture<'_, Vec<InstanceRecord>> {
        let matches: Vec<InstanceRecord> = self
            .instances
            .read()
            .values()
            .filter(|r| criteria.matches_properties(&r.body))
            .cloned()
            .collect();
        Box::pin(async move { Ok(matches) })
    }

    fn get_by_guid(&self, guid: &InstanceGuid) -> BoxFuture<'_, Option<InstanceRecord>> {
        let found = self.instances.read().get(guid).cloned();
        Box::pin(async move { Ok(found) })
    }
}
