//! # Cohort Engine
//!
//! Membership, replication and federated query for a cohort of peer
//! metadata repositories sharing one event channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              cohort-engine                                │
//! │                                                                           │
//! │  ┌──────────────┐   ┌───────────────────┐   ┌──────────────────────────┐  │
//! │  │ EventChannel │──►│ InboundDispatcher │──►│ ReplicationEngine        │  │
//! │  │ (subscribe)  │   │ (per origin)      │   │ (reference copies)       │  │
//! │  └──────────────┘   └───────────────────┘   └──────────────────────────┘  │
//! │         │                                             │                   │
//! │         ▼                                             ▼                   │
//! │  ┌───────────────────┐  ┌──────────────┐   ┌──────────────────────────┐   │
//! │  │ MembershipManager │  │ TypeRegistry │   │ FederatedQueryEngine     │   │
//! │  │ (heartbeats)      │  │ (type defs)  │   │ (fan-out over members)   │   │
//! │  └───────────────────┘  └──────────────┘   └──────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cohort_engine::{CohortConfig, CohortEngine, InMemoryConnector, InMemoryEventChannel};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CohortConfig::default();
//!     let connector = Arc::new(InMemoryConnector::new(config.local_member_id.clone()));
//!     let channel = Arc::new(InMemoryEventChannel::default());
//!
//!     let engine = CohortEngine::new(config, channel, connector).expect("valid config");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod archive;
pub mod channel;
pub mod circuit_breaker;
pub mod config;
pub mod conflict;
pub mod connector;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod federation;
pub mod membership;
pub mod metrics;
pub mod replication;
pub mod resilience;
pub mod type_registry;
pub mod types;

// Re-exports for convenience
pub use archive::{ArchiveReport, CohortArchive};
pub use channel::{ChannelError, EventChannel, InMemoryEventChannel};
pub use config::{CohortConfig, CohortSettings};
pub use conflict::{ConflictKind, ConflictRecord, ConflictResolver};
pub use connector::{ConnectorError, InMemoryConnector, InstanceRecord, Provenance, RepositoryConnector};
pub use coordinator::{CohortEngine, EngineState, HealthCheck};
pub use error::{CohortError, Result};
pub use federation::{FederatedQueryEngine, FederatedResult, FindPage, MemberWarning, QueryCriteria, WarningKind};
pub use membership::{CohortMember, MemberStatus, MembershipManager};
pub use replication::{ApplyOutcome, LocalChange, ReplicationEngine};
pub use type_registry::{RegistrationOutcome, TypeRegistry};
pub use types::{
    CohortEvent, EventKind, EventPayload, InstanceBody, InstanceEvent, InstanceGuid, MemberId,
    MemberRegistration, RegistryEvent, TypeDef, TypeGuid,
};
