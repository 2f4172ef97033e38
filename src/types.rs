// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core data model shared by every cohort component.
//!
//! Event kinds and payloads are closed sum types so that every consumer
//! handles each case explicitly:
//!
//! ```text
//! CohortEvent
//! ├── Registry(RegistryEvent)      # membership traffic
//! │   ├── Registration
//! │   ├── RefreshRequest
//! │   └── Deregistration
//! └── Instance(InstanceEvent)      # replication traffic
//!     kind: Entity(action) | Relationship(action)
//!         | Classification(action) | TypeDefAdded | TypeDefUpdated
//! ```
//!
//! Relations between members, instances and types are held by identifier
//! only; there are no back-pointers between model types.

use crate::error::{CohortError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Globally unique metadata collection identifier of a cohort member.
    MemberId
);
string_id!(
    /// GUID of an entity or relationship instance.
    InstanceGuid
);
string_id!(
    /// GUID of a type definition.
    TypeGuid
);
string_id!(
    /// Unique identifier of a single published event.
    EventId
);

impl EventId {
    /// Generate a fresh random event ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════════════════════════

/// What kind of instance a type describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypeCategory {
    Entity,
    Relationship,
    Classification,
}

/// One attribute of a type definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    /// Primitive or named type of the attribute (e.g. `"string"`).
    pub type_name: String,
}

impl AttributeDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Identity and lineage of a type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefSummary {
    pub guid: TypeGuid,
    pub name: String,
    pub version: u64,
    pub category: TypeCategory,
    pub supertype_name: Option<String>,
}

/// A full type definition: summary plus the attribute set used for
/// compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub guid: TypeGuid,
    pub name: String,
    pub version: u64,
    pub category: TypeCategory,
    #[serde(default)]
    pub supertype_name: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
}

impl TypeDef {
    /// Create an entity type with no attributes and no supertype.
    pub fn entity(guid: impl Into<TypeGuid>, name: impl Into<String>, version: u64) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            version,
            category: TypeCategory::Entity,
            supertype_name: None,
            attributes: Vec::new(),
        }
    }

    /// Builder: add an attribute.
    pub fn with_attribute(mut self, name: &str, type_name: &str) -> Self {
        self.attributes.push(AttributeDef::new(name, type_name));
        self
    }

    /// Builder: set the supertype.
    pub fn with_supertype(mut self, supertype_name: &str) -> Self {
        self.supertype_name = Some(supertype_name.to_string());
        self
    }

    /// Builder: set the category.
    pub fn with_category(mut self, category: TypeCategory) -> Self {
        self.category = category;
        self
    }

    pub fn summary(&self) -> TypeDefSummary {
        TypeDefSummary {
            guid: self.guid.clone(),
            name: self.name.clone(),
            version: self.version,
            category: self.category,
            supertype_name: self.supertype_name.clone(),
        }
    }

    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Instances
// ═══════════════════════════════════════════════════════════════════════════════

/// A classification attached to an entity.
///
/// The member that first applied a classification owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub name: String,
    pub origin_member_id: MemberId,
    pub version: u64,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

/// The replicated content of an entity or relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceBody {
    pub type_guid: TypeGuid,
    pub type_name: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub classifications: BTreeMap<String, Classification>,
}

impl InstanceBody {
    pub fn new(type_guid: impl Into<TypeGuid>, type_name: impl Into<String>, created_at_ms: i64) -> Self {
        Self {
            type_guid: type_guid.into(),
            type_name: type_name.into(),
            created_at_ms,
            updated_at_ms: created_at_ms,
            properties: BTreeMap::new(),
            classifications: BTreeMap::new(),
        }
    }

    /// Builder: set a property.
    pub fn with_property(mut self, name: &str, value: serde_json::Value) -> Self {
        self.properties.insert(name.to_string(), value);
        self
    }
}

/// Entity or relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceCategory {
    Entity,
    Relationship,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle action on an entity or relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceAction {
    Created,
    Updated,
    Deleted,
    Purged,
    Restored,
    Reidentified,
    Retyped,
    Rehomed,
}

impl InstanceAction {
    fn label(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deleted => "DELETED",
            Self::Purged => "PURGED",
            Self::Restored => "RESTORED",
            Self::Reidentified => "REIDENTIFIED",
            Self::Retyped => "RETYPED",
            Self::Rehomed => "REHOMED",
        }
    }
}

/// Action on a classification of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationAction {
    Classified,
    Reclassified,
    Declassified,
}

/// Kind of an [`InstanceEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Entity(InstanceAction),
    Relationship(InstanceAction),
    Classification(ClassificationAction),
    TypeDefAdded,
    TypeDefUpdated,
}

impl EventKind {
    /// True for `TypeDefAdded` / `TypeDefUpdated`.
    pub fn is_type_event(&self) -> bool {
        matches!(self, Self::TypeDefAdded | Self::TypeDefUpdated)
    }

    /// The instance action, if this is an entity or relationship event.
    pub fn instance_action(&self) -> Option<InstanceAction> {
        match self {
            Self::Entity(a) | Self::Relationship(a) => Some(*a),
            _ => None,
        }
    }

    pub fn category(&self) -> Option<InstanceCategory> {
        match self {
            Self::Entity(_) | Self::Classification(_) => Some(InstanceCategory::Entity),
            Self::Relationship(_) => Some(InstanceCategory::Relationship),
            Self::TypeDefAdded | Self::TypeDefUpdated => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entity(a) => write!(f, "ENTITY_{}", a.label()),
            Self::Relationship(a) => write!(f, "RELATIONSHIP_{}", a.label()),
            Self::Classification(ClassificationAction::Classified) => write!(f, "ENTITY_CLASSIFIED"),
            Self::Classification(ClassificationAction::Reclassified) => write!(f, "ENTITY_RECLASSIFIED"),
            Self::Classification(ClassificationAction::Declassified) => write!(f, "ENTITY_DECLASSIFIED"),
            Self::TypeDefAdded => write!(f, "TYPE_DEF_ADDED"),
            Self::TypeDefUpdated => write!(f, "TYPE_DEF_UPDATED"),
        }
    }
}

/// Payload carried by an [`InstanceEvent`]; must agree with the kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    Instance(InstanceBody),
    Rehome {
        previous_home: MemberId,
        body: InstanceBody,
    },
    Reidentify {
        previous_guid: InstanceGuid,
        body: InstanceBody,
    },
    Classification(Classification),
    Declassify {
        name: String,
    },
    TypeDef(TypeDef),
    Empty,
}

/// A single replicated change, produced once by its home member.
///
/// For type events `instance_guid` carries the type GUID and
/// `instance_version` the type version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub event_id: EventId,
    pub origin_member_id: MemberId,
    pub kind: EventKind,
    pub instance_guid: InstanceGuid,
    pub instance_version: u64,
    pub payload: EventPayload,
}

impl InstanceEvent {
    /// Build an event with a freshly generated event ID.
    pub fn new(
        origin_member_id: MemberId,
        kind: EventKind,
        instance_guid: InstanceGuid,
        instance_version: u64,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            origin_member_id,
            kind,
            instance_guid,
            instance_version,
            payload,
        }
    }

    /// Build a `TYPE_DEF_ADDED` / `TYPE_DEF_UPDATED` event for a type.
    pub fn type_def(origin_member_id: MemberId, def: TypeDef, updated: bool) -> Self {
        let kind = if updated {
            EventKind::TypeDefUpdated
        } else {
            EventKind::TypeDefAdded
        };
        Self::new(
            origin_member_id,
            kind,
            InstanceGuid::new(def.guid.as_str()),
            def.version,
            EventPayload::TypeDef(def),
        )
    }

    /// The instance body carried by this event, if any.
    pub fn body(&self) -> Option<&InstanceBody> {
        match &self.payload {
            EventPayload::Instance(body)
            | EventPayload::Rehome { body, .. }
            | EventPayload::Reidentify { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Type GUID the event depends on: the body's type for instance events.
    pub fn required_type(&self) -> Option<&TypeGuid> {
        self.body().map(|b| &b.type_guid)
    }

    /// Check that identifiers are present and the payload matches the kind.
    pub fn validate(&self) -> Result<()> {
        if self.event_id.is_empty() {
            return Err(CohortError::MalformedEvent("empty event_id".to_string()));
        }
        if self.origin_member_id.is_empty() {
            return Err(CohortError::MalformedEvent("empty origin_member_id".to_string()));
        }
        if self.instance_guid.is_empty() {
            return Err(CohortError::MalformedEvent("empty instance_guid".to_string()));
        }
        if self.instance_version == 0 {
            return Err(CohortError::MalformedEvent(format!(
                "{} for {} has version 0",
                self.kind, self.instance_guid
            )));
        }

        let ok = match (self.kind, &self.payload) {
            (EventKind::TypeDefAdded | EventKind::TypeDefUpdated, EventPayload::TypeDef(def)) => {
                def.guid.as_str() == self.instance_guid.as_str()
            }
            (EventKind::Entity(action) | EventKind::Relationship(action), payload) => match action {
                InstanceAction::Created
                | InstanceAction::Updated
                | InstanceAction::Restored
                | InstanceAction::Retyped => matches!(payload, EventPayload::Instance(_)),
                InstanceAction::Deleted | InstanceAction::Purged => {
                    matches!(payload, EventPayload::Instance(_) | EventPayload::Empty)
                }
                InstanceAction::Rehomed => matches!(payload, EventPayload::Rehome { .. }),
                InstanceAction::Reidentified => match payload {
                    EventPayload::Reidentify { previous_guid, .. } => {
                        !previous_guid.is_empty() && previous_guid != &self.instance_guid
                    }
                    _ => false,
                },
            },
            (
                EventKind::Classification(
                    ClassificationAction::Classified | ClassificationAction::Reclassified,
                ),
                EventPayload::Classification(c),
            ) => !c.name.is_empty(),
            (
                EventKind::Classification(ClassificationAction::Declassified),
                EventPayload::Declassify { name },
            ) => !name.is_empty(),
            _ => false,
        };

        if ok {
            Ok(())
        } else {
            Err(CohortError::MalformedEvent(format!(
                "{} for {} carries an incompatible payload",
                self.kind, self.instance_guid
            )))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry events and the channel envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// What a member announces when it joins the cohort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRegistration {
    pub member_id: MemberId,
    pub display_name: String,
    pub origin_timestamp_ms: i64,
    /// Type name → highest version the member supports.
    #[serde(default)]
    pub supported_type_versions: BTreeMap<String, u64>,
}

impl MemberRegistration {
    pub fn new(member_id: impl Into<MemberId>, display_name: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            display_name: display_name.into(),
            origin_timestamp_ms: now_millis(),
            supported_type_versions: BTreeMap::new(),
        }
    }

    /// Builder: advertise a supported type version.
    pub fn with_type(mut self, type_name: &str, version: u64) -> Self {
        self.supported_type_versions.insert(type_name.to_string(), version);
        self
    }
}

/// Membership traffic on the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryEvent {
    Registration(MemberRegistration),
    RefreshRequest { member_id: MemberId },
    Deregistration { member_id: MemberId },
}

impl RegistryEvent {
    pub fn member_id(&self) -> &MemberId {
        match self {
            Self::Registration(r) => &r.member_id,
            Self::RefreshRequest { member_id } | Self::Deregistration { member_id } => member_id,
        }
    }
}

/// Envelope for everything carried by the event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortEvent {
    Registry(RegistryEvent),
    Instance(InstanceEvent),
}

impl CohortEvent {
    /// Partition key: events from one origin are applied strictly in order.
    pub fn partition_key(&self) -> &MemberId {
        match self {
            Self::Registry(e) => e.member_id(),
            Self::Instance(e) => &e.origin_member_id,
        }
    }

    /// Decode an event from its JSON form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let event: CohortEvent = serde_json::from_slice(bytes)?;
        if let CohortEvent::Instance(ref e) = event {
            e.validate()?;
        }
        Ok(event)
    }

    /// Encode an event to its JSON form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CohortError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> InstanceBody {
        InstanceBody::new("type-1", "Asset", 1_000)
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::Entity(InstanceAction::Created).to_string(), "ENTITY_CREATED");
        assert_eq!(
            EventKind::Relationship(InstanceAction::Rehomed).to_string(),
            "RELATIONSHIP_REHOMED"
        );
        assert_eq!(
            EventKind::Classification(ClassificationAction::Declassified).to_string(),
            "ENTITY_DECLASSIFIED"
        );
        assert_eq!(EventKind::TypeDefUpdated.to_string(), "TYPE_DEF_UPDATED");
    }

    #[test]
    fn test_validate_accepts_matching_payload() {
        let event = InstanceEvent::new(
            "member-a".into(),
            EventKind::Entity(InstanceAction::Created),
            "guid-1".into(),
            1,
            EventPayload::Instance(body()),
        );
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_mismatched_payload() {
        let event = InstanceEvent::new(
            "member-a".into(),
            EventKind::Entity(InstanceAction::Rehomed),
            "guid-1".into(),
            2,
            EventPayload::Instance(body()),
        );
        assert!(matches!(event.validate(), Err(CohortError::MalformedEvent(_))));
    }

    #[test]
    fn test_validate_rejects_zero_version() {
        let event = InstanceEvent::new(
            "member-a".into(),
            EventKind::Entity(InstanceAction::Created),
            "guid-1".into(),
            0,
            EventPayload::Instance(body()),
        );
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_validate_reidentify_requires_distinct_guid() {
        let event = InstanceEvent::new(
            "member-a".into(),
            EventKind::Entity(InstanceAction::Reidentified),
            "guid-1".into(),
            2,
            EventPayload::Reidentify {
                previous_guid: "guid-1".into(),
                body: body(),
            },
        );
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_type_def_event_carries_type_guid() {
        let def = TypeDef::entity("type-1", "Asset", 3);
        let event = InstanceEvent::type_def("member-a".into(), def, true);
        assert_eq!(event.kind, EventKind::TypeDefUpdated);
        assert_eq!(event.instance_guid.as_str(), "type-1");
        assert_eq!(event.instance_version, 3);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            CohortEvent::decode(b"not json at all"),
            Err(CohortError::MalformedEvent(_))
        ));
    }

    #[test]
    fn test_decode_validates_instance_events() {
        let bad = CohortEvent::Instance(InstanceEvent::new(
            "member-a".into(),
            EventKind::TypeDefAdded,
            "type-1".into(),
            1,
            EventPayload::Empty,
        ));
        let bytes = serde_json::to_vec(&bad).unwrap();
        assert!(CohortEvent::decode(&bytes).is_err());
    }

    #[test]
    fn test_partition_key() {
        let reg = CohortEvent::Registry(RegistryEvent::RefreshRequest {
            member_id: "member-b".into(),
        });
        assert_eq!(reg.partition_key().as_str(), "member-b");
    }

    #[test]
    fn test_supertype_builder() {
        let def = TypeDef::entity("t", "DataSet", 1)
            .with_supertype("Asset")
            .with_attribute("name", "string");
        assert_eq!(def.summary().supertype_name.as_deref(), Some("Asset"));
        assert_eq!(def.attribute("name").map(|a| a.type_name.as_str()), Some("string"));
    }
}
