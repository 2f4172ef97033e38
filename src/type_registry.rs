// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Type registry: validates and stores type definitions.
//!
//! # Acceptance Rules
//!
//! | Existing definition for guid | Incoming | Outcome |
//! |------------------------------|----------|---------|
//! | none | any | `Accepted` |
//! | same name, same version, same attributes | | `Accepted` (no-op) |
//! | same name, lower version | | `Accepted` (stale replay, no-op) |
//! | same name, higher version, attributes a superset | | `AcceptedAsNewVersion` |
//! | same name, higher version, attribute removed/retyped | | `Rejected` + TYPE_INCOMPATIBLE |
//! | same version, different attributes | | `Rejected` + TYPE_INCOMPATIBLE |
//! | different name | | `Rejected` + TYPE_INCOMPATIBLE |
//!
//! A name already used under a *different* guid is accepted, but a
//! TYPE_INCOMPATIBLE record naming the collision is raised so federated
//! queries can disambiguate.
//!
//! # Concurrency
//!
//! Writes are serialized by a single writer lock and install a fresh
//! immutable snapshot. Reads clone the current snapshot `Arc` and never
//! wait on a writer.

use crate::channel::EventChannel;
use crate::conflict::{ConflictKind, ConflictResolver};
use crate::error::{CohortError, Result};
use crate::metrics;
use crate::types::{CohortEvent, InstanceEvent, MemberId, TypeDef, TypeDefSummary, TypeGuid};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of [`TypeRegistry::register_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Accepted,
    AcceptedAsNewVersion,
    Rejected(String),
}

impl RegistrationOutcome {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone)]
struct TypeEntry {
    def: TypeDef,
    /// Member whose registration installed the current version.
    source: MemberId,
}

#[derive(Debug, Clone, Default)]
struct TypeSnapshot {
    by_guid: HashMap<TypeGuid, TypeEntry>,
    /// Sorted so lookups by name are deterministic.
    by_name: HashMap<String, BTreeSet<TypeGuid>>,
}

/// Version skew for one type between this member and a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSkew {
    pub type_name: String,
    pub local_version: u64,
    pub member_version: u64,
}

/// What a member's advertised type versions look like from here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeNegotiation {
    /// Type names the member supports that this registry has never seen.
    pub unknown: Vec<String>,
    /// Types both sides know at different versions.
    pub skewed: Vec<VersionSkew>,
}

impl TypeNegotiation {
    pub fn is_fully_compatible(&self) -> bool {
        self.unknown.is_empty() && self.skewed.is_empty()
    }
}

/// Validated store of type definitions shared by all components.
pub struct TypeRegistry {
    local_member_id: MemberId,
    snapshot: RwLock<Arc<TypeSnapshot>>,
    writer: Mutex<()>,
    conflicts: Arc<ConflictResolver>,
    channel: Arc<dyn EventChannel>,
    /// Local definitions installed but not yet announced: version and
    /// whether the owed event is TYPE_DEF_UPDATED.
    unpublished: Mutex<HashMap<TypeGuid, (u64, bool)>>,
}

impl TypeRegistry {
    pub fn new(
        local_member_id: MemberId,
        conflicts: Arc<ConflictResolver>,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            local_member_id,
            snapshot: RwLock::new(Arc::new(TypeSnapshot::default())),
            writer: Mutex::new(()),
            conflicts,
            channel,
            unpublished: Mutex::new(HashMap::new()),
        }
    }

    fn current(&self) -> Arc<TypeSnapshot> {
        self.snapshot.read().clone()
    }

    /// Validate and store a definition received from `source`.
    ///
    /// Does not publish; remote definitions arrive already published.
    pub fn register_type(&self, def: TypeDef, source: &MemberId) -> RegistrationOutcome {
        self.apply(def, source).0
    }

    /// Register a definition owned by the local member and publish the
    /// resulting TYPE_DEF_ADDED / TYPE_DEF_UPDATED event.
    ///
    /// No-op acceptances and rejections are not published, except a retry
    /// of a definition whose announcement failed.
    pub async fn register_local_type(&self, def: TypeDef) -> Result<RegistrationOutcome> {
        let (outcome, changed) = self.apply(def.clone(), &self.local_member_id);
        let updated = if changed {
            outcome == RegistrationOutcome::AcceptedAsNewVersion
        } else {
            match self.owed_announcement(&def) {
                Some(updated) if outcome.is_accepted() => updated,
                _ => return Ok(outcome),
            }
        };

        let guid = def.guid.clone();
        let version = def.version;
        let event = InstanceEvent::type_def(self.local_member_id.clone(), def, updated);
        let kind = event.kind.to_string();
        match self.channel.publish(CohortEvent::Instance(event)).await {
            Ok(()) => {
                self.unpublished.lock().remove(&guid);
                metrics::record_outbound_event(&kind, true);
                Ok(outcome)
            }
            Err(e) => {
                warn!(type_guid = %guid, version, error = %e, "Type definition not announced");
                self.unpublished.lock().insert(guid, (version, updated));
                metrics::record_outbound_event(&kind, false);
                Err(CohortError::Channel(e.to_string()))
            }
        }
    }

    /// The event kind still owed for `def`, if its announcement failed and
    /// it is still the installed version.
    fn owed_announcement(&self, def: &TypeDef) -> Option<bool> {
        let (version, updated) = *self.unpublished.lock().get(&def.guid)?;
        let installed = self
            .current()
            .by_guid
            .get(&def.guid)
            .is_some_and(|e| e.def.version == version);
        (installed && version == def.version).then_some(updated)
    }

    /// Returns the outcome and whether the canonical state changed.
    fn apply(&self, def: TypeDef, source: &MemberId) -> (RegistrationOutcome, bool) {
        let _guard = self.writer.lock();
        let current = self.current();

        let (outcome, changed) = match current.by_guid.get(&def.guid) {
            None => {
                let collisions: Vec<TypeGuid> = current
                    .by_name
                    .get(&def.name)
                    .map(|guids| guids.iter().cloned().collect())
                    .unwrap_or_default();
                if !collisions.is_empty() {
                    let mut members = vec![source.clone()];
                    for guid in &collisions {
                        if let Some(entry) = current.by_guid.get(guid) {
                            members.push(entry.source.clone());
                        }
                    }
                    let others: Vec<&str> = collisions.iter().map(|g| g.as_str()).collect();
                    self.conflicts.report(
                        ConflictKind::TypeIncompatible,
                        &members,
                        &def.name,
                        format!(
                            "type name '{}' registered under guid {} and also under {}",
                            def.name,
                            def.guid,
                            others.join(", ")
                        ),
                    );
                }
                (RegistrationOutcome::Accepted, true)
            }
            Some(existing) => self.check_against(existing, &def, source),
        };

        if changed {
            let mut next = (*current).clone();
            next.by_name
                .entry(def.name.clone())
                .or_default()
                .insert(def.guid.clone());
            info!(
                type_guid = %def.guid,
                type_name = %def.name,
                version = def.version,
                source = %source,
                "Type definition accepted"
            );
            next.by_guid.insert(
                def.guid.clone(),
                TypeEntry {
                    def,
                    source: source.clone(),
                },
            );
            metrics::set_known_types(next.by_guid.len());
            *self.snapshot.write() = Arc::new(next);
        }

        let label = match (&outcome, changed) {
            (RegistrationOutcome::Accepted, true) => "accepted",
            (RegistrationOutcome::Accepted, false) => "duplicate",
            (RegistrationOutcome::AcceptedAsNewVersion, _) => "new_version",
            (RegistrationOutcome::Rejected(_), _) => "rejected",
        };
        metrics::record_type_registration(label);
        (outcome, changed)
    }

    fn check_against(
        &self,
        existing: &TypeEntry,
        def: &TypeDef,
        source: &MemberId,
    ) -> (RegistrationOutcome, bool) {
        let old = &existing.def;

        let problem = if old.name != def.name {
            Some(format!(
                "guid {} already names type '{}', cannot rename to '{}'",
                def.guid, old.name, def.name
            ))
        } else if def.version < old.version {
            debug!(
                type_guid = %def.guid,
                stored = old.version,
                incoming = def.version,
                "Stale type definition ignored"
            );
            return (RegistrationOutcome::Accepted, false);
        } else if def.version == old.version {
            if same_definition(old, def) {
                return (RegistrationOutcome::Accepted, false);
            }
            Some(format!(
                "type '{}' version {} redefined with a different attribute set",
                def.name, def.version
            ))
        } else {
            incompatibility(old, def)
        };

        match problem {
            None => (RegistrationOutcome::AcceptedAsNewVersion, true),
            Some(reason) => {
                warn!(
                    type_guid = %def.guid,
                    type_name = %def.name,
                    source = %source,
                    reason = %reason,
                    "Type definition rejected"
                );
                self.conflicts.report(
                    ConflictKind::TypeIncompatible,
                    &[source.clone(), existing.source.clone()],
                    def.guid.as_str(),
                    reason.clone(),
                );
                (RegistrationOutcome::Rejected(reason), false)
            }
        }
    }

    pub fn is_type_known(&self, guid: &TypeGuid) -> bool {
        self.current().by_guid.contains_key(guid)
    }

    /// The canonical definition for a guid.
    pub fn get(&self, guid: &TypeGuid) -> Option<TypeDef> {
        self.current().by_guid.get(guid).map(|e| e.def.clone())
    }

    /// All definitions registered under a name (more than one on collision).
    pub fn get_by_name(&self, name: &str) -> Vec<TypeDef> {
        let snap = self.current();
        snap.by_name
            .get(name)
            .map(|guids| {
                guids
                    .iter()
                    .filter_map(|g| snap.by_guid.get(g).map(|e| e.def.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Summaries of every canonical definition, ordered by name then guid.
    pub fn list(&self) -> Vec<TypeDefSummary> {
        let mut all: Vec<TypeDefSummary> =
            self.current().by_guid.values().map(|e| e.def.summary()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.guid.cmp(&b.guid)));
        all
    }

    pub fn len(&self) -> usize {
        self.current().by_guid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type itself followed by its supertypes, nearest first.
    ///
    /// Supertypes are resolved by name; on a name collision the lowest guid
    /// wins. Unknown supertypes end the chain. Empty if the guid is unknown.
    pub fn supertype_chain_of(&self, guid: &TypeGuid) -> Vec<TypeDefSummary> {
        let snap = self.current();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = snap.by_guid.get(guid);

        while let Some(entry) = next {
            if !seen.insert(entry.def.guid.clone()) {
                warn!(type_guid = %guid, "Supertype cycle detected");
                break;
            }
            chain.push(entry.def.summary());
            next = entry
                .def
                .supertype_name
                .as_ref()
                .and_then(|name| snap.by_name.get(name))
                .and_then(|guids| guids.iter().next())
                .and_then(|g| snap.by_guid.get(g));
        }
        chain
    }

    /// Whether instances of `guid` satisfy a query for `type_name`.
    pub fn is_subtype_of(&self, guid: &TypeGuid, type_name: &str) -> bool {
        self.supertype_chain_of(guid).iter().any(|s| s.name == type_name)
    }

    /// Compare a member's advertised type versions with the registry.
    ///
    /// Skew is informational; it never blocks registration.
    pub fn negotiate(&self, supported: &BTreeMap<String, u64>) -> TypeNegotiation {
        let snap = self.current();
        let mut result = TypeNegotiation::default();

        for (name, &member_version) in supported {
            let local_version = snap
                .by_name
                .get(name)
                .into_iter()
                .flatten()
                .filter_map(|g| snap.by_guid.get(g))
                .map(|e| e.def.version)
                .max();
            match local_version {
                None => result.unknown.push(name.clone()),
                Some(local_version) if local_version != member_version => {
                    result.skewed.push(VersionSkew {
                        type_name: name.clone(),
                        local_version,
                        member_version,
                    })
                }
                Some(_) => {}
            }
        }
        result
    }
}

fn attribute_map(def: &TypeDef) -> BTreeMap<&str, &str> {
    def.attributes
        .iter()
        .map(|a| (a.name.as_str(), a.type_name.as_str()))
        .collect()
}

fn same_definition(a: &TypeDef, b: &TypeDef) -> bool {
    a.category == b.category
        && a.supertype_name == b.supertype_name
        && attribute_map(a) == attribute_map(b)
}

/// Why `new` cannot replace `old`, if it cannot.
fn incompatibility(old: &TypeDef, new: &TypeDef) -> Option<String> {
    if old.category != new.category {
        return Some(format!(
            "type '{}' changes category from {:?} to {:?}",
            old.name, old.category, new.category
        ));
    }
    if old.supertype_name != new.supertype_name {
        return Some(format!(
            "type '{}' changes supertype from {:?} to {:?}",
            old.name, old.supertype_name, new.supertype_name
        ));
    }
    let new_attrs = attribute_map(new);
    for attr in &old.attributes {
        match new_attrs.get(attr.name.as_str()) {
            None => {
                return Some(format!(
                    "type '{}' version {} removes attribute '{}'",
                    new.name, new.version, attr.name
                ))
            }
            Some(t) if *t != attr.type_name => {
                return Some(format!(
                    "type '{}' version {} retypes attribute '{}' from {} to {}",
                    new.name, new.version, attr.name, attr.type_name, t
                ))
            }
            Some(_) => {}
        }
    }
    None
}
