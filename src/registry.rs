// The authoritative catalog of installed modules.
//
// One entry per (module id, version). Lookups by id, version and
// capability; status transitions with the single-active-version-per-tenant
// invariant enforced here. Reads take snapshot clones so in-flight readers
// never observe a half-applied mutation; every mutation bumps a generation
// counter consumed by the dependency resolver cache.

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::module_definition::{DefinitionValidator, ModuleDefinition};
use crate::module_metadata::{CapabilityId, ModuleId, ModuleStatus, TenantId};
use crate::ports::Clock;

/// Per-entry counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryStats {
    pub activation_count: u64,
    pub failure_count: u64,
}

/// A registered module version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub definition: ModuleDefinition,
    pub status: ModuleStatus,
    pub installed_at: DateTime<Utc>,
    pub last_activated_at: Option<DateTime<Utc>>,
    pub stats: EntryStats,
}

impl RegistryEntry {
    pub fn id(&self) -> &ModuleId {
        &self.definition.id
    }

    pub fn version(&self) -> &Version {
        &self.definition.version
    }
}

/// A recorded status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub id: ModuleId,
    pub version: Version,
    pub from: ModuleStatus,
    pub to: ModuleStatus,
    pub at: DateTime<Utc>,
}

/// Events emitted on registry mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered { id: ModuleId, version: Version },
    Unregistered { id: ModuleId, version: Version },
    StatusChanged {
        id: ModuleId,
        version: Version,
        from: ModuleStatus,
        to: ModuleStatus,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("module {id}@{version} is already registered")]
    DuplicateEntry { id: ModuleId, version: Version },

    #[error("module {id}{} not found", .version.as_ref().map(|v| format!("@{}", v)).unwrap_or_default())]
    NotFound {
        id: ModuleId,
        version: Option<Version>,
    },

    #[error("definition for {id}@{version} failed validation: {reasons}")]
    InvalidDefinition {
        id: ModuleId,
        version: Version,
        reasons: String,
    },

    #[error("module {id}@{version} is still active and cannot be unregistered")]
    StillActive { id: ModuleId, version: Version },

    #[error("active status is managed per tenant; use set_active")]
    DirectActiveStatus,
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::DuplicateEntry { .. } | RegistryError::StillActive { .. } => {
                ErrorKind::ModuleConflict
            }
            RegistryError::NotFound { .. } => ErrorKind::Validation,
            RegistryError::InvalidDefinition { .. } => ErrorKind::Validation,
            RegistryError::DirectActiveStatus => ErrorKind::Validation,
        }
    }
}

/// Filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<ModuleStatus>,
    pub id_prefix: Option<String>,
    pub capability: Option<CapabilityId>,
}

type Listener = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

struct Inner {
    /// id -> version -> entry, versions ordered
    entries: HashMap<ModuleId, BTreeMap<Version, RegistryEntry>>,
    capability_index: HashMap<CapabilityId, HashSet<(ModuleId, Version)>>,
    /// tenant -> module id -> active version pointer
    active_by_tenant: HashMap<TenantId, HashMap<ModuleId, Version>>,
    status_log: VecDeque<StatusChange>,
}

const STATUS_LOG_CAPACITY: usize = 512;

/// In-memory module catalog.
pub struct ModuleRegistry {
    inner: RwLock<Inner>,
    listeners: RwLock<Vec<Listener>>,
    generation: AtomicU64,
    validator: DefinitionValidator,
    clock: Arc<dyn Clock>,
}

impl ModuleRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                capability_index: HashMap::new(),
                active_by_tenant: HashMap::new(),
                status_log: VecDeque::new(),
            }),
            listeners: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
            validator: DefinitionValidator::new(),
            clock,
        }
    }

    /// Current mutation generation. Bumped on every mutation; the resolver
    /// cache treats a generation change as total invalidation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, event: RegistryEvent) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        for listener in self.listeners.read().iter() {
            listener(&event);
        }
    }

    /// Install a definition. Rejects invalid definitions and duplicate
    /// (id, version) pairs.
    pub fn register(&self, definition: ModuleDefinition) -> Result<RegistryEntry, RegistryError> {
        let validation = self.validator.validate(&definition);
        if !validation.valid {
            let reasons = validation
                .errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(RegistryError::InvalidDefinition {
                id: definition.id.clone(),
                version: definition.version.clone(),
                reasons,
            });
        }

        let entry = RegistryEntry {
            status: ModuleStatus::Installed,
            installed_at: self.clock.now(),
            last_activated_at: None,
            stats: EntryStats::default(),
            definition,
        };

        let (id, version) = (entry.id().clone(), entry.version().clone());
        {
            let mut inner = self.inner.write();
            let versions = inner.entries.entry(id.clone()).or_default();
            if versions.contains_key(&version) {
                return Err(RegistryError::DuplicateEntry { id, version });
            }
            versions.insert(version.clone(), entry.clone());

            for capability in &entry.definition.capabilities {
                inner
                    .capability_index
                    .entry(capability.id.clone())
                    .or_default()
                    .insert((id.clone(), version.clone()));
            }
        }

        info!("registered module {}@{}", id, version);
        self.notify(RegistryEvent::Registered { id, version });
        Ok(entry)
    }

    /// Remove an entry. Fails while any tenant still has it active.
    pub fn unregister(&self, id: &ModuleId, version: &Version) -> Result<(), RegistryError> {
        {
            let mut inner = self.inner.write();
            let versions = inner.entries.get(id).ok_or_else(|| RegistryError::NotFound {
                id: id.clone(),
                version: Some(version.clone()),
            })?;
            if !versions.contains_key(version) {
                return Err(RegistryError::NotFound {
                    id: id.clone(),
                    version: Some(version.clone()),
                });
            }

            let active_somewhere = inner
                .active_by_tenant
                .values()
                .any(|mods| mods.get(id) == Some(version));
            if active_somewhere {
                return Err(RegistryError::StillActive {
                    id: id.clone(),
                    version: version.clone(),
                });
            }

            let entry = inner
                .entries
                .get_mut(id)
                .and_then(|versions| versions.remove(version));
            if let Some(entry) = entry {
                for capability in &entry.definition.capabilities {
                    if let Some(providers) = inner.capability_index.get_mut(&capability.id) {
                        providers.remove(&(id.clone(), version.clone()));
                        if providers.is_empty() {
                            inner.capability_index.remove(&capability.id);
                        }
                    }
                }
            }
            if inner.entries.get(id).map(|v| v.is_empty()).unwrap_or(false) {
                inner.entries.remove(id);
            }
        }

        info!("unregistered module {}@{}", id, version);
        self.notify(RegistryEvent::Unregistered {
            id: id.clone(),
            version: version.clone(),
        });
        Ok(())
    }

    /// Highest registered version of a module.
    pub fn get(&self, id: &ModuleId) -> Option<RegistryEntry> {
        self.inner
            .read()
            .entries
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned())
    }

    pub fn get_version(&self, id: &ModuleId, version: &Version) -> Option<RegistryEntry> {
        self.inner
            .read()
            .entries
            .get(id)
            .and_then(|versions| versions.get(version).cloned())
    }

    /// All versions of a module, ascending.
    pub fn versions_of(&self, id: &ModuleId) -> Vec<RegistryEntry> {
        self.inner
            .read()
            .entries
            .get(id)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries providing a capability.
    pub fn find_by_capability(&self, capability: &CapabilityId) -> Vec<RegistryEntry> {
        let inner = self.inner.read();
        let mut found: Vec<RegistryEntry> = inner
            .capability_index
            .get(capability)
            .map(|providers| {
                providers
                    .iter()
                    .filter_map(|(id, version)| {
                        inner
                            .entries
                            .get(id)
                            .and_then(|versions| versions.get(version).cloned())
                    })
                    .collect()
            })
            .unwrap_or_default();
        found.sort_by(|a, b| a.id().cmp(b.id()).then_with(|| a.version().cmp(b.version())));
        found
    }

    pub fn list(&self, filter: &ListFilter) -> Vec<RegistryEntry> {
        let inner = self.inner.read();
        let mut entries: Vec<RegistryEntry> = inner
            .entries
            .values()
            .flat_map(|versions| versions.values().cloned())
            .filter(|entry| {
                filter.status.map(|s| entry.status == s).unwrap_or(true)
                    && filter
                        .id_prefix
                        .as_ref()
                        .map(|p| entry.id().as_str().starts_with(p.as_str()))
                        .unwrap_or(true)
                    && filter
                        .capability
                        .as_ref()
                        .map(|c| entry.definition.provides(c))
                        .unwrap_or(true)
            })
            .collect();
        entries.sort_by(|a, b| a.id().cmp(b.id()).then_with(|| a.version().cmp(b.version())));
        entries
    }

    /// Consistent point-in-time clone of all entries.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.list(&ListFilter::default())
    }

    /// Set a non-active status. Active is managed through `set_active`.
    pub fn set_status(
        &self,
        id: &ModuleId,
        version: &Version,
        status: ModuleStatus,
    ) -> Result<(), RegistryError> {
        if status == ModuleStatus::Active {
            return Err(RegistryError::DirectActiveStatus);
        }
        let from = {
            let mut inner = self.inner.write();
            let entry = inner
                .entries
                .get_mut(id)
                .and_then(|versions| versions.get_mut(version))
                .ok_or_else(|| RegistryError::NotFound {
                    id: id.clone(),
                    version: Some(version.clone()),
                })?;
            let from = entry.status;
            entry.status = status;
            if status == ModuleStatus::Failed {
                entry.stats.failure_count += 1;
            }
            let change = StatusChange {
                id: id.clone(),
                version: version.clone(),
                from,
                to: status,
                at: self.clock.now(),
            };
            inner.status_log.push_back(change);
            while inner.status_log.len() > STATUS_LOG_CAPACITY {
                inner.status_log.pop_front();
            }
            from
        };

        debug!("module {}@{} status {} -> {}", id, version, from, status);
        self.notify(RegistryEvent::StatusChanged {
            id: id.clone(),
            version: version.clone(),
            from,
            to: status,
        });
        Ok(())
    }

    /// Promote a version to active for a tenant, demoting any prior active
    /// version of the same module. Returns the prior version, if any.
    pub fn set_active(
        &self,
        tenant: &TenantId,
        id: &ModuleId,
        version: &Version,
    ) -> Result<Option<Version>, RegistryError> {
        let (prior, events) = {
            let mut inner = self.inner.write();
            if inner
                .entries
                .get(id)
                .map(|versions| !versions.contains_key(version))
                .unwrap_or(true)
            {
                return Err(RegistryError::NotFound {
                    id: id.clone(),
                    version: Some(version.clone()),
                });
            }

            let prior = inner
                .active_by_tenant
                .entry(tenant.clone())
                .or_default()
                .insert(id.clone(), version.clone());

            let mut events = Vec::new();
            let now = self.clock.now();

            if let Some(prior_version) = prior.as_ref().filter(|p| *p != version) {
                // Demote the prior version unless another tenant still runs it.
                let still_used = inner
                    .active_by_tenant
                    .values()
                    .any(|mods| mods.get(id) == Some(prior_version));
                if !still_used {
                    if let Some(entry) = inner
                        .entries
                        .get_mut(id)
                        .and_then(|versions| versions.get_mut(prior_version))
                    {
                        let from = entry.status;
                        entry.status = ModuleStatus::Inactive;
                        events.push(RegistryEvent::StatusChanged {
                            id: id.clone(),
                            version: prior_version.clone(),
                            from,
                            to: ModuleStatus::Inactive,
                        });
                    }
                }
            }

            if let Some(entry) = inner
                .entries
                .get_mut(id)
                .and_then(|versions| versions.get_mut(version))
            {
                let from = entry.status;
                entry.status = ModuleStatus::Active;
                entry.last_activated_at = Some(now);
                entry.stats.activation_count += 1;
                events.push(RegistryEvent::StatusChanged {
                    id: id.clone(),
                    version: version.clone(),
                    from,
                    to: ModuleStatus::Active,
                });
            }

            (prior, events)
        };

        info!("module {}@{} active for tenant {}", id, version, tenant);
        for event in events {
            self.notify(event);
        }
        Ok(prior.filter(|p| p != version))
    }

    /// Drop the active pointer for a tenant. The entry becomes Inactive
    /// when no other tenant runs that version.
    pub fn clear_active(&self, tenant: &TenantId, id: &ModuleId) -> Option<Version> {
        let (cleared, event) = {
            let mut inner = self.inner.write();
            let cleared = inner
                .active_by_tenant
                .get_mut(tenant)
                .and_then(|mods| mods.remove(id));

            let mut event = None;
            if let Some(version) = cleared.as_ref() {
                let still_used = inner
                    .active_by_tenant
                    .values()
                    .any(|mods| mods.get(id) == Some(version));
                if !still_used {
                    if let Some(entry) = inner
                        .entries
                        .get_mut(id)
                        .and_then(|versions| versions.get_mut(version))
                    {
                        let from = entry.status;
                        entry.status = ModuleStatus::Inactive;
                        event = Some(RegistryEvent::StatusChanged {
                            id: id.clone(),
                            version: version.clone(),
                            from,
                            to: ModuleStatus::Inactive,
                        });
                    }
                }
            }
            (cleared, event)
        };

        if let Some(event) = event {
            self.notify(event);
        }
        cleared
    }

    pub fn active_version(&self, tenant: &TenantId, id: &ModuleId) -> Option<Version> {
        self.inner
            .read()
            .active_by_tenant
            .get(tenant)
            .and_then(|mods| mods.get(id).cloned())
    }

    /// All modules active in a tenant scope.
    pub fn tenant_active_modules(&self, tenant: &TenantId) -> Vec<(ModuleId, Version)> {
        self.inner
            .read()
            .active_by_tenant
            .get(tenant)
            .map(|mods| {
                let mut list: Vec<(ModuleId, Version)> =
                    mods.iter().map(|(id, v)| (id.clone(), v.clone())).collect();
                list.sort();
                list
            })
            .unwrap_or_default()
    }

    /// Recorded status transitions, oldest first.
    pub fn history(&self) -> Vec<StatusChange> {
        self.inner.read().status_log.iter().cloned().collect()
    }
}
