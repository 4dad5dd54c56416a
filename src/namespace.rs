// Hierarchical, access-controlled configuration namespaces.
//
// Each (module, tenant) scope owns a tree rooted at "/". Nodes carry
// access control, inheritance and isolation settings; configuration lives
// in a copy-on-write store per node. Paths are unique within the global
// path index (scoped by tenant and module, mirroring the persisted
// layout namespaces/{tenant}/{module}{path}).
//
// Writer mutations serialize per namespace; reads are wait-free snapshots.

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::access_control::{AccessControl, AccessDecision, NamespaceOp, Principal};
use crate::audit::{AuditEntryBuilder, AuditTrail, REDACTED};
use crate::config_store::{
    is_sensitive_key, strip_markup, ConfigError, ConfigStore, IsolationConfig, IsolationLevel,
    ResourceLimits,
};
use crate::error::ErrorKind;
use crate::module_definition::ConfigSchema;
use crate::module_metadata::{ModuleId, ScopeKey, TenantId};
use crate::ports::{Clock, CryptoProvider, IdentityProvider, StorageAdapter};

/// Unique identifier of a namespace node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId(Uuid);

impl NamespaceId {
    pub fn new() -> Self {
        NamespaceId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NamespaceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub locked: bool,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritanceStrategy {
    /// Object values from all matching sources are deep-merged
    Merge,
    /// First matching source wins
    Override,
    /// Array values from all matching sources are concatenated
    Additive,
    /// Only sources whose key filters explicitly match are consulted
    Strict,
}

/// One inheritance source, visited in descending priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InheritanceSource {
    pub namespace: NamespaceId,
    pub priority: i32,
    /// Dotted-key prefixes this source applies to; empty = all keys
    #[serde(default)]
    pub key_filters: Vec<String>,
}

impl InheritanceSource {
    fn applies_to(&self, key: &str, strategy: InheritanceStrategy) -> bool {
        if self.key_filters.is_empty() {
            // Strict inheritance requires an explicit filter match.
            return strategy != InheritanceStrategy::Strict;
        }
        self.key_filters
            .iter()
            .any(|f| key == f || key.starts_with(&format!("{}.", f)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InheritanceConfig {
    pub enabled: bool,
    pub strategy: InheritanceStrategy,
    #[serde(default)]
    pub sources: Vec<InheritanceSource>,
    /// Fall through to the parent namespace when sources miss
    pub cascading: bool,
}

impl Default for InheritanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: InheritanceStrategy::Override,
            sources: Vec::new(),
            cascading: false,
        }
    }
}

/// A namespace tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceNode {
    pub id: NamespaceId,
    /// Slash-delimited path, "/" for the scope root
    pub path: String,
    pub parent: Option<NamespaceId>,
    pub children: HashSet<NamespaceId>,
    /// Root = 0
    pub level: u32,
    pub module: ModuleId,
    pub tenant: TenantId,
    pub access: AccessControl,
    pub inheritance: InheritanceConfig,
    pub isolation: IsolationConfig,
    pub status: NamespaceStatus,
    pub metadata: NamespaceMetadata,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NamespaceError {
    #[error("namespace not found")]
    NotFound,

    #[error("namespace path '{0}' already exists")]
    PathConflict(String),

    #[error("alias '{0}' already exists")]
    AliasConflict(String),

    #[error("namespace is locked")]
    Locked,

    #[error("namespace has children and cannot be deleted")]
    HasChildren,

    #[error("access denied for {op}: {reason}")]
    AccessDenied { op: NamespaceOp, reason: String },

    #[error("invalid namespace name '{0}'")]
    InvalidName(String),

    #[error("export checksum mismatch")]
    ChecksumMismatch,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl NamespaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NamespaceError::NotFound => ErrorKind::NamespaceNotFound,
            NamespaceError::PathConflict(_) | NamespaceError::AliasConflict(_) => {
                ErrorKind::NamespacePathConflict
            }
            NamespaceError::Locked => ErrorKind::NamespaceLocked,
            NamespaceError::HasChildren | NamespaceError::InvalidName(_) => ErrorKind::Validation,
            NamespaceError::AccessDenied { .. } => ErrorKind::AccessDenied,
            NamespaceError::ChecksumMismatch => ErrorKind::Validation,
            NamespaceError::Storage(_) => ErrorKind::Critical,
            NamespaceError::Config(e) => e.kind(),
        }
    }
}

/// Options for namespace creation and update.
#[derive(Debug, Clone, Default)]
pub struct NamespaceOptions {
    pub access: Option<AccessControl>,
    pub inheritance: Option<InheritanceConfig>,
    pub isolation: Option<IsolationConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct NamespaceUpdate {
    pub access: Option<AccessControl>,
    pub inheritance: Option<InheritanceConfig>,
    pub isolation: Option<IsolationConfig>,
    pub status: Option<NamespaceStatus>,
    pub locked: Option<bool>,
}

/// Snapshot of a namespace's usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceMetrics {
    pub id: NamespaceId,
    pub path: String,
    pub key_count: usize,
    pub storage_bytes: u64,
    pub child_count: usize,
    pub reads: u64,
    pub writes: u64,
}

/// Exported namespace configuration with an HMAC checksum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceExport {
    pub path: String,
    pub module: ModuleId,
    pub tenant: TenantId,
    pub exported_at: DateTime<Utc>,
    /// The stored tree, exactly as persisted
    pub config: Value,
    /// Hex-encoded HMAC over the canonical JSON of `config`
    pub checksum: String,
}

/// Result of an import; partial success is explicit.
#[derive(Debug, Clone)]
pub struct ImportReport {
    pub success: bool,
    pub imported: usize,
    /// Keys skipped with the reason, e.g. a resource limit
    pub skipped: Vec<(String, String)>,
    pub errors: Vec<String>,
}

struct NamespaceRecord {
    node: RwLock<NamespaceNode>,
    store: ConfigStore,
    schema: Option<ConfigSchema>,
    /// Serializes writers for this namespace
    write_lock: Mutex<()>,
}

/// Hierarchical configuration manager.
pub struct NamespaceManager {
    records: RwLock<HashMap<NamespaceId, Arc<NamespaceRecord>>>,
    /// "namespaces/{tenant}/{module}{path}" -> id
    by_path: RwLock<HashMap<String, NamespaceId>>,
    aliases: RwLock<HashMap<String, NamespaceId>>,
    roots: RwLock<HashMap<(ModuleId, TenantId), NamespaceId>>,
    audit: AuditTrail,
    crypto: Arc<dyn CryptoProvider>,
    clock: Arc<dyn Clock>,
}

fn path_index_key(module: &ModuleId, tenant: &TenantId, path: &str) -> String {
    format!("namespaces/{}/{}{}", tenant, module, path)
}

/// Stored top-level prefix applied by basic and stronger isolation.
fn isolation_prefix(module: &ModuleId) -> String {
    format!("m:{}", module.as_str().replace('.', "-"))
}

fn stored_key(level: IsolationLevel, module: &ModuleId, key: &str) -> String {
    match level {
        IsolationLevel::None => key.to_string(),
        _ => format!("{}.{}", isolation_prefix(module), key),
    }
}

const ENCRYPTED_MARKER: &str = "$encrypted";

impl NamespaceManager {
    pub fn new(crypto: Arc<dyn CryptoProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            by_path: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            roots: RwLock::new(HashMap::new()),
            audit: AuditTrail::new(4096, Arc::clone(&clock)),
            crypto,
            clock,
        }
    }

    pub fn audit_trail(&self) -> &AuditTrail {
        &self.audit
    }

    /// Root namespace for a scope, created on first touch: path "/",
    /// level 0, inheritance disabled, basic isolation, sandbox enabled.
    pub fn ensure_root(&self, scope: &ScopeKey, schema: Option<ConfigSchema>) -> NamespaceId {
        let key = (scope.module.clone(), scope.tenant.clone());
        if let Some(id) = self.roots.read().get(&key) {
            return *id;
        }

        let id = NamespaceId::new();
        let now = self.clock.now();
        let node = NamespaceNode {
            id,
            path: "/".to_string(),
            parent: None,
            children: HashSet::new(),
            level: 0,
            module: scope.module.clone(),
            tenant: scope.tenant.clone(),
            access: AccessControl::permissive(),
            inheritance: InheritanceConfig::default(),
            isolation: IsolationConfig::default(),
            status: NamespaceStatus::Active,
            metadata: NamespaceMetadata {
                created_at: now,
                updated_at: now,
                locked: false,
                version: 1,
            },
        };

        {
            let mut roots = self.roots.write();
            // Double-checked: another thread may have created it meanwhile.
            if let Some(existing) = roots.get(&key) {
                return *existing;
            }
            roots.insert(key, id);
        }
        self.records.write().insert(
            id,
            Arc::new(NamespaceRecord {
                node: RwLock::new(node),
                store: ConfigStore::new(),
                schema,
                write_lock: Mutex::new(()),
            }),
        );
        self.by_path
            .write()
            .insert(path_index_key(&scope.module, &scope.tenant, "/"), id);
        info!("created root namespace for {}", scope);

        self.audit.record(
            AuditEntryBuilder::new("namespace.create_root")
                .namespace(*id.as_uuid())
                .details(json!({"scope": scope.to_string()})),
        );
        id
    }

    fn record(&self, id: &NamespaceId) -> Result<Arc<NamespaceRecord>, NamespaceError> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or(NamespaceError::NotFound)
    }

    fn check(
        &self,
        record: &NamespaceRecord,
        op: NamespaceOp,
        principal: Option<&Principal>,
    ) -> Result<(), NamespaceError> {
        let node = record.node.read();
        let ctx = access_ctx(&node);
        let decision = node.access.evaluate(principal, op, &ctx);
        if !decision.allowed {
            self.audit.record(
                AuditEntryBuilder::new("access.denied")
                    .namespace(*node.id.as_uuid())
                    .principal(principal.map(|p| p.id.as_str()))
                    .failed(decision.reason.clone()),
            );
            return Err(NamespaceError::AccessDenied {
                op,
                reason: decision.reason,
            });
        }
        Ok(())
    }

    /// Create a child namespace under `parent`.
    pub fn create(
        &self,
        parent: &NamespaceId,
        name: &str,
        options: NamespaceOptions,
        principal: Option<&Principal>,
    ) -> Result<NamespaceId, NamespaceError> {
        if name.is_empty() || name.contains('/') || name.contains('.') {
            return Err(NamespaceError::InvalidName(name.to_string()));
        }

        let parent_record = self.record(parent)?;
        self.check(&parent_record, NamespaceOp::Admin, principal)?;

        let (path, module, tenant, level) = {
            let parent_node = parent_record.node.read();
            if parent_node.metadata.locked {
                return Err(NamespaceError::Locked);
            }
            let path = if parent_node.path == "/" {
                format!("/{}", name)
            } else {
                format!("{}/{}", parent_node.path, name)
            };
            (
                path,
                parent_node.module.clone(),
                parent_node.tenant.clone(),
                parent_node.level + 1,
            )
        };

        let index_key = path_index_key(&module, &tenant, &path);
        let id = NamespaceId::new();
        let now = self.clock.now();

        // Reserve the path first; the check and insert are atomic under
        // one lock and no other lock is held meanwhile.
        {
            let mut by_path = self.by_path.write();
            if by_path.contains_key(&index_key) {
                return Err(NamespaceError::PathConflict(path));
            }
            by_path.insert(index_key, id);
        }

        let node = NamespaceNode {
            id,
            path: path.clone(),
            parent: Some(*parent),
            children: HashSet::new(),
            level,
            module,
            tenant,
            access: options.access.unwrap_or_else(AccessControl::permissive),
            inheritance: options.inheritance.unwrap_or_default(),
            isolation: options.isolation.unwrap_or_default(),
            status: NamespaceStatus::Active,
            metadata: NamespaceMetadata {
                created_at: now,
                updated_at: now,
                locked: false,
                version: 1,
            },
        };
        self.records.write().insert(
            id,
            Arc::new(NamespaceRecord {
                node: RwLock::new(node),
                store: ConfigStore::new(),
                schema: None,
                write_lock: Mutex::new(()),
            }),
        );

        {
            let mut parent_node = parent_record.node.write();
            parent_node.children.insert(id);
            parent_node.metadata.updated_at = now;
        }

        debug!("created namespace {} ({})", path, id);
        self.audit.record(
            AuditEntryBuilder::new("namespace.create")
                .namespace(*id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"path": path})),
        );
        Ok(id)
    }

    /// Delete a namespace. Locked nodes and nodes with children refuse.
    pub fn delete(
        &self,
        id: &NamespaceId,
        principal: Option<&Principal>,
    ) -> Result<(), NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Delete, principal)?;

        let (path, module, tenant, parent) = {
            let node = record.node.read();
            if node.metadata.locked {
                return Err(NamespaceError::Locked);
            }
            if !node.children.is_empty() {
                return Err(NamespaceError::HasChildren);
            }
            (
                node.path.clone(),
                node.module.clone(),
                node.tenant.clone(),
                node.parent,
            )
        };

        self.records.write().remove(id);
        self.by_path
            .write()
            .remove(&path_index_key(&module, &tenant, &path));
        self.aliases.write().retain(|_, target| target != id);
        if path == "/" {
            self.roots.write().remove(&(module, tenant));
        }
        if let Some(parent_id) = parent {
            if let Ok(parent_record) = self.record(&parent_id) {
                let mut parent_node = parent_record.node.write();
                parent_node.children.remove(id);
                parent_node.metadata.updated_at = self.clock.now();
            }
        }

        self.audit.record(
            AuditEntryBuilder::new("namespace.delete")
                .namespace(*id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"path": path})),
        );
        Ok(())
    }

    /// Tear down the whole tree of a scope (module uninstall). Bypasses
    /// per-node access control and lock flags; audited as a system op.
    pub fn teardown_scope(&self, scope: &ScopeKey) -> usize {
        let ids: Vec<NamespaceId> = {
            let records = self.records.read();
            records
                .iter()
                .filter(|(_, record)| {
                    let node = record.node.read();
                    node.module == scope.module && node.tenant == scope.tenant
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let mut removed = 0;
        for id in &ids {
            let record = self.records.write().remove(id);
            if let Some(record) = record {
                let node = record.node.read();
                self.by_path
                    .write()
                    .remove(&path_index_key(&node.module, &node.tenant, &node.path));
                removed += 1;
            }
            self.aliases.write().retain(|_, target| target != id);
        }
        self.roots
            .write()
            .remove(&(scope.module.clone(), scope.tenant.clone()));

        if removed > 0 {
            self.audit.record(
                AuditEntryBuilder::new("namespace.teardown")
                    .details(json!({"scope": scope.to_string(), "removed": removed})),
            );
        }
        removed
    }

    pub fn get(&self, id: &NamespaceId) -> Result<NamespaceNode, NamespaceError> {
        Ok(self.record(id)?.node.read().clone())
    }

    /// All namespaces of a scope, sorted by path.
    pub fn list(&self, scope: &ScopeKey) -> Vec<NamespaceNode> {
        let records = self.records.read();
        let mut nodes: Vec<NamespaceNode> = records
            .values()
            .map(|record| record.node.read().clone())
            .filter(|node| node.module == scope.module && node.tenant == scope.tenant)
            .collect();
        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        nodes
    }

    /// Apply an update. Locked namespaces only accept an unlock.
    pub fn update(
        &self,
        id: &NamespaceId,
        update: NamespaceUpdate,
        principal: Option<&Principal>,
    ) -> Result<(), NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Admin, principal)?;

        let mut node = record.node.write();
        if node.metadata.locked && update.locked != Some(false) {
            return Err(NamespaceError::Locked);
        }
        if let Some(access) = update.access {
            node.access = access;
        }
        if let Some(inheritance) = update.inheritance {
            node.inheritance = inheritance;
        }
        if let Some(isolation) = update.isolation {
            node.isolation = isolation;
        }
        if let Some(status) = update.status {
            node.status = status;
        }
        if let Some(locked) = update.locked {
            node.metadata.locked = locked;
        }
        node.metadata.version += 1;
        node.metadata.updated_at = self.clock.now();
        let ns_uuid = *node.id.as_uuid();
        drop(node);

        self.audit.record(
            AuditEntryBuilder::new("namespace.update")
                .namespace(ns_uuid)
                .principal(principal.map(|p| p.id.as_str())),
        );
        Ok(())
    }

    /// Resolve a scope-relative path (or alias) to a namespace id.
    pub fn resolve_path(&self, scope: &ScopeKey, path: &str) -> Option<NamespaceId> {
        if let Some(id) = self
            .by_path
            .read()
            .get(&path_index_key(&scope.module, &scope.tenant, path))
        {
            return Some(*id);
        }
        self.aliases.read().get(path).copied()
    }

    pub fn create_alias(
        &self,
        alias: &str,
        id: &NamespaceId,
        principal: Option<&Principal>,
    ) -> Result<(), NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Admin, principal)?;

        let mut aliases = self.aliases.write();
        if aliases.contains_key(alias) {
            return Err(NamespaceError::AliasConflict(alias.to_string()));
        }
        aliases.insert(alias.to_string(), *id);
        drop(aliases);

        self.audit.record(
            AuditEntryBuilder::new("namespace.alias_create")
                .namespace(*id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"alias": alias})),
        );
        Ok(())
    }

    pub fn remove_alias(&self, alias: &str, principal: Option<&Principal>) -> bool {
        let removed = self.aliases.write().remove(alias);
        if let Some(id) = removed {
            self.audit.record(
                AuditEntryBuilder::new("namespace.alias_remove")
                    .namespace(*id.as_uuid())
                    .principal(principal.map(|p| p.id.as_str()))
                    .details(json!({"alias": alias})),
            );
            true
        } else {
            false
        }
    }

    /// Resolve a caller credential through the identity provider and run
    /// the access check as that principal. An unknown credential is an
    /// access denial, not an error.
    pub fn check_access_with_credential(
        &self,
        identity: &dyn IdentityProvider,
        credential: &str,
        id: &NamespaceId,
        op: NamespaceOp,
    ) -> Result<AccessDecision, NamespaceError> {
        match identity.resolve_principal(credential) {
            Ok(principal) => self.check_access(id, op, Some(&principal)),
            Err(e) => {
                self.audit.record(
                    AuditEntryBuilder::new("access.check")
                        .namespace(*id.as_uuid())
                        .failed(format!("credential rejected: {}", e)),
                );
                Ok(AccessDecision {
                    allowed: false,
                    reason: format!("credential rejected: {}", e),
                })
            }
        }
    }

    /// Access check as its own audited operation.
    pub fn check_access(
        &self,
        id: &NamespaceId,
        op: NamespaceOp,
        principal: Option<&Principal>,
    ) -> Result<AccessDecision, NamespaceError> {
        let record = self.record(id)?;
        let node = record.node.read();
        let ctx = access_ctx(&node);
        let decision = node.access.evaluate(principal, op, &ctx);
        self.audit.record(
            AuditEntryBuilder::new("access.check")
                .namespace(*node.id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"op": op.as_str(), "allowed": decision.allowed})),
        );
        Ok(decision)
    }

    // ========================================================================
    // Configuration operations
    // ========================================================================

    /// Read a config value, following inheritance when the key is absent
    /// locally.
    pub fn get_config(
        &self,
        id: &NamespaceId,
        key: &str,
        principal: Option<&Principal>,
    ) -> Result<Option<Value>, NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Read, principal)?;

        let value = self.get_config_resolved(&record, key)?;

        self.audit.record(
            AuditEntryBuilder::new("config.read")
                .namespace(*record.node.read().id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"key": key, "found": value.is_some()})),
        );
        Ok(value)
    }

    /// Read with a fallback default.
    pub fn get_config_or(
        &self,
        id: &NamespaceId,
        key: &str,
        default: Value,
        principal: Option<&Principal>,
    ) -> Result<Value, NamespaceError> {
        Ok(self.get_config(id, key, principal)?.unwrap_or(default))
    }

    fn get_config_resolved(
        &self,
        record: &NamespaceRecord,
        key: &str,
    ) -> Result<Option<Value>, NamespaceError> {
        if let Some(value) = self.get_config_local(record, key)? {
            return Ok(Some(value));
        }

        let (inheritance, parent) = {
            let node = record.node.read();
            (node.inheritance.clone(), node.parent)
        };

        if inheritance.enabled {
            if let Some(value) = self.get_inherited(&inheritance, key)? {
                return Ok(Some(value));
            }
            if inheritance.cascading {
                if let Some(parent_id) = parent {
                    let parent_record = self.record(&parent_id)?;
                    return self.get_config_resolved(&parent_record, key);
                }
            }
        }
        Ok(None)
    }

    fn get_inherited(
        &self,
        inheritance: &InheritanceConfig,
        key: &str,
    ) -> Result<Option<Value>, NamespaceError> {
        let mut sources = inheritance.sources.clone();
        sources.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut hits: Vec<Value> = Vec::new();
        for source in sources
            .iter()
            .filter(|s| s.applies_to(key, inheritance.strategy))
        {
            let record = match self.record(&source.namespace) {
                Ok(record) => record,
                Err(_) => continue,
            };
            if let Some(value) = self.get_config_local(&record, key)? {
                match inheritance.strategy {
                    InheritanceStrategy::Override | InheritanceStrategy::Strict => {
                        return Ok(Some(value));
                    }
                    InheritanceStrategy::Merge | InheritanceStrategy::Additive => {
                        hits.push(value);
                    }
                }
            }
        }

        if hits.is_empty() {
            return Ok(None);
        }
        match inheritance.strategy {
            InheritanceStrategy::Merge => {
                // Lowest priority first so higher priority wins on clashes.
                let mut merged = Value::Object(serde_json::Map::new());
                for value in hits.iter().rev() {
                    deep_merge(&mut merged, value);
                }
                if merged.as_object().map(|m| m.is_empty()).unwrap_or(false) {
                    // Scalars cannot merge; highest priority hit wins.
                    return Ok(hits.into_iter().next());
                }
                Ok(Some(merged))
            }
            InheritanceStrategy::Additive => {
                let mut combined = Vec::new();
                let mut all_arrays = true;
                for value in &hits {
                    match value.as_array() {
                        Some(items) => combined.extend(items.iter().cloned()),
                        None => all_arrays = false,
                    }
                }
                if all_arrays {
                    Ok(Some(Value::Array(combined)))
                } else {
                    Ok(hits.into_iter().next())
                }
            }
            _ => Ok(hits.into_iter().next()),
        }
    }

    /// Local lookup applying the namespace's isolation read path.
    fn get_config_local(
        &self,
        record: &NamespaceRecord,
        key: &str,
    ) -> Result<Option<Value>, NamespaceError> {
        let (level, module) = {
            let node = record.node.read();
            (node.isolation.level, node.module.clone())
        };
        let stored = record.store.get(&stored_key(level, &module, key));
        match stored {
            Some(value) => Ok(Some(self.decode_value(level, key, value)?)),
            None => Ok(None),
        }
    }

    fn decode_value(
        &self,
        level: IsolationLevel,
        key: &str,
        value: Value,
    ) -> Result<Value, NamespaceError> {
        if level == IsolationLevel::Paranoid && is_sensitive_key(key) {
            if let Some(cipher_hex) = value
                .as_object()
                .and_then(|m| m.get(ENCRYPTED_MARKER))
                .and_then(|v| v.as_str())
            {
                let ciphertext = hex::decode(cipher_hex)
                    .map_err(|e| ConfigError::Crypto(e.to_string()))?;
                let plaintext = self
                    .crypto
                    .decrypt(&ciphertext)
                    .map_err(|e| ConfigError::Crypto(e.to_string()))?;
                let value = serde_json::from_slice(&plaintext)
                    .map_err(|e| ConfigError::Crypto(e.to_string()))?;
                return Ok(value);
            }
        }
        Ok(value)
    }

    /// Write a config value under the namespace's isolation policy.
    pub fn set_config(
        &self,
        id: &NamespaceId,
        key: &str,
        value: Value,
        principal: Option<&Principal>,
    ) -> Result<(), NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Write, principal)?;

        let (level, module, locked, limits) = {
            let node = record.node.read();
            (
                node.isolation.level,
                node.module.clone(),
                node.metadata.locked,
                effective_limits(&node),
            )
        };
        if locked {
            return Err(NamespaceError::Locked);
        }

        let sensitive = is_sensitive_key(key);
        let stored_value = self.encode_value(level, key, value.clone())?;

        let _writer = record.write_lock.lock();
        record.store.set(
            &stored_key(level, &module, key),
            stored_value,
            &limits,
            record.schema.as_ref(),
        )?;
        drop(_writer);

        self.audit.record(
            AuditEntryBuilder::new("config.write")
                .namespace(*record.node.read().id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({
                    "key": key,
                    "value": if sensitive { json!(REDACTED) } else { value },
                })),
        );
        Ok(())
    }

    fn encode_value(
        &self,
        level: IsolationLevel,
        key: &str,
        value: Value,
    ) -> Result<Value, NamespaceError> {
        let value = match level {
            IsolationLevel::Strict | IsolationLevel::Paranoid => sanitize_value(value),
            _ => value,
        };
        if level == IsolationLevel::Paranoid && is_sensitive_key(key) {
            let plaintext =
                serde_json::to_vec(&value).map_err(|e| ConfigError::Crypto(e.to_string()))?;
            let ciphertext = self
                .crypto
                .encrypt(&plaintext)
                .map_err(|e| ConfigError::Crypto(e.to_string()))?;
            return Ok(json!({ ENCRYPTED_MARKER: hex::encode(ciphertext) }));
        }
        Ok(value)
    }

    /// Delete a leaf config key.
    pub fn delete_config(
        &self,
        id: &NamespaceId,
        key: &str,
        principal: Option<&Principal>,
    ) -> Result<bool, NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Write, principal)?;

        let (level, module, locked) = {
            let node = record.node.read();
            (node.isolation.level, node.module.clone(), node.metadata.locked)
        };
        if locked {
            return Err(NamespaceError::Locked);
        }

        let _writer = record.write_lock.lock();
        let stored = stored_key(level, &module, key);
        // Encrypted leaves are stored as marker objects but are logically
        // leaves; remove the whole marker entry.
        let removed = if level == IsolationLevel::Paranoid
            && is_sensitive_key(key)
            && record
                .store
                .get(&stored)
                .as_ref()
                .and_then(|v| v.get(ENCRYPTED_MARKER))
                .is_some()
        {
            record.store.remove_subtree(&stored)
        } else {
            record.store.delete(&stored)?
        };
        drop(_writer);

        self.audit.record(
            AuditEntryBuilder::new("config.delete")
                .namespace(*record.node.read().id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"key": key, "removed": removed})),
        );
        Ok(removed)
    }

    // ========================================================================
    // Export / import
    // ========================================================================

    /// Export the stored tree with an HMAC checksum over its canonical
    /// JSON encoding.
    pub fn export(
        &self,
        id: &NamespaceId,
        principal: Option<&Principal>,
    ) -> Result<NamespaceExport, NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Export, principal)?;

        let (path, module, tenant) = {
            let node = record.node.read();
            (node.path.clone(), node.module.clone(), node.tenant.clone())
        };
        let config = (*record.store.snapshot()).clone();
        let canonical =
            serde_json::to_vec(&config).map_err(|e| ConfigError::Crypto(e.to_string()))?;
        let checksum = hex::encode(self.crypto.hmac(&canonical));

        self.audit.record(
            AuditEntryBuilder::new("namespace.export")
                .namespace(*id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"path": path, "bytes": canonical.len()})),
        );

        Ok(NamespaceExport {
            path,
            module,
            tenant,
            exported_at: self.clock.now(),
            config,
            checksum,
        })
    }

    /// Import an export. The checksum must verify; individual keys that
    /// breach resource limits are skipped and reported.
    pub fn import(
        &self,
        id: &NamespaceId,
        export: &NamespaceExport,
        principal: Option<&Principal>,
    ) -> Result<ImportReport, NamespaceError> {
        let record = self.record(id)?;
        self.check(&record, NamespaceOp::Import, principal)?;

        let canonical =
            serde_json::to_vec(&export.config).map_err(|e| ConfigError::Crypto(e.to_string()))?;
        let expected = hex::encode(self.crypto.hmac(&canonical));
        if expected != export.checksum {
            self.audit.record(
                AuditEntryBuilder::new("namespace.import")
                    .namespace(*id.as_uuid())
                    .principal(principal.map(|p| p.id.as_str()))
                    .failed("checksum mismatch"),
            );
            return Err(NamespaceError::ChecksumMismatch);
        }

        let limits = {
            let node = record.node.read();
            if node.metadata.locked {
                return Err(NamespaceError::Locked);
            }
            effective_limits(&node)
        };

        // Imported values are already in stored form; write them raw,
        // sorted for a deterministic outcome.
        let mut flat: Vec<(String, Value)> = flatten_value(&export.config);
        flat.sort_by(|a, b| a.0.cmp(&b.0));

        let mut imported = 0;
        let mut skipped = Vec::new();
        let _writer = record.write_lock.lock();
        for (key, value) in flat {
            match record.store.set(&key, value, &limits, None) {
                Ok(()) => imported += 1,
                Err(e) => skipped.push((key, e.to_string())),
            }
        }
        drop(_writer);

        self.audit.record(
            AuditEntryBuilder::new("namespace.import")
                .namespace(*id.as_uuid())
                .principal(principal.map(|p| p.id.as_str()))
                .details(json!({"imported": imported, "skipped": skipped.len()})),
        );

        Ok(ImportReport {
            success: skipped.is_empty(),
            imported,
            skipped,
            errors: Vec::new(),
        })
    }

    /// All scopes that have a root namespace for a module.
    pub fn scopes_for_module(&self, module: &ModuleId) -> Vec<ScopeKey> {
        self.roots
            .read()
            .keys()
            .filter(|(m, _)| m == module)
            .map(|(m, t)| ScopeKey::new(m.clone(), t.clone()))
            .collect()
    }

    /// Usage counters for a namespace.
    pub fn metrics(&self, id: &NamespaceId) -> Result<NamespaceMetrics, NamespaceError> {
        let record = self.record(id)?;
        let node = record.node.read();
        Ok(NamespaceMetrics {
            id: *id,
            path: node.path.clone(),
            key_count: record.store.key_count(),
            storage_bytes: record.store.storage_bytes(),
            child_count: node.children.len(),
            reads: record.store.read_count(),
            writes: record.store.write_count(),
        })
    }

    /// Flush every namespace definition and config blob through the
    /// storage adapter, under `namespaces/{tenant}/{module}{path}` and
    /// `configs/{namespaceId}`. Returns the number of namespaces written.
    pub async fn persist(&self, storage: &dyn StorageAdapter) -> Result<usize, NamespaceError> {
        let records: Vec<Arc<NamespaceRecord>> =
            self.records.read().values().cloned().collect();

        let mut written = 0;
        for record in records {
            let (node_bytes, path_key, id) = {
                let node = record.node.read();
                let bytes = serde_json::to_vec(&*node)
                    .map_err(|e| NamespaceError::Storage(e.to_string()))?;
                (
                    bytes,
                    path_index_key(&node.module, &node.tenant, &node.path),
                    node.id,
                )
            };
            storage
                .put(&path_key, node_bytes)
                .await
                .map_err(|e| NamespaceError::Storage(e.to_string()))?;

            let config_bytes = serde_json::to_vec(record.store.snapshot().as_ref())
                .map_err(|e| NamespaceError::Storage(e.to_string()))?;
            storage
                .put(&format!("configs/{}", id), config_bytes)
                .await
                .map_err(|e| NamespaceError::Storage(e.to_string()))?;
            written += 1;
        }
        Ok(written)
    }

    /// Audit entries touching a namespace within a time range.
    pub fn audit_entries(
        &self,
        id: &NamespaceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<crate::audit::AuditEntry> {
        self.audit.entries_for(*id.as_uuid(), from, to)
    }
}

fn access_ctx(node: &NamespaceNode) -> HashMap<String, Value> {
    let mut ctx = HashMap::new();
    ctx.insert("module".to_string(), json!(node.module.as_str()));
    ctx.insert("tenant".to_string(), json!(node.tenant.as_str()));
    ctx.insert("path".to_string(), json!(node.path));
    ctx
}

fn effective_limits(node: &NamespaceNode) -> ResourceLimits {
    if node.isolation.sandbox.enabled {
        node.isolation.sandbox.resource_limits.clone()
    } else {
        ResourceLimits::default()
    }
}

/// Strip markup from every string in the value tree.
fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(strip_markup(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay) => {
            *base_slot = overlay.clone();
        }
    }
}

fn flatten_value(root: &Value) -> Vec<(String, Value)> {
    fn walk(value: &Value, prefix: String, out: &mut Vec<(String, Value)>) {
        match value.as_object() {
            Some(map) if !map.is_empty() => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(child, path, out);
                }
            }
            _ => {
                if !prefix.is_empty() {
                    out.push((prefix, value.clone()));
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(root, String::new(), &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::{Permission, PrincipalKind};
    use crate::config_store::SandboxConfig;
    use crate::ports::{DefaultCryptoProvider, SystemClock};

    fn manager() -> NamespaceManager {
        NamespaceManager::new(
            Arc::new(DefaultCryptoProvider::from_passphrase("test")),
            Arc::new(SystemClock),
        )
    }

    fn scope() -> ScopeKey {
        ScopeKey::new("billing", "t1")
    }

    #[test]
    fn root_is_created_once_per_scope() {
        let manager = manager();
        let a = manager.ensure_root(&scope(), None);
        let b = manager.ensure_root(&scope(), None);
        assert_eq!(a, b);

        let node = manager.get(&a).unwrap();
        assert_eq!(node.path, "/");
        assert_eq!(node.level, 0);
        assert!(!node.inheritance.enabled);
        assert_eq!(node.isolation.level, IsolationLevel::Basic);
        assert!(node.isolation.sandbox.enabled);
    }

    #[test]
    fn paths_are_unique_within_scope() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager
            .create(&root, "cache", NamespaceOptions::default(), None)
            .unwrap();
        let err = manager
            .create(&root, "cache", NamespaceOptions::default(), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NamespacePathConflict);

        // Same name under a different tenant scope is fine.
        let other = manager.ensure_root(&ScopeKey::new("billing", "t2"), None);
        manager
            .create(&other, "cache", NamespaceOptions::default(), None)
            .unwrap();
    }

    #[test]
    fn nested_paths_and_resolution() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        let cache = manager
            .create(&root, "cache", NamespaceOptions::default(), None)
            .unwrap();
        let hot = manager
            .create(&cache, "hot", NamespaceOptions::default(), None)
            .unwrap();

        let node = manager.get(&hot).unwrap();
        assert_eq!(node.path, "/cache/hot");
        assert_eq!(node.level, 2);
        assert_eq!(manager.resolve_path(&scope(), "/cache/hot"), Some(hot));
        assert_eq!(manager.resolve_path(&scope(), "/nope"), None);

        manager.create_alias("hot-cache", &hot, None).unwrap();
        assert_eq!(manager.resolve_path(&scope(), "hot-cache"), Some(hot));
        assert!(manager.remove_alias("hot-cache", None));
        assert_eq!(manager.resolve_path(&scope(), "hot-cache"), None);
    }

    #[test]
    fn delete_refuses_children_and_locked() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        let cache = manager
            .create(&root, "cache", NamespaceOptions::default(), None)
            .unwrap();

        let err = manager.delete(&root, None).unwrap_err();
        assert_eq!(err, NamespaceError::HasChildren);

        manager
            .update(
                &cache,
                NamespaceUpdate {
                    locked: Some(true),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();
        assert_eq!(manager.delete(&cache, None).unwrap_err(), NamespaceError::Locked);

        // Unlock, then delete works and the root becomes deletable too.
        manager
            .update(
                &cache,
                NamespaceUpdate {
                    locked: Some(false),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();
        manager.delete(&cache, None).unwrap();
        manager.delete(&root, None).unwrap();
        assert!(manager.get(&root).is_err());
    }

    #[test]
    fn locked_blocks_config_mutation() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager
            .update(
                &root,
                NamespaceUpdate {
                    locked: Some(true),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();
        let err = manager
            .set_config(&root, "a", json!(1), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NamespaceLocked);
    }

    #[test]
    fn config_roundtrip_with_basic_isolation_prefix() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);

        manager.set_config(&root, "db.host", json!("localhost"), None).unwrap();
        assert_eq!(
            manager.get_config(&root, "db.host", None).unwrap(),
            Some(json!("localhost"))
        );
        // The caller-facing key is unprefixed; the stored tree carries the
        // module prefix.
        let record = manager.record(&root).unwrap();
        assert!(record.store.get("m:billing.db.host").is_some());
        assert!(record.store.get("db.host").is_none());
    }

    #[test]
    fn delete_config_returns_default_afterwards() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager.set_config(&root, "flag", json!(true), None).unwrap();
        assert!(manager.delete_config(&root, "flag", None).unwrap());
        assert_eq!(
            manager
                .get_config_or(&root, "flag", json!(false), None)
                .unwrap(),
            json!(false)
        );
    }

    #[test]
    fn paranoid_isolation_encrypts_sensitive_values() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager
            .update(
                &root,
                NamespaceUpdate {
                    isolation: Some(IsolationConfig {
                        level: IsolationLevel::Paranoid,
                        sandbox: SandboxConfig::default(),
                    }),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();

        manager
            .set_config(&root, "db.password", json!("s3cr3t"), None)
            .unwrap();

        // Stored value is an encrypted marker, not the plaintext.
        let record = manager.record(&root).unwrap();
        let stored = record.store.get("m:billing.db.password").unwrap();
        assert_ne!(stored, json!("s3cr3t"));
        assert!(stored.get(ENCRYPTED_MARKER).is_some());

        // Reads decrypt transparently.
        assert_eq!(
            manager.get_config(&root, "db.password", None).unwrap(),
            Some(json!("s3cr3t"))
        );

        // The audit entry redacts the value.
        let writes = manager.audit.entries_matching("config.write");
        let entry = writes.last().unwrap();
        assert_eq!(entry.details["value"], json!(REDACTED));
        assert_eq!(entry.details["key"], json!("db.password"));

        // Sensitive deletes work despite the marker object.
        assert!(manager.delete_config(&root, "db.password", None).unwrap());
        assert_eq!(manager.get_config(&root, "db.password", None).unwrap(), None);
    }

    #[test]
    fn strict_isolation_strips_markup() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager
            .update(
                &root,
                NamespaceUpdate {
                    isolation: Some(IsolationConfig {
                        level: IsolationLevel::Strict,
                        sandbox: SandboxConfig::default(),
                    }),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();

        manager
            .set_config(&root, "banner", json!("<b>hello</b>"), None)
            .unwrap();
        assert_eq!(
            manager.get_config(&root, "banner", None).unwrap(),
            Some(json!("hello"))
        );
    }

    #[test]
    fn access_control_denies_unauthorized_writes() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager
            .update(
                &root,
                NamespaceUpdate {
                    access: Some(AccessControl::default().permission(Permission::grant(
                        PrincipalKind::User,
                        "alice",
                        vec![NamespaceOp::Read, NamespaceOp::Write],
                    ))),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();

        let alice = Principal::user("alice");
        let mallory = Principal::user("mallory");
        manager
            .set_config(&root, "a", json!(1), Some(&alice))
            .unwrap();
        let err = manager
            .set_config(&root, "a", json!(2), Some(&mallory))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        // The denied attempt did not mutate state.
        assert_eq!(
            manager.get_config(&root, "a", Some(&alice)).unwrap(),
            Some(json!(1))
        );
    }

    #[test]
    fn credential_based_access_check() {
        use crate::ports::StaticIdentityProvider;

        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager
            .update(
                &root,
                NamespaceUpdate {
                    access: Some(AccessControl::default().permission(Permission::grant(
                        PrincipalKind::User,
                        "alice",
                        vec![NamespaceOp::Read],
                    ))),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();

        let identity = StaticIdentityProvider::new();
        identity.insert("token-abc", Principal::user("alice"));

        let allowed = manager
            .check_access_with_credential(&identity, "token-abc", &root, NamespaceOp::Read)
            .unwrap();
        assert!(allowed.allowed);

        let denied = manager
            .check_access_with_credential(&identity, "token-abc", &root, NamespaceOp::Write)
            .unwrap();
        assert!(!denied.allowed);

        // Unknown credentials are denials, not errors.
        let unknown = manager
            .check_access_with_credential(&identity, "token-zzz", &root, NamespaceOp::Read)
            .unwrap();
        assert!(!unknown.allowed);
    }

    #[test]
    fn inheritance_override_and_cascading() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        let defaults = manager
            .create(&root, "defaults", NamespaceOptions::default(), None)
            .unwrap();
        manager
            .set_config(&defaults, "timeout", json!(30), None)
            .unwrap();
        manager.set_config(&root, "retries", json!(5), None).unwrap();

        let service = manager
            .create(
                &root,
                "service",
                NamespaceOptions {
                    inheritance: Some(InheritanceConfig {
                        enabled: true,
                        strategy: InheritanceStrategy::Override,
                        sources: vec![InheritanceSource {
                            namespace: defaults,
                            priority: 10,
                            key_filters: Vec::new(),
                        }],
                        cascading: true,
                    }),
                    ..NamespaceOptions::default()
                },
                None,
            )
            .unwrap();

        // Local value wins over inherited.
        manager.set_config(&service, "timeout", json!(5), None).unwrap();
        assert_eq!(
            manager.get_config(&service, "timeout", None).unwrap(),
            Some(json!(5))
        );
        manager.delete_config(&service, "timeout", None).unwrap();

        // Absent locally: the source provides it.
        assert_eq!(
            manager.get_config(&service, "timeout", None).unwrap(),
            Some(json!(30))
        );

        // Absent in sources too: cascade into the parent.
        assert_eq!(
            manager.get_config(&service, "retries", None).unwrap(),
            Some(json!(5))
        );

        // Still absent everywhere.
        assert_eq!(manager.get_config(&service, "nothing", None).unwrap(), None);
    }

    #[test]
    fn inheritance_key_filters_gate_sources() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        let defaults = manager
            .create(&root, "defaults", NamespaceOptions::default(), None)
            .unwrap();
        manager.set_config(&defaults, "db.pool", json!(4), None).unwrap();
        manager.set_config(&defaults, "log.level", json!("info"), None).unwrap();

        let service = manager
            .create(
                &root,
                "service",
                NamespaceOptions {
                    inheritance: Some(InheritanceConfig {
                        enabled: true,
                        strategy: InheritanceStrategy::Override,
                        sources: vec![InheritanceSource {
                            namespace: defaults,
                            priority: 1,
                            key_filters: vec!["db".to_string()],
                        }],
                        cascading: false,
                    }),
                    ..NamespaceOptions::default()
                },
                None,
            )
            .unwrap();

        assert_eq!(
            manager.get_config(&service, "db.pool", None).unwrap(),
            Some(json!(4))
        );
        // Filtered out: log.* does not inherit.
        assert_eq!(manager.get_config(&service, "log.level", None).unwrap(), None);
    }

    #[test]
    fn export_import_roundtrip_preserves_checksum() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager.set_config(&root, "db.host", json!("h"), None).unwrap();
        manager.set_config(&root, "db.port", json!(5432), None).unwrap();
        manager.set_config(&root, "flag", json!(true), None).unwrap();

        let export = manager.export(&root, None).unwrap();

        // Import into a fresh scope, then re-export: canonical bytes and
        // checksum match.
        let other_scope = ScopeKey::new("billing", "t2");
        let other_root = manager.ensure_root(&other_scope, None);
        let report = manager.import(&other_root, &export, None).unwrap();
        assert!(report.success);
        assert_eq!(report.imported, 3);

        let reexport = manager.export(&other_root, None).unwrap();
        assert_eq!(
            serde_json::to_vec(&reexport.config).unwrap(),
            serde_json::to_vec(&export.config).unwrap()
        );
        assert_eq!(reexport.checksum, export.checksum);

        // Values read back through the normal path.
        assert_eq!(
            manager.get_config(&other_root, "db.port", None).unwrap(),
            Some(json!(5432))
        );
    }

    #[test]
    fn tampered_import_is_rejected() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager.set_config(&root, "a", json!(1), None).unwrap();
        let mut export = manager.export(&root, None).unwrap();
        export.config["m:billing"]["a"] = json!(999);

        let target = manager.ensure_root(&ScopeKey::new("billing", "t2"), None);
        let err = manager.import(&target, &export, None).unwrap_err();
        assert_eq!(err, NamespaceError::ChecksumMismatch);
        // Nothing was written.
        assert_eq!(manager.get_config(&target, "a", None).unwrap(), None);
    }

    #[test]
    fn import_skips_keys_over_the_limit() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        for (k, v) in [("a", 1), ("b", 2), ("c", 3)] {
            manager.set_config(&root, k, json!(v), None).unwrap();
        }
        let export = manager.export(&root, None).unwrap();

        let target_scope = ScopeKey::new("billing", "t2");
        let target = manager.ensure_root(&target_scope, None);
        manager
            .update(
                &target,
                NamespaceUpdate {
                    isolation: Some(IsolationConfig {
                        level: IsolationLevel::Basic,
                        sandbox: SandboxConfig {
                            enabled: true,
                            resource_limits: ResourceLimits {
                                max_config_keys: Some(2),
                                ..ResourceLimits::default()
                            },
                        },
                    }),
                    ..NamespaceUpdate::default()
                },
                None,
            )
            .unwrap();

        let report = manager.import(&target, &export, None).unwrap();
        assert!(!report.success);
        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped.len(), 1);
    }

    #[test]
    fn mutations_audit_exactly_once() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager.set_config(&root, "a", json!(1), None).unwrap();
        manager.set_config(&root, "b", json!(2), None).unwrap();
        manager.delete_config(&root, "a", None).unwrap();

        assert_eq!(manager.audit.entries_matching("config.write").len(), 2);
        assert_eq!(manager.audit.entries_matching("config.delete").len(), 1);

        let from = Utc::now() - chrono::Duration::minutes(1);
        let to = Utc::now() + chrono::Duration::minutes(1);
        let entries = manager.audit_entries(&root, from, to);
        // create_root + 2 writes + 1 delete
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn metrics_report_counts() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        manager.set_config(&root, "a", json!(1), None).unwrap();
        manager.get_config(&root, "a", None).unwrap();
        let child = manager
            .create(&root, "sub", NamespaceOptions::default(), None)
            .unwrap();
        drop(child);

        let metrics = manager.metrics(&root).unwrap();
        assert_eq!(metrics.key_count, 1);
        assert_eq!(metrics.child_count, 1);
        assert!(metrics.storage_bytes > 0);
        assert_eq!(metrics.writes, 1);
        assert!(metrics.reads >= 1);
    }

    #[tokio::test]
    async fn persist_writes_layout_keys() {
        use crate::ports::MemoryStorage;

        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        let cache = manager
            .create(&root, "cache", NamespaceOptions::default(), None)
            .unwrap();
        manager.set_config(&root, "db.host", json!("h"), None).unwrap();

        let storage = MemoryStorage::new();
        let written = manager.persist(&storage).await.unwrap();
        assert_eq!(written, 2);

        let node_bytes = storage
            .get("namespaces/t1/billing/")
            .await
            .unwrap()
            .expect("root node persisted");
        let node: NamespaceNode = serde_json::from_slice(&node_bytes).unwrap();
        assert_eq!(node.id, root);

        let child_bytes = storage
            .get("namespaces/t1/billing/cache")
            .await
            .unwrap()
            .expect("child node persisted");
        let child: NamespaceNode = serde_json::from_slice(&child_bytes).unwrap();
        assert_eq!(child.id, cache);

        let config_bytes = storage
            .get(&format!("configs/{}", root))
            .await
            .unwrap()
            .expect("config blob persisted");
        let config: Value = serde_json::from_slice(&config_bytes).unwrap();
        assert_eq!(config["m:billing"]["db"]["host"], json!("h"));
    }

    #[test]
    fn teardown_removes_the_whole_scope() {
        let manager = manager();
        let root = manager.ensure_root(&scope(), None);
        let cache = manager
            .create(&root, "cache", NamespaceOptions::default(), None)
            .unwrap();
        manager.create_alias("c", &cache, None).unwrap();

        assert_eq!(manager.teardown_scope(&scope()), 2);
        assert!(manager.get(&root).is_err());
        assert!(manager.get(&cache).is_err());
        assert_eq!(manager.resolve_path(&scope(), "/cache"), None);
        assert_eq!(manager.resolve_path(&scope(), "c"), None);

        // A fresh root can be created afterwards.
        let new_root = manager.ensure_root(&scope(), None);
        assert_ne!(new_root, root);
    }
}
