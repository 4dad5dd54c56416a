// Identity and metadata primitives for modules.
//
// This module defines the typed identifiers, status enums, dependency
// declarations and permission/quota records that accompany every module
// in the system. Instead of passing String everywhere, specific newtypes
// convey semantic meaning and prevent cross-wiring of id spaces.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a module. Survives version updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(id: impl Into<String>) -> Self {
        ModuleId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ModuleId {
    fn from(s: String) -> Self {
        ModuleId(s)
    }
}

impl From<&str> for ModuleId {
    fn from(s: &str) -> Self {
        ModuleId(s.to_string())
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Isolation unit. Different tenants never share configuration or active
/// module state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId(s.to_string())
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        TenantId(s)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named interface a module provides and others may depend on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityId(String);

impl CapabilityId {
    pub fn new(id: impl Into<String>) -> Self {
        CapabilityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CapabilityId {
    fn from(s: &str) -> Self {
        CapabilityId(s.to_string())
    }
}

impl std::fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a single activation attempt. UUID v4, unique per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(Uuid);

impl ActivationId {
    pub fn new() -> Self {
        ActivationId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ActivationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActivationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `(module, tenant)` pair that scopes activations, namespaces and
/// traffic weights.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub module: ModuleId,
    pub tenant: TenantId,
}

impl ScopeKey {
    pub fn new(module: impl Into<ModuleId>, tenant: impl Into<TenantId>) -> Self {
        Self {
            module: module.into(),
            tenant: tenant.into(),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.module, self.tenant)
    }
}

/// Lifecycle status of a registry entry.
///
/// Entries move Installed -> Active -> Inactive, with Failed recording an
/// unsuccessful activation and Deprecated marking superseded versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    /// Installed but never activated (or explicitly reset)
    Installed,
    /// Serving traffic for at least one tenant
    Active,
    /// Previously active, currently not serving
    Inactive,
    /// Last activation attempt failed
    Failed,
    /// Superseded; kept for history, not eligible as a provider
    Deprecated,
}

impl ModuleStatus {
    /// Whether a module in this status may be selected as a dependency
    /// provider.
    pub fn is_resolvable(&self) -> bool {
        matches!(self, ModuleStatus::Active | ModuleStatus::Installed)
    }

    /// Provider ranking weight. Active providers outrank installed ones.
    pub fn provider_rank(&self) -> u8 {
        match self {
            ModuleStatus::Active => 2,
            ModuleStatus::Installed => 1,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Installed => "installed",
            ModuleStatus::Active => "active",
            ModuleStatus::Inactive => "inactive",
            ModuleStatus::Failed => "failed",
            ModuleStatus::Deprecated => "deprecated",
        }
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How strongly a module needs a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Activation fails if no provider is found
    Required,
    /// Missing provider downgrades to a warning
    Optional,
    /// Must be co-resident in the tenant scope with a compatible version
    Peer,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Required => "required",
            DependencyKind::Optional => "optional",
            DependencyKind::Peer => "peer",
        }
    }
}

/// A single declared dependency. Declaration order is preserved and
/// respected during resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Module that must provide the dependency
    pub id: ModuleId,
    /// Semver constraint the provider version must satisfy
    pub constraint: VersionReq,
    /// Required, optional or peer
    pub kind: DependencyKind,
}

impl DependencySpec {
    pub fn required(id: impl Into<ModuleId>, constraint: VersionReq) -> Self {
        Self {
            id: id.into(),
            constraint,
            kind: DependencyKind::Required,
        }
    }

    pub fn optional(id: impl Into<ModuleId>, constraint: VersionReq) -> Self {
        Self {
            id: id.into(),
            constraint,
            kind: DependencyKind::Optional,
        }
    }

    pub fn peer(id: impl Into<ModuleId>, constraint: VersionReq) -> Self {
        Self {
            id: id.into(),
            constraint,
            kind: DependencyKind::Peer,
        }
    }

    pub fn satisfied_by(&self, version: &Version) -> bool {
        self.constraint.matches(version)
    }
}

/// Resource quotas a module declares (and the prepare step reserves).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuotas {
    /// Maximum resident memory in bytes
    pub max_memory_bytes: Option<u64>,
    /// Maximum persisted storage in bytes
    pub max_storage_bytes: Option<u64>,
    /// Soft CPU share allocation (0-100)
    pub cpu_shares: Option<u32>,
}

impl ResourceQuotas {
    /// Check this quota set fits inside a global cap.
    pub fn fits_within(&self, cap: &ResourceQuotas) -> Result<(), String> {
        if let (Some(want), Some(have)) = (self.max_memory_bytes, cap.max_memory_bytes) {
            if want > have {
                return Err(format!("memory quota {} exceeds cap {}", want, have));
            }
        }
        if let (Some(want), Some(have)) = (self.max_storage_bytes, cap.max_storage_bytes) {
            if want > have {
                return Err(format!("storage quota {} exceeds cap {}", want, have));
            }
        }
        if let (Some(want), Some(have)) = (self.cpu_shares, cap.cpu_shares) {
            if want > have {
                return Err(format!("cpu shares {} exceed cap {}", want, have));
            }
        }
        Ok(())
    }
}

/// Permissions a module requests at activation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModulePermissions {
    /// System-level permissions (process, network, filesystem classes)
    pub system: Vec<String>,
    /// Application-level permissions (host API surfaces)
    pub application: Vec<String>,
    /// Declared resource quotas
    pub quotas: ResourceQuotas,
}

/// Policies governing how a module is activated, deactivated and updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Roll back automatically when a step fails
    pub automatic_rollback: bool,
    /// Overall activation deadline in milliseconds
    pub activation_timeout_ms: u64,
    /// Consecutive passing verifications required before the activation is
    /// considered settled
    pub verification_passes: u32,
    /// Grace period for draining traffic on deactivation, milliseconds
    pub deactivation_drain_ms: u64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            automatic_rollback: true,
            activation_timeout_ms: 120_000,
            verification_passes: 3,
            deactivation_drain_ms: 5_000,
        }
    }
}

/// A schema/data migration a module ships. Only additive migrations are
/// accepted; the flag is checked during validation, before any step runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSpec {
    /// Migration version label, unique within the module
    pub version: String,
    /// Additive migrations do not invalidate running prior versions
    pub additive: bool,
    /// Optional compensation script, run on rollback when declared
    pub rollback_script: Option<String>,
    pub description: Option<String>,
}

impl MigrationSpec {
    pub fn additive(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            additive: true,
            rollback_script: None,
            description: None,
        }
    }

    pub fn with_rollback(mut self, script: impl Into<String>) -> Self {
        self.rollback_script = Some(script.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_display_and_equality() {
        let a = ModuleId::new("billing");
        let b: ModuleId = "billing".into();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "billing");
    }

    #[test]
    fn scope_key_display() {
        let key = ScopeKey::new("billing", "t1");
        assert_eq!(key.to_string(), "billing@t1");
    }

    #[test]
    fn status_resolvability() {
        assert!(ModuleStatus::Active.is_resolvable());
        assert!(ModuleStatus::Installed.is_resolvable());
        assert!(!ModuleStatus::Failed.is_resolvable());
        assert!(!ModuleStatus::Deprecated.is_resolvable());
        assert!(ModuleStatus::Active.provider_rank() > ModuleStatus::Installed.provider_rank());
    }

    #[test]
    fn dependency_spec_matches_constraint() {
        let dep = DependencySpec::required("auth", "^1".parse().unwrap());
        assert!(dep.satisfied_by(&Version::new(1, 4, 2)));
        assert!(!dep.satisfied_by(&Version::new(2, 0, 0)));
    }

    #[test]
    fn quotas_fit_within_cap() {
        let want = ResourceQuotas {
            max_memory_bytes: Some(64 * 1024 * 1024),
            max_storage_bytes: None,
            cpu_shares: Some(20),
        };
        let cap = ResourceQuotas {
            max_memory_bytes: Some(128 * 1024 * 1024),
            max_storage_bytes: Some(1 << 30),
            cpu_shares: Some(100),
        };
        assert!(want.fits_within(&cap).is_ok());

        let over = ResourceQuotas {
            max_memory_bytes: Some(256 * 1024 * 1024),
            ..want
        };
        assert!(over.fits_within(&cap).is_err());
    }
}
