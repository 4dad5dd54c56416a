// Activation step machinery.
//
// Steps are a closed sum type with a fixed forward order; hosts extend the
// pipeline with custom steps anchored after a built-in step. Every step is
// idempotent and pairs its work with an undo action so the rollback
// controller can compose compensation in reverse completion order.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::module_definition::IntegrationSurface;
use crate::module_metadata::{ResourceQuotas, ScopeKey};

/// The activation pipeline steps, in forward order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Validate,
    Prepare,
    Load,
    Register,
    Migrate,
    Warm,
    Activate,
    Verify,
    /// Host-registered extension step, identified by name
    Custom(String),
}

impl StepKind {
    /// Built-in steps in execution order.
    pub fn builtin_order() -> [StepKind; 8] {
        [
            StepKind::Validate,
            StepKind::Prepare,
            StepKind::Load,
            StepKind::Register,
            StepKind::Migrate,
            StepKind::Warm,
            StepKind::Activate,
            StepKind::Verify,
        ]
    }

    pub fn as_str(&self) -> &str {
        match self {
            StepKind::Validate => "validate",
            StepKind::Prepare => "prepare",
            StepKind::Load => "load",
            StepKind::Register => "register",
            StepKind::Migrate => "migrate",
            StepKind::Warm => "warm",
            StepKind::Activate => "activate",
            StepKind::Verify => "verify",
            StepKind::Custom(name) => name.as_str(),
        }
    }

    /// Critical steps abort the activation on failure; non-critical ones
    /// only record a warning.
    pub fn is_critical(&self) -> bool {
        !matches!(self, StepKind::Warm)
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    /// Re-execution of an already completed step
    AlreadyDone,
    Failed,
    Undone,
}

/// One entry in an activation's step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub kind: StepKind,
    pub status: StepStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error: Option<String>,
}

/// A classified step failure.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StepFailure {}

/// Host-registered custom step, anchored after a built-in step.
#[async_trait]
pub trait StepExtension: Send + Sync {
    fn name(&self) -> &str;

    /// The built-in step this extension runs after.
    fn after(&self) -> StepKind;

    /// Per-execution timeout; the engine default applies when None.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn run(&self, scope: &ScopeKey) -> Result<(), String>;

    async fn undo(&self, scope: &ScopeKey) -> Result<(), String>;
}

/// Staged vs live integration surfaces per scope. The register step
/// publishes into staging; the activate step promotes staging to live.
#[derive(Default)]
pub struct StagingArea {
    staged: RwLock<HashMap<ScopeKey, IntegrationSurface>>,
    live: RwLock<HashMap<ScopeKey, IntegrationSurface>>,
}

impl StagingArea {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, scope: &ScopeKey, surface: IntegrationSurface) {
        self.staged.write().insert(scope.clone(), surface);
    }

    /// Promote the staged surface to live. Returns the replaced live
    /// surface, if any.
    pub fn promote(&self, scope: &ScopeKey) -> Option<IntegrationSurface> {
        let staged = self.staged.write().remove(scope)?;
        self.live.write().insert(scope.clone(), staged)
    }

    pub fn remove_staged(&self, scope: &ScopeKey) -> Option<IntegrationSurface> {
        self.staged.write().remove(scope)
    }

    pub fn remove_live(&self, scope: &ScopeKey) -> Option<IntegrationSurface> {
        self.live.write().remove(scope)
    }

    pub fn staged(&self, scope: &ScopeKey) -> Option<IntegrationSurface> {
        self.staged.read().get(scope).cloned()
    }

    pub fn live(&self, scope: &ScopeKey) -> Option<IntegrationSurface> {
        self.live.read().get(scope).cloned()
    }
}

/// Quota reservations made by the prepare step and released on rollback
/// or deactivation.
#[derive(Default)]
pub struct QuotaLedger {
    reserved: RwLock<HashMap<ScopeKey, ResourceQuotas>>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, scope: &ScopeKey, quotas: ResourceQuotas) {
        self.reserved.write().insert(scope.clone(), quotas);
    }

    pub fn release(&self, scope: &ScopeKey) -> Option<ResourceQuotas> {
        self.reserved.write().remove(scope)
    }

    pub fn reservation(&self, scope: &ScopeKey) -> Option<ResourceQuotas> {
        self.reserved.read().get(scope).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_order_is_the_forward_path() {
        let order = StepKind::builtin_order();
        assert_eq!(order.first(), Some(&StepKind::Validate));
        assert_eq!(order.last(), Some(&StepKind::Verify));
        let activate_pos = order.iter().position(|s| *s == StepKind::Activate).unwrap();
        let register_pos = order.iter().position(|s| *s == StepKind::Register).unwrap();
        assert!(register_pos < activate_pos);
    }

    #[test]
    fn warm_is_the_only_non_critical_builtin() {
        for step in StepKind::builtin_order() {
            assert_eq!(step.is_critical(), step != StepKind::Warm, "{}", step);
        }
    }

    #[test]
    fn staging_promote_moves_surface_to_live() {
        let staging = StagingArea::new();
        let scope = ScopeKey::new("billing", "t1");
        let surface = IntegrationSurface {
            routes: vec!["/billing".to_string()],
            ..IntegrationSurface::default()
        };

        staging.stage(&scope, surface.clone());
        assert_eq!(staging.staged(&scope), Some(surface.clone()));
        assert_eq!(staging.live(&scope), None);

        staging.promote(&scope);
        assert_eq!(staging.staged(&scope), None);
        assert_eq!(staging.live(&scope), Some(surface));
    }

    #[test]
    fn quota_ledger_reserve_release() {
        let ledger = QuotaLedger::new();
        let scope = ScopeKey::new("billing", "t1");
        let quotas = ResourceQuotas {
            max_memory_bytes: Some(1024),
            ..ResourceQuotas::default()
        };

        ledger.reserve(&scope, quotas.clone());
        assert_eq!(ledger.reservation(&scope), Some(quotas.clone()));
        assert_eq!(ledger.release(&scope), Some(quotas));
        assert_eq!(ledger.reservation(&scope), None);
    }
}
