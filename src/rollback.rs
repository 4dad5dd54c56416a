// Compensation for failed activations.
//
// Completed steps are undone in reverse completion order. An undo failure
// does not stop the walk; remaining undos still run and the activation is
// marked partially rolled back, which the engine promotes to a critical
// error. The controller always restores registry status, traffic routing
// and staged registrations. Additive migrations are only reversed when a
// rollback script was declared.

use log::{error, info, warn};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::module_definition::ModuleDefinition;
use crate::module_metadata::{ModuleStatus, ScopeKey};
use crate::ports::{MigrationRunner, TrafficRouter};
use crate::registry::ModuleRegistry;
use crate::steps::{QuotaLedger, StagingArea, StepExtension, StepKind};

/// What started a rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    HealthCheckFailure,
    ErrorRateExceeded,
    ResponseTimeExceeded,
    ActivationTimeout,
    CriticalError,
    StepFailure(StepKind),
    Cancelled,
}

impl RollbackReason {
    pub fn as_str(&self) -> &str {
        match self {
            RollbackReason::HealthCheckFailure => "health_check_failure",
            RollbackReason::ErrorRateExceeded => "error_rate_exceeded",
            RollbackReason::ResponseTimeExceeded => "response_time_exceeded",
            RollbackReason::ActivationTimeout => "activation_timeout",
            RollbackReason::CriticalError => "critical_error",
            RollbackReason::StepFailure(_) => "step_failure",
            RollbackReason::Cancelled => "cancelled",
        }
    }
}

/// Which rollback triggers are armed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackTriggers {
    pub on_health_check_failure: bool,
    /// Error rate above this fraction fires a rollback
    pub error_rate_threshold: Option<f64>,
    pub response_time_threshold_ms: Option<u64>,
    pub on_activation_timeout: bool,
    pub on_critical_error: bool,
}

impl Default for RollbackTriggers {
    fn default() -> Self {
        Self {
            on_health_check_failure: true,
            error_rate_threshold: None,
            response_time_threshold_ms: None,
            on_activation_timeout: true,
            on_critical_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackOutcome {
    RolledBack,
    /// Some undos failed; manual intervention may be required
    PartiallyRolledBack { failed_steps: Vec<String> },
}

#[derive(Debug, Clone, Error)]
pub enum RollbackError {
    #[error("rollback timed out after {0:?}")]
    Timeout(Duration),

    #[error("rollback failed: {0}")]
    Failed(String),
}

impl RollbackError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::RollbackFailed
    }
}

/// Executes compensation for a failed activation.
pub struct RollbackController {
    registry: Arc<ModuleRegistry>,
    router: Arc<dyn TrafficRouter>,
    migrations: Arc<dyn MigrationRunner>,
    staging: Arc<StagingArea>,
    quotas: Arc<QuotaLedger>,
    timeout: Duration,
}

impl RollbackController {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        router: Arc<dyn TrafficRouter>,
        migrations: Arc<dyn MigrationRunner>,
        staging: Arc<StagingArea>,
        quotas: Arc<QuotaLedger>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            router,
            migrations,
            staging,
            quotas,
            timeout,
        }
    }

    /// Undo `completed` steps in reverse order and restore prior state.
    /// Best-effort: undo failures are collected, not fatal to the walk.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        scope: &ScopeKey,
        version: &Version,
        definition: &ModuleDefinition,
        completed: &[StepKind],
        prior_active: Option<&Version>,
        extensions: &[Arc<dyn StepExtension>],
    ) -> Result<RollbackOutcome, RollbackError> {
        let work = self.undo_all(scope, version, definition, completed, prior_active, extensions);
        let outcome = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| RollbackError::Timeout(self.timeout))?;

        // The attempted version always lands in failed with zero traffic,
        // and the prior version gets its full weight back even when the
        // failure hit mid-rollout.
        self.finalize(scope, version, prior_active).await;
        Ok(outcome)
    }

    async fn undo_all(
        &self,
        scope: &ScopeKey,
        version: &Version,
        definition: &ModuleDefinition,
        completed: &[StepKind],
        prior_active: Option<&Version>,
        extensions: &[Arc<dyn StepExtension>],
    ) -> RollbackOutcome {
        let mut failed_steps = Vec::new();

        for step in completed.iter().rev() {
            info!("undoing step {} for {}@{}", step, scope, version);
            match step {
                StepKind::Activate => {
                    if let Err(e) = self.undo_activate(scope, version, prior_active).await {
                        failed_steps.push(format!("activate: {}", e));
                    }
                }
                StepKind::Register => {
                    self.staging.remove_staged(scope);
                }
                StepKind::Migrate => {
                    self.undo_migrations(scope, definition, &mut failed_steps).await;
                }
                StepKind::Prepare => {
                    self.quotas.release(scope);
                }
                StepKind::Custom(name) => {
                    match extensions.iter().find(|e| e.name() == name) {
                        Some(extension) => {
                            if let Err(e) = extension.undo(scope).await {
                                warn!("custom step '{}' undo failed: {}", name, e);
                                failed_steps.push(format!("{}: {}", name, e));
                            }
                        }
                        None => {
                            failed_steps.push(format!("{}: extension no longer registered", name));
                        }
                    }
                }
                // Pure or self-reversing steps
                StepKind::Validate | StepKind::Load | StepKind::Warm | StepKind::Verify => {}
            }
        }

        if failed_steps.is_empty() {
            RollbackOutcome::RolledBack
        } else {
            error!(
                "rollback of {}@{} only partially completed ({} undo failures)",
                scope,
                version,
                failed_steps.len()
            );
            RollbackOutcome::PartiallyRolledBack { failed_steps }
        }
    }

    /// Revert traffic to the prior version and restore the active pointer.
    async fn undo_activate(
        &self,
        scope: &ScopeKey,
        version: &Version,
        prior_active: Option<&Version>,
    ) -> Result<(), String> {
        self.router
            .set_weight(scope, version, 0.0)
            .await
            .map_err(|e| e.to_string())?;
        self.staging.remove_live(scope);

        match prior_active {
            Some(prior) => {
                self.router
                    .set_weight(scope, prior, 100.0)
                    .await
                    .map_err(|e| e.to_string())?;
                if self.registry.active_version(&scope.tenant, &scope.module)
                    == Some(version.clone())
                {
                    self.registry
                        .set_active(&scope.tenant, &scope.module, prior)
                        .map_err(|e| e.to_string())?;
                }
            }
            None => {
                if self.registry.active_version(&scope.tenant, &scope.module)
                    == Some(version.clone())
                {
                    self.registry.clear_active(&scope.tenant, &scope.module);
                }
            }
        }
        Ok(())
    }

    /// Additive migrations stand by default; declared rollback scripts run
    /// in reverse order.
    async fn undo_migrations(
        &self,
        scope: &ScopeKey,
        definition: &ModuleDefinition,
        failed_steps: &mut Vec<String>,
    ) {
        for migration in definition
            .migrations
            .iter()
            .rev()
            .filter(|m| m.rollback_script.is_some())
        {
            if let Err(e) = self.migrations.rollback(scope, migration).await {
                warn!("migration {} rollback failed: {}", migration.version, e);
                failed_steps.push(format!("migration {}: {}", migration.version, e));
            }
        }
    }

    async fn finalize(&self, scope: &ScopeKey, version: &Version, prior_active: Option<&Version>) {
        if let Err(e) = self.router.set_weight(scope, version, 0.0).await {
            warn!("could not zero traffic for {}@{}: {}", scope, version, e);
        }
        if let Some(prior) = prior_active {
            if let Err(e) = self.router.set_weight(scope, prior, 100.0).await {
                warn!("could not restore traffic for {}@{}: {}", scope, prior, e);
            }
        }
        // Only demote if the entry still exists and is not serving another
        // tenant.
        if self.registry.active_version(&scope.tenant, &scope.module) != Some(version.clone()) {
            if let Err(e) = self
                .registry
                .set_status(&scope.module, version, ModuleStatus::Failed)
            {
                warn!("could not mark {}@{} failed: {}", scope, version, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_metadata::MigrationSpec;
    use crate::ports::{RecordingMigrationRunner, RecordingRouter, SystemClock};

    fn controller(
        registry: Arc<ModuleRegistry>,
        router: Arc<RecordingRouter>,
        migrations: Arc<RecordingMigrationRunner>,
    ) -> RollbackController {
        RollbackController::new(
            registry,
            router,
            migrations,
            Arc::new(StagingArea::new()),
            Arc::new(QuotaLedger::new()),
            Duration::from_secs(5),
        )
    }

    fn definition_with_migrations() -> ModuleDefinition {
        ModuleDefinition::builder("billing", Version::new(2, 0, 0))
            .migration(MigrationSpec::additive("m1"))
            .migration(MigrationSpec::additive("m2").with_rollback("undo-m2"))
            .build()
    }

    #[tokio::test]
    async fn full_rollback_restores_prior_traffic_and_status() {
        let registry = Arc::new(ModuleRegistry::new(Arc::new(SystemClock)));
        let router = Arc::new(RecordingRouter::new());
        let migrations = Arc::new(RecordingMigrationRunner::new());
        let scope = ScopeKey::new("billing", "t1");
        let prior = Version::new(1, 0, 0);
        let version = Version::new(2, 0, 0);

        registry
            .register(ModuleDefinition::builder("billing", prior.clone()).build())
            .unwrap();
        let definition = definition_with_migrations();
        registry.register(definition.clone()).unwrap();
        registry
            .set_active(&scope.tenant, &scope.module, &prior)
            .unwrap();
        // The failed attempt had promoted the new version.
        registry
            .set_active(&scope.tenant, &scope.module, &version)
            .unwrap();
        router.set_weight(&scope, &version, 70.0).await.unwrap();

        let completed = vec![
            StepKind::Validate,
            StepKind::Prepare,
            StepKind::Load,
            StepKind::Register,
            StepKind::Migrate,
            StepKind::Warm,
            StepKind::Activate,
        ];
        let ctrl = controller(Arc::clone(&registry), Arc::clone(&router), Arc::clone(&migrations));
        let outcome = ctrl
            .execute(&scope, &version, &definition, &completed, Some(&prior), &[])
            .await
            .unwrap();

        assert_eq!(outcome, RollbackOutcome::RolledBack);
        assert_eq!(router.weight(&scope, &version), 0.0);
        assert_eq!(router.weight(&scope, &prior), 100.0);
        assert_eq!(
            registry.active_version(&scope.tenant, &scope.module),
            Some(prior.clone())
        );
        assert_eq!(
            registry.get_version(&scope.module, &version).unwrap().status,
            ModuleStatus::Failed
        );
        // The prior version serves again.
        assert_eq!(
            registry.get_version(&scope.module, &prior).unwrap().status,
            ModuleStatus::Active
        );
        // Only the migration with a rollback script was reversed.
        let rolled_back = migrations.rolled_back();
        assert_eq!(rolled_back.len(), 1);
        assert_eq!(rolled_back[0].1, "m2");
    }

    #[tokio::test]
    async fn undo_failures_are_best_effort_and_reported() {
        let registry = Arc::new(ModuleRegistry::new(Arc::new(SystemClock)));
        let router = Arc::new(RecordingRouter::new());
        let migrations = Arc::new(RecordingMigrationRunner::new());
        let scope = ScopeKey::new("billing", "t1");
        let version = Version::new(2, 0, 0);

        struct FailingUndo;
        #[async_trait::async_trait]
        impl StepExtension for FailingUndo {
            fn name(&self) -> &str {
                "prime-cdn"
            }
            fn after(&self) -> StepKind {
                StepKind::Warm
            }
            async fn run(&self, _scope: &ScopeKey) -> Result<(), String> {
                Ok(())
            }
            async fn undo(&self, _scope: &ScopeKey) -> Result<(), String> {
                Err("cdn unreachable".to_string())
            }
        }

        let definition = definition_with_migrations();
        registry.register(definition.clone()).unwrap();

        let completed = vec![
            StepKind::Prepare,
            StepKind::Custom("prime-cdn".to_string()),
        ];
        let extensions: Vec<Arc<dyn StepExtension>> = vec![Arc::new(FailingUndo)];
        let ctrl = controller(Arc::clone(&registry), router, migrations);
        let outcome = ctrl
            .execute(&scope, &version, &definition, &completed, None, &extensions)
            .await
            .unwrap();

        match outcome {
            RollbackOutcome::PartiallyRolledBack { failed_steps } => {
                assert_eq!(failed_steps.len(), 1);
                assert!(failed_steps[0].contains("cdn unreachable"));
            }
            other => panic!("expected partial rollback, got {:?}", other),
        }
        // State restoration still happened.
        assert_eq!(
            registry.get_version(&scope.module, &version).unwrap().status,
            ModuleStatus::Failed
        );
    }
}
