// The activation engine.
//
// Drives a module from pending to active under the requested rollout
// strategy, or back on failure. One logical task per activation; a mutex
// keyed by (module, tenant) serializes attempts on the same scope while
// different scopes proceed in parallel, bounded by a global semaphore.
// Step execution streams events with per-activation sequence numbers and
// hands completed steps to the rollback controller when something breaks.

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditEntryBuilder;
use crate::dependency_resolver::{DependencyResolver, ResolutionStrategy};
use crate::error::{ErrorKind, OperationError, OperationReport};
use crate::events::{ActivationEvent, EventBus, EventKind};
use crate::health::HealthChecker;
use crate::module_definition::ModuleDefinition;
use crate::module_metadata::{
    ActivationId, ModuleId, ResourceQuotas, ScopeKey, TenantId,
};
use crate::namespace::NamespaceManager;
use crate::ports::{
    Clock, ModuleLoader, MigrationRunner, PortError, RandomSource, StorageAdapter, TrafficRouter,
};
use crate::registry::ModuleRegistry;
use crate::rollback::{RollbackController, RollbackOutcome, RollbackReason, RollbackTriggers};
use crate::rollout::{traffic_plan, RolloutStrategy};
use crate::steps::{
    QuotaLedger, StagingArea, StepExtension, StepFailure, StepKind, StepRecord, StepStatus,
};

/// Lifecycle states of a single activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    Pending,
    Validating,
    Preparing,
    Loading,
    Registering,
    Migrating,
    Warming,
    Activating,
    Verifying,
    Active,
    Failed,
    RollingBack,
    RolledBack,
}

impl ActivationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActivationState::Active | ActivationState::Failed | ActivationState::RolledBack
        )
    }

    fn for_step(step: &StepKind) -> Option<ActivationState> {
        match step {
            StepKind::Validate => Some(ActivationState::Validating),
            StepKind::Prepare => Some(ActivationState::Preparing),
            StepKind::Load => Some(ActivationState::Loading),
            StepKind::Register => Some(ActivationState::Registering),
            StepKind::Migrate => Some(ActivationState::Migrating),
            StepKind::Warm => Some(ActivationState::Warming),
            StepKind::Activate => Some(ActivationState::Activating),
            StepKind::Verify => Some(ActivationState::Verifying),
            StepKind::Custom(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationState::Pending => "pending",
            ActivationState::Validating => "validating",
            ActivationState::Preparing => "preparing",
            ActivationState::Loading => "loading",
            ActivationState::Registering => "registering",
            ActivationState::Migrating => "migrating",
            ActivationState::Warming => "warming",
            ActivationState::Activating => "activating",
            ActivationState::Verifying => "verifying",
            ActivationState::Active => "active",
            ActivationState::Failed => "failed",
            ActivationState::RollingBack => "rolling_back",
            ActivationState::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for ActivationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens when a second activation arrives for a busy scope or a
/// full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// FIFO wait for the lock/queue slot
    Wait,
    /// Fail fast with ACTIVATION_IN_PROGRESS / BUSY
    Reject,
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_activations: usize,
    pub queue_policy: QueuePolicy,
    pub step_timeout: Duration,
    pub rollback_timeout: Duration,
    pub history_limit: usize,
    pub resolution_strategy: ResolutionStrategy,
    /// Global caps module quota declarations must fit within
    pub quota_caps: ResourceQuotas,
    pub triggers: RollbackTriggers,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_activations: 16,
            queue_policy: QueuePolicy::Wait,
            step_timeout: Duration::from_secs(30),
            rollback_timeout: Duration::from_secs(30),
            history_limit: 64,
            resolution_strategy: ResolutionStrategy::Conservative,
            quota_caps: ResourceQuotas::default(),
            triggers: RollbackTriggers::default(),
        }
    }
}

/// Per-call options; unset fields fall back to the module's lifecycle
/// policy or the engine config.
#[derive(Debug, Clone, Default)]
pub struct ActivationOptions {
    pub strategy: RolloutStrategy,
    pub queue_policy: Option<QueuePolicy>,
    pub automatic_rollback: Option<bool>,
    pub verification_passes: Option<u32>,
    pub activation_timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
    pub actor: Option<String>,
}

impl ActivationOptions {
    pub fn with_strategy(strategy: RolloutStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }
}

/// Per-attempt context, archived to history on completion.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    pub id: ActivationId,
    pub scope: ScopeKey,
    pub version: Version,
    pub strategy: String,
    pub state: ActivationState,
    pub step_log: Vec<StepRecord>,
    pub completed: Vec<StepKind>,
    pub traffic_trace: Vec<f64>,
    pub prior_active: Option<Version>,
    pub warnings: Vec<String>,
    pub artifact_digest: Option<String>,
    /// Blue environment kept until this instant under blue-green
    pub blue_retained_until: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    seq: u64,
}

impl ActivationContext {
    fn new(scope: ScopeKey, version: Version, strategy: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: ActivationId::new(),
            scope,
            version,
            strategy: strategy.to_string(),
            state: ActivationState::Pending,
            step_log: Vec::new(),
            completed: Vec::new(),
            traffic_trace: Vec::new(),
            prior_active: None,
            warnings: Vec::new(),
            artifact_digest: None,
            blue_retained_until: None,
            started_at: now,
            finished_at: None,
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

/// Structured result of an activation attempt.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    pub success: bool,
    pub state: ActivationState,
    pub errors: Vec<OperationError>,
    pub warnings: Vec<String>,
    pub activation: ActivationId,
    pub traffic_trace: Vec<f64>,
    pub duration_ms: u64,
}

impl ActivationReport {
    fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            state: ActivationState::Pending,
            errors: vec![OperationError::new(kind, message)],
            warnings: Vec::new(),
            activation: ActivationId::new(),
            traffic_trace: Vec::new(),
            duration_ms: 0,
        }
    }

    fn already_active(module: &ModuleId, version: &Version) -> Self {
        Self {
            success: true,
            state: ActivationState::Active,
            errors: Vec::new(),
            warnings: vec![format!("{}@{} is already active; nothing to do", module, version)],
            activation: ActivationId::new(),
            traffic_trace: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Injected collaborators the engine drives.
#[derive(Clone)]
pub struct EnginePorts {
    pub loader: Arc<dyn ModuleLoader>,
    pub storage: Arc<dyn StorageAdapter>,
    pub migrations: Arc<dyn MigrationRunner>,
    pub router: Arc<dyn TrafficRouter>,
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
}

#[derive(Default)]
struct EngineCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rollbacks: AtomicU64,
}

/// Point-in-time engine metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rollbacks: u64,
}

/// Orchestrates module activations and deactivations.
pub struct ActivationEngine {
    registry: Arc<ModuleRegistry>,
    resolver: Arc<DependencyResolver>,
    health: Arc<HealthChecker>,
    namespaces: Arc<NamespaceManager>,
    rollback: RollbackController,
    ports: EnginePorts,
    events: EventBus,
    staging: Arc<StagingArea>,
    quotas: Arc<QuotaLedger>,
    locks: Mutex<HashMap<ScopeKey, Arc<AsyncMutex<()>>>>,
    semaphore: Arc<Semaphore>,
    history: RwLock<VecDeque<ActivationContext>>,
    counters: EngineCounters,
    extensions: RwLock<Vec<Arc<dyn StepExtension>>>,
    config: EngineConfig,
}

impl ActivationEngine {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        resolver: Arc<DependencyResolver>,
        health: Arc<HealthChecker>,
        namespaces: Arc<NamespaceManager>,
        ports: EnginePorts,
        config: EngineConfig,
    ) -> Self {
        let staging = Arc::new(StagingArea::new());
        let quotas = Arc::new(QuotaLedger::new());
        let rollback = RollbackController::new(
            Arc::clone(&registry),
            Arc::clone(&ports.router),
            Arc::clone(&ports.migrations),
            Arc::clone(&staging),
            Arc::clone(&quotas),
            config.rollback_timeout,
        );
        Self {
            registry,
            resolver,
            health,
            namespaces,
            rollback,
            ports,
            events: EventBus::default(),
            staging,
            quotas,
            locks: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_activations)),
            history: RwLock::new(VecDeque::new()),
            counters: EngineCounters::default(),
            extensions: RwLock::new(Vec::new()),
            config,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ActivationEvent> {
        self.events.subscribe()
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn register_extension(&self, extension: Arc<dyn StepExtension>) {
        self.extensions.write().push(extension);
    }

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            attempts: self.counters.attempts.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
        }
    }

    /// Archived attempt contexts, most recent last.
    pub fn history(&self) -> Vec<ActivationContext> {
        self.history.read().iter().cloned().collect()
    }

    /// Activate `module@version` for a tenant under the requested rollout
    /// strategy.
    pub async fn activate(
        &self,
        module: &ModuleId,
        version: &Version,
        tenant: &TenantId,
        options: ActivationOptions,
    ) -> ActivationReport {
        let scope = ScopeKey::new(module.clone(), tenant.clone());
        self.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let entry = match self.registry.get_version(module, version) {
            Some(entry) => entry,
            None => {
                return ActivationReport::rejected(
                    ErrorKind::Validation,
                    format!("module {}@{} is not installed", module, version),
                );
            }
        };
        let definition = entry.definition;

        // Re-running a completed activation is a no-op.
        if self.registry.active_version(tenant, module).as_ref() == Some(version) {
            self.namespaces.audit_trail().record(
                AuditEntryBuilder::new("activation.already_done")
                    .principal(options.actor.as_deref())
                    .details(json!({"module": module.as_str(), "version": version.to_string()})),
            );
            return ActivationReport::already_active(module, version);
        }

        let queue_policy = options.queue_policy.unwrap_or(self.config.queue_policy);

        // Backpressure: bounded activation queue.
        let _permit = match queue_policy {
            QueuePolicy::Reject => match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    return ActivationReport::rejected(
                        ErrorKind::Busy,
                        "activation queue is full",
                    );
                }
            },
            QueuePolicy::Wait => match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return ActivationReport::rejected(ErrorKind::Busy, "engine is shut down");
                }
            },
        };

        // Exclusive activation lock per (module, tenant).
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(scope.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let _guard = match queue_policy {
            QueuePolicy::Reject => match Arc::clone(&lock).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    return ActivationReport::rejected(
                        ErrorKind::ActivationInProgress,
                        format!("an activation for {} is already in progress", scope),
                    );
                }
            },
            QueuePolicy::Wait => lock.lock_owned().await,
        };

        // The lock may have been held by an activation of this exact
        // version; re-check after acquiring.
        if self.registry.active_version(tenant, module).as_ref() == Some(version) {
            return ActivationReport::already_active(module, version);
        }

        let now = self.ports.clock.now();
        let mut ctx = ActivationContext::new(
            scope.clone(),
            version.clone(),
            options.strategy.name(),
            now,
        );
        info!("activation {} started for {}@{}", ctx.id, scope, version);
        self.emit(
            &mut ctx,
            EventKind::BeforeActivate,
            json!({"version": version.to_string(), "strategy": options.strategy.name()}),
        );

        let cancel = options
            .cancellation
            .clone()
            .unwrap_or_default();
        let overall = options.activation_timeout.unwrap_or(Duration::from_millis(
            definition.lifecycle.activation_timeout_ms,
        ));
        let auto_rollback = options
            .automatic_rollback
            .unwrap_or(definition.lifecycle.automatic_rollback);

        let outcome = {
            let run = self.run_steps(&mut ctx, &definition, &options, &cancel);
            match tokio::time::timeout(overall, run).await {
                Ok(result) => result,
                Err(_) => {
                    cancel.cancel();
                    Err(StepFailure::new(
                        ErrorKind::ActivationTimeout,
                        format!("activation exceeded its {:?} deadline", overall),
                    ))
                }
            }
        };

        let report = match outcome {
            Ok(()) => {
                ctx.state = ActivationState::Active;
                ctx.finished_at = Some(self.ports.clock.now());
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                self.emit(
                    &mut ctx,
                    EventKind::AfterActivate,
                    json!({"version": version.to_string()}),
                );
                self.namespaces.audit_trail().record(
                    AuditEntryBuilder::new("module.activate")
                        .principal(options.actor.as_deref())
                        .details(json!({
                            "module": module.as_str(),
                            "version": version.to_string(),
                            "tenant": tenant.as_str(),
                        })),
                );
                info!("activation {} reached active for {}@{}", ctx.id, scope, version);
                ActivationReport {
                    success: true,
                    state: ctx.state,
                    errors: Vec::new(),
                    warnings: ctx.warnings.clone(),
                    activation: ctx.id,
                    traffic_trace: ctx.traffic_trace.clone(),
                    duration_ms: duration_ms(ctx.started_at, self.ports.clock.now()),
                }
            }
            Err(failure) => {
                self.handle_failure(&mut ctx, &definition, failure, auto_rollback, &options)
                    .await
            }
        };

        self.archive(ctx);
        report
    }

    /// Drain traffic and withdraw a module from serving for a tenant.
    pub async fn deactivate(
        &self,
        module: &ModuleId,
        tenant: &TenantId,
        actor: Option<&str>,
    ) -> OperationReport {
        let scope = ScopeKey::new(module.clone(), tenant.clone());
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(scope.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let _guard = lock.lock_owned().await;

        let version = match self.registry.active_version(tenant, module) {
            Some(version) => version,
            None => {
                return OperationReport::failed(OperationError::new(
                    ErrorKind::Validation,
                    format!("{} is not active for tenant {}", module, tenant),
                ));
            }
        };

        let mut ctx = ActivationContext::new(
            scope.clone(),
            version.clone(),
            "deactivate",
            self.ports.clock.now(),
        );
        self.emit(
            &mut ctx,
            EventKind::BeforeDeactivate,
            json!({"version": version.to_string()}),
        );

        let mut report = OperationReport::ok_with_state("inactive");
        if let Err(e) = self.ports.router.set_weight(&scope, &version, 0.0).await {
            report.add_warning(format!("traffic drain failed: {}", e));
        }
        self.staging.remove_live(&scope);
        self.quotas.release(&scope);
        self.health.unregister(&scope);
        self.registry.clear_active(tenant, module);

        self.emit(
            &mut ctx,
            EventKind::AfterDeactivate,
            json!({"version": version.to_string()}),
        );
        self.namespaces.audit_trail().record(
            AuditEntryBuilder::new("module.deactivate")
                .principal(actor)
                .details(json!({
                    "module": module.as_str(),
                    "version": version.to_string(),
                    "tenant": tenant.as_str(),
                })),
        );
        info!("deactivated {}@{}", scope, version);
        report
    }

    /// Feed observed runtime metrics for an active module. Crossing an
    /// armed error-rate or response-time threshold reverts traffic to the
    /// previously active version.
    pub async fn report_runtime_metrics(
        &self,
        module: &ModuleId,
        tenant: &TenantId,
        error_rate: f64,
        avg_response_time_ms: u64,
    ) -> OperationReport {
        let triggers = &self.config.triggers;
        let reason = if triggers
            .error_rate_threshold
            .map(|threshold| error_rate > threshold)
            .unwrap_or(false)
        {
            RollbackReason::ErrorRateExceeded
        } else if triggers
            .response_time_threshold_ms
            .map(|threshold| avg_response_time_ms > threshold)
            .unwrap_or(false)
        {
            RollbackReason::ResponseTimeExceeded
        } else {
            return OperationReport::ok();
        };

        let scope = ScopeKey::new(module.clone(), tenant.clone());
        let current = match self.registry.active_version(tenant, module) {
            Some(current) => current,
            None => {
                return OperationReport::failed(OperationError::new(
                    ErrorKind::Validation,
                    format!("{} is not active for tenant {}", module, tenant),
                ));
            }
        };

        // The prior version comes from the last successful activation of
        // this scope.
        let prior = self
            .history
            .read()
            .iter()
            .rev()
            .find(|ctx| ctx.scope == scope && ctx.version == current)
            .and_then(|ctx| ctx.prior_active.clone());

        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(scope.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let _guard = lock.lock_owned().await;

        let mut ctx = ActivationContext::new(
            scope.clone(),
            current.clone(),
            "runtime_rollback",
            self.ports.clock.now(),
        );
        warn!(
            "runtime trigger {} fired for {}@{}; reverting",
            reason.as_str(),
            scope,
            current
        );
        self.emit(
            &mut ctx,
            EventKind::RollbackStarted,
            json!({"reason": reason.as_str()}),
        );
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);

        let mut report = OperationReport::ok_with_state("rolled_back");
        if let Err(e) = self.ports.router.set_weight(&scope, &current, 0.0).await {
            report.add_error(OperationError::new(ErrorKind::RollbackFailed, e.to_string()));
        }
        self.staging.remove_live(&scope);

        match prior {
            Some(prior_version) => {
                if let Err(e) = self.ports.router.set_weight(&scope, &prior_version, 100.0).await {
                    report.add_error(OperationError::new(ErrorKind::RollbackFailed, e.to_string()));
                }
                if let Err(e) = self.registry.set_active(tenant, module, &prior_version) {
                    report.add_error(OperationError::new(e.kind(), e.to_string()));
                }
            }
            None => {
                self.registry.clear_active(tenant, module);
            }
        }
        if let Err(e) = self
            .registry
            .set_status(module, &current, crate::module_metadata::ModuleStatus::Failed)
        {
            report.add_warning(format!("could not mark {} failed: {}", current, e));
        }

        self.emit(
            &mut ctx,
            EventKind::RollbackCompleted,
            json!({"partial": false, "reason": reason.as_str()}),
        );
        self.namespaces.audit_trail().record(
            AuditEntryBuilder::new("module.runtime_rollback")
                .details(json!({
                    "module": module.as_str(),
                    "tenant": tenant.as_str(),
                    "version": current.to_string(),
                    "reason": reason.as_str(),
                })),
        );
        report
    }

    /// Remove a module version entirely; namespace trees for the module
    /// are torn down once no version remains installed.
    pub async fn uninstall(&self, module: &ModuleId, version: &Version) -> OperationReport {
        if let Err(e) = self.registry.unregister(module, version) {
            return OperationReport::failed(OperationError::new(e.kind(), e.to_string()));
        }

        if let Err(e) = self
            .ports
            .storage
            .delete(&format!("modules/{}/{}", module, version))
            .await
        {
            warn!("could not delete persisted definition for {}@{}: {}", module, version, e);
        }

        if self.registry.get(module).is_none() {
            for scope in self.namespaces.scopes_for_module(module) {
                self.namespaces.teardown_scope(&scope);
            }
        }
        OperationReport::ok()
    }

    // ========================================================================
    // Step driver
    // ========================================================================

    async fn run_steps(
        &self,
        ctx: &mut ActivationContext,
        definition: &ModuleDefinition,
        options: &ActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let extensions: Vec<Arc<dyn StepExtension>> = self.extensions.read().clone();
        for step in StepKind::builtin_order() {
            self.execute_step(ctx, &step, definition, options, cancel).await?;
            for extension in extensions.iter().filter(|e| e.after() == step) {
                self.execute_extension(ctx, extension, cancel).await?;
            }
        }
        Ok(())
    }

    async fn execute_step(
        &self,
        ctx: &mut ActivationContext,
        step: &StepKind,
        definition: &ModuleDefinition,
        options: &ActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        // Idempotence: a completed step re-executes as a no-op.
        if ctx.completed.contains(step) {
            ctx.step_log.push(StepRecord {
                kind: step.clone(),
                status: StepStatus::AlreadyDone,
                started_at: self.ports.clock.now(),
                finished_at: Some(self.ports.clock.now()),
                error: None,
            });
            return Ok(());
        }

        if let Some(state) = ActivationState::for_step(step) {
            ctx.state = state;
        }
        let started_at = self.ports.clock.now();
        self.emit(ctx, EventKind::StepStarted, json!({"step": step.as_str()}));

        let result = {
            let work = self.run_builtin(ctx, step, definition, options, cancel);
            match tokio::time::timeout(self.config.step_timeout, work).await {
                Ok(result) => result,
                Err(_) => Err(StepFailure::new(
                    ErrorKind::ActivationTimeout,
                    format!("step {} timed out", step),
                )),
            }
        };

        match result {
            Ok(()) => {
                ctx.step_log.push(StepRecord {
                    kind: step.clone(),
                    status: StepStatus::Completed,
                    started_at,
                    finished_at: Some(self.ports.clock.now()),
                    error: None,
                });
                ctx.completed.push(step.clone());
                self.emit(ctx, EventKind::StepCompleted, json!({"step": step.as_str()}));
                Ok(())
            }
            Err(failure) if !step.is_critical() => {
                ctx.step_log.push(StepRecord {
                    kind: step.clone(),
                    status: StepStatus::Failed,
                    started_at,
                    finished_at: Some(self.ports.clock.now()),
                    error: Some(failure.message.clone()),
                });
                self.emit(
                    ctx,
                    EventKind::StepFailed,
                    json!({"step": step.as_str(), "error": failure.message, "critical": false}),
                );
                ctx.warnings
                    .push(format!("non-critical step {} failed: {}", step, failure.message));
                Ok(())
            }
            Err(failure) => {
                ctx.step_log.push(StepRecord {
                    kind: step.clone(),
                    status: StepStatus::Failed,
                    started_at,
                    finished_at: Some(self.ports.clock.now()),
                    error: Some(failure.message.clone()),
                });
                self.emit(
                    ctx,
                    EventKind::StepFailed,
                    json!({"step": step.as_str(), "error": failure.message, "critical": true}),
                );
                Err(failure)
            }
        }
    }

    async fn execute_extension(
        &self,
        ctx: &mut ActivationContext,
        extension: &Arc<dyn StepExtension>,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let kind = StepKind::Custom(extension.name().to_string());
        if ctx.completed.contains(&kind) {
            return Ok(());
        }
        let started_at = self.ports.clock.now();
        self.emit(ctx, EventKind::StepStarted, json!({"step": extension.name()}));

        if cancel.is_cancelled() {
            return Err(StepFailure::new(
                ErrorKind::ActivationTimeout,
                "activation cancelled",
            ));
        }

        let timeout = extension.timeout().unwrap_or(self.config.step_timeout);
        let result = match tokio::time::timeout(timeout, extension.run(&ctx.scope)).await {
            Ok(result) => result,
            Err(_) => Err(format!("custom step {} timed out", extension.name())),
        };

        match result {
            Ok(()) => {
                ctx.step_log.push(StepRecord {
                    kind: kind.clone(),
                    status: StepStatus::Completed,
                    started_at,
                    finished_at: Some(self.ports.clock.now()),
                    error: None,
                });
                ctx.completed.push(kind.clone());
                self.emit(ctx, EventKind::StepCompleted, json!({"step": extension.name()}));
                Ok(())
            }
            Err(message) => {
                ctx.step_log.push(StepRecord {
                    kind,
                    status: StepStatus::Failed,
                    started_at,
                    finished_at: Some(self.ports.clock.now()),
                    error: Some(message.clone()),
                });
                self.emit(
                    ctx,
                    EventKind::StepFailed,
                    json!({"step": extension.name(), "error": message, "critical": true}),
                );
                Err(StepFailure::new(ErrorKind::Critical, message))
            }
        }
    }

    async fn run_builtin(
        &self,
        ctx: &mut ActivationContext,
        step: &StepKind,
        definition: &ModuleDefinition,
        options: &ActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        match step {
            StepKind::Validate => self.step_validate(ctx, definition),
            StepKind::Prepare => {
                self.namespaces
                    .ensure_root(&ctx.scope, Some(definition.config_schema.clone()));
                self.quotas
                    .reserve(&ctx.scope, definition.permissions.quotas.clone());
                Ok(())
            }
            StepKind::Load => {
                let artifact = self
                    .ports
                    .loader
                    .fetch(&ctx.scope.module, &ctx.version)
                    .await
                    .map_err(|e| StepFailure::new(ErrorKind::Validation, e.to_string()))?;
                artifact
                    .verify()
                    .map_err(|e| StepFailure::new(ErrorKind::Validation, e.to_string()))?;
                ctx.artifact_digest = Some(artifact.digest);
                Ok(())
            }
            StepKind::Register => {
                self.staging
                    .stage(&ctx.scope, definition.integration.clone());
                let bytes = crate::module_definition::DefinitionParser::to_json_bytes(definition)
                    .map_err(|e| StepFailure::new(ErrorKind::Validation, e.to_string()))?;
                // First writer wins; an existing blob means a previous
                // attempt already persisted this definition.
                let _ = self
                    .ports
                    .storage
                    .compare_and_swap(&definition.storage_key(), None, bytes)
                    .await
                    .map_err(|e| StepFailure::new(port_error_kind(&e), e.to_string()))?;
                Ok(())
            }
            StepKind::Migrate => {
                for migration in &definition.migrations {
                    if cancel.is_cancelled() {
                        return Err(StepFailure::new(
                            ErrorKind::ActivationTimeout,
                            "activation cancelled during migrations",
                        ));
                    }
                    self.ports
                        .migrations
                        .apply(&ctx.scope, migration)
                        .await
                        .map_err(|e| {
                            StepFailure::new(
                                ErrorKind::MigrationFailed,
                                format!("migration {}: {}", migration.version, e),
                            )
                        })?;
                }
                Ok(())
            }
            StepKind::Warm => {
                // Prime the persisted definition into whatever cache the
                // storage adapter keeps; real warmup lives in extensions.
                let _ = self
                    .ports
                    .storage
                    .get(&definition.storage_key())
                    .await
                    .map_err(|e| StepFailure::new(port_error_kind(&e), e.to_string()))?;
                Ok(())
            }
            StepKind::Activate => self.step_activate(ctx, options, cancel).await,
            StepKind::Verify => self.step_verify(ctx, definition, options, cancel).await,
            StepKind::Custom(name) => Err(StepFailure::new(
                ErrorKind::Validation,
                format!("unknown builtin step {}", name),
            )),
        }
    }

    /// Pure validation: dependency resolution, declared conflicts, quota
    /// fit and migration shape. No side effects.
    fn step_validate(
        &self,
        ctx: &mut ActivationContext,
        definition: &ModuleDefinition,
    ) -> Result<(), StepFailure> {
        let resolution =
            self.resolver
                .resolve(definition, &ctx.scope.tenant, self.config.resolution_strategy);
        ctx.warnings.extend(resolution.warnings.iter().cloned());
        if !resolution.success {
            let first_kind = resolution
                .errors
                .first()
                .map(|e| e.kind)
                .unwrap_or(ErrorKind::DependencyUnresolved);
            let message = resolution
                .errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StepFailure::new(first_kind, message));
        }

        for (active_id, active_version) in self.registry.tenant_active_modules(&ctx.scope.tenant) {
            if definition.conflicts.contains(&active_id) {
                return Err(StepFailure::new(
                    ErrorKind::ModuleConflict,
                    format!("declared conflict with active module {}", active_id),
                ));
            }
            let reverse_conflict = self
                .registry
                .get_version(&active_id, &active_version)
                .map(|entry| entry.definition.conflicts.contains(&definition.id))
                .unwrap_or(false);
            if reverse_conflict {
                return Err(StepFailure::new(
                    ErrorKind::ModuleConflict,
                    format!("active module {} declares a conflict with {}", active_id, definition.id),
                ));
            }
        }

        definition
            .permissions
            .quotas
            .fits_within(&self.config.quota_caps)
            .map_err(|e| StepFailure::new(ErrorKind::ResourceLimit, e))?;

        if let Some(migration) = definition.migrations.iter().find(|m| !m.additive) {
            return Err(StepFailure::new(
                ErrorKind::Validation,
                format!("migration {} is not additive", migration.version),
            ));
        }
        Ok(())
    }

    /// Promote per the rollout strategy, then swap staging to live and the
    /// registry pointer to this version.
    async fn step_activate(
        &self,
        ctx: &mut ActivationContext,
        options: &ActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        ctx.prior_active = self
            .registry
            .active_version(&ctx.scope.tenant, &ctx.scope.module)
            .filter(|prior| prior != &ctx.version);

        match &options.strategy {
            RolloutStrategy::Instant => {
                self.shift_traffic(ctx, 100.0).await?;
            }
            RolloutStrategy::Gradual(shifting) => {
                let plan = traffic_plan(shifting);
                let ticks = plan.len();
                for (i, percent) in plan.into_iter().enumerate() {
                    self.shift_traffic(ctx, percent).await?;
                    if i + 1 < ticks {
                        if !shifting.interval.is_zero() {
                            cancellable_sleep(shifting.interval, cancel).await?;
                        }
                        self.health_gate(ctx, shifting.interval, cancel).await?;
                    }
                }
            }
            RolloutStrategy::BlueGreen { blue_retention } => {
                // Green takes no traffic until it proves healthy.
                self.health_gate(ctx, Duration::from_millis(200), cancel).await?;
                self.shift_traffic(ctx, 100.0).await?;
                let retention = chrono::Duration::from_std(*blue_retention)
                    .unwrap_or_else(|_| chrono::Duration::seconds(0));
                ctx.blue_retained_until = Some(self.ports.clock.now() + retention);
            }
        }

        self.staging.promote(&ctx.scope);
        self.registry
            .set_active(&ctx.scope.tenant, &ctx.scope.module, &ctx.version)
            .map_err(|e| StepFailure::new(e.kind(), e.to_string()))?;
        self.ports
            .storage
            .put(
                &format!("tenants/{}/modules/{}", ctx.scope.tenant, ctx.scope.module),
                ctx.version.to_string().into_bytes(),
            )
            .await
            .map_err(|e| StepFailure::new(port_error_kind(&e), e.to_string()))?;
        Ok(())
    }

    /// Post-activation probes: N consecutive passes on all critical
    /// checks.
    async fn step_verify(
        &self,
        ctx: &mut ActivationContext,
        definition: &ModuleDefinition,
        options: &ActivationOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let required = options
            .verification_passes
            .unwrap_or(definition.lifecycle.verification_passes);

        loop {
            if cancel.is_cancelled() {
                return Err(StepFailure::new(
                    ErrorKind::ActivationTimeout,
                    "activation cancelled during verification",
                ));
            }
            let report = match self.health.run_once(&ctx.scope).await {
                // No probes registered for this scope: trivially verified.
                None => return Ok(()),
                Some(report) => report,
            };
            self.emit(
                ctx,
                EventKind::HealthVerdict,
                json!({"status": report.status, "phase": "verify"}),
            );
            match report.status {
                crate::health::HealthStatus::Unhealthy => {
                    return Err(StepFailure::new(
                        ErrorKind::HealthCheckFailed,
                        "critical health check failing during verification",
                    ));
                }
                crate::health::HealthStatus::Healthy
                    if report.critical_consecutive_passes() >= required =>
                {
                    return Ok(());
                }
                _ => cancellable_sleep(Duration::from_millis(100), cancel).await?,
            }
        }
    }

    async fn shift_traffic(
        &self,
        ctx: &mut ActivationContext,
        percent: f64,
    ) -> Result<(), StepFailure> {
        // Traffic increments are monotonically non-decreasing.
        let percent = ctx
            .traffic_trace
            .last()
            .map(|last| percent.max(*last))
            .unwrap_or(percent);

        self.ports
            .router
            .set_weight(&ctx.scope, &ctx.version, percent)
            .await
            .map_err(|e| StepFailure::new(port_error_kind(&e), e.to_string()))?;
        if let Some(prior) = ctx.prior_active.clone() {
            self.ports
                .router
                .set_weight(&ctx.scope, &prior, 100.0 - percent)
                .await
                .map_err(|e| StepFailure::new(port_error_kind(&e), e.to_string()))?;
        }
        ctx.traffic_trace.push(percent);
        self.emit(
            ctx,
            EventKind::TrafficShifted,
            json!({"percent": percent, "version": ctx.version.to_string()}),
        );
        Ok(())
    }

    /// Hold until the scope reports a passing verdict. Degraded waits and
    /// retries; unhealthy fails the step when the trigger is armed.
    async fn health_gate(
        &self,
        ctx: &mut ActivationContext,
        retry_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let delay = retry_delay.max(Duration::from_millis(50));
        loop {
            if cancel.is_cancelled() {
                return Err(StepFailure::new(
                    ErrorKind::ActivationTimeout,
                    "activation cancelled during rollout",
                ));
            }
            let report = match self.health.run_once(&ctx.scope).await {
                // No probes registered: the gate is open.
                None => return Ok(()),
                Some(report) => report,
            };
            self.emit(
                ctx,
                EventKind::HealthVerdict,
                json!({"status": report.status, "phase": "rollout"}),
            );
            match report.status {
                crate::health::HealthStatus::Healthy => return Ok(()),
                crate::health::HealthStatus::Unhealthy => {
                    if self.config.triggers.on_health_check_failure {
                        return Err(StepFailure::new(
                            ErrorKind::HealthCheckFailed,
                            "critical health check failing during rollout",
                        ));
                    }
                    // Trigger disarmed: note it and keep rolling.
                    ctx.warnings
                        .push("unhealthy verdict ignored (trigger disabled)".to_string());
                    return Ok(());
                }
                crate::health::HealthStatus::Degraded => {
                    // +/-10% jitter so parallel activations don't probe in
                    // lockstep.
                    let jitter = 0.9 + self.ports.random.next_f64() * 0.2;
                    cancellable_sleep(delay.mul_f64(jitter), cancel).await?;
                }
            }
        }
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    async fn handle_failure(
        &self,
        ctx: &mut ActivationContext,
        definition: &ModuleDefinition,
        failure: StepFailure,
        auto_rollback: bool,
        options: &ActivationOptions,
    ) -> ActivationReport {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let mut errors = vec![OperationError::new(failure.kind, failure.message.clone())];

        // Validation failures are recoverable: surfaced without state
        // mutation, the context never leaves pending.
        let failed_at_validate = ctx.completed.is_empty()
            && ctx
                .step_log
                .last()
                .map(|record| record.kind == StepKind::Validate)
                .unwrap_or(false);
        if failed_at_validate {
            ctx.state = ActivationState::Pending;
            ctx.finished_at = Some(self.ports.clock.now());
            self.namespaces.audit_trail().record(
                AuditEntryBuilder::new("module.activate")
                    .principal(options.actor.as_deref())
                    .details(json!({
                        "module": ctx.scope.module.as_str(),
                        "version": ctx.version.to_string(),
                    }))
                    .failed(failure.message.clone()),
            );
            return ActivationReport {
                success: false,
                state: ctx.state,
                errors,
                warnings: ctx.warnings.clone(),
                activation: ctx.id,
                traffic_trace: ctx.traffic_trace.clone(),
                duration_ms: duration_ms(ctx.started_at, self.ports.clock.now()),
            };
        }

        ctx.state = ActivationState::Failed;
        self.emit(
            ctx,
            EventKind::Error,
            json!({"kind": failure.kind.as_str(), "message": failure.message}),
        );

        if auto_rollback && self.trigger_armed(failure.kind) {
            let reason = rollback_reason(&failure);
            self.run_rollback(ctx, definition, reason, &mut errors).await;
        }

        ctx.finished_at = Some(self.ports.clock.now());
        self.namespaces.audit_trail().record(
            AuditEntryBuilder::new("module.activate")
                .principal(options.actor.as_deref())
                .details(json!({
                    "module": ctx.scope.module.as_str(),
                    "version": ctx.version.to_string(),
                    "state": ctx.state.as_str(),
                }))
                .failed(failure.message),
        );

        ActivationReport {
            success: false,
            state: ctx.state,
            errors,
            warnings: ctx.warnings.clone(),
            activation: ctx.id,
            traffic_trace: ctx.traffic_trace.clone(),
            duration_ms: duration_ms(ctx.started_at, self.ports.clock.now()),
        }
    }

    fn trigger_armed(&self, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::HealthCheckFailed => self.config.triggers.on_health_check_failure,
            ErrorKind::ActivationTimeout => self.config.triggers.on_activation_timeout,
            _ => self.config.triggers.on_critical_error,
        }
    }

    async fn run_rollback(
        &self,
        ctx: &mut ActivationContext,
        definition: &ModuleDefinition,
        reason: RollbackReason,
        errors: &mut Vec<OperationError>,
    ) {
        ctx.state = ActivationState::RollingBack;
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        self.emit(
            ctx,
            EventKind::RollbackStarted,
            json!({"reason": reason.as_str()}),
        );

        // A step that failed midway may have externally visible partial
        // effects; Register, Migrate and Activate get their undo run too.
        let mut undo_steps = ctx.completed.clone();
        if let Some(last) = ctx.step_log.last() {
            if last.status == StepStatus::Failed
                && matches!(
                    last.kind,
                    StepKind::Register | StepKind::Migrate | StepKind::Activate
                )
            {
                undo_steps.push(last.kind.clone());
            }
        }

        let extensions: Vec<Arc<dyn StepExtension>> = self.extensions.read().clone();
        let result = self
            .rollback
            .execute(
                &ctx.scope,
                &ctx.version,
                definition,
                &undo_steps,
                ctx.prior_active.as_ref(),
                &extensions,
            )
            .await;

        match result {
            Ok(RollbackOutcome::RolledBack) => {
                ctx.state = ActivationState::RolledBack;
                self.emit(ctx, EventKind::RollbackCompleted, json!({"partial": false}));
            }
            Ok(RollbackOutcome::PartiallyRolledBack { failed_steps }) => {
                // Partial rollback is critical; the context stays failed
                // for manual intervention.
                ctx.state = ActivationState::Failed;
                self.emit(
                    ctx,
                    EventKind::RollbackCompleted,
                    json!({"partial": true, "failed_steps": failed_steps}),
                );
                self.emit(
                    ctx,
                    EventKind::Error,
                    json!({"kind": ErrorKind::Critical.as_str(), "message": "partial rollback"}),
                );
                errors.push(OperationError::new(
                    ErrorKind::Critical,
                    format!("rollback only partially completed: {}", failed_steps.join(", ")),
                ));
            }
            Err(e) => {
                ctx.state = ActivationState::Failed;
                self.emit(
                    ctx,
                    EventKind::Error,
                    json!({"kind": ErrorKind::RollbackFailed.as_str(), "message": e.to_string()}),
                );
                errors.push(OperationError::new(ErrorKind::RollbackFailed, e.to_string()));
                errors.push(OperationError::new(
                    ErrorKind::Critical,
                    "manual intervention required",
                ));
            }
        }
    }

    fn emit(&self, ctx: &mut ActivationContext, kind: EventKind, payload: serde_json::Value) {
        self.events.emit(ActivationEvent {
            ts: self.ports.clock.now(),
            module: ctx.scope.module.clone(),
            tenant: ctx.scope.tenant.clone(),
            activation: ctx.id,
            seq: ctx.next_seq(),
            kind,
            payload,
        });
    }

    fn archive(&self, ctx: ActivationContext) {
        let mut history = self.history.write();
        history.push_back(ctx);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }
}

fn rollback_reason(failure: &StepFailure) -> RollbackReason {
    match failure.kind {
        ErrorKind::HealthCheckFailed => RollbackReason::HealthCheckFailure,
        ErrorKind::ActivationTimeout => RollbackReason::ActivationTimeout,
        _ => RollbackReason::CriticalError,
    }
}

fn port_error_kind(error: &PortError) -> ErrorKind {
    match error {
        PortError::NotFound(_) | PortError::Verification(_) => ErrorKind::Validation,
        PortError::Conflict(_) => ErrorKind::ModuleConflict,
        PortError::Transient(_) | PortError::Io(_) => ErrorKind::Critical,
    }
}

fn duration_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

async fn cancellable_sleep(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), StepFailure> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepFailure::new(
            ErrorKind::ActivationTimeout,
            "activation cancelled",
        )),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthChecker, ProbeOutcome, ProbeSpec, ScriptedProbes};
    use crate::module_definition::IntegrationSurface;
    use crate::module_metadata::{DependencySpec, MigrationSpec};
    use crate::ports::{
        DefaultCryptoProvider, MemoryStorage, ModuleArtifact, RecordingMigrationRunner,
        RecordingRouter, StaticLoader, SystemClock, ThreadRandom,
    };
    use crate::rollout::TrafficShifting;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        engine: Arc<ActivationEngine>,
        registry: Arc<ModuleRegistry>,
        router: Arc<RecordingRouter>,
        loader: Arc<StaticLoader>,
        migrations: Arc<RecordingMigrationRunner>,
        probes: Arc<ScriptedProbes>,
        health: Arc<HealthChecker>,
        storage: Arc<MemoryStorage>,
    }

    fn harness() -> Harness {
        harness_with_config(EngineConfig::default())
    }

    fn harness_with_config(config: EngineConfig) -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&clock)));
        let resolver = Arc::new(DependencyResolver::new(Arc::clone(&registry)));
        let probes = Arc::new(ScriptedProbes::new());
        let health = Arc::new(HealthChecker::new(
            Arc::clone(&probes) as Arc<dyn crate::health::ProbeExecutor>,
            Arc::clone(&clock),
        ));
        let namespaces = Arc::new(NamespaceManager::new(
            Arc::new(DefaultCryptoProvider::from_passphrase("engine-tests")),
            Arc::clone(&clock),
        ));
        let loader = Arc::new(StaticLoader::new());
        let storage = Arc::new(MemoryStorage::new());
        let migrations = Arc::new(RecordingMigrationRunner::new());
        let router = Arc::new(RecordingRouter::new());
        let ports = EnginePorts {
            loader: Arc::clone(&loader) as Arc<dyn ModuleLoader>,
            storage: Arc::clone(&storage) as Arc<dyn StorageAdapter>,
            migrations: Arc::clone(&migrations) as Arc<dyn MigrationRunner>,
            router: Arc::clone(&router) as Arc<dyn TrafficRouter>,
            clock,
            random: Arc::new(ThreadRandom),
        };
        let engine = Arc::new(ActivationEngine::new(
            Arc::clone(&registry),
            resolver,
            Arc::clone(&health),
            namespaces,
            ports,
            config,
        ));
        Harness {
            engine,
            registry,
            router,
            loader,
            migrations,
            probes,
            health,
            storage,
        }
    }

    fn install(harness: &Harness, definition: ModuleDefinition) {
        let artifact = ModuleArtifact::new(
            definition.id.clone(),
            definition.version.clone(),
            format!("artifact-{}", definition.id).into_bytes(),
        );
        harness.loader.insert(artifact);
        harness.registry.register(definition).unwrap();
    }

    fn billing(version: &str) -> ModuleDefinition {
        ModuleDefinition::builder("billing", version.parse().unwrap())
            .capability("billing-api", "billing.v1")
            .dependency(DependencySpec::required("auth", "^1".parse().unwrap()))
            .dependency(DependencySpec::required("logger", "^2".parse().unwrap()))
            .integration(IntegrationSurface {
                routes: vec!["/billing".to_string()],
                ..IntegrationSurface::default()
            })
            .build()
    }

    fn install_dependencies(harness: &Harness, tenant: &TenantId) {
        for (id, version) in [("auth", "1.4.0"), ("logger", "2.1.0")] {
            install(
                harness,
                ModuleDefinition::builder(id, version.parse().unwrap()).build(),
            );
            harness
                .registry
                .set_active(tenant, &ModuleId::new(id), &version.parse().unwrap())
                .unwrap();
        }
    }

    fn drain_events(
        rx: &mut tokio::sync::broadcast::Receiver<ActivationEvent>,
    ) -> Vec<ActivationEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn gradual_activation_walks_the_traffic_plan() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install_dependencies(&h, &tenant);
        install(&h, billing("1.2.0"));

        let mut rx = h.engine.subscribe();
        let options = ActivationOptions::with_strategy(RolloutStrategy::Gradual(TrafficShifting {
            initial: 10.0,
            increment: 30.0,
            interval: Duration::from_secs(1),
            max_increment: 100.0,
        }));
        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &"1.2.0".parse().unwrap(),
                &tenant,
                options,
            )
            .await;

        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(report.state, ActivationState::Active);
        assert_eq!(report.traffic_trace, vec![10.0, 40.0, 70.0, 100.0]);

        let scope = ScopeKey::new("billing", "t1");
        let version: Version = "1.2.0".parse().unwrap();
        assert_eq!(h.router.weight(&scope, &version), 100.0);
        assert_eq!(
            h.registry.active_version(&tenant, &ModuleId::new("billing")),
            Some(version.clone())
        );
        // Staged surface got promoted to live.
        assert!(h.engine.staging().live(&scope).is_some());
        assert!(h.engine.staging().staged(&scope).is_none());

        let events = drain_events(&mut rx);
        let shifts = events
            .iter()
            .filter(|e| e.kind == EventKind::TrafficShifted)
            .count();
        assert_eq!(shifts, 4);
        assert_eq!(events.first().map(|e| e.kind), Some(EventKind::BeforeActivate));
        assert_eq!(events.last().map(|e| e.kind), Some(EventKind::AfterActivate));
        // Sequence numbers are monotonic per activation.
        for window in events.windows(2) {
            assert!(window[1].seq > window[0].seq);
        }
        assert_eq!(h.engine.metrics().successes, 1);
    }

    #[tokio::test]
    async fn missing_required_dependency_stays_pending() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install(
            &h,
            ModuleDefinition::builder("reports", "2.0.0".parse().unwrap())
                .dependency(DependencySpec::required("warehouse", "^3".parse().unwrap()))
                .build(),
        );

        let report = h
            .engine
            .activate(
                &ModuleId::new("reports"),
                &"2.0.0".parse().unwrap(),
                &tenant,
                ActivationOptions::default(),
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.state, ActivationState::Pending);
        assert!(report.errors.iter().any(|e| e.kind == ErrorKind::DependencyUnresolved));

        // No registry mutation, no traffic, no staged surface.
        let entry = h
            .registry
            .get_version(&ModuleId::new("reports"), &"2.0.0".parse().unwrap())
            .unwrap();
        assert_eq!(entry.status, crate::module_metadata::ModuleStatus::Installed);
        let scope = ScopeKey::new("reports", "t1");
        assert_eq!(h.router.trace(&scope, &"2.0.0".parse().unwrap()), Vec::<f64>::new());
        assert!(h.engine.staging().staged(&scope).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn health_failure_mid_rollout_rolls_back() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install_dependencies(&h, &tenant);
        let prior: Version = "1.0.0".parse().unwrap();
        let next: Version = "2.0.0".parse().unwrap();
        install(&h, billing("1.0.0"));
        install(&h, billing("2.0.0"));
        h.registry
            .set_active(&tenant, &ModuleId::new("billing"), &prior)
            .unwrap();

        let scope = ScopeKey::new("billing", "t1");
        let mut probe = ProbeSpec::endpoint("svc").critical();
        probe.retries = 0;
        h.health.register(&scope, vec![probe]);
        // Gate after 10%: pass. Gate after 40%: critical failure.
        h.probes.push(&scope, "svc", ProbeOutcome::Pass);
        h.probes
            .set_constant(&scope, "svc", ProbeOutcome::Fail("500s".to_string()));

        let options = ActivationOptions::with_strategy(RolloutStrategy::Gradual(TrafficShifting {
            initial: 10.0,
            increment: 30.0,
            interval: Duration::from_secs(1),
            max_increment: 100.0,
        }));
        let report = h
            .engine
            .activate(&ModuleId::new("billing"), &next, &tenant, options)
            .await;

        assert!(!report.success);
        assert_eq!(report.state, ActivationState::RolledBack);
        assert!(report.errors.iter().any(|e| e.kind == ErrorKind::HealthCheckFailed));

        // Traffic reverted: new at 0, prior back at 100.
        assert_eq!(h.router.weight(&scope, &next), 0.0);
        assert_eq!(h.router.weight(&scope, &prior), 100.0);
        // Registry: attempted version failed, prior untouched and active.
        assert_eq!(
            h.registry.get_version(&ModuleId::new("billing"), &next).unwrap().status,
            crate::module_metadata::ModuleStatus::Failed
        );
        assert_eq!(
            h.registry.active_version(&tenant, &ModuleId::new("billing")),
            Some(prior)
        );
        assert_eq!(h.engine.metrics().rollbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_scope_activation_is_rejected() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install_dependencies(&h, &tenant);
        install(&h, billing("1.2.0"));

        let engine = Arc::clone(&h.engine);
        let slow_tenant = tenant.clone();
        let first = tokio::spawn(async move {
            engine
                .activate(
                    &ModuleId::new("billing"),
                    &"1.2.0".parse().unwrap(),
                    &slow_tenant,
                    ActivationOptions::with_strategy(RolloutStrategy::Gradual(TrafficShifting {
                        initial: 10.0,
                        increment: 45.0,
                        interval: Duration::from_secs(2),
                        max_increment: 100.0,
                    })),
                )
                .await
        });

        // Let the first activation reach its rollout sleep.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let second = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &"1.2.0".parse().unwrap(),
                &tenant,
                ActivationOptions {
                    queue_policy: Some(QueuePolicy::Reject),
                    ..ActivationOptions::default()
                },
            )
            .await;
        assert!(!second.success);
        assert!(second
            .errors
            .iter()
            .any(|e| e.kind == ErrorKind::ActivationInProgress));

        let first = first.await.unwrap();
        assert!(first.success, "errors: {:?}", first.errors);

        // A waiting re-activation of the now-active version is a no-op.
        let third = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &"1.2.0".parse().unwrap(),
                &tenant,
                ActivationOptions::default(),
            )
            .await;
        assert!(third.success);
        assert!(!third.warnings.is_empty());
    }

    #[tokio::test]
    async fn instant_activation_swaps_prior_version_traffic() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install_dependencies(&h, &tenant);
        let prior: Version = "1.0.0".parse().unwrap();
        let next: Version = "1.2.0".parse().unwrap();
        install(&h, billing("1.0.0"));
        install(&h, billing("1.2.0"));
        h.registry
            .set_active(&tenant, &ModuleId::new("billing"), &prior)
            .unwrap();

        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &next,
                &tenant,
                ActivationOptions::with_strategy(RolloutStrategy::Instant),
            )
            .await;

        assert!(report.success);
        assert_eq!(report.traffic_trace, vec![100.0]);
        let scope = ScopeKey::new("billing", "t1");
        assert_eq!(h.router.weight(&scope, &next), 100.0);
        assert_eq!(h.router.weight(&scope, &prior), 0.0);
        assert_eq!(
            h.registry.get_version(&ModuleId::new("billing"), &prior).unwrap().status,
            crate::module_metadata::ModuleStatus::Inactive
        );
        // The persisted tenant pointer followed.
        let pointer = h
            .storage
            .get("tenants/t1/modules/billing")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer, b"1.2.0".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn blue_green_cuts_over_after_health_passes() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install_dependencies(&h, &tenant);
        let prior: Version = "1.0.0".parse().unwrap();
        let next: Version = "2.0.0".parse().unwrap();
        install(&h, billing("1.0.0"));
        install(&h, billing("2.0.0"));
        h.registry
            .set_active(&tenant, &ModuleId::new("billing"), &prior)
            .unwrap();

        let scope = ScopeKey::new("billing", "t1");
        h.health
            .register(&scope, vec![ProbeSpec::endpoint("svc").critical()]);

        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &next,
                &tenant,
                ActivationOptions::with_strategy(RolloutStrategy::BlueGreen {
                    blue_retention: Duration::from_secs(600),
                }),
            )
            .await;

        assert!(report.success, "errors: {:?}", report.errors);
        // Single atomic cutover, no intermediate percentages.
        assert_eq!(report.traffic_trace, vec![100.0]);
        assert_eq!(h.router.weight(&scope, &next), 100.0);
        assert_eq!(h.router.weight(&scope, &prior), 0.0);

        let history = h.engine.history();
        let ctx = history.last().unwrap();
        assert!(ctx.blue_retained_until.is_some());
    }

    #[tokio::test]
    async fn migration_failure_triggers_rollback_with_scripts() {
        let h = harness();
        let tenant = TenantId::new("t1");
        let definition = ModuleDefinition::builder("billing", "1.0.0".parse().unwrap())
            .migration(MigrationSpec::additive("m1").with_rollback("undo-m1"))
            .migration(MigrationSpec::additive("m2"))
            .build();
        install(&h, definition);
        h.migrations.fail_on("m2");

        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &"1.0.0".parse().unwrap(),
                &tenant,
                ActivationOptions::default(),
            )
            .await;

        assert!(!report.success);
        assert_eq!(report.state, ActivationState::RolledBack);
        assert!(report.errors.iter().any(|e| e.kind == ErrorKind::MigrationFailed));
        // The declared rollback script ran; m2 (no script) was not reversed.
        let rolled_back = h.migrations.rolled_back();
        assert_eq!(rolled_back.len(), 1);
        assert_eq!(rolled_back[0].1, "m1");
        // Staged surface was withdrawn.
        assert!(h.engine.staging().staged(&ScopeKey::new("billing", "t1")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_fails_and_rolls_back() {
        struct HangingLoader;
        #[async_trait::async_trait]
        impl ModuleLoader for HangingLoader {
            async fn fetch(
                &self,
                _id: &ModuleId,
                _version: &Version,
            ) -> Result<ModuleArtifact, PortError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(PortError::NotFound("never".to_string()))
            }
        }

        let mut h = harness_with_config(EngineConfig {
            step_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        });
        // Swap in a loader that never returns.
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Arc::clone(&h.registry);
        let resolver = Arc::new(DependencyResolver::new(Arc::clone(&registry)));
        let namespaces = Arc::new(NamespaceManager::new(
            Arc::new(DefaultCryptoProvider::from_passphrase("engine-tests")),
            Arc::clone(&clock),
        ));
        let ports = EnginePorts {
            loader: Arc::new(HangingLoader),
            storage: Arc::new(MemoryStorage::new()),
            migrations: Arc::new(RecordingMigrationRunner::new()),
            router: Arc::clone(&h.router) as Arc<dyn TrafficRouter>,
            clock,
            random: Arc::new(ThreadRandom),
        };
        h.engine = Arc::new(ActivationEngine::new(
            registry,
            resolver,
            Arc::clone(&h.health),
            namespaces,
            ports,
            EngineConfig {
                step_timeout: Duration::from_secs(5),
                ..EngineConfig::default()
            },
        ));

        let tenant = TenantId::new("t1");
        install(&h, ModuleDefinition::builder("billing", "1.0.0".parse().unwrap()).build());

        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &"1.0.0".parse().unwrap(),
                &tenant,
                ActivationOptions::default(),
            )
            .await;

        assert!(!report.success);
        assert!(report.errors.iter().any(|e| e.kind == ErrorKind::ActivationTimeout));
        assert_eq!(report.state, ActivationState::RolledBack);
    }

    #[tokio::test]
    async fn deactivate_withdraws_traffic_and_status() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install_dependencies(&h, &tenant);
        install(&h, billing("1.2.0"));

        let version: Version = "1.2.0".parse().unwrap();
        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &version,
                &tenant,
                ActivationOptions::with_strategy(RolloutStrategy::Instant),
            )
            .await;
        assert!(report.success);

        let result = h.engine.deactivate(&ModuleId::new("billing"), &tenant, None).await;
        assert!(result.success);
        assert_eq!(result.state.as_deref(), Some("inactive"));

        let scope = ScopeKey::new("billing", "t1");
        assert_eq!(h.router.weight(&scope, &version), 0.0);
        assert_eq!(h.registry.active_version(&tenant, &ModuleId::new("billing")), None);
        assert!(h.engine.staging().live(&scope).is_none());
        assert_eq!(
            h.registry.get_version(&ModuleId::new("billing"), &version).unwrap().status,
            crate::module_metadata::ModuleStatus::Inactive
        );

        // Deactivating again reports a validation failure.
        let again = h.engine.deactivate(&ModuleId::new("billing"), &tenant, None).await;
        assert!(!again.success);
    }

    #[tokio::test]
    async fn custom_extension_runs_after_its_anchor() {
        use parking_lot::Mutex as SyncMutex;

        struct OrderProbe {
            log: Arc<SyncMutex<Vec<String>>>,
        }
        #[async_trait::async_trait]
        impl StepExtension for OrderProbe {
            fn name(&self) -> &str {
                "prime-cache"
            }
            fn after(&self) -> StepKind {
                StepKind::Warm
            }
            async fn run(&self, _scope: &ScopeKey) -> Result<(), String> {
                self.log.lock().push("prime-cache".to_string());
                Ok(())
            }
            async fn undo(&self, _scope: &ScopeKey) -> Result<(), String> {
                Ok(())
            }
        }

        let h = harness();
        let tenant = TenantId::new("t1");
        install(&h, ModuleDefinition::builder("billing", "1.0.0".parse().unwrap()).build());

        let log = Arc::new(SyncMutex::new(Vec::new()));
        h.engine.register_extension(Arc::new(OrderProbe { log: Arc::clone(&log) }));

        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &"1.0.0".parse().unwrap(),
                &tenant,
                ActivationOptions::default(),
            )
            .await;
        assert!(report.success);
        assert_eq!(log.lock().as_slice(), &["prime-cache".to_string()]);

        let history = h.engine.history();
        let ctx = history.last().unwrap();
        let warm_pos = ctx.completed.iter().position(|s| *s == StepKind::Warm).unwrap();
        let custom_pos = ctx
            .completed
            .iter()
            .position(|s| *s == StepKind::Custom("prime-cache".to_string()))
            .unwrap();
        let activate_pos = ctx.completed.iter().position(|s| *s == StepKind::Activate).unwrap();
        assert!(warm_pos < custom_pos && custom_pos < activate_pos);
    }

    #[tokio::test]
    async fn different_scopes_activate_in_parallel() {
        let h = harness();
        install(&h, ModuleDefinition::builder("billing", "1.0.0".parse().unwrap()).build());
        install(&h, ModuleDefinition::builder("reports", "1.0.0".parse().unwrap()).build());

        let engine_a = Arc::clone(&h.engine);
        let engine_b = Arc::clone(&h.engine);
        let billing_id = ModuleId::new("billing");
        let billing_version: semver::Version = "1.0.0".parse().unwrap();
        let tenant_t1 = TenantId::new("t1");
        let reports_id = ModuleId::new("reports");
        let reports_version: semver::Version = "1.0.0".parse().unwrap();
        let tenant_t2 = TenantId::new("t2");
        let (a, b) = tokio::join!(
            engine_a.activate(
                &billing_id,
                &billing_version,
                &tenant_t1,
                ActivationOptions::default(),
            ),
            engine_b.activate(
                &reports_id,
                &reports_version,
                &tenant_t2,
                ActivationOptions::default(),
            ),
        );
        assert!(a.success, "errors: {:?}", a.errors);
        assert!(b.success, "errors: {:?}", b.errors);
        assert_eq!(h.engine.metrics().successes, 2);
    }

    #[tokio::test]
    async fn runtime_error_rate_trigger_reverts_to_prior_version() {
        let h = harness_with_config(EngineConfig {
            triggers: RollbackTriggers {
                error_rate_threshold: Some(0.05),
                ..RollbackTriggers::default()
            },
            ..EngineConfig::default()
        });
        let tenant = TenantId::new("t1");
        install_dependencies(&h, &tenant);
        let v1: Version = "1.0.0".parse().unwrap();
        let v2: Version = "2.0.0".parse().unwrap();
        install(&h, billing("1.0.0"));
        install(&h, billing("2.0.0"));

        for version in [&v1, &v2] {
            let report = h
                .engine
                .activate(
                    &ModuleId::new("billing"),
                    version,
                    &tenant,
                    ActivationOptions::with_strategy(RolloutStrategy::Instant),
                )
                .await;
            assert!(report.success, "errors: {:?}", report.errors);
        }
        let scope = ScopeKey::new("billing", "t1");
        assert_eq!(h.router.weight(&scope, &v2), 100.0);

        // Below threshold: nothing happens.
        let quiet = h
            .engine
            .report_runtime_metrics(&ModuleId::new("billing"), &tenant, 0.01, 40)
            .await;
        assert!(quiet.success);
        assert_eq!(
            h.registry.active_version(&tenant, &ModuleId::new("billing")),
            Some(v2.clone())
        );

        // Above threshold: traffic and registry revert to v1.
        let fired = h
            .engine
            .report_runtime_metrics(&ModuleId::new("billing"), &tenant, 0.20, 40)
            .await;
        assert!(fired.success, "errors: {:?}", fired.errors);
        assert_eq!(fired.state.as_deref(), Some("rolled_back"));
        assert_eq!(h.router.weight(&scope, &v2), 0.0);
        assert_eq!(h.router.weight(&scope, &v1), 100.0);
        assert_eq!(
            h.registry.active_version(&tenant, &ModuleId::new("billing")),
            Some(v1)
        );
        assert_eq!(
            h.registry.get_version(&ModuleId::new("billing"), &v2).unwrap().status,
            crate::module_metadata::ModuleStatus::Failed
        );
    }

    #[tokio::test]
    async fn uninstall_tears_down_namespaces() {
        let h = harness();
        let tenant = TenantId::new("t1");
        install(&h, ModuleDefinition::builder("billing", "1.0.0".parse().unwrap()).build());

        let report = h
            .engine
            .activate(
                &ModuleId::new("billing"),
                &"1.0.0".parse().unwrap(),
                &tenant,
                ActivationOptions::default(),
            )
            .await;
        assert!(report.success);

        // Cannot uninstall while active.
        let blocked = h
            .engine
            .uninstall(&ModuleId::new("billing"), &"1.0.0".parse().unwrap())
            .await;
        assert!(!blocked.success);

        h.engine.deactivate(&ModuleId::new("billing"), &tenant, None).await;
        let removed = h
            .engine
            .uninstall(&ModuleId::new("billing"), &"1.0.0".parse().unwrap())
            .await;
        assert!(removed.success);
        assert!(h.registry.get(&ModuleId::new("billing")).is_none());
    }
}
