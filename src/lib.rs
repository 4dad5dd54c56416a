pub mod access_control;
pub mod activation;
pub mod audit;
pub mod config_store;
pub mod dependency_resolver;
pub mod error;
pub mod events;
pub mod health;
pub mod module_definition;
pub mod module_metadata;
pub mod namespace;
pub mod ports;
pub mod registry;
pub mod rollback;
pub mod rollout;
pub mod steps;

pub use module_metadata::{
    ActivationId, CapabilityId, DependencyKind, DependencySpec, LifecyclePolicy, MigrationSpec,
    ModuleId, ModulePermissions, ModuleStatus, ResourceQuotas, ScopeKey, TenantId,
};

pub use module_definition::{
    Capability, ConfigSchema, DefinitionParser, DefinitionValidator, FieldKind, FieldSchema,
    IntegrationSurface, ModuleDefinition, ModuleDefinitionBuilder,
};

pub use registry::{
    ListFilter,             // Query filter for list()
    ModuleRegistry,         // The authoritative module catalog
    RegistryEntry,          // One (id, version) entry
    RegistryError,          // Catalog errors
    RegistryEvent,          // Registered/unregistered/status changes
    StatusChange,           // Recorded status transition
};

pub use dependency_resolver::{
    ConflictAction,         // Upgrade/downgrade/replace/exclude/merge
    ConflictKind,           // Circular or version
    DependencyConflict,     // Detected conflict with candidates
    DependencyResolver,     // The resolver itself
    ResolutionOutcome,      // Full resolution result
    ResolutionStrategy,     // Conservative/balanced/aggressive
    ResolvedProvider,       // Selected provider
    ResolverConfig,         // Depth/timeout/TTL knobs
    UnresolvedDependency,   // Dependency without a provider
};

pub use activation::{
    ActivationContext,      // Per-attempt state, archived to history
    ActivationEngine,       // The orchestrator
    ActivationOptions,      // Per-call knobs
    ActivationReport,       // Structured activation result
    ActivationState,        // The state machine states
    EngineConfig,           // Engine-level configuration
    EngineMetrics,          // Attempt/success/failure counters
    EnginePorts,            // Injected collaborator bundle
    QueuePolicy,            // Wait or reject on contention
};

pub use rollout::{traffic_plan, RolloutStrategy, TrafficShifting};

pub use health::{
    HealthChecker, HealthReport, HealthStatus, ProbeExecutor, ProbeKind, ProbeOutcome,
    ProbeReport, ProbeSpec, ScriptedProbes,
};

pub use rollback::{
    RollbackController, RollbackError, RollbackOutcome, RollbackReason, RollbackTriggers,
};

pub use namespace::{
    ImportReport,           // Partial-success import result
    InheritanceConfig,      // Enabled/strategy/sources/cascading
    InheritanceSource,      // One source with priority and key filters
    InheritanceStrategy,    // Merge/override/additive/strict
    NamespaceExport,        // Config tree + HMAC checksum
    NamespaceId,            // Namespace identifier
    NamespaceManager,       // The hierarchical config manager
    NamespaceMetrics,       // Usage counters
    NamespaceNode,          // Tree node
    NamespaceOptions,       // Creation options
    NamespaceStatus,        // Active/suspended
    NamespaceUpdate,        // Partial update
};

pub use config_store::{
    ConfigError, ConfigStore, IsolationConfig, IsolationLevel, ResourceLimits, SandboxConfig,
};

pub use access_control::{
    AccessCondition, AccessControl, AccessDecision, AccessRule, Effect, NamespaceOp, Permission,
    Principal, PrincipalKind,
};

pub use audit::{AuditEntry, AuditEntryBuilder, AuditTrail};

pub use events::{ActivationEvent, EventBus, EventKind};

pub use steps::{
    QuotaLedger, StagingArea, StepExtension, StepFailure, StepKind, StepRecord, StepStatus,
};

pub use error::{ErrorKind, OperationError, OperationReport};

pub use ports::{
    AuditSink, Clock, CryptoProvider, DefaultCryptoProvider, FileStorage, IdentityProvider,
    ManualClock, MemoryAuditSink, MemoryStorage, MigrationRunner, ModuleArtifact, ModuleLoader,
    PortError, RandomSource, RecordingMigrationRunner, RecordingRouter, SeededRandom,
    StaticIdentityProvider, StaticLoader, StorageAdapter, SystemClock, ThreadRandom,
    TrafficRouter,
};
