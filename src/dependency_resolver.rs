// Dependency resolution over the module registry.
//
// Produces a fully satisfied provider set for a module's dependency
// closure. A depth-first walk selects the best provider per dependency
// (status, declared priority, then highest semver), detects circular and
// version conflicts, and proposes resolution candidates whose automatic
// application depends on the configured strategy. Results are cached per
// (module, dependency-set hash, strategy) with a TTL and are invalidated
// wholesale whenever the registry changes.

use log::debug;
use parking_lot::Mutex;
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, OperationError};
use crate::module_definition::ModuleDefinition;
use crate::module_metadata::{DependencyKind, DependencySpec, ModuleId, ModuleStatus, TenantId};
use crate::registry::ModuleRegistry;

/// How aggressively version conflicts are auto-resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Only exclude/replace optional dependencies automatically
    Conservative,
    /// Additionally merge within the same major version
    Balanced,
    /// Upgrades and downgrades may shift pinned versions
    Aggressive,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Conservative => "conservative",
            ResolutionStrategy::Balanced => "balanced",
            ResolutionStrategy::Aggressive => "aggressive",
        }
    }
}

/// Resolver tuning knobs.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Maximum recursion depth into transitive dependencies
    pub max_depth: usize,
    /// Overall resolution deadline
    pub timeout: Duration,
    /// How long cached resolutions stay valid
    pub cache_ttl: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            timeout: Duration::from_secs(30),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// A selected provider in the resolution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProvider {
    pub id: ModuleId,
    pub version: Version,
    pub kind: DependencyKind,
    pub status: ModuleStatus,
    /// Distance from the root module (direct deps = 1)
    pub depth: usize,
    pub requested_by: ModuleId,
}

/// A dependency no provider satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedDependency {
    pub id: ModuleId,
    pub constraint: String,
    pub kind: DependencyKind,
    pub requested_by: ModuleId,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Circular,
    Version,
}

/// A possible way out of a conflict, with a confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    Upgrade,
    Downgrade,
    Replace,
    Exclude,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionCandidate {
    pub action: ConflictAction,
    pub confidence: f64,
    pub description: String,
    /// Whether the strategy auto-applied this candidate
    pub applied: bool,
}

/// A detected conflict with its candidate resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConflict {
    pub kind: ConflictKind,
    pub module: ModuleId,
    pub description: String,
    /// Requirement chain for circular conflicts
    pub chain: Vec<ModuleId>,
    pub candidates: Vec<ResolutionCandidate>,
    /// Fatal conflicts fail the resolution
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionMetadata {
    pub strategy: ResolutionStrategy,
    pub max_depth_reached: usize,
    pub duration_ms: u64,
    pub cache_hit: bool,
}

/// Complete result of a resolution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub success: bool,
    pub resolved: Vec<ResolvedProvider>,
    pub unresolved: Vec<UnresolvedDependency>,
    pub conflicts: Vec<DependencyConflict>,
    pub warnings: Vec<String>,
    pub errors: Vec<OperationError>,
    pub metadata: ResolutionMetadata,
}

impl ResolutionOutcome {
    /// Unresolved dependencies are always required ones; optional and
    /// peer misses surface as warnings.
    pub fn required_unresolved(&self) -> impl Iterator<Item = &UnresolvedDependency> {
        self.unresolved.iter()
    }
}

#[derive(Clone)]
struct SelectedDep {
    version: Version,
    constraint: semver::VersionReq,
    kind: DependencyKind,
}

struct WalkState {
    resolved: Vec<ResolvedProvider>,
    unresolved: Vec<UnresolvedDependency>,
    conflicts: Vec<DependencyConflict>,
    warnings: Vec<String>,
    selected: HashMap<ModuleId, SelectedDep>,
    visiting: Vec<ModuleId>,
    max_depth_reached: usize,
    timed_out: bool,
}

struct CachedResolution {
    outcome: ResolutionOutcome,
    inserted_at: Instant,
    generation: u64,
}

/// Resolves module dependency closures against the registry.
pub struct DependencyResolver {
    registry: Arc<ModuleRegistry>,
    config: ResolverConfig,
    cache: Mutex<HashMap<(ModuleId, String, ResolutionStrategy), CachedResolution>>,
}

impl DependencyResolver {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self::with_config(registry, ResolverConfig::default())
    }

    pub fn with_config(registry: Arc<ModuleRegistry>, config: ResolverConfig) -> Self {
        Self {
            registry,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the dependency closure of `definition` for a tenant scope.
    pub fn resolve(
        &self,
        definition: &ModuleDefinition,
        tenant: &TenantId,
        strategy: ResolutionStrategy,
    ) -> ResolutionOutcome {
        let cache_key = (
            definition.id.clone(),
            dependency_set_hash(&definition.dependencies),
            strategy,
        );
        let generation = self.registry.generation();

        if let Some(cached) = self.cache.lock().get(&cache_key) {
            if cached.generation == generation
                && cached.inserted_at.elapsed() < self.config.cache_ttl
            {
                debug!("resolution cache hit for {}", definition.id);
                let mut outcome = cached.outcome.clone();
                outcome.metadata.cache_hit = true;
                return outcome;
            }
        }

        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut state = WalkState {
            resolved: Vec::new(),
            unresolved: Vec::new(),
            conflicts: Vec::new(),
            warnings: Vec::new(),
            selected: HashMap::new(),
            visiting: vec![definition.id.clone()],
            max_depth_reached: 0,
            timed_out: false,
        };

        self.walk(
            &definition.dependencies,
            &definition.id,
            1,
            tenant,
            strategy,
            deadline,
            &mut state,
        );

        let mut errors = Vec::new();
        for unresolved in &state.unresolved {
            errors.push(OperationError::new(
                ErrorKind::DependencyUnresolved,
                format!(
                    "required dependency {} ({}) has no provider: {}",
                    unresolved.id, unresolved.constraint, unresolved.reason
                ),
            ));
        }
        for conflict in state.conflicts.iter().filter(|c| c.fatal) {
            errors.push(OperationError::new(
                ErrorKind::DependencyConflict,
                conflict.description.clone(),
            ));
        }
        if state.timed_out {
            errors.push(OperationError::new(
                ErrorKind::ActivationTimeout,
                "dependency resolution timed out",
            ));
        }

        let success = errors.is_empty();
        let outcome = ResolutionOutcome {
            success,
            resolved: state.resolved,
            unresolved: state.unresolved,
            conflicts: state.conflicts,
            warnings: state.warnings,
            errors,
            metadata: ResolutionMetadata {
                strategy,
                max_depth_reached: state.max_depth_reached,
                duration_ms: started.elapsed().as_millis() as u64,
                cache_hit: false,
            },
        };

        // Timed-out resolutions never write a partial cache entry.
        if !state.timed_out {
            self.cache.lock().insert(
                cache_key,
                CachedResolution {
                    outcome: outcome.clone(),
                    inserted_at: Instant::now(),
                    generation,
                },
            );
        }

        outcome
    }

    pub fn invalidate_all(&self) {
        self.cache.lock().clear();
    }

    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        deps: &[DependencySpec],
        requester: &ModuleId,
        depth: usize,
        tenant: &TenantId,
        strategy: ResolutionStrategy,
        deadline: Instant,
        state: &mut WalkState,
    ) {
        state.max_depth_reached = state.max_depth_reached.max(depth);

        for dep in deps {
            if Instant::now() >= deadline {
                state.timed_out = true;
                return;
            }

            if depth > self.config.max_depth {
                state.warnings.push(format!(
                    "dependency {} of {} skipped: max depth {} reached",
                    dep.id, requester, self.config.max_depth
                ));
                continue;
            }

            // Re-entering a module on the current walk path is a cycle.
            if state.visiting.contains(&dep.id) {
                let start = state
                    .visiting
                    .iter()
                    .position(|m| m == &dep.id)
                    .unwrap_or(0);
                let mut chain: Vec<ModuleId> = state.visiting[start..].to_vec();
                chain.push(dep.id.clone());
                let description = format!(
                    "circular dependency: {}",
                    chain
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                );
                state.conflicts.push(DependencyConflict {
                    kind: ConflictKind::Circular,
                    module: dep.id.clone(),
                    description,
                    chain,
                    candidates: vec![ResolutionCandidate {
                        action: ConflictAction::Exclude,
                        confidence: if dep.kind == DependencyKind::Optional { 0.6 } else { 0.2 },
                        description: format!("exclude {} from the closure", dep.id),
                        applied: false,
                    }],
                    fatal: true,
                });
                continue;
            }

            if dep.kind == DependencyKind::Peer {
                self.resolve_peer(dep, requester, depth, tenant, state);
                continue;
            }

            // An already-selected provider that still satisfies this
            // constraint is simply reused.
            if let Some(selected) = state.selected.get(&dep.id) {
                if dep.constraint.matches(&selected.version) {
                    continue;
                }
                let selected = selected.clone();
                self.record_version_conflict(dep, requester, &selected, strategy, state);
                continue;
            }

            let candidate = self.best_provider(dep);
            let entry = match candidate {
                Some(entry) => entry,
                None => {
                    let reason = if self.registry.versions_of(&dep.id).is_empty() {
                        "no provider installed".to_string()
                    } else {
                        "no installed version satisfies the constraint".to_string()
                    };
                    // Only required dependencies land in `unresolved`;
                    // a missing optional dependency is a warning.
                    if dep.kind == DependencyKind::Required {
                        state.unresolved.push(UnresolvedDependency {
                            id: dep.id.clone(),
                            constraint: dep.constraint.to_string(),
                            kind: dep.kind,
                            requested_by: requester.clone(),
                            reason,
                        });
                    } else {
                        state
                            .warnings
                            .push(format!("optional dependency {} unresolved: {}", dep.id, reason));
                    }
                    continue;
                }
            };

            state.selected.insert(
                dep.id.clone(),
                SelectedDep {
                    version: entry.version().clone(),
                    constraint: dep.constraint.clone(),
                    kind: dep.kind,
                },
            );
            state.resolved.push(ResolvedProvider {
                id: dep.id.clone(),
                version: entry.version().clone(),
                kind: dep.kind,
                status: entry.status,
                depth,
                requested_by: requester.clone(),
            });

            // Recurse into the provider's own dependencies.
            state.visiting.push(dep.id.clone());
            self.walk(
                &entry.definition.dependencies,
                &dep.id,
                depth + 1,
                tenant,
                strategy,
                deadline,
                state,
            );
            state.visiting.pop();
        }
    }

    /// Peer dependencies must be co-resident in the tenant scope with a
    /// compatible version.
    fn resolve_peer(
        &self,
        dep: &DependencySpec,
        requester: &ModuleId,
        depth: usize,
        tenant: &TenantId,
        state: &mut WalkState,
    ) {
        match self.registry.active_version(tenant, &dep.id) {
            Some(version) if dep.constraint.matches(&version) => {
                state.resolved.push(ResolvedProvider {
                    id: dep.id.clone(),
                    version,
                    kind: DependencyKind::Peer,
                    status: ModuleStatus::Active,
                    depth,
                    requested_by: requester.clone(),
                });
            }
            Some(version) => {
                state.conflicts.push(DependencyConflict {
                    kind: ConflictKind::Version,
                    module: dep.id.clone(),
                    description: format!(
                        "peer dependency {} requires {} but tenant runs {}",
                        dep.id, dep.constraint, version
                    ),
                    chain: vec![requester.clone(), dep.id.clone()],
                    candidates: vec![ResolutionCandidate {
                        action: ConflictAction::Upgrade,
                        confidence: 0.5,
                        description: format!("upgrade the co-resident {} to satisfy {}", dep.id, dep.constraint),
                        applied: false,
                    }],
                    fatal: true,
                });
            }
            None => {
                state.warnings.push(format!(
                    "peer dependency {} is not active in the tenant scope",
                    dep.id
                ));
            }
        }
    }

    /// Candidate providers ranked by (status, declared priority, semver).
    fn best_provider(&self, dep: &DependencySpec) -> Option<crate::registry::RegistryEntry> {
        let mut candidates: Vec<_> = self
            .registry
            .versions_of(&dep.id)
            .into_iter()
            .filter(|entry| entry.status.is_resolvable() && dep.constraint.matches(entry.version()))
            .collect();
        candidates.sort_by(|a, b| {
            b.status
                .provider_rank()
                .cmp(&a.status.provider_rank())
                .then_with(|| {
                    b.definition
                        .provider_priority
                        .cmp(&a.definition.provider_priority)
                })
                .then_with(|| b.version().cmp(a.version()))
        });
        candidates.into_iter().next()
    }

    /// Two different selected versions for the same module id.
    fn record_version_conflict(
        &self,
        dep: &DependencySpec,
        requester: &ModuleId,
        selected: &SelectedDep,
        strategy: ResolutionStrategy,
        state: &mut WalkState,
    ) {
        let newly_chosen = self
            .best_provider(dep)
            .map(|entry| entry.version().clone());

        // A version satisfying both constraints, when one exists.
        let merge_pick = self
            .registry
            .versions_of(&dep.id)
            .into_iter()
            .filter(|entry| {
                entry.status.is_resolvable()
                    && dep.constraint.matches(entry.version())
                    && selected.constraint.matches(entry.version())
            })
            .map(|entry| entry.version().clone())
            .max();

        let description = format!(
            "version conflict on {}: {} selected, {} requires {}",
            dep.id, selected.version, requester, dep.constraint
        );

        let mut candidates = Vec::new();
        let mut applied_version: Option<Version> = None;
        let mut fatal = true;

        if let Some(merge_version) = merge_pick.clone() {
            let same_major = merge_version.major == selected.version.major;
            let apply_merge = match strategy {
                ResolutionStrategy::Conservative => false,
                ResolutionStrategy::Balanced => same_major,
                ResolutionStrategy::Aggressive => true,
            };
            if apply_merge {
                applied_version = Some(merge_version.clone());
                fatal = false;
            }
            candidates.push(ResolutionCandidate {
                action: ConflictAction::Merge,
                confidence: if same_major { 0.9 } else { 0.6 },
                description: format!("use {} which satisfies both constraints", merge_version),
                applied: apply_merge,
            });
        }

        if let Some(chosen) = newly_chosen.clone() {
            let upgrade = chosen > selected.version;
            let action = if upgrade { ConflictAction::Upgrade } else { ConflictAction::Downgrade };
            let apply_shift = applied_version.is_none()
                && strategy == ResolutionStrategy::Aggressive;
            if apply_shift {
                applied_version = Some(chosen.clone());
                fatal = false;
            }
            candidates.push(ResolutionCandidate {
                action,
                confidence: if upgrade { 0.5 } else { 0.4 },
                description: format!("shift pinned {} to {}", dep.id, chosen),
                applied: apply_shift,
            });
        }

        if dep.kind == DependencyKind::Optional {
            let apply_exclude = applied_version.is_none();
            if apply_exclude {
                // Keep the prior selection, drop the optional re-request.
                fatal = false;
                state.warnings.push(format!(
                    "optional dependency {} of {} excluded to resolve a version conflict",
                    dep.id, requester
                ));
            }
            candidates.push(ResolutionCandidate {
                action: ConflictAction::Exclude,
                confidence: 0.9,
                description: format!("exclude optional {} requested by {}", dep.id, requester),
                applied: apply_exclude,
            });
        } else if selected.kind == DependencyKind::Optional {
            // The prior optional selection can be replaced outright.
            if let Some(chosen) = newly_chosen {
                let apply_replace = applied_version.is_none();
                if apply_replace {
                    applied_version = Some(chosen.clone());
                    fatal = false;
                }
                candidates.push(ResolutionCandidate {
                    action: ConflictAction::Replace,
                    confidence: 0.6,
                    description: format!("replace optional selection with {}", chosen),
                    applied: apply_replace,
                });
            }
        }

        if let Some(version) = applied_version {
            if let Some(entry) = state.selected.get_mut(&dep.id) {
                entry.version = version.clone();
            }
            for provider in state.resolved.iter_mut().filter(|p| p.id == dep.id) {
                provider.version = version.clone();
            }
        }

        state.conflicts.push(DependencyConflict {
            kind: ConflictKind::Version,
            module: dep.id.clone(),
            description,
            chain: vec![requester.clone(), dep.id.clone()],
            candidates,
            fatal,
        });
    }
}

/// Stable hash of a dependency set, used as the cache key component.
fn dependency_set_hash(deps: &[DependencySpec]) -> String {
    let mut hasher = Sha256::new();
    for dep in deps {
        hasher.update(dep.id.as_str().as_bytes());
        hasher.update(dep.constraint.to_string().as_bytes());
        hasher.update(dep.kind.as_str().as_bytes());
    }
    hex::encode(hasher.finalize())
}
