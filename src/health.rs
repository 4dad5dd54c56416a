// Periodic health probing per module/tenant pair.
//
// Probes run through an injected executor so hosts decide what "endpoint"
// or "database" actually means; the checker owns scheduling, timeout and
// retry handling, and aggregates probe results into a per-scope verdict:
// any critical probe failing -> unhealthy, any non-critical failing ->
// degraded, otherwise healthy. Consumers poll `status` or subscribe to a
// watch channel; a background driver reruns probes on their intervals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::module_metadata::ScopeKey;
use crate::ports::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Endpoint,
    Database,
    Service,
    Custom,
}

/// Specification of a single health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub id: String,
    pub kind: ProbeKind,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// How often the background driver reruns this probe
    pub interval: Duration,
    /// Additional attempts after a failure
    pub retries: u32,
    /// Critical probes flip the aggregate to unhealthy
    pub critical: bool,
}

impl ProbeSpec {
    pub fn endpoint(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ProbeKind::Endpoint,
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(30),
            retries: 1,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Pass,
    Fail(String),
}

/// Executes probes. Injected so tests can script verdict sequences.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn execute(&self, scope: &ScopeKey, probe: &ProbeSpec) -> ProbeOutcome;
}

/// Test executor with per-probe scripted outcome queues; unscripted
/// probes pass.
#[derive(Default)]
pub struct ScriptedProbes {
    queues: Mutex<HashMap<(ScopeKey, String), VecDeque<ProbeOutcome>>>,
    constants: Mutex<HashMap<(ScopeKey, String), ProbeOutcome>>,
}

impl ScriptedProbes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes consumed one per attempt.
    pub fn push(&self, scope: &ScopeKey, probe_id: &str, outcome: ProbeOutcome) {
        self.queues
            .lock()
            .entry((scope.clone(), probe_id.to_string()))
            .or_default()
            .push_back(outcome);
    }

    /// Fixed outcome returned once the queue is exhausted.
    pub fn set_constant(&self, scope: &ScopeKey, probe_id: &str, outcome: ProbeOutcome) {
        self.constants
            .lock()
            .insert((scope.clone(), probe_id.to_string()), outcome);
    }
}

#[async_trait]
impl ProbeExecutor for ScriptedProbes {
    async fn execute(&self, scope: &ScopeKey, probe: &ProbeSpec) -> ProbeOutcome {
        let key = (scope.clone(), probe.id.clone());
        if let Some(outcome) = self.queues.lock().get_mut(&key).and_then(|q| q.pop_front()) {
            return outcome;
        }
        self.constants
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or(ProbeOutcome::Pass)
    }
}

/// Aggregate verdict for a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// The rollout gate only advances on a passing verdict.
    pub fn is_passing(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

/// Latest state of one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub id: String,
    pub critical: bool,
    pub passing: bool,
    pub consecutive_passes: u32,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregated report for a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub scope: ScopeKey,
    pub status: HealthStatus,
    pub probes: Vec<ProbeReport>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    fn empty(scope: ScopeKey, now: DateTime<Utc>) -> Self {
        Self {
            scope,
            status: HealthStatus::Healthy,
            probes: Vec::new(),
            checked_at: now,
        }
    }

    /// Minimum consecutive passes across critical probes (all probes when
    /// none are critical).
    pub fn critical_consecutive_passes(&self) -> u32 {
        let critical_min = self
            .probes
            .iter()
            .filter(|p| p.critical)
            .map(|p| p.consecutive_passes)
            .min();
        critical_min.unwrap_or_else(|| {
            self.probes
                .iter()
                .map(|p| p.consecutive_passes)
                .min()
                .unwrap_or(u32::MAX)
        })
    }
}

struct ScopeHealth {
    probes: Vec<ProbeSpec>,
    report: HealthReport,
    /// probe id -> (consecutive passes, consecutive failures)
    streaks: HashMap<String, (u32, u32)>,
    tx: watch::Sender<HealthReport>,
    cancel: CancellationToken,
}

/// Periodic probe executor and verdict aggregator.
pub struct HealthChecker {
    executor: Arc<dyn ProbeExecutor>,
    clock: Arc<dyn Clock>,
    scopes: RwLock<HashMap<ScopeKey, ScopeHealth>>,
}

impl HealthChecker {
    pub fn new(executor: Arc<dyn ProbeExecutor>, clock: Arc<dyn Clock>) -> Self {
        Self {
            executor,
            clock,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the probe set for a scope.
    pub fn register(&self, scope: &ScopeKey, probes: Vec<ProbeSpec>) {
        let now = self.clock.now();
        let report = HealthReport::empty(scope.clone(), now);
        let (tx, _) = watch::channel(report.clone());
        let mut scopes = self.scopes.write();
        if let Some(old) = scopes.insert(
            scope.clone(),
            ScopeHealth {
                probes,
                report,
                streaks: HashMap::new(),
                tx,
                cancel: CancellationToken::new(),
            },
        ) {
            old.cancel.cancel();
        }
    }

    /// Remove a scope and stop its background driver.
    pub fn unregister(&self, scope: &ScopeKey) {
        if let Some(state) = self.scopes.write().remove(scope) {
            state.cancel.cancel();
        }
    }

    pub fn status(&self, scope: &ScopeKey) -> Option<HealthReport> {
        self.scopes.read().get(scope).map(|s| s.report.clone())
    }

    pub fn subscribe(&self, scope: &ScopeKey) -> Option<watch::Receiver<HealthReport>> {
        self.scopes.read().get(scope).map(|s| s.tx.subscribe())
    }

    /// Run every registered probe for the scope once and publish the
    /// aggregated report.
    pub async fn run_once(&self, scope: &ScopeKey) -> Option<HealthReport> {
        let probes = self.scopes.read().get(scope)?.probes.clone();

        let mut outcomes = Vec::with_capacity(probes.len());
        for probe in &probes {
            outcomes.push((probe.id.clone(), self.run_probe(scope, probe).await));
        }

        let now = self.clock.now();
        let mut scopes = self.scopes.write();
        let state = scopes.get_mut(scope)?;

        let mut reports = Vec::with_capacity(probes.len());
        for (probe, (id, outcome)) in probes.iter().zip(outcomes) {
            let streak = state.streaks.entry(id.clone()).or_insert((0, 0));
            let (passing, last_error) = match outcome {
                ProbeOutcome::Pass => {
                    streak.0 += 1;
                    streak.1 = 0;
                    (true, None)
                }
                ProbeOutcome::Fail(error) => {
                    streak.0 = 0;
                    streak.1 += 1;
                    (false, Some(error))
                }
            };
            reports.push(ProbeReport {
                id,
                critical: probe.critical,
                passing,
                consecutive_passes: streak.0,
                consecutive_failures: streak.1,
                last_error,
                checked_at: now,
            });
        }

        let status = aggregate(&reports);
        let report = HealthReport {
            scope: scope.clone(),
            status,
            probes: reports,
            checked_at: now,
        };
        state.report = report.clone();
        let _ = state.tx.send(report.clone());
        Some(report)
    }

    async fn run_probe(&self, scope: &ScopeKey, probe: &ProbeSpec) -> ProbeOutcome {
        let attempts = probe.retries + 1;
        let mut last = ProbeOutcome::Fail("probe not executed".to_string());
        for attempt in 1..=attempts {
            let outcome =
                match tokio::time::timeout(probe.timeout, self.executor.execute(scope, probe)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::Fail(format!(
                        "probe '{}' timed out after {:?}",
                        probe.id, probe.timeout
                    )),
                };
            if outcome == ProbeOutcome::Pass {
                return ProbeOutcome::Pass;
            }
            debug!(
                "probe '{}' for {} failed attempt {}/{}",
                probe.id, scope, attempt, attempts
            );
            last = outcome;
        }
        last
    }

    /// Spawn the background driver for a scope. Each probe reruns on its
    /// own interval; the loop ticks at the smallest one.
    pub fn start(self: Arc<Self>, scope: ScopeKey) {
        let cancel = match self.scopes.read().get(&scope) {
            Some(state) => state.cancel.clone(),
            None => {
                warn!("health driver requested for unregistered scope {}", scope);
                return;
            }
        };
        let checker = self;

        tokio::spawn(async move {
            let tick = checker
                .scopes
                .read()
                .get(&scope)
                .map(|s| {
                    s.probes
                        .iter()
                        .map(|p| p.interval)
                        .min()
                        .unwrap_or(Duration::from_secs(30))
                })
                .unwrap_or(Duration::from_secs(30));

            let mut elapsed: HashMap<String, Duration> = HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {}
                }

                // Only probes whose interval has elapsed run this tick.
                let due: Vec<String> = {
                    let scopes = checker.scopes.read();
                    let state = match scopes.get(&scope) {
                        Some(state) => state,
                        None => break,
                    };
                    state
                        .probes
                        .iter()
                        .filter(|p| {
                            let so_far = elapsed.get(&p.id).copied().unwrap_or(p.interval) + tick;
                            so_far >= p.interval
                        })
                        .map(|p| p.id.clone())
                        .collect()
                };
                for (_, v) in elapsed.iter_mut() {
                    *v += tick;
                }
                for id in &due {
                    elapsed.insert(id.clone(), Duration::ZERO);
                }
                if !due.is_empty() {
                    checker.run_scoped(&scope, &due).await;
                }
            }
        });
    }

    /// Run a subset of probes and merge into the current report.
    async fn run_scoped(&self, scope: &ScopeKey, probe_ids: &[String]) {
        let probes: Vec<ProbeSpec> = match self.scopes.read().get(scope) {
            Some(state) => state
                .probes
                .iter()
                .filter(|p| probe_ids.contains(&p.id))
                .cloned()
                .collect(),
            None => return,
        };

        let mut outcomes = Vec::with_capacity(probes.len());
        for probe in &probes {
            outcomes.push((probe.clone(), self.run_probe(scope, probe).await));
        }

        let now = self.clock.now();
        let mut scopes = self.scopes.write();
        let state = match scopes.get_mut(scope) {
            Some(state) => state,
            None => return,
        };

        for (probe, outcome) in outcomes {
            let streak = state.streaks.entry(probe.id.clone()).or_insert((0, 0));
            let (passing, last_error) = match outcome {
                ProbeOutcome::Pass => {
                    streak.0 += 1;
                    streak.1 = 0;
                    (true, None)
                }
                ProbeOutcome::Fail(error) => {
                    streak.0 = 0;
                    streak.1 += 1;
                    (false, Some(error))
                }
            };
            let updated = ProbeReport {
                id: probe.id.clone(),
                critical: probe.critical,
                passing,
                consecutive_passes: streak.0,
                consecutive_failures: streak.1,
                last_error,
                checked_at: now,
            };
            match state.report.probes.iter_mut().find(|p| p.id == probe.id) {
                Some(slot) => *slot = updated,
                None => state.report.probes.push(updated),
            }
        }
        state.report.status = aggregate(&state.report.probes);
        state.report.checked_at = now;
        let _ = state.tx.send(state.report.clone());
    }
}

fn aggregate(probes: &[ProbeReport]) -> HealthStatus {
    let critical_failing = probes.iter().any(|p| p.critical && !p.passing);
    let any_failing = probes.iter().any(|p| !p.passing);
    if critical_failing {
        HealthStatus::Unhealthy
    } else if any_failing {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;

    fn scope() -> ScopeKey {
        ScopeKey::new("billing", "t1")
    }

    fn checker_with(executor: Arc<ScriptedProbes>) -> Arc<HealthChecker> {
        Arc::new(HealthChecker::new(executor, Arc::new(SystemClock)))
    }

    #[tokio::test]
    async fn passing_probes_aggregate_healthy() {
        let probes = Arc::new(ScriptedProbes::new());
        let checker = checker_with(Arc::clone(&probes));
        checker.register(
            &scope(),
            vec![ProbeSpec::endpoint("http").critical(), ProbeSpec::endpoint("cache")],
        );

        let report = checker.run_once(&scope()).await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.status.is_passing());
        assert_eq!(report.probes.len(), 2);
    }

    #[tokio::test]
    async fn non_critical_failure_is_degraded() {
        let probes = Arc::new(ScriptedProbes::new());
        let checker = checker_with(Arc::clone(&probes));
        checker.register(
            &scope(),
            vec![ProbeSpec::endpoint("http").critical(), ProbeSpec::endpoint("cache")],
        );
        probes.set_constant(&scope(), "cache", ProbeOutcome::Fail("cold".to_string()));

        let report = checker.run_once(&scope()).await.unwrap();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(!report.status.is_passing());
    }

    #[tokio::test]
    async fn critical_failure_is_unhealthy() {
        let probes = Arc::new(ScriptedProbes::new());
        let checker = checker_with(Arc::clone(&probes));
        checker.register(&scope(), vec![ProbeSpec::endpoint("http").critical()]);
        // Retries exhaust the queue: first attempt fails, retry fails too.
        probes.set_constant(&scope(), "http", ProbeOutcome::Fail("500".to_string()));

        let report = checker.run_once(&scope()).await.unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.probes[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let probes = Arc::new(ScriptedProbes::new());
        let checker = checker_with(Arc::clone(&probes));
        checker.register(&scope(), vec![ProbeSpec::endpoint("http").critical()]);
        // One scripted failure, then the constant default (pass) applies.
        probes.push(&scope(), "http", ProbeOutcome::Fail("flaky".to_string()));

        let report = checker.run_once(&scope()).await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn consecutive_passes_accumulate() {
        let probes = Arc::new(ScriptedProbes::new());
        let checker = checker_with(Arc::clone(&probes));
        checker.register(&scope(), vec![ProbeSpec::endpoint("http").critical()]);

        for expected in 1..=3 {
            let report = checker.run_once(&scope()).await.unwrap();
            assert_eq!(report.critical_consecutive_passes(), expected);
        }

        // A failure resets the streak.
        probes.push(&scope(), "http", ProbeOutcome::Fail("500".to_string()));
        probes.push(&scope(), "http", ProbeOutcome::Fail("500".to_string()));
        let report = checker.run_once(&scope()).await.unwrap();
        assert_eq!(report.critical_consecutive_passes(), 0);
    }

    #[tokio::test]
    async fn subscribers_observe_new_reports() {
        let probes = Arc::new(ScriptedProbes::new());
        let checker = checker_with(Arc::clone(&probes));
        checker.register(&scope(), vec![ProbeSpec::endpoint("http")]);
        let mut rx = checker.subscribe(&scope()).unwrap();

        checker.run_once(&scope()).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn background_driver_reruns_probes() {
        let probes = Arc::new(ScriptedProbes::new());
        let checker = checker_with(Arc::clone(&probes));
        checker.register(
            &scope(),
            vec![ProbeSpec::endpoint("http")
                .critical()
                .with_interval(Duration::from_secs(1))],
        );
        Arc::clone(&checker).start(scope());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        let report = checker.status(&scope()).unwrap();
        assert!(report.probes[0].consecutive_passes >= 2);

        checker.unregister(&scope());
    }
}
