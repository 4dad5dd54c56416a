// Rollout strategies: how newly activated code receives traffic.
//
// Instant swaps the serving pointer in one tick. Gradual walks a
// percentage plan gated on health between increments. Blue-green keeps the
// new version dark until it passes health checks, then cuts over
// atomically and retains the old environment for instant rollback.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficShifting {
    /// Starting percentage for the new version
    pub initial: f64,
    /// Percentage added per tick
    pub increment: f64,
    /// Wait between increments; zero advances as soon as health passes
    pub interval: Duration,
    /// Cap on a single tick's increase
    pub max_increment: f64,
}

impl Default for TrafficShifting {
    fn default() -> Self {
        Self {
            initial: 10.0,
            increment: 20.0,
            interval: Duration::from_secs(10),
            max_increment: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RolloutStrategy {
    /// Atomic promotion; traffic shifts 0% -> 100% in one tick
    Instant,
    Gradual(TrafficShifting),
    BlueGreen {
        /// How long the previous environment is kept for instant rollback
        blue_retention: Duration,
    },
}

impl RolloutStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RolloutStrategy::Instant => "instant",
            RolloutStrategy::Gradual(_) => "gradual",
            RolloutStrategy::BlueGreen { .. } => "blue_green",
        }
    }
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        RolloutStrategy::Instant
    }
}

/// The percentage sequence a gradual rollout walks, capped at 100.
///
/// A non-positive increment degenerates to a single jump to 100 so the
/// plan always terminates.
pub fn traffic_plan(shifting: &TrafficShifting) -> Vec<f64> {
    let mut plan = Vec::new();
    let mut percent = shifting.initial.clamp(0.0, 100.0);
    let step = shifting.increment.min(shifting.max_increment);

    plan.push(percent);
    if step <= 0.0 {
        if percent < 100.0 {
            plan.push(100.0);
        }
        return plan;
    }

    while percent < 100.0 {
        percent = (percent + step).min(100.0);
        plan.push(percent);
    }
    plan
}

const HASH_RING_SIZE: u64 = 10_000;

/// Stable request routing during a split: the same request hash always
/// lands on the same side for a given percentage, so sessions don't
/// flap between versions as the rollout advances.
pub fn routes_to_new(request_hash: u64, percent: f64) -> bool {
    if percent >= 100.0 {
        return true;
    }
    if percent <= 0.0 {
        return false;
    }
    let threshold = (percent / 100.0 * HASH_RING_SIZE as f64) as u64;
    request_hash % HASH_RING_SIZE < threshold
}

/// Hash a request identity pair for `routes_to_new`.
pub fn request_hash(tenant: &str, request_id: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    tenant.hash(&mut hasher);
    request_id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_walks_increments_to_full_traffic() {
        let shifting = TrafficShifting {
            initial: 10.0,
            increment: 30.0,
            interval: Duration::from_secs(1),
            max_increment: 100.0,
        };
        assert_eq!(traffic_plan(&shifting), vec![10.0, 40.0, 70.0, 100.0]);
    }

    #[test]
    fn increment_above_100_caps() {
        let shifting = TrafficShifting {
            initial: 10.0,
            increment: 150.0,
            interval: Duration::from_secs(1),
            max_increment: 100.0,
        };
        assert_eq!(traffic_plan(&shifting), vec![10.0, 100.0]);
    }

    #[test]
    fn max_increment_bounds_each_tick() {
        let shifting = TrafficShifting {
            initial: 0.0,
            increment: 60.0,
            interval: Duration::from_secs(1),
            max_increment: 40.0,
        };
        assert_eq!(traffic_plan(&shifting), vec![0.0, 40.0, 80.0, 100.0]);
    }

    #[test]
    fn initial_at_or_above_100_is_a_single_tick() {
        let shifting = TrafficShifting {
            initial: 100.0,
            increment: 10.0,
            interval: Duration::from_secs(1),
            max_increment: 100.0,
        };
        assert_eq!(traffic_plan(&shifting), vec![100.0]);

        let over = TrafficShifting {
            initial: 250.0,
            ..shifting
        };
        assert_eq!(traffic_plan(&over), vec![100.0]);
    }

    #[test]
    fn zero_increment_still_terminates() {
        let shifting = TrafficShifting {
            initial: 25.0,
            increment: 0.0,
            interval: Duration::ZERO,
            max_increment: 100.0,
        };
        assert_eq!(traffic_plan(&shifting), vec![25.0, 100.0]);
    }

    #[test]
    fn routing_is_stable_per_request() {
        let hash = request_hash("t1", "session-42");
        let at_30 = routes_to_new(hash, 30.0);
        for _ in 0..10 {
            assert_eq!(routes_to_new(hash, 30.0), at_30);
        }
        // Once a request routes to new, it stays there as the percentage
        // only grows.
        if at_30 {
            assert!(routes_to_new(hash, 60.0));
        }
        assert!(routes_to_new(hash, 100.0));
        assert!(!routes_to_new(hash, 0.0));
    }

    #[test]
    fn routing_split_roughly_matches_percentage() {
        let matches = (0..10_000u64)
            .filter(|i| routes_to_new(request_hash("t1", &format!("r{}", i)), 25.0))
            .count();
        // Coarse bound; the hash is uniform enough for a 25% split.
        assert!((1_500..3_500).contains(&matches), "got {}", matches);
    }

    #[test]
    fn plans_are_monotonically_non_decreasing() {
        let shifting = TrafficShifting::default();
        let plan = traffic_plan(&shifting);
        for window in plan.windows(2) {
            assert!(window[1] >= window[0]);
        }
        assert_eq!(plan.last(), Some(&100.0));
    }
}
