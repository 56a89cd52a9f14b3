//! Reward shaping, pluggable per environment variant.

use crate::config::{EnvVariant, RewardSource};
use crate::episode::TerminationReason;
use crate::transport::wire::Telemetry;

pub trait RewardStrategy: Send {
    fn name(&self) -> &'static str;

    /// Reward for the transition from `prev` to `now`.
    fn reward(&self, prev: &Telemetry, now: &Telemetry) -> f64;

    /// Task termination signalled by the latest telemetry, if any.
    fn termination(&self, now: &Telemetry) -> Option<TerminationReason> {
        if now.collision {
            Some(TerminationReason::Collision)
        } else if now.out_of_bounds {
            Some(TerminationReason::OutOfBounds)
        } else if now.goal_reached {
            Some(TerminationReason::GoalReached)
        } else {
            None
        }
    }
}

pub fn strategy_for(variant: EnvVariant, source: RewardSource) -> Box<dyn RewardStrategy> {
    match (source, variant) {
        (RewardSource::Server, _) => Box::new(ServerReported),
        (RewardSource::Variant, EnvVariant::Monolith) => Box::<DistanceShaping>::default(),
        (RewardSource::Variant, EnvVariant::MonolithObstacle) => {
            Box::<ObstacleAware>::default()
        }
    }
}

/// Progress towards the monolith, a bonus for reaching it and a collision penalty.
#[derive(Debug, Clone, Copy)]
pub struct DistanceShaping {
    pub progress_weight: f64,
    pub goal_bonus: f64,
    pub collision_penalty: f64,
}

impl Default for DistanceShaping {
    fn default() -> Self {
        Self {
            progress_weight: 1.0,
            goal_bonus: 1.0,
            collision_penalty: -1.0,
        }
    }
}

impl RewardStrategy for DistanceShaping {
    fn name(&self) -> &'static str {
        "distance_shaping"
    }

    fn reward(&self, prev: &Telemetry, now: &Telemetry) -> f64 {
        let mut r = self.progress_weight * (prev.goal_distance - now.goal_distance);
        if now.goal_reached {
            r += self.goal_bonus;
        }
        if now.collision {
            r += self.collision_penalty;
        }
        r
    }
}

/// [`DistanceShaping`] plus a penalty that grows as the robot nears an obstacle.
#[derive(Debug, Clone, Copy)]
pub struct ObstacleAware {
    pub base: DistanceShaping,
    /// Penalty starts below this many metres from an obstacle.
    pub proximity_threshold: f64,
    pub proximity_penalty: f64,
    /// At or below this distance the robot counts as having collided.
    pub contact_distance: f64,
}

impl Default for ObstacleAware {
    fn default() -> Self {
        Self {
            base: DistanceShaping::default(),
            proximity_threshold: 0.5,
            proximity_penalty: -0.1,
            contact_distance: 0.05,
        }
    }
}

impl RewardStrategy for ObstacleAware {
    fn name(&self) -> &'static str {
        "obstacle_aware"
    }

    fn reward(&self, prev: &Telemetry, now: &Telemetry) -> f64 {
        let mut r = self.base.reward(prev, now);
        if let Some(d) = now.obstacle_distance {
            if d < self.proximity_threshold {
                r += self.proximity_penalty * (1. - d.max(0.) / self.proximity_threshold);
            }
        }
        r
    }

    fn termination(&self, now: &Telemetry) -> Option<TerminationReason> {
        let contact = now
            .obstacle_distance
            .is_some_and(|d| d <= self.contact_distance);
        if contact {
            Some(TerminationReason::Collision)
        } else {
            self.base.termination(now)
        }
    }
}

/// The reward scored by the robot server, 0 when it reports none.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerReported;

impl RewardStrategy for ServerReported {
    fn name(&self) -> &'static str {
        "server_reported"
    }

    fn reward(&self, _prev: &Telemetry, now: &Telemetry) -> f64 {
        now.reward.unwrap_or(0.)
    }
}
