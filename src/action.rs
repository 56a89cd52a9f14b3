use crate::config::EnvVariant;
use crate::error::{GymError, Result};
use crate::spaces::{Action, ActionSpec, Continuous, Discrete};
use crate::transport::wire::{Motion, RobotCommand};
use crate::Info;
use serde_json::json;
use tracing::warn;

impl Motion {
    /// Discrete action index to motion: left, right, forward, backward.
    pub fn from_index(index: Discrete) -> Option<Self> {
        match index {
            0 => Some(Motion::TurnLeft),
            1 => Some(Motion::TurnRight),
            2 => Some(Motion::MoveForward),
            3 => Some(Motion::MoveBackward),
            _ => None,
        }
    }
}

/// Magnitudes used for the fixed discrete motions and continuous set-points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionProfile {
    /// m/s while moving forward/backward.
    pub linear: f64,
    /// rad/s while turning.
    pub angular: f64,
    pub duration_ms: u64,
}

impl MotionProfile {
    pub fn for_variant(variant: EnvVariant) -> Self {
        match variant {
            EnvVariant::Monolith => Self {
                linear: 0.3,
                angular: 0.8,
                duration_ms: 500,
            },
            // Slower approach so a single step cannot carry the robot into an obstacle.
            EnvVariant::MonolithObstacle => Self {
                linear: 0.2,
                angular: 0.8,
                duration_ms: 500,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clamping {
    pub requested: Vec<Continuous>,
    pub applied: Vec<Continuous>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub command: RobotCommand,
    pub clamped: Option<Clamping>,
}

impl Translation {
    /// Adds `clamped` (and the requested/applied values when clamped) to `info`.
    pub fn record(&self, info: &mut Info) {
        info.insert("clamped".into(), json!(self.clamped.is_some()));
        if let Some(c) = &self.clamped {
            info.insert("requested_action".into(), json!(c.requested));
            info.insert("applied_action".into(), json!(c.applied));
        }
    }
}

/// Maps agent actions onto robot commands. Pure; transmitting is the transport's job.
#[derive(Debug, Clone)]
pub struct ActionTranslator {
    spec: ActionSpec,
    profile: MotionProfile,
}

impl ActionTranslator {
    pub fn new(spec: ActionSpec, variant: EnvVariant) -> Self {
        Self {
            spec,
            profile: MotionProfile::for_variant(variant),
        }
    }

    pub fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    pub fn profile(&self) -> &MotionProfile {
        &self.profile
    }

    pub fn translate(&self, action: &Action) -> Result<Translation> {
        translate(action, &self.spec, &self.profile)
    }
}

pub fn translate(action: &Action, spec: &ActionSpec, profile: &MotionProfile) -> Result<Translation> {
    match (spec, action) {
        (ActionSpec::Discrete { n }, Action::Discrete(a)) => {
            let motion = Motion::from_index(*a)
                .filter(|_| (0..*n).contains(a))
                .ok_or_else(|| {
                    GymError::ActionOutOfRange(format!("{a} is not in 0..{n}"))
                })?;
            let (linear, angular) = match motion {
                Motion::TurnLeft => (0., profile.angular),
                Motion::TurnRight => (0., -profile.angular),
                Motion::MoveForward => (profile.linear, 0.),
                Motion::MoveBackward => (-profile.linear, 0.),
            };

            Ok(Translation {
                command: RobotCommand::Motion {
                    motion,
                    linear,
                    angular,
                    duration_ms: profile.duration_ms,
                },
                clamped: None,
            })
        }

        (ActionSpec::Continuous { angular, linear }, Action::Continuous(v)) => {
            if v.len() != 2 {
                return Err(GymError::ActionOutOfRange(format!(
                    "expected [angular, linear], got {} values",
                    v.len()
                )));
            }
            let applied = vec![angular.clamp(v[0]), linear.clamp(v[1])];
            // NaN never compares equal, so it always counts as clamped.
            let clamped = (applied != *v).then(|| {
                warn!(requested = ?v, applied = ?applied, "clamped continuous action");
                Clamping {
                    requested: v.clone(),
                    applied: applied.clone(),
                }
            });

            Ok(Translation {
                command: RobotCommand::Velocity {
                    angular: applied[0],
                    linear: applied[1],
                    duration_ms: profile.duration_ms,
                },
                clamped,
            })
        }

        (ActionSpec::Discrete { .. }, a) => Err(GymError::ActionOutOfRange(format!(
            "discrete action space cannot take {a:?}"
        ))),
        (ActionSpec::Continuous { .. }, a) => Err(GymError::ActionOutOfRange(format!(
            "continuous action space cannot take {a:?}"
        ))),
    }
}
