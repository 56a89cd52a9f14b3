use crate::config::{ActionKind, EnvConfig};
use rand::Rng;
use serde::{Deserialize, Serialize};

pub type Discrete = i64;
pub type Continuous = f64;

/// Static space descriptor, the shape training code inspects before acting.
#[derive(Debug, Clone, PartialEq)]
pub enum ObsActSpace {
    /// Refer: https://gymnasium.farama.org/api/spaces/fundamental/#discrete
    Discrete { n: Discrete },

    /// Refer: https://gymnasium.farama.org/api/spaces/fundamental/#box
    Box {
        shape: Vec<usize>,
        high: Vec<Continuous>,
        low: Vec<Continuous>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub low: Continuous,
    pub high: Continuous,
}

impl Bounds {
    pub const fn new(low: Continuous, high: Continuous) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, v: Continuous) -> bool {
        v >= self.low && v <= self.high
    }

    /// NaN clamps to the midpoint of the bounds.
    pub fn clamp(&self, v: Continuous) -> Continuous {
        if v.is_nan() {
            (self.low + self.high) / 2.
        } else {
            v.clamp(self.low, self.high)
        }
    }
}

pub const DISCRETE_ACTIONS: Discrete = 4;
pub const ANGULAR_BOUNDS: Bounds = Bounds::new(-1.0, 1.0);
pub const LINEAR_BOUNDS: Bounds = Bounds::new(-0.5, 0.5);

/// Immutable action space description, fixed at environment construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionSpec {
    Discrete { n: Discrete },
    /// Angular velocity (rad/s), linear velocity (m/s).
    Continuous { angular: Bounds, linear: Bounds },
}

impl ActionSpec {
    pub fn for_kind(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Discrete => ActionSpec::Discrete {
                n: DISCRETE_ACTIONS,
            },
            ActionKind::Continuous => ActionSpec::Continuous {
                angular: ANGULAR_BOUNDS,
                linear: LINEAR_BOUNDS,
            },
        }
    }

    pub fn descriptor(&self) -> ObsActSpace {
        match self {
            ActionSpec::Discrete { n } => ObsActSpace::Discrete { n: *n },
            ActionSpec::Continuous { angular, linear } => ObsActSpace::Box {
                shape: vec![2],
                high: vec![angular.high, linear.high],
                low: vec![angular.low, linear.low],
            },
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        match self {
            ActionSpec::Discrete { n } => Action::Discrete(rng.gen_range(0..*n)),
            ActionSpec::Continuous { angular, linear } => Action::Continuous(vec![
                rng.gen_range(angular.low..=angular.high),
                rng.gen_range(linear.low..=linear.high),
            ]),
        }
    }
}

/// An action chosen by the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Discrete(Discrete),
    /// `[angular, linear]`.
    Continuous(Vec<Continuous>),
}

impl From<Discrete> for Action {
    fn from(a: Discrete) -> Self {
        Action::Discrete(a)
    }
}

impl From<[Continuous; 2]> for Action {
    fn from(a: [Continuous; 2]) -> Self {
        Action::Continuous(a.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channels {
    RgbOnly,
    DepthOnly,
    Rgbd,
}

impl Channels {
    /// Channel count of one observation frame.
    pub fn count(&self) -> usize {
        match self {
            Channels::RgbOnly => 3,
            Channels::DepthOnly => 1,
            Channels::Rgbd => 4,
        }
    }

    pub fn needs_rgb(&self) -> bool {
        matches!(self, Channels::RgbOnly | Channels::Rgbd)
    }

    pub fn needs_depth(&self) -> bool {
        matches!(self, Channels::DepthOnly | Channels::Rgbd)
    }
}

/// Shape and value contract every observation conforms to.
///
/// Observations are `(history, height, width, channels)` tensors of `f32`
/// normalised to `[0, 1]`, RGB channels first when both modalities are present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservationSpec {
    pub channels: Channels,
    pub height: usize,
    pub width: usize,
    pub history: usize,
    /// Depth readings beyond this many metres are clipped before normalising.
    pub depth_max: f32,
}

impl ObservationSpec {
    pub fn from_config(config: &EnvConfig) -> Self {
        Self {
            channels: config.channels,
            height: config.image_height,
            width: config.image_width,
            history: config.history,
            depth_max: config.depth_max,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.history, self.height, self.width, self.channels.count()]
    }

    pub fn descriptor(&self) -> ObsActSpace {
        let c = self.channels.count();
        ObsActSpace::Box {
            shape: self.shape().to_vec(),
            high: vec![1.; c],
            low: vec![0.; c],
        }
    }
}
