//! Reinforcement-learning environments backed by a shared, remotely hosted robot.
//!
//! [`RealEnv`] drives the physical robot through a booked session on the
//! robot-control server; [`SimEnv`] mirrors the same [`Env`] contract with an
//! in-process kinematic model. Pick one at construction time with [`make`].

pub mod action;
pub mod config;
pub mod env;
pub mod episode;
pub mod error;
pub mod logging;
pub mod observation;
pub mod reward;
pub mod session;
pub mod sim;
pub mod spaces;
pub mod transport;

pub use config::{ActionKind, Backend, EnvConfig, EnvVariant};
pub use env::RealEnv;
pub use error::{GymError, Result};
pub use observation::Observation;
pub use sim::SimEnv;
pub use spaces::{Action, ActionSpec, Channels, ObsActSpace, ObservationSpec};

use ndarray::s;
use serde_json::{Map, Value};

/// Free-form per-step diagnostics.
pub type Info = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub observation: Observation,
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
    pub info: Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Show the frame in a window.
    Human,
    /// Return the frame as pixels.
    RgbArray,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderFrame {
    Rgb {
        rows: usize,
        cols: usize,
        data: Vec<u8>,
    },
    /// Normalised depth, for depth-only observations.
    Depth {
        rows: usize,
        cols: usize,
        data: Vec<f32>,
    },
}

impl RenderFrame {
    /// The image component of the newest frame in `obs`.
    pub fn from_observation(obs: &Observation, channels: Channels) -> Self {
        let latest = obs.latest();
        let (rows, cols, _) = latest.dim();
        if channels.needs_rgb() {
            let data = latest
                .slice(s![.., .., ..3])
                .iter()
                .map(|v| (v.clamp(0., 1.) * 255.).round() as u8)
                .collect();
            RenderFrame::Rgb { rows, cols, data }
        } else {
            let data = latest.iter().copied().collect();
            RenderFrame::Depth { rows, cols, data }
        }
    }

    pub fn as_rgb(&self) -> Option<(usize, usize, &[u8])> {
        match self {
            RenderFrame::Rgb { rows, cols, data } => Some((*rows, *cols, data)),
            _ => None,
        }
    }

    pub fn as_depth(&self) -> Option<(usize, usize, &[f32])> {
        match self {
            RenderFrame::Depth { rows, cols, data } => Some((*rows, *cols, data)),
            _ => None,
        }
    }
}

/// The environment contract training code programs against.
pub trait Env {
    /// The Space object corresponding to valid actions. A discrete space of
    /// `n` means actions `0..n` are valid.
    fn action_space(&self) -> &ActionSpec;

    /// The Space object every observation conforms to.
    fn observation_space(&self) -> &ObservationSpec;

    /// Start a new episode and return its first observation.
    fn reset(&mut self) -> Result<Observation>;

    fn step(&mut self, action: &Action) -> Result<StepResult>;

    /// The latest observation's image; never touches the robot or the episode.
    fn render(&self, mode: RenderMode) -> Result<RenderFrame>;

    /// Release the environment. Safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

pub(crate) fn render_latest(
    last: Option<&Observation>,
    spec: &ObservationSpec,
    mode: RenderMode,
) -> Result<RenderFrame> {
    match mode {
        RenderMode::Human => Err(GymError::Unsupported(
            "human rendering, use RgbArray".into(),
        )),
        RenderMode::RgbArray => last
            .map(|obs| RenderFrame::from_observation(obs, spec.channels))
            .ok_or_else(|| GymError::invalid_state("an observation (call reset first)", "none")),
    }
}

/// Build the environment selected by `config.backend`.
pub fn make(config: EnvConfig) -> Result<Box<dyn Env>> {
    let env: Box<dyn Env> = match config.backend {
        Backend::Real => Box::new(RealEnv::connect(config)?),
        Backend::Simulated => Box::new(SimEnv::new(config)?),
    };
    Ok(env)
}
