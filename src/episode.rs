use crate::error::{GymError, Result};
use crate::reward::RewardStrategy;
use crate::transport::wire::Telemetry;
use crate::Info;
use serde_json::json;
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Terminated,
    Truncated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Running => "running",
            Phase::Terminated => "terminated",
            Phase::Truncated => "truncated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    GoalReached,
    Collision,
    OutOfBounds,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::GoalReached => "goal_reached",
            TerminationReason::Collision => "collision",
            TerminationReason::OutOfBounds => "out_of_bounds",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeState {
    pub step: u32,
    pub cumulative_reward: f64,
    pub last_telemetry: Option<Telemetry>,
    pub termination: Option<TerminationReason>,
}

/// What one step did to the episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub reward: f64,
    pub terminated: bool,
    pub truncated: bool,
}

/// Step accounting, reward and termination for one episode at a time.
pub struct EpisodeStateMachine {
    phase: Phase,
    state: EpisodeState,
    step_budget: u32,
    reward: Box<dyn RewardStrategy>,
}

impl fmt::Debug for EpisodeStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpisodeStateMachine")
            .field("phase", &self.phase)
            .field("state", &self.state)
            .field("step_budget", &self.step_budget)
            .field("reward", &self.reward.name())
            .finish()
    }
}

impl EpisodeStateMachine {
    pub fn new(step_budget: u32, reward: Box<dyn RewardStrategy>) -> Self {
        Self {
            phase: Phase::Idle,
            state: EpisodeState::default(),
            step_budget,
            reward,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &EpisodeState {
        &self.state
    }

    pub fn step_budget(&self) -> u32 {
        self.step_budget
    }

    /// Begin a new episode from the robot's start-pose telemetry.
    pub fn reset(&mut self, start: Telemetry) {
        self.state = EpisodeState {
            last_telemetry: Some(start),
            ..EpisodeState::default()
        };
        self.phase = Phase::Running;
    }

    pub fn ensure_running(&self) -> Result<()> {
        match self.phase {
            Phase::Running => Ok(()),
            phase => Err(GymError::invalid_state("running (call reset first)", phase)),
        }
    }

    /// Account for one executed step. `None` means no fresh telemetry arrived;
    /// the last known state is carried forward.
    pub fn advance(&mut self, telemetry: Option<Telemetry>) -> Result<Transition> {
        self.ensure_running()?;

        let prev = self.state.last_telemetry.clone().unwrap_or_default();
        let now = telemetry.unwrap_or_else(|| prev.clone());

        self.state.step += 1;
        let reward = self.reward.reward(&prev, &now);
        self.state.cumulative_reward += reward;

        let termination = self.reward.termination(&now);
        let terminated = termination.is_some();
        let truncated = !terminated && self.state.step >= self.step_budget;
        self.state.termination = termination;
        self.state.last_telemetry = Some(now);

        debug!(step = self.state.step, reward, terminated, truncated, "step");
        if terminated {
            self.phase = Phase::Terminated;
        } else if truncated {
            self.phase = Phase::Truncated;
        }
        if terminated || truncated {
            info!(
                steps = self.state.step,
                reward = self.state.cumulative_reward,
                reason = self.end_reason().unwrap_or_default(),
                "episode complete"
            );
        }

        Ok(Transition {
            reward,
            terminated,
            truncated,
        })
    }

    /// Stop the current episode without resetting counters; a reset is required next.
    pub fn abort(&mut self) {
        if self.phase == Phase::Running {
            self.phase = Phase::Idle;
        }
    }

    pub fn end_reason(&self) -> Option<&'static str> {
        match self.phase {
            Phase::Terminated => self.state.termination.map(|r| r.as_str()),
            Phase::Truncated => Some("step_budget"),
            _ => None,
        }
    }

    pub fn record(&self, info: &mut Info) {
        info.insert("step".into(), json!(self.state.step));
        info.insert(
            "cumulative_reward".into(),
            json!(self.state.cumulative_reward),
        );
        if let Some(reason) = self.end_reason() {
            info.insert("end_reason".into(), json!(reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reward::{DistanceShaping, ServerReported};
    use float_eq::assert_float_eq;

    fn machine(budget: u32) -> EpisodeStateMachine {
        EpisodeStateMachine::new(budget, Box::new(DistanceShaping::default()))
    }

    fn at(goal_distance: f64) -> Telemetry {
        Telemetry {
            goal_distance,
            ..Telemetry::default()
        }
    }

    #[test]
    fn step_before_reset_is_invalid() {
        let mut m = machine(10);
        let err = m.advance(Some(at(1.))).unwrap_err();
        assert!(matches!(err, GymError::InvalidState { .. }));
        assert_eq!(m.state().step, 0);
    }

    #[test]
    fn reset_zeroes_counters() {
        let mut m = machine(10);
        m.reset(at(5.));
        m.advance(Some(at(4.))).unwrap();
        m.reset(at(5.));
        assert_eq!(m.phase(), Phase::Running);
        assert_eq!(m.state().step, 0);
        assert_eq!(m.state().cumulative_reward, 0.);
    }

    #[test]
    fn budget_exhaustion_truncates() {
        let mut m = machine(3);
        m.reset(at(5.));
        for _ in 0..2 {
            let t = m.advance(Some(at(5.))).unwrap();
            assert!(!t.truncated && !t.terminated);
        }
        let t = m.advance(Some(at(5.))).unwrap();
        assert!(t.truncated);
        assert!(!t.terminated);
        assert_eq!(m.phase(), Phase::Truncated);
        assert_eq!(m.end_reason(), Some("step_budget"));

        let err = m.advance(Some(at(5.))).unwrap_err();
        assert!(matches!(err, GymError::InvalidState { .. }));
    }

    #[test]
    fn termination_beats_truncation_on_last_step() {
        let mut m = machine(1);
        m.reset(at(1.));
        let t = m
            .advance(Some(Telemetry {
                goal_reached: true,
                ..at(0.1)
            }))
            .unwrap();
        assert!(t.terminated);
        assert!(!t.truncated);
        assert_eq!(m.end_reason(), Some("goal_reached"));
    }

    #[test]
    fn missing_telemetry_carries_state_forward() {
        let mut m = machine(10);
        m.reset(at(4.));
        m.advance(Some(at(3.))).unwrap();
        let t = m.advance(None).unwrap();
        assert_eq!(t.reward, 0.);
        assert_eq!(m.state().step, 2);
        assert_float_eq!(m.state().cumulative_reward, 1., abs <= 1e-12);
    }

    #[test]
    fn abort_keeps_step_count() {
        let mut m = EpisodeStateMachine::new(10, Box::new(ServerReported));
        m.reset(at(4.));
        m.advance(None).unwrap();
        m.abort();
        assert_eq!(m.phase(), Phase::Idle);
        assert_eq!(m.state().step, 1);
    }

    #[test]
    fn info_carries_step_and_reason() {
        let mut m = machine(1);
        m.reset(at(1.));
        m.advance(Some(at(1.))).unwrap();
        let mut info = Info::new();
        m.record(&mut info);
        assert_eq!(info["step"], json!(1));
        assert_eq!(info["end_reason"], json!("step_budget"));
    }
}
