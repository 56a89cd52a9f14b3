use crate::action::ActionTranslator;
use crate::config::EnvConfig;
use crate::episode::EpisodeStateMachine;
use crate::error::{GymError, Result};
use crate::observation::{check_modalities, Observation, ObservationBuilder};
use crate::reward::strategy_for;
use crate::session::{SessionManager, SessionOptions, SessionStatus};
use crate::spaces::{Action, ActionSpec, ObservationSpec};
use crate::transport::http::HttpLink;
use crate::transport::wire::RobotCommand;
use crate::transport::{Connection, Frame, RobotLink};
use crate::{render_latest, Env, Info, RenderFrame, RenderMode, StepResult};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const RESET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Environment backed by the physical robot.
///
/// ```no_run
/// use robot_gym::{Action, Env, EnvConfig, RealEnv};
///
/// let config = EnvConfig {
///     token: "booking-token".into(),
///     ..EnvConfig::default()
/// };
/// let mut env = RealEnv::connect(config)?;
/// let _obs = env.reset()?;
/// let step = env.step(&Action::Discrete(2))?;
/// println!("reward {}", step.reward);
/// env.close()?;
/// # Ok::<(), robot_gym::GymError>(())
/// ```
pub struct RealEnv {
    config: EnvConfig,
    action_spec: ActionSpec,
    obs_spec: ObservationSpec,
    translator: ActionTranslator,
    builder: ObservationBuilder,
    episode: EpisodeStateMachine,
    sessions: SessionManager,
    last_observation: Option<Observation>,
    closed: bool,
}

impl RealEnv {
    /// Connect to `config.endpoint` over HTTP.
    pub fn connect(config: EnvConfig) -> Result<Self> {
        let link = HttpLink::new(&config.endpoint, config.command_timeout())?;
        Self::with_link(config, Arc::new(link))
    }

    /// Connect through any link, start a session and probe the sensors.
    ///
    /// Fails with `ModalityUnavailable` if the robot does not provide the
    /// requested channels.
    pub fn with_link(config: EnvConfig, link: Arc<dyn RobotLink>) -> Result<Self> {
        config.validate()?;
        info!(variant = config.variant.id(), "waiting to connect to the environment server");

        let conn = Connection::connect(
            link,
            &config.token,
            config.command_timeout(),
            config.retry.clone(),
        )?;
        let mut sessions = SessionManager::new(Arc::new(conn), SessionOptions::from_config(&config));
        sessions.start(&config.token)?;

        let action_spec = ActionSpec::for_kind(config.action_space);
        let obs_spec = ObservationSpec::from_config(&config);
        if let Err(e) = probe(&sessions, &obs_spec) {
            error!("sensor probe failed: {e}");
            if let Err(end) = sessions.end() {
                warn!("ending session after failed probe: {end}");
            }
            return Err(e);
        }

        let env = Self {
            translator: ActionTranslator::new(action_spec, config.variant),
            builder: ObservationBuilder::new(obs_spec),
            episode: EpisodeStateMachine::new(
                config.step_budget,
                strategy_for(config.variant, config.reward),
            ),
            action_spec,
            obs_spec,
            sessions,
            last_observation: None,
            closed: false,
            config,
        };
        info!("environment has been started");

        Ok(env)
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn episode(&self) -> &EpisodeStateMachine {
        &self.episode
    }

    pub fn session_status(&self) -> Option<SessionStatus> {
        self.sessions.status()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Re-lease the robot if the previous session is gone.
    fn ensure_session(&mut self) -> Result<()> {
        if self.sessions.status() == Some(SessionStatus::Active) {
            return Ok(());
        }
        info!("reconnecting: starting a new session");
        self.sessions.start(&self.config.token).map(|_| ())
    }

    /// Wait until the robot reports its canonical start pose.
    ///
    /// Every poll is bounded by what is left of the reset timeout.
    fn await_start_pose(&self) -> Result<Frame> {
        let timeout = self.config.reset_timeout();
        let deadline = Instant::now() + timeout;
        let conn = self.sessions.connection();

        let ack = self.sessions.send(RobotCommand::Reset)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GymError::Timeout {
                    op: "reset",
                    after: timeout,
                });
            }
            let session = self.sessions.ensure_active()?;
            let budget = remaining.min(conn.timeout());
            match conn.receive_frame_within(&session.session_id, ack.seq, budget) {
                Ok(frame) if frame.telemetry.at_start_pose => return Ok(frame),
                Ok(_) | Err(GymError::Timeout { .. }) | Err(GymError::Decode(_)) => {}
                Err(e) => return Err(e),
            }
            thread::sleep(RESET_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Safe-park on a fatal error and leave the environment needing a reset.
    fn fail(&mut self, e: GymError) -> GymError {
        error!("aborting episode: {e}");
        self.episode.abort();
        if e.is_session_fatal() {
            if let Err(end) = self.sessions.end() {
                warn!("ending lost session: {end}");
            }
        } else if let Err(park) = self.sessions.safe_park() {
            warn!("safe-park failed: {park}");
        }
        e
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(GymError::invalid_state("an open environment", "closed"))
        } else {
            Ok(())
        }
    }
}

fn probe(sessions: &SessionManager, spec: &ObservationSpec) -> Result<()> {
    let exchange = sessions.execute(RobotCommand::Probe)?;
    let frame = exchange.frame.ok_or(GymError::Timeout {
        op: "probe",
        after: sessions.connection().timeout(),
    })?;
    check_modalities(&frame, spec)
}

impl Env for RealEnv {
    fn action_space(&self) -> &ActionSpec {
        &self.action_spec
    }

    fn observation_space(&self) -> &ObservationSpec {
        &self.obs_spec
    }

    fn reset(&mut self) -> Result<Observation> {
        self.ensure_open()?;
        self.ensure_session()?;

        let frame = match self.await_start_pose() {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(e)),
        };
        let obs = match self.builder.reset(&frame) {
            Ok(obs) => obs,
            Err(e) => return Err(self.fail(e)),
        };
        self.episode.reset(frame.telemetry);
        self.last_observation = Some(obs.clone());
        info!("environment reset complete");

        Ok(obs)
    }

    fn step(&mut self, action: &Action) -> Result<StepResult> {
        self.ensure_open()?;
        self.episode.ensure_running()?;
        let active = self.sessions.ensure_active().map(|_| ());
        if let Err(e) = active {
            return Err(self.fail(e));
        }

        let translation = self.translator.translate(action)?;
        let exchange = match self.sessions.execute(translation.command.clone()) {
            Ok(exchange) => exchange,
            Err(e) => return Err(self.fail(e)),
        };

        let telemetry = exchange.frame.as_ref().map(|f| f.telemetry.clone());
        let observation = self.builder.push(exchange.frame.as_ref())?;
        let transition = self.episode.advance(telemetry)?;

        let mut info = Info::new();
        info.insert("seq".into(), json!(exchange.ack.seq));
        info.insert("frame_stale".into(), json!(observation.stale));
        translation.record(&mut info);
        self.episode.record(&mut info);
        self.last_observation = Some(observation.clone());

        Ok(StepResult {
            observation,
            reward: transition.reward,
            terminated: transition.terminated,
            truncated: transition.truncated,
            info,
        })
    }

    fn render(&self, mode: RenderMode) -> Result<RenderFrame> {
        render_latest(self.last_observation.as_ref(), &self.obs_spec, mode)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.episode.abort();
        info!("closing the environment");
        self.sessions.end()
    }
}

impl Drop for RealEnv {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing environment on drop: {e}");
        }
    }
}
