//! Exclusive, server-confirmed lease on the physical robot.

use crate::config::{AlgorithmMode, EnvConfig, EnvVariant};
use crate::error::{GymError, Result};
use crate::transport::wire::*;
use crate::transport::{Connection, Exchange};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Active,
    Expired,
    Terminated,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// State shared between the foreground caller and the heartbeat thread.
#[derive(Debug)]
struct SessionShared {
    status: Mutex<SessionStatus>,
    missed: AtomicU32,
    parked: AtomicBool,
}

impl SessionShared {
    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Gate for a command about to go on the wire, checked under the in-flight lock.
    fn admit(&self, moves: bool) -> Result<()> {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        match *status {
            SessionStatus::Active => {}
            SessionStatus::Expired => return Err(GymError::SessionExpired),
            other => return Err(GymError::invalid_state("an active session", other)),
        }
        if moves {
            self.parked.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Moves Active to Expired; returns whether this call made the transition.
    fn expire(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == SessionStatus::Active {
            *status = SessionStatus::Expired;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub robot_id: String,
    pub token: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.shared.missed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub variant: EnvVariant,
    pub experiment_name: String,
    pub resume_experiment: bool,
    pub algorithm_mode: AlgorithmMode,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
}

impl SessionOptions {
    pub fn from_config(config: &EnvConfig) -> Self {
        Self {
            variant: config.variant,
            experiment_name: config.experiment_name.clone(),
            resume_experiment: config.resume_experiment,
            algorithm_mode: config.algorithm_mode,
            heartbeat_interval: config.heartbeat_interval(),
            max_missed_heartbeats: config.max_missed_heartbeats,
        }
    }
}

struct Heartbeat {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Owns the lifecycle of one booked session at a time.
pub struct SessionManager {
    conn: Arc<Connection>,
    options: SessionOptions,
    session: Option<Session>,
    heartbeat: Option<Heartbeat>,
}

impl SessionManager {
    pub fn new(conn: Arc<Connection>, options: SessionOptions) -> Self {
        Self {
            conn,
            options,
            session: None,
            heartbeat: None,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.session.as_ref().map(Session::status)
    }

    /// Validate the booking and acquire the robot.
    ///
    /// Rejections from the booking collaborator or the robot server are
    /// returned as-is and never retried.
    pub fn start(&mut self, booking_token: &str) -> Result<&Session> {
        if let Some(status) = self.status() {
            if status == SessionStatus::Active || status == SessionStatus::Pending {
                return Err(GymError::invalid_state("no live session", status));
            }
        }
        // Whatever is left over is dead; release it before leasing anew.
        if let Err(e) = self.end() {
            warn!("releasing previous session: {e}");
        }

        let link = self.conn.link();
        let booking = self
            .conn
            .with_retry("validate_token", || link.validate_token(booking_token))?;
        if !booking.valid {
            return Err(GymError::InvalidToken(
                booking.message.unwrap_or_else(|| "token rejected".into()),
            ));
        }
        if !booking.is_current(Utc::now()) {
            return Err(GymError::SlotNotActive(format!(
                "booking runs from {} to {}",
                booking.window_start, booking.window_end
            )));
        }

        let request = SessionRequest {
            token: booking_token.to_string(),
            robot_id: booking.robot_id.clone(),
            variant: self.options.variant.id().to_string(),
            experiment_name: self.options.experiment_name.clone(),
            resume_experiment: self.options.resume_experiment,
            algorithm_mode: match self.options.algorithm_mode {
                AlgorithmMode::Train => "train".into(),
                AlgorithmMode::Test => "test".into(),
            },
        };
        let grant = self
            .conn
            .with_retry("open_session", || link.open_session(&request))?;
        if let Some(message) = &grant.message {
            info!("{message}");
        }

        let shared = Arc::new(SessionShared {
            status: Mutex::new(SessionStatus::Pending),
            missed: AtomicU32::new(0),
            parked: AtomicBool::new(false),
        });
        let session = Session {
            session_id: grant.session_id,
            robot_id: grant.robot_id,
            token: booking_token.to_string(),
            window_start: booking.window_start,
            window_end: booking.window_end,
            shared,
        };
        info!(
            session = %session.session_id,
            robot = %session.robot_id,
            until = %session.window_end,
            "session started"
        );

        let heartbeat = self.spawn_heartbeat(&session);
        self.session = Some(session);
        match heartbeat {
            Ok(heartbeat) => {
                self.heartbeat = Some(heartbeat);
                if let Some(session) = &self.session {
                    session.shared.set_status(SessionStatus::Active);
                }
            }
            Err(e) => {
                if let Err(end) = self.end() {
                    warn!("releasing session after failed start: {end}");
                }
                return Err(e);
            }
        }
        self.ensure_active()
    }

    /// The current session if it can still carry commands.
    pub fn ensure_active(&self) -> Result<&Session> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| GymError::invalid_state("an active session", "none"))?;
        match session.status() {
            SessionStatus::Active => Ok(session),
            SessionStatus::Expired => Err(GymError::SessionExpired),
            status => Err(GymError::invalid_state("an active session", status)),
        }
    }

    /// Send one heartbeat now, with the same accounting as the background timer.
    pub fn heartbeat(&self) -> Result<()> {
        let session = self.ensure_active()?;
        beat(&self.conn, session, self.options.max_missed_heartbeats)
    }

    /// Execute a command on the active session, failing fast once it is dead.
    ///
    /// Liveness is checked again once the command holds the line, so a
    /// session expired by the heartbeat while this call queued sends nothing.
    pub fn execute(&self, command: RobotCommand) -> Result<Exchange> {
        let session = self.ensure_active()?;
        let moves = command.moves_robot();
        let result = self
            .conn
            .execute_guarded(&session.session_id, command, || session.shared.admit(moves));
        settle(session, result)
    }

    /// Like [`SessionManager::execute`] without waiting for a frame.
    pub fn send(&self, command: RobotCommand) -> Result<CommandAck> {
        let session = self.ensure_active()?;
        let moves = command.moves_robot();
        let result = self
            .conn
            .send_guarded(&session.session_id, command, || session.shared.admit(moves));
        settle(session, result)
    }

    /// Best-effort stop; not resent until the robot has moved again.
    pub fn safe_park(&self) -> Result<()> {
        match &self.session {
            Some(session) => safe_park(&self.conn, session),
            None => Ok(()),
        }
    }

    /// Safe-park the robot and release the session. Idempotent.
    pub fn end(&mut self) -> Result<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            // Send only fails if the thread already exited.
            let _ = heartbeat.stop.send(());
            if heartbeat.thread.join().is_err() {
                error!("heartbeat thread panicked");
            }
        }

        let Some(session) = self.session.take() else {
            return Ok(());
        };
        if session.status() == SessionStatus::Terminated {
            return Ok(());
        }

        let parked = safe_park(&self.conn, &session);
        self.conn.quiesce();
        if let Err(e) = self.conn.link().close_session(&session.session_id) {
            warn!(session = %session.session_id, "releasing session failed: {e}");
        }
        session.shared.set_status(SessionStatus::Terminated);
        info!(session = %session.session_id, "session ended");

        parked
    }

    fn spawn_heartbeat(&self, session: &Session) -> Result<Heartbeat> {
        let (stop, rx) = mpsc::channel::<()>();
        let conn = Arc::clone(&self.conn);
        let session = session.clone();
        let interval = self.options.heartbeat_interval;
        let max_missed = self.options.max_missed_heartbeats;

        let thread = thread::Builder::new()
            .name(format!("heartbeat-{}", session.session_id))
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => return,
                }
                match session.status() {
                    SessionStatus::Active => {}
                    SessionStatus::Pending => continue,
                    _ => return,
                }
                if let Err(e) = beat(&conn, &session, max_missed) {
                    warn!(session = %session.session_id, "heartbeat stopped: {e}");
                    return;
                }
            })
            .map_err(|e| GymError::Link(format!("spawning heartbeat: {e}")))?;

        Ok(Heartbeat { stop, thread })
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Err(e) = self.end() {
            warn!("ending session on drop: {e}");
        }
    }
}

fn beat(conn: &Connection, session: &Session, max_missed: u32) -> Result<()> {
    if Utc::now() >= session.window_end {
        return expire(conn, session, "booking window ended");
    }

    let message = HeartbeatMessage {
        session_id: session.session_id.clone(),
        sent_at: Utc::now(),
    };
    match conn.link().heartbeat(&message) {
        Ok(ack) if ack.alive => {
            session.shared.missed.store(0, Ordering::SeqCst);
            debug!(session = %session.session_id, "heartbeat");
            Ok(())
        }
        Ok(_) => expire(conn, session, "server declared the session dead"),
        Err(GymError::SessionExpired) => expire(conn, session, "server expired the session"),
        Err(e) => {
            let missed = session.shared.missed.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(session = %session.session_id, missed, "missed heartbeat: {e}");
            if missed >= max_missed {
                expire(conn, session, "too many missed heartbeats")
            } else {
                Ok(())
            }
        }
    }
}

fn expire(conn: &Connection, session: &Session, reason: &str) -> Result<()> {
    if session.shared.expire() {
        error!(session = %session.session_id, "session expired: {reason}");
        if let Err(e) = safe_park(conn, session) {
            warn!("safe-park after expiry failed: {e}");
        }
    }
    Err(GymError::SessionExpired)
}

fn settle<T>(session: &Session, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if e.is_session_fatal() && session.shared.expire() {
            warn!(session = %session.session_id, "session lost: {e}");
        }
    }
    result
}

fn safe_park(conn: &Connection, session: &Session) -> Result<()> {
    let parked = &session.shared.parked;
    if parked
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }
    info!(session = %session.session_id, "safe-parking robot");
    let sent = conn
        .send(&session.session_id, RobotCommand::SafePark)
        .map(|_| ());
    if sent.is_err() {
        // Still unparked; the next end or close tries again.
        parked.store(false, Ordering::SeqCst);
    }
    sent
}
