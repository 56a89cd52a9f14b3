//! Authenticated channel to the robot-control server.

pub mod codec;
pub mod http;
pub mod wire;

use crate::config::RetryPolicy;
use crate::error::{GymError, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use wire::*;

const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Request/response seam to the robot-control server.
///
/// Implementations map server replies onto [`GymError`]; the [`Connection`]
/// layered on top owns retries and sequencing.
pub trait RobotLink: Send + Sync {
    /// Establish (or re-establish) the authenticated channel.
    fn connect(&self, token: &str) -> Result<()>;

    fn validate_token(&self, token: &str) -> Result<BookingInfo>;

    fn open_session(&self, request: &SessionRequest) -> Result<SessionGrant>;

    fn send_command(&self, message: &CommandMessage) -> Result<CommandAck>;

    /// The newest frame at or after `seq`, `None` while the robot has not produced one.
    fn fetch_frame(&self, session_id: &str, seq: u64) -> Result<Option<FrameMessage>>;

    fn heartbeat(&self, message: &HeartbeatMessage) -> Result<HeartbeatAck>;

    fn close_session(&self, session_id: &str) -> Result<()>;
}

/// Raw depth readings in metres, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthBytes {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Raw sensor payload correlated with the command that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Encoded colour image.
    pub image: Option<Vec<u8>>,
    pub depth: Option<DepthBytes>,
    pub telemetry: Telemetry,
}

impl Frame {
    pub fn from_message(msg: FrameMessage) -> Result<Self> {
        let image = msg
            .image
            .as_deref()
            .map(codec::decode_base64)
            .transpose()?;
        let depth = msg
            .depth
            .map(|d| -> Result<DepthBytes> {
                Ok(DepthBytes {
                    width: d.width,
                    height: d.height,
                    data: codec::deserialize_binary_stream_to_bytes(&d.data)?,
                })
            })
            .transpose()?;

        Ok(Self {
            seq: msg.seq,
            timestamp: msg.timestamp,
            image,
            depth,
            telemetry: msg.telemetry,
        })
    }
}

/// Outcome of one command round trip.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub ack: CommandAck,
    /// `None` when the robot produced no usable frame before the deadline.
    pub frame: Option<Frame>,
}

/// A connected link with per-command sequencing, deadlines and bounded retries.
pub struct Connection {
    link: Arc<dyn RobotLink>,
    token: String,
    timeout: Duration,
    retry: RetryPolicy,
    next_seq: AtomicU64,
    in_flight: Mutex<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

impl Connection {
    pub fn connect(
        link: Arc<dyn RobotLink>,
        token: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let conn = Self {
            link,
            token: token.to_string(),
            timeout,
            retry,
            next_seq: AtomicU64::new(1),
            in_flight: Mutex::new(()),
        };
        conn.with_retry("connect", || conn.link.connect(&conn.token))?;
        debug!("connected to robot-control server");

        Ok(conn)
    }

    pub fn link(&self) -> &Arc<dyn RobotLink> {
        &self.link
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sequence number of the most recently issued command, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    /// Send one command and wait for the frame it produced.
    ///
    /// Only one command is outstanding at a time; concurrent callers queue.
    /// A frame that is missing or undecodable by the deadline yields
    /// `frame: None` rather than an error.
    pub fn execute(&self, session_id: &str, command: RobotCommand) -> Result<Exchange> {
        self.execute_guarded(session_id, command, || Ok(()))
    }

    /// [`Connection::execute`], with `admit` run under the in-flight lock
    /// right before sending. An error from `admit` sends nothing.
    pub fn execute_guarded(
        &self,
        session_id: &str,
        command: RobotCommand,
        admit: impl FnOnce() -> Result<()>,
    ) -> Result<Exchange> {
        let _guard = self.lock_in_flight();
        admit()?;
        let ack = self.send_locked(session_id, command)?;
        let frame = match self.receive_locked(session_id, ack.seq, self.timeout) {
            Ok(frame) => Some(frame),
            Err(GymError::Timeout { .. }) => {
                warn!(seq = ack.seq, "no frame before deadline");
                None
            }
            Err(GymError::Decode(e)) => {
                warn!(seq = ack.seq, "dropping undecodable frame: {e}");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Exchange { ack, frame })
    }

    /// Send one command without awaiting a frame.
    pub fn send(&self, session_id: &str, command: RobotCommand) -> Result<CommandAck> {
        self.send_guarded(session_id, command, || Ok(()))
    }

    pub fn send_guarded(
        &self,
        session_id: &str,
        command: RobotCommand,
        admit: impl FnOnce() -> Result<()>,
    ) -> Result<CommandAck> {
        let _guard = self.lock_in_flight();
        admit()?;
        self.send_locked(session_id, command)
    }

    /// Wait for the frame correlated with `seq`, discarding older ones.
    pub fn receive_frame(&self, session_id: &str, seq: u64) -> Result<Frame> {
        self.receive_frame_within(session_id, seq, self.timeout)
    }

    /// [`Connection::receive_frame`] with a deadline of `budget` instead of the command timeout.
    pub fn receive_frame_within(&self, session_id: &str, seq: u64, budget: Duration) -> Result<Frame> {
        let _guard = self.lock_in_flight();
        self.receive_locked(session_id, seq, budget)
    }

    /// Block until no command is in flight.
    pub fn quiesce(&self) {
        drop(self.lock_in_flight());
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (), so a poisoned lock carries no broken state.
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_locked(&self, session_id: &str, command: RobotCommand) -> Result<CommandAck> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let message = CommandMessage {
            session_id: session_id.to_string(),
            seq,
            command,
            sent_at: Utc::now(),
        };
        debug!(seq, command = message.command.kind(), "sending command");

        // Retries resend the same seq so the server can drop duplicates.
        let ack = self.with_retry("send", || self.link.send_command(&message))?;
        if ack.seq != seq {
            return Err(GymError::Protocol(format!(
                "ack for seq {} while awaiting {seq}",
                ack.seq
            )));
        }
        if !ack.accepted {
            return Err(GymError::Protocol(format!(
                "command {seq} refused: {}",
                ack.message.as_deref().unwrap_or("no reason given")
            )));
        }

        Ok(ack)
    }

    fn receive_locked(&self, session_id: &str, seq: u64, budget: Duration) -> Result<Frame> {
        let deadline = Instant::now() + budget;
        loop {
            let msg = self.with_retry("receive_frame", || self.link.fetch_frame(session_id, seq))?;
            match msg {
                Some(msg) if msg.seq >= seq => return Frame::from_message(msg),
                Some(msg) => debug!(stale = msg.seq, awaited = seq, "discarding stale frame"),
                None => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GymError::Timeout {
                    op: "receive_frame",
                    after: budget,
                });
            }
            thread::sleep(FRAME_POLL_INTERVAL.min(deadline - now));
        }
    }

    pub(crate) fn with_retry<T>(&self, op: &'static str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retries = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && retries < self.retry.max_retries => {
                    let backoff = self.retry.backoff(retries);
                    retries += 1;
                    warn!(op, retries, ?backoff, "transient failure: {e}");
                    thread::sleep(backoff);
                    if let Err(e) = self.link.connect(&self.token) {
                        if !e.is_transient() {
                            return Err(e);
                        }
                        warn!(op, "reconnect failed: {e}");
                    }
                }
                Err(e) if e.is_transient() => {
                    error!(op, attempts = retries + 1, "giving up: {e}");
                    return Err(GymError::ConnectionLost {
                        attempts: retries + 1,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
