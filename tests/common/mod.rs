use chrono::{Duration as ChronoDuration, Utc};
use image::{ImageFormat, Rgb, RgbImage};
use robot_gym::config::RetryPolicy;
use robot_gym::transport::codec;
use robot_gym::transport::wire::*;
use robot_gym::transport::RobotLink;
use robot_gym::*;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const TOKEN: &str = "valid-token";
pub const STALE_TOKEN: &str = "yesterday-token";
pub const FRAME_W: u32 = 8;
pub const FRAME_H: u32 = 6;

/// In-memory robot-control server holding a single robot.
#[derive(Default)]
pub struct FakeRobot {
    pub with_rgb: bool,
    pub with_depth: bool,
    /// Another user holds the lease.
    pub held_elsewhere: AtomicBool,
    pub fail_heartbeats: AtomicBool,
    /// Motion commands fail with a link error; safe-park still gets through.
    pub fail_motion: AtomicBool,
    pub drop_frames: AtomicBool,
    /// The robot answers safe-park with a fault.
    pub refuse_safe_park: AtomicBool,
    pub never_at_start: AtomicBool,
    /// Telemetry reported with every frame, `at_start_pose` aside.
    pub telemetry: Mutex<Telemetry>,

    pub connects: AtomicU32,
    pub open_sessions: AtomicU32,
    pub closed_sessions: AtomicU32,
    pub heartbeats: AtomicU32,
    pub commands: Mutex<Vec<RobotCommand>>,
    pub refused_parks: AtomicU32,
    pub delivered_parks: AtomicU32,

    lease: Mutex<Option<String>>,
    last_seq: AtomicU64,
    at_start: AtomicBool,
}

#[allow(dead_code)]
impl FakeRobot {
    pub fn new() -> Self {
        Self {
            with_depth: true,
            telemetry: Mutex::new(Telemetry {
                goal_distance: 3.,
                ..Telemetry::default()
            }),
            ..Self::default()
        }
    }

    pub fn rgbd() -> Self {
        Self {
            with_rgb: true,
            ..Self::new()
        }
    }

    pub fn without_depth() -> Self {
        Self {
            with_rgb: true,
            with_depth: false,
            ..Self::new()
        }
    }

    pub fn set_telemetry(&self, telemetry: Telemetry) {
        *self.telemetry.lock().unwrap() = telemetry;
    }

    pub fn count(&self, kind: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.kind() == kind)
            .count()
    }

    pub fn safe_parks(&self) -> usize {
        self.count("safe_park")
    }

    pub fn motions(&self) -> usize {
        self.count("motion") + self.count("velocity")
    }

    pub fn last_command(&self) -> Option<RobotCommand> {
        self.commands.lock().unwrap().last().cloned()
    }

    fn frame(&self, seq: u64) -> FrameMessage {
        let image = self.with_rgb.then(|| {
            let img = RgbImage::from_pixel(FRAME_W, FRAME_H, Rgb([255, 0, 51]));
            let mut png = Cursor::new(Vec::new());
            img.write_to(&mut png, ImageFormat::Png).unwrap();
            codec::encode_base64(&png.into_inner())
        });
        let depth = self.with_depth.then(|| {
            let readings = vec![2.5f32; (FRAME_W * FRAME_H) as usize];
            DepthPayload {
                width: FRAME_W,
                height: FRAME_H,
                data: codec::serialize_bytes_to_binary_stream(&codec::f32s_to_le_bytes(&readings))
                    .unwrap(),
            }
        });

        FrameMessage {
            seq,
            timestamp: Utc::now(),
            image,
            depth,
            telemetry: Telemetry {
                at_start_pose: self.at_start.load(Ordering::SeqCst),
                ..self.telemetry.lock().unwrap().clone()
            },
        }
    }
}

impl RobotLink for FakeRobot {
    fn connect(&self, _token: &str) -> robot_gym::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn validate_token(&self, token: &str) -> robot_gym::Result<BookingInfo> {
        let now = Utc::now();
        let (valid, start, end) = match token {
            TOKEN => (true, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1)),
            STALE_TOKEN => (true, now - ChronoDuration::hours(25), now - ChronoDuration::hours(24)),
            _ => (false, now, now),
        };
        Ok(BookingInfo {
            valid,
            robot_id: "robot-1".into(),
            window_start: start,
            window_end: end,
            message: (!valid).then(|| "unknown token".to_string()),
        })
    }

    fn open_session(&self, _request: &SessionRequest) -> robot_gym::Result<SessionGrant> {
        let n = self.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut lease = self.lease.lock().unwrap();
        if self.held_elsewhere.load(Ordering::SeqCst) || lease.is_some() {
            return Err(GymError::RobotBusy("robot-1 is leased".into()));
        }
        let session_id = format!("session-{n}");
        *lease = Some(session_id.clone());
        Ok(SessionGrant {
            session_id,
            robot_id: "robot-1".into(),
            message: None,
        })
    }

    fn send_command(&self, message: &CommandMessage) -> robot_gym::Result<CommandAck> {
        self.commands.lock().unwrap().push(message.command.clone());
        if self.lease.lock().unwrap().as_deref() != Some(message.session_id.as_str()) {
            return Err(GymError::SessionExpired);
        }
        match message.command {
            RobotCommand::Motion { .. } | RobotCommand::Velocity { .. } => {
                if self.fail_motion.load(Ordering::SeqCst) {
                    return Err(GymError::Link("robot unreachable".into()));
                }
                self.at_start.store(false, Ordering::SeqCst);
            }
            RobotCommand::Reset => {
                let reached = !self.never_at_start.load(Ordering::SeqCst);
                self.at_start.store(reached, Ordering::SeqCst);
            }
            RobotCommand::SafePark => {
                if self.refuse_safe_park.load(Ordering::SeqCst) {
                    self.refused_parks.fetch_add(1, Ordering::SeqCst);
                    return Err(GymError::Protocol("brake fault".into()));
                }
                self.delivered_parks.fetch_add(1, Ordering::SeqCst);
            }
            RobotCommand::Probe => {}
        }
        self.last_seq.store(message.seq, Ordering::SeqCst);

        Ok(CommandAck {
            seq: message.seq,
            accepted: true,
            message: None,
        })
    }

    fn fetch_frame(&self, _session_id: &str, _seq: u64) -> robot_gym::Result<Option<FrameMessage>> {
        if self.drop_frames.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(self.frame(self.last_seq.load(Ordering::SeqCst))))
    }

    fn heartbeat(&self, _message: &HeartbeatMessage) -> robot_gym::Result<HeartbeatAck> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            Err(GymError::Network("heartbeat lost".into()))
        } else {
            Ok(HeartbeatAck { alive: true })
        }
    }

    fn close_session(&self, session_id: &str) -> robot_gym::Result<()> {
        self.closed_sessions.fetch_add(1, Ordering::SeqCst);
        let mut lease = self.lease.lock().unwrap();
        if lease.as_deref() == Some(session_id) {
            *lease = None;
        }
        Ok(())
    }
}

/// Small frames and short deadlines so failure paths resolve quickly.
#[allow(dead_code)]
pub fn test_config(channels: Channels, action_space: ActionKind) -> EnvConfig {
    EnvConfig {
        token: TOKEN.into(),
        channels,
        action_space,
        image_height: FRAME_H as usize,
        image_width: FRAME_W as usize,
        command_timeout_ms: 60,
        reset_timeout_ms: 300,
        heartbeat_interval_ms: 20,
        max_missed_heartbeats: 3,
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        },
        ..EnvConfig::default()
    }
}

/// Poll `cond` until it holds or `within` elapses.
#[allow(dead_code)]
pub fn eventually(within: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
