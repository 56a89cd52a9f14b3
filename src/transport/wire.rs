//! Messages exchanged with the robot-control server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Motion {
    TurnLeft,
    TurnRight,
    MoveForward,
    MoveBackward,
}

/// A primitive command understood by the robot-side control API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobotCommand {
    /// One of the four fixed discrete motions.
    Motion {
        motion: Motion,
        linear: f64,
        angular: f64,
        duration_ms: u64,
    },
    /// Velocity set-points held for `duration_ms`.
    Velocity {
        angular: f64,
        linear: f64,
        duration_ms: u64,
    },
    /// Drive back to the canonical start pose.
    Reset,
    /// Capture sensors without moving.
    Probe,
    /// Bring the robot to a stationary, safe state.
    SafePark,
}

impl RobotCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            RobotCommand::Motion { .. } => "motion",
            RobotCommand::Velocity { .. } => "velocity",
            RobotCommand::Reset => "reset",
            RobotCommand::Probe => "probe",
            RobotCommand::SafePark => "safe_park",
        }
    }

    pub fn moves_robot(&self) -> bool {
        matches!(
            self,
            RobotCommand::Motion { .. } | RobotCommand::Velocity { .. } | RobotCommand::Reset
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub session_id: String,
    pub seq: u64,
    pub command: RobotCommand,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub seq: u64,
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

/// Robot state reported alongside every frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    pub pose: Pose,
    /// Metres from the robot to the goal.
    pub goal_distance: f64,
    /// Metres to the nearest obstacle, when the variant has any.
    pub obstacle_distance: Option<f64>,
    pub collision: bool,
    pub out_of_bounds: bool,
    pub goal_reached: bool,
    pub at_start_pose: bool,
    /// Reward as scored by the server, if it scores episodes.
    pub reward: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthPayload {
    pub width: u32,
    pub height: u32,
    /// Base64 of zlib-compressed little-endian `f32` rows.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Base64 of an encoded (PNG or JPEG) colour image.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub depth: Option<DepthPayload>,
    #[serde(default)]
    pub telemetry: Telemetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub session_id: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub alive: bool,
}

/// Answer of the booking collaborator for an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingInfo {
    pub valid: bool,
    pub robot_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
}

impl BookingInfo {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.window_start <= now && now < self.window_end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub token: String,
    pub robot_id: String,
    pub variant: String,
    pub experiment_name: String,
    pub resume_experiment: bool,
    pub algorithm_mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_id: String,
    pub robot_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn velocity_command_wire_format() {
        let command = RobotCommand::Velocity {
            angular: 0.25,
            linear: -0.5,
            duration_ms: 500,
        };
        insta::assert_yaml_snapshot!(command, @r###"
        ---
        type: velocity
        angular: 0.25
        linear: -0.5
        duration_ms: 500
        "###);
    }

    #[test]
    fn unit_commands_are_tagged() {
        let json = serde_json::to_value(RobotCommand::SafePark).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "safe_park" }));
    }

    #[test]
    fn frame_without_payloads_parses() {
        let frame: FrameMessage = serde_json::from_str(
            r#"{ "seq": 4, "timestamp": "2026-03-01T10:00:00Z", "telemetry": { "goal_distance": 2.5 } }"#,
        )
        .unwrap();
        assert_eq!(frame.seq, 4);
        assert!(frame.image.is_none() && frame.depth.is_none());
        assert_eq!(frame.telemetry.goal_distance, 2.5);
        assert!(!frame.telemetry.collision);
    }

    #[test]
    fn booking_window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 11, 0, 0).unwrap();
        let booking = BookingInfo {
            valid: true,
            robot_id: "rosbot-1".into(),
            window_start: start,
            window_end: end,
            message: None,
        };
        assert!(booking.is_current(start));
        assert!(!booking.is_current(end));
    }
}
