use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the environment, its session, and its transport.
#[derive(Error, Debug)]
pub enum GymError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("booking token rejected: {0}")]
    InvalidToken(String),

    #[error("booking slot is not active: {0}")]
    SlotNotActive(String),

    #[error("robot is held by another session: {0}")]
    RobotBusy(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("link error: {0}")]
    Link(String),

    #[error("connection to the robot lost after {attempts} attempts")]
    ConnectionLost { attempts: u32 },

    #[error("session expired, reset the environment to reconnect")]
    SessionExpired,

    #[error("action out of range: {0}")]
    ActionOutOfRange(String),

    #[error("requested modality '{0}' is not provided by the robot")]
    ModalityUnavailable(&'static str),

    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("could not decode sensor payload: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, GymError>;

impl GymError {
    /// Errors the transport absorbs with bounded retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GymError::Network(_) | GymError::Timeout { .. } | GymError::Link(_)
        )
    }

    /// Errors after which the session cannot carry further commands.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            GymError::ConnectionLost { .. } | GymError::SessionExpired
        )
    }

    pub(crate) fn invalid_state(expected: &'static str, actual: impl ToString) -> Self {
        GymError::InvalidState {
            expected,
            actual: actual.to_string(),
        }
    }
}

impl From<serde_json::Error> for GymError {
    fn from(e: serde_json::Error) -> Self {
        GymError::Protocol(e.to_string())
    }
}

impl From<image::ImageError> for GymError {
    fn from(e: image::ImageError) -> Self {
        GymError::Decode(e.to_string())
    }
}

impl From<base64::DecodeError> for GymError {
    fn from(e: base64::DecodeError) -> Self {
        GymError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_and_fatal() {
        assert!(GymError::Network("reset".into()).is_transient());
        assert!(GymError::Timeout {
            op: "send",
            after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!GymError::RobotBusy("held".into()).is_transient());
        assert!(!GymError::Auth("bad".into()).is_transient());
        assert!(GymError::SessionExpired.is_session_fatal());
        assert!(GymError::ConnectionLost { attempts: 3 }.is_session_fatal());
        assert!(!GymError::Link("closed".into()).is_session_fatal());
    }
}
