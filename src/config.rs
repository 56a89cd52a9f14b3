use crate::error::{GymError, Result};
use crate::spaces::Channels;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const TOKEN_VAR: &str = "ROBOT_GYM_TOKEN";
pub const ENDPOINT_VAR: &str = "ROBOT_GYM_ENDPOINT";
pub const EXPERIMENT_VAR: &str = "ROBOT_GYM_EXPERIMENT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Real,
    Simulated,
}

/// The task layout the robot operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvVariant {
    /// Reach the monolith on open terrain.
    Monolith,
    /// Reach the monolith with obstacles scattered around the arena.
    MonolithObstacle,
}

impl EnvVariant {
    pub fn has_obstacles(&self) -> bool {
        matches!(self, EnvVariant::MonolithObstacle)
    }

    pub fn id(&self) -> &'static str {
        match self {
            EnvVariant::Monolith => "monolith",
            EnvVariant::MonolithObstacle => "monolith_obstacle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Discrete,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmMode {
    Train,
    Test,
}

/// Where the per-step reward comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardSource {
    /// Computed client-side by the strategy registered for the variant.
    Variant,
    /// Taken verbatim from the reward the robot server reports.
    Server,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given retry, doubling from the initial value.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Environment construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub backend: Backend,
    pub variant: EnvVariant,
    pub action_space: ActionKind,
    pub channels: Channels,
    pub step_budget: u32,
    pub token: String,
    pub endpoint: String,
    pub experiment_name: String,
    pub resume_experiment: bool,
    pub algorithm_mode: AlgorithmMode,
    pub reward: RewardSource,
    pub image_height: usize,
    pub image_width: usize,
    pub history: usize,
    pub depth_max: f32,
    pub command_timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub retry: RetryPolicy,
    pub seed: Option<u64>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Real,
            variant: EnvVariant::Monolith,
            action_space: ActionKind::Discrete,
            channels: Channels::DepthOnly,
            step_budget: 100,
            token: String::new(),
            endpoint: "https://127.0.0.1:40004".to_string(),
            experiment_name: "default".to_string(),
            resume_experiment: false,
            algorithm_mode: AlgorithmMode::Train,
            reward: RewardSource::Variant,
            image_height: 240,
            image_width: 320,
            history: 1,
            depth_max: 10.0,
            command_timeout_ms: 5_000,
            reset_timeout_ms: 60_000,
            heartbeat_interval_ms: 1_000,
            max_missed_heartbeats: 3,
            retry: RetryPolicy::default(),
            seed: None,
        }
    }
}

impl EnvConfig {
    pub fn simulated() -> Self {
        Self {
            backend: Backend::Simulated,
            ..Self::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| GymError::Config(e.to_string()))
    }

    /// Loads a JSON config file and applies environment variable overrides.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| GymError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_json_str(&s)?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    pub(crate) fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup(TOKEN_VAR) {
            self.token = token;
        }
        if let Some(endpoint) = lookup(ENDPOINT_VAR) {
            self.endpoint = endpoint;
        }
        if let Some(name) = lookup(EXPERIMENT_VAR) {
            self.experiment_name = name;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Real {
            if self.token.trim().is_empty() {
                return Err(GymError::Config("an access token is required".into()));
            }
            if self.endpoint.trim().is_empty() {
                return Err(GymError::Config("a server endpoint is required".into()));
            }
        }
        if self.step_budget == 0 {
            return Err(GymError::Config("step_budget must be positive".into()));
        }
        if self.history == 0 {
            return Err(GymError::Config("history must be at least 1".into()));
        }
        if self.image_height == 0 || self.image_width == 0 {
            return Err(GymError::Config("image resolution must be non-zero".into()));
        }
        if self.depth_max <= 0.0 {
            return Err(GymError::Config("depth_max must be positive".into()));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(GymError::Config("max_missed_heartbeats must be positive".into()));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_json_fills_defaults() {
        let config = EnvConfig::from_json_str(
            r#"{ "variant": "monolith_obstacle", "channels": "rgbd", "token": "t-1" }"#,
        )
        .unwrap();

        assert_eq!(config.variant, EnvVariant::MonolithObstacle);
        assert_eq!(config.channels, Channels::Rgbd);
        assert_eq!(config.step_budget, 100);
        assert_eq!(config.retry, RetryPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn unknown_variant_is_a_config_error() {
        let err = EnvConfig::from_json_str(r#"{ "variant": "maze" }"#).unwrap_err();
        assert!(matches!(err, GymError::Config(_)));
    }

    #[test]
    fn overrides_take_precedence() {
        let vars = HashMap::from([(TOKEN_VAR, "from-env"), (ENDPOINT_VAR, "http://robot:9")]);
        let mut config = EnvConfig {
            token: "from-file".into(),
            ..EnvConfig::default()
        };
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.token, "from-env");
        assert_eq!(config.endpoint, "http://robot:9");
        assert_eq!(config.experiment_name, "default");
    }

    #[test]
    fn real_backend_requires_token() {
        let err = EnvConfig::default().validate().unwrap_err();
        assert!(matches!(err, GymError::Config(_)));
        EnvConfig::simulated().validate().unwrap();
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(5), Duration::from_millis(2_000));
    }
}
