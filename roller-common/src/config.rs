//! Configuration for the AutoRoll daemon.
//!
//! Loaded from a TOML file; every field has a sensible default so a
//! minimal deployment needs nothing beyond the review-system URL.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ErrorCode, RollerError};

/// Serde adapter for human-friendly duration strings ("30m", "1h 15m").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollerConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub roll: RollConfig,
    #[serde(default)]
    pub safety_throttle: SafetyThrottleConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name of this roller instance (used in manual-roll routing and logs).
    #[serde(default = "default_roller_name")]
    pub roller_name: String,
    /// Working directory holding counters, FSM state, and recent rolls.
    /// Defaults to the platform data directory.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            roller_name: default_roller_name(),
            workdir: None,
            log_level: default_log_level(),
        }
    }
}

impl GeneralConfig {
    /// Resolve the working directory, falling back to the platform data dir.
    pub fn resolve_workdir(&self) -> Result<PathBuf, RollerError> {
        if let Some(dir) = &self.workdir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("dev", "autoroll", "rollerd")
            .map(|dirs| dirs.data_dir().join(&self.roller_name))
            .ok_or_else(|| {
                RollerError::fatal(format!(
                    "{}: no home directory available",
                    ErrorCode::ConfigWorkdirError.code_str()
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollConfig {
    /// Main decision-tick cadence.
    #[serde(default = "default_tick_interval", with = "duration_str")]
    pub tick_interval: Duration,
    /// Repo refresh cadence.
    #[serde(default = "default_repo_tick_interval", with = "duration_str")]
    pub repo_tick_interval: Duration,
    /// Minimum spacing between landed rolls. Zero disables the
    /// success-frequency throttle.
    #[serde(default = "default_max_roll_frequency", with = "duration_str")]
    pub max_roll_frequency: Duration,
    /// Bound on the in-memory recent-rolls view.
    #[serde(default = "default_recent_rolls")]
    pub recent_rolls: usize,
}

impl Default for RollConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            repo_tick_interval: default_repo_tick_interval(),
            max_roll_frequency: default_max_roll_frequency(),
            recent_rolls: default_recent_rolls(),
        }
    }
}

/// Attempt-safety throttle knobs: refuse to upload once `limit` uploads
/// have happened within `window`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyThrottleConfig {
    #[serde(default = "default_attempt_limit")]
    pub limit: usize,
    #[serde(default = "default_attempt_window", with = "duration_str")]
    pub window: Duration,
}

impl Default for SafetyThrottleConfig {
    fn default() -> Self {
        Self {
            limit: default_attempt_limit(),
            window: default_attempt_window(),
        }
    }
}

/// Which review-system variant to speak, and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    /// One of `cq`, `pull_request`, `external_ci`.
    #[serde(default = "default_review_variant")]
    pub variant: String,
    /// Base URL of the review service.
    #[serde(default = "default_review_url")]
    pub base_url: String,
    /// Project/repository identifier at the review service.
    #[serde(default)]
    pub project: String,
    /// Request timeout for review calls.
    #[serde(default = "default_review_timeout", with = "duration_str")]
    pub timeout: Duration,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            variant: default_review_variant(),
            base_url: default_review_url(),
            project: String::new(),
            timeout: default_review_timeout(),
        }
    }
}

/// Where the repo-inspector service (parent/child repository plumbing)
/// listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Base URL of the repo-inspector service.
    #[serde(default = "default_repo_url")]
    pub base_url: String,
    /// Request timeout for inspector calls.
    #[serde(default = "default_repo_timeout", with = "duration_str")]
    pub timeout: Duration,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            base_url: default_repo_url(),
            timeout: default_repo_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port for the status/metrics HTTP server. Zero disables it.
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

impl RollerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, RollerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RollerError::validation(format!(
                "{}: {}: {e}",
                ErrorCode::ConfigNotFound.code_str(),
                path.display()
            ))
        })?;
        let config: Self = toml::from_str(&raw).map_err(|e| {
            RollerError::validation(format!(
                "{}: {}: {e}",
                ErrorCode::ConfigParseError.code_str(),
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<(), RollerError> {
        if self.general.roller_name.is_empty() {
            return Err(RollerError::validation(format!(
                "{}: roller_name must not be empty",
                ErrorCode::ConfigValidationError.code_str()
            )));
        }
        if self.safety_throttle.limit == 0 {
            return Err(RollerError::validation(format!(
                "{}: safety_throttle.limit must be at least 1",
                ErrorCode::ConfigValidationError.code_str()
            )));
        }
        if self.safety_throttle.window.is_zero() {
            return Err(RollerError::validation(format!(
                "{}: safety_throttle.window must be nonzero",
                ErrorCode::ConfigValidationError.code_str()
            )));
        }
        if self.roll.tick_interval.is_zero() || self.roll.repo_tick_interval.is_zero() {
            return Err(RollerError::validation(format!(
                "{}: tick intervals must be nonzero",
                ErrorCode::ConfigValidationError.code_str()
            )));
        }
        if !matches!(self.review.variant.as_str(), "cq" | "pull_request" | "external_ci") {
            return Err(RollerError::validation(format!(
                "{}: unknown review variant {:?}",
                ErrorCode::ConfigValidationError.code_str(),
                self.review.variant
            )));
        }
        Ok(())
    }
}

fn default_roller_name() -> String {
    "child-into-parent".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_repo_tick_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_max_roll_frequency() -> Duration {
    Duration::ZERO
}

fn default_recent_rolls() -> usize {
    30
}

fn default_attempt_limit() -> usize {
    3
}

fn default_attempt_window() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_review_variant() -> String {
    "cq".to_string()
}

fn default_review_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_review_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_repo_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_repo_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_http_port() -> u16 {
    8011
}
