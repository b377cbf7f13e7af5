//! Configuration types.
//!
//! Every section has a `Default` carrying the production defaults;
//! `from_env()` overlays `ORCH_*` environment variables on top.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Orchestration engine configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub qualification: QualificationConfig,
    pub scheduler: SchedulerConfig,
    pub execution: ExecutionConfig,
    pub idle_review: IdleReviewConfig,
    pub recovery: RecoveryConfig,
    pub backoff: BackoffSettings,
    pub circuit_breaker: CircuitBreakerConfig,
}

/// Qualification loop settings.
#[derive(Debug, Clone)]
pub struct QualificationConfig {
    /// Poll interval.
    pub interval: Duration,
    /// Maximum candidates claimed per tick.
    pub batch_size: usize,
    /// Maximum concurrent qualifier calls.
    pub max_concurrency: usize,
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 20,
            max_concurrency: 4,
        }
    }
}

/// Scheduler loop settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Tasks due within this window are promoted early.
    pub advance_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            advance_window: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Execution loop settings.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub poll_interval: Duration,
    /// Background dispatch waits until no interactive activity for this long.
    pub quiet_period: Duration,
    /// An execution without any signal for this long is considered dead.
    pub liveness_threshold: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            quiet_period: Duration::from_secs(30),
            liveness_threshold: Duration::from_secs(1800), // 30 minutes
        }
    }
}

/// Idle review loop settings.
#[derive(Debug, Clone)]
pub struct IdleReviewConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for IdleReviewConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(1800), // 30 minutes
        }
    }
}

/// Startup recovery settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Tasks untouched in a transient state for longer than this are reset.
    pub stale_threshold: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Parameters of one backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Leading delays, in seconds, for the first attempts.
    pub steps_secs: Vec<u64>,
    /// Growth factor applied after the last step.
    pub multiplier: f64,
    pub cap_secs: u64,
}

impl BackoffConfig {
    pub fn qualification() -> Self {
        Self {
            steps_secs: vec![30],
            multiplier: 2.0,
            cap_secs: 1800,
        }
    }

    /// Shared by busy answers and transport failures.
    pub fn dispatch() -> Self {
        Self {
            steps_secs: vec![5, 15, 30, 60],
            multiplier: 2.0,
            cap_secs: 300,
        }
    }

    pub fn workspace() -> Self {
        Self {
            steps_secs: vec![15],
            multiplier: 2.0,
            cap_secs: 900,
        }
    }
}

/// Backoff schedules for the three retry families.
#[derive(Debug, Clone)]
pub struct BackoffSettings {
    pub qualification: BackoffConfig,
    pub dispatch: BackoffConfig,
    pub workspace: BackoffConfig,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            qualification: BackoffConfig::qualification(),
            dispatch: BackoffConfig::dispatch(),
            workspace: BackoffConfig::workspace(),
        }
    }
}

/// Circuit breaker settings for the execution backend.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `ORCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.qualification.interval =
            env_secs("ORCH_QUALIFICATION_INTERVAL_SECS", config.qualification.interval)?;
        config.qualification.batch_size =
            env_parse("ORCH_QUALIFICATION_BATCH_SIZE", config.qualification.batch_size)?;
        config.qualification.max_concurrency = env_parse(
            "ORCH_QUALIFICATION_CONCURRENCY",
            config.qualification.max_concurrency,
        )?;

        config.scheduler.interval =
            env_secs("ORCH_SCHEDULER_INTERVAL_SECS", config.scheduler.interval)?;
        config.scheduler.advance_window =
            env_secs("ORCH_SCHEDULER_ADVANCE_SECS", config.scheduler.advance_window)?;

        config.execution.poll_interval =
            env_secs("ORCH_EXECUTION_POLL_SECS", config.execution.poll_interval)?;
        config.execution.quiet_period =
            env_secs("ORCH_QUIET_PERIOD_SECS", config.execution.quiet_period)?;
        config.execution.liveness_threshold =
            env_secs("ORCH_LIVENESS_SECS", config.execution.liveness_threshold)?;

        config.idle_review.enabled = env_parse("ORCH_IDLE_REVIEW_ENABLED", config.idle_review.enabled)?;
        config.idle_review.interval =
            env_secs("ORCH_IDLE_REVIEW_INTERVAL_SECS", config.idle_review.interval)?;

        config.recovery.stale_threshold =
            env_secs("ORCH_STALE_THRESHOLD_SECS", config.recovery.stale_threshold)?;

        config.backoff.dispatch.steps_secs =
            env_steps("ORCH_DISPATCH_BACKOFF_STEPS", config.backoff.dispatch.steps_secs)?;
        config.backoff.dispatch.cap_secs =
            env_parse("ORCH_DISPATCH_BACKOFF_CAP_SECS", config.backoff.dispatch.cap_secs)?;

        config.circuit_breaker.failure_threshold = env_parse(
            "ORCH_BREAKER_FAILURE_THRESHOLD",
            config.circuit_breaker.failure_threshold,
        )?;
        config.circuit_breaker.open_secs =
            env_parse("ORCH_BREAKER_OPEN_SECS", config.circuit_breaker.open_secs)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("ORCH_QUALIFICATION_INTERVAL_SECS", self.qualification.interval),
            ("ORCH_SCHEDULER_INTERVAL_SECS", self.scheduler.interval),
            ("ORCH_EXECUTION_POLL_SECS", self.execution.poll_interval),
            ("ORCH_IDLE_REVIEW_INTERVAL_SECS", self.idle_review.interval),
        ];
        for (key, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1 second".to_string(),
                });
            }
        }
        if self.qualification.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_QUALIFICATION_BATCH_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.qualification.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_QUALIFICATION_CONCURRENCY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.execution.liveness_threshold < self.recovery.stale_threshold {
            return Err(ConfigError::InvalidValue {
                key: "ORCH_LIVENESS_SECS".to_string(),
                message: "must not be shorter than the stale threshold".to_string(),
            });
        }
        Ok(())
    }
}

/// Process-level settings for the service binary.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub listen_port: u16,
    /// Base URL of the reasoning service (qualifier + execution backend).
    pub backend_url: String,
    pub backend_token: Option<SecretString>,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend_url = std::env::var("ORCH_BACKEND_URL")
            .map_err(|_| ConfigError::MissingEnvVar("ORCH_BACKEND_URL".to_string()))?;

        Ok(Self {
            db_path: std::env::var("ORCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/orchestrator.db")),
            listen_port: env_parse("ORCH_PORT", 8090)?,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            backend_token: std::env::var("ORCH_BACKEND_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            log_dir: std::env::var("ORCH_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_steps(key: &str, default: Vec<u64>) -> Result<Vec<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_steps(&raw).map_err(|message| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        }),
        Err(_) => Ok(default),
    }
}

/// Parse a comma-separated list of seconds, e.g. `5,15,30,60`.
fn parse_steps(raw: &str) -> Result<Vec<u64>, String> {
    let steps = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().map_err(|e| format!("'{s}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    if steps.is_empty() {
        return Err("at least one step is required".to_string());
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.execution.quiet_period, Duration::from_secs(30));
        assert_eq!(config.recovery.stale_threshold, Duration::from_secs(600));
        assert_eq!(config.scheduler.advance_window, Duration::from_secs(600));
        assert!(!config.idle_review.enabled);
    }

    #[test]
    fn liveness_must_exceed_staleness() {
        let mut config = OrchestratorConfig::default();
        config.execution.liveness_threshold = Duration::from_secs(60);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "ORCH_LIVENESS_SECS"
        ));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let mut config = OrchestratorConfig::default();
        config.execution.poll_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "ORCH_EXECUTION_POLL_SECS"
        ));

        let mut config = OrchestratorConfig::default();
        config.qualification.interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "ORCH_QUALIFICATION_INTERVAL_SECS"
        ));

        let mut config = OrchestratorConfig::default();
        config.scheduler.interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn steps_parsing() {
        assert_eq!(parse_steps("5, 15,30 ,60").unwrap(), vec![5, 15, 30, 60]);
        assert!(parse_steps("").is_err());
        assert!(parse_steps("5,soon").is_err());
    }
}
