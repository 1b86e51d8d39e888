//! Maintenance schedule configuration.

use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::SchedulerError;
use crate::types::JobKind;

/// Default delay before the first pull.
pub const DEFAULT_PULL_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Default fixed delay between pulls.
pub const DEFAULT_PULL_PERIOD: Duration = Duration::from_secs(30);

/// Default fixed delay between offset resets (one day).
pub const DEFAULT_RESET_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Default delay before the first reconnection check.
pub const DEFAULT_RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Default fixed delay between reconnection checks.
pub const DEFAULT_RECONNECT_PERIOD: Duration = Duration::from_secs(5);

/// Default worker pool size, one thread per job kind.
pub const DEFAULT_WORKER_THREADS: usize = JobKind::ALL.len();

/// Environment variable names read by [`MaintenanceConfig::from_env`].
pub mod env {
    pub const PULL_INITIAL_DELAY_SECS: &str = "LAYERING_PULL_INITIAL_DELAY_SECS";
    pub const PULL_PERIOD_SECS: &str = "LAYERING_PULL_PERIOD_SECS";
    pub const RESET_TIME: &str = "LAYERING_RESET_TIME";
    pub const RESET_PERIOD_SECS: &str = "LAYERING_RESET_PERIOD_SECS";
    pub const RECONNECT_INITIAL_DELAY_SECS: &str = "LAYERING_RECONNECT_INITIAL_DELAY_SECS";
    pub const RECONNECT_PERIOD_SECS: &str = "LAYERING_RECONNECT_PERIOD_SECS";
    pub const WORKER_THREADS: &str = "LAYERING_WORKER_THREADS";
}

fn default_reset_time() -> NaiveTime {
    NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default()
}

/// Timing parameters for the pull, reset, and reconnection jobs.
///
/// Durations serialize as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Delay before the first pull after init.
    #[serde(with = "duration_secs")]
    pub pull_initial_delay: Duration,

    /// Fixed delay between the end of one pull and the start of the next.
    #[serde(with = "duration_secs")]
    pub pull_period: Duration,

    /// Local time of day at which offsets are re-baselined.
    pub reset_time: NaiveTime,

    /// Fixed delay between offset resets.
    #[serde(with = "duration_secs")]
    pub reset_period: Duration,

    /// Delay before the first reconnection check.
    #[serde(with = "duration_secs")]
    pub reconnect_initial_delay: Duration,

    /// Fixed delay between reconnection checks.
    #[serde(with = "duration_secs")]
    pub reconnect_period: Duration,

    /// Worker threads in a dedicated [`WorkerPool`](crate::WorkerPool).
    pub worker_threads: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            pull_initial_delay: DEFAULT_PULL_INITIAL_DELAY,
            pull_period: DEFAULT_PULL_PERIOD,
            reset_time: default_reset_time(),
            reset_period: DEFAULT_RESET_PERIOD,
            reconnect_initial_delay: DEFAULT_RECONNECT_INITIAL_DELAY,
            reconnect_period: DEFAULT_RECONNECT_PERIOD,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

impl MaintenanceConfig {
    /// Defaults overlaid with any `LAYERING_*` environment variables.
    pub fn from_env() -> Result<Self, SchedulerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by the names in [`env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SchedulerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let secs = |key: &str| -> Result<Option<Duration>, SchedulerError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| {
                    v.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| {
                        SchedulerError::InvalidConfig(format!(
                            "{key} must be a whole number of seconds, got '{v}'"
                        ))
                    })
                })
                .transpose()
        };

        if let Some(d) = secs(env::PULL_INITIAL_DELAY_SECS)? {
            config.pull_initial_delay = d;
        }
        if let Some(d) = secs(env::PULL_PERIOD_SECS)? {
            config.pull_period = d;
        }
        if let Some(d) = secs(env::RESET_PERIOD_SECS)? {
            config.reset_period = d;
        }
        if let Some(d) = secs(env::RECONNECT_INITIAL_DELAY_SECS)? {
            config.reconnect_initial_delay = d;
        }
        if let Some(d) = secs(env::RECONNECT_PERIOD_SECS)? {
            config.reconnect_period = d;
        }
        if let Some(raw) = lookup(env::RESET_TIME).filter(|v| !v.trim().is_empty()) {
            config.reset_time = parse_time_of_day(&raw)?;
        }
        if let Some(raw) = lookup(env::WORKER_THREADS).filter(|v| !v.trim().is_empty()) {
            config.worker_threads = raw.trim().parse().map_err(|_| {
                SchedulerError::InvalidConfig(format!(
                    "{} must be a positive integer, got '{raw}'",
                    env::WORKER_THREADS
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_pull_initial_delay(mut self, delay: Duration) -> Self {
        self.pull_initial_delay = delay;
        self
    }

    pub fn with_pull_period(mut self, period: Duration) -> Self {
        self.pull_period = period;
        self
    }

    pub fn with_reset_time(mut self, at: NaiveTime) -> Self {
        self.reset_time = at;
        self
    }

    pub fn with_reset_period(mut self, period: Duration) -> Self {
        self.reset_period = period;
        self
    }

    pub fn with_reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    pub fn with_reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = period;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Check that every job can be scheduled and none can starve another.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for (name, period) in [
            ("pull_period", self.pull_period),
            ("reset_period", self.reset_period),
            ("reconnect_period", self.reconnect_period),
        ] {
            if period.is_zero() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.worker_threads < JobKind::ALL.len() {
            return Err(SchedulerError::InvalidConfig(format!(
                "worker_threads must be at least {} (one per job), got {}",
                JobKind::ALL.len(),
                self.worker_threads
            )));
        }

        Ok(())
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, SchedulerError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| {
            SchedulerError::InvalidConfig(format!("expected a time of day as HH:MM, got '{raw}'"))
        })
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
