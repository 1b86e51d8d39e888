//! Maintenance job types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MaintenanceConfig;
use crate::clock::{Clock, delay_until};

/// The recurring maintenance jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Pull new invalidation messages and apply them locally.
    Pull,
    /// Re-baseline local offset tracking state once a day.
    Reset,
    /// Restore the pub/sub subscription if it dropped.
    Reconnect,
}

impl JobKind {
    /// Every job kind, in the order they are scheduled.
    pub const ALL: [JobKind; 3] = [JobKind::Pull, JobKind::Reset, JobKind::Reconnect];

    /// Stable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Pull => "pull",
            JobKind::Reset => "reset",
            JobKind::Reconnect => "reconnect",
        }
    }

    /// What the job was doing, for failure logs.
    pub fn activity(&self) -> &'static str {
        match self {
            JobKind::Pull => "pulling invalidation messages",
            JobKind::Reset => "resetting local message offset",
            JobKind::Reconnect => "checking pub/sub subscription",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            JobKind::Pull => 0,
            JobKind::Reset => 1,
            JobKind::Reconnect => 2,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a job first runs and how long it waits between runs.
///
/// The period is a fixed delay measured from the end of one execution to the
/// start of the next, so a slow run pushes the following one back instead of
/// overlapping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSchedule {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl JobSchedule {
    /// Schedule for `kind` under `config`, reading the wall clock for the
    /// daily reset.
    pub fn for_job(kind: JobKind, config: &MaintenanceConfig, clock: &dyn Clock) -> Self {
        match kind {
            JobKind::Pull => Self {
                initial_delay: config.pull_initial_delay,
                period: config.pull_period,
            },
            JobKind::Reset => Self {
                initial_delay: delay_until(clock.now(), config.reset_time),
                period: config.reset_period,
            },
            JobKind::Reconnect => Self {
                initial_delay: config.reconnect_initial_delay,
                period: config.reconnect_period,
            },
        }
    }
}

/// Lifecycle of a scheduled job.
///
/// Failures return a job to `Scheduled`; only shutdown is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for the next tick.
    #[default]
    Scheduled,
    /// Executing.
    Running,
    /// Stopped by shutdown; will not run again.
    Cancelled,
}

/// Result of one isolated execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The action returned an error.
    Failed(String),
    /// The action panicked.
    Panicked(String),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Progress counters for a single job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Current lifecycle state.
    pub state: JobState,
    /// Executions started.
    pub runs: u64,
    /// Executions that failed or panicked.
    pub failures: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Message from the most recent failure.
    pub last_error: Option<String>,
    /// When the most recent execution finished.
    pub last_finished: Option<DateTime<Utc>>,
}

impl JobStats {
    /// Fold a finished execution into the counters.
    pub fn record(&mut self, outcome: &RunOutcome) {
        self.last_finished = Some(Utc::now());
        match outcome {
            RunOutcome::Completed => {
                self.consecutive_failures = 0;
            }
            RunOutcome::Failed(error) | RunOutcome::Panicked(error) => {
                self.failures += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(error.clone());
            }
        }
    }
}
