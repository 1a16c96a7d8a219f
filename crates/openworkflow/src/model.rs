//! Core data model: [`WorkflowRun`], [`StepAttempt`], and the enums and
//! policy types that parameterize them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SerializedError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Sleeping,
    Completed,
    Failed,
    Canceled,
}

impl WorkflowRunStatus {
    /// `succeeded` is accepted as an alias of `completed` for compatibility
    /// with stores migrated from the source implementation.
    pub fn from_db_str(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "sleeping" => Some(Self::Sleeping),
            "completed" | "succeeded" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepAttemptStatus {
    Running,
    Completed,
    Failed,
}

impl StepAttemptStatus {
    pub fn from_db_str(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" | "succeeded" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepAttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Function,
    Sleep,
}

impl StepKind {
    pub fn from_db_str(raw: &str) -> Option<Self> {
        match raw {
            "function" => Some(Self::Function),
            "sleep" => Some(Self::Sleep),
            _ => None,
        }
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Sleep => "sleep",
        }
    }
}

/// A single execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub namespace_id: String,
    pub id: Uuid,
    pub workflow_name: String,
    pub version: Option<String>,
    pub status: WorkflowRunStatus,
    pub idempotency_key: Option<String>,
    pub config: serde_json::Value,
    pub context: serde_json::Value,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<SerializedError>,
    pub attempts: i32,
    pub parent_step_attempt_namespace_id: Option<String>,
    pub parent_step_attempt_id: Option<Uuid>,
    pub worker_id: Option<String>,
    /// `None` once the run reaches a terminal status (`completed`/`failed`/
    /// `canceled`); the scheduler never claims a row with no `available_at`.
    pub available_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single attempt to execute a named step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub namespace_id: String,
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub step_name: String,
    pub kind: StepKind,
    pub status: StepAttemptStatus,
    pub config: serde_json::Value,
    pub context: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<SerializedError>,
    pub child_workflow_run_namespace_id: Option<String>,
    pub child_workflow_run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StepAttempt {
    /// The `context.resumeAt` field for a `sleep` kind attempt.
    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        self.context
            .get("resumeAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// `{initialInterval, coefficient, maxInterval, maxAttempts}` used to compute
/// step-failure backoff. Unlike a general-purpose retry library this policy
/// has no jitter and no non-retryable-error allowlist: the spec's backoff
/// math must reproduce exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    /// `None` means unlimited attempts, the default.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(100),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// `delay(n) = min(initialInterval * coefficient^(n-1), maxInterval)`
    /// where `n` is the number of prior failed attempts for this step name
    /// (1 for the first failure, 2 for the second, ...).
    pub fn delay_for_attempt(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn has_attempts_remaining(&self, failed_attempts: u32) -> bool {
        match self.max_attempts {
            None => true,
            Some(max) => failed_attempts < max,
        }
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_aliases_succeeded_as_completed() {
        assert_eq!(
            WorkflowRunStatus::from_db_str("succeeded"),
            Some(WorkflowRunStatus::Completed)
        );
    }

    #[test]
    fn default_retry_policy_matches_spec_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.max_interval, Duration::from_secs(100));
        assert_eq!(policy.max_attempts, None);
    }

    #[test]
    fn delay_for_attempt_matches_exponential_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn delay_caps_at_max_interval() {
        let policy = RetryPolicy::default().with_max_interval(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn unlimited_attempts_by_default() {
        let policy = RetryPolicy::default();
        assert!(policy.has_attempts_remaining(1_000_000));
    }
}
