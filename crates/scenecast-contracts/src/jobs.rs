use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Unknown,
}

impl JobStatus {
    /// Maps a backend `task_status` string. Anything outside the known set,
    /// including a missing field, is `Unknown` and keeps the job polling.
    pub fn from_remote(raw: Option<&str>) -> Self {
        match raw.map(str::trim).unwrap_or_default() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub elapsed_seconds: u64,
}

/// One submitted generation task, owned by the poller that submitted it.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    job_id: String,
    submitted_at: DateTime<Utc>,
    status: JobStatus,
    last_status: JobStatus,
    elapsed_seconds: u64,
    notified_slow_queue: bool,
    reached_running: bool,
    transitions: Vec<StatusTransition>,
}

impl GenerationJob {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            submitted_at: Utc::now(),
            status: JobStatus::Pending,
            last_status: JobStatus::Pending,
            elapsed_seconds: 0,
            notified_slow_queue: false,
            reached_running: false,
            transitions: Vec::new(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn last_status(&self) -> JobStatus {
        self.last_status
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn notified_slow_queue(&self) -> bool {
        self.notified_slow_queue
    }

    pub fn transitions(&self) -> &[StatusTransition] {
        &self.transitions
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seconds left before `max_wait_seconds`.
    pub fn remaining(&self, max_wait_seconds: u64) -> u64 {
        max_wait_seconds.saturating_sub(self.elapsed_seconds)
    }

    /// Adds one tick, capped at `max_wait_seconds`. Returns the new elapsed
    /// value.
    pub fn advance(&mut self, seconds: u64, max_wait_seconds: u64) -> u64 {
        self.elapsed_seconds = self
            .elapsed_seconds
            .saturating_add(seconds)
            .min(max_wait_seconds);
        self.elapsed_seconds
    }

    /// Records a remotely observed status. Returns the transition when it
    /// differs from the last observation. A report of `Pending` once the job
    /// has been seen `Running` is ignored, as is anything after a terminal
    /// status. `Unknown` is not progress and may fall back to `Pending`.
    pub fn observe(&mut self, observed: JobStatus) -> Option<StatusTransition> {
        if self.is_terminal() {
            return None;
        }
        if observed == JobStatus::Pending && self.reached_running {
            return None;
        }
        if observed == JobStatus::Running {
            self.reached_running = true;
        }
        if observed == self.last_status {
            return None;
        }
        let transition = StatusTransition {
            from: self.last_status,
            to: observed,
            elapsed_seconds: self.elapsed_seconds,
        };
        self.last_status = observed;
        self.status = observed;
        self.transitions.push(transition);
        Some(transition)
    }

    pub fn slow_queue_due(&self, threshold_seconds: u64) -> bool {
        !self.notified_slow_queue
            && self.status == JobStatus::Pending
            && self.elapsed_seconds >= threshold_seconds
    }

    /// Flips the slow-queue flag. Returns `false` if it was already set.
    pub fn mark_slow_queue_notified(&mut self) -> bool {
        if self.notified_slow_queue {
            return false;
        }
        self.notified_slow_queue = true;
        true
    }

    /// Marks the local deadline as reached. `last_status` keeps the final
    /// remote observation.
    pub fn time_out(&mut self) {
        if !self.is_terminal() {
            self.status = JobStatus::TimedOut;
        }
    }
}

/// Terminal value of one generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Succeeded {
        task_id: String,
        url: String,
    },
    Failed {
        task_id: String,
        reason: String,
    },
    TimedOut {
        task_id: String,
        last_status: JobStatus,
        elapsed_seconds: u64,
    },
    Cancelled {
        task_id: String,
        elapsed_seconds: u64,
    },
}

impl GenerationOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::TimedOut { .. } => "timed_out",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            Self::Succeeded { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::TimedOut { task_id, .. }
            | Self::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn result_url(&self) -> Option<&str> {
        match self {
            Self::Succeeded { url, .. } => Some(url),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Succeeded { .. } => None,
            Self::Failed { reason, .. } => Some(reason.clone()),
            Self::TimedOut {
                last_status,
                elapsed_seconds,
                ..
            } => Some(format!(
                "timed out after {elapsed_seconds}s at {last_status}"
            )),
            Self::Cancelled {
                elapsed_seconds, ..
            } => Some(format!("cancelled after {elapsed_seconds}s")),
        }
    }
}

/// Advisory messages for the caller's channel while a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobNotice {
    SlowQueue {
        task_id: String,
        elapsed_seconds: u64,
    },
    TimedOut {
        task_id: String,
        last_status: JobStatus,
        elapsed_seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_status_mapping_defaults_to_unknown() {
        assert_eq!(JobStatus::from_remote(Some("PENDING")), JobStatus::Pending);
        assert_eq!(JobStatus::from_remote(Some("RUNNING")), JobStatus::Running);
        assert_eq!(
            JobStatus::from_remote(Some("SUCCEEDED")),
            JobStatus::Succeeded
        );
        assert_eq!(JobStatus::from_remote(Some("FAILED")), JobStatus::Failed);
        assert_eq!(JobStatus::from_remote(Some("CANCELED")), JobStatus::Unknown);
        assert_eq!(JobStatus::from_remote(None), JobStatus::Unknown);
    }

    #[test]
    fn repeated_statuses_record_only_changes() {
        let mut job = GenerationJob::new("t-1");
        let observed: Vec<_> = [
            JobStatus::Pending,
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Succeeded,
        ]
        .into_iter()
        .filter_map(|status| job.observe(status))
        .collect();

        assert_eq!(observed.len(), 2);
        assert_eq!(
            (observed[0].from, observed[0].to),
            (JobStatus::Pending, JobStatus::Running)
        );
        assert_eq!(
            (observed[1].from, observed[1].to),
            (JobStatus::Running, JobStatus::Succeeded)
        );
        assert_eq!(job.transitions().len(), 2);
        assert!(job.is_terminal());
    }

    #[test]
    fn job_never_returns_to_pending() {
        let mut job = GenerationJob::new("t-1");
        job.observe(JobStatus::Running);
        assert!(job.observe(JobStatus::Pending).is_none());
        assert_eq!(job.status(), JobStatus::Running);

        job.observe(JobStatus::Failed);
        assert!(job.observe(JobStatus::Running).is_none());
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[test]
    fn unknown_status_can_fall_back_to_pending() {
        let mut job = GenerationJob::new("t-1");
        job.observe(JobStatus::Unknown);
        let back = job.observe(JobStatus::Pending).unwrap();
        assert_eq!((back.from, back.to), (JobStatus::Unknown, JobStatus::Pending));
        assert_eq!(job.status(), JobStatus::Pending);

        job.advance(32, 180);
        assert!(job.slow_queue_due(30));

        job.observe(JobStatus::Running);
        job.observe(JobStatus::Unknown);
        assert!(job.observe(JobStatus::Pending).is_none());
        assert_eq!(job.status(), JobStatus::Unknown);
    }

    #[test]
    fn elapsed_is_capped_at_max_wait() {
        let mut job = GenerationJob::new("t-1");
        assert_eq!(job.advance(4, 10), 4);
        assert_eq!(job.advance(4, 10), 8);
        assert_eq!(job.remaining(10), 2);
        assert_eq!(job.advance(4, 10), 10);
        assert_eq!(job.remaining(10), 0);
    }

    #[test]
    fn slow_queue_flag_flips_once() {
        let mut job = GenerationJob::new("t-1");
        job.advance(28, 180);
        assert!(!job.slow_queue_due(30));
        job.advance(4, 180);
        assert!(job.slow_queue_due(30));
        assert!(job.mark_slow_queue_notified());
        assert!(!job.mark_slow_queue_notified());
        assert!(!job.slow_queue_due(30));
    }

    #[test]
    fn slow_queue_not_due_once_running() {
        let mut job = GenerationJob::new("t-1");
        job.advance(40, 180);
        job.observe(JobStatus::Running);
        assert!(!job.slow_queue_due(30));
    }

    #[test]
    fn time_out_keeps_last_remote_status() {
        let mut job = GenerationJob::new("t-1");
        job.observe(JobStatus::Running);
        job.time_out();
        assert_eq!(job.status(), JobStatus::TimedOut);
        assert_eq!(job.last_status(), JobStatus::Running);
    }

    #[test]
    fn outcome_exposes_url_or_reason() {
        let ok = GenerationOutcome::Succeeded {
            task_id: "t".to_string(),
            url: "https://img/1.png".to_string(),
        };
        assert_eq!(ok.result_url(), Some("https://img/1.png"));
        assert!(ok.failure_reason().is_none());

        let timed_out = GenerationOutcome::TimedOut {
            task_id: "t".to_string(),
            last_status: JobStatus::Pending,
            elapsed_seconds: 180,
        };
        assert!(timed_out.result_url().is_none());
        assert_eq!(
            timed_out.failure_reason().as_deref(),
            Some("timed out after 180s at PENDING")
        );
        let encoded = serde_json::to_value(&timed_out).unwrap();
        assert_eq!(encoded["kind"], "timed_out");
        assert_eq!(encoded["last_status"], "PENDING");
    }
}
