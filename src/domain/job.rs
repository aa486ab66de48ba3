use super::canonical::CanonicalEvent;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SyncProvider,
    ApplyEvent,
    ConsistencyRun,
    CopilotRun,
    NormalizeEvent,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::SyncProvider => "sync_provider",
            JobType::ApplyEvent => "apply_event",
            JobType::ConsistencyRun => "consistency_run",
            JobType::CopilotRun => "copilot_run",
            JobType::NormalizeEvent => "normalize_event",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// Job-type specific input. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    SyncProvider {
        provider: String,
        #[serde(default)]
        since: Option<DateTime<Utc>>,
    },
    ApplyEvent {
        #[serde(default)]
        raw_event_id: Option<Uuid>,
        events: Vec<CanonicalEvent>,
    },
    ConsistencyRun {
        /// Detector names to run; empty means all registered detectors.
        #[serde(default)]
        detectors: Vec<String>,
    },
    CopilotRun {
        #[serde(default)]
        input: serde_json::Value,
    },
    NormalizeEvent {
        raw_event_id: Uuid,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::SyncProvider { .. } => JobType::SyncProvider,
            JobPayload::ApplyEvent { .. } => JobType::ApplyEvent,
            JobPayload::ConsistencyRun { .. } => JobType::ConsistencyRun,
            JobPayload::CopilotRun { .. } => JobType::CopilotRun,
            JobPayload::NormalizeEvent { .. } => JobType::NormalizeEvent,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub org_id: String,
    pub project_id: Option<String>,
    pub payload: JobPayload,
}

impl NewJob {
    pub fn new(org_id: impl Into<String>, project_id: Option<String>, payload: JobPayload) -> Self {
        Self {
            org_id: org_id.into(),
            project_id,
            payload,
        }
    }
}

/// Retry and visibility settings applied by the queue and the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            visibility_timeout: Duration::seconds(300),
            backoff_base: Duration::seconds(30),
            backoff_max: Duration::seconds(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt: `base * 2^(attempts - 1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(30);
        let factor = 1_i32 << shift;
        self.backoff_base
            .checked_mul(factor)
            .map(|d| d.min(self.backoff_max))
            .unwrap_or(self.backoff_max)
    }

    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub org_id: String,
    pub project_id: Option<String>,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the job may be claimed (pushed forward by backoff).
    pub available_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Deadline after which a `processing` job is considered abandoned.
    pub visible_until: Option<DateTime<Utc>>,
    /// Identifies the current claim; outcomes from older claims are ignored.
    pub claim_token: Option<Uuid>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: new.payload.job_type(),
            org_id: new.org_id,
            project_id: new.project_id,
            payload: new.payload,
            status: JobStatus::Queued,
            attempts: 0,
            enqueued_at: now,
            available_at: now,
            last_attempt_at: None,
            visible_until: None,
            claim_token: None,
            last_error: None,
            finished_at: None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.available_at <= now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.visible_until.is_some_and(|t| t <= now)
    }

    /// When a queued job becomes claimable; `None` in any other status.
    /// Queue adapters index queued jobs on this.
    pub fn ready_at(&self) -> Option<DateTime<Utc>> {
        (self.status == JobStatus::Queued).then_some(self.available_at)
    }

    /// Visibility deadline of a job in `processing`.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.visible_until
            .filter(|_| self.status == JobStatus::Processing)
    }

    pub fn holds_claim(&self, token: Uuid) -> bool {
        self.status == JobStatus::Processing && self.claim_token == Some(token)
    }

    /// `queued -> processing`, counting the attempt and stamping a new claim.
    pub fn claim(&mut self, now: DateTime<Utc>, visibility_timeout: Duration) -> Uuid {
        let token = Uuid::new_v4();
        self.status = JobStatus::Processing;
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.visible_until = Some(now + visibility_timeout);
        self.claim_token = Some(token);
        token
    }

    /// Returns an abandoned job to the queue, or fails it when it has used
    /// up its attempts.
    pub fn reclaim(&mut self, now: DateTime<Utc>, policy: &RetryPolicy) {
        self.visible_until = None;
        self.claim_token = None;
        if policy.attempts_exhausted(self.attempts) {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            self.last_error = Some(format!(
                "visibility timeout elapsed after {} attempts",
                self.attempts
            ));
        } else {
            self.status = JobStatus::Queued;
            self.available_at = now;
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.visible_until = None;
        self.claim_token = None;
        self.finished_at = Some(now);
    }

    /// Records a failed attempt. `retry_at` of `None` fails the job for good.
    pub fn fail_attempt(
        &mut self,
        error: String,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.last_error = Some(error);
        self.visible_until = None;
        self.claim_token = None;
        match retry_at {
            Some(at) => {
                self.status = JobStatus::Queued;
                self.available_at = at;
            }
            None => {
                self.status = JobStatus::Failed;
                self.finished_at = Some(now);
            }
        }
    }

    /// Manual intervention: a failed job goes back to the queue with a fresh
    /// attempt budget. Its payload is left untouched.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Failed {
            return false;
        }
        self.status = JobStatus::Queued;
        self.attempts = 0;
        self.available_at = now;
        self.finished_at = None;
        true
    }
}
