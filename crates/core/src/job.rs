//! Job record and related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{PlanqError, Result};

/// Reason text the external system reports when a work identifier is already taken.
pub const CONFLICT_REASON: &str = "Plan ID Already Exists";

/// Reason text the external system reports when the submitted data is malformed.
pub const DATA_ERROR_REASON: &str = "Invalid Data Format";

/// Store-assigned unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random JobId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = PlanqError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| PlanqError::JobNotFound(s.to_string()))
    }
}

/// The status of a job.
///
/// Status only moves forward:
/// `Pending -> Claimed -> {Completed | Failed}` and
/// `Failed -> {RetryEnqueued | Escalated | Notified}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for a worker.
    Pending,
    /// Held by exactly one worker.
    Claimed,
    /// The external system accepted the work.
    Completed,
    /// The worker reported an exception.
    Failed,
    /// A successor job was enqueued with a fresh identifier.
    RetryEnqueued,
    /// Retry budget exhausted, handed to a human.
    Escalated,
    /// Submitter was told the data is invalid.
    Notified,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Claimed,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::RetryEnqueued,
        JobStatus::Escalated,
        JobStatus::Notified,
    ];

    /// Stable name used for storage and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Claimed => "Claimed",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::RetryEnqueued => "RetryEnqueued",
            JobStatus::Escalated => "Escalated",
            JobStatus::Notified => "Notified",
        }
    }

    /// Whether `next` is a legal forward step from this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Claimed)
                | (JobStatus::Claimed, JobStatus::Completed)
                | (JobStatus::Claimed, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::RetryEnqueued)
                | (JobStatus::Failed, JobStatus::Escalated)
                | (JobStatus::Failed, JobStatus::Notified)
        )
    }

    /// No further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::RetryEnqueued
                | JobStatus::Escalated
                | JobStatus::Notified
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PlanqError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PlanqError::Storage(format!("unknown job status: {}", s)))
    }
}

/// Named condition a worker reports when the external system rejects a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExceptionKind {
    /// The work identifier is already in use. Retryable.
    Conflict,
    /// The submitted data is invalid. Never retried.
    DataValidation,
    /// Anything else, kept verbatim.
    Other(String),
}

impl ExceptionKind {
    /// Classify a free-text reason reported by the external system.
    pub fn from_reason(reason: &str) -> Self {
        if reason.contains(CONFLICT_REASON) {
            ExceptionKind::Conflict
        } else if reason.contains(DATA_ERROR_REASON) {
            ExceptionKind::DataValidation
        } else {
            ExceptionKind::Other(reason.to_string())
        }
    }

    /// Human-readable reason text.
    pub fn reason(&self) -> &str {
        match self {
            ExceptionKind::Conflict => CONFLICT_REASON,
            ExceptionKind::DataValidation => DATA_ERROR_REASON,
            ExceptionKind::Other(reason) => reason,
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl From<String> for ExceptionKind {
    fn from(reason: String) -> Self {
        ExceptionKind::from_reason(&reason)
    }
}

impl From<ExceptionKind> for String {
    fn from(kind: ExceptionKind) -> Self {
        kind.reason().to_string()
    }
}

/// Application data carried by a job. Opaque to the queue apart from the
/// contact address used for notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    /// Document the submission was extracted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_document: Option<String>,
    /// Where notifications about this submission go.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_contact: Option<String>,
    /// Any other extracted fields.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Payload {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn phone_number(mut self, phone: impl Into<String>) -> Self {
        self.phone_number = Some(phone.into());
        self
    }

    pub fn source_document(mut self, document: impl Into<String>) -> Self {
        self.source_document = Some(document.into());
        self
    }

    pub fn requester_contact(mut self, contact: impl Into<String>) -> Self {
        self.requester_contact = Some(contact.into());
        self
    }

    /// Display name, falling back to a generic salutation.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Customer")
    }
}

/// One prior attempt of a lineage, carried forward on each successor job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub work_identifier: String,
    pub exception_kind: ExceptionKind,
    pub worker: String,
    pub timestamp: DateTime<Utc>,
}

/// A job record as stored by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    /// Identifier presented to the external system for this attempt.
    pub work_identifier: String,
    /// Identifier of the first attempt in the retry chain.
    pub lineage_id: String,
    pub status: JobStatus,
    pub payload: Payload,
    /// Label of the worker that claimed the job, empty until claimed.
    pub assigned_worker: String,
    /// Number of retries that produced this job.
    pub attempt_number: u32,
    pub attempt_history: Vec<AttemptRecord>,
    /// Set when the job failed.
    pub exception_kind: Option<ExceptionKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a Pending job from an enqueue request and a resolved work identifier.
    pub fn from_new(new: NewJob, work_identifier: String, now: DateTime<Utc>) -> Self {
        let lineage_id = new
            .lineage_id
            .unwrap_or_else(|| work_identifier.clone());

        Self {
            job_id: JobId::new(),
            work_identifier,
            lineage_id,
            status: JobStatus::Pending,
            payload: new.payload,
            assigned_worker: String::new(),
            attempt_number: new.attempt_number,
            attempt_history: new.attempt_history,
            exception_kind: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            completed_at: None,
        }
    }

    /// Apply a forward status change, stamping the matching timestamps.
    pub fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(PlanqError::InvalidTransition {
                job_id: self.job_id.to_string(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        match to {
            JobStatus::Claimed => self.claimed_at = Some(now),
            JobStatus::Completed => self.completed_at = Some(now),
            _ => {}
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Apply a generic update.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) -> Result<()> {
        self.transition(update.status, now)?;
        if let Some(kind) = &update.exception_kind {
            self.exception_kind = Some(kind.clone());
        }
        if let Some(worker) = &update.assigned_worker {
            self.assigned_worker = worker.clone();
        }
        Ok(())
    }

    /// The attempt this job represents, as recorded on its successor.
    pub fn as_attempt(&self, now: DateTime<Utc>) -> AttemptRecord {
        AttemptRecord {
            work_identifier: self.work_identifier.clone(),
            exception_kind: self
                .exception_kind
                .clone()
                .unwrap_or_else(|| ExceptionKind::Other("unknown".to_string())),
            worker: self.assigned_worker.clone(),
            timestamp: now,
        }
    }

    /// True when this job started a lineage rather than retrying one.
    pub fn is_first_attempt(&self) -> bool {
        self.attempt_number == 0
    }
}

/// Enqueue request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub payload: Payload,
    /// Generated when absent.
    pub work_identifier: Option<String>,
    /// Defaults to the work identifier, which starts a fresh lineage.
    pub lineage_id: Option<String>,
    pub attempt_number: u32,
    pub attempt_history: Vec<AttemptRecord>,
}

impl NewJob {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn work_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.work_identifier = Some(identifier.into());
        self
    }

    pub fn lineage_id(mut self, lineage: impl Into<String>) -> Self {
        self.lineage_id = Some(lineage.into());
        self
    }

    pub fn attempt_number(mut self, attempt: u32) -> Self {
        self.attempt_number = attempt;
        self
    }

    pub fn attempt_history(mut self, history: Vec<AttemptRecord>) -> Self {
        self.attempt_history = history;
        self
    }
}

/// Generic status/field update.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub exception_kind: Option<ExceptionKind>,
    pub assigned_worker: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            exception_kind: None,
            assigned_worker: None,
        }
    }

    pub fn exception_kind(mut self, kind: ExceptionKind) -> Self {
        self.exception_kind = Some(kind);
        self
    }

    pub fn assigned_worker(mut self, worker: impl Into<String>) -> Self {
        self.assigned_worker = Some(worker.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> Job {
        Job::from_new(
            NewJob::new(Payload::new("Jane Doe")),
            "ABC1234".to_string(),
            Utc::now(),
        )
    }

    #[test]
    fn test_new_job_starts_lineage() {
        let job = pending_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.lineage_id, "ABC1234");
        assert!(job.is_first_attempt());
        assert!(job.assigned_worker.is_empty());
        assert!(job.claimed_at.is_none());
    }

    #[test]
    fn test_explicit_lineage_is_kept() {
        let job = Job::from_new(
            NewJob::new(Payload::default())
                .lineage_id("ORIGINAL")
                .attempt_number(1),
            "NEWID01".to_string(),
            Utc::now(),
        );
        assert_eq!(job.lineage_id, "ORIGINAL");
        assert_eq!(job.work_identifier, "NEWID01");
        assert_eq!(job.attempt_number, 1);
    }

    #[test]
    fn test_forward_transitions() {
        let mut job = pending_job();
        job.transition(JobStatus::Claimed, Utc::now()).unwrap();
        assert!(job.claimed_at.is_some());
        job.transition(JobStatus::Failed, Utc::now()).unwrap();
        job.transition(JobStatus::RetryEnqueued, Utc::now()).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn test_completion_sets_completed_at() {
        let mut job = pending_job();
        job.transition(JobStatus::Claimed, Utc::now()).unwrap();
        job.transition(JobStatus::Completed, Utc::now()).unwrap();
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_status_never_regresses() {
        let mut job = pending_job();
        job.transition(JobStatus::Claimed, Utc::now()).unwrap();
        let err = job.transition(JobStatus::Pending, Utc::now()).unwrap_err();
        assert!(matches!(err, PlanqError::InvalidTransition { .. }));
        assert_eq!(job.status, JobStatus::Claimed);
    }

    #[test]
    fn test_pending_cannot_fail_directly() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Escalated.can_transition_to(JobStatus::Escalated));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("Locked".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_exception_kind_classification() {
        assert_eq!(
            ExceptionKind::from_reason("Plan ID Already Exists"),
            ExceptionKind::Conflict
        );
        assert_eq!(
            ExceptionKind::from_reason("Error: Invalid Data Format (phone)"),
            ExceptionKind::DataValidation
        );
        assert_eq!(
            ExceptionKind::from_reason("Timeout"),
            ExceptionKind::Other("Timeout".to_string())
        );
    }

    #[test]
    fn test_exception_kind_serializes_as_reason() {
        let json = serde_json::to_string(&ExceptionKind::Conflict).unwrap();
        assert_eq!(json, "\"Plan ID Already Exists\"");
        let kind: ExceptionKind = serde_json::from_str("\"Invalid Data Format\"").unwrap();
        assert_eq!(kind, ExceptionKind::DataValidation);
    }

    #[test]
    fn test_payload_keeps_extra_fields() {
        let json = r#"{"name":"Bob","phone_number":"INVALID","policy":"P-9"}"#;
        let payload: Payload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.name.as_deref(), Some("Bob"));
        assert_eq!(payload.extra.get("policy").unwrap(), "P-9");
        assert_eq!(Payload::default().display_name(), "Customer");
    }

    #[test]
    fn test_apply_update_records_exception() {
        let mut job = pending_job();
        job.apply(
            &JobUpdate::status(JobStatus::Claimed).assigned_worker("worker-01"),
            Utc::now(),
        )
        .unwrap();
        job.apply(
            &JobUpdate::status(JobStatus::Failed).exception_kind(ExceptionKind::Conflict),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.assigned_worker, "worker-01");
        assert_eq!(job.exception_kind, Some(ExceptionKind::Conflict));

        let attempt = job.as_attempt(Utc::now());
        assert_eq!(attempt.work_identifier, "ABC1234");
        assert_eq!(attempt.worker, "worker-01");
    }

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
