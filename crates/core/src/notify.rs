//! Notification sink and the messages sent to submitters.
//!
//! Sending is fire-and-forget: callers log a failed send and move on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::error::{PlanqError, Result};
use crate::job::{Job, Payload};
use crate::registry::RetryEntry;

const SIGNATURE: &str = "Best regards,\nAutomated Plan Setup System";

/// A rendered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Delivers a message to a submitter.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Sink that only writes the message to the log.
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        tracing::info!(recipient = %recipient, subject = %subject, "Notification");
        tracing::debug!(body = %body, "Notification body");
        Ok(())
    }
}

/// Sink that keeps every message in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every send fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Messages delivered so far.
    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        if self.failing {
            return Err(PlanqError::Notification(format!(
                "delivery to {} refused",
                recipient
            )));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| PlanqError::Notification("recording sink poisoned".to_string()))?;
        sent.push(Notification {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

fn submitted_fields(payload: &Payload) -> String {
    format!(
        "Name: {}\nAddress: {}\nPhone Number: {}",
        payload.name.as_deref().unwrap_or("N/A"),
        payload.address.as_deref().unwrap_or("N/A"),
        payload.phone_number.as_deref().unwrap_or("N/A"),
    )
}

/// Retry in progress under a new identifier.
pub fn retry_notice(
    recipient: &str,
    job: &Job,
    new_identifier: &str,
    retry_number: u32,
    max_retries: u32,
) -> Notification {
    let body = format!(
        "Dear {name},\n\n\
         Your plan setup submission encountered an issue and is being retried automatically.\n\n\
         Issue: Plan ID \"{old}\" already exists in the system.\n\n\
         New Plan ID: {new}\n\
         Retry Attempt: {retry} of {max}\n\n\
         No action is required from you.\n\n\
         Tracking ID: {job_id}\n\
         Original Plan ID: {lineage}\n\
         Previous Plan ID: {old}\n\n\
         {SIGNATURE}\n",
        name = job.payload.display_name(),
        old = job.work_identifier,
        new = new_identifier,
        retry = retry_number,
        max = max_retries,
        job_id = job.job_id,
        lineage = job.lineage_id,
    );

    Notification {
        recipient: recipient.to_string(),
        subject: format!("Plan Setup - Automatic Retry #{}", retry_number),
        body,
    }
}

/// Retry budget exhausted. Lists the attempts recorded on the failing job;
/// a job escalated before any retry lists its own failure.
pub fn escalation_notice(recipient: &str, job: &Job) -> Notification {
    let attempts = if job.attempt_history.is_empty() {
        vec![job.as_attempt(job.updated_at)]
    } else {
        job.attempt_history.clone()
    };
    let history: String = attempts
        .iter()
        .enumerate()
        .map(|(i, attempt)| {
            format!(
                "Attempt {}: Plan ID '{}' - Failed ({})\n",
                i + 1,
                attempt.work_identifier,
                attempt.exception_kind
            )
        })
        .collect();

    let body = format!(
        "Dear {name},\n\n\
         Your plan setup submission failed after {count} automatic attempts.\n\n\
         Retry history:\n{history}\n\
         Our team will investigate and contact you.\n\n\
         Tracking ID: {job_id}\n\
         Original Plan ID: {lineage}\n\
         Submission Date: {created}\n\n\
         {SIGNATURE}\n",
        name = job.payload.display_name(),
        count = attempts.len(),
        history = history,
        job_id = job.job_id,
        lineage = job.lineage_id,
        created = job.created_at.to_rfc3339(),
    );

    Notification {
        recipient: recipient.to_string(),
        subject: format!("URGENT: Plan Setup Failed After {} Attempts", attempts.len()),
        body,
    }
}

/// The submitted data was rejected.
pub fn data_error_notice(recipient: &str, job: &Job) -> Notification {
    let fault = job
        .exception_kind
        .as_ref()
        .map(|kind| kind.to_string())
        .unwrap_or_else(|| "Unknown error".to_string());

    let body = format!(
        "Dear {name},\n\n\
         Your plan setup submission could not be processed due to a data validation error.\n\n\
         Issue: {fault}\n\n\
         Your submitted data:\n{fields}\nPlan ID: {identifier}\n\n\
         Please review your information and resubmit with corrected data.\n\n\
         Tracking ID: {job_id}\n\
         Submission Date: {created}\n\n\
         {SIGNATURE}\n",
        name = job.payload.display_name(),
        fault = fault,
        fields = submitted_fields(&job.payload),
        identifier = job.work_identifier,
        job_id = job.job_id,
        created = job.created_at.to_rfc3339(),
    );

    Notification {
        recipient: recipient.to_string(),
        subject: "Action Required: Plan Setup Data Error".to_string(),
        body,
    }
}

/// A failed job whose lineage was already escalated.
pub fn duplicate_escalated_notice(recipient: &str, job: &Job) -> Notification {
    let body = format!(
        "Dear {name},\n\n\
         Plan ID \"{identifier}\" belongs to a submission that has already been escalated \
         to our support team (original Plan ID {lineage}). No further automatic retries \
         will be made.\n\n\
         Tracking ID: {job_id}\n\n\
         {SIGNATURE}\n",
        name = job.payload.display_name(),
        identifier = job.work_identifier,
        lineage = job.lineage_id,
        job_id = job.job_id,
    );

    Notification {
        recipient: recipient.to_string(),
        subject: "Plan Setup - Duplicate of Escalated Case".to_string(),
        body,
    }
}

/// A new submission reuses a lineage that is already escalated.
pub fn duplicate_submission_notice(
    recipient: &str,
    lineage_id: &str,
    payload: &Payload,
    entry: &RetryEntry,
) -> Notification {
    let body = format!(
        "Dear {name},\n\n\
         We received a new submission for Plan ID {lineage}, which has already been \
         escalated after {count} attempts. It was not queued again; our support team \
         is handling the case.\n\n\
         Escalated since: {since}\n\n\
         {SIGNATURE}\n",
        name = payload.display_name(),
        lineage = lineage_id,
        count = entry.retry_count + 1,
        since = entry.last_updated.to_rfc3339(),
    );

    Notification {
        recipient: recipient.to_string(),
        subject: "Plan Setup - Duplicate Submission, Already Escalated".to_string(),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ExceptionKind, JobStatus, NewJob};
    use chrono::Utc;

    fn job(identifier: &str, lineage: &str) -> Job {
        let mut job = Job::from_new(
            NewJob::new(
                Payload::new("Bob Johnson")
                    .address("789 Pine Road")
                    .phone_number("INVALID_PHONE"),
            )
            .lineage_id(lineage),
            identifier.to_string(),
            Utc::now(),
        );
        job.status = JobStatus::Failed;
        job
    }

    #[test]
    fn test_retry_notice_names_new_identifier() {
        let n = retry_notice("bob@example.com", &job("A1", "A1"), "A2", 1, 2);
        assert_eq!(n.recipient, "bob@example.com");
        assert_eq!(n.subject, "Plan Setup - Automatic Retry #1");
        assert!(n.body.contains("New Plan ID: A2"));
        assert!(n.body.contains("Retry Attempt: 1 of 2"));
    }

    #[test]
    fn test_escalation_notice_lists_recorded_attempts() {
        let mut first = job("A1", "A1");
        first.exception_kind = Some(ExceptionKind::Conflict);
        first.assigned_worker = "vdi-01".to_string();
        let mut second = job("A2", "A1");
        second.exception_kind = Some(ExceptionKind::Conflict);

        let mut failing = job("A3", "A1");
        failing.exception_kind = Some(ExceptionKind::Conflict);
        failing.attempt_history = vec![
            first.as_attempt(Utc::now()),
            second.as_attempt(Utc::now()),
        ];

        let n = escalation_notice("bob@example.com", &failing);
        assert_eq!(n.subject, "URGENT: Plan Setup Failed After 2 Attempts");
        assert!(n.body.contains("failed after 2 automatic attempts"));
        assert!(n.body.contains(&format!(
            "Attempt 1: Plan ID 'A1' - Failed ({})",
            ExceptionKind::Conflict
        )));
        assert!(n.body.contains("Attempt 2: Plan ID 'A2'"));
        assert!(!n.body.contains("Attempt 3"));
    }

    #[test]
    fn test_escalation_notice_without_history_lists_the_job() {
        let mut failing = job("A1", "A1");
        failing.exception_kind = Some(ExceptionKind::Conflict);

        let n = escalation_notice("bob@example.com", &failing);
        assert_eq!(n.subject, "URGENT: Plan Setup Failed After 1 Attempts");
        assert!(n.body.contains("Attempt 1: Plan ID 'A1'"));
    }

    #[test]
    fn test_data_error_notice_includes_submitted_fields() {
        let mut failed = job("B1", "B1");
        failed.exception_kind = Some(ExceptionKind::DataValidation);
        let n = data_error_notice("bob@example.com", &failed);
        assert!(n.body.contains("Invalid Data Format"));
        assert!(n.body.contains("Name: Bob Johnson"));
        assert!(n.body.contains("Address: 789 Pine Road"));
        assert!(n.body.contains("Phone Number: INVALID_PHONE"));
        assert!(n.body.contains("Plan ID: B1"));
    }

    #[tokio::test]
    async fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.send("a@example.com", "s", "b").await.unwrap();
        assert_eq!(sink.sent().len(), 1);

        let failing = RecordingSink::failing();
        assert!(failing.send("a@example.com", "s", "b").await.is_err());
        assert!(failing.sent().is_empty());
    }
}
