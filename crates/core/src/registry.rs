//! Per-lineage retry state.
//!
//! An entry is created on the first failure of a lineage and is never
//! deleted. `retry_count` always equals `attempts.len()`, and once an entry
//! is escalated it no longer accepts attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PlanqError, Result};

/// Registry status of a lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryStatus {
    /// Retries may still be granted.
    InProgress,
    /// Terminal. Handed to a human.
    Escalated,
}

impl RegistryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryStatus::InProgress => "InProgress",
            RegistryStatus::Escalated => "Escalated",
        }
    }
}

impl fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryStatus {
    type Err = PlanqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "InProgress" => Ok(RegistryStatus::InProgress),
            "Escalated" => Ok(RegistryStatus::Escalated),
            other => Err(PlanqError::Storage(format!(
                "unknown registry status: {}",
                other
            ))),
        }
    }
}

/// A retry granted to a lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// Identifier issued for the retry.
    pub work_identifier: String,
    /// 1-based retry number.
    pub retry_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// Retry registry row, keyed by lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub lineage_id: String,
    pub retry_count: u32,
    pub status: RegistryStatus,
    pub attempts: Vec<RetryAttempt>,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub requester_contact: Option<String>,
}

impl RetryEntry {
    /// Entry for a lineage that has not been retried yet.
    pub fn new(lineage_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            lineage_id: lineage_id.into(),
            retry_count: 0,
            status: RegistryStatus::InProgress,
            attempts: Vec::new(),
            first_seen: now,
            last_updated: now,
            requester_contact: None,
        }
    }

    pub fn is_escalated(&self) -> bool {
        self.status == RegistryStatus::Escalated
    }

    /// Grant one more retry.
    pub fn record_attempt(
        &mut self,
        work_identifier: impl Into<String>,
        requester_contact: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_escalated() {
            return Err(PlanqError::InvalidTransition {
                job_id: self.lineage_id.clone(),
                from: RegistryStatus::Escalated.to_string(),
                to: RegistryStatus::InProgress.to_string(),
            });
        }

        self.retry_count += 1;
        self.attempts.push(RetryAttempt {
            work_identifier: work_identifier.into(),
            retry_number: self.retry_count,
            timestamp: now,
        });
        if requester_contact.is_some() {
            self.requester_contact = requester_contact;
        }
        self.last_updated = now;
        Ok(())
    }

    /// Close the lineage. Repeating it only refreshes the timestamp.
    pub fn escalate(&mut self, now: DateTime<Utc>) {
        self.status = RegistryStatus::Escalated;
        self.last_updated = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_creates_count_of_one() {
        let mut entry = RetryEntry::new("A1", Utc::now());
        entry
            .record_attempt("A2", Some("jane@example.com".into()), Utc::now())
            .unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.attempts.len(), 1);
        assert_eq!(entry.attempts[0].retry_number, 1);
        assert_eq!(entry.status, RegistryStatus::InProgress);
        assert_eq!(entry.requester_contact.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn test_count_matches_attempts() {
        let mut entry = RetryEntry::new("A1", Utc::now());
        for id in ["A2", "A3", "A4"] {
            entry.record_attempt(id, None, Utc::now()).unwrap();
            assert_eq!(entry.retry_count as usize, entry.attempts.len());
        }
        let issued: Vec<&str> = entry
            .attempts
            .iter()
            .map(|attempt| attempt.work_identifier.as_str())
            .collect();
        assert_eq!(issued, vec!["A2", "A3", "A4"]);
    }

    #[test]
    fn test_contact_refresh_keeps_known_address() {
        let mut entry = RetryEntry::new("A1", Utc::now());
        entry
            .record_attempt("A2", Some("old@example.com".into()), Utc::now())
            .unwrap();
        entry.record_attempt("A3", None, Utc::now()).unwrap();
        assert_eq!(entry.requester_contact.as_deref(), Some("old@example.com"));
        entry
            .record_attempt("A4", Some("new@example.com".into()), Utc::now())
            .unwrap();
        assert_eq!(entry.requester_contact.as_deref(), Some("new@example.com"));
    }

    #[test]
    fn test_escalated_entry_rejects_attempts() {
        let mut entry = RetryEntry::new("A1", Utc::now());
        entry.record_attempt("A2", None, Utc::now()).unwrap();
        entry.escalate(Utc::now());
        assert!(entry.record_attempt("A3", None, Utc::now()).is_err());
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.attempts.len(), 1);
    }

    #[test]
    fn test_escalate_is_idempotent() {
        let mut entry = RetryEntry::new("A1", Utc::now());
        entry.escalate(Utc::now());
        let snapshot = entry.clone();
        entry.escalate(Utc::now());
        assert!(entry.is_escalated());
        assert_eq!(entry.retry_count, snapshot.retry_count);
        assert_eq!(entry.attempts, snapshot.attempts);
        assert!(entry.last_updated >= snapshot.last_updated);
    }

    #[test]
    fn test_registry_status_parse() {
        assert_eq!(
            "Escalated".parse::<RegistryStatus>().unwrap(),
            RegistryStatus::Escalated
        );
        assert!("Done".parse::<RegistryStatus>().is_err());
    }
}
