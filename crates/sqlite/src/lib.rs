//! SQLite backend for the planq work queue.
//!
//! Jobs and retry registry entries live in two tables prefixed with the
//! namespace (`{ns}_jobs`, `{ns}_registry`). Claims are a single
//! `UPDATE ... RETURNING` statement, and every read-modify-write runs in a
//! `BEGIN IMMEDIATE` transaction guarded by a compare-and-swap on the
//! previous status. Several processes may share one database file: lock
//! contention that outlasts the busy timeout surfaces as
//! [`PlanqError::Busy`], which callers retry on their next cycle.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use planq_core::{QueueConfig, QueueManager};
//! use planq_sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> planq_core::Result<()> {
//!     let backend = SqliteBackend::new("sqlite:planq.db", "planq").await?;
//!     let queue = QueueManager::new(backend, QueueConfig::default());
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use planq_core::{
    Backend, ExceptionKind, Job, JobId, JobStatus, JobStore, JobUpdate, PlanqError, QueueStats,
    RegistryStatus, Resolution, ResolveOutcome, Result, RetryEntry, RetryRegistry,
};

const JOB_COLUMNS: &str = "job_id, work_identifier, lineage_id, status, payload, assigned_worker, \
     attempt_number, attempt_history, exception_kind, created_at, updated_at, claimed_at, completed_at";

const REGISTRY_COLUMNS: &str =
    "lineage_id, retry_count, status, attempts, first_seen, last_updated, requester_contact";

/// How long a statement waits on another connection's lock by default.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Takes the write lock up front so the busy timeout covers the whole
/// read-modify-write instead of failing on lock upgrade.
const BEGIN_IMMEDIATE: &str = "BEGIN IMMEDIATE";

// SQLITE_BUSY and SQLITE_LOCKED; extended codes keep these in the low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn storage(context: &'static str) -> impl Fn(sqlx::Error) -> PlanqError {
    move |e| {
        if is_busy(&e) {
            PlanqError::Busy(format!("{}: {}", context, e))
        } else {
            PlanqError::Storage(format!("{}: {}", context, e))
        }
    }
}

/// Lock contention with another connection, as opposed to a broken store.
fn is_busy(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let code = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            matches!(code, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
                || db.message().contains("database is locked")
                || db.message().contains("database table is locked")
        }
        _ => false,
    }
}

fn encode_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339()
}

fn decode_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|e| PlanqError::Storage(format!("bad timestamp {:?}: {}", value, e)))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    work_identifier: String,
    lineage_id: String,
    status: String,
    payload: String,
    assigned_worker: String,
    attempt_number: i64,
    attempt_history: String,
    exception_kind: Option<String>,
    created_at: String,
    updated_at: String,
    claimed_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = PlanqError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            job_id: row
                .job_id
                .parse::<JobId>()
                .map_err(|_| PlanqError::Storage(format!("bad job id {:?}", row.job_id)))?,
            work_identifier: row.work_identifier,
            lineage_id: row.lineage_id,
            status: row.status.parse()?,
            payload: serde_json::from_str(&row.payload)?,
            assigned_worker: row.assigned_worker,
            attempt_number: u32::try_from(row.attempt_number).map_err(|_| {
                PlanqError::Storage(format!("bad attempt number {}", row.attempt_number))
            })?,
            attempt_history: serde_json::from_str(&row.attempt_history)?,
            exception_kind: row.exception_kind.map(ExceptionKind::from),
            created_at: decode_time(&row.created_at)?,
            updated_at: decode_time(&row.updated_at)?,
            claimed_at: row.claimed_at.as_deref().map(decode_time).transpose()?,
            completed_at: row.completed_at.as_deref().map(decode_time).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RegistryRow {
    lineage_id: String,
    retry_count: i64,
    status: String,
    attempts: String,
    first_seen: String,
    last_updated: String,
    requester_contact: Option<String>,
}

impl TryFrom<RegistryRow> for RetryEntry {
    type Error = PlanqError;

    fn try_from(row: RegistryRow) -> Result<Self> {
        Ok(RetryEntry {
            lineage_id: row.lineage_id,
            retry_count: u32::try_from(row.retry_count).map_err(|_| {
                PlanqError::Storage(format!("bad retry count {}", row.retry_count))
            })?,
            status: row.status.parse::<RegistryStatus>()?,
            attempts: serde_json::from_str(&row.attempts)?,
            first_seen: decode_time(&row.first_seen)?,
            last_updated: decode_time(&row.last_updated)?,
            requester_contact: row.requester_contact,
        })
    }
}

/// SQLite backend for job and registry storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`.
    /// Missing database files are created.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        Self::connect(database_url, namespace, DEFAULT_BUSY_TIMEOUT).await
    }

    /// Like [`new`](Self::new), waiting at most `busy_timeout` for locks
    /// held by other connections to the same file.
    pub async fn connect(
        database_url: &str,
        namespace: &str,
        busy_timeout: Duration,
    ) -> Result<Self> {
        if namespace.is_empty()
            || !namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(PlanqError::Config(format!(
                "namespace must be alphanumeric or '_': {:?}",
                namespace
            )));
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PlanqError::Config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(busy_timeout);

        // A single connection serializes writers; it also keeps an in-memory
        // database alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage("Failed to connect to SQLite"))?;

        let backend = Self {
            pool,
            namespace: namespace.to_string(),
        };

        backend.init_tables().await?;
        tracing::debug!(
            namespace = %namespace,
            busy_timeout_ms = busy_timeout.as_millis() as u64,
            "SQLite backend ready"
        );

        Ok(backend)
    }

    /// Create an in-memory SQLite backend (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn init_tables(&self) -> Result<()> {
        let jobs = self.jobs_table();
        let registry = self.registry_table();

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {jobs} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL UNIQUE,
                work_identifier TEXT NOT NULL,
                lineage_id TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                assigned_worker TEXT NOT NULL DEFAULT '',
                attempt_number INTEGER NOT NULL DEFAULT 0,
                attempt_history TEXT NOT NULL DEFAULT '[]',
                exception_kind TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                claimed_at TEXT,
                completed_at TEXT
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to create jobs table"))?;

        for (column, suffix) in [
            ("status", "status"),
            ("lineage_id", "lineage"),
            ("work_identifier", "identifier"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_jobs_{} ON {} ({})",
                self.namespace, suffix, jobs, column
            ))
            .execute(&self.pool)
            .await
            .map_err(storage("Failed to create jobs index"))?;
        }

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {registry} (
                lineage_id TEXT PRIMARY KEY,
                retry_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                attempts TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                requester_contact TEXT
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(storage("Failed to create registry table"))?;

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    fn registry_table(&self) -> String {
        format!("{}_registry", self.namespace)
    }

    async fn fetch_job(&self, conn: &mut SqliteConnection, job_id: &JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE job_id = ?",
            JOB_COLUMNS,
            self.jobs_table()
        ))
        .bind(job_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage("Failed to fetch job"))?;

        row.map(Job::try_from).transpose()
    }

    async fn insert_job(&self, conn: &mut SqliteConnection, job: &Job) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.jobs_table(),
            JOB_COLUMNS
        ))
        .bind(job.job_id.to_string())
        .bind(&job.work_identifier)
        .bind(&job.lineage_id)
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(&job.assigned_worker)
        .bind(i64::from(job.attempt_number))
        .bind(serde_json::to_string(&job.attempt_history)?)
        .bind(job.exception_kind.as_ref().map(|kind| kind.reason().to_string()))
        .bind(encode_time(&job.created_at))
        .bind(encode_time(&job.updated_at))
        .bind(job.claimed_at.as_ref().map(encode_time))
        .bind(job.completed_at.as_ref().map(encode_time))
        .execute(&mut *conn)
        .await
        .map_err(storage("Failed to insert job"))?;
        Ok(())
    }

    /// Write the mutable columns of `job` if the stored status is still
    /// `expected`. Returns false when another writer got there first.
    async fn swap_job(
        &self,
        conn: &mut SqliteConnection,
        job: &Job,
        expected: JobStatus,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ?, assigned_worker = ?, exception_kind = ?, updated_at = ?, \
             claimed_at = ?, completed_at = ? WHERE job_id = ? AND status = ?",
            self.jobs_table()
        ))
        .bind(job.status.as_str())
        .bind(&job.assigned_worker)
        .bind(job.exception_kind.as_ref().map(|kind| kind.reason().to_string()))
        .bind(encode_time(&job.updated_at))
        .bind(job.claimed_at.as_ref().map(encode_time))
        .bind(job.completed_at.as_ref().map(encode_time))
        .bind(job.job_id.to_string())
        .bind(expected.as_str())
        .execute(&mut *conn)
        .await
        .map_err(storage("Failed to update job"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn fetch_entry(
        &self,
        conn: &mut SqliteConnection,
        lineage_id: &str,
    ) -> Result<Option<RetryEntry>> {
        let row: Option<RegistryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE lineage_id = ?",
            REGISTRY_COLUMNS,
            self.registry_table()
        ))
        .bind(lineage_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage("Failed to fetch registry entry"))?;

        row.map(RetryEntry::try_from).transpose()
    }

    async fn upsert_entry(&self, conn: &mut SqliteConnection, entry: &RetryEntry) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(lineage_id) DO UPDATE SET \
                 retry_count = excluded.retry_count, \
                 status = excluded.status, \
                 attempts = excluded.attempts, \
                 last_updated = excluded.last_updated, \
                 requester_contact = excluded.requester_contact",
            self.registry_table(),
            REGISTRY_COLUMNS
        ))
        .bind(&entry.lineage_id)
        .bind(i64::from(entry.retry_count))
        .bind(entry.status.as_str())
        .bind(serde_json::to_string(&entry.attempts)?)
        .bind(encode_time(&entry.first_seen))
        .bind(encode_time(&entry.last_updated))
        .bind(&entry.requester_contact)
        .execute(&mut *conn)
        .await
        .map_err(storage("Failed to write registry entry"))?;
        Ok(())
    }

    /// Read-modify-write of one registry entry inside a transaction.
    async fn modify_entry<F>(&self, lineage_id: &str, modify: F) -> Result<RetryEntry>
    where
        F: FnOnce(&mut RetryEntry, DateTime<Utc>) -> Result<()> + Send,
    {
        let mut tx = self
            .pool
            .begin_with(BEGIN_IMMEDIATE)
            .await
            .map_err(storage("Failed to begin transaction"))?;
        let now = Utc::now();

        let mut entry = self
            .fetch_entry(&mut tx, lineage_id)
            .await?
            .unwrap_or_else(|| RetryEntry::new(lineage_id, now));
        modify(&mut entry, now)?;
        self.upsert_entry(&mut tx, &entry).await?;

        tx.commit()
            .await
            .map_err(storage("Failed to commit registry update"))?;
        Ok(entry)
    }
}

#[async_trait]
impl JobStore for SqliteBackend {
    async fn enqueue(&self, job: Job) -> Result<JobId> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(storage("Failed to acquire connection"))?;
        self.insert_job(&mut conn, &job).await?;
        Ok(job.job_id)
    }

    async fn claim_next(&self, worker: &str) -> Result<Option<Job>> {
        let table = self.jobs_table();
        let now = encode_time(&Utc::now());

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE {table} \
             SET status = 'Claimed', assigned_worker = ?1, claimed_at = ?2, updated_at = ?2 \
             WHERE seq = ( \
                 SELECT seq FROM {table} WHERE status = 'Pending' ORDER BY seq LIMIT 1 \
             ) AND status = 'Pending' \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("Failed to claim job"))?;

        row.map(Job::try_from).transpose()
    }

    async fn complete(&self, job_id: &JobId) -> Result<()> {
        self.update(job_id, JobUpdate::status(JobStatus::Completed))
            .await
            .map(|_| ())
    }

    async fn fail(&self, job_id: &JobId, kind: ExceptionKind) -> Result<()> {
        self.update(
            job_id,
            JobUpdate::status(JobStatus::Failed).exception_kind(kind),
        )
        .await
        .map(|_| ())
    }

    async fn update(&self, job_id: &JobId, update: JobUpdate) -> Result<Job> {
        let mut tx = self
            .pool
            .begin_with(BEGIN_IMMEDIATE)
            .await
            .map_err(storage("Failed to begin transaction"))?;

        let mut job = self
            .fetch_job(&mut tx, job_id)
            .await?
            .ok_or_else(|| PlanqError::JobNotFound(job_id.to_string()))?;
        let previous = job.status;
        job.apply(&update, Utc::now())?;

        if !self.swap_job(&mut tx, &job, previous).await? {
            return Err(PlanqError::InvalidTransition {
                job_id: job_id.to_string(),
                from: previous.to_string(),
                to: update.status.to_string(),
            });
        }

        tx.commit()
            .await
            .map_err(storage("Failed to commit job update"))?;
        Ok(job)
    }

    async fn query_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE status = ? ORDER BY seq",
            JOB_COLUMNS,
            self.jobs_table()
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to query jobs"))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(storage("Failed to acquire connection"))?;
        self.fetch_job(&mut conn, job_id).await
    }

    async fn all_jobs(&self) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} ORDER BY seq",
            JOB_COLUMNS,
            self.jobs_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to list jobs"))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(&format!(
            "SELECT status, attempt_number, COUNT(*) FROM {} GROUP BY status, attempt_number",
            self.jobs_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to count jobs"))?;

        let mut stats = QueueStats::default();
        for (status, attempt_number, count) in rows {
            stats.add_many(
                status.parse()?,
                u32::try_from(attempt_number).unwrap_or(u32::MAX),
                usize::try_from(count).unwrap_or(0),
            );
        }
        Ok(stats)
    }

    async fn identifier_in_use(&self, identifier: &str) -> Result<bool> {
        let (in_use,): (i64,) = sqlx::query_as(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE work_identifier = ?1 OR lineage_id = ?1)",
            self.jobs_table()
        ))
        .bind(identifier)
        .fetch_one(&self.pool)
        .await
        .map_err(storage("Failed to check identifier"))?;

        Ok(in_use != 0)
    }
}

#[async_trait]
impl RetryRegistry for SqliteBackend {
    async fn lookup(&self, lineage_id: &str) -> Result<Option<RetryEntry>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(storage("Failed to acquire connection"))?;
        self.fetch_entry(&mut conn, lineage_id).await
    }

    async fn record_attempt(
        &self,
        lineage_id: &str,
        new_identifier: &str,
        requester_contact: Option<&str>,
    ) -> Result<RetryEntry> {
        let contact = requester_contact.map(str::to_string);
        self.modify_entry(lineage_id, |entry, now| {
            entry.record_attempt(new_identifier, contact, now)
        })
        .await
    }

    async fn escalate(&self, lineage_id: &str) -> Result<RetryEntry> {
        self.modify_entry(lineage_id, |entry, now| {
            entry.escalate(now);
            Ok(())
        })
        .await
    }

    async fn entries(&self) -> Result<Vec<RetryEntry>> {
        let rows: Vec<RegistryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} ORDER BY first_seen",
            REGISTRY_COLUMNS,
            self.registry_table()
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage("Failed to list registry"))?;

        rows.into_iter().map(RetryEntry::try_from).collect()
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn resolve(&self, resolution: Resolution) -> Result<ResolveOutcome> {
        let mut tx = self
            .pool
            .begin_with(BEGIN_IMMEDIATE)
            .await
            .map_err(storage("Failed to begin transaction"))?;
        let now = Utc::now();

        let job_id = resolution.job_id().clone();
        let mut failed = self
            .fetch_job(&mut tx, &job_id)
            .await?
            .ok_or_else(|| PlanqError::JobNotFound(job_id.to_string()))?;
        if failed.status != JobStatus::Failed {
            return Ok(ResolveOutcome::Stale);
        }
        failed.transition(resolution.target_status(), now)?;

        let (entry, successor) = match resolution {
            Resolution::Retry {
                lineage_id,
                new_identifier,
                requester_contact,
                successor,
                ..
            } => {
                let mut entry = self
                    .fetch_entry(&mut tx, &lineage_id)
                    .await?
                    .unwrap_or_else(|| RetryEntry::new(lineage_id.clone(), now));
                entry.record_attempt(new_identifier.clone(), requester_contact, now)?;
                (Some(entry), Some(Job::from_new(successor, new_identifier, now)))
            }
            Resolution::Escalate { lineage_id, .. } => {
                let mut entry = self
                    .fetch_entry(&mut tx, &lineage_id)
                    .await?
                    .unwrap_or_else(|| RetryEntry::new(lineage_id.clone(), now));
                entry.escalate(now);
                (Some(entry), None)
            }
            Resolution::CloseDuplicate { .. } | Resolution::Notify { .. } => (None, None),
        };

        if !self.swap_job(&mut tx, &failed, JobStatus::Failed).await? {
            return Ok(ResolveOutcome::Stale);
        }
        if let Some(entry) = &entry {
            self.upsert_entry(&mut tx, entry).await?;
        }
        if let Some(successor) = &successor {
            self.insert_job(&mut tx, successor).await?;
        }

        tx.commit()
            .await
            .map_err(storage("Failed to commit resolution"))?;
        Ok(ResolveOutcome::Applied { successor })
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self
            .pool
            .begin_with(BEGIN_IMMEDIATE)
            .await
            .map_err(storage("Failed to begin transaction"))?;
        for table in [self.jobs_table(), self.registry_table()] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .map_err(storage("Failed to clear table"))?;
        }
        tx.commit()
            .await
            .map_err(storage("Failed to commit clear"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planq_core::{NewJob, Payload};

    #[tokio::test]
    async fn test_rejects_unsafe_namespace() {
        let err = SqliteBackend::in_memory("jobs; DROP TABLE x")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PlanqError::Config(_)));
    }

    #[test]
    fn test_lock_contention_maps_to_busy() {
        assert!(is_busy(&sqlx::Error::PoolTimedOut));
        assert!(!is_busy(&sqlx::Error::RowNotFound));

        let busy = storage("Failed to claim job")(sqlx::Error::PoolTimedOut);
        assert!(matches!(busy, PlanqError::Busy(_)));
        assert!(!busy.is_fatal());
        assert!(storage("Failed to claim job")(sqlx::Error::RowNotFound).is_fatal());
    }

    #[tokio::test]
    async fn test_job_row_round_trip() {
        let backend = SqliteBackend::in_memory("test").await.unwrap();
        let job = Job::from_new(
            NewJob::new(
                Payload::new("Jane Doe")
                    .address("456 Oak Avenue")
                    .requester_contact("jane@example.com"),
            ),
            "ABC1234".to_string(),
            Utc::now(),
        );
        let job_id = backend.enqueue(job.clone()).await.unwrap();

        let stored = backend.get(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.payload, job.payload);
        assert_eq!(stored.lineage_id, "ABC1234");
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.created_at.timestamp(), job.created_at.timestamp());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_a_hard_error() {
        let backend = SqliteBackend::in_memory("test").await.unwrap();
        let job = Job::from_new(NewJob::new(Payload::default()), "X1".into(), Utc::now());
        let job_id = backend.enqueue(job).await.unwrap();

        sqlx::query("UPDATE test_jobs SET payload = 'not json'")
            .execute(&backend.pool)
            .await
            .unwrap();

        let err = backend.get(&job_id).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let backend = SqliteBackend::in_memory("alpha").await.unwrap();
        let other = SqliteBackend {
            pool: backend.pool.clone(),
            namespace: "beta".to_string(),
        };
        other.init_tables().await.unwrap();

        backend
            .enqueue(Job::from_new(NewJob::new(Payload::default()), "A1".into(), Utc::now()))
            .await
            .unwrap();
        assert_eq!(backend.stats().await.unwrap().total, 1);
        assert_eq!(other.stats().await.unwrap().total, 0);
    }
}
