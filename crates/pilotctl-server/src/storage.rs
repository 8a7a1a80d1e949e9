use async_trait::async_trait;
use pilotctl_types::{now, Command, JobAssignment};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Admission, job and command records the service reads and writes.
#[async_trait]
pub trait PilotStore: Send + Sync {
    /// Whether the host has been admitted to the service.
    async fn is_admitted(&self, host_uuid: &str) -> Result<bool, StoreError>;

    /// Claim the next job for a host, if any.
    async fn next_job(&self, host_uuid: &str) -> Result<Option<JobAssignment>, StoreError>;

    /// Close a running job owned by `host_uuid` with its log.
    ///
    /// Reports for jobs the host does not own, or that are not running, are
    /// ignored.
    async fn complete_job(
        &self,
        host_uuid: &str,
        job_id: i64,
        log: &str,
        failed: bool,
    ) -> Result<(), StoreError>;

    /// Look up a command definition by key.
    async fn command(&self, key: &str) -> Result<Option<Command>, StoreError>;

    /// Organisational placement of a host, if it has been registered.
    async fn host(&self, host_uuid: &str) -> Result<Option<HostRecord>, StoreError>;
}

/// Where a host sits in the organisation, copied onto its events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostRecord {
    pub organisation: String,
    pub organisation_group: String,
    pub area: String,
    pub location: String,
    pub labels: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub job_id: i64,
    pub host_uuid: String,
    pub command_key: String,
    pub command_version: i64,
    pub status: JobStatus,
    pub log: String,
}

/// SQLite-backed [`PilotStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    /// Open or create the database.
    pub async fn open(db_path: &str) -> Result<Self, StoreError> {
        // Each connection to `:memory:` opens a separate database.
        let max_connections = if db_path == ":memory:" { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&format!("sqlite:{db_path}?mode=rwc"))
            .await?;

        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS admission (
                host_uuid TEXT PRIMARY KEY,
                admitted INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS command (
                key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                definition TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                host_uuid TEXT NOT NULL,
                command_key TEXT NOT NULL,
                command_version INTEGER NOT NULL,
                status TEXT NOT NULL,
                log TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS host (
                host_uuid TEXT PRIMARY KEY,
                organisation TEXT NOT NULL DEFAULT '',
                organisation_group TEXT NOT NULL DEFAULT '',
                area TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                labels TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_job_host_status ON job(host_uuid, status)")
            .execute(self.pool.as_ref())
            .await?;

        Ok(())
    }

    /// Admit a host, or revoke its admission.
    pub async fn admit(&self, host_uuid: &str, admitted: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO admission (host_uuid, admitted, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(host_uuid) DO UPDATE
             SET admitted = excluded.admitted, updated_at = excluded.updated_at",
        )
        .bind(host_uuid)
        .bind(admitted)
        .bind(now())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Register a host's organisational placement, replacing any previous one.
    pub async fn put_host(&self, host_uuid: &str, host: &HostRecord) -> Result<(), StoreError> {
        let labels =
            serde_json::to_string(&host.labels).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO host (host_uuid, organisation, organisation_group, area, location, labels, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(host_uuid) DO UPDATE
             SET organisation = excluded.organisation,
                 organisation_group = excluded.organisation_group,
                 area = excluded.area,
                 location = excluded.location,
                 labels = excluded.labels,
                 updated_at = excluded.updated_at",
        )
        .bind(host_uuid)
        .bind(&host.organisation)
        .bind(&host.organisation_group)
        .bind(&host.area)
        .bind(&host.location)
        .bind(labels)
        .bind(now())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// Create or replace a command definition. Returns its new version.
    ///
    /// The stored `job_id` is ignored; it is filled in when the command is
    /// handed out.
    pub async fn put_command(&self, key: &str, command: &Command) -> Result<i64, StoreError> {
        let definition = serde_json::to_string(&Command {
            job_id: 0,
            ..command.clone()
        })
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let (version,): (i64,) = sqlx::query_as(
            "INSERT INTO command (key, version, definition, updated_at) VALUES (?, 1, ?, ?)
             ON CONFLICT(key) DO UPDATE
             SET version = command.version + 1, definition = excluded.definition, updated_at = excluded.updated_at
             RETURNING version",
        )
        .bind(key)
        .bind(definition)
        .bind(now())
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(version)
    }

    /// Queue the current version of a command for a host.
    pub async fn enqueue_job(&self, host_uuid: &str, command_key: &str) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM command WHERE key = ?")
            .bind(command_key)
            .fetch_optional(self.pool.as_ref())
            .await?;
        let (version,) =
            row.ok_or_else(|| StoreError::NotFound(format!("command '{command_key}'")))?;

        let result = sqlx::query(
            "INSERT INTO job (host_uuid, command_key, command_version, status, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(host_uuid)
        .bind(command_key)
        .bind(version)
        .bind(JobStatus::Pending.as_str())
        .bind(now())
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn job(&self, job_id: i64) -> Result<Option<JobRecord>, StoreError> {
        let row: Option<(i64, String, String, i64, String, String)> = sqlx::query_as(
            "SELECT id, host_uuid, command_key, command_version, status, log
             FROM job WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.map(
            |(job_id, host_uuid, command_key, command_version, status, log)| -> Result<JobRecord, StoreError> {
                let status = JobStatus::parse(&status).ok_or_else(|| {
                    StoreError::Corrupt(format!("job {job_id} has status '{status}'"))
                })?;
                Ok(JobRecord {
                    job_id,
                    host_uuid,
                    command_key,
                    command_version,
                    status,
                    log,
                })
            },
        )
        .transpose()
    }
}

#[async_trait]
impl PilotStore for SqliteStore {
    async fn is_admitted(&self, host_uuid: &str) -> Result<bool, StoreError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT admitted FROM admission WHERE host_uuid = ?")
                .bind(host_uuid)
                .fetch_optional(self.pool.as_ref())
                .await?;
        Ok(row.is_some_and(|(admitted,)| admitted))
    }

    async fn next_job(&self, host_uuid: &str) -> Result<Option<JobAssignment>, StoreError> {
        // Claim in one statement so two concurrent pings cannot take the same job.
        let row: Option<(i64, String, i64)> = sqlx::query_as(
            "UPDATE job SET status = ?, started_at = ?
             WHERE id = (
                 SELECT id FROM job WHERE host_uuid = ? AND status = ?
                 ORDER BY id LIMIT 1
             )
             RETURNING id, command_key, command_version",
        )
        .bind(JobStatus::Running.as_str())
        .bind(now())
        .bind(host_uuid)
        .bind(JobStatus::Pending.as_str())
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(row.map(|(job_id, command_key, command_version)| JobAssignment {
            job_id,
            command_key,
            command_version,
        }))
    }

    async fn complete_job(
        &self,
        host_uuid: &str,
        job_id: i64,
        log: &str,
        failed: bool,
    ) -> Result<(), StoreError> {
        let status = if failed {
            JobStatus::Failed
        } else {
            JobStatus::Done
        };
        let result = sqlx::query(
            "UPDATE job SET status = ?, log = ?, completed_at = ?
             WHERE id = ? AND host_uuid = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(log)
        .bind(now())
        .bind(job_id)
        .bind(host_uuid)
        .bind(JobStatus::Running.as_str())
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            warn!(
                host = %host_uuid,
                job_id,
                "completion reported for a job the host is not running"
            );
        }
        Ok(())
    }

    async fn command(&self, key: &str) -> Result<Option<Command>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT definition FROM command WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.map(|(definition,)| {
            serde_json::from_str(&definition)
                .map_err(|e| StoreError::Corrupt(format!("command '{key}': {e}")))
        })
        .transpose()
    }

    async fn host(&self, host_uuid: &str) -> Result<Option<HostRecord>, StoreError> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT organisation, organisation_group, area, location, labels
             FROM host WHERE host_uuid = ?",
        )
        .bind(host_uuid)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(
            |(organisation, organisation_group, area, location, labels)| -> Result<HostRecord, StoreError> {
                let labels = serde_json::from_str(&labels)
                    .map_err(|e| StoreError::Corrupt(format!("host '{host_uuid}' labels: {e}")))?;
                Ok(HostRecord {
                    organisation,
                    organisation_group,
                    area,
                    location,
                    labels,
                })
            },
        )
        .transpose()
    }
}
