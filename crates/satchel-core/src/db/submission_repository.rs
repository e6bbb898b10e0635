//! Submission queue repository implementation

use libsql::{params, Connection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{LocalId, NewSubmission, SubmissionRecord, SubmissionStatus, Visibility};

/// Trait for submission queue storage operations (async)
#[allow(async_fn_in_trait)]
pub trait SubmissionRepository {
    /// Queue a new submission; the store assigns the local id
    async fn add(&self, new: NewSubmission) -> Result<SubmissionRecord>;

    /// Get a submission by local id
    async fn get(&self, id: LocalId) -> Result<Option<SubmissionRecord>>;

    /// List submissions in any of the given statuses, in creation order
    async fn list_by_status(
        &self,
        statuses: &[SubmissionStatus],
    ) -> Result<Vec<SubmissionRecord>>;

    /// Count submissions in any of the given statuses
    async fn count_by_status(&self, statuses: &[SubmissionStatus]) -> Result<u64>;

    /// Transition a submission; `error = None` clears the stored message
    async fn update_status(
        &self,
        id: LocalId,
        status: SubmissionStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Permanently delete all submissions in the given status
    async fn delete_by_status(&self, status: SubmissionStatus) -> Result<u64>;

    /// Return records left `Syncing` by an interrupted run to `Pending`
    async fn reset_in_flight(&self) -> Result<u64>;
}

/// libSQL implementation of `SubmissionRepository`
pub struct LibSqlSubmissionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSubmissionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse a submission from a database row
    fn parse_record(row: &Row) -> Result<SubmissionRecord> {
        let idempotency_key: String = row.get(1)?;
        let visibility: String = row.get(5)?;
        let status: String = row.get(6)?;
        let error = match row.get_value(7)? {
            libsql::Value::Text(message) => Some(message),
            _ => None,
        };

        Ok(SubmissionRecord {
            local_id: LocalId::new(row.get(0)?),
            idempotency_key: Uuid::parse_str(&idempotency_key)
                .map_err(|_| Error::InvalidInput("invalid idempotency key".into()))?,
            form_id: row.get(2)?,
            form_version: row.get(3)?,
            payload: row.get(4)?,
            visibility: visibility.parse::<Visibility>()?,
            status: status.parse::<SubmissionStatus>()?,
            error,
            created_at: row.get(8)?,
        })
    }
}

const SELECT_COLUMNS: &str = "local_id, idempotency_key, form_id, form_version, payload, \
                              visibility, status, error, created_at";

impl SubmissionRepository for LibSqlSubmissionRepository<'_> {
    async fn add(&self, new: NewSubmission) -> Result<SubmissionRecord> {
        let idempotency_key = Uuid::now_v7();
        let created_at = chrono::Utc::now().timestamp_millis();

        self.conn
            .execute(
                "INSERT INTO submissions
                 (idempotency_key, form_id, form_version, payload, visibility, status, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    idempotency_key.to_string(),
                    new.form_id.clone(),
                    new.form_version.clone(),
                    new.payload.clone(),
                    new.visibility.as_str(),
                    SubmissionStatus::Pending.as_str(),
                    created_at
                ],
            )
            .await?;

        let local_id = LocalId::new(self.conn.last_insert_rowid());
        tracing::debug!(%local_id, form_id = %new.form_id, "queued submission");

        Ok(SubmissionRecord {
            local_id,
            idempotency_key,
            form_id: new.form_id,
            form_version: new.form_version,
            payload: new.payload,
            visibility: new.visibility,
            status: SubmissionStatus::Pending,
            error: None,
            created_at,
        })
    }

    async fn get(&self, id: LocalId) -> Result<Option<SubmissionRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SELECT_COLUMNS} FROM submissions WHERE local_id = ?"),
                params![id.as_i64()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_by_status(
        &self,
        statuses: &[SubmissionStatus],
    ) -> Result<Vec<SubmissionRecord>> {
        let mut records = Vec::new();

        for status in statuses {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM submissions
                         WHERE status = ?
                         ORDER BY local_id"
                    ),
                    params![status.as_str()],
                )
                .await?;

            while let Some(row) = rows.next().await? {
                records.push(Self::parse_record(&row)?);
            }
        }

        // Creation order across statuses; local ids are monotonic
        records.sort_by_key(|record| record.local_id);
        Ok(records)
    }

    async fn count_by_status(&self, statuses: &[SubmissionStatus]) -> Result<u64> {
        let mut total = 0u64;

        for status in statuses {
            let mut rows = self
                .conn
                .query(
                    "SELECT COUNT(*) FROM submissions WHERE status = ?",
                    params![status.as_str()],
                )
                .await?;

            if let Some(row) = rows.next().await? {
                total += u64::try_from(row.get::<i64>(0)?).unwrap_or(0);
            }
        }

        Ok(total)
    }

    async fn update_status(
        &self,
        id: LocalId,
        status: SubmissionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let error_value = error.map(ToString::to_string);
        let rows = self
            .conn
            .execute(
                "UPDATE submissions SET status = ?, error = ? WHERE local_id = ?",
                params![status.as_str(), error_value, id.as_i64()],
            )
            .await?;

        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }

        tracing::debug!(%id, %status, "submission status updated");
        Ok(())
    }

    async fn delete_by_status(&self, status: SubmissionStatus) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "DELETE FROM submissions WHERE status = ?",
                params![status.as_str()],
            )
            .await?;

        Ok(rows)
    }

    async fn reset_in_flight(&self) -> Result<u64> {
        let rows = self
            .conn
            .execute(
                "UPDATE submissions SET status = ?, error = NULL WHERE status = ?",
                params![
                    SubmissionStatus::Pending.as_str(),
                    SubmissionStatus::Syncing.as_str()
                ],
            )
            .await?;

        Ok(rows)
    }
}
