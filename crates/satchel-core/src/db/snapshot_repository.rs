//! Form snapshot cache implementation

use libsql::{params, Connection};

use crate::error::Result;
use crate::models::FormSnapshot;

/// Trait for the form snapshot cache (async)
///
/// A read-through cache with no expiry; staleness is tolerated by design
/// since snapshots exist only so forms can be rendered while offline.
#[allow(async_fn_in_trait)]
pub trait SnapshotRepository {
    /// Unconditional upsert, called after any successful online fetch
    async fn put(&self, snapshot: &FormSnapshot) -> Result<()>;

    /// Get the cached snapshot for a form, if any
    async fn get(&self, form_id: &str) -> Result<Option<FormSnapshot>>;
}

/// libSQL implementation of `SnapshotRepository`
pub struct LibSqlSnapshotRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlSnapshotRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl SnapshotRepository for LibSqlSnapshotRepository<'_> {
    async fn put(&self, snapshot: &FormSnapshot) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO form_snapshots
                 (form_id, project_id, version, payload, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    snapshot.form_id.clone(),
                    snapshot.project_id.clone(),
                    snapshot.version.clone(),
                    snapshot.payload.clone(),
                    snapshot.updated_at
                ],
            )
            .await?;

        tracing::debug!(form_id = %snapshot.form_id, version = %snapshot.version, "snapshot cached");
        Ok(())
    }

    async fn get(&self, form_id: &str) -> Result<Option<FormSnapshot>> {
        let mut rows = self
            .conn
            .query(
                "SELECT form_id, project_id, version, payload, updated_at
                 FROM form_snapshots WHERE form_id = ?",
                params![form_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(FormSnapshot {
                form_id: row.get(0)?,
                project_id: row.get(1)?,
                version: row.get(2)?,
                payload: row.get(3)?,
                updated_at: row.get(4)?,
            })),
            None => Ok(None),
        }
    }
}
