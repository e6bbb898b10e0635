//! Sync metadata repository implementation

use libsql::Connection;

use crate::error::Result;

/// Trait for small durable engine-level facts (async)
#[allow(async_fn_in_trait)]
pub trait MetaRepository {
    /// Get a metadata value by key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a metadata value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// libSQL implementation of `MetaRepository`
pub struct LibSqlMetaRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlMetaRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl MetaRepository for LibSqlMetaRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_meta WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO sync_meta (key, value) VALUES (?, ?)",
                [key, value],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_missing_key() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlMetaRepository::new(db.connection());

        assert!(repo.get("last_synced_at").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_and_replace() {
        let db = Database::open_in_memory().await.unwrap();
        let repo = LibSqlMetaRepository::new(db.connection());

        repo.set("last_synced_at", "1000").await.unwrap();
        repo.set("last_synced_at", "2000").await.unwrap();

        assert_eq!(
            repo.get("last_synced_at").await.unwrap().as_deref(),
            Some("2000")
        );
    }
}
