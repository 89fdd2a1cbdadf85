//! `SQLite` bookkeeping: per-file records, the chunk ledger used for
//! incremental sync, and persisted repository statuses.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::chunk::{Chunk, ChunkId};
use crate::error::Result;
use crate::languages::Lang;
use crate::status::{IndexStatus, StatusUpdate};

/// One indexed source file as recorded after a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub path: String,
    pub language: Lang,
    pub size: u64,
    pub content_hash: String,
    pub line_count: usize,
    pub chunk_count: usize,
    pub function_count: usize,
    pub class_count: usize,
}

type FileRow = (String, String, i64, String, i64, i64, i64, i64);

fn file_record_from_row(row: FileRow) -> Result<FileRecord> {
    let (path, language, size, content_hash, lines, chunks, functions, classes) = row;
    Ok(FileRecord {
        path,
        language: Lang::from_id(&language),
        size: u64::try_from(size)?,
        content_hash,
        line_count: usize::try_from(lines)?,
        chunk_count: usize::try_from(chunks)?,
        function_count: usize::try_from(functions)?,
        class_count: usize::try_from(classes)?,
    })
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (or create) the database at `path` and run migrations.
    /// `":memory:"` gives a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn open(path: &str) -> Result<Self> {
        let (url, max_connections) = if path == ":memory:" {
            ("sqlite::memory:".to_owned(), 1)
        } else {
            (format!("sqlite:{path}?mode=rwc"), 5)
        };

        let mut opts = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        if max_connections > 1 {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(path, "metadata store ready");
        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// `chunk id -> content hash` for every chunk recorded for the repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn chunk_hashes(&self, repository_id: &str) -> Result<HashMap<ChunkId, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT chunk_id, content_hash FROM chunk_ledger WHERE repository_id = ?",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, hash)| ChunkId::parse(&id).map(|id| (id, hash)))
            .collect())
    }

    /// Record the outcome of a run in one transaction: file records are
    /// replaced wholesale, `added` chunks enter the ledger and `removed` leave it.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; nothing is written in that case.
    pub async fn commit(
        &self,
        repository_id: &str,
        files: &[FileRecord],
        added: &[Chunk],
        removed: &[ChunkId],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM source_files WHERE repository_id = ?")
            .bind(repository_id)
            .execute(&mut *tx)
            .await?;

        for f in files {
            sqlx::query(
                "INSERT INTO source_files \
                 (repository_id, path, language, size, content_hash, line_count, chunk_count, \
                  function_count, class_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(repository_id)
            .bind(&f.path)
            .bind(f.language.id())
            .bind(i64::try_from(f.size)?)
            .bind(&f.content_hash)
            .bind(i64::try_from(f.line_count)?)
            .bind(i64::try_from(f.chunk_count)?)
            .bind(i64::try_from(f.function_count)?)
            .bind(i64::try_from(f.class_count)?)
            .execute(&mut *tx)
            .await?;
        }

        for id in removed {
            sqlx::query("DELETE FROM chunk_ledger WHERE repository_id = ? AND chunk_id = ?")
                .bind(repository_id)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        for chunk in added {
            sqlx::query(
                "INSERT OR REPLACE INTO chunk_ledger \
                 (repository_id, chunk_id, file_path, content_hash) VALUES (?, ?, ?, ?)",
            )
            .bind(repository_id)
            .bind(chunk.id.to_string())
            .bind(&chunk.file_path)
            .bind(&chunk.content_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Recorded files for a repository, sorted by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn source_files(&self, repository_id: &str) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(
            "SELECT path, language, size, content_hash, line_count, chunk_count, \
             function_count, class_count \
             FROM source_files WHERE repository_id = ? ORDER BY path",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(file_record_from_row).collect()
    }

    /// Forget everything recorded for a repository.
    ///
    /// # Errors
    ///
    /// Returns an error if any delete fails.
    pub async fn drop_repository(&self, repository_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["source_files", "chunk_ledger", "repository_status"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE repository_id = ?"))
                .bind(repository_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn save_status(&self, update: &StatusUpdate) -> Result<()> {
        sqlx::query(
            "INSERT INTO repository_status (repository_id, status, detail, updated_at) \
             VALUES (?, ?, ?, datetime('now')) \
             ON CONFLICT(repository_id) DO UPDATE SET \
             status = excluded.status, detail = excluded.detail, updated_at = excluded.updated_at",
        )
        .bind(&update.repository_id)
        .bind(update.status.as_str())
        .bind(update.detail.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn load_statuses(&self) -> Result<Vec<StatusUpdate>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT repository_id, status, detail FROM repository_status ORDER BY repository_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(repository_id, status, detail)| {
                let Some(status) = IndexStatus::parse(&status) else {
                    tracing::warn!(repository = %repository_id, status, "unknown stored status");
                    return None;
                };
                Some(StatusUpdate {
                    repository_id,
                    status,
                    detail,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;

    async fn store() -> MetadataStore {
        MetadataStore::open(":memory:").await.unwrap()
    }

    fn record(path: &str) -> FileRecord {
        FileRecord {
            path: path.into(),
            language: Lang::Python,
            size: 42,
            content_hash: "h".into(),
            line_count: 3,
            chunk_count: 1,
            function_count: 1,
            class_count: 0,
        }
    }

    fn chunk(path: &str, text: &str) -> Chunk {
        Chunk::new(path, Lang::Python, ChunkKind::Block, None, 1, 1, text.into())
    }

    #[tokio::test]
    async fn commit_records_ledger_and_files() {
        let store = store().await;
        let a = chunk("a.py", "a\n");
        let b = chunk("b.py", "b\n");
        store
            .commit("r", &[record("b.py"), record("a.py")], &[a.clone(), b.clone()], &[])
            .await
            .unwrap();

        let hashes = store.chunk_hashes("r").await.unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[&a.id], a.content_hash);

        let files = store.source_files("r").await.unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "b.py"]);
        assert_eq!(files[0], record("a.py"));

        store.commit("r", &[record("a.py")], &[], &[b.id]).await.unwrap();
        let hashes = store.chunk_hashes("r").await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert!(hashes.contains_key(&a.id));
        assert_eq!(store.source_files("r").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repositories_are_isolated() {
        let store = store().await;
        store
            .commit("r1", &[record("a.py")], &[chunk("a.py", "a\n")], &[])
            .await
            .unwrap();
        assert!(store.chunk_hashes("r2").await.unwrap().is_empty());
        assert!(store.source_files("r2").await.unwrap().is_empty());

        store.drop_repository("r1").await.unwrap();
        assert!(store.chunk_hashes("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn statuses_persist_and_update() {
        let store = store().await;
        store
            .save_status(&StatusUpdate {
                repository_id: "r".into(),
                status: IndexStatus::Indexing,
                detail: None,
            })
            .await
            .unwrap();
        store
            .save_status(&StatusUpdate {
                repository_id: "r".into(),
                status: IndexStatus::Ready,
                detail: Some("12 chunks".into()),
            })
            .await
            .unwrap();

        let all = store.load_statuses().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, IndexStatus::Ready);
        assert_eq!(all[0].detail.as_deref(), Some("12 chunks"));
    }

    #[tokio::test]
    async fn file_backed_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let path = path.to_str().unwrap();
        {
            let store = MetadataStore::open(path).await.unwrap();
            store
                .commit("r", &[], &[chunk("a.py", "a\n")], &[])
                .await
                .unwrap();
        }
        let store = MetadataStore::open(path).await.unwrap();
        assert_eq!(store.chunk_hashes("r").await.unwrap().len(), 1);
    }
}
