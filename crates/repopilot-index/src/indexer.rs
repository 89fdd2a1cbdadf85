//! Repository indexing orchestrator: scan → chunk → dedup → embed → store.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt, stream};
use repopilot_llm::{LlmError, LlmProvider};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::chunk::{Chunk, ChunkKind, blake3_hex};
use crate::chunker::{ChunkerConfig, chunk_file};
use crate::context::contextualize_for_embedding;
use crate::dedup::plan_sync;
use crate::error::{IndexError, Result};
use crate::languages::Lang;
use crate::metadata::{FileRecord, MetadataStore};
use crate::scanner::{FileSelector, ScanEntry, ScanWarning, ScannedFile, SelectorConfig};
use crate::status::{IndexLease, IndexStatus, StatusBoard};
use crate::store::{EmbeddedChunk, RepositoryIndex};
use crate::structure::{TreeNode, build_tree};

/// Indexer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    #[serde(flatten)]
    pub selector: SelectorConfig,
    pub chunk: ChunkerConfig,
    /// Files read and chunked concurrently; 0 uses the available cores.
    pub parallelism: usize,
    /// Concurrent embedding requests.
    pub embed_concurrency: usize,
    /// Points per vector store upsert.
    pub embed_batch_size: usize,
    pub embed_max_attempts: u32,
    /// Base delay, doubled after each failed attempt.
    pub embed_backoff_ms: u64,
    /// Set from the timeouts section of the application config.
    #[serde(skip)]
    pub embed_timeout_secs: u64,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            selector: SelectorConfig::default(),
            chunk: ChunkerConfig::default(),
            parallelism: 0,
            embed_concurrency: 4,
            embed_batch_size: 64,
            embed_max_attempts: 4,
            embed_backoff_ms: 500,
            embed_timeout_secs: 30,
        }
    }
}

impl IndexerConfig {
    fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            return self.parallelism;
        }
        std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
    }
}

/// Summary of an indexing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub files_scanned: usize,
    /// Files with at least one new or changed chunk.
    pub files_indexed: usize,
    pub files_unchanged: usize,
    /// Too large or binary.
    pub files_skipped: usize,
    pub chunks_embedded: usize,
    pub chunks_unchanged: usize,
    pub chunks_deleted: usize,
    pub languages: BTreeMap<Lang, usize>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl IndexReport {
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} files, {} chunks embedded, {} unchanged, {} deleted",
            self.files_scanned, self.chunks_embedded, self.chunks_unchanged, self.chunks_deleted
        )
    }
}

struct ParsedFile {
    record: FileRecord,
    chunks: Vec<Chunk>,
}

/// Orchestrates indexing runs for any number of repositories.
///
/// At most one run per repository is in flight at a time; a second request
/// fails with [`IndexError::Busy`].
pub struct Indexer<P> {
    provider: Arc<P>,
    index: RepositoryIndex,
    metadata: MetadataStore,
    status: Arc<StatusBoard>,
    selector: FileSelector,
    config: IndexerConfig,
}

impl<P> std::fmt::Debug for Indexer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("index", &self.index)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider + 'static> Indexer<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        index: RepositoryIndex,
        metadata: MetadataStore,
        status: Arc<StatusBoard>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            provider,
            index,
            metadata,
            status,
            selector: FileSelector::new(config.selector.clone()),
            config,
        }
    }

    #[must_use]
    pub fn index(&self) -> &RepositoryIndex {
        &self.index
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    #[must_use]
    pub fn status(&self) -> &Arc<StatusBoard> {
        &self.status
    }

    /// Start indexing `root` in the background.
    ///
    /// The busy check and the move to `indexing` happen before this returns,
    /// so the caller sees a rejected request synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Busy`] if a run for the repository is in flight, or
    /// [`IndexError::InvalidTransition`] if its status does not allow indexing.
    pub fn start_index(
        self: &Arc<Self>,
        repository_id: &str,
        root: impl Into<PathBuf>,
    ) -> Result<JoinHandle<Result<IndexReport>>> {
        let lease = self.begin(repository_id)?;
        let this = Arc::clone(self);
        let repository_id = lease.repository_id().to_owned();
        let root = root.into();
        Ok(tokio::spawn(async move {
            let report = this.run_and_settle(repository_id, root).await;
            drop(lease);
            report
        }))
    }

    /// Index `root` and wait for the run to finish.
    ///
    /// # Errors
    ///
    /// Same as [`Indexer::start_index`], plus any failure of the run itself.
    pub async fn index_repository(&self, repository_id: &str, root: &Path) -> Result<IndexReport> {
        let _lease = self.begin(repository_id)?;
        self.run_and_settle(repository_id.to_owned(), root.to_path_buf())
            .await
    }

    /// Nested file tree of the last successful run.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store cannot be read.
    pub async fn structure(&self, repository_id: &str) -> Result<TreeNode> {
        let files = self.metadata.source_files(repository_id).await?;
        Ok(build_tree(repository_id, &files))
    }

    /// Remove the collection and every metadata row of a repository.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Busy`] while a run is in flight, or a store error.
    pub async fn drop_repository(&self, repository_id: &str) -> Result<()> {
        let _lease = self.status.try_begin(repository_id)?;
        self.index.drop_repository(repository_id).await?;
        self.metadata.drop_repository(repository_id).await?;
        self.status.forget(repository_id);
        tracing::info!(repository = repository_id, "repository index dropped");
        Ok(())
    }

    fn begin(&self, repository_id: &str) -> Result<IndexLease> {
        let lease = self.status.try_begin(repository_id)?;
        self.status
            .transition(repository_id, IndexStatus::Indexing, None)?;
        Ok(lease)
    }

    async fn run_and_settle(&self, repository_id: String, root: PathBuf) -> Result<IndexReport> {
        let outcome = self.run(&repository_id, &root).await;
        let (next, detail) = match &outcome {
            Ok(report) => (IndexStatus::Ready, report.summary()),
            Err(e) => {
                tracing::error!(repository = %repository_id, "indexing failed: {e}");
                (IndexStatus::Error, e.to_string())
            }
        };
        if let Err(e) = self.status.transition(&repository_id, next, Some(detail)) {
            tracing::warn!(repository = %repository_id, "status not updated: {e}");
        }
        outcome
    }

    async fn run(&self, repository_id: &str, root: &Path) -> Result<IndexReport> {
        let start = Instant::now();
        let mut report = IndexReport::default();
        tracing::info!(repository = repository_id, root = %root.display(), "indexing started");

        let mut existing = self.metadata.chunk_hashes(repository_id).await?;
        if !existing.is_empty() && !self.index.exists(repository_id).await? {
            tracing::warn!(
                repository = repository_id,
                "collection missing, re-embedding all chunks"
            );
            existing.clear();
        }

        let files = self.scan(root, &mut report).await?;
        let mut parsed = self.parse_files(files, &mut report).await?;
        parsed.sort_by(|a, b| a.record.path.cmp(&b.record.path));

        let mut records = Vec::with_capacity(parsed.len());
        let mut fresh = Vec::new();
        for file in parsed {
            *report.languages.entry(file.record.language).or_default() += 1;
            records.push(file.record);
            fresh.extend(file.chunks);
        }

        let plan = plan_sync(&existing, fresh);
        report.files_indexed = plan
            .to_embed
            .iter()
            .map(|c| c.file_path.as_str())
            .collect::<HashSet<_>>()
            .len();
        report.files_unchanged = records.len() - report.files_indexed;
        report.chunks_unchanged = plan.unchanged.len();
        tracing::info!(
            repository = repository_id,
            to_embed = plan.to_embed.len(),
            unchanged = plan.unchanged.len(),
            to_delete = plan.to_delete.len(),
            "sync planned"
        );

        let embedded = self.embed_chunks(plan.to_embed.clone()).await?;
        if let Some(first) = embedded.first() {
            let dimension = first.vector.len();
            if embedded.iter().any(|e| e.vector.len() != dimension) {
                return Err(IndexError::Other(
                    "embedding model returned vectors of differing dimension".into(),
                ));
            }
            self.index.ensure(repository_id, dimension).await?;
        }
        let batch_size = self.config.embed_batch_size.max(1);
        for batch in embedded.chunks(batch_size) {
            self.index.upsert(repository_id, batch.to_vec()).await?;
        }
        report.chunks_embedded = embedded.len();

        self.index.delete(repository_id, &plan.to_delete).await?;
        report.chunks_deleted = plan.to_delete.len();

        self.metadata
            .commit(repository_id, &records, &plan.to_embed, &plan.to_delete)
            .await?;

        report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        tracing::info!(
            repository = repository_id,
            files = report.files_scanned,
            embedded = report.chunks_embedded,
            deleted = report.chunks_deleted,
            duration_ms = report.duration_ms,
            "indexing finished"
        );
        Ok(report)
    }

    async fn scan(&self, root: &Path, report: &mut IndexReport) -> Result<Vec<ScannedFile>> {
        if !root.is_dir() {
            return Err(IndexError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("repository root {} is not a directory", root.display()),
            )));
        }
        let selector = self.selector.clone();
        let root = root.to_path_buf();
        let entries: Vec<ScanEntry> =
            tokio::task::spawn_blocking(move || selector.scan(&root).collect()).await?;

        let mut files = Vec::new();
        for entry in entries {
            match entry {
                ScanEntry::File(file) => files.push(file),
                ScanEntry::Skipped { path, reason } => {
                    tracing::debug!(path, ?reason, "skipped");
                    report.files_skipped += 1;
                }
                ScanEntry::Warning(w) => report.warnings.push(w.to_string()),
            }
        }
        report.files_scanned = files.len();
        Ok(files)
    }

    async fn parse_files(
        &self,
        files: Vec<ScannedFile>,
        report: &mut IndexReport,
    ) -> Result<Vec<ParsedFile>> {
        let chunker = Arc::new(self.config.chunk.clone());
        let results: Vec<_> = stream::iter(files)
            .map(move |file| {
                let chunker = Arc::clone(&chunker);
                tokio::task::spawn_blocking(move || read_and_chunk(file, &chunker))
            })
            .buffer_unordered(self.config.effective_parallelism())
            .collect()
            .await;

        let mut parsed = Vec::with_capacity(results.len());
        for result in results {
            match result? {
                Ok(file) => {
                    tracing::debug!(
                        path = %file.record.path,
                        chunks = file.chunks.len(),
                        "file chunked"
                    );
                    parsed.push(file);
                }
                Err(w) => {
                    tracing::warn!(path = %w.path, "skipping unreadable file: {}", w.message);
                    report.files_scanned -= 1;
                    report.warnings.push(w.to_string());
                }
            }
        }
        Ok(parsed)
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>> {
        let policy = RetryPolicy::from_config(&self.config);
        let provider = Arc::clone(&self.provider);
        stream::iter(chunks)
            .map(move |chunk| {
                let provider = Arc::clone(&provider);
                async move {
                    let text = contextualize_for_embedding(&chunk);
                    let vector = embed_with_retry(provider, text, policy).await?;
                    Ok::<_, IndexError>(EmbeddedChunk { chunk, vector })
                }
            })
            .buffered(self.config.embed_concurrency.max(1))
            .try_collect()
            .await
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    backoff_ms: u64,
    timeout: Duration,
}

impl RetryPolicy {
    fn from_config(config: &IndexerConfig) -> Self {
        Self {
            max_attempts: config.embed_max_attempts.max(1),
            backoff_ms: config.embed_backoff_ms,
            timeout: Duration::from_secs(config.embed_timeout_secs),
        }
    }
}

async fn embed_with_retry<P: LlmProvider>(
    provider: Arc<P>,
    text: String,
    policy: RetryPolicy,
) -> Result<Vec<f32>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::time::timeout(policy.timeout, provider.embed(&text))
            .await
            .unwrap_or(Err(LlmError::Timeout(policy.timeout)));
        match result {
            Ok(vector) => return Ok(vector),
            Err(e) if attempt < policy.max_attempts && e.is_transient() => {
                let delay = backoff_delay(policy.backoff_ms, attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis(),
                    "embedding failed, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(IndexError::Embedding {
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

fn read_and_chunk(
    file: ScannedFile,
    config: &ChunkerConfig,
) -> std::result::Result<ParsedFile, ScanWarning> {
    let bytes = std::fs::read(&file.abs_path).map_err(|e| ScanWarning {
        path: file.path.clone(),
        message: e.to_string(),
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let chunks = chunk_file(&text, &file.path, file.language, config);

    let count = |kinds: &[ChunkKind]| chunks.iter().filter(|c| kinds.contains(&c.kind)).count();
    let record = FileRecord {
        content_hash: blake3_hex(&text),
        line_count: text.lines().count(),
        chunk_count: chunks.len(),
        function_count: count(&[ChunkKind::Function, ChunkKind::Method]),
        class_count: count(&[ChunkKind::Class]),
        language: file.language,
        size: file.size,
        path: file.path,
    };
    Ok(ParsedFile { record, chunks })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use repopilot_llm::mock::MockProvider;

    use super::*;
    use crate::store::{InMemoryVectorStore, SearchFilter};

    const ADD_PY: &str = "import math\n\n\ndef add(a, b):\n    \"\"\"Add two numbers.\"\"\"\n    return a + b\n";

    async fn indexer(provider: MockProvider) -> Arc<Indexer<MockProvider>> {
        let config = IndexerConfig {
            embed_backoff_ms: 1,
            ..IndexerConfig::default()
        };
        Arc::new(Indexer::new(
            Arc::new(provider),
            RepositoryIndex::new(Arc::new(InMemoryVectorStore::new()), "test_"),
            MetadataStore::open(":memory:").await.unwrap(),
            Arc::new(StatusBoard::new()),
            config,
        ))
    }

    fn repo(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    fn provider() -> MockProvider {
        MockProvider::default().with_hashed_embeddings(64)
    }

    #[tokio::test]
    async fn reindex_of_unchanged_repository_embeds_nothing() {
        let dir = repo(&[("src/add.py", ADD_PY), ("README.md", "# demo\n")]);
        let idx = indexer(provider()).await;

        let first = idx.index_repository("r", dir.path()).await.unwrap();
        assert_eq!(first.files_scanned, 2);
        assert!(first.chunks_embedded >= 2);
        let calls = idx.provider.embed_calls();
        assert_eq!(calls, first.chunks_embedded);
        assert_eq!(idx.status.get("r").status, IndexStatus::Ready);

        let second = idx.index_repository("r", dir.path()).await.unwrap();
        assert_eq!(idx.provider.embed_calls(), calls);
        assert_eq!(second.chunks_embedded, 0);
        assert_eq!(second.chunks_deleted, 0);
        assert_eq!(second.chunks_unchanged, first.chunks_embedded);
        assert_eq!(second.files_unchanged, 2);
    }

    #[tokio::test]
    async fn changed_and_removed_files_sync_incrementally() {
        let dir = repo(&[("a.py", ADD_PY), ("b.py", "def sub(a, b):\n    return a - b\n")]);
        let idx = indexer(provider()).await;
        idx.index_repository("r", dir.path()).await.unwrap();
        let before = idx.provider.embed_calls();

        fs::write(dir.path().join("a.py"), ADD_PY.replace("a + b", "b + a")).unwrap();
        fs::remove_file(dir.path().join("b.py")).unwrap();
        let report = idx.index_repository("r", dir.path()).await.unwrap();

        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.chunks_embedded, idx.provider.embed_calls() - before);
        assert!(report.chunks_deleted >= 2);

        let query = repopilot_llm::mock::hashed_bag_of_words("sub", 64);
        let hits = idx
            .index
            .search("r", query, 20, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.chunk.file_path == "a.py"));
        assert!(hits.iter().any(|h| h.chunk.text.contains("b + a")));

        let hashes = idx.metadata.chunk_hashes("r").await.unwrap();
        assert_eq!(hashes.len(), hits.len());
    }

    #[tokio::test]
    async fn records_file_statistics_and_structure() {
        let dir = repo(&[("pkg/add.py", ADD_PY), ("logo.png", "\u{0}\u{1}")]);
        let idx = indexer(provider()).await;
        let report = idx.index_repository("r", dir.path()).await.unwrap();
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.languages.get(&Lang::Python), Some(&1));

        let files = idx.metadata.source_files("r").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].function_count, 1);
        assert_eq!(files[0].line_count, 6);

        let tree = idx.structure("r").await.unwrap();
        assert_eq!(tree.children[0].name, "pkg");
        assert_eq!(tree.children[0].children[0].path, "pkg/add.py");
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_repository_are_rejected() {
        let dir = repo(&[("a.py", ADD_PY)]);
        let idx = indexer(provider().with_delay(50)).await;

        let handle = idx.start_index("r", dir.path()).unwrap();
        let second = idx.start_index("r", dir.path());
        assert!(matches!(second, Err(IndexError::Busy(_))));

        let other = idx.start_index("other", dir.path()).unwrap();
        handle.await.unwrap().unwrap();
        other.await.unwrap().unwrap();
        assert_eq!(idx.status.get("r").status, IndexStatus::Ready);

        let hashes = idx.metadata.chunk_hashes("r").await.unwrap();
        let hits = idx
            .index
            .search("r", vec![1.0; 64], 100, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), hashes.len());
        let unique: HashSet<_> = hits.iter().map(|h| h.chunk.id).collect();
        assert_eq!(unique.len(), hits.len());
    }

    #[tokio::test]
    async fn background_run_settles_ready() {
        let dir = repo(&[("pkg/add.py", ADD_PY)]);
        let idx = indexer(provider()).await;
        let mut changes = idx.status.subscribe();

        let handle = idx.start_index("bg", dir.path().to_path_buf()).unwrap();
        assert_eq!(idx.status.get("bg").status, IndexStatus::Indexing);
        let report = handle.await.unwrap().unwrap();

        assert!(report.chunks_embedded > 0);
        assert_eq!(idx.status.get("bg").status, IndexStatus::Ready);
        let mut seen = Vec::new();
        while let Ok(update) = changes.try_recv() {
            seen.push(update.status);
        }
        assert_eq!(seen.last(), Some(&IndexStatus::Ready));
        let tree = idx.structure("bg").await.unwrap();
        assert_eq!(tree.children[0].children[0].path, "pkg/add.py");
    }

    #[tokio::test]
    async fn transient_embedding_failures_are_retried() {
        let dir = repo(&[("a.py", ADD_PY)]);
        let idx = indexer(provider().with_embed_failures(2)).await;
        let report = idx.index_repository("r", dir.path()).await.unwrap();
        assert!(report.chunks_embedded > 0);
        assert_eq!(idx.provider.embed_calls(), report.chunks_embedded + 2);
    }

    #[tokio::test]
    async fn exhausted_embedding_retries_mark_error() {
        let dir = repo(&[("a.py", ADD_PY)]);
        let idx = indexer(provider().with_embed_failures(100)).await;
        let err = idx.index_repository("r", dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding { attempts: 4, .. }));

        let status = idx.status.get("r");
        assert_eq!(status.status, IndexStatus::Error);
        assert!(status.detail.unwrap().contains("embedding failed"));
        assert!(!idx.status.is_busy("r"));
        assert!(idx.metadata.chunk_hashes("r").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_embedding_error_is_not_retried() {
        let dir = repo(&[("a.py", ADD_PY)]);
        let idx = indexer(MockProvider::default()).await;
        let err = idx.index_repository("r", dir.path()).await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn missing_root_fails_and_records_error() {
        let idx = indexer(provider()).await;
        let err = idx
            .index_repository("r", Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Io(_)));
        assert_eq!(idx.status.get("r").status, IndexStatus::Error);
    }

    #[tokio::test]
    async fn empty_repository_indexes_to_ready_without_collection() {
        let dir = repo(&[]);
        let idx = indexer(provider()).await;
        let report = idx.index_repository("r", dir.path()).await.unwrap();
        assert_eq!(report.files_scanned, 0);
        assert_eq!(idx.status.get("r").status, IndexStatus::Ready);
        assert!(!idx.index.exists("r").await.unwrap());
    }

    #[tokio::test]
    async fn drop_repository_clears_everything() {
        let dir = repo(&[("a.py", ADD_PY)]);
        let idx = indexer(provider()).await;
        idx.index_repository("r", dir.path()).await.unwrap();

        idx.drop_repository("r").await.unwrap();
        assert!(!idx.index.exists("r").await.unwrap());
        assert!(idx.metadata.source_files("r").await.unwrap().is_empty());
        assert_eq!(idx.status.get("r").status, IndexStatus::Pending);
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(100, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(100, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(u64::MAX, 70), Duration::from_millis(u64::MAX));
    }
}
