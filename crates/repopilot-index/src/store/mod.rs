//! Vector storage: a backend-agnostic [`VectorStore`] plus the per-repository
//! view the rest of the pipeline uses, [`RepositoryIndex`].

mod memory;
mod qdrant;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantOps;

use crate::chunk::{Chunk, ChunkId, ChunkKind};
use crate::languages::Lang;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("collection error: {0}")]
    Collection(String),
    #[error("upsert error: {0}")]
    Upsert(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("delete error: {0}")]
    Delete(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

/// Equality on a payload field. For array fields, any element may match.
#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ScoredVectorPoint {
    pub id: String,
    pub score: f32,
    pub payload: HashMap<String, serde_json::Value>,
}

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Collection-oriented vector database with cosine similarity.
pub trait VectorStore: Send + Sync {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>>;

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// At most `limit` points, best match first.
    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>>;

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;
}

/// A chunk with its embedding, ready to be written.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A search hit decoded back into a chunk.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Optional metadata restrictions for [`RepositoryIndex::search`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    pub language: Option<Lang>,
    /// Directory or file path; matches the path itself and everything below it.
    pub path_prefix: Option<String>,
}

/// Per-repository view over a [`VectorStore`].
///
/// Each repository gets its own collection, and every point additionally
/// carries its `repository_id`, which every search filters on.
#[derive(Clone)]
pub struct RepositoryIndex {
    store: Arc<dyn VectorStore>,
    collection_prefix: String,
}

impl std::fmt::Debug for RepositoryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryIndex")
            .field("collection_prefix", &self.collection_prefix)
            .finish_non_exhaustive()
    }
}

impl RepositoryIndex {
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>, collection_prefix: impl Into<String>) -> Self {
        Self {
            store,
            collection_prefix: collection_prefix.into(),
        }
    }

    /// Collection backing `repository_id`. Ids outside `[A-Za-z0-9_-]` are
    /// sanitised and suffixed with a hash so distinct ids never share a name.
    #[must_use]
    pub fn collection_name(&self, repository_id: &str) -> String {
        let safe = !repository_id.is_empty()
            && repository_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if safe {
            return format!("{}{repository_id}", self.collection_prefix);
        }
        let cleaned: String = repository_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let digest = blake3::hash(repository_id.as_bytes()).to_hex();
        format!("{}{cleaned}_{}", self.collection_prefix, &digest[..12])
    }

    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    pub async fn exists(&self, repository_id: &str) -> Result<bool, VectorStoreError> {
        self.store
            .collection_exists(&self.collection_name(repository_id))
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the collection cannot be created.
    pub async fn ensure(&self, repository_id: &str, dimension: usize) -> Result<(), VectorStoreError> {
        let size = u64::try_from(dimension)
            .map_err(|e| VectorStoreError::Collection(e.to_string()))?;
        self.store
            .ensure_collection(&self.collection_name(repository_id), size)
            .await
    }

    /// Write chunks. Same id overwrites (last write wins).
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or the backend rejects the write.
    pub async fn upsert(
        &self,
        repository_id: &str,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<(), VectorStoreError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let points = chunks
            .into_iter()
            .map(|ec| VectorPoint {
                id: ec.chunk.id.to_string(),
                payload: chunk_payload(repository_id, &ec.chunk),
                vector: ec.vector,
            })
            .collect();
        self.store
            .upsert(&self.collection_name(repository_id), points)
            .await
    }

    /// # Errors
    ///
    /// Returns an error if the backend rejects the delete.
    pub async fn delete(&self, repository_id: &str, ids: &[ChunkId]) -> Result<(), VectorStoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let collection = self.collection_name(repository_id);
        if !self.store.collection_exists(&collection).await? {
            return Ok(());
        }
        self.store
            .delete_by_ids(&collection, ids.iter().map(ToString::to_string).collect())
            .await
    }

    /// Top `k` chunks by cosine similarity, ordered by score descending then
    /// chunk id. A repository that was never indexed yields no results.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend search fails.
    pub async fn search(
        &self,
        repository_id: &str,
        query: Vec<f32>,
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>, VectorStoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let collection = self.collection_name(repository_id);
        if !self.store.collection_exists(&collection).await? {
            return Ok(Vec::new());
        }

        let limit = u64::try_from(k).unwrap_or(u64::MAX);
        let points = self
            .store
            .search(&collection, query, limit, Some(build_filter(repository_id, filter)))
            .await?;

        let mut hits: Vec<ScoredChunk> = points
            .into_iter()
            .filter_map(|p| {
                let score = p.score;
                match decode_chunk(&p) {
                    Some(chunk) => Some(ScoredChunk { chunk, score }),
                    None => {
                        tracing::warn!(id = %p.id, "dropping search hit with malformed payload");
                        None
                    }
                }
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Remove the whole collection for a repository.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the delete.
    pub async fn drop_repository(&self, repository_id: &str) -> Result<(), VectorStoreError> {
        let collection = self.collection_name(repository_id);
        if self.store.collection_exists(&collection).await? {
            self.store.delete_collection(&collection).await?;
        }
        Ok(())
    }
}

/// Score descending, then chunk id ascending.
pub fn sort_hits(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

fn build_filter(repository_id: &str, filter: &SearchFilter) -> VectorFilter {
    let mut must = vec![FieldCondition {
        field: "repository_id".into(),
        value: FieldValue::Text(repository_id.to_owned()),
    }];
    if let Some(lang) = filter.language {
        must.push(FieldCondition {
            field: "language".into(),
            value: FieldValue::Text(lang.id().to_owned()),
        });
    }
    if let Some(prefix) = &filter.path_prefix {
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            must.push(FieldCondition {
                field: "path_prefixes".into(),
                value: FieldValue::Text(prefix.to_owned()),
            });
        }
    }
    VectorFilter {
        must,
        must_not: Vec::new(),
    }
}

/// `src/a/b.rs` -> `["src", "src/a", "src/a/b.rs"]`.
fn path_prefixes(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(part);
        out.push(acc.clone());
    }
    out
}

fn chunk_payload(repository_id: &str, chunk: &Chunk) -> HashMap<String, serde_json::Value> {
    HashMap::from([
        ("repository_id".into(), json!(repository_id)),
        ("file_path".into(), json!(chunk.file_path)),
        ("path_prefixes".into(), json!(path_prefixes(&chunk.file_path))),
        ("language".into(), json!(chunk.language.id())),
        ("kind".into(), json!(chunk.kind.as_str())),
        ("entity_name".into(), json!(chunk.entity_name)),
        ("start_line".into(), json!(chunk.start_line)),
        ("end_line".into(), json!(chunk.end_line)),
        ("text".into(), json!(chunk.text)),
        ("content_hash".into(), json!(chunk.content_hash)),
    ])
}

fn decode_chunk(point: &ScoredVectorPoint) -> Option<Chunk> {
    let p = &point.payload;
    let get_str = |key: &str| p.get(key).and_then(serde_json::Value::as_str);
    let get_usize = |key: &str| {
        p.get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| usize::try_from(v).ok())
    };

    Some(Chunk {
        id: ChunkId::parse(&point.id)?,
        file_path: get_str("file_path")?.to_owned(),
        language: Lang::from_id(get_str("language")?),
        kind: ChunkKind::parse(get_str("kind")?)?,
        entity_name: get_str("entity_name").map(str::to_owned),
        start_line: get_usize("start_line")?,
        end_line: get_usize("end_line")?,
        text: get_str("text")?.to_owned(),
        content_hash: get_str("content_hash")?.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, lang: Lang, text: &str) -> Chunk {
        Chunk::new(path, lang, ChunkKind::Function, Some("f".into()), 1, 1, text.into())
    }

    fn index() -> RepositoryIndex {
        RepositoryIndex::new(Arc::new(InMemoryVectorStore::new()), "repopilot_repo_")
    }

    async fn seed(index: &RepositoryIndex, repo: &str, items: Vec<(Chunk, Vec<f32>)>) {
        index.ensure(repo, 3).await.unwrap();
        let chunks = items
            .into_iter()
            .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
            .collect();
        index.upsert(repo, chunks).await.unwrap();
    }

    #[test]
    fn collection_names_are_distinct_and_safe() {
        let idx = index();
        assert_eq!(idx.collection_name("42"), "repopilot_repo_42");
        let a = idx.collection_name("org/repo");
        let b = idx.collection_name("org_repo");
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }

    #[test]
    fn prefixes_of_nested_path() {
        assert_eq!(
            path_prefixes("src/a/b.rs"),
            vec!["src".to_owned(), "src/a".into(), "src/a/b.rs".into()]
        );
    }

    #[tokio::test]
    async fn search_roundtrips_chunk_and_orders_by_score() {
        let idx = index();
        let near = chunk("src/add.py", Lang::Python, "def add(a, b): return a + b\n");
        let far = chunk("src/sub.py", Lang::Python, "def sub(a, b): return a - b\n");
        seed(
            &idx,
            "r1",
            vec![(near.clone(), vec![1.0, 0.0, 0.0]), (far.clone(), vec![0.6, 0.8, 0.0])],
        )
        .await;

        let hits = idx
            .search("r1", vec![1.0, 0.0, 0.0], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk, near);
        assert_eq!(hits[1].chunk, far);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn search_is_isolated_per_repository() {
        let idx = index();
        seed(&idx, "r1", vec![(chunk("a.py", Lang::Python, "a\n"), vec![1.0, 0.0, 0.0])]).await;
        seed(&idx, "r2", vec![(chunk("b.py", Lang::Python, "b\n"), vec![1.0, 0.0, 0.0])]).await;

        let hits = idx
            .search("r1", vec![1.0, 0.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.file_path, "a.py");
    }

    #[tokio::test]
    async fn search_filters_by_language_and_prefix() {
        let idx = index();
        seed(
            &idx,
            "r",
            vec![
                (chunk("src/core/a.rs", Lang::Rust, "a\n"), vec![1.0, 0.0, 0.0]),
                (chunk("src/corex/b.rs", Lang::Rust, "b\n"), vec![1.0, 0.0, 0.0]),
                (chunk("src/core/c.py", Lang::Python, "c\n"), vec![1.0, 0.0, 0.0]),
            ],
        )
        .await;

        let filter = SearchFilter {
            language: Some(Lang::Rust),
            path_prefix: Some("src/core/".into()),
        };
        let hits = idx.search("r", vec![1.0, 0.0, 0.0], 10, &filter).await.unwrap();
        let paths: Vec<_> = hits.iter().map(|h| h.chunk.file_path.as_str()).collect();
        assert_eq!(paths, vec!["src/core/a.rs"]);
    }

    #[tokio::test]
    async fn ties_break_on_chunk_id_and_k_bounds_results() {
        let idx = index();
        let items: Vec<_> = (0..5)
            .map(|i| (chunk(&format!("f{i}.py"), Lang::Python, "x\n"), vec![1.0, 0.0, 0.0]))
            .collect();
        let mut ids: Vec<_> = items.iter().map(|(c, _)| c.id).collect();
        ids.sort_unstable();
        seed(&idx, "r", items).await;

        let hits = idx
            .search("r", vec![1.0, 0.0, 0.0], 3, &SearchFilter::default())
            .await
            .unwrap();
        let got: Vec<_> = hits.iter().map(|h| h.chunk.id).collect();
        assert_eq!(got, ids[..3].to_vec());
    }

    #[tokio::test]
    async fn unknown_repository_searches_empty_and_drop_is_idempotent() {
        let idx = index();
        let hits = idx
            .search("never", vec![1.0], 5, &SearchFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        idx.drop_repository("never").await.unwrap();
        idx.delete("never", &[ChunkId::derive("a", 1, 1, "h")]).await.unwrap();
    }

    #[tokio::test]
    async fn delete_and_drop_remove_points() {
        let idx = index();
        let a = chunk("a.py", Lang::Python, "a\n");
        let b = chunk("b.py", Lang::Python, "b\n");
        seed(&idx, "r", vec![(a.clone(), vec![1.0, 0.0, 0.0]), (b, vec![0.0, 1.0, 0.0])]).await;

        idx.delete("r", &[a.id]).await.unwrap();
        let hits = idx
            .search("r", vec![1.0, 0.0, 0.0], 10, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_ne!(hits[0].chunk.id, a.id);

        idx.drop_repository("r").await.unwrap();
        assert!(!idx.exists("r").await.unwrap());
    }
}
