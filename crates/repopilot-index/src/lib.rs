//! Repository indexing pipeline.
//!
//! A repository is walked by the [`scanner`], each file is split into
//! line-exact chunks by the [`chunker`] (tree-sitter where a grammar is
//! registered, fixed line windows otherwise), the [`dedup`] planner compares
//! content-addressed chunk ids against the ledger of the previous run, and
//! only new or changed chunks are embedded and written to the per-repository
//! collection behind [`store::RepositoryIndex`].

pub mod chunk;
pub mod chunker;
pub(crate) mod context;
pub mod dedup;
pub mod error;
pub mod indexer;
pub mod languages;
pub mod metadata;
pub mod scanner;
pub mod status;
pub mod store;
pub mod structure;

pub use chunk::{Chunk, ChunkId, ChunkKind, Citation};
pub use error::{IndexError, Result};
pub use indexer::{IndexReport, Indexer, IndexerConfig};
pub use languages::{Lang, detect_language};
pub use metadata::{FileRecord, MetadataStore};
pub use status::{IndexStatus, StatusBoard, StatusUpdate};
pub use store::{
    InMemoryVectorStore, QdrantOps, RepositoryIndex, ScoredChunk, SearchFilter, VectorStore,
};
pub use structure::TreeNode;
