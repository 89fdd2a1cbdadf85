//! Chunk data model and content-addressed identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::languages::Lang;

/// Namespace for deriving chunk ids. Changing it invalidates every stored index.
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_0c3e_92b4_4d0a_b7e2_5c8d_31f4_a960);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    Class,
    Method,
    Block,
}

impl ChunkKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::Block => "block",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "method" => Some(Self::Method),
            "block" => Some(Self::Block),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic chunk identifier: UUID v5 over path, line range and content hash.
///
/// Re-chunking unchanged content reproduces the same id, so upserts are idempotent.
/// The UUID form is accepted as a point id by Qdrant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(Uuid);

impl ChunkId {
    #[must_use]
    pub fn derive(file_path: &str, start_line: usize, end_line: usize, content_hash: &str) -> Self {
        let name = format!("{file_path}\n{start_line}\n{end_line}\n{content_hash}");
        Self(Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()))
    }

    /// Parse an id previously produced by [`ChunkId::to_string`].
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A bounded, citable unit of source text extracted from one file.
///
/// Line numbers are 1-based and inclusive. `text` is the exact byte content
/// of those lines, including the trailing newline where the file has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub file_path: String,
    pub language: Lang,
    pub kind: ChunkKind,
    pub entity_name: Option<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub content_hash: String,
}

impl Chunk {
    #[must_use]
    pub fn new(
        file_path: &str,
        language: Lang,
        kind: ChunkKind,
        entity_name: Option<String>,
        start_line: usize,
        end_line: usize,
        text: String,
    ) -> Self {
        let content_hash = blake3_hex(&text);
        Self {
            id: ChunkId::derive(file_path, start_line, end_line, &content_hash),
            file_path: file_path.to_owned(),
            language,
            kind,
            entity_name,
            start_line,
            end_line,
            text,
            content_hash,
        }
    }

    #[must_use]
    pub fn citation(&self) -> Citation {
        Citation {
            file_path: self.file_path.clone(),
            start_line: self.start_line,
            end_line: self.end_line,
        }
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.end_line + 1 - self.start_line
    }
}

/// A (file, line range) snapshot reference into a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:L{}-L{}", self.file_path, self.start_line, self.end_line)
    }
}

pub(crate) fn blake3_hex(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}
