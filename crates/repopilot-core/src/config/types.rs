use std::fmt;

use repopilot_index::IndexerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub index: IndexerConfig,
    pub store: StoreConfig,
    pub query: QueryConfig,
    pub timeouts: TimeoutConfig,
    pub verifier: VerifierConfig,
    pub gateway: GatewayConfig,
    #[serde(skip)]
    pub secrets: ResolvedSecrets,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    #[serde(alias = "openai-compatible")]
    OpenAi,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Ollama,
            base_url: "http://localhost:11434".into(),
            model: "qwen2.5-coder:7b".into(),
            embedding_model: "nomic-embed-text".into(),
            max_tokens: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// In-memory vector store when unset.
    pub qdrant_url: Option<String>,
    pub sqlite_path: String,
    pub collection_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            qdrant_url: None,
            sqlite_path: "./data/repopilot.db".into(),
            collection_prefix: "repopilot_repo_".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_sub_queries: usize,
    /// Results requested per sub-query.
    pub search_k: usize,
    /// Chunks handed to the generator after merging.
    pub top_n: usize,
    /// Previous turns included in planner and generator prompts.
    pub history_turns: usize,
    /// Merged results scoring below this are dropped.
    pub score_threshold: Option<f32>,
    /// Capacity of the per-turn event channel.
    pub event_buffer: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_sub_queries: 3,
            search_k: 8,
            top_n: 10,
            history_turns: 4,
            score_threshold: None,
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub embedding_secs: u64,
    pub search_secs: u64,
    pub planner_secs: u64,
    pub generation_secs: u64,
    pub verifier_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embedding_secs: 30,
            search_secs: 10,
            planner_secs: 20,
            generation_secs: 120,
            verifier_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Ask the model to review the answer in addition to the heuristic check.
    pub llm_review: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    pub max_body_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8090,
            max_body_size: 1_048_576,
        }
    }
}

/// A string that never appears in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Credentials read from the environment only.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSecrets {
    pub llm_api_key: Option<Secret>,
}
