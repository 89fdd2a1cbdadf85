//! Embeds each sub-query, searches the repository index, and merges the hits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use repopilot_index::{Chunk, ChunkId, RepositoryIndex, ScoredChunk, SearchFilter};
use repopilot_llm::LlmProvider;

use super::planner::Plan;
use crate::error::AgentError;

/// A merged search hit, tagged with the sub-query that scored it highest.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub sub_query: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrieverLimits {
    /// Hits requested per sub-query.
    pub search_k: usize,
    /// Hits kept after merging.
    pub top_n: usize,
    pub score_threshold: Option<f32>,
    pub embed_timeout: Duration,
    pub search_timeout: Duration,
}

pub struct Retriever<P> {
    provider: Arc<P>,
    index: RepositoryIndex,
    limits: RetrieverLimits,
}

impl<P: LlmProvider> Retriever<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, index: RepositoryIndex, limits: RetrieverLimits) -> Self {
        Self {
            provider,
            index,
            limits,
        }
    }

    /// Search once per sub-query and merge. An empty result is not an error.
    ///
    /// # Errors
    ///
    /// Fails on any embedding or search error or timeout.
    pub async fn retrieve(
        &self,
        repository_id: &str,
        plan: &Plan,
        filter: &SearchFilter,
    ) -> Result<Vec<RetrievedChunk>, AgentError> {
        let searches = plan
            .sub_queries
            .iter()
            .map(|query| self.search_one(repository_id, query, filter));
        let per_query = try_join_all(searches).await?;

        let merged = merge_hits(
            plan.sub_queries.iter().map(String::as_str).zip(per_query),
            self.limits.top_n,
            self.limits.score_threshold,
        );
        tracing::debug!(
            repository = repository_id,
            sub_queries = plan.sub_queries.len(),
            chunks = merged.len(),
            "retrieval complete"
        );
        Ok(merged)
    }

    async fn search_one(
        &self,
        repository_id: &str,
        query: &str,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunk>, AgentError> {
        let vector = tokio::time::timeout(self.limits.embed_timeout, self.provider.embed(query))
            .await
            .map_err(|_| AgentError::RetrievalTimeout { stage: "embedding" })??;

        let hits = tokio::time::timeout(
            self.limits.search_timeout,
            self.index
                .search(repository_id, vector, self.limits.search_k, filter),
        )
        .await
        .map_err(|_| AgentError::RetrievalTimeout { stage: "search" })??;
        Ok(hits)
    }
}

/// Deduplicate by chunk id keeping the highest score (the earlier sub-query
/// wins a tie), rank by score then id, apply the threshold, keep `top_n`.
pub(crate) fn merge_hits<'a>(
    per_query: impl IntoIterator<Item = (&'a str, Vec<ScoredChunk>)>,
    top_n: usize,
    score_threshold: Option<f32>,
) -> Vec<RetrievedChunk> {
    let mut best: HashMap<ChunkId, (ScoredChunk, &'a str)> = HashMap::new();
    for (query, hits) in per_query {
        for hit in hits {
            match best.get(&hit.chunk.id) {
                Some((existing, _)) if existing.score >= hit.score => {}
                _ => {
                    best.insert(hit.chunk.id, (hit, query));
                }
            }
        }
    }

    let mut merged: Vec<RetrievedChunk> = best
        .into_values()
        .filter(|(hit, _)| score_threshold.is_none_or(|t| hit.score >= t))
        .map(|(hit, query)| RetrievedChunk {
            chunk: hit.chunk,
            score: hit.score,
            sub_query: query.to_owned(),
        })
        .collect();
    merged.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    merged.truncate(top_n);
    merged
}
