use std::time::Duration;

use repopilot_index::{IndexError, IndexStatus};
use repopilot_index::store::VectorStoreError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] repopilot_llm::LlmError),

    #[error(transparent)]
    Store(#[from] VectorStoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    /// Query against a repository whose index is not `ready`.
    #[error("repository {repository} is not indexed (status: {status})")]
    NotIndexed {
        repository: String,
        status: IndexStatus,
    },

    #[error("retrieval timed out during {stage}")]
    RetrievalTimeout { stage: &'static str },

    #[error("generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    #[error("generation failed: {0}")]
    Generation(#[source] repopilot_llm::LlmError),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Message shown to the caller in a terminal `error` event.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::NotIndexed { repository, status } => {
                format!("Repository {repository} is not ready for questions (status: {status}).")
            }
            Self::RetrievalTimeout { .. } => {
                "Searching the repository took too long. Please try again.".into()
            }
            Self::GenerationTimeout(_) => "Answer generation timed out. Please try again.".into(),
            Self::Store(_) => "The code index is unavailable right now.".into(),
            other => format!("The request failed: {other}"),
        }
    }
}
