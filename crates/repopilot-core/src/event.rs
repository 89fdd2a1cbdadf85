//! Wire events of one question-to-answer turn.

use repopilot_index::Citation;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub level: RiskLevel,
    /// One-line justification.
    pub description: String,
    /// The verifier fell back to its default instead of completing its check.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentName {
    Planner,
    Retriever,
    Generator,
    Verifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Running,
    Done,
    Degraded,
}

/// One event of a turn. Serialized as `{"type": "<kind>", ...}`.
///
/// A turn emits stage `status` events, interleaved `content` and `citation`
/// events, one `risk` event, and `done` last. A failed turn ends with
/// `error` followed by `done` and never carries a `risk` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Status { agent: AgentName, status: AgentState },
    Content { content: String },
    Citation { citation: Citation },
    Risk { risk: RiskVerdict },
    Error { message: String },
    Done,
}

impl StreamEvent {
    #[must_use]
    pub fn status(agent: AgentName, status: AgentState) -> Self {
        Self::Status { agent, status }
    }

    #[must_use]
    pub fn content(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// One prior exchange, fed back into planning and generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    pub answer: String,
}

/// Outcome of a completed turn, handed to conversation persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub repository_id: String,
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub risk: RiskVerdict,
}
