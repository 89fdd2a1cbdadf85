//! Rewrites a question into retrieval-friendly sub-queries.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use repopilot_llm::{LlmProvider, Message};
use serde::{Deserialize, Serialize};

use super::{history_messages, strip_code_fence};
use crate::event::ConversationTurn;

const PLANNER_PROMPT: &str = "You are the query planner of a code repository Q&A system.\n\
Rewrite the user's question into search queries for a semantic code index.\n\
Resolve pronouns using the conversation so far, split compound questions, and \
name concrete identifiers, files or concepts where possible.\n\
Reply with JSON only, in the form \
{\"queries\": [\"...\"], \"intent\": \"explanation|code_generation|debugging|architecture\"}.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Explanation,
    CodeGeneration,
    Debugging,
    Architecture,
    #[default]
    General,
}

impl Intent {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "explanation" => Self::Explanation,
            "code_generation" => Self::CodeGeneration,
            "debugging" => Self::Debugging,
            "architecture" => Self::Architecture,
            _ => Self::General,
        }
    }
}

/// Ordered, non-empty list of sub-queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub sub_queries: Vec<String>,
    pub intent: Intent,
    /// Planning failed and the question is passed through verbatim.
    pub degraded: bool,
}

impl Plan {
    #[must_use]
    pub fn passthrough(question: &str) -> Self {
        Self {
            sub_queries: vec![question.to_owned()],
            intent: Intent::General,
            degraded: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanReply {
    Object {
        #[serde(alias = "sub_queries", alias = "tasks")]
        queries: Vec<QueryItem>,
        #[serde(default)]
        intent: Option<String>,
    },
    List(Vec<QueryItem>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryItem {
    Text(String),
    Task { query: String },
}

impl QueryItem {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) | Self::Task { query: s } => s,
        }
    }
}

pub struct Planner<P> {
    provider: Arc<P>,
    max_sub_queries: usize,
    history_turns: usize,
    timeout: Duration,
}

impl<P: LlmProvider> Planner<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        max_sub_queries: usize,
        history_turns: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            max_sub_queries: max_sub_queries.max(1),
            history_turns,
            timeout,
        }
    }

    /// Always yields at least one sub-query; any failure degrades to the
    /// question itself.
    pub async fn plan(&self, question: &str, history: &[ConversationTurn]) -> Plan {
        let mut messages = vec![Message::system(PLANNER_PROMPT)];
        messages.extend(history_messages(history, self.history_turns));
        messages.push(Message::user(format!("Question: {question}")));

        let reply = match tokio::time::timeout(self.timeout, self.provider.chat(&messages)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!("planner failed, passing question through: {e:#}");
                return Plan::passthrough(question);
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.timeout,
                    "planner timed out, passing question through"
                );
                return Plan::passthrough(question);
            }
        };

        match parse_plan(&reply, self.max_sub_queries) {
            Some(plan) => {
                tracing::debug!(
                    sub_queries = plan.sub_queries.len(),
                    intent = ?plan.intent,
                    "query planned"
                );
                plan
            }
            None => {
                tracing::warn!("planner reply unusable, passing question through");
                Plan::passthrough(question)
            }
        }
    }
}

/// Parse a planner reply. `None` when it holds no usable query.
fn parse_plan(reply: &str, max: usize) -> Option<Plan> {
    let body = strip_code_fence(reply);
    let parsed = serde_json::from_str::<PlanReply>(body)
        .ok()
        .or_else(|| extract_json(body).and_then(|s| serde_json::from_str(s).ok()))?;

    let (items, intent) = match parsed {
        PlanReply::Object { queries, intent } => {
            (queries, intent.as_deref().map_or(Intent::General, Intent::parse))
        }
        PlanReply::List(items) => (items, Intent::General),
    };

    let mut seen = HashSet::new();
    let sub_queries: Vec<String> = items
        .into_iter()
        .map(|item| item.into_text().trim().to_owned())
        .filter(|q| !q.is_empty() && seen.insert(q.to_lowercase()))
        .take(max)
        .collect();

    if sub_queries.is_empty() {
        return None;
    }
    Some(Plan {
        sub_queries,
        intent,
        degraded: false,
    })
}

/// Outermost JSON object or array embedded in surrounding prose.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}
