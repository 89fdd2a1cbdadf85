//! The four stages of a turn: planner, retriever, generator, verifier.
//!
//! Each stage has a typed input and output and its own timeout. Planner and
//! verifier degrade to a fallback on failure; retriever and generator fail
//! the turn.

pub mod generator;
pub mod planner;
pub mod retriever;
pub mod verifier;

pub use generator::{CitationTracker, Generated, Generator, NO_CONTEXT_NOTICE};
pub use planner::{Intent, Plan, Planner};
pub use retriever::{RetrievedChunk, Retriever, RetrieverLimits};
pub use verifier::{Verifier, heuristic_verdict};

use repopilot_llm::Message;

use crate::event::ConversationTurn;

/// Strip a surrounding markdown code fence, if any, from a model reply.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// The last `limit` turns as alternating user/assistant messages.
pub(crate) fn history_messages(history: &[ConversationTurn], limit: usize) -> Vec<Message> {
    let skip = history.len().saturating_sub(limit);
    history[skip..]
        .iter()
        .flat_map(|turn| {
            [
                Message::user(turn.question.clone()),
                Message::assistant(turn.answer.clone()),
            ]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_with_and_without_language() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n[1]\n```\n"), "[1]");
        assert_eq!(strip_code_fence("  plain  "), "plain");
        assert_eq!(strip_code_fence("```json\n[2]"), "[2]");
    }

    #[test]
    fn history_keeps_most_recent_turns() {
        let history: Vec<_> = (0..5)
            .map(|i| ConversationTurn {
                question: format!("q{i}"),
                answer: format!("a{i}"),
            })
            .collect();
        let messages = history_messages(&history, 2);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].content, "q3");
        assert_eq!(messages[3].content, "a4");
        assert!(history_messages(&history, 0).is_empty());
    }
}
