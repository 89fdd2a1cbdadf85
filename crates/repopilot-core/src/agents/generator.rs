//! Streams an answer grounded in the retrieved chunks, emitting a citation the
//! first time the answer refers to a chunk.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::ops::Range;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use repopilot_index::Citation;
use repopilot_llm::{LlmProvider, Message};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};

use super::history_messages;
use super::planner::Intent;
use super::retriever::RetrievedChunk;
use crate::error::AgentError;
use crate::event::{ConversationTurn, StreamEvent};

/// Prepended to every answer produced without retrieved context.
pub const NO_CONTEXT_NOTICE: &str = "I could not find any indexed code relevant to this question, \
so the following is not grounded in the repository and may be inaccurate.\n\n";

const GENERATOR_PROMPT: &str = "You are an expert assistant answering questions about a source code repository.\n\
Use only the numbered context sections below. When a statement relies on a section, \
cite it inline with its number in square brackets, e.g. [2]. Cite only sections that \
support the statement being made.\n\
Reference files and line numbers where helpful and use fenced code blocks for code.\n\
If the context does not contain the answer, say clearly that the indexed code does not \
show it instead of guessing.";

const NO_CONTEXT_PROMPT: &str = "You are an assistant answering questions about a source code repository.\n\
No code from the repository matched this question. State that limitation plainly, do not \
invent file names, line numbers or code from the repository, and keep any general advice short.";

pub(crate) static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").expect("citation marker regex is valid")
});

/// Byte ranges of inline code spans and fenced blocks, delimiters included.
/// An unterminated span runs to the end of the text.
pub(crate) fn code_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(offset) = text[from..].find('`') {
        let start = from + offset;
        let delim = if text[start..].starts_with("```") { "```" } else { "`" };
        let body = start + delim.len();
        let end = text[body..]
            .find(delim)
            .map_or(text.len(), |i| body + i + delim.len());
        spans.push(start..end);
        from = end;
    }
    spans
}

/// Completed answer of one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generated {
    pub answer: String,
    /// Citations in emission order, without duplicates.
    pub citations: Vec<Citation>,
}

/// Maps `[n]` markers in streamed text to the citation of the n-th context section.
#[derive(Debug)]
pub struct CitationTracker {
    sources: Vec<Citation>,
    seen: HashSet<usize>,
    emitted: Vec<Citation>,
    scanned: usize,
}

impl CitationTracker {
    #[must_use]
    pub fn new(chunks: &[RetrievedChunk]) -> Self {
        Self {
            sources: chunks.iter().map(|c| c.chunk.citation()).collect(),
            seen: HashSet::new(),
            emitted: Vec::new(),
            scanned: 0,
        }
    }

    /// Citations newly referenced by `text`, which must extend the text
    /// passed on the previous call.
    /// Markers inside inline code or fenced blocks are not citations.
    pub fn observe(&mut self, text: &str) -> Vec<Citation> {
        let start = self.scanned.min(text.len());
        let tail = &text[start..];
        let code = code_spans(text);
        let mut fresh = Vec::new();
        for caps in MARKER.captures_iter(tail) {
            let at = start + caps.get(0).map_or(0, |m| m.start());
            if code.iter().any(|span| span.contains(&at)) {
                continue;
            }
            for n in caps[1].split(',').filter_map(|n| n.trim().parse::<usize>().ok()) {
                if let Some(citation) = self.mark(n) {
                    fresh.push(citation);
                }
            }
        }
        // a marker may still be arriving
        self.scanned = match tail.rfind('[') {
            Some(i) if !tail[i..].contains(']') => self.scanned + i,
            _ => text.len(),
        };
        fresh
    }

    /// When the answer used no markers at all, cite the best chunk of each
    /// file the answer names explicitly.
    pub fn fallback(&mut self, text: &str) -> Vec<Citation> {
        if !self.seen.is_empty() {
            return Vec::new();
        }
        let mut paths = HashSet::new();
        let picks: Vec<usize> = self
            .sources
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                text.contains(c.file_path.as_str()) && paths.insert(c.file_path.clone())
            })
            .map(|(i, _)| i + 1)
            .collect();
        picks.into_iter().filter_map(|n| self.mark(n)).collect()
    }

    #[must_use]
    pub fn cited(&self) -> &[Citation] {
        &self.emitted
    }

    fn mark(&mut self, n: usize) -> Option<Citation> {
        let citation = self.sources.get(n.checked_sub(1)?)?.clone();
        if !self.seen.insert(n) {
            return None;
        }
        self.emitted.push(citation.clone());
        Some(citation)
    }
}

pub struct Generator<P> {
    provider: Arc<P>,
    history_turns: usize,
    timeout: Duration,
}

impl<P: LlmProvider> Generator<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, history_turns: usize, timeout: Duration) -> Self {
        Self {
            provider,
            history_turns,
            timeout,
        }
    }

    /// Stream `content` and `citation` events into `tx`.
    ///
    /// Returns `Ok(None)` once the receiver is gone; no further output is
    /// requested from the model after that.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::GenerationTimeout`] when the whole answer does
    /// not arrive in time and [`AgentError::Generation`] on model errors.
    pub async fn generate(
        &self,
        question: &str,
        history: &[ConversationTurn],
        intent: Intent,
        chunks: &[RetrievedChunk],
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<Option<Generated>, AgentError> {
        let deadline = Instant::now() + self.timeout;
        let messages = self.build_messages(question, history, intent, chunks);
        let mut tracker = CitationTracker::new(chunks);
        let mut answer = String::new();

        if chunks.is_empty() {
            answer.push_str(NO_CONTEXT_NOTICE);
            if !emit(tx, StreamEvent::content(NO_CONTEXT_NOTICE)).await {
                return Ok(None);
            }
        }

        if self.provider.supports_streaming() {
            let mut stream = timeout_at(deadline, self.provider.chat_stream(&messages))
                .await
                .map_err(|_| AgentError::GenerationTimeout(self.timeout))?
                .map_err(AgentError::Generation)?;

            while let Some(fragment) = timeout_at(deadline, stream.next())
                .await
                .map_err(|_| AgentError::GenerationTimeout(self.timeout))?
            {
                let fragment = fragment.map_err(AgentError::Generation)?;
                if !forward(fragment, &mut answer, &mut tracker, tx).await {
                    tracing::debug!("generation cancelled by receiver");
                    return Ok(None);
                }
            }
        } else {
            let reply = timeout_at(deadline, self.provider.chat(&messages))
                .await
                .map_err(|_| AgentError::GenerationTimeout(self.timeout))?
                .map_err(AgentError::Generation)?;
            if !forward(reply, &mut answer, &mut tracker, tx).await {
                return Ok(None);
            }
        }

        for citation in tracker.fallback(&answer) {
            if !emit(tx, StreamEvent::Citation { citation }).await {
                return Ok(None);
            }
        }

        Ok(Some(Generated {
            answer,
            citations: tracker.cited().to_vec(),
        }))
    }

    fn build_messages(
        &self,
        question: &str,
        history: &[ConversationTurn],
        intent: Intent,
        chunks: &[RetrievedChunk],
    ) -> Vec<Message> {
        let system = if chunks.is_empty() {
            NO_CONTEXT_PROMPT
        } else {
            GENERATOR_PROMPT
        };
        let mut messages = vec![Message::system(system)];
        messages.extend(history_messages(history, self.history_turns));

        let mut prompt = String::new();
        if !chunks.is_empty() {
            prompt.push_str(&format_context(chunks));
        }
        if intent != Intent::General {
            let _ = writeln!(prompt, "Kind of request: {intent:?}\n");
        }
        let _ = write!(prompt, "Question: {question}");
        messages.push(Message::user(prompt));
        messages
    }
}

/// Numbered context sections, one per chunk, in retrieval order.
pub(crate) fn format_context(chunks: &[RetrievedChunk]) -> String {
    let mut out = String::from("Context:\n\n");
    for (i, retrieved) in chunks.iter().enumerate() {
        let chunk = &retrieved.chunk;
        let _ = write!(out, "[{}] {}", i + 1, chunk.citation());
        if let Some(name) = &chunk.entity_name {
            let _ = write!(out, " ({} {name})", chunk.kind.as_str());
        }
        let _ = writeln!(out, "\n```{}\n{}\n```\n", chunk.language.id(), chunk.text.trim_end());
    }
    out
}

/// Append a fragment and emit it along with any citations it completes.
/// `false` once the receiver is gone.
async fn forward(
    fragment: String,
    answer: &mut String,
    tracker: &mut CitationTracker,
    tx: &mpsc::Sender<StreamEvent>,
) -> bool {
    if fragment.is_empty() {
        return true;
    }
    answer.push_str(&fragment);
    if !emit(tx, StreamEvent::content(fragment)).await {
        return false;
    }
    for citation in tracker.observe(answer) {
        if !emit(tx, StreamEvent::Citation { citation }).await {
            return false;
        }
    }
    true
}

pub(crate) async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}
