//! Grades how well a finished answer is grounded in the retrieved code.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use repopilot_llm::{LlmProvider, Message};
use serde::Deserialize;

use super::generator::{Generated, MARKER, code_spans};
use super::retriever::RetrievedChunk;
use super::strip_code_fence;
use crate::event::{RiskLevel, RiskVerdict};

const REVIEW_PROMPT: &str = "You review answers produced by a code assistant.\n\
Judge whether the answer is supported by the retrieved code. Reply with JSON only: \
{\"level\": \"low|medium|high\", \"reason\": \"one short sentence\"}. \
low means every claim is supported, medium means some claims are not shown by the code, \
high means the answer contradicts the code or is mostly unsupported.";

const MAX_REVIEW_CHARS: usize = 6000;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "her", "was", "one",
    "our", "out", "has", "have", "this", "that", "with", "from", "they", "will", "would", "there",
    "their", "what", "when", "where", "which", "while", "who", "how", "why", "does", "did", "doe",
    "its", "into", "than", "then", "them", "these", "those", "been", "being", "also", "just",
    "only", "about", "some", "such", "here", "more", "most", "other", "each", "should", "could",
    "use", "used", "using", "code", "file", "function", "value",
];

/// Claims at or above this share of traceable sentences may score `low`.
const LOW_RISK_RATIO: f64 = 0.7;
const MEDIUM_RISK_RATIO: f64 = 0.4;
/// A question whose terms barely appear in the context is answered from general knowledge.
const MIN_QUESTION_COVERAGE: f64 = 0.3;

pub struct Verifier<P> {
    provider: Arc<P>,
    llm_review: bool,
    timeout: Duration,
}

impl<P: LlmProvider> Verifier<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, llm_review: bool, timeout: Duration) -> Self {
        Self {
            provider,
            llm_review,
            timeout,
        }
    }

    /// Never fails: a review that cannot complete yields at least `medium`
    /// with the verdict marked degraded.
    pub async fn verify(
        &self,
        question: &str,
        generated: &Generated,
        chunks: &[RetrievedChunk],
    ) -> RiskVerdict {
        let heuristic = heuristic_verdict(question, generated, chunks);
        if !self.llm_review || chunks.is_empty() {
            return heuristic;
        }

        let messages = review_messages(question, &generated.answer, chunks);
        let reply = match tokio::time::timeout(self.timeout, self.provider.chat(&messages)).await
        {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!("verifier review failed: {e:#}");
                return degraded(heuristic);
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "verifier review timed out");
                return degraded(heuristic);
            }
        };

        match parse_review(&reply) {
            Some(review) if review.level > heuristic.level => RiskVerdict {
                level: review.level,
                description: review.reason,
                degraded: false,
            },
            Some(_) => heuristic,
            None => {
                tracing::warn!("verifier review reply unusable");
                degraded(heuristic)
            }
        }
    }
}

fn degraded(heuristic: RiskVerdict) -> RiskVerdict {
    RiskVerdict {
        level: heuristic.level.max(RiskLevel::Medium),
        description: format!("Automated review unavailable. {}", heuristic.description),
        degraded: true,
    }
}

/// Score grounding from the answer text alone: the share of claim sentences
/// traceable to retrieved text or carrying a citation marker, how much of the
/// question the context covers, and whether anything was cited.
#[must_use]
pub fn heuristic_verdict(
    question: &str,
    generated: &Generated,
    chunks: &[RetrievedChunk],
) -> RiskVerdict {
    if chunks.is_empty() {
        return RiskVerdict {
            level: RiskLevel::High,
            description: "No repository code was retrieved, so the answer is not grounded.".into(),
            degraded: false,
        };
    }

    let context: HashSet<String> = chunks
        .iter()
        .flat_map(|c| significant_tokens(&c.chunk.text))
        .chain(chunks.iter().flat_map(|c| significant_tokens(&c.chunk.file_path)))
        .collect();

    let claims = claim_sentences(&generated.answer);
    let traceable = claims
        .iter()
        .filter(|s| cites_valid_marker(s, chunks.len()) || overlaps(s, &context))
        .count();
    let ratio = if claims.is_empty() {
        if generated.citations.is_empty() { 0.5 } else { 1.0 }
    } else {
        share(traceable, claims.len())
    };

    let question_terms = significant_tokens(question);
    let coverage = if question_terms.is_empty() {
        1.0
    } else {
        share(
            question_terms.iter().filter(|t| context.contains(*t)).count(),
            question_terms.len(),
        )
    };

    let cited = !generated.citations.is_empty();
    let level = if ratio >= LOW_RISK_RATIO && cited && coverage >= MIN_QUESTION_COVERAGE {
        RiskLevel::Low
    } else if ratio >= MEDIUM_RISK_RATIO || cited {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    };

    let pct = (ratio * 100.0).round();
    let description = match level {
        RiskLevel::Low => format!(
            "Answer is grounded in retrieved code ({pct}% of claims traceable, {} citation(s)).",
            generated.citations.len()
        ),
        RiskLevel::Medium if !cited => {
            format!("Answer cites no sources; {pct}% of claims traceable to retrieved code.")
        }
        RiskLevel::Medium if coverage < MIN_QUESTION_COVERAGE => format!(
            "Retrieved code only loosely matches the question; {pct}% of claims traceable."
        ),
        RiskLevel::Medium => format!(
            "Some claims may need manual verification ({pct}% traceable to retrieved code)."
        ),
        RiskLevel::High => {
            format!("Most claims are not supported by retrieved code ({pct}% traceable).")
        }
    };

    RiskVerdict {
        level,
        description,
        degraded: false,
    }
}

#[allow(clippy::cast_precision_loss)]
fn share(part: usize, whole: usize) -> f64 {
    part as f64 / whole as f64
}

/// Sentences and lines that assert something, outside of code fences.
fn claim_sentences(answer: &str) -> Vec<String> {
    let mut in_fence = false;
    let mut out = Vec::new();
    for line in answer.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        for sentence in line.split_inclusive(['.', '!', '?']) {
            if significant_tokens(sentence).len() >= 3 {
                out.push(sentence.trim().to_owned());
            }
        }
    }
    out
}

fn cites_valid_marker(sentence: &str, sources: usize) -> bool {
    let code = code_spans(sentence);
    MARKER.captures_iter(sentence).any(|caps| {
        let at = caps.get(0).map_or(0, |m| m.start());
        !code.iter().any(|span| span.contains(&at))
            && caps[1]
                .split(',')
                .filter_map(|n| n.trim().parse::<usize>().ok())
                .any(|n| (1..=sources).contains(&n))
    })
}

fn overlaps(sentence: &str, context: &HashSet<String>) -> bool {
    let tokens = significant_tokens(sentence);
    let hits = tokens.iter().filter(|t| context.contains(*t)).count();
    !tokens.is_empty() && hits * 2 >= tokens.len()
}

fn significant_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.len() >= 3 && !t.chars().all(|c| c.is_ascii_digit()))
        .map(normalize)
        .filter(|t| !STOPWORDS.contains(&t.as_str()) && seen.insert(t.clone()))
        .collect()
}

fn normalize(token: &str) -> String {
    let lower = token.to_lowercase();
    match lower.strip_suffix('s') {
        Some(stem) if stem.len() >= 3 && !stem.ends_with('s') => stem.to_owned(),
        _ => lower,
    }
}

#[derive(Deserialize)]
struct Review {
    level: String,
    #[serde(default, alias = "description")]
    reason: String,
}

struct ParsedReview {
    level: RiskLevel,
    reason: String,
}

fn parse_review(reply: &str) -> Option<ParsedReview> {
    let review: Review = serde_json::from_str(strip_code_fence(reply)).ok()?;
    let level = RiskLevel::parse(&review.level)?;
    let reason = if review.reason.trim().is_empty() {
        format!("Review rated the answer {level} risk.")
    } else {
        review.reason.trim().to_owned()
    };
    Some(ParsedReview { level, reason })
}

fn review_messages(question: &str, answer: &str, chunks: &[RetrievedChunk]) -> Vec<Message> {
    let mut context = super::generator::format_context(chunks);
    truncate_chars(&mut context, MAX_REVIEW_CHARS);
    let mut answer = answer.to_owned();
    truncate_chars(&mut answer, MAX_REVIEW_CHARS);
    vec![
        Message::system(REVIEW_PROMPT),
        Message::user(format!("{context}\nQuestion: {question}\n\nAnswer:\n{answer}")),
    ]
}

fn truncate_chars(s: &mut String, max: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
}
