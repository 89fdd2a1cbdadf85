//! Test-only mock LLM provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_stream::StreamExt;

use crate::provider::{ChatStream, LlmProvider, Message};

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<Vec<String>>>,
    stream_responses: Arc<Mutex<Vec<String>>>,
    chat_calls: Arc<AtomicUsize>,
    embed_calls: Arc<AtomicUsize>,
    embed_failures_left: Arc<AtomicUsize>,
    pub default_response: String,
    /// Fixed vector returned by `embed` when `embedding_dim` is `None`.
    pub embedding: Vec<f32>,
    /// When set, `embed` returns a normalised hashed bag-of-words vector of this size.
    pub embedding_dim: Option<usize>,
    pub supports_embeddings: bool,
    pub streaming: bool,
    pub fail_chat: bool,
    pub fail_stream: bool,
    /// Milliseconds to sleep before returning a response.
    pub delay_ms: u64,
    /// Milliseconds to sleep between streamed fragments.
    pub chunk_delay_ms: u64,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            stream_responses: Arc::new(Mutex::new(Vec::new())),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            embed_calls: Arc::new(AtomicUsize::new(0)),
            embed_failures_left: Arc::new(AtomicUsize::new(0)),
            default_response: "mock response".into(),
            embedding: vec![0.0; 384],
            embedding_dim: None,
            supports_embeddings: false,
            streaming: false,
            fail_chat: false,
            fail_stream: false,
            delay_ms: 0,
            chunk_delay_ms: 0,
        }
    }
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            fail_stream: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Responses consumed by `chat_stream` before it falls back to the `chat` queue.
    #[must_use]
    pub fn with_stream_responses(self, responses: Vec<String>) -> Self {
        *self
            .stream_responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = responses;
        self.with_streaming()
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_chunk_delay(mut self, ms: u64) -> Self {
        self.chunk_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_hashed_embeddings(mut self, dim: usize) -> Self {
        self.embedding_dim = Some(dim);
        self.supports_embeddings = true;
        self
    }

    /// Make the next `n` calls to `embed` fail with a transient error.
    #[must_use]
    pub fn with_embed_failures(self, n: usize) -> Self {
        self.embed_failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Number of `embed` calls made so far, including failed ones. Shared across clones.
    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.embed_calls.store(0, Ordering::SeqCst);
        self.chat_calls.store(0, Ordering::SeqCst);
    }

    fn next_from(queue: &Mutex<Vec<String>>) -> Option<String> {
        let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

impl LlmProvider for MockProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, _messages: &[Message]) -> Result<String, crate::LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail_chat {
            return Err(crate::LlmError::Other("mock LLM error".into()));
        }
        Ok(Self::next_from(&self.responses).unwrap_or_else(|| self.default_response.clone()))
    }

    async fn chat_stream(&self, messages: &[Message]) -> Result<ChatStream, crate::LlmError> {
        if self.fail_stream {
            return Err(crate::LlmError::Other("mock stream error".into()));
        }
        let response = match Self::next_from(&self.stream_responses) {
            Some(r) => {
                if self.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
                }
                r
            }
            None => self.chat(messages).await?,
        };
        let chunks: Vec<_> = response.chars().map(|c| c.to_string()).map(Ok).collect();
        let stream = tokio_stream::iter(chunks);
        if self.chunk_delay_ms > 0 {
            let delay = Duration::from_millis(self.chunk_delay_ms);
            Ok(Box::pin(stream.throttle(delay)))
        } else {
            Ok(Box::pin(stream))
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, crate::LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_embeddings {
            return Err(crate::LlmError::EmbedUnsupported {
                provider: "mock".into(),
            });
        }
        let failing = self
            .embed_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(crate::LlmError::Unavailable);
        }
        match self.embedding_dim {
            Some(dim) => Ok(hashed_bag_of_words(text, dim)),
            None => Ok(self.embedding.clone()),
        }
    }

    fn supports_embeddings(&self) -> bool {
        self.supports_embeddings
    }
}

/// Lowercased identifier tokens hashed (FNV-1a) into `dim` buckets, L2-normalised.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn hashed_bag_of_words(text: &str, dim: usize) -> Vec<f32> {
    let dim = dim.max(1);
    let mut v = vec![0.0f32; dim];
    for token in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
    {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in token.to_lowercase().bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        v[(h % dim as u64) as usize] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn scripted_responses_then_default() {
        let p = MockProvider::with_responses(vec!["one".into()]);
        assert_eq!(p.chat(&[]).await.unwrap(), "one");
        assert_eq!(p.chat(&[]).await.unwrap(), "mock response");
        assert_eq!(p.chat_calls(), 2);
    }

    #[tokio::test]
    async fn stream_queue_is_separate_from_chat_queue() {
        let p = MockProvider::with_responses(vec!["plan".into()])
            .with_stream_responses(vec!["ab".into()]);
        let parts: Vec<String> = p
            .chat_stream(&[])
            .await
            .unwrap()
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(parts, vec!["a", "b"]);
        assert_eq!(p.chat(&[]).await.unwrap(), "plan");
    }

    #[tokio::test]
    async fn hashed_embeddings_favour_shared_tokens() {
        let p = MockProvider::default().with_hashed_embeddings(64);
        let q = p.embed("what does add do").await.unwrap();
        let add = p.embed("def add(a, b): return a + b").await.unwrap();
        let other = p.embed("class Parser: tokenize input stream").await.unwrap();
        assert!(cosine(&q, &add) > cosine(&q, &other));
        assert_eq!(p.embed_calls(), 3);
    }

    #[tokio::test]
    async fn embed_failures_are_consumed() {
        let p = MockProvider::default()
            .with_hashed_embeddings(8)
            .with_embed_failures(1);
        assert!(p.embed("x").await.unwrap_err().is_transient());
        assert!(p.embed("x").await.is_ok());
        assert_eq!(p.embed_calls(), 2);
    }

    #[tokio::test]
    async fn clones_share_counters() {
        let p = MockProvider::default().with_hashed_embeddings(8);
        let clone = p.clone();
        clone.embed("x").await.unwrap();
        assert_eq!(p.embed_calls(), 1);
        p.reset_counters();
        assert_eq!(clone.embed_calls(), 0);
    }

    #[test]
    fn bag_of_words_is_normalised() {
        let v = hashed_bag_of_words("alpha beta beta", 16);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(hashed_bag_of_words("", 4).iter().all(|x| *x == 0.0));
    }
}
