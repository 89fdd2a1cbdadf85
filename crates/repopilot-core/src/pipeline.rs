//! Runs one turn through planner, retriever, generator and verifier,
//! forwarding events to the caller as they are produced.

use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use repopilot_index::{Citation, IndexStatus, RepositoryIndex, SearchFilter, StatusBoard};
use repopilot_llm::LlmProvider;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::agents::generator::emit;
use crate::agents::{Generator, Planner, Retriever, RetrieverLimits, Verifier};
use crate::config::Config;
use crate::error::AgentError;
use crate::event::{
    AgentName, AgentState, ConversationTurn, RiskVerdict, StreamEvent, TurnRecord,
};

#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub repository_id: String,
    pub question: String,
    /// Earlier turns of the same conversation, oldest first.
    pub history: Vec<ConversationTurn>,
    pub filter: SearchFilter,
}

impl AskRequest {
    #[must_use]
    pub fn new(repository_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            repository_id: repository_id.into(),
            question: question.into(),
            ..Self::default()
        }
    }
}

/// Durable storage for completed turns. Only successful turns are persisted.
pub trait TurnSink: Send + Sync {
    fn persist(&self, record: TurnRecord) -> BoxFuture<'_, Result<(), AgentError>>;
}

/// Keeps turns in memory; used by tests and the CLI.
#[derive(Debug, Default)]
pub struct MemoryTurnSink {
    records: Mutex<Vec<TurnRecord>>,
}

impl MemoryTurnSink {
    #[must_use]
    pub fn records(&self) -> Vec<TurnRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TurnSink for MemoryTurnSink {
    fn persist(&self, record: TurnRecord) -> BoxFuture<'_, Result<(), AgentError>> {
        Box::pin(async move {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(record);
            Ok(())
        })
    }
}

macro_rules! send_or_cancel {
    ($tx:expr, $event:expr) => {
        if !emit($tx, $event).await {
            return Ok(None);
        }
    };
}

pub struct Orchestrator<P> {
    planner: Planner<P>,
    retriever: Retriever<P>,
    generator: Generator<P>,
    verifier: Verifier<P>,
    status: Arc<StatusBoard>,
    sink: Option<Arc<dyn TurnSink>>,
    event_buffer: usize,
}

impl<P> std::fmt::Debug for Orchestrator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("event_buffer", &self.event_buffer)
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl<P: LlmProvider + 'static> Orchestrator<P> {
    #[must_use]
    pub fn new(
        provider: Arc<P>,
        index: RepositoryIndex,
        status: Arc<StatusBoard>,
        config: &Config,
    ) -> Self {
        let query = &config.query;
        let timeouts = &config.timeouts;
        let limits = RetrieverLimits {
            search_k: query.search_k,
            top_n: query.top_n,
            score_threshold: query.score_threshold,
            embed_timeout: timeouts.embedding(),
            search_timeout: timeouts.search(),
        };
        Self {
            planner: Planner::new(
                Arc::clone(&provider),
                query.max_sub_queries,
                query.history_turns,
                timeouts.planner(),
            ),
            retriever: Retriever::new(Arc::clone(&provider), index, limits),
            generator: Generator::new(
                Arc::clone(&provider),
                query.history_turns,
                timeouts.generation(),
            ),
            verifier: Verifier::new(provider, config.verifier.llm_review, timeouts.verifier()),
            status,
            sink: None,
            event_buffer: query.event_buffer.max(1),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TurnSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start a turn and return its event stream.
    ///
    /// Dropping the stream cancels the turn: no further output is requested
    /// from the model and the verifier does not run.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NotIndexed`] without starting any work when the
    /// repository is not `ready`.
    pub fn ask(
        self: &Arc<Self>,
        request: AskRequest,
    ) -> Result<ReceiverStream<StreamEvent>, AgentError> {
        let current = self.status.get(&request.repository_id);
        if current.status != IndexStatus::Ready {
            return Err(AgentError::NotIndexed {
                repository: request.repository_id,
                status: current.status,
            });
        }

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_turn(request, tx).await });
        Ok(ReceiverStream::new(rx))
    }

    async fn run_turn(&self, request: AskRequest, tx: mpsc::Sender<StreamEvent>) {
        let repository = request.repository_id.as_str();
        let outcome = tokio::select! {
            biased;
            () = tx.closed() => {
                tracing::info!(repository, "turn cancelled by caller");
                return;
            }
            outcome = self.drive(&request, &tx) => outcome,
        };

        match outcome {
            Ok(Some(record)) => {
                if !emit(&tx, StreamEvent::Done).await {
                    return;
                }
                if let Some(sink) = &self.sink
                    && let Err(e) = sink.persist(record).await
                {
                    tracing::warn!(repository, "failed to persist turn: {e:#}");
                }
            }
            Ok(None) => tracing::info!(repository, "turn cancelled by caller"),
            Err(e) => {
                tracing::error!(repository, "turn failed: {e:#}");
                let message = e.user_message();
                if emit(&tx, StreamEvent::Error { message }).await {
                    let _ = tx.send(StreamEvent::Done).await;
                }
            }
        }
    }

    /// `Ok(None)` when the receiver went away mid-turn.
    async fn drive(
        &self,
        request: &AskRequest,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<Option<TurnRecord>, AgentError> {
        let repository = request.repository_id.as_str();
        let question = request.question.as_str();

        send_or_cancel!(tx, StreamEvent::status(AgentName::Planner, AgentState::Running));
        let plan = self.planner.plan(question, &request.history).await;
        send_or_cancel!(tx, StreamEvent::status(AgentName::Planner, state(plan.degraded)));

        send_or_cancel!(tx, StreamEvent::status(AgentName::Retriever, AgentState::Running));
        let chunks = self
            .retriever
            .retrieve(repository, &plan, &request.filter)
            .await?;
        tracing::info!(
            repository,
            sub_queries = plan.sub_queries.len(),
            chunks = chunks.len(),
            "context retrieved"
        );
        send_or_cancel!(tx, StreamEvent::status(AgentName::Retriever, AgentState::Done));

        send_or_cancel!(tx, StreamEvent::status(AgentName::Generator, AgentState::Running));
        let Some(generated) = self
            .generator
            .generate(question, &request.history, plan.intent, &chunks, tx)
            .await?
        else {
            return Ok(None);
        };
        send_or_cancel!(tx, StreamEvent::status(AgentName::Generator, AgentState::Done));

        send_or_cancel!(tx, StreamEvent::status(AgentName::Verifier, AgentState::Running));
        let risk = self.verifier.verify(question, &generated, &chunks).await;
        send_or_cancel!(tx, StreamEvent::status(AgentName::Verifier, state(risk.degraded)));
        send_or_cancel!(tx, StreamEvent::Risk { risk: risk.clone() });

        Ok(Some(TurnRecord {
            repository_id: request.repository_id.clone(),
            question: request.question.clone(),
            answer: generated.answer,
            citations: generated.citations,
            risk,
        }))
    }
}

fn state(degraded: bool) -> AgentState {
    if degraded {
        AgentState::Degraded
    } else {
        AgentState::Done
    }
}

/// Client-side fold of a turn's events into its final result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnSummary {
    pub answer: String,
    pub citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The `done` sentinel arrived.
    #[serde(skip)]
    pub complete: bool,
}

impl TurnSummary {
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Content { content } => self.answer.push_str(content),
            StreamEvent::Citation { citation } => self.citations.push(citation.clone()),
            StreamEvent::Risk { risk } => self.risk = Some(risk.clone()),
            StreamEvent::Error { message } => self.error = Some(message.clone()),
            StreamEvent::Done => self.complete = true,
            StreamEvent::Status { .. } => {}
        }
    }

    /// Drain `events` to the end.
    pub async fn collect(events: impl futures::Stream<Item = StreamEvent>) -> Self {
        use futures::StreamExt;

        let mut summary = Self::default();
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            summary.apply(&event);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use repopilot_index::store::EmbeddedChunk;
    use repopilot_index::{Chunk, ChunkKind, InMemoryVectorStore, Lang};
    use repopilot_llm::mock::{MockProvider, hashed_bag_of_words};

    use super::*;
    use crate::agents::NO_CONTEXT_NOTICE;
    use crate::event::RiskLevel;

    const DIM: usize = 64;
    const ADD: &str = "def add(a, b):\n    return a + b\n";

    struct Harness {
        orchestrator: Arc<Orchestrator<MockProvider>>,
        status: Arc<StatusBoard>,
        sink: Arc<MemoryTurnSink>,
        add: Chunk,
    }

    async fn harness(mock: MockProvider, seed: bool) -> Harness {
        let index = RepositoryIndex::new(Arc::new(InMemoryVectorStore::new()), "test_");
        let add = Chunk::new(
            "math.py",
            Lang::Python,
            ChunkKind::Function,
            Some("add".into()),
            1,
            2,
            ADD.into(),
        );
        if seed {
            index.ensure("repo", DIM).await.unwrap();
            index
                .upsert(
                    "repo",
                    vec![EmbeddedChunk {
                        vector: hashed_bag_of_words(ADD, DIM),
                        chunk: add.clone(),
                    }],
                )
                .await
                .unwrap();
        }
        let status = Arc::new(StatusBoard::new());
        status.transition("repo", IndexStatus::Indexing, None).unwrap();
        status.transition("repo", IndexStatus::Ready, None).unwrap();

        let sink = Arc::new(MemoryTurnSink::default());
        let provider = Arc::new(mock.with_hashed_embeddings(DIM));
        let orchestrator =
            Orchestrator::new(provider, index, Arc::clone(&status), &Config::default())
                .with_sink(Arc::clone(&sink) as Arc<dyn TurnSink>);
        Harness {
            orchestrator: Arc::new(orchestrator),
            status,
            sink,
            add,
        }
    }

    fn answering(plan: &str, answer: &str) -> MockProvider {
        MockProvider::with_responses(vec![plan.into()]).with_stream_responses(vec![answer.into()])
    }

    async fn run(h: &Harness, question: &str) -> Vec<StreamEvent> {
        let stream = h.orchestrator.ask(AskRequest::new("repo", question)).unwrap();
        stream.collect().await
    }

    #[tokio::test]
    async fn grounded_turn_emits_ordered_events() {
        let h = harness(
            answering(r#"{"queries": ["add a b"]}"#, "`add` returns the sum of a and b [1]."),
            true,
        )
        .await;
        let events = run(&h, "What does add do?").await;

        assert_eq!(events.last(), Some(&StreamEvent::Done));
        let risk_at = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Risk { .. }))
            .unwrap();
        let last_content = events
            .iter()
            .rposition(|e| matches!(e, StreamEvent::Content { .. }))
            .unwrap();
        assert!(last_content < risk_at);
        assert_eq!(risk_at, events.len() - 2);

        let mut summary = TurnSummary::default();
        events.iter().for_each(|e| summary.apply(e));
        assert_eq!(summary.answer, "`add` returns the sum of a and b [1].");
        assert_eq!(summary.citations, vec![h.add.citation()]);
        let risk = summary.risk.unwrap();
        assert!(risk.level <= RiskLevel::Medium);
        assert!(summary.complete);

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].citations, vec![h.add.citation()]);
        assert_eq!(records[0].question, "What does add do?");
    }

    #[tokio::test]
    async fn empty_index_answers_without_citations() {
        let h = harness(answering(r#"["anything"]"#, "It might add [1]."), false).await;
        let summary = TurnSummary::collect(
            h.orchestrator
                .ask(AskRequest::new("repo", "What does add do?"))
                .unwrap(),
        )
        .await;
        assert!(summary.answer.starts_with(NO_CONTEXT_NOTICE));
        assert!(summary.citations.is_empty());
        assert_eq!(summary.risk.unwrap().level, RiskLevel::High);
    }

    #[tokio::test]
    async fn rejects_repository_that_is_not_ready() {
        let h = harness(MockProvider::default(), true).await;
        h.status.transition("repo", IndexStatus::Indexing, None).unwrap();
        let err = h.orchestrator.ask(AskRequest::new("repo", "q")).unwrap_err();
        assert!(matches!(
            err,
            AgentError::NotIndexed {
                status: IndexStatus::Indexing,
                ..
            }
        ));

        let err = h.orchestrator.ask(AskRequest::new("unknown", "q")).unwrap_err();
        assert!(matches!(
            err,
            AgentError::NotIndexed {
                status: IndexStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn planner_failure_degrades_but_turn_completes() {
        let mock = MockProvider::with_responses(vec!["not json at all".into()])
            .with_stream_responses(vec!["Sum of a and b [1].".into()]);
        let h = harness(mock, true).await;
        let events = run(&h, "add").await;
        assert!(events.contains(&StreamEvent::status(AgentName::Planner, AgentState::Degraded)));
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Risk { .. })));
    }

    #[tokio::test]
    async fn generation_failure_ends_with_error_and_persists_nothing() {
        let mock = MockProvider::failing().with_streaming();
        let h = harness(mock, true).await;
        let events = run(&h, "What does add do?").await;

        let n = events.len();
        assert!(matches!(events[n - 2], StreamEvent::Error { .. }));
        assert_eq!(events[n - 1], StreamEvent::Done);
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Risk { .. })));
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn retrieval_failure_fails_the_turn() {
        let mock = answering(r#"["add"]"#, "unused");
        let mut h = harness(mock, true).await;
        let index = RepositoryIndex::new(Arc::new(InMemoryVectorStore::new()), "test_");
        index.ensure("repo", DIM).await.unwrap();
        // embeddings unsupported: the retriever cannot embed the sub-query
        let orchestrator = Orchestrator::new(
            Arc::new(MockProvider::with_responses(vec![r#"["add"]"#.into()])),
            index,
            Arc::clone(&h.status),
            &Config::default(),
        );
        h.orchestrator = Arc::new(orchestrator);

        let summary =
            TurnSummary::collect(h.orchestrator.ask(AskRequest::new("repo", "q")).unwrap()).await;
        assert!(summary.error.is_some());
        assert!(summary.risk.is_none());
        assert!(summary.complete);
    }

    #[tokio::test]
    async fn dropping_stream_cancels_turn() {
        let mock = answering(r#"["add"]"#, &"x".repeat(500)).with_chunk_delay(10);
        let h = harness(mock, true).await;
        let mut stream = h
            .orchestrator
            .ask(AskRequest::new("repo", "What does add do?"))
            .unwrap();

        while let Some(event) = stream.next().await {
            if matches!(event, StreamEvent::Content { .. }) {
                break;
            }
        }
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.sink.records().is_empty());
    }

    #[tokio::test]
    async fn concurrent_turns_are_independent() {
        let mock = MockProvider::with_responses(vec![r#"["add"]"#.into(), r#"["add"]"#.into()])
            .with_stream_responses(vec!["One [1].".into(), "Two [1].".into()]);
        let h = harness(mock, true).await;
        let a = h.orchestrator.ask(AskRequest::new("repo", "first?")).unwrap();
        let b = h.orchestrator.ask(AskRequest::new("repo", "second?")).unwrap();
        let (a, b) = tokio::join!(TurnSummary::collect(a), TurnSummary::collect(b));
        let mut answers = vec![a.answer, b.answer];
        answers.sort();
        assert_eq!(answers, vec!["One [1].", "Two [1]."]);
        assert_eq!(h.sink.records().len(), 2);
    }
}
