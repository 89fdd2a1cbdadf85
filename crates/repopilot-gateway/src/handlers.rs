use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::StreamExt;
use futures::stream::Stream;
use repopilot_core::event::ConversationTurn;
use repopilot_core::{AskRequest, StreamEvent, TurnSummary};
use repopilot_index::{IndexStatus, SearchFilter};
use repopilot_llm::LlmProvider;

use super::error::ApiError;
use super::server::AppState;

/// SSE payload that closes every chat stream.
pub(crate) const DONE_SENTINEL: &str = "[DONE]";

#[derive(serde::Deserialize)]
pub(crate) struct IndexRequest {
    pub root: PathBuf,
}

#[derive(serde::Deserialize)]
pub(crate) struct ChatRequest {
    pub repository_id: String,
    pub question: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub filter: SearchFilter,
}

impl ChatRequest {
    fn into_ask(self) -> Result<AskRequest, ApiError> {
        if self.question.trim().is_empty() {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "question is empty"));
        }
        Ok(AskRequest {
            repository_id: self.repository_id,
            question: self.question,
            history: self.history,
            filter: self.filter,
        })
    }
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

pub(crate) async fn health_handler<P: LlmProvider + 'static>(
    State(state): State<AppState<P>>,
) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub(crate) async fn index_handler<P: LlmProvider + 'static>(
    State(state): State<AppState<P>>,
    Path(repository_id): Path<String>,
    Json(req): Json<IndexRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let is_dir = tokio::fs::metadata(&req.root)
        .await
        .is_ok_and(|m| m.is_dir());
    if !is_dir {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{} is not a directory", req.root.display()),
        ));
    }

    // the run continues in the background; its outcome lands on the status board
    let _handle = state.indexer.start_index(&repository_id, req.root)?;
    let current = state.indexer.status().get(&repository_id);
    Ok((StatusCode::ACCEPTED, Json(current)))
}

pub(crate) async fn status_handler<P: LlmProvider + 'static>(
    State(state): State<AppState<P>>,
    Path(repository_id): Path<String>,
) -> impl IntoResponse {
    Json(state.indexer.status().get(&repository_id))
}

pub(crate) async fn structure_handler<P: LlmProvider + 'static>(
    State(state): State<AppState<P>>,
    Path(repository_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.indexer.status().get(&repository_id).status == IndexStatus::Pending {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("repository {repository_id} has never been indexed"),
        ));
    }
    Ok(Json(state.indexer.structure(&repository_id).await?))
}

pub(crate) async fn delete_handler<P: LlmProvider + 'static>(
    State(state): State<AppState<P>>,
    Path(repository_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.indexer.drop_repository(&repository_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn sse_payload(event: &StreamEvent) -> String {
    if matches!(event, StreamEvent::Done) {
        return DONE_SENTINEL.to_owned();
    }
    serde_json::to_string(event).unwrap_or_default()
}

pub(crate) async fn chat_stream_handler<P: LlmProvider + 'static>(
    State(state): State<AppState<P>>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.orchestrator.ask(req.into_ask()?)?;
    let stream = events.map(|event| Ok(Event::default().data(sse_payload(&event))));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

pub(crate) async fn chat_message_handler<P: LlmProvider + 'static>(
    State(state): State<AppState<P>>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnSummary>, ApiError> {
    let events = state.orchestrator.ask(req.into_ask()?)?;
    let summary = TurnSummary::collect(events).await;
    if let Some(message) = summary.error {
        return Err(ApiError::new(StatusCode::BAD_GATEWAY, message));
    }
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use repopilot_core::event::{AgentName, AgentState};

    use super::*;

    #[test]
    fn health_response_serializes() {
        let resp = HealthResponse {
            status: "ok",
            uptime_secs: 42,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
    }

    #[test]
    fn chat_request_defaults_history_and_filter() {
        let json = r#"{"repository_id":"r","question":"What does add do?"}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        let ask = req.into_ask().unwrap();
        assert_eq!(ask.repository_id, "r");
        assert!(ask.history.is_empty());
        assert_eq!(ask.filter, SearchFilter::default());
    }

    #[test]
    fn chat_request_parses_filter() {
        let json = r#"{"repository_id":"r","question":"q",
            "filter":{"language":"python","path_prefix":"src"}}"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.filter.path_prefix.as_deref(), Some("src"));
        assert!(req.filter.language.is_some());
    }

    #[test]
    fn blank_question_is_rejected() {
        let req = ChatRequest {
            repository_id: "r".into(),
            question: "  ".into(),
            history: Vec::new(),
            filter: SearchFilter::default(),
        };
        let err = req.into_ask().unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn done_maps_to_sentinel() {
        assert_eq!(sse_payload(&StreamEvent::Done), DONE_SENTINEL);

        let content: serde_json::Value =
            serde_json::from_str(&sse_payload(&StreamEvent::content("hi"))).unwrap();
        assert_eq!(content["type"], "content");
        assert_eq!(content["content"], "hi");

        let status: serde_json::Value = serde_json::from_str(&sse_payload(&StreamEvent::status(
            AgentName::Planner,
            AgentState::Running,
        )))
        .unwrap();
        assert_eq!(status["type"], "status");
    }
}
