use axum::Router;
use axum::routing::{delete, get, post};
use repopilot_llm::LlmProvider;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{
    chat_message_handler, chat_stream_handler, delete_handler, health_handler, index_handler,
    status_handler, structure_handler,
};
use super::server::AppState;

pub(crate) fn build_router<P: LlmProvider + 'static>(
    state: AppState<P>,
    max_body_size: usize,
) -> Router {
    let repos: Router<AppState<P>> = Router::new()
        .route("/repos/{id}", delete(delete_handler::<P>))
        .route("/repos/{id}/index", post(index_handler::<P>))
        .route("/repos/{id}/status", get(status_handler::<P>))
        .route("/repos/{id}/structure", get(structure_handler::<P>));

    let chat: Router<AppState<P>> = Router::new()
        .route("/chat/stream", post(chat_stream_handler::<P>))
        .route("/chat/message", post(chat_message_handler::<P>));

    Router::new()
        .route("/health", get(health_handler::<P>))
        .merge(repos)
        .merge(chat)
        .layer(RequestBodyLimitLayer::new(max_body_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use repopilot_core::{Config, Orchestrator};
    use repopilot_index::{
        IndexStatus, Indexer, IndexerConfig, InMemoryVectorStore, MetadataStore, RepositoryIndex,
        StatusBoard,
    };
    use repopilot_llm::mock::MockProvider;
    use tower::ServiceExt;

    use super::*;

    const DIM: usize = 64;

    pub(crate) async fn test_state() -> (AppState<MockProvider>, Arc<StatusBoard>) {
        state_with(MockProvider::default()).await
    }

    async fn state_with(mock: MockProvider) -> (AppState<MockProvider>, Arc<StatusBoard>) {
        let provider = Arc::new(mock.with_hashed_embeddings(DIM));
        let index = RepositoryIndex::new(Arc::new(InMemoryVectorStore::new()), "test_");
        let status = Arc::new(StatusBoard::new());
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&provider),
            index.clone(),
            MetadataStore::open(":memory:").await.unwrap(),
            Arc::clone(&status),
            IndexerConfig::default(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            provider,
            index,
            Arc::clone(&status),
            &Config::default(),
        ));
        (AppState::new(indexer, orchestrator), status)
    }

    fn sample_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("math.py"),
            "def add(a, b):\n    return a + b\n",
        )
        .unwrap();
        dir
    }

    /// State whose `repo` is already indexed; the mock answers planner then generator.
    async fn indexed_state(answer: &str) -> (Router, tempfile::TempDir) {
        let mock = MockProvider::with_responses(vec![r#"["add function"]"#.into(), answer.into()]);
        let (state, _) = state_with(mock).await;
        let dir = sample_repo();
        state
            .indexer
            .index_repository("repo", dir.path())
            .await
            .unwrap();
        (build_router(state, 1_048_576), dir)
    }

    fn json_post(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (state, _) = test_state().await;
        let app = build_router(state, 1_048_576);
        let resp = app.oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn unknown_repository_is_pending() {
        let (state, _) = test_state().await;
        let app = build_router(state, 1_048_576);
        let resp = app.oneshot(get_req("/repos/nope/status")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let json = body_json(resp).await;
        assert_eq!(json["repository_id"], "nope");
        assert_eq!(json["status"], "pending");
    }

    #[tokio::test]
    async fn index_runs_in_background_until_ready() {
        let (state, status) = test_state().await;
        let app = build_router(state, 1_048_576);
        let dir = sample_repo();

        let body = serde_json::json!({ "root": dir.path() });
        let resp = app.oneshot(json_post("/repos/repo/index", &body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["status"], "indexing");

        let mut updates = status.subscribe();
        tokio::time::timeout(Duration::from_secs(10), async {
            while status.get("repo").status == IndexStatus::Indexing {
                let _ = updates.recv().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(status.get("repo").status, IndexStatus::Ready);
    }

    #[tokio::test]
    async fn index_rejects_busy_repository() {
        let (state, status) = test_state().await;
        let app = build_router(state, 1_048_576);
        let dir = sample_repo();
        let _lease = status.try_begin("repo").unwrap();

        let body = serde_json::json!({ "root": dir.path() });
        let resp = app.oneshot(json_post("/repos/repo/index", &body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(
            body_json(resp).await["error"]
                .as_str()
                .unwrap()
                .contains("already being indexed")
        );
    }

    #[tokio::test]
    async fn index_rejects_missing_root() {
        let (state, _) = test_state().await;
        let app = build_router(state, 1_048_576);
        let body = serde_json::json!({ "root": "/definitely/not/here" });
        let resp = app.oneshot(json_post("/repos/repo/index", &body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn chat_against_unindexed_repository_conflicts() {
        let (state, _) = test_state().await;
        let app = build_router(state, 1_048_576);
        let body = serde_json::json!({ "repository_id": "repo", "question": "What does add do?" });
        let resp = app.oneshot(json_post("/chat/stream", &body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert!(
            body_json(resp).await["error"]
                .as_str()
                .unwrap()
                .contains("not ready")
        );
    }

    #[tokio::test]
    async fn chat_stream_emits_sse_events_then_done() {
        let (app, _dir) = indexed_state("add returns the sum of a and b [1].").await;
        let body = serde_json::json!({ "repository_id": "repo", "question": "What does add do?" });
        let resp = app.oneshot(json_post("/chat/stream", &body)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "text/event-stream"
        );

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let payloads: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();

        assert_eq!(payloads.last(), Some(&"[DONE]"));
        let events: Vec<serde_json::Value> = payloads[..payloads.len() - 1]
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect();
        assert!(events.iter().any(|e| e["type"] == "content"));
        let citation = events.iter().find(|e| e["type"] == "citation").unwrap();
        assert_eq!(citation["citation"]["file_path"], "math.py");
        assert_eq!(events.last().unwrap()["type"], "risk");
    }

    #[tokio::test]
    async fn chat_message_returns_summary() {
        let (app, _dir) = indexed_state("add returns a + b [1].").await;
        let body = serde_json::json!({ "repository_id": "repo", "question": "What does add do?" });
        let resp = app.oneshot(json_post("/chat/message", &body)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let json = body_json(resp).await;
        assert_eq!(json["answer"], "add returns a + b [1].");
        assert_eq!(json["citations"][0]["file_path"], "math.py");
        assert_ne!(json["risk"]["level"], "high");
    }

    #[tokio::test]
    async fn structure_lists_indexed_files() {
        let (app, _dir) = indexed_state("unused").await;
        let resp = app
            .clone()
            .oneshot(get_req("/repos/repo/structure"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json = body_json(resp).await;
        assert_eq!(json["type"], "folder");
        assert_eq!(json["children"][0]["name"], "math.py");
        assert_eq!(json["children"][0]["language"], "python");

        let resp = app.oneshot(get_req("/repos/other/structure")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_forgets_repository() {
        let (app, _dir) = indexed_state("unused").await;
        let req = Request::builder()
            .method("DELETE")
            .uri("/repos/repo")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app.oneshot(get_req("/repos/repo/status")).await.unwrap();
        assert_eq!(body_json(resp).await["status"], "pending");
    }

    #[tokio::test]
    async fn body_size_limit() {
        let (state, _) = test_state().await;
        let app = build_router(state, 64);
        let oversized = vec![b'a'; 128];
        let req = Request::builder()
            .method("POST")
            .uri("/chat/message")
            .header("content-type", "application/json")
            .body(Body::from(oversized))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), 413);
    }
}
