use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use repopilot_core::Orchestrator;
use repopilot_index::Indexer;
use repopilot_llm::LlmProvider;
use tokio::sync::watch;

use crate::error::GatewayError;
use crate::router::build_router;

/// Shared handler state: the indexer for repository management and the
/// orchestrator for questions. Both must share one status board.
pub struct AppState<P> {
    pub(crate) indexer: Arc<Indexer<P>>,
    pub(crate) orchestrator: Arc<Orchestrator<P>>,
    pub(crate) started_at: Instant,
}

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            indexer: Arc::clone(&self.indexer),
            orchestrator: Arc::clone(&self.orchestrator),
            started_at: self.started_at,
        }
    }
}

impl<P> AppState<P> {
    #[must_use]
    pub fn new(indexer: Arc<Indexer<P>>, orchestrator: Arc<Orchestrator<P>>) -> Self {
        Self {
            indexer,
            orchestrator,
            started_at: Instant::now(),
        }
    }
}

pub struct GatewayServer<P> {
    addr: SocketAddr,
    max_body_size: usize,
    state: AppState<P>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<P: LlmProvider + 'static> GatewayServer<P> {
    #[must_use]
    pub fn new(
        bind: &str,
        port: u16,
        state: AppState<P>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let addr: SocketAddr = format!("{bind}:{port}").parse().unwrap_or_else(|e| {
            tracing::warn!("invalid bind '{bind}': {e}, falling back to 127.0.0.1:{port}");
            SocketAddr::from(([127, 0, 0, 1], port))
        });

        if bind == "0.0.0.0" {
            tracing::warn!(
                "gateway binding to 0.0.0.0, repository paths are accepted from any client"
            );
        }

        Self {
            addr,
            max_body_size: 1_048_576,
            state,
            shutdown_rx,
        }
    }

    #[must_use]
    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Start the HTTP gateway server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind or encounters a fatal I/O error.
    pub async fn serve(self) -> Result<(), GatewayError> {
        let router = build_router(self.state, self.max_body_size);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| GatewayError::Bind(self.addr.to_string(), e))?;
        tracing::info!("gateway listening on {}", self.addr);

        let mut shutdown_rx = self.shutdown_rx;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while !*shutdown_rx.borrow_and_update() {
                    if shutdown_rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                tracing::info!("gateway shutting down");
            })
            .await
            .map_err(|e| GatewayError::Server(format!("{e}")))?;

        Ok(())
    }
}
