use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use futures::future::BoxFuture;
use repopilot_core::config::{Config, ProviderKind};
use repopilot_core::{AgentError, AskRequest, Orchestrator, StreamEvent, TurnRecord, TurnSink};
use repopilot_index::{
    InMemoryVectorStore, Indexer, Lang, MetadataStore, QdrantOps, RepositoryIndex, SearchFilter,
    StatusBoard, StatusUpdate, VectorStore, structure,
};
use repopilot_llm::any::AnyProvider;
use repopilot_llm::ollama::OllamaProvider;
use repopilot_llm::openai::OpenAiProvider;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "repopilot", version, about)]
struct Cli {
    /// Config file; falls back to `REPOPILOT_CONFIG`, then `config/default.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

fn parse_language(id: &str) -> Result<Lang, String> {
    Lang::parse_id(id).ok_or_else(|| {
        let known: Vec<_> = Lang::ALL.iter().map(|l| l.id()).collect();
        format!("unknown language `{id}`, expected one of: {}", known.join(", "))
    })
}

#[derive(Subcommand)]
enum Command {
    /// Index (or re-index) a repository.
    Index { repository: String, root: PathBuf },
    /// Ask a question and stream the answer.
    Ask {
        repository: String,
        question: String,
        /// Index this directory first.
        #[arg(long)]
        root: Option<PathBuf>,
        /// Only search below this path.
        #[arg(long)]
        path: Option<String>,
        /// Only search chunks in this language (e.g. `python`, `rust`).
        #[arg(long, value_parser = parse_language)]
        language: Option<Lang>,
    },
    /// Print the indexed file tree.
    Tree {
        repository: String,
        /// Index this directory first.
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Show the indexing status of every known repository.
    Status,
    /// Run the HTTP gateway.
    #[cfg(feature = "gateway")]
    Serve,
}

/// Shared services for one process.
#[cfg_attr(not(feature = "gateway"), allow(dead_code))]
struct App {
    config: Config,
    provider: Arc<AnyProvider>,
    metadata: MetadataStore,
    status: Arc<StatusBoard>,
    indexer: Arc<Indexer<AnyProvider>>,
    orchestrator: Arc<Orchestrator<AnyProvider>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);
    let config = Config::load(&config_path)?;
    tracing::debug!(path = %config_path.display(), "config loaded");

    let app = build_app(config).await?;

    match cli.command {
        Command::Index { repository, root } => {
            let report = index_and_persist(&app, &repository, &root).await?;
            for warning in &report.warnings {
                eprintln!("warning: {warning}");
            }
            println!("{repository}: {}", report.summary());
            Ok(())
        }
        Command::Ask {
            repository,
            question,
            root,
            path,
            language,
        } => {
            if let Some(root) = root {
                index_and_persist(&app, &repository, &root).await?;
            }
            let filter = SearchFilter {
                language,
                path_prefix: path,
            };
            let mut request = AskRequest::new(repository, question);
            request.filter = filter;
            ask(&app, request).await
        }
        Command::Tree { repository, root } => {
            if let Some(root) = root {
                index_and_persist(&app, &repository, &root).await?;
            }
            let tree = app.indexer.structure(&repository).await?;
            print!("{}", structure::render_tree(&tree));
            Ok(())
        }
        Command::Status => {
            for update in app.status.all() {
                let detail = update.detail.unwrap_or_default();
                println!("{}\t{}\t{detail}", update.repository_id, update.status);
            }
            Ok(())
        }
        #[cfg(feature = "gateway")]
        Command::Serve => serve(app).await,
    }
}

fn init_subscriber() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    if let Ok(path) = std::env::var("REPOPILOT_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config/default.toml")
}

fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    let llm = &config.llm;
    match llm.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &llm.base_url,
            llm.model.clone(),
            llm.embedding_model.clone(),
        ))),
        ProviderKind::OpenAi => {
            let api_key = config
                .secrets
                .llm_api_key
                .as_ref()
                .context("REPOPILOT_LLM_API_KEY must be set for the openai provider")?;
            Ok(AnyProvider::OpenAi(OpenAiProvider::new(
                api_key.expose().to_owned(),
                llm.base_url.clone(),
                llm.model.clone(),
                llm.max_tokens,
                Some(llm.embedding_model.clone()),
            )))
        }
    }
}

fn create_vector_store(config: &Config) -> anyhow::Result<Arc<dyn VectorStore>> {
    match &config.store.qdrant_url {
        Some(url) => {
            let store = QdrantOps::new(url)
                .with_context(|| format!("failed to create Qdrant client for {url}"))?;
            tracing::info!(url, "using Qdrant vector store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("no qdrant_url configured, vectors are kept in memory");
            Ok(Arc::new(InMemoryVectorStore::new()))
        }
    }
}

/// SQLite location for the metadata store.
///
/// Metadata only outlives the process when vectors do; otherwise a persisted
/// ledger would claim chunks are embedded that the fresh in-memory store lacks.
fn metadata_path(config: &Config) -> String {
    if config.store.qdrant_url.is_some() {
        config.store.sqlite_path.clone()
    } else {
        ":memory:".to_owned()
    }
}

async fn build_app(config: Config) -> anyhow::Result<App> {
    let provider = Arc::new(create_provider(&config)?);
    let index = RepositoryIndex::new(
        create_vector_store(&config)?,
        config.store.collection_prefix.clone(),
    );

    let db_path = metadata_path(&config);
    if db_path != ":memory:"
        && let Some(parent) = Path::new(&db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let metadata = MetadataStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open metadata store at {db_path}"))?;

    let status = Arc::new(StatusBoard::new());
    status.restore(
        metadata
            .load_statuses()
            .await
            .context("failed to load repository statuses")?,
    );

    let indexer = Arc::new(Indexer::new(
        Arc::clone(&provider),
        index.clone(),
        metadata.clone(),
        Arc::clone(&status),
        config.indexer_config(),
    ));
    let orchestrator = Arc::new(
        Orchestrator::new(Arc::clone(&provider), index, Arc::clone(&status), &config)
            .with_sink(Arc::new(LogTurnSink)),
    );

    Ok(App {
        config,
        provider,
        metadata,
        status,
        indexer,
        orchestrator,
    })
}

async fn index_and_persist(
    app: &App,
    repository: &str,
    root: &Path,
) -> anyhow::Result<repopilot_index::IndexReport> {
    let outcome = app.indexer.index_repository(repository, root).await;
    if let Err(e) = app.metadata.save_status(&app.status.get(repository)).await {
        tracing::warn!(repository, "failed to persist index status: {e}");
    }
    outcome.with_context(|| format!("indexing {} failed", root.display()))
}

async fn ask(app: &App, request: AskRequest) -> anyhow::Result<()> {
    let events = match app.orchestrator.ask(request) {
        Ok(events) => events,
        Err(e @ AgentError::NotIndexed { .. }) => {
            bail!("{} Run `repopilot index` first or pass --root.", e.user_message())
        }
        Err(e) => return Err(e.into()),
    };
    let mut events = std::pin::pin!(events);
    let mut citations = Vec::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event {
            StreamEvent::Status { agent, status } => {
                tracing::debug!(?agent, ?status, "stage");
            }
            StreamEvent::Content { content } => {
                print!("{content}");
                stdout.flush()?;
            }
            StreamEvent::Citation { citation } => citations.push(citation),
            StreamEvent::Risk { risk } => {
                println!();
                if !citations.is_empty() {
                    println!("\nSources:");
                    for (i, citation) in citations.iter().enumerate() {
                        println!("  [{}] {citation}", i + 1);
                    }
                }
                println!("\nRisk: {} ({})", risk.level, risk.description);
            }
            StreamEvent::Error { message } => {
                println!();
                bail!(message);
            }
            StreamEvent::Done => break,
        }
    }
    Ok(())
}

/// Records completed turns in the log; the gateway has no conversation store.
struct LogTurnSink;

impl TurnSink for LogTurnSink {
    fn persist(&self, record: TurnRecord) -> BoxFuture<'_, Result<(), AgentError>> {
        Box::pin(async move {
            tracing::info!(
                repository = %record.repository_id,
                question_chars = record.question.chars().count(),
                answer_chars = record.answer.chars().count(),
                citations = record.citations.len(),
                risk = %record.risk.level,
                "turn completed"
            );
            Ok(())
        })
    }
}

/// Copy every status change into the metadata store until the board goes away.
#[cfg_attr(not(feature = "gateway"), allow(dead_code))]
async fn persist_statuses(mut rx: broadcast::Receiver<StatusUpdate>, metadata: MetadataStore) {
    loop {
        match rx.recv().await {
            Ok(update) => {
                if let Err(e) = metadata.save_status(&update).await {
                    tracing::warn!(
                        repository = %update.repository_id,
                        "failed to persist index status: {e}"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("status persistence lagged, {n} update(s) skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(feature = "gateway")]
async fn health_check(provider: &AnyProvider) {
    if let AnyProvider::Ollama(ollama) = provider {
        match ollama.health_check().await {
            Ok(()) => tracing::info!("ollama is reachable"),
            Err(e) => tracing::warn!("ollama health check failed: {e}"),
        }
    }
}

#[cfg(feature = "gateway")]
async fn serve(app: App) -> anyhow::Result<()> {
    use repopilot_gateway::{AppState, GatewayServer};
    use tokio::sync::watch;

    health_check(&app.provider).await;
    tokio::spawn(persist_statuses(app.status.subscribe(), app.metadata.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let gateway = &app.config.gateway;
    let state = AppState::new(Arc::clone(&app.indexer), Arc::clone(&app.orchestrator));
    GatewayServer::new(&gateway.bind, gateway.port, state, shutdown_rx)
        .with_max_body_size(gateway.max_body_size)
        .serve()
        .await?;
    Ok(())
}
