use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use trendforge::cli::{AutoApprove, Cli, Commands, ConfigAction, StdinReview};
use trendforge::config::{Config, ConfigValidator};
use trendforge::embedding::{BatchIndexer, Corpus, EmbeddingProvider, FastEmbedProvider};
use trendforge::error::{Result, TrendError};
use trendforge::feedback::FeedbackClassifier;
use trendforge::llm::{CommandModel, LanguageModel};
use trendforge::pipeline::{
    read_documents, JsonlSource, ModelToolSelector, Orchestrator, PipelineState, ReviewChannel,
    TemplateAuthor, ToolBox,
};
use trendforge::retrieval::HybridRetriever;
use trendforge::storage::{StorageManager, StorageStats};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new().map_err(|e| TrendError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })?;

    runtime.block_on(async {
        match cli.command {
            Commands::Ingest { files, no_embed } => {
                let config = load_config(cli.config, cli.profile)?;
                cmd_ingest(&config, &files, no_embed).await
            }
            Commands::Query {
                query,
                limit,
                lambda,
                alpha,
                json,
            } => {
                let mut config = load_config(cli.config, cli.profile)?;
                if let Some(alpha) = alpha {
                    config.retrieval.alpha = alpha;
                }
                if let Some(lambda) = lambda {
                    config.retrieval.lambda = lambda;
                }
                ConfigValidator::validate(&config)?;
                cmd_query(&config, &query, limit, json).await
            }
            Commands::Run {
                topic,
                auto_approve,
                offline,
            } => {
                let config = load_config(cli.config, cli.profile)?;
                cmd_run(&config, &topic, auto_approve, offline).await
            }
            Commands::Rebuild => {
                let config = load_config(cli.config, cli.profile)?;
                cmd_rebuild(&config).await
            }
            Commands::Stats => {
                let config = load_config(cli.config, cli.profile)?;
                cmd_stats(&config)
            }
            Commands::Runs { run_id, limit } => {
                let config = load_config(cli.config, cli.profile)?;
                cmd_runs(&config, run_id, limit)
            }
            Commands::Config { action } => cmd_config(cli.config, cli.profile, action),
        }
    })
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose {
        "trendforge=debug"
    } else {
        "trendforge=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_storage(config: &Config) -> Result<StorageManager> {
    let data_dir = expand_path(&config.storage.data_dir)?;
    StorageManager::new(data_dir, config.storage.compression_threshold)
}

/// Embedding provider, or `None` for lexical-only operation
fn embedding_provider(config: &Config, disabled: bool) -> Option<Arc<dyn EmbeddingProvider>> {
    if disabled || !config.embedding.enabled {
        tracing::info!("Embeddings disabled, running lexical-only");
        return None;
    }

    match FastEmbedProvider::new(&config.embedding.model) {
        Ok(provider) => Some(Arc::new(provider)),
        Err(e) => {
            tracing::warn!("Embedding model unavailable, running lexical-only: {}", e);
            None
        }
    }
}

fn load_corpus(
    config: &Config,
    storage: &StorageManager,
    provider: Option<&Arc<dyn EmbeddingProvider>>,
) -> Result<Corpus> {
    let dimension = provider.map(|p| p.dimension());
    storage
        .load_corpus(&config.retrieval, dimension)
        .map(|(corpus, _)| corpus)
        .inspect_err(|e| {
            if matches!(e, TrendError::DimensionMismatch { .. }) {
                tracing::error!(
                    "Stored vectors do not match the embedding model. Run 'trendforge rebuild'."
                );
            }
        })
}

async fn cmd_ingest(config: &Config, files: &[PathBuf], no_embed: bool) -> Result<()> {
    let storage = open_storage(config)?;

    let mut documents = Vec::new();
    for file in files {
        let path = expand_path(file)?;
        let mut read = read_documents(&path)?;
        tracing::info!("Read {} documents from {}", read.len(), path.display());
        documents.append(&mut read);
    }

    let stored = storage.save_sources(&documents)?;
    tracing::debug!("Recorded {} source documents", stored);

    let provider = embedding_provider(config, no_embed);
    let corpus = RwLock::new(load_corpus(config, &storage, provider.as_ref())?);

    let indexer = BatchIndexer::new(
        provider,
        config.chunking.clone(),
        config.embedding.batch_size,
    );
    let report = indexer.ingest(&corpus, documents).await?;

    let corpus = corpus.into_inner();
    let snapshot = storage.save_corpus(&corpus)?;

    println!("✓ Ingested {} documents", report.documents);
    println!("  Unchanged: {}", report.unchanged);
    println!("  New chunks: {}", report.chunks);
    println!(
        "  Embedded: {} ({} failed)",
        report.embedded, report.failed_embeddings
    );
    println!(
        "  Index: {} documents, {} chunks, {} vectors",
        snapshot.documents, snapshot.chunks, snapshot.vectors
    );
    println!("  Took {} ms", report.duration_ms);

    Ok(())
}

async fn cmd_query(config: &Config, query: &str, limit: Option<usize>, json: bool) -> Result<()> {
    let storage = open_storage(config)?;
    let provider = embedding_provider(config, false);
    let corpus = load_corpus(config, &storage, provider.as_ref())?;

    if corpus.is_empty() {
        println!("Index is empty. Run 'trendforge ingest <files>' first.");
        return Ok(());
    }

    let retriever = HybridRetriever::new(
        Arc::new(RwLock::new(corpus)),
        provider,
        config.retrieval.clone(),
    );
    let k = limit.unwrap_or(config.retrieval.top_k);
    let results = retriever.retrieve(query, k, config.retrieval.lambda).await?;

    if json {
        let text = serde_json::to_string_pretty(&results).map_err(|e| TrendError::Json {
            source: e,
            context: "Failed to serialize results".to_string(),
        })?;
        println!("{}", text);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results for '{}'", query);
        return Ok(());
    }

    println!("Results for '{}':\n", query);
    for (rank, candidate) in results.iter().enumerate() {
        println!(
            "{}. {} [{}] fused {:.3} (lexical {:.3}, vector {:.3})",
            rank + 1,
            candidate.chunk_id,
            candidate.source_doc_id,
            candidate.fused_score,
            candidate.lexical_score,
            candidate.vector_score
        );
        println!("   {}\n", candidate.preview(160).replace('\n', " "));
    }

    Ok(())
}

async fn cmd_run(config: &Config, topic: &str, auto_approve: bool, offline: bool) -> Result<()> {
    let storage = open_storage(config)?;

    let mut toolbox = ToolBox::new(
        Arc::new(TemplateAuthor::new()),
        config.pipeline.results_per_query,
    );
    if let Some(path) = &config.sources.papers_file {
        let source = JsonlSource::load("papers", &expand_path(path)?)?;
        tracing::info!("Loaded {} papers", source.len());
        toolbox = toolbox.with_papers(Arc::new(source));
    }
    if let Some(path) = &config.sources.news_file {
        let source = JsonlSource::load("news", &expand_path(path)?)?;
        tracing::info!("Loaded {} news items", source.len());
        toolbox = toolbox.with_news(Arc::new(source));
    }

    let provider = embedding_provider(config, false);
    let corpus = load_corpus(config, &storage, provider.as_ref())?;
    if !corpus.is_empty() {
        toolbox = toolbox.with_retriever(Arc::new(HybridRetriever::new(
            Arc::new(RwLock::new(corpus)),
            provider,
            config.retrieval.clone(),
        )));
    }

    let model: Option<Arc<dyn LanguageModel>> = if config.llm.enabled && !offline {
        match CommandModel::from_config(&config.llm) {
            Ok(model) => Some(Arc::new(model)),
            Err(e) => {
                tracing::warn!("Language model unavailable, using rules only: {}", e);
                None
            }
        }
    } else {
        None
    };

    let review: Arc<dyn ReviewChannel> = if auto_approve {
        Arc::new(AutoApprove)
    } else {
        Arc::new(StdinReview::new())
    };
    let classifier = FeedbackClassifier::new(
        model.clone(),
        config.feedback.clone(),
        config.llm.max_attempts,
    );

    let mut orchestrator = Orchestrator::new(config, Arc::new(toolbox), review, classifier)?;
    if let Some(model) = model {
        orchestrator = orchestrator
            .with_selector(Arc::new(ModelToolSelector::new(
                Arc::clone(&model),
                config.llm.max_attempts,
            )))
            .with_advisor(model);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let outcome = orchestrator.run(topic, &cancel).await;
    storage.archive_run(&outcome.state)?;
    let report_path = storage.write_report(&outcome.state)?;

    print_run(&outcome.state, report_path.as_deref());
    outcome.into_result().map(|_| ())
}

fn print_run(state: &PipelineState, report_path: Option<&Path>) {
    println!("\nRun {}", state.run_id);
    println!("  Topic: {}", state.topic);
    println!("  Status: {}", state.status().as_str());
    println!(
        "  Evidence: {} papers, {} reference hits, {} news items over {} rounds",
        state.evidence.papers.len(),
        state.evidence.reference_hits.len(),
        state.evidence.news_items.len(),
        state.evidence.attempt_count
    );
    println!("  Revisions: {}", state.revision_count);
    if let Some(note) = &state.completion_note {
        println!("  Note: {:?}", note);
    }
    if let Some(failure) = &state.failure {
        println!(
            "  Failed during {}: {}",
            failure.status.as_str(),
            failure.detail
        );
    }
    if let Some(path) = report_path {
        println!("  Report: {}", path.display());
    }
}

async fn cmd_rebuild(config: &Config) -> Result<()> {
    let storage = open_storage(config)?;
    let documents = storage.load_sources()?;
    let provider = embedding_provider(config, false);

    let dimension = provider.as_ref().map(|p| p.dimension());
    let corpus = RwLock::new(Corpus::from_config(&config.retrieval, dimension));
    let indexer = BatchIndexer::new(
        provider,
        config.chunking.clone(),
        config.embedding.batch_size,
    );
    let report = indexer.ingest(&corpus, documents).await?;
    let snapshot = storage.save_corpus(&corpus.into_inner())?;

    println!("✓ Rebuilt index from {} documents", report.documents);
    println!(
        "  {} chunks, {} postings, {} vectors",
        snapshot.chunks, snapshot.postings, snapshot.vectors
    );
    Ok(())
}

fn cmd_stats(config: &Config) -> Result<()> {
    let storage = open_storage(config)?;
    let stats = storage.stats()?;

    println!("Trendforge Storage");
    println!("==================");
    println!("\nSources: {}", stats.db.source_count);
    println!("Indexed documents: {}", stats.db.document_count);
    println!("Chunks: {}", stats.db.chunk_count);
    println!("Postings: {}", stats.db.posting_count);
    println!("Vectors: {}", stats.db.vector_count);
    println!("Runs: {}", stats.db.run_count);
    println!(
        "\nBlobs: {} ({})",
        stats.db.blob_count,
        StorageStats::format_size(stats.db.total_blob_bytes)
    );
    println!("Store: {}", StorageStats::format_size(stats.store_size));
    println!("Reports: {}", StorageStats::format_size(stats.reports_size));
    println!("Total: {}", StorageStats::format_size(stats.total_size()));
    Ok(())
}

fn cmd_runs(config: &Config, run_id: Option<String>, limit: usize) -> Result<()> {
    let storage = open_storage(config)?;

    if let Some(run_id) = run_id {
        let Some(state) = storage.load_run(&run_id)? else {
            println!("No run with id {}", run_id);
            return Ok(());
        };
        print_run(&state, None);
        for record in state.history() {
            println!(
                "    {} {} -> {}",
                record.at.format("%Y-%m-%d %H:%M:%S"),
                record.from.as_str(),
                record.to.as_str()
            );
        }
        if let Some(report) = &state.draft_report {
            println!("\n{}", report);
        }
        return Ok(());
    }

    let runs = storage.database.list_runs(limit)?;
    if runs.is_empty() {
        println!("No runs yet");
        return Ok(());
    }

    for run in runs {
        let detail = run
            .failure_reason
            .or(run.completion_note)
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        println!(
            "{}  {:<20} {}{}  {}",
            run.run_id, run.status, run.topic, detail, run.updated_at
        );
    }
    Ok(())
}

fn cmd_config(
    config_path: Option<PathBuf>,
    profile: Option<String>,
    action: ConfigAction,
) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, profile)?;
            let value = serde_json::to_value(&config).map_err(|e| TrendError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;

            let shown = match section {
                Some(section) => value.get(&section).cloned().ok_or_else(|| {
                    TrendError::InvalidConfig(format!("Unknown config section: {}", section))
                })?,
                None => value,
            };

            let json = serde_json::to_string_pretty(&shown).map_err(|e| TrendError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;
            println!("{}", json);
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| TrendError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'trendforge config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        ConfigValidator::validate(&config)?;
        return Ok(config);
    }

    if let Some(profile) = profile {
        Config::load_with_profile(&path, &profile)
    } else {
        Config::load(&path)
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| TrendError::InvalidConfig("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            TrendError::InvalidConfig("Cannot determine home directory".to_string())
        })?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}
