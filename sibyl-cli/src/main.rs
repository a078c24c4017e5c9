//! Sibyl CLI: ask questions against a document corpus from the terminal.
//!
//! Wires a retriever, an LLM provider, and a generator into the two-stage
//! pipeline, then prints the progress-event stream as it arrives.

use clap::Parser;
use sibyl_core::{
    AgenticGenerator, AnswerGenerator, ContextGenerator, CorpusSearchTool, InMemoryRetriever,
    KnowledgeSearchTool, Passage, Pipeline, PipelinePhase, PipelineState, RetrievalStage,
    Retriever, SibylConfig, ToolAgent, ToolRegistry, WikipediaClient, create_provider,
    load_config,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Sibyl: retrieval-augmented question answering from your terminal
#[derive(Parser, Debug)]
#[command(name = "sibyl", version, about, long_about = None)]
struct Cli {
    /// Question to answer
    question: String,

    /// Use the tool-calling agent instead of single-shot generation
    #[arg(long)]
    agentic: bool,

    /// Wait for the full answer instead of streaming it
    #[arg(long)]
    blocking: bool,

    /// JSON corpus file ([{"body": "...", "metadata": {"title": "..."}}, ...])
    #[arg(short, long)]
    docs: Option<PathBuf>,

    /// LLM provider ("openai", "mock", ...)
    #[arg(long)]
    provider: Option<String>,

    /// LLM model to use
    #[arg(short, long)]
    model: Option<String>,

    /// Base URL for OpenAI-compatible endpoints (e.g. http://localhost:11434/v1)
    #[arg(long)]
    base_url: Option<String>,

    /// Workspace directory (location of .sibyl/config.toml)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,
}

fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Set up tracing: human-readable stderr plus JSON file logging.
///
/// The returned guard must stay alive for the file writer to flush.
fn init_tracing(verbose: u8, quiet: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(log_filter(verbose, quiet)));

    let log_dir = directories::ProjectDirs::from("dev", "sibyl", "sibyl")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "sibyl.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

fn apply_cli_overrides(config: &mut SibylConfig, cli: &Cli) {
    if let Some(provider) = &cli.provider {
        config.llm.provider = provider.clone();
    }
    if let Some(model) = &cli.model {
        config.llm.model = model.clone();
    }
    if let Some(base_url) = &cli.base_url {
        config.llm.base_url = Some(base_url.clone());
    }
    if cli.agentic {
        config.agent.enabled = true;
    }
}

/// Small built-in corpus so the binary works out of the box.
fn demo_corpus() -> Vec<Passage> {
    vec![
        Passage::new(
            "Rust is a systems programming language that guarantees memory safety \
             without a garbage collector. Ownership and borrowing are checked at \
             compile time.",
        )
        .with_metadata("title", "Rust overview")
        .with_metadata("source", "demo"),
        Passage::new(
            "The borrow checker enforces that every value has a single owner and \
             that references never outlive the data they point to.",
        )
        .with_metadata("title", "Ownership and borrowing")
        .with_metadata("source", "demo"),
        Passage::new(
            "Cargo is Rust's build system and package manager. It downloads \
             dependencies, compiles crates, and runs tests.",
        )
        .with_metadata("title", "Cargo")
        .with_metadata("source", "demo"),
        Passage::new(
            "Async Rust uses futures polled by an executor such as Tokio. \
             Channels and tasks make producer-consumer pipelines cheap.",
        )
        .with_metadata("title", "Async Rust")
        .with_metadata("source", "demo"),
    ]
}

fn build_retriever(
    config: &SibylConfig,
    docs: Option<&Path>,
) -> anyhow::Result<Arc<dyn Retriever>> {
    let retriever = match docs.or(config.retrieval.corpus_path.as_deref()) {
        Some(path) => InMemoryRetriever::from_json_file(path).map_err(|e| {
            anyhow::anyhow!("Failed to load corpus from {}: {}", path.display(), e)
        })?,
        None => {
            tracing::info!("No corpus file configured; using the built-in demo corpus");
            InMemoryRetriever::new(demo_corpus())
        }
    };
    Ok(Arc::new(retriever.with_limit(config.retrieval.limit)))
}

fn build_pipeline(config: &SibylConfig, docs: Option<&Path>) -> anyhow::Result<Pipeline> {
    let retriever = build_retriever(config, docs)?;
    let provider = create_provider(&config.llm)?;
    tracing::debug!(
        model = provider.model_name(),
        agentic = config.agent.enabled,
        "Pipeline assembled"
    );

    let generator: Arc<dyn AnswerGenerator> = if config.agent.enabled {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(CorpusSearchTool::new(Arc::clone(&retriever))));
        tools.register(Arc::new(
            KnowledgeSearchTool::new(Arc::new(WikipediaClient::new()))
                .with_top_results(config.agent.knowledge_results),
        ));
        let agent = ToolAgent::new(provider, tools)
            .with_max_iterations(config.agent.max_iterations)
            .with_temperature(config.llm.temperature)
            .with_max_tokens(config.llm.max_tokens);
        Arc::new(AgenticGenerator::new(Arc::new(agent)))
    } else {
        Arc::new(
            ContextGenerator::new(provider)
                .with_temperature(config.llm.temperature)
                .with_max_tokens(config.llm.max_tokens),
        )
    };

    Ok(Pipeline::new(RetrievalStage::new(retriever), generator))
}

fn print_sources(state: &PipelineState) {
    if state.retrieved_docs.is_empty() {
        return;
    }
    eprintln!();
    eprintln!("  Sources:");
    for (i, doc) in state.retrieved_docs.iter().enumerate() {
        eprintln!("    [{}] {}", i + 1, doc.display_title(i + 1));
    }
}

async fn run_blocking(
    pipeline: &Pipeline,
    question: &str,
    show_progress: bool,
) -> anyhow::Result<()> {
    let state = pipeline.run(question).await?;
    println!("{}", state.answer.as_deref().unwrap_or(""));
    if show_progress {
        print_sources(&state);
    }
    Ok(())
}

async fn run_streaming(
    pipeline: &Pipeline,
    question: &str,
    show_progress: bool,
) -> anyhow::Result<()> {
    let mut stream = pipeline.run_streaming(question);
    let mut printed = String::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = stream.next().await {
        let event = event?;
        match event.phase {
            PipelinePhase::Retrieving => {
                if show_progress && !event.content.is_empty() {
                    eprintln!("  {}", event.content);
                }
            }
            PipelinePhase::Generating => {
                if event.content.is_empty() {
                    continue;
                }
                if let Some(suffix) = event.content.strip_prefix(printed.as_str()) {
                    write!(stdout, "{}", suffix)?;
                } else {
                    // Agent snapshots replace the previous text instead of
                    // extending it; start a fresh line.
                    if !printed.is_empty() {
                        writeln!(stdout)?;
                    }
                    write!(stdout, "{}", event.content)?;
                }
                stdout.flush()?;
                printed = event.content;
            }
            PipelinePhase::Complete => {
                writeln!(stdout)?;
                if show_progress
                    && let Some(state) = &event.state
                {
                    print_sources(state);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.quiet);

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let mut config = load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    apply_cli_overrides(&mut config, &cli);

    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
    if !sibyl_core::config::config_exists(Some(&workspace)) {
        tracing::debug!("No configuration file found; using defaults and environment");
    }

    let pipeline = build_pipeline(&config, cli.docs.as_deref())?;

    let show_progress = !cli.quiet;
    if cli.blocking {
        run_blocking(&pipeline, &cli.question, show_progress).await
    } else {
        run_streaming(&pipeline, &cli.question, show_progress).await
    }
}
