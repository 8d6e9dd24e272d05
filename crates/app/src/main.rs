use anyhow::Context;
use cancer_rag_core::{
    embedder_from_config, Answer, ChatModel, ChatSession, EmbeddingProvider, MemoryKind,
    OpenAiChatModel, RagConfig, RagPipeline, RetrieverHandle, StrategyKind,
};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, info_span, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cancer-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON config file; flags below override its values.
    #[arg(long, env = "CANCER_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the persisted index.
    #[arg(long, env = "CANCER_RAG_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[arg(long, value_enum, env = "CANCER_RAG_EMBEDDING_PROVIDER")]
    embedding_provider: Option<ProviderArg>,

    #[arg(long, env = "CANCER_RAG_EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Base URL of an OpenAI-compatible embeddings server.
    #[arg(long, env = "CANCER_RAG_EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    #[arg(long, env = "CANCER_RAG_EMBEDDING_DIMENSIONS")]
    embedding_dimensions: Option<usize>,

    #[arg(long, env = "CANCER_RAG_LLM_MODEL")]
    llm_model: Option<String>,

    #[arg(long, env = "CANCER_RAG_LLM_ENDPOINT")]
    llm_endpoint: Option<String>,

    /// Number of chunks retrieved per question.
    #[arg(long, env = "CANCER_RAG_TOP_K")]
    top_k: Option<usize>,

    #[arg(long, value_enum, env = "CANCER_RAG_STRATEGY")]
    strategy: Option<StrategyArg>,

    /// Relevance weight for diversity search.
    #[arg(long, env = "CANCER_RAG_LAMBDA")]
    lambda: Option<f32>,

    /// Candidate pool size for diversity search.
    #[arg(long, env = "CANCER_RAG_FETCH_K")]
    fetch_k: Option<usize>,

    #[arg(long, value_enum, env = "CANCER_RAG_MEMORY")]
    memory: Option<MemoryArg>,

    /// Turns kept by window memory.
    #[arg(long, env = "CANCER_RAG_MAX_TURNS")]
    max_turns: Option<usize>,

    /// Also write logs to DIR/running_log_<timestamp>.log.
    #[arg(long, env = "CANCER_RAG_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Extract, chunk and embed a PDF (or folder of PDFs) and persist the index.
    Ingest {
        #[arg(long)]
        pdf: PathBuf,
    },
    /// Answer a single question against the persisted index.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Interactive session; type `exit` to quit.
    Chat,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Local,
    Http,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Similarity,
    Diversity,
}

#[derive(Clone, Copy, ValueEnum)]
enum MemoryArg {
    Buffer,
    Window,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_dir.as_deref())?;

    let config = resolve_config(&cli)?;
    let embedder = embedder_from_config(&config.embedding)?;
    let storage_dir = config.storage_dir.clone();
    let span = info_span!("cancer_rag", storage = %storage_dir.display());
    let pipeline = RagPipeline::new(config, embedder)?.with_span(span);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        started_at = %Local::now().to_rfc3339(),
        "cancer-rag boot"
    );

    match cli.command {
        Command::Ingest { pdf } => {
            let report = pipeline.ingest(&pdf).await?;
            println!(
                "{} chunks from {} pages ({} pdf files) persisted to {}",
                report.chunks,
                report.documents,
                report.sources,
                report.storage_dir.display()
            );
        }
        Command::Ask { question } => {
            let handle = open_handle(&pipeline, &storage_dir)?;
            let mut session = handle.session();
            let answer = handle.answer(&question, &mut session).await?;
            print_answer(&answer);
        }
        Command::Chat => {
            let handle = open_handle(&pipeline, &storage_dir)?;
            chat_loop(&handle).await?;
        }
    }

    Ok(())
}

fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<()> {
    let file_layer = match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("unable to create log dir {}", dir.display()))?;
            let name = format!("running_log_{}.log", Local::now().format("%Y%m%d_%H%M%S"));
            let file = File::create(dir.join(&name))
                .with_context(|| format!("unable to create log file {name}"))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn resolve_config(cli: &Cli) -> anyhow::Result<RagConfig> {
    let mut config = match &cli.config {
        Some(path) => RagConfig::from_json_file(path)?,
        None => RagConfig::default(),
    };

    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(provider) = cli.embedding_provider {
        config.embedding.provider = match provider {
            ProviderArg::Local => EmbeddingProvider::Local,
            ProviderArg::Http => EmbeddingProvider::Http,
        };
    }
    if let Some(model) = &cli.embedding_model {
        config.embedding.model = model.clone();
    }
    if let Some(endpoint) = &cli.embedding_endpoint {
        config.embedding.endpoint = endpoint.clone();
    }
    if let Some(dimensions) = cli.embedding_dimensions {
        config.embedding.dimensions = dimensions;
    }
    if let Some(model) = &cli.llm_model {
        config.llm.model = model.clone();
    }
    if let Some(endpoint) = &cli.llm_endpoint {
        config.llm.endpoint = endpoint.clone();
    }
    if let Some(top_k) = cli.top_k {
        config.retrieval.top_k = top_k;
    }
    if let Some(strategy) = cli.strategy {
        config.retrieval.strategy = match strategy {
            StrategyArg::Similarity => StrategyKind::Similarity,
            StrategyArg::Diversity => StrategyKind::Diversity,
        };
    }
    if let Some(lambda) = cli.lambda {
        config.retrieval.lambda = lambda;
    }
    if let Some(fetch_k) = cli.fetch_k {
        config.retrieval.fetch_k = fetch_k;
    }
    if let Some(memory) = cli.memory {
        config.memory.kind = match memory {
            MemoryArg::Buffer => MemoryKind::Buffer,
            MemoryArg::Window => MemoryKind::Window,
        };
    }
    if let Some(max_turns) = cli.max_turns {
        config.memory.max_turns = max_turns;
    }

    config.validate()?;
    Ok(config)
}

fn open_handle(pipeline: &RagPipeline, storage_dir: &Path) -> anyhow::Result<RetrieverHandle> {
    let llm: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::from_config(&pipeline.config().llm)?);
    let handle = pipeline
        .load(storage_dir, llm)
        .with_context(|| format!("run `cancer-rag ingest` before querying {}", storage_dir.display()))?;
    Ok(handle)
}

async fn chat_loop(handle: &RetrieverHandle) -> anyhow::Result<()> {
    let mut session: ChatSession = handle.session();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Ask about the report (type `exit` to quit).");

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.eq_ignore_ascii_case("exit") {
            break;
        }
        if question.is_empty() {
            continue;
        }

        match handle.answer(question, &mut session).await {
            Ok(answer) => print_answer(&answer),
            Err(error) => {
                warn!(%error, "turn failed");
                println!("error: {error}");
            }
        }
    }

    session.terminate();
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    for (rank, hit) in answer.sources.iter().enumerate() {
        let page = hit
            .chunk
            .page
            .map_or_else(|| "-".to_string(), |page| page.to_string());
        println!(
            "  [{}] page={} score={:.4} chunk={}",
            rank + 1,
            page,
            hit.score,
            hit.chunk.chunk_id
        );
    }
}
