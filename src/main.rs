use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fomc_rag::assistant::{Assistant, DEFAULT_INSTRUCTION, DEFAULT_TEMPERATURE};
use fomc_rag::config::{API_KEY_VAR, AppConfig};
use fomc_rag::error::{AnswerError, RagError, Stage};
use fomc_rag::llm::CompletionClient;
use fomc_rag::retriever::Retriever;
use fomc_rag::{fomc, utils};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fomc-rag", version, about = "Ask questions about FOMC meetings")]
struct Cli {
    /// Snapshot directory (overrides configuration)
    #[arg(long, global = true)]
    snapshot_dir: Option<PathBuf>,

    /// Key for the completion and embedding service
    #[arg(long, global = true, env = API_KEY_VAR, hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Split documents into paragraphs and add them to the index
    Store {
        /// Text files or directories of .txt files; reads stdin when empty
        files: Vec<PathBuf>,
    },
    /// Show the paragraphs closest to a query
    Query {
        text: String,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Answer a single question
    Ask {
        question: String,
        #[arg(long, default_value = DEFAULT_INSTRUCTION)]
        instruction: String,
        #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
        temperature: f32,
    },
    /// Answer questions interactively until EOF
    Chat {
        #[arg(long, default_value = DEFAULT_INSTRUCTION)]
        instruction: String,
        #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
        temperature: f32,
    },
    /// Print minutes URLs for meeting dates such as "September 20, 2023"
    MinutesUrls { dates: Vec<String> },
    /// Classify documents as hawkish, dovish or neutral by keyword counts
    Sentiment {
        /// Text files or directories of .txt files; reads stdin when empty
        files: Vec<PathBuf>,
    },
    /// Report the size of the stored snapshot
    Stats,
    /// Print the effective configuration
    Config,
}

fn read_documents(files: &[PathBuf]) -> Result<Vec<String>> {
    if files.is_empty() {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).context("failed to read stdin")?;
        return Ok(vec![text]);
    }

    let mut documents = Vec::new();
    for path in files {
        if path.is_dir() {
            documents.extend(
                utils::load_text_files(path).with_context(|| format!("failed to read {}", path.display()))?,
            );
        } else {
            documents
                .push(std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?);
        }
    }
    Ok(documents)
}

fn open_retriever(config: &AppConfig, api_key: Option<&str>) -> Result<Retriever> {
    let embedder = config.build_embedder(api_key)?;
    Retriever::open(&config.snapshot_dir, embedder)
        .with_context(|| format!("failed to open snapshot at {}", config.snapshot_dir.display()))
}

fn build_assistant(config: &AppConfig, api_key: Option<&str>) -> Result<Assistant> {
    let retriever = open_retriever(config, api_key)?;
    let key = api_key.with_context(|| format!("an API key is required; pass --api-key or set {API_KEY_VAR}"))?;
    let client = CompletionClient::new(config.completion.clone(), key)?;
    Ok(Assistant::new(Arc::new(retriever), Arc::new(client), config.answer_settings()))
}

fn report(err: &AnswerError) {
    tracing::error!(stage = %err.stage, error = %err.source, "question failed");
    eprintln!("{}", err.user_message());
}

fn report_query_error(err: RagError) -> anyhow::Error {
    let err = AnswerError::new(Stage::Retrieval, err);
    anyhow::anyhow!(err.user_message())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fomc_rag=info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load().context("failed to load configuration")?;
    if let Some(dir) = cli.snapshot_dir {
        config.snapshot_dir = dir;
    }
    let api_key = cli.api_key.as_deref();

    match cli.command {
        Command::Store { files } => {
            let documents = read_documents(&files)?;
            let paragraphs: Vec<String> = documents
                .iter()
                .flat_map(|doc| utils::split_into_paragraphs(doc, config.paragraph_max_chars))
                .collect();
            if paragraphs.is_empty() {
                println!("Nothing to store.");
                return Ok(());
            }

            let retriever = open_retriever(&config, api_key)?;
            let stored = retriever.store(paragraphs).await?;
            retriever.close();
            println!("Stored {stored} paragraphs.");
        }
        Command::Query { text, top_k } => {
            let retriever = open_retriever(&config, api_key)?;
            let results = retriever
                .query(&text, top_k.unwrap_or(config.top_k))
                .await
                .map_err(report_query_error)?;
            for result in results {
                println!("{:.4}  {}", result.distance, result.text);
            }
        }
        Command::Ask {
            question,
            instruction,
            temperature,
        } => {
            let assistant = build_assistant(&config, api_key)?;
            match assistant.answer(&question, &instruction, temperature).await {
                Ok(answer) => println!("{answer}"),
                Err(e) => {
                    report(&e);
                    std::process::exit(1);
                }
            }
        }
        Command::Chat {
            instruction,
            temperature,
        } => {
            let assistant = build_assistant(&config, api_key)?;
            println!("Ask about FOMC meetings (Ctrl+D to exit)");

            loop {
                let mut question = String::new();
                print!("> ");
                io::stdout().flush()?;

                if io::stdin().read_line(&mut question)? == 0 {
                    break;
                }

                let question = question.trim();
                if question.is_empty() {
                    continue;
                }

                print!("\nThinking...");
                io::stdout().flush()?;
                match assistant.answer(question, &instruction, temperature).await {
                    Ok(answer) => println!("\r{answer}\n"),
                    Err(e) => {
                        print!("\r");
                        report(&e);
                    }
                }
            }
        }
        Command::MinutesUrls { dates } => {
            let dates = dates
                .iter()
                .map(|d| fomc::parse_meeting_date(d))
                .collect::<Result<Vec<_>, _>>()?;
            for url in fomc::minutes_urls(&dates) {
                println!("{url}");
            }
        }
        Command::Sentiment { files } => {
            let sources: Vec<Option<&PathBuf>> = if files.is_empty() {
                vec![None]
            } else {
                files.iter().map(Some).collect()
            };
            for source in sources {
                let text = read_documents(source.map(std::slice::from_ref).unwrap_or_default())?.join("\n");
                let (tone, hawkish, dovish) = fomc::classify_sentiment(&text);
                let label = source.map_or_else(|| "-".to_string(), |p| p.display().to_string());
                println!("{label}: {tone} (hawkish={hawkish}, dovish={dovish})");
            }
        }
        Command::Stats => {
            let retriever = open_retriever(&config, api_key)?;
            match retriever.stats().await {
                Ok(stats) => println!("entries={} dimension={}", stats.entries, stats.dimension),
                Err(RagError::SnapshotNotFound(_)) => println!("entries=0 (no snapshot yet)"),
                Err(e) => return Err(e.into()),
            }
        }
        Command::Config => config.print_config(),
    }

    Ok(())
}
