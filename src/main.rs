//! # sitekb - source-grounded question answering over a crawled site
//!
//! Usage:
//!   sitekb index --source ./data/documents
//!   sitekb query "What programmes does AIMS Cameroon offer?"
//!   sitekb full --source ./data/documents --query "When do admissions open?"
//!   sitekb stats
//!   sitekb history --limit 5

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use sitekb_lib::{AppError, DocumentStore, IndexSummary, KnowledgeBase, RetrievalOptions, Settings};

#[derive(Parser)]
#[command(name = "sitekb", version, about = "Source-grounded knowledge base over crawled documents")]
struct Cli {
    /// Settings file (defaults to ./sitekb.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rebuild the vector index from the crawler's output
    Index {
        /// Directory of document JSON records
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Answer a question from the existing index
    Query {
        question: String,
        #[arg(long)]
        k: Option<usize>,
        #[arg(long)]
        min_similarity: Option<f32>,
    },
    /// Index a source directory, then answer a question
    Full {
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long)]
        query: String,
    },
    /// Show index backend, model and record counts
    Stats,
    /// List recently logged answers
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn print_summary(summary: &IndexSummary) {
    println!(
        "Indexed {} chunks: {} documents succeeded, {} skipped, {} failed",
        summary.chunks_indexed, summary.succeeded, summary.skipped, summary.failed
    );
    for failure in &summary.failures {
        println!("  {} : {}", failure.document_id, failure.reason);
    }
}

fn print_answer(answer: &sitekb_lib::Answer) {
    println!("{}", answer.text);
    if !answer.trace.is_empty() {
        println!();
        for t in &answer.trace {
            println!("chunk={} | source={} | score={:.3}", t.chunk_id, t.source_url, t.score);
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let settings = Settings::load(cli.config.as_deref())?;
    let kb = KnowledgeBase::open(settings)?;
    let store_for = |source: Option<PathBuf>| DocumentStore::new(source.unwrap_or_else(|| kb.settings().documents_dir()));

    match cli.command {
        Command::Index { source } => {
            let summary = kb.build_from_store(&store_for(source)).await?;
            print_summary(&summary);
        }
        Command::Query { question, k, min_similarity } => {
            let options = if k.is_some() || min_similarity.is_some() {
                let defaults = RetrievalOptions {
                    k: kb.settings().retrieval_k,
                    min_similarity: kb.settings().retrieval_min_similarity,
                };
                Some(RetrievalOptions {
                    k: k.unwrap_or(defaults.k),
                    min_similarity: min_similarity.unwrap_or(defaults.min_similarity),
                })
            } else {
                None
            };
            let answer = kb.query_with(&question, options).await?;
            print_answer(&answer);
        }
        Command::Full { source, query } => {
            let store = store_for(source);
            let (summary, answer) = kb.full(&store, &query).await?;
            print_summary(&summary);
            println!();
            print_answer(&answer);
        }
        Command::Stats => {
            let stats = kb.stats()?;
            println!("backend:    {}", stats.backend.as_str());
            println!("model:      {} ({})", stats.model_name, stats.model_version);
            println!("dimensions: {}", stats.dimensions);
            println!("records:    {}", stats.records);
            if let Some(n) = stats.answers_logged {
                println!("answers:    {n}");
            }
        }
        Command::History { limit } => {
            for answer in kb.recent_answers(limit)? {
                let status = if answer.grounded { "grounded" } else { "not grounded" };
                println!("{} [{status}] {}", answer.timestamp.to_rfc3339(), answer.query);
                println!("  {}", answer.text);
                for url in &answer.citations {
                    println!("  - {url}");
                }
            }
        }
    }

    kb.close()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "sitekb=debug,sitekb_lib=debug" } else { "sitekb=info,sitekb_lib=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await.context("sitekb failed") {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.downcast_ref::<AppError>().map(AppError::exit_code).unwrap_or(1);
            tracing::error!("{err:#}");
            ExitCode::from(code)
        }
    }
}
