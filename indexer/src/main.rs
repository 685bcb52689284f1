use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use triage_core::{RetrievalConfig, RetrievalService};

mod prepare;

#[derive(Parser)]
#[command(name = "triage-indexer")]
#[command(about = "Prepare ticket datasets and query the retrieval indexes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum QueryKind {
    Similar,
    Recommend,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize raw ticket exports (CSV, JSON or JSONL, file or directory)
    /// into processed_tickets.csv
    Prepare {
        /// Input path (file or directory)
        #[arg(long)]
        input: PathBuf,
        /// Output CSV path
        #[arg(long, default_value = "data/processed_tickets.csv")]
        output: PathBuf,
    },
    /// Run one retrieval against the corpora in a data directory
    Query {
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, value_enum, default_value_t = QueryKind::Similar)]
        kind: QueryKind,
        #[arg(short, default_value_t = 3)]
        k: usize,
        /// Query text
        text: String,
    },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Prepare { input, output } => {
            let rows = prepare::prepare(&input, &output)?;
            println!("Saved {rows} processed tickets to {}", output.display());
            Ok(())
        }
        Commands::Query { data_dir, kind, k, text } => run_query(data_dir, kind, k, &text),
    }
}

fn run_query(data_dir: PathBuf, kind: QueryKind, k: usize, text: &str) -> Result<()> {
    let service = RetrievalService::open(&RetrievalConfig::from_data_dir(&data_dir));
    let out = match kind {
        QueryKind::Similar => {
            serde_json::to_string_pretty(&service.try_find_similar_tickets(text, k)?)?
        }
        QueryKind::Recommend => {
            serde_json::to_string_pretty(&service.try_recommend_articles(text, k)?)?
        }
    };
    println!("{out}");
    Ok(())
}
