use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clickrank_core::{Document, RankingEngine, RetrainOutcome, SharedEngine, Store};
use tracing_subscriber::{fmt, EnvFilter};
use walkdir::WalkDir;

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "clickrank-indexer")]
#[command(about = "Load documents, record feedback and manage the ranking store", long_about = None)]
struct Cli {
    /// Store snapshot path
    #[arg(long, global = true, default_value = "./cache.bin")]
    store: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a fresh model from input JSON/JSONL files or a directory
    Build {
        /// Input path (file or directory)
        #[arg(long)]
        input: PathBuf,
    },
    /// Add documents to the stored model
    Append {
        #[arg(long)]
        input: PathBuf,
    },
    /// Remove one document by url
    Remove {
        #[arg(long)]
        url: String,
    },
    /// Record a click (or skip) for a query
    Feedback {
        #[arg(long)]
        query: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        clicked: bool,
    },
    /// Refit the re-ranker from all recorded feedback
    Retrain,
    /// Rank the stored documents for a query
    Search {
        #[arg(long)]
        query: String,
        /// Only documents carrying at least one of these tags (comma-separated)
        #[arg(long, value_delimiter = ',')]
        filter: Vec<String>,
    },
    /// Show or change server settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Drop the model and restore default settings
    Wipe,
}

#[derive(Subcommand)]
enum SettingsAction {
    List,
    Set { name: String, value: String },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    let store = Store::load(&cli.store);
    run(&store, cli.command)?;
    store.close().context("saving store")?;
    Ok(())
}

fn run(store: &Store, command: Commands) -> Result<()> {
    match command {
        Commands::Build { input } => {
            let docs = load_documents(&input)?;
            let engine = RankingEngine::new(docs)?;
            tracing::info!(num_docs = engine.len(), "model built");
            store.install_engine(engine)?;
        }
        Commands::Append { input } => {
            let docs = load_documents(&input)?;
            let added = docs.len();
            let shared = stored_engine(store)?;
            let mut engine = shared.write();
            engine.append_documents(docs)?;
            println!("added {added}, {} documents indexed", engine.len());
        }
        Commands::Remove { url } => {
            let removed = stored_engine(store)?.write().remove_document(&url)?;
            println!("removed {} ({})", removed.url, removed.title);
        }
        Commands::Feedback { query, url, clicked } => {
            stored_engine(store)?.write().absorb_feedback(&query, &url, clicked)?;
        }
        Commands::Retrain => match stored_engine(store)?.write().retrain()? {
            RetrainOutcome::NothingToTrain => println!("no feedback recorded"),
            RetrainOutcome::Trained { samples, skipped } => println!("trained on {samples} samples ({skipped} skipped)"),
        },
        Commands::Search { query, filter } => {
            let filter: BTreeSet<String> = filter.into_iter().filter(|f| !f.trim().is_empty()).collect();
            let results = stored_engine(store)?.read().rank(&query, Some(&filter))?;
            for r in results {
                println!("{:.4}\t{}\t{}", r.relevance, r.url, r.title);
            }
        }
        Commands::Settings { action: SettingsAction::List } => {
            for entry in store.settings().entries() {
                println!("{}\t{:?}\t{}", entry.name, entry.kind, entry.raw_value());
            }
        }
        Commands::Settings { action: SettingsAction::Set { name, value } } => {
            store.update_setting(&name, &value)?;
        }
        Commands::Wipe => store.wipe(),
    }
    Ok(())
}

fn stored_engine(store: &Store) -> Result<SharedEngine> {
    match store.engine() {
        Some(engine) => Ok(engine),
        None => bail!("no model in {}, run `build` first", store.path().display()),
    }
}

/// Reads every `.json` / `.jsonl` file under `input` (or `input` itself) in path order.
fn load_documents(input: &Path) -> Result<Vec<Document>> {
    let mut files: Vec<PathBuf> = Vec::new();
    if input.is_dir() {
        for entry in WalkDir::new(input).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_file() && matches!(extension(p), Some("json" | "jsonl")) {
                files.push(p.to_path_buf());
            }
        }
    } else if input.is_file() {
        files.push(input.to_path_buf());
    } else {
        bail!("input {} does not exist", input.display());
    }

    let mut docs = Vec::new();
    for file in files {
        let before = docs.len();
        if extension(&file) == Some("jsonl") {
            read_jsonl(&file, &mut docs)?;
        } else {
            read_json(&file, &mut docs)?;
        }
        tracing::debug!(file = %file.display(), count = docs.len() - before, "read documents");
    }
    tracing::info!(num_docs = docs.len(), "ingested documents");
    Ok(docs)
}

fn extension(p: &Path) -> Option<&str> {
    p.extension().and_then(|s| s.to_str())
}

fn read_jsonl(file: &Path, docs: &mut Vec<Document>) -> Result<()> {
    let reader = BufReader::new(File::open(file)?);
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document =
            serde_json::from_str(&line).with_context(|| format!("{}:{}", file.display(), n + 1))?;
        docs.push(doc);
    }
    Ok(())
}

fn read_json(file: &Path, docs: &mut Vec<Document>) -> Result<()> {
    let reader = BufReader::new(File::open(file)?);
    let json: serde_json::Value = serde_json::from_reader(reader).with_context(|| file.display().to_string())?;
    match json {
        serde_json::Value::Array(arr) => {
            for v in arr {
                docs.push(serde_json::from_value(v).with_context(|| file.display().to_string())?);
            }
        }
        serde_json::Value::Object(_) => docs.push(serde_json::from_value(json)?),
        _ => tracing::warn!(file = %file.display(), "not a document or list of documents, skipped"),
    }
    Ok(())
}
