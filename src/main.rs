//! # LexHarvest CLI (`lexh`)
//!
//! The `lexh` binary drives the harvesting pipeline: database setup,
//! source registration, batch stage runs, status reconciliation, index
//! rebuilds, search, and the HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! lexh --config ./config/lexharvest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lexh init` | Create the SQLite database and run schema migrations |
//! | `lexh register <url>...` | Register source document URLs |
//! | `lexh batch <stage> --ids 1,2,3` | Run one stage over a batch |
//! | `lexh reconcile` | Compare stored statuses against storage |
//! | `lexh index rebuild` | Rebuild the lexical keyword index |
//! | `lexh search "<query>"` | Search enriched documents |
//! | `lexh status <id>` | Show stored vs reconciled stage statuses |
//! | `lexh delete <id>` | Remove a document and its stored objects |
//! | `lexh stats` | Corpus counters |
//! | `lexh serve` | Start the JSON HTTP API |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};

use lexharvest::analysis::TextAnalysisClient;
use lexharvest::pipeline::{
    self, DocumentAnalyzer, EmbeddingProducer, HttpDownloader, StageProducer, TextExtractor,
};
use lexharvest::search::SearchRequest;
use lexharvest::status::Stage;
use lexharvest::storage::{ExistenceOracle, ObjectStore};
use lexharvest::{collect, config, db, index, migrate, reconcile, search, server, stats, validate};

/// LexHarvest — harvesting and enrichment pipeline for legal documents.
#[derive(Parser)]
#[command(
    name = "lexh",
    about = "LexHarvest — harvesting and enrichment pipeline for legal documents",
    version,
    long_about = "LexHarvest downloads official gazette issues and court decisions, extracts \
    their text, runs structured analysis and embedding stages over them, keeps stage statuses \
    reconciled against object storage, and serves hybrid search over the results."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lexharvest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. This
    /// command is idempotent.
    Init,

    /// Register source document URLs.
    ///
    /// Creates one row per URL with a derived reference. Already-known
    /// URLs are counted but left untouched.
    Register {
        /// Source URLs to register.
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Run one pipeline stage over a batch of documents.
    ///
    /// The batch is validated first: documents with unmet prerequisite
    /// stages reject the whole batch, and documents whose target stage is
    /// already done require `--force` to be redone.
    Batch {
        /// Stage to run: download, extract, analyze, or embed.
        stage: String,

        /// Comma-separated document ids.
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,

        /// Redo documents whose target stage is already complete.
        #[arg(long)]
        force: bool,
    },

    /// Compare stored stage statuses against observable artifacts.
    ///
    /// Prints each divergent status. Without `--apply` this is a dry
    /// run; nothing is written.
    Reconcile {
        /// Maximum number of documents to examine.
        #[arg(long)]
        limit: Option<u64>,

        /// Write the corrected statuses.
        #[arg(long)]
        apply: bool,
    },

    /// Manage the lexical keyword index.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Search enriched documents.
    Search {
        /// Free-text query. One word searches substrings; several words
        /// rank by embedding similarity when the engine is enabled.
        query: Option<String>,

        /// Identifier filter (substring; prefix matches rank first).
        #[arg(long)]
        reference: Option<String>,

        /// Start of publication date range (flexible format).
        #[arg(long)]
        date_from: Option<String>,

        /// End of publication date range (flexible format).
        #[arg(long)]
        date_to: Option<String>,

        /// Index terms that must all match (comma-separated).
        #[arg(long, value_delimiter = ',')]
        keywords_all: Vec<String>,

        /// Index terms of which at least one must match.
        #[arg(long, value_delimiter = ',')]
        keywords_any: Vec<String>,

        /// Index terms that exclude a document.
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,

        /// Minimum similarity score for semantic results.
        #[arg(long)]
        score_threshold: Option<f32>,
    },

    /// Show stored and reconciled stage statuses for one document.
    Status {
        /// Document id.
        id: i64,
    },

    /// Remove a document, its stored objects, and its index postings.
    Delete {
        /// Document id.
        id: i64,
    },

    /// Print corpus counters.
    Stats,

    /// Start the JSON HTTP API server.
    Serve,
}

#[derive(Subcommand)]
enum IndexAction {
    /// Drop and rebuild the keyword index from analyzed metadata.
    Rebuild,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Register { urls } => {
            let pool = db::connect(&cfg.db.path).await?;
            migrate::run_migrations(&pool).await?;
            let summary = collect::register(&pool, &urls).await?;
            println!(
                "Registered {} new document(s), {} already known.",
                summary.inserted, summary.existing
            );
            pool.close().await;
        }
        Commands::Batch { stage, ids, force } => {
            let Some(stage) = Stage::parse(&stage) else {
                bail!("unknown stage: {stage}. Use download, extract, analyze, or embed.");
            };
            if stage == Stage::Collected {
                bail!("collection is not batchable; use `lexh register`");
            }
            let pool = db::connect(&cfg.db.path).await?;
            let store = Arc::new(ObjectStore::from_config(&cfg.storage)?);

            let producer: Box<dyn StageProducer> = match stage {
                Stage::Downloaded => Box::new(HttpDownloader::new(store.clone(), &cfg.harvest)?),
                Stage::Extracted => Box::new(TextExtractor::new(store.clone())),
                Stage::Analyzed => {
                    let client = TextAnalysisClient::new(&cfg.analysis)?;
                    Box::new(DocumentAnalyzer::new(store.clone(), client))
                }
                Stage::Embedded => {
                    Box::new(EmbeddingProducer::new(store.clone(), cfg.embedding.clone())?)
                }
                Stage::Collected => unreachable!(),
            };

            let oracle = ExistenceOracle::new(&*store);
            let outcome =
                pipeline::run_stage(&pool, &oracle, stage, &ids, force, producer.as_ref()).await?;

            if outcome.needs_confirmation {
                println!(
                    "{} document(s) already completed stage '{}': {:?}",
                    outcome.skipped.len(),
                    stage,
                    outcome.skipped
                );
                println!("Re-run with --force to redo them.");
            } else {
                println!(
                    "Stage '{}': {} succeeded, {} failed out of {} attempted.",
                    stage,
                    outcome.success.len(),
                    outcome.failed.len(),
                    outcome.attempted
                );
                for f in &outcome.failed {
                    println!("  document {}: {}", f.id, f.error);
                }
            }
            pool.close().await;
        }
        Commands::Reconcile { limit, apply } => {
            let pool = db::connect(&cfg.db.path).await?;
            let store = Arc::new(ObjectStore::from_config(&cfg.storage)?);
            let oracle = ExistenceOracle::new(&*store);
            let report = reconcile::run(&pool, &oracle, limit, apply).await?;
            println!(
                "Examined {} document(s); {} divergent; {} correction(s) applied.",
                report.processed, report.candidates, report.applied
            );
            pool.close().await;
        }
        Commands::Index { action } => match action {
            IndexAction::Rebuild => {
                let pool = db::connect(&cfg.db.path).await?;
                let postings = index::rebuild(&pool).await?;
                println!("Index rebuilt: {} posting(s).", postings);
                pool.close().await;
            }
        },
        Commands::Search {
            query,
            reference,
            date_from,
            date_to,
            keywords_all,
            keywords_any,
            exclude,
            limit,
            score_threshold,
        } => {
            let pool = db::connect(&cfg.db.path).await?;
            let req = SearchRequest {
                query,
                reference,
                date_from,
                date_to,
                keywords_all,
                keywords_any,
                exclude,
                limit,
                score_threshold,
                ..SearchRequest::default()
            };
            let response = search::run_search(&pool, &cfg.embedding, &cfg.search, &req).await?;
            if let Some(ref error) = response.error {
                eprintln!("note: {error}");
            }
            if response.results.is_empty() {
                println!("No results.");
            }
            for (i, hit) in response.results.iter().enumerate() {
                let title = hit
                    .title
                    .as_deref()
                    .or(hit.title_translated.as_deref())
                    .unwrap_or("(untitled)");
                match hit.score {
                    Some(score) => println!("{}. [{:.2}] {}", i + 1, score, title),
                    None => println!("{}. {}", i + 1, title),
                }
                if let Some(ref reference) = hit.reference {
                    println!("    reference: {}", reference);
                }
                if let Some(ref date) = hit.publication_date {
                    println!("    date: {}", date);
                }
                if let Some(ref subject) = hit.subject {
                    println!("    subject: {}", subject);
                }
                println!("    id: {}", hit.id);
                println!();
            }
            pool.close().await;
        }
        Commands::Status { id } => {
            let pool = db::connect(&cfg.db.path).await?;
            let store = Arc::new(ObjectStore::from_config(&cfg.storage)?);
            let Some(doc) = validate::load_snapshot(&pool, id).await? else {
                bail!("no document with id {id}");
            };
            let oracle = ExistenceOracle::new(&*store);
            println!(
                "document {} ({})",
                doc.id,
                doc.reference.as_deref().unwrap_or("no reference")
            );
            println!("{:<10} {:>12} {:>12}", "stage", "stored", "reconciled");
            for stage in [
                Stage::Collected,
                Stage::Downloaded,
                Stage::Extracted,
                Stage::Analyzed,
                Stage::Embedded,
            ] {
                let stored = doc.status(stage);
                let reconciled = validate::reconciled_status(&oracle, &doc, stage).await;
                println!("{:<10} {:>12} {:>12}", stage.name(), stored, reconciled);
            }
            pool.close().await;
        }
        Commands::Delete { id } => {
            let pool = db::connect(&cfg.db.path).await?;
            let store = ObjectStore::from_config(&cfg.storage)?;
            if pipeline::delete_document(&pool, &store, id).await? {
                println!("Deleted document {}.", id);
            } else {
                println!("No document with id {}.", id);
            }
            pool.close().await;
        }
        Commands::Stats => {
            let pool = db::connect(&cfg.db.path).await?;
            let gathered = stats::gather(&pool).await?;
            stats::print_stats(&gathered);
            pool.close().await;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
