mod article;
mod db;
mod error;
mod parser;
mod pipeline;
mod query;
mod settings;
mod source;
mod store;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, warn};

use crate::pipeline::{RunSummary, EXIT_FATAL, EXIT_OK};
use crate::settings::{OutputFormat, Settings};

#[derive(Parser)]
#[command(name = "wikidump", about = "MediaWiki XML dumps to JSON and SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse dump files under DUMP_ROOT into the output stores
    Run {
        /// Directory (searched recursively) or single .xml/.xml.gz/.xml.bz2 file
        dump_root: PathBuf,
        /// Output directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Which stores to write; the category index is always written
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
        /// Keep only articles in one of these categories (repeatable)
        #[arg(short, long = "category")]
        categories: Vec<String>,
        /// Stop after this many accepted articles
        #[arg(short, long)]
        max: Option<usize>,
        /// TOML settings file (default: ./wikidump.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Article and category counts
    Stats {
        #[arg(long, default_value = db::DB_FILE)]
        db: PathBuf,
    },
    /// Largest categories
    Categories {
        #[arg(long, default_value = db::DB_FILE)]
        db: PathBuf,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Articles whose title or summary contains KEYWORD
    Search {
        keyword: String,
        #[arg(long, default_value = db::DB_FILE)]
        db: PathBuf,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Articles in one category
    Category {
        name: String,
        #[arg(long, default_value = db::DB_FILE)]
        db: PathBuf,
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
    /// Random articles, optionally from one category
    Random {
        #[arg(long, default_value = db::DB_FILE)]
        db: PathBuf,
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
        #[arg(short, long)]
        category: Option<String>,
    },
    /// Full view of one article
    Show {
        title: String,
        #[arg(long, default_value = db::DB_FILE)]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let code = match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            EXIT_FATAL
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }
    ExitCode::from(code)
}

async fn dispatch(command: Commands) -> anyhow::Result<u8> {
    match command {
        Commands::Run {
            dump_root,
            output,
            format,
            categories,
            max,
            config,
        } => {
            let mut settings =
                Settings::load(config.as_deref()).context("loading configuration")?;
            if let Some(dir) = output {
                settings.output_dir = dir;
            }
            if let Some(format) = format {
                settings.format = format;
            }
            if !categories.is_empty() {
                settings.categories = categories;
            }
            if max.is_some() {
                settings.max_articles = max;
            }

            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = Arc::clone(&cancel);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupt received, finishing outputs...");
                        cancel.store(true, Ordering::SeqCst);
                    }
                });
            }

            println!("Reading dumps under {}", dump_root.display());
            let summary = pipeline::run(&dump_root, &settings, cancel).await?;
            print_summary(&summary, &settings);
            Ok(summary.exit_code())
        }
        Commands::Stats { db } => {
            let conn = db::connect(&db)?;
            query::print_stats(&conn)?;
            Ok(EXIT_OK)
        }
        Commands::Categories { db, limit } => {
            let conn = db::connect(&db)?;
            query::print_categories(&conn, limit)?;
            Ok(EXIT_OK)
        }
        Commands::Search { keyword, db, limit } => {
            let conn = db::connect(&db)?;
            query::print_search(&conn, &keyword, limit)?;
            Ok(EXIT_OK)
        }
        Commands::Category { name, db, limit } => {
            let conn = db::connect(&db)?;
            query::print_category(&conn, &name, limit)?;
            Ok(EXIT_OK)
        }
        Commands::Random {
            db,
            count,
            category,
        } => {
            let conn = db::connect(&db)?;
            query::print_random(&conn, count, category.as_deref())?;
            Ok(EXIT_OK)
        }
        Commands::Show { title, db } => {
            let conn = db::connect(&db)?;
            query::print_title(&conn, &title)?;
            Ok(EXIT_OK)
        }
    }
}

fn print_summary(s: &RunSummary, settings: &Settings) {
    println!("Files:    {} read, {} failed", s.files_opened, s.files_failed);
    println!(
        "Records:  {} seen, {} accepted, {} namespace, {} redirect, {} filtered",
        s.records, s.accepted, s.skipped_namespace, s.skipped_redirect, s.filtered
    );
    println!(
        "Errors:   {} file, {} format, {} malformed, {} output",
        s.errors.file_access,
        s.errors.unsupported_format,
        s.errors.malformed_record,
        s.errors.persistence
    );
    if let Some(n) = s.documents_written {
        println!("Wrote {} articles to {}", n, settings.documents_path().display());
    }
    if let Some(n) = s.articles_stored {
        println!("Stored {} articles in {}", n, settings.database_path().display());
    }
    if let Some(n) = s.categories_indexed {
        println!(
            "Indexed {} categories in {}",
            n,
            settings.category_index_path().display()
        );
    }
    for (output, reason) in &s.failed_outputs {
        println!("FAILED {output}: {reason}");
    }
    if s.cap_reached {
        println!("Stopped at the article cap.");
    }
    if s.interrupted {
        println!("Interrupted.");
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
