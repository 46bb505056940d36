mod config;
mod error;
mod models;
mod notify;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AppConfig;
use crate::notify::{Notifier, TelegramNotifier};
use crate::pipeline::Pipeline;
use crate::storage::Repository;

#[derive(Parser)]
#[command(name = "ipo-alert", about = "IPO calendar watcher with Telegram alerts", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single fetch → diff → alert cycle
    Run,

    /// Run a cycle now and then every `schedule.interval_mins`
    Watch,

    /// Show which listings the next cycle would alert on (sends nothing)
    Check,

    /// Mark all current listings as seen without alerting
    Prime,

    /// List every identifier already alerted on
    Seen,

    /// Show database statistics
    Stats,

    /// Send a test message through the configured notifier
    TestNotify {
        #[arg(short, long, default_value = "✅ ipo-alert is configured correctly")]
        message: String,
    },

    /// Apply schema migrations without fetching
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ipo_alert=info,warn",
        1 => "ipo_alert=debug,info",
        _ => "trace",
    };

    let config = AppConfig::load()?;

    let file_layer = match &config.logging.file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(utils::open_log_file(path)?),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match cli.command {
        Command::Run => {
            let _t = utils::Timer::start("Alert cycle");
            let stats = Pipeline::new(config).run().await?;
            info!(
                "Done: {} listings, {} new, {} alerts sent, {} failed",
                stats.fetched, stats.new, stats.notified, stats.notify_failures
            );
        }

        Command::Watch => {
            Pipeline::new(config).watch().await?;
        }

        Command::Check => {
            let diff = Pipeline::new(config).preview().await?;
            println!("{} new, {} already seen", diff.new.len(), diff.known.len());
            for l in &diff.new {
                println!(
                    "  + {:<40} {} → {}",
                    l.identifier,
                    l.opening_date.map(|d| d.to_string()).unwrap_or("—".into()),
                    l.closing_date.map(|d| d.to_string()).unwrap_or("—".into()),
                );
            }
        }

        Command::Prime => {
            let n = Pipeline::new(config).prime().await?;
            println!("{} listings marked as seen.", n);
        }

        Command::Seen => {
            let repo = Repository::open(&config.storage.db_path)?;
            repo.run_migrations()?;
            let records = repo.seen_records()?;
            if records.is_empty() {
                println!("Nothing seen yet — run `ipo-alert prime` or `ipo-alert run` first.");
            } else {
                println!("{} seen listings:", records.len());
                for r in &records {
                    println!("  {}  {}", r.first_seen_at.format("%Y-%m-%d %H:%M"), r.identifier);
                }
            }
        }

        Command::Stats => {
            let repo = Repository::open(&config.storage.db_path)?;
            repo.run_migrations()?;
            let seen = repo.seen_count()?;
            let (first, last) = repo.seen_range().unwrap_or((None, None));
            let cycle = repo.last_cycle()?;
            println!("─────────────────────────────────");
            println!("  IPO Alert — Database Stats");
            println!("─────────────────────────────────");
            println!("  Seen       : {}", utils::fmt_number(seen));
            println!("  First seen : {}", first.map(|d| d.to_string()).unwrap_or("—".into()));
            println!("  Last seen  : {}", last.map(|d| d.to_string()).unwrap_or("—".into()));
            match cycle {
                Some(c) => {
                    println!(
                        "  Last cycle : {} ({}, via {})",
                        c.started_at.format("%Y-%m-%d %H:%M"),
                        c.status,
                        c.strategy.as_deref().unwrap_or("—")
                    );
                    println!("  New/alerts : {}/{}", c.new_listings, c.alerts_sent);
                    if let Some(e) = c.error_msg {
                        println!("  Error      : {}", e);
                    }
                }
                None => println!("  Last cycle : —"),
            }
            println!("─────────────────────────────────");
        }

        Command::TestNotify { message } => {
            TelegramNotifier::from_config(&config.notifier)?
                .send(&message)
                .await?;
            println!("Test message delivered.");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
