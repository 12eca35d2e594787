use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::aggregator::Aggregator;
use gator::config::Config;
use gator::db::Database;
use gator::fetcher::Fetcher;

#[derive(Parser)]
#[command(name = "gator", about = "Aggregate syndicated feeds into a local store")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "gator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// `agg all [workers]` aggregates every known feed; `agg [url]` fetches one
    /// feed (falling back to FEED_URL) and prints it
    Agg {
        target: Option<String>,
        workers: Option<i64>,
    },
    /// Register a feed
    Addfeed { name: String, url: String },
    /// List known feeds
    Feeds,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::load(&cli.config)
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        info!("No config at {}, using defaults", cli.config.display());
        Config::default()
    };
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database_url = url;
    }

    match cli.command {
        Command::Agg { target, workers } if target.as_deref() == Some("all") => {
            aggregate_all(config, workers).await
        }
        Command::Agg { target, .. } => fetch_single(&config, target).await,
        Command::Addfeed { name, url } => {
            let db = open_database(&config).await?;
            let feed = db.add_feed(&name, &url, &config.owner).await?;
            println!("Feed '{}' ({}) added with id {}", feed.name, feed.url, feed.id);
            Ok(())
        }
        Command::Feeds => {
            let db = open_database(&config).await?;
            for feed in db.get_all_feeds().await? {
                let posts = db.get_post_count_for_feed(feed.id).await?;
                println!(
                    "* {} ({}) owned by {}, {} posts",
                    feed.name, feed.url, feed.user_id, posts
                );
            }
            Ok(())
        }
    }
}

async fn open_database(config: &Config) -> anyhow::Result<Database> {
    let db = Database::new(&config.database_url).await?;
    db.initialize().await?;
    db.sync_feeds(&config.feeds, &config.owner).await?;
    info!("Database initialized");
    Ok(db)
}

async fn aggregate_all(mut config: Config, workers: Option<i64>) -> anyhow::Result<()> {
    if let Some(workers) = workers {
        config.workers = workers;
    }

    let db = Arc::new(open_database(&config).await?);
    let feeds = db
        .get_all_feeds()
        .await
        .context("couldn't retrieve feeds")?;

    if feeds.is_empty() {
        println!("No feeds found to aggregate.");
        return Ok(());
    }

    let aggregator = Aggregator::from_config(&config, db.clone())?;
    let deadline = Instant::now() + config.run_timeout();
    let result = aggregator.run(&feeds, deadline).await;

    println!(
        "Finished aggregating {} feeds. Processed ~{} posts ({} new).",
        feeds.len(),
        result.total_posts,
        result.posts_created
    );
    if result.fetch_errors > 0 || result.save_errors > 0 {
        println!(
            "Errors: {} fetch failures, {} save failures",
            result.fetch_errors, result.save_errors
        );
    }
    Ok(())
}

async fn fetch_single(config: &Config, target: Option<String>) -> anyhow::Result<()> {
    let url = target
        .or_else(|| std::env::var("FEED_URL").ok())
        .filter(|url| !url.is_empty())
        .context("FEED_URL environment variable is not set and no URL argument provided")?;

    let fetcher = Fetcher::new(config.fetch_timeout(), &config.user_agent)?;
    let document = fetcher
        .fetch(&url)
        .await
        .context("couldn't fetch feed")?;

    println!("{:#?}", document);
    Ok(())
}
