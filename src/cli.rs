// Command line interface
// One relay cycle per `run`; the other commands inspect or maintain the state DB

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use crate::config::{clamp_listing_limit, default_work_dir, Config, Settings, DEFAULT_SUBREDDITS};
use crate::media::{MediaFetcher, DEFAULT_FFMPEG};
use crate::pipeline::{with_deadline, Relay, RelayError, RunOutcome, TraceWriter};
use crate::proxy::{get_available_proxy, test_proxy, DEFAULT_TEST_URL, PROBE_TIMEOUT};
use crate::reddit::RedditClient;
use crate::state::{clear_all_batches, export_seen_file, get_queue_stats, import_seen_file, init_db};
use crate::twitter::TwitterClient;

/// Relay hot subreddit posts to X
#[derive(Debug, Parser)]
#[command(name = "subrelay")]
#[command(about = "Relay hot subreddit posts to X")]
#[command(version)]
pub struct Cli {
    /// SQLite state database
    #[arg(long, global = true, env = "SUBRELAY_DB", default_value = "seen_posts.db")]
    pub db: PathBuf,

    /// Log file, mirrored to stderr
    #[arg(long, global = true, env = "SUBRELAY_LOG_FILE", default_value = "twitter_bot.log")]
    pub log_file: PathBuf,

    /// Scratch directory for downloaded media [default: user cache dir]
    #[arg(long, global = true, env = "SUBRELAY_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Append a JSONL run trace here
    #[arg(long, global = true, env = "SUBRELAY_TRACE_FILE")]
    pub trace_file: Option<PathBuf>,

    /// Subreddits to relay from, comma separated
    #[arg(long, global = true, env = "SUBRELAY_SUBREDDITS", value_delimiter = ',')]
    pub subreddits: Vec<String>,

    /// Posts requested per listing, clamped to 1-100
    #[arg(long, global = true, env = "SUBRELAY_LISTING_LIMIT", default_value = "50")]
    pub listing_limit: u32,

    /// Failed publishes before a post is given up
    #[arg(long, global = true, env = "SUBRELAY_MAX_ATTEMPTS", default_value = "3")]
    pub max_attempts: u32,

    /// Remaining API calls at which to wait for the window reset
    #[arg(long, global = true, env = "SUBRELAY_RATE_LIMIT_BUFFER", default_value = "10")]
    pub rate_limit_buffer: i64,

    /// Longest rate-limit wait before giving up, in seconds
    #[arg(long, global = true, env = "SUBRELAY_MAX_RATE_LIMIT_WAIT", default_value = "300")]
    pub max_rate_limit_wait_secs: u64,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run one relay cycle
    Run {
        /// Compose the next tweet without posting or consuming the queue
        #[arg(long)]
        dry_run: bool,

        /// Abort the cycle after this many seconds
        #[arg(long, env = "SUBRELAY_TIMEOUT_SECS", default_value = "600")]
        timeout_secs: u64,
    },

    /// Fetch a listing into the queue without posting
    Fetch {
        /// Only this subreddit (default: configured ones in random order)
        #[arg(long)]
        subreddit: Option<String>,
    },

    /// Show queue and history counts
    Stats {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Import or export the flat seen-posts log
    Seen {
        #[command(subcommand)]
        action: SeenCommand,
    },

    /// Drop every queued batch
    ClearBatches,

    /// Probe each configured proxy
    Proxies,

    /// Verify credentials, ffmpeg and the database
    Check,
}

#[derive(Debug, Subcommand)]
pub enum SeenCommand {
    /// Mark every id in FILE as seen
    Import { file: PathBuf },

    /// Write all seen ids to FILE, one per line
    Export { file: PathBuf },
}

impl Cli {
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::new(self.work_dir.clone().unwrap_or_else(default_work_dir));
        let subreddits: Vec<String> = self
            .subreddits
            .iter()
            .map(|s| s.trim().trim_start_matches("r/").to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if !subreddits.is_empty() {
            settings.subreddits = subreddits;
        }
        settings.listing_limit = clamp_listing_limit(self.listing_limit);
        if settings.listing_limit != self.listing_limit {
            log::warn!(
                "Listing limit {} out of range, using {}",
                self.listing_limit,
                settings.listing_limit
            );
        }
        settings.max_pending_attempts = self.max_attempts;
        settings.rate_limit_buffer = self.rate_limit_buffer;
        settings.max_rate_limit_wait = Duration::from_secs(self.max_rate_limit_wait_secs);
        settings
    }
}

pub async fn execute(cli: Cli) -> Result<(), RelayError> {
    let settings = cli.settings();
    settings.validate()?;

    match &cli.command {
        Commands::Run {
            dry_run,
            timeout_secs,
        } => {
            let limit = Duration::from_secs(*timeout_secs);
            with_deadline(limit, relay_cycle(&cli, settings, *dry_run)).await
        }
        Commands::Fetch { subreddit } => fetch(&cli, settings, subreddit.as_deref()).await,
        Commands::Stats { json } => stats(&cli.db, *json),
        Commands::Seen { action } => seen(&cli.db, action),
        Commands::ClearBatches => {
            let db = init_db(&cli.db)?;
            let removed = clear_all_batches(&db)?;
            log::info!("Cleared {} batch(es)", removed);
            println!("Cleared {} batch(es)", removed);
            Ok(())
        }
        Commands::Proxies => proxies().await,
        Commands::Check => check(&cli.db).await,
    }
}

async fn reddit_source(config: &Config) -> Result<RedditClient, RelayError> {
    let proxy = get_available_proxy(&config.proxies, DEFAULT_TEST_URL).await;
    if proxy.is_none() {
        log::warn!("No working proxy, connecting to Reddit directly");
    }
    Ok(RedditClient::new(config.reddit.clone(), proxy.as_ref())?)
}

fn relay_for(
    cli: &Cli,
    settings: Settings,
    source: RedditClient,
    publisher: Option<TwitterClient>,
) -> Result<Relay<RedditClient, TwitterClient>, RelayError> {
    let db = init_db(&cli.db)?;
    let media = MediaFetcher::new(settings.work_dir.clone())?;
    let mut relay = Relay::new(db, source, publisher, media, settings);
    if let Some(path) = &cli.trace_file {
        let writer = TraceWriter::new(path.clone());
        log::info!("Run {} traced to {}", writer.run_id(), path.display());
        relay = relay.with_trace(writer);
    }
    Ok(relay)
}

async fn relay_cycle(cli: &Cli, settings: Settings, dry_run: bool) -> Result<(), RelayError> {
    let config = Config::from_env();

    let publisher = if dry_run {
        None
    } else {
        let credentials = config.require_twitter()?.clone();
        Some(
            TwitterClient::new(credentials)?
                .with_rate_limits(settings.rate_limit_buffer, settings.max_rate_limit_wait),
        )
    };

    let source = reddit_source(&config).await?;
    let relay = relay_for(cli, settings, source, publisher)?;

    let outcome = relay.run_once(dry_run).await?;
    log::info!("{}", outcome);
    if let RunOutcome::DryRun { text, .. } = &outcome {
        println!("{}", text);
    }
    Ok(())
}

async fn fetch(cli: &Cli, settings: Settings, subreddit: Option<&str>) -> Result<(), RelayError> {
    let config = Config::from_env();
    let source = reddit_source(&config).await?;
    let relay = relay_for(cli, settings, source, None)?;

    let batch = match subreddit {
        Some(subreddit) => relay.refill_from(&[subreddit.to_string()]).await?,
        None => relay.refill().await?,
    };
    match batch {
        Some(batch_id) => println!("Stored batch {}", batch_id),
        None => println!("No new posts found"),
    }
    Ok(())
}

fn stats(db_path: &Path, json: bool) -> Result<(), RelayError> {
    let db = init_db(db_path)?;
    let stats = get_queue_stats(&db)?;

    if json {
        let rendered = serde_json::to_string_pretty(&stats).map_err(crate::state::DbError::from)?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("Batches:         {}", stats.batches_count);
    println!("Available posts: {}", stats.available_posts);
    println!("Posted total:    {}", stats.posted_total);
    println!("Pending retries: {}", stats.pending_total);
    for batch in &stats.batches {
        println!(
            "  #{} r/{}: {}/{} remaining (fetched {})",
            batch.batch_id,
            batch.subreddit,
            batch.remaining,
            batch.total,
            batch.fetched_at.to_rfc3339()
        );
    }
    Ok(())
}

fn seen(db_path: &Path, action: &SeenCommand) -> Result<(), RelayError> {
    let db = init_db(db_path)?;
    match action {
        SeenCommand::Import { file } => {
            let added = import_seen_file(&db, file)?;
            println!("Imported {} new id(s) from {}", added, file.display());
        }
        SeenCommand::Export { file } => {
            let written = export_seen_file(&db, file)?;
            println!("Exported {} id(s) to {}", written, file.display());
        }
    }
    Ok(())
}

async fn proxies() -> Result<(), RelayError> {
    let config = Config::from_env();
    if config.proxies.is_empty() {
        println!("No proxies configured");
        return Ok(());
    }

    for proxy in &config.proxies {
        let online = test_proxy(proxy, DEFAULT_TEST_URL, PROBE_TIMEOUT).await;
        println!(
            "{:<8} {:<40} {}",
            proxy.label,
            proxy.redacted_url(),
            if online { "ONLINE" } else { "OFFLINE" }
        );
    }
    Ok(())
}

async fn ffmpeg_version() -> Option<String> {
    let output = Command::new(DEFAULT_FFMPEG).arg("-version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(str::to_string)
}

async fn check(db_path: &Path) -> Result<(), RelayError> {
    let config = Config::from_env();

    match &config.twitter {
        Some(_) => println!("X credentials:      ok"),
        None => println!("X credentials:      missing {}", config.twitter_missing.join(", ")),
    }
    println!(
        "X OAuth2 (unused):  bearer={} client_id={} client_secret={}",
        config.oauth2.bearer_token.is_some(),
        config.oauth2.client_id.is_some(),
        config.oauth2.client_secret.is_some()
    );
    match &config.reddit.credentials {
        Some(creds) => println!("Reddit:             password grant as {}", creds.username),
        None => println!("Reddit:             public listings ({})", config.reddit.user_agent),
    }
    println!("Proxies:            {}", config.proxies.len());
    match ffmpeg_version().await {
        Some(version) => println!("ffmpeg:             {}", version),
        None => println!("ffmpeg:             not found (videos will be posted muted)"),
    }

    let db = init_db(db_path)?;
    let stats = get_queue_stats(&db)?;
    println!(
        "Database:           {} ({} seen, {} pending)",
        db_path.display(),
        stats.posted_total,
        stats.pending_total
    );
    println!("Default subreddits: {}", DEFAULT_SUBREDDITS.join(", "));

    config.require_twitter()?;
    Ok(())
}
