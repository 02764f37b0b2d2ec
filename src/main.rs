//! CLI entry point for the GTFS-RT schedule matcher.
//!
//! Provides subcommands for reconciling a single snapshot, polling a live
//! feed, and sweeping stored stop-time updates.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gtfs_rt_matcher::{
    config::MatcherConfig,
    fetch::{BasicClient, HttpClient, auth::ApiKey, fetch_bytes},
    gtfs_rt::FeedMessage,
    metrics::MetricsRegistry,
    output::{append_record, print_json, write_feed},
    parser::parse_feed,
    reconcile::Reconciler,
    restore::StopTimeUpdateHistory,
    store::{
        MemoryScheduleStore, MemoryStopTimeUpdateStore, PgScheduleStore, PgStopTimeUpdateStore,
        ScheduleStore, StopTimeUpdateStore, connect_pool,
    },
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_matcher")]
#[command(about = "Reconciles GTFS-RT feeds against a GTFS schedule", long_about = None)]
struct Cli {
    /// Schedule feed digest, overrides SCHEDULE_FEED_DIGEST
    #[arg(long, global = true)]
    schedule_digest: Option<String>,

    /// CSV export of scheduled stop-times, used instead of the database
    #[arg(long, global = true)]
    schedule_csv: Option<String>,

    /// PostgreSQL URL, overrides DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// File to write the metrics exposition to after each snapshot
    #[arg(long, global = true)]
    metrics: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile one GTFS-RT snapshot from a file or URL
    Match {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,

        /// Where to write the corrected feed
        #[arg(short, long, default_value = "corrected.pb")]
        output: String,

        /// CSV file to append stats to
        #[arg(short, long, default_value = "data.csv")]
        stats: String,
    },
    /// Poll a GTFS-RT feed and reconcile every snapshot
    Poll {
        #[arg(value_name = "URL")]
        url: String,

        /// Where to write the latest corrected feed
        #[arg(short, long, default_value = "corrected.pb")]
        output: String,

        /// Optional CSV file to append stats to
        #[arg(short, long)]
        stats: Option<String>,

        /// Poll every X seconds
        #[arg(short = 'r', long, default_value_t = 30)]
        interval: u64,
    },
    /// Delete stored StopTimeUpdates older than the retention horizon
    CleanStopTimeUpdates,
}

struct Stores {
    schedule: Arc<dyn ScheduleStore>,
    stop_time_updates: Arc<dyn StopTimeUpdateStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_matcher.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_matcher.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = MatcherConfig::from_env(cli.schedule_digest.clone())?;
    info!(
        schedule_digest = %config.digest_label(),
        match_concurrency = config.match_concurrency,
        "Loaded configuration"
    );
    let database_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());
    let metrics = Arc::new(MetricsRegistry::new());

    match cli.command {
        Commands::Match {
            ref source,
            ref output,
            ref stats,
        } => {
            let stores = open_stores(
                &config,
                cli.schedule_csv.as_deref(),
                database_url.as_deref(),
            )
            .await?;
            let reconciler = Reconciler::new(
                &config,
                stores.schedule,
                stores.stop_time_updates,
                metrics.clone(),
            );

            let bytes = fetcher(source).await?;
            let feed = parse_feed(&bytes)?;
            let reconciled = reconciler.reconcile(feed, Utc::now().timestamp()).await;

            write_feed(output, &reconciled.feed)?;
            append_record(stats, &reconciled.stats)?;
            print_json(&reconciled.stats)?;
            write_metrics(cli.metrics.as_deref(), &metrics);
        }
        Commands::Poll {
            ref url,
            ref output,
            ref stats,
            interval,
        } => {
            let stores = open_stores(
                &config,
                cli.schedule_csv.as_deref(),
                database_url.as_deref(),
            )
            .await?;
            let reconciler = Arc::new(Reconciler::new(
                &config,
                stores.schedule,
                stores.stop_time_updates,
                metrics.clone(),
            ));
            let cleanup = reconciler
                .history()
                .spawn_cleanup(config.stop_time_updates_clean_interval);

            let (feed_tx, feed_rx) = mpsc::channel(1);
            let (out_tx, mut out_rx) = mpsc::channel(1);
            let producer = tokio::spawn(poll_feed(
                http_client()?,
                url.clone(),
                Duration::from_secs(interval),
                feed_tx,
            ));
            let consumer = tokio::spawn(reconciler.run(feed_rx, out_tx));

            loop {
                tokio::select! {
                    reconciled = out_rx.recv() => {
                        let Some(reconciled) = reconciled else { break };
                        if let Err(e) = write_feed(output, &reconciled.feed) {
                            error!(error = %e, "Failed to write corrected feed");
                        }
                        if let Some(stats) = stats {
                            if let Err(e) = append_record(stats, &reconciled.stats) {
                                error!(error = %e, "Failed to append stats");
                            }
                        }
                        write_metrics(cli.metrics.as_deref(), &metrics);
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                        break;
                    }
                }
            }

            producer.abort();
            drop(out_rx);
            join_task("reconcile consumer", consumer).await;
            cleanup.stop().await;
        }
        Commands::CleanStopTimeUpdates => {
            let Some(database_url) = database_url.as_deref() else {
                bail!("DATABASE_URL must be set to clean stored StopTimeUpdates");
            };
            let pool = connect_pool(database_url, config.pg_pool_size).await?;
            let store = PgStopTimeUpdateStore::new(pool, &config.schedule_db_schema)?;
            store.ensure_table().await?;

            let history = StopTimeUpdateHistory::new(
                Arc::new(store),
                metrics.clone(),
                config.digest_label(),
                config.stop_time_updates_max_age,
            );
            let deleted = history.clean(Utc::now().timestamp()).await?;
            info!(deleted, "Finished cleaning StopTimeUpdates");
            write_metrics(cli.metrics.as_deref(), &metrics);
        }
    }

    Ok(())
}

/// Builds the schedule and stop-time update stores from the CLI options.
///
/// A schedule CSV is loaded into memory; stop-time updates then live in the
/// database when one is configured and in memory otherwise.
#[tracing::instrument(skip_all)]
async fn open_stores(
    config: &MatcherConfig,
    schedule_csv: Option<&str>,
    database_url: Option<&str>,
) -> Result<Stores> {
    let pool = match database_url {
        Some(url) => Some(connect_pool(url, config.pg_pool_size).await?),
        None => None,
    };

    let schedule: Arc<dyn ScheduleStore> = match (schedule_csv, &pool) {
        (Some(path), _) => {
            let store = MemoryScheduleStore::from_csv(path)
                .with_context(|| format!("loading schedule from {path}"))?;
            info!(path, stop_times = store.len(), "Loaded schedule CSV");
            Arc::new(store)
        }
        (None, Some(pool)) => Arc::new(PgScheduleStore::new(
            pool.clone(),
            &config.schedule_db_schema,
        )?),
        (None, None) => bail!("either --schedule-csv or DATABASE_URL must be set"),
    };

    let stop_time_updates: Arc<dyn StopTimeUpdateStore> = match pool {
        Some(pool) => {
            let store = PgStopTimeUpdateStore::new(pool, &config.schedule_db_schema)?;
            store.ensure_table().await?;
            Arc::new(store)
        }
        None => {
            warn!("No database configured, StopTimeUpdates are only kept in memory");
            Arc::new(MemoryStopTimeUpdateStore::new())
        }
    };

    Ok(Stores {
        schedule,
        stop_time_updates,
    })
}

#[derive(Debug, PartialEq)]
enum Credential {
    ApiKey(String),
    Bearer(String),
}

/// `API_KEY` wins over `BEARER_TOKEN`; empty values count as unset.
fn credential<F>(lookup: F) -> Option<Credential>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
    non_empty("API_KEY")
        .map(Credential::ApiKey)
        .or_else(|| non_empty("BEARER_TOKEN").map(Credential::Bearer))
}

/// `BasicClient`, wrapped with an `x-api-key` header when `API_KEY` is set
/// or an `Authorization: Bearer` header when `BEARER_TOKEN` is set.
fn http_client() -> Result<Arc<dyn HttpClient>> {
    let basic = BasicClient::new()?;
    Ok(match credential(|name| std::env::var(name).ok()) {
        Some(Credential::ApiKey(key)) => Arc::new(ApiKey::x_api_key(basic, &key)?),
        Some(Credential::Bearer(token)) => Arc::new(ApiKey::bearer(basic, &token)?),
        None => Arc::new(basic),
    })
}

/// Waits for a background task, logging a panic or cancellation.
async fn join_task(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(task = name, error = %e, "Background task failed");
            false
        }
    }
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %url))]
async fn fetcher(url: &str) -> Result<Vec<u8>> {
    let bytes = if url.starts_with("http") {
        let client = http_client()?;
        fetch_bytes(client.as_ref(), url).await?
    } else {
        std::fs::read(url).with_context(|| format!("reading {url}"))?
    };
    Ok(bytes)
}

/// Fetches and decodes the feed every `every`, pushing snapshots into `tx`
/// until the receiver goes away. Failed fetches are logged and skipped.
#[tracing::instrument(skip(client, tx), fields(url = %url))]
async fn poll_feed(
    client: Arc<dyn HttpClient>,
    url: String,
    every: Duration,
    tx: mpsc::Sender<FeedMessage>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let fetch_start = std::time::Instant::now();
        let feed = match fetch_bytes(client.as_ref(), &url).await {
            Ok(bytes) => parse_feed(&bytes),
            Err(e) => Err(e),
        };
        match feed {
            Ok(feed) => {
                debug!(
                    entity_count = feed.entity.len(),
                    elapsed_ms = fetch_start.elapsed().as_millis() as u64,
                    "Feed fetched"
                );
                if tx.send(feed).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Feed fetch failed"),
        }
    }
}

fn write_metrics(path: Option<&str>, metrics: &MetricsRegistry) {
    let Some(path) = path else {
        return;
    };
    if let Err(e) = std::fs::write(path, metrics.render()) {
        error!(path, error = %e, "Failed to write metrics");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_credential_selection() {
        assert_eq!(credential(lookup(&[])), None);
        assert_eq!(
            credential(lookup(&[("BEARER_TOKEN", "token")])),
            Some(Credential::Bearer("token".to_string()))
        );
        assert_eq!(
            credential(lookup(&[("API_KEY", "key"), ("BEARER_TOKEN", "token")])),
            Some(Credential::ApiKey("key".to_string()))
        );
        assert_eq!(
            credential(lookup(&[("API_KEY", ""), ("BEARER_TOKEN", "token")])),
            Some(Credential::Bearer("token".to_string()))
        );
    }

    #[tokio::test]
    async fn test_join_task_reports_panic() {
        assert!(join_task("ok", tokio::spawn(async {})).await);
        async fn dies() {
            panic!("consumer died")
        }
        assert!(!join_task("consumer", tokio::spawn(dies())).await);
    }
}
