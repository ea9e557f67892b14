use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use foundation::geo::features_from_rows;
use layers::{HeadlessTarget, LayerSpec, SyncConfig, SyncState, Synchronizer};
use runtime::LocalScheduler;
use streaming::{
    Aggregation, AuthScheme, DatasetFetcher, FetchOptions, FetcherConfig, ReqwestTransport,
};
use tools::{OverlaySummary, QueryArgs, dataset_rows, load_registry};
use tracing::info;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(author, version, about = "Query, cache and overlay open data feeds")]
struct Args {
    /// Data service base URL (default: SF Open Data)
    #[arg(long, env = "DATADIVER_BASE_URL")]
    base_url: Option<String>,

    /// JSON registry document to use instead of the built-in datasets
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Application token (falls back to DATADIVER_APP_TOKEN / SOCRATA_APP_TOKEN)
    #[arg(long)]
    app_token: Option<String>,

    /// Send the token as `Authorization: Bearer` instead of `X-App-Token`
    #[arg(long)]
    bearer: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered datasets
    Datasets,

    /// Fetch one page of rows
    Fetch {
        dataset: String,

        #[command(flatten)]
        query: QueryArgs,

        /// Bypass the cache
        #[arg(long)]
        fresh: bool,
    },

    /// Fetch every page up to a record ceiling
    Pages {
        dataset: String,

        #[command(flatten)]
        query: QueryArgs,

        /// Stop after this many rows
        #[arg(long, default_value_t = 50_000)]
        max_records: usize,

        /// Print the rows, not just the count
        #[arg(long)]
        rows: bool,
    },

    /// Grouped count (or other aggregate) query
    Aggregate {
        dataset: String,

        /// Aggregate `$select`, e.g. "battalion, count(*) AS count"
        #[arg(long)]
        select: String,

        /// `$group` clause
        #[arg(long)]
        group: String,

        /// `$where` clause
        #[arg(long = "where")]
        filter: Option<String>,

        /// `$order` clause (default: count(*) DESC)
        #[arg(long)]
        order: Option<String>,

        #[arg(long)]
        limit: Option<u32>,
    },

    /// Fetch rows, convert them to features and synchronize them into a
    /// headless render target whose style loads after a delay
    Overlay {
        dataset: String,

        #[command(flatten)]
        query: QueryArgs,

        /// Simulated style load time
        #[arg(long, default_value_t = 300)]
        style_delay_ms: u64,

        /// Give up waiting for the overlay after this long
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let registry = load_registry(args.registry.as_deref(), args.base_url.as_deref())?;

    let mut config = FetcherConfig::from_env();
    if let Some(token) = args.app_token {
        config = config.with_app_token(token);
    }
    if args.bearer {
        config = config.with_auth_scheme(AuthScheme::Bearer);
    }

    let transport = ReqwestTransport::new(&config.user_agent)?;
    let fetcher = DatasetFetcher::new(Arc::new(registry), Arc::new(transport), config);

    match args.command {
        Command::Datasets => {
            for row in dataset_rows(fetcher.registry(), fetcher.config().default_ttl) {
                println!(
                    "{}\t{}\t{}\tttl={}s\tgeo={}",
                    row.key, row.id, row.name, row.ttl_secs, row.geo
                );
            }
        }
        Command::Fetch {
            dataset,
            query,
            fresh,
        } => {
            let options = FetchOptions { skip_cache: fresh };
            let rows = fetcher.fetch(&dataset, &query.to_query(), options).await?;
            print_json(rows.as_slice())?;
        }
        Command::Pages {
            dataset,
            query,
            max_records,
            rows,
        } => {
            let all = fetcher
                .fetch_all_pages(&dataset, &query.to_query(), max_records)
                .await?;
            if rows {
                print_json(&all)?;
            } else {
                println!("{} rows", all.len());
            }
        }
        Command::Aggregate {
            dataset,
            select,
            group,
            filter,
            order,
            limit,
        } => {
            let aggregation = Aggregation {
                select: &select,
                group: &group,
                filter: filter.as_deref(),
                order: order.as_deref(),
                limit,
            };
            let rows = fetcher.fetch_aggregation(&dataset, aggregation).await?;
            print_json(rows.as_slice())?;
        }
        Command::Overlay {
            dataset,
            query,
            style_delay_ms,
            timeout_ms,
        } => {
            let local = tokio::task::LocalSet::new();
            let summary = local
                .run_until(run_overlay(
                    &fetcher,
                    &dataset,
                    &query,
                    Duration::from_millis(style_delay_ms),
                    Duration::from_millis(timeout_ms),
                ))
                .await?;
            print_json(&summary)?;
        }
    }

    Ok(())
}

async fn run_overlay(
    fetcher: &DatasetFetcher,
    dataset: &str,
    query: &QueryArgs,
    style_delay: Duration,
    timeout: Duration,
) -> CliResult<OverlaySummary> {
    let descriptor = fetcher.registry().get(dataset).ok_or_else(|| {
        streaming::FetchError::UnknownDataset(dataset.to_string())
    })?;
    let geo = descriptor
        .geo
        .clone()
        .ok_or_else(|| format!("{dataset} has no location field"))?;

    let rows = fetcher
        .fetch(dataset, &query.to_query(), FetchOptions::default())
        .await?;
    let features = features_from_rows(&rows, &geo);
    let mut summary = OverlaySummary::new(dataset, rows.len(), &features);
    info!(dataset, features = features.len(), "converted rows");

    let scheduler = Rc::new(LocalScheduler::new());
    let target = Rc::new(HeadlessTarget::new());
    let sync = Synchronizer::with_target(scheduler.clone(), SyncConfig::default(), target.clone());
    let layers = vec![
        LayerSpec::heatmap(format!("{dataset}-heat")).zoom_range(0.0, 15.0),
        LayerSpec::circle(format!("{dataset}-points"))
            .paint("circle-radius", 4)
            .zoom_range(12.0, 22.0),
    ];
    sync.synchronize(dataset, features, layers);

    tokio::time::sleep(style_delay).await;
    target.finish_style_load();

    let deadline = tokio::time::Instant::now() + timeout;
    let state = loop {
        let state = sync.state(dataset).unwrap_or(SyncState::Detached);
        if state == SyncState::Attached || tokio::time::Instant::now() >= deadline {
            break state;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    summary.state = format!("{state:?}");
    summary.layers = target.layer_ids();
    Ok(summary)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
